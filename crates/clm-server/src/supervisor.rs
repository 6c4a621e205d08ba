//! The execution supervisor.
//!
//! An actor task owns the submission registry; the client facade, the
//! worker reader, and the timers all submit intents over one channel, so
//! registry state never needs a lock. The discipline:
//!
//! - a submission's waiter is registered before `execute` is transmitted,
//!   so no outcome can be lost;
//! - handover and natural completion race first-wins inside the actor, so
//!   exactly one outcome reaches the waiter;
//! - handover timers carry only a submission id and consult the registry at
//!   fire time, which settles the race where a submission completes just
//!   before its timer fires;
//! - a killed submission leaves the active partition immediately, and its
//!   late output or `exec_result` is discarded on arrival.
//!
//! Submissions have no natural wall-time timeout: only explicit kill or
//! handover-plus-management applies.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};

use codeloom_core::codec::{self, MessageReader};
use codeloom_core::config::Config;
use codeloom_core::control::{WorkerCommand, WorkerEvent};
use codeloom_core::error::{CapabilityError, SubmissionError};
use codeloom_core::manifest::CapabilityManifest;
use codeloom_core::rpc;

use crate::registry::ServerRegistry;
use crate::submission::{
    ExecOutcome, OutputEntry, SubmissionRegistry, SubmissionState, SubmissionSummary,
};
use crate::worker_link::{SharedWriter, WorkerTransport};

/// Error text recorded on submissions orphaned by a worker death.
const WORKER_DEATH_ERROR: &str = "execution worker terminated";

/// Timer and timeout settings, taken from [`Config`] (tests inject smaller
/// values).
#[derive(Debug, Clone)]
pub struct SupervisorTimings {
    pub handover: Duration,
    pub report: Duration,
    pub startup_timeout: Duration,
}

impl SupervisorTimings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            handover: Duration::from_secs(config.handover_secs),
            report: Duration::from_secs(config.report_secs),
            startup_timeout: Duration::from_secs(config.startup_timeout_secs),
        }
    }
}

/// Management and submission intents accepted by the actor.
enum Request {
    Submit {
        code: String,
        working_directory: PathBuf,
        reply: oneshot::Sender<Result<(u64, oneshot::Receiver<ExecOutcome>), SubmissionError>>,
    },
    Kill {
        execution_id: Option<u64>,
        reply: oneshot::Sender<Result<Vec<u64>, SubmissionError>>,
    },
    GetLog {
        execution_id: u64,
        reply: oneshot::Sender<Result<Vec<OutputEntry>, SubmissionError>>,
    },
    List {
        reply: oneshot::Sender<Vec<SubmissionSummary>>,
    },
    ClearHistory {
        execution_id: u64,
        clear: bool,
        reply: oneshot::Sender<Result<usize, SubmissionError>>,
    },
    GetProgress {
        execution_id: u64,
        since: Option<DateTime<Utc>>,
        reply: oneshot::Sender<Result<Vec<OutputEntry>, SubmissionError>>,
    },
    SendStdin {
        execution_id: u64,
        data: String,
        reply: oneshot::Sender<Result<(), SubmissionError>>,
    },
    CancelWait {
        execution_id: u64,
    },
    Shutdown,
}

enum Msg {
    Request(Request),
    Worker(WorkerEvent),
    HandoverFired(u64),
    ReportTick,
    WorkerGone,
}

/// Cloneable handle to the supervisor actor.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<Msg>,
}

impl SupervisorHandle {
    /// Submit a code fragment; returns the allocated id and the outcome
    /// receiver the caller awaits.
    pub async fn submit(
        &self,
        code: String,
        working_directory: PathBuf,
    ) -> Result<(u64, oneshot::Receiver<ExecOutcome>), SubmissionError> {
        let (tx, rx) = oneshot::channel();
        self.send(Msg::Request(Request::Submit {
            code,
            working_directory,
            reply: tx,
        }))
        .await?;
        rx.await.map_err(|_| SubmissionError::WorkerUnavailable)?
    }

    /// Kill one submission, or every non-terminal submission when
    /// `execution_id` is `None`. Returns the ids actually killed.
    pub async fn kill(&self, execution_id: Option<u64>) -> Result<Vec<u64>, SubmissionError> {
        let (tx, rx) = oneshot::channel();
        self.send(Msg::Request(Request::Kill {
            execution_id,
            reply: tx,
        }))
        .await?;
        rx.await.map_err(|_| SubmissionError::WorkerUnavailable)?
    }

    /// Full retained output history of a submission (any state).
    pub async fn get_log(&self, execution_id: u64) -> Result<Vec<OutputEntry>, SubmissionError> {
        let (tx, rx) = oneshot::channel();
        self.send(Msg::Request(Request::GetLog {
            execution_id,
            reply: tx,
        }))
        .await?;
        rx.await.map_err(|_| SubmissionError::WorkerUnavailable)?
    }

    /// Summaries of every non-terminal submission.
    pub async fn list(&self) -> Result<Vec<SubmissionSummary>, SubmissionError> {
        let (tx, rx) = oneshot::channel();
        self.send(Msg::Request(Request::List { reply: tx })).await?;
        rx.await.map_err(|_| SubmissionError::WorkerUnavailable)
    }

    /// Clear a submission's history (`clear=true`, returns entries removed)
    /// or query its current length (`clear=false`).
    pub async fn clear_history(
        &self,
        execution_id: u64,
        clear: bool,
    ) -> Result<usize, SubmissionError> {
        let (tx, rx) = oneshot::channel();
        self.send(Msg::Request(Request::ClearHistory {
            execution_id,
            clear,
            reply: tx,
        }))
        .await?;
        rx.await.map_err(|_| SubmissionError::WorkerUnavailable)?
    }

    /// History entries with timestamp strictly greater than `since`, or all
    /// when `since` is absent.
    pub async fn get_progress(
        &self,
        execution_id: u64,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<OutputEntry>, SubmissionError> {
        let (tx, rx) = oneshot::channel();
        self.send(Msg::Request(Request::GetProgress {
            execution_id,
            since,
            reply: tx,
        }))
        .await?;
        rx.await.map_err(|_| SubmissionError::WorkerUnavailable)?
    }

    /// Enqueue stdin data for a non-terminal submission.
    pub async fn send_stdin(
        &self,
        execution_id: u64,
        data: String,
    ) -> Result<(), SubmissionError> {
        let (tx, rx) = oneshot::channel();
        self.send(Msg::Request(Request::SendStdin {
            execution_id,
            data,
            reply: tx,
        }))
        .await?;
        rx.await.map_err(|_| SubmissionError::WorkerUnavailable)?
    }

    /// Drop a submission's synchronous waiter (client cancelled the wait).
    /// The submission itself continues.
    pub fn cancel_wait(&self, execution_id: u64) {
        let _ = self
            .tx
            .try_send(Msg::Request(Request::CancelWait { execution_id }));
    }

    /// Stop the actor, killing the worker and draining outstanding waiters.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Msg::Request(Request::Shutdown)).await;
    }

    async fn send(&self, msg: Msg) -> Result<(), SubmissionError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| SubmissionError::WorkerUnavailable)
    }
}

/// Start the supervisor: spawn the worker, run the init handshake, then run
/// the actor with its reader and report-timer tasks.
///
/// # Errors
///
/// Returns an error when the worker cannot be spawned or does not complete
/// its init handshake within the startup timeout.
pub async fn start(
    transport: Box<dyn WorkerTransport>,
    servers: Option<Arc<ServerRegistry>>,
    manifest: CapabilityManifest,
    timings: SupervisorTimings,
    notify: mpsc::Sender<Value>,
) -> anyhow::Result<SupervisorHandle> {
    let io = transport.spawn().await?;
    let writer = io.stdin;
    let process = io.process;

    write_command(&writer, &WorkerCommand::Init { manifest }).await?;

    let (msg_tx, mut msg_rx) = mpsc::channel::<Msg>(256);

    // Worker-outbound reader task.
    {
        let tx = msg_tx.clone();
        let mut reader = MessageReader::new(io.stdout);
        tokio::spawn(async move {
            loop {
                match reader.next_value().await {
                    Ok(Some(value)) => match serde_json::from_value::<WorkerEvent>(value) {
                        Ok(event) => {
                            if tx.send(Msg::Worker(event)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!("dropping unknown worker event: {e}"),
                    },
                    Ok(None) | Err(_) => {
                        let _ = tx.send(Msg::WorkerGone).await;
                        break;
                    }
                }
            }
        });
    }

    // Init handshake: the first event must be init_complete.
    let handshake = tokio::time::timeout(timings.startup_timeout, async {
        while let Some(msg) = msg_rx.recv().await {
            match msg {
                Msg::Worker(WorkerEvent::InitComplete) => return Ok(()),
                Msg::WorkerGone => {
                    return Err(anyhow::anyhow!("worker exited during init handshake"))
                }
                _ => continue,
            }
        }
        Err(anyhow::anyhow!("worker channel closed during init handshake"))
    })
    .await;
    match handshake {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(anyhow::anyhow!("worker init handshake timed out")),
    }
    tracing::info!("execution worker initialized");

    // Report timer task.
    {
        let tx = msg_tx.clone();
        let period = timings.report;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // the immediate first tick
            loop {
                interval.tick().await;
                if tx.send(Msg::ReportTick).await.is_err() {
                    break;
                }
            }
        });
    }

    let actor = Actor {
        registry: SubmissionRegistry::default(),
        servers,
        writer,
        process,
        msg_tx: msg_tx.clone(),
        notify,
        timings,
        worker_alive: true,
        was_active: false,
    };
    tokio::spawn(actor.run(msg_rx));

    Ok(SupervisorHandle { tx: msg_tx })
}

struct Actor {
    registry: SubmissionRegistry,
    servers: Option<Arc<ServerRegistry>>,
    writer: SharedWriter,
    process: Arc<tokio::sync::Mutex<Option<tokio::process::Child>>>,
    msg_tx: mpsc::Sender<Msg>,
    notify: mpsc::Sender<Value>,
    timings: SupervisorTimings,
    worker_alive: bool,
    was_active: bool,
}

impl Actor {
    async fn run(mut self, mut msg_rx: mpsc::Receiver<Msg>) {
        while let Some(msg) = msg_rx.recv().await {
            match msg {
                Msg::Request(Request::Shutdown) => break,
                Msg::Request(request) => self.handle_request(request).await,
                Msg::Worker(event) => self.handle_worker_event(event).await,
                Msg::HandoverFired(id) => self.handle_handover(id),
                Msg::ReportTick => self.handle_report_tick().await,
                Msg::WorkerGone => self.handle_worker_gone(),
            }
        }
        self.shutdown().await;
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Submit {
                code,
                working_directory,
                reply,
            } => {
                let _ = reply.send(self.submit(code, working_directory).await);
            }
            Request::Kill { execution_id, reply } => {
                let _ = reply.send(self.kill(execution_id).await);
            }
            Request::GetLog { execution_id, reply } => {
                let result = self
                    .registry
                    .get(execution_id)
                    .map(|s| s.output_history.clone())
                    .ok_or(SubmissionError::UnknownSubmission { id: execution_id });
                let _ = reply.send(result);
            }
            Request::List { reply } => {
                let _ = reply.send(self.registry.active_summaries());
            }
            Request::ClearHistory {
                execution_id,
                clear,
                reply,
            } => {
                let result = match self.registry.get_mut(execution_id) {
                    Some(submission) => {
                        let len = submission.output_history.len();
                        if clear {
                            submission.output_history.clear();
                        }
                        Ok(len)
                    }
                    None => Err(SubmissionError::UnknownSubmission { id: execution_id }),
                };
                let _ = reply.send(result);
            }
            Request::GetProgress {
                execution_id,
                since,
                reply,
            } => {
                let result = match self.registry.get(execution_id) {
                    Some(submission) => Ok(submission
                        .output_history
                        .iter()
                        .filter(|entry| since.is_none_or(|s| entry.timestamp > s))
                        .cloned()
                        .collect()),
                    None => Err(SubmissionError::UnknownSubmission { id: execution_id }),
                };
                let _ = reply.send(result);
            }
            Request::SendStdin {
                execution_id,
                data,
                reply,
            } => {
                let result = if self.registry.get_active_mut(execution_id).is_some() {
                    self.write_to_worker(WorkerCommand::StdinWrite {
                        submission_id: execution_id,
                        data,
                    })
                    .await;
                    Ok(())
                } else {
                    Err(SubmissionError::UnknownSubmission { id: execution_id })
                };
                let _ = reply.send(result);
            }
            Request::CancelWait { execution_id } => {
                if let Some(submission) = self.registry.get_active_mut(execution_id) {
                    submission.waiter = None;
                }
            }
            Request::Shutdown => unreachable!("handled in run"),
        }
    }

    async fn submit(
        &mut self,
        code: String,
        working_directory: PathBuf,
    ) -> Result<(u64, oneshot::Receiver<ExecOutcome>), SubmissionError> {
        if !self.worker_alive {
            return Err(SubmissionError::WorkerUnavailable);
        }

        let (waiter_tx, waiter_rx) = oneshot::channel();
        let id = self
            .registry
            .create(code.clone(), working_directory.clone(), waiter_tx);

        // One handover timer per running submission; it consults the
        // registry at fire time.
        let timer = {
            let tx = self.msg_tx.clone();
            let delay = self.timings.handover;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(Msg::HandoverFired(id)).await;
            })
        };
        if let Some(submission) = self.registry.get_active_mut(id) {
            submission.handover_timer = Some(timer.abort_handle());
        }

        self.write_to_worker(WorkerCommand::Execute {
            submission_id: id,
            code,
            working_directory: working_directory.display().to_string(),
        })
        .await;

        tracing::info!(execution = id, "submission started");
        Ok((id, waiter_rx))
    }

    async fn kill(&mut self, execution_id: Option<u64>) -> Result<Vec<u64>, SubmissionError> {
        match execution_id {
            Some(id) => {
                if self.registry.get_active_mut(id).is_some() {
                    self.kill_one(id);
                    self.write_to_worker(WorkerCommand::Kill {
                        submission_id: Some(id),
                    })
                    .await;
                    Ok(vec![id])
                } else if self.registry.get(id).is_some() {
                    // Already terminal: nothing to do.
                    Ok(Vec::new())
                } else {
                    Err(SubmissionError::UnknownSubmission { id })
                }
            }
            None => {
                let ids = self.registry.active_ids();
                for id in &ids {
                    self.kill_one(*id);
                }
                if !ids.is_empty() {
                    self.write_to_worker(WorkerCommand::Kill { submission_id: None })
                        .await;
                }
                Ok(ids)
            }
        }
    }

    /// Terminal kill transition: flag, cancel timer, deliver the killed
    /// marker, and leave the active partition immediately.
    fn kill_one(&mut self, id: u64) {
        let Some(mut submission) = self.registry.take_active(id) else {
            return;
        };
        submission.killed_flag = true;
        submission.state = SubmissionState::Killed;
        submission.completion_time = Some(Utc::now());
        if let Some(timer) = submission.handover_timer.take() {
            timer.abort();
        }
        if let Some(waiter) = submission.waiter.take() {
            let _ = waiter.send(ExecOutcome::Killed { id });
        }
        tracing::info!(execution = id, "submission killed");
        self.registry.finish(submission);
    }

    async fn handle_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::InitComplete => {}
            WorkerEvent::CapabilityCall {
                call_id,
                submission_id,
                server,
                tool,
                arguments,
            } => {
                self.route_capability_call(call_id, submission_id, server, tool, arguments);
            }
            WorkerEvent::StreamOutput {
                submission_id,
                stream,
                text,
            } => {
                // Killed submissions are out of the active partition, so
                // their late output lands nowhere.
                if let Some(submission) = self.registry.get_active_mut(submission_id) {
                    submission.output_history.push(OutputEntry {
                        timestamp: Utc::now(),
                        stream,
                        text,
                    });
                }
            }
            WorkerEvent::InteractiveStarted { submission_id } => {
                if let Some(submission) = self.registry.get_active_mut(submission_id) {
                    submission.interactive = true;
                }
            }
            WorkerEvent::ExecResult {
                submission_id,
                ok,
                value,
                error,
            } => {
                // A killed submission's late result is discarded.
                let Some(mut submission) = self.registry.take_active(submission_id) else {
                    return;
                };
                submission.state = SubmissionState::Completed;
                submission.completion_time = Some(Utc::now());
                submission.value = value.clone();
                if !ok {
                    submission.completion_error = error.clone();
                }
                if let Some(timer) = submission.handover_timer.take() {
                    timer.abort();
                }
                if let Some(waiter) = submission.waiter.take() {
                    let _ = waiter.send(ExecOutcome::Completed {
                        ok,
                        value,
                        error,
                        output: submission.output_history.clone(),
                    });
                }
                tracing::info!(execution = submission_id, ok, "submission completed");
                self.registry.finish(submission);
            }
        }
    }

    /// Route one capability call downstream on its own task; the reply goes
    /// back over the shared worker writer.
    fn route_capability_call(
        &self,
        call_id: u64,
        submission_id: u64,
        server: String,
        tool: String,
        arguments: Value,
    ) {
        let servers = self.servers.clone();
        let writer = self.writer.clone();
        tokio::spawn(async move {
            let outcome: Result<Value, CapabilityError> = match &servers {
                None => Err(CapabilityError::UnknownServer { server }),
                Some(registry) => match registry.route(&server) {
                    None => Err(CapabilityError::UnknownServer { server }),
                    Some(client) if !registry.has_tool(client.name(), &tool) => {
                        Err(CapabilityError::UnknownTool {
                            server: client.name().to_string(),
                            tool,
                        })
                    }
                    Some(client) => client.call_tool(&tool, arguments).await,
                },
            };

            let command = match outcome {
                Ok(result) => WorkerCommand::CapabilityReply {
                    call_id,
                    ok: true,
                    result: Some(result),
                    error: None,
                },
                Err(e) => {
                    tracing::debug!(
                        execution = submission_id,
                        "capability call failed: {e}"
                    );
                    WorkerCommand::CapabilityReply {
                        call_id,
                        ok: false,
                        result: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            let _ = write_command(&writer, &command).await;
        });
    }

    /// Handover transition: only valid while still `running`; the snapshot
    /// is delivered to the waiter and the history is cleared (the
    /// memory-bounded contract). With no waiter left to take the snapshot
    /// the history is kept instead.
    fn handle_handover(&mut self, id: u64) {
        let Some(submission) = self.registry.get_active_mut(id) else {
            return;
        };
        if submission.state != SubmissionState::Running {
            return;
        }
        submission.state = SubmissionState::Async;
        submission.async_start_time = Some(Utc::now());
        submission.handover_timer = None;
        if let Some(waiter) = submission.waiter.take() {
            let snapshot = std::mem::take(&mut submission.output_history);
            let _ = waiter.send(ExecOutcome::HandedOver { id, snapshot });
        }
        tracing::info!(execution = id, "submission handed over to background");
    }

    async fn handle_report_tick(&mut self) {
        if self.registry.has_active() {
            self.was_active = true;
            self.emit_report(self.registry.active_summaries()).await;
        } else if self.was_active {
            // One final empty report on the active→idle transition.
            self.was_active = false;
            self.emit_report(Vec::new()).await;
        }
    }

    async fn emit_report(&self, executions: Vec<SubmissionSummary>) {
        let params = json!({
            "timestamp": Utc::now(),
            "executions": executions,
        });
        let _ = self
            .notify
            .send(rpc::notification("codeloom/report", params))
            .await;
    }

    /// The worker died: a transport error for every non-terminal submission,
    /// fatal for them but not for the supervisor.
    fn handle_worker_gone(&mut self) {
        if !self.worker_alive {
            return;
        }
        self.worker_alive = false;
        tracing::error!("execution worker terminated");
        for id in self.registry.active_ids() {
            let Some(mut submission) = self.registry.take_active(id) else {
                continue;
            };
            submission.killed_flag = true;
            submission.state = SubmissionState::Killed;
            submission.completion_time = Some(Utc::now());
            submission.completion_error = Some(WORKER_DEATH_ERROR.to_string());
            if let Some(timer) = submission.handover_timer.take() {
                timer.abort();
            }
            if let Some(waiter) = submission.waiter.take() {
                let _ = waiter.send(ExecOutcome::Completed {
                    ok: false,
                    value: None,
                    error: Some(WORKER_DEATH_ERROR.to_string()),
                    output: submission.output_history.clone(),
                });
            }
            self.registry.finish(submission);
        }
    }

    async fn write_to_worker(&mut self, command: WorkerCommand) {
        if !self.worker_alive {
            return;
        }
        if write_command(&self.writer, &command).await.is_err() {
            self.handle_worker_gone();
        }
    }

    async fn shutdown(&mut self) {
        self.handle_worker_gone();
        if let Some(mut child) = self.process.lock().await.take() {
            let _ = child.kill().await;
        }
        tracing::info!("supervisor stopped");
    }
}

async fn write_command(writer: &SharedWriter, command: &WorkerCommand) -> std::io::Result<()> {
    let value = serde_json::to_value(command)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let mut guard = writer.lock().await;
    codec::write_line(&mut **guard, &value).await
}
