//! The worker control loop.
//!
//! Reads [`WorkerCommand`]s from the supervisor on the worker's stdin and
//! writes [`WorkerEvent`]s to its stdout. Evaluation happens on the
//! [`Evaluator`] thread; everything the evaluator emits funnels through one
//! event channel into this loop, so events reach the wire in emission order
//! and `exec_result` never overtakes earlier `stream_output` lines.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::mpsc::Sender;
use std::thread::JoinHandle;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::unbounded_channel;

use codeloom_core::codec::{self, MessageReader};
use codeloom_core::control::{WorkerCommand, WorkerEvent};

use crate::WorkerShared;
use crate::evaluator::{EvalJob, Evaluator};

/// Run the control loop until the supervisor closes our stdin.
///
/// # Errors
///
/// Returns an error on an unrecoverable I/O failure on either side of the
/// control channel.
pub async fn run<R, W>(input: R, mut output: W) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = MessageReader::new(input);
    let (events_tx, mut events_rx) = unbounded_channel::<WorkerEvent>();
    let shared = Arc::new(WorkerShared::new(events_tx));

    let mut evaluator: Option<(JoinHandle<()>, Sender<EvalJob>)> = None;
    let mut active: HashSet<u64> = HashSet::new();

    loop {
        tokio::select! {
            msg = reader.next_value() => {
                let Some(msg) = msg? else {
                    tracing::info!("control channel EOF, worker shutting down");
                    break;
                };
                let cmd = match serde_json::from_value::<WorkerCommand>(msg) {
                    Ok(cmd) => cmd,
                    Err(e) => {
                        tracing::warn!("dropping unknown control message: {e}");
                        continue;
                    }
                };
                match cmd {
                    WorkerCommand::Init { manifest } => {
                        if evaluator.is_none() {
                            tracing::info!(
                                tools = manifest.tool_count(),
                                "wiring capability manifest"
                            );
                            evaluator = Some(Evaluator::spawn(manifest, Arc::clone(&shared)));
                        }
                        write_event(&mut output, &WorkerEvent::InitComplete).await?;
                    }
                    WorkerCommand::Execute { submission_id, code, working_directory } => {
                        match &evaluator {
                            Some((_, jobs)) => {
                                active.insert(submission_id);
                                let _ = jobs.send(EvalJob {
                                    submission_id,
                                    code,
                                    working_directory,
                                });
                            }
                            None => {
                                write_event(&mut output, &WorkerEvent::ExecResult {
                                    submission_id,
                                    ok: false,
                                    value: None,
                                    error: Some("worker not initialized".to_string()),
                                }).await?;
                            }
                        }
                    }
                    WorkerCommand::CapabilityReply { call_id, ok, result, error } => {
                        let outcome = if ok {
                            Ok(result.unwrap_or(serde_json::Value::Null))
                        } else {
                            Err(error.unwrap_or_else(|| "capability call failed".to_string()))
                        };
                        shared.bridge.resolve(call_id, outcome);
                    }
                    WorkerCommand::Kill { submission_id } => {
                        match submission_id {
                            Some(id) => shared.kill.kill(id),
                            None => {
                                for id in &active {
                                    shared.kill.kill(*id);
                                }
                            }
                        }
                    }
                    WorkerCommand::StdinWrite { submission_id, data } => {
                        if shared.stdin.push(submission_id, data) {
                            write_event(&mut output, &WorkerEvent::InteractiveStarted {
                                submission_id,
                            }).await?;
                        }
                    }
                }
            }

            ev = events_rx.recv() => {
                let Some(ev) = ev else { break };
                if let WorkerEvent::ExecResult { submission_id, .. } = &ev {
                    active.remove(submission_id);
                }
                write_event(&mut output, &ev).await?;
            }
        }
    }

    Ok(())
}

async fn write_event<W: AsyncWrite + Unpin>(
    output: &mut W,
    event: &WorkerEvent,
) -> anyhow::Result<()> {
    codec::write_line(output, &serde_json::to_value(event)?).await?;
    Ok(())
}
