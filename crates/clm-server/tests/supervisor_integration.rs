//! Supervisor lifecycle tests against a scripted in-memory worker.
//!
//! [`MockWorkerTransport`] stands in for the worker process: each test
//! scripts how the "worker" answers control commands and the assertions run
//! against the supervisor's observable behavior (outcomes, registry queries,
//! report notifications).

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::UnboundedSender;

use codeloom_core::control::{OutputStream, WorkerCommand, WorkerEvent};
use codeloom_core::error::SubmissionError;
use codeloom_core::manifest::CapabilityManifest;
use codeloom_server::submission::ExecOutcome;
use codeloom_server::supervisor::{self, SupervisorHandle, SupervisorTimings};
use codeloom_server::worker_link::{MockWorkerHandle, MockWorkerTransport};

fn timings(handover_ms: u64, report_ms: u64) -> SupervisorTimings {
    SupervisorTimings {
        handover: Duration::from_millis(handover_ms),
        report: Duration::from_millis(report_ms),
        startup_timeout: Duration::from_secs(5),
    }
}

fn send(tx: &UnboundedSender<String>, event: &WorkerEvent) {
    let _ = tx.send(serde_json::to_string(event).unwrap());
}

fn output(submission_id: u64, text: &str) -> WorkerEvent {
    WorkerEvent::StreamOutput {
        submission_id,
        stream: OutputStream::Log,
        text: text.to_string(),
    }
}

fn done(submission_id: u64, value: Option<&str>) -> WorkerEvent {
    WorkerEvent::ExecResult {
        submission_id,
        ok: true,
        value: value.map(String::from),
        error: None,
    }
}

/// Drive the mock worker with a behavior closure. `init` is always answered
/// with `init_complete`; everything else goes to `behavior`.
fn scripted_worker(
    mut handle: MockWorkerHandle,
    mut behavior: impl FnMut(WorkerCommand, &UnboundedSender<String>) + Send + 'static,
) -> UnboundedSender<String> {
    let events = handle.event_tx.clone();
    tokio::spawn(async move {
        while let Some(line) = handle.command_rx.recv().await {
            let Ok(cmd) = serde_json::from_str::<WorkerCommand>(&line) else {
                continue;
            };
            if matches!(cmd, WorkerCommand::Init { .. }) {
                send(&handle.event_tx, &WorkerEvent::InitComplete);
                continue;
            }
            behavior(cmd, &handle.event_tx);
        }
    });
    events
}

async fn start_supervisor(
    behavior: impl FnMut(WorkerCommand, &UnboundedSender<String>) + Send + 'static,
    timings: SupervisorTimings,
) -> (SupervisorHandle, UnboundedSender<String>, mpsc::Receiver<Value>) {
    let (transport, handle) = MockWorkerTransport::new_with_handle();
    let events = scripted_worker(handle, behavior);
    let (notify_tx, notify_rx) = mpsc::channel(64);
    let supervisor = supervisor::start(
        Box::new(transport),
        None,
        CapabilityManifest::default(),
        timings,
        notify_tx,
    )
    .await
    .expect("supervisor starts against the mock worker");
    (supervisor, events, notify_rx)
}

fn tmp_dir() -> PathBuf {
    std::env::temp_dir()
}

async fn wait_until<F, Fut>(mut condition: F, what: &str)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

// ─── Fast completion ─────────────────────────────────────────────────────────

#[tokio::test]
async fn fast_submission_completes_with_output_and_value() {
    let (supervisor, _events, _notify) = start_supervisor(
        |cmd, events| {
            if let WorkerCommand::Execute { submission_id, .. } = cmd {
                send(events, &output(submission_id, "working"));
                send(events, &done(submission_id, Some("hi")));
            }
        },
        timings(30_000, 60_000),
    )
    .await;

    let (id, outcome_rx) = supervisor
        .submit("Read(\"a.txt\")".to_string(), tmp_dir())
        .await
        .unwrap();
    assert_eq!(id, 0);

    match outcome_rx.await.unwrap() {
        ExecOutcome::Completed { ok, value, output, .. } => {
            assert!(ok);
            assert_eq!(value.as_deref(), Some("hi"));
            assert_eq!(output.len(), 1);
            assert_eq!(output[0].text, "working");
        }
        other => panic!("expected completion, got {other:?}"),
    }

    // Terminal submissions stay queryable.
    let log = supervisor.get_log(id).await.unwrap();
    assert_eq!(log.len(), 1);
    assert!(supervisor.list().await.unwrap().is_empty());

    // Ids are monotonic.
    let (next_id, _rx) = supervisor.submit("1".to_string(), tmp_dir()).await.unwrap();
    assert!(next_id > id);
}

// ─── Handover ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn handover_snapshots_and_clears_history() {
    let (supervisor, events, _notify) = start_supervisor(
        |cmd, events| {
            // Emit one early line, then keep running (no exec_result).
            if let WorkerCommand::Execute { submission_id, .. } = cmd {
                send(events, &output(submission_id, "early"));
            }
        },
        timings(200, 60_000),
    )
    .await;

    let (id, outcome_rx) = supervisor
        .submit("sleep(35); print(\"done\")".to_string(), tmp_dir())
        .await
        .unwrap();

    // The waiter receives the handover snapshot with everything emitted
    // before the handover instant.
    let snapshot = match outcome_rx.await.unwrap() {
        ExecOutcome::HandedOver { id: handed, snapshot } => {
            assert_eq!(handed, id);
            snapshot
        }
        other => panic!("expected handover, got {other:?}"),
    };
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].text, "early");

    // History was cleared at handover.
    assert!(supervisor.get_log(id).await.unwrap().is_empty());
    let listed = supervisor.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].state.to_string(), "async");

    // Output continuity: lines after the handover are retrievable.
    let before_late = Utc::now();
    send(&events, &output(id, "done"));
    send(&events, &done(id, None));

    wait_until(
        || {
            let supervisor = supervisor.clone();
            async move {
                supervisor
                    .get_log(id)
                    .await
                    .map(|log| log.iter().any(|e| e.text == "done"))
                    .unwrap_or(false)
            }
        },
        "post-handover output to arrive",
    )
    .await;

    let progress = supervisor.get_progress(id, Some(before_late)).await.unwrap();
    assert_eq!(progress.len(), 1);
    assert_eq!(progress[0].text, "done");

    // Natural completion after handover.
    assert!(supervisor.list().await.unwrap().is_empty());
    assert!(!supervisor.get_log(id).await.unwrap().is_empty());
}

#[tokio::test]
async fn completion_beats_handover_in_the_race() {
    let (supervisor, _events, _notify) = start_supervisor(
        |cmd, events| {
            if let WorkerCommand::Execute { submission_id, .. } = cmd {
                send(events, &done(submission_id, Some("fast")));
            }
        },
        timings(150, 60_000),
    )
    .await;

    let (id, outcome_rx) = supervisor.submit("1".to_string(), tmp_dir()).await.unwrap();

    // Exactly one outcome, and it is the completion.
    match outcome_rx.await.unwrap() {
        ExecOutcome::Completed { ok, value, .. } => {
            assert!(ok);
            assert_eq!(value.as_deref(), Some("fast"));
        }
        other => panic!("expected completion, got {other:?}"),
    }

    // Let the (aborted) handover timer's deadline pass; the submission must
    // remain completed, not async.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(supervisor.list().await.unwrap().is_empty());
    assert!(supervisor.get_log(id).await.is_ok());
}

// ─── Kill ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn kill_removes_immediately_and_discards_late_output() {
    let (supervisor, events, _notify) = start_supervisor(
        |cmd, events| {
            if let WorkerCommand::Execute { submission_id, .. } = cmd {
                send(events, &output(submission_id, "tick"));
            }
        },
        timings(30_000, 60_000),
    )
    .await;

    let (id, outcome_rx) = supervisor
        .submit("loop { print(\"tick\") }".to_string(), tmp_dir())
        .await
        .unwrap();

    // Let the pre-kill output land.
    wait_until(
        || {
            let supervisor = supervisor.clone();
            async move {
                supervisor
                    .get_log(id)
                    .await
                    .map(|log| !log.is_empty())
                    .unwrap_or(false)
            }
        },
        "pre-kill output to arrive",
    )
    .await;

    let killed = supervisor.kill(Some(id)).await.unwrap();
    assert_eq!(killed, vec![id]);

    // The waiter receives the killed marker.
    assert!(matches!(
        outcome_rx.await.unwrap(),
        ExecOutcome::Killed { id: killed_id } if killed_id == id
    ));

    // Gone from the active listing immediately.
    assert!(supervisor.list().await.unwrap().is_empty());

    // Late output and the late exec_result are discarded.
    send(&events, &output(id, "late tick"));
    send(&events, &done(id, Some("should be dropped")));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let log = supervisor.get_log(id).await.unwrap();
    assert_eq!(log.len(), 1, "retained history holds only pre-kill output");
    assert_eq!(log[0].text, "tick");

    // Killing an already-terminal submission is a no-op, not an error.
    assert!(supervisor.kill(Some(id)).await.unwrap().is_empty());

    // Unknown ids are errors.
    assert!(matches!(
        supervisor.kill(Some(999)).await,
        Err(SubmissionError::UnknownSubmission { id: 999 })
    ));
}

#[tokio::test]
async fn kill_without_id_kills_every_active_submission() {
    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel::<WorkerCommand>();
    let (supervisor, _events, _notify) = start_supervisor(
        move |cmd, _events| {
            let _ = seen_tx.send(cmd);
        },
        timings(30_000, 60_000),
    )
    .await;

    let (a, rx_a) = supervisor.submit("loop {}".to_string(), tmp_dir()).await.unwrap();
    let (b, rx_b) = supervisor.submit("loop {}".to_string(), tmp_dir()).await.unwrap();

    let mut killed = supervisor.kill(None).await.unwrap();
    killed.sort_unstable();
    assert_eq!(killed, vec![a, b]);
    assert!(matches!(rx_a.await.unwrap(), ExecOutcome::Killed { .. }));
    assert!(matches!(rx_b.await.unwrap(), ExecOutcome::Killed { .. }));

    // The worker got one broadcast kill.
    let mut saw_broadcast = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(500), seen_rx.recv()).await {
            Ok(Some(WorkerCommand::Kill { submission_id: None })) => {
                saw_broadcast = true;
                break;
            }
            Ok(Some(_)) => continue,
            _ => break,
        }
    }
    assert!(saw_broadcast, "expected a broadcast kill command");
}

// ─── Stdin and interactivity ─────────────────────────────────────────────────

#[tokio::test]
async fn stdin_is_forwarded_in_fifo_order() {
    let (stdin_tx, mut stdin_rx) = tokio::sync::mpsc::unbounded_channel::<(u64, String)>();
    let (supervisor, events, _notify) = start_supervisor(
        move |cmd, _events| {
            if let WorkerCommand::StdinWrite { submission_id, data } = cmd {
                let _ = stdin_tx.send((submission_id, data));
            }
        },
        timings(30_000, 60_000),
    )
    .await;

    let (id, _rx) = supervisor
        .submit("print(read_stdin())".to_string(), tmp_dir())
        .await
        .unwrap();

    supervisor.send_stdin(id, "A".to_string()).await.unwrap();
    supervisor.send_stdin(id, "B".to_string()).await.unwrap();

    assert_eq!(stdin_rx.recv().await.unwrap(), (id, "A".to_string()));
    assert_eq!(stdin_rx.recv().await.unwrap(), (id, "B".to_string()));

    // send_stdin to an unknown id is an error.
    assert!(supervisor.send_stdin(999, "x".to_string()).await.is_err());

    // The worker announcing interactivity marks the submission.
    send(&events, &WorkerEvent::InteractiveStarted { submission_id: id });
    wait_until(
        || {
            let supervisor = supervisor.clone();
            async move {
                supervisor
                    .list()
                    .await
                    .map(|l| l.iter().any(|s| s.id == id && s.interactive))
                    .unwrap_or(false)
            }
        },
        "interactive flag",
    )
    .await;
}

// ─── Capability routing ──────────────────────────────────────────────────────

#[tokio::test]
async fn capability_call_without_registry_gets_error_reply() {
    let (supervisor, _events, _notify) = start_supervisor(
        |cmd, events| match cmd {
            WorkerCommand::Execute { submission_id, .. } => {
                send(events, &WorkerEvent::CapabilityCall {
                    call_id: 7,
                    submission_id,
                    server: "files".to_string(),
                    tool: "Read".to_string(),
                    arguments: serde_json::json!({"file_path": "a.txt"}),
                });
            }
            WorkerCommand::CapabilityReply { call_id, ok, error, .. } => {
                // Relay the reply into the exec result so the test can
                // observe it.
                assert_eq!(call_id, 7);
                send(events, &WorkerEvent::ExecResult {
                    submission_id: 0,
                    ok,
                    value: None,
                    error,
                });
            }
            _ => {}
        },
        timings(30_000, 60_000),
    )
    .await;

    let (_id, outcome_rx) = supervisor
        .submit("files::Read(\"a.txt\")".to_string(), tmp_dir())
        .await
        .unwrap();

    match outcome_rx.await.unwrap() {
        ExecOutcome::Completed { ok, error, .. } => {
            assert!(!ok);
            assert!(error.unwrap().contains("unknown server"));
        }
        other => panic!("expected completion, got {other:?}"),
    }
}

// ─── Reports ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn reports_fire_while_active_then_one_final_empty_report() {
    let (supervisor, events, mut notify_rx) =
        start_supervisor(|_cmd, _events| {}, timings(30_000, 100)).await;

    let (id, _rx) = supervisor.submit("loop {}".to_string(), tmp_dir()).await.unwrap();

    // While active: reports carry the submission summary.
    let report = tokio::time::timeout(Duration::from_secs(5), notify_rx.recv())
        .await
        .expect("report within interval")
        .expect("notify channel open");
    assert_eq!(report["method"], "codeloom/report");
    let executions = report["params"]["executions"].as_array().unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0]["id"], id);
    assert_eq!(executions[0]["completed"], false);

    // Complete the submission; reports end with one final empty snapshot.
    send(&events, &done(id, None));

    let mut saw_empty = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(500), notify_rx.recv()).await {
            Ok(Some(report)) => {
                if report["params"]["executions"].as_array().unwrap().is_empty() {
                    saw_empty = true;
                    break;
                }
            }
            _ => break,
        }
    }
    assert!(saw_empty, "expected one final empty report after going idle");

    // Then silence.
    assert!(
        tokio::time::timeout(Duration::from_millis(350), notify_rx.recv())
            .await
            .is_err(),
        "no further reports while idle"
    );
}

// ─── Worker death ────────────────────────────────────────────────────────────

#[tokio::test]
async fn worker_death_kills_active_submissions_but_not_the_supervisor() {
    let (transport, handle) = MockWorkerTransport::new_with_handle();
    let MockWorkerHandle {
        event_tx,
        mut command_rx,
    } = handle;

    // Answer init, then stop scripting (dropping this clone of the sender).
    {
        let event_tx = event_tx.clone();
        tokio::spawn(async move {
            while let Some(line) = command_rx.recv().await {
                if line.contains("\"type\":\"init\"") {
                    send(&event_tx, &WorkerEvent::InitComplete);
                    break;
                }
            }
        });
    }

    let (notify_tx, _notify_rx) = mpsc::channel(16);
    let supervisor = supervisor::start(
        Box::new(transport),
        None,
        CapabilityManifest::default(),
        timings(30_000, 60_000),
        Duration::from_secs(5),
        notify_tx,
    )
    .await
    .unwrap();

    let (id, outcome_rx) = supervisor.submit("loop {}".to_string(), tmp_dir()).await.unwrap();

    // Dropping the last event sender closes the mock worker's "stdout"; the
    // supervisor observes EOF as a worker death.
    drop(event_tx);

    match tokio::time::timeout(Duration::from_secs(5), outcome_rx)
        .await
        .expect("outcome before timeout")
        .expect("waiter gets an outcome")
    {
        ExecOutcome::Completed { ok, error, .. } => {
            assert!(!ok);
            assert!(error.unwrap().contains("worker terminated"));
        }
        other => panic!("expected transport-failure completion, got {other:?}"),
    }

    // The submission is retained as killed; new submissions are refused; the
    // supervisor itself keeps serving management actions.
    assert!(supervisor.get_log(id).await.is_ok());
    assert!(supervisor.list().await.unwrap().is_empty());
    assert!(matches!(
        supervisor.submit("1".to_string(), tmp_dir()).await,
        Err(SubmissionError::WorkerUnavailable)
    ));
}

// ─── History management ──────────────────────────────────────────────────────

#[tokio::test]
async fn clear_history_clears_or_queries() {
    let (supervisor, _events, _notify) = start_supervisor(
        |cmd, events| {
            if let WorkerCommand::Execute { submission_id, .. } = cmd {
                for i in 0..3 {
                    send(events, &output(submission_id, &format!("line {i}")));
                }
                send(events, &done(submission_id, None));
            }
        },
        timings(30_000, 60_000),
    )
    .await;

    let (id, outcome_rx) = supervisor.submit("x".to_string(), tmp_dir()).await.unwrap();
    outcome_rx.await.unwrap();

    // Query form: reports the length without mutating.
    assert_eq!(supervisor.clear_history(id, false).await.unwrap(), 3);
    assert_eq!(supervisor.get_log(id).await.unwrap().len(), 3);

    // Clearing form: empties the history.
    assert_eq!(supervisor.clear_history(id, true).await.unwrap(), 3);
    assert!(supervisor.get_log(id).await.unwrap().is_empty());

    assert!(supervisor.clear_history(999, true).await.is_err());
}
