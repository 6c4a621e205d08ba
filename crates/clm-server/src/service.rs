//! The client-facing tool server.
//!
//! Speaks newline-delimited JSON-RPC on the supervisor's own stdio and
//! advertises exactly one tool, `execute`. A `tools/call` is handled on a
//! request-scoped task holding the submission waiter, so any number of
//! submissions can be in flight while the reader keeps serving management
//! actions. Periodic reports arrive over the notification channel and are
//! forwarded as `codeloom/report` notifications.
//!
//! Dispatch order inside `execute`: `code` wins over `action` (a code
//! submission can never be accidentally demoted to a management call), then
//! the action switch, else a usage error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc};

use codeloom_core::codec::{self, MessageReader};
use codeloom_core::error::SubmissionError;
use codeloom_core::rpc::{self, Incoming};

use crate::submission::{ExecOutcome, OutputEntry};
use crate::supervisor::SupervisorHandle;

/// Tracks which submission an in-flight `execute` request is waiting on, so
/// `notifications/cancelled` can truncate the right wait. Keyed by the
/// serialized request id.
type WaitTable = Arc<Mutex<HashMap<String, u64>>>;

pub struct ClientService {
    supervisor: SupervisorHandle,
    default_working_directory: PathBuf,
}

impl ClientService {
    pub fn new(supervisor: SupervisorHandle, default_working_directory: PathBuf) -> Self {
        Self {
            supervisor,
            default_working_directory,
        }
    }

    /// Serve the client protocol until EOF on `input`.
    ///
    /// # Errors
    ///
    /// Returns an error on unrecoverable I/O failures on the client stream.
    pub async fn run<R, W>(
        &self,
        input: R,
        mut output: W,
        mut notifications: mpsc::Receiver<Value>,
    ) -> anyhow::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut reader = MessageReader::new(input);
        let (out_tx, mut out_rx) = mpsc::channel::<Value>(256);
        let waits: WaitTable = Arc::new(Mutex::new(HashMap::new()));

        loop {
            tokio::select! {
                msg = reader.next_value() => {
                    let Some(msg) = msg? else {
                        tracing::info!("client EOF, shutting down");
                        break;
                    };
                    let Some(incoming) = Incoming::parse(msg) else { continue };
                    match incoming {
                        Incoming::Request { id, method, params } => {
                            self.handle_request(id, &method, params, &out_tx, &waits);
                        }
                        Incoming::Notification { method, params } => {
                            self.handle_notification(&method, &params, &waits).await;
                        }
                        Incoming::Response { .. } => {}
                    }
                }

                Some(notification) = notifications.recv() => {
                    if codec::write_line(&mut output, &notification).await.is_err() {
                        break;
                    }
                }

                Some(response) = out_rx.recv() => {
                    if codec::write_line(&mut output, &response).await.is_err() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_request(
        &self,
        id: Value,
        method: &str,
        params: Value,
        out_tx: &mpsc::Sender<Value>,
        waits: &WaitTable,
    ) {
        match method {
            "initialize" => {
                let response = rpc::result_response(id, initialize_result());
                let _ = out_tx.try_send(response);
            }
            "tools/list" => {
                let response = rpc::result_response(id, tools_list_result());
                let _ = out_tx.try_send(response);
            }
            "tools/call" => {
                let supervisor = self.supervisor.clone();
                let default_wd = self.default_working_directory.clone();
                let out_tx = out_tx.clone();
                let waits = Arc::clone(waits);
                tokio::spawn(async move {
                    let tool = params
                        .get("name")
                        .and_then(|n| n.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let arguments = params
                        .get("arguments")
                        .cloned()
                        .unwrap_or_else(|| json!({}));

                    let (text, is_error) = if tool == "execute" {
                        dispatch_execute(&supervisor, &waits, &default_wd, &id, &arguments).await
                    } else {
                        (format!("unknown tool '{tool}'"), true)
                    };
                    let response =
                        rpc::result_response(id, rpc::tool_text_result(&text, is_error));
                    let _ = out_tx.send(response).await;
                });
            }
            "ping" => {
                let _ = out_tx.try_send(rpc::result_response(id, json!({})));
            }
            other => {
                let response = rpc::error_response(
                    id,
                    rpc::ERR_METHOD_NOT_FOUND,
                    &format!("method not found: {other}"),
                );
                let _ = out_tx.try_send(response);
            }
        }
    }

    async fn handle_notification(&self, method: &str, params: &Value, waits: &WaitTable) {
        match method {
            "notifications/initialized" => {}
            "notifications/cancelled" => {
                let Some(request_id) = params.get("requestId") else {
                    return;
                };
                let key = request_id.to_string();
                if let Some(execution_id) = waits.lock().await.remove(&key) {
                    tracing::info!(
                        execution = execution_id,
                        "client cancelled its wait; execution continues"
                    );
                    self.supervisor.cancel_wait(execution_id);
                }
            }
            _ => {}
        }
    }
}

/// Dispatch one `execute` call per the tie-break policy.
async fn dispatch_execute(
    supervisor: &SupervisorHandle,
    waits: &WaitTable,
    default_wd: &Path,
    request_id: &Value,
    args: &Value,
) -> (String, bool) {
    if let Some(code) = args.get("code").and_then(|c| c.as_str()) {
        return submit_code(supervisor, waits, default_wd, request_id, args, code).await;
    }
    if let Some(action) = args.get("action").and_then(|a| a.as_str()) {
        return match dispatch_action(supervisor, action, args).await {
            Ok(text) => (text, false),
            Err(e) => (e.to_string(), true),
        };
    }
    (SubmissionError::MissingCodeOrAction.to_string(), true)
}

async fn submit_code(
    supervisor: &SupervisorHandle,
    waits: &WaitTable,
    default_wd: &Path,
    request_id: &Value,
    args: &Value,
    code: &str,
) -> (String, bool) {
    let working_directory = args
        .get("working_directory")
        .and_then(|w| w.as_str())
        .map(PathBuf::from)
        .unwrap_or_else(|| default_wd.to_path_buf());
    if !working_directory.is_dir() {
        return (
            SubmissionError::WorkingDirectoryMissing {
                path: working_directory,
            }
            .to_string(),
            true,
        );
    }

    let (execution_id, outcome_rx) =
        match supervisor.submit(code.to_string(), working_directory).await {
            Ok(pair) => pair,
            Err(e) => return (e.to_string(), true),
        };

    let wait_key = request_id.to_string();
    waits.lock().await.insert(wait_key.clone(), execution_id);
    let outcome = outcome_rx.await;
    waits.lock().await.remove(&wait_key);

    match outcome {
        Ok(ExecOutcome::Completed {
            ok,
            value,
            error,
            output,
        }) => render_completed(ok, value, error, &output),
        Ok(ExecOutcome::HandedOver { id, snapshot }) => (render_handover(id, &snapshot), false),
        Ok(ExecOutcome::Killed { id }) => (format!("execution {id} was killed"), false),
        // The wait was cancelled; the submission continues in the background.
        Err(_) => (
            format!(
                "wait for execution {execution_id} was cancelled; it continues in the background"
            ),
            false,
        ),
    }
}

async fn dispatch_action(
    supervisor: &SupervisorHandle,
    action: &str,
    args: &Value,
) -> Result<String, SubmissionError> {
    match action {
        "kill" => {
            let killed = supervisor.kill(execution_id_opt(args)).await?;
            Ok(if killed.is_empty() {
                "nothing to kill".to_string()
            } else {
                format!(
                    "killed executions: {}",
                    killed
                        .iter()
                        .map(u64::to_string)
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            })
        }
        "get_async_log" => {
            let id = require_execution_id(action, args)?;
            let entries = supervisor.get_log(id).await?;
            Ok(render_entries(&entries))
        }
        "list_async_executions" => {
            let summaries = supervisor.list().await?;
            Ok(serde_json::to_string_pretty(&summaries)
                .unwrap_or_else(|_| "[]".to_string()))
        }
        "clear_history" => {
            let id = require_execution_id(action, args)?;
            let clear = args
                .get("clear_history")
                .and_then(|c| c.as_bool())
                .unwrap_or(true);
            let len = supervisor.clear_history(id, clear).await?;
            Ok(if clear {
                format!("cleared {len} history entries for execution {id}")
            } else {
                format!("execution {id} has {len} history entries")
            })
        }
        "get_progress" => {
            let id = require_execution_id(action, args)?;
            let since = match args.get("since").and_then(|s| s.as_str()) {
                Some(raw) => Some(parse_since(raw)?),
                None => None,
            };
            let entries = supervisor.get_progress(id, since).await?;
            Ok(render_entries(&entries))
        }
        "send_stdin" => {
            let id = require_execution_id(action, args)?;
            let data = args
                .get("stdin_data")
                .and_then(|d| d.as_str())
                .ok_or(SubmissionError::MissingStdinData)?;
            supervisor.send_stdin(id, data.to_string()).await?;
            Ok(format!("stdin enqueued for execution {id}"))
        }
        other => Err(SubmissionError::UnknownAction {
            action: other.to_string(),
        }),
    }
}

fn execution_id_opt(args: &Value) -> Option<u64> {
    args.get("execution_id").and_then(|i| i.as_u64())
}

fn require_execution_id(action: &str, args: &Value) -> Result<u64, SubmissionError> {
    execution_id_opt(args).ok_or_else(|| SubmissionError::MissingExecutionId {
        action: action.to_string(),
    })
}

fn parse_since(raw: &str) -> Result<DateTime<Utc>, SubmissionError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| SubmissionError::InvalidSince {
            value: raw.to_string(),
        })
}

/// Render a completed submission's reply text. Evaluation errors come back
/// as a *non-error* tool response carrying the error and any captured
/// output, so partial progress is never lost.
fn render_completed(
    ok: bool,
    value: Option<String>,
    error: Option<String>,
    output: &[OutputEntry],
) -> (String, bool) {
    let mut lines: Vec<String> = output.iter().map(|e| e.text.clone()).collect();
    if ok {
        if let Some(value) = value {
            lines.push(value);
        }
        if lines.is_empty() {
            ("(no output)".to_string(), false)
        } else {
            (lines.join("\n"), false)
        }
    } else {
        lines.push(format!(
            "error: {}",
            error.unwrap_or_else(|| "evaluation failed".to_string())
        ));
        (lines.join("\n"), false)
    }
}

fn render_handover(id: u64, snapshot: &[OutputEntry]) -> String {
    let mut text = format!("execution {id} is still running and has moved to the background.\n");
    if !snapshot.is_empty() {
        text.push_str("output so far:\n");
        for entry in snapshot {
            text.push_str(&entry.text);
            text.push('\n');
        }
    }
    text.push_str(&format!(
        "retrieve further progress with action=get_async_log or action=get_progress and execution_id={id}."
    ));
    text
}

fn render_entries(entries: &[OutputEntry]) -> String {
    if entries.is_empty() {
        return "(no output)".to_string();
    }
    entries
        .iter()
        .map(|e| {
            format!(
                "{} [{}] {}",
                e.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                e.stream,
                e.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn initialize_result() -> Value {
    json!({
        "protocolVersion": "2025-03-26",
        "capabilities": {
            "tools": {}
        },
        "serverInfo": {
            "name": "codeloom",
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

fn tools_list_result() -> Value {
    json!({
        "tools": [{
            "name": "execute",
            "description": "Run a code fragment in the persistent execution worker, or manage \
                            running executions. Long-running fragments move to the background \
                            after the handover interval; retrieve their progress with the \
                            management actions.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "code": {
                        "type": "string",
                        "description": "Code fragment to execute. Takes precedence over action."
                    },
                    "working_directory": {
                        "type": "string",
                        "description": "Existing directory the fragment runs in (default: the supervisor's current directory)."
                    },
                    "action": {
                        "type": "string",
                        "enum": [
                            "kill",
                            "get_async_log",
                            "list_async_executions",
                            "clear_history",
                            "get_progress",
                            "send_stdin"
                        ],
                        "description": "Management action, used when code is absent."
                    },
                    "execution_id": {
                        "type": "integer",
                        "description": "Target execution for management actions."
                    },
                    "stdin_data": {
                        "type": "string",
                        "description": "Data to enqueue on the execution's stdin (send_stdin)."
                    },
                    "clear_history": {
                        "type": "boolean",
                        "description": "For clear_history: true empties the history, false only reports its length."
                    },
                    "since": {
                        "type": "string",
                        "description": "ISO 8601 instant; get_progress returns entries strictly newer than this."
                    }
                },
                "required": []
            }
        }]
    })
}
