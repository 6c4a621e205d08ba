//! Downstream tool-server client.
//!
//! One [`DownstreamClient`] per configured server: it owns the subprocess,
//! a codec reader task, and the pending-call table. Request ids come from a
//! per-client counter; the reply waiter is installed *before* the request is
//! transmitted, so a fast reply can never be lost. When the subprocess
//! exits, every pending call fails with a transport error and the client is
//! marked terminated.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{Mutex, oneshot};

use codeloom_core::catalog::{self, ToolDescriptor};
use codeloom_core::codec::{self, MessageReader};
use codeloom_core::config::ServerSpec;
use codeloom_core::error::{CapabilityError, ConfigError};
use codeloom_core::rpc::{self, Incoming};

/// Grace period after closing stdin before the subprocess is force-killed.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

/// How often the exit watcher polls the subprocess for termination.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

type PendingTable = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, CapabilityError>>>>>;

pub struct DownstreamClient {
    name: String,
    /// `None` once shutdown has closed the pipe.
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    pending: PendingTable,
    next_id: AtomicU64,
    terminated: Arc<AtomicBool>,
    process: Arc<Mutex<Option<Child>>>,
    startup_timeout: Duration,
    call_timeout: Duration,
}

impl DownstreamClient {
    /// Spawn the subprocess and start its reader and exit-watcher tasks.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ServerStartup`] when the subprocess cannot be
    /// spawned.
    pub async fn spawn(
        name: &str,
        spec: &ServerSpec,
        startup_timeout: Duration,
        call_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        use tokio::process::Command;

        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| ConfigError::ServerStartup {
            name: name.to_string(),
            message: e.to_string(),
        })?;

        let stdin = child.stdin.take().expect("downstream stdin must be piped");
        let stdout = child.stdout.take().expect("downstream stdout must be piped");

        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let terminated = Arc::new(AtomicBool::new(false));
        let process: Arc<Mutex<Option<Child>>> = Arc::new(Mutex::new(Some(child)));

        // Reader: route responses to their waiters. Server-initiated
        // requests and notifications are not part of the contract and are
        // dropped.
        {
            let pending = Arc::clone(&pending);
            let server = name.to_string();
            tokio::spawn(async move {
                let mut reader = MessageReader::new(stdout);
                while let Ok(Some(msg)) = reader.next_value().await {
                    let Some(Incoming::Response { id, result, error }) = Incoming::parse(msg)
                    else {
                        continue;
                    };
                    let Some(id) = id.as_u64() else { continue };
                    let Some(tx) = pending.lock().await.remove(&id) else {
                        tracing::debug!("unmatched response id {id} from server '{server}'");
                        continue;
                    };
                    let outcome = match (result, error) {
                        (Some(result), _) => Ok(result),
                        (None, Some(error)) => Err(CapabilityError::Downstream {
                            message: error
                                .get("message")
                                .and_then(|m| m.as_str())
                                .unwrap_or("downstream error")
                                .to_string(),
                        }),
                        (None, None) => Ok(Value::Null),
                    };
                    let _ = tx.send(outcome);
                }
                tracing::info!("downstream '{server}' stdout reader exited");
            });
        }

        // Exit watcher: poll for termination, then mark terminated and fail
        // all pending calls. The child stays in the shared slot between
        // polls so `shutdown()` can still take it and force-kill after the
        // grace period.
        {
            let pending = Arc::clone(&pending);
            let terminated = Arc::clone(&terminated);
            let process = Arc::clone(&process);
            let server = name.to_string();
            tokio::spawn(async move {
                loop {
                    {
                        let mut guard = process.lock().await;
                        let poll = match guard.as_mut() {
                            Some(child) => child.try_wait(),
                            // shutdown() took the child and is killing it.
                            None => break,
                        };
                        match poll {
                            Ok(Some(status)) => {
                                tracing::info!("downstream '{server}' exited: {status}");
                                guard.take();
                                break;
                            }
                            Ok(None) => {}
                            Err(e) => {
                                tracing::error!("error waiting for '{server}': {e}");
                                guard.take();
                                break;
                            }
                        }
                    }
                    tokio::time::sleep(EXIT_POLL_INTERVAL).await;
                }
                terminated.store(true, Ordering::SeqCst);
                let mut table = pending.lock().await;
                for (_, tx) in table.drain() {
                    let _ = tx.send(Err(CapabilityError::Transport {
                        message: format!("server '{server}' exited"),
                    }));
                }
            });
        }

        Ok(Self {
            name: name.to_string(),
            stdin: Arc::new(Mutex::new(Some(stdin))),
            pending,
            next_id: AtomicU64::new(0),
            terminated,
            process,
            startup_timeout,
            call_timeout,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Perform the MCP `initialize` handshake.
    ///
    /// # Errors
    ///
    /// Returns a [`CapabilityError`] on timeout or transport failure.
    pub async fn initialize(&self) -> Result<(), CapabilityError> {
        self.rpc(
            "initialize",
            json!({
                "protocolVersion": "2025-03-26",
                "capabilities": {},
                "clientInfo": {
                    "name": "codeloom",
                    "version": env!("CARGO_PKG_VERSION"),
                }
            }),
            self.startup_timeout,
        )
        .await?;
        self.notify("notifications/initialized", json!({})).await;
        Ok(())
    }

    /// Fetch and parse the server's tool catalog.
    ///
    /// # Errors
    ///
    /// Returns a [`CapabilityError`] on timeout, transport failure, or a
    /// malformed catalog.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, CapabilityError> {
        let result = self
            .rpc("tools/list", json!({}), self.startup_timeout)
            .await?;
        catalog::parse_tools_list(&self.name, &result)
    }

    /// Invoke one tool. A single-element text content array collapses to its
    /// text; any other result shape is returned structurally.
    ///
    /// # Errors
    ///
    /// Returns a [`CapabilityError`] when the downstream reports an error,
    /// the call times out, or the subprocess is gone.
    pub async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value, CapabilityError> {
        let result = self
            .rpc(
                "tools/call",
                json!({"name": tool, "arguments": arguments}),
                self.call_timeout,
            )
            .await?;

        if result.get("isError").and_then(|e| e.as_bool()) == Some(true) {
            return Err(CapabilityError::Downstream {
                message: rpc::single_text_content(&result)
                    .unwrap_or_else(|| format!("tool '{tool}' returned an error")),
            });
        }
        match rpc::single_text_content(&result) {
            Some(text) => Ok(Value::String(text)),
            None => Ok(result),
        }
    }

    async fn rpc(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, CapabilityError> {
        if self.is_terminated() {
            return Err(CapabilityError::Transport {
                message: format!("server '{}' exited", self.name),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = rpc::request(id, method, params);
        if let Err(e) = self.write(&request).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_closed)) => Err(CapabilityError::Transport {
                message: format!("server '{}' exited", self.name),
            }),
            Err(_elapsed) => {
                self.pending.lock().await.remove(&id);
                Err(CapabilityError::Timeout {
                    secs: timeout.as_secs(),
                })
            }
        }
    }

    async fn notify(&self, method: &str, params: Value) {
        let _ = self.write(&rpc::notification(method, params)).await;
    }

    async fn write(&self, msg: &Value) -> Result<(), CapabilityError> {
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(CapabilityError::Transport {
                message: format!("server '{}' stdin is closed", self.name),
            });
        };
        codec::write_line(stdin, msg)
            .await
            .map_err(|e| CapabilityError::Transport {
                message: format!("write to server '{}' failed: {e}", self.name),
            })
    }

    /// Terminate the subprocess: close stdin (soft), wait a short grace
    /// period, then force-kill if it is still running.
    pub async fn shutdown(&self) {
        drop(self.stdin.lock().await.take());
        tokio::time::sleep(SHUTDOWN_GRACE).await;
        if let Some(mut child) = self.process.lock().await.take() {
            let _ = child.kill().await;
        }
    }
}

impl std::fmt::Debug for DownstreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownstreamClient")
            .field("name", &self.name)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}
