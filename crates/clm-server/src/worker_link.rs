//! Transport abstraction for the execution worker process.
//!
//! [`WorkerTransport`] is the trait seam between [`crate::supervisor`] and
//! the worker child process. Production code uses [`ProcessWorkerTransport`]
//! (spawns the `codeloom-worker` binary); [`MockWorkerTransport`] is an
//! in-memory test double for integration tests.
//!
//! The trait covers I/O creation only: the supervisor keeps ownership of the
//! reader loop and the pending bookkeeping, which are coupled to its
//! submission registry.

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tokio::sync::Mutex;

use codeloom_core::config::Config;

/// Shared writer half of a worker channel.
pub type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Raw I/O handles produced by a successful [`WorkerTransport::spawn`] call.
///
/// `stdin` and `stdout` are boxed trait objects so non-process transports
/// can provide in-memory implementations.
pub struct RawWorkerIo {
    /// Shared control-channel writer. The supervisor shares this with
    /// capability-reply tasks.
    pub stdin: SharedWriter,
    /// Raw control-channel reader, consumed by the supervisor's reader task.
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    /// The child process handle, retained for force-kill on shutdown.
    /// `None` for transports that do not spawn a real process.
    pub process: Arc<Mutex<Option<Child>>>,
}

/// Abstracts the mechanism by which the supervisor reaches its worker.
///
/// # Errors
///
/// `spawn` returns an error if the worker process (or equivalent) cannot be
/// started.
#[async_trait]
pub trait WorkerTransport: Send + Sync + std::fmt::Debug {
    /// Spawn (or connect to) the worker and return raw I/O handles.
    async fn spawn(&self) -> anyhow::Result<RawWorkerIo>;
}

/// Resolve the worker binary path: the configured override, else a
/// `codeloom-worker` sitting next to the running executable, else a bare
/// name resolved through `PATH`.
pub fn resolve_worker_bin(config: &Config) -> PathBuf {
    if let Some(path) = &config.worker_bin {
        return path.clone();
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let sibling = dir.join("codeloom-worker");
            if sibling.is_file() {
                return sibling;
            }
        }
    }
    PathBuf::from("codeloom-worker")
}

/// Production transport: spawns the worker binary with piped stdio.
///
/// The worker's stderr is inherited so its logs interleave with the
/// supervisor's; its stdout carries the control protocol and is never
/// inherited.
#[derive(Debug)]
pub struct ProcessWorkerTransport {
    program: PathBuf,
}

impl ProcessWorkerTransport {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl WorkerTransport for ProcessWorkerTransport {
    async fn spawn(&self) -> anyhow::Result<RawWorkerIo> {
        use tokio::process::Command;

        let mut cmd = Command::new(&self.program);
        cmd.stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit());

        let mut child = cmd.spawn().map_err(|e| {
            anyhow::anyhow!("cannot spawn worker '{}': {e}", self.program.display())
        })?;

        let stdin = child.stdin.take().expect("worker stdin must be piped");
        let stdout = child.stdout.take().expect("worker stdout must be piped");

        Ok(RawWorkerIo {
            stdin: Arc::new(Mutex::new(
                Box::new(stdin) as Box<dyn AsyncWrite + Send + Unpin>
            )),
            stdout: Box::new(stdout) as Box<dyn AsyncRead + Send + Unpin>,
            process: Arc::new(Mutex::new(Some(child))),
        })
    }
}

// ─── MockWorkerTransport ─────────────────────────────────────────────────────

/// Channel handle for [`MockWorkerTransport`].
///
/// Lets a test inject pre-scripted event lines that appear as "worker
/// stdout" and observe the control commands the supervisor wrote to "worker
/// stdin".
pub struct MockWorkerHandle {
    /// Send pre-scripted event lines as "worker stdout".
    pub event_tx: tokio::sync::mpsc::UnboundedSender<String>,
    /// Receive the control commands the supervisor sent to "worker stdin".
    pub command_rx: tokio::sync::mpsc::UnboundedReceiver<String>,
}

/// In-memory test double transport; no worker process is spawned.
///
/// The "worker stdout" is a tokio duplex read half, fully isolated from the
/// process's own stdout (which carries the client protocol).
#[derive(Debug)]
pub struct MockWorkerTransport {
    /// Keepalive clone: prevents the event channel from closing if the
    /// [`MockWorkerHandle`]'s sender is dropped before the pump task exits.
    #[expect(
        dead_code,
        reason = "keepalive: holds the event channel open for the pump task"
    )]
    event_tx: tokio::sync::mpsc::UnboundedSender<String>,
    event_rx: Arc<Mutex<Option<tokio::sync::mpsc::UnboundedReceiver<String>>>>,
    command_tx: tokio::sync::mpsc::UnboundedSender<String>,
}

impl MockWorkerTransport {
    /// Create a transport and its associated [`MockWorkerHandle`].
    pub fn new_with_handle() -> (Self, MockWorkerHandle) {
        let (event_tx, event_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        let (command_tx, command_rx) = tokio::sync::mpsc::unbounded_channel::<String>();

        let transport = Self {
            event_tx: event_tx.clone(),
            event_rx: Arc::new(Mutex::new(Some(event_rx))),
            command_tx,
        };
        let handle = MockWorkerHandle {
            event_tx,
            command_rx,
        };
        (transport, handle)
    }
}

#[async_trait]
impl WorkerTransport for MockWorkerTransport {
    async fn spawn(&self) -> anyhow::Result<RawWorkerIo> {
        use tokio::io::AsyncWriteExt as _;

        let (mut stdout_write, stdout_read) = tokio::io::duplex(65_536);

        let mut event_rx = self
            .event_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow::anyhow!("MockWorkerTransport::spawn called more than once"))?;

        // Pump: injected event lines become "worker stdout".
        tokio::spawn(async move {
            while let Some(line) = event_rx.recv().await {
                let bytes = format!("{line}\n");
                if stdout_write.write_all(bytes.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let stdin_capturer = SniffWriter::new(self.command_tx.clone());

        Ok(RawWorkerIo {
            stdin: Arc::new(Mutex::new(
                Box::new(stdin_capturer) as Box<dyn AsyncWrite + Send + Unpin>
            )),
            stdout: Box::new(stdout_read) as Box<dyn AsyncRead + Send + Unpin>,
            process: Arc::new(Mutex::new(None)),
        })
    }
}

/// An [`AsyncWrite`] that accumulates bytes, splits on `\n`, and forwards
/// each complete line to an unbounded channel.
struct SniffWriter {
    tx: tokio::sync::mpsc::UnboundedSender<String>,
    buf: Vec<u8>,
}

impl SniffWriter {
    fn new(tx: tokio::sync::mpsc::UnboundedSender<String>) -> Self {
        Self {
            tx,
            buf: Vec::new(),
        }
    }
}

impl AsyncWrite for SniffWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.buf.extend_from_slice(buf);
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let s = String::from_utf8_lossy(&line).trim().to_string();
            if !s.is_empty() {
                let _ = self.tx.send(s);
            }
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
