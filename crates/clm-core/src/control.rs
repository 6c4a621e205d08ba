//! Worker control-channel messages.
//!
//! The supervisor and the execution worker talk over the worker's stdio in
//! newline-delimited JSON. [`WorkerCommand`] flows supervisor → worker,
//! [`WorkerEvent`] flows worker → supervisor. Both are externally-tagged on a
//! `type` field so either side can skip message kinds it does not know.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::manifest::CapabilityManifest;

/// Output stream classification for captured user-code output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Log,
    Err,
    Warn,
}

impl std::fmt::Display for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputStream::Log => write!(f, "log"),
            OutputStream::Err => write!(f, "err"),
            OutputStream::Warn => write!(f, "warn"),
        }
    }
}

/// Supervisor → worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerCommand {
    /// One-time capability wiring; the worker replies with
    /// [`WorkerEvent::InitComplete`].
    Init { manifest: CapabilityManifest },
    /// Begin a submission. The worker switches its working directory and
    /// evaluates `code`.
    Execute {
        submission_id: u64,
        code: String,
        working_directory: String,
    },
    /// Delivery of an outstanding capability-call reply.
    CapabilityReply {
        call_id: u64,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Mark the submission's kill flag; absent id applies to all submissions.
    Kill {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        submission_id: Option<u64>,
    },
    /// Enqueue data into the per-submission stdin queue.
    StdinWrite { submission_id: u64, data: String },
}

/// Worker → supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// The capability manifest is wired; the worker is ready for `execute`.
    InitComplete,
    /// User code invoked a capability; the supervisor routes it downstream
    /// and answers with [`WorkerCommand::CapabilityReply`].
    CapabilityCall {
        call_id: u64,
        submission_id: u64,
        server: String,
        tool: String,
        arguments: Value,
    },
    /// One line of output emitted by user code.
    StreamOutput {
        submission_id: u64,
        stream: OutputStream,
        text: String,
    },
    /// First stdin write arrived while the submission was blocked reading.
    InteractiveStarted { submission_id: u64 },
    /// The submission terminated. `value` renders the terminal expression on
    /// success; `error` carries the evaluation error text on failure.
    ExecResult {
        submission_id: u64,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}
