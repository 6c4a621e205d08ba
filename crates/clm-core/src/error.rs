//! Stable error kinds, surfaced to clients as text.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or validating configuration, or while
/// bringing up the downstream fleet.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// An explicitly requested configuration file could not be read.
    #[error("cannot read configuration at {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON of the expected shape.
    #[error("malformed configuration in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// The reserved server name is used for a configured server.
    #[error("server name '{name}' is reserved for the supervisor's own tool")]
    ReservedServerName { name: String },

    /// A configured server has an empty command.
    #[error("server '{name}' has an empty command")]
    EmptyCommand { name: String },

    /// A required downstream server failed to start or initialize.
    #[error("downstream server '{name}' failed to start: {message}")]
    ServerStartup { name: String, message: String },

    /// The home directory could not be determined for config discovery.
    #[error("cannot determine home directory")]
    NoHomeDir,
}

/// Errors raised on the capability-call path. These are returned to user
/// code as ordinary failures of the invocable.
#[derive(Error, Debug)]
pub enum CapabilityError {
    #[error("unknown server '{server}'")]
    UnknownServer { server: String },

    #[error("unknown tool '{tool}' on server '{server}'")]
    UnknownTool { server: String, tool: String },

    /// A required parameter is still missing after aliasing.
    #[error("required parameter '{param}' missing for tool '{tool}'")]
    MissingParameter { tool: String, param: String },

    /// Arguments could not be matched against the tool's schema.
    #[error("invalid arguments for tool '{tool}': {message}")]
    InvalidArguments { tool: String, message: String },

    /// The downstream server answered with an error result.
    #[error("{message}")]
    Downstream { message: String },

    /// The downstream subprocess is gone or its channel broke.
    #[error("downstream transport failure: {message}")]
    Transport { message: String },

    #[error("downstream call timed out after {secs}s")]
    Timeout { secs: u64 },
}

/// Errors raised while dispatching an `execute` call or a management action.
#[derive(Error, Debug)]
pub enum SubmissionError {
    #[error("working directory does not exist: {path}")]
    WorkingDirectoryMissing { path: PathBuf },

    #[error("execute requires either code or an action")]
    MissingCodeOrAction,

    #[error("unknown action '{action}'")]
    UnknownAction { action: String },

    #[error("action '{action}' requires an execution_id")]
    MissingExecutionId { action: String },

    #[error("unknown execution id {id}")]
    UnknownSubmission { id: u64 },

    #[error("send_stdin requires stdin_data")]
    MissingStdinData,

    #[error("cannot parse '{value}' as an ISO 8601 instant")]
    InvalidSince { value: String },

    /// The execution worker died; new submissions are refused.
    #[error("execution worker is not available")]
    WorkerUnavailable,
}
