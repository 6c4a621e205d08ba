//! Configuration types for the codeloom supervisor.
//!
//! [`Config`] is deserialized from `config.json`. All fields have defaults so
//! a minimal `{"servers": {...}}` file (or no file at all) produces a fully
//! functional configuration. The order of the `servers` map is meaningful:
//! it fixes the capability manifest's server order and plain-name collision
//! resolution.

use std::path::PathBuf;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// The server name under which the supervisor advertises its own `execute`
/// tool. It must not appear in the configuration.
pub const RESERVED_SERVER_NAME: &str = "codeloom";

fn default_handover_secs() -> u64 {
    30
}

fn default_report_secs() -> u64 {
    60
}

fn default_call_timeout_secs() -> u64 {
    60
}

fn default_startup_timeout_secs() -> u64 {
    30
}

/// Launch specification for one downstream tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSpec {
    /// Executable to spawn.
    pub command: String,
    /// Arguments passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for the subprocess (default: inherit).
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

/// Resolved supervisor configuration.
///
/// # Example `config.json`
///
/// ```json
/// {
///   "servers": {
///     "builtin": {"command": "codeloom-tools", "args": ["serve"]},
///     "search": {"command": "search-server", "cwd": "/srv/search"}
///   },
///   "handover_secs": 30
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Downstream tool servers, in declaration order.
    #[serde(default)]
    pub servers: IndexMap<String, ServerSpec>,

    /// Name of the server whose tools get plain (non-namespaced) names in
    /// the worker. Defaults to a server named `builtin`, else the first
    /// declared server.
    #[serde(default)]
    pub builtin_server: Option<String>,

    /// Seconds before a running submission hands over to the background.
    #[serde(default = "default_handover_secs")]
    pub handover_secs: u64,

    /// Seconds between periodic status reports.
    #[serde(default = "default_report_secs")]
    pub report_secs: u64,

    /// Timeout for one downstream tool call, in seconds.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// Timeout for downstream `initialize`/`tools/list` and for the worker
    /// init handshake, in seconds.
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,

    /// Path to the worker binary (default: `codeloom-worker` next to the
    /// running executable, falling back to `PATH` lookup).
    #[serde(default)]
    pub worker_bin: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            servers: IndexMap::new(),
            builtin_server: None,
            handover_secs: default_handover_secs(),
            report_secs: default_report_secs(),
            call_timeout_secs: default_call_timeout_secs(),
            startup_timeout_secs: default_startup_timeout_secs(),
            worker_bin: None,
        }
    }
}

impl Config {
    /// Validate invariants that deserialization cannot express.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the reserved server name is configured
    /// or a server has an empty command.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, spec) in &self.servers {
            if name == RESERVED_SERVER_NAME {
                return Err(ConfigError::ReservedServerName { name: name.clone() });
            }
            if spec.command.trim().is_empty() {
                return Err(ConfigError::EmptyCommand { name: name.clone() });
            }
        }
        Ok(())
    }

    /// Resolve the designated built-in server, if any server is configured.
    ///
    /// Priority: the `builtin_server` key, else a server literally named
    /// `builtin`, else the first declared server.
    pub fn resolve_builtin(&self) -> Option<String> {
        if let Some(name) = &self.builtin_server {
            if self.servers.contains_key(name) {
                return Some(name.clone());
            }
        }
        if self.servers.contains_key("builtin") {
            return Some("builtin".to_string());
        }
        self.servers.keys().next().cloned()
    }

    /// Declared server names, in configuration order.
    pub fn server_order(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }
}
