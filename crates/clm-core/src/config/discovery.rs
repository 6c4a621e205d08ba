//! Configuration file discovery and loading.
//!
//! The search order is fixed: `./config.json`, then `config.json` next to the
//! running executable, then `~/.codeloom/config.json`. The first existing
//! file wins. When none exists the compiled-in defaults apply (no downstream
//! servers), which behaves like `--no-downstream`.

use std::path::{Path, PathBuf};

use super::types::Config;
use crate::error::ConfigError;

/// Candidate configuration paths in priority order.
///
/// Built from explicit directories so callers (and tests) control the
/// environment; [`load`] feeds it the process's actual locations.
pub fn candidate_paths(cwd: &Path, exe_dir: Option<&Path>, home: Option<&Path>) -> Vec<PathBuf> {
    let mut paths = vec![cwd.join("config.json")];
    if let Some(dir) = exe_dir {
        paths.push(dir.join("config.json"));
    }
    if let Some(home) = home {
        paths.push(home.join(".codeloom").join("config.json"));
    }
    paths
}

/// Load configuration.
///
/// With an explicit `path` the file must exist and parse. Otherwise the
/// candidate locations are probed in order; if none exists the defaults are
/// returned.
///
/// # Errors
///
/// Returns a [`ConfigError`] when an explicit path cannot be read, or any
/// found file fails to parse or validate.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    if let Some(path) = path {
        return load_file(path);
    }

    let cwd = std::env::current_dir().map_err(|source| ConfigError::Read {
        path: PathBuf::from("."),
        source,
    })?;
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf));
    let home = dirs::home_dir();

    for candidate in candidate_paths(&cwd, exe_dir.as_deref(), home.as_deref()) {
        if candidate.is_file() {
            return load_file(&candidate);
        }
    }

    Ok(Config::default())
}

fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config: Config = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    config.validate()?;
    Ok(config)
}
