//! The capability binder.
//!
//! Derives the worker's capability manifest from the aggregated catalog: one
//! invocable per tool, namespaced by server in configuration declaration
//! order, the designated built-in server recorded for plain-name exposure,
//! and the fixed alias table attached so user-code behavior is stable across
//! implementations.

use codeloom_core::catalog::ToolDescriptor;
use codeloom_core::config::Config;
use codeloom_core::manifest::CapabilityManifest;

/// Build the manifest delivered to the worker at init.
pub fn build_manifest(config: &Config, catalog: &[ToolDescriptor]) -> CapabilityManifest {
    CapabilityManifest::from_catalog(catalog, &config.server_order(), config.resolve_builtin())
}
