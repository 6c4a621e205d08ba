//! The capability manifest delivered to the worker at init.
//!
//! The manifest is a plain table: `server → tool → parameter spec`. The
//! worker consults it at dispatch time to build invocables; no entry carries
//! state beyond its descriptor. Server order follows configuration
//! declaration order, which also decides plain-name collisions.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::catalog::{ParamSpec, ToolDescriptor};

/// One canonical parameter name and its accepted alternates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasEntry {
    pub canonical: String,
    pub aliases: Vec<String>,
}

/// The tools of one downstream server, keyed by tool name in catalog order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerManifest {
    pub tools: IndexMap<String, ToolSpec>,
}

/// One invocable tool: display description plus declared parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
}

/// The frozen capability mapping handed to the worker in `init`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilityManifest {
    /// `server → tools`, in configuration declaration order.
    pub servers: IndexMap<String, ServerManifest>,
    /// The server whose tools are additionally exposed under plain names.
    #[serde(default)]
    pub builtin: Option<String>,
    /// The fixed parameter alias table (identical across implementations).
    #[serde(default)]
    pub aliases: Vec<AliasEntry>,
}

impl CapabilityManifest {
    /// Build a manifest from an aggregated catalog.
    ///
    /// `server_order` fixes the iteration order (configuration declaration
    /// order); catalog entries for servers not listed there are ignored.
    pub fn from_catalog(
        catalog: &[ToolDescriptor],
        server_order: &[String],
        builtin: Option<String>,
    ) -> Self {
        let mut servers: IndexMap<String, ServerManifest> = IndexMap::new();
        for name in server_order {
            servers.insert(name.clone(), ServerManifest::default());
        }
        for descriptor in catalog {
            if let Some(server) = servers.get_mut(&descriptor.server) {
                server.tools.insert(
                    descriptor.name.clone(),
                    ToolSpec {
                        description: descriptor.description.clone(),
                        params: descriptor.params.clone(),
                    },
                );
            }
        }
        Self {
            servers,
            builtin,
            aliases: crate::aliases::standard_aliases(),
        }
    }

    /// Look up one tool spec.
    pub fn tool(&self, server: &str, tool: &str) -> Option<&ToolSpec> {
        self.servers.get(server)?.tools.get(tool)
    }

    /// Total number of invocables across all servers.
    pub fn tool_count(&self) -> usize {
        self.servers.values().map(|s| s.tools.len()).sum()
    }
}
