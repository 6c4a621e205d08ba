//! The downstream server registry.
//!
//! Starts one [`DownstreamClient`] per configured server, in declaration
//! order, and aggregates their tool catalogs. Startup is fail-fast: the
//! system refuses to run with a partially-available capability set, so the
//! first server that fails to spawn, initialize, or list its tools aborts
//! startup (already-started servers are shut down again).

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;

use codeloom_core::catalog::ToolDescriptor;
use codeloom_core::config::Config;
use codeloom_core::error::ConfigError;

use crate::downstream::DownstreamClient;

#[derive(Debug)]
pub struct ServerRegistry {
    clients: IndexMap<String, Arc<DownstreamClient>>,
    catalog: Vec<ToolDescriptor>,
}

impl ServerRegistry {
    /// Start every configured server and aggregate the union of their tool
    /// catalogs.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ServerStartup`] naming the first server that
    /// failed; servers started before it are shut down first.
    pub async fn start(config: &Config) -> Result<Self, ConfigError> {
        let startup_timeout = Duration::from_secs(config.startup_timeout_secs);
        let call_timeout = Duration::from_secs(config.call_timeout_secs);

        let mut clients: IndexMap<String, Arc<DownstreamClient>> = IndexMap::new();
        let mut catalog: Vec<ToolDescriptor> = Vec::new();

        for (name, spec) in &config.servers {
            let started = async {
                let client =
                    DownstreamClient::spawn(name, spec, startup_timeout, call_timeout).await?;
                client
                    .initialize()
                    .await
                    .map_err(|e| ConfigError::ServerStartup {
                        name: name.clone(),
                        message: e.to_string(),
                    })?;
                let tools = client
                    .list_tools()
                    .await
                    .map_err(|e| ConfigError::ServerStartup {
                        name: name.clone(),
                        message: e.to_string(),
                    })?;
                Ok::<_, ConfigError>((client, tools))
            }
            .await;

            match started {
                Ok((client, tools)) => {
                    tracing::info!(server = %name, tools = tools.len(), "downstream server ready");
                    catalog.extend(tools);
                    clients.insert(name.clone(), Arc::new(client));
                }
                Err(e) => {
                    for client in clients.values() {
                        client.shutdown().await;
                    }
                    return Err(e);
                }
            }
        }

        Ok(Self { clients, catalog })
    }

    /// A registry with no servers (`--no-downstream`).
    pub fn empty() -> Self {
        Self {
            clients: IndexMap::new(),
            catalog: Vec::new(),
        }
    }

    /// Route a server name to its client handle.
    pub fn route(&self, server: &str) -> Option<Arc<DownstreamClient>> {
        self.clients.get(server).cloned()
    }

    /// Whether the aggregated catalog carries `(server, tool)`.
    pub fn has_tool(&self, server: &str, tool: &str) -> bool {
        self.catalog
            .iter()
            .any(|d| d.server == server && d.name == tool)
    }

    /// The aggregated tool catalog, in server declaration order.
    pub fn catalog(&self) -> &[ToolDescriptor] {
        &self.catalog
    }

    /// Terminate every subprocess, soft then hard.
    pub async fn shutdown(&self) {
        for client in self.clients.values() {
            client.shutdown().await;
        }
    }
}
