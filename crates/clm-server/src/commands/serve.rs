//! `serve` subcommand — run the tool server on stdio.
//!
//! Startup order: load and validate configuration, bring up the downstream
//! fleet (fail-fast), derive the capability manifest, spawn the worker and
//! run its init handshake, then serve the client protocol until EOF or an
//! interrupt. Shutdown tears the worker and the fleet down again, soft then
//! hard.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;

use codeloom_core::config;

use crate::binder;
use crate::cli::ServeArgs;
use crate::registry::ServerRegistry;
use crate::service::ClientService;
use crate::supervisor::{self, SupervisorTimings};
use crate::worker_link::{ProcessWorkerTransport, resolve_worker_bin};

/// Run the `serve` subcommand.
///
/// # Errors
///
/// Returns an error on configuration, downstream-startup, or worker-init
/// failure; the process exits non-zero.
pub async fn run(config_path: Option<&Path>, args: ServeArgs) -> anyhow::Result<()> {
    let config = config::load(config_path)?;

    let servers = if args.no_downstream {
        None
    } else {
        Some(Arc::new(ServerRegistry::start(&config).await?))
    };
    let catalog = servers
        .as_ref()
        .map(|r| r.catalog().to_vec())
        .unwrap_or_default();
    let manifest = binder::build_manifest(&config, &catalog);
    tracing::info!(
        servers = manifest.servers.len(),
        tools = manifest.tool_count(),
        "capability manifest ready"
    );

    let transport = ProcessWorkerTransport::new(resolve_worker_bin(&config));
    let (notify_tx, notify_rx) = mpsc::channel(16);
    let supervisor = supervisor::start(
        Box::new(transport),
        servers.clone(),
        manifest,
        SupervisorTimings::from_config(&config),
        notify_tx,
    )
    .await?;

    let service = ClientService::new(supervisor.clone(), std::env::current_dir()?);
    tokio::select! {
        result = service.run(tokio::io::stdin(), tokio::io::stdout(), notify_rx) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, shutting down");
        }
    }

    supervisor.shutdown().await;
    if let Some(servers) = servers {
        servers.shutdown().await;
    }
    Ok(())
}
