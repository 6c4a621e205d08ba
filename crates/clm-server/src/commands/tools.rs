//! `tools` subcommand — start the downstream fleet and print the aggregated
//! tool catalog.

use std::path::Path;

use codeloom_core::config;

use crate::cli::ToolsArgs;
use crate::registry::ServerRegistry;

/// Run the `tools` subcommand.
///
/// # Errors
///
/// Returns an error when configuration loading or downstream startup fails.
pub async fn run(config_path: Option<&Path>, _args: ToolsArgs) -> anyhow::Result<()> {
    let config = config::load(config_path)?;
    if config.servers.is_empty() {
        println!("no downstream servers configured");
        return Ok(());
    }

    let registry = ServerRegistry::start(&config).await?;
    for descriptor in registry.catalog() {
        let params: Vec<String> = descriptor
            .params
            .iter()
            .map(|p| {
                if p.required {
                    p.name.clone()
                } else {
                    format!("{}?", p.name)
                }
            })
            .collect();
        if descriptor.description.is_empty() {
            println!("{}.{}({})", descriptor.server, descriptor.name, params.join(", "));
        } else {
            println!(
                "{}.{}({}) - {}",
                descriptor.server,
                descriptor.name,
                params.join(", "),
                descriptor.description
            );
        }
    }
    registry.shutdown().await;
    Ok(())
}
