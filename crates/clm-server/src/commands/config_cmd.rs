//! `config` subcommand — show the resolved configuration.

use std::path::Path;

use codeloom_core::config;

use crate::cli::ConfigArgs;

/// Run the `config` subcommand.
///
/// # Errors
///
/// Returns an error when the configuration cannot be loaded or serialized.
pub async fn run(config_path: Option<&Path>, args: ConfigArgs) -> anyhow::Result<()> {
    let config = config::load(config_path)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    println!("handover interval: {}s", config.handover_secs);
    println!("report interval:   {}s", config.report_secs);
    println!("call timeout:      {}s", config.call_timeout_secs);
    match config.resolve_builtin() {
        Some(builtin) => println!("builtin server:    {builtin}"),
        None => println!("builtin server:    (none)"),
    }
    if config.servers.is_empty() {
        println!("servers:           (none)");
    } else {
        println!("servers:");
        for (name, spec) in &config.servers {
            println!("  {name}: {} {}", spec.command, spec.args.join(" "));
        }
    }
    Ok(())
}
