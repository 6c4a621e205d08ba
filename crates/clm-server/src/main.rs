//! codeloom — programmable code-execution tool server.
//!
//! # Subcommands
//!
//! - `serve`  — Start the tool server on stdio
//! - `config` — Show resolved configuration
//! - `tools`  — List the aggregated downstream tool catalog

use clap::Parser;
use codeloom_core::logging;

use codeloom_server::cli::{Cli, Commands};
use codeloom_server::commands;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => commands::serve::run(cli.config.as_deref(), args).await,
        Commands::Config(args) => commands::config_cmd::run(cli.config.as_deref(), args).await,
        Commands::Tools(args) => commands::tools::run(cli.config.as_deref(), args).await,
    }
}
