//! CLI argument types for the codeloom supervisor.
//!
//! Defines the top-level [`Cli`] struct and all subcommand [`Args`] using
//! clap's derive macros. Each subcommand maps to a module in [`crate::commands`].

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Programmable code-execution tool server
#[derive(Parser, Debug)]
#[command(name = "codeloom", version, about)]
pub struct Cli {
    /// Path to config.json (default: auto-detected)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the tool server on stdio
    Serve(ServeArgs),
    /// Show resolved configuration
    Config(ConfigArgs),
    /// List the aggregated downstream tool catalog
    Tools(ToolsArgs),
}

/// Arguments for the `serve` subcommand
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Run without downstream servers (empty capability manifest)
    #[arg(long)]
    pub no_downstream: bool,
}

/// Arguments for the `config` subcommand
#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the `tools` subcommand
#[derive(Args, Debug)]
pub struct ToolsArgs {}
