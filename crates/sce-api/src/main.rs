//! `sce` command-line entry point.
//!
//! Parses CLI arguments, installs tracing, then dispatches to the workflow
//! command handlers. Everything runs in-process: definitions live in an
//! in-memory repository and nodes execute on the local durable host.

mod cli;
mod workflow_file;

use clap::Parser;

use cli::{Cli, Commands};
use sce_observe::tracing_setup::{TracingOptions, init_tracing, shutdown_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up tracing based on verbosity
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,sce=debug",
        _ => "trace",
    };
    init_tracing(&TracingOptions {
        enable_otel: cli.otel,
        json: cli.log_json,
        default_filter: filter.to_string(),
    })
    .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let outcome = match cli.command {
        Commands::Validate { file } => cli::workflow::validate(&file, cli.json).await,
        Commands::Plan { file } => cli::workflow::plan(&file, cli.json).await,
        Commands::Run(args) => cli::workflow::run(args, cli.json, cli.quiet).await,
    };

    shutdown_tracing();
    outcome
}
