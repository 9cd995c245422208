//! CLI command definitions for the `sce` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod workflow;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Author, inspect and run service workflows locally.
#[derive(Parser)]
#[command(name = "sce", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit log lines as JSON objects.
    #[arg(long, global = true, env = "SCE_LOG_JSON")]
    pub log_json: bool,

    /// Export spans to stdout through OpenTelemetry.
    #[arg(long, global = true, env = "SCE_OTEL")]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check that a workflow file would publish.
    Validate {
        /// Path to the workflow file (YAML or JSON).
        file: PathBuf,
    },

    /// Print the execution order of a workflow file.
    Plan {
        /// Path to the workflow file (YAML or JSON).
        file: PathBuf,
    },

    /// Publish a workflow file and run one instance of it.
    Run(RunArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Path to the workflow file (YAML or JSON).
    pub file: PathBuf,

    /// Input variables as a JSON object.
    #[arg(long, default_value = "{}")]
    pub input: String,

    /// File mapping activity and workflow names to canned outputs.
    #[arg(long)]
    pub stubs: Option<PathBuf>,

    /// Deliver a signal after start, as NAME=JSON. Repeatable.
    #[arg(long = "signal", value_name = "NAME=JSON")]
    pub signals: Vec<String>,

    /// Engine configuration file (TOML).
    #[arg(long, env = "SCE_CONFIG")]
    pub config: Option<PathBuf>,
}
