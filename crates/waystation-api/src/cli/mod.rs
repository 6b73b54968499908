//! CLI command definitions for the `wstn` binary.
//!
//! Uses clap derive macros for argument parsing. `serve` runs the trigger
//! endpoint; `run` inspects and cancels runs in the local ledger.

pub mod run;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

use run::RunCommand;

/// Durable, replay-based workflow engine.
#[derive(Parser)]
#[command(name = "wstn", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Data directory holding `waystation.toml` and the ledger database.
    #[arg(long, global = true, env = "WAYSTATION_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server (trigger endpoint, run API, timer sweeper).
    Serve {
        /// Port to listen on.
        #[arg(long, short, default_value = "3000")]
        port: u16,

        /// Host to bind to.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,

        /// Export spans through OpenTelemetry (stdout exporter).
        #[arg(long)]
        otel: bool,
    },

    /// Inspect or cancel workflow runs.
    Run {
        #[command(subcommand)]
        command: RunCommand,
    },

    /// List registered workflows.
    Workflows,

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}
