//! Anchor probe CLI.
//!
//! The `anchor-probe` command recovers a secret from a remote interpreter
//! through its division error, one equality comparison at a time.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = "anchor-probe")]
#[command(about = "Anchor-based equality-oracle extraction over a remote interpreter")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file to use instead of ./anchor-probe.json
    #[arg(short, long, global = true, env = "ANCHOR_PROBE_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the anchor/target probe and print the recovered template
    Probe {
        #[command(flatten)]
        overrides: commands::Overrides,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Read the secret by index from a character-by-index service
    Scan {
        #[command(flatten)]
        overrides: commands::Overrides,

        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show anchors and the round-trip cost without connecting
    Plan {
        #[command(flatten)]
        overrides: commands::Overrides,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Configuration management commands
    Config {
        #[command(subcommand)]
        command: commands::config::ConfigCommands,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing based on verbosity
    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config;
    match cli.command {
        Commands::Probe { overrides, json } => {
            commands::probe::execute(config_path.as_deref(), &overrides, json).await
        }
        Commands::Scan { overrides, json } => {
            commands::scan::execute(config_path.as_deref(), &overrides, json).await
        }
        Commands::Plan { overrides, json } => {
            commands::plan::execute(config_path.as_deref(), &overrides, json)
        }
        Commands::Config { command } => commands::config::execute(command, config_path.as_deref()),
    }
}
