//! Configuration management commands.
//!
//! Provides init, show, and validate subcommands for managing
//! anchor-probe.json configuration files.

use anchor_probe::ProbeConfig;
use anchor_probe::loader::{
    global_config_path, load_merged, local_config_path, write_pretty_json_atomic,
};
use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::{Path, PathBuf};

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Initialize a new configuration file
    Init {
        /// Create global config instead of local
        #[arg(long)]
        global: bool,

        /// Overwrite existing config file
        #[arg(long)]
        force: bool,

        /// Start from a filled-in example instead of bare defaults
        #[arg(long)]
        sample: bool,
    },

    /// Show the merged configuration
    Show {
        /// Output as raw JSON (no formatting)
        #[arg(long)]
        json: bool,

        /// Path to use as local directory (defaults to current dir)
        #[arg(long)]
        path: Option<PathBuf>,
    },

    /// Validate configuration and show warnings
    Validate {
        /// Path to use as local directory (defaults to current dir)
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

pub fn execute(cmd: ConfigCommands, config_path: Option<&Path>) -> Result<()> {
    match cmd {
        ConfigCommands::Init {
            global,
            force,
            sample,
        } => cmd_init(global, force, sample, config_path),
        ConfigCommands::Show { json, path } => cmd_show(json, path, config_path),
        ConfigCommands::Validate { path } => cmd_validate(path, config_path),
    }
}

fn cmd_init(global: bool, force: bool, sample: bool, config_path: Option<&Path>) -> Result<()> {
    let path = if global {
        global_config_path()?
    } else if let Some(explicit) = config_path {
        explicit.to_path_buf()
    } else {
        local_config_path(&std::env::current_dir()?)
    };

    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {}\nUse --force to overwrite",
            path.display()
        );
    }

    let config = if sample {
        ProbeConfig::sample()
    } else {
        ProbeConfig::default()
    };
    let value = serde_json::to_value(&config).context("Failed to serialize config")?;
    write_pretty_json_atomic(&path, &value)?;

    println!(
        "{} Created {}",
        "OK".green(),
        path.display().to_string().cyan()
    );
    Ok(())
}

fn cmd_show(json_output: bool, path: Option<PathBuf>, config_path: Option<&Path>) -> Result<()> {
    let dir = path.unwrap_or(std::env::current_dir()?);
    let loaded = load_merged(&dir, config_path)?;

    for warning in &loaded.warnings {
        eprintln!("{} {}", "WARN".yellow(), warning);
    }

    if json_output {
        println!("{}", serde_json::to_string(&loaded.config)?);
    } else {
        println!("{}", serde_json::to_string_pretty(&loaded.config)?);
    }

    Ok(())
}

fn cmd_validate(path: Option<PathBuf>, config_path: Option<&Path>) -> Result<()> {
    let dir = path.unwrap_or(std::env::current_dir()?);
    let loaded = load_merged(&dir, config_path)?;

    if let Err(e) = loaded.config.validate() {
        eprintln!("{} {}", "ERROR".red(), e);
        anyhow::bail!("Configuration is invalid");
    }

    if loaded.warnings.is_empty() {
        println!("{} Configuration is valid", "OK".green());
    } else {
        println!(
            "{} Configuration has {} warning(s):",
            "WARN".yellow(),
            loaded.warnings.len()
        );
        for w in &loaded.warnings {
            println!("  - {}", w);
        }
    }
    println!("\nConfig files:");
    println!("  Global: {}", loaded.paths.global.display());
    println!("  Local:  {}", loaded.paths.local.display());

    Ok(())
}
