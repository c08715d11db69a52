pub mod config;
pub mod plan;
pub mod probe;
pub mod report;
pub mod scan;

use anchor_probe::{LoadedProbeConfig, ProbeConfig, TargetRange, load_merged};
use anyhow::Result;
use clap::Args;
use colored::Colorize;
use std::path::Path;

/// Flags that override the loaded configuration.
#[derive(Args, Debug, Default, Clone)]
pub struct Overrides {
    /// Remote host
    #[arg(long)]
    pub host: Option<String>,

    /// Remote port
    #[arg(long)]
    pub port: Option<u16>,

    /// Known prefix of the secret
    #[arg(long)]
    pub prefix: Option<String>,

    /// Anchor positions in iteration order, comma separated
    #[arg(long, value_delimiter = ',')]
    pub anchors: Option<Vec<usize>>,

    /// First target position
    #[arg(long)]
    pub lo: Option<usize>,

    /// Last target position (inclusive)
    #[arg(long)]
    pub hi: Option<usize>,

    /// Pause after each target, in milliseconds
    #[arg(long)]
    pub delay_ms: Option<u64>,

    /// Read deadline per response, in milliseconds
    #[arg(long)]
    pub read_timeout_ms: Option<u64>,
}

impl Overrides {
    pub fn apply(&self, cfg: &mut ProbeConfig) {
        if let Some(host) = &self.host {
            cfg.host.clone_from(host);
        }
        if let Some(port) = self.port {
            cfg.port = port;
        }
        if let Some(prefix) = &self.prefix {
            cfg.prefix.clone_from(prefix);
        }
        if let Some(anchors) = &self.anchors {
            cfg.anchor_order.clone_from(anchors);
        }
        if self.lo.is_some() || self.hi.is_some() {
            cfg.targets = TargetRange::new(
                self.lo.unwrap_or(cfg.targets.lo),
                self.hi.unwrap_or(cfg.targets.hi),
            );
        }
        if let Some(delay) = self.delay_ms {
            cfg.delay_ms = delay;
        }
        if let Some(timeout) = self.read_timeout_ms {
            cfg.read_timeout_ms = timeout;
        }
    }
}

/// Load config from the current directory, then apply flag overrides.
pub fn load(config_path: Option<&Path>, overrides: &Overrides) -> Result<LoadedProbeConfig> {
    let dir = std::env::current_dir()?;
    let mut loaded = load_merged(&dir, config_path)?;
    overrides.apply(&mut loaded.config);
    loaded.warnings = loaded.config.advisories();
    Ok(loaded)
}

pub fn print_warnings(loaded: &LoadedProbeConfig) {
    for warning in &loaded.warnings {
        eprintln!("{} {}", "WARN".yellow(), warning);
    }
}
