//! The anchor/target probe run.

use super::{Overrides, load, print_warnings, report};
use anchor_probe::AnchorProbe;
use anyhow::{Context, Result};
use colored::Colorize;
use std::path::Path;

pub async fn execute(config_path: Option<&Path>, overrides: &Overrides, json: bool) -> Result<()> {
    let loaded = load(config_path, overrides)?;
    print_warnings(&loaded);
    let config = loaded.config;
    config.validate()?;

    if !json {
        eprintln!(
            "{} {}:{} ({} anchors, targets {}, {} round trips)",
            "Probing".bold(),
            config.host,
            config.port,
            config.anchors()?.len(),
            config.targets,
            config.estimated_round_trips()?
        );
    }

    let mut probe = AnchorProbe::connect(&config)
        .await
        .with_context(|| format!("Failed to start session with {}:{}", config.host, config.port))?;
    if !json {
        probe = probe.with_observer(report::print_event);
    }

    let report = probe.run().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report::format_report(&report, config.wildcard));
    }

    if let Some(reason) = report.aborted {
        anyhow::bail!("Run {reason}");
    }
    Ok(())
}
