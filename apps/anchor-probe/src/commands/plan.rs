//! Offline view of what a probe run would do.

use super::{Overrides, load, print_warnings};
use anchor_probe::{Anchor, TargetRange};
use anyhow::Result;
use colored::Colorize;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Serialize)]
pub struct Plan {
    pub anchors: Vec<Anchor>,
    pub targets: TargetRange,
    pub round_trips: u64,
    /// Total pause between targets.
    pub delay_ms: u64,
}

pub fn execute(config_path: Option<&Path>, overrides: &Overrides, json: bool) -> Result<()> {
    let loaded = load(config_path, overrides)?;
    print_warnings(&loaded);
    let config = loaded.config;
    config.validate()?;

    let anchors = config.anchors()?;
    let plan = Plan {
        targets: config.targets,
        round_trips: config.estimated_round_trips()?,
        delay_ms: config
            .delay_ms
            .saturating_mul((anchors.len() * config.targets.len()) as u64),
        anchors,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    println!(
        "{} anchors, targets {} ({} positions)",
        plan.anchors.len(),
        plan.targets,
        plan.targets.len()
    );
    for (i, anchor) in plan.anchors.iter().enumerate() {
        println!("  {:>2}. {}", i + 1, anchor);
    }
    println!(
        "{} {} round trips, at least {:?} of delay",
        "Cost:".bold(),
        plan.round_trips,
        Duration::from_millis(plan.delay_ms)
    );
    Ok(())
}
