//! Linear index scan against a character-by-index service.

use super::{Overrides, load, print_warnings};
use anchor_probe::{IndexScan, LineTransport, TcpSession};
use anyhow::{Context, Result};
use colored::Colorize;
use std::path::Path;
use tracing::warn;

pub async fn execute(config_path: Option<&Path>, overrides: &Overrides, json: bool) -> Result<()> {
    let loaded = load(config_path, overrides)?;
    print_warnings(&loaded);
    let config = loaded.config;
    if config.host.trim().is_empty() {
        anyhow::bail!("No host configured; pass --host or set ANCHOR_PROBE_HOST");
    }

    let mut session = TcpSession::connect(
        &config.host,
        config.port,
        config.scan_prompt(),
        config.connect_timeout(),
    )
    .await
    .with_context(|| format!("Failed to connect to {}:{}", config.host, config.port))?;

    let scan = IndexScan::new(config.scan.clone(), config.read_timeout());
    let outcome = scan.run(&mut session).await;
    if let Err(e) = session.close().await {
        warn!("Failed to close session: {}", e);
    }
    let outcome = outcome?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!("{} {}", "Secret:".bold(), outcome.secret.cyan());
        if !outcome.finished {
            eprintln!(
                "{} Scan stopped after {} queries without reaching the end",
                "WARN".yellow(),
                outcome.queries
            );
        }
    }
    Ok(())
}
