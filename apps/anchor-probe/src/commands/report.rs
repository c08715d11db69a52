//! Human-readable rendering of probe reports and progress events.

use anchor_probe::{ProbeEvent, ProbeReport};
use colored::Colorize;
use std::fmt::Write;

pub fn format_report(report: &ProbeReport, wildcard: char) -> String {
    let mut out = String::new();
    let resolved = report
        .diagnostics
        .iter()
        .filter(|d| d.resolved.is_some())
        .count();

    let _ = writeln!(out, "{} {}", "Template:".bold(), report.rendered.cyan());
    let _ = writeln!(
        out,
        "Resolved {}/{} targets in {} round trips ({} ambiguous)",
        resolved,
        report.diagnostics.len(),
        report.stats.round_trips,
        report.stats.ambiguous
    );

    for diag in &report.diagnostics {
        let symbol = diag.resolved.unwrap_or(wildcard);
        let mut line = format!("  #{:<4} {}", diag.position, symbol);
        if diag.cluster.len() > 1 {
            let members: Vec<String> = diag.cluster.iter().map(ToString::to_string).collect();
            let _ = write!(line, "  cluster: {}", members.join(", "));
        } else if let Some(anchor) = diag.cluster.first() {
            let _ = write!(line, "  = {anchor}");
        }
        if diag.needs_retry {
            let _ = write!(line, "  {}", "needs retry".yellow());
        }
        let _ = writeln!(out, "{line}");
    }

    if let Some(reason) = &report.aborted {
        let _ = writeln!(out, "{} Run {}", "ERROR".red(), reason);
    }
    out
}

/// Progress line for a probe event, if it deserves one.
pub fn format_event(event: &ProbeEvent) -> Option<String> {
    match event {
        ProbeEvent::AnchorStarted {
            anchor,
            index,
            total,
        } => Some(format!("{} anchor {} ({}/{})", "..".dimmed(), anchor, index + 1, total)),
        ProbeEvent::Match { target, anchor } => {
            Some(format!("{} #{} == {}", "MATCH".green(), target, anchor))
        }
        ProbeEvent::Ambiguous {
            target,
            anchor,
            step,
        } => Some(match target {
            Some(target) => format!(
                "{} no answer to {} for #{} under {}",
                "WARN".yellow(),
                step,
                target,
                anchor
            ),
            None => format!("{} no answer to {} for {}", "WARN".yellow(), step, anchor),
        }),
        ProbeEvent::AnchorFinished { .. } | ProbeEvent::Aborted(_) => None,
    }
}

pub fn print_event(event: &ProbeEvent) {
    if let Some(line) = format_event(event) {
        eprintln!("{line}");
    }
}
