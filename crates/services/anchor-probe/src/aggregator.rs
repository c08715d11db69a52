//! Equality clusters and template reconstruction.

use crate::types::{
    AbortReason, Anchor, ProbeReport, RunStats, Slot, TargetDiagnostic, TargetRange, Template,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::warn;

/// Collects anchor matches per target.
///
/// Cluster members are kept in anchor iteration order, whatever order the
/// matches were recorded in, so the first member is always the canonical one.
#[derive(Debug, Clone)]
pub struct Aggregator {
    rank: HashMap<usize, usize>,
    known: BTreeMap<usize, char>,
    targets: TargetRange,
    clusters: BTreeMap<usize, Vec<Anchor>>,
    needs_retry: BTreeSet<usize>,
}

impl Aggregator {
    pub fn new(anchors: &[Anchor], known: BTreeMap<usize, char>, targets: TargetRange) -> Self {
        let mut rank = HashMap::with_capacity(anchors.len());
        for (i, anchor) in anchors.iter().enumerate() {
            rank.entry(anchor.position).or_insert(i);
        }
        Self {
            rank,
            known,
            targets,
            clusters: targets.iter().map(|t| (t, Vec::new())).collect(),
            needs_retry: BTreeSet::new(),
        }
    }

    /// Record that `target` compared equal to `anchor`.
    pub fn record_match(&mut self, target: usize, anchor: Anchor) {
        let Some(&rank) = self.rank.get(&anchor.position) else {
            warn!("Ignoring match against unconfigured anchor {}", anchor);
            return;
        };
        let Some(cluster) = self.clusters.get_mut(&target) else {
            warn!("Ignoring match for #{} outside {}", target, self.targets);
            return;
        };
        if cluster.iter().any(|a| a.position == anchor.position) {
            return;
        }
        let at = cluster
            .iter()
            .position(|a| self.rank.get(&a.position).is_some_and(|r| *r > rank))
            .unwrap_or(cluster.len());
        cluster.insert(at, anchor);
    }

    /// Note that a probe against `target` came back ambiguous.
    pub fn record_ambiguous(&mut self, target: usize) {
        self.needs_retry.insert(target);
    }

    pub fn cluster(&self, target: usize) -> &[Anchor] {
        self.clusters.get(&target).map_or(&[], Vec::as_slice)
    }

    /// Symbol of the first cluster member in anchor iteration order.
    pub fn resolve(&self, target: usize) -> Option<char> {
        self.cluster(target).first().map(|a| a.symbol)
    }

    pub fn match_count(&self) -> usize {
        self.clusters.values().map(Vec::len).sum()
    }

    pub fn resolved_targets(&self) -> usize {
        self.clusters.values().filter(|c| !c.is_empty()).count()
    }

    /// Known positions pre-filled, resolved targets overlaid, the rest wildcards.
    pub fn template(&self) -> Template {
        let first_known = self.known.keys().next().copied();
        let last_known = self.known.keys().next_back().copied();
        let start = first_known.map_or(self.targets.lo, |k| k.min(self.targets.lo));
        let end = last_known.map_or(self.targets.hi, |k| k.max(self.targets.hi));

        let slots = (start..=end)
            .map(|position| {
                if let Some(symbol) = self.resolve(position) {
                    Slot::Resolved(symbol)
                } else if let Some(symbol) = self.known.get(&position) {
                    Slot::Known(*symbol)
                } else {
                    Slot::Wildcard
                }
            })
            .collect();

        Template { start, slots }
    }

    /// Per-target cluster membership for manual disambiguation.
    pub fn diagnostics(&self) -> Vec<TargetDiagnostic> {
        self.clusters
            .iter()
            .map(|(position, cluster)| TargetDiagnostic {
                position: *position,
                cluster: cluster.clone(),
                resolved: cluster.first().map(|a| a.symbol),
                needs_retry: self.needs_retry.contains(position),
            })
            .collect()
    }

    pub fn report(
        &self,
        stats: RunStats,
        aborted: Option<AbortReason>,
        banner: Option<String>,
        wildcard: char,
        started_at: DateTime<Utc>,
    ) -> ProbeReport {
        let template = self.template();
        ProbeReport {
            rendered: template.render(wildcard),
            template,
            diagnostics: self.diagnostics(),
            stats,
            aborted,
            banner,
            started_at,
            finished_at: Utc::now(),
        }
    }
}
