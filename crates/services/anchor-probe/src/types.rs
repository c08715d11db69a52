use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A secret position whose symbol is already known and is used as a
/// reference value for equality tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Anchor {
    pub position: usize,
    pub symbol: char,
}

impl Anchor {
    pub fn new(position: usize, symbol: char) -> Self {
        Self { position, symbol }
    }
}

impl fmt::Display for Anchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({:?})", self.position, self.symbol)
    }
}

/// Inclusive range of target positions, probed in ascending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRange {
    pub lo: usize,
    pub hi: usize,
}

impl TargetRange {
    pub fn new(lo: usize, hi: usize) -> Self {
        Self { lo, hi }
    }

    pub fn contains(&self, position: usize) -> bool {
        (self.lo..=self.hi).contains(&position)
    }

    pub fn len(&self) -> usize {
        if self.hi < self.lo {
            0
        } else {
            (self.hi - self.lo).saturating_add(1)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> std::ops::RangeInclusive<usize> {
        self.lo..=self.hi
    }
}

impl Default for TargetRange {
    fn default() -> Self {
        Self { lo: 1, hi: 1 }
    }
}

impl fmt::Display for TargetRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.lo, self.hi)
    }
}

/// Classification of a single oracle response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeResult {
    /// The distinguishing error phrase was observed.
    ErrorSignal,
    /// The service evaluated the expression normally.
    Normal,
    /// No prompt marker was observed before the read deadline or EOF.
    Ambiguous,
}

/// One slot of the reconstructed secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "symbol", rename_all = "snake_case")]
pub enum Slot {
    /// Pre-filled from the known table.
    Known(char),
    /// Resolved through an anchor match.
    Resolved(char),
    Wildcard,
}

impl Slot {
    pub fn symbol(&self) -> Option<char> {
        match self {
            Slot::Known(c) | Slot::Resolved(c) => Some(*c),
            Slot::Wildcard => None,
        }
    }
}

/// Ordered, partially resolved reconstruction of the secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    /// Position of the first slot.
    pub start: usize,
    pub slots: Vec<Slot>,
}

impl Template {
    pub fn get(&self, position: usize) -> Option<Slot> {
        position
            .checked_sub(self.start)
            .and_then(|offset| self.slots.get(offset).copied())
    }

    pub fn end(&self) -> usize {
        self.start + self.slots.len().saturating_sub(1)
    }

    pub fn resolved_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, Slot::Resolved(_)))
            .count()
    }

    /// Render the template, substituting `wildcard` for unresolved slots.
    pub fn render(&self, wildcard: char) -> String {
        self.slots
            .iter()
            .map(|s| s.symbol().unwrap_or(wildcard))
            .collect()
    }
}

/// Full cluster membership for one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDiagnostic {
    pub position: usize,
    pub cluster: Vec<Anchor>,
    pub resolved: Option<char>,
    /// A probe against this target returned an ambiguous response.
    pub needs_retry: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub round_trips: u64,
    pub ambiguous: u64,
    pub anchors_completed: usize,
    pub matches: usize,
}

/// Which step of the probe loop a fatal failure interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStep {
    Connect,
    Banner,
    Baseline,
    Subtract,
    Probe,
    Reset,
}

impl fmt::Display for ProbeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProbeStep::Connect => "connect",
            ProbeStep::Banner => "banner",
            ProbeStep::Baseline => "baseline",
            ProbeStep::Subtract => "subtract",
            ProbeStep::Probe => "probe",
            ProbeStep::Reset => "reset",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortReason {
    pub step: ProbeStep,
    pub anchor: Option<usize>,
    pub target: Option<usize>,
    pub message: String,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "aborted during {}", self.step)?;
        if let Some(anchor) = self.anchor {
            write!(f, " (anchor #{anchor}")?;
            if let Some(target) = self.target {
                write!(f, ", target #{target}")?;
            }
            write!(f, ")")?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Final output of an anchor probe run, complete or aborted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeReport {
    pub template: Template,
    pub rendered: String,
    pub diagnostics: Vec<TargetDiagnostic>,
    pub stats: RunStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<AbortReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub banner: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ProbeReport {
    pub fn is_complete(&self) -> bool {
        self.aborted.is_none()
    }
}
