use crate::error::{ProbeError, Result};
use crate::expression::VariableNames;
use crate::oracle::{DEFAULT_ERROR_PHRASE, ErrorSignal};
use crate::scan::{LINE_FRAME, ScanSettings};
use crate::types::{Anchor, TargetRange};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::Duration;

pub const DEFAULT_PROMPT: &str = ">>> ";

/// Estimated round trips above which the plan gets an advisory warning.
const LARGE_RUN_ROUND_TRIPS: u64 = 50_000;

/// Largest plan `validate` accepts.
pub const MAX_ROUND_TRIPS: u64 = 10_000_000;

/// `anchors × (1 + 3 × targets)`, or `None` if it overflows.
pub fn round_trips_for(anchors: u64, targets: u64) -> Option<u64> {
    targets.checked_mul(3)?.checked_add(1)?.checked_mul(anchors)
}

/// Configuration for one anchor probe run.
///
/// All fields use `#[serde(default)]` so partial config files work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Remote host.
    pub host: String,
    /// Remote port.
    pub port: u16,

    /// Known prefix of the secret, placed starting at `prefix_start`.
    pub prefix: String,
    /// Position of the first prefix character.
    pub prefix_start: usize,
    /// Additional known symbols by position; these win over `prefix`.
    pub known: BTreeMap<usize, char>,

    /// Anchor iteration order. Empty means every known position outside the
    /// target range, ascending, keeping only the first position per symbol.
    pub anchor_order: Vec<usize>,
    /// Positions under test.
    pub targets: TargetRange,

    /// Pause after each probed target.
    pub delay_ms: u64,
    /// Read deadline for each response.
    pub read_timeout_ms: u64,
    /// Read deadline for the banner printed on connect.
    pub banner_timeout_ms: u64,
    pub connect_timeout_ms: u64,

    /// Prompt marker terminating each response.
    pub prompt: String,
    /// Phrase printed when the shared variable divides by zero.
    pub error_phrase: String,
    /// Name of the shared interpreter variable.
    pub shared_var: String,
    /// Letter repeated `n` times to name secret position `n`.
    pub position_var: String,

    /// Placeholder for unresolved positions in the rendered template.
    pub wildcard: char,

    /// Index-scan mode.
    pub scan: ScanSettings,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 1337,
            prefix: String::new(),
            prefix_start: 1,
            known: BTreeMap::new(),
            anchor_order: Vec::new(),
            targets: TargetRange::default(),
            delay_ms: 10,
            read_timeout_ms: 1000,
            banner_timeout_ms: 2000,
            connect_timeout_ms: 10_000,
            prompt: DEFAULT_PROMPT.into(),
            error_phrase: DEFAULT_ERROR_PHRASE.into(),
            shared_var: "a".into(),
            position_var: "b".into(),
            wildcard: '?',
            scan: ScanSettings::default(),
        }
    }
}

impl ProbeConfig {
    pub fn builder(host: impl Into<String>, port: u16) -> ProbeConfigBuilder {
        ProbeConfigBuilder::new(host, port)
    }

    /// Starter config for a `infobahn{...}`-style flag of 55 characters.
    pub fn sample() -> Self {
        Self {
            host: "127.0.0.1".into(),
            prefix: "infobahn{".into(),
            anchor_order: vec![1, 2, 3, 4, 5, 6, 7, 9],
            targets: TargetRange::new(10, 55),
            ..Default::default()
        }
    }

    /// Merged known table: prefix characters, then explicit entries.
    pub fn known_symbols(&self) -> BTreeMap<usize, char> {
        let mut known: BTreeMap<usize, char> = self
            .prefix
            .chars()
            .enumerate()
            .map(|(i, c)| (self.prefix_start + i, c))
            .collect();
        known.extend(self.known.iter().map(|(p, c)| (*p, *c)));
        known
    }

    /// Anchors in iteration order, deduplicated by position.
    pub fn anchors(&self) -> Result<Vec<Anchor>> {
        let known = self.known_symbols();

        if self.anchor_order.is_empty() {
            let mut seen = HashSet::new();
            return Ok(known
                .iter()
                .filter(|(p, _)| !self.targets.contains(**p))
                .filter(|(_, c)| seen.insert(**c))
                .map(|(p, c)| Anchor::new(*p, *c))
                .collect());
        }

        let mut seen = HashSet::new();
        let mut anchors = Vec::with_capacity(self.anchor_order.len());
        for position in &self.anchor_order {
            if !seen.insert(*position) {
                continue;
            }
            let symbol = known.get(position).copied().ok_or_else(|| {
                ProbeError::config(format!("anchor position {position} has no known symbol"))
            })?;
            anchors.push(Anchor::new(*position, symbol));
        }
        Ok(anchors)
    }

    pub fn variable_names(&self) -> Result<VariableNames> {
        VariableNames::new(self.shared_var.clone(), self.position_var.clone())
    }

    pub fn error_signal(&self) -> ErrorSignal {
        ErrorSignal::new(self.error_phrase.clone())
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn banner_timeout(&self) -> Duration {
        Duration::from_millis(self.banner_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Marker framing index-scan responses. The probe prompt is not used.
    pub fn scan_prompt(&self) -> &str {
        self.scan.prompt.as_deref().unwrap_or(LINE_FRAME)
    }

    /// `|anchors| × (1 + 3 × |targets|)`.
    pub fn estimated_round_trips(&self) -> Result<u64> {
        let anchors = self.anchors()?.len() as u64;
        round_trips_for(anchors, self.targets.len() as u64).ok_or_else(|| {
            ProbeError::config(format!("target range {} is too large to plan", self.targets))
        })
    }

    /// Reject configurations the probe loop cannot run safely.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(ProbeError::config("host cannot be empty"));
        }
        if self.port == 0 {
            return Err(ProbeError::config("port cannot be 0"));
        }
        if self.prompt.is_empty() {
            return Err(ProbeError::config("prompt marker cannot be empty"));
        }
        if self.error_phrase.is_empty() {
            return Err(ProbeError::config("error phrase cannot be empty"));
        }
        if self.targets.lo == 0 {
            return Err(ProbeError::config("positions start at 1"));
        }
        if self.targets.lo > self.targets.hi {
            return Err(ProbeError::config(format!(
                "target range is inverted: {}",
                self.targets
            )));
        }
        if self.known_symbols().contains_key(&0) {
            return Err(ProbeError::config("positions start at 1"));
        }
        self.variable_names()?;

        let anchors = self.anchors()?;
        if anchors.is_empty() {
            return Err(ProbeError::config("no anchors: the known table is empty"));
        }
        if let Some(overlap) = anchors.iter().find(|a| self.targets.contains(a.position)) {
            return Err(ProbeError::config(format!(
                "anchor #{} lies inside the target range {}",
                overlap.position, self.targets
            )));
        }
        let round_trips = self.estimated_round_trips()?;
        if round_trips > MAX_ROUND_TRIPS {
            return Err(ProbeError::config(format!(
                "plan needs {round_trips} round trips, over the limit of {MAX_ROUND_TRIPS}"
            )));
        }
        Ok(())
    }

    /// Non-blocking issues worth surfacing before a run.
    pub fn advisories(&self) -> Vec<AdvisoryWarning> {
        let mut warnings = vec![];

        let mut listed = HashSet::new();
        let repeated: Vec<usize> = self
            .anchor_order
            .iter()
            .copied()
            .filter(|p| !listed.insert(*p))
            .collect();
        if !repeated.is_empty() {
            warnings.push(AdvisoryWarning {
                code: "anchors.duplicate_position",
                message: format!("anchor positions {repeated:?} listed more than once; keeping the first"),
            });
        }

        if let Ok(anchors) = self.anchors() {
            let mut first_by_symbol: BTreeMap<char, usize> = BTreeMap::new();
            for anchor in &anchors {
                if let Some(first) = first_by_symbol.get(&anchor.symbol) {
                    warnings.push(AdvisoryWarning {
                        code: "anchors.duplicate_symbol",
                        message: format!(
                            "anchor #{} repeats symbol {:?} of anchor #{}; it can only add duplicate cluster members",
                            anchor.position, anchor.symbol, first
                        ),
                    });
                } else {
                    first_by_symbol.insert(anchor.symbol, anchor.position);
                }
            }
        }

        let inside: Vec<usize> = self
            .known_symbols()
            .keys()
            .copied()
            .filter(|p| self.targets.contains(*p))
            .collect();
        if !inside.is_empty() {
            warnings.push(AdvisoryWarning {
                code: "known.inside_targets",
                message: format!(
                    "known positions {inside:?} are inside the target range and will be re-probed"
                ),
            });
        }

        if let Ok(n) = self.estimated_round_trips()
            && n > LARGE_RUN_ROUND_TRIPS
        {
            warnings.push(AdvisoryWarning {
                code: "plan.large",
                message: format!("plan needs {n} round trips"),
            });
        }

        if self.delay_ms == 0 {
            warnings.push(AdvisoryWarning {
                code: "delay.zero",
                message: "no delay between requests; the service may throttle".into(),
            });
        }

        warnings
    }
}

/// An advisory warning about a configuration issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvisoryWarning {
    /// Machine-readable warning code.
    pub code: &'static str,
    pub message: String,
}

impl fmt::Display for AdvisoryWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Builder for ProbeConfig with fluent API
pub struct ProbeConfigBuilder {
    config: ProbeConfig,
}

impl ProbeConfigBuilder {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            config: ProbeConfig {
                host: host.into(),
                port,
                ..Default::default()
            },
        }
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.prefix = prefix.into();
        self
    }

    pub fn prefix_start(mut self, start: usize) -> Self {
        self.config.prefix_start = start;
        self
    }

    pub fn known(mut self, position: usize, symbol: char) -> Self {
        self.config.known.insert(position, symbol);
        self
    }

    pub fn anchor_order(mut self, order: Vec<usize>) -> Self {
        self.config.anchor_order = order;
        self
    }

    pub fn targets(mut self, lo: usize, hi: usize) -> Self {
        self.config.targets = TargetRange::new(lo, hi);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.config.delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn banner_timeout(mut self, timeout: Duration) -> Self {
        self.config.banner_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.prompt = prompt.into();
        self
    }

    pub fn error_phrase(mut self, phrase: impl Into<String>) -> Self {
        self.config.error_phrase = phrase.into();
        self
    }

    pub fn variables(mut self, shared: impl Into<String>, position: impl Into<String>) -> Self {
        self.config.shared_var = shared.into();
        self.config.position_var = position.into();
        self
    }

    pub fn wildcard(mut self, wildcard: char) -> Self {
        self.config.wildcard = wildcard;
        self
    }

    pub fn build(self) -> Result<ProbeConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
