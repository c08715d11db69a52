//! The anchor/target probe loop.
//!
//! For each anchor the shared variable is loaded with the anchor's value, then
//! every target is compared with three round trips: subtract the target,
//! divide the anchor by the shared variable, and reload the anchor value. The
//! division raises the distinguishing error exactly when the two values are
//! equal. The reload is unconditional: the service stores every result in the
//! shared variable, so skipping it corrupts every later comparison.

use crate::aggregator::Aggregator;
use crate::config::{ProbeConfig, round_trips_for};
use crate::error::{ProbeError, Result};
use crate::expression::{Expression, VariableNames};
use crate::oracle::Oracle;
use crate::transport::{LineTransport, TcpSession};
use crate::types::{AbortReason, Anchor, ProbeReport, ProbeResult, ProbeStep, RunStats, TargetRange};
use chrono::Utc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Progress notifications emitted while the loop runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeEvent {
    AnchorStarted {
        anchor: Anchor,
        index: usize,
        total: usize,
    },
    Match {
        target: usize,
        anchor: Anchor,
    },
    Ambiguous {
        target: Option<usize>,
        anchor: Anchor,
        step: ProbeStep,
    },
    AnchorFinished {
        anchor: Anchor,
    },
    Aborted(AbortReason),
}

/// A fatal failure tagged with the step it interrupted.
#[derive(Debug, Error)]
#[error("{step} step failed: {source}")]
pub struct StepFailure {
    pub step: ProbeStep,
    #[source]
    pub source: ProbeError,
    /// Probe classification observed before a failed reset.
    pub observed: Option<ProbeResult>,
}

impl StepFailure {
    fn at(step: ProbeStep) -> impl FnOnce(ProbeError) -> Self {
        move |source| Self {
            step,
            source,
            observed: None,
        }
    }
}

/// Classifications of the three round trips of one comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairOutcome {
    pub subtract: ProbeResult,
    pub probe: ProbeResult,
    pub reset: ProbeResult,
}

impl PairOutcome {
    pub fn is_match(&self) -> bool {
        self.probe == ProbeResult::ErrorSignal
    }

    /// Steps whose response never completed.
    pub fn ambiguous_steps(&self) -> Vec<ProbeStep> {
        [
            (ProbeStep::Subtract, self.subtract),
            (ProbeStep::Probe, self.probe),
            (ProbeStep::Reset, self.reset),
        ]
        .into_iter()
        .filter(|(_, r)| *r == ProbeResult::Ambiguous)
        .map(|(s, _)| s)
        .collect()
    }
}

/// The remote shared variable, held at one anchor's baseline.
///
/// `acquire` loads the baseline, `compare` mutates and then restores it, so
/// the variable holds the baseline again whenever `compare` returns `Ok`.
pub struct SharedVariable<'a, T> {
    oracle: &'a mut Oracle<T>,
    names: &'a VariableNames,
    anchor: Anchor,
    baseline: Expression,
    probe: Expression,
}

impl<'a, T: LineTransport> SharedVariable<'a, T> {
    /// Load the anchor value into the shared variable (one round trip).
    pub async fn acquire(
        oracle: &'a mut Oracle<T>,
        names: &'a VariableNames,
        anchor: Anchor,
    ) -> std::result::Result<(Self, ProbeResult), StepFailure> {
        let mut var = Self::attach(oracle, names, anchor).map_err(StepFailure::at(ProbeStep::Baseline))?;
        let result = var
            .oracle
            .query(&var.baseline)
            .await
            .map_err(StepFailure::at(ProbeStep::Baseline))?;
        Ok((var, result))
    }

    /// Wrap a shared variable already holding `anchor`'s value.
    pub fn attach(oracle: &'a mut Oracle<T>, names: &'a VariableNames, anchor: Anchor) -> Result<Self> {
        Ok(Self {
            baseline: names.baseline(anchor.position)?,
            probe: names.probe(anchor.position)?,
            oracle,
            names,
            anchor,
        })
    }

    pub fn anchor(&self) -> Anchor {
        self.anchor
    }

    /// Compare `target` against the anchor: subtract, probe, reset.
    pub async fn compare(&mut self, target: usize) -> std::result::Result<PairOutcome, StepFailure> {
        let subtract_expr = self
            .names
            .subtract(target)
            .map_err(StepFailure::at(ProbeStep::Subtract))?;
        let subtract = self
            .oracle
            .query(&subtract_expr)
            .await
            .map_err(StepFailure::at(ProbeStep::Subtract))?;

        let probe = self
            .oracle
            .query(&self.probe)
            .await
            .map_err(StepFailure::at(ProbeStep::Probe))?;

        let reset = self.release().await.map_err(|source| StepFailure {
            step: ProbeStep::Reset,
            source,
            observed: Some(probe),
        })?;

        Ok(PairOutcome {
            subtract,
            probe,
            reset,
        })
    }

    /// Restore the baseline.
    pub async fn release(&mut self) -> Result<ProbeResult> {
        self.oracle.query(&self.baseline).await
    }
}

/// Drives the anchor/target double loop over one exclusively owned session.
pub struct AnchorProbe<T> {
    oracle: Oracle<T>,
    names: VariableNames,
    anchors: Vec<Anchor>,
    targets: TargetRange,
    aggregator: Aggregator,
    delay: Duration,
    wildcard: char,
    ambiguous: u64,
    anchors_completed: usize,
    banner: Option<String>,
    observer: Option<Box<dyn FnMut(&ProbeEvent) + Send>>,
}

impl AnchorProbe<TcpSession> {
    /// Validate `config`, connect, and consume the service banner.
    pub async fn connect(config: &ProbeConfig) -> Result<Self> {
        config.validate()?;
        let session = TcpSession::connect(
            &config.host,
            config.port,
            &config.prompt,
            config.connect_timeout(),
        )
        .await?;
        let mut probe = Self::new(config, session)?;
        probe.read_banner(config.banner_timeout()).await?;
        Ok(probe)
    }
}

impl<T: LineTransport> AnchorProbe<T> {
    pub fn new(config: &ProbeConfig, transport: T) -> Result<Self> {
        config.validate()?;
        let anchors = config.anchors()?;
        let aggregator = Aggregator::new(&anchors, config.known_symbols(), config.targets);
        Ok(Self {
            oracle: Oracle::new(transport, config.error_signal(), config.read_timeout()),
            names: config.variable_names()?,
            anchors,
            targets: config.targets,
            aggregator,
            delay: config.delay(),
            wildcard: config.wildcard,
            ambiguous: 0,
            anchors_completed: 0,
            banner: None,
            observer: None,
        })
    }

    pub fn with_observer(mut self, observer: impl FnMut(&ProbeEvent) + Send + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Read the introductory banner; it ends at the first prompt.
    pub async fn read_banner(&mut self, wait: Duration) -> Result<Option<String>> {
        let frame = self.oracle.read_banner(wait).await?;
        if !frame.is_complete() {
            warn!("Banner did not end with a prompt ({:?})", frame.status);
        }
        let banner = frame.text.trim().to_string();
        if !banner.is_empty() {
            info!("Banner: {}", banner);
        }
        self.banner = Some(banner);
        Ok(self.banner.clone())
    }

    /// Load `anchor`'s value into the shared variable.
    pub async fn establish_baseline(&mut self, anchor: Anchor) -> Result<ProbeResult> {
        let baseline = self.names.baseline(anchor.position)?;
        self.oracle.query(&baseline).await
    }

    /// Compare one target against an anchor whose baseline is already loaded.
    ///
    /// Exactly three round trips; the baseline is restored on success.
    pub async fn probe(
        &mut self,
        anchor: Anchor,
        target: usize,
    ) -> std::result::Result<PairOutcome, StepFailure> {
        let mut var = SharedVariable::attach(&mut self.oracle, &self.names, anchor)
            .map_err(StepFailure::at(ProbeStep::Subtract))?;
        var.compare(target).await
    }

    /// Run the full double loop and close the session.
    ///
    /// Never fails: a fatal transport error stops the loop and is reported in
    /// [`ProbeReport::aborted`] next to everything resolved before it.
    pub async fn run(&mut self) -> ProbeReport {
        let started_at = Utc::now();
        let total = self.anchors.len();
        info!(
            "Probing {} targets ({}) against {} anchors: {} round trips",
            self.targets.len(),
            self.targets,
            total,
            round_trips_for(total as u64, self.targets.len() as u64).unwrap_or(u64::MAX)
        );

        let mut aborted = None;
        let anchors = self.anchors.clone();
        'anchors: for (index, anchor) in anchors.into_iter().enumerate() {
            info!("Using anchor {} ({}/{})", anchor, index + 1, total);
            self.emit(&ProbeEvent::AnchorStarted {
                anchor,
                index,
                total,
            });

            let acquired = SharedVariable::acquire(&mut self.oracle, &self.names, anchor).await;
            let (mut var, baseline) = match acquired {
                Ok(acquired) => acquired,
                Err(failure) => {
                    aborted = Some(Self::abort_reason(failure, anchor, None));
                    break 'anchors;
                }
            };
            if baseline == ProbeResult::Ambiguous {
                self.ambiguous += 1;
                warn!("Baseline for anchor {} was ambiguous", anchor);
                if let Some(observer) = self.observer.as_mut() {
                    observer(&ProbeEvent::Ambiguous {
                        target: None,
                        anchor,
                        step: ProbeStep::Baseline,
                    });
                }
            }

            for target in self.targets.iter() {
                let outcome = match var.compare(target).await {
                    Ok(outcome) => outcome,
                    Err(failure) => {
                        // The comparison itself completed; only the reset was lost.
                        if failure.observed == Some(ProbeResult::ErrorSignal) {
                            self.aggregator.record_match(target, anchor);
                            if let Some(observer) = self.observer.as_mut() {
                                observer(&ProbeEvent::Match { target, anchor });
                            }
                        }
                        aborted = Some(Self::abort_reason(failure, anchor, Some(target)));
                        break 'anchors;
                    }
                };

                if outcome.is_match() {
                    debug!("Target #{} == anchor {}", target, anchor);
                    self.aggregator.record_match(target, anchor);
                    if let Some(observer) = self.observer.as_mut() {
                        observer(&ProbeEvent::Match { target, anchor });
                    }
                }

                for step in outcome.ambiguous_steps() {
                    self.ambiguous += 1;
                    warn!(
                        "Ambiguous {} response for target #{} under anchor {}; treating as no match",
                        step, target, anchor
                    );
                    self.aggregator.record_ambiguous(target);
                    if let Some(observer) = self.observer.as_mut() {
                        observer(&ProbeEvent::Ambiguous {
                            target: Some(target),
                            anchor,
                            step,
                        });
                    }
                }

                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
            }

            self.anchors_completed += 1;
            self.emit(&ProbeEvent::AnchorFinished { anchor });
        }

        if let Some(reason) = &aborted {
            warn!("Run {}", reason);
            self.emit(&ProbeEvent::Aborted(reason.clone()));
        }

        if let Err(e) = self.oracle.close().await {
            warn!("Failed to close session: {}", e);
        }

        let stats = RunStats {
            round_trips: self.oracle.round_trips(),
            ambiguous: self.ambiguous,
            anchors_completed: self.anchors_completed,
            matches: self.aggregator.match_count(),
        };
        info!(
            "Resolved {} of {} targets in {} round trips",
            self.aggregator.resolved_targets(),
            self.targets.len(),
            stats.round_trips
        );
        self.aggregator
            .report(stats, aborted, self.banner.clone(), self.wildcard, started_at)
    }

    pub fn anchors(&self) -> &[Anchor] {
        &self.anchors
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    pub fn round_trips(&self) -> u64 {
        self.oracle.round_trips()
    }

    pub fn transport(&self) -> &T {
        self.oracle.transport()
    }

    fn emit(&mut self, event: &ProbeEvent) {
        if let Some(observer) = self.observer.as_mut() {
            observer(event);
        }
    }

    fn abort_reason(failure: StepFailure, anchor: Anchor, target: Option<usize>) -> AbortReason {
        AbortReason {
            step: failure.step,
            anchor: Some(anchor.position),
            target,
            message: failure.source.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockFault, MockInterpreter};
    use crate::types::Slot;
    use std::sync::{Arc, Mutex};

    fn scenario_config(lo: usize, hi: usize) -> ProbeConfig {
        ProbeConfig::builder("127.0.0.1", 1337)
            .prefix("infobahn{")
            .anchor_order(vec![1, 2, 3, 4, 5, 6, 7, 9])
            .targets(lo, hi)
            .delay(Duration::ZERO)
            .build()
            .unwrap()
    }

    /// 1-based send index of `step` for `target` under the anchor at `anchor_index`.
    fn send_index(anchor_index: usize, targets: TargetRange, target: usize, step: ProbeStep) -> usize {
        let per_anchor = 1 + 3 * targets.len();
        let within = match step {
            ProbeStep::Subtract => 1,
            ProbeStep::Probe => 2,
            ProbeStep::Reset => 3,
            _ => unreachable!(),
        };
        anchor_index * per_anchor + 1 + 3 * (target - targets.lo) + within
    }

    #[tokio::test]
    async fn test_scenario_a() {
        // Position 11 is 'n', 10 and 12 match no anchor
        let mock = MockInterpreter::new("infobahn{XnZ");
        let config = scenario_config(10, 12);
        let mut probe = AnchorProbe::new(&config, mock).unwrap();

        let report = probe.run().await;
        assert!(report.is_complete());

        let agg = probe.aggregator();
        assert_eq!(agg.cluster(11), &[Anchor::new(2, 'n')]);
        assert!(agg.cluster(10).is_empty());
        assert!(agg.cluster(12).is_empty());
        assert_eq!(report.template.get(11), Some(Slot::Resolved('n')));
        assert_eq!(report.template.get(10), Some(Slot::Wildcard));
        assert_eq!(report.template.get(12), Some(Slot::Wildcard));
        assert_eq!(report.rendered, "infobahn{?n?");
    }

    #[tokio::test]
    async fn test_round_trip_count_matches_cost_model() {
        let mock = MockInterpreter::new("infobahn{abcdef");
        let config = scenario_config(10, 15);
        let mut probe = AnchorProbe::new(&config, mock).unwrap();

        let report = probe.run().await;
        let expected = 8 * (1 + 3 * 6);
        assert_eq!(report.stats.round_trips, expected);
        assert_eq!(probe.transport().sent().len() as u64, expected);
        assert_eq!(config.estimated_round_trips().unwrap(), expected);
        assert_eq!(report.stats.anchors_completed, 8);
        assert!(probe.transport().is_closed());
    }

    #[tokio::test]
    async fn test_probe_is_three_round_trips_and_restores_baseline() {
        let mock = MockInterpreter::new("infobahn{ni");
        let config = scenario_config(10, 11);
        let mut probe = AnchorProbe::new(&config, mock).unwrap();
        let anchor = Anchor::new(2, 'n');

        probe.establish_baseline(anchor).await.unwrap();
        let before = probe.transport().shared_value();
        let trips = probe.round_trips();

        let first = probe.probe(anchor, 10).await.unwrap();
        assert_eq!(probe.round_trips() - trips, 3);
        assert_eq!(probe.transport().shared_value(), before);

        // Idempotent against a deterministic remote
        let second = probe.probe(anchor, 10).await.unwrap();
        assert_eq!(first, second);
        assert!(first.is_match());
        assert_eq!(probe.transport().shared_value(), before);

        let other = probe.probe(anchor, 11).await.unwrap();
        assert!(!other.is_match());
        assert_eq!(probe.transport().shared_value(), before);
    }

    #[tokio::test]
    async fn test_expression_sequence() {
        let mock = MockInterpreter::new("infobahn{x");
        let config = ProbeConfig::builder("h", 1)
            .prefix("inf")
            .targets(4, 5)
            .delay(Duration::ZERO)
            .build()
            .unwrap();
        let mut probe = AnchorProbe::new(&config, mock).unwrap();
        probe.run().await;

        let sent = probe.transport().sent();
        assert_eq!(
            &sent[..7],
            &["b", "a-bbbb", "b/a", "b", "a-bbbbb", "b/a", "b"]
        );
        assert!(sent.iter().all(|s| !s.contains(char::is_whitespace)));
    }

    #[tokio::test]
    async fn test_duplicate_symbols_resolve_to_first_anchor() {
        // Anchors #2 and #8 are both 'n'; #8 comes first in iteration order
        let mock = MockInterpreter::new("infobahn{n");
        let config = ProbeConfig::builder("h", 1)
            .prefix("infobahn{")
            .anchor_order(vec![8, 1, 2])
            .targets(10, 10)
            .delay(Duration::ZERO)
            .build()
            .unwrap();
        let mut probe = AnchorProbe::new(&config, mock).unwrap();
        let report = probe.run().await;

        let positions: Vec<usize> = probe.aggregator().cluster(10).iter().map(|a| a.position).collect();
        assert_eq!(positions, vec![8, 2]);
        assert_eq!(report.diagnostics[0].resolved, Some('n'));
        assert_eq!(report.diagnostics[0].cluster[0], Anchor::new(8, 'n'));
    }

    #[tokio::test]
    async fn test_scenario_b_timeout_during_probe_continues() {
        // Target 11 equals anchor #1 ('i'); its probe response is lost.
        let targets = TargetRange::new(10, 12);
        let mock = MockInterpreter::new("infobahn{aib").with_fault(
            send_index(0, targets, 11, ProbeStep::Probe),
            MockFault::Timeout,
        );
        let config = scenario_config(10, 12);
        let mut probe = AnchorProbe::new(&config, mock).unwrap();

        let report = probe.run().await;
        assert!(report.is_complete());
        assert!(probe.aggregator().cluster(11).is_empty());
        // Later targets are still resolved
        assert_eq!(probe.aggregator().cluster(10), &[Anchor::new(6, 'a')]);
        assert_eq!(probe.aggregator().cluster(12), &[Anchor::new(5, 'b')]);
        assert_eq!(report.stats.ambiguous, 1);
        assert!(report.diagnostics[1].needs_retry);
        assert_eq!(report.stats.round_trips, 8 * (1 + 3 * 3));

        // The reset still ran right after the lost probe
        let reset = send_index(0, targets, 11, ProbeStep::Reset);
        assert_eq!(probe.transport().sent()[reset - 1], "b");
    }

    #[tokio::test]
    async fn test_scenario_c_transport_error_keeps_progress() {
        // 14 targets (11..=24) equal 'i' and resolve under anchor #1; anchor
        // #2 then dies while resetting after target 25.
        let secret = format!("infobahn{{x{}nnnn", "i".repeat(14));
        let targets = TargetRange::new(10, 28);
        let mock = MockInterpreter::new(&secret).with_fault(
            send_index(1, targets, 25, ProbeStep::Reset),
            MockFault::BrokenPipe,
        );
        let config = ProbeConfig::builder("h", 1)
            .prefix("infobahn{")
            .anchor_order(vec![1, 2])
            .targets(10, 28)
            .delay(Duration::ZERO)
            .build()
            .unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let mut probe = AnchorProbe::new(&config, mock)
            .unwrap()
            .with_observer(move |e| sink.lock().unwrap().push(e.clone()));

        let report = probe.run().await;
        let reason = report.aborted.clone().expect("run should abort");
        assert_eq!(reason.step, ProbeStep::Reset);
        assert_eq!(reason.anchor, Some(2));
        assert_eq!(reason.target, Some(25));

        assert_eq!(report.template.resolved_count(), 15);
        for position in 11..=24 {
            assert_eq!(report.template.get(position), Some(Slot::Resolved('i')));
        }
        // Matched by the probe before the failing reset
        assert_eq!(report.template.get(25), Some(Slot::Resolved('n')));
        assert_eq!(report.template.get(26), Some(Slot::Wildcard));
        assert_eq!(report.stats.anchors_completed, 1);
        // The failed reset write never reached the service
        let failed_send = send_index(1, targets, 25, ProbeStep::Reset) as u64;
        assert_eq!(report.stats.round_trips, failed_send - 1);
        assert!(probe.transport().is_closed());

        let events = events.lock().unwrap();
        assert!(matches!(events.last(), Some(ProbeEvent::Aborted(_))));
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, ProbeEvent::Match { .. }))
                .count(),
            15
        );
    }

    #[tokio::test]
    async fn test_baseline_failure_aborts_without_target() {
        let mock = MockInterpreter::new("infobahn{x").with_fault(1, MockFault::BrokenPipe);
        let config = scenario_config(10, 10);
        let mut probe = AnchorProbe::new(&config, mock).unwrap();

        let report = probe.run().await;
        let reason = report.aborted.unwrap();
        assert_eq!(reason.step, ProbeStep::Baseline);
        assert_eq!(reason.target, None);
        assert_eq!(report.rendered, "infobahn{?");
    }

    #[tokio::test]
    async fn test_banner_is_captured() {
        let mock = MockInterpreter::new("infobahn{x").with_banner("Welcome to the calculator\n");
        let config = scenario_config(10, 10);
        let mut probe = AnchorProbe::new(&config, mock).unwrap();

        let banner = probe.read_banner(Duration::from_millis(10)).await.unwrap();
        assert_eq!(banner.as_deref(), Some("Welcome to the calculator"));
        let report = probe.run().await;
        assert_eq!(report.banner.as_deref(), Some("Welcome to the calculator"));
    }

    #[test]
    fn test_overlapping_config_rejected_before_run() {
        let mut config = scenario_config(10, 12);
        config.known.insert(10, 'i');
        config.anchor_order.push(10);
        let result = AnchorProbe::new(&config, MockInterpreter::new("x"));
        assert!(matches!(
            result,
            Err(ProbeError::InvalidConfiguration { .. })
        ));
    }
}
