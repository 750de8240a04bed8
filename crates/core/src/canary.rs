use chrono::{DateTime, Duration as ChronoDuration, Utc};
use overseer_shared::LiveMetrics;
use serde::{Deserialize, Serialize};

use crate::config::{CanaryConfig, MAX_CANARY_DURATION_SECS};

/// Small slack so that a gain equal to the threshold is not lost to float rounding.
const EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Promote,
    Rollback,
    Extend,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Promote => "promote",
            Self::Rollback => "rollback",
            Self::Extend => "extend",
        };
        f.write_str(s)
    }
}

/// Objective and stability rates compared by the guardrail.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rates {
    pub objective: f64,
    pub stability: f64,
}

impl From<&LiveMetrics> for Rates {
    fn from(m: &LiveMetrics) -> Self {
        Self {
            objective: m.objective_rate,
            stability: m.stability_rate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Guardrail {
    pub improvement_threshold: f64,
    pub stability_tolerance: f64,
}

impl Guardrail {
    /// Stability regression beyond tolerance rolls back whatever the objective gain.
    /// Otherwise promote iff the objective gain reaches the threshold.
    #[must_use]
    pub fn decide(&self, baseline: Rates, candidate: Rates) -> Verdict {
        if candidate.stability + self.stability_tolerance + EPSILON < baseline.stability {
            return Verdict::Rollback;
        }
        if candidate.objective - baseline.objective + EPSILON >= self.improvement_threshold {
            return Verdict::Promote;
        }
        Verdict::Extend
    }
}

/// Persisted state of an in-flight canary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanaryRun {
    pub policy_id: String,
    pub incumbent_id: String,
    pub started_at: DateTime<Utc>,
    /// When the candidate was made active in the live environment (live mode only).
    pub exposed_at: Option<DateTime<Utc>>,
    pub baseline: Option<LiveMetrics>,
    /// Windows that produced usable evidence.
    pub windows_observed: u32,
    /// All windows, including those with insufficient evidence.
    pub windows_elapsed: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateDecision {
    pub verdict: Verdict,
    pub reason: String,
    /// Set when the rollback is the implicit one for exceeding the canary limits.
    pub timed_out: bool,
    pub improvement: Option<f64>,
    pub stability_regression: Option<f64>,
}

/// `idle -> canary_running -> {promote, rollback, extend}`
#[derive(Debug, Clone)]
pub struct CanaryGate {
    guardrail: Guardrail,
    min_windows: u32,
    max_windows: u32,
    max_duration: ChronoDuration,
}

impl CanaryGate {
    #[must_use]
    pub fn new(config: &CanaryConfig) -> Self {
        Self {
            guardrail: Guardrail {
                improvement_threshold: config.improvement_threshold,
                stability_tolerance: config.stability_tolerance,
            },
            min_windows: config.min_windows.max(1),
            max_windows: config.max_windows.max(1),
            max_duration: ChronoDuration::seconds(
                i64::try_from(config.max_duration_secs.clamp(1, MAX_CANARY_DURATION_SECS))
                    .unwrap_or(1),
            ),
        }
    }

    #[must_use]
    pub fn guardrail(&self) -> Guardrail {
        self.guardrail
    }

    #[must_use]
    pub fn begin(
        &self,
        policy_id: &str,
        incumbent_id: &str,
        baseline: Option<LiveMetrics>,
        now: DateTime<Utc>,
    ) -> CanaryRun {
        CanaryRun {
            policy_id: policy_id.to_string(),
            incumbent_id: incumbent_id.to_string(),
            started_at: now,
            exposed_at: None,
            baseline,
            windows_observed: 0,
            windows_elapsed: 0,
        }
    }

    /// Closes one observation window.
    ///
    /// `candidate` is the candidate's accumulated live metrics; `fresh` says
    /// whether this window contributed usable evidence to them.
    pub fn evaluate(
        &self,
        run: &mut CanaryRun,
        candidate: Option<&LiveMetrics>,
        fresh: bool,
        now: DateTime<Utc>,
    ) -> GateDecision {
        run.windows_elapsed = run.windows_elapsed.saturating_add(1);
        if fresh {
            run.windows_observed = run.windows_observed.saturating_add(1);
        }

        let mut improvement = None;
        let mut regression = None;

        let reason = match (run.baseline.as_ref(), candidate) {
            (Some(base), Some(cand)) if run.windows_observed >= self.min_windows => {
                let (b, c) = (Rates::from(base), Rates::from(cand));
                improvement = Some(c.objective - b.objective);
                regression = Some((b.stability - c.stability).max(0.0));
                let detail = format!(
                    "objective {:+.4} (need {:.4}), stability regression {:.4} (tolerance {:.4})",
                    c.objective - b.objective,
                    self.guardrail.improvement_threshold,
                    (b.stability - c.stability).max(0.0),
                    self.guardrail.stability_tolerance
                );
                let verdict = self.guardrail.decide(b, c);
                if verdict != Verdict::Extend {
                    return GateDecision {
                        verdict,
                        reason: detail,
                        timed_out: false,
                        improvement,
                        stability_regression: regression,
                    };
                }
                format!("inconclusive: {}", detail)
            }
            (None, _) => "insufficient evidence: no baseline".to_string(),
            (Some(_), None) => "insufficient evidence: no candidate metrics".to_string(),
            (Some(_), Some(_)) => format!(
                "insufficient evidence: {}/{} windows observed",
                run.windows_observed, self.min_windows
            ),
        };

        let elapsed = now - run.started_at;
        if elapsed >= self.max_duration || run.windows_elapsed >= self.max_windows {
            return GateDecision {
                verdict: Verdict::Rollback,
                reason: format!(
                    "canary timeout after {} windows / {}s without verdict ({})",
                    run.windows_elapsed,
                    elapsed.num_seconds(),
                    reason
                ),
                timed_out: true,
                improvement,
                stability_regression: regression,
            };
        }

        GateDecision {
            verdict: Verdict::Extend,
            reason,
            timed_out: false,
            improvement,
            stability_regression: regression,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn live(objective: f64, stability: f64) -> LiveMetrics {
        LiveMetrics {
            objective_rate: objective,
            stability_rate: stability,
            confidence: 1.0,
            windows: 1,
            updated_at: Utc::now(),
        }
    }

    fn guardrail() -> Guardrail {
        Guardrail {
            improvement_threshold: 0.05,
            stability_tolerance: 0.02,
        }
    }

    #[test]
    fn test_promotes_on_gain_without_regression() {
        let v = guardrail().decide(
            Rates { objective: 0.50, stability: 0.90 },
            Rates { objective: 0.58, stability: 0.91 },
        );
        assert_eq!(v, Verdict::Promote);
    }

    #[test]
    fn test_rolls_back_on_stability_regression_despite_gain() {
        let v = guardrail().decide(
            Rates { objective: 0.50, stability: 0.90 },
            Rates { objective: 0.60, stability: 0.80 },
        );
        assert_eq!(v, Verdict::Rollback);
    }

    #[test]
    fn test_threshold_boundaries_are_inclusive() {
        let g = guardrail();
        assert_eq!(
            g.decide(
                Rates { objective: 0.50, stability: 0.90 },
                Rates { objective: 0.55, stability: 0.88 },
            ),
            Verdict::Promote
        );
        assert_eq!(
            g.decide(
                Rates { objective: 0.50, stability: 0.90 },
                Rates { objective: 0.52, stability: 0.90 },
            ),
            Verdict::Extend
        );
    }

    fn gate() -> CanaryGate {
        let mut cfg = AppConfig::default().canary;
        cfg.improvement_threshold = 0.05;
        cfg.stability_tolerance = 0.02;
        cfg.min_windows = 1;
        cfg.max_windows = 3;
        cfg.max_duration_secs = 600;
        CanaryGate::new(&cfg)
    }

    #[test]
    fn test_missing_evidence_extends_then_times_out() {
        let gate = gate();
        let now = Utc::now();
        let mut run = gate.begin("cand", "inc", Some(live(0.5, 0.9)), now);

        let d1 = gate.evaluate(&mut run, None, false, now);
        assert_eq!(d1.verdict, Verdict::Extend);
        let d2 = gate.evaluate(&mut run, None, false, now);
        assert_eq!(d2.verdict, Verdict::Extend);
        let d3 = gate.evaluate(&mut run, None, false, now);
        assert_eq!(d3.verdict, Verdict::Rollback);
        assert!(d3.timed_out);
        assert_eq!(run.windows_elapsed, 3);
        assert_eq!(run.windows_observed, 0);
    }

    #[test]
    fn test_duration_limit_rolls_back() {
        let gate = gate();
        let start = Utc::now();
        let mut run = gate.begin("cand", "inc", Some(live(0.5, 0.9)), start);
        let cand = live(0.51, 0.9);
        let d = gate.evaluate(&mut run, Some(&cand), true, start + ChronoDuration::seconds(601));
        assert_eq!(d.verdict, Verdict::Rollback);
        assert!(d.timed_out);
    }

    #[test]
    fn test_huge_duration_limit_does_not_overflow() {
        let mut cfg = AppConfig::default().canary;
        cfg.max_duration_secs = u64::MAX;
        let gate = CanaryGate::new(&cfg);
        let start = Utc::now();
        let mut run = gate.begin("cand", "inc", None, start);
        let d = gate.evaluate(&mut run, None, false, start + ChronoDuration::seconds(1));
        assert!(!d.timed_out);
    }

    #[test]
    fn test_verdict_reached_inside_window() {
        let gate = gate();
        let now = Utc::now();
        let mut run = gate.begin("cand", "inc", Some(live(0.5, 0.9)), now);
        let d = gate.evaluate(&mut run, Some(&live(0.58, 0.91)), true, now);
        assert_eq!(d.verdict, Verdict::Promote);
        assert!(!d.timed_out);
        assert!((d.improvement.unwrap() - 0.08).abs() < 1e-9);
    }

    #[test]
    fn test_no_baseline_is_insufficient_evidence() {
        let gate = gate();
        let now = Utc::now();
        let mut run = gate.begin("cand", "inc", None, now);
        let d = gate.evaluate(&mut run, Some(&live(0.9, 0.99)), true, now);
        assert_eq!(d.verdict, Verdict::Extend);
        assert!(d.reason.contains("no baseline"));
    }
}
