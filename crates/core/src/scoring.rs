use chrono::{DateTime, Utc};
use overseer_shared::{LiveSignal, SimMetrics};
use serde::{Deserialize, Serialize};

use crate::config::ScoringConfig;
use crate::live::{Evidence, SignalPolicy};

/// Weights of the scalar ranking score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub objective: f64,
    pub progress: f64,
    pub stability: f64,
}

impl ScoreWeights {
    #[must_use]
    pub fn total(&self) -> f64 {
        self.objective + self.progress + self.stability
    }

    #[must_use]
    pub fn score(&self, m: &SimMetrics) -> f64 {
        self.objective * m.objective_rate
            + self.progress * m.progress_rate
            + self.stability * m.stability_rate
    }
}

/// Weights in effect for one generation, with the bias that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightProfile {
    pub weights: ScoreWeights,
    pub pressure: Option<f64>,
    pub bias: f64,
}

/// Weighted-sum scorer with optional objective bias.
#[derive(Debug, Clone)]
pub struct Scorer {
    base: ScoreWeights,
    bias_strength: f64,
}

impl Scorer {
    #[must_use]
    pub fn new(config: &ScoringConfig) -> Self {
        Self {
            base: ScoreWeights {
                objective: config.objective_weight,
                progress: config.progress_weight,
                stability: config.stability_weight,
            },
            bias_strength: config.objective_bias_strength,
        }
    }

    #[must_use]
    pub fn base_weights(&self) -> ScoreWeights {
        self.base
    }

    /// Shifts weight toward the objective when the live signal reports little
    /// progress. The total weight is preserved. Only signals that `policy`
    /// accepts as fresh evidence apply pressure.
    #[must_use]
    pub fn profile(
        &self,
        signal: Option<&LiveSignal>,
        policy: &SignalPolicy,
        now: DateTime<Utc>,
    ) -> WeightProfile {
        let pressure = signal
            .filter(|s| matches!(policy.assess(Some(s), None, now), Evidence::Fresh(_)))
            .and_then(|s| s.progress_ratio)
            .filter(|r| r.is_finite())
            .map(|r| 1.0 - r.clamp(0.0, 1.0));

        let Some(p) = pressure else {
            return WeightProfile {
                weights: self.base,
                pressure: None,
                bias: 0.0,
            };
        };

        let bias = (self.bias_strength * p).clamp(0.0, 2.0);
        let mut w = ScoreWeights {
            objective: self.base.objective * (1.0 + bias),
            progress: self.base.progress * (1.0 - 0.55 * bias).max(0.35),
            stability: self.base.stability * (1.0 - 0.40 * bias).max(0.35),
        };
        let (base_total, new_total) = (self.base.total(), w.total());
        if new_total > 0.0 && base_total > 0.0 {
            let scale = base_total / new_total;
            w.objective *= scale;
            w.progress *= scale;
            w.stability *= scale;
        }

        WeightProfile {
            weights: w,
            pressure: Some(p),
            bias,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn metrics(objective: f64, progress: f64, stability: f64) -> SimMetrics {
        SimMetrics {
            episodes: 10,
            objective_rate: objective,
            progress_rate: progress,
            stability_rate: stability,
            mean_elapsed_s: 900.0,
            variance: 0.0,
        }
    }

    fn signal(progress_ratio: f64) -> LiveSignal {
        LiveSignal {
            generated_at: Utc::now(),
            blocked: false,
            reason: None,
            objective_hint: 0.5,
            stability_hint: 0.8,
            confidence: 0.9,
            source: None,
            stale: false,
            progress_ratio: Some(progress_ratio),
        }
    }

    fn policy() -> SignalPolicy {
        SignalPolicy {
            max_age: ChronoDuration::seconds(20),
            min_confidence: 0.35,
        }
    }

    fn scorer(strength: f64) -> Scorer {
        Scorer::new(&ScoringConfig {
            objective_weight: 0.60,
            progress_weight: 0.25,
            stability_weight: 0.15,
            objective_bias_strength: strength,
        })
    }

    #[test]
    fn test_weighted_sum() {
        let s = scorer(0.0).base_weights().score(&metrics(0.5, 0.4, 0.8));
        assert!((s - (0.30 + 0.10 + 0.12)).abs() < 1e-9);
    }

    #[test]
    fn test_zero_strength_leaves_weights_alone() {
        let profile = scorer(0.0).profile(Some(&signal(0.1)), &policy(), Utc::now());
        assert_eq!(profile.weights, scorer(0.0).base_weights());
        assert!((profile.bias).abs() < 1e-12);
    }

    #[test]
    fn test_bias_shifts_toward_objective_and_keeps_total() {
        let sc = scorer(1.0);
        let profile = sc.profile(Some(&signal(0.0)), &policy(), Utc::now());
        assert!((profile.bias - 1.0).abs() < 1e-9);
        assert!(profile.weights.objective > sc.base_weights().objective);
        assert!(profile.weights.progress < sc.base_weights().progress);
        assert!((profile.weights.total() - sc.base_weights().total()).abs() < 1e-9);
    }

    #[test]
    fn test_stale_signal_is_ignored() {
        let mut s = signal(0.0);
        s.stale = true;
        let profile = scorer(1.0).profile(Some(&s), &policy(), Utc::now());
        assert!(profile.pressure.is_none());
        assert_eq!(profile.weights, scorer(1.0).base_weights());
    }

    #[test]
    fn test_old_or_unconfident_signal_is_ignored() {
        let sc = scorer(1.0);
        let now = Utc::now();

        let mut old = signal(0.0);
        old.generated_at = now - ChronoDuration::hours(6);
        let profile = sc.profile(Some(&old), &policy(), now);
        assert!(profile.pressure.is_none());

        let mut unsure = signal(0.0);
        unsure.confidence = 0.05;
        let profile = sc.profile(Some(&unsure), &policy(), now);
        assert!(profile.pressure.is_none());
        assert_eq!(profile.weights, sc.base_weights());
    }
}
