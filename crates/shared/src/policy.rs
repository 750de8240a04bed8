use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identifier of the policy seeded on a cold start.
pub const BASELINE_POLICY_ID: &str = "baseline-v1";

/// Lifecycle of a policy record.
///
/// States only advance: `proposed -> simulated -> canary -> {promoted | rolled_back | rejected}`.
/// `rejected` is also reachable from `proposed` (evaluation failed) and `simulated`
/// (evicted from the population). A promoted policy becomes `superseded` when a
/// successor is promoted, so that at most one policy is `promoted` at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionState {
    Proposed,
    Simulated,
    Canary,
    Promoted,
    RolledBack,
    Rejected,
    Superseded,
}

impl PromotionState {
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use PromotionState::{Canary, Promoted, Proposed, Rejected, RolledBack, Simulated, Superseded};
        matches!(
            (self, next),
            (Proposed, Simulated | Rejected)
                | (Simulated, Canary | Rejected)
                | (Canary, Promoted | RolledBack | Rejected)
                | (Promoted, Superseded)
        )
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Promoted | Self::RolledBack | Self::Rejected | Self::Superseded
        )
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Proposed => "proposed",
            Self::Simulated => "simulated",
            Self::Canary => "canary",
            Self::Promoted => "promoted",
            Self::RolledBack => "rolled_back",
            Self::Rejected => "rejected",
            Self::Superseded => "superseded",
        }
    }
}

impl std::fmt::Display for PromotionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PromotionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "proposed" => Ok(Self::Proposed),
            "simulated" => Ok(Self::Simulated),
            "canary" => Ok(Self::Canary),
            "promoted" => Ok(Self::Promoted),
            "rolled_back" => Ok(Self::RolledBack),
            "rejected" => Ok(Self::Rejected),
            "superseded" => Ok(Self::Superseded),
            other => Err(format!("unknown promotion state '{}'", other)),
        }
    }
}

/// Terminal state applied through `finalize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalOutcome {
    Promoted,
    RolledBack,
    Rejected,
}

impl From<FinalOutcome> for PromotionState {
    fn from(outcome: FinalOutcome) -> Self {
        match outcome {
            FinalOutcome::Promoted => Self::Promoted,
            FinalOutcome::RolledBack => Self::RolledBack,
            FinalOutcome::Rejected => Self::Rejected,
        }
    }
}

/// Named numeric knobs of a control policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyParameters(BTreeMap<String, f64>);

impl PolicyParameters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        Self(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn set(&mut self, name: impl Into<String>, value: f64) {
        self.0.insert(name.into(), value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.0.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Range of a single knob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnobSpec {
    pub name: String,
    pub min: f64,
    pub max: f64,
}

impl KnobSpec {
    pub fn new(name: impl Into<String>, min: f64, max: f64) -> Self {
        Self {
            name: name.into(),
            min,
            max,
        }
    }
}

/// The set of knobs every policy must carry, with their ranges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnobSet {
    pub knobs: Vec<KnobSpec>,
}

impl Default for KnobSet {
    fn default() -> Self {
        Self {
            knobs: ["aggression", "greed", "safety", "focus"]
                .into_iter()
                .map(|name| KnobSpec::new(name, 0.0, 1.0))
                .collect(),
        }
    }
}

impl KnobSet {
    /// Parameters of the seed policy used when nothing has been promoted yet.
    #[must_use]
    pub fn baseline(&self) -> PolicyParameters {
        let defaults = [
            ("aggression", 0.55),
            ("greed", 0.52),
            ("safety", 0.63),
            ("focus", 0.60),
        ];
        PolicyParameters::from_pairs(self.knobs.iter().map(|k| {
            let seed = defaults
                .iter()
                .find(|(name, _)| *name == k.name)
                .map_or((k.min + k.max) / 2.0, |(_, v)| *v);
            (k.name.clone(), seed.clamp(k.min, k.max))
        }))
    }

    /// Checks that `params` carries exactly these knobs, each finite and in range.
    pub fn validate(&self, params: &PolicyParameters) -> Result<(), String> {
        for knob in &self.knobs {
            let value = params
                .get(&knob.name)
                .ok_or_else(|| format!("missing knob '{}'", knob.name))?;
            if !value.is_finite() {
                return Err(format!("knob '{}' is not finite", knob.name));
            }
            if value < knob.min || value > knob.max {
                return Err(format!(
                    "knob '{}' = {} outside [{}, {}]",
                    knob.name, value, knob.min, knob.max
                ));
            }
        }
        if let Some((name, _)) = params
            .iter()
            .find(|(name, _)| !self.knobs.iter().any(|k| &k.name == *name))
        {
            return Err(format!("unknown knob '{}'", name));
        }
        Ok(())
    }

    /// Clamps every known knob into its range.
    pub fn clamp(&self, params: &mut PolicyParameters) {
        for knob in &self.knobs {
            if let Some(v) = params.get(&knob.name) {
                let v = if v.is_finite() { v } else { knob.min };
                params.set(knob.name.clone(), v.clamp(knob.min, knob.max));
            }
        }
    }
}

/// Aggregate metrics of one simulated batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimMetrics {
    pub episodes: u32,
    pub objective_rate: f64,
    pub progress_rate: f64,
    pub stability_rate: f64,
    pub mean_elapsed_s: f64,
    /// Sample variance of the per-episode outcome.
    pub variance: f64,
}

/// One observation window of live (or shadow) behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LiveSample {
    pub objective_rate: f64,
    pub stability_rate: f64,
    pub confidence: f64,
}

/// Live metrics accumulated across canary observation windows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveMetrics {
    pub objective_rate: f64,
    pub stability_rate: f64,
    pub confidence: f64,
    pub windows: u32,
    pub updated_at: DateTime<Utc>,
}

impl LiveMetrics {
    #[must_use]
    pub fn from_sample(sample: &LiveSample, now: DateTime<Utc>) -> Self {
        Self {
            objective_rate: sample.objective_rate,
            stability_rate: sample.stability_rate,
            confidence: sample.confidence,
            windows: 1,
            updated_at: now,
        }
    }

    /// Folds a new window in with an exponentially weighted moving average.
    #[must_use]
    pub fn accumulate(&self, sample: &LiveSample, alpha: f64, now: DateTime<Utc>) -> Self {
        let alpha = alpha.clamp(0.0, 1.0);
        let ewma = |old: f64, new: f64| alpha * new + (1.0 - alpha) * old;
        Self {
            objective_rate: ewma(self.objective_rate, sample.objective_rate),
            stability_rate: ewma(self.stability_rate, sample.stability_rate),
            confidence: ewma(self.confidence, sample.confidence),
            windows: self.windows.saturating_add(1),
            updated_at: now,
        }
    }
}

/// A versioned policy record. Parameters never change after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub policy_id: String,
    pub parent_policy_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub parameters: PolicyParameters,
    pub sim_metrics: Option<SimMetrics>,
    pub live_metrics: Option<LiveMetrics>,
    pub promotion_state: PromotionState,
    pub score: Option<f64>,
}

/// Periodically refreshed record produced by the external live-signal collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveSignal {
    pub generated_at: DateTime<Utc>,
    #[serde(default)]
    pub blocked: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default, alias = "objective_rate")]
    pub objective_hint: f64,
    #[serde(default, alias = "stability_rate")]
    pub stability_hint: f64,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub stale: bool,
    #[serde(default)]
    pub progress_ratio: Option<f64>,
}

impl LiveSignal {
    #[must_use]
    pub fn sample(&self) -> LiveSample {
        LiveSample {
            objective_rate: self.objective_hint.clamp(0.0, 1.0),
            stability_rate: self.stability_hint.clamp(0.0, 1.0),
            confidence: self.confidence.clamp(0.0, 1.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_partial_order() {
        use PromotionState::*;
        assert!(Proposed.can_transition_to(Simulated));
        assert!(Simulated.can_transition_to(Canary));
        assert!(Canary.can_transition_to(Promoted));
        assert!(Canary.can_transition_to(RolledBack));
        assert!(Promoted.can_transition_to(Superseded));

        assert!(!Proposed.can_transition_to(Canary));
        assert!(!Simulated.can_transition_to(Promoted));
        assert!(!Promoted.can_transition_to(RolledBack));
        assert!(!RolledBack.can_transition_to(Canary));
        assert!(!Canary.can_transition_to(Canary));
    }

    #[test]
    fn test_state_string_round_trip() {
        for state in [
            PromotionState::Proposed,
            PromotionState::RolledBack,
            PromotionState::Superseded,
        ] {
            assert_eq!(state.as_str().parse::<PromotionState>().unwrap(), state);
        }
        assert!("bogus".parse::<PromotionState>().is_err());
    }

    #[test]
    fn test_knob_validation() {
        let knobs = KnobSet::default();
        let mut params = knobs.baseline();
        assert!(knobs.validate(&params).is_ok());

        params.set("aggression", 1.5);
        assert!(knobs.validate(&params).unwrap_err().contains("aggression"));

        let mut params = knobs.baseline();
        params.set("turbo", 0.5);
        assert!(knobs.validate(&params).unwrap_err().contains("unknown"));

        let mut params = knobs.baseline();
        params.set("focus", f64::NAN);
        knobs.clamp(&mut params);
        assert_eq!(params.get("focus"), Some(0.0));
    }

    #[test]
    fn test_live_metrics_ewma() {
        let now = Utc::now();
        let first = LiveMetrics::from_sample(
            &LiveSample {
                objective_rate: 0.4,
                stability_rate: 0.8,
                confidence: 1.0,
            },
            now,
        );
        let next = first.accumulate(
            &LiveSample {
                objective_rate: 0.8,
                stability_rate: 0.8,
                confidence: 1.0,
            },
            0.5,
            now,
        );
        assert!((next.objective_rate - 0.6).abs() < 1e-9);
        assert!((next.stability_rate - 0.8).abs() < 1e-9);
        assert_eq!(next.windows, 2);
    }

    #[test]
    fn test_live_signal_accepts_rate_aliases() {
        let signal: LiveSignal = serde_json::from_str(
            r#"{"generated_at":"2026-01-01T00:00:00Z","objective_rate":0.7,"stability_rate":0.9,"confidence":0.8}"#,
        )
        .unwrap();
        assert!((signal.objective_hint - 0.7).abs() < 1e-9);
        assert!(!signal.blocked);
        assert!(!signal.stale);
    }
}
