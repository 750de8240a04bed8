use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{error, warn};

use crate::checkpoint::Checkpoint;
use crate::config::{SafetyConfig, DEFAULT_BACKOFF_SECONDS, MAX_CRASH_LOOP_WINDOW_MINUTES};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    EvaluationError,
    PersistenceError,
    CanaryTimeout,
    InvalidTransition,
    LoopError,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::EvaluationError => "evaluation_error",
            Self::PersistenceError => "persistence_error",
            Self::CanaryTimeout => "canary_timeout",
            Self::InvalidTransition => "invalid_transition",
            Self::LoopError => "loop_error",
        };
        f.write_str(s)
    }
}

/// Failure timestamps per kind. Persisted in the checkpoint so a restart
/// does not reset the crash-loop window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FailureCounters(BTreeMap<FailureKind, Vec<DateTime<Utc>>>);

impl FailureCounters {
    pub fn record(&mut self, kind: FailureKind, at: DateTime<Utc>) {
        self.0.entry(kind).or_default().push(at);
    }

    #[must_use]
    pub fn count_since(&self, kind: FailureKind, since: DateTime<Utc>) -> usize {
        self.0
            .get(&kind)
            .map_or(0, |ts| ts.iter().filter(|t| **t >= since).count())
    }

    #[must_use]
    pub fn counts_since(&self, since: DateTime<Utc>) -> BTreeMap<FailureKind, usize> {
        self.0
            .keys()
            .map(|kind| (*kind, self.count_since(*kind, since)))
            .filter(|(_, n)| *n > 0)
            .collect()
    }

    #[must_use]
    pub fn total_since(&self, since: DateTime<Utc>) -> usize {
        self.0.keys().map(|kind| self.count_since(*kind, since)).sum()
    }

    /// Drops timestamps older than `cutoff`.
    pub fn prune(&mut self, cutoff: DateTime<Utc>) {
        for ts in self.0.values_mut() {
            ts.retain(|t| *t >= cutoff);
        }
        self.0.retain(|_, ts| !ts.is_empty());
    }
}

/// An action that reverts live-affecting state.
#[derive(Debug, Clone, PartialEq)]
pub enum DestructiveAction {
    /// Re-expose the incumbent after a live canary was rolled back.
    RevertLiveCanary { candidate: String, incumbent: String },
}

impl DestructiveAction {
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::RevertLiveCanary {
                candidate,
                incumbent,
            } => format!(
                "revert live policy from canary {} to incumbent {}",
                candidate, incumbent
            ),
        }
    }
}

/// Crash-loop circuit breaker.
///
/// All state lives in the checkpoint it is handed; the breaker itself only holds
/// thresholds, so it survives restarts without special handling.
#[derive(Debug, Clone)]
pub struct SafetyBreaker {
    limit: u32,
    window: ChronoDuration,
    backoff_seconds: Vec<u64>,
    require_armed: bool,
    allow_destructive: bool,
}

impl SafetyBreaker {
    #[must_use]
    pub fn new(config: &SafetyConfig) -> Self {
        Self {
            limit: config.crash_loop_limit.max(1),
            window: ChronoDuration::minutes(
                config
                    .crash_loop_window_minutes
                    .clamp(1, MAX_CRASH_LOOP_WINDOW_MINUTES),
            ),
            backoff_seconds: config.backoff_seconds.clone(),
            require_armed: config.require_armed_safety,
            allow_destructive: config.allow_destructive_actions,
        }
    }

    #[must_use]
    pub fn window(&self) -> ChronoDuration {
        self.window
    }

    /// Records a failure and trips the breaker when the kind reaches the
    /// crash-loop limit inside the window. Returns the trip reason.
    pub fn record_failure(
        &self,
        checkpoint: &mut Checkpoint,
        kind: FailureKind,
        now: DateTime<Utc>,
    ) -> Option<String> {
        checkpoint.failure_counters.prune(now - self.window);
        checkpoint.failure_counters.record(kind, now);
        warn!(kind = %kind, "Failure recorded");

        let (kind, count) = self.crash_loop_triggered(&checkpoint.failure_counters, now)?;
        let reason = format!(
            "crash loop: {} {} failures within {} minutes (limit {})",
            count,
            kind,
            self.window.num_minutes(),
            self.limit
        );
        self.trip(checkpoint, &reason);
        Some(reason)
    }

    /// The first failure kind at or over the limit inside the window.
    #[must_use]
    pub fn crash_loop_triggered(
        &self,
        counters: &FailureCounters,
        now: DateTime<Utc>,
    ) -> Option<(FailureKind, usize)> {
        counters
            .counts_since(now - self.window)
            .into_iter()
            .find(|(_, n)| *n >= self.limit as usize)
    }

    /// Total failures inside the window, reported as `recoveries_30m` in health.
    #[must_use]
    pub fn recoveries(&self, counters: &FailureCounters, now: DateTime<Utc>) -> usize {
        counters.total_since(now - self.window)
    }

    /// Checks a destructive action against the armed-safety policy.
    /// Returns the pause reason when the action must not proceed.
    #[must_use]
    pub fn gate_destructive(&self, action: &DestructiveAction) -> Option<String> {
        if self.require_armed && !self.allow_destructive {
            Some(format!(
                "destructive action requires operator approval: {}",
                action.describe()
            ))
        } else {
            None
        }
    }

    /// Sets safe-pause. An existing reason is kept so the first cause stays visible.
    pub fn trip(&self, checkpoint: &mut Checkpoint, reason: &str) {
        if checkpoint.safe_pause {
            warn!(reason = %reason, "Safety breaker tripped while already paused");
            return;
        }
        error!(reason = %reason, "🛑 Safety breaker tripped");
        checkpoint.safe_pause = true;
        checkpoint.safe_pause_reason = Some(reason.to_string());
    }

    /// Clears safe-pause. Failure counters are left untouched.
    pub fn resume(checkpoint: &mut Checkpoint) {
        checkpoint.safe_pause = false;
        checkpoint.safe_pause_reason = None;
    }

    /// Sleep after the n-th consecutive generation error (1-based).
    #[must_use]
    pub fn backoff_for(&self, consecutive_errors: u32) -> Duration {
        let schedule: &[u64] = if self.backoff_seconds.is_empty() {
            &DEFAULT_BACKOFF_SECONDS
        } else {
            &self.backoff_seconds
        };
        let idx = (consecutive_errors.max(1) as usize - 1).min(schedule.len() - 1);
        Duration::from_secs(schedule[idx])
    }
}
