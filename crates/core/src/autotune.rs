//! Runtime autotuner: nudges worker count, episode budgets and loop sleep
//! toward a CPU usage band, one step per evaluation interval, inside fixed
//! bounds. Quality guardrails revert to the last knobs that ran cleanly.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, AutotuneConfig, AutotuneMode};
use crate::control::{DecisionKind, GenerationSummary};

const HISTORY_LEN: usize = 2400;
const QUALITY_WINDOW: usize = 300;
/// Trend guardrails need this many rows in the recent half.
const MIN_TREND_ROWS: usize = 40;
const EPISODE_STEP: u32 = 4;
const CANARY_QUALITY_STEP: u32 = 2;
const SLEEP_STEP_MS: u64 = 100;
pub const MIN_LOOP_SLEEP_MS: u64 = 200;
pub const MAX_LOOP_SLEEP_MS: u64 = 2000;
const MAX_CPU_USAGE: f64 = 1.5;

/// The knobs the autotuner owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeKnobs {
    pub max_parallel_workers: usize,
    pub batch_episodes: u32,
    pub canary_episodes: u32,
    pub loop_sleep_ms: u64,
}

impl RuntimeKnobs {
    #[must_use]
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_parallel_workers: config.runtime.max_parallel_workers,
            batch_episodes: config.sim.batch_episodes,
            canary_episodes: config.sim.canary_episodes,
            loop_sleep_ms: config.runtime.loop_sleep_ms,
        }
    }
}

/// Cumulative CPU seconds consumed by this process and its reaped children.
pub trait CpuClock: Send + Sync {
    /// `None` when the platform offers no reading.
    fn cpu_seconds(&self) -> Option<f64>;
}

/// Reads `/proc/self/stat` on Linux. Elsewhere usage is unknown and the
/// autotuner holds its CPU-driven moves.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessCpuClock;

/// USER_HZ, fixed at 100 by the Linux ABI for `/proc` tick counts.
#[cfg(target_os = "linux")]
const CLOCK_TICKS_PER_SEC: f64 = 100.0;

impl CpuClock for ProcessCpuClock {
    #[cfg(target_os = "linux")]
    fn cpu_seconds(&self) -> Option<f64> {
        let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
        parse_proc_stat_ticks(&stat).map(|ticks| ticks as f64 / CLOCK_TICKS_PER_SEC)
    }

    #[cfg(not(target_os = "linux"))]
    fn cpu_seconds(&self) -> Option<f64> {
        None
    }
}

/// Sum of utime, stime, cutime and cstime. The command name may contain
/// spaces, so fields are counted from the closing parenthesis.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_proc_stat_ticks(stat: &str) -> Option<u64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    // After the name: state is field 3; utime..cstime are fields 14..=17
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let mut total = 0u64;
    for field in fields.get(11..15)? {
        total = total.checked_add(field.parse::<i64>().ok()?.max(0) as u64)?;
    }
    Some(total)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutotuneAction {
    None,
    /// Shadow mode: the knobs differ but are not applied.
    Recommend,
    Apply,
    /// A guardrail restored the last safe knobs.
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutotuneDecision {
    pub ts: DateTime<Utc>,
    pub mode: AutotuneMode,
    pub action: AutotuneAction,
    pub reason: String,
    pub recommended: RuntimeKnobs,
    pub applied: Option<RuntimeKnobs>,
    pub guardrails: Vec<String>,
    pub cpu_usage: Option<f64>,
}

/// Published with health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutotuneStatus {
    pub mode: AutotuneMode,
    pub knobs: RuntimeKnobs,
    pub last_action: AutotuneAction,
    pub last_reason: Option<String>,
    pub last_decision_at: Option<DateTime<Utc>>,
    pub guardrails: Vec<String>,
    pub cpu_usage: Option<f64>,
    pub cooldown_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
struct HistoryRow {
    promoted: bool,
    improvement: f64,
    stability_regression: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct QualityHalf {
    count: usize,
    promotion_rate: f64,
    mean_improvement: f64,
    mean_stability_regression: f64,
}

impl QualityHalf {
    fn summarize(rows: &[HistoryRow]) -> Self {
        if rows.is_empty() {
            return Self::default();
        }
        let n = rows.len() as f64;
        Self {
            count: rows.len(),
            promotion_rate: rows.iter().filter(|r| r.promoted).count() as f64 / n,
            mean_improvement: rows.iter().map(|r| r.improvement).sum::<f64>() / n,
            mean_stability_regression: rows.iter().map(|r| r.stability_regression).sum::<f64>() / n,
        }
    }
}

pub struct RuntimeAutotuner {
    config: AutotuneConfig,
    clock: Arc<dyn CpuClock>,
    cpu_count: usize,
    knobs: RuntimeKnobs,
    last_safe: RuntimeKnobs,
    history: VecDeque<HistoryRow>,
    last_eval: DateTime<Utc>,
    last_cpu: Option<(DateTime<Utc>, f64)>,
    cpu_usage: Option<f64>,
    cooldown_until: Option<DateTime<Utc>>,
    last_decision: Option<AutotuneDecision>,
}

impl RuntimeAutotuner {
    #[must_use]
    pub fn new(
        config: AutotuneConfig,
        initial: RuntimeKnobs,
        clock: Arc<dyn CpuClock>,
        cpu_count: usize,
        now: DateTime<Utc>,
    ) -> Self {
        let last_cpu = clock.cpu_seconds().map(|secs| (now, secs));
        Self {
            config,
            clock,
            cpu_count: cpu_count.max(1),
            knobs: initial,
            last_safe: initial,
            history: VecDeque::with_capacity(HISTORY_LEN),
            last_eval: now,
            last_cpu,
            cpu_usage: None,
            cooldown_until: None,
            last_decision: None,
        }
    }

    /// Process clock, one core count from the host.
    #[must_use]
    pub fn for_process(config: &AppConfig, now: DateTime<Utc>) -> Self {
        let cpus = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        Self::new(
            config.autotune.clone(),
            RuntimeKnobs::from_config(config),
            Arc::new(ProcessCpuClock),
            cpus,
            now,
        )
    }

    /// Knobs currently in force. Only enforce mode ever changes them.
    #[must_use]
    pub fn knobs(&self) -> RuntimeKnobs {
        self.knobs
    }

    #[must_use]
    pub fn status(&self) -> AutotuneStatus {
        let last = self.last_decision.as_ref();
        AutotuneStatus {
            mode: self.config.mode,
            knobs: self.knobs,
            last_action: last.map_or(AutotuneAction::None, |d| d.action),
            last_reason: last.map(|d| d.reason.clone()),
            last_decision_at: last.map(|d| d.ts),
            guardrails: last.map(|d| d.guardrails.clone()).unwrap_or_default(),
            cpu_usage: self.cpu_usage,
            cooldown_until: self.cooldown_until,
        }
    }

    /// Records one finished generation. Returns a decision when an
    /// evaluation interval has elapsed.
    pub fn observe_generation(
        &mut self,
        summary: &GenerationSummary,
        recoveries: usize,
        now: DateTime<Utc>,
    ) -> Option<AutotuneDecision> {
        self.refresh_cpu(now);
        self.record(summary);

        if self.config.mode == AutotuneMode::Off {
            return None;
        }
        let interval = ChronoDuration::seconds(i64::try_from(self.config.interval_secs).unwrap_or(i64::MAX / 1000));
        if now - self.last_eval < interval {
            return None;
        }
        self.last_eval = now;
        let decision = self.evaluate(recoveries, now);
        self.last_decision = Some(decision.clone());
        Some(decision)
    }

    fn refresh_cpu(&mut self, now: DateTime<Utc>) {
        let Some(total) = self.clock.cpu_seconds() else {
            self.cpu_usage = None;
            return;
        };
        if let Some((at, prev)) = self.last_cpu {
            let wall = (now - at).num_milliseconds() as f64 / 1000.0;
            if wall > 0.0 {
                let usage = (total - prev).max(0.0) / (wall * self.cpu_count as f64);
                self.cpu_usage = Some(usage.clamp(0.0, MAX_CPU_USAGE));
            }
        }
        self.last_cpu = Some((now, total));
    }

    fn record(&mut self, summary: &GenerationSummary) {
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(HistoryRow {
            promoted: summary.decision.kind == DecisionKind::Promote,
            improvement: summary.decision.improvement.unwrap_or(0.0),
            stability_regression: summary.decision.stability_regression.unwrap_or(0.0),
        });
    }

    /// Previous and recent halves of the quality window.
    fn quality(&self) -> (QualityHalf, QualityHalf) {
        let skip = self.history.len().saturating_sub(QUALITY_WINDOW);
        let rows: Vec<HistoryRow> = self.history.iter().skip(skip).copied().collect();
        let half = (rows.len() / 2).max(1).min(rows.len());
        (
            QualityHalf::summarize(&rows[..half]),
            QualityHalf::summarize(&rows[half..]),
        )
    }

    fn guardrails(&self, previous: &QualityHalf, recent: &QualityHalf, recoveries: usize) -> Vec<String> {
        let mut reasons = Vec::new();
        if recoveries > 0 {
            reasons.push("recoveries_present".to_string());
        }
        if recent.count < MIN_TREND_ROWS {
            return reasons;
        }
        if recent.mean_stability_regression > 0.02 {
            reasons.push("stability_trend_negative".to_string());
        }
        if recent.mean_improvement < previous.mean_improvement - 0.02 {
            reasons.push("sim_improvement_trend_degraded".to_string());
        }
        if recent.mean_improvement < 0.0 && recent.promotion_rate < previous.promotion_rate - 0.05 {
            reasons.push("promotion_rate_trend_degraded".to_string());
        }
        reasons
    }

    fn recommend(&self, recent: &QualityHalf, guarded: bool, now: DateTime<Utc>) -> (RuntimeKnobs, &'static str) {
        let c = &self.config;
        let current = self.knobs;

        if guarded {
            return (self.last_safe, "guardrail_revert_to_last_safe");
        }
        let Some(usage) = self.cpu_usage else {
            return (current, "cpu_usage_unknown_hold");
        };

        if self.cooldown_until.is_some_and(|until| now < until) {
            if usage > c.cpu_target_max && current.max_parallel_workers > c.min_workers {
                return (
                    RuntimeKnobs {
                        max_parallel_workers: current.max_parallel_workers - 1,
                        ..current
                    },
                    "cooldown_cpu_above_target_scale_down_workers",
                );
            }
            return (current, "cooldown_hold");
        }

        if usage < c.cpu_target_min {
            if current.max_parallel_workers < c.max_workers {
                return (
                    RuntimeKnobs {
                        max_parallel_workers: current.max_parallel_workers + 1,
                        ..current
                    },
                    "cpu_below_target_scale_up_workers",
                );
            }
            if current.loop_sleep_ms > MIN_LOOP_SLEEP_MS {
                return (
                    RuntimeKnobs {
                        loop_sleep_ms: current.loop_sleep_ms.saturating_sub(SLEEP_STEP_MS).max(MIN_LOOP_SLEEP_MS),
                        ..current
                    },
                    "cpu_below_target_reduce_loop_sleep",
                );
            }
            if current.batch_episodes < c.batch_episodes_max || current.canary_episodes < c.canary_episodes_max {
                return (
                    RuntimeKnobs {
                        batch_episodes: (current.batch_episodes + EPISODE_STEP).min(c.batch_episodes_max),
                        canary_episodes: (current.canary_episodes + EPISODE_STEP).min(c.canary_episodes_max),
                        ..current
                    },
                    "cpu_below_target_increase_episode_budget",
                );
            }
            return (current, "cpu_below_target_at_limits");
        }

        if usage > c.cpu_target_max {
            if current.batch_episodes > c.batch_episodes_min || current.canary_episodes > c.canary_episodes_min {
                return (
                    RuntimeKnobs {
                        batch_episodes: current.batch_episodes.saturating_sub(EPISODE_STEP).max(c.batch_episodes_min),
                        canary_episodes: current
                            .canary_episodes
                            .saturating_sub(EPISODE_STEP)
                            .max(c.canary_episodes_min),
                        ..current
                    },
                    "cpu_above_target_reduce_episode_budget",
                );
            }
            if current.max_parallel_workers > c.min_workers {
                return (
                    RuntimeKnobs {
                        max_parallel_workers: current.max_parallel_workers - 1,
                        ..current
                    },
                    "cpu_above_target_scale_down_workers",
                );
            }
            return (
                RuntimeKnobs {
                    loop_sleep_ms: (current.loop_sleep_ms + SLEEP_STEP_MS).min(MAX_LOOP_SLEEP_MS),
                    ..current
                },
                "cpu_above_target_increase_loop_sleep",
            );
        }

        let strong = recent.mean_improvement >= 0.01 && recent.mean_stability_regression <= 0.01;
        if !strong {
            if current.canary_episodes < c.canary_episodes_max {
                return (
                    RuntimeKnobs {
                        canary_episodes: (current.canary_episodes + CANARY_QUALITY_STEP).min(c.canary_episodes_max),
                        ..current
                    },
                    "quality_soft_guard_increase_canary_budget",
                );
            }
            return (current, "quality_soft_guard_at_limit");
        }
        if current.canary_episodes > c.canary_episodes_min {
            return (
                RuntimeKnobs {
                    canary_episodes: current
                        .canary_episodes
                        .saturating_sub(CANARY_QUALITY_STEP)
                        .max(c.canary_episodes_min),
                    ..current
                },
                "quality_strong_reduce_canary_cost",
            );
        }
        (current, "cpu_within_target_quality_stable")
    }

    fn evaluate(&mut self, recoveries: usize, now: DateTime<Utc>) -> AutotuneDecision {
        let (previous, recent) = self.quality();
        let guardrails = self.guardrails(&previous, &recent, recoveries);
        let (recommended, reason) = self.recommend(&recent, !guardrails.is_empty(), now);

        if guardrails.is_empty() {
            self.last_safe = self.knobs;
        } else {
            warn!(guardrails = ?guardrails, "Autotune guardrail triggered");
            self.cooldown_until = Some(now + ChronoDuration::minutes(self.config.cooldown_minutes));
        }

        let mut applied = None;
        let action = match self.config.mode {
            AutotuneMode::Enforce if recommended != self.knobs => {
                self.knobs = self.bounded(recommended);
                applied = Some(self.knobs);
                info!(knobs = ?self.knobs, reason, "Autotune applied runtime knobs");
                if guardrails.is_empty() {
                    AutotuneAction::Apply
                } else {
                    AutotuneAction::Rollback
                }
            }
            AutotuneMode::Shadow if recommended != self.knobs => {
                debug!(knobs = ?recommended, reason, "Autotune recommendation");
                AutotuneAction::Recommend
            }
            _ => AutotuneAction::None,
        };

        AutotuneDecision {
            ts: now,
            mode: self.config.mode,
            action,
            reason: reason.to_string(),
            recommended,
            applied,
            guardrails,
            cpu_usage: self.cpu_usage,
        }
    }

    fn bounded(&self, knobs: RuntimeKnobs) -> RuntimeKnobs {
        let c = &self.config;
        RuntimeKnobs {
            max_parallel_workers: knobs.max_parallel_workers.clamp(c.min_workers, c.max_workers),
            batch_episodes: knobs.batch_episodes.clamp(c.batch_episodes_min, c.batch_episodes_max),
            canary_episodes: knobs.canary_episodes.clamp(c.canary_episodes_min, c.canary_episodes_max),
            loop_sleep_ms: knobs.loop_sleep_ms.clamp(MIN_LOOP_SLEEP_MS, MAX_LOOP_SLEEP_MS),
        }
    }
}
