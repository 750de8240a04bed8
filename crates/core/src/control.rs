use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::autotune::AutotuneStatus;
use crate::checkpoint::write_json_atomic;
use crate::evaluator::BackendKind;
use crate::scoring::WeightProfile;

pub const DEFAULT_PAUSE_REASON: &str = "manual_pause";

/// `Starting -> Running -> {Paused, Stopping} -> Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationPhase {
    Proposing,
    Evaluating,
    Canary,
    Persisting,
}

/// Where the generation in flight is. A phase whose `phase_started_at`
/// keeps aging while heartbeats continue points at a stuck backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationProgress {
    pub generation: u64,
    pub phase: GenerationPhase,
    pub started_at: DateTime<Utc>,
    pub phase_started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub state: LoopState,
    pub generation: u64,
    pub active_policy_id: Option<String>,
    pub safe_pause: bool,
    pub safe_pause_reason: Option<String>,
    pub recoveries_30m: usize,
    pub failure_counts: BTreeMap<String, usize>,
    pub sim_backend: BackendKind,
    pub last_error: Option<String>,
    pub last_success_ts: Option<DateTime<Utc>>,
    pub canary_policy_id: Option<String>,
    /// `None` between generations.
    pub progress: Option<GenerationProgress>,
    pub autotune: Option<AutotuneStatus>,
    pub updated_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

impl HealthSnapshot {
    #[must_use]
    pub fn starting(sim_backend: BackendKind) -> Self {
        Self {
            state: LoopState::Starting,
            generation: 0,
            active_policy_id: None,
            safe_pause: false,
            safe_pause_reason: None,
            recoveries_30m: 0,
            failure_counts: BTreeMap::new(),
            sim_backend,
            last_error: None,
            last_success_ts: None,
            canary_policy_id: None,
            progress: None,
            autotune: None,
            updated_at: Utc::now(),
            heartbeat_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedEntry {
    pub policy_id: String,
    pub score: f64,
    pub variance: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    /// A canary was started this generation.
    Started,
    Promote,
    Rollback,
    Extend,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanaryDecision {
    pub kind: DecisionKind,
    pub policy_id: Option<String>,
    pub reason: Option<String>,
    /// Gate measurements, present once a verdict was reached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub improvement: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stability_regression: Option<f64>,
}

impl CanaryDecision {
    #[must_use]
    pub fn none() -> Self {
        Self {
            kind: DecisionKind::None,
            policy_id: None,
            reason: None,
            improvement: None,
            stability_regression: None,
        }
    }
}

/// What one generation did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationSummary {
    pub generation: u64,
    pub ts: DateTime<Utc>,
    pub candidates: usize,
    pub evaluated: usize,
    pub failed: usize,
    pub top_k: Vec<RankedEntry>,
    pub incumbent_score: Option<f64>,
    pub decision: CanaryDecision,
    pub weights: WeightProfile,
    pub sim_backend: BackendKind,
}

/// Operator intent towards pausing. Each request gets a new sequence number
/// so the loop can tell a fresh request from one it already applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PauseIntent {
    pub seq: u64,
    pub paused: bool,
    pub reason: Option<String>,
}

#[derive(Debug)]
struct Signals {
    stop: bool,
    pause: PauseIntent,
    /// Highest intent the loop has taken.
    applied_seq: u64,
}

impl Signals {
    /// A pending intent wins over the published state.
    fn effectively_paused(&self, published_safe_pause: bool) -> bool {
        if self.pause.seq > self.applied_seq {
            self.pause.paused
        } else {
            published_safe_pause
        }
    }
}

struct Inner {
    signals: Mutex<Signals>,
    wake: Notify,
    health: RwLock<HealthSnapshot>,
    summary: RwLock<Option<GenerationSummary>>,
}

/// Shared between the loop and the control transport. Requests are
/// idempotent and last-write-wins; the loop observes them at generation
/// boundaries.
#[derive(Clone)]
pub struct ControlHandle {
    inner: Arc<Inner>,
}

impl ControlHandle {
    #[must_use]
    pub fn new(sim_backend: BackendKind) -> Self {
        Self {
            inner: Arc::new(Inner {
                signals: Mutex::new(Signals {
                    stop: false,
                    pause: PauseIntent {
                        seq: 0,
                        paused: false,
                        reason: None,
                    },
                    applied_seq: 0,
                }),
                wake: Notify::new(),
                health: RwLock::new(HealthSnapshot::starting(sim_backend)),
                summary: RwLock::new(None),
            }),
        }
    }

    /// Returns whether this call changed anything.
    pub async fn request_stop(&self) -> bool {
        let mut signals = self.inner.signals.lock().await;
        if signals.stop {
            return false;
        }
        signals.stop = true;
        drop(signals);
        info!("Stop requested");
        self.inner.wake.notify_one();
        true
    }

    pub async fn request_pause(&self, reason: Option<String>) -> bool {
        let safe_pause = self.inner.health.read().await.safe_pause;
        let mut signals = self.inner.signals.lock().await;
        if signals.effectively_paused(safe_pause) {
            return false;
        }
        let reason = reason
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PAUSE_REASON.to_string());
        signals.pause = PauseIntent {
            seq: signals.pause.seq + 1,
            paused: true,
            reason: Some(reason.clone()),
        };
        drop(signals);
        info!(reason = %reason, "Pause requested");
        self.inner.wake.notify_one();
        true
    }

    pub async fn request_resume(&self) -> bool {
        let safe_pause = self.inner.health.read().await.safe_pause;
        let mut signals = self.inner.signals.lock().await;
        if !signals.effectively_paused(safe_pause) {
            return false;
        }
        signals.pause = PauseIntent {
            seq: signals.pause.seq + 1,
            paused: false,
            reason: None,
        };
        drop(signals);
        info!("Resume requested");
        self.inner.wake.notify_one();
        true
    }

    pub async fn stop_requested(&self) -> bool {
        self.inner.signals.lock().await.stop
    }

    /// Hands the loop the latest pause intent it has not applied yet.
    /// Superseded intents are never returned.
    pub async fn take_pause_intent(&self) -> Option<PauseIntent> {
        let mut signals = self.inner.signals.lock().await;
        if signals.pause.seq <= signals.applied_seq {
            return None;
        }
        signals.applied_seq = signals.pause.seq;
        Some(signals.pause.clone())
    }

    pub async fn snapshot_health(&self) -> HealthSnapshot {
        self.inner.health.read().await.clone()
    }

    pub async fn snapshot_summary(&self) -> Option<GenerationSummary> {
        self.inner.summary.read().await.clone()
    }

    pub async fn publish_health(&self, health: HealthSnapshot) {
        *self.inner.health.write().await = health;
    }

    pub async fn publish_summary(&self, summary: GenerationSummary) {
        *self.inner.summary.write().await = Some(summary);
    }

    /// Updates only the progress of the published snapshot.
    pub async fn publish_progress(&self, progress: Option<GenerationProgress>) {
        self.inner.health.write().await.progress = progress;
    }

    /// Stamps the published snapshot as alive and returns it.
    pub async fn touch_heartbeat(&self, now: DateTime<Utc>) -> HealthSnapshot {
        let mut health = self.inner.health.write().await;
        health.heartbeat_at = now;
        health.clone()
    }

    /// Stamps the snapshot every `every` and writes it to `path`, including
    /// while a generation is blocked on evaluation. Abort the handle to stop.
    pub fn spawn_heartbeat(&self, path: PathBuf, every: Duration) -> JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let health = handle.touch_heartbeat(Utc::now()).await;
                if let Err(e) = write_json_atomic(&path, &health).await {
                    warn!("Failed to write {}: {}", path.display(), e);
                }
            }
        })
    }

    /// Sleeps for `duration` or until a control request arrives.
    pub async fn wait(&self, duration: Duration) {
        tokio::select! {
            () = tokio::time::sleep(duration) => {}
            () = self.inner.wake.notified() => {}
        }
    }
}
