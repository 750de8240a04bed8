use async_trait::async_trait;
use chrono::Utc;
use overseer_core::autotune::{CpuClock, RuntimeAutotuner, RuntimeKnobs};
use overseer_core::checkpoint::{Checkpoint, CheckpointStore};
use overseer_core::config::AutotuneMode;
use overseer_core::control::{ControlHandle, LoopState};
use overseer_core::evaluator::{BackendKind, EvalBudget, FallbackBackend, SimulationBackend};
use overseer_core::events::read_events;
use overseer_core::safety::FailureKind;
use overseer_core::test_utils::{metrics, temp_state_dir, test_config, ScriptedBackend, TestHarness};
use overseer_shared::{
    EvaluationError, KnobSet, KnobSpec, OverseerError, OverseerResult, PolicyParameters,
    PromotionState, RunEvent, SimMetrics, BASELINE_POLICY_ID,
};
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Objective and progress both equal the `aggression` knob, so a higher knob
/// always ranks higher and wins its canary.
struct KnobBackend;

#[async_trait]
impl SimulationBackend for KnobBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Fallback
    }

    async fn run_batch(
        &self,
        params: &PolicyParameters,
        _budget: EvalBudget,
        _seed: u64,
    ) -> Result<SimMetrics, EvaluationError> {
        let a = params.get("aggression").unwrap_or(0.0);
        Ok(metrics(a, a, 0.8))
    }
}

async fn wait_for_health<F>(control: &ControlHandle, pred: F)
where
    F: Fn(&overseer_core::control::HealthSnapshot) -> bool,
{
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            if pred(&control.snapshot_health().await) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("health condition not reached");
}

#[tokio::test]
async fn test_runs_generations_with_fallback_backend() {
    let harness = TestHarness::new().await;
    let control = ControlHandle::new(BackendKind::Fallback);

    let cp = harness
        .orchestrator(Arc::new(FallbackBackend), &control)
        .run()
        .await
        .unwrap();

    assert_eq!(cp.loop_cursor, 3);
    assert!(!cp.safe_pause);
    assert!(cp.population_state.population.len() <= harness.config.search.population_cap);
    assert!(cp.last_success_ts.is_some());

    // The checkpoint's pointer matches the registry's single promoted row
    let active = harness.registry.get_active().await.unwrap().unwrap();
    assert_eq!(cp.active_policy_id.as_deref(), Some(active.policy_id.as_str()));

    // Nothing is left half-evaluated at a generation boundary
    assert!(harness
        .registry
        .list_by_state(PromotionState::Proposed)
        .await
        .unwrap()
        .is_empty());
    for member in cp.population_state.population.members() {
        let p = harness.registry.get(&member.policy_id).await.unwrap().unwrap();
        assert_eq!(p.promotion_state, PromotionState::Simulated);
    }

    let summary = control.snapshot_summary().await.unwrap();
    assert_eq!(summary.generation, 3);
    assert_eq!(summary.candidates, 4);
    assert_eq!(control.snapshot_health().await.state, LoopState::Stopped);

    let state_dir = &harness.config.runtime.state_dir;
    assert!(state_dir.join("health.json").exists());
    assert!(state_dir.join("summary_latest.json").exists());

    let events = read_events(&harness.config.runtime.events_file).await.unwrap();
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types.first(), Some(&"loop_started"));
    assert_eq!(types.last(), Some(&"loop_stopped"));
    assert_eq!(
        types.iter().filter(|t| **t == "generation_completed").count(),
        3
    );
}

#[tokio::test]
async fn test_resume_continues_from_checkpoint() {
    let mut config = test_config(&temp_state_dir());
    config.runtime.max_generations = Some(2);
    let first = TestHarness::with_config(config.clone()).await;
    let control = ControlHandle::new(BackendKind::Fallback);
    let cp = first
        .orchestrator(Arc::new(FallbackBackend), &control)
        .run()
        .await
        .unwrap();
    assert_eq!(cp.loop_cursor, 2);
    first.pool.close().await;

    // Same state dir, fresh process
    config.runtime.max_generations = Some(4);
    let second = TestHarness::with_config(config).await;
    let restored = second.store.load().await.unwrap().unwrap();
    assert_eq!(restored, cp);

    let control = ControlHandle::new(BackendKind::Fallback);
    let cp = second
        .orchestrator(Arc::new(FallbackBackend), &control)
        .run()
        .await
        .unwrap();
    assert_eq!(cp.loop_cursor, 4);
    assert_eq!(control.snapshot_summary().await.unwrap().generation, 4);
}

#[tokio::test]
async fn test_restart_reconciles_active_pointer() {
    let mut config = test_config(&temp_state_dir());
    config.runtime.max_generations = Some(1);
    let harness = TestHarness::with_config(config).await;
    let control = ControlHandle::new(BackendKind::Fallback);
    let mut cp = harness
        .orchestrator(Arc::new(FallbackBackend), &control)
        .run()
        .await
        .unwrap();

    // Simulate a crash between registry commit and checkpoint save
    cp.active_policy_id = Some("p-000001-00000000".into());
    harness.store.save(&cp).await.unwrap();

    let control = ControlHandle::new(BackendKind::Fallback);
    let cp = harness
        .orchestrator(Arc::new(FallbackBackend), &control)
        .run()
        .await
        .unwrap();
    let active = harness.registry.get_active().await.unwrap().unwrap();
    assert_eq!(cp.active_policy_id, Some(active.policy_id));
    // Cap already reached: no generation ran
    assert_eq!(cp.loop_cursor, 1);
}

#[tokio::test]
async fn test_crash_loop_trips_safe_pause() {
    let mut config = test_config(&temp_state_dir());
    config.runtime.max_generations = None;
    config.runtime.loop_sleep_ms = 5;
    config.safety.crash_loop_limit = 2;
    let harness = TestHarness::with_config(config).await;
    let control = ControlHandle::new(BackendKind::Fallback);
    let backend = ScriptedBackend::failing();

    let task = tokio::spawn(
        harness
            .orchestrator(backend.clone(), &control)
            .run(),
    );
    wait_for_health(&control, |h| h.state == LoopState::Paused).await;

    let health = control.snapshot_health().await;
    assert!(health.safe_pause);
    assert!(health
        .safe_pause_reason
        .as_deref()
        .unwrap()
        .contains("evaluation_error"));
    assert_eq!(health.failure_counts.get("evaluation_error"), Some(&2));

    // Paused loop does not advance
    let calls = backend.calls.load(std::sync::atomic::Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(backend.calls.load(std::sync::atomic::Ordering::SeqCst), calls);

    assert!(control.request_stop().await);
    let cp = task.await.unwrap().unwrap();
    assert!(cp.safe_pause);
    assert_eq!(cp.loop_cursor, 2);
    assert_eq!(cp.active_policy_id.as_deref(), Some(BASELINE_POLICY_ID));
    assert!(harness
        .registry
        .list_by_state(PromotionState::Proposed)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_pause_and_resume_keep_failure_counters() {
    let mut config = test_config(&temp_state_dir());
    config.runtime.max_generations = None;
    config.runtime.loop_sleep_ms = 5;
    config.safety.crash_loop_limit = 100;
    let harness = TestHarness::with_config(config).await;
    let control = ControlHandle::new(BackendKind::Fallback);
    let backend = ScriptedBackend::failing();

    assert!(control.request_pause(Some("maintenance".into())).await);
    let task = tokio::spawn(harness.orchestrator(backend.clone(), &control).run());
    wait_for_health(&control, |h| h.state == LoopState::Paused).await;
    let health = control.snapshot_health().await;
    assert_eq!(health.safe_pause_reason.as_deref(), Some("maintenance"));
    assert_eq!(health.generation, 0);

    assert!(control.request_resume().await);
    wait_for_health(&control, |h| h.generation >= 2).await;
    assert!(control.request_pause(None).await);
    wait_for_health(&control, |h| h.state == LoopState::Paused).await;
    assert!(control.request_resume().await);
    wait_for_health(&control, |h| !h.safe_pause).await;

    control.request_stop().await;
    let cp = task.await.unwrap().unwrap();
    let since = chrono::Utc::now() - chrono::Duration::minutes(30);
    assert!(cp.failure_counters.count_since(FailureKind::EvaluationError, since) >= 2);
    assert!(!cp.safe_pause);
}

#[tokio::test]
async fn test_better_candidate_is_promoted_through_shadow_canary() {
    let mut config = test_config(&temp_state_dir());
    config.knobs = KnobSet {
        knobs: vec![KnobSpec::new("aggression", 0.0, 1.0)],
    };
    config.search.candidates_per_generation = 12;
    config.canary.improvement_threshold = 0.0;
    config.runtime.max_generations = Some(8);
    let harness = TestHarness::with_config(config).await;
    let control = ControlHandle::new(BackendKind::Fallback);

    let cp = harness
        .orchestrator(Arc::new(KnobBackend), &control)
        .run()
        .await
        .unwrap();

    let active = harness.registry.get_active().await.unwrap().unwrap();
    assert_ne!(active.policy_id, BASELINE_POLICY_ID);
    assert_eq!(cp.active_policy_id.as_deref(), Some(active.policy_id.as_str()));
    assert!(active.parameters.get("aggression").unwrap() > 0.55);
    assert_eq!(
        harness
            .registry
            .get(BASELINE_POLICY_ID)
            .await
            .unwrap()
            .unwrap()
            .promotion_state,
        PromotionState::Superseded
    );

    // The winner descends from the baseline
    let lineage = harness.registry.lineage(&active.policy_id).await.unwrap();
    assert_eq!(
        lineage.last().map(|p| p.policy_id.as_str()),
        Some(BASELINE_POLICY_ID)
    );

    let events = read_events(&harness.config.runtime.events_file).await.unwrap();
    assert!(events.iter().any(|e| e.event_type == "canary_started"));
    assert!(events.iter().any(|e| e.event_type == "canary_promoted"));
}

#[tokio::test]
async fn test_equal_candidates_never_start_a_canary() {
    let harness = TestHarness::new().await;
    let control = ControlHandle::new(BackendKind::Fallback);
    let backend = ScriptedBackend::healthy(metrics(0.5, 0.5, 0.5));

    let cp = harness.orchestrator(backend, &control).run().await.unwrap();
    assert!(cp.population_state.canary.is_none());
    assert_eq!(cp.active_policy_id.as_deref(), Some(BASELINE_POLICY_ID));
    assert!(harness
        .registry
        .list_by_state(PromotionState::Canary)
        .await
        .unwrap()
        .is_empty());
}

/// Deletes the newest proposed row on its first call, so recording that
/// candidate's metrics fails mid-generation.
struct DeletingBackend {
    pool: SqlitePool,
    fired: AtomicBool,
}

#[async_trait]
impl SimulationBackend for DeletingBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Fallback
    }

    async fn run_batch(
        &self,
        params: &PolicyParameters,
        _budget: EvalBudget,
        _seed: u64,
    ) -> Result<SimMetrics, EvaluationError> {
        if !self.fired.swap(true, Ordering::SeqCst) {
            sqlx::query(
                "DELETE FROM policies WHERE policy_id = (SELECT policy_id FROM policies \
                 WHERE promotion_state = 'proposed' ORDER BY rowid DESC LIMIT 1)",
            )
            .execute(&self.pool)
            .await
            .map_err(|e| EvaluationError::BackendUnavailable(e.to_string()))?;
        }
        let a = params.get("aggression").unwrap_or(0.0);
        Ok(metrics(a, a, 0.8))
    }
}

#[tokio::test]
async fn test_failed_generation_leaves_no_registry_orphans() {
    let mut config = test_config(&temp_state_dir());
    config.runtime.max_generations = Some(1);
    let harness = TestHarness::with_config(config).await;
    let control = ControlHandle::new(BackendKind::Fallback);
    let backend = Arc::new(DeletingBackend {
        pool: harness.pool.clone(),
        fired: AtomicBool::new(false),
    });

    let cp = harness.orchestrator(backend, &control).run().await.unwrap();
    assert_eq!(cp.loop_cursor, 1);

    assert!(harness
        .registry
        .list_by_state(PromotionState::Proposed)
        .await
        .unwrap()
        .is_empty());
    for p in harness
        .registry
        .list_by_state(PromotionState::Simulated)
        .await
        .unwrap()
    {
        assert!(
            cp.population_state.population.contains(&p.policy_id),
            "{} is simulated but not tracked",
            p.policy_id
        );
    }

    let events = read_events(&harness.config.runtime.events_file).await.unwrap();
    assert!(events.iter().any(|e| e.event_type == "loop_error"));
    assert!(events
        .iter()
        .any(|e| e.event_type == "policy_rejected" && e.payload["reason"] == "not in population"));
}

/// Delegates to a real store; saves fail while `failing` is set.
struct FlakyStore {
    inner: Arc<dyn CheckpointStore>,
    failing: AtomicBool,
}

#[async_trait]
impl CheckpointStore for FlakyStore {
    async fn load(&self) -> OverseerResult<Option<Checkpoint>> {
        self.inner.load().await
    }

    async fn save(&self, checkpoint: &Checkpoint) -> OverseerResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(OverseerError::Persistence("disk full".into()));
        }
        self.inner.save(checkpoint).await
    }

    fn append_event(&self, event: RunEvent) {
        self.inner.append_event(event);
    }

    async fn flush_events(&self) {
        self.inner.flush_events().await;
    }

    fn describe(&self) -> &'static str {
        "flaky"
    }
}

#[tokio::test]
async fn test_persistence_exhaustion_pauses_until_save_succeeds() {
    let mut config = test_config(&temp_state_dir());
    config.runtime.max_generations = None;
    config.runtime.loop_sleep_ms = 5;
    let harness = TestHarness::with_config(config).await;
    let control = ControlHandle::new(BackendKind::Fallback);
    let store = Arc::new(FlakyStore {
        inner: harness.store.clone(),
        failing: AtomicBool::new(false),
    });

    let task = tokio::spawn(
        harness
            .orchestrator_with(
                ScriptedBackend::healthy(metrics(0.5, 0.5, 0.5)),
                None,
                store.clone(),
                &control,
            )
            .run(),
    );
    wait_for_health(&control, |h| h.generation >= 1).await;

    store.failing.store(true, Ordering::SeqCst);
    wait_for_health(&control, |h| h.state == LoopState::Paused).await;
    let health = control.snapshot_health().await;
    assert!(health.safe_pause);
    assert!(health
        .safe_pause_reason
        .as_deref()
        .unwrap()
        .contains("checkpoint persistence failed"));
    let paused_at = health.generation;

    // Held in memory only; the store never accepted it
    let durable = harness.store.load().await.unwrap().unwrap();
    assert!(!durable.safe_pause);
    assert!(durable.loop_cursor <= paused_at);

    store.failing.store(false, Ordering::SeqCst);
    tokio::time::timeout(Duration::from_secs(20), async {
        while !harness.store.load().await.unwrap().unwrap().safe_pause {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("held safe-pause never persisted");

    assert!(control.request_resume().await);
    wait_for_health(&control, |h| !h.safe_pause && h.generation > paused_at).await;

    control.request_stop().await;
    let cp = task.await.unwrap().unwrap();
    assert!(!cp.safe_pause);
    let since = Utc::now() - chrono::Duration::minutes(30);
    assert_eq!(cp.failure_counters.count_since(FailureKind::PersistenceError, since), 1);
}

/// A process that never burns CPU.
struct IdleClock;

impl CpuClock for IdleClock {
    fn cpu_seconds(&self) -> Option<f64> {
        Some(0.0)
    }
}

#[tokio::test]
async fn test_enforced_autotune_scales_up_idle_workers() {
    let mut config = test_config(&temp_state_dir());
    config.runtime.max_generations = None;
    config.runtime.loop_sleep_ms = 5;
    config.runtime.max_parallel_workers = 4;
    config.runtime.heartbeat_secs = 1;
    config.autotune.mode = AutotuneMode::Enforce;
    config.autotune.interval_secs = 1;
    let harness = TestHarness::with_config(config.clone()).await;
    let control = ControlHandle::new(BackendKind::Fallback);
    let autotuner = RuntimeAutotuner::new(
        config.autotune.clone(),
        RuntimeKnobs::from_config(&config),
        Arc::new(IdleClock),
        4,
        Utc::now(),
    );

    let task = tokio::spawn(
        harness
            .orchestrator(Arc::new(FallbackBackend), &control)
            .with_autotuner(autotuner)
            .run(),
    );
    wait_for_health(&control, |h| {
        h.autotune
            .as_ref()
            .is_some_and(|a| a.knobs.max_parallel_workers >= 5)
    })
    .await;

    let status = control.snapshot_health().await.autotune.unwrap();
    assert_eq!(status.mode, AutotuneMode::Enforce);
    assert_eq!(status.cpu_usage, Some(0.0));
    // Bounded into the autotuner's own ranges on first apply
    assert_eq!(status.knobs.loop_sleep_ms, 200);
    assert_eq!(status.knobs.batch_episodes, config.autotune.batch_episodes_min);

    control.request_stop().await;
    task.await.unwrap().unwrap();

    let events = read_events(&harness.config.runtime.events_file).await.unwrap();
    let decision = events
        .iter()
        .find(|e| e.event_type == "autotune_decision")
        .unwrap();
    assert_eq!(decision.payload["reason"], "cpu_below_target_scale_up_workers");
    assert!(harness.config.runtime.state_dir.join("heartbeat.json").exists());
}
