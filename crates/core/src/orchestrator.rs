use anyhow::Context;
use chrono::{DateTime, Utc};
use overseer_shared::{
    FinalOutcome, LiveMetrics, LiveSample, LiveSignal, OverseerError, Phase, Policy,
    PromotionState, RunEvent, Severity, BASELINE_POLICY_ID,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::autotune::{AutotuneAction, AutotuneDecision, RuntimeAutotuner};
use crate::canary::{CanaryGate, CanaryRun, Verdict};
use crate::checkpoint::{persist_with_retry, write_json_atomic, Checkpoint, CheckpointStore};
use crate::config::AppConfig;
use crate::control::{
    CanaryDecision, ControlHandle, DecisionKind, GenerationPhase, GenerationProgress,
    GenerationSummary, HealthSnapshot, LoopState, RankedEntry,
};
use crate::evaluator::{EvalBudget, Evaluator};
use crate::live::{Evidence, LiveEnvironment, SignalPolicy};
use crate::population::{Member, PopulationSearch};
use crate::registry::PolicyRegistry;
use crate::safety::{DestructiveAction, FailureKind, SafetyBreaker};
use crate::scoring::Scorer;

const SUMMARY_TOP_K: usize = 5;

/// Top-level driver: one control thread advancing generations and owning
/// every writer of the checkpoint and registry.
pub struct Orchestrator {
    config: AppConfig,
    store: Arc<dyn CheckpointStore>,
    registry: PolicyRegistry,
    evaluator: Evaluator,
    live: Option<Arc<dyn LiveEnvironment>>,
    control: ControlHandle,
    search: PopulationSearch,
    gate: CanaryGate,
    breaker: SafetyBreaker,
    scorer: Scorer,
    signal_policy: SignalPolicy,
    autotuner: RuntimeAutotuner,
    rng: StdRng,
    /// Last successfully persisted checkpoint.
    checkpoint: Checkpoint,
    /// Safe-pause that could not be persisted yet. Takes precedence over
    /// `checkpoint` and is retried every poll.
    held_pause: Option<Checkpoint>,
    progress: Option<GenerationProgress>,
    state: LoopState,
    consecutive_errors: u32,
    last_error: Option<String>,
}

impl Orchestrator {
    /// `live` selects live canaries; `None` runs shadow canaries in simulation.
    #[must_use]
    pub fn new(
        config: AppConfig,
        store: Arc<dyn CheckpointStore>,
        registry: PolicyRegistry,
        evaluator: Evaluator,
        live: Option<Arc<dyn LiveEnvironment>>,
        control: ControlHandle,
    ) -> Self {
        let rng = match config.runtime.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            search: PopulationSearch::new(config.search.clone(), config.knobs.clone()),
            gate: CanaryGate::new(&config.canary),
            breaker: SafetyBreaker::new(&config.safety),
            scorer: Scorer::new(&config.scoring),
            signal_policy: SignalPolicy::new(&config.live),
            autotuner: RuntimeAutotuner::for_process(&config, Utc::now()),
            config,
            store,
            registry,
            evaluator,
            live,
            control,
            rng,
            checkpoint: Checkpoint::default(),
            held_pause: None,
            progress: None,
            state: LoopState::Starting,
            consecutive_errors: 0,
            last_error: None,
        }
    }

    /// Replaces the process-clock autotuner.
    #[must_use]
    pub fn with_autotuner(mut self, autotuner: RuntimeAutotuner) -> Self {
        self.autotuner = autotuner;
        self
    }

    #[must_use]
    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    /// The held safe-pause if there is one, else the persisted checkpoint.
    fn effective_checkpoint(&self) -> &Checkpoint {
        self.held_pause.as_ref().unwrap_or(&self.checkpoint)
    }

    fn is_paused(&self) -> bool {
        self.effective_checkpoint().safe_pause
    }

    fn loop_sleep(&self) -> Duration {
        Duration::from_millis(self.autotuner.knobs().loop_sleep_ms)
    }

    fn emit(&self, event: RunEvent) {
        self.store.append_event(event);
    }

    /// Runs until stopped or until the generation cap is reached. Returns the
    /// final checkpoint.
    pub async fn run(mut self) -> anyhow::Result<Checkpoint> {
        self.start().await?;
        let heartbeat = self.control.spawn_heartbeat(
            self.config.runtime.state_dir.join("heartbeat.json"),
            Duration::from_secs(self.config.runtime.heartbeat_secs.max(1)),
        );

        loop {
            if self.control.stop_requested().await {
                info!("Stop observed at generation boundary");
                break;
            }
            self.apply_control_intent().await;
            self.retry_held_pause().await;

            if self.is_paused() {
                if self.state != LoopState::Paused {
                    self.state = LoopState::Paused;
                    self.publish_health().await;
                }
                self.control.wait(self.loop_sleep()).await;
                continue;
            }

            if let Some(max) = self.config.runtime.max_generations {
                if self.checkpoint.loop_cursor >= max {
                    info!(max_generations = max, "Generation cap reached");
                    break;
                }
            }

            if self.state != LoopState::Running {
                self.state = LoopState::Running;
                self.publish_health().await;
            }

            match self.run_generation().await {
                Ok(()) => {
                    self.consecutive_errors = 0;
                    self.control.wait(self.loop_sleep()).await;
                }
                Err(e) => {
                    let backoff = self.on_generation_error(&e).await;
                    self.control.wait(backoff).await;
                }
            }
        }

        heartbeat.abort();
        self.shutdown().await;
        Ok(self.held_pause.unwrap_or(self.checkpoint))
    }

    // ── Startup ──

    async fn start(&mut self) -> anyhow::Result<()> {
        self.state = LoopState::Starting;
        self.publish_health().await;

        let loaded = self
            .store
            .load()
            .await
            .context("Failed to load checkpoint")?;
        let first_run = loaded.is_none();
        let mut cp = loaded.unwrap_or_default();

        let baseline = self
            .registry
            .bootstrap(BASELINE_POLICY_ID, self.config.knobs.baseline())
            .await
            .context("Failed to bootstrap baseline policy")?;
        if first_run {
            cp.active_policy_id = Some(baseline.policy_id.clone());
        }

        self.reconcile(&mut cp)
            .await
            .context("Failed to reconcile checkpoint with registry")?;

        persist_with_retry(self.store.as_ref(), &cp, &self.config.safety.persist_retry_ms)
            .await
            .map_err(|(attempts, e)| {
                anyhow::anyhow!("Initial checkpoint save failed after {} attempts: {}", attempts, e)
            })?;
        self.checkpoint = cp;

        info!(
            loop_cursor = self.checkpoint.loop_cursor,
            active_policy_id = ?self.checkpoint.active_policy_id,
            safe_pause = self.checkpoint.safe_pause,
            backend = %self.evaluator.backend_kind(),
            checkpoint_backend = self.store.describe(),
            "Orchestrator started"
        );
        let canary_mode = if self.live.is_some() { "live" } else { "shadow" };
        self.emit(RunEvent::info(
            Phase::Loop,
            "loop_started",
            json!({
                "loop_cursor": self.checkpoint.loop_cursor,
                "first_run": first_run,
                "active_policy_id": self.checkpoint.active_policy_id,
                "sim_backend": self.evaluator.backend_kind(),
                "canary_mode": canary_mode,
            }),
        ));
        self.publish_health().await;
        Ok(())
    }

    /// Brings the checkpoint in line with the registry, which is committed
    /// first and therefore authoritative.
    async fn reconcile(&self, cp: &mut Checkpoint) -> Result<(), OverseerError> {
        let active = self.registry.get_active().await?;
        let active_id = active.map(|p| p.policy_id);
        if cp.active_policy_id != active_id {
            warn!(
                checkpoint = ?cp.active_policy_id,
                registry = ?active_id,
                "Active policy pointer disagrees with registry; adopting registry"
            );
            self.emit(RunEvent::warning(
                Phase::Checkpoint,
                "active_pointer_reconciled",
                json!({"checkpoint": cp.active_policy_id, "registry": active_id}),
            ));
            cp.active_policy_id = active_id;
        }

        if let Some(run) = cp.population_state.canary.take() {
            match self.registry.get(&run.policy_id).await? {
                Some(p) if p.promotion_state == PromotionState::Canary => {
                    cp.population_state.canary = Some(run);
                }
                other => {
                    let state = other.map(|p| p.promotion_state);
                    info!(policy_id = %run.policy_id, state = ?state, "Dropping finished canary record");
                    self.emit(RunEvent::info(
                        Phase::Canary,
                        "canary_record_dropped",
                        json!({"policy_id": run.policy_id, "state": state}),
                    ));
                    // Finalized without promotion, possibly before the revert ran
                    if run.exposed_at.is_some() && state != Some(PromotionState::Promoted) {
                        let active = cp.active_policy_id.clone();
                        self.restore_incumbent(cp, &run.policy_id, active.as_deref())
                            .await?;
                    }
                }
            }
        }
        let tracked_canary = cp
            .population_state
            .canary
            .as_ref()
            .map(|r| r.policy_id.clone());

        // An untracked canary may still be exposed: its start was committed
        // to the registry but the checkpoint recording it was not.
        for orphan in self.registry.list_by_state(PromotionState::Canary).await? {
            if Some(&orphan.policy_id) != tracked_canary.as_ref() {
                self.reject(&orphan.policy_id, "orphaned canary").await?;
                let active = cp.active_policy_id.clone();
                self.restore_incumbent(cp, &orphan.policy_id, active.as_deref())
                    .await?;
            }
        }

        let mut stale = Vec::new();
        for member in cp.population_state.population.members() {
            let state = self
                .registry
                .get(&member.policy_id)
                .await?
                .map(|p| p.promotion_state);
            if state != Some(PromotionState::Simulated) {
                stale.push(member.policy_id.clone());
            }
        }
        for id in stale {
            cp.population_state.population.remove(&id);
        }

        for orphan in self.registry.list_by_state(PromotionState::Proposed).await? {
            self.reject(&orphan.policy_id, "unevaluated proposal").await?;
        }
        for orphan in self.registry.list_by_state(PromotionState::Simulated).await? {
            if !cp.population_state.population.contains(&orphan.policy_id) {
                self.reject(&orphan.policy_id, "not in population").await?;
            }
        }
        Ok(())
    }

    // ── Control ──

    async fn apply_control_intent(&mut self) {
        let Some(intent) = self.control.take_pause_intent().await else {
            return;
        };
        let mut cp = self.effective_checkpoint().clone();

        if intent.paused {
            if cp.safe_pause {
                return;
            }
            cp.safe_pause = true;
            cp.safe_pause_reason = intent.reason.clone();
            info!(reason = ?intent.reason, "Pausing generation advancement");
        } else {
            if !cp.safe_pause {
                return;
            }
            SafetyBreaker::resume(&mut cp);
            info!("Resuming generation advancement");
            if let Err(e) = self.reconcile(&mut cp).await {
                warn!("Reconciliation on resume failed: {}", e);
            }
        }

        if self.commit(cp).await {
            let event_type = if intent.paused { "control_pause" } else { "control_resume" };
            self.emit(RunEvent::info(
                Phase::Control,
                event_type,
                json!({"reason": intent.reason, "seq": intent.seq}),
            ));
            self.publish_health().await;
        }
    }

    // ── Generation ──

    async fn run_generation(&mut self) -> anyhow::Result<()> {
        let generation = self.checkpoint.loop_cursor + 1;
        let now = Utc::now();
        let mut next = self.checkpoint.clone();
        let knobs = self.autotuner.knobs();
        self.enter_phase(generation, GenerationPhase::Proposing).await;

        let incumbent = self
            .registry
            .get_active()
            .await?
            .context("No promoted policy in registry")?;
        let signal = self.read_signal().await;
        let profile = self
            .scorer
            .profile(signal.as_ref(), &self.signal_policy, now);
        next.population_state.population.rescore(&profile.weights);

        // Propose
        let proposals = self.search.propose(
            &next.population_state.population,
            &incumbent,
            &mut self.rng,
        );
        let mut candidates = Vec::with_capacity(proposals.len());
        for proposal in proposals {
            let policy = self
                .registry
                .create(Some(&proposal.parent_id), proposal.parameters, generation)
                .await?;
            candidates.push(policy);
        }

        // Evaluate; waits for every candidate before the canary gate runs
        self.enter_phase(generation, GenerationPhase::Evaluating).await;
        let budget = EvalBudget {
            episodes: knobs.batch_episodes,
            time_limit: Duration::from_millis(self.config.sim.eval_timeout_ms),
        };
        let mut jobs = Vec::with_capacity(candidates.len() + 1);
        jobs.push((incumbent.policy_id.clone(), incumbent.parameters.clone()));
        jobs.extend(
            candidates
                .iter()
                .map(|c| (c.policy_id.clone(), c.parameters.clone())),
        );
        let mut results = self.evaluator.evaluate_all(jobs, budget).await.into_iter();

        let mut failed = 0usize;
        let incumbent_score = match results.next() {
            Some((_, Ok(metrics))) => Some(profile.weights.score(&metrics)),
            Some((_, Err(e))) => {
                failed += 1;
                self.emit(RunEvent::warning(
                    Phase::Evaluator,
                    "evaluation_failed",
                    json!({"policy_id": incumbent.policy_id, "incumbent": true, "error": e}),
                ));
                None
            }
            None => None,
        };

        let mut members = Vec::new();
        for (policy_id, result) in results {
            match result {
                Ok(metrics) => {
                    let score = profile.weights.score(&metrics);
                    match self
                        .registry
                        .record_sim_metrics(&policy_id, &metrics, score)
                        .await
                    {
                        Ok(policy) => members.push(Member::from_policy(&policy, metrics, score)),
                        Err(e @ OverseerError::InvalidTransition { .. }) => {
                            self.skip_invalid_transition(&mut next, &e, now);
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => {
                    failed += 1;
                    self.emit(RunEvent::warning(
                        Phase::Evaluator,
                        "evaluation_failed",
                        json!({"policy_id": policy_id, "error": e}),
                    ));
                    self.reject_or_skip(&mut next, &policy_id, "evaluation failed", now)
                        .await?;
                }
            }
        }
        let evaluated = members.len();
        if failed > 0 {
            warn!(generation, failed, "Evaluations failed this generation");
            self.record_failure(&mut next, FailureKind::EvaluationError, now);
        }

        // Rank and evict
        let cap = self.search.population_cap();
        let evicted = next.population_state.population.absorb(members, cap);
        for member in evicted {
            debug!(policy_id = %member.policy_id, score = member.score, "Evicted from population");
            self.reject_or_skip(&mut next, &member.policy_id, "evicted", now)
                .await?;
        }

        // Canary
        self.enter_phase(generation, GenerationPhase::Canary).await;
        let decision = match next.population_state.canary.take() {
            Some(run) => {
                self.observe_canary(&mut next, run, signal.as_ref(), now)
                    .await?
            }
            None => {
                self.maybe_start_canary(&mut next, &incumbent, incumbent_score, signal.as_ref(), now)
                    .await?
            }
        };

        // Persist
        self.enter_phase(generation, GenerationPhase::Persisting).await;
        next.loop_cursor = generation;
        next.last_success_ts = Some(now);
        let committed = self.commit(next).await;
        self.clear_progress().await;
        if !committed {
            return Ok(());
        }

        let summary = GenerationSummary {
            generation,
            ts: now,
            candidates: candidates.len(),
            evaluated,
            failed,
            top_k: self
                .checkpoint
                .population_state
                .population
                .members()
                .iter()
                .take(SUMMARY_TOP_K)
                .map(|m| RankedEntry {
                    policy_id: m.policy_id.clone(),
                    score: m.score,
                    variance: m.metrics.variance,
                })
                .collect(),
            incumbent_score,
            decision,
            weights: profile,
            sim_backend: self.evaluator.backend_kind(),
        };
        info!(
            generation,
            evaluated,
            failed,
            best = ?summary.top_k.first().map(|e| e.score),
            incumbent = ?incumbent_score,
            decision = ?summary.decision.kind,
            "Generation complete"
        );
        self.emit(RunEvent::info(
            Phase::Loop,
            "generation_completed",
            json!({
                "generation": generation,
                "evaluated": evaluated,
                "failed": failed,
                "decision": summary.decision,
            }),
        ));
        let recoveries = self.breaker.recoveries(&self.checkpoint.failure_counters, now);
        if let Some(tuning) = self.autotuner.observe_generation(&summary, recoveries, now) {
            self.apply_autotune(&tuning);
        }
        self.publish_summary(summary).await;
        self.publish_health().await;
        Ok(())
    }

    async fn enter_phase(&mut self, generation: u64, phase: GenerationPhase) {
        let now = Utc::now();
        let started_at = match &self.progress {
            Some(p) if p.generation == generation => p.started_at,
            _ => now,
        };
        let progress = GenerationProgress {
            generation,
            phase,
            started_at,
            phase_started_at: now,
        };
        debug!(generation, phase = ?phase, "Generation phase");
        self.progress = Some(progress.clone());
        self.control.publish_progress(Some(progress)).await;
    }

    async fn clear_progress(&mut self) {
        self.progress = None;
        self.control.publish_progress(None).await;
    }

    fn apply_autotune(&mut self, decision: &AutotuneDecision) {
        if let Some(knobs) = decision.applied {
            self.evaluator
                .set_max_parallel_workers(knobs.max_parallel_workers);
        }
        let severity = match decision.action {
            AutotuneAction::Rollback => Severity::Warning,
            AutotuneAction::Apply | AutotuneAction::Recommend => Severity::Info,
            AutotuneAction::None => Severity::Debug,
        };
        self.emit(RunEvent::new(
            Phase::Loop,
            "autotune_decision",
            severity,
            json!({
                "mode": decision.mode,
                "action": decision.action,
                "reason": decision.reason,
                "recommended": decision.recommended,
                "applied": decision.applied,
                "guardrails": decision.guardrails,
                "cpu_usage": decision.cpu_usage,
            }),
        ));
    }

    async fn maybe_start_canary(
        &mut self,
        next: &mut Checkpoint,
        incumbent: &Policy,
        incumbent_score: Option<f64>,
        signal: Option<&LiveSignal>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<CanaryDecision> {
        if next.safe_pause {
            return Ok(CanaryDecision::none());
        }
        let Some(incumbent_score) = incumbent_score else {
            return Ok(CanaryDecision::none());
        };
        let Some(best) = next.population_state.population.best().cloned() else {
            return Ok(CanaryDecision::none());
        };
        if best.score <= incumbent_score {
            return Ok(CanaryDecision::none());
        }

        let candidate = match self.registry.start_canary(&best.policy_id).await {
            Ok(policy) => policy,
            Err(e @ OverseerError::InvalidTransition { .. }) => {
                self.skip_invalid_transition(next, &e, now);
                next.population_state.population.remove(&best.policy_id);
                return Ok(CanaryDecision::none());
            }
            Err(e) => return Err(e.into()),
        };
        next.population_state.population.remove(&best.policy_id);

        // Shadow canaries build their baseline from simulated incumbent windows
        let baseline = if self.live.is_some() {
            match self.signal_policy.assess(signal, None, now) {
                Evidence::Fresh(sample) => Some(LiveMetrics::from_sample(&sample, now)),
                Evidence::Insufficient(reason) => {
                    debug!(reason = %reason, "No fresh baseline window; using stored incumbent metrics");
                    incumbent.live_metrics.clone()
                }
            }
        } else {
            None
        };
        let mut run = self
            .gate
            .begin(&candidate.policy_id, &incumbent.policy_id, baseline, now);

        if let Some(live) = &self.live {
            match live.expose(&candidate).await {
                Ok(exposed_at) => run.exposed_at = Some(exposed_at),
                Err(e) => {
                    warn!(policy_id = %candidate.policy_id, "Failed to expose canary: {}", e);
                    self.emit(RunEvent::warning(
                        Phase::Canary,
                        "canary_exposure_failed",
                        json!({"policy_id": candidate.policy_id, "error": e.to_string()}),
                    ));
                    self.reject_or_skip(next, &candidate.policy_id, "exposure failed", now)
                        .await?;
                    return Ok(CanaryDecision {
                        kind: DecisionKind::None,
                        policy_id: Some(candidate.policy_id),
                        reason: Some(format!("exposure failed: {}", e)),
                        ..CanaryDecision::none()
                    });
                }
            }
        }

        let reason = format!(
            "score {:.4} beats incumbent {:.4}",
            best.score, incumbent_score
        );
        info!(policy_id = %candidate.policy_id, incumbent = %incumbent.policy_id, "Canary started: {}", reason);
        self.emit(RunEvent::info(
            Phase::Canary,
            "canary_started",
            json!({
                "policy_id": candidate.policy_id,
                "incumbent_id": incumbent.policy_id,
                "score": best.score,
                "incumbent_score": incumbent_score,
                "has_baseline": run.baseline.is_some(),
            }),
        ));
        next.population_state.canary = Some(run);

        Ok(CanaryDecision {
            kind: DecisionKind::Started,
            policy_id: Some(candidate.policy_id),
            reason: Some(reason),
            ..CanaryDecision::none()
        })
    }

    /// Collects one observation window and applies the gate's verdict.
    async fn observe_canary(
        &mut self,
        next: &mut Checkpoint,
        mut run: CanaryRun,
        signal: Option<&LiveSignal>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<CanaryDecision> {
        let sample = if self.live.is_some() {
            match self.signal_policy.assess(signal, run.exposed_at, now) {
                Evidence::Fresh(sample) => Some(sample),
                Evidence::Insufficient(reason) => {
                    debug!(policy_id = %run.policy_id, reason = %reason, "Canary window without evidence");
                    None
                }
            }
        } else {
            self.shadow_window(next, &mut run, now).await?
        };

        let mut candidate_live = None;
        if let Some(sample) = &sample {
            match self.registry.record_live_metrics(&run.policy_id, sample).await {
                Ok(policy) => candidate_live = policy.live_metrics,
                Err(e @ OverseerError::InvalidTransition { .. }) => {
                    self.skip_invalid_transition(next, &e, now);
                    return Ok(CanaryDecision::none());
                }
                Err(e) => return Err(e.into()),
            }
        } else if let Some(policy) = self.registry.get(&run.policy_id).await? {
            candidate_live = policy.live_metrics;
        }

        let decision = self
            .gate
            .evaluate(&mut run, candidate_live.as_ref(), sample.is_some(), now);

        let kind = match decision.verdict {
            Verdict::Extend => {
                debug!(policy_id = %run.policy_id, reason = %decision.reason, "Canary extended");
                self.emit(RunEvent::new(
                    Phase::Canary,
                    "canary_extended",
                    Severity::Debug,
                    json!({
                        "policy_id": run.policy_id,
                        "windows_observed": run.windows_observed,
                        "windows_elapsed": run.windows_elapsed,
                        "reason": decision.reason,
                    }),
                ));
                let policy_id = run.policy_id.clone();
                next.population_state.canary = Some(run);
                return Ok(CanaryDecision {
                    kind: DecisionKind::Extend,
                    policy_id: Some(policy_id),
                    reason: Some(decision.reason),
                    improvement: decision.improvement,
                    stability_regression: decision.stability_regression,
                });
            }
            Verdict::Promote => {
                match self
                    .registry
                    .finalize(&run.policy_id, FinalOutcome::Promoted)
                    .await
                {
                    Ok(_) => {
                        next.active_policy_id = Some(run.policy_id.clone());
                        info!(policy_id = %run.policy_id, previous = %run.incumbent_id, "✅ Canary promoted");
                        self.emit(RunEvent::info(
                            Phase::Canary,
                            "canary_promoted",
                            json!({
                                "policy_id": run.policy_id,
                                "previous_policy_id": run.incumbent_id,
                                "improvement": decision.improvement,
                                "reason": decision.reason,
                            }),
                        ));
                    }
                    Err(e @ OverseerError::InvalidTransition { .. }) => {
                        self.skip_invalid_transition(next, &e, now);
                    }
                    Err(e) => return Err(e.into()),
                }
                DecisionKind::Promote
            }
            Verdict::Rollback => {
                self.roll_back(next, &run, &decision.reason, decision.timed_out, now)
                    .await?;
                DecisionKind::Rollback
            }
        };

        Ok(CanaryDecision {
            kind,
            policy_id: Some(run.policy_id),
            reason: Some(decision.reason),
            improvement: decision.improvement,
            stability_regression: decision.stability_regression,
        })
    }

    /// Shadow mode: one canary-budget simulation of candidate and incumbent.
    /// The incumbent half accumulates into the run's baseline.
    async fn shadow_window(
        &self,
        next: &mut Checkpoint,
        run: &mut CanaryRun,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<LiveSample>> {
        let (Some(candidate), Some(incumbent)) = (
            self.registry.get(&run.policy_id).await?,
            self.registry.get(&run.incumbent_id).await?,
        ) else {
            return Ok(None);
        };
        let budget = EvalBudget {
            episodes: self.autotuner.knobs().canary_episodes,
            time_limit: Duration::from_millis(self.config.sim.eval_timeout_ms),
        };
        let mut results = self
            .evaluator
            .evaluate_all(
                vec![
                    (candidate.policy_id.clone(), candidate.parameters),
                    (incumbent.policy_id.clone(), incumbent.parameters),
                ],
                budget,
            )
            .await
            .into_iter();

        match (results.next(), results.next()) {
            (Some((_, Ok(cand))), Some((_, Ok(inc)))) => {
                let inc_sample = LiveSample {
                    objective_rate: inc.objective_rate,
                    stability_rate: inc.stability_rate,
                    confidence: 1.0,
                };
                run.baseline = Some(match run.baseline.take() {
                    Some(prev) => prev.accumulate(&inc_sample, self.config.canary.ewma_alpha, now),
                    None => LiveMetrics::from_sample(&inc_sample, now),
                });
                Ok(Some(LiveSample {
                    objective_rate: cand.objective_rate,
                    stability_rate: cand.stability_rate,
                    confidence: 1.0,
                }))
            }
            (cand, inc) => {
                let errors: Vec<String> = [cand, inc]
                    .into_iter()
                    .flatten()
                    .filter_map(|(id, r)| r.err().map(|e| format!("{}: {}", id, e)))
                    .collect();
                self.emit(RunEvent::warning(
                    Phase::Canary,
                    "shadow_window_failed",
                    json!({"policy_id": run.policy_id, "errors": errors}),
                ));
                self.record_failure(next, FailureKind::EvaluationError, now);
                Ok(None)
            }
        }
    }

    async fn roll_back(
        &mut self,
        next: &mut Checkpoint,
        run: &CanaryRun,
        reason: &str,
        timed_out: bool,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        match self
            .registry
            .finalize(&run.policy_id, FinalOutcome::RolledBack)
            .await
        {
            Ok(_) => {}
            Err(e @ OverseerError::InvalidTransition { .. }) => {
                self.skip_invalid_transition(next, &e, now);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
        warn!(policy_id = %run.policy_id, timed_out, "Canary rolled back: {}", reason);
        self.emit(RunEvent::warning(
            Phase::Canary,
            "canary_rollback",
            json!({
                "policy_id": run.policy_id,
                "incumbent_id": run.incumbent_id,
                "timed_out": timed_out,
                "reason": reason,
            }),
        ));
        if timed_out {
            self.record_failure(next, FailureKind::CanaryTimeout, now);
        }

        if run.exposed_at.is_some() {
            self.restore_incumbent(next, &run.policy_id, Some(run.incumbent_id.as_str()))
                .await?;
        }
        Ok(())
    }

    /// Re-exposes the incumbent after a live canary ends without promotion.
    /// When the revert is blocked or fails, the live environment may still
    /// run the candidate and `cp` is safe-paused.
    async fn restore_incumbent(
        &self,
        cp: &mut Checkpoint,
        candidate_id: &str,
        incumbent_id: Option<&str>,
    ) -> Result<(), OverseerError> {
        let Some(live) = &self.live else {
            return Ok(());
        };
        let Some(incumbent_id) = incumbent_id else {
            let reason = format!("no incumbent to restore after canary {}", candidate_id);
            error!("{}", reason);
            self.breaker.trip(cp, &reason);
            return Ok(());
        };
        let action = DestructiveAction::RevertLiveCanary {
            candidate: candidate_id.to_string(),
            incumbent: incumbent_id.to_string(),
        };
        if let Some(pause_reason) = self.breaker.gate_destructive(&action) {
            self.emit(RunEvent::new(
                Phase::Safety,
                "destructive_action_blocked",
                Severity::Critical,
                json!({"action": action.describe(), "reason": pause_reason}),
            ));
            self.breaker.trip(cp, &pause_reason);
            return Ok(());
        }
        let Some(incumbent) = self.registry.get(incumbent_id).await? else {
            let reason = format!(
                "incumbent {} missing from registry; live may still run {}",
                incumbent_id, candidate_id
            );
            error!("{}", reason);
            self.breaker.trip(cp, &reason);
            return Ok(());
        };
        if let Err(e) = live.expose(&incumbent).await {
            let reason = format!("failed to restore incumbent {}: {}", incumbent.policy_id, e);
            error!("{}", reason);
            self.emit(RunEvent::error(
                Phase::Canary,
                "incumbent_restore_failed",
                json!({"policy_id": incumbent.policy_id, "candidate_id": candidate_id, "error": e.to_string()}),
            ));
            self.breaker.trip(cp, &reason);
            return Ok(());
        }
        info!(policy_id = %incumbent.policy_id, candidate = %candidate_id, "Incumbent restored to live");
        self.emit(RunEvent::info(
            Phase::Canary,
            "incumbent_restored",
            json!({"policy_id": incumbent.policy_id, "candidate_id": candidate_id}),
        ));
        Ok(())
    }

    // ── Failure handling ──

    fn record_failure(&self, cp: &mut Checkpoint, kind: FailureKind, now: DateTime<Utc>) {
        if let Some(reason) = self.breaker.record_failure(cp, kind, now) {
            self.emit(RunEvent::new(
                Phase::Safety,
                "safety_pause",
                Severity::Critical,
                json!({"kind": kind, "reason": reason}),
            ));
        }
    }

    fn skip_invalid_transition(&self, cp: &mut Checkpoint, err: &OverseerError, now: DateTime<Utc>) {
        error!("Skipping record after invalid transition: {}", err);
        self.emit(RunEvent::error(Phase::Registry, "invalid_transition", json!({"error": err})));
        self.record_failure(cp, FailureKind::InvalidTransition, now);
    }

    async fn reject(&self, policy_id: &str, reason: &str) -> Result<(), OverseerError> {
        self.registry
            .finalize(policy_id, FinalOutcome::Rejected)
            .await?;
        debug!(policy_id = %policy_id, reason = %reason, "Policy rejected");
        self.emit(RunEvent::new(
            Phase::Registry,
            "policy_rejected",
            Severity::Debug,
            json!({"policy_id": policy_id, "reason": reason}),
        ));
        Ok(())
    }

    async fn reject_or_skip(
        &self,
        cp: &mut Checkpoint,
        policy_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), OverseerError> {
        match self.reject(policy_id, reason).await {
            Err(e @ OverseerError::InvalidTransition { .. }) => {
                self.skip_invalid_transition(cp, &e, now);
                Ok(())
            }
            other => other,
        }
    }

    /// Returns the backoff to sleep before the next attempt.
    async fn on_generation_error(&mut self, err: &anyhow::Error) -> Duration {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        let message = format!("{:#}", err);
        error!(consecutive = self.consecutive_errors, "Generation failed: {}", message);
        self.last_error = Some(message.clone());
        self.clear_progress().await;

        // Rows the failed generation committed have no checkpoint counterpart
        let mut cp = self.checkpoint.clone();
        if let Err(e) = self.reconcile(&mut cp).await {
            warn!("Reconciliation after failed generation failed: {}", e);
        }
        self.record_failure(&mut cp, FailureKind::LoopError, Utc::now());
        self.emit(RunEvent::error(
            Phase::Loop,
            "loop_error",
            json!({"error": message, "consecutive": self.consecutive_errors}),
        ));
        if self.commit(cp).await {
            self.publish_health().await;
        }
        self.breaker.backoff_for(self.consecutive_errors)
    }

    /// Persists `cp` with retries. On success it becomes the current
    /// checkpoint; on exhaustion the breaker trips and the loop pauses.
    /// `self.checkpoint` only ever holds what the store accepted.
    async fn commit(&mut self, cp: Checkpoint) -> bool {
        match persist_with_retry(self.store.as_ref(), &cp, &self.config.safety.persist_retry_ms).await
        {
            Ok(()) => {
                self.checkpoint = cp;
                self.held_pause = None;
                true
            }
            Err((attempts, e)) => {
                let reason = format!(
                    "checkpoint persistence failed after {} attempts: {}",
                    attempts, e
                );
                error!("{}", reason);
                self.last_error = Some(reason.clone());

                let mut paused = self.effective_checkpoint().clone();
                let now = Utc::now();
                self.breaker
                    .record_failure(&mut paused, FailureKind::PersistenceError, now);
                self.breaker.trip(&mut paused, &reason);
                self.emit(RunEvent::new(
                    Phase::Checkpoint,
                    "persistence_retry_exhausted",
                    Severity::Critical,
                    json!({"attempts": attempts, "error": e, "reason": reason}),
                ));
                match self.store.save(&paused).await {
                    Ok(()) => {
                        self.checkpoint = paused;
                        self.held_pause = None;
                    }
                    Err(e) => {
                        error!("Failed to persist safe-pause, holding it in memory: {}", e);
                        self.held_pause = Some(paused);
                    }
                }
                self.state = LoopState::Paused;
                self.publish_health().await;
                false
            }
        }
    }

    async fn retry_held_pause(&mut self) {
        let Some(held) = self.held_pause.take() else {
            return;
        };
        match self.store.save(&held).await {
            Ok(()) => {
                info!(reason = ?held.safe_pause_reason, "Held safe-pause persisted");
                self.checkpoint = held;
                self.publish_health().await;
            }
            Err(e) => {
                debug!("Safe-pause still not persisted: {}", e);
                self.held_pause = Some(held);
            }
        }
    }

    // ── Snapshots ──

    async fn read_signal(&self) -> Option<LiveSignal> {
        let live = self.live.as_ref()?;
        match live.read_signal().await {
            Ok(signal) => signal,
            Err(e) => {
                warn!("Live signal unavailable: {}", e);
                None
            }
        }
    }

    fn health(&self) -> HealthSnapshot {
        let now = Utc::now();
        let cp = self.effective_checkpoint();
        HealthSnapshot {
            state: self.state,
            generation: cp.loop_cursor,
            active_policy_id: cp.active_policy_id.clone(),
            safe_pause: cp.safe_pause,
            safe_pause_reason: cp.safe_pause_reason.clone(),
            recoveries_30m: self.breaker.recoveries(&cp.failure_counters, now),
            failure_counts: cp
                .failure_counters
                .counts_since(now - self.breaker.window())
                .into_iter()
                .map(|(kind, n)| (kind.to_string(), n))
                .collect(),
            sim_backend: self.evaluator.backend_kind(),
            last_error: self.last_error.clone(),
            last_success_ts: cp.last_success_ts,
            canary_policy_id: cp
                .population_state
                .canary
                .as_ref()
                .map(|r| r.policy_id.clone()),
            progress: self.progress.clone(),
            autotune: Some(self.autotuner.status()),
            updated_at: now,
            heartbeat_at: now,
        }
    }

    async fn publish_health(&self) {
        let health = self.health();
        let path = self.config.runtime.state_dir.join("health.json");
        if let Err(e) = write_json_atomic(&path, &health).await {
            warn!("Failed to write {}: {}", path.display(), e);
        }
        self.control.publish_health(health).await;
    }

    async fn publish_summary(&self, summary: GenerationSummary) {
        let path = self.config.runtime.state_dir.join("summary_latest.json");
        if let Err(e) = write_json_atomic(&path, &summary).await {
            warn!("Failed to write {}: {}", path.display(), e);
        }
        self.control.publish_summary(summary).await;
    }

    // ── Shutdown ──

    async fn shutdown(&mut self) {
        self.state = LoopState::Stopping;
        self.publish_health().await;

        let last = self.effective_checkpoint().clone();
        match persist_with_retry(self.store.as_ref(), &last, &self.config.safety.persist_retry_ms).await {
            Ok(()) => {
                self.checkpoint = last;
                self.held_pause = None;
            }
            Err((attempts, e)) => error!(attempts, "Final checkpoint save failed: {}", e),
        }
        let cp = self.effective_checkpoint();
        self.emit(RunEvent::info(
            Phase::Loop,
            "loop_stopped",
            json!({
                "loop_cursor": cp.loop_cursor,
                "active_policy_id": cp.active_policy_id,
                "population": cp.population_state.population.len(),
                "safe_pause": cp.safe_pause,
            }),
        ));
        self.store.flush_events().await;

        self.state = LoopState::Stopped;
        self.publish_health().await;
        info!(loop_cursor = self.checkpoint.loop_cursor, "Orchestrator stopped");
    }
}
