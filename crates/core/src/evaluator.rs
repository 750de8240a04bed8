use async_trait::async_trait;
use futures::future::join_all;
use overseer_shared::{EvaluationError, KnobSet, PolicyParameters, SimMetrics};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::{BackendMode, SimConfig};

/// Episodes run per native process invocation; the deadline is checked between chunks.
const NATIVE_CHUNK_EPISODES: u32 = 8;
/// Slack granted to a running chunk past the deadline before it is abandoned.
const NATIVE_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Native,
    Fallback,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Native => f.write_str("native"),
            Self::Fallback => f.write_str("fallback"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalBudget {
    pub episodes: u32,
    pub time_limit: Duration,
}

/// Outcome of one simulated episode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpisodeResult {
    #[serde(alias = "unlock_rate")]
    pub progress: f64,
    pub objective_complete: bool,
    pub stability: f64,
    pub elapsed_s: f64,
}

impl EpisodeResult {
    fn composite(&self) -> f64 {
        let objective = if self.objective_complete { 1.0 } else { 0.0 };
        (objective + self.progress + self.stability) / 3.0
    }
}

/// Folds episodes into [`SimMetrics`]. Variance is the sample variance of
/// the per-episode composite outcome.
#[must_use]
pub fn aggregate(episodes: &[EpisodeResult]) -> SimMetrics {
    let n = episodes.len();
    if n == 0 {
        return SimMetrics {
            episodes: 0,
            objective_rate: 0.0,
            progress_rate: 0.0,
            stability_rate: 0.0,
            mean_elapsed_s: 0.0,
            variance: 0.0,
        };
    }
    let nf = n as f64;
    let mean = |f: &dyn Fn(&EpisodeResult) -> f64| episodes.iter().map(f).sum::<f64>() / nf;

    let composite_mean = mean(&EpisodeResult::composite);
    let variance = if n > 1 {
        episodes
            .iter()
            .map(|e| (e.composite() - composite_mean).powi(2))
            .sum::<f64>()
            / (nf - 1.0)
    } else {
        0.0
    };

    SimMetrics {
        episodes: u32::try_from(n).unwrap_or(u32::MAX),
        objective_rate: mean(&|e| if e.objective_complete { 1.0 } else { 0.0 }),
        progress_rate: mean(&|e| e.progress),
        stability_rate: mean(&|e| e.stability),
        mean_elapsed_s: mean(&|e| e.elapsed_s),
        variance,
    }
}

/// A black-box scorer of policy parameters.
#[async_trait]
pub trait SimulationBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Runs up to `budget.episodes` episodes, stopping at an episode boundary
    /// once `budget.time_limit` has elapsed.
    async fn run_batch(
        &self,
        params: &PolicyParameters,
        budget: EvalBudget,
        seed: u64,
    ) -> Result<SimMetrics, EvaluationError>;
}

/// In-process analytic simulator.
#[derive(Debug, Default, Clone)]
pub struct FallbackBackend;

fn knob(params: &PolicyParameters, name: &str) -> f64 {
    params.get(name).unwrap_or(0.5).clamp(0.0, 1.0)
}

fn fallback_episode<R: Rng>(params: &PolicyParameters, rng: &mut R) -> EpisodeResult {
    let (a, g, s, f) = (
        knob(params, "aggression"),
        knob(params, "greed"),
        knob(params, "safety"),
        knob(params, "focus"),
    );

    let progress = (0.42 * a + 0.36 * g + 0.20 * f - 0.10 * (s - 0.72).max(0.0)
        + rng.gen_range(-0.08..0.08))
    .clamp(0.0, 1.0);
    let stability = (0.62 * s + 0.22 * f
        - 0.12 * (a - g).abs()
        - 0.08 * (a - 0.82).max(0.0)
        + rng.gen_range(-0.06..0.06))
    .clamp(0.0, 1.0);
    let objective_p = (0.18 + 0.58 * progress + 0.24 * stability).clamp(0.01, 0.99);
    let objective_complete = rng.gen::<f64>() < objective_p;
    let elapsed_s =
        (1800.0 * (1.0 - 0.65 * progress) * (1.0 + rng.gen_range(-0.08..0.05))).clamp(80.0, 2000.0);

    EpisodeResult {
        progress,
        objective_complete,
        stability,
        elapsed_s,
    }
}

#[async_trait]
impl SimulationBackend for FallbackBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Fallback
    }

    async fn run_batch(
        &self,
        params: &PolicyParameters,
        budget: EvalBudget,
        seed: u64,
    ) -> Result<SimMetrics, EvaluationError> {
        let params = params.clone();
        tokio::task::spawn_blocking(move || {
            let started = Instant::now();
            let mut rng = StdRng::seed_from_u64(seed);
            let mut episodes = Vec::with_capacity(budget.episodes as usize);
            for completed in 0..budget.episodes {
                if started.elapsed() >= budget.time_limit {
                    return Err(EvaluationError::Timeout {
                        elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                        episodes_completed: completed,
                    });
                }
                episodes.push(fallback_episode(&params, &mut rng));
            }
            Ok(aggregate(&episodes))
        })
        .await
        .map_err(|e| EvaluationError::BackendUnavailable(format!("fallback worker failed: {}", e)))?
    }
}

#[derive(Debug, Deserialize)]
struct NativeOutput {
    episodes: Vec<EpisodeResult>,
}

/// External `sim-core` executable, invoked once per chunk of episodes.
#[derive(Debug, Clone)]
pub struct NativeBackend {
    binary: PathBuf,
}

impl NativeBackend {
    #[must_use]
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    #[must_use]
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    async fn run_chunk(
        &self,
        params: &PolicyParameters,
        episodes: u32,
        seed: u64,
        ceiling: Duration,
    ) -> Result<Vec<EpisodeResult>, EvaluationError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--episodes")
            .arg(episodes.to_string())
            .arg("--seed")
            .arg(seed.to_string())
            .kill_on_drop(true);
        for (name, value) in params.iter() {
            cmd.arg(format!("--{}", name)).arg(format!("{:.6}", value));
        }

        let output = match tokio::time::timeout(ceiling, cmd.output()).await {
            Err(_) => return Err(EvaluationError::BackendUnavailable("chunk overran its budget".into())),
            Ok(Err(e)) => {
                return Err(EvaluationError::BackendUnavailable(format!(
                    "failed to run {}: {}",
                    self.binary.display(),
                    e
                )))
            }
            Ok(Ok(output)) => output,
        };
        if !output.status.success() {
            return Err(EvaluationError::BackendUnavailable(format!(
                "{} exited with {}: {}",
                self.binary.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let parsed: NativeOutput = serde_json::from_slice(&output.stdout).map_err(|e| {
            EvaluationError::BackendUnavailable(format!("unparseable sim output: {}", e))
        })?;
        Ok(parsed.episodes)
    }
}

#[async_trait]
impl SimulationBackend for NativeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    async fn run_batch(
        &self,
        params: &PolicyParameters,
        budget: EvalBudget,
        seed: u64,
    ) -> Result<SimMetrics, EvaluationError> {
        let started = Instant::now();
        let mut episodes = Vec::with_capacity(budget.episodes as usize);
        let mut chunk_seed = seed;

        while (episodes.len() as u32) < budget.episodes {
            let elapsed = started.elapsed();
            if elapsed >= budget.time_limit {
                return Err(EvaluationError::Timeout {
                    elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                    episodes_completed: episodes.len() as u32,
                });
            }
            let want = (budget.episodes - episodes.len() as u32).min(NATIVE_CHUNK_EPISODES);
            let ceiling = budget.time_limit - elapsed + NATIVE_GRACE;
            match self.run_chunk(params, want, chunk_seed, ceiling).await {
                Ok(chunk) if chunk.is_empty() => {
                    return Err(EvaluationError::BackendUnavailable("sim returned no episodes".into()))
                }
                Ok(chunk) => episodes.extend(chunk.into_iter().take(want as usize)),
                Err(_) if started.elapsed() >= budget.time_limit => {
                    return Err(EvaluationError::Timeout {
                        elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                        episodes_completed: episodes.len() as u32,
                    });
                }
                Err(e) => return Err(e),
            }
            chunk_seed = chunk_seed.wrapping_add(1);
        }

        debug!(episodes = episodes.len(), elapsed_ms = started.elapsed().as_millis() as u64, "Native batch complete");
        Ok(aggregate(&episodes))
    }
}

/// Resolves the configured backend mode once at startup.
pub fn select_backend(config: &SimConfig) -> anyhow::Result<Arc<dyn SimulationBackend>> {
    let native_present = config.binary.is_file();
    match config.backend {
        BackendMode::Native if !native_present => anyhow::bail!(
            "OVERSEER_SIM_BACKEND=native but {} does not exist",
            config.binary.display()
        ),
        BackendMode::Native => Ok(Arc::new(NativeBackend::new(config.binary.clone()))),
        BackendMode::Auto if native_present => {
            info!(binary = %config.binary.display(), "Using native simulation backend");
            Ok(Arc::new(NativeBackend::new(config.binary.clone())))
        }
        BackendMode::Auto => {
            warn!(
                binary = %config.binary.display(),
                "Native simulator not found, using fallback backend"
            );
            Ok(Arc::new(FallbackBackend))
        }
        BackendMode::Fallback => Ok(Arc::new(FallbackBackend)),
    }
}

/// Validating, parallelism-capped front of a [`SimulationBackend`].
#[derive(Clone)]
pub struct Evaluator {
    backend: Arc<dyn SimulationBackend>,
    workers: Arc<Semaphore>,
    max_parallel_workers: usize,
    knobs: KnobSet,
    next_seed: Arc<AtomicU64>,
}

impl Evaluator {
    #[must_use]
    pub fn new(
        backend: Arc<dyn SimulationBackend>,
        max_parallel_workers: usize,
        knobs: KnobSet,
        seed: u64,
    ) -> Self {
        let max_parallel_workers = max_parallel_workers.max(1);
        Self {
            backend,
            workers: Arc::new(Semaphore::new(max_parallel_workers)),
            max_parallel_workers,
            knobs,
            next_seed: Arc::new(AtomicU64::new(seed)),
        }
    }

    #[must_use]
    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    #[must_use]
    pub fn max_parallel_workers(&self) -> usize {
        self.max_parallel_workers
    }

    /// Resizes the worker pool. Only call between batches: evaluations
    /// already holding a permit keep the old pool.
    pub fn set_max_parallel_workers(&mut self, n: usize) {
        let n = n.max(1);
        if n != self.max_parallel_workers {
            debug!(from = self.max_parallel_workers, to = n, "Resizing evaluator pool");
            self.workers = Arc::new(Semaphore::new(n));
            self.max_parallel_workers = n;
        }
    }

    fn take_seed(&self) -> u64 {
        self.next_seed.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn evaluate(
        &self,
        params: &PolicyParameters,
        budget: EvalBudget,
    ) -> Result<SimMetrics, EvaluationError> {
        let seed = self.take_seed();
        self.evaluate_seeded(params, budget, seed).await
    }

    async fn evaluate_seeded(
        &self,
        params: &PolicyParameters,
        budget: EvalBudget,
        seed: u64,
    ) -> Result<SimMetrics, EvaluationError> {
        self.knobs
            .validate(params)
            .map_err(EvaluationError::InvalidParameters)?;
        if budget.episodes == 0 {
            return Err(EvaluationError::InvalidParameters("episode budget is zero".into()));
        }
        let _permit = self
            .workers
            .acquire()
            .await
            .map_err(|_| EvaluationError::BackendUnavailable("evaluator shut down".into()))?;
        self.backend.run_batch(params, budget, seed).await
    }

    /// Evaluates every candidate and returns once all of them have finished,
    /// in input order. Seeds are assigned up front so results do not depend
    /// on scheduling.
    pub async fn evaluate_all(
        &self,
        candidates: Vec<(String, PolicyParameters)>,
        budget: EvalBudget,
    ) -> Vec<(String, Result<SimMetrics, EvaluationError>)> {
        let jobs = candidates.into_iter().map(|(id, params)| {
            let seed = self.take_seed();
            async move {
                let result = self.evaluate_seeded(&params, budget, seed).await;
                (id, result)
            }
        });
        join_all(jobs).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn budget(episodes: u32) -> EvalBudget {
        EvalBudget {
            episodes,
            time_limit: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_aggregate_rates_and_variance() {
        let eps = [
            EpisodeResult { progress: 0.5, objective_complete: true, stability: 0.5, elapsed_s: 100.0 },
            EpisodeResult { progress: 0.5, objective_complete: false, stability: 0.5, elapsed_s: 300.0 },
        ];
        let m = aggregate(&eps);
        assert_eq!(m.episodes, 2);
        assert!((m.objective_rate - 0.5).abs() < 1e-9);
        assert!((m.mean_elapsed_s - 200.0).abs() < 1e-9);
        // composites 2/3 and 1/3
        assert!((m.variance - (2.0 * (1.0f64 / 6.0).powi(2))).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_fallback_is_deterministic_per_seed() {
        let params = KnobSet::default().baseline();
        let a = FallbackBackend.run_batch(&params, budget(24), 9).await.unwrap();
        let b = FallbackBackend.run_batch(&params, budget(24), 9).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.episodes, 24);
        assert!((0.0..=1.0).contains(&a.stability_rate));
    }

    #[tokio::test]
    async fn test_zero_time_budget_times_out_at_episode_boundary() {
        let params = KnobSet::default().baseline();
        let err = FallbackBackend
            .run_batch(
                &params,
                EvalBudget {
                    episodes: 10,
                    time_limit: Duration::ZERO,
                },
                1,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EvaluationError::Timeout { episodes_completed: 0, .. }));
    }

    #[tokio::test]
    async fn test_invalid_parameters_are_rejected_before_backend() {
        let evaluator = Evaluator::new(Arc::new(FallbackBackend), 2, KnobSet::default(), 1);
        let mut params = KnobSet::default().baseline();
        params.set("aggression", 3.0);
        let err = evaluator.evaluate(&params, budget(4)).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_parameters");
    }

    #[tokio::test]
    async fn test_missing_native_binary_is_backend_unavailable() {
        let backend = NativeBackend::new(PathBuf::from("/nonexistent/sim-core"));
        let err = backend
            .run_batch(&KnobSet::default().baseline(), budget(4), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, EvaluationError::BackendUnavailable(_)));
    }

    struct CountingBackend {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl SimulationBackend for CountingBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Fallback
        }

        async fn run_batch(
            &self,
            _params: &PolicyParameters,
            budget: EvalBudget,
            _seed: u64,
        ) -> Result<SimMetrics, EvaluationError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(aggregate(&vec![
                EpisodeResult { progress: 0.5, objective_complete: true, stability: 0.5, elapsed_s: 1.0 };
                budget.episodes as usize
            ]))
        }
    }

    #[tokio::test]
    async fn test_evaluate_all_respects_worker_cap_and_order() {
        let backend = Arc::new(CountingBackend {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let evaluator = Evaluator::new(backend.clone(), 2, KnobSet::default(), 1);
        let candidates: Vec<_> = (0..6)
            .map(|i| (format!("c{}", i), KnobSet::default().baseline()))
            .collect();

        let results = evaluator.evaluate_all(candidates, budget(3)).await;
        assert_eq!(results.len(), 6);
        assert_eq!(results[0].0, "c0");
        assert_eq!(results[5].0, "c5");
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        assert!(backend.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_resized_pool_applies_to_next_batch() {
        let backend = Arc::new(CountingBackend {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let mut evaluator = Evaluator::new(backend.clone(), 4, KnobSet::default(), 1);
        evaluator.set_max_parallel_workers(1);
        assert_eq!(evaluator.max_parallel_workers(), 1);

        let candidates: Vec<_> = (0..4)
            .map(|i| (format!("c{}", i), KnobSet::default().baseline()))
            .collect();
        evaluator.evaluate_all(candidates, budget(2)).await;
        assert_eq!(backend.peak.load(Ordering::SeqCst), 1);

        evaluator.set_max_parallel_workers(0);
        assert_eq!(evaluator.max_parallel_workers(), 1);
    }
}
