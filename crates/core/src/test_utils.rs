use crate::checkpoint::{CheckpointStore, SqliteCheckpointStore};
use crate::config::{AppConfig, BackendMode};
use crate::control::ControlHandle;
use crate::evaluator::{BackendKind, EvalBudget, Evaluator, SimulationBackend};
use crate::events::EventLog;
use crate::live::LiveEnvironment;
use crate::orchestrator::Orchestrator;
use crate::registry::PolicyRegistry;
use async_trait::async_trait;
use overseer_shared::{EvaluationError, PolicyParameters, SimMetrics};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub fn temp_state_dir() -> PathBuf {
    std::env::temp_dir().join(format!("overseer-test-{}", uuid::Uuid::new_v4()))
}

/// Small, fast, deterministic settings rooted at `state_dir`.
pub fn test_config(state_dir: &Path) -> AppConfig {
    let mut config = AppConfig::with_state_dir(state_dir.to_path_buf());
    config.runtime.loop_sleep_ms = 0;
    config.runtime.max_generations = Some(3);
    config.runtime.seed = Some(7);
    config.search.candidates_per_generation = 4;
    config.search.population_cap = 3;
    config.sim.backend = BackendMode::Fallback;
    config.sim.batch_episodes = 6;
    config.sim.canary_episodes = 6;
    config.sim.eval_timeout_ms = 5_000;
    config.safety.backoff_seconds = vec![0];
    config.safety.persist_retry_ms = vec![0, 0];
    config
}

pub async fn create_test_pool() -> SqlitePool {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    crate::db::init_db(&pool).await.unwrap();
    pool
}

pub fn create_test_registry(pool: &SqlitePool, state_dir: &Path) -> PolicyRegistry {
    PolicyRegistry::new(pool.clone(), state_dir.join("policies"), 0.3)
}

pub fn metrics(objective_rate: f64, progress_rate: f64, stability_rate: f64) -> SimMetrics {
    SimMetrics {
        episodes: 6,
        objective_rate,
        progress_rate,
        stability_rate,
        mean_elapsed_s: 600.0,
        variance: 0.01,
    }
}

/// Backend returning fixed metrics, or failing every call while `failing` is set.
pub struct ScriptedBackend {
    pub metrics: SimMetrics,
    pub failing: AtomicBool,
    pub calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn healthy(metrics: SimMetrics) -> Arc<Self> {
        Arc::new(Self {
            metrics,
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            metrics: metrics(0.5, 0.5, 0.5),
            failing: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl SimulationBackend for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Fallback
    }

    async fn run_batch(
        &self,
        _params: &PolicyParameters,
        _budget: EvalBudget,
        _seed: u64,
    ) -> Result<SimMetrics, EvaluationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(EvaluationError::BackendUnavailable("scripted failure".into()));
        }
        Ok(self.metrics.clone())
    }
}

/// Everything an orchestrator needs, kept around so a test can restart the
/// loop against the same state.
pub struct TestHarness {
    pub config: AppConfig,
    pub pool: SqlitePool,
    pub store: Arc<dyn CheckpointStore>,
    pub registry: PolicyRegistry,
}

impl TestHarness {
    /// File-backed sqlite under a fresh temp dir, so a second pool sees the
    /// same database.
    pub async fn new() -> Self {
        Self::with_config(test_config(&temp_state_dir())).await
    }

    pub async fn with_config(config: AppConfig) -> Self {
        std::fs::create_dir_all(&config.runtime.state_dir).unwrap();
        let pool = crate::db::connect(&config.runtime.database_url).await.unwrap();
        crate::db::init_db(&pool).await.unwrap();
        let events = EventLog::spawn(config.runtime.events_file.clone());
        let store: Arc<dyn CheckpointStore> = Arc::new(SqliteCheckpointStore::new(pool.clone(), events));
        let registry = PolicyRegistry::new(
            pool.clone(),
            config.runtime.state_dir.join("policies"),
            config.canary.ewma_alpha,
        );
        Self {
            config,
            pool,
            store,
            registry,
        }
    }

    pub fn orchestrator(
        &self,
        backend: Arc<dyn SimulationBackend>,
        control: &ControlHandle,
    ) -> Orchestrator {
        self.orchestrator_with(backend, None, self.store.clone(), control)
    }

    /// Orchestrator with a live environment and/or a wrapped checkpoint store.
    pub fn orchestrator_with(
        &self,
        backend: Arc<dyn SimulationBackend>,
        live: Option<Arc<dyn LiveEnvironment>>,
        store: Arc<dyn CheckpointStore>,
        control: &ControlHandle,
    ) -> Orchestrator {
        let evaluator = Evaluator::new(
            backend,
            self.config.runtime.max_parallel_workers,
            self.config.knobs.clone(),
            self.config.runtime.seed.unwrap_or(7),
        );
        Orchestrator::new(
            self.config.clone(),
            store,
            self.registry.clone(),
            evaluator,
            live,
            control.clone(),
        )
    }
}

pub fn create_test_app_state() -> Arc<crate::AppState> {
    Arc::new(crate::AppState {
        control: ControlHandle::new(BackendKind::Fallback),
        config: test_config(&temp_state_dir()),
    })
}
