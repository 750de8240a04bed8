use anyhow::Context;
use axum::http::HeaderValue;
use overseer_shared::KnobSet;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Generation-error backoff used when no schedule is configured.
pub const DEFAULT_BACKOFF_SECONDS: [u64; 5] = [5, 15, 45, 120, 300];
/// One week.
pub const MAX_CRASH_LOOP_WINDOW_MINUTES: i64 = 7 * 24 * 60;
/// One day.
pub const MAX_SIGNAL_AGE_SECS: i64 = 24 * 60 * 60;
/// One week.
pub const MAX_CANARY_DURATION_SECS: u64 = 7 * 24 * 60 * 60;

/// Where the checkpoint row lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointBackend {
    /// Single-row table committed in a transaction.
    Sqlite,
    /// `checkpoint.json` written to a temp file and renamed into place.
    File,
}

impl FromStr for CheckpointBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "file" => Ok(Self::File),
            other => anyhow::bail!("expected 'sqlite' or 'file', got '{}'", other),
        }
    }
}

/// Simulation backend selection policy, resolved once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendMode {
    Auto,
    Native,
    Fallback,
}

impl FromStr for BackendMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "native" => Ok(Self::Native),
            "fallback" => Ok(Self::Fallback),
            other => anyhow::bail!("expected 'auto', 'native' or 'fallback', got '{}'", other),
        }
    }
}

/// How the runtime autotuner treats its recommendations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutotuneMode {
    Off,
    /// Recommend and log only.
    Shadow,
    Enforce,
}

impl FromStr for AutotuneMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "shadow" => Ok(Self::Shadow),
            "enforce" => Ok(Self::Enforce),
            other => anyhow::bail!("expected 'off', 'shadow' or 'enforce', got '{}'", other),
        }
    }
}

impl std::fmt::Display for AutotuneMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Off => f.write_str("off"),
            Self::Shadow => f.write_str("shadow"),
            Self::Enforce => f.write_str("enforce"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub state_dir: PathBuf,
    pub database_url: String,
    pub checkpoint_backend: CheckpointBackend,
    pub events_file: PathBuf,
    pub max_parallel_workers: usize,
    pub loop_sleep_ms: u64,
    /// Period of the liveness heartbeat written next to `health.json`.
    pub heartbeat_secs: u64,
    pub max_generations: Option<u64>,
    pub seed: Option<u64>,
    pub port: u16,
    pub bind_address: String,
    pub cors_origins: Vec<HeaderValue>,
}

#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub candidates_per_generation: usize,
    pub population_cap: usize,
    /// Largest absolute change applied to one knob by a wide mutation.
    pub mutation_delta: f64,
    pub crossover_rate: f64,
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub backend: BackendMode,
    pub binary: PathBuf,
    pub batch_episodes: u32,
    pub canary_episodes: u32,
    pub eval_timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct CanaryConfig {
    pub improvement_threshold: f64,
    pub stability_tolerance: f64,
    pub min_windows: u32,
    pub max_windows: u32,
    pub max_duration_secs: u64,
    pub ewma_alpha: f64,
}

#[derive(Debug, Clone)]
pub struct SafetyConfig {
    pub crash_loop_limit: u32,
    pub crash_loop_window_minutes: i64,
    pub backoff_seconds: Vec<u64>,
    pub persist_retry_ms: Vec<u64>,
    pub require_armed_safety: bool,
    pub allow_destructive_actions: bool,
}

#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub enabled: bool,
    pub signal_file: PathBuf,
    pub active_policy_file: PathBuf,
    pub signal_max_age_secs: i64,
    pub min_confidence: f64,
}

#[derive(Debug, Clone)]
pub struct ScoringConfig {
    pub objective_weight: f64,
    pub progress_weight: f64,
    pub stability_weight: f64,
    /// 0 disables the objective bias.
    pub objective_bias_strength: f64,
}

/// Bounds and targets of the runtime autotuner.
#[derive(Debug, Clone)]
pub struct AutotuneConfig {
    pub mode: AutotuneMode,
    pub interval_secs: u64,
    /// Normalized process CPU usage band, 1.0 meaning every core busy.
    pub cpu_target_min: f64,
    pub cpu_target_max: f64,
    pub min_workers: usize,
    pub max_workers: usize,
    pub cooldown_minutes: i64,
    pub batch_episodes_min: u32,
    pub batch_episodes_max: u32,
    pub canary_episodes_min: u32,
    pub canary_episodes_max: u32,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub runtime: RuntimeConfig,
    pub search: SearchConfig,
    pub sim: SimConfig,
    pub canary: CanaryConfig,
    pub safety: SafetyConfig,
    pub live: LiveConfig,
    pub scoring: ScoringConfig,
    pub autotune: AutotuneConfig,
    pub knobs: KnobSet,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::with_state_dir(PathBuf::from("runtime"))
    }
}

impl AppConfig {
    /// Defaults with every derived path rooted at `state_dir`.
    #[must_use]
    pub fn with_state_dir(state_dir: PathBuf) -> Self {
        Self {
            runtime: RuntimeConfig {
                database_url: format!("sqlite:{}?mode=rwc", state_dir.join("state.db").display()),
                checkpoint_backend: CheckpointBackend::Sqlite,
                events_file: state_dir.join("events").join("run_events.jsonl"),
                max_parallel_workers: 4,
                loop_sleep_ms: 1000,
                heartbeat_secs: 15,
                max_generations: None,
                seed: None,
                port: 8091,
                bind_address: "127.0.0.1".to_string(),
                cors_origins: vec![],
                state_dir: state_dir.clone(),
            },
            search: SearchConfig {
                candidates_per_generation: 16,
                population_cap: 8,
                mutation_delta: 0.16,
                crossover_rate: 0.25,
            },
            sim: SimConfig {
                backend: BackendMode::Auto,
                binary: PathBuf::from("sim-core/target/release/sim-core"),
                batch_episodes: 24,
                canary_episodes: 50,
                eval_timeout_ms: 30_000,
            },
            canary: CanaryConfig {
                improvement_threshold: 0.03,
                stability_tolerance: 0.02,
                min_windows: 1,
                max_windows: 10,
                max_duration_secs: 1800,
                ewma_alpha: 0.3,
            },
            safety: SafetyConfig {
                crash_loop_limit: 6,
                crash_loop_window_minutes: 30,
                backoff_seconds: DEFAULT_BACKOFF_SECONDS.to_vec(),
                persist_retry_ms: vec![200, 1000, 4000],
                require_armed_safety: true,
                allow_destructive_actions: false,
            },
            live: LiveConfig {
                enabled: false,
                signal_file: state_dir.join("live").join("memory_signal.json"),
                active_policy_file: state_dir.join("live").join("active_policy.json"),
                signal_max_age_secs: 20,
                min_confidence: 0.35,
            },
            scoring: ScoringConfig {
                objective_weight: 0.60,
                progress_weight: 0.25,
                stability_weight: 0.15,
                objective_bias_strength: 0.0,
            },
            autotune: AutotuneConfig {
                mode: AutotuneMode::Off,
                interval_secs: 120,
                cpu_target_min: 0.70,
                cpu_target_max: 0.85,
                min_workers: 2,
                max_workers: 8,
                cooldown_minutes: 10,
                batch_episodes_min: 8,
                batch_episodes_max: 96,
                canary_episodes_min: 30,
                canary_episodes_max: 160,
            },
            knobs: KnobSet::default(),
        }
    }

    #[allow(clippy::too_many_lines)]
    pub fn load() -> anyhow::Result<Self> {
        let state_dir = env::var("OVERSEER_STATE_DIR").map_or_else(|_| PathBuf::from("runtime"), PathBuf::from);
        let mut config = Self::with_state_dir(state_dir);

        // Runtime
        if let Ok(url) = env::var("DATABASE_URL") {
            config.runtime.database_url = url;
        }
        if let Some(backend) = parse_var::<CheckpointBackend>("OVERSEER_CHECKPOINT_BACKEND")? {
            config.runtime.checkpoint_backend = backend;
        }
        if let Ok(path) = env::var("OVERSEER_EVENTS_FILE") {
            config.runtime.events_file = PathBuf::from(path);
        }
        if let Some(workers) = parse_var::<usize>("OVERSEER_MAX_PARALLEL_WORKERS")? {
            config.runtime.max_parallel_workers = workers;
        }
        if config.runtime.max_parallel_workers == 0 || config.runtime.max_parallel_workers > 64 {
            anyhow::bail!(
                "OVERSEER_MAX_PARALLEL_WORKERS must be between 1 and 64 (got {})",
                config.runtime.max_parallel_workers
            );
        }
        if let Some(ms) = parse_var::<u64>("OVERSEER_LOOP_SLEEP_MS")? {
            config.runtime.loop_sleep_ms = ms;
        }
        if config.runtime.loop_sleep_ms > 3_600_000 {
            anyhow::bail!(
                "OVERSEER_LOOP_SLEEP_MS must be at most 3600000 (got {})",
                config.runtime.loop_sleep_ms
            );
        }
        if let Some(secs) = parse_var::<u64>("OVERSEER_HEARTBEAT_SECS")? {
            config.runtime.heartbeat_secs = secs;
        }
        if config.runtime.heartbeat_secs == 0 || config.runtime.heartbeat_secs > 3600 {
            anyhow::bail!(
                "OVERSEER_HEARTBEAT_SECS must be between 1 and 3600 (got {})",
                config.runtime.heartbeat_secs
            );
        }
        config.runtime.max_generations = parse_var::<u64>("OVERSEER_MAX_GENERATIONS")?;
        config.runtime.seed = parse_var::<u64>("OVERSEER_SEED")?;

        let port_str = env::var("PORT").unwrap_or_else(|_| config.runtime.port.to_string());
        let port = port_str.parse::<u16>().map_err(|_| {
            anyhow::anyhow!(
                "Invalid PORT value '{}': must be an integer between 1 and 65535",
                port_str
            )
        })?;
        if port == 0 {
            anyhow::bail!("Invalid PORT value '0': must be between 1 and 65535");
        }
        config.runtime.port = port;

        // Loopback by default; the control API has no authentication of its own.
        if let Ok(addr) = env::var("BIND_ADDRESS") {
            addr.parse::<std::net::IpAddr>().with_context(|| {
                format!("Invalid BIND_ADDRESS '{}': must be a valid IP address", addr)
            })?;
            if addr != "127.0.0.1" && addr != "::1" {
                tracing::warn!("BIND_ADDRESS {} exposes the control API beyond loopback", addr);
            }
            config.runtime.bind_address = addr;
        }

        config.runtime.cors_origins = env::var("CORS_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .filter_map(|origin| {
                if !origin.starts_with("http://") && !origin.starts_with("https://") {
                    tracing::warn!("Skipping CORS origin with invalid scheme '{}'", origin);
                    return None;
                }
                match origin.parse::<HeaderValue>() {
                    Ok(v) => Some(v),
                    Err(e) => {
                        tracing::warn!("Skipping invalid CORS origin '{}': {}", origin, e);
                        None
                    }
                }
            })
            .collect();

        // Search
        if let Some(n) = parse_var::<usize>("OVERSEER_CANDIDATES_PER_GENERATION")? {
            config.search.candidates_per_generation = n;
        }
        if config.search.candidates_per_generation == 0
            || config.search.candidates_per_generation > 256
        {
            anyhow::bail!(
                "OVERSEER_CANDIDATES_PER_GENERATION must be between 1 and 256 (got {})",
                config.search.candidates_per_generation
            );
        }
        if let Some(n) = parse_var::<usize>("OVERSEER_POPULATION_CAP")? {
            config.search.population_cap = n;
        }
        if config.search.population_cap == 0 {
            anyhow::bail!("OVERSEER_POPULATION_CAP must be at least 1");
        }
        if let Some(d) = parse_var::<f64>("OVERSEER_MUTATION_DELTA")? {
            config.search.mutation_delta = d;
        }
        if !(config.search.mutation_delta > 0.0 && config.search.mutation_delta <= 1.0) {
            anyhow::bail!(
                "OVERSEER_MUTATION_DELTA must be in (0, 1] (got {})",
                config.search.mutation_delta
            );
        }
        if let Some(r) = parse_var::<f64>("OVERSEER_CROSSOVER_RATE")? {
            config.search.crossover_rate = r;
        }
        ensure_unit("OVERSEER_CROSSOVER_RATE", config.search.crossover_rate)?;

        // Simulation
        if let Some(mode) = parse_var::<BackendMode>("OVERSEER_SIM_BACKEND")? {
            config.sim.backend = mode;
        }
        if let Ok(path) = env::var("OVERSEER_SIM_BINARY") {
            config.sim.binary = PathBuf::from(path);
        }
        if let Some(n) = parse_var::<u32>("OVERSEER_BATCH_EPISODES")? {
            config.sim.batch_episodes = n;
        }
        if let Some(n) = parse_var::<u32>("OVERSEER_CANARY_EPISODES")? {
            config.sim.canary_episodes = n;
        }
        if config.sim.batch_episodes == 0 || config.sim.canary_episodes == 0 {
            anyhow::bail!("OVERSEER_BATCH_EPISODES and OVERSEER_CANARY_EPISODES must be at least 1");
        }
        if let Some(ms) = parse_var::<u64>("OVERSEER_EVAL_TIMEOUT_MS")? {
            config.sim.eval_timeout_ms = ms;
        }
        if config.sim.eval_timeout_ms == 0 {
            anyhow::bail!("OVERSEER_EVAL_TIMEOUT_MS must be at least 1");
        }

        // Canary
        if let Some(v) = parse_var::<f64>("OVERSEER_IMPROVEMENT_THRESHOLD")? {
            config.canary.improvement_threshold = v;
        }
        ensure_unit("OVERSEER_IMPROVEMENT_THRESHOLD", config.canary.improvement_threshold)?;
        if let Some(v) = parse_var::<f64>("OVERSEER_STABILITY_TOLERANCE")? {
            config.canary.stability_tolerance = v;
        }
        ensure_unit("OVERSEER_STABILITY_TOLERANCE", config.canary.stability_tolerance)?;
        if let Some(n) = parse_var::<u32>("OVERSEER_CANARY_MIN_WINDOWS")? {
            config.canary.min_windows = n;
        }
        if let Some(n) = parse_var::<u32>("OVERSEER_CANARY_MAX_WINDOWS")? {
            config.canary.max_windows = n;
        }
        if config.canary.min_windows == 0 || config.canary.max_windows < config.canary.min_windows {
            anyhow::bail!(
                "Canary windows must satisfy 1 <= min ({}) <= max ({})",
                config.canary.min_windows,
                config.canary.max_windows
            );
        }
        if let Some(s) = parse_var::<u64>("OVERSEER_CANARY_MAX_DURATION_SECS")? {
            config.canary.max_duration_secs = s;
        }
        if config.canary.max_duration_secs == 0
            || config.canary.max_duration_secs > MAX_CANARY_DURATION_SECS
        {
            anyhow::bail!(
                "OVERSEER_CANARY_MAX_DURATION_SECS must be between 1 and {} (got {})",
                MAX_CANARY_DURATION_SECS,
                config.canary.max_duration_secs
            );
        }
        if let Some(a) = parse_var::<f64>("OVERSEER_LIVE_EWMA_ALPHA")? {
            config.canary.ewma_alpha = a;
        }
        if !(config.canary.ewma_alpha > 0.0 && config.canary.ewma_alpha <= 1.0) {
            anyhow::bail!(
                "OVERSEER_LIVE_EWMA_ALPHA must be in (0, 1] (got {})",
                config.canary.ewma_alpha
            );
        }

        // Safety
        if let Some(n) = parse_var::<u32>("OVERSEER_CRASH_LOOP_LIMIT")? {
            config.safety.crash_loop_limit = n;
        }
        if config.safety.crash_loop_limit == 0 {
            anyhow::bail!("OVERSEER_CRASH_LOOP_LIMIT must be at least 1");
        }
        if let Some(m) = parse_var::<i64>("OVERSEER_CRASH_LOOP_WINDOW_MINUTES")? {
            config.safety.crash_loop_window_minutes = m;
        }
        if config.safety.crash_loop_window_minutes <= 0
            || config.safety.crash_loop_window_minutes > MAX_CRASH_LOOP_WINDOW_MINUTES
        {
            anyhow::bail!(
                "OVERSEER_CRASH_LOOP_WINDOW_MINUTES must be between 1 and {} (got {})",
                MAX_CRASH_LOOP_WINDOW_MINUTES,
                config.safety.crash_loop_window_minutes
            );
        }
        if let Some(list) = parse_list("OVERSEER_BACKOFF_SECONDS")? {
            config.safety.backoff_seconds = list;
        }
        if let Some(list) = parse_list("OVERSEER_PERSIST_RETRY_MS")? {
            config.safety.persist_retry_ms = list;
        }
        if let Some(b) = parse_bool("OVERSEER_REQUIRE_ARMED_SAFETY")? {
            config.safety.require_armed_safety = b;
        }
        if let Some(b) = parse_bool("OVERSEER_ALLOW_DESTRUCTIVE_ACTIONS")? {
            config.safety.allow_destructive_actions = b;
        }
        if !config.safety.require_armed_safety {
            tracing::warn!("OVERSEER_REQUIRE_ARMED_SAFETY is off: live reverts run without operator gating");
        }

        // Live
        if let Some(b) = parse_bool("OVERSEER_LIVE_ENABLED")? {
            config.live.enabled = b;
        }
        if let Ok(path) = env::var("OVERSEER_LIVE_SIGNAL_FILE") {
            config.live.signal_file = PathBuf::from(path);
        }
        if let Ok(path) = env::var("OVERSEER_LIVE_ACTIVE_POLICY_FILE") {
            config.live.active_policy_file = PathBuf::from(path);
        }
        if let Some(s) = parse_var::<i64>("OVERSEER_LIVE_SIGNAL_MAX_AGE_SECS")? {
            config.live.signal_max_age_secs = s;
        }
        if config.live.signal_max_age_secs <= 0 || config.live.signal_max_age_secs > MAX_SIGNAL_AGE_SECS {
            anyhow::bail!(
                "OVERSEER_LIVE_SIGNAL_MAX_AGE_SECS must be between 1 and {} (got {})",
                MAX_SIGNAL_AGE_SECS,
                config.live.signal_max_age_secs
            );
        }
        if let Some(c) = parse_var::<f64>("OVERSEER_LIVE_MIN_CONFIDENCE")? {
            config.live.min_confidence = c;
        }
        ensure_unit("OVERSEER_LIVE_MIN_CONFIDENCE", config.live.min_confidence)?;

        // Scoring
        if let Some(w) = parse_var::<f64>("OVERSEER_WEIGHT_OBJECTIVE")? {
            config.scoring.objective_weight = w;
        }
        if let Some(w) = parse_var::<f64>("OVERSEER_WEIGHT_PROGRESS")? {
            config.scoring.progress_weight = w;
        }
        if let Some(w) = parse_var::<f64>("OVERSEER_WEIGHT_STABILITY")? {
            config.scoring.stability_weight = w;
        }
        let weights = [
            config.scoring.objective_weight,
            config.scoring.progress_weight,
            config.scoring.stability_weight,
        ];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) || weights.iter().sum::<f64>() <= 0.0 {
            anyhow::bail!("Score weights must be non-negative with a positive sum (got {:?})", weights);
        }
        if let Some(s) = parse_var::<f64>("OVERSEER_OBJECTIVE_BIAS_STRENGTH")? {
            config.scoring.objective_bias_strength = s;
        }
        if !(0.0..=2.0).contains(&config.scoring.objective_bias_strength) {
            anyhow::bail!(
                "OVERSEER_OBJECTIVE_BIAS_STRENGTH must be between 0 and 2 (got {})",
                config.scoring.objective_bias_strength
            );
        }

        // Autotune
        let tune = &mut config.autotune;
        if let Some(mode) = parse_var::<AutotuneMode>("OVERSEER_AUTOTUNE_MODE")? {
            tune.mode = mode;
        }
        if let Some(secs) = parse_var::<u64>("OVERSEER_AUTOTUNE_INTERVAL_SECS")? {
            tune.interval_secs = secs;
        }
        if tune.interval_secs == 0 {
            anyhow::bail!("OVERSEER_AUTOTUNE_INTERVAL_SECS must be at least 1");
        }
        if let Some(v) = parse_var::<f64>("OVERSEER_AUTOTUNE_CPU_TARGET_MIN")? {
            tune.cpu_target_min = v;
        }
        if let Some(v) = parse_var::<f64>("OVERSEER_AUTOTUNE_CPU_TARGET_MAX")? {
            tune.cpu_target_max = v;
        }
        ensure_unit("OVERSEER_AUTOTUNE_CPU_TARGET_MIN", tune.cpu_target_min)?;
        ensure_unit("OVERSEER_AUTOTUNE_CPU_TARGET_MAX", tune.cpu_target_max)?;
        if tune.cpu_target_min > tune.cpu_target_max {
            anyhow::bail!(
                "Autotune CPU target must satisfy min ({}) <= max ({})",
                tune.cpu_target_min,
                tune.cpu_target_max
            );
        }
        if let Some(n) = parse_var::<usize>("OVERSEER_AUTOTUNE_MIN_WORKERS")? {
            tune.min_workers = n;
        }
        if let Some(n) = parse_var::<usize>("OVERSEER_AUTOTUNE_MAX_WORKERS")? {
            tune.max_workers = n;
        }
        if tune.min_workers == 0 || tune.max_workers > 64 || tune.min_workers > tune.max_workers {
            anyhow::bail!(
                "Autotune workers must satisfy 1 <= min ({}) <= max ({}) <= 64",
                tune.min_workers,
                tune.max_workers
            );
        }
        if let Some(m) = parse_var::<i64>("OVERSEER_AUTOTUNE_COOLDOWN_MINUTES")? {
            tune.cooldown_minutes = m;
        }
        if !(0..=24 * 60).contains(&tune.cooldown_minutes) {
            anyhow::bail!(
                "OVERSEER_AUTOTUNE_COOLDOWN_MINUTES must be between 0 and 1440 (got {})",
                tune.cooldown_minutes
            );
        }
        if let Some(n) = parse_var::<u32>("OVERSEER_AUTOTUNE_BATCH_EPISODES_MIN")? {
            tune.batch_episodes_min = n;
        }
        if let Some(n) = parse_var::<u32>("OVERSEER_AUTOTUNE_BATCH_EPISODES_MAX")? {
            tune.batch_episodes_max = n;
        }
        if let Some(n) = parse_var::<u32>("OVERSEER_AUTOTUNE_CANARY_EPISODES_MIN")? {
            tune.canary_episodes_min = n;
        }
        if let Some(n) = parse_var::<u32>("OVERSEER_AUTOTUNE_CANARY_EPISODES_MAX")? {
            tune.canary_episodes_max = n;
        }
        if tune.batch_episodes_min == 0
            || tune.batch_episodes_min > tune.batch_episodes_max
            || tune.canary_episodes_min == 0
            || tune.canary_episodes_min > tune.canary_episodes_max
        {
            anyhow::bail!(
                "Autotune episode bounds must satisfy 1 <= min <= max (batch {}..{}, canary {}..{})",
                tune.batch_episodes_min,
                tune.batch_episodes_max,
                tune.canary_episodes_min,
                tune.canary_episodes_max
            );
        }

        Ok(config)
    }
}

fn parse_var<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("Failed to parse {}", key)),
        _ => Ok(None),
    }
}

fn parse_bool(key: &str) -> anyhow::Result<Option<bool>> {
    match env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "" => Ok(None),
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            other => anyhow::bail!("Failed to parse {}: '{}' is not a boolean", key, other),
        },
        Err(_) => Ok(None),
    }
}

fn parse_list(key: &str) -> anyhow::Result<Option<Vec<u64>>> {
    let Ok(raw) = env::var(key) else {
        return Ok(None);
    };
    let list = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u64>())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse {}", key))?;
    if list.is_empty() {
        anyhow::bail!("{} must contain at least one value", key);
    }
    Ok(Some(list))
}

fn ensure_unit(key: &str, value: f64) -> anyhow::Result<()> {
    if !(0.0..=1.0).contains(&value) {
        anyhow::bail!("{} must be between 0 and 1 (got {})", key, value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Env var tests must not run in parallel
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    struct EnvGuard(&'static str);

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            std::env::remove_var(self.0);
        }
    }

    #[test]
    fn test_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        let config = AppConfig::load().unwrap();
        assert_eq!(config.runtime.max_parallel_workers, 4);
        assert_eq!(config.search.population_cap, 8);
        assert_eq!(config.safety.backoff_seconds, vec![5, 15, 45, 120, 300]);
        assert!(!config.live.enabled);
        assert!((config.scoring.objective_weight - 0.60).abs() < 1e-9);
        assert_eq!(config.knobs.knobs.len(), 4);
    }

    #[test]
    fn test_state_dir_roots_derived_paths() {
        let _lock = ENV_LOCK.lock().unwrap();
        std::env::set_var("OVERSEER_STATE_DIR", "/tmp/overseer-test-state");
        let _guard = EnvGuard("OVERSEER_STATE_DIR");

        let config = AppConfig::load().unwrap();
        assert_eq!(
            config.runtime.events_file,
            PathBuf::from("/tmp/overseer-test-state/events/run_events.jsonl")
        );
        assert!(config.runtime.database_url.contains("/tmp/overseer-test-state/state.db"));
    }

    #[test]
    fn test_worker_range_validation() {
        let _lock = ENV_LOCK.lock().unwrap();
        std::env::set_var("OVERSEER_MAX_PARALLEL_WORKERS", "0");
        let _guard = EnvGuard("OVERSEER_MAX_PARALLEL_WORKERS");

        let err = AppConfig::load().unwrap_err();
        assert!(err.to_string().contains("OVERSEER_MAX_PARALLEL_WORKERS"));
    }

    #[test]
    fn test_backoff_list_parsing() {
        let _lock = ENV_LOCK.lock().unwrap();
        std::env::set_var("OVERSEER_BACKOFF_SECONDS", " 1, 2 ,3 ");
        let _guard = EnvGuard("OVERSEER_BACKOFF_SECONDS");

        let config = AppConfig::load().unwrap();
        assert_eq!(config.safety.backoff_seconds, vec![1, 2, 3]);
    }

    #[test]
    fn test_backend_mode_parsing() {
        let _lock = ENV_LOCK.lock().unwrap();
        std::env::set_var("OVERSEER_SIM_BACKEND", "Fallback");
        let _guard = EnvGuard("OVERSEER_SIM_BACKEND");

        let config = AppConfig::load().unwrap();
        assert_eq!(config.sim.backend, BackendMode::Fallback);
    }

    #[test]
    fn test_invalid_bool_is_rejected() {
        let _lock = ENV_LOCK.lock().unwrap();
        std::env::set_var("OVERSEER_LIVE_ENABLED", "maybe");
        let _guard = EnvGuard("OVERSEER_LIVE_ENABLED");

        assert!(AppConfig::load().is_err());
    }

    #[test]
    fn test_oversized_durations_are_rejected() {
        let _lock = ENV_LOCK.lock().unwrap();
        for (key, value) in [
            ("OVERSEER_CRASH_LOOP_WINDOW_MINUTES", "9223372036854775807"),
            ("OVERSEER_LIVE_SIGNAL_MAX_AGE_SECS", "9223372036854775807"),
            ("OVERSEER_CANARY_MAX_DURATION_SECS", "18446744073709551615"),
        ] {
            std::env::set_var(key, value);
            let _guard = EnvGuard(key);
            let err = AppConfig::load().unwrap_err();
            assert!(err.to_string().contains(key), "{}: {}", key, err);
        }
    }

    #[test]
    fn test_upper_bounds_are_inclusive() {
        let _lock = ENV_LOCK.lock().unwrap();
        std::env::set_var("OVERSEER_CRASH_LOOP_WINDOW_MINUTES", MAX_CRASH_LOOP_WINDOW_MINUTES.to_string());
        let _guard = EnvGuard("OVERSEER_CRASH_LOOP_WINDOW_MINUTES");

        let config = AppConfig::load().unwrap();
        assert_eq!(config.safety.crash_loop_window_minutes, MAX_CRASH_LOOP_WINDOW_MINUTES);
    }

    #[test]
    fn test_autotune_mode_and_bounds() {
        let _lock = ENV_LOCK.lock().unwrap();
        std::env::set_var("OVERSEER_AUTOTUNE_MODE", "Enforce");
        let _mode = EnvGuard("OVERSEER_AUTOTUNE_MODE");

        let config = AppConfig::load().unwrap();
        assert_eq!(config.autotune.mode, AutotuneMode::Enforce);
        assert_eq!(config.autotune.max_workers, 8);

        std::env::set_var("OVERSEER_AUTOTUNE_MIN_WORKERS", "9");
        let _workers = EnvGuard("OVERSEER_AUTOTUNE_MIN_WORKERS");
        let err = AppConfig::load().unwrap_err();
        assert!(err.to_string().contains("Autotune workers"));
    }

    #[test]
    fn test_inverted_cpu_band_is_rejected() {
        let _lock = ENV_LOCK.lock().unwrap();
        std::env::set_var("OVERSEER_AUTOTUNE_CPU_TARGET_MIN", "0.9");
        let _guard = EnvGuard("OVERSEER_AUTOTUNE_CPU_TARGET_MIN");

        assert!(AppConfig::load().is_err());
    }
}
