use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod policy;

pub use policy::{
    FinalOutcome, KnobSet, KnobSpec, LiveMetrics, LiveSample, LiveSignal, Policy,
    PolicyParameters, PromotionState, SimMetrics, BASELINE_POLICY_ID,
};

/// Component that emitted a RunEvent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Loop,
    Search,
    Evaluator,
    Canary,
    Safety,
    Control,
    Registry,
    Checkpoint,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Loop => "loop",
            Self::Search => "search",
            Self::Evaluator => "evaluator",
            Self::Canary => "canary",
            Self::Safety => "safety",
            Self::Control => "control",
            Self::Registry => "registry",
            Self::Checkpoint => "checkpoint",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Append-only audit record. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub ts: DateTime<Utc>,
    pub phase: Phase,
    pub event_type: String,
    pub severity: Severity,
    pub payload: serde_json::Value,
}

impl RunEvent {
    pub fn new(
        phase: Phase,
        event_type: impl Into<String>,
        severity: Severity,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            ts: Utc::now(),
            phase,
            event_type: event_type.into(),
            severity,
            payload,
        }
    }

    pub fn info(phase: Phase, event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::new(phase, event_type, Severity::Info, payload)
    }

    pub fn warning(
        phase: Phase,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(phase, event_type, Severity::Warning, payload)
    }

    pub fn error(phase: Phase, event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::new(phase, event_type, Severity::Error, payload)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "detail")]
pub enum EvaluationError {
    #[error("Evaluation timed out after {elapsed_ms}ms ({episodes_completed} episodes completed)")]
    Timeout {
        elapsed_ms: u64,
        episodes_completed: u32,
    },
    #[error("Simulation backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
}

impl EvaluationError {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::BackendUnavailable(_) => "backend_unavailable",
            Self::InvalidParameters(_) => "invalid_parameters",
        }
    }
}

#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "detail")]
pub enum OverseerError {
    #[error("Invalid transition for {policy_id}: {from} -> {to}")]
    InvalidTransition {
        policy_id: String,
        from: PromotionState,
        to: PromotionState,
    },
    #[error("Policy not found: {0}")]
    PolicyNotFound(String),
    #[error("Parent policy not found: {0}")]
    ParentNotFound(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),
    #[error("Destructive action blocked: {0}")]
    DestructiveActionBlocked(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type OverseerResult<T> = std::result::Result<T, OverseerError>;
