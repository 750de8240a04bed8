use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use overseer_shared::{LiveSample, LiveSignal, Policy};
use serde::Serialize;
use std::path::PathBuf;
use tracing::debug;

use crate::checkpoint::write_json_atomic;
use crate::config::{LiveConfig, MAX_SIGNAL_AGE_SECS};

/// The external environment a canary is exposed to.
#[async_trait]
pub trait LiveEnvironment: Send + Sync {
    /// Makes `policy` the one the environment runs. Returns the exposure time.
    async fn expose(&self, policy: &Policy) -> anyhow::Result<DateTime<Utc>>;

    /// Latest signal, `None` when none has been produced yet.
    async fn read_signal(&self) -> anyhow::Result<Option<LiveSignal>>;
}

#[derive(Serialize)]
struct ActivePolicyDocument<'a> {
    policy_id: &'a str,
    parameters: &'a overseer_shared::PolicyParameters,
    exposed_at: DateTime<Utc>,
}

/// File handoff with the input daemon: the active policy is written as JSON,
/// the signal is read from the collector's JSON file.
#[derive(Debug, Clone)]
pub struct FileLiveEnvironment {
    signal_file: PathBuf,
    active_policy_file: PathBuf,
}

impl FileLiveEnvironment {
    #[must_use]
    pub fn new(config: &LiveConfig) -> Self {
        Self {
            signal_file: config.signal_file.clone(),
            active_policy_file: config.active_policy_file.clone(),
        }
    }
}

#[async_trait]
impl LiveEnvironment for FileLiveEnvironment {
    async fn expose(&self, policy: &Policy) -> anyhow::Result<DateTime<Utc>> {
        let exposed_at = Utc::now();
        write_json_atomic(
            &self.active_policy_file,
            &ActivePolicyDocument {
                policy_id: &policy.policy_id,
                parameters: &policy.parameters,
                exposed_at,
            },
        )
        .await?;
        debug!(policy_id = %policy.policy_id, "Policy exposed to live environment");
        Ok(exposed_at)
    }

    async fn read_signal(&self) -> anyhow::Result<Option<LiveSignal>> {
        let raw = match tokio::fs::read_to_string(&self.signal_file).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "Failed to read live signal {}: {}",
                    self.signal_file.display(),
                    e
                ))
            }
        };
        let signal = serde_json::from_str(&raw).map_err(|e| {
            anyhow::anyhow!("Malformed live signal {}: {}", self.signal_file.display(), e)
        })?;
        Ok(Some(signal))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Evidence {
    Fresh(LiveSample),
    Insufficient(String),
}

/// Staleness and confidence cutoffs for live signals.
#[derive(Debug, Clone, Copy)]
pub struct SignalPolicy {
    pub max_age: ChronoDuration,
    pub min_confidence: f64,
}

impl SignalPolicy {
    #[must_use]
    pub fn new(config: &LiveConfig) -> Self {
        Self {
            max_age: ChronoDuration::seconds(config.signal_max_age_secs.clamp(0, MAX_SIGNAL_AGE_SECS)),
            min_confidence: config.min_confidence,
        }
    }

    /// Signals produced before `exposed_at` describe the previous policy and
    /// are not evidence for the current one.
    #[must_use]
    pub fn assess(
        &self,
        signal: Option<&LiveSignal>,
        exposed_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Evidence {
        let Some(signal) = signal else {
            return Evidence::Insufficient("no live signal".into());
        };
        if signal.blocked {
            return Evidence::Insufficient(format!(
                "signal blocked: {}",
                signal.reason.as_deref().unwrap_or("unspecified")
            ));
        }
        if signal.stale {
            return Evidence::Insufficient("signal marked stale".into());
        }
        let age = now - signal.generated_at;
        if age > self.max_age {
            return Evidence::Insufficient(format!("signal is {}s old", age.num_seconds()));
        }
        if let Some(exposed) = exposed_at {
            if signal.generated_at < exposed {
                return Evidence::Insufficient("signal predates exposure".into());
            }
        }
        if !signal.confidence.is_finite() || signal.confidence < self.min_confidence {
            return Evidence::Insufficient(format!(
                "confidence {:.2} below {:.2}",
                signal.confidence, self.min_confidence
            ));
        }
        Evidence::Fresh(signal.sample())
    }
}
