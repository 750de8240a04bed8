use chrono::{DateTime, SecondsFormat, Utc};
use overseer_shared::{
    FinalOutcome, LiveMetrics, LiveSample, OverseerError, OverseerResult, Policy,
    PolicyParameters, PromotionState, SimMetrics,
};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::checkpoint::write_json_atomic;
use crate::db::{bounded, from_json_text, to_json_text};

const POLICY_COLUMNS: &str = "policy_id, parent_policy_id, created_at, parameters, sim_metrics, \
                              live_metrics, promotion_state, score";

#[derive(sqlx::FromRow)]
struct PolicyRow {
    policy_id: String,
    parent_policy_id: Option<String>,
    created_at: String,
    parameters: String,
    sim_metrics: Option<String>,
    live_metrics: Option<String>,
    promotion_state: String,
    score: Option<f64>,
}

impl PolicyRow {
    fn into_policy(self) -> OverseerResult<Policy> {
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| OverseerError::Persistence(format!("Corrupt created_at: {}", e)))?;
        let promotion_state = self
            .promotion_state
            .parse::<PromotionState>()
            .map_err(OverseerError::Persistence)?;
        Ok(Policy {
            policy_id: self.policy_id,
            parent_policy_id: self.parent_policy_id,
            created_at,
            parameters: from_json_text("parameters", &self.parameters)?,
            sim_metrics: self
                .sim_metrics
                .as_deref()
                .map(|raw| from_json_text("sim_metrics", raw))
                .transpose()?,
            live_metrics: self
                .live_metrics
                .as_deref()
                .map(|raw| from_json_text("live_metrics", raw))
                .transpose()?,
            promotion_state,
            score: self.score,
        })
    }
}

/// `p-<generation:06>-<8 hex>`
#[must_use]
pub fn new_policy_id(generation: u64) -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("p-{:06}-{}", generation, &hex[..8])
}

/// Versioned policy records with lineage, stored in sqlite and mirrored to
/// per-policy manifests.
///
/// Every mutation is a conditional update on the expected state, so a
/// rejected transition leaves the row untouched.
#[derive(Clone)]
pub struct PolicyRegistry {
    pool: SqlitePool,
    policies_dir: PathBuf,
    ewma_alpha: f64,
}

impl PolicyRegistry {
    #[must_use]
    pub fn new(pool: SqlitePool, policies_dir: PathBuf, ewma_alpha: f64) -> Self {
        Self {
            pool,
            policies_dir,
            ewma_alpha,
        }
    }

    #[must_use]
    pub fn policies_dir(&self) -> &Path {
        &self.policies_dir
    }

    /// Seeds `policy_id` as the promoted policy when nothing is promoted yet.
    /// Returns the promoted policy either way.
    pub async fn bootstrap(
        &self,
        policy_id: &str,
        parameters: PolicyParameters,
    ) -> OverseerResult<Policy> {
        if let Some(active) = self.get_active().await? {
            return Ok(active);
        }
        let policy = Policy {
            policy_id: policy_id.to_string(),
            parent_policy_id: None,
            created_at: Utc::now(),
            parameters,
            sim_metrics: None,
            live_metrics: None,
            promotion_state: PromotionState::Promoted,
            score: None,
        };
        self.insert(&policy).await?;
        info!(policy_id = %policy_id, "Baseline policy bootstrapped");
        self.write_manifest(&policy).await;
        Ok(policy)
    }

    /// Registers a new proposed policy.
    pub async fn create(
        &self,
        parent_id: Option<&str>,
        parameters: PolicyParameters,
        generation: u64,
    ) -> OverseerResult<Policy> {
        if let Some(parent) = parent_id {
            if self.get(parent).await?.is_none() {
                return Err(OverseerError::ParentNotFound(parent.to_string()));
            }
        }
        let policy = Policy {
            policy_id: new_policy_id(generation),
            parent_policy_id: parent_id.map(str::to_string),
            created_at: Utc::now(),
            parameters,
            sim_metrics: None,
            live_metrics: None,
            promotion_state: PromotionState::Proposed,
            score: None,
        };
        self.insert(&policy).await?;
        debug!(policy_id = %policy.policy_id, parent = ?parent_id, "Policy created");
        self.write_manifest(&policy).await;
        Ok(policy)
    }

    async fn insert(&self, policy: &Policy) -> OverseerResult<()> {
        bounded(
            sqlx::query(
                "INSERT INTO policies (policy_id, parent_policy_id, created_at, parameters, \
                 sim_metrics, live_metrics, promotion_state, score) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&policy.policy_id)
            .bind(&policy.parent_policy_id)
            .bind(policy.created_at.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            .bind(to_json_text(&policy.parameters)?)
            .bind(policy.sim_metrics.as_ref().map(to_json_text).transpose()?)
            .bind(policy.live_metrics.as_ref().map(to_json_text).transpose()?)
            .bind(policy.promotion_state.as_str())
            .bind(policy.score)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    pub async fn get(&self, policy_id: &str) -> OverseerResult<Option<Policy>> {
        let row: Option<PolicyRow> = bounded(
            sqlx::query_as(&format!("SELECT {} FROM policies WHERE policy_id = ?", POLICY_COLUMNS))
                .bind(policy_id)
                .fetch_optional(&self.pool),
        )
        .await?;
        row.map(PolicyRow::into_policy).transpose()
    }

    async fn require(&self, policy_id: &str) -> OverseerResult<Policy> {
        self.get(policy_id)
            .await?
            .ok_or_else(|| OverseerError::PolicyNotFound(policy_id.to_string()))
    }

    /// The single promoted policy.
    pub async fn get_active(&self) -> OverseerResult<Option<Policy>> {
        let row: Option<PolicyRow> = bounded(
            sqlx::query_as(&format!(
                "SELECT {} FROM policies WHERE promotion_state = 'promoted'",
                POLICY_COLUMNS
            ))
            .fetch_optional(&self.pool),
        )
        .await?;
        row.map(PolicyRow::into_policy).transpose()
    }

    pub async fn list_by_state(&self, state: PromotionState) -> OverseerResult<Vec<Policy>> {
        let rows: Vec<PolicyRow> = bounded(
            sqlx::query_as(&format!(
                "SELECT {} FROM policies WHERE promotion_state = ? ORDER BY created_at",
                POLICY_COLUMNS
            ))
            .bind(state.as_str())
            .fetch_all(&self.pool),
        )
        .await?;
        rows.into_iter().map(PolicyRow::into_policy).collect()
    }

    /// Ancestors of `policy_id`, nearest parent first, ending at the root.
    pub async fn lineage(&self, policy_id: &str) -> OverseerResult<Vec<Policy>> {
        self.require(policy_id).await?;
        let rows: Vec<PolicyRow> = bounded(
            sqlx::query_as(
                "WITH RECURSIVE ancestors(policy_id, depth) AS ( \
                   SELECT parent_policy_id, 1 FROM policies \
                     WHERE policy_id = ? AND parent_policy_id IS NOT NULL \
                   UNION ALL \
                   SELECT p.parent_policy_id, a.depth + 1 FROM policies p \
                     JOIN ancestors a ON p.policy_id = a.policy_id \
                     WHERE p.parent_policy_id IS NOT NULL \
                 ) \
                 SELECT p.policy_id, p.parent_policy_id, p.created_at, p.parameters, p.sim_metrics, \
                        p.live_metrics, p.promotion_state, p.score \
                 FROM policies p JOIN ancestors a ON p.policy_id = a.policy_id \
                 ORDER BY a.depth",
            )
            .bind(policy_id)
            .fetch_all(&self.pool),
        )
        .await?;
        rows.into_iter().map(PolicyRow::into_policy).collect()
    }

    /// `proposed -> simulated`
    pub async fn record_sim_metrics(
        &self,
        policy_id: &str,
        metrics: &SimMetrics,
        score: f64,
    ) -> OverseerResult<Policy> {
        let to = PromotionState::Simulated;
        let current = self.require(policy_id).await?;
        self.check_transition(&current, PromotionState::Proposed, to)?;

        let result = bounded(
            sqlx::query(
                "UPDATE policies SET promotion_state = ?, sim_metrics = ?, score = ? \
                 WHERE policy_id = ? AND promotion_state = 'proposed'",
            )
            .bind(to.as_str())
            .bind(to_json_text(metrics)?)
            .bind(score)
            .bind(policy_id)
            .execute(&self.pool),
        )
        .await?;
        self.after_update(policy_id, current.promotion_state, to, result.rows_affected())
            .await
    }

    /// `simulated -> canary`
    pub async fn start_canary(&self, policy_id: &str) -> OverseerResult<Policy> {
        self.simple_transition(policy_id, PromotionState::Simulated, PromotionState::Canary)
            .await
    }

    /// Folds one observation window into the canary's live metrics.
    pub async fn record_live_metrics(
        &self,
        policy_id: &str,
        sample: &LiveSample,
    ) -> OverseerResult<Policy> {
        let current = self.require(policy_id).await?;
        if current.promotion_state != PromotionState::Canary {
            return Err(OverseerError::InvalidTransition {
                policy_id: policy_id.to_string(),
                from: current.promotion_state,
                to: PromotionState::Canary,
            });
        }
        let now = Utc::now();
        let live = match &current.live_metrics {
            Some(prev) => prev.accumulate(sample, self.ewma_alpha, now),
            None => LiveMetrics::from_sample(sample, now),
        };

        let result = bounded(
            sqlx::query(
                "UPDATE policies SET live_metrics = ? \
                 WHERE policy_id = ? AND promotion_state = 'canary'",
            )
            .bind(to_json_text(&live)?)
            .bind(policy_id)
            .execute(&self.pool),
        )
        .await?;
        self.after_update(
            policy_id,
            PromotionState::Canary,
            PromotionState::Canary,
            result.rows_affected(),
        )
        .await
    }

    /// Applies a terminal outcome. Promotion supersedes the previously
    /// promoted policy in the same transaction.
    pub async fn finalize(&self, policy_id: &str, outcome: FinalOutcome) -> OverseerResult<Policy> {
        let to = PromotionState::from(outcome);
        let current = self.require(policy_id).await?;
        self.check_transition(&current, current.promotion_state, to)?;

        if outcome != FinalOutcome::Promoted {
            return self
                .simple_transition(policy_id, current.promotion_state, to)
                .await;
        }

        let previous = self.get_active().await?;
        let mut tx = bounded(self.pool.begin()).await?;
        bounded(
            sqlx::query(
                "UPDATE policies SET promotion_state = 'superseded' \
                 WHERE promotion_state = 'promoted' AND policy_id != ?",
            )
            .bind(policy_id)
            .execute(&mut *tx),
        )
        .await?;
        let result = bounded(
            sqlx::query(
                "UPDATE policies SET promotion_state = 'promoted' \
                 WHERE policy_id = ? AND promotion_state = ?",
            )
            .bind(policy_id)
            .bind(current.promotion_state.as_str())
            .execute(&mut *tx),
        )
        .await?;
        if result.rows_affected() == 0 {
            bounded(tx.rollback()).await?;
            return self
                .after_update(policy_id, current.promotion_state, to, 0)
                .await;
        }
        bounded(tx.commit()).await?;

        if let Some(prev) = previous.filter(|p| p.policy_id != policy_id) {
            info!(policy_id = %prev.policy_id, successor = %policy_id, "Policy superseded");
            if let Some(updated) = self.get(&prev.policy_id).await? {
                self.write_manifest(&updated).await;
            }
        }
        self.after_update(policy_id, current.promotion_state, to, 1).await
    }

    async fn simple_transition(
        &self,
        policy_id: &str,
        from: PromotionState,
        to: PromotionState,
    ) -> OverseerResult<Policy> {
        let current = self.require(policy_id).await?;
        self.check_transition(&current, from, to)?;
        let result = bounded(
            sqlx::query(
                "UPDATE policies SET promotion_state = ? WHERE policy_id = ? AND promotion_state = ?",
            )
            .bind(to.as_str())
            .bind(policy_id)
            .bind(from.as_str())
            .execute(&self.pool),
        )
        .await?;
        self.after_update(policy_id, from, to, result.rows_affected())
            .await
    }

    fn check_transition(
        &self,
        current: &Policy,
        expected: PromotionState,
        to: PromotionState,
    ) -> OverseerResult<()> {
        if current.promotion_state != expected || !expected.can_transition_to(to) {
            return Err(OverseerError::InvalidTransition {
                policy_id: current.policy_id.clone(),
                from: current.promotion_state,
                to,
            });
        }
        Ok(())
    }

    /// Re-reads the row after a conditional update. Zero affected rows means
    /// the state moved underneath us.
    async fn after_update(
        &self,
        policy_id: &str,
        from: PromotionState,
        to: PromotionState,
        rows_affected: u64,
    ) -> OverseerResult<Policy> {
        let policy = self.require(policy_id).await?;
        if rows_affected == 0 {
            return Err(OverseerError::InvalidTransition {
                policy_id: policy_id.to_string(),
                from: policy.promotion_state,
                to,
            });
        }
        if from != to {
            debug!(policy_id = %policy_id, from = %from, to = %to, "Policy transition");
        }
        self.write_manifest(&policy).await;
        Ok(policy)
    }

    /// Mirrors the record to `<policies_dir>/<id>/manifest.json`. The database
    /// stays authoritative, so a failed write only warns.
    async fn write_manifest(&self, policy: &Policy) {
        let path = self
            .policies_dir
            .join(&policy.policy_id)
            .join("manifest.json");
        if let Err(e) = write_json_atomic(&path, policy).await {
            warn!(policy_id = %policy.policy_id, "Failed to write policy manifest: {}", e);
        }
    }
}
