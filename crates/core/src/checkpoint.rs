use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use overseer_shared::{OverseerError, OverseerResult, RunEvent};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::db::{bounded, from_json_text, to_json_text};
use crate::events::EventLog;
use crate::population::PopulationState;
use crate::safety::FailureCounters;

/// The minimal durable state required to resume the loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Number of completed generations.
    pub loop_cursor: u64,
    pub active_policy_id: Option<String>,
    pub population_state: PopulationState,
    pub failure_counters: FailureCounters,
    pub last_success_ts: Option<DateTime<Utc>>,
    pub safe_pause: bool,
    pub safe_pause_reason: Option<String>,
}

/// Durable home of the [`Checkpoint`] plus the RunEvent sink.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// `None` on first run.
    async fn load(&self) -> OverseerResult<Option<Checkpoint>>;

    /// Replaces the stored checkpoint atomically.
    async fn save(&self, checkpoint: &Checkpoint) -> OverseerResult<()>;

    /// Fire-and-forget; a failed append is logged by the writer, never returned.
    fn append_event(&self, event: RunEvent);

    /// Flushes pending RunEvents.
    async fn flush_events(&self);

    fn describe(&self) -> &'static str;
}

/// Single-row sqlite checkpoint committed in one transaction.
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
    events: EventLog,
}

impl SqliteCheckpointStore {
    #[must_use]
    pub fn new(pool: SqlitePool, events: EventLog) -> Self {
        Self { pool, events }
    }
}

fn ts_to_text(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn ts_from_text(raw: &str) -> OverseerResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| OverseerError::Persistence(format!("Corrupt last_success_ts '{}': {}", raw, e)))
}

type CheckpointRow = (
    i64,
    Option<String>,
    String,
    String,
    Option<String>,
    bool,
    Option<String>,
);

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn load(&self) -> OverseerResult<Option<Checkpoint>> {
        let row: Option<CheckpointRow> = bounded(
            sqlx::query_as(
                "SELECT loop_cursor, active_policy_id, population_state, failure_counters, \
                 last_success_ts, safe_pause, safe_pause_reason FROM checkpoint WHERE id = 1",
            )
            .fetch_optional(&self.pool),
        )
        .await?;

        let Some((cursor, active, population, counters, last_success, safe_pause, reason)) = row
        else {
            return Ok(None);
        };

        Ok(Some(Checkpoint {
            loop_cursor: u64::try_from(cursor).map_err(|_| {
                OverseerError::Persistence(format!("Corrupt loop_cursor: {}", cursor))
            })?,
            active_policy_id: active,
            population_state: from_json_text("population_state", &population)?,
            failure_counters: from_json_text("failure_counters", &counters)?,
            last_success_ts: last_success.as_deref().map(ts_from_text).transpose()?,
            safe_pause,
            safe_pause_reason: reason,
        }))
    }

    async fn save(&self, checkpoint: &Checkpoint) -> OverseerResult<()> {
        let cursor = i64::try_from(checkpoint.loop_cursor).map_err(|_| {
            OverseerError::Persistence(format!("loop_cursor {} out of range", checkpoint.loop_cursor))
        })?;
        let population = to_json_text(&checkpoint.population_state)?;
        let counters = to_json_text(&checkpoint.failure_counters)?;
        let last_success = checkpoint.last_success_ts.as_ref().map(ts_to_text);

        let mut tx = bounded(self.pool.begin()).await?;
        bounded(
            sqlx::query(
                "INSERT INTO checkpoint (id, loop_cursor, active_policy_id, population_state, \
                 failure_counters, last_success_ts, safe_pause, safe_pause_reason) \
                 VALUES (1, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(id) DO UPDATE SET \
                 loop_cursor = excluded.loop_cursor, \
                 active_policy_id = excluded.active_policy_id, \
                 population_state = excluded.population_state, \
                 failure_counters = excluded.failure_counters, \
                 last_success_ts = excluded.last_success_ts, \
                 safe_pause = excluded.safe_pause, \
                 safe_pause_reason = excluded.safe_pause_reason",
            )
            .bind(cursor)
            .bind(&checkpoint.active_policy_id)
            .bind(population)
            .bind(counters)
            .bind(last_success)
            .bind(checkpoint.safe_pause)
            .bind(&checkpoint.safe_pause_reason)
            .execute(&mut *tx),
        )
        .await?;
        bounded(tx.commit()).await?;

        debug!(loop_cursor = checkpoint.loop_cursor, "Checkpoint committed");
        Ok(())
    }

    fn append_event(&self, event: RunEvent) {
        self.events.emit(event);
    }

    async fn flush_events(&self) {
        self.events.flush().await;
    }

    fn describe(&self) -> &'static str {
        "sqlite"
    }
}

/// `checkpoint.json` replaced through a temp file and a rename.
pub struct FileCheckpointStore {
    path: PathBuf,
    events: EventLog,
}

impl FileCheckpointStore {
    #[must_use]
    pub fn new(path: PathBuf, events: EventLog) -> Self {
        Self { path, events }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self) -> OverseerResult<Option<Checkpoint>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(OverseerError::Persistence(format!(
                    "Failed to read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };
        from_json_text("checkpoint.json", &raw).map(Some)
    }

    async fn save(&self, checkpoint: &Checkpoint) -> OverseerResult<()> {
        write_json_atomic(&self.path, checkpoint).await
    }

    fn append_event(&self, event: RunEvent) {
        self.events.emit(event);
    }

    async fn flush_events(&self) {
        self.events.flush().await;
    }

    fn describe(&self) -> &'static str {
        "file"
    }
}

/// Serializes `value` to `<path>.tmp` and renames it over `path`, so readers
/// see either the old or the new document.
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> OverseerResult<()> {
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| OverseerError::Persistence(format!("Serialization failed: {}", e)))?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                OverseerError::Persistence(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let write_err =
        |e: std::io::Error| OverseerError::Persistence(format!("Failed to write {}: {}", tmp.display(), e));
    let mut file = tokio::fs::File::create(&tmp).await.map_err(write_err)?;
    file.write_all(&json).await.map_err(write_err)?;
    // Data must be durable before the rename publishes it.
    file.sync_all().await.map_err(write_err)?;
    drop(file);
    tokio::fs::rename(&tmp, path).await.map_err(|e| {
        OverseerError::Persistence(format!("Failed to rename into {}: {}", path.display(), e))
    })?;
    Ok(())
}

/// Saves with one retry per entry of `schedule_ms` (sleeping that long first).
/// On exhaustion returns the attempt count and the last error.
pub async fn persist_with_retry(
    store: &dyn CheckpointStore,
    checkpoint: &Checkpoint,
    schedule_ms: &[u64],
) -> Result<(), (u32, OverseerError)> {
    let mut attempts = 1u32;
    let mut last = match store.save(checkpoint).await {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };

    for delay in schedule_ms {
        warn!(
            attempt = attempts,
            retry_in_ms = delay,
            "Checkpoint save failed: {}",
            last
        );
        tokio::time::sleep(Duration::from_millis(*delay)).await;
        attempts += 1;
        match store.save(checkpoint).await {
            Ok(()) => return Ok(()),
            Err(e) => last = e,
        }
    }

    Err((attempts, last))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canary::CanaryRun;
    use crate::db::init_db;
    use crate::population::{Member, Population};
    use crate::safety::FailureKind;
    use overseer_shared::{KnobSet, LiveMetrics, SimMetrics};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn sample_checkpoint() -> Checkpoint {
        let now = Utc::now();
        let mut population = Population::default();
        population.absorb(
            vec![Member {
                policy_id: "p-000003-0a1b2c3d".into(),
                parameters: KnobSet::default().baseline(),
                metrics: SimMetrics {
                    episodes: 24,
                    objective_rate: 0.1 + 0.2,
                    progress_rate: 0.47,
                    stability_rate: 0.81,
                    mean_elapsed_s: 1234.5,
                    variance: 0.013,
                },
                score: 0.612_345_678_9,
                created_at: now,
                rank: 0,
            }],
            8,
        );
        let mut counters = FailureCounters::default();
        counters.record(FailureKind::EvaluationError, now);

        Checkpoint {
            loop_cursor: 42,
            active_policy_id: Some("baseline-v1".into()),
            population_state: PopulationState {
                population,
                canary: Some(CanaryRun {
                    policy_id: "p-000002-deadbeef".into(),
                    incumbent_id: "baseline-v1".into(),
                    started_at: now,
                    exposed_at: None,
                    baseline: Some(LiveMetrics {
                        objective_rate: 0.5,
                        stability_rate: 0.9,
                        confidence: 1.0,
                        windows: 2,
                        updated_at: now,
                    }),
                    windows_observed: 1,
                    windows_elapsed: 2,
                }),
            },
            failure_counters: counters,
            last_success_ts: Some(now),
            safe_pause: true,
            safe_pause_reason: Some("manual_pause".into()),
        }
    }

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("overseer-checkpoint-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_sqlite_round_trip() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        init_db(&pool).await.unwrap();
        let dir = temp_dir();
        let store = SqliteCheckpointStore::new(pool, EventLog::spawn(dir.join("events.jsonl")));

        assert!(store.load().await.unwrap().is_none());

        let cp = sample_checkpoint();
        store.save(&cp).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(cp.clone()));

        let mut next = cp;
        next.loop_cursor = 43;
        next.safe_pause = false;
        next.safe_pause_reason = None;
        store.save(&next).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(next));

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_file_round_trip_leaves_no_temp_file() {
        let dir = temp_dir();
        let path = dir.join("checkpoint.json");
        let store = FileCheckpointStore::new(path.clone(), EventLog::spawn(dir.join("events.jsonl")));

        assert!(store.load().await.unwrap().is_none());

        let cp = sample_checkpoint();
        store.save(&cp).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(cp));
        assert!(!dir.join("checkpoint.json.tmp").exists());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_truncated_temp_from_crash_is_replaced() {
        let dir = temp_dir();
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("checkpoint.json");
        std::fs::write(dir.join("checkpoint.json.tmp"), b"{\"loop_cur").unwrap();

        let cp = sample_checkpoint();
        write_json_atomic(&path, &cp).await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let back: Checkpoint = serde_json::from_str(&text).unwrap();
        assert_eq!(back, cp);
        assert!(!dir.join("checkpoint.json.tmp").exists());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_a_persistence_error() {
        let dir = temp_dir();
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("checkpoint.json");
        std::fs::write(&path, "{\"loop_cursor\": ").unwrap();
        let store = FileCheckpointStore::new(path, EventLog::spawn(dir.join("events.jsonl")));

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, OverseerError::Persistence(_)));

        let _ = std::fs::remove_dir_all(dir);
    }

    struct FlakyStore {
        failures_left: AtomicU32,
        saves: AtomicU32,
    }

    #[async_trait]
    impl CheckpointStore for FlakyStore {
        async fn load(&self) -> OverseerResult<Option<Checkpoint>> {
            Ok(None)
        }

        async fn save(&self, _checkpoint: &Checkpoint) -> OverseerResult<()> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(OverseerError::Persistence("disk full".into()));
            }
            Ok(())
        }

        fn append_event(&self, _event: RunEvent) {}

        async fn flush_events(&self) {}

        fn describe(&self) -> &'static str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_within_schedule() {
        let store = FlakyStore {
            failures_left: AtomicU32::new(2),
            saves: AtomicU32::new(0),
        };
        persist_with_retry(&store, &Checkpoint::default(), &[1, 1, 1])
            .await
            .unwrap();
        assert_eq!(store.saves.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_reports_attempts() {
        let store = FlakyStore {
            failures_left: AtomicU32::new(10),
            saves: AtomicU32::new(0),
        };
        let (attempts, err) = persist_with_retry(&store, &Checkpoint::default(), &[1, 1])
            .await
            .unwrap_err();
        assert_eq!(attempts, 3);
        assert!(err.to_string().contains("disk full"));
    }
}
