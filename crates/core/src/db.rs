use overseer_shared::OverseerError;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::future::Future;
use std::str::FromStr;
use tokio::time::{timeout, Duration};
use tracing::info;

/// Upper bound for a single database operation.
pub const DB_TIMEOUT_SECS: u64 = 10;

const MIGRATION_TIMEOUT_SECS: u64 = 30;

/// Opens the sqlite pool, creating the database file (and its directory) if needed.
pub async fn connect(database_url: &str) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| anyhow::anyhow!("Invalid DATABASE_URL '{}': {}", database_url, e))?
        .create_if_missing(true);

    let filename = options.get_filename();
    if let Some(parent) = filename.parent() {
        if !parent.as_os_str().is_empty() && !database_url.contains(":memory:") {
            std::fs::create_dir_all(parent).map_err(|e| {
                anyhow::anyhow!("Failed to create database directory {}: {}", parent.display(), e)
            })?;
        }
    }

    let pool = timeout(
        Duration::from_secs(DB_TIMEOUT_SECS),
        SqlitePoolOptions::new().max_connections(4).connect_with(options),
    )
    .await
    .map_err(|_| anyhow::anyhow!("Database connection timed out after {}s", DB_TIMEOUT_SECS))?
    .map_err(|e| anyhow::anyhow!("Failed to open database: {}", e))?;

    Ok(pool)
}

/// Applies the schema migrations.
pub async fn init_db(pool: &SqlitePool) -> anyhow::Result<()> {
    info!("Running database migrations...");

    timeout(
        Duration::from_secs(MIGRATION_TIMEOUT_SECS),
        sqlx::migrate!("./migrations").run(pool),
    )
    .await
    .map_err(|_| {
        anyhow::anyhow!(
            "Database migrations timed out after {}s",
            MIGRATION_TIMEOUT_SECS
        )
    })?
    .map_err(|e| anyhow::anyhow!("Database migration failed: {}", e))?;

    Ok(())
}

/// Runs a query future under [`DB_TIMEOUT_SECS`], mapping both failure modes to
/// `OverseerError::Persistence`.
pub async fn bounded<T, F>(fut: F) -> Result<T, OverseerError>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    timeout(Duration::from_secs(DB_TIMEOUT_SECS), fut)
        .await
        .map_err(|_| {
            OverseerError::Persistence(format!(
                "Database operation timed out after {}s",
                DB_TIMEOUT_SECS
            ))
        })?
        .map_err(|e| OverseerError::Persistence(format!("Database query failed: {}", e)))
}

/// Serializes a value for a JSON text column.
pub fn to_json_text<T: serde::Serialize>(value: &T) -> Result<String, OverseerError> {
    serde_json::to_string(value)
        .map_err(|e| OverseerError::Persistence(format!("Serialization failed: {}", e)))
}

/// Parses a JSON text column.
pub fn from_json_text<T: serde::de::DeserializeOwned>(
    column: &str,
    raw: &str,
) -> Result<T, OverseerError> {
    serde_json::from_str(raw)
        .map_err(|e| OverseerError::Persistence(format!("Corrupt {} column: {}", column, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        init_db(&pool).await.unwrap();
        init_db(&pool).await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('policies', 'checkpoint') ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(tables.len(), 2);
    }

    #[tokio::test]
    async fn test_checkpoint_table_holds_one_row() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        init_db(&pool).await.unwrap();

        let res = sqlx::query(
            "INSERT INTO checkpoint (id, loop_cursor, population_state, failure_counters) VALUES (2, 0, '{}', '{}')",
        )
        .execute(&pool)
        .await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_bounded_maps_query_errors() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let err = bounded(sqlx::query("SELECT * FROM missing_table").execute(&pool))
            .await
            .unwrap_err();
        assert!(matches!(err, OverseerError::Persistence(_)));
    }
}
