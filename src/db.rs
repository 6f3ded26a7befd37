use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Executor, SqlitePool};
use tracing::{debug, info};

use crate::config::Config;

/// The whole schema. Every statement is `IF NOT EXISTS`, so applying it on
/// each start is idempotent.
const SCHEMA: &str = include_str!("../migrations/20261016_000001_initial_schema.sql");

/// Open (creating if needed) the on-disk store named by `[database]`.
pub async fn create_pool(config: &Config) -> Result<SqlitePool> {
    let db_path = config.db_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating data directory: {}", parent.display()))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(&db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = connect(SqlitePoolOptions::new().max_connections(5), options)
        .await
        .with_context(|| format!("opening database: {}", db_path.display()))?;
    info!(path = %db_path.display(), "database connected");
    Ok(pool)
}

/// Connect with foreign keys enforced and apply the schema.
async fn connect(pool_options: SqlitePoolOptions, options: SqliteConnectOptions) -> Result<SqlitePool> {
    let pool = pool_options
        .connect_with(options.foreign_keys(true))
        .await
        .context("connecting to database")?;

    pool.execute(SCHEMA).await.context("applying schema")?;
    debug!("schema applied");
    Ok(pool)
}

/// Single-connection in-memory database with the full schema, for tests.
/// One connection, kept forever: a second one would see an empty database.
#[cfg(test)]
pub async fn memory_pool() -> SqlitePool {
    let pool_options = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None);
    connect(pool_options, SqliteConnectOptions::new().in_memory(true))
        .await
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_is_idempotent_and_enforces_foreign_keys() {
        let pool = memory_pool().await;
        pool.execute(SCHEMA).await.unwrap();

        let orphan = sqlx::query(
            "INSERT INTO posts (id, topic_id, status, content, language, style, created_at)
             VALUES ('p1', 'no-such-topic', 'draft', '', 'en', 'expert', '2026-01-01T00:00:00Z')",
        )
        .execute(&pool)
        .await;
        assert!(orphan.is_err());
    }
}
