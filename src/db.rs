//! Database connection and schema management.
//!
//! SQLite connectivity with connection pooling, WAL mode for concurrent
//! reads, and automatic migration execution. Also owns the persisted run log:
//! one row per crawl run, written once at completion for operational
//! visibility (never read back by the engine).

use std::path::Path;

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::instrument;

use crate::crawl::RunSummary;

/// Default maximum number of connections in the pool.
/// Kept low for SQLite since it uses file-level locking.
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// SQLite busy timeout in milliseconds.
const BUSY_TIMEOUT_MS: u32 = 5000;

/// Database-related errors.
#[derive(Error, Debug)]
pub enum DbError {
    /// Failed to connect to or query the database.
    #[error("database error: {0}")]
    Connection(#[from] sqlx::Error),

    /// Failed to run migrations.
    #[error("failed to run migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Database connection wrapper with connection pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (or creates) the database at `db_path`, enabling WAL mode and
    /// running pending migrations.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if the connection fails,
    /// or `DbError::Migration` if migrations fail.
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn new(db_path: &Path) -> Result<Self, DbError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&pool)
            .await?;
        sqlx::query(&format!("PRAGMA busy_timeout={BUSY_TIMEOUT_MS}"))
            .execute(&pool)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Creates an in-memory database for testing.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if the connection fails,
    /// or `DbError::Migration` if migrations fail.
    #[instrument]
    pub async fn new_in_memory() -> Result<Self, DbError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Returns a reference to the underlying connection pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Appends one run to the persisted run log.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if the insert fails.
    #[instrument(skip(self, summary), fields(outcome = summary.outcome.as_str()))]
    pub async fn record_run(&self, summary: &RunSummary) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO crawl_runs (
                started_at, finished_at, pages_enumerated, ids_enumerated,
                details_succeeded, details_failed, details_not_found,
                block_events, rate_limit_events, escalated, outcome
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(summary.started_at)
        .bind(summary.finished_at)
        .bind(i64::try_from(summary.pages_enumerated).unwrap_or(i64::MAX))
        .bind(i64::try_from(summary.ids_enumerated).unwrap_or(i64::MAX))
        .bind(i64::try_from(summary.details_succeeded).unwrap_or(i64::MAX))
        .bind(i64::try_from(summary.details_failed).unwrap_or(i64::MAX))
        .bind(i64::try_from(summary.details_not_found).unwrap_or(i64::MAX))
        .bind(i64::try_from(summary.block_events).unwrap_or(i64::MAX))
        .bind(i64::try_from(summary.rate_limit_events).unwrap_or(i64::MAX))
        .bind(i64::from(summary.escalated))
        .bind(summary.outcome.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Gracefully closes all connections in the pool.
    #[instrument(skip(self))]
    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::crawl::{CrawlStats, RunOutcome, RunSummary};

    #[tokio::test]
    async fn test_database_new_in_memory_succeeds() {
        let db = Database::new_in_memory().await;
        assert!(db.is_ok(), "failed to create in-memory database");
    }

    #[tokio::test]
    async fn test_migrations_create_records_table() {
        let db = Database::new_in_memory().await.unwrap();

        let result = sqlx::query(
            "INSERT INTO records (id, source, url, title, fetched_at, updated_at)
             VALUES ('1', 'test', 'https://example.com/1', 'a title', 0, 0)",
        )
        .execute(db.pool())
        .await;

        assert!(result.is_ok(), "records table should exist after migration");
    }

    #[tokio::test]
    async fn test_record_run_inserts_row() {
        let db = Database::new_in_memory().await.unwrap();
        let stats = CrawlStats::new();
        stats.record_page(40);
        stats.record_success();

        let summary = RunSummary::from_stats(&stats, 100, 200, RunOutcome::Success);
        db.record_run(&summary).await.unwrap();

        let (count, outcome): (i64, String) =
            sqlx::query_as("SELECT COUNT(*), MAX(outcome) FROM crawl_runs")
                .fetch_one(db.pool())
                .await
                .unwrap();
        assert_eq!(count, 1);
        assert_eq!(outcome, "success");
    }

    #[tokio::test]
    async fn test_run_log_rejects_unknown_outcome() {
        let db = Database::new_in_memory().await.unwrap();
        let result = sqlx::query(
            "INSERT INTO crawl_runs (
                started_at, finished_at, pages_enumerated, ids_enumerated,
                details_succeeded, details_failed, details_not_found,
                block_events, rate_limit_events, escalated, outcome
            ) VALUES (0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 'bogus')",
        )
        .execute(db.pool())
        .await;
        assert!(result.is_err(), "CHECK constraint should reject outcome");
    }

    #[tokio::test]
    async fn test_database_with_tempfile_enables_wal() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let db = Database::new(&db_path).await.unwrap();
        let result: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(result.0.to_lowercase(), "wal");
    }
}
