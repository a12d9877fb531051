//! Persistence sink for parsed records.
//!
//! The engine only sees the [`RecordSink`] trait: an idempotent batch upsert
//! plus an existence query for incremental crawls. [`SqliteSink`] is the
//! bundled implementation on top of [`Database`]. Upserts are applied
//! per record so a failure on one record never aborts the rest of the batch.

use std::collections::HashSet;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{instrument, warn};

use crate::db::Database;
use crate::record::Record;

/// Sink-level errors.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The underlying store rejected the operation.
    #[error("sink database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Tally of one batch upsert. Partial failures are counted, not raised.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkReport {
    /// Records inserted for the first time.
    pub new: usize,
    /// Records that already existed and were updated in place.
    pub updated: usize,
    /// Records the store rejected individually.
    pub failed: usize,
}

impl SinkReport {
    /// Folds another batch tally into this one.
    pub fn merge(&mut self, other: SinkReport) {
        self.new += other.new;
        self.updated += other.updated;
        self.failed += other.failed;
    }

    /// Total records the sink acknowledged.
    #[must_use]
    pub fn stored(&self) -> usize {
        self.new + self.updated
    }
}

/// Durable store for parsed records.
///
/// Implementations must be idempotent under at-least-once delivery: the
/// orchestrator may flush the same record twice after an interrupted run.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Upserts a batch of records, tolerating per-record failures.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] only when the whole batch is unprocessable
    /// (e.g. the store is unreachable), never for individual records.
    async fn upsert_batch(&self, records: &[Record]) -> Result<SinkReport, SinkError>;

    /// Ids already present in the store, used to skip known items in
    /// incremental mode.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] when the query fails.
    async fn known_ids(&self) -> Result<HashSet<String>, SinkError>;
}

/// SQLite-backed record sink.
#[derive(Debug, Clone)]
pub struct SqliteSink {
    db: Database,
}

impl SqliteSink {
    /// Creates a sink over an open database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn upsert_one(&self, record: &Record) -> Result<bool, sqlx::Error> {
        let existing: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM records WHERE id = ?")
            .bind(record.id.as_str())
            .fetch_optional(self.db.pool())
            .await?;
        let is_new = existing.is_none();

        // fetched_at keeps its first-seen value; updated_at tracks the
        // latest fetch so repeated upserts stay observably idempotent.
        sqlx::query(
            "INSERT INTO records (
                id, source, url, title, company, location,
                salary_text, employment_type, fetched_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                source = excluded.source,
                url = excluded.url,
                title = excluded.title,
                company = excluded.company,
                location = excluded.location,
                salary_text = excluded.salary_text,
                employment_type = excluded.employment_type,
                updated_at = excluded.updated_at",
        )
        .bind(record.id.as_str())
        .bind(&record.source)
        .bind(&record.url)
        .bind(&record.title)
        .bind(&record.company)
        .bind(&record.location)
        .bind(&record.salary_text)
        .bind(&record.employment_type)
        .bind(record.fetched_at)
        .bind(record.fetched_at)
        .execute(self.db.pool())
        .await?;

        Ok(is_new)
    }
}

#[async_trait]
impl RecordSink for SqliteSink {
    #[instrument(skip(self, records), fields(batch = records.len()))]
    async fn upsert_batch(&self, records: &[Record]) -> Result<SinkReport, SinkError> {
        let mut report = SinkReport::default();
        for record in records {
            match self.upsert_one(record).await {
                Ok(true) => report.new += 1,
                Ok(false) => report.updated += 1,
                Err(e) => {
                    warn!(id = %record.id, error = %e, "record upsert failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    async fn known_ids(&self) -> Result<HashSet<String>, SinkError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT id FROM records")
            .fetch_all(self.db.pool())
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::record::ItemId;

    fn record(id: &str, title: &str) -> Record {
        Record {
            id: ItemId::from(id),
            source: "test".to_string(),
            url: format!("https://example.com/detail/{id}"),
            title: title.to_string(),
            company: "Acme".to_string(),
            location: "Springfield".to_string(),
            salary_text: String::new(),
            employment_type: "full-time".to_string(),
            fetched_at: 1_700_000_000,
        }
    }

    async fn sink() -> SqliteSink {
        SqliteSink::new(Database::new_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn test_upsert_batch_counts_new_records() {
        let sink = sink().await;
        let report = sink
            .upsert_batch(&[record("1", "a"), record("2", "b")])
            .await
            .unwrap();
        assert_eq!(report.new, 2);
        assert_eq!(report.updated, 0);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let sink = sink().await;
        let batch = [record("1", "a"), record("2", "b")];

        let first = sink.upsert_batch(&batch).await.unwrap();
        let second = sink.upsert_batch(&batch).await.unwrap();

        assert_eq!(first.new, 2);
        assert_eq!(second.new, 0);
        assert_eq!(second.updated, 2);

        // Same observable state as a single upsert: two rows, same titles.
        let ids = sink.known_ids().await.unwrap();
        assert_eq!(ids.len(), 2);
        let (title,): (String,) = sqlx::query_as("SELECT title FROM records WHERE id = '1'")
            .fetch_one(sink.db.pool())
            .await
            .unwrap();
        assert_eq!(title, "a");
    }

    #[tokio::test]
    async fn test_upsert_updates_fields_in_place() {
        let sink = sink().await;
        sink.upsert_batch(&[record("1", "old title")]).await.unwrap();

        let mut changed = record("1", "new title");
        changed.fetched_at = 1_700_000_500;
        let report = sink.upsert_batch(&[changed]).await.unwrap();
        assert_eq!(report.updated, 1);

        let (title, fetched_at, updated_at): (String, i64, i64) =
            sqlx::query_as("SELECT title, fetched_at, updated_at FROM records WHERE id = '1'")
                .fetch_one(sink.db.pool())
                .await
                .unwrap();
        assert_eq!(title, "new title");
        // First-seen timestamp is preserved, update timestamp moves.
        assert_eq!(fetched_at, 1_700_000_000);
        assert_eq!(updated_at, 1_700_000_500);
    }

    #[tokio::test]
    async fn test_known_ids_empty_store() {
        let sink = sink().await;
        assert!(sink.known_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_known_ids_returns_stored_ids() {
        let sink = sink().await;
        sink.upsert_batch(&[record("7", "x"), record("8", "y")])
            .await
            .unwrap();
        let ids = sink.known_ids().await.unwrap();
        assert!(ids.contains("7"));
        assert!(ids.contains("8"));
        assert_eq!(ids.len(), 2);
    }
}
