//! Persisted offline stores.
//!
//! `SQLite`-backed persistence for the download queue and its materialized
//! results. The queue table is the single source of truth for durable
//! download state; all mutations are individually atomic row operations, and
//! the scheduler's "claim next pending" decision is a single
//! `UPDATE..RETURNING` so concurrent call sites cannot double-claim a row.
//!
//! # Overview
//!
//! - [`QueueStore`] - queue entry lifecycle (pending → downloading →
//!   completed/failed) plus crash recovery
//! - [`DownloadedFileStore`] - materialized completed downloads
//! - [`QueueEntry`] / [`QueueStatus`] - entry model
//! - [`EntryMetadata`] - versioned opaque metadata blob
//! - [`StoreError`] - operation error types

mod entry;
mod error;
mod files;
mod metadata;

pub use entry::{QueueEntry, QueueStatus};
pub use error::{StoreError, StoreErrorKind};
pub use files::{DownloadedFile, DownloadedFileStore, NewDownloadedFile};
pub use metadata::{EntryMetadata, MetadataV1, TocEntry};

use entry::QueueRow;
use sqlx::Row;
use tracing::instrument;

use crate::db::Database;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Returns `Ok(())` if at least one row was affected; otherwise [`StoreError::EntryNotFound`].
fn check_affected(id: i64, rows_affected: u64) -> Result<()> {
    if rows_affected == 0 {
        Err(StoreError::EntryNotFound(id))
    } else {
        Ok(())
    }
}

/// Fields for a new queue entry.
#[derive(Debug, Clone)]
pub struct NewQueueEntry {
    /// Content identifier on the origin server.
    pub book_id: String,
    /// Origin server identifier.
    pub server_id: String,
    /// Absolute URL the executor downloads from.
    pub download_url: String,
    /// Destination filename (without extension).
    pub filename: String,
    /// Destination file extension.
    pub extension: String,
    /// Optional denormalized display metadata.
    pub metadata: Option<EntryMetadata>,
}

/// Store for download queue entries.
///
/// Provides atomic operations for managing queue entries backed by `SQLite`
/// with WAL mode for concurrent access.
#[derive(Debug, Clone)]
pub struct QueueStore {
    db: Database,
}

impl QueueStore {
    /// Creates a new queue store with the given database connection.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Inserts a new entry with pending status and returns its id.
    ///
    /// Callers are expected to have checked the natural key first (see
    /// [`QueueStore::find_by_book`]); this method does not deduplicate.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the insert fails.
    #[instrument(skip(self, entry), fields(book_id = %entry.book_id, server_id = %entry.server_id))]
    pub async fn insert(&self, entry: &NewQueueEntry) -> Result<i64> {
        let metadata_json = entry.metadata.as_ref().and_then(EntryMetadata::encode);

        let result = sqlx::query(
            r"INSERT INTO download_queue (
                book_id,
                server_id,
                status,
                download_url,
                filename,
                extension,
                metadata
              )
              VALUES (?, ?, ?, ?, ?, ?, ?)
              RETURNING id",
        )
        .bind(&entry.book_id)
        .bind(&entry.server_id)
        .bind(QueueStatus::Pending.as_str())
        .bind(&entry.download_url)
        .bind(&entry.filename)
        .bind(&entry.extension)
        .bind(metadata_json)
        .fetch_one(self.db.pool())
        .await?;

        Ok(result.get("id"))
    }

    /// Gets a queue entry by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get(&self, id: i64) -> Result<Option<QueueEntry>> {
        let row = sqlx::query_as::<_, QueueRow>(r"SELECT * FROM download_queue WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;

        Ok(row.map(QueueEntry::from))
    }

    /// Looks up the non-completed entry for a `(book_id, server_id)` pair.
    ///
    /// This is the natural-key lookup behind idempotent enqueue: at most one
    /// non-completed entry exists per pair.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self), fields(book_id = %book_id, server_id = %server_id))]
    pub async fn find_by_book(
        &self,
        book_id: &str,
        server_id: &str,
    ) -> Result<Option<QueueEntry>> {
        let row = sqlx::query_as::<_, QueueRow>(
            r"SELECT * FROM download_queue
              WHERE book_id = ? AND server_id = ? AND status != ?
              ORDER BY created_at ASC, id ASC
              LIMIT 1",
        )
        .bind(book_id)
        .bind(server_id)
        .bind(QueueStatus::Completed.as_str())
        .fetch_optional(self.db.pool())
        .await?;

        Ok(row.map(QueueEntry::from))
    }

    /// Atomically claims the oldest pending entry for downloading.
    ///
    /// Transitions the entry to `downloading` and returns it, or returns
    /// `None` when no pending entries exist. FIFO by creation time with the
    /// id as tiebreak, so same-second inserts keep insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn claim_next_pending(&self) -> Result<Option<QueueEntry>> {
        // Atomic UPDATE...RETURNING ensures no race between select and update.
        let row = sqlx::query_as::<_, QueueRow>(
            r"UPDATE download_queue
              SET status = ?, updated_at = datetime('now')
              WHERE id = (
                  SELECT id FROM download_queue
                  WHERE status = ?
                  ORDER BY created_at ASC, id ASC
                  LIMIT 1
              )
              RETURNING *",
        )
        .bind(QueueStatus::Downloading.as_str())
        .bind(QueueStatus::Pending.as_str())
        .fetch_optional(self.db.pool())
        .await?;

        Ok(row.map(QueueEntry::from))
    }

    /// Marks an entry as failed with a reason, returning the updated entry.
    ///
    /// Returns `None` when the entry no longer exists (e.g. it lost a race
    /// against cancellation); the caller must not emit a failure event then.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self), fields(reason = %reason))]
    pub async fn mark_failed(&self, id: i64, reason: &str) -> Result<Option<QueueEntry>> {
        let row = sqlx::query_as::<_, QueueRow>(
            r"UPDATE download_queue
              SET status = ?, failure_reason = ?, updated_at = datetime('now')
              WHERE id = ?
              RETURNING *",
        )
        .bind(QueueStatus::Failed.as_str())
        .bind(reason)
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(row.map(QueueEntry::from))
    }

    /// Conditionally resets a failed entry to pending, clearing the reason.
    ///
    /// Returns `true` when the entry was in `failed` state and was reset;
    /// `false` for any other state (retry is a no-op then).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn reset_for_retry(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            r"UPDATE download_queue
              SET status = ?, failure_reason = NULL, updated_at = datetime('now')
              WHERE id = ? AND status = ?",
        )
        .bind(QueueStatus::Pending.as_str())
        .bind(id)
        .bind(QueueStatus::Failed.as_str())
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Resurrects a failed entry for re-enqueue: back to pending, failure
    /// reason cleared, download URL and metadata overwritten.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::EntryNotFound`] if no entry exists with the id.
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self, metadata))]
    pub async fn resurrect(
        &self,
        id: i64,
        download_url: &str,
        metadata: Option<&EntryMetadata>,
    ) -> Result<()> {
        let metadata_json = metadata.and_then(EntryMetadata::encode);
        let result = sqlx::query(
            r"UPDATE download_queue
              SET status = ?,
                  failure_reason = NULL,
                  download_url = ?,
                  metadata = ?,
                  updated_at = datetime('now')
              WHERE id = ?",
        )
        .bind(QueueStatus::Pending.as_str())
        .bind(download_url)
        .bind(metadata_json)
        .bind(id)
        .execute(self.db.pool())
        .await?;

        check_affected(id, result.rows_affected())
    }

    /// Resets all `downloading` entries back to pending.
    ///
    /// Called at startup for crash recovery - entries left `downloading` from
    /// a previous session are returned to the queue for reprocessing. There
    /// is no byte-level resume; the download restarts from scratch.
    ///
    /// # Returns
    ///
    /// The number of entries that were reset.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn reset_downloading(&self) -> Result<u64> {
        let result = sqlx::query(
            r"UPDATE download_queue
              SET status = ?, failure_reason = NULL, updated_at = datetime('now')
              WHERE status = ?",
        )
        .bind(QueueStatus::Pending.as_str())
        .bind(QueueStatus::Downloading.as_str())
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected())
    }

    /// Removes a queue entry by id.
    ///
    /// Returns `true` when a row was deleted, `false` when none existed.
    /// Cancel and dismiss both tolerate already-gone rows.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the delete fails.
    #[instrument(skip(self))]
    pub async fn remove(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(r"DELETE FROM download_queue WHERE id = ?")
            .bind(id)
            .execute(self.db.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Counts entries by status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn count_by_status(&self, status: QueueStatus) -> Result<i64> {
        let result =
            sqlx::query(r"SELECT COUNT(*) as count FROM download_queue WHERE status = ?")
                .bind(status.as_str())
                .fetch_one(self.db.pool())
                .await?;

        Ok(result.get("count"))
    }

    /// Lists entries filtered by status, in FIFO order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_by_status(&self, status: QueueStatus) -> Result<Vec<QueueEntry>> {
        let rows = sqlx::query_as::<_, QueueRow>(
            r"SELECT * FROM download_queue
              WHERE status = ?
              ORDER BY created_at ASC, id ASC",
        )
        .bind(status.as_str())
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows.into_iter().map(QueueEntry::from).collect())
    }

    /// Lists all entries in the queue, in FIFO order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_all(&self) -> Result<Vec<QueueEntry>> {
        let rows = sqlx::query_as::<_, QueueRow>(
            r"SELECT * FROM download_queue ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows.into_iter().map(QueueEntry::from).collect())
    }

    /// Lists failed entries; backs the UI "problems" view.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn list_failed(&self) -> Result<Vec<QueueEntry>> {
        self.list_by_status(QueueStatus::Failed).await
    }
}
