//! Reading-progress local store and its reconciler hooks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use tracing::instrument;

use super::reconciler::{EntitySync, SyncStepError};
use crate::db::Database;
use crate::server::{ServerClient, SyncKind};
use crate::store::{Result, StoreError};

/// Locally persisted reading progress for one `(book, server)` pair.
#[derive(Debug, Clone, FromRow)]
pub struct ReadProgress {
    /// Book the progress belongs to.
    pub book_id: String,
    /// Origin server.
    pub server_id: String,
    /// Current page for page-based formats.
    pub page: Option<i64>,
    /// Current location for EPUB formats.
    pub epubcfi: Option<String>,
    /// Completion fraction (0.0-1.0).
    pub percentage: f64,
    /// Whether the book is finished.
    pub is_completed: bool,
    /// Last local update time.
    pub updated_at: String,
    /// Whether this state has been uploaded.
    pub is_synced: bool,
}

/// Progress state as exchanged with the server and written by readers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Book the progress belongs to.
    pub book_id: String,
    /// Current page for page-based formats.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<i64>,
    /// Current location for EPUB formats.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epubcfi: Option<String>,
    /// Completion fraction (0.0-1.0).
    #[serde(default)]
    pub percentage: f64,
    /// Whether the book is finished.
    #[serde(default)]
    pub is_completed: bool,
}

impl From<&ReadProgress> for ProgressUpdate {
    fn from(row: &ReadProgress) -> Self {
        Self {
            book_id: row.book_id.clone(),
            page: row.page,
            epubcfi: row.epubcfi.clone(),
            percentage: row.percentage,
            is_completed: row.is_completed,
        }
    }
}

/// Store for reading progress, keyed by `(book_id, server_id)`.
///
/// Rows carry an `is_synced` flag: remote state lands synced, reader-local
/// writes land unsynced and stay that way until a push uploads them.
#[derive(Debug, Clone)]
pub struct ProgressStore {
    db: Database,
}

impl ProgressStore {
    /// Creates a new store with the given database connection.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Applies server state; the row lands already synced.
    ///
    /// Rows with pending local edits (`is_synced = 0`) are left untouched:
    /// local state wins until the push phase uploads it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the upsert fails.
    #[instrument(skip(self, update), fields(book_id = %update.book_id, server_id = %server_id))]
    pub async fn upsert_remote(&self, server_id: &str, update: &ProgressUpdate) -> Result<()> {
        sqlx::query(
            r"INSERT INTO read_progress (
                book_id, server_id, page, epubcfi, percentage, is_completed, is_synced
              )
              VALUES (?, ?, ?, ?, ?, ?, 1)
              ON CONFLICT (book_id, server_id) DO UPDATE SET
                page = excluded.page,
                epubcfi = excluded.epubcfi,
                percentage = excluded.percentage,
                is_completed = excluded.is_completed,
                is_synced = 1,
                updated_at = datetime('now')
              WHERE read_progress.is_synced = 1",
        )
        .bind(&update.book_id)
        .bind(server_id)
        .bind(update.page)
        .bind(&update.epubcfi)
        .bind(update.percentage)
        .bind(update.is_completed)
        .execute(self.db.pool())
        .await?;

        Ok(())
    }

    /// Records reader-local progress; unsynced until the next push.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the upsert fails.
    #[instrument(skip(self, update), fields(book_id = %update.book_id, server_id = %server_id))]
    pub async fn record_local(&self, server_id: &str, update: &ProgressUpdate) -> Result<()> {
        sqlx::query(
            r"INSERT INTO read_progress (
                book_id, server_id, page, epubcfi, percentage, is_completed, is_synced
              )
              VALUES (?, ?, ?, ?, ?, ?, 0)
              ON CONFLICT (book_id, server_id) DO UPDATE SET
                page = excluded.page,
                epubcfi = excluded.epubcfi,
                percentage = excluded.percentage,
                is_completed = excluded.is_completed,
                is_synced = 0,
                updated_at = datetime('now')",
        )
        .bind(&update.book_id)
        .bind(server_id)
        .bind(update.page)
        .bind(&update.epubcfi)
        .bind(update.percentage)
        .bind(update.is_completed)
        .execute(self.db.pool())
        .await?;

        Ok(())
    }

    /// Gets the stored progress for a book.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get(&self, book_id: &str, server_id: &str) -> Result<Option<ReadProgress>> {
        let row = sqlx::query_as::<_, ReadProgress>(
            r"SELECT * FROM read_progress WHERE book_id = ? AND server_id = ?",
        )
        .bind(book_id)
        .bind(server_id)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(row)
    }

    /// Book ids with unsynced progress for a server.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn list_unsynced_book_ids(&self, server_id: &str) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            r"SELECT book_id FROM read_progress
              WHERE server_id = ? AND is_synced = 0
              ORDER BY book_id ASC",
        )
        .bind(server_id)
        .fetch_all(self.db.pool())
        .await?;

        Ok(ids)
    }

    /// Marks a book's progress as uploaded.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn mark_synced(&self, book_id: &str, server_id: &str) -> Result<()> {
        sqlx::query(
            r"UPDATE read_progress SET is_synced = 1
              WHERE book_id = ? AND server_id = ?",
        )
        .bind(book_id)
        .bind(server_id)
        .execute(self.db.pool())
        .await?;

        Ok(())
    }

    /// All book ids with progress rows for a server, synced or not.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn known_book_ids(&self, server_id: &str) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            r"SELECT book_id FROM read_progress WHERE server_id = ? ORDER BY book_id ASC",
        )
        .bind(server_id)
        .fetch_all(self.db.pool())
        .await?;

        Ok(ids)
    }
}

/// Reconciler hooks for reading progress.
#[derive(Debug, Clone)]
pub struct ReadProgressSync {
    store: ProgressStore,
}

impl ReadProgressSync {
    /// Creates the hooks over the given store.
    #[must_use]
    pub fn new(store: ProgressStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EntitySync for ReadProgressSync {
    fn kind(&self) -> SyncKind {
        SyncKind::Progress
    }

    async fn apply_remote(
        &self,
        server_id: &str,
        _book_id: &str,
        item: &Value,
    ) -> std::result::Result<(), SyncStepError> {
        let update: ProgressUpdate = serde_json::from_value(item.clone())?;
        self.store.upsert_remote(server_id, &update).await?;
        Ok(())
    }

    async fn unsynced_book_ids(
        &self,
        server_id: &str,
    ) -> std::result::Result<Vec<String>, StoreError> {
        self.store.list_unsynced_book_ids(server_id).await
    }

    async fn push_book(
        &self,
        client: &ServerClient,
        server_id: &str,
        book_id: &str,
    ) -> std::result::Result<(), SyncStepError> {
        let Some(row) = self.store.get(book_id, server_id).await? else {
            return Ok(());
        };
        let update = ProgressUpdate::from(&row);
        client
            .push_entity(SyncKind::Progress, book_id, &update)
            .await?;
        self.store.mark_synced(book_id, server_id).await?;
        Ok(())
    }

    async fn known_book_ids(
        &self,
        server_id: &str,
    ) -> std::result::Result<Vec<String>, StoreError> {
        self.store.known_book_ids(server_id).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn update(book_id: &str, percentage: f64) -> ProgressUpdate {
        ProgressUpdate {
            book_id: book_id.to_string(),
            page: Some(12),
            epubcfi: None,
            percentage,
            is_completed: false,
        }
    }

    #[tokio::test]
    async fn test_remote_upsert_lands_synced_local_lands_unsynced() {
        let db = Database::new_in_memory().await.unwrap();
        let store = ProgressStore::new(db);

        store.upsert_remote("s1", &update("b1", 0.25)).await.unwrap();
        assert!(store.get("b1", "s1").await.unwrap().unwrap().is_synced);

        store.record_local("s1", &update("b1", 0.5)).await.unwrap();
        let row = store.get("b1", "s1").await.unwrap().unwrap();
        assert!(!row.is_synced);
        assert!((row.percentage - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_unsynced_ids_and_mark_synced() {
        let db = Database::new_in_memory().await.unwrap();
        let store = ProgressStore::new(db);

        store.record_local("s1", &update("b1", 0.1)).await.unwrap();
        store.record_local("s1", &update("b2", 0.2)).await.unwrap();
        store.upsert_remote("s1", &update("b3", 0.3)).await.unwrap();

        assert_eq!(
            store.list_unsynced_book_ids("s1").await.unwrap(),
            vec!["b1", "b2"]
        );

        store.mark_synced("b1", "s1").await.unwrap();
        assert_eq!(store.list_unsynced_book_ids("s1").await.unwrap(), vec!["b2"]);
        assert_eq!(
            store.known_book_ids("s1").await.unwrap(),
            vec!["b1", "b2", "b3"]
        );
    }

    #[tokio::test]
    async fn test_pull_does_not_clobber_unsynced_local_edits() {
        let db = Database::new_in_memory().await.unwrap();
        let store = ProgressStore::new(db);

        store.record_local("s1", &update("b1", 0.6)).await.unwrap();
        store.upsert_remote("s1", &update("b1", 0.3)).await.unwrap();

        let row = store.get("b1", "s1").await.unwrap().unwrap();
        assert!(!row.is_synced);
        assert!((row.percentage - 0.6).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_unsynced_ids_scoped_to_server() {
        let db = Database::new_in_memory().await.unwrap();
        let store = ProgressStore::new(db);

        store.record_local("s1", &update("b1", 0.1)).await.unwrap();
        store.record_local("s2", &update("b1", 0.9)).await.unwrap();

        assert_eq!(store.list_unsynced_book_ids("s1").await.unwrap(), vec!["b1"]);
        assert_eq!(store.list_unsynced_book_ids("s2").await.unwrap(), vec!["b1"]);
    }
}
