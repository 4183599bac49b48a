//! Annotation (highlight/note) local store and its reconciler hooks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use tracing::instrument;

use super::reconciler::{EntitySync, SyncStepError};
use crate::db::Database;
use crate::server::{ServerClient, SyncKind};
use crate::store::{Result, StoreError};

/// A locally persisted annotation.
#[derive(Debug, Clone, FromRow)]
pub struct Annotation {
    /// Local row id.
    pub id: i64,
    /// The server's id for this annotation, once synced.
    pub remote_id: Option<String>,
    /// Book the annotation belongs to.
    pub book_id: String,
    /// Origin server.
    pub server_id: String,
    /// Annotated page for page-based formats.
    pub page: Option<i64>,
    /// Annotated location for EPUB formats.
    pub epubcfi: Option<String>,
    /// The highlighted passage.
    pub highlighted_text: Option<String>,
    /// Reader note attached to the highlight.
    pub note: Option<String>,
    /// Creation time.
    pub created_at: String,
    /// Whether this annotation has been uploaded.
    pub is_synced: bool,
}

/// Annotation state as exchanged with the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnnotationUpdate {
    /// The server's annotation id; absent for never-pushed local annotations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Book the annotation belongs to.
    pub book_id: String,
    /// Annotated page for page-based formats.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<i64>,
    /// Annotated location for EPUB formats.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epubcfi: Option<String>,
    /// The highlighted passage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highlighted_text: Option<String>,
    /// Reader note attached to the highlight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl From<&Annotation> for AnnotationUpdate {
    fn from(row: &Annotation) -> Self {
        Self {
            id: row.remote_id.clone(),
            book_id: row.book_id.clone(),
            page: row.page,
            epubcfi: row.epubcfi.clone(),
            highlighted_text: row.highlighted_text.clone(),
            note: row.note.clone(),
        }
    }
}

/// Store for annotations. Same shape as the bookmark store: remote rows are
/// matched by `(remote_id, server_id)`, local rows stay unsynced until pushed.
#[derive(Debug, Clone)]
pub struct AnnotationStore {
    db: Database,
}

impl AnnotationStore {
    /// Creates a new store with the given database connection.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Applies a server annotation; the row lands already synced.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the write fails.
    #[instrument(skip(self, update), fields(book_id = %update.book_id, server_id = %server_id))]
    pub async fn upsert_remote(&self, server_id: &str, update: &AnnotationUpdate) -> Result<()> {
        if let Some(remote_id) = &update.id {
            let result = sqlx::query(
                r"UPDATE annotations
                  SET book_id = ?, page = ?, epubcfi = ?, highlighted_text = ?, note = ?,
                      is_synced = 1
                  WHERE remote_id = ? AND server_id = ?",
            )
            .bind(&update.book_id)
            .bind(update.page)
            .bind(&update.epubcfi)
            .bind(&update.highlighted_text)
            .bind(&update.note)
            .bind(remote_id)
            .bind(server_id)
            .execute(self.db.pool())
            .await?;

            if result.rows_affected() > 0 {
                return Ok(());
            }
        }

        sqlx::query(
            r"INSERT INTO annotations (
                remote_id, book_id, server_id, page, epubcfi, highlighted_text, note, is_synced
              )
              VALUES (?, ?, ?, ?, ?, ?, ?, 1)",
        )
        .bind(&update.id)
        .bind(&update.book_id)
        .bind(server_id)
        .bind(update.page)
        .bind(&update.epubcfi)
        .bind(&update.highlighted_text)
        .bind(&update.note)
        .execute(self.db.pool())
        .await?;

        Ok(())
    }

    /// Records a reader-local annotation; unsynced until the next push.
    /// Returns the local row id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the insert fails.
    #[instrument(skip(self, update), fields(book_id = %update.book_id, server_id = %server_id))]
    pub async fn record_local(&self, server_id: &str, update: &AnnotationUpdate) -> Result<i64> {
        let result = sqlx::query(
            r"INSERT INTO annotations (
                remote_id, book_id, server_id, page, epubcfi, highlighted_text, note, is_synced
              )
              VALUES (NULL, ?, ?, ?, ?, ?, ?, 0)
              RETURNING id",
        )
        .bind(&update.book_id)
        .bind(server_id)
        .bind(update.page)
        .bind(&update.epubcfi)
        .bind(&update.highlighted_text)
        .bind(&update.note)
        .fetch_one(self.db.pool())
        .await?;

        use sqlx::Row;
        Ok(result.get("id"))
    }

    /// Lists annotations for a book, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_for_book(&self, book_id: &str, server_id: &str) -> Result<Vec<Annotation>> {
        let rows = sqlx::query_as::<_, Annotation>(
            r"SELECT * FROM annotations
              WHERE book_id = ? AND server_id = ?
              ORDER BY created_at ASC, id ASC",
        )
        .bind(book_id)
        .bind(server_id)
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows)
    }

    /// Unsynced annotations for one book.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn list_unsynced_for_book(
        &self,
        book_id: &str,
        server_id: &str,
    ) -> Result<Vec<Annotation>> {
        let rows = sqlx::query_as::<_, Annotation>(
            r"SELECT * FROM annotations
              WHERE book_id = ? AND server_id = ? AND is_synced = 0
              ORDER BY created_at ASC, id ASC",
        )
        .bind(book_id)
        .bind(server_id)
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows)
    }

    /// Book ids with unsynced annotations for a server.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn list_unsynced_book_ids(&self, server_id: &str) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            r"SELECT DISTINCT book_id FROM annotations
              WHERE server_id = ? AND is_synced = 0
              ORDER BY book_id ASC",
        )
        .bind(server_id)
        .fetch_all(self.db.pool())
        .await?;

        Ok(ids)
    }

    /// Marks all of a book's annotations as uploaded.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn mark_synced(&self, book_id: &str, server_id: &str) -> Result<()> {
        sqlx::query(
            r"UPDATE annotations SET is_synced = 1
              WHERE book_id = ? AND server_id = ?",
        )
        .bind(book_id)
        .bind(server_id)
        .execute(self.db.pool())
        .await?;

        Ok(())
    }

    /// All book ids with annotation rows for a server, synced or not.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn known_book_ids(&self, server_id: &str) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            r"SELECT DISTINCT book_id FROM annotations
              WHERE server_id = ?
              ORDER BY book_id ASC",
        )
        .bind(server_id)
        .fetch_all(self.db.pool())
        .await?;

        Ok(ids)
    }
}

/// Reconciler hooks for annotations.
#[derive(Debug, Clone)]
pub struct AnnotationSync {
    store: AnnotationStore,
}

impl AnnotationSync {
    /// Creates the hooks over the given store.
    #[must_use]
    pub fn new(store: AnnotationStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EntitySync for AnnotationSync {
    fn kind(&self) -> SyncKind {
        SyncKind::Annotations
    }

    async fn apply_remote(
        &self,
        server_id: &str,
        _book_id: &str,
        item: &Value,
    ) -> std::result::Result<(), SyncStepError> {
        let update: AnnotationUpdate = serde_json::from_value(item.clone())?;
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
        let rows = self.store.list_unsynced_for_book(book_id, server_id).await?;
        if rows.is_empty() {
            return Ok(());
        }
        let body: Vec<AnnotationUpdate> = rows.iter().map(AnnotationUpdate::from).collect();
        client
            .push_entity(SyncKind::Annotations, book_id, &body)
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

    fn update(book_id: &str, remote_id: Option<&str>, note: &str) -> AnnotationUpdate {
        AnnotationUpdate {
            id: remote_id.map(ToString::to_string),
            book_id: book_id.to_string(),
            page: Some(4),
            epubcfi: None,
            highlighted_text: Some("a memorable passage".to_string()),
            note: Some(note.to_string()),
        }
    }

    #[tokio::test]
    async fn test_remote_upsert_matches_by_remote_id() {
        let db = Database::new_in_memory().await.unwrap();
        let store = AnnotationStore::new(db);

        store
            .upsert_remote("s1", &update("b1", Some("r1"), "first"))
            .await
            .unwrap();
        store
            .upsert_remote("s1", &update("b1", Some("r1"), "revised"))
            .await
            .unwrap();

        let rows = store.list_for_book("b1", "s1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].note.as_deref(), Some("revised"));
        assert!(rows[0].is_synced);
    }

    #[tokio::test]
    async fn test_local_annotations_track_sync_state() {
        let db = Database::new_in_memory().await.unwrap();
        let store = AnnotationStore::new(db);

        store
            .record_local("s1", &update("b1", None, "thought"))
            .await
            .unwrap();

        assert_eq!(store.list_unsynced_book_ids("s1").await.unwrap(), vec!["b1"]);
        store.mark_synced("b1", "s1").await.unwrap();
        assert!(store.list_unsynced_book_ids("s1").await.unwrap().is_empty());
        assert_eq!(store.known_book_ids("s1").await.unwrap(), vec!["b1"]);
    }
}
