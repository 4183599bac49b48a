//! Bookmark local store and its reconciler hooks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use tracing::instrument;

use super::reconciler::{EntitySync, SyncStepError};
use crate::db::Database;
use crate::server::{ServerClient, SyncKind};
use crate::store::{Result, StoreError};

/// A locally persisted bookmark.
#[derive(Debug, Clone, FromRow)]
pub struct Bookmark {
    /// Local row id.
    pub id: i64,
    /// The server's id for this bookmark, once synced.
    pub remote_id: Option<String>,
    /// Book the bookmark belongs to.
    pub book_id: String,
    /// Origin server.
    pub server_id: String,
    /// Bookmarked page for page-based formats.
    pub page: Option<i64>,
    /// Bookmarked location for EPUB formats.
    pub epubcfi: Option<String>,
    /// Short text excerpt shown in listings.
    pub preview_content: Option<String>,
    /// Creation time.
    pub created_at: String,
    /// Whether this bookmark has been uploaded.
    pub is_synced: bool,
}

/// Bookmark state as exchanged with the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookmarkUpdate {
    /// The server's bookmark id; absent for never-pushed local bookmarks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Book the bookmark belongs to.
    pub book_id: String,
    /// Bookmarked page for page-based formats.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<i64>,
    /// Bookmarked location for EPUB formats.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epubcfi: Option<String>,
    /// Short text excerpt shown in listings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_content: Option<String>,
}

impl From<&Bookmark> for BookmarkUpdate {
    fn from(row: &Bookmark) -> Self {
        Self {
            id: row.remote_id.clone(),
            book_id: row.book_id.clone(),
            page: row.page,
            epubcfi: row.epubcfi.clone(),
            preview_content: row.preview_content.clone(),
        }
    }
}

/// Store for bookmarks. Remote rows are matched by `(remote_id, server_id)`;
/// local rows exist without a remote id until they are pushed.
#[derive(Debug, Clone)]
pub struct BookmarkStore {
    db: Database,
}

impl BookmarkStore {
    /// Creates a new store with the given database connection.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Applies a server bookmark; the row lands already synced. Updates the
    /// existing row for the remote id when present, inserts otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the write fails.
    #[instrument(skip(self, update), fields(book_id = %update.book_id, server_id = %server_id))]
    pub async fn upsert_remote(&self, server_id: &str, update: &BookmarkUpdate) -> Result<()> {
        if let Some(remote_id) = &update.id {
            let result = sqlx::query(
                r"UPDATE bookmarks
                  SET book_id = ?, page = ?, epubcfi = ?, preview_content = ?, is_synced = 1
                  WHERE remote_id = ? AND server_id = ?",
            )
            .bind(&update.book_id)
            .bind(update.page)
            .bind(&update.epubcfi)
            .bind(&update.preview_content)
            .bind(remote_id)
            .bind(server_id)
            .execute(self.db.pool())
            .await?;

            if result.rows_affected() > 0 {
                return Ok(());
            }
        }

        sqlx::query(
            r"INSERT INTO bookmarks (
                remote_id, book_id, server_id, page, epubcfi, preview_content, is_synced
              )
              VALUES (?, ?, ?, ?, ?, ?, 1)",
        )
        .bind(&update.id)
        .bind(&update.book_id)
        .bind(server_id)
        .bind(update.page)
        .bind(&update.epubcfi)
        .bind(&update.preview_content)
        .execute(self.db.pool())
        .await?;

        Ok(())
    }

    /// Records a reader-local bookmark; unsynced until the next push.
    /// Returns the local row id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the insert fails.
    #[instrument(skip(self, update), fields(book_id = %update.book_id, server_id = %server_id))]
    pub async fn record_local(&self, server_id: &str, update: &BookmarkUpdate) -> Result<i64> {
        let result = sqlx::query(
            r"INSERT INTO bookmarks (
                remote_id, book_id, server_id, page, epubcfi, preview_content, is_synced
              )
              VALUES (NULL, ?, ?, ?, ?, ?, 0)
              RETURNING id",
        )
        .bind(&update.book_id)
        .bind(server_id)
        .bind(update.page)
        .bind(&update.epubcfi)
        .bind(&update.preview_content)
        .fetch_one(self.db.pool())
        .await?;

        use sqlx::Row;
        Ok(result.get("id"))
    }

    /// Lists bookmarks for a book, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_for_book(&self, book_id: &str, server_id: &str) -> Result<Vec<Bookmark>> {
        let rows = sqlx::query_as::<_, Bookmark>(
            r"SELECT * FROM bookmarks
              WHERE book_id = ? AND server_id = ?
              ORDER BY created_at ASC, id ASC",
        )
        .bind(book_id)
        .bind(server_id)
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows)
    }

    /// Unsynced bookmarks for one book.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn list_unsynced_for_book(
        &self,
        book_id: &str,
        server_id: &str,
    ) -> Result<Vec<Bookmark>> {
        let rows = sqlx::query_as::<_, Bookmark>(
            r"SELECT * FROM bookmarks
              WHERE book_id = ? AND server_id = ? AND is_synced = 0
              ORDER BY created_at ASC, id ASC",
        )
        .bind(book_id)
        .bind(server_id)
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows)
    }

    /// Book ids with unsynced bookmarks for a server.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn list_unsynced_book_ids(&self, server_id: &str) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            r"SELECT DISTINCT book_id FROM bookmarks
              WHERE server_id = ? AND is_synced = 0
              ORDER BY book_id ASC",
        )
        .bind(server_id)
        .fetch_all(self.db.pool())
        .await?;

        Ok(ids)
    }

    /// Marks all of a book's bookmarks as uploaded.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn mark_synced(&self, book_id: &str, server_id: &str) -> Result<()> {
        sqlx::query(
            r"UPDATE bookmarks SET is_synced = 1
              WHERE book_id = ? AND server_id = ?",
        )
        .bind(book_id)
        .bind(server_id)
        .execute(self.db.pool())
        .await?;

        Ok(())
    }

    /// All book ids with bookmark rows for a server, synced or not.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn known_book_ids(&self, server_id: &str) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            r"SELECT DISTINCT book_id FROM bookmarks
              WHERE server_id = ?
              ORDER BY book_id ASC",
        )
        .bind(server_id)
        .fetch_all(self.db.pool())
        .await?;

        Ok(ids)
    }
}

/// Reconciler hooks for bookmarks.
#[derive(Debug, Clone)]
pub struct BookmarkSync {
    store: BookmarkStore,
}

impl BookmarkSync {
    /// Creates the hooks over the given store.
    #[must_use]
    pub fn new(store: BookmarkStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EntitySync for BookmarkSync {
    fn kind(&self) -> SyncKind {
        SyncKind::Bookmarks
    }

    async fn apply_remote(
        &self,
        server_id: &str,
        _book_id: &str,
        item: &Value,
    ) -> std::result::Result<(), SyncStepError> {
        let update: BookmarkUpdate = serde_json::from_value(item.clone())?;
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
        let body: Vec<BookmarkUpdate> = rows.iter().map(BookmarkUpdate::from).collect();
        client
            .push_entity(SyncKind::Bookmarks, book_id, &body)
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
