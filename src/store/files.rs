//! Store for materialized completed downloads.

use sqlx::FromRow;
use tracing::{instrument, warn};

use super::Result;
use super::metadata::EntryMetadata;
use crate::db::Database;

/// A completed download materialized on disk.
#[derive(Debug, Clone)]
pub struct DownloadedFile {
    /// Book identifier (shared with the origin server).
    pub id: String,
    /// Origin server identifier.
    pub server_id: String,
    /// Stored filename.
    pub filename: String,
    /// Local URI of the file.
    pub uri: String,
    /// File size in bytes, when known.
    pub size: Option<i64>,
    /// Denormalized display name.
    pub book_name: Option<String>,
    /// Series the book belongs to, when known.
    pub series_id: Option<String>,
    /// Display metadata carried over from the queue entry.
    pub metadata: Option<EntryMetadata>,
    /// When the download completed.
    pub created_at: String,
}

/// Fields for materializing a completed download.
#[derive(Debug, Clone)]
pub struct NewDownloadedFile {
    pub id: String,
    pub server_id: String,
    pub filename: String,
    pub uri: String,
    pub size: Option<i64>,
    pub book_name: Option<String>,
    pub series_id: Option<String>,
    pub metadata: Option<EntryMetadata>,
}

#[derive(Debug, FromRow)]
struct FileRow {
    id: String,
    server_id: String,
    filename: String,
    uri: String,
    size: Option<i64>,
    book_name: Option<String>,
    series_id: Option<String>,
    metadata: Option<String>,
    created_at: String,
}

impl From<FileRow> for DownloadedFile {
    fn from(row: FileRow) -> Self {
        let metadata = row.metadata.as_deref().and_then(|json| {
            let decoded = EntryMetadata::decode(json);
            if decoded.is_none() {
                warn!(book_id = %row.id, "discarding undecodable downloaded-file metadata");
            }
            decoded
        });

        Self {
            id: row.id,
            server_id: row.server_id,
            filename: row.filename,
            uri: row.uri,
            size: row.size,
            book_name: row.book_name,
            series_id: row.series_id,
            metadata,
            created_at: row.created_at,
        }
    }
}

/// Store for downloaded files, keyed by `(id, server_id)`.
#[derive(Debug, Clone)]
pub struct DownloadedFileStore {
    db: Database,
}

impl DownloadedFileStore {
    /// Creates a new store with the given database connection.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Idempotent upsert of a downloaded file, keyed by `(id, server_id)`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`](super::StoreError::Database) if the
    /// upsert fails.
    #[instrument(skip(self, file), fields(book_id = %file.id, server_id = %file.server_id))]
    pub async fn add_file(&self, file: &NewDownloadedFile) -> Result<()> {
        let metadata_json = file.metadata.as_ref().and_then(EntryMetadata::encode);

        sqlx::query(
            r"INSERT INTO downloaded_files (
                id, server_id, filename, uri, size, book_name, series_id, metadata
              )
              VALUES (?, ?, ?, ?, ?, ?, ?, ?)
              ON CONFLICT (id, server_id) DO UPDATE SET
                filename = excluded.filename,
                uri = excluded.uri,
                size = excluded.size,
                book_name = excluded.book_name,
                series_id = excluded.series_id,
                metadata = excluded.metadata",
        )
        .bind(&file.id)
        .bind(&file.server_id)
        .bind(&file.filename)
        .bind(&file.uri)
        .bind(file.size)
        .bind(&file.book_name)
        .bind(&file.series_id)
        .bind(metadata_json)
        .execute(self.db.pool())
        .await?;

        Ok(())
    }

    /// Gets a downloaded file by its natural key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`](super::StoreError::Database) if the
    /// query fails.
    #[instrument(skip(self))]
    pub async fn get(&self, book_id: &str, server_id: &str) -> Result<Option<DownloadedFile>> {
        let row = sqlx::query_as::<_, FileRow>(
            r"SELECT * FROM downloaded_files WHERE id = ? AND server_id = ?",
        )
        .bind(book_id)
        .bind(server_id)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(row.map(DownloadedFile::from))
    }

    /// Returns whether a book is downloaded for a server.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`](super::StoreError::Database) if the
    /// query fails.
    pub async fn contains(&self, book_id: &str, server_id: &str) -> Result<bool> {
        Ok(self.get(book_id, server_id).await?.is_some())
    }

    /// Lists downloaded files for a server, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`](super::StoreError::Database) if the
    /// query fails.
    #[instrument(skip(self))]
    pub async fn list_for_server(&self, server_id: &str) -> Result<Vec<DownloadedFile>> {
        let rows = sqlx::query_as::<_, FileRow>(
            r"SELECT * FROM downloaded_files
              WHERE server_id = ?
              ORDER BY created_at DESC, id ASC",
        )
        .bind(server_id)
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows.into_iter().map(DownloadedFile::from).collect())
    }

    /// Removes a downloaded-file row (used by delete-download flows).
    ///
    /// Returns `true` when a row was deleted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`](super::StoreError::Database) if the
    /// delete fails.
    #[instrument(skip(self))]
    pub async fn remove(&self, book_id: &str, server_id: &str) -> Result<bool> {
        let result =
            sqlx::query(r"DELETE FROM downloaded_files WHERE id = ? AND server_id = ?")
                .bind(book_id)
                .bind(server_id)
                .execute(self.db.pool())
                .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::Database;
    use crate::store::MetadataV1;

    fn new_file(book_id: &str) -> NewDownloadedFile {
        NewDownloadedFile {
            id: book_id.to_string(),
            server_id: "s1".to_string(),
            filename: format!("{book_id}.cbz"),
            uri: format!("/downloads/s1/{book_id}.cbz"),
            size: Some(1024),
            book_name: Some("Saga #1".to_string()),
            series_id: Some("series-1".to_string()),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_add_file_then_get_round_trips() {
        let db = Database::new_in_memory().await.unwrap();
        let store = DownloadedFileStore::new(db);

        store.add_file(&new_file("b1")).await.unwrap();

        let file = store.get("b1", "s1").await.unwrap().unwrap();
        assert_eq!(file.filename, "b1.cbz");
        assert_eq!(file.size, Some(1024));
        assert_eq!(file.book_name.as_deref(), Some("Saga #1"));
    }

    #[tokio::test]
    async fn test_add_file_is_idempotent_upsert() {
        let db = Database::new_in_memory().await.unwrap();
        let store = DownloadedFileStore::new(db);

        store.add_file(&new_file("b1")).await.unwrap();

        let mut updated = new_file("b1");
        updated.size = Some(2048);
        store.add_file(&updated).await.unwrap();

        let files = store.list_for_server("s1").await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].size, Some(2048));
    }

    #[tokio::test]
    async fn test_contains_and_remove() {
        let db = Database::new_in_memory().await.unwrap();
        let store = DownloadedFileStore::new(db);

        assert!(!store.contains("b1", "s1").await.unwrap());
        store.add_file(&new_file("b1")).await.unwrap();
        assert!(store.contains("b1", "s1").await.unwrap());

        assert!(store.remove("b1", "s1").await.unwrap());
        assert!(!store.contains("b1", "s1").await.unwrap());
        assert!(!store.remove("b1", "s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_metadata_survives_materialization() {
        let db = Database::new_in_memory().await.unwrap();
        let store = DownloadedFileStore::new(db);

        let mut file = new_file("b1");
        file.metadata = Some(EntryMetadata::V1(MetadataV1 {
            library_name: Some("Comics".to_string()),
            ..Default::default()
        }));
        store.add_file(&file).await.unwrap();

        let fetched = store.get("b1", "s1").await.unwrap().unwrap();
        assert_eq!(
            fetched.metadata.unwrap().v1().library_name.as_deref(),
            Some("Comics")
        );
    }
}
