//! Online → offline mirroring of live-server mutations.
//!
//! When a progress/bookmark/annotation mutation succeeds against the live
//! server and the book is downloaded locally, the same state is written into
//! the local store already marked synced, so the offline copy agrees with
//! the server immediately instead of waiting for the next sync pass.
//!
//! Everything here is best-effort: failures are logged and swallowed. A
//! mirror miss costs one redundant pull later, never a user-visible error.

use tracing::{instrument, warn};

use super::annotations::{AnnotationStore, AnnotationUpdate};
use super::bookmarks::{BookmarkStore, BookmarkUpdate};
use super::progress::{ProgressStore, ProgressUpdate};
use crate::db::Database;
use crate::store::DownloadedFileStore;

/// Best-effort mirror of successful live-server mutations into the local
/// stores, gated on the book being downloaded.
#[derive(Debug, Clone)]
pub struct OfflineMirror {
    files: DownloadedFileStore,
    progress: ProgressStore,
    bookmarks: BookmarkStore,
    annotations: AnnotationStore,
}

impl OfflineMirror {
    /// Creates a mirror over the given database.
    #[must_use]
    pub fn new(db: &Database) -> Self {
        Self {
            files: DownloadedFileStore::new(db.clone()),
            progress: ProgressStore::new(db.clone()),
            bookmarks: BookmarkStore::new(db.clone()),
            annotations: AnnotationStore::new(db.clone()),
        }
    }

    /// Whether the book is downloaded and should be mirrored. Lookup errors
    /// count as "not downloaded".
    async fn should_mirror(&self, book_id: &str, server_id: &str) -> bool {
        match self.files.contains(book_id, server_id).await {
            Ok(downloaded) => downloaded,
            Err(e) => {
                warn!(book_id, server_id, error = %e, "mirror lookup failed");
                false
            }
        }
    }

    /// Mirrors a successful progress update.
    #[instrument(skip(self, update), fields(book_id = %update.book_id, server_id = %server_id))]
    pub async fn mirror_progress(&self, server_id: &str, update: &ProgressUpdate) {
        if !self.should_mirror(&update.book_id, server_id).await {
            return;
        }
        if let Err(e) = self.progress.upsert_remote(server_id, update).await {
            warn!(error = %e, "failed to mirror progress update");
        }
    }

    /// Mirrors a successfully created or updated bookmark.
    #[instrument(skip(self, update), fields(book_id = %update.book_id, server_id = %server_id))]
    pub async fn mirror_bookmark(&self, server_id: &str, update: &BookmarkUpdate) {
        if !self.should_mirror(&update.book_id, server_id).await {
            return;
        }
        if let Err(e) = self.bookmarks.upsert_remote(server_id, update).await {
            warn!(error = %e, "failed to mirror bookmark");
        }
    }

    /// Mirrors a successfully created or updated annotation.
    #[instrument(skip(self, update), fields(book_id = %update.book_id, server_id = %server_id))]
    pub async fn mirror_annotation(&self, server_id: &str, update: &AnnotationUpdate) {
        if !self.should_mirror(&update.book_id, server_id).await {
            return;
        }
        if let Err(e) = self.annotations.upsert_remote(server_id, update).await {
            warn!(error = %e, "failed to mirror annotation");
        }
    }
}
