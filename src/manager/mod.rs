//! Download queue manager.
//!
//! The admission-controlled scheduler at the heart of the offline engine:
//! enqueues, dedups, starts, cancels, retries, dismisses, and completes
//! downloads, bounded by a maximum concurrency, emitting lifecycle events to
//! subscribers.
//!
//! The manager is an explicitly constructed, dependency-injected service
//! instance - no module-level singleton - so tests can build isolated
//! instances. It exclusively owns the in-memory active-download map; durable
//! state lives in the [`QueueStore`], which remains the single source of
//! truth across restarts.
//!
//! # Concurrency model
//!
//! - Each download runs in its own Tokio task.
//! - Admission control is a scheduler pass under a real mutex
//!   (`try_lock`, so overlapping passes are no-ops) combined with the
//!   active-set size check; the store's atomic claim prevents double-starts
//!   even across racing call sites.
//! - Entries start strictly in creation order; there are no priorities.
//! - Cancellation is cooperative: it asks the executor to abort, stops
//!   tracking the download, and frees the slot immediately.
//! - Failures are never silently retried; retry is always a deliberate
//!   caller action (`retry` or re-`enqueue` of the same natural key).

mod events;

pub use events::{EventBus, QueueEvent};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::db::Database;
use crate::download::{DownloadError, DownloadOutcome, DownloadProgress, HttpClient};
use crate::server::{RegistryError, ServerRegistry};
use crate::store::{
    DownloadedFileStore, NewDownloadedFile, NewQueueEntry, QueueEntry, QueueStatus, QueueStore,
    StoreError,
};

/// Hard cap on simultaneous downloads.
pub const MAX_CONCURRENT_DOWNLOADS: usize = 2;

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Maximum simultaneous downloads.
    pub max_concurrent: usize,
    /// Root directory downloads are written under, one subdirectory per server.
    pub download_dir: PathBuf,
}

impl ManagerConfig {
    /// Creates a config with the default concurrency cap.
    #[must_use]
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            max_concurrent: MAX_CONCURRENT_DOWNLOADS,
            download_dir: download_dir.into(),
        }
    }
}

/// Snapshot of one currently running download.
#[derive(Debug, Clone)]
pub struct ActiveDownload {
    /// Queue entry id.
    pub queue_id: i64,
    /// Book being downloaded.
    pub book_id: String,
    /// Origin server.
    pub server_id: String,
    /// Latest progress tick.
    pub progress: DownloadProgress,
}

/// In-memory bookkeeping for a running download; never persisted.
struct ActiveEntry {
    info: ActiveDownload,
    cancel: CancellationToken,
}

/// Result of an enqueue call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new entry was created.
    New(i64),
    /// An entry for the natural key already existed (possibly resurrected
    /// from `failed`); its id is reused.
    Existing(i64),
    /// The book is already in the downloaded-file store; nothing enqueued.
    AlreadyDownloaded,
}

impl EnqueueOutcome {
    /// Numeric form of the enqueue contract: the queue id, or `-1` meaning
    /// "already downloaded, nothing enqueued".
    #[must_use]
    pub fn queue_id(&self) -> i64 {
        match self {
            Self::New(id) | Self::Existing(id) => *id,
            Self::AlreadyDownloaded => -1,
        }
    }
}

/// Errors surfaced by manager operations that return to a blocking caller.
///
/// Queue-path failures (enqueue/cancel/retry/dismiss) are converted into
/// `failed` entries and events instead; only store/registry access itself
/// can error there.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Persisted store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// No usable client for the server.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The download itself failed.
    #[error(transparent)]
    Download(#[from] DownloadError),

    /// The download directory could not be created.
    #[error("failed to create download directory {path}: {source}")]
    DownloadDir {
        /// The directory that could not be created.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// The download queue manager. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<Inner>,
}

struct Inner {
    queue: QueueStore,
    files: DownloadedFileStore,
    registry: Arc<ServerRegistry>,
    http: HttpClient,
    events: EventBus,
    active: Mutex<HashMap<i64, ActiveEntry>>,
    // Guards the "pick next pending and promote it" critical section.
    // try_lock makes overlapping scheduler passes no-ops.
    schedule_lock: tokio::sync::Mutex<()>,
    config: ManagerConfig,
}

impl Inner {
    /// Locks the active map, recovering from a poisoned lock: the map only
    /// holds plain bookkeeping, so the last consistent view is safe to use.
    fn lock_active(&self) -> MutexGuard<'_, HashMap<i64, ActiveEntry>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn destination(&self, server_id: &str, filename: &str, extension: &str) -> PathBuf {
        self.config
            .download_dir
            .join(server_id)
            .join(format!("{filename}.{extension}"))
    }

    async fn ensure_parent_dir(&self, dest: &std::path::Path) -> Result<(), ManagerError> {
        let Some(parent) = dest.parent() else {
            return Ok(());
        };
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| ManagerError::DownloadDir {
                path: parent.to_path_buf(),
                source,
            })
    }
}

impl DownloadManager {
    /// Creates a manager over the given database and server registry.
    #[must_use]
    pub fn new(db: &Database, registry: Arc<ServerRegistry>, config: ManagerConfig) -> Self {
        Self::with_http_client(db, registry, config, HttpClient::new())
    }

    /// Creates a manager with a custom executor (timeout tuning in tests).
    #[must_use]
    pub fn with_http_client(
        db: &Database,
        registry: Arc<ServerRegistry>,
        config: ManagerConfig,
        http: HttpClient,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: QueueStore::new(db.clone()),
                files: DownloadedFileStore::new(db.clone()),
                registry,
                http,
                events: EventBus::default(),
                active: Mutex::new(HashMap::new()),
                schedule_lock: tokio::sync::Mutex::new(()),
                config,
            }),
        }
    }

    /// Startup pass: resets entries stuck in `downloading` from a crashed
    /// session back to `pending`, then kicks off queue processing.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Store`] if the recovery update fails.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<(), ManagerError> {
        let reset = self.inner.queue.reset_downloading().await?;
        if reset > 0 {
            info!(reset, "recovered interrupted downloads from previous run");
        }
        self.schedule();
        Ok(())
    }

    /// Subscribes to queue lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// The persisted queue store, for listing queries.
    #[must_use]
    pub fn queue(&self) -> &QueueStore {
        &self.inner.queue
    }

    /// The downloaded-file store, for listing queries.
    #[must_use]
    pub fn files(&self) -> &DownloadedFileStore {
        &self.inner.files
    }

    /// Requests a download, deduplicating by `(book_id, server_id)`.
    ///
    /// Safe to call redundantly: an existing pending/downloading entry is
    /// returned untouched; a failed entry is resurrected (back to pending,
    /// reason cleared, URL and metadata overwritten); an already-downloaded
    /// book enqueues nothing.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Store`] if a store operation fails. Download
    /// failures never surface here; they arrive as events and `failed` rows.
    #[instrument(skip(self, request), fields(book_id = %request.book_id, server_id = %request.server_id))]
    pub async fn enqueue(&self, request: NewQueueEntry) -> Result<EnqueueOutcome, ManagerError> {
        let inner = &self.inner;

        if let Some(existing) = inner
            .queue
            .find_by_book(&request.book_id, &request.server_id)
            .await?
        {
            if existing.status == QueueStatus::Failed {
                inner
                    .queue
                    .resurrect(existing.id, &request.download_url, request.metadata.as_ref())
                    .await?;
                debug!(queue_id = existing.id, "resurrected failed entry");
                inner.events.emit(QueueEvent::QueueChanged);
                self.schedule();
            }
            return Ok(EnqueueOutcome::Existing(existing.id));
        }

        if inner
            .files
            .contains(&request.book_id, &request.server_id)
            .await?
        {
            debug!("book already downloaded; nothing enqueued");
            return Ok(EnqueueOutcome::AlreadyDownloaded);
        }

        let id = inner.queue.insert(&request).await?;
        inner.events.emit(QueueEvent::QueueChanged);
        self.schedule();
        Ok(EnqueueOutcome::New(id))
    }

    /// Cancels a download: aborts the underlying transfer when active
    /// (abort errors are swallowed - cancellation never throws), removes the
    /// queue row if present, and frees the concurrency slot.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Store`] if the row deletion fails.
    #[instrument(skip(self))]
    pub async fn cancel(&self, queue_id: i64) -> Result<(), ManagerError> {
        let inner = &self.inner;

        let removed = inner.lock_active().remove(&queue_id);
        if let Some(entry) = removed {
            entry.cancel.cancel();
            inner.events.emit(QueueEvent::Cancelled {
                queue_id,
                book_id: entry.info.book_id,
            });
        }

        // The row may already be gone (completed or dismissed); tolerate it.
        inner.queue.remove(queue_id).await?;
        inner.events.emit(QueueEvent::QueueChanged);
        self.schedule();
        Ok(())
    }

    /// Resets a failed entry to pending; no-op for any other state.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Store`] if the update fails.
    #[instrument(skip(self))]
    pub async fn retry(&self, queue_id: i64) -> Result<(), ManagerError> {
        if self.inner.queue.reset_for_retry(queue_id).await? {
            self.inner.events.emit(QueueEvent::QueueChanged);
            self.schedule();
        }
        Ok(())
    }

    /// Deletes an entry unconditionally (clearing a failed entry the user
    /// does not want to retry). Does not re-trigger scheduling: a failed
    /// entry holds no concurrency slot.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Store`] if the delete fails.
    #[instrument(skip(self))]
    pub async fn dismiss(&self, queue_id: i64) -> Result<(), ManagerError> {
        if self.inner.queue.remove(queue_id).await? {
            self.inner.events.emit(QueueEvent::QueueChanged);
        }
        Ok(())
    }

    /// Bypass path for readers that must block on a single download (e.g. an
    /// EPUB must be fully local before it can open). Skips the queue
    /// entirely; errors return to the caller instead of becoming events.
    ///
    /// Returns the local path, which may be a previously downloaded file.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Registry`] when the server connection cannot
    /// be resolved, [`ManagerError::Download`] when the transfer is cancelled
    /// or returns a non-200 status, and [`ManagerError::Store`] when the
    /// downloaded file cannot be recorded.
    #[instrument(skip(self, request, on_progress), fields(book_id = %request.book_id, server_id = %request.server_id))]
    pub async fn download_immediate(
        &self,
        request: NewQueueEntry,
        on_progress: impl FnMut(DownloadProgress) + Send,
    ) -> Result<PathBuf, ManagerError> {
        let inner = &self.inner;

        if let Some(file) = inner.files.get(&request.book_id, &request.server_id).await? {
            debug!("already downloaded; returning existing path");
            return Ok(PathBuf::from(file.uri));
        }

        let client = inner.registry.client_for(&request.server_id).await?;
        let dest = inner.destination(&request.server_id, &request.filename, &request.extension);
        inner.ensure_parent_dir(&dest).await?;

        let outcome = inner
            .http
            .download_to_file(
                &request.download_url,
                client.headers(),
                &dest,
                &CancellationToken::new(),
                on_progress,
            )
            .await?;

        inner.files.add_file(&materialize(&request, &outcome)).await?;
        Ok(outcome.path)
    }

    /// Snapshots the progress of all currently running downloads.
    #[must_use]
    pub fn all_progress(&self) -> Vec<ActiveDownload> {
        self.inner
            .lock_active()
            .values()
            .map(|entry| entry.info.clone())
            .collect()
    }

    /// Snapshots the progress of one running download, if active.
    #[must_use]
    pub fn progress_of(&self, queue_id: i64) -> Option<DownloadProgress> {
        self.inner
            .lock_active()
            .get(&queue_id)
            .map(|entry| entry.info.progress)
    }

    /// Number of currently running downloads.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.lock_active().len()
    }

    /// Spawns a scheduler pass. Non-blocking at every call site.
    fn schedule(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            manager.process_queue().await;
        });
    }

    /// One scheduler pass: while a concurrency slot is free, claim the
    /// oldest pending entry and start it. Overlapping passes no-op via
    /// `try_lock`; this is the single point of admission control.
    async fn process_queue(&self) {
        let Ok(_guard) = self.inner.schedule_lock.try_lock() else {
            debug!("scheduler pass already running");
            return;
        };

        loop {
            if self.inner.lock_active().len() >= self.inner.config.max_concurrent {
                break;
            }

            let entry = match self.inner.queue.claim_next_pending().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "failed to claim next pending entry");
                    break;
                }
            };

            self.start_download(entry).await;
        }
    }

    /// Starts a claimed entry: resolves the server client, registers the
    /// active download, and spawns the transfer task.
    async fn start_download(&self, entry: QueueEntry) {
        let inner = &self.inner;

        let client = match inner.registry.client_for(&entry.server_id).await {
            Ok(client) => client,
            Err(e) => {
                debug!(error = %e, "cannot start download without a server client");
                self.mark_failed(
                    entry.id,
                    &format!("Server not connected: {}", entry.server_id),
                )
                .await;
                return;
            }
        };

        let dest = inner.destination(&entry.server_id, &entry.filename, &entry.extension);
        if let Err(e) = inner.ensure_parent_dir(&dest).await {
            self.mark_failed(entry.id, &e.to_string()).await;
            return;
        }

        let cancel = CancellationToken::new();
        inner.lock_active().insert(
            entry.id,
            ActiveEntry {
                info: ActiveDownload {
                    queue_id: entry.id,
                    book_id: entry.book_id.clone(),
                    server_id: entry.server_id.clone(),
                    progress: DownloadProgress::default(),
                },
                cancel: cancel.clone(),
            },
        );

        // The active entry is registered before Started goes out, so a
        // subscriber reacting to the event always sees the download in the
        // progress snapshots.
        inner.events.emit(QueueEvent::Started {
            queue_id: entry.id,
            book_id: entry.book_id.clone(),
        });
        inner.events.emit(QueueEvent::QueueChanged);

        let manager = self.clone();
        let headers = client.headers();
        tokio::spawn(async move {
            let progress_manager = manager.clone();
            let queue_id = entry.id;
            let book_id = entry.book_id.clone();

            let result = manager
                .inner
                .http
                .download_to_file(
                    &entry.download_url,
                    headers,
                    &dest,
                    &cancel,
                    move |progress| {
                        if let Some(active) =
                            progress_manager.inner.lock_active().get_mut(&queue_id)
                        {
                            active.info.progress = progress;
                        }
                        progress_manager.inner.events.emit(QueueEvent::Progress {
                            queue_id,
                            book_id: book_id.clone(),
                            progress,
                        });
                    },
                )
                .await;

            manager.inner.lock_active().remove(&queue_id);

            match result {
                Ok(outcome) => manager.complete_download(entry, outcome).await,
                Err(DownloadError::Cancelled) => {
                    // Usually the row is already gone (cancel() deleted it);
                    // mark_failed tolerates that and emits nothing then.
                    manager.mark_failed(queue_id, "Download was cancelled").await;
                }
                Err(e) => {
                    error!(
                        server_id = %entry.server_id,
                        book_id = %entry.book_id,
                        error = %e,
                        "download failed"
                    );
                    manager.mark_failed(queue_id, &e.to_string()).await;
                }
            }
        });
    }

    /// Materializes a finished transfer: records the downloaded file,
    /// deletes the queue row, and announces completion. Completion is not
    /// assumed just because bytes arrived - if recording the file fails, the
    /// entry is marked failed instead.
    async fn complete_download(&self, entry: QueueEntry, outcome: DownloadOutcome) {
        let inner = &self.inner;
        let request = NewQueueEntry {
            book_id: entry.book_id.clone(),
            server_id: entry.server_id.clone(),
            download_url: entry.download_url.clone(),
            filename: entry.filename.clone(),
            extension: entry.extension.clone(),
            metadata: entry.metadata.clone(),
        };

        if let Err(e) = inner.files.add_file(&materialize(&request, &outcome)).await {
            self.mark_failed(entry.id, &format!("failed to record downloaded file: {e}"))
                .await;
            return;
        }

        if let Err(e) = inner.queue.remove(entry.id).await {
            warn!(queue_id = entry.id, error = %e, "failed to delete completed entry");
        }

        info!(
            queue_id = entry.id,
            book_id = %entry.book_id,
            bytes = outcome.bytes_downloaded,
            "download completed"
        );
        inner.events.emit(QueueEvent::Completed {
            queue_id: entry.id,
            book_id: entry.book_id,
        });
        inner.events.emit(QueueEvent::QueueChanged);
        self.schedule();
    }

    /// Single failure funnel: marks the entry failed, emits `Failed` when
    /// the row still exists, always emits `QueueChanged`, and re-triggers
    /// scheduling so the concurrency slot is reclaimed.
    async fn mark_failed(&self, queue_id: i64, reason: &str) {
        let inner = &self.inner;
        match inner.queue.mark_failed(queue_id, reason).await {
            Ok(Some(entry)) => {
                inner.events.emit(QueueEvent::Failed {
                    queue_id,
                    book_id: entry.book_id,
                    reason: reason.to_string(),
                });
            }
            Ok(None) => {
                debug!(queue_id, "entry gone before failure could be recorded");
            }
            Err(e) => {
                warn!(queue_id, error = %e, "failed to record download failure");
            }
        }
        inner.events.emit(QueueEvent::QueueChanged);
        self.schedule();
    }
}

/// Builds the downloaded-file row for a finished transfer.
#[allow(clippy::cast_possible_wrap)]
fn materialize(request: &NewQueueEntry, outcome: &DownloadOutcome) -> NewDownloadedFile {
    let (book_name, series_id) = request
        .metadata
        .as_ref()
        .map(|m| (m.v1().book_name.clone(), m.v1().series_id.clone()))
        .unwrap_or_default();

    NewDownloadedFile {
        id: request.book_id.clone(),
        server_id: request.server_id.clone(),
        filename: format!("{}.{}", request.filename, request.extension),
        uri: outcome.path.to_string_lossy().into_owned(),
        size: Some(
            outcome
                .content_length
                .unwrap_or(outcome.bytes_downloaded) as i64,
        ),
        book_name,
        series_id,
        metadata: request.metadata.clone(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    // End-to-end scheduling behavior is covered against mock servers in
    // tests/manager_integration.rs.

    use super::*;

    #[test]
    fn test_enqueue_outcome_queue_id_contract() {
        assert_eq!(EnqueueOutcome::New(3).queue_id(), 3);
        assert_eq!(EnqueueOutcome::Existing(7).queue_id(), 7);
        assert_eq!(EnqueueOutcome::AlreadyDownloaded.queue_id(), -1);
    }

    #[test]
    fn test_manager_config_defaults_to_two_slots() {
        let config = ManagerConfig::new("/tmp/downloads");
        assert_eq!(config.max_concurrent, MAX_CONCURRENT_DOWNLOADS);
        assert_eq!(MAX_CONCURRENT_DOWNLOADS, 2);
    }

    #[test]
    fn test_materialize_prefers_content_length() {
        let request = NewQueueEntry {
            book_id: "b1".to_string(),
            server_id: "s1".to_string(),
            download_url: "https://stump.local/api/v1/books/b1/file".to_string(),
            filename: "b1".to_string(),
            extension: "cbz".to_string(),
            metadata: None,
        };
        let outcome = DownloadOutcome {
            path: PathBuf::from("/downloads/s1/b1.cbz"),
            bytes_downloaded: 900,
            content_length: Some(1000),
        };

        let file = materialize(&request, &outcome);
        assert_eq!(file.size, Some(1000));
        assert_eq!(file.filename, "b1.cbz");
        assert_eq!(file.uri, "/downloads/s1/b1.cbz");
    }
}
