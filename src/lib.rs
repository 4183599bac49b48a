//! Stump Offline Engine
//!
//! This library provides the offline layer for Stump clients: a persistent,
//! concurrency-bounded download queue for books, and pull-then-push sync
//! reconcilers that keep reading progress, bookmarks, and annotations
//! consistent across devices and server instances.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`db`] - Database connection and schema management
//! - [`store`] - Persisted download queue and downloaded-file stores
//! - [`download`] - Streaming HTTP download executor with cancellation
//! - [`server`] - Saved server connections and authenticated API clients
//! - [`manager`] - The download queue manager and its event bridge
//! - [`sync`] - Reconcilers for progress, bookmarks, and annotations
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use stump_offline::{
//!     Database, DownloadManager, ManagerConfig, NewQueueEntry, ServerRegistry,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new(Path::new("offline.db")).await?;
//! let registry = Arc::new(ServerRegistry::new(db.clone()));
//! let manager = DownloadManager::new(&db, registry, ManagerConfig::new("downloads"));
//! manager.initialize().await?;
//!
//! let mut events = manager.subscribe();
//! manager
//!     .enqueue(NewQueueEntry {
//!         book_id: "b1".to_string(),
//!         server_id: "home".to_string(),
//!         download_url: "https://stump.example.com/api/v1/books/b1/file".to_string(),
//!         filename: "b1".to_string(),
//!         extension: "cbz".to_string(),
//!         metadata: None,
//!     })
//!     .await?;
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod db;
pub mod download;
pub mod manager;
pub mod server;
pub mod store;
pub mod sync;

// Re-export commonly used types
pub use db::{Database, DbError};
pub use download::{DownloadError, DownloadOutcome, DownloadProgress, HttpClient};
pub use manager::{
    ActiveDownload, DownloadManager, EnqueueOutcome, EventBus, MAX_CONCURRENT_DOWNLOADS,
    ManagerConfig, ManagerError, QueueEvent,
};
pub use server::{RegistryError, RemoteError, ServerClient, ServerConfig, ServerRegistry, SyncKind};
pub use store::{
    DownloadedFile, DownloadedFileStore, EntryMetadata, MetadataV1, NewDownloadedFile,
    NewQueueEntry, QueueEntry, QueueStatus, QueueStore, StoreError, StoreErrorKind, TocEntry,
};
pub use sync::{
    Annotation, AnnotationStore, AnnotationSync, AnnotationUpdate, Bookmark, BookmarkStore,
    BookmarkSync, BookmarkUpdate, EntitySync, FocusGuard, FullSyncReport, OfflineMirror,
    ProgressStore, ProgressUpdate, ReadProgress, ReadProgressSync, Reconciler, SyncEngine,
    SyncError, SyncReport, SyncResult, SyncStepError,
};
