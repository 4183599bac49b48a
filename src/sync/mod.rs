//! Cross-device sync: pull-then-push reconciliation of reading progress,
//! bookmarks, and annotations between local stores and saved servers.
//!
//! Each entity kind has a local `SQLite` store with an `is_synced` flag and
//! a thin [`EntitySync`] adapter; the generic [`Reconciler`] drives the
//! protocol and the [`SyncEngine`] composes all three kinds into one pass.
//! Partial failures are tracked per book so a failed pull excludes that book
//! from the subsequent push.

mod annotations;
mod bookmarks;
mod engine;
mod focus;
mod mirror;
mod progress;
mod reconciler;

pub use annotations::{Annotation, AnnotationStore, AnnotationSync, AnnotationUpdate};
pub use bookmarks::{Bookmark, BookmarkStore, BookmarkSync, BookmarkUpdate};
pub use engine::{FullSyncReport, SyncEngine};
pub use focus::FocusGuard;
pub use mirror::OfflineMirror;
pub use progress::{ProgressStore, ProgressUpdate, ReadProgress, ReadProgressSync};
pub use reconciler::{EntitySync, Reconciler, SyncError, SyncReport, SyncResult, SyncStepError};
