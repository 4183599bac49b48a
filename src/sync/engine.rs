//! Composition of the three reconcilers into one full sync pass.

use std::sync::Arc;

use tracing::{instrument, warn};

use super::annotations::{AnnotationStore, AnnotationSync};
use super::bookmarks::{BookmarkStore, BookmarkSync};
use super::progress::{ProgressStore, ReadProgressSync};
use super::reconciler::{Reconciler, SyncError, SyncReport};
use crate::db::Database;
use crate::server::ServerRegistry;

/// Outcome of a full sync pass across all three entity kinds.
#[derive(Debug, Default)]
pub struct FullSyncReport {
    /// Reading-progress outcome per server.
    pub progress: SyncReport,
    /// Bookmark outcome per server.
    pub bookmarks: SyncReport,
    /// Annotation outcome per server.
    pub annotations: SyncReport,
    /// Total failed books across all kinds and servers.
    pub failed: usize,
}

impl FullSyncReport {
    /// Whether the pass completed without any failed book.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// Runs the three reconcilers (progress, bookmarks, annotations)
/// independently: a partial failure in one never stops the others.
pub struct SyncEngine {
    progress: Reconciler<ReadProgressSync>,
    bookmarks: Reconciler<BookmarkSync>,
    annotations: Reconciler<AnnotationSync>,
}

impl SyncEngine {
    /// Creates an engine over the given database and server registry.
    #[must_use]
    pub fn new(db: &Database, registry: Arc<ServerRegistry>) -> Self {
        Self {
            progress: Reconciler::new(
                Arc::clone(&registry),
                ReadProgressSync::new(ProgressStore::new(db.clone())),
            ),
            bookmarks: Reconciler::new(
                Arc::clone(&registry),
                BookmarkSync::new(BookmarkStore::new(db.clone())),
            ),
            annotations: Reconciler::new(
                registry,
                AnnotationSync::new(AnnotationStore::new(db.clone())),
            ),
        }
    }

    /// The reading-progress reconciler, for kind-scoped sync calls.
    #[must_use]
    pub fn progress(&self) -> &Reconciler<ReadProgressSync> {
        &self.progress
    }

    /// The bookmark reconciler, for kind-scoped sync calls.
    #[must_use]
    pub fn bookmarks(&self) -> &Reconciler<BookmarkSync> {
        &self.bookmarks
    }

    /// The annotation reconciler, for kind-scoped sync calls.
    #[must_use]
    pub fn annotations(&self) -> &Reconciler<AnnotationSync> {
        &self.annotations
    }

    /// Runs a full pull-then-push cycle for every kind.
    ///
    /// Partial failures are folded into the report; all three kinds always
    /// run to completion.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Store`] when local persistence fails for any
    /// kind (reported after all kinds have run).
    #[instrument(skip(self, for_servers))]
    pub async fn sync_all(
        &self,
        for_servers: Option<&[String]>,
    ) -> Result<FullSyncReport, SyncError> {
        let mut report = FullSyncReport::default();
        let mut store_error = None;

        match self.progress.sync(for_servers).await {
            Ok(r) => report.progress = r,
            Err(e) => absorb(e, "progress", &mut report.progress, &mut store_error),
        }
        match self.bookmarks.sync(for_servers).await {
            Ok(r) => report.bookmarks = r,
            Err(e) => absorb(e, "bookmarks", &mut report.bookmarks, &mut store_error),
        }
        match self.annotations.sync(for_servers).await {
            Ok(r) => report.annotations = r,
            Err(e) => absorb(e, "annotations", &mut report.annotations, &mut store_error),
        }

        if let Some(e) = store_error {
            return Err(e);
        }

        report.failed = count_failed(&report.progress)
            + count_failed(&report.bookmarks)
            + count_failed(&report.annotations);
        Ok(report)
    }
}

/// Folds one reconciler's error into the full report: partial failures keep
/// their report, store errors are held until all kinds have run.
fn absorb(
    error: SyncError,
    kind: &str,
    slot: &mut SyncReport,
    store_error: &mut Option<SyncError>,
) {
    match error {
        SyncError::Partial { failed, report } => {
            warn!(kind, failed, "sync pass completed with failures");
            *slot = report;
        }
        e @ SyncError::Store(_) => {
            warn!(kind, error = %e, "sync pass aborted on local store failure");
            if store_error.is_none() {
                *store_error = Some(e);
            }
        }
    }
}

fn count_failed(report: &SyncReport) -> usize {
    use std::collections::HashSet;
    report
        .values()
        .flat_map(|result| result.failed_book_ids.iter())
        .collect::<HashSet<_>>()
        .len()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    // Cross-kind independence is covered against mock servers in
    // tests/sync_integration.rs.

    use super::*;
    use crate::sync::reconciler::SyncResult;

    #[test]
    fn test_clean_report() {
        let report = FullSyncReport::default();
        assert!(report.is_clean());
    }

    #[test]
    fn test_count_failed_dedups_within_kind() {
        let mut report = SyncReport::new();
        report.insert(
            "s1".to_string(),
            SyncResult {
                applied: 0,
                failed_book_ids: vec!["b1".to_string(), "b2".to_string()],
            },
        );
        report.insert(
            "s2".to_string(),
            SyncResult {
                applied: 0,
                failed_book_ids: vec!["b1".to_string()],
            },
        );

        assert_eq!(count_failed(&report), 2);
    }
}
