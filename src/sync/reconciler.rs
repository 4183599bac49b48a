//! Pull-then-push reconciliation protocol, generic over the entity kind.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::server::{RemoteError, ServerClient, ServerRegistry, SyncKind};
use crate::store::StoreError;

/// Per-server outcome of a pull, push, or combined sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncResult {
    /// Items successfully applied (pull) or uploaded (push).
    pub applied: usize,
    /// Book ids that failed and must be excluded from the following phase.
    pub failed_book_ids: Vec<String>,
}

impl SyncResult {
    fn merge(&mut self, other: SyncResult) {
        self.applied += other.applied;
        for id in other.failed_book_ids {
            if !self.failed_book_ids.contains(&id) {
                self.failed_book_ids.push(id);
            }
        }
    }
}

/// Sync outcomes keyed by server id.
pub type SyncReport = HashMap<String, SyncResult>;

/// Distinct failed book ids across a report.
fn distinct_failed(report: &SyncReport) -> usize {
    report
        .values()
        .flat_map(|result| result.failed_book_ids.iter())
        .collect::<HashSet<_>>()
        .len()
}

/// Errors from a reconciliation pass.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Local persistence failed; the pass cannot proceed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The pull+push cycle ran to completion but some books failed.
    ///
    /// The error message carries only the count; callers needing the ids
    /// inspect `report`.
    #[error("sync completed with {failed} failed book(s)")]
    Partial {
        /// Number of distinct books that failed across all servers.
        failed: usize,
        /// The full per-server outcome, including the failed ids.
        report: SyncReport,
    },
}

/// A failure while applying or uploading one item.
#[derive(Debug, Error)]
pub enum SyncStepError {
    /// Writing the item to the local store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The remote call failed.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// The remote item did not decode into the expected shape.
    #[error("malformed sync item: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Storage and transport hooks for one synchronized entity kind.
///
/// The three implementations (progress, bookmarks, annotations) are
/// structurally identical; the [`Reconciler`] drives them through the same
/// pull-then-push protocol.
#[async_trait]
pub trait EntitySync: Send + Sync {
    /// The remote entity kind this implementation reconciles.
    fn kind(&self) -> SyncKind;

    /// Applies one pulled remote item to the local store, marked synced.
    async fn apply_remote(
        &self,
        server_id: &str,
        book_id: &str,
        item: &Value,
    ) -> Result<(), SyncStepError>;

    /// Book ids with local state not yet uploaded.
    async fn unsynced_book_ids(&self, server_id: &str) -> Result<Vec<String>, StoreError>;

    /// Uploads all local unsynced state for one book, then marks it synced.
    async fn push_book(
        &self,
        client: &ServerClient,
        server_id: &str,
        book_id: &str,
    ) -> Result<(), SyncStepError>;

    /// All book ids known locally for the server, synced or not.
    async fn known_book_ids(&self, server_id: &str) -> Result<Vec<String>, StoreError>;
}

/// Drives the pull-then-push protocol for one entity kind across servers.
///
/// Failures are tracked per book: a book whose pull fails is excluded from
/// the subsequent push (stale local state must not clobber newer remote
/// state it failed to observe), and a server whose client cannot be resolved
/// or whose wholesale fetch fails contributes every locally-known book id as
/// failed, skipping the push for that server entirely. Neither aborts the
/// other servers' processing.
pub struct Reconciler<E> {
    registry: Arc<ServerRegistry>,
    entity: E,
}

impl<E: EntitySync> Reconciler<E> {
    /// Creates a reconciler over the given registry and entity hooks.
    pub fn new(registry: Arc<ServerRegistry>, entity: E) -> Self {
        Self { registry, entity }
    }

    /// Pull phase: fetches remote state from each resolved server and
    /// upserts it into the local store.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Store`] when local persistence fails. Remote and
    /// per-item failures are recorded in the report, never returned.
    #[instrument(skip(self, for_servers), fields(kind = %self.entity.kind()))]
    pub async fn pull(&self, for_servers: Option<&[String]>) -> Result<SyncReport, SyncError> {
        let server_ids = self.registry.resolve_server_ids(for_servers).await?;
        let mut report = SyncReport::new();
        for server_id in server_ids {
            let result = self.pull_server(&server_id).await?;
            report.insert(server_id, result);
        }
        Ok(report)
    }

    async fn pull_server(&self, server_id: &str) -> Result<SyncResult, SyncError> {
        let kind = self.entity.kind();

        let client = match self.registry.client_for(server_id).await {
            Ok(client) => client,
            Err(e) => {
                warn!(server_id, %kind, error = %e, "pull skipped; no server client");
                return self.all_known_failed(server_id).await;
            }
        };

        let items = match client.fetch_entities(kind).await {
            Ok(items) => items,
            Err(e) => {
                warn!(server_id, %kind, error = %e, "pull fetch failed for server");
                return self.all_known_failed(server_id).await;
            }
        };

        let mut result = SyncResult::default();
        for item in items {
            let Some(book_id) = item.get("book_id").and_then(Value::as_str) else {
                warn!(server_id, %kind, "skipping pulled item without a book id");
                continue;
            };
            match self.entity.apply_remote(server_id, book_id, &item).await {
                Ok(()) => result.applied += 1,
                Err(e) => {
                    warn!(server_id, %kind, book_id, error = %e, "failed to apply pulled item");
                    result.failed_book_ids.push(book_id.to_string());
                }
            }
        }

        debug!(
            server_id,
            %kind,
            applied = result.applied,
            failed = result.failed_book_ids.len(),
            "pull complete"
        );
        Ok(result)
    }

    /// Wholesale server failure: every locally-known book id is failed so
    /// the push phase skips the server entirely.
    async fn all_known_failed(&self, server_id: &str) -> Result<SyncResult, SyncError> {
        Ok(SyncResult {
            applied: 0,
            failed_book_ids: self.entity.known_book_ids(server_id).await?,
        })
    }

    /// Push phase: uploads local unsynced state to each resolved server,
    /// skipping any book id in `ignore_book_ids`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Store`] when local persistence fails. Upload
    /// failures are recorded in the report, never returned.
    #[instrument(skip(self, for_servers, ignore_book_ids), fields(kind = %self.entity.kind()))]
    pub async fn push(
        &self,
        for_servers: Option<&[String]>,
        ignore_book_ids: &[String],
    ) -> Result<SyncReport, SyncError> {
        let server_ids = self.registry.resolve_server_ids(for_servers).await?;
        let ignore: HashSet<&str> = ignore_book_ids.iter().map(String::as_str).collect();

        let mut report = SyncReport::new();
        for server_id in server_ids {
            let result = self.push_server(&server_id, &ignore).await?;
            report.insert(server_id, result);
        }
        Ok(report)
    }

    async fn push_server(
        &self,
        server_id: &str,
        ignore: &HashSet<&str>,
    ) -> Result<SyncResult, SyncError> {
        let kind = self.entity.kind();

        let book_ids: Vec<String> = self
            .entity
            .unsynced_book_ids(server_id)
            .await?
            .into_iter()
            .filter(|id| !ignore.contains(id.as_str()))
            .collect();

        if book_ids.is_empty() {
            return Ok(SyncResult::default());
        }

        let client = match self.registry.client_for(server_id).await {
            Ok(client) => client,
            Err(e) => {
                warn!(server_id, %kind, error = %e, "push skipped; no server client");
                return Ok(SyncResult {
                    applied: 0,
                    failed_book_ids: book_ids,
                });
            }
        };

        let mut result = SyncResult::default();
        for book_id in book_ids {
            match self.entity.push_book(&client, server_id, &book_id).await {
                Ok(()) => result.applied += 1,
                Err(e) => {
                    warn!(server_id, %kind, book_id, error = %e, "failed to push local state");
                    result.failed_book_ids.push(book_id);
                }
            }
        }

        debug!(
            server_id,
            %kind,
            applied = result.applied,
            failed = result.failed_book_ids.len(),
            "push complete"
        );
        Ok(result)
    }

    /// Full cycle: pull, then push with the pull's failed ids excluded.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Store`] when local persistence fails, or
    /// [`SyncError::Partial`] when the cycle completed but some books failed;
    /// the partial error carries the merged report.
    #[instrument(skip(self, for_servers), fields(kind = %self.entity.kind()))]
    pub async fn sync(&self, for_servers: Option<&[String]>) -> Result<SyncReport, SyncError> {
        let pull_report = self.pull(for_servers).await?;

        let exclude: Vec<String> = pull_report
            .values()
            .flat_map(|result| result.failed_book_ids.iter().cloned())
            .collect();

        let push_report = self.push(for_servers, &exclude).await?;

        let mut report = pull_report;
        for (server_id, result) in push_report {
            report.entry(server_id).or_default().merge(result);
        }

        let failed = distinct_failed(&report);
        if failed == 0 {
            Ok(report)
        } else {
            Err(SyncError::Partial { failed, report })
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    // End-to-end reconciliation against mock servers lives in
    // tests/sync_integration.rs; these pin the report arithmetic.

    use super::*;

    fn result(applied: usize, failed: &[&str]) -> SyncResult {
        SyncResult {
            applied,
            failed_book_ids: failed.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn test_merge_sums_applied_and_dedups_failed() {
        let mut merged = result(2, &["b1", "b2"]);
        merged.merge(result(3, &["b2", "b3"]));

        assert_eq!(merged.applied, 5);
        assert_eq!(merged.failed_book_ids, vec!["b1", "b2", "b3"]);
    }

    #[test]
    fn test_distinct_failed_counts_across_servers() {
        let mut report = SyncReport::new();
        report.insert("s1".to_string(), result(1, &["b1", "b2"]));
        report.insert("s2".to_string(), result(0, &["b2"]));

        assert_eq!(distinct_failed(&report), 2);
    }

    #[test]
    fn test_partial_error_reports_count_only() {
        let mut report = SyncReport::new();
        report.insert("s1".to_string(), result(0, &["b1"]));

        let error = SyncError::Partial { failed: 1, report };
        assert_eq!(error.to_string(), "sync completed with 1 failed book(s)");
    }
}
