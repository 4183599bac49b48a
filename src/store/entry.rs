//! Queue entry types and status definitions.

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use tracing::warn;

use super::metadata::EntryMetadata;

/// Status of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting to be picked by the scheduler.
    Pending,
    /// Currently being downloaded.
    Downloading,
    /// Successfully downloaded and materialized.
    Completed,
    /// Failed; retained with a reason until retried or dismissed.
    Failed,
}

impl QueueStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "downloading" => Ok(Self::Downloading),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid queue status: {s}")),
        }
    }
}

/// One requested download, as stored in the `download_queue` table.
///
/// The `(book_id, server_id)` pair is the natural key: at most one
/// non-completed entry exists per pair, enforced at enqueue time.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// Queue id assigned by the store on insert.
    pub id: i64,
    /// Content identifier on the origin server.
    pub book_id: String,
    /// Origin server identifier.
    pub server_id: String,
    /// Current lifecycle status.
    pub status: QueueStatus,
    /// Absolute URL the executor downloads from.
    pub download_url: String,
    /// Destination filename (without extension).
    pub filename: String,
    /// Destination file extension.
    pub extension: String,
    /// Denormalized display metadata, decoded at the store boundary.
    pub metadata: Option<EntryMetadata>,
    /// Last failure reason, present only for failed entries.
    pub failure_reason: Option<String>,
    /// Insert timestamp; FIFO ordering key for the scheduler.
    pub created_at: String,
    /// Last update timestamp.
    pub updated_at: String,
}

impl fmt::Display for QueueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QueueEntry {{ id: {}, book: {}@{}, status: {} }}",
            self.id, self.book_id, self.server_id, self.status
        )
    }
}

/// Raw database row; converted to [`QueueEntry`] at the store boundary.
#[derive(Debug, FromRow)]
pub(crate) struct QueueRow {
    pub id: i64,
    pub book_id: String,
    pub server_id: String,
    pub status: String,
    pub download_url: String,
    pub filename: String,
    pub extension: String,
    pub metadata: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<QueueRow> for QueueEntry {
    fn from(row: QueueRow) -> Self {
        let metadata = row.metadata.as_deref().and_then(|json| {
            let decoded = EntryMetadata::decode(json);
            if decoded.is_none() {
                warn!(queue_id = row.id, "discarding undecodable queue entry metadata");
            }
            decoded
        });

        Self {
            id: row.id,
            book_id: row.book_id,
            server_id: row.server_id,
            // A row with an unknown status string is treated as pending so it
            // can re-enter scheduling rather than being stranded.
            status: row.status.parse().unwrap_or(QueueStatus::Pending),
            download_url: row.download_url,
            filename: row.filename,
            extension: row.extension,
            metadata,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::metadata::MetadataV1;

    fn test_row(status: &str, metadata: Option<String>) -> QueueRow {
        QueueRow {
            id: 7,
            book_id: "b1".to_string(),
            server_id: "s1".to_string(),
            status: status.to_string(),
            download_url: "https://example.com/api/v1/books/b1/file".to_string(),
            filename: "b1".to_string(),
            extension: "cbz".to_string(),
            metadata,
            failure_reason: None,
            created_at: "2026-01-01 00:00:00".to_string(),
            updated_at: "2026-01-01 00:00:00".to_string(),
        }
    }

    #[test]
    fn test_queue_status_round_trip() {
        for status in [
            QueueStatus::Pending,
            QueueStatus::Downloading,
            QueueStatus::Completed,
            QueueStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<QueueStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_queue_status_from_str_invalid() {
        let result = "unknown".parse::<QueueStatus>();
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("invalid queue status"));
    }

    #[test]
    fn test_row_conversion_parses_status() {
        let entry = QueueEntry::from(test_row("downloading", None));
        assert_eq!(entry.status, QueueStatus::Downloading);
        assert!(entry.metadata.is_none());
    }

    #[test]
    fn test_row_conversion_unknown_status_falls_back_to_pending() {
        let entry = QueueEntry::from(test_row("garbage", None));
        assert_eq!(entry.status, QueueStatus::Pending);
    }

    #[test]
    fn test_row_conversion_decodes_metadata() {
        let metadata = EntryMetadata::V1(MetadataV1 {
            book_name: Some("Saga #1".to_string()),
            ..Default::default()
        });
        let entry = QueueEntry::from(test_row("pending", metadata.encode()));
        assert_eq!(
            entry.metadata.unwrap().v1().book_name.as_deref(),
            Some("Saga #1")
        );
    }

    #[test]
    fn test_row_conversion_degrades_bad_metadata_to_none() {
        let entry = QueueEntry::from(test_row("pending", Some("{{nope".to_string())));
        assert!(entry.metadata.is_none());
    }

    #[test]
    fn test_queue_entry_display() {
        let entry = QueueEntry::from(test_row("pending", None));
        let display = entry.to_string();
        assert!(display.contains("7"));
        assert!(display.contains("b1@s1"));
        assert!(display.contains("pending"));
    }
}
