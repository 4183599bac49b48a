//! Versioned queue-entry metadata blob.
//!
//! Queue entries carry an opaque JSON payload with denormalized display
//! metadata (book/series/library names, thumbnail and TOC hints, OPDS flag).
//! The blob is decoded once at the store boundary into a versioned tagged
//! union; unversioned payloads from older clients are migrated to V1 on read.
//! Unknown fields are preserved across round-trips, never stripped.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Versioned metadata attached to a queue entry and its downloaded file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "version")]
pub enum EntryMetadata {
    /// Current metadata schema.
    #[serde(rename = "1")]
    V1(MetadataV1),
}

/// V1 metadata payload.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetadataV1 {
    /// Display name of the book.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub book_name: Option<String>,
    /// Display name of the series the book belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series_name: Option<String>,
    /// Display name of the library the book belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub library_name: Option<String>,
    /// Identifier of the series, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series_id: Option<String>,
    /// Remote thumbnail URL hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    /// Table-of-contents hint captured at enqueue time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub toc: Vec<TocEntry>,
    /// Read-progress percentage hint (0.0-1.0) captured at enqueue time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_progress_hint: Option<f64>,
    /// Whether this entry originated from an OPDS feed.
    #[serde(default)]
    pub is_opds: bool,
    /// Forward-compatible bag for fields this client version does not know.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One table-of-contents entry hint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TocEntry {
    /// Human-readable label.
    pub label: String,
    /// Page the entry points at, when the format is page-based.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<i64>,
}

impl EntryMetadata {
    /// Decodes a metadata blob, migrating unversioned legacy payloads to V1.
    ///
    /// Returns `None` for payloads that are not valid metadata at all; the
    /// store boundary degrades those to "no metadata" with a warning rather
    /// than failing the row read.
    #[must_use]
    pub fn decode(json: &str) -> Option<Self> {
        if let Ok(metadata) = serde_json::from_str::<Self>(json) {
            return Some(metadata);
        }
        // Legacy blobs predate the version discriminant.
        serde_json::from_str::<MetadataV1>(json).ok().map(Self::V1)
    }

    /// Encodes the metadata for storage.
    #[must_use]
    pub fn encode(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }

    /// Returns the current-version payload.
    #[must_use]
    pub fn v1(&self) -> &MetadataV1 {
        match self {
            Self::V1(inner) => inner,
        }
    }
}

impl From<MetadataV1> for EntryMetadata {
    fn from(inner: MetadataV1) -> Self {
        Self::V1(inner)
    }
}
