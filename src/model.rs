//! Data models for the ingestion pipeline.
//!
//! A [`RawRow`] is read from an archive's content table, turned into exactly
//! one [`Record`] by the transformer, and lives until the batch holding it is
//! flushed to the search engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One row of the content table, as read from an archive database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    pub at_uri: String,
    pub did: String,
    pub raw_post: String,
    pub inferences: String,
    pub source_filename: String,
}

/// A create/update event ready for the content index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRecord {
    pub at_uri: String,
    pub author_did: String,
    pub content: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_root_post: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_parent_post: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quote_post: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub embeddings: BTreeMap<String, Vec<f32>>,
    pub indexed_at: String,
}

/// Marker document recording that a post was deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TombstoneRecord {
    pub at_uri: String,
    pub author_did: String,
    pub deleted_at: String,
    pub indexed_at: String,
}

/// Output of the transformer: exactly one per raw row.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Content(ContentRecord),
    Tombstone(TombstoneRecord),
}

impl Record {
    /// Identifier shared by the content document and its tombstone.
    #[must_use]
    pub fn at_uri(&self) -> &str {
        match self {
            Self::Content(c) => &c.at_uri,
            Self::Tombstone(t) => &t.at_uri,
        }
    }

    #[must_use]
    pub const fn is_tombstone(&self) -> bool {
        matches!(self, Self::Tombstone(_))
    }
}

/// Terminal outcome recorded for an archive file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Processed,
    Failed,
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Processed => write!(f, "processed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One entry of the persisted processing state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStateEntry {
    pub filename: String,
    pub status: FileStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Format a timestamp the way every document field is written: RFC 3339,
/// UTC, whole seconds.
#[must_use]
pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Format an event time with whatever sub-second precision it carries.
/// Whole seconds print without a fraction.
#[must_use]
pub fn format_event_time(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true)
}
