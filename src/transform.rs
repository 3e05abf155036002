//! Row transformation: raw event + inference JSON into index records.
//!
//! Transformation never fails. A malformed payload, a missing field, or a
//! field of the wrong type degrades to an absent value and the row still
//! produces exactly one [`Record`].
//!
//! Payload shape:
//!
//! ```text
//! raw_post:
//!   message.time_us                 event time, microseconds
//!   message.commit.operation        "create" | "update" | "delete" | ...
//!   message.commit.record.text
//!   message.commit.record.createdAt
//!   hydrated_metadata.reply_post.uri    thread root
//!   hydrated_metadata.parent_post.uri   thread parent
//!   hydrated_metadata.quote_post.uri    quoted post
//!
//! inferences:
//!   text_embeddings.<model-name>    base64 of little-endian f32 values
//! ```

use crate::model::{
    ContentRecord, RawRow, Record, TombstoneRecord, format_event_time, format_timestamp,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

const DELETE_OPERATION: &str = "delete";

// =============================================================================
// Payload structures
// =============================================================================

/// Deserialize a field, turning a type mismatch into `None` instead of an
/// error for the whole document.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(T::deserialize(value).ok())
}

/// Event times arrive as JSON numbers, sometimes in float form.
#[allow(clippy::cast_possible_truncation)]
fn lenient_micros<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(value
        .as_i64()
        .or_else(|| value.as_f64().filter(|f| f.is_finite()).map(|f| f as i64)))
}

#[derive(Debug, Default, Deserialize)]
struct EventEnvelope {
    #[serde(default, deserialize_with = "lenient")]
    message: Option<EventMessage>,
    #[serde(default, deserialize_with = "lenient")]
    hydrated_metadata: Option<HydratedMetadata>,
}

#[derive(Debug, Default, Deserialize)]
struct EventMessage {
    #[serde(default, deserialize_with = "lenient_micros")]
    time_us: Option<i64>,
    #[serde(default, deserialize_with = "lenient")]
    commit: Option<Commit>,
}

#[derive(Debug, Default, Deserialize)]
struct Commit {
    #[serde(default, deserialize_with = "lenient")]
    operation: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    record: Option<PostRecord>,
}

#[derive(Debug, Default, Deserialize)]
struct PostRecord {
    #[serde(default, deserialize_with = "lenient")]
    text: Option<String>,
    #[serde(default, rename = "createdAt", deserialize_with = "lenient")]
    created_at: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct HydratedMetadata {
    #[serde(default, deserialize_with = "lenient")]
    reply_post: Option<PostRef>,
    #[serde(default, deserialize_with = "lenient")]
    parent_post: Option<PostRef>,
    #[serde(default, deserialize_with = "lenient")]
    quote_post: Option<PostRef>,
}

#[derive(Debug, Default, Deserialize)]
struct PostRef {
    #[serde(default, deserialize_with = "lenient")]
    uri: Option<String>,
}

impl PostRef {
    fn uri(reference: Option<&Self>) -> Option<String> {
        reference
            .and_then(|r| r.uri.as_deref())
            .filter(|uri| !uri.is_empty())
            .map(str::to_string)
    }
}

#[derive(Debug, Default, Deserialize)]
struct Inferences {
    #[serde(default, deserialize_with = "lenient")]
    text_embeddings: Option<BTreeMap<String, Value>>,
}

impl EventEnvelope {
    fn parse(raw: &str, at_uri: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_else(|e| {
            debug!(at_uri, error = %e, "Unparseable raw_post, treating fields as absent");
            Self::default()
        })
    }

    fn commit(&self) -> Option<&Commit> {
        self.message.as_ref().and_then(|m| m.commit.as_ref())
    }

    fn is_delete(&self) -> bool {
        self.commit()
            .and_then(|c| c.operation.as_deref())
            .is_some_and(|op| op == DELETE_OPERATION)
    }

    fn time_us(&self) -> Option<i64> {
        self.message.as_ref().and_then(|m| m.time_us)
    }
}

// =============================================================================
// Transformer
// =============================================================================

/// Converts raw rows into content or tombstone records.
#[derive(Debug, Clone, Copy, Default)]
pub struct RowTransformer;

impl RowTransformer {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Transform a row using the current wall clock for index time.
    #[must_use]
    pub fn transform(&self, row: &RawRow) -> Record {
        self.transform_at(row, Utc::now())
    }

    /// Transform a row with an explicit "now".
    #[must_use]
    pub fn transform_at(&self, row: &RawRow, now: DateTime<Utc>) -> Record {
        let envelope = EventEnvelope::parse(&row.raw_post, &row.at_uri);
        let indexed_at = format_timestamp(now);

        if envelope.is_delete() {
            let deleted_at = envelope
                .time_us()
                .filter(|&us| us > 0)
                .and_then(DateTime::from_timestamp_micros)
                .unwrap_or(now);

            return Record::Tombstone(TombstoneRecord {
                at_uri: row.at_uri.clone(),
                author_did: row.did.clone(),
                deleted_at: format_event_time(deleted_at),
                indexed_at,
            });
        }

        let record = envelope.commit().and_then(|c| c.record.as_ref());
        let metadata = envelope.hydrated_metadata.as_ref();

        Record::Content(ContentRecord {
            at_uri: row.at_uri.clone(),
            author_did: row.did.clone(),
            content: record.and_then(|r| r.text.clone()).unwrap_or_default(),
            created_at: record.and_then(|r| r.created_at.clone()).unwrap_or_default(),
            thread_root_post: PostRef::uri(metadata.and_then(|m| m.reply_post.as_ref())),
            thread_parent_post: PostRef::uri(metadata.and_then(|m| m.parent_post.as_ref())),
            quote_post: PostRef::uri(metadata.and_then(|m| m.quote_post.as_ref())),
            embeddings: decode_embeddings(&row.inferences, &row.at_uri),
            indexed_at,
        })
    }
}

/// Decode every named embedding in an inference payload. Entries that are
/// not strings or not valid base64 are skipped individually.
fn decode_embeddings(raw: &str, at_uri: &str) -> BTreeMap<String, Vec<f32>> {
    let inferences: Inferences = match serde_json::from_str(raw) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!(at_uri, error = %e, "Unparseable inferences, no embeddings");
            return BTreeMap::new();
        }
    };

    let mut out = BTreeMap::new();
    for (name, value) in inferences.text_embeddings.unwrap_or_default() {
        let Some(encoded) = value.as_str() else {
            debug!(at_uri, embedding = %name, "Embedding is not a string, skipping");
            continue;
        };
        match decode_embedding(encoded) {
            Ok(vector) => {
                out.insert(embedding_field_name(&name), vector);
            }
            Err(e) => {
                debug!(at_uri, embedding = %name, error = %e, "Failed to decode embedding");
            }
        }
    }
    out
}

/// Field-safe embedding name: `all-MiniLM-L12-v2` becomes `all_MiniLM_L12_v2`.
#[must_use]
pub fn embedding_field_name(model: &str) -> String {
    model.replace('-', "_")
}

/// Decode base64 text into little-endian `f32` components. Trailing bytes
/// that do not fill a whole component are ignored.
///
/// # Errors
///
/// Returns the base64 error if the input is not valid standard base64.
pub fn decode_embedding(encoded: &str) -> Result<Vec<f32>, base64::DecodeError> {
    let bytes = STANDARD.decode(encoded)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}
