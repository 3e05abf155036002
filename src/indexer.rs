//! Bulk writes to the search engine.
//!
//! Every call builds one newline-delimited `_bulk` body:
//!
//! ```text
//! {"index":{"_index":"posts","_id":"at://..."}}
//! {"at_uri":"at://...","author_did":"did:plc:...",...}
//! {"delete":{"_index":"posts","_id":"at://..."}}
//! ```
//!
//! A call succeeds only if the transport succeeds, the response has no
//! top-level error, and no item reports an error. Deletes of documents that
//! do not exist count as success. Failures are reported as one aggregate
//! error; the ids of failed items are logged, not returned.

use crate::error::{IngexError, Result};
use crate::model::{ContentRecord, TombstoneRecord};
use crate::shutdown::Shutdown;
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const DEFAULT_CONTENT_INDEX: &str = "posts";
pub const DEFAULT_TOMBSTONE_INDEX: &str = "post_tombstones";
/// Time a bulk call may still take once shutdown is requested.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(10);

const NDJSON: &str = "application/x-ndjson";
const MAX_LOGGED_FAILURES: usize = 10;

// =============================================================================
// Transport
// =============================================================================

/// Raw HTTP outcome of a bulk call.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

impl TransportResponse {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }
}

/// Wire access to the search engine.
pub trait BulkTransport: Send + Sync {
    /// Submit one newline-delimited bulk body.
    ///
    /// # Errors
    ///
    /// Returns an error if the request could not be sent or its body read.
    fn bulk(&self, body: String) -> Result<TransportResponse>;

    /// Check that the engine answers at all.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine is unreachable or rejects the request.
    fn ping(&self) -> Result<()>;
}

/// HTTPS transport with API-key authentication.
///
/// Requests carry no timeout of their own. Each one runs on a helper thread
/// and is raced against the shutdown signal: once shutdown is requested a
/// call gets the drain grace period to finish, then it is abandoned with
/// [`IngexError::Cancelled`].
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    shutdown: Shutdown,
    drain_grace: Duration,
}

impl HttpTransport {
    /// Build a client for `url`. An empty `api_key` sends no credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is not a valid header value or the
    /// client cannot be built.
    pub fn new(url: &str, api_key: &str, skip_tls_verify: bool, shutdown: Shutdown) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if !api_key.is_empty() {
            let mut value = HeaderValue::from_str(&format!("ApiKey {api_key}"))
                .map_err(|e| IngexError::invalid_config("search.api_key", e.to_string()))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        if skip_tls_verify {
            warn!("TLS certificate verification is disabled");
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(None::<Duration>)
            .danger_accept_invalid_certs(skip_tls_verify)
            .build()?;

        let base_url = url.trim_end_matches('/').to_string();
        info!(url = %base_url, "Initialized search engine client");
        Ok(Self {
            client,
            base_url,
            shutdown,
            drain_grace: DEFAULT_DRAIN_GRACE,
        })
    }

    #[must_use]
    pub const fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    /// Send `request` and read the whole answer, unless shutdown cuts it off.
    fn execute(&self, name: &str, request: RequestBuilder) -> Result<TransportResponse> {
        let answer = self.shutdown.run_interruptible(name, self.drain_grace, move || {
            let response = request.send()?;
            let status = response.status().as_u16();
            let body = response.text()?;
            Ok::<_, reqwest::Error>(TransportResponse { status, body })
        })?;
        Ok(answer?)
    }
}

impl BulkTransport for HttpTransport {
    fn bulk(&self, body: String) -> Result<TransportResponse> {
        let request = self
            .client
            .post(format!("{}/_bulk", self.base_url))
            .header(CONTENT_TYPE, NDJSON)
            .body(body);
        self.execute("ingex-bulk", request)
    }

    fn ping(&self) -> Result<()> {
        let response = self.execute("ingex-ping", self.client.get(format!("{}/", self.base_url)))?;
        if response.is_success() {
            debug!(url = %self.base_url, "Search engine is reachable");
            Ok(())
        } else {
            Err(IngexError::with_context(
                format!("Search engine at {} answered {}", self.base_url, response.status),
                std::io::Error::other(truncate(&response.body, 200).to_string()),
            ))
        }
    }
}

// =============================================================================
// Bulk response
// =============================================================================

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    #[serde(rename = "_id", default)]
    id: Option<String>,
    #[serde(default)]
    status: u16,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<Value>,
}

impl BulkItem {
    /// A delete of a document that does not exist. A 404 that carries an
    /// error, such as a missing index, is a real failure.
    fn is_not_found(&self) -> bool {
        self.error.is_none() && self.result.as_deref() == Some("not_found")
    }

    fn failed(&self, allow_not_found: bool) -> bool {
        if allow_not_found && self.is_not_found() {
            return false;
        }
        self.error.is_some() || self.status >= 300
    }

    fn describe(&self) -> String {
        match &self.error {
            Some(Value::Object(map)) => {
                let kind = map.get("type").and_then(Value::as_str).unwrap_or("unknown");
                let reason = map.get("reason").and_then(Value::as_str).unwrap_or("no reason");
                format!("{kind}: {reason}")
            }
            Some(other) => other.to_string(),
            None => format!("status {}", self.status),
        }
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// =============================================================================
// Indexer
// =============================================================================

/// Bulk upsert, tombstone, and delete operations against two indices.
#[derive(Clone)]
pub struct Indexer {
    transport: Arc<dyn BulkTransport>,
    content_index: String,
    tombstone_index: String,
    dry_run: bool,
}

impl std::fmt::Debug for Indexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Indexer")
            .field("content_index", &self.content_index)
            .field("tombstone_index", &self.tombstone_index)
            .field("dry_run", &self.dry_run)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Action {
    Index,
    Delete,
}

impl Action {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Index => "index",
            Self::Delete => "delete",
        }
    }
}

impl Indexer {
    pub fn new(
        transport: Arc<dyn BulkTransport>,
        content_index: impl Into<String>,
        tombstone_index: impl Into<String>,
        dry_run: bool,
    ) -> Self {
        Self {
            transport,
            content_index: content_index.into(),
            tombstone_index: tombstone_index.into(),
            dry_run,
        }
    }

    #[must_use]
    pub const fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    #[must_use]
    pub fn content_index(&self) -> &str {
        &self.content_index
    }

    #[must_use]
    pub fn tombstone_index(&self) -> &str {
        &self.tombstone_index
    }

    /// Check that the search engine is reachable. Always succeeds in
    /// dry-run mode.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the engine cannot be reached.
    pub fn ping(&self) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }
        self.transport.ping()
    }

    /// Index content documents, keyed by their identifier. Returns the
    /// number of documents sent.
    ///
    /// # Errors
    ///
    /// Returns an error if every record lacks an identifier, the transport
    /// fails, or the engine reports any error.
    pub fn bulk_upsert(&self, records: &[ContentRecord]) -> Result<usize> {
        let docs = records.iter().map(|r| (r.at_uri.as_str(), r));
        self.bulk_index(&self.content_index, records.len(), docs)
    }

    /// Index tombstones under the same identifier as the content they
    /// replace.
    ///
    /// # Errors
    ///
    /// Same as [`Indexer::bulk_upsert`].
    pub fn bulk_tombstone(&self, records: &[TombstoneRecord]) -> Result<usize> {
        let docs = records.iter().map(|r| (r.at_uri.as_str(), r));
        self.bulk_index(&self.tombstone_index, records.len(), docs)
    }

    /// Remove documents from the content index. Missing documents are not
    /// an error.
    ///
    /// # Errors
    ///
    /// Returns an error if every id is empty, the transport fails, or the
    /// engine reports an error other than "not found".
    pub fn bulk_delete(&self, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        if self.dry_run {
            info!(index = %self.content_index, count = ids.len(), "[dry-run] Would delete documents");
            return Ok(ids.len());
        }

        let mut body = String::new();
        let mut sent = 0;
        for id in ids {
            if id.is_empty() {
                warn!(index = %self.content_index, "Skipping delete without identifier");
                continue;
            }
            push_action(&mut body, Action::Delete, &self.content_index, id)?;
            sent += 1;
        }
        self.submit(&self.content_index, Action::Delete, ids.len(), sent, body)
    }

    fn bulk_index<'a, T, I>(&self, index: &str, total: usize, docs: I) -> Result<usize>
    where
        T: Serialize + 'a,
        I: Iterator<Item = (&'a str, &'a T)>,
    {
        if total == 0 {
            return Ok(0);
        }
        if self.dry_run {
            info!(index, count = total, "[dry-run] Would index documents");
            return Ok(total);
        }

        let mut body = String::new();
        let mut sent = 0;
        for (id, doc) in docs {
            if id.is_empty() {
                warn!(index, "Skipping document without identifier");
                continue;
            }
            push_action(&mut body, Action::Index, index, id)?;
            body.push_str(&serde_json::to_string(doc)?);
            body.push('\n');
            sent += 1;
        }
        self.submit(index, Action::Index, total, sent, body)
    }

    fn submit(&self, index: &str, action: Action, total: usize, sent: usize, body: String) -> Result<usize> {
        if sent == 0 {
            return Err(IngexError::EmptyBatch {
                index: index.to_string(),
                skipped: total,
            });
        }

        debug!(index, action = action.as_str(), count = sent, bytes = body.len(), "Sending bulk request");
        let response = self.transport.bulk(body)?;
        check_response(index, action, &response)?;

        info!(index, action = action.as_str(), count = sent, "Bulk request succeeded");
        Ok(sent)
    }
}

fn push_action(body: &mut String, action: Action, index: &str, id: &str) -> Result<()> {
    let line = json!({ action.as_str(): { "_index": index, "_id": id } });
    body.push_str(&serde_json::to_string(&line)?);
    body.push('\n');
    Ok(())
}

fn check_response(index: &str, action: Action, response: &TransportResponse) -> Result<()> {
    if !response.is_success() {
        return Err(IngexError::bulk_rejected(
            index,
            format!("HTTP {}: {}", response.status, truncate(&response.body, 500)),
        ));
    }

    let parsed: BulkResponse = serde_json::from_str(&response.body)
        .map_err(|e| IngexError::bulk_rejected(index, format!("unreadable response: {e}")))?;

    if let Some(err) = parsed.error {
        return Err(IngexError::bulk_rejected(index, err.to_string()));
    }

    let allow_not_found = action == Action::Delete;
    let failures: Vec<&BulkItem> = parsed
        .items
        .iter()
        .filter_map(|item| item.get(action.as_str()))
        .filter(|item| item.failed(allow_not_found))
        .collect();

    if failures.is_empty() {
        if parsed.errors && !allow_not_found {
            return Err(IngexError::bulk_rejected(index, "response flagged errors without item detail"));
        }
        return Ok(());
    }

    for item in failures.iter().take(MAX_LOGGED_FAILURES) {
        error!(
            index,
            id = item.id.as_deref().unwrap_or("<unknown>"),
            error = %item.describe(),
            "Bulk item failed"
        );
    }

    let mut reason = format!("{} of {} items failed", failures.len(), parsed.items.len());
    if let Some(first) = failures.first() {
        let _ = write!(reason, "; first: {}", first.describe());
    }
    Err(IngexError::bulk_rejected(index, reason))
}
