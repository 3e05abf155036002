//! Wiring for one ingestion run.
//!
//! One spooler thread produces rows; the calling thread runs the dispatcher
//! until the row channel closes or shutdown is requested, then joins the
//! spooler.

use crate::config::{Config, SourceLocation};
use crate::dispatcher::{DispatchStats, Dispatcher};
use crate::error::Result;
use crate::indexer::{BulkTransport, HttpTransport, Indexer};
use crate::shutdown::Shutdown;
use crate::spooler::{ArchiveSource, LocalSource, S3Source, SpoolStats, Spooler, SpoolerOptions};
use crate::state::StateStore;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Combined counters for a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub passes: usize,
    pub files_processed: usize,
    pub files_failed: usize,
    pub rows_read: usize,
    pub rows_skipped: usize,
    pub rows_dropped: usize,
    pub upserts: usize,
    pub tombstones: usize,
    pub deletes: usize,
    pub flush_failures: usize,
    pub duration_ms: u128,
}

impl RunSummary {
    fn from_parts(spool: SpoolStats, dispatch: DispatchStats, elapsed: Duration) -> Self {
        Self {
            passes: spool.passes,
            files_processed: spool.files_processed,
            files_failed: spool.files_failed,
            rows_read: spool.rows_sent,
            rows_skipped: spool.rows_skipped,
            rows_dropped: dispatch.rows_dropped,
            upserts: dispatch.upserts_flushed,
            tombstones: dispatch.tombstones_flushed,
            deletes: dispatch.deletes_flushed,
            flush_failures: dispatch.flush_failures,
            duration_ms: elapsed.as_millis(),
        }
    }
}

/// Source for the configured location. Object store calls stop when
/// `shutdown` is requested.
///
/// # Errors
///
/// Returns an error if no single location is configured or the object
/// store client cannot be created.
pub fn build_source(config: &Config, shutdown: &Shutdown) -> Result<Box<dyn ArchiveSource>> {
    Ok(match config.source.location()? {
        SourceLocation::Local(dir) => Box::new(LocalSource::new(dir)),
        SourceLocation::S3 {
            bucket,
            prefix,
            region,
        } => Box::new(S3Source::connect(bucket, prefix, region, shutdown.clone())?),
    })
}

/// HTTP transport for the configured search engine, bounded by `shutdown`
/// plus the drain grace period.
///
/// # Errors
///
/// Returns an error if the client cannot be built.
pub fn build_transport(config: &Config, shutdown: &Shutdown) -> Result<Arc<dyn BulkTransport>> {
    let transport = HttpTransport::new(
        &config.search.url,
        &config.search.api_key,
        config.search.skip_tls_verify,
        shutdown.clone(),
    )?
    .with_drain_grace(config.drain_grace());
    Ok(Arc::new(transport))
}

#[must_use]
pub fn build_indexer(config: &Config, transport: Arc<dyn BulkTransport>) -> Indexer {
    Indexer::new(
        transport,
        config.search.content_index.clone(),
        config.search.tombstone_index.clone(),
        config.run.dry_run,
    )
}

#[must_use]
pub fn spooler_options(config: &Config) -> SpoolerOptions {
    SpoolerOptions {
        mode: config.spool.mode,
        interval: config.interval(),
        suffix: config.source.suffix.clone(),
        table: config.spool.table.clone(),
        channel_capacity: config.spool.channel_capacity,
    }
}

/// Run the pipeline against explicit collaborators.
///
/// # Errors
///
/// Returns an error if the spooler cannot be started or its thread panics.
/// Per-file and per-batch failures are counted, not returned.
pub fn run_with(
    config: &Config,
    source: Box<dyn ArchiveSource>,
    state: Arc<StateStore>,
    indexer: Indexer,
    shutdown: &Shutdown,
) -> Result<RunSummary> {
    let started = Instant::now();
    info!(
        mode = %config.spool.mode,
        dry_run = config.run.dry_run,
        state_file = %state.path().display(),
        "Starting ingestion run"
    );

    let mut handle = Spooler::new(source, state, spooler_options(config), shutdown.clone()).start()?;
    let rows = handle.rows();

    let mut dispatcher = Dispatcher::new(indexer, config.search.batch_size);
    let dispatch = dispatcher.run(&rows, shutdown);

    let spool = handle.join()?;
    let summary = RunSummary::from_parts(spool, dispatch, started.elapsed());
    info!(
        files_processed = summary.files_processed,
        files_failed = summary.files_failed,
        rows = summary.rows_read,
        duration_ms = summary.duration_ms,
        "Ingestion run finished"
    );
    Ok(summary)
}

/// Run the pipeline as configured: state file, source, and HTTP transport.
///
/// # Errors
///
/// Returns an error if the state file is unreadable, the source or
/// transport cannot be built, or the search engine is unreachable outside
/// dry-run mode.
pub fn run(config: &Config, shutdown: &Shutdown) -> Result<RunSummary> {
    let state = Arc::new(StateStore::open(&config.spool.state_file)?);
    let transport = build_transport(config, shutdown)?;
    let indexer = build_indexer(config, transport);
    indexer.ping()?;
    let source = build_source(config, shutdown)?;
    run_with(config, source, state, indexer, shutdown)
}
