//! Consumer side of the row channel.
//!
//! The dispatcher transforms each row and routes it to one of two batches:
//! content upserts, or tombstones paired with deletes of the same ids. Each
//! batch flushes when it reaches the batch size. A failed flush is logged and
//! its records are dropped; the loop keeps going.
//!
//! ```text
//! Running ──(channel closed | shutdown)──▶ Draining ──(final flush)──▶ Done
//! ```
//!
//! The two batch kinds flush independently, so an upsert and a delete for
//! the same id can reach the index in either order.

use crate::indexer::Indexer;
use crate::model::{ContentRecord, RawRow, Record, TombstoneRecord};
use crate::shutdown::Shutdown;
use crate::transform::RowTransformer;
use crossbeam_channel::{Receiver, select};
use tracing::{debug, error, info};

pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Lifecycle of a dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Running,
    Draining,
    Done,
}

/// Counters for one dispatcher run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub rows_received: usize,
    pub rows_dropped: usize,
    pub upserts_flushed: usize,
    pub tombstones_flushed: usize,
    pub deletes_flushed: usize,
    pub flush_failures: usize,
}

pub struct Dispatcher {
    indexer: Indexer,
    transformer: RowTransformer,
    batch_size: usize,
    upserts: Vec<ContentRecord>,
    tombstones: Vec<TombstoneRecord>,
    delete_ids: Vec<String>,
    state: DispatcherState,
    stats: DispatchStats,
}

impl Dispatcher {
    #[must_use]
    pub fn new(indexer: Indexer, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            indexer,
            transformer: RowTransformer::new(),
            batch_size,
            upserts: Vec::with_capacity(batch_size),
            tombstones: Vec::with_capacity(batch_size),
            delete_ids: Vec::with_capacity(batch_size),
            state: DispatcherState::Running,
            stats: DispatchStats::default(),
        }
    }

    #[must_use]
    pub const fn state(&self) -> DispatcherState {
        self.state
    }

    #[must_use]
    pub const fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Consume rows until the channel closes or shutdown is requested, then
    /// flush whatever is pending.
    pub fn run(&mut self, rows: &Receiver<RawRow>, shutdown: &Shutdown) -> DispatchStats {
        info!(batch_size = self.batch_size, dry_run = self.indexer.is_dry_run(), "Dispatcher started");

        while self.state == DispatcherState::Running {
            select! {
                recv(rows) -> msg => match msg {
                    Ok(row) => self.accept(row),
                    Err(_) => {
                        info!("Row channel closed, draining");
                        self.state = DispatcherState::Draining;
                    }
                },
                recv(shutdown.signal()) -> _ => {
                    info!("Shutdown requested, draining");
                    self.state = DispatcherState::Draining;
                }
            }
        }

        self.drain();

        let stats = self.stats;
        info!(
            rows = stats.rows_received,
            dropped = stats.rows_dropped,
            upserts = stats.upserts_flushed,
            tombstones = stats.tombstones_flushed,
            deletes = stats.deletes_flushed,
            failures = stats.flush_failures,
            "Dispatcher finished"
        );
        stats
    }

    /// Route one row, flushing its batch if that fills it.
    pub fn accept(&mut self, row: RawRow) {
        self.stats.rows_received += 1;
        if row.at_uri.is_empty() {
            self.stats.rows_dropped += 1;
            debug!(file = %row.source_filename, "Dropping row without identifier");
            return;
        }

        match self.transformer.transform(&row) {
            Record::Content(record) => {
                self.upserts.push(record);
                if self.upserts.len() >= self.batch_size {
                    self.flush_upserts();
                }
            }
            Record::Tombstone(record) => {
                self.delete_ids.push(record.at_uri.clone());
                self.tombstones.push(record);
                if self.tombstones.len() >= self.batch_size {
                    self.flush_deletions();
                }
            }
        }
    }

    /// Flush both batches unconditionally and finish.
    pub fn drain(&mut self) {
        if self.state == DispatcherState::Done {
            return;
        }
        self.state = DispatcherState::Draining;
        debug!(
            upserts = self.upserts.len(),
            tombstones = self.tombstones.len(),
            "Flushing pending batches"
        );
        self.flush_upserts();
        self.flush_deletions();
        self.state = DispatcherState::Done;
    }

    fn flush_upserts(&mut self) {
        let batch = std::mem::take(&mut self.upserts);
        match self.indexer.bulk_upsert(&batch) {
            Ok(sent) => self.stats.upserts_flushed += sent,
            Err(e) => {
                self.stats.flush_failures += 1;
                error!(count = batch.len(), error = %e, "Failed to flush upserts, dropping batch");
            }
        }
    }

    /// Tombstones first, then deletes. Each half is attempted even if the
    /// other fails.
    fn flush_deletions(&mut self) {
        let tombstones = std::mem::take(&mut self.tombstones);
        let ids = std::mem::take(&mut self.delete_ids);

        match self.indexer.bulk_tombstone(&tombstones) {
            Ok(sent) => self.stats.tombstones_flushed += sent,
            Err(e) => {
                self.stats.flush_failures += 1;
                error!(count = tombstones.len(), error = %e, "Failed to flush tombstones, dropping batch");
            }
        }

        match self.indexer.bulk_delete(&ids) {
            Ok(sent) => self.stats.deletes_flushed += sent,
            Err(e) => {
                self.stats.flush_failures += 1;
                error!(count = ids.len(), error = %e, "Failed to flush deletes, dropping batch");
            }
        }
    }
}
