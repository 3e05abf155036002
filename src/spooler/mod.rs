//! Archive discovery and row streaming.
//!
//! A [`Spooler`] owns one background thread that lists unseen archives from
//! an [`ArchiveSource`], extracts each one into a private scratch directory,
//! and streams the rows of its content table into a bounded channel. A full
//! channel blocks the thread, which bounds memory regardless of archive size.
//!
//! Every file ends in exactly one of three ways:
//!
//! - all rows were enqueued: marked processed, then the source may clean up
//! - any step failed: marked failed with the error text, never retried
//! - shutdown was requested: left unmarked so a later run picks it up
//!
//! Sources differ only in how they list and fetch; the loop is shared.

mod local;
mod s3;

pub use local::LocalSource;
pub use s3::S3Source;

use crate::archive;
use crate::config::SpoolMode;
use crate::error::{IngexError, Result};
use crate::logging::OperationGuard;
use crate::model::RawRow;
use crate::reader::{self, ReadStats};
use crate::shutdown::Shutdown;
use crate::state::StateStore;
use crossbeam_channel::{Receiver, Sender, select};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info, warn};

/// One archive offered by a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Source-specific locator: a filesystem path or an object key.
    pub key: String,
    /// Base name; the identity used by the state store.
    pub filename: String,
}

impl Candidate {
    pub fn new(key: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            filename: filename.into(),
        }
    }
}

/// Listing and fetch mechanics for one kind of archive location.
pub trait ArchiveSource: Send {
    /// Human-readable location for logs.
    fn describe(&self) -> String;

    /// Every archive currently present, in any order.
    ///
    /// # Errors
    ///
    /// Returns an error if the location cannot be listed.
    fn list(&self) -> Result<Vec<Candidate>>;

    /// Make the archive available as a local file. Downloads land in
    /// `scratch`, which is removed once the file is finished.
    ///
    /// # Errors
    ///
    /// Returns an error if the archive cannot be retrieved.
    fn fetch(&self, candidate: &Candidate, scratch: &Path) -> Result<PathBuf>;

    /// Cleanup after a file was marked processed.
    ///
    /// # Errors
    ///
    /// Returns an error if cleanup fails. The file stays processed.
    fn finish(&self, candidate: &Candidate) -> Result<()>;
}

/// Knobs shared by every source.
#[derive(Debug, Clone)]
pub struct SpoolerOptions {
    pub mode: SpoolMode,
    pub interval: Duration,
    pub suffix: String,
    pub table: String,
    pub channel_capacity: usize,
}

impl Default for SpoolerOptions {
    fn default() -> Self {
        Self {
            mode: SpoolMode::Once,
            interval: Duration::from_secs(60),
            suffix: ".db.zip".to_string(),
            table: reader::DEFAULT_TABLE.to_string(),
            channel_capacity: 1000,
        }
    }
}

/// Counters reported when the spooler thread exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpoolStats {
    pub passes: usize,
    pub files_processed: usize,
    pub files_failed: usize,
    pub rows_sent: usize,
    pub rows_skipped: usize,
}

/// Unseen archives from `source`, filtered by suffix and sorted by filename.
///
/// # Errors
///
/// Returns an error if the source cannot be listed.
pub fn discover(source: &dyn ArchiveSource, state: &StateStore, suffix: &str) -> Result<Vec<Candidate>> {
    let mut candidates: Vec<Candidate> = source
        .list()?
        .into_iter()
        .filter(|c| c.filename.ends_with(suffix))
        .filter(|c| !state.is_known(&c.filename))
        .collect();

    candidates.sort_by(|a, b| a.filename.cmp(&b.filename).then_with(|| a.key.cmp(&b.key)));
    // State is keyed by base name, so two keys sharing one cannot both run.
    candidates.dedup_by(|b, a| a.filename == b.filename);
    Ok(candidates)
}

/// A configured but not yet started spooler.
pub struct Spooler {
    source: Box<dyn ArchiveSource>,
    state: Arc<StateStore>,
    options: SpoolerOptions,
    shutdown: Shutdown,
}

impl Spooler {
    pub fn new(
        source: Box<dyn ArchiveSource>,
        state: Arc<StateStore>,
        options: SpoolerOptions,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            source,
            state,
            options,
            shutdown,
        }
    }

    /// Launch the discovery loop on its own thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn start(self) -> Result<SpoolerHandle> {
        let (tx, rx) = crossbeam_channel::bounded(self.options.channel_capacity.max(1));
        let shutdown = self.shutdown.clone();

        info!(
            source = %self.source.describe(),
            mode = %self.options.mode,
            capacity = self.options.channel_capacity,
            "Starting spooler"
        );

        let worker = Worker {
            source: self.source,
            state: self.state,
            options: self.options,
            shutdown: self.shutdown,
            tx,
        };
        let thread = std::thread::Builder::new()
            .name("ingex-spooler".to_string())
            .spawn(move || worker.run())
            .map_err(|e| IngexError::with_context("Failed to spawn spooler thread", e))?;

        Ok(SpoolerHandle {
            rows: rx,
            shutdown,
            thread: Some(thread),
        })
    }
}

/// Running spooler: the row channel plus lifecycle control.
pub struct SpoolerHandle {
    rows: Receiver<RawRow>,
    shutdown: Shutdown,
    thread: Option<JoinHandle<SpoolStats>>,
}

impl SpoolerHandle {
    /// Receive side of the row channel. It disconnects when the spooler
    /// finishes a single pass or stops.
    #[must_use]
    pub fn rows(&self) -> Receiver<RawRow> {
        self.rows.clone()
    }

    /// Request shutdown of the shared signal.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Wait for the spooler thread to exit.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread panicked or was already joined.
    pub fn join(&mut self) -> Result<SpoolStats> {
        let thread = self
            .thread
            .take()
            .ok_or_else(|| IngexError::Other(anyhow::anyhow!("Spooler already joined")))?;
        thread
            .join()
            .map_err(|_| IngexError::Other(anyhow::anyhow!("Spooler thread panicked")))
    }
}

struct Worker {
    source: Box<dyn ArchiveSource>,
    state: Arc<StateStore>,
    options: SpoolerOptions,
    shutdown: Shutdown,
    tx: Sender<RawRow>,
}

impl Worker {
    fn run(self) -> SpoolStats {
        let mut stats = SpoolStats::default();

        'passes: loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            stats.passes += 1;
            match discover(self.source.as_ref(), &self.state, &self.options.suffix) {
                Ok(candidates) => {
                    info!(pass = stats.passes, files = candidates.len(), "Discovered unprocessed archives");
                    for candidate in &candidates {
                        if self.shutdown.is_cancelled() {
                            break 'passes;
                        }
                        if !self.handle_file(candidate, &mut stats) {
                            break 'passes;
                        }
                    }
                }
                Err(e) if e.is_cancelled() => break,
                Err(e) => error!(source = %self.source.describe(), error = %e, "Failed to list archives"),
            }

            if self.options.mode == SpoolMode::Once {
                break;
            }
            if self.shutdown.wait_timeout(self.options.interval) {
                break;
            }
        }

        info!(
            passes = stats.passes,
            processed = stats.files_processed,
            failed = stats.files_failed,
            rows = stats.rows_sent,
            "Spooler stopped"
        );
        // Dropping `self.tx` here closes the row channel.
        stats
    }

    /// Process one file and record its outcome. Returns `false` when the
    /// loop should stop.
    fn handle_file(&self, candidate: &Candidate, stats: &mut SpoolStats) -> bool {
        let guard = OperationGuard::new("process_archive", &candidate.filename);

        match self.process_file(candidate) {
            Ok(read) => {
                stats.rows_sent += read.rows;
                stats.rows_skipped += read.skipped;

                // Without a persisted record the archive must stay in place
                // so a restart can process it again.
                if let Err(e) = self.state.mark_processed(&candidate.filename) {
                    error!(
                        file = %candidate.filename,
                        error = %e,
                        "Failed to persist processed state, keeping archive for a later run"
                    );
                    guard.fail(&e.to_string());
                    return true;
                }

                stats.files_processed += 1;
                if let Err(e) = self.source.finish(candidate) {
                    warn!(file = %candidate.filename, error = %e, "Cleanup after processing failed");
                }
                guard.complete();
                true
            }
            Err(e) if e.is_cancelled() => {
                info!(file = %candidate.filename, "Cancelled mid-file, leaving it for a later run");
                guard.abandon();
                false
            }
            Err(e) => {
                stats.files_failed += 1;
                let reason = e.to_string();
                if let Err(persist) = self.state.mark_failed(&candidate.filename, &reason) {
                    error!(file = %candidate.filename, error = %persist, "Failed to persist failed state");
                }
                guard.fail(&reason);
                true
            }
        }
    }

    fn process_file(&self, candidate: &Candidate) -> Result<ReadStats> {
        info!(file = %candidate.filename, key = %candidate.key, "Processing archive");

        // Removed on drop, whatever the outcome.
        let scratch = tempfile::Builder::new()
            .prefix("ingex-")
            .tempdir()
            .map_err(|e| IngexError::with_context("Failed to create scratch directory", e))?;

        let zip_path = self.source.fetch(candidate, scratch.path())?;
        let db_path = archive::extract_database(&zip_path, scratch.path(), &candidate.filename)?;

        let mut cancelled = false;
        let read = reader::read_rows(&db_path, &self.options.table, &candidate.filename, |row| {
            if self.shutdown.is_cancelled() {
                cancelled = true;
                return ControlFlow::Break(());
            }
            select! {
                send(self.tx, row) -> sent => {
                    if sent.is_err() {
                        // Receiver gone: nobody will consume the rest.
                        cancelled = true;
                        return ControlFlow::Break(());
                    }
                    ControlFlow::Continue(())
                }
                recv(self.shutdown.signal()) -> _ => {
                    cancelled = true;
                    ControlFlow::Break(())
                }
            }
        })?;

        if cancelled {
            return Err(IngexError::Cancelled);
        }

        info!(
            file = %candidate.filename,
            rows = read.rows,
            skipped = read.skipped,
            "Archive streamed"
        );
        Ok(read)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::write_archive;
    use super::*;
    use tempfile::TempDir;

    fn options(capacity: usize) -> SpoolerOptions {
        SpoolerOptions {
            channel_capacity: capacity,
            ..SpoolerOptions::default()
        }
    }

    fn open_state(dir: &TempDir) -> Arc<StateStore> {
        Arc::new(StateStore::open(dir.path().join("state.json")).unwrap())
    }

    #[test]
    fn discovery_filters_sorts_and_skips_known() {
        let src_dir = TempDir::new().unwrap();
        let state_dir = TempDir::new().unwrap();
        for name in ["c.db.zip", "a.db.zip", "b.db.zip", "notes.txt"] {
            std::fs::write(src_dir.path().join(name), b"x").unwrap();
        }
        let source = LocalSource::new(src_dir.path());
        let state = open_state(&state_dir);
        state.mark_processed("b.db.zip").unwrap();

        let names: Vec<_> = discover(&source, &state, ".db.zip")
            .unwrap()
            .into_iter()
            .map(|c| c.filename)
            .collect();
        assert_eq!(names, vec!["a.db.zip", "c.db.zip"]);

        state.mark_failed("a.db.zip", "boom").unwrap();
        state.mark_processed("c.db.zip").unwrap();
        assert!(discover(&source, &state, ".db.zip").unwrap().is_empty());
    }

    #[test]
    fn single_pass_streams_marks_and_closes() {
        let src_dir = TempDir::new().unwrap();
        let state_dir = TempDir::new().unwrap();
        write_archive(
            src_dir.path(),
            "one.db.zip",
            &[("at://1", "did:1", "{}", "{}"), ("at://2", "did:2", "{}", "{}")],
        );
        let state = open_state(&state_dir);

        let spooler = Spooler::new(
            Box::new(LocalSource::new(src_dir.path())),
            Arc::clone(&state),
            options(10),
            Shutdown::new(),
        );
        let mut handle = spooler.start().unwrap();
        let rows: Vec<RawRow> = handle.rows().iter().collect();
        let stats = handle.join().unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].source_filename, "one.db.zip");
        assert_eq!(stats.files_processed, 1);
        assert_eq!(stats.rows_sent, 2);
        assert!(state.is_processed("one.db.zip"));
        assert!(!src_dir.path().join("one.db.zip").exists());
    }

    #[test]
    fn unpersisted_success_keeps_the_archive() {
        let src_dir = TempDir::new().unwrap();
        let state_dir = TempDir::new().unwrap();
        write_archive(src_dir.path(), "one.db.zip", &[("at://1", "did:1", "{}", "{}")]);
        // A regular file where the state directory should be makes every
        // persist fail.
        let blocker = state_dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();
        let state_path = blocker.join("state.json");
        let state = Arc::new(StateStore::open(&state_path).unwrap());

        let spooler = Spooler::new(
            Box::new(LocalSource::new(src_dir.path())),
            state,
            options(10),
            Shutdown::new(),
        );
        let mut handle = spooler.start().unwrap();
        let rows: Vec<RawRow> = handle.rows().iter().collect();
        let stats = handle.join().unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(stats.rows_sent, 1);
        assert_eq!(stats.files_processed, 0);
        assert!(src_dir.path().join("one.db.zip").exists());
        assert!(!state_path.exists());
    }

    #[test]
    fn broken_archive_is_marked_failed_and_others_continue() {
        let src_dir = TempDir::new().unwrap();
        let state_dir = TempDir::new().unwrap();
        std::fs::write(src_dir.path().join("a-bad.db.zip"), b"not a zip").unwrap();
        write_archive(src_dir.path(), "b-good.db.zip", &[("at://1", "d", "{}", "{}")]);
        let state = open_state(&state_dir);

        let spooler = Spooler::new(
            Box::new(LocalSource::new(src_dir.path())),
            Arc::clone(&state),
            options(10),
            Shutdown::new(),
        );
        let mut handle = spooler.start().unwrap();
        let received = handle.rows().iter().count();
        let stats = handle.join().unwrap();

        assert_eq!(received, 1);
        assert_eq!(stats.files_failed, 1);
        assert!(state.is_failed("a-bad.db.zip"));
        assert!(state.get("a-bad.db.zip").unwrap().error.is_some());
        assert!(state.is_processed("b-good.db.zip"));
        // Failed archives stay in place for inspection.
        assert!(src_dir.path().join("a-bad.db.zip").exists());
    }

    #[test]
    fn cancelled_before_start_touches_nothing() {
        let src_dir = TempDir::new().unwrap();
        let state_dir = TempDir::new().unwrap();
        write_archive(src_dir.path(), "one.db.zip", &[("at://1", "d", "{}", "{}")]);
        let state = open_state(&state_dir);
        let shutdown = Shutdown::new();
        shutdown.cancel();

        let spooler = Spooler::new(
            Box::new(LocalSource::new(src_dir.path())),
            Arc::clone(&state),
            options(10),
            shutdown,
        );
        let mut handle = spooler.start().unwrap();
        assert_eq!(handle.rows().iter().count(), 0);
        assert_eq!(handle.join().unwrap().passes, 0);
        assert!(state.is_empty());
    }

    #[test]
    fn cancel_mid_file_leaves_it_unmarked() {
        let src_dir = TempDir::new().unwrap();
        let state_dir = TempDir::new().unwrap();
        let rows: Vec<(String, &str, &str, &str)> = (0..50)
            .map(|i| (format!("at://{i}"), "d", "{}", "{}"))
            .collect();
        let borrowed: Vec<(&str, &str, &str, &str)> = rows
            .iter()
            .map(|(u, d, r, i)| (u.as_str(), *d, *r, *i))
            .collect();
        write_archive(src_dir.path(), "big.db.zip", &borrowed);
        let state = open_state(&state_dir);

        let spooler = Spooler::new(
            Box::new(LocalSource::new(src_dir.path())),
            Arc::clone(&state),
            options(1),
            Shutdown::new(),
        );
        let mut handle = spooler.start().unwrap();
        let rx = handle.rows();
        assert!(rx.recv().is_ok());
        handle.stop();
        let stats = handle.join().unwrap();

        assert_eq!(stats.files_processed, 0);
        assert_eq!(stats.files_failed, 0);
        assert!(!state.is_known("big.db.zip"));
        assert!(src_dir.path().join("big.db.zip").exists());
    }

    #[test]
    fn repeated_passes_never_re_emit() {
        let src_dir = TempDir::new().unwrap();
        let state_dir = TempDir::new().unwrap();
        write_archive(src_dir.path(), "one.db.zip", &[("at://1", "d", "{}", "{}")]);
        let state = open_state(&state_dir);
        let shutdown = Shutdown::new();

        let spooler = Spooler::new(
            Box::new(LocalSource::new(src_dir.path())),
            Arc::clone(&state),
            SpoolerOptions {
                mode: SpoolMode::Spool,
                interval: Duration::from_millis(10),
                ..options(10)
            },
            shutdown.clone(),
        );
        let mut handle = spooler.start().unwrap();
        let rx = handle.rows();
        assert_eq!(rx.recv().unwrap().at_uri, "at://1");

        // Let several empty passes run before stopping.
        std::thread::sleep(Duration::from_millis(100));
        shutdown.cancel();
        let stats = handle.join().unwrap();

        assert!(stats.passes > 1);
        assert_eq!(stats.files_processed, 1);
        assert_eq!(rx.iter().count(), 0);
    }
}
