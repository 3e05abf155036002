//! Durable per-file processing state.
//!
//! The store maps archive filename to its terminal status. Every mutation
//! rewrites the whole JSON snapshot before returning, so a `mark_*` call that
//! returned `Ok` survives a crash. Snapshots are written to a temporary file
//! in the same directory and renamed into place.

use crate::error::{IngexError, Result};
use crate::model::{FileStateEntry, FileStatus};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// Filename-keyed registry of processed and failed archives.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, FileStateEntry>>,
}

/// Counts for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateSummary {
    pub processed: usize,
    pub failed: usize,
}

impl StateStore {
    /// Open the store, loading any existing snapshot. A missing or empty file
    /// yields an empty store.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = Self::load(&path)?;
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn load(path: &Path) -> Result<HashMap<String, FileStateEntry>> {
        if !path.exists() {
            info!(path = %path.display(), "State file does not exist, starting with empty state");
            return Ok(HashMap::new());
        }

        let data = std::fs::read(path).map_err(|e| IngexError::state("read", path, e))?;
        if data.iter().all(u8::is_ascii_whitespace) {
            info!(path = %path.display(), "State file is empty, starting with empty state");
            return Ok(HashMap::new());
        }

        let list: Vec<FileStateEntry> =
            serde_json::from_slice(&data).map_err(|e| IngexError::state("parsed", path, e))?;

        // Later entries win if a hand-edited file repeats a filename.
        let entries: HashMap<_, _> = list
            .into_iter()
            .map(|entry| (entry.filename.clone(), entry))
            .collect();

        info!(entries = entries.len(), "Loaded processing state");
        Ok(entries)
    }

    /// Path of the backing snapshot.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn is_processed(&self, filename: &str) -> bool {
        self.status(filename) == Some(FileStatus::Processed)
    }

    #[must_use]
    pub fn is_failed(&self, filename: &str) -> bool {
        self.status(filename) == Some(FileStatus::Failed)
    }

    /// Whether the file has reached either terminal state.
    #[must_use]
    pub fn is_known(&self, filename: &str) -> bool {
        self.entries.lock().contains_key(filename)
    }

    #[must_use]
    pub fn status(&self, filename: &str) -> Option<FileStatus> {
        self.entries.lock().get(filename).map(|e| e.status)
    }

    #[must_use]
    pub fn get(&self, filename: &str) -> Option<FileStateEntry> {
        self.entries.lock().get(filename).cloned()
    }

    /// Record a successful file and persist.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written. The in-memory
    /// entry is kept either way.
    pub fn mark_processed(&self, filename: &str) -> Result<()> {
        self.record(filename, FileStatus::Processed, None)?;
        info!(file = filename, "Marked file as processed");
        Ok(())
    }

    /// Record a failed file with its cause and persist.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written.
    pub fn mark_failed(&self, filename: &str, reason: &str) -> Result<()> {
        self.record(filename, FileStatus::Failed, Some(reason.to_string()))?;
        error!(file = filename, reason, "Marked file as failed");
        Ok(())
    }

    fn record(&self, filename: &str, status: FileStatus, error: Option<String>) -> Result<()> {
        let mut entries = self.entries.lock();
        entries.insert(
            filename.to_string(),
            FileStateEntry {
                filename: filename.to_string(),
                status,
                timestamp: Utc::now(),
                error,
            },
        );
        // Persist while still holding the lock so snapshots never interleave.
        self.persist(&entries)
    }

    fn persist(&self, entries: &HashMap<String, FileStateEntry>) -> Result<()> {
        let mut list: Vec<&FileStateEntry> = entries.values().collect();
        list.sort_by(|a, b| a.filename.cmp(&b.filename));
        let data = serde_json::to_vec_pretty(&list)?;

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(|e| IngexError::path_error("create", &dir, e))?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)
            .map_err(|e| IngexError::state("written", &self.path, e))?;
        tmp.write_all(&data)
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| IngexError::state("written", &self.path, e))?;
        tmp.persist(&self.path)
            .map_err(|e| IngexError::state("written", &self.path, e.error))?;

        debug!(entries = list.len(), path = %self.path.display(), "Persisted processing state");
        Ok(())
    }

    /// Snapshot of all entries, sorted by filename.
    #[must_use]
    pub fn entries(&self) -> Vec<FileStateEntry> {
        let mut list: Vec<_> = self.entries.lock().values().cloned().collect();
        list.sort_by(|a, b| a.filename.cmp(&b.filename));
        list
    }

    #[must_use]
    pub fn summary(&self) -> StateSummary {
        let entries = self.entries.lock();
        let processed = entries
            .values()
            .filter(|e| e.status == FileStatus::Processed)
            .count();
        StateSummary {
            processed,
            failed: entries.len() - processed,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn state_path(dir: &TempDir) -> PathBuf {
        dir.path().join("state.json")
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(state_path(&dir)).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn empty_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        std::fs::write(state_path(&dir), "").unwrap();
        let store = StateStore::open(state_path(&dir)).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(state_path(&dir), "{not json").unwrap();
        let err = StateStore::open(state_path(&dir)).unwrap_err();
        assert!(matches!(err, IngexError::State { .. }));
    }

    #[test]
    fn mark_processed_survives_reload() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(state_path(&dir)).unwrap();
        store.mark_processed("a.db.zip").unwrap();
        assert!(store.is_processed("a.db.zip"));
        assert!(!store.is_failed("a.db.zip"));

        let reloaded = StateStore::open(state_path(&dir)).unwrap();
        assert!(reloaded.is_processed("a.db.zip"));
        assert!(!reloaded.is_failed("a.db.zip"));
    }

    #[test]
    fn mark_failed_keeps_reason_across_reload() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(state_path(&dir)).unwrap();
        store.mark_failed("b.db.zip", "x").unwrap();

        let reloaded = StateStore::open(state_path(&dir)).unwrap();
        assert!(reloaded.is_failed("b.db.zip"));
        assert!(!reloaded.is_processed("b.db.zip"));
        assert_eq!(reloaded.get("b.db.zip").unwrap().error.as_deref(), Some("x"));
    }

    #[test]
    fn latest_mark_wins() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(state_path(&dir)).unwrap();
        store.mark_failed("c.db.zip", "first").unwrap();
        store.mark_processed("c.db.zip").unwrap();

        let reloaded = StateStore::open(state_path(&dir)).unwrap();
        assert_eq!(reloaded.len(), 1);
        let entry = reloaded.get("c.db.zip").unwrap();
        assert_eq!(entry.status, FileStatus::Processed);
        assert!(entry.error.is_none());
    }

    #[test]
    fn mixed_entries_round_trip_as_a_set() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(state_path(&dir)).unwrap();
        let names = ["z.db.zip", "m.db.zip", "a.db.zip", "q.db.zip", "b.db.zip"];
        for (i, name) in names.iter().enumerate() {
            if i % 2 == 0 {
                store.mark_processed(name).unwrap();
            } else {
                store.mark_failed(name, &format!("err {i}")).unwrap();
            }
        }

        let original: HashSet<_> = store
            .entries()
            .into_iter()
            .map(|e| (e.filename, e.status, e.error))
            .collect();
        let reloaded: HashSet<_> = StateStore::open(state_path(&dir))
            .unwrap()
            .entries()
            .into_iter()
            .map(|e| (e.filename, e.status, e.error))
            .collect();

        assert_eq!(original.len(), names.len());
        assert_eq!(original, reloaded);
        assert_eq!(
            store.summary(),
            StateSummary {
                processed: 3,
                failed: 2
            }
        );
    }

    #[test]
    fn snapshot_is_a_json_list() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(state_path(&dir)).unwrap();
        store.mark_processed("a.db.zip").unwrap();
        let raw = std::fs::read_to_string(state_path(&dir)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(value.is_array());
        assert_eq!(value[0]["filename"], "a.db.zip");
        assert_eq!(value[0]["status"], "processed");
        assert!(value[0].get("error").is_none());
    }

    #[test]
    fn creates_missing_parent_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let store = StateStore::open(&path).unwrap();
        store.mark_processed("a.db.zip").unwrap();
        assert!(path.exists());
    }
}
