//! Archives in a local directory.

use super::{ArchiveSource, Candidate};
use crate::error::{IngexError, Result, ResultExt};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// A flat directory of archive files. Archives are read in place and
/// deleted once processed.
#[derive(Debug, Clone)]
pub struct LocalSource {
    dir: PathBuf,
}

impl LocalSource {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }
}

impl ArchiveSource for LocalSource {
    fn describe(&self) -> String {
        self.dir.display().to_string()
    }

    fn list(&self) -> Result<Vec<Candidate>> {
        if !self.dir.is_dir() {
            return Err(IngexError::path_error(
                "list",
                &self.dir,
                std::io::Error::new(std::io::ErrorKind::NotFound, "not a directory"),
            ));
        }

        let mut candidates = Vec::new();
        for entry in WalkDir::new(&self.dir).min_depth(1).max_depth(1) {
            let entry = entry.with_context(|| format!("Failed to list {}", self.dir.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                candidates.push(Candidate::new(entry.path().display().to_string(), name));
            }
        }
        Ok(candidates)
    }

    fn fetch(&self, candidate: &Candidate, _scratch: &Path) -> Result<PathBuf> {
        let path = PathBuf::from(&candidate.key);
        if !path.is_file() {
            return Err(IngexError::path_error(
                "open",
                path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "archive disappeared"),
            ));
        }
        Ok(path)
    }

    fn finish(&self, candidate: &Candidate) -> Result<()> {
        std::fs::remove_file(&candidate.key)
            .map_err(|e| IngexError::path_error("remove", &candidate.key, e))?;
        debug!(file = %candidate.filename, "Removed processed archive");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn lists_only_top_level_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.db.zip"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("b.db.zip"), b"x").unwrap();

        let source = LocalSource::new(dir.path());
        let listed = source.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].filename, "a.db.zip");
        assert_eq!(PathBuf::from(&listed[0].key), dir.path().join("a.db.zip"));
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = TempDir::new().unwrap();
        let source = LocalSource::new(dir.path().join("nope"));
        assert!(source.list().is_err());
    }

    #[test]
    fn fetch_is_in_place_and_finish_removes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.db.zip");
        std::fs::write(&path, b"x").unwrap();
        let source = LocalSource::new(dir.path());
        let candidate = Candidate::new(path.display().to_string(), "a.db.zip");

        assert_eq!(source.fetch(&candidate, dir.path()).unwrap(), path);
        source.finish(&candidate).unwrap();
        assert!(!path.exists());
        assert!(source.fetch(&candidate, dir.path()).is_err());
    }
}
