//! Zip container handling.
//!
//! Each archive carries one `SQLite` database. The first member whose name
//! ends in `.db` is extracted into a scratch directory owned by the caller.

use crate::error::{IngexError, Result};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::debug;
use zip::ZipArchive;

const DATABASE_SUFFIX: &str = ".db";

/// Extract the database member of `zip_path` into `dest_dir`.
///
/// `display_name` is only used in error messages and logs.
///
/// # Errors
///
/// Returns [`IngexError::EmptyArchive`] for an archive with no members,
/// [`IngexError::MissingDatabase`] when no member ends in `.db`, or a zip/IO
/// error if the container or destination cannot be accessed.
pub fn extract_database(zip_path: &Path, dest_dir: &Path, display_name: &str) -> Result<PathBuf> {
    let file = File::open(zip_path).map_err(|e| IngexError::path_error("open", zip_path, e))?;
    let mut archive = ZipArchive::new(file)?;

    if archive.is_empty() {
        return Err(IngexError::EmptyArchive {
            file: display_name.to_string(),
        });
    }

    let index = (0..archive.len())
        .find(|&i| {
            archive
                .name_for_index(i)
                .is_some_and(|name| name.ends_with(DATABASE_SUFFIX) && !name.ends_with('/'))
        })
        .ok_or_else(|| IngexError::MissingDatabase {
            file: display_name.to_string(),
        })?;

    let mut member = archive.by_index(index)?;
    // Flatten nested paths and refuse traversal outside the scratch dir.
    let base_name = member
        .enclosed_name()
        .and_then(|p| p.file_name().map(PathBuf::from))
        .ok_or_else(|| IngexError::MissingDatabase {
            file: display_name.to_string(),
        })?;
    let out_path = dest_dir.join(base_name);

    let out = File::create(&out_path).map_err(|e| IngexError::path_error("create", &out_path, e))?;
    let mut writer = BufWriter::new(out);
    let bytes = std::io::copy(&mut member, &mut writer)
        .map_err(|e| IngexError::path_error("extract", &out_path, e))?;

    debug!(
        archive = display_name,
        member = member.name(),
        bytes,
        "Extracted database"
    );
    Ok(out_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    fn write_zip(path: &Path, members: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for (name, data) in members {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn extracts_first_database_member() {
        let dir = TempDir::new().unwrap();
        let zip_path = dir.path().join("a.db.zip");
        write_zip(
            &zip_path,
            &[
                ("README.txt", b"notes"),
                ("nested/first.db", b"first"),
                ("second.db", b"second"),
            ],
        );

        let scratch = TempDir::new().unwrap();
        let out = extract_database(&zip_path, scratch.path(), "a.db.zip").unwrap();
        assert_eq!(out, scratch.path().join("first.db"));
        assert_eq!(std::fs::read(&out).unwrap(), b"first");
    }

    #[test]
    fn empty_archive_is_rejected() {
        let dir = TempDir::new().unwrap();
        let zip_path = dir.path().join("empty.db.zip");
        write_zip(&zip_path, &[]);

        let err = extract_database(&zip_path, dir.path(), "empty.db.zip").unwrap_err();
        assert!(matches!(err, IngexError::EmptyArchive { .. }));
    }

    #[test]
    fn archive_without_database_is_rejected() {
        let dir = TempDir::new().unwrap();
        let zip_path = dir.path().join("nodb.db.zip");
        write_zip(&zip_path, &[("data.csv", b"a,b")]);

        let err = extract_database(&zip_path, dir.path(), "nodb.db.zip").unwrap_err();
        assert!(matches!(err, IngexError::MissingDatabase { .. }));
        assert!(err.to_string().contains("nodb.db.zip"));
    }

    #[test]
    fn corrupt_container_is_a_zip_error() {
        let dir = TempDir::new().unwrap();
        let zip_path = dir.path().join("bad.db.zip");
        std::fs::write(&zip_path, b"definitely not a zip").unwrap();

        let err = extract_database(&zip_path, dir.path(), "bad.db.zip").unwrap_err();
        assert!(matches!(err, IngexError::Zip(_)));
    }
}
