//! Streaming reads of the content table in an extracted archive database.

use crate::error::{IngexError, Result};
use crate::model::RawRow;
use rusqlite::{Connection, OpenFlags, Row};
use std::ops::ControlFlow;
use std::path::Path;
use tracing::{debug, warn};

/// Default content table inside every archive database.
pub const DEFAULT_TABLE: &str = "enriched_posts";

/// Outcome of streaming one database.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadStats {
    /// Rows handed to the callback.
    pub rows: usize,
    /// Rows that could not be decoded and were skipped.
    pub skipped: usize,
    /// Whether the callback asked to stop before the table was exhausted.
    pub stopped: bool,
}

/// Whether `table` is safe to splice into SQL as an identifier.
#[must_use]
pub fn is_valid_table_name(table: &str) -> bool {
    let mut chars = table.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Stream every row of `table` in `db_path` to `on_row`.
///
/// The database is opened read-only. Rows whose columns cannot be decoded
/// as text are logged and skipped; the rest of the table is still read.
/// Returning [`ControlFlow::Break`] from the callback ends the scan early.
///
/// # Errors
///
/// Returns an error if the database cannot be opened, the table is missing,
/// or stepping the cursor fails.
pub fn read_rows<F>(db_path: &Path, table: &str, source_filename: &str, mut on_row: F) -> Result<ReadStats>
where
    F: FnMut(RawRow) -> ControlFlow<()>,
{
    if !is_valid_table_name(table) {
        return Err(IngexError::invalid_config(
            "spool.table",
            format!("'{table}' is not a valid table name"),
        ));
    }

    let conn = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;

    let sql = format!("SELECT at_uri, did, raw_post, inferences FROM \"{table}\"");
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    let mut stats = ReadStats::default();

    while let Some(row) = rows.next()? {
        let raw = match decode_row(row, source_filename) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(file = source_filename, error = %e, "Failed to decode row, skipping");
                stats.skipped += 1;
                continue;
            }
        };

        stats.rows += 1;
        if on_row(raw).is_break() {
            stats.stopped = true;
            break;
        }
    }

    debug!(
        file = source_filename,
        rows = stats.rows,
        skipped = stats.skipped,
        stopped = stats.stopped,
        "Finished reading database"
    );
    Ok(stats)
}

fn decode_row(row: &Row<'_>, source_filename: &str) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        at_uri: row.get(0)?,
        did: row.get(1)?,
        raw_post: row.get(2)?,
        inferences: row.get(3)?,
        source_filename: source_filename.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;
    use tempfile::TempDir;

    fn make_db(dir: &TempDir, rows: &[(Option<&str>, &str, &str, &str)]) -> std::path::PathBuf {
        let path = dir.path().join("posts.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE enriched_posts (at_uri TEXT, did TEXT, raw_post TEXT, inferences TEXT);",
        )
        .unwrap();
        for (uri, did, raw, inf) in rows {
            conn.execute(
                "INSERT INTO enriched_posts (at_uri, did, raw_post, inferences) VALUES (?1, ?2, ?3, ?4)",
                params![uri, did, raw, inf],
            )
            .unwrap();
        }
        path
    }

    #[test]
    fn streams_all_rows_in_order() {
        let dir = TempDir::new().unwrap();
        let path = make_db(
            &dir,
            &[
                (Some("at://1"), "did:1", "{}", "{}"),
                (Some("at://2"), "did:2", "{}", "{}"),
            ],
        );

        let mut seen = Vec::new();
        let stats = read_rows(&path, DEFAULT_TABLE, "f.db.zip", |row| {
            seen.push(row);
            ControlFlow::Continue(())
        })
        .unwrap();

        assert_eq!(stats.rows, 2);
        assert_eq!(seen[0].at_uri, "at://1");
        assert_eq!(seen[1].did, "did:2");
        assert!(seen.iter().all(|r| r.source_filename == "f.db.zip"));
    }

    #[test]
    fn undecodable_row_is_skipped() {
        let dir = TempDir::new().unwrap();
        let path = make_db(
            &dir,
            &[
                (None, "did:1", "{}", "{}"),
                (Some("at://2"), "did:2", "{}", "{}"),
            ],
        );

        let mut seen = Vec::new();
        let stats = read_rows(&path, DEFAULT_TABLE, "f.db.zip", |row| {
            seen.push(row.at_uri);
            ControlFlow::Continue(())
        })
        .unwrap();

        assert_eq!(stats.skipped, 1);
        assert_eq!(seen, vec!["at://2".to_string()]);
    }

    #[test]
    fn break_stops_the_scan() {
        let dir = TempDir::new().unwrap();
        let path = make_db(
            &dir,
            &[
                (Some("at://1"), "d", "{}", "{}"),
                (Some("at://2"), "d", "{}", "{}"),
                (Some("at://3"), "d", "{}", "{}"),
            ],
        );

        let stats = read_rows(&path, DEFAULT_TABLE, "f", |_| ControlFlow::Break(())).unwrap();
        assert_eq!(stats.rows, 1);
        assert!(stats.stopped);
    }

    #[test]
    fn missing_table_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = make_db(&dir, &[]);
        let err = read_rows(&path, "other_table", "f", |_| ControlFlow::Continue(())).unwrap_err();
        assert!(matches!(err, IngexError::Database(_)));
    }

    #[test]
    fn table_names_are_validated() {
        assert!(is_valid_table_name("enriched_posts"));
        assert!(is_valid_table_name("_t1"));
        assert!(!is_valid_table_name(""));
        assert!(!is_valid_table_name("1posts"));
        assert!(!is_valid_table_name("posts; DROP TABLE x"));
    }
}
