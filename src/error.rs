//! Custom error types for ingex.
//!
//! Provides structured error handling with enough context to decide, at each
//! layer, whether a failure is fatal (configuration), scoped to one archive
//! file, or scoped to one bulk batch.

use std::path::PathBuf;
use thiserror::Error;

/// Primary error type for ingex operations.
///
/// Each variant provides specific context about what went wrong,
/// enabling better error messages and programmatic error handling.
#[derive(Error, Debug)]
pub enum IngexError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// A required configuration value is absent.
    #[error("Missing required configuration: {key}")]
    MissingConfig { key: &'static str },

    /// A configuration value is present but unusable.
    #[error("Invalid configuration for {key}: {reason}")]
    InvalidConfig { key: &'static str, reason: String },

    /// Configuration file parsing error.
    #[error("Invalid configuration in '{path}': {reason}")]
    ConfigFile { path: PathBuf, reason: String },

    // =========================================================================
    // Archive Errors
    // =========================================================================
    /// Zip archive contains no entries at all.
    #[error("Archive '{file}' is empty")]
    EmptyArchive { file: String },

    /// Zip archive has entries but none of them is a database file.
    #[error("No database file found in archive '{file}'")]
    MissingDatabase { file: String },

    /// Zip container could not be read.
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    // =========================================================================
    // Database Errors
    // =========================================================================
    /// `SQLite` operation failed.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    // =========================================================================
    // Search Engine Errors
    // =========================================================================
    /// Transport-level failure talking to the search engine.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The search engine rejected a bulk request, or some of its items.
    #[error("Bulk request to '{index}' failed: {reason}")]
    BulkRejected { index: String, reason: String },

    /// Every record in a batch lacked an identifier.
    #[error("No valid documents in batch for '{index}' ({skipped} skipped without identifier)")]
    EmptyBatch { index: String, skipped: usize },

    // =========================================================================
    // Object Store Errors
    // =========================================================================
    /// Listing or downloading from the object store failed.
    #[error("Object store error for '{location}': {reason}")]
    ObjectStore { location: String, reason: String },

    // =========================================================================
    // State Errors
    // =========================================================================
    /// The processing state file could not be read or written.
    #[error("State file '{path}' could not be {operation}: {reason}")]
    State {
        operation: &'static str,
        path: PathBuf,
        reason: String,
    },

    // =========================================================================
    // IO / Serialization Errors
    // =========================================================================
    /// File read/write error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Path-specific IO error with context.
    #[error("Failed to {operation} '{path}': {source}")]
    PathError {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// Work was abandoned because shutdown was requested.
    #[error("Cancelled")]
    Cancelled,

    // =========================================================================
    // Generic Errors
    // =========================================================================
    /// Catch-all for other errors with context.
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Wrapped anyhow error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for ingex operations.
pub type Result<T> = std::result::Result<T, IngexError>;

impl IngexError {
    /// Create an invalid configuration error.
    pub fn invalid_config(key: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            key,
            reason: reason.into(),
        }
    }

    /// Create a bulk rejection error.
    pub fn bulk_rejected(index: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BulkRejected {
            index: index.into(),
            reason: reason.into(),
        }
    }

    /// Create an object store error.
    pub fn object_store(location: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::ObjectStore {
            location: location.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a state persistence error.
    pub fn state(
        operation: &'static str,
        path: impl Into<PathBuf>,
        reason: impl std::fmt::Display,
    ) -> Self {
        Self::State {
            operation,
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a path error with context.
    pub fn path_error(
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        Self::PathError {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Wrap an error with additional context.
    pub fn with_context<E>(context: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::WithContext {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Configuration problems abort startup; everything else is scoped to a
    /// file or a batch.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MissingConfig { .. } | Self::InvalidConfig { .. } | Self::ConfigFile { .. }
        )
    }

    /// Check if this error is a cancellation rather than a failure.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Get a suggestion for how to fix this error, if applicable.
    #[must_use]
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::MissingConfig { .. } | Self::InvalidConfig { .. } => Some(
                "Set the value in the config file, the environment, or on the command line.",
            ),
            Self::ConfigFile { .. } => Some("Run 'ingex config --default' for a valid template."),
            Self::MissingDatabase { .. } | Self::EmptyArchive { .. } => {
                Some("Each archive must contain exactly one '.db' file.")
            }
            Self::State { .. } => Some("Check permissions on the state file and its directory."),
            _ => None,
        }
    }
}

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Add context to an error.
    ///
    /// # Errors
    ///
    /// Returns the original error wrapped with additional context.
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily (only evaluated on error).
    ///
    /// # Errors
    ///
    /// Returns the original error wrapped with additional context.
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| IngexError::with_context(context, e))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| IngexError::with_context(f(), e))
    }
}
