//! Configuration system for ingex.
//!
//! Provides layered configuration from multiple sources:
//!
//! 1. **Compiled defaults** - Sensible defaults built into the binary
//! 2. **Config file** - `--config <path>` or `~/.config/ingex/config.toml`
//! 3. **Environment variables** - see the table below
//! 4. **CLI arguments** - Highest priority, always wins
//!
//! | Variable                | Setting                  |
//! |-------------------------|--------------------------|
//! | `ELASTICSEARCH_URL`     | `search.url`             |
//! | `ELASTICSEARCH_API_KEY` | `search.api_key`         |
//! | `INGEX_SKIP_TLS_VERIFY` | `search.skip_tls_verify` |
//! | `INGEX_CONTENT_INDEX`   | `search.content_index`   |
//! | `INGEX_TOMBSTONE_INDEX` | `search.tombstone_index` |
//! | `INGEX_BATCH_SIZE`      | `search.batch_size`      |
//! | `INGEX_DRAIN_GRACE_SEC` | `search.drain_grace_secs`|
//! | `LOCAL_SQLITE_DB_PATH`  | `source.local_dir`       |
//! | `S3_SQLITE_DB_BUCKET`   | `source.s3_bucket`       |
//! | `S3_SQLITE_DB_PREFIX`   | `source.s3_prefix`       |
//! | `AWS_REGION`            | `source.aws_region`      |
//! | `INGEX_SPOOL_MODE`      | `spool.mode`             |
//! | `SPOOL_INTERVAL_SEC`    | `spool.interval_secs`    |
//! | `SPOOL_STATE_FILE`      | `spool.state_file`       |
//! | `INGEX_DRY_RUN`         | `run.dry_run`            |
//! | `LOGGING_ENABLED`       | `run.logging_enabled`    |
//!
//! Empty environment values are treated as unset.
//!
//! # Example Configuration File
//!
//! ```toml
//! [search]
//! url = "https://search.example.com:9200"
//! batch_size = 500
//!
//! [source]
//! s3_bucket = "exports"
//! s3_prefix = "daily/"
//!
//! [spool]
//! mode = "spool"
//! interval_secs = 300
//! ```

use crate::error::{IngexError, Result};
use crate::indexer::{DEFAULT_CONTENT_INDEX, DEFAULT_DRAIN_GRACE, DEFAULT_TOMBSTONE_INDEX};
use crate::reader;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Main configuration structure for ingex.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Search engine connection and batching.
    pub search: SearchConfig,
    /// Where archives come from.
    pub source: SourceConfig,
    /// Discovery loop behavior.
    pub spool: SpoolConfig,
    /// Run-wide switches.
    pub run: RunConfig,
}

/// Search engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Base URL of the search engine. Required.
    pub url: String,
    /// API key sent as `Authorization: ApiKey <key>`. Required unless dry-run.
    pub api_key: String,
    /// Accept invalid TLS certificates.
    pub skip_tls_verify: bool,
    /// Index holding live content documents.
    pub content_index: String,
    /// Index holding deletion markers.
    pub tombstone_index: String,
    /// Records per bulk request.
    pub batch_size: usize,
    /// Seconds a bulk call may still take once shutdown is requested.
    pub drain_grace_secs: u64,
}

/// Archive source configuration. Exactly one of `local_dir` and
/// `s3_bucket` must be set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub local_dir: String,
    pub s3_bucket: String,
    pub s3_prefix: String,
    pub aws_region: String,
    /// Filename suffix identifying archives.
    pub suffix: String,
}

/// Discovery loop configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoolConfig {
    pub mode: SpoolMode,
    /// Sleep between passes in spool mode.
    pub interval_secs: u64,
    /// Processing state snapshot.
    pub state_file: PathBuf,
    /// Rows buffered between the spooler and the dispatcher.
    pub channel_capacity: usize,
    /// Content table inside each archive database.
    pub table: String,
}

/// Run-wide switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Log writes instead of sending them.
    pub dry_run: bool,
    /// Master switch for log output.
    pub logging_enabled: bool,
}

/// Single pass or repeating discovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SpoolMode {
    /// One discovery pass; exit when it is drained.
    #[default]
    Once,
    /// Repeat discovery every interval until stopped.
    Spool,
}

impl fmt::Display for SpoolMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Once => write!(f, "once"),
            Self::Spool => write!(f, "spool"),
        }
    }
}

impl FromStr for SpoolMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "once" | "single" => Ok(Self::Once),
            "spool" | "loop" | "continuous" => Ok(Self::Spool),
            _ => Err(format!("Invalid spool mode: {s}")),
        }
    }
}

/// Resolved archive location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocation {
    Local(PathBuf),
    S3 {
        bucket: String,
        prefix: String,
        region: String,
    },
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key: String::new(),
            skip_tls_verify: false,
            content_index: DEFAULT_CONTENT_INDEX.to_string(),
            tombstone_index: DEFAULT_TOMBSTONE_INDEX.to_string(),
            batch_size: crate::dispatcher::DEFAULT_BATCH_SIZE,
            drain_grace_secs: DEFAULT_DRAIN_GRACE.as_secs(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            local_dir: String::new(),
            s3_bucket: String::new(),
            s3_prefix: String::new(),
            aws_region: "us-east-1".to_string(),
            suffix: ".db.zip".to_string(),
        }
    }
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            mode: SpoolMode::Once,
            interval_secs: 60,
            state_file: PathBuf::from(".processed_files.json"),
            channel_capacity: 1000,
            table: reader::DEFAULT_TABLE.to_string(),
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            logging_enabled: true,
        }
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(IngexError::invalid_config(key, format!("'{value}' is not a boolean"))),
    }
}

fn parse_number<T: FromStr>(key: &'static str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| IngexError::invalid_config(key, format!("'{value}' is not a number")))
}

impl Config {
    /// Load configuration from defaults, a config file, and the environment.
    ///
    /// An explicit path must exist and parse. The per-user file is optional.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file cannot be read or parsed, or an
    /// environment variable holds an unusable value.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load_from_file(path)?,
            None => match Self::user_config_path().filter(|p| p.exists()) {
                Some(path) => Self::load_from_file(&path)?,
                None => Self::default(),
            },
        };

        config.apply_env_overrides()?;
        debug!(config = ?config.redacted(), "Configuration loaded");
        Ok(config)
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid TOML for
    /// this structure.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| IngexError::ConfigFile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let config = toml::from_str(&content).map_err(|e| IngexError::ConfigFile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        info!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    /// Get the path to the user configuration file.
    #[must_use]
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("ingex").join("config.toml"))
    }

    /// Apply overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable holds an unusable value.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable holds an unusable value.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        // Search engine
        if let Some(url) = get("ELASTICSEARCH_URL") {
            self.search.url = url;
        }
        if let Some(key) = get("ELASTICSEARCH_API_KEY") {
            self.search.api_key = key;
        }
        if let Some(v) = get("INGEX_SKIP_TLS_VERIFY") {
            self.search.skip_tls_verify = parse_bool("INGEX_SKIP_TLS_VERIFY", &v)?;
        }
        if let Some(index) = get("INGEX_CONTENT_INDEX") {
            self.search.content_index = index;
        }
        if let Some(index) = get("INGEX_TOMBSTONE_INDEX") {
            self.search.tombstone_index = index;
        }
        if let Some(v) = get("INGEX_BATCH_SIZE") {
            self.search.batch_size = parse_number("INGEX_BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("INGEX_DRAIN_GRACE_SEC") {
            self.search.drain_grace_secs = parse_number("INGEX_DRAIN_GRACE_SEC", &v)?;
        }

        // Source
        if let Some(dir) = get("LOCAL_SQLITE_DB_PATH") {
            self.source.local_dir = dir;
        }
        if let Some(bucket) = get("S3_SQLITE_DB_BUCKET") {
            self.source.s3_bucket = bucket;
        }
        if let Some(prefix) = get("S3_SQLITE_DB_PREFIX") {
            self.source.s3_prefix = prefix;
        }
        if let Some(region) = get("AWS_REGION") {
            self.source.aws_region = region;
        }

        // Spool
        if let Some(v) = get("INGEX_SPOOL_MODE") {
            self.spool.mode = v
                .parse()
                .map_err(|e: String| IngexError::invalid_config("INGEX_SPOOL_MODE", e))?;
        }
        if let Some(v) = get("SPOOL_INTERVAL_SEC") {
            self.spool.interval_secs = parse_number("SPOOL_INTERVAL_SEC", &v)?;
        }
        if let Some(path) = get("SPOOL_STATE_FILE") {
            self.spool.state_file = PathBuf::from(path);
        }

        // Run
        if let Some(v) = get("INGEX_DRY_RUN") {
            self.run.dry_run = parse_bool("INGEX_DRY_RUN", &v)?;
        }
        if let Some(v) = get("LOGGING_ENABLED") {
            self.run.logging_enabled = parse_bool("LOGGING_ENABLED", &v)?;
        }

        Ok(())
    }

    /// Check everything a run needs before anything starts.
    ///
    /// # Errors
    ///
    /// Returns the first missing or invalid setting.
    pub fn validate(&self) -> Result<()> {
        let url = self.search.url.trim();
        if url.is_empty() {
            return Err(IngexError::MissingConfig { key: "search.url" });
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(IngexError::invalid_config(
                "search.url",
                format!("'{url}' must start with http:// or https://"),
            ));
        }
        if !self.run.dry_run && self.search.api_key.trim().is_empty() {
            return Err(IngexError::MissingConfig { key: "search.api_key" });
        }
        if self.search.content_index.trim().is_empty() {
            return Err(IngexError::invalid_config("search.content_index", "must not be empty"));
        }
        if self.search.tombstone_index.trim().is_empty() {
            return Err(IngexError::invalid_config("search.tombstone_index", "must not be empty"));
        }
        if self.search.batch_size == 0 {
            return Err(IngexError::invalid_config("search.batch_size", "must be greater than 0"));
        }

        self.source.location()?;
        if self.source.suffix.is_empty() {
            return Err(IngexError::invalid_config("source.suffix", "must not be empty"));
        }

        if self.spool.channel_capacity == 0 {
            return Err(IngexError::invalid_config(
                "spool.channel_capacity",
                "must be greater than 0",
            ));
        }
        if self.spool.mode == SpoolMode::Spool && self.spool.interval_secs == 0 {
            return Err(IngexError::invalid_config(
                "spool.interval_secs",
                "must be greater than 0 in spool mode",
            ));
        }
        if !reader::is_valid_table_name(&self.spool.table) {
            return Err(IngexError::invalid_config(
                "spool.table",
                format!("'{}' is not a valid table name", self.spool.table),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.spool.interval_secs)
    }

    /// How long in-flight and draining bulk calls may run after shutdown.
    #[must_use]
    pub const fn drain_grace(&self) -> Duration {
        Duration::from_secs(self.search.drain_grace_secs)
    }

    /// Copy with secrets masked, for display and logs.
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.search.api_key.is_empty() {
            copy.search.api_key = "********".to_string();
        }
        copy
    }

    /// Generate a default configuration file content.
    #[must_use]
    pub fn default_config_content() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

impl SourceConfig {
    /// The single configured archive location.
    ///
    /// # Errors
    ///
    /// Returns an error if neither or both locations are set.
    pub fn location(&self) -> Result<SourceLocation> {
        let local = self.local_dir.trim();
        let bucket = self.s3_bucket.trim();
        match (local.is_empty(), bucket.is_empty()) {
            (false, true) => Ok(SourceLocation::Local(PathBuf::from(local))),
            (true, false) => Ok(SourceLocation::S3 {
                bucket: bucket.to_string(),
                prefix: self.s3_prefix.clone(),
                region: self.aws_region.clone(),
            }),
            (true, true) => Err(IngexError::MissingConfig {
                key: "source.local_dir or source.s3_bucket",
            }),
            (false, false) => Err(IngexError::invalid_config(
                "source",
                "set either local_dir or s3_bucket, not both",
            )),
        }
    }
}
