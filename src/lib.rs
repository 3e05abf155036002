//! ingex - resumable ingestion of zipped `SQLite` exports
//!
//! This library discovers export archives, streams the rows of their content
//! table, and writes content documents, tombstones, and deletes to a search
//! engine. Per-file progress is persisted so restarts skip finished work.
//!
//! # Modules
//!
//! - [`cli`] - Command-line interface definitions
//! - [`config`] - Layered configuration
//! - [`error`] - Custom error types with rich context
//! - [`model`] - Rows, records, and persisted state entries
//! - [`state`] - Durable per-file processing state
//! - [`spooler`] - Archive discovery and row streaming
//! - [`transform`] - Row to record conversion
//! - [`dispatcher`] - Batching of records into bulk calls
//! - [`indexer`] - Search engine bulk operations
//! - [`pipeline`] - Wiring for one run
//!
//! # Data flow
//!
//! ```text
//! ArchiveSource ─▶ Spooler ─▶ row channel ─▶ Dispatcher ─▶ Indexer ─▶ search engine
//!                    │                          │
//!                StateStore                RowTransformer
//! ```

pub mod archive;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod indexer;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod reader;
pub mod shutdown;
pub mod spooler;
pub mod state;
pub mod transform;

pub use config::{Config, SpoolMode};
pub use dispatcher::{DispatchStats, Dispatcher, DispatcherState};
pub use error::{IngexError, Result, ResultExt};
pub use indexer::{BulkTransport, HttpTransport, Indexer, TransportResponse};
pub use model::*;
pub use pipeline::RunSummary;
pub use shutdown::Shutdown;
pub use spooler::{ArchiveSource, Candidate, LocalSource, S3Source, Spooler, SpoolerHandle, SpoolerOptions};
pub use state::{StateStore, StateSummary};
pub use transform::RowTransformer;
