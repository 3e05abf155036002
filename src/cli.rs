//! CLI definitions for ingex.
//!
//! Uses clap for argument parsing with derive macros.

use crate::config::{Config, SpoolMode};
use crate::logging::{LogFormat, LogLevel};
use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

/// ingex - resumable ingestion of zipped `SQLite` exports into a search index
#[derive(Parser, Debug)]
#[command(name = "ingex")]
#[command(version)]
#[command(about = "Resumable ingestion of zipped SQLite exports into a search index")]
#[command(long_about = r#"
ingex discovers zipped SQLite export batches in a local directory or an S3
bucket, streams their rows, and writes content documents, tombstones, and
deletes to a search engine through its bulk API.

Every archive is recorded as processed or failed in a state file, so a
restarted run never repeats finished work.

Quick start:
  1. export ELASTICSEARCH_URL=https://localhost:9200
  2. export ELASTICSEARCH_API_KEY=...
  3. Run: ingex run --local-dir /data/exports
  4. Check: ingex status
"#)]
pub struct Cli {
    /// Path to a TOML config file
    #[arg(long, short = 'c', env = "INGEX_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Be verbose (repeat for trace output)
    #[arg(long, short = 'v', action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Be quiet (errors only)
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Log level (error, warn, info, debug, trace, off)
    #[arg(long, global = true)]
    pub log_level: Option<LogLevel>,

    /// Log format (pretty, compact, full)
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Ingest archives into the search index
    Run(RunArgs),

    /// Show processed and failed archives from the state file
    Status(StatusArgs),

    /// Show configuration
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Log writes instead of sending them
    #[arg(long)]
    pub dry_run: bool,

    /// Accept invalid TLS certificates from the search engine
    #[arg(long)]
    pub skip_tls_verify: bool,

    /// Search engine base URL
    #[arg(long)]
    pub url: Option<String>,

    /// Read archives from this directory
    #[arg(long, conflicts_with = "s3_bucket")]
    pub local_dir: Option<PathBuf>,

    /// Read archives from this S3 bucket
    #[arg(long)]
    pub s3_bucket: Option<String>,

    /// Key prefix inside the S3 bucket
    #[arg(long)]
    pub s3_prefix: Option<String>,

    /// AWS region of the bucket
    #[arg(long)]
    pub aws_region: Option<String>,

    /// Single pass or repeating discovery
    #[arg(long, value_enum)]
    pub mode: Option<SpoolMode>,

    /// Seconds between discovery passes in spool mode
    #[arg(long)]
    pub interval: Option<u64>,

    /// Records per bulk request
    #[arg(long, short = 'b')]
    pub batch_size: Option<usize>,

    /// Processing state file
    #[arg(long)]
    pub state_file: Option<PathBuf>,
}

impl RunArgs {
    /// Overlay flags that were given on top of `config`.
    pub fn apply_to(&self, config: &mut Config) {
        if self.dry_run {
            config.run.dry_run = true;
        }
        if self.skip_tls_verify {
            config.search.skip_tls_verify = true;
        }
        if let Some(url) = &self.url {
            config.search.url.clone_from(url);
        }
        if let Some(dir) = &self.local_dir {
            config.source.local_dir = dir.display().to_string();
            config.source.s3_bucket.clear();
        }
        if let Some(bucket) = &self.s3_bucket {
            config.source.s3_bucket.clone_from(bucket);
            config.source.local_dir.clear();
        }
        if let Some(prefix) = &self.s3_prefix {
            config.source.s3_prefix.clone_from(prefix);
        }
        if let Some(region) = &self.aws_region {
            config.source.aws_region.clone_from(region);
        }
        if let Some(mode) = self.mode {
            config.spool.mode = mode;
        }
        if let Some(interval) = self.interval {
            config.spool.interval_secs = interval;
        }
        if let Some(batch_size) = self.batch_size {
            config.search.batch_size = batch_size;
        }
        if let Some(path) = &self.state_file {
            config.spool.state_file.clone_from(path);
        }
    }
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Processing state file (defaults to the configured one)
    #[arg(long)]
    pub state_file: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Show the effective configuration
    #[arg(long)]
    pub show: bool,

    /// Print the default configuration file
    #[arg(long, conflicts_with = "show")]
    pub default: bool,
}

#[derive(Args, Debug, Clone)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_flags_override_config() {
        let cli = Cli::parse_from([
            "ingex",
            "run",
            "--dry-run",
            "--s3-bucket",
            "exports",
            "--mode",
            "spool",
            "--interval",
            "5",
            "-b",
            "250",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };

        let mut config = Config::default();
        config.source.local_dir = "/from/env".into();
        args.apply_to(&mut config);

        assert!(config.run.dry_run);
        assert_eq!(config.source.s3_bucket, "exports");
        assert!(config.source.local_dir.is_empty());
        assert_eq!(config.spool.mode, SpoolMode::Spool);
        assert_eq!(config.spool.interval_secs, 5);
        assert_eq!(config.search.batch_size, 250);
    }

    #[test]
    fn test_local_and_s3_conflict() {
        let result = Cli::try_parse_from(["ingex", "run", "--local-dir", "/a", "--s3-bucket", "b"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_verbosity_counts() {
        let cli = Cli::parse_from(["ingex", "-vv", "status"]);
        assert_eq!(cli.verbose, 2);
    }
}
