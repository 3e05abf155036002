//! ingex - resumable archive ingestion CLI
//!
//! Main entry point for the ingex command-line tool.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use colored::Colorize;
use std::io;
use tracing::{debug, info};

use ingex::cli::{self, Cli, Commands};
use ingex::config::{Config, SourceLocation};
use ingex::logging;
use ingex::model::FileStatus;
use ingex::pipeline::{self, RunSummary};
use ingex::{IngexError, Shutdown, StateStore};

/// Exit status for configuration errors, distinct from run failures.
const EXIT_CONFIG: i32 = 2;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let outcome = match &cli.command {
        Commands::Run(args) => cmd_run(&cli, args),
        Commands::Status(args) => cmd_status(&cli, args),
        Commands::Config(args) => cmd_config(&cli, args),
        Commands::Completions(args) => cmd_completions(args.clone()),
    };

    match outcome {
        Err(err) if err.downcast_ref::<IngexError>().is_some_and(IngexError::is_fatal) => {
            eprintln!("Error: {err:?}");
            std::process::exit(EXIT_CONFIG);
        }
        other => other,
    }
}

fn init_logging(cli: &Cli, quiet: bool, enabled: bool) {
    let config = logging::cli_log_config(quiet, cli.verbose, enabled)
        .with_overrides(cli.log_level, cli.log_format);
    logging::init_logging(&config);
}

/// Print the operator hint for an error, if any, and hand it to anyhow.
fn with_hint(err: IngexError) -> anyhow::Error {
    if let Some(hint) = err.suggestion() {
        eprintln!("{} {}", "hint:".yellow().bold(), hint);
    }
    anyhow::Error::from(err)
}

fn load_config(cli: &Cli) -> Result<Config> {
    Config::load(cli.config.as_deref()).map_err(with_hint)
}

fn cmd_run(cli: &Cli, args: &cli::RunArgs) -> Result<()> {
    let mut config = load_config(cli)?;
    args.apply_to(&mut config);
    init_logging(cli, cli.quiet, config.run.logging_enabled);
    config.validate().map_err(with_hint)?;
    debug!(config = ?config.redacted(), "Effective configuration");

    let shutdown = Shutdown::new();
    let handler_shutdown = shutdown.clone();
    ctrlc::set_handler(move || handler_shutdown.cancel()).context("Failed to install signal handler")?;

    if !cli.quiet {
        print_run_header(&config);
    }

    let summary = pipeline::run(&config, &shutdown).map_err(with_hint)?;
    info!(files_processed = summary.files_processed, "Run complete");

    if !cli.quiet {
        print_summary(&summary, shutdown.is_cancelled());
    }
    Ok(())
}

fn print_run_header(config: &Config) {
    let title = if config.run.dry_run {
        "Ingesting archives (dry run)"
    } else {
        "Ingesting archives"
    };
    println!("{}", title.bold().cyan());
    match config.source.location() {
        Ok(SourceLocation::Local(dir)) => println!("  Source: {}", dir.display()),
        Ok(SourceLocation::S3 { bucket, prefix, region }) => {
            println!("  Source: s3://{bucket}/{prefix} ({region})");
        }
        Err(_) => {}
    }
    println!("  Search: {}", config.search.url);
    println!("  Mode: {}", config.spool.mode);
    println!("  State: {}", config.spool.state_file.display());
    println!();
}

fn print_summary(summary: &RunSummary, cancelled: bool) {
    let title = if cancelled {
        "Run stopped".yellow().bold()
    } else {
        "Run complete".green().bold()
    };
    println!("{title}");
    println!("  Files processed: {}", summary.files_processed);
    let failed = summary.files_failed.to_string();
    if summary.files_failed > 0 {
        println!("  Files failed:    {}", failed.red());
    } else {
        println!("  Files failed:    {failed}");
    }
    println!(
        "  Rows:            {} read, {} skipped, {} without id",
        summary.rows_read, summary.rows_skipped, summary.rows_dropped
    );
    println!(
        "  Writes:          {} upserts, {} tombstones, {} deletes",
        summary.upserts, summary.tombstones, summary.deletes
    );
    if summary.flush_failures > 0 {
        println!(
            "  Flush failures:  {}",
            summary.flush_failures.to_string().red()
        );
    }
    println!("  Duration:        {} ms", summary.duration_ms);
}

fn cmd_status(cli: &Cli, args: &cli::StatusArgs) -> Result<()> {
    let config = load_config(cli)?;
    init_logging(cli, true, config.run.logging_enabled);

    let path = args
        .state_file
        .clone()
        .unwrap_or_else(|| config.spool.state_file.clone());
    let store = StateStore::open(&path).map_err(with_hint)?;
    let summary = store.summary();
    let entries = store.entries();

    if args.json {
        let value = serde_json::json!({
            "state_file": path.display().to_string(),
            "processed": summary.processed,
            "failed": summary.failed,
            "entries": entries,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("{}", "Processing State".bold().cyan());
    println!("  File: {}", path.display());
    println!("  Processed: {}", summary.processed.to_string().green());
    println!("  Failed: {}", summary.failed.to_string().red());

    let failed: Vec<_> = entries
        .iter()
        .filter(|e| e.status == FileStatus::Failed)
        .collect();
    if !failed.is_empty() {
        println!();
        println!("{}", "Failed archives".bold());
        for entry in failed {
            println!(
                "  {} {} ({})",
                "✗".red(),
                entry.filename,
                entry.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
            );
            if let Some(reason) = &entry.error {
                println!("      {}", reason.dimmed());
            }
        }
    }
    Ok(())
}

fn cmd_config(cli: &Cli, args: &cli::ConfigArgs) -> Result<()> {
    if args.default {
        print!("{}", Config::default_config_content());
        return Ok(());
    }

    let config = load_config(cli)?;
    if args.show {
        let rendered = toml::to_string_pretty(&config.redacted()).context("Failed to render configuration")?;
        print!("{rendered}");
    } else {
        println!("{}", "Configuration".bold().cyan());
        match Config::user_config_path() {
            Some(path) => println!("  User config: {}", path.display()),
            None => println!("  User config: (no config directory)"),
        }
        println!("  Use --show for the effective values or --default for a template.");
    }
    Ok(())
}

fn cmd_completions(args: cli::CompletionsArgs) -> Result<()> {
    let mut cmd = Cli::command();
    generate(args.shell, &mut cmd, "ingex", &mut io::stdout());
    Ok(())
}
