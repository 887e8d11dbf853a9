//! # kbsync
//!
//! Command-line entry point for the knowledge-base sync.
//!
//! ```bash
//! kbsync                                  # full replace (default)
//! kbsync --mode incremental               # only when files changed
//! kbsync --mode verify                    # health check
//! kbsync --mode backup                    # snapshot the collection
//! kbsync --mode config-test               # settings and file discovery only
//! kbsync --mode mock-test                 # offline smoke test
//! kbsync --mode append --dry-run          # report what would be written
//! ```
//!
//! Exit status is 0 when the selected mode succeeded and 1 otherwise.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

use boulder_kb::config::load_settings;
use boulder_kb::logging;
use boulder_kb::runner::{Mode, RunContext, RunOptions};

/// Sync the bouldering knowledge base into the vector store.
#[derive(Parser)]
#[command(name = "kbsync", version, about)]
struct Cli {
    /// Run mode.
    #[arg(long, value_enum, default_value_t = Mode::Replace)]
    mode: Mode,

    /// Log level (`RUST_LOG` takes precedence).
    #[arg(long, value_parser = ["debug", "info", "warn", "error"])]
    log_level: Option<String>,

    /// Log what would be written without touching the store.
    #[arg(long)]
    dry_run: bool,

    /// Settings file (TOML). Missing file means defaults plus environment.
    #[arg(long, default_value = "./config/kbsync.toml")]
    config_file: PathBuf,

    /// Use in-memory stand-ins for the vector store and embedding API.
    #[arg(long)]
    mock_services: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let mut settings = load_settings(&cli.config_file)?;
    if let Some(level) = cli.log_level {
        settings.logging.level = level;
    }
    let _guard = logging::init(
        &settings.logging.level,
        &settings.logging.dir,
        &settings.logging.file_prefix,
    );

    let mode = cli.mode;
    let mut ctx = RunContext::new(
        settings,
        RunOptions {
            mode,
            dry_run: cli.dry_run,
            mock_services: cli.mock_services,
        },
    );

    match ctx.run().await {
        Ok(report) if report.success => {
            tracing::info!(mode = %mode, "run completed successfully");
            Ok(ExitCode::SUCCESS)
        }
        Ok(_) => {
            tracing::error!("=== {} FAILED ===", mode);
            Ok(ExitCode::FAILURE)
        }
        Err(err) => {
            tracing::error!(kind = %err.kind(), "=== {} FAILED: {} ===", mode, err);
            Ok(ExitCode::FAILURE)
        }
    }
}
