//! TSM Migrate - CSV to time-series migration tool

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tsm_common::logging::{init_logging, LogConfig, LogLevel};
use tsm_migrate::app::{self, Destination, MigrationApp};
use tsm_migrate::client::MemoryBackend;
use tsm_migrate::config::MigrationConfig;
use tsm_migrate::progress::ProgressStore;
use tsm_migrate::scheduler::RetryScheduler;

#[derive(Parser, Debug)]
#[command(name = "tsm-migrate")]
#[command(author, version, about = "Resumable CSV to time-series migration")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Migration configuration file (JSON or TOML)
    #[arg(short, long, global = true, env = "TSM_CONFIG", default_value = "config.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Migrate every configured file that still has work
    Run {
        /// Write to an in-process store instead of the configured endpoints
        #[arg(long)]
        dry_run: bool,
    },

    /// Show per-source progress from the ledger
    Status,

    /// Reset failed rows with retry budget left, once
    Retry,

    /// Load and validate the configuration only
    Validate,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("tsm-migrate")
        .build();

    // Environment variables take precedence
    let log_config = log_config.merge_env().unwrap_or_else(|e| {
        eprintln!("Ignoring invalid log settings: {}", e);
        LogConfig::builder().level(log_level).build()
    });

    let _guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            None
        },
    };

    if let Err(e) = execute(&cli).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn execute(cli: &Cli) -> Result<()> {
    match cli.command {
        Command::Run { dry_run } => run(&cli.config, dry_run).await,
        Command::Status => status(&cli.config).await,
        Command::Retry => retry(&cli.config).await,
        Command::Validate => {
            MigrationConfig::load_validated(&cli.config)
                .with_context(|| format!("Invalid configuration {}", cli.config.display()))?;
            println!("Configuration {} is valid", cli.config.display());
            Ok(())
        },
    }
}

async fn run(config_path: &Path, dry_run: bool) -> Result<()> {
    let config = MigrationConfig::load_validated(config_path)
        .with_context(|| format!("Invalid configuration {}", config_path.display()))?;
    let destination = if dry_run {
        info!("Dry run: writing to an in-process store");
        Destination::Memory(MemoryBackend::default())
    } else {
        Destination::Rest
    };

    let app = MigrationApp::connect(config, destination)
        .await
        .context("Failed to initialize migration")?;

    let token = CancellationToken::new();
    tokio::spawn(shutdown_signal(token.clone()));

    let result = app.run(token).await;
    app.close().await;
    let summary = result.context("Migration aborted")?;

    println!("Files completed: {}", summary.files_completed);
    println!("Files failed:    {}", summary.files_failed);
    println!("Rows written:    {}", summary.rows_written);
    println!("Rows failed:     {}", summary.rows_failed);
    if summary.lossy_values > 0 {
        println!("Lossy values:    {}", summary.lossy_values);
    }
    Ok(())
}

async fn status(config_path: &Path) -> Result<()> {
    let config = MigrationConfig::load(config_path)
        .with_context(|| format!("Failed to load configuration {}", config_path.display()))?;
    let store = ProgressStore::connect(&config.progress_store)
        .await
        .context("Failed to open progress store")?;
    let reports = app::status_report(&store).await?;
    store.close().await;

    if reports.is_empty() {
        println!("No sources recorded yet");
        return Ok(());
    }
    for report in reports {
        let source = &report.source;
        println!(
            "[{}] {} ({}): {} processed, {} failed, {} total{}",
            source.status,
            source.path,
            source.source_name,
            source.processed_rows,
            source.failed_rows,
            source.total_rows,
            if source.has_failed_rows { ", rows awaiting retry" } else { "" }
        );
        if let Some(ref job) = report.latest_job {
            println!("    job {}: {}", job.id, job.status);
        }
        if let Some(ref message) = source.error_message {
            println!("    error: {}", message);
        }
        let counts: Vec<String> = report
            .row_counts
            .iter()
            .map(|(status, count)| format!("{}={}", status, count))
            .collect();
        if !counts.is_empty() {
            println!("    rows: {}", counts.join(" "));
        }
    }
    Ok(())
}

async fn retry(config_path: &Path) -> Result<()> {
    let config = MigrationConfig::load(config_path)
        .with_context(|| format!("Failed to load configuration {}", config_path.display()))?;
    let store = ProgressStore::connect(&config.progress_store)
        .await
        .context("Failed to open progress store")?;
    let scheduler = RetryScheduler::new(
        store.clone(),
        config.migration.max_row_retries,
        config.migration.retry_scheduler_interval(),
    );
    let reset = scheduler.sweep().await.context("Retry sweep failed")?;
    store.close().await;

    println!("Reset {} rows for retry", reset);
    Ok(())
}

/// Cancel `token` on Ctrl+C or SIGTERM.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => warn!("Received Ctrl+C, shutting down"),
        _ = terminate => warn!("Received terminate signal, shutting down"),
    }
    token.cancel();
}
