//! TSM Migrate
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Resumable migration of delimited files into a time-series store.
//!
//! # Overview
//!
//! - **Progress store**: SQLite ledger of sources, jobs, per-row status and audit entries
//! - **Reader**: streams CSV rows in batches, or replays only rows that still need work
//! - **Converter**: maps typed fields onto destination series
//! - **Schema reconciler**: creates or verifies destination series once per process
//! - **Writer**: delivers tablets with bounded retry and records row outcomes
//! - **Orchestrator**: worker pool driving sources through the pipeline
//! - **Retry scheduler**: periodically re-queues failed rows with budget left
//!
//! # Example
//!
//! ```no_run
//! use tokio_util::sync::CancellationToken;
//! use tsm_migrate::app::{Destination, MigrationApp};
//! use tsm_migrate::config::MigrationConfig;
//!
//! # async fn run() -> tsm_migrate::error::Result<()> {
//! let config = MigrationConfig::load_validated("migration.toml".as_ref())?;
//! let app = MigrationApp::connect(config, Destination::Rest).await?;
//! let summary = app.run(CancellationToken::new()).await?;
//! println!("{} rows written", summary.rows_written);
//! # Ok(())
//! # }
//! ```

pub mod app;
pub mod client;
pub mod config;
pub mod converter;
pub mod error;
pub mod initializer;
pub mod orchestrator;
pub mod progress;
pub mod reader;
pub mod scheduler;
pub mod schema;
pub mod types;
pub mod writer;

pub use app::{Destination, MigrationApp};
pub use error::{MigrateError, Result};
pub use orchestrator::RunSummary;
