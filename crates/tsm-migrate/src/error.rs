//! Top-level error type for the migration engine.

use crate::client::ClientError;
use crate::config::ConfigError;
use crate::progress::ProgressError;
use crate::schema::SchemaError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MigrateError>;

/// Errors that stop a migration before or outside per-row processing.
///
/// Row and file failures never surface here; they are recorded in the
/// progress store and the run carries on.
#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Progress store error: {0}")]
    Progress(#[from] ProgressError),

    #[error("Destination unavailable: {0}")]
    Client(#[from] ClientError),

    #[error("Destination schema error: {0}")]
    Schema(#[from] SchemaError),
}
