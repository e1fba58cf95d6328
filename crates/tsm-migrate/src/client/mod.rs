//! Destination client
//!
//! The migration engine talks to the time-series store through the
//! [`SeriesSession`] trait. Sessions are checked out of a bounded
//! [`SessionPool`] for one operation at a time.
//!
//! Implementations:
//! - [`RestSession`]: the store's REST API (v2) over HTTP
//! - [`MemorySession`]: an in-process store for dry runs and tests

pub mod memory;
pub mod pool;
pub mod rest;

pub use memory::{MemoryBackend, MemorySession, Point};
pub use pool::{PooledSession, SessionPool};
pub use rest::RestSession;

use crate::types::{SeriesSchema, SeriesType, SeriesValue};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Execution failed ({code}): {message}")]
    Execution { code: i64, message: String },

    #[error("Unexpected response: {0}")]
    Decode(String),

    #[error("Session pool is closed")]
    PoolClosed,

    #[error("Cancelled while waiting for a session")]
    Cancelled,
}

impl ClientError {
    /// Errors worth another attempt after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Connection(_) | ClientError::Execution { .. })
    }
}

/// One session against the destination store.
#[async_trait]
pub trait SeriesSession: Send + Sync {
    /// Human-readable address, for logs.
    fn endpoint(&self) -> &str;

    /// Check the store is reachable and accepts our credentials.
    async fn ping(&self) -> Result<(), ClientError>;

    /// Schema of an existing series, `None` if it does not exist.
    async fn series_schema(&self, series: &str) -> Result<Option<SeriesSchema>, ClientError>;

    async fn create_series(&self, series: &str, schema: &SeriesSchema) -> Result<(), ClientError>;

    /// Create several measurements of one aligned device in a single statement.
    async fn create_aligned_series(
        &self,
        device: &str,
        measurements: &[(String, SeriesSchema)],
    ) -> Result<(), ClientError>;

    async fn insert_tablet(&self, tablet: &Tablet, aligned: bool) -> Result<(), ClientError>;
}

/// One value column of a tablet.
#[derive(Debug, Clone, PartialEq)]
pub struct TabletColumn {
    pub measurement: String,
    pub data_type: SeriesType,
    /// One entry per timestamp; `None` where the row has no value.
    pub values: Vec<Option<SeriesValue>>,
}

/// A columnar write unit for one device path.
#[derive(Debug, Clone, PartialEq)]
pub struct Tablet {
    pub device: String,
    pub timestamps: Vec<i64>,
    pub columns: Vec<TabletColumn>,
}

impl Tablet {
    pub fn row_count(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty() || self.columns.is_empty()
    }
}
