//! Progress store
//!
//! Persistent ledger of source files, migration jobs, per-row status and an
//! append-only audit trail, kept in SQLite.
//!
//! Every mutation goes through a [`ProgressTx`]. Transactions are serialized
//! through one writer gate: SQLite admits a single writer, and taking the gate
//! before `BEGIN` keeps concurrent workers and the retry scheduler from failing
//! with `SQLITE_BUSY` when a read transaction tries to upgrade. Reads outside a
//! transaction use [`ProgressStore::acquire`].
//!
//! The query functions live in per-table modules and take a
//! `&mut SqliteConnection`, so they compose inside one transaction:
//!
//! ```rust,ignore
//! let mut tx = store.begin().await?;
//! sources::increment_counters(&mut tx, source_id, 98, 2).await?;
//! jobs::add_progress(&mut tx, job_id, 98, 2).await?;
//! tx.commit().await?;
//! ```

pub mod jobs;
pub mod logs;
pub mod models;
pub mod rows;
pub mod sources;

pub use models::{
    AuditEntry, AuditLevel, JobRecord, JobStatus, RowProgress, RowStatus, SourceRecord,
    SourceStatus,
};

use crate::config::ProgressStoreSettings;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Sqlite, SqliteConnection, Transaction};
use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::info;

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("Progress store error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Progress store migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Unknown {domain} status '{value}'")]
    InvalidStatus { domain: &'static str, value: String },

    #[error("Not found: {0}")]
    NotFound(String),
}

impl ProgressError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }
}

pub type ProgressResult<T> = Result<T, ProgressError>;

/// Shared handle to the ledger. Cheap to clone.
#[derive(Clone)]
pub struct ProgressStore {
    pool: SqlitePool,
    write_gate: Arc<Mutex<()>>,
}

impl ProgressStore {
    /// Open (creating if needed) the ledger described by `settings` and bring
    /// its schema up to date.
    pub async fn connect(settings: &ProgressStoreSettings) -> ProgressResult<Self> {
        let options = SqliteConnectOptions::from_str(&settings.url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(settings.busy_timeout_secs))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(settings.max_connections.max(1))
            .connect_with(options)
            .await?;

        info!(url = %settings.url, "Progress store connected");
        Self::from_pool(pool).await
    }

    /// A private in-memory ledger. The pool pins its single connection so the
    /// database lives as long as the store.
    pub async fn in_memory() -> ProgressResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> ProgressResult<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self {
            pool,
            write_gate: Arc::new(Mutex::new(())),
        })
    }

    /// Start a write transaction.
    pub async fn begin(&self) -> ProgressResult<ProgressTx> {
        let gate = self.write_gate.clone().lock_owned().await;
        let tx = self.pool.begin().await?;
        Ok(ProgressTx { tx, _gate: gate })
    }

    /// Check out a connection for reads.
    pub async fn acquire(&self) -> ProgressResult<PoolConnection<Sqlite>> {
        Ok(self.pool.acquire().await?)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// An open write transaction. Dropping it without [`ProgressTx::commit`]
/// rolls back.
pub struct ProgressTx {
    tx: Transaction<'static, Sqlite>,
    _gate: OwnedMutexGuard<()>,
}

impl ProgressTx {
    pub async fn commit(self) -> ProgressResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

impl Deref for ProgressTx {
    type Target = SqliteConnection;

    fn deref(&self) -> &Self::Target {
        &self.tx
    }
}

impl DerefMut for ProgressTx {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.tx
    }
}
