//! Wiring of the migration components for one process.

use crate::client::{MemoryBackend, SeriesSession, SessionPool};
use crate::config::{DeviceSettings, MigrationConfig};
use crate::error::Result;
use crate::initializer::MigrationInitializer;
use crate::orchestrator::{Orchestrator, RunSummary};
use crate::progress::{
    jobs, logs, rows, sources, AuditLevel, JobRecord, ProgressResult, ProgressStore, RowStatus,
    SourceRecord,
};
use crate::scheduler::RetryScheduler;
use crate::schema::SchemaReconciler;
use crate::writer::{RetryPolicy, Writer};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Where tablets are written.
#[derive(Clone)]
pub enum Destination {
    /// The REST endpoints from the client settings.
    Rest,
    /// An in-process store, for dry runs and tests.
    Memory(MemoryBackend),
}

/// Ledger view of one source for status reports.
#[derive(Debug, Clone)]
pub struct SourceReport {
    pub source: SourceRecord,
    pub latest_job: Option<JobRecord>,
    pub row_counts: Vec<(RowStatus, i64)>,
}

pub struct MigrationApp {
    config: MigrationConfig,
    store: ProgressStore,
    pool: Arc<SessionPool>,
    schema: Arc<SchemaReconciler>,
}

impl MigrationApp {
    /// Open the configured progress store and build the app on it.
    pub async fn connect(config: MigrationConfig, destination: Destination) -> Result<Self> {
        let store = ProgressStore::connect(&config.progress_store).await?;
        Self::build(config, store, destination).await
    }

    /// Build the app on an existing store. Every destination endpoint is
    /// probed once; an unreachable endpoint is an error.
    pub async fn build(
        config: MigrationConfig,
        store: ProgressStore,
        destination: Destination,
    ) -> Result<Self> {
        let pool = match destination {
            Destination::Rest => SessionPool::from_settings(&config.client)?,
            Destination::Memory(backend) => {
                let sessions = (0..config.client.sessions_per_endpoint.max(1))
                    .map(|n| Arc::new(backend.session(format!("memory-{}", n))) as Arc<dyn SeriesSession>)
                    .collect();
                SessionPool::new(sessions)
            },
        };
        pool.ping_all().await?;

        let pool = Arc::new(pool);
        let schema = Arc::new(SchemaReconciler::new(pool.clone()));
        Ok(Self {
            config,
            store,
            pool,
            schema,
        })
    }

    pub fn store(&self) -> &ProgressStore {
        &self.store
    }

    /// Migrate every configured file that still has work, until done or
    /// until `token` is cancelled.
    pub async fn run(&self, token: CancellationToken) -> Result<RunSummary> {
        let settings = &self.config.migration;
        self.audit(AuditLevel::Info, "Migration run started").await?;

        let initializer = MigrationInitializer::new(self.store.clone(), settings.max_row_retries);
        let tasks = initializer.initialize(&self.config).await?;

        if let Err(e) = self.schema.prevalidate(&self.config.destinations).await {
            error!(error = %e, "Destination schema check failed");
            self.audit(AuditLevel::Error, &format!("Schema validation failed: {}", e))
                .await?;
            return Err(e.into());
        }

        let scheduler_token = token.child_token();
        let scheduler = Arc::new(RetryScheduler::new(
            self.store.clone(),
            settings.max_row_retries,
            settings.retry_scheduler_interval(),
        ));
        let scheduler_handle = scheduler.spawn(scheduler_token.clone());

        let writer = Arc::new(Writer::new(
            self.pool.clone(),
            self.schema.clone(),
            self.store.clone(),
            RetryPolicy::from_settings(&self.config.client),
        ));
        let devices: Vec<Arc<DeviceSettings>> =
            self.config.destinations.iter().cloned().map(Arc::new).collect();
        let orchestrator = Arc::new(Orchestrator::new(
            self.store.clone(),
            writer,
            devices,
            settings.clone(),
        ));
        let summary = orchestrator.run(tasks, token.clone()).await;

        scheduler_token.cancel();
        if let Err(e) = scheduler_handle.await {
            warn!(error = %e, "Retry scheduler did not stop cleanly");
        }

        let outcome = if token.is_cancelled() { "interrupted" } else { "finished" };
        let message = format!(
            "Migration run {}: {} files completed, {} failed, {} rows written, {} rows failed",
            outcome,
            summary.files_completed,
            summary.files_failed,
            summary.rows_written,
            summary.rows_failed
        );
        let level = if summary.files_failed > 0 || token.is_cancelled() {
            AuditLevel::Warning
        } else {
            AuditLevel::Info
        };
        self.audit(level, &message).await?;
        info!(
            files_completed = summary.files_completed,
            files_failed = summary.files_failed,
            rows_written = summary.rows_written,
            rows_failed = summary.rows_failed,
            lossy_values = summary.lossy_values,
            "Migration run {}",
            outcome
        );
        Ok(summary)
    }

    pub async fn close(&self) {
        self.pool.close();
        self.store.close().await;
    }

    async fn audit(&self, level: AuditLevel, message: &str) -> ProgressResult<()> {
        let mut tx = self.store.begin().await?;
        logs::append(&mut tx, None, level, message).await?;
        tx.commit().await
    }
}

/// Status of every source in the ledger, with its latest job and row counts.
pub async fn status_report(store: &ProgressStore) -> ProgressResult<Vec<SourceReport>> {
    let mut conn = store.acquire().await?;
    let mut reports = Vec::new();
    for source in sources::list(&mut conn).await? {
        let latest_job = jobs::latest(&mut conn, source.id).await?;
        let row_counts = rows::count_by_status(&mut conn, source.id).await?;
        reports.push(SourceReport {
            source,
            latest_job,
            row_counts,
        });
    }
    Ok(reports)
}
