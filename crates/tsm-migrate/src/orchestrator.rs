//! Worker pool driving sources through read → convert → write.
//!
//! Workers pull whole sources from a shared queue, so one source is only ever
//! handled by one worker and its rows are processed in file order. Progress
//! is committed after every batch. Cancellation is checked before a source is
//! claimed and between batches; stragglers are aborted once the shutdown
//! grace period runs out.

use crate::config::{DeviceSettings, MigrationSettings, SourceSettings};
use crate::converter::Converter;
use crate::progress::{
    jobs, logs, rows, sources, AuditLevel, JobStatus, ProgressResult, ProgressStore, SourceStatus,
};
use crate::reader::{Batch, BatchReader, FileTarget, OpenedFile, ReadEvent, ReaderError};
use crate::writer::Writer;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tsm_common::RowIdentity;

/// A source and the ledger entries of its files, ready to be claimed.
#[derive(Debug, Clone)]
pub struct SourceTask {
    pub settings: Arc<SourceSettings>,
    pub files: Vec<FileTarget>,
}

/// Totals for one orchestrator run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub files_completed: usize,
    pub files_failed: usize,
    pub rows_written: u64,
    pub rows_failed: u64,
    pub lossy_values: u64,
}

impl RunSummary {
    fn merge(&mut self, other: RunSummary) {
        self.files_completed += other.files_completed;
        self.files_failed += other.files_failed;
        self.rows_written += other.rows_written;
        self.rows_failed += other.rows_failed;
        self.lossy_values += other.lossy_values;
    }
}

/// The file a worker is currently migrating.
struct FileRun {
    source_id: i64,
    path: String,
    job_id: i64,
}

pub struct Orchestrator {
    store: ProgressStore,
    writer: Arc<Writer>,
    devices: Vec<Arc<DeviceSettings>>,
    settings: MigrationSettings,
}

impl Orchestrator {
    pub fn new(
        store: ProgressStore,
        writer: Arc<Writer>,
        devices: Vec<Arc<DeviceSettings>>,
        settings: MigrationSettings,
    ) -> Self {
        Self {
            store,
            writer,
            devices,
            settings,
        }
    }

    /// Run every task to completion, or until `token` is cancelled and the
    /// grace period has passed.
    pub async fn run(self: Arc<Self>, tasks: Vec<SourceTask>, token: CancellationToken) -> RunSummary {
        let queue = Arc::new(Mutex::new(VecDeque::from(tasks)));
        let worker_count = self.settings.workers.max(1);
        info!(workers = worker_count, sources = queue_len(&queue), "Starting workers");

        let mut workers = JoinSet::new();
        for worker_id in 0..worker_count {
            let orchestrator = self.clone();
            let queue = queue.clone();
            let token = token.clone();
            workers.spawn(async move { orchestrator.worker(worker_id, queue, token).await });
        }

        let mut summary = RunSummary::default();
        let cancelled = tokio::select! {
            _ = drain(&mut workers, &mut summary) => false,
            _ = token.cancelled() => true,
        };

        if cancelled {
            let grace = self.settings.shutdown_grace();
            info!(grace_secs = grace.as_secs(), "Shutdown requested, waiting for workers");
            if tokio::time::timeout(grace, drain(&mut workers, &mut summary)).await.is_err() {
                warn!(remaining = workers.len(), "Grace period elapsed, aborting workers");
                workers.abort_all();
                drain(&mut workers, &mut summary).await;
            }
        }

        info!(
            files_completed = summary.files_completed,
            files_failed = summary.files_failed,
            rows_written = summary.rows_written,
            rows_failed = summary.rows_failed,
            "Workers finished"
        );
        summary
    }

    async fn worker(
        &self,
        worker_id: usize,
        queue: Arc<Mutex<VecDeque<SourceTask>>>,
        token: CancellationToken,
    ) -> RunSummary {
        let mut summary = RunSummary::default();
        loop {
            if token.is_cancelled() {
                debug!(worker_id, "Cancelled, not claiming more sources");
                break;
            }
            let Some(task) = queue.lock().unwrap_or_else(PoisonError::into_inner).pop_front() else {
                break;
            };
            info!(worker_id, source = %task.settings.name, files = task.files.len(), "Claimed source");
            self.process_source(task, &token, &mut summary).await;
        }
        debug!(worker_id, "Worker done");
        summary
    }

    async fn process_source(&self, task: SourceTask, token: &CancellationToken, summary: &mut RunSummary) {
        let devices = self
            .devices
            .iter()
            .filter(|d| d.applies_to(&task.settings.name))
            .cloned()
            .collect();
        let converter = Converter::new(task.settings.clone(), devices);
        let mut reader = BatchReader::new(
            self.store.clone(),
            task.settings.clone(),
            task.files,
            self.settings.batch_size,
            self.settings.max_row_retries,
        );
        let mut current: Option<FileRun> = None;

        loop {
            if token.is_cancelled() {
                if let Some(run) = current.take() {
                    self.interrupt_file(&run).await;
                }
                reader.close();
                return;
            }

            match reader.read_batch().await {
                Ok(ReadEvent::FileOpened(opened)) => match self.begin_file(&opened).await {
                    Ok(run) => current = Some(run),
                    Err(e) => {
                        self.fail_file(opened.source_id, &e.to_string()).await;
                        summary.files_failed += 1;
                        reader.abandon_file();
                    },
                },
                Ok(ReadEvent::Rows(batch)) => {
                    let Some(run) = current.as_ref() else {
                        continue;
                    };
                    if let Err(e) = self.process_batch(run, &converter, batch, summary).await {
                        self.fail_file(run.source_id, &e.to_string()).await;
                        summary.files_failed += 1;
                        current = None;
                        reader.abandon_file();
                    }
                },
                Ok(ReadEvent::FileFinished(finished)) => {
                    if let Some(run) = current.take() {
                        match self.finish_file(&run).await {
                            Ok(()) => summary.files_completed += 1,
                            Err(e) => {
                                self.fail_file(run.source_id, &e.to_string()).await;
                                summary.files_failed += 1;
                            },
                        }
                    }
                    debug!(source_id = finished.source_id, rows_read = finished.rows_read, "File done");
                },
                Ok(ReadEvent::Exhausted) | Err(ReaderError::Terminal) => return,
                Err(e) => {
                    current = None;
                    match e.source_id() {
                        Some(source_id) => self.fail_file(source_id, &e.to_string()).await,
                        None => error!(error = %e, "Reader failed"),
                    }
                    summary.files_failed += 1;
                },
            }
        }
    }

    /// Mark a file's source and job as running.
    async fn begin_file(&self, opened: &OpenedFile) -> ProgressResult<FileRun> {
        let mut tx = self.store.begin().await?;
        sources::set_status(&mut tx, opened.source_id, SourceStatus::InProgress).await?;
        sources::set_error(&mut tx, opened.source_id, None).await?;
        let (job, created) = jobs::current_or_create(&mut tx, opened.source_id).await?;
        jobs::start(&mut tx, job.id).await?;
        let message = match opened.replay_rows {
            Some(count) => format!("Migration started (job {}), replaying {} rows", job.id, count),
            None => format!("Migration started (job {})", job.id),
        };
        logs::append(&mut tx, Some(opened.source_id), AuditLevel::Info, &message).await?;
        tx.commit().await?;

        info!(source_id = opened.source_id, path = %opened.path, job_id = job.id, new_job = created, "Migration started");
        Ok(FileRun {
            source_id: opened.source_id,
            path: opened.path.clone(),
            job_id: job.id,
        })
    }

    async fn process_batch(
        &self,
        run: &FileRun,
        converter: &Converter,
        batch: Batch,
        summary: &mut RunSummary,
    ) -> ProgressResult<()> {
        let conversion = converter.convert(&batch);
        let mut tx = self.store.begin().await?;
        conversion.record(&mut tx, run.source_id).await?;
        tx.commit().await?;

        let write_failed = self.writer.write(run.source_id, &conversion.destinations).await;

        let failed: HashSet<RowIdentity> = batch
            .rejected
            .iter()
            .cloned()
            .chain(conversion.failed_identities())
            .chain(write_failed)
            .collect();
        let emitted = batch.emitted() as i64;
        let failed_count = failed.len() as i64;
        let processed = emitted - failed_count;

        let mut tx = self.store.begin().await?;
        jobs::add_progress(&mut tx, run.job_id, processed, failed_count).await?;
        sources::increment_counters(&mut tx, run.source_id, processed, failed_count).await?;
        let (level, message) = if failed_count > 0 {
            (
                AuditLevel::Warning,
                format!("Processed batch of {} rows, {} failed", emitted, failed_count),
            )
        } else {
            (AuditLevel::Info, format!("Processed batch of {} rows", emitted))
        };
        logs::append(&mut tx, Some(run.source_id), level, &message).await?;
        tx.commit().await?;

        debug!(
            source_id = run.source_id,
            processed,
            failed = failed_count,
            records = conversion.record_count(),
            "Batch committed"
        );
        summary.rows_written += processed as u64;
        summary.rows_failed += failed_count as u64;
        summary.lossy_values += conversion.lossy_values as u64;
        Ok(())
    }

    async fn finish_file(&self, run: &FileRun) -> ProgressResult<()> {
        let mut tx = self.store.begin().await?;
        let replayable = rows::count_replayable(&mut tx, run.source_id, self.settings.max_row_retries).await?;
        sources::set_has_failed_rows(&mut tx, run.source_id, replayable > 0).await?;
        sources::set_status(&mut tx, run.source_id, SourceStatus::Completed).await?;
        jobs::finish(&mut tx, run.job_id, JobStatus::Completed, None).await?;
        let message = if replayable > 0 {
            format!("Migration completed, {} rows awaiting retry", replayable)
        } else {
            "Migration completed".to_string()
        };
        logs::append(&mut tx, Some(run.source_id), AuditLevel::Info, &message).await?;
        tx.commit().await?;

        info!(source_id = run.source_id, path = %run.path, awaiting_retry = replayable, "Migration completed");
        Ok(())
    }

    /// Record an unrecoverable file error. Ledger errors here are only logged.
    async fn fail_file(&self, source_id: i64, message: &str) {
        error!(source_id, error = message, "Migration failed");
        if let Err(e) = self.try_fail_file(source_id, message).await {
            error!(source_id, error = %e, "Failed to record migration failure");
        }
    }

    async fn try_fail_file(&self, source_id: i64, message: &str) -> ProgressResult<()> {
        let mut tx = self.store.begin().await?;
        sources::set_status(&mut tx, source_id, SourceStatus::Failed).await?;
        sources::set_error(&mut tx, source_id, Some(message)).await?;
        let (job, _) = jobs::current_or_create(&mut tx, source_id).await?;
        jobs::finish(&mut tx, job.id, JobStatus::Failed, Some(message)).await?;
        logs::append(
            &mut tx,
            Some(source_id),
            AuditLevel::Error,
            &format!("Migration failed: {}", message),
        )
        .await?;
        tx.commit().await
    }

    /// Leave source and job open so the next run resumes them.
    async fn interrupt_file(&self, run: &FileRun) {
        warn!(source_id = run.source_id, path = %run.path, "Migration interrupted");
        let result = async {
            let mut tx = self.store.begin().await?;
            logs::append(&mut tx, Some(run.source_id), AuditLevel::Warning, "Migration interrupted")
                .await?;
            tx.commit().await
        }
        .await;
        if let Err(e) = result {
            error!(source_id = run.source_id, error = %e, "Failed to record interruption");
        }
    }
}

fn queue_len(queue: &Mutex<VecDeque<SourceTask>>) -> usize {
    queue.lock().unwrap_or_else(PoisonError::into_inner).len()
}

async fn drain(workers: &mut JoinSet<RunSummary>, summary: &mut RunSummary) {
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(worker_summary) => summary.merge(worker_summary),
            Err(e) if e.is_cancelled() => debug!("Worker aborted"),
            Err(e) => error!(error = %e, "Worker panicked"),
        }
    }
}
