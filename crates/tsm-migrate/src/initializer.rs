//! Startup reconciliation of configured files with the ledger.

use crate::config::MigrationConfig;
use crate::orchestrator::SourceTask;
use crate::progress::{jobs, logs, rows, sources, AuditLevel, ProgressResult, ProgressStore, SourceStatus};
use crate::reader::FileTarget;
use std::sync::Arc;
use tracing::{debug, info};

pub struct MigrationInitializer {
    store: ProgressStore,
    max_retry_count: i64,
}

impl MigrationInitializer {
    pub fn new(store: ProgressStore, max_retry_count: i64) -> Self {
        Self {
            store,
            max_retry_count,
        }
    }

    /// Register every configured file and decide which ones need work.
    ///
    /// Files that already completed with nothing left to replay are skipped;
    /// sources without any remaining file produce no task.
    pub async fn initialize(&self, config: &MigrationConfig) -> ProgressResult<Vec<SourceTask>> {
        let mut tasks = Vec::new();
        for settings in &config.sources {
            let settings = Arc::new(settings.clone());
            let mut files = Vec::new();
            for path in &settings.file_paths {
                if let Some(target) = self.prepare_file(&settings.name, &path.to_string_lossy()).await? {
                    files.push(FileTarget {
                        source_id: target,
                        path: path.clone(),
                    });
                }
            }
            if files.is_empty() {
                info!(source = %settings.name, "Nothing to migrate");
                continue;
            }
            tasks.push(SourceTask { settings, files });
        }

        info!(
            sources = tasks.len(),
            files = tasks.iter().map(|t| t.files.len()).sum::<usize>(),
            "Migration initialized"
        );
        Ok(tasks)
    }

    /// Returns the source id when the file needs a pass.
    async fn prepare_file(&self, source_name: &str, path: &str) -> ProgressResult<Option<i64>> {
        let mut tx = self.store.begin().await?;
        let source = sources::find_or_create(&mut tx, source_name, path).await?;
        let replayable = rows::count_replayable(&mut tx, source.id, self.max_retry_count).await?;

        if source.status == SourceStatus::Completed && replayable == 0 {
            sources::set_has_failed_rows(&mut tx, source.id, false).await?;
            tx.commit().await?;
            info!(source_id = source.id, path, "Source already completed, skipping");
            return Ok(None);
        }

        let terminal = matches!(source.status, SourceStatus::Completed | SourceStatus::Failed);
        if terminal && replayable > 0 {
            sources::set_status(&mut tx, source.id, SourceStatus::Pending).await?;
            sources::set_has_failed_rows(&mut tx, source.id, true).await?;
            logs::append(
                &mut tx,
                Some(source.id),
                AuditLevel::Info,
                &format!("Source reset to PENDING, {} rows to replay", replayable),
            )
            .await?;
            info!(source_id = source.id, path, rows = replayable, "Source queued for replay");
        } else {
            sources::set_has_failed_rows(&mut tx, source.id, false).await?;
            debug!(source_id = source.id, path, status = %source.status, "Source queued");
        }

        match jobs::latest(&mut tx, source.id).await? {
            Some(job) if !job.status.is_terminal() => {
                logs::append(
                    &mut tx,
                    Some(source.id),
                    AuditLevel::Info,
                    &format!("Resuming job {}", job.id),
                )
                .await?;
            },
            _ => {
                let job = jobs::create(&mut tx, source.id).await?;
                logs::append(
                    &mut tx,
                    Some(source.id),
                    AuditLevel::Info,
                    &format!("Created job {}", job.id),
                )
                .await?;
            },
        }

        tx.commit().await?;
        Ok(Some(source.id))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::{ClientSettings, MigrationSettings, ProgressStoreSettings, SourceSettings};
    use crate::progress::{JobStatus, RowStatus};
    use std::path::PathBuf;
    use tsm_common::RowIdentity;

    fn config(paths: &[&str]) -> MigrationConfig {
        MigrationConfig {
            sources: vec![SourceSettings {
                name: "plant".to_string(),
                file_paths: paths.iter().map(PathBuf::from).collect(),
                columns: Vec::new(),
                delimiter: ',',
                quote: '"',
            }],
            destinations: Vec::new(),
            migration: MigrationSettings::default(),
            client: ClientSettings::default(),
            progress_store: ProgressStoreSettings::default(),
        }
    }

    #[tokio::test]
    async fn test_new_files_get_a_job() {
        let store = ProgressStore::in_memory().await.unwrap();
        let initializer = MigrationInitializer::new(store.clone(), 3);

        let tasks = initializer.initialize(&config(&["/data/a.csv", "/data/b.csv"])).await.unwrap();

        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].files.len(), 2);
        let mut conn = store.acquire().await.unwrap();
        let job = jobs::latest(&mut conn, tasks[0].files[0].source_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_completed_source_is_skipped_unless_rows_need_replay() {
        let store = ProgressStore::in_memory().await.unwrap();
        let initializer = MigrationInitializer::new(store.clone(), 3);
        let cfg = config(&["/data/a.csv", "/data/b.csv"]);
        let first = initializer.initialize(&cfg).await.unwrap();
        let (a, b) = (first[0].files[0].source_id, first[0].files[1].source_id);

        let mut tx = store.begin().await.unwrap();
        for id in [a, b] {
            sources::set_status(&mut tx, id, SourceStatus::Completed).await.unwrap();
            let job = jobs::latest(&mut tx, id).await.unwrap().unwrap();
            jobs::finish(&mut tx, job.id, JobStatus::Completed, None).await.unwrap();
        }
        let row = RowIdentity::derive(b, "/data/b.csv", 4);
        rows::upsert(&mut tx, b, &row, 4, RowStatus::Failed, Some("boom")).await.unwrap();
        tx.commit().await.unwrap();

        let second = initializer.initialize(&cfg).await.unwrap();

        assert_eq!(second[0].files.len(), 1);
        assert_eq!(second[0].files[0].source_id, b);
        let mut conn = store.acquire().await.unwrap();
        let source = sources::get(&mut conn, b).await.unwrap();
        assert_eq!(source.status, SourceStatus::Pending);
        assert!(source.has_failed_rows);
        assert_eq!(jobs::list_for_source(&mut conn, b).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_open_job_is_reused() {
        let store = ProgressStore::in_memory().await.unwrap();
        let initializer = MigrationInitializer::new(store.clone(), 3);
        let cfg = config(&["/data/a.csv"]);

        let first = initializer.initialize(&cfg).await.unwrap();
        let id = first[0].files[0].source_id;
        initializer.initialize(&cfg).await.unwrap();

        let mut conn = store.acquire().await.unwrap();
        assert_eq!(jobs::list_for_source(&mut conn, id).await.unwrap().len(), 1);
        let entries = logs::recent(&mut conn, Some(id), 1).await.unwrap();
        assert!(entries[0].message.starts_with("Resuming job"));
    }
}
