//! Migration attempts against a source.
//!
//! A source has at most one current job: the latest one, while it is still
//! `PENDING` or `IN_PROGRESS`. Once it ends, the next attempt gets a new job.

use super::{JobRecord, JobStatus, ProgressError, ProgressResult};
use chrono::Utc;
use sqlx::SqliteConnection;

const JOB_COLUMNS: &str =
    "id, source_id, status, start_time, end_time, processed_rows, failed_rows, error_message";

pub async fn get(conn: &mut SqliteConnection, id: i64) -> ProgressResult<JobRecord> {
    sqlx::query_as::<_, JobRecord>(&format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| ProgressError::not_found(format!("job {}", id)))
}

pub async fn latest(conn: &mut SqliteConnection, source_id: i64) -> ProgressResult<Option<JobRecord>> {
    let job = sqlx::query_as::<_, JobRecord>(&format!(
        "SELECT {} FROM jobs WHERE source_id = ?1 ORDER BY id DESC LIMIT 1",
        JOB_COLUMNS
    ))
    .bind(source_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(job)
}

pub async fn list_for_source(
    conn: &mut SqliteConnection,
    source_id: i64,
) -> ProgressResult<Vec<JobRecord>> {
    let jobs = sqlx::query_as::<_, JobRecord>(&format!(
        "SELECT {} FROM jobs WHERE source_id = ?1 ORDER BY id",
        JOB_COLUMNS
    ))
    .bind(source_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(jobs)
}

pub async fn create(conn: &mut SqliteConnection, source_id: i64) -> ProgressResult<JobRecord> {
    let job = sqlx::query_as::<_, JobRecord>(&format!(
        "INSERT INTO jobs (source_id, status) VALUES (?1, ?2) RETURNING {}",
        JOB_COLUMNS
    ))
    .bind(source_id)
    .bind(JobStatus::Pending.as_str())
    .fetch_one(&mut *conn)
    .await?;

    Ok(job)
}

/// Reuse the open job for `source_id`, or create one if the latest has ended.
/// The flag is true when a job was created.
pub async fn current_or_create(
    conn: &mut SqliteConnection,
    source_id: i64,
) -> ProgressResult<(JobRecord, bool)> {
    match latest(conn, source_id).await? {
        Some(job) if !job.status.is_terminal() => Ok((job, false)),
        _ => Ok((create(conn, source_id).await?, true)),
    }
}

/// Mark a job `IN_PROGRESS`, keeping the original start time on reuse.
pub async fn start(conn: &mut SqliteConnection, id: i64) -> ProgressResult<()> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET status = ?1, start_time = COALESCE(start_time, ?2)
        WHERE id = ?3
        "#,
    )
    .bind(JobStatus::InProgress.as_str())
    .bind(Utc::now())
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn add_progress(
    conn: &mut SqliteConnection,
    id: i64,
    processed: i64,
    failed: i64,
) -> ProgressResult<()> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET processed_rows = processed_rows + ?1, failed_rows = failed_rows + ?2
        WHERE id = ?3
        "#,
    )
    .bind(processed)
    .bind(failed)
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// End a job with a terminal status.
pub async fn finish(
    conn: &mut SqliteConnection,
    id: i64,
    status: JobStatus,
    error: Option<&str>,
) -> ProgressResult<()> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET status = ?1, end_time = ?2, error_message = ?3
        WHERE id = ?4
        "#,
    )
    .bind(status.as_str())
    .bind(Utc::now())
    .bind(error)
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::progress::{sources, ProgressStore};

    #[tokio::test]
    async fn test_open_job_is_reused_until_it_ends() {
        let store = ProgressStore::in_memory().await.unwrap();
        let mut tx = store.begin().await.unwrap();
        let source = sources::find_or_create(&mut tx, "plant", "data/a.csv").await.unwrap();

        let (first, created) = current_or_create(&mut tx, source.id).await.unwrap();
        assert!(created);
        start(&mut tx, first.id).await.unwrap();

        let (reused, created) = current_or_create(&mut tx, source.id).await.unwrap();
        assert!(!created);
        assert_eq!(reused.id, first.id);
        assert_eq!(reused.status, JobStatus::InProgress);

        finish(&mut tx, first.id, JobStatus::Failed, Some("io error")).await.unwrap();
        let (next, created) = current_or_create(&mut tx, source.id).await.unwrap();
        assert!(created);
        assert_ne!(next.id, first.id);

        let jobs = list_for_source(&mut tx, source.id).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].error_message.as_deref(), Some("io error"));
        assert!(jobs[0].end_time.is_some());
    }

    #[tokio::test]
    async fn test_progress_is_additive() {
        let store = ProgressStore::in_memory().await.unwrap();
        let mut tx = store.begin().await.unwrap();
        let source = sources::find_or_create(&mut tx, "plant", "data/a.csv").await.unwrap();
        let job = create(&mut tx, source.id).await.unwrap();

        add_progress(&mut tx, job.id, 100, 3).await.unwrap();
        add_progress(&mut tx, job.id, 50, 1).await.unwrap();

        let job = get(&mut tx, job.id).await.unwrap();
        assert_eq!((job.processed_rows, job.failed_rows), (150, 4));
    }
}
