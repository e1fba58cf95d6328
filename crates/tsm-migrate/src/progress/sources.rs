//! Source file records.

use super::{ProgressError, ProgressResult, SourceRecord, SourceStatus};
use chrono::Utc;
use sqlx::SqliteConnection;

const SOURCE_COLUMNS: &str = "id, path, source_name, status, total_rows, processed_rows, \
     failed_rows, last_processed_at, error_message, has_failed_rows";

pub async fn find_by_path(
    conn: &mut SqliteConnection,
    path: &str,
) -> ProgressResult<Option<SourceRecord>> {
    let record = sqlx::query_as::<_, SourceRecord>(&format!(
        "SELECT {} FROM sources WHERE path = ?1",
        SOURCE_COLUMNS
    ))
    .bind(path)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(record)
}

/// Fetch a source by id.
///
/// # Errors
///
/// Returns `ProgressError::NotFound` if no such source exists.
pub async fn get(conn: &mut SqliteConnection, id: i64) -> ProgressResult<SourceRecord> {
    sqlx::query_as::<_, SourceRecord>(&format!("SELECT {} FROM sources WHERE id = ?1", SOURCE_COLUMNS))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| ProgressError::not_found(format!("source {}", id)))
}

pub async fn list(conn: &mut SqliteConnection) -> ProgressResult<Vec<SourceRecord>> {
    let records =
        sqlx::query_as::<_, SourceRecord>(&format!("SELECT {} FROM sources ORDER BY id", SOURCE_COLUMNS))
            .fetch_all(&mut *conn)
            .await?;

    Ok(records)
}

/// Find the source tracking `path`, creating it in `PENDING` if it is new.
pub async fn find_or_create(
    conn: &mut SqliteConnection,
    source_name: &str,
    path: &str,
) -> ProgressResult<SourceRecord> {
    sqlx::query(
        r#"
        INSERT INTO sources (path, source_name, status, created_at)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT (path) DO NOTHING
        "#,
    )
    .bind(path)
    .bind(source_name)
    .bind(SourceStatus::Pending.as_str())
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    find_by_path(conn, path)
        .await?
        .ok_or_else(|| ProgressError::not_found(format!("source for {}", path)))
}

pub async fn set_status(
    conn: &mut SqliteConnection,
    id: i64,
    status: SourceStatus,
) -> ProgressResult<()> {
    sqlx::query("UPDATE sources SET status = ?1 WHERE id = ?2")
        .bind(status.as_str())
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Set or clear the last error.
pub async fn set_error(
    conn: &mut SqliteConnection,
    id: i64,
    error: Option<&str>,
) -> ProgressResult<()> {
    sqlx::query("UPDATE sources SET error_message = ?1 WHERE id = ?2")
        .bind(error)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Add to the processed/failed counters and stamp `last_processed_at`.
pub async fn increment_counters(
    conn: &mut SqliteConnection,
    id: i64,
    processed: i64,
    failed: i64,
) -> ProgressResult<()> {
    sqlx::query(
        r#"
        UPDATE sources
        SET processed_rows = processed_rows + ?1,
            failed_rows = failed_rows + ?2,
            last_processed_at = ?3
        WHERE id = ?4
        "#,
    )
    .bind(processed)
    .bind(failed)
    .bind(Utc::now())
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn set_total_rows(conn: &mut SqliteConnection, id: i64, total: i64) -> ProgressResult<()> {
    sqlx::query("UPDATE sources SET total_rows = ?1 WHERE id = ?2")
        .bind(total)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn set_has_failed_rows(
    conn: &mut SqliteConnection,
    id: i64,
    has_failed_rows: bool,
) -> ProgressResult<()> {
    sqlx::query("UPDATE sources SET has_failed_rows = ?1 WHERE id = ?2")
        .bind(has_failed_rows)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}
