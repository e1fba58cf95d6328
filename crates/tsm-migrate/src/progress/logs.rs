//! Append-only audit trail. `source_id` is `None` for process-level events.

use super::{AuditEntry, AuditLevel, ProgressResult};
use chrono::Utc;
use sqlx::SqliteConnection;

pub async fn append(
    conn: &mut SqliteConnection,
    source_id: Option<i64>,
    level: AuditLevel,
    message: &str,
) -> ProgressResult<()> {
    sqlx::query(
        "INSERT INTO migration_logs (source_id, timestamp, level, message) VALUES (?1, ?2, ?3, ?4)",
    )
    .bind(source_id)
    .bind(Utc::now())
    .bind(level.as_str())
    .bind(message)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Most recent entries first. With `source_id = None`, entries of every
/// source are returned.
pub async fn recent(
    conn: &mut SqliteConnection,
    source_id: Option<i64>,
    limit: i64,
) -> ProgressResult<Vec<AuditEntry>> {
    let entries = sqlx::query_as::<_, AuditEntry>(
        r#"
        SELECT id, source_id, timestamp, level, message
        FROM migration_logs
        WHERE ?1 IS NULL OR source_id = ?1
        ORDER BY id DESC
        LIMIT ?2
        "#,
    )
    .bind(source_id)
    .bind(limit)
    .fetch_all(&mut *conn)
    .await?;

    Ok(entries)
}
