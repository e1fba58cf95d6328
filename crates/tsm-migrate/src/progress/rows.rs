//! Per-row progress, keyed by (source id, row identity).
//!
//! Status rules enforced here:
//! - a row reaching `COMPLETED` is never moved back by a read pass;
//! - a bulk `COMPLETED` update leaves rows already `FAILED` untouched;
//! - `retry_count` counts how many times a row has entered `FAILED`.

use super::{ProgressResult, RowProgress, RowStatus};
use chrono::Utc;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};
use std::collections::BTreeSet;
use tsm_common::RowIdentity;

const ROW_COLUMNS: &str =
    "source_id, row_identity, row_number, status, error_message, retry_count, created_at, updated_at";

/// Keeps bulk statements well under SQLite's bind parameter limit.
const BULK_CHUNK: usize = 500;

const REPLAYABLE: &str = "(status IN ('PENDING', 'RETRY', 'PROCESSING') \
     OR (status = 'FAILED' AND retry_count < ?2))";

/// Insert a row the first time it is seen, or move an existing row to
/// `status`.
///
/// Returns the stored status, or `None` when the row was already
/// `COMPLETED` and was left alone.
pub async fn upsert(
    conn: &mut SqliteConnection,
    source_id: i64,
    identity: &RowIdentity,
    row_number: i64,
    status: RowStatus,
    error: Option<&str>,
) -> ProgressResult<Option<RowStatus>> {
    let stored = sqlx::query(
        r#"
        INSERT INTO rows (source_id, row_identity, row_number, status, error_message, retry_count, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, CASE WHEN ?4 = 'FAILED' THEN 1 ELSE 0 END, ?6, ?6)
        ON CONFLICT (source_id, row_identity) DO UPDATE SET
            status = excluded.status,
            error_message = excluded.error_message,
            retry_count = rows.retry_count
                + CASE WHEN excluded.status = 'FAILED' AND rows.status <> 'FAILED' THEN 1 ELSE 0 END,
            updated_at = excluded.updated_at
        WHERE rows.status <> 'COMPLETED'
        RETURNING status
        "#,
    )
    .bind(source_id)
    .bind(identity.as_str())
    .bind(row_number)
    .bind(status.as_str())
    .bind(error)
    .bind(Utc::now())
    .fetch_optional(&mut *conn)
    .await?;

    match stored {
        Some(row) => {
            let status: String = row.try_get("status")?;
            Ok(Some(status.parse()?))
        },
        None => Ok(None),
    }
}

/// Move a single row to `status`. Returns whether the row changed.
pub async fn update_status(
    conn: &mut SqliteConnection,
    source_id: i64,
    identity: &RowIdentity,
    status: RowStatus,
    error: Option<&str>,
) -> ProgressResult<bool> {
    let affected =
        update_statuses(conn, source_id, std::slice::from_ref(identity), status, error).await?;
    Ok(affected > 0)
}

/// Move every listed row to `status` with the same error message.
/// Returns the number of rows changed.
pub async fn update_statuses(
    conn: &mut SqliteConnection,
    source_id: i64,
    identities: &[RowIdentity],
    status: RowStatus,
    error: Option<&str>,
) -> ProgressResult<u64> {
    let retry_bump = match status {
        RowStatus::Failed => "CASE WHEN status <> 'FAILED' THEN 1 ELSE 0 END",
        _ => "0",
    };
    let guard = match status {
        RowStatus::Completed => " AND status <> 'FAILED'",
        _ => "",
    };
    let now = Utc::now();

    let mut affected = 0;
    for chunk in identities.chunks(BULK_CHUNK) {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "UPDATE rows SET status = '{}', retry_count = retry_count + {}, error_message = ",
            status.as_str(),
            retry_bump
        ));
        builder
            .push_bind(error)
            .push(", updated_at = ")
            .push_bind(now)
            .push(" WHERE source_id = ")
            .push_bind(source_id)
            .push(" AND row_identity IN (");

        let mut ids = builder.separated(", ");
        for identity in chunk {
            ids.push_bind(identity.as_str());
        }
        ids.push_unseparated(")");
        builder.push(guard);

        affected += builder.build().execute(&mut *conn).await?.rows_affected();
    }

    Ok(affected)
}

pub async fn get(
    conn: &mut SqliteConnection,
    source_id: i64,
    identity: &RowIdentity,
) -> ProgressResult<Option<RowProgress>> {
    let row = sqlx::query_as::<_, RowProgress>(&format!(
        "SELECT {} FROM rows WHERE source_id = ?1 AND row_identity = ?2",
        ROW_COLUMNS
    ))
    .bind(source_id)
    .bind(identity.as_str())
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row)
}

pub async fn find_by_status(
    conn: &mut SqliteConnection,
    source_id: i64,
    status: RowStatus,
) -> ProgressResult<Vec<RowProgress>> {
    let rows = sqlx::query_as::<_, RowProgress>(&format!(
        "SELECT {} FROM rows WHERE source_id = ?1 AND status = ?2 ORDER BY row_number",
        ROW_COLUMNS
    ))
    .bind(source_id)
    .bind(status.as_str())
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows)
}

/// `FAILED` rows that have entered `FAILED` fewer than `max_retry_count` times.
pub async fn eligible_for_retry(
    conn: &mut SqliteConnection,
    source_id: i64,
    max_retry_count: i64,
) -> ProgressResult<Vec<RowProgress>> {
    let rows = sqlx::query_as::<_, RowProgress>(&format!(
        "SELECT {} FROM rows WHERE source_id = ?1 AND status = 'FAILED' AND retry_count < ?2 \
         ORDER BY row_number",
        ROW_COLUMNS
    ))
    .bind(source_id)
    .bind(max_retry_count)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows)
}

/// Row numbers a replay pass must emit: rows reset or left unfinished
/// (`PENDING`, `RETRY`, `PROCESSING`) plus `FAILED` rows with retry budget left.
pub async fn replayable_row_numbers(
    conn: &mut SqliteConnection,
    source_id: i64,
    max_retry_count: i64,
) -> ProgressResult<BTreeSet<i64>> {
    let numbers: Vec<i64> = sqlx::query_scalar(&format!(
        "SELECT row_number FROM rows WHERE source_id = ?1 AND {}",
        REPLAYABLE
    ))
    .bind(source_id)
    .bind(max_retry_count)
    .fetch_all(&mut *conn)
    .await?;

    Ok(numbers.into_iter().collect())
}

pub async fn count_replayable(
    conn: &mut SqliteConnection,
    source_id: i64,
    max_retry_count: i64,
) -> ProgressResult<i64> {
    let count: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM rows WHERE source_id = ?1 AND {}",
        REPLAYABLE
    ))
    .bind(source_id)
    .bind(max_retry_count)
    .fetch_one(&mut *conn)
    .await?;

    Ok(count)
}

/// Row counts per status for one source, in status order.
pub async fn count_by_status(
    conn: &mut SqliteConnection,
    source_id: i64,
) -> ProgressResult<Vec<(RowStatus, i64)>> {
    let rows = sqlx::query(
        "SELECT status, COUNT(*) AS count FROM rows WHERE source_id = ?1 GROUP BY status ORDER BY status",
    )
    .bind(source_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter()
        .map(|row| -> ProgressResult<(RowStatus, i64)> {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;
            Ok((status.parse()?, count))
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::progress::{sources, ProgressStore, ProgressTx};

    async fn setup() -> (ProgressStore, i64) {
        let store = ProgressStore::in_memory().await.unwrap();
        let mut tx = store.begin().await.unwrap();
        let source = sources::find_or_create(&mut tx, "plant", "data/a.csv").await.unwrap();
        tx.commit().await.unwrap();
        (store, source.id)
    }

    fn id(source_id: i64, row: i64) -> RowIdentity {
        RowIdentity::derive(source_id, "data/a.csv", row)
    }

    async fn set_retry_count(tx: &mut ProgressTx, source_id: i64, row: i64, count: i64) {
        sqlx::query("UPDATE rows SET retry_count = ?1 WHERE source_id = ?2 AND row_identity = ?3")
            .bind(count)
            .bind(source_id)
            .bind(id(source_id, row).into_string())
            .execute(&mut **tx)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_upsert_never_duplicates_or_reopens_completed_rows() {
        let (store, source_id) = setup().await;
        let mut tx = store.begin().await.unwrap();
        let row = id(source_id, 1);

        let stored = upsert(&mut tx, source_id, &row, 1, RowStatus::Pending, None).await.unwrap();
        assert_eq!(stored, Some(RowStatus::Pending));
        let stored = upsert(&mut tx, source_id, &row, 1, RowStatus::Retry, None).await.unwrap();
        assert_eq!(stored, Some(RowStatus::Retry));

        update_status(&mut tx, source_id, &row, RowStatus::Completed, None).await.unwrap();
        let stored = upsert(&mut tx, source_id, &row, 1, RowStatus::Pending, None).await.unwrap();
        assert_eq!(stored, None);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM rows")
            .fetch_one(&mut *tx)
            .await
            .unwrap();
        assert_eq!(count, 1);
        let progress = get(&mut tx, source_id, &row).await.unwrap().unwrap();
        assert_eq!(progress.status, RowStatus::Completed);
    }

    #[tokio::test]
    async fn test_retry_count_counts_entries_into_failed() {
        let (store, source_id) = setup().await;
        let mut tx = store.begin().await.unwrap();
        let row = id(source_id, 3);

        upsert(&mut tx, source_id, &row, 3, RowStatus::Failed, Some("bad")).await.unwrap();
        // Failing an already failed row does not count twice.
        update_status(&mut tx, source_id, &row, RowStatus::Failed, Some("bad")).await.unwrap();
        update_status(&mut tx, source_id, &row, RowStatus::Pending, None).await.unwrap();
        update_status(&mut tx, source_id, &row, RowStatus::Failed, Some("again")).await.unwrap();

        let progress = get(&mut tx, source_id, &row).await.unwrap().unwrap();
        assert_eq!(progress.retry_count, 2);
        assert_eq!(progress.error_message.as_deref(), Some("again"));
    }

    #[tokio::test]
    async fn test_bulk_completion_keeps_failed_rows() {
        let (store, source_id) = setup().await;
        let mut tx = store.begin().await.unwrap();
        let ids: Vec<_> = (1..=4).map(|n| id(source_id, n)).collect();
        for (n, row) in ids.iter().enumerate() {
            upsert(&mut tx, source_id, row, n as i64 + 1, RowStatus::Processing, None)
                .await
                .unwrap();
        }
        update_status(&mut tx, source_id, &ids[1], RowStatus::Failed, Some("no zone"))
            .await
            .unwrap();

        let changed = update_statuses(&mut tx, source_id, &ids, RowStatus::Completed, None)
            .await
            .unwrap();

        assert_eq!(changed, 3);
        assert_eq!(find_by_status(&mut tx, source_id, RowStatus::Failed).await.unwrap().len(), 1);
        let counts = count_by_status(&mut tx, source_id).await.unwrap();
        assert_eq!(counts, vec![(RowStatus::Completed, 3), (RowStatus::Failed, 1)]);
    }

    #[tokio::test]
    async fn test_bulk_update_spans_chunks() {
        let (store, source_id) = setup().await;
        let mut tx = store.begin().await.unwrap();
        let ids: Vec<_> = (1..=1200).map(|n| id(source_id, n)).collect();
        for (n, row) in ids.iter().enumerate() {
            upsert(&mut tx, source_id, row, n as i64 + 1, RowStatus::Pending, None)
                .await
                .unwrap();
        }

        let changed = update_statuses(&mut tx, source_id, &ids, RowStatus::Failed, Some("max retries reached"))
            .await
            .unwrap();
        assert_eq!(changed, 1200);
    }

    #[tokio::test]
    async fn test_retry_eligibility_respects_budget() {
        let (store, source_id) = setup().await;
        let mut tx = store.begin().await.unwrap();
        for n in [1, 2] {
            upsert(&mut tx, source_id, &id(source_id, n), n, RowStatus::Failed, Some("x"))
                .await
                .unwrap();
        }
        upsert(&mut tx, source_id, &id(source_id, 3), 3, RowStatus::Pending, None).await.unwrap();
        upsert(&mut tx, source_id, &id(source_id, 4), 4, RowStatus::Completed, None).await.unwrap();
        set_retry_count(&mut tx, source_id, 1, 2).await;
        set_retry_count(&mut tx, source_id, 2, 3).await;

        let eligible = eligible_for_retry(&mut tx, source_id, 3).await.unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].row_number, 1);

        let replay = replayable_row_numbers(&mut tx, source_id, 3).await.unwrap();
        assert_eq!(replay.into_iter().collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(count_replayable(&mut tx, source_id, 3).await.unwrap(), 2);
    }
}
