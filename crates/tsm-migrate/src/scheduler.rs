//! Background retry scheduler
//!
//! Periodically moves `FAILED` rows that still have retry budget back to
//! `PENDING`, so the next reader pass over their file replays them. It never
//! talks to the destination.

use crate::progress::{logs, rows, sources, AuditLevel, ProgressResult, ProgressStore, RowStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tsm_common::RowIdentity;

pub struct RetryScheduler {
    store: ProgressStore,
    max_retry_count: i64,
    interval: Duration,
}

impl RetryScheduler {
    pub fn new(store: ProgressStore, max_retry_count: i64, interval: Duration) -> Self {
        Self {
            store,
            max_retry_count,
            interval,
        }
    }

    /// Reset every eligible row of every source. Returns the number of rows reset.
    pub async fn sweep(&self) -> ProgressResult<u64> {
        let source_ids: Vec<i64> = {
            let mut conn = self.store.acquire().await?;
            sources::list(&mut conn).await?.into_iter().map(|s| s.id).collect()
        };

        let mut total = 0;
        for source_id in source_ids {
            total += self.sweep_source(source_id).await?;
        }
        if total > 0 {
            info!(rows = total, "Rows reset for retry");
        }
        Ok(total)
    }

    async fn sweep_source(&self, source_id: i64) -> ProgressResult<u64> {
        let mut tx = self.store.begin().await?;
        let eligible = rows::eligible_for_retry(&mut tx, source_id, self.max_retry_count).await?;
        if eligible.is_empty() {
            return Ok(0);
        }

        let identities: Vec<RowIdentity> = eligible
            .into_iter()
            .map(|row| RowIdentity::from_token(row.row_identity))
            .collect();
        let reset = rows::update_statuses(
            &mut tx,
            source_id,
            &identities,
            RowStatus::Pending,
            None,
        )
        .await?;
        sources::set_has_failed_rows(&mut tx, source_id, true).await?;
        logs::append(
            &mut tx,
            Some(source_id),
            AuditLevel::Info,
            &format!("Reset {} failed rows for retry", reset),
        )
        .await?;
        tx.commit().await?;

        debug!(source_id, rows = reset, "Source swept");
        Ok(reset)
    }

    /// Sweep on every interval tick until `token` is cancelled.
    pub async fn run(&self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately.
        ticker.tick().await;

        info!(interval_secs = self.interval.as_secs(), "Retry scheduler started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Retry sweep failed");
                    }
                },
            }
        }
        info!("Retry scheduler stopped");
    }

    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(token).await })
    }
}
