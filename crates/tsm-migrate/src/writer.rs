//! Destination writer
//!
//! Builds one tablet per resolved path and delivers it with bounded retry.
//! Row transitions for a tablet are committed only once its delivery is
//! settled: `COMPLETED` on success, `FAILED` when the retry budget runs out
//! or the destination schema does not match.

use crate::client::{SessionPool, Tablet, TabletColumn};
use crate::config::ClientSettings;
use crate::converter::DestinationBatch;
use crate::progress::{logs, rows, AuditLevel, ProgressResult, ProgressStore, RowStatus};
use crate::schema::{SchemaError, SchemaReconciler};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use tsm_common::RowIdentity;

pub const MAX_RETRIES_REACHED: &str = "max retries reached";

/// Bounded exponential backoff for destination writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_interval: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_interval: Duration::from_millis(settings.retry_interval_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
        }
    }

    /// Delay before retry number `attempt + 1`: `base * 2^attempt`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_interval.checked_mul(factor))
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }
}

/// Why a tablet could not be delivered.
enum Undelivered {
    Exhausted,
    Rejected(String),
}

pub struct Writer {
    pool: Arc<SessionPool>,
    schema: Arc<SchemaReconciler>,
    store: ProgressStore,
    policy: RetryPolicy,
}

impl Writer {
    pub fn new(
        pool: Arc<SessionPool>,
        schema: Arc<SchemaReconciler>,
        store: ProgressStore,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            pool,
            schema,
            store,
            policy,
        }
    }

    /// Deliver every destination batch and record the outcome per row.
    /// Returns the identities that ended up failed, without duplicates.
    pub async fn write(
        &self,
        source_id: i64,
        destinations: &BTreeMap<String, DestinationBatch>,
    ) -> Vec<RowIdentity> {
        let mut failed = Vec::new();
        let mut seen = HashSet::new();

        for (path, batch) in destinations {
            let identities: Vec<RowIdentity> =
                batch.records.iter().map(|r| r.identity.clone()).collect();

            match self.deliver(path, batch).await {
                Ok(points) => {
                    debug!(source_id, path = %path, rows = identities.len(), points, "Tablet written");
                    self.settle(source_id, &identities, RowStatus::Completed, None, None)
                        .await;
                },
                Err(Undelivered::Exhausted) => {
                    error!(
                        source_id,
                        path = %path,
                        rows = identities.len(),
                        attempts = self.policy.max_retries + 1,
                        "Write failed, retries exhausted"
                    );
                    self.settle(
                        source_id,
                        &identities,
                        RowStatus::Failed,
                        Some(MAX_RETRIES_REACHED),
                        None,
                    )
                    .await;
                    failed.extend(identities.into_iter().filter(|id| seen.insert(id.clone())));
                },
                Err(Undelivered::Rejected(reason)) => {
                    error!(source_id, path = %path, error = %reason, "Write rejected");
                    let audit = format!("Write to {} rejected: {}", path, reason);
                    self.settle(
                        source_id,
                        &identities,
                        RowStatus::Failed,
                        Some(&reason),
                        Some(&audit),
                    )
                    .await;
                    failed.extend(identities.into_iter().filter(|id| seen.insert(id.clone())));
                },
            }
        }

        failed
    }

    /// Attempt delivery up to `max_retries + 1` times. Returns the number of
    /// points written.
    async fn deliver(&self, path: &str, batch: &DestinationBatch) -> Result<usize, Undelivered> {
        let tablet = build_tablet(path, batch);
        if tablet.is_empty() {
            return Ok(0);
        }
        let points = tablet
            .columns
            .iter()
            .map(|c| c.values.iter().filter(|v| v.is_some()).count())
            .sum();

        let mut attempt = 0;
        loop {
            let err = match self.attempt(path, batch, &tablet).await {
                Ok(()) => return Ok(points),
                Err(err) => err,
            };

            if !err.is_retryable() {
                return Err(Undelivered::Rejected(err.to_string()));
            }
            if attempt >= self.policy.max_retries {
                return Err(Undelivered::Exhausted);
            }

            let delay = self.policy.backoff(attempt);
            warn!(
                path,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Write attempt failed, backing off"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn attempt(&self, path: &str, batch: &DestinationBatch, tablet: &Tablet) -> Result<(), SchemaError> {
        self.schema.ensure_device(path, &batch.device).await?;
        let session = self.pool.acquire().await?;
        session
            .insert_tablet(tablet, batch.device.aligned)
            .await
            .map_err(SchemaError::from)
    }

    /// Commit a tablet's row transitions. Ledger errors are logged, never raised.
    async fn settle(
        &self,
        source_id: i64,
        identities: &[RowIdentity],
        status: RowStatus,
        error: Option<&str>,
        audit: Option<&str>,
    ) {
        if let Err(e) = self.try_settle(source_id, identities, status, error, audit).await {
            error!(source_id, status = %status, error = %e, "Failed to record write outcome");
        }
    }

    async fn try_settle(
        &self,
        source_id: i64,
        identities: &[RowIdentity],
        status: RowStatus,
        error: Option<&str>,
        audit: Option<&str>,
    ) -> ProgressResult<()> {
        let mut tx = self.store.begin().await?;
        rows::update_statuses(&mut tx, source_id, identities, status, error).await?;
        if let Some(message) = audit {
            logs::append(&mut tx, Some(source_id), AuditLevel::Error, message).await?;
        }
        tx.commit().await
    }
}

/// Lay records out column-major, ordered by event time. Only measurements
/// with at least one value get a column.
pub fn build_tablet(path: &str, batch: &DestinationBatch) -> Tablet {
    let mut records: Vec<_> = batch.records.iter().collect();
    records.sort_by_key(|r| r.event_time);

    let columns: Vec<TabletColumn> = batch
        .device
        .measurements
        .iter()
        .filter_map(|measurement| {
            let values: Vec<_> = records
                .iter()
                .map(|r| r.fields.get(&measurement.name).cloned())
                .collect();
            let nulls = values.iter().filter(|v| v.is_none()).count();
            if nulls == values.len() {
                return None;
            }
            if nulls > 0 {
                debug!(path, measurement = %measurement.name, nulls, "Skipping null values");
            }
            Some(TabletColumn {
                measurement: measurement.name.clone(),
                data_type: measurement.data_type,
                values,
            })
        })
        .collect();

    Tablet {
        device: path.to_string(),
        timestamps: records.iter().map(|r| r.event_time).collect(),
        columns,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::client::{ClientError, MemoryBackend, SeriesSession};
    use crate::config::{DeviceSettings, MeasurementSettings};
    use crate::converter::RowRecord;
    use crate::progress::sources;
    use crate::types::{Compression, Encoding, SeriesSchema, SeriesType, SeriesValue};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_interval: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
        };
        let delays: Vec<_> = (0..5).map(|a| policy.backoff(a).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000]);
        assert_eq!(policy.backoff(40), Duration::from_millis(1000));
    }

    /// Fails the first `failures` inserts, then delegates to memory.
    struct FlakySession {
        inner: crate::client::MemorySession,
        failures: usize,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SeriesSession for FlakySession {
        fn endpoint(&self) -> &str {
            "flaky"
        }

        async fn ping(&self) -> Result<(), ClientError> {
            Ok(())
        }

        async fn series_schema(&self, series: &str) -> Result<Option<SeriesSchema>, ClientError> {
            self.inner.series_schema(series).await
        }

        async fn create_series(&self, series: &str, schema: &SeriesSchema) -> Result<(), ClientError> {
            self.inner.create_series(series, schema).await
        }

        async fn create_aligned_series(
            &self,
            device: &str,
            measurements: &[(String, SeriesSchema)],
        ) -> Result<(), ClientError> {
            self.inner.create_aligned_series(device, measurements).await
        }

        async fn insert_tablet(&self, tablet: &Tablet, aligned: bool) -> Result<(), ClientError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(ClientError::Connection("connection reset".to_string()));
            }
            self.inner.insert_tablet(tablet, aligned).await
        }
    }

    fn device() -> Arc<DeviceSettings> {
        Arc::new(DeviceSettings {
            device_id: "root.plant".to_string(),
            path_column: Some("zone".to_string()),
            aligned: false,
            source: None,
            measurements: vec![
                MeasurementSettings {
                    name: "temperature".to_string(),
                    join_key: "temp".to_string(),
                    data_type: SeriesType::Double,
                    encoding: None,
                    compression: Compression::Snappy,
                },
                MeasurementSettings {
                    name: "humidity".to_string(),
                    join_key: "hum".to_string(),
                    data_type: SeriesType::Double,
                    encoding: None,
                    compression: Compression::Snappy,
                },
            ],
        })
    }

    fn record(source_id: i64, n: i64, temperature: Option<f64>) -> RowRecord {
        RowRecord {
            identity: RowIdentity::derive(source_id, "data/plant.csv", n),
            row_number: n,
            event_time: 10_000 - n,
            path: "root.plant.A1".to_string(),
            fields: temperature
                .map(|t| ("temperature".to_string(), SeriesValue::Double(t)))
                .into_iter()
                .collect(),
        }
    }

    struct Fixture {
        store: ProgressStore,
        backend: MemoryBackend,
        calls: Arc<AtomicUsize>,
        writer: Writer,
        source_id: i64,
        destinations: BTreeMap<String, DestinationBatch>,
    }

    async fn fixture(failures: usize, max_retries: u32) -> Fixture {
        let store = ProgressStore::in_memory().await.unwrap();
        let mut tx = store.begin().await.unwrap();
        let source_id = sources::find_or_create(&mut tx, "plant", "data/plant.csv").await.unwrap().id;
        let records: Vec<RowRecord> = (1..=3)
            .map(|n| record(source_id, n, (n != 2).then_some(n as f64)))
            .collect();
        for r in &records {
            rows::upsert(&mut tx, source_id, &r.identity, r.row_number, RowStatus::Processing, None)
                .await
                .unwrap();
        }
        tx.commit().await.unwrap();

        let backend = MemoryBackend::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let session: Arc<dyn SeriesSession> = Arc::new(FlakySession {
            inner: backend.session("memory"),
            failures,
            calls: calls.clone(),
        });
        let pool = Arc::new(SessionPool::new(vec![session]));
        let schema = Arc::new(SchemaReconciler::new(pool.clone()));
        let policy = RetryPolicy {
            max_retries,
            base_interval: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        };

        let mut destinations = BTreeMap::new();
        destinations.insert(
            "root.plant.A1".to_string(),
            DestinationBatch {
                device: device(),
                records,
            },
        );

        Fixture {
            writer: Writer::new(pool, schema, store.clone(), policy),
            store,
            backend,
            calls,
            source_id,
            destinations,
        }
    }

    async fn statuses(f: &Fixture) -> Vec<(RowStatus, Option<String>)> {
        let mut conn = f.store.acquire().await.unwrap();
        let mut out = Vec::new();
        for n in 1..=3 {
            let id = RowIdentity::derive(f.source_id, "data/plant.csv", n);
            let row = rows::get(&mut conn, f.source_id, &id).await.unwrap().unwrap();
            out.push((row.status, row.error_message));
        }
        out
    }

    #[test]
    fn test_tablet_is_time_ordered_and_drops_empty_columns() {
        let batch = DestinationBatch {
            device: device(),
            records: (1..=3).map(|n| record(1, n, (n != 2).then_some(n as f64))).collect(),
        };

        let tablet = build_tablet("root.plant.A1", &batch);

        assert_eq!(tablet.timestamps, vec![9_997, 9_998, 9_999]);
        assert_eq!(tablet.columns.len(), 1);
        assert_eq!(
            tablet.columns[0].values,
            vec![Some(SeriesValue::Double(3.0)), None, Some(SeriesValue::Double(1.0))]
        );
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let f = fixture(2, 3).await;

        let failed = f.writer.write(f.source_id, &f.destinations).await;

        assert!(failed.is_empty());
        assert_eq!(f.calls.load(Ordering::SeqCst), 3);
        assert_eq!(f.backend.points("root.plant.A1.temperature").len(), 2);
        assert!(statuses(&f).await.iter().all(|(s, _)| *s == RowStatus::Completed));
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_every_row() {
        let f = fixture(usize::MAX, 3).await;

        let failed = f.writer.write(f.source_id, &f.destinations).await;

        assert_eq!(failed.len(), 3);
        assert_eq!(f.calls.load(Ordering::SeqCst), 4);
        for (status, error) in statuses(&f).await {
            assert_eq!(status, RowStatus::Failed);
            assert_eq!(error.as_deref(), Some(MAX_RETRIES_REACHED));
        }
    }

    #[tokio::test]
    async fn test_schema_mismatch_is_not_retried() {
        let f = fixture(0, 3).await;
        f.backend.define_series(
            "root.plant.A1.temperature",
            SeriesSchema {
                data_type: SeriesType::Float,
                encoding: Encoding::Rle,
                compression: Compression::Snappy,
            },
        );

        let failed = f.writer.write(f.source_id, &f.destinations).await;

        assert_eq!(failed.len(), 3);
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
        let (status, error) = &statuses(&f).await[0];
        assert_eq!(*status, RowStatus::Failed);
        assert!(error.as_deref().unwrap().contains("root.plant.A1.temperature"));

        let mut conn = f.store.acquire().await.unwrap();
        let audit = logs::recent(&mut conn, Some(f.source_id), 5).await.unwrap();
        assert_eq!(audit[0].level, AuditLevel::Error);
    }

    #[tokio::test]
    async fn test_completion_keeps_rows_failed_elsewhere() {
        let f = fixture(0, 0).await;
        let failed_elsewhere = RowIdentity::derive(f.source_id, "data/plant.csv", 1);
        let mut tx = f.store.begin().await.unwrap();
        rows::update_status(&mut tx, f.source_id, &failed_elsewhere, RowStatus::Failed, Some("no zone"))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        f.writer.write(f.source_id, &f.destinations).await;

        let statuses = statuses(&f).await;
        assert_eq!(statuses[0], (RowStatus::Failed, Some("no zone".to_string())));
        assert_eq!(statuses[1].0, RowStatus::Completed);
    }
}
