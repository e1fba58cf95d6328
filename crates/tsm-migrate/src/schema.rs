//! Destination schema reconciliation
//!
//! Makes sure every series a device writes exists with the configured type,
//! encoding and compression before data is sent. Each concrete series is
//! checked at most once per process. A series that exists with a different
//! schema is poisoned: every later check fails with the same mismatch
//! without asking the store again.

use crate::client::{ClientError, SessionPool};
use crate::config::{DeviceSettings, MeasurementSettings};
use crate::types::SeriesSchema;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Series {series} exists as {actual}, configured as {expected}")]
    Mismatch {
        series: String,
        expected: SeriesSchema,
        actual: SeriesSchema,
    },

    #[error("Schema check failed: {0}")]
    Client(#[from] ClientError),
}

impl SchemaError {
    /// Mismatches and non-retryable client failures will not heal on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            SchemaError::Mismatch { .. } => false,
            SchemaError::Client(err) => err.is_retryable(),
        }
    }
}

pub struct SchemaReconciler {
    pool: Arc<SessionPool>,
    /// Held across a whole check so two workers never race to create one series.
    verified: tokio::sync::Mutex<HashSet<String>>,
    poisoned: Mutex<HashMap<String, (SeriesSchema, SeriesSchema)>>,
}

impl SchemaReconciler {
    pub fn new(pool: Arc<SessionPool>) -> Self {
        Self {
            pool,
            verified: tokio::sync::Mutex::new(HashSet::new()),
            poisoned: Mutex::new(HashMap::new()),
        }
    }

    /// Ensure one series exists with `expected`.
    pub async fn ensure(&self, series: &str, expected: &SeriesSchema) -> Result<(), SchemaError> {
        let mut verified = self.verified.lock().await;
        if verified.contains(series) {
            return Ok(());
        }
        self.check_poisoned(series)?;

        let session = self.pool.acquire().await?;
        match session.series_schema(series).await? {
            Some(actual) => self.compare(series, expected, actual)?,
            None => {
                session.create_series(series, expected).await?;
                info!(series, schema = %expected, "Created series");
            },
        }
        verified.insert(series.to_string());
        Ok(())
    }

    /// Ensure every measurement of `device` exists under `path`. Missing
    /// measurements of an aligned device are created in one statement.
    pub async fn ensure_device(&self, path: &str, device: &DeviceSettings) -> Result<(), SchemaError> {
        let mut verified = self.verified.lock().await;

        let pending: Vec<(String, &MeasurementSettings)> = device
            .measurements
            .iter()
            .map(|m| (format!("{}.{}", path, m.name), m))
            .filter(|(series, _)| !verified.contains(series))
            .collect();
        if pending.is_empty() {
            return Ok(());
        }
        for (series, _) in &pending {
            self.check_poisoned(series)?;
        }

        let session = self.pool.acquire().await?;
        let mut missing = Vec::new();
        for (series, measurement) in &pending {
            let expected = measurement.schema();
            match session.series_schema(series).await? {
                Some(actual) => {
                    self.compare(series, &expected, actual)?;
                    verified.insert(series.clone());
                },
                None => missing.push((measurement.name.clone(), expected)),
            }
        }
        if missing.is_empty() {
            return Ok(());
        }

        if device.aligned {
            session.create_aligned_series(path, &missing).await?;
        } else {
            for (name, schema) in &missing {
                session.create_series(&format!("{}.{}", path, name), schema).await?;
            }
        }
        info!(
            device = path,
            aligned = device.aligned,
            created = missing.len(),
            "Created series"
        );
        verified.extend(missing.iter().map(|(name, _)| format!("{}.{}", path, name)));
        Ok(())
    }

    /// Reconcile every device whose path does not depend on row data.
    /// Returns how many devices were checked.
    pub async fn prevalidate<'a>(
        &self,
        devices: impl IntoIterator<Item = &'a DeviceSettings>,
    ) -> Result<usize, SchemaError> {
        let mut checked = 0;
        for device in devices.into_iter().filter(|d| d.path_column.is_none()) {
            self.ensure_device(&device.device_id, device).await?;
            checked += 1;
        }
        info!(devices = checked, "Destination schema pre-validated");
        Ok(checked)
    }

    pub fn is_poisoned(&self, series: &str) -> bool {
        self.poisoned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(series)
    }

    fn check_poisoned(&self, series: &str) -> Result<(), SchemaError> {
        match self
            .poisoned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(series)
        {
            Some((expected, actual)) => Err(SchemaError::Mismatch {
                series: series.to_string(),
                expected: *expected,
                actual: *actual,
            }),
            None => Ok(()),
        }
    }

    fn compare(
        &self,
        series: &str,
        expected: &SeriesSchema,
        actual: SeriesSchema,
    ) -> Result<(), SchemaError> {
        if actual == *expected {
            return Ok(());
        }
        error!(series, expected = %expected, actual = %actual, "Series schema mismatch");
        self.poisoned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(series.to_string(), (*expected, actual));
        Err(SchemaError::Mismatch {
            series: series.to_string(),
            expected: *expected,
            actual,
        })
    }
}
