//! In-process destination store.
//!
//! Backs `--dry-run` and the test suite. Sessions created from one
//! [`MemoryBackend`] share its state, so a test can write through the pool
//! and inspect the result afterwards.

use super::{ClientError, SeriesSession, Tablet};
use crate::types::{SeriesSchema, SeriesValue};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Code used for rejected statements, matching the store's "metadata error".
const METADATA_ERROR: i64 = 508;

/// One stored point.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub timestamp: i64,
    pub value: SeriesValue,
}

#[derive(Debug, Default)]
struct State {
    series: BTreeMap<String, SeriesSchema>,
    points: BTreeMap<String, Vec<Point>>,
    inserts: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

impl MemoryBackend {
    pub fn session(&self, name: impl Into<String>) -> MemorySession {
        MemorySession {
            name: name.into(),
            backend: self.clone(),
        }
    }

    /// Register a series directly, as if it had been created beforehand.
    pub fn define_series(&self, series: &str, schema: SeriesSchema) {
        self.lock().series.insert(series.to_string(), schema);
    }

    pub fn series(&self) -> BTreeMap<String, SeriesSchema> {
        self.lock().series.clone()
    }

    /// Points of one series in insertion order.
    pub fn points(&self, series: &str) -> Vec<Point> {
        self.lock().points.get(series).cloned().unwrap_or_default()
    }

    pub fn point_count(&self) -> usize {
        self.lock().points.values().map(Vec::len).sum()
    }

    /// Number of accepted tablet inserts.
    pub fn insert_count(&self) -> usize {
        self.lock().inserts
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct MemorySession {
    name: String,
    backend: MemoryBackend,
}

fn rejected(message: String) -> ClientError {
    ClientError::Execution {
        code: METADATA_ERROR,
        message,
    }
}

#[async_trait]
impl SeriesSession for MemorySession {
    fn endpoint(&self) -> &str {
        &self.name
    }

    async fn ping(&self) -> Result<(), ClientError> {
        Ok(())
    }

    async fn series_schema(&self, series: &str) -> Result<Option<SeriesSchema>, ClientError> {
        Ok(self.backend.lock().series.get(series).copied())
    }

    async fn create_series(&self, series: &str, schema: &SeriesSchema) -> Result<(), ClientError> {
        let mut state = self.backend.lock();
        if state.series.contains_key(series) {
            return Err(rejected(format!("timeseries {} already exists", series)));
        }
        state.series.insert(series.to_string(), *schema);
        Ok(())
    }

    async fn create_aligned_series(
        &self,
        device: &str,
        measurements: &[(String, SeriesSchema)],
    ) -> Result<(), ClientError> {
        let mut state = self.backend.lock();
        let paths: Vec<String> = measurements
            .iter()
            .map(|(name, _)| format!("{}.{}", device, name))
            .collect();
        if let Some(existing) = paths.iter().find(|p| state.series.contains_key(*p)) {
            return Err(rejected(format!("timeseries {} already exists", existing)));
        }
        for (path, (_, schema)) in paths.into_iter().zip(measurements) {
            state.series.insert(path, *schema);
        }
        Ok(())
    }

    async fn insert_tablet(&self, tablet: &Tablet, _aligned: bool) -> Result<(), ClientError> {
        let mut state = self.backend.lock();

        // Validate the whole tablet before storing anything.
        for column in &tablet.columns {
            let path = format!("{}.{}", tablet.device, column.measurement);
            match state.series.get(&path) {
                None => return Err(rejected(format!("timeseries {} does not exist", path))),
                Some(schema) if schema.data_type != column.data_type => {
                    return Err(rejected(format!(
                        "timeseries {} is {}, tablet column is {}",
                        path, schema.data_type, column.data_type
                    )));
                },
                Some(_) => {},
            }
            if column.values.len() != tablet.timestamps.len() {
                return Err(rejected(format!("column {} has a wrong value count", path)));
            }
        }

        for column in &tablet.columns {
            let path = format!("{}.{}", tablet.device, column.measurement);
            let points = state.points.entry(path).or_default();
            for (timestamp, value) in tablet.timestamps.iter().zip(&column.values) {
                if let Some(value) = value {
                    points.push(Point {
                        timestamp: *timestamp,
                        value: value.clone(),
                    });
                }
            }
        }
        state.inserts += 1;
        Ok(())
    }
}
