//! Row to series mapping
//!
//! Turns a batch of parsed rows into per-path records. A row fails only when
//! it has no event time or when a path-dependent device cannot resolve its
//! path. A value that cannot be converted to its measurement type is dropped
//! from the record; a conversion that loses information is kept and flagged.

use crate::config::{DeviceSettings, SourceSettings};
use crate::progress::{rows, ProgressResult, RowStatus};
use crate::reader::{Batch, ParsedRow};
use crate::types::{parse_bool, ColumnType, FieldValue, SeriesType, SeriesValue};
use sqlx::SqliteConnection;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};
use tsm_common::RowIdentity;

pub const MISSING_EVENT_TIME: &str = "Missing event time";

// ============================================================================
// Conversion matrix
// ============================================================================

/// A converted value and whether the conversion lost information.
#[derive(Debug, Clone, PartialEq)]
pub struct Converted {
    pub value: SeriesValue,
    pub lossy: bool,
}

impl Converted {
    fn exact(value: SeriesValue) -> Self {
        Self { value, lossy: false }
    }

    fn flagged(value: SeriesValue, lossy: bool) -> Self {
        Self { value, lossy }
    }
}

/// Whether a source column type may feed a destination series type.
pub fn is_permitted(source: ColumnType, destination: SeriesType) -> bool {
    use ColumnType as C;
    use SeriesType as S;

    match (source, destination) {
        (C::String, _) => true,
        (_, S::Text) => true,
        (C::Double | C::Float, S::Double | S::Float | S::Int32 | S::Int64) => true,
        (C::Integer | C::Long, S::Int32 | S::Int64 | S::Float | S::Double) => true,
        (C::Boolean, S::Boolean | S::Int32 | S::Int64) => true,
        (C::Time, S::Int64) => true,
        _ => false,
    }
}

/// Convert one value. `None` when the pair is not permitted or the value
/// cannot be represented (a NaN into an integer, an unparsable string).
pub fn convert_value(value: &FieldValue, destination: SeriesType) -> Option<Converted> {
    if !is_permitted(value.column_type(), destination) {
        return None;
    }

    if destination == SeriesType::Text {
        return Some(Converted::exact(SeriesValue::Text(value.to_string())));
    }

    match value {
        FieldValue::Double(v) => from_f64(*v, destination),
        FieldValue::Float(v) => match destination {
            SeriesType::Float => Some(Converted::exact(SeriesValue::Float(*v))),
            SeriesType::Double => Some(Converted::exact(SeriesValue::Double(f64::from(*v)))),
            _ => from_f64(f64::from(*v), destination),
        },
        FieldValue::Integer(v) => from_i64(i64::from(*v), destination),
        FieldValue::Long(v) => from_i64(*v, destination),
        FieldValue::Boolean(v) => match destination {
            SeriesType::Boolean => Some(Converted::exact(SeriesValue::Boolean(*v))),
            SeriesType::Int32 => Some(Converted::exact(SeriesValue::Int32(i32::from(*v)))),
            SeriesType::Int64 => Some(Converted::exact(SeriesValue::Int64(i64::from(*v)))),
            _ => None,
        },
        FieldValue::Time(ms) => match destination {
            SeriesType::Int64 => Some(Converted::exact(SeriesValue::Int64(*ms))),
            _ => None,
        },
        FieldValue::String(s) => parse_string(s.trim(), destination).map(Converted::exact),
    }
}

fn from_f64(v: f64, destination: SeriesType) -> Option<Converted> {
    match destination {
        SeriesType::Double => Some(Converted::exact(SeriesValue::Double(v))),
        SeriesType::Float => {
            let narrowed = v as f32;
            let lossy = !v.is_nan() && f64::from(narrowed) != v;
            Some(Converted::flagged(SeriesValue::Float(narrowed), lossy))
        },
        SeriesType::Int32 if v.is_finite() => {
            let narrowed = v as i32;
            Some(Converted::flagged(SeriesValue::Int32(narrowed), f64::from(narrowed) != v))
        },
        SeriesType::Int64 if v.is_finite() => {
            let narrowed = v as i64;
            Some(Converted::flagged(SeriesValue::Int64(narrowed), narrowed as f64 != v))
        },
        _ => None,
    }
}

fn from_i64(v: i64, destination: SeriesType) -> Option<Converted> {
    match destination {
        SeriesType::Int64 => Some(Converted::exact(SeriesValue::Int64(v))),
        SeriesType::Int32 => match i32::try_from(v) {
            Ok(exact) => Some(Converted::exact(SeriesValue::Int32(exact))),
            Err(_) => {
                let saturated = if v < 0 { i32::MIN } else { i32::MAX };
                Some(Converted::flagged(SeriesValue::Int32(saturated), true))
            },
        },
        SeriesType::Float => {
            let widened = v as f32;
            Some(Converted::flagged(SeriesValue::Float(widened), widened as i128 != i128::from(v)))
        },
        SeriesType::Double => {
            // Compared as i128: near i64::MAX the cast back to i64 saturates.
            let widened = v as f64;
            Some(Converted::flagged(SeriesValue::Double(widened), widened as i128 != i128::from(v)))
        },
        _ => None,
    }
}

fn parse_string(s: &str, destination: SeriesType) -> Option<SeriesValue> {
    match destination {
        SeriesType::Boolean => parse_bool(s).map(SeriesValue::Boolean),
        SeriesType::Int32 => s.parse().ok().map(SeriesValue::Int32),
        SeriesType::Int64 => s.parse().ok().map(SeriesValue::Int64),
        SeriesType::Float => s.parse().ok().map(SeriesValue::Float),
        SeriesType::Double => s.parse().ok().map(SeriesValue::Double),
        SeriesType::Text => Some(SeriesValue::Text(s.to_string())),
    }
}

// ============================================================================
// Records
// ============================================================================

/// One row mapped onto one destination path.
#[derive(Debug, Clone, PartialEq)]
pub struct RowRecord {
    pub identity: RowIdentity,
    pub row_number: i64,
    /// Epoch milliseconds
    pub event_time: i64,
    pub path: String,
    /// Measurement name to value. Measurements without a value are absent.
    pub fields: BTreeMap<String, SeriesValue>,
}

/// Records bound for one resolved path, with the device that produced them.
#[derive(Debug, Clone)]
pub struct DestinationBatch {
    pub device: Arc<DeviceSettings>,
    pub records: Vec<RowRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowFailure {
    pub identity: RowIdentity,
    pub row_number: i64,
    pub reason: String,
}

/// Output of [`Converter::convert`] for one batch.
#[derive(Debug, Default)]
pub struct Conversion {
    pub destinations: BTreeMap<String, DestinationBatch>,
    pub failed: Vec<RowFailure>,
    /// Rows that mapped cleanly but carry nothing to write.
    pub completed_without_records: Vec<RowIdentity>,
    pub lossy_values: usize,
}

impl Conversion {
    /// Identities of every row with at least one record, in first-seen order.
    pub fn mapped_identities(&self) -> Vec<RowIdentity> {
        let mut seen = HashSet::new();
        self.destinations
            .values()
            .flat_map(|d| d.records.iter())
            .filter(|r| seen.insert(r.identity.clone()))
            .map(|r| r.identity.clone())
            .collect()
    }

    pub fn failed_identities(&self) -> Vec<RowIdentity> {
        self.failed.iter().map(|f| f.identity.clone()).collect()
    }

    pub fn record_count(&self) -> usize {
        self.destinations.values().map(|d| d.records.len()).sum()
    }

    /// Write the row transitions this conversion implies.
    ///
    /// Mapped rows move to `PROCESSING`, rows with nothing to write to
    /// `COMPLETED`, failed rows to `FAILED` with their reason. Failures are
    /// applied last so a row that failed for one device stays failed.
    pub async fn record(&self, conn: &mut SqliteConnection, source_id: i64) -> ProgressResult<()> {
        let mapped = self.mapped_identities();
        rows::update_statuses(conn, source_id, &mapped, RowStatus::Processing, None).await?;
        rows::update_statuses(
            conn,
            source_id,
            &self.completed_without_records,
            RowStatus::Completed,
            None,
        )
        .await?;
        for failure in &self.failed {
            rows::update_status(
                conn,
                source_id,
                &failure.identity,
                RowStatus::Failed,
                Some(&failure.reason),
            )
            .await?;
        }
        Ok(())
    }
}

// ============================================================================
// Converter
// ============================================================================

/// Maps rows of one source onto the devices that apply to it.
pub struct Converter {
    source: Arc<SourceSettings>,
    devices: Vec<Arc<DeviceSettings>>,
}

impl Converter {
    pub fn new(source: Arc<SourceSettings>, devices: Vec<Arc<DeviceSettings>>) -> Self {
        Self { source, devices }
    }

    pub fn convert(&self, batch: &Batch) -> Conversion {
        let mut conversion = Conversion::default();

        for row in &batch.rows {
            self.convert_row(row, &mut conversion);
        }

        if conversion.lossy_values > 0 {
            warn!(
                source = %self.source.name,
                path = %batch.path,
                lossy_values = conversion.lossy_values,
                "Batch contained lossy conversions"
            );
        }
        conversion
    }

    fn convert_row(&self, row: &ParsedRow, out: &mut Conversion) {
        let Some(event_time) = row.event_time else {
            out.failed.push(RowFailure {
                identity: row.identity.clone(),
                row_number: row.row_number,
                reason: MISSING_EVENT_TIME.to_string(),
            });
            return;
        };

        let mut failures = Vec::new();
        let mut produced = false;

        for device in &self.devices {
            let path = match device.path_column {
                None => device.device_id.clone(),
                Some(ref column) => match row.fields.get(column) {
                    Some(segment) => format!("{}.{}", device.device_id, segment.to_string().trim()),
                    None => {
                        failures.push(format!(
                            "Missing path value '{}' for device {}",
                            column, device.device_id
                        ));
                        continue;
                    },
                },
            };

            let mut fields = BTreeMap::new();
            for measurement in &device.measurements {
                let Some(value) = row.fields.get(&measurement.join_key) else {
                    continue;
                };
                match convert_value(value, measurement.data_type) {
                    Some(converted) => {
                        if converted.lossy {
                            out.lossy_values += 1;
                            warn!(
                                row = row.row_number,
                                series = %format!("{}.{}", path, measurement.name),
                                from = %value.column_type(),
                                to = %measurement.data_type,
                                "Precision lost in conversion"
                            );
                        }
                        fields.insert(measurement.name.clone(), converted.value);
                    },
                    None => debug!(
                        row = row.row_number,
                        measurement = %measurement.name,
                        from = %value.column_type(),
                        to = %measurement.data_type,
                        "Value not convertible, field omitted"
                    ),
                }
            }

            if fields.is_empty() {
                continue;
            }
            produced = true;
            out.destinations
                .entry(path.clone())
                .or_insert_with(|| DestinationBatch {
                    device: device.clone(),
                    records: Vec::new(),
                })
                .records
                .push(RowRecord {
                    identity: row.identity.clone(),
                    row_number: row.row_number,
                    event_time,
                    path,
                    fields,
                });
        }

        if !failures.is_empty() {
            out.failed.push(RowFailure {
                identity: row.identity.clone(),
                row_number: row.row_number,
                reason: failures.join("; "),
            });
        } else if !produced {
            out.completed_without_records.push(row.identity.clone());
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::{ColumnSettings, MeasurementSettings};
    use crate::progress::{sources, ProgressStore};
    use crate::types::{Compression, TimeFormat};
    use std::collections::HashMap;

    // ------------------------------------------------------------------------
    // Matrix
    // ------------------------------------------------------------------------

    #[test]
    fn test_double_to_int32() {
        assert_eq!(
            convert_value(&FieldValue::Double(3.0), SeriesType::Int32),
            Some(Converted::exact(SeriesValue::Int32(3)))
        );
        assert_eq!(
            convert_value(&FieldValue::Double(3.5), SeriesType::Int32),
            Some(Converted::flagged(SeriesValue::Int32(3), true))
        );
        assert_eq!(convert_value(&FieldValue::Double(f64::NAN), SeriesType::Int32), None);
    }

    #[test]
    fn test_incompatible_pairs_yield_none() {
        assert_eq!(convert_value(&FieldValue::Boolean(true), SeriesType::Float), None);
        assert_eq!(convert_value(&FieldValue::Time(5), SeriesType::Double), None);
        assert_eq!(convert_value(&FieldValue::Double(1.0), SeriesType::Boolean), None);
        assert!(!is_permitted(ColumnType::Boolean, SeriesType::Double));
        assert!(is_permitted(ColumnType::String, SeriesType::Boolean));
    }

    #[test]
    fn test_integer_conversions() {
        assert_eq!(
            convert_value(&FieldValue::Long(i64::from(i32::MAX) + 1), SeriesType::Int32),
            Some(Converted::flagged(SeriesValue::Int32(i32::MAX), true))
        );
        assert_eq!(
            convert_value(&FieldValue::Integer(7), SeriesType::Double),
            Some(Converted::exact(SeriesValue::Double(7.0)))
        );
        assert_eq!(
            convert_value(&FieldValue::Integer(16_777_217), SeriesType::Float),
            Some(Converted::flagged(SeriesValue::Float(16_777_216.0), true))
        );
        assert_eq!(
            convert_value(&FieldValue::Boolean(true), SeriesType::Int32),
            Some(Converted::exact(SeriesValue::Int32(1)))
        );
    }

    #[test]
    fn test_long_extremes_into_floats_are_lossy() {
        assert_eq!(
            convert_value(&FieldValue::Long(i64::MAX), SeriesType::Double),
            Some(Converted::flagged(SeriesValue::Double(i64::MAX as f64), true))
        );
        assert_eq!(
            convert_value(&FieldValue::Long(i64::MAX), SeriesType::Float),
            Some(Converted::flagged(SeriesValue::Float(i64::MAX as f32), true))
        );
        assert_eq!(
            convert_value(&FieldValue::Long(i64::MIN), SeriesType::Double),
            Some(Converted::exact(SeriesValue::Double(i64::MIN as f64)))
        );
    }

    #[test]
    fn test_text_and_string_conversions() {
        assert_eq!(
            convert_value(&FieldValue::Time(1_704_067_201_000), SeriesType::Text),
            Some(Converted::exact(SeriesValue::Text("2024-01-01T00:00:01.000Z".to_string())))
        );
        assert_eq!(
            convert_value(&FieldValue::String(" 42 ".to_string()), SeriesType::Int64),
            Some(Converted::exact(SeriesValue::Int64(42)))
        );
        assert_eq!(convert_value(&FieldValue::String("warm".to_string()), SeriesType::Double), None);
        assert_eq!(
            convert_value(&FieldValue::Double(21.5), SeriesType::Float),
            Some(Converted::exact(SeriesValue::Float(21.5)))
        );
    }

    // ------------------------------------------------------------------------
    // Mapping
    // ------------------------------------------------------------------------

    fn source() -> Arc<SourceSettings> {
        let column = |name: &str, column_type: ColumnType| ColumnSettings {
            name: name.to_string(),
            join_key: None,
            column_type,
            time_format: (column_type == ColumnType::Time).then_some(TimeFormat::Unix),
            time_pattern: None,
        };
        Arc::new(SourceSettings {
            name: "plant".to_string(),
            file_paths: vec!["data/plant.csv".into()],
            columns: vec![
                column("ts", ColumnType::Time),
                column("zone", ColumnType::String),
                column("temp", ColumnType::Double),
                column("ok", ColumnType::Boolean),
            ],
            delimiter: ',',
            quote: '"',
        })
    }

    fn measurement(name: &str, join_key: &str, data_type: SeriesType) -> MeasurementSettings {
        MeasurementSettings {
            name: name.to_string(),
            join_key: join_key.to_string(),
            data_type,
            encoding: None,
            compression: Compression::Snappy,
        }
    }

    fn zoned_device() -> Arc<DeviceSettings> {
        Arc::new(DeviceSettings {
            device_id: "root.plant".to_string(),
            path_column: Some("zone".to_string()),
            aligned: false,
            source: None,
            measurements: vec![
                measurement("temperature", "temp", SeriesType::Int32),
                measurement("healthy", "ok", SeriesType::Boolean),
            ],
        })
    }

    fn row(number: i64, time: Option<i64>, fields: &[(&str, FieldValue)]) -> ParsedRow {
        ParsedRow {
            identity: RowIdentity::derive(1, "data/plant.csv", number),
            row_number: number,
            event_time: time,
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect::<HashMap<_, _>>(),
        }
    }

    fn batch(rows: Vec<ParsedRow>) -> Batch {
        Batch {
            source_id: 1,
            path: "data/plant.csv".to_string(),
            rows,
            rejected: Vec::new(),
        }
    }

    #[test]
    fn test_path_segment_resolves_per_row() {
        let converter = Converter::new(source(), vec![zoned_device()]);
        let conversion = converter.convert(&batch(vec![
            row(1, Some(1000), &[
                ("zone", FieldValue::String("A1".to_string())),
                ("temp", FieldValue::Double(3.5)),
            ]),
            row(2, Some(2000), &[
                ("zone", FieldValue::String("B2".to_string())),
                ("temp", FieldValue::Double(4.0)),
            ]),
        ]));

        let a1 = &conversion.destinations["root.plant.A1"];
        assert_eq!(a1.records.len(), 1);
        assert_eq!(a1.records[0].path, "root.plant.A1");
        assert_eq!(a1.records[0].fields["temperature"], SeriesValue::Int32(3));
        assert!(conversion.destinations.contains_key("root.plant.B2"));
        assert_eq!(conversion.lossy_values, 1);
        assert!(conversion.failed.is_empty());
    }

    #[test]
    fn test_row_failures_and_empty_rows() {
        let fixed = Arc::new(DeviceSettings {
            device_id: "root.plant.site".to_string(),
            path_column: None,
            aligned: false,
            source: None,
            measurements: vec![measurement("temperature", "temp", SeriesType::Double)],
        });
        let converter = Converter::new(source(), vec![zoned_device(), fixed]);

        let conversion = converter.convert(&batch(vec![
            // No event time
            row(1, None, &[("temp", FieldValue::Double(1.0))]),
            // No zone: fails for the zoned device, still written to the fixed one
            row(2, Some(2000), &[("temp", FieldValue::Double(2.0))]),
            // Nothing to write anywhere
            row(3, Some(3000), &[("zone", FieldValue::String("A1".to_string()))]),
        ]));

        assert_eq!(conversion.failed.len(), 2);
        assert_eq!(conversion.failed[0].reason, MISSING_EVENT_TIME);
        assert_eq!(conversion.failed[1].row_number, 2);
        assert!(conversion.failed[1].reason.contains("zone"));
        assert_eq!(conversion.destinations["root.plant.site"].records.len(), 1);
        assert_eq!(conversion.completed_without_records, vec![RowIdentity::derive(1, "data/plant.csv", 3)]);
    }

    #[test]
    fn test_unconvertible_value_is_omitted_not_failed() {
        let device = Arc::new(DeviceSettings {
            device_id: "root.plant".to_string(),
            path_column: None,
            aligned: false,
            source: None,
            measurements: vec![
                measurement("reading", "zone", SeriesType::Double),
                measurement("temperature", "temp", SeriesType::Double),
            ],
        });
        let converter = Converter::new(source(), vec![device]);
        let conversion = converter.convert(&batch(vec![row(1, Some(1000), &[
            ("zone", FieldValue::String("warm".to_string())),
            ("temp", FieldValue::Double(20.0)),
        ])]));

        let record = &conversion.destinations["root.plant"].records[0];
        assert_eq!(record.fields.len(), 1);
        assert!(conversion.failed.is_empty());
    }

    #[tokio::test]
    async fn test_record_applies_failures_last() {
        let store = ProgressStore::in_memory().await.unwrap();
        let mut tx = store.begin().await.unwrap();
        let source_record = sources::find_or_create(&mut tx, "plant", "data/plant.csv").await.unwrap();
        let id = |n| RowIdentity::derive(source_record.id, "data/plant.csv", n);
        for n in 1..=3 {
            rows::upsert(&mut tx, source_record.id, &id(n), n, RowStatus::Pending, None)
                .await
                .unwrap();
        }

        let mut conversion = Conversion::default();
        conversion.destinations.insert(
            "root.plant".to_string(),
            DestinationBatch {
                device: zoned_device(),
                records: [1, 2]
                    .into_iter()
                    .map(|n| RowRecord {
                        identity: id(n),
                        row_number: n,
                        event_time: n * 1000,
                        path: "root.plant".to_string(),
                        fields: BTreeMap::new(),
                    })
                    .collect(),
            },
        );
        conversion.failed.push(RowFailure {
            identity: id(2),
            row_number: 2,
            reason: "Missing path value".to_string(),
        });
        conversion.completed_without_records.push(id(3));

        conversion.record(&mut tx, source_record.id).await.unwrap();

        let status = |row: Option<crate::progress::RowProgress>| row.unwrap().status;
        assert_eq!(
            status(rows::get(&mut tx, source_record.id, &id(1)).await.unwrap()),
            RowStatus::Processing
        );
        assert_eq!(
            status(rows::get(&mut tx, source_record.id, &id(2)).await.unwrap()),
            RowStatus::Failed
        );
        assert_eq!(
            status(rows::get(&mut tx, source_record.id, &id(3)).await.unwrap()),
            RowStatus::Completed
        );
    }
}
