//! Migration configuration
//!
//! Loaded from a JSON or TOML file (format chosen by extension) with
//! environment overrides using the `TSM__` prefix and `__` as the section
//! separator, e.g. `TSM__MIGRATION__WORKERS=8`.

use crate::converter;
use crate::types::{ColumnType, Compression, Encoding, SeriesSchema, SeriesType, TimeFormat, TimeParser};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

// Default values
const DEFAULT_WORKERS: usize = 4;
const DEFAULT_BATCH_SIZE: usize = 1000;
const DEFAULT_RETRY_SCHEDULER_INTERVAL_SECS: u64 = 300;
const DEFAULT_MAX_ROW_RETRIES: i64 = 3;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 60;
const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:18080";
const DEFAULT_USERNAME: &str = "root";
const DEFAULT_PASSWORD: &str = "root";
const DEFAULT_SESSIONS_PER_ENDPOINT: usize = 4;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CLIENT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_INTERVAL_MS: u64 = 1000;
const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;
const DEFAULT_PROGRESS_URL: &str = "sqlite://tsm-progress.db";
const DEFAULT_PROGRESS_MAX_CONNECTIONS: u32 = 4;
const DEFAULT_BUSY_TIMEOUT_SECS: u64 = 30;

/// Join key reserved for the event time.
pub const RESERVED_JOIN_KEY: &str = "timestamp";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    pub sources: Vec<SourceSettings>,
    pub destinations: Vec<DeviceSettings>,
    #[serde(default)]
    pub migration: MigrationSettings,
    #[serde(default)]
    pub client: ClientSettings,
    #[serde(default)]
    pub progress_store: ProgressStoreSettings,
}

/// One group of CSV files sharing a column mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSettings {
    pub name: String,
    pub file_paths: Vec<PathBuf>,
    pub columns: Vec<ColumnSettings>,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default = "default_quote")]
    pub quote: char,
}

fn default_delimiter() -> char {
    ','
}

fn default_quote() -> char {
    '"'
}

impl SourceSettings {
    /// The single TIME column carrying the event time.
    pub fn time_column(&self) -> Option<&ColumnSettings> {
        self.columns.iter().find(|c| c.column_type == ColumnType::Time)
    }

    pub fn column_by_key(&self, key: &str) -> Option<&ColumnSettings> {
        self.columns.iter().find(|c| c.key() == key)
    }

    pub fn delimiter_byte(&self) -> u8 {
        ascii_byte(self.delimiter).unwrap_or(b',')
    }

    pub fn quote_byte(&self) -> u8 {
        ascii_byte(self.quote).unwrap_or(b'"')
    }
}

fn ascii_byte(c: char) -> Option<u8> {
    if c.is_ascii() {
        Some(c as u8)
    } else {
        None
    }
}

/// A column of the CSV header and how to parse it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnSettings {
    /// Header name in the file.
    pub name: String,
    /// Name measurements and path columns refer to; defaults to `name`.
    #[serde(default)]
    pub join_key: Option<String>,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default)]
    pub time_format: Option<TimeFormat>,
    /// strftime pattern for `CUSTOM` time formats.
    #[serde(default)]
    pub time_pattern: Option<String>,
}

impl ColumnSettings {
    pub fn key(&self) -> &str {
        self.join_key.as_deref().unwrap_or(&self.name)
    }

    pub fn time_parser(&self) -> Option<TimeParser> {
        match self.time_format? {
            TimeFormat::Unix => Some(TimeParser::Unix),
            TimeFormat::Iso => Some(TimeParser::Iso),
            TimeFormat::Custom => self.time_pattern.clone().map(TimeParser::Pattern),
        }
    }
}

/// A destination device: a path prefix, an optional per-row path segment and
/// the measurements written under it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    pub device_id: String,
    /// Join key whose value is appended to `device_id` for each row.
    #[serde(default)]
    pub path_column: Option<String>,
    #[serde(default)]
    pub aligned: bool,
    /// Restrict this device to one source; applies to every source when absent.
    #[serde(default)]
    pub source: Option<String>,
    pub measurements: Vec<MeasurementSettings>,
}

impl DeviceSettings {
    pub fn applies_to(&self, source: &str) -> bool {
        self.source.as_deref().map_or(true, |s| s == source)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementSettings {
    pub name: String,
    pub join_key: String,
    pub data_type: SeriesType,
    #[serde(default)]
    pub encoding: Option<Encoding>,
    #[serde(default)]
    pub compression: Compression,
}

impl MeasurementSettings {
    pub fn schema(&self) -> SeriesSchema {
        SeriesSchema {
            data_type: self.data_type,
            encoding: self
                .encoding
                .unwrap_or_else(|| Encoding::default_for(self.data_type)),
            compression: self.compression,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationSettings {
    pub workers: usize,
    pub batch_size: usize,
    pub retry_scheduler_interval_secs: u64,
    /// Rows that entered FAILED this many times are not retried again.
    pub max_row_retries: i64,
    pub shutdown_grace_secs: u64,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            batch_size: DEFAULT_BATCH_SIZE,
            retry_scheduler_interval_secs: DEFAULT_RETRY_SCHEDULER_INTERVAL_SECS,
            max_row_retries: DEFAULT_MAX_ROW_RETRIES,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
        }
    }
}

impl MigrationSettings {
    pub fn retry_scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.retry_scheduler_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Destination client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub endpoints: Vec<String>,
    pub username: String,
    pub password: String,
    pub sessions_per_endpoint: usize,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_interval_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            endpoints: vec![DEFAULT_ENDPOINT.to_string()],
            username: DEFAULT_USERNAME.to_string(),
            password: DEFAULT_PASSWORD.to_string(),
            sessions_per_endpoint: DEFAULT_SESSIONS_PER_ENDPOINT,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            max_retries: DEFAULT_CLIENT_MAX_RETRIES,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
        }
    }
}

/// Progress ledger connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressStoreSettings {
    pub url: String,
    pub max_connections: u32,
    pub busy_timeout_secs: u64,
}

impl Default for ProgressStoreSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_PROGRESS_URL.to_string(),
            max_connections: DEFAULT_PROGRESS_MAX_CONNECTIONS,
            busy_timeout_secs: DEFAULT_BUSY_TIMEOUT_SECS,
        }
    }
}

impl MigrationConfig {
    /// Load the configuration file and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix("TSM")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Load and validate in one step.
    pub fn load_validated(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Devices that apply to the named source.
    pub fn devices_for<'a>(&'a self, source: &'a str) -> impl Iterator<Item = &'a DeviceSettings> + 'a {
        self.destinations.iter().filter(move |d| d.applies_to(source))
    }

    /// Check the configuration before any work is scheduled. Every problem
    /// found is reported, not just the first.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.sources.is_empty() {
            problems.push("at least one source is required".to_string());
        }
        if self.migration.workers == 0 {
            problems.push("migration.workers must be positive".to_string());
        }
        if self.migration.batch_size == 0 {
            problems.push("migration.batch_size must be positive".to_string());
        }
        if self.client.endpoints.is_empty() {
            problems.push("client.endpoints must not be empty".to_string());
        }
        if self.client.sessions_per_endpoint == 0 {
            problems.push("client.sessions_per_endpoint must be positive".to_string());
        }

        let mut names = HashSet::new();
        let mut owners: HashMap<&Path, &str> = HashMap::new();
        for source in &self.sources {
            if !names.insert(source.name.as_str()) {
                problems.push(format!("duplicate source name '{}'", source.name));
            }
            // A path maps to exactly one ledger source.
            for path in &source.file_paths {
                if let Some(owner) = owners.insert(path.as_path(), source.name.as_str()) {
                    problems.push(format!(
                        "file {} is listed by source '{}' and source '{}'",
                        path.display(),
                        owner,
                        source.name
                    ));
                }
            }
            self.validate_source(source, &mut problems);
        }

        let mut device_ids = HashSet::new();
        for device in &self.destinations {
            if device.path_column.is_none() && !device_ids.insert(device.device_id.as_str()) {
                problems.push(format!("duplicate device '{}'", device.device_id));
            }
            if device.measurements.is_empty() {
                problems.push(format!("device '{}' has no measurements", device.device_id));
            }
            if let Some(ref source) = device.source {
                if !self.sources.iter().any(|s| &s.name == source) {
                    problems.push(format!(
                        "device '{}' refers to unknown source '{}'",
                        device.device_id, source
                    ));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    fn validate_source(&self, source: &SourceSettings, problems: &mut Vec<String>) {
        let name = &source.name;

        if source.file_paths.is_empty() {
            problems.push(format!("source '{}' has no file paths", name));
        }
        for path in &source.file_paths {
            if !path.is_file() {
                problems.push(format!("source '{}': file not found: {}", name, path.display()));
            }
        }
        if ascii_byte(source.delimiter).is_none() || ascii_byte(source.quote).is_none() {
            problems.push(format!("source '{}': delimiter and quote must be ASCII", name));
        }

        let time_columns: Vec<_> = source
            .columns
            .iter()
            .filter(|c| c.column_type == ColumnType::Time)
            .collect();
        if time_columns.len() != 1 {
            problems.push(format!(
                "source '{}' must have exactly one TIME column, found {}",
                name,
                time_columns.len()
            ));
        }
        for column in &time_columns {
            if column.time_parser().is_none() {
                problems.push(format!(
                    "source '{}': TIME column '{}' needs a time_format (CUSTOM also needs time_pattern)",
                    name, column.name
                ));
            }
        }

        let mut keys = HashSet::new();
        for column in &source.columns {
            let key = column.key();
            if key == RESERVED_JOIN_KEY {
                problems.push(format!(
                    "source '{}': join key '{}' is reserved",
                    name, RESERVED_JOIN_KEY
                ));
            }
            if !keys.insert(key) {
                problems.push(format!("source '{}': duplicate join key '{}'", name, key));
            }
        }

        let mut used = HashSet::new();
        for device in self.devices_for(name) {
            if let Some(ref path_column) = device.path_column {
                if source.column_by_key(path_column).is_none() {
                    problems.push(format!(
                        "device '{}': path column '{}' is not a column of source '{}'",
                        device.device_id, path_column, name
                    ));
                }
                used.insert(path_column.as_str());
            }
            for measurement in &device.measurements {
                let Some(column) = source.column_by_key(&measurement.join_key) else {
                    problems.push(format!(
                        "measurement '{}.{}': join key '{}' is not a column of source '{}'",
                        device.device_id, measurement.name, measurement.join_key, name
                    ));
                    continue;
                };
                used.insert(measurement.join_key.as_str());
                if !converter::is_permitted(column.column_type, measurement.data_type) {
                    problems.push(format!(
                        "measurement '{}.{}': cannot convert {} to {}",
                        device.device_id, measurement.name, column.column_type, measurement.data_type
                    ));
                }
            }
        }

        for column in &source.columns {
            if column.column_type != ColumnType::Time && !used.contains(column.key()) {
                problems.push(format!(
                    "source '{}': join key '{}' is not used by any device",
                    name,
                    column.key()
                ));
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn csv_file() -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(file, "ts,zone,temp").unwrap();
        file
    }

    fn config_json(csv: &Path, extra_column: &str, data_type: &str) -> String {
        format!(
            r#"{{
                "sources": [{{
                    "name": "plant",
                    "file_paths": ["{}"],
                    "columns": [
                        {{"name": "ts", "type": "TIME", "time_format": "UNIX"}},
                        {{"name": "zone", "type": "STRING"}},
                        {{"name": "temp", "type": "DOUBLE"}}{}
                    ]
                }}],
                "destinations": [{{
                    "device_id": "root.plant",
                    "path_column": "zone",
                    "measurements": [
                        {{"name": "temperature", "join_key": "temp", "data_type": "{}"}}
                    ]
                }}],
                "migration": {{"workers": 2, "batch_size": 50}}
            }}"#,
            csv.display(),
            extra_column,
            data_type
        )
    }

    fn write_config(body: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_applies_defaults() {
        let csv = csv_file();
        let file = write_config(&config_json(csv.path(), "", "DOUBLE"));

        let config = MigrationConfig::load_validated(file.path()).unwrap();

        assert_eq!(config.migration.workers, 2);
        assert_eq!(config.migration.batch_size, 50);
        assert_eq!(config.migration.max_row_retries, DEFAULT_MAX_ROW_RETRIES);
        assert_eq!(config.client.endpoints, vec![DEFAULT_ENDPOINT.to_string()]);
        assert_eq!(config.sources[0].delimiter, ',');

        let schema = config.destinations[0].measurements[0].schema();
        assert_eq!(schema.encoding, Encoding::Rle);
        assert_eq!(schema.compression, Compression::Snappy);
    }

    #[test]
    fn test_rejects_invalid_conversion() {
        let csv = csv_file();
        let file = write_config(&config_json(csv.path(), "", "BOOLEAN"));

        let err = MigrationConfig::load_validated(file.path()).unwrap_err();
        assert!(err.to_string().contains("cannot convert DOUBLE to BOOLEAN"), "{}", err);
    }

    #[test]
    fn test_rejects_unused_and_reserved_join_keys() {
        let csv = csv_file();
        let extra = r#", {"name": "ts2", "join_key": "timestamp", "type": "LONG"}"#;
        let file = write_config(&config_json(csv.path(), extra, "DOUBLE"));

        let err = MigrationConfig::load_validated(file.path()).unwrap_err();
        let ConfigError::Invalid(problems) = err else {
            panic!("expected validation error");
        };
        assert!(problems.iter().any(|p| p.contains("'timestamp' is reserved")));
        assert!(problems.iter().any(|p| p.contains("not used by any device")));
    }

    #[test]
    fn test_rejects_missing_files() {
        let body = config_json(Path::new("/nonexistent/plant.csv"), "", "DOUBLE");
        let file = write_config(&body);

        let err = MigrationConfig::load_validated(file.path()).unwrap_err();
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_time_column_requires_format() {
        let column = ColumnSettings {
            name: "ts".to_string(),
            join_key: None,
            column_type: ColumnType::Time,
            time_format: Some(TimeFormat::Custom),
            time_pattern: None,
        };
        assert!(column.time_parser().is_none());
    }
}
