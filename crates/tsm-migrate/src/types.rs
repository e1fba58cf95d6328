//! Source column types, destination series types and the values flowing between them.

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Source side
// ============================================================================

/// Declared type of a CSV column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnType {
    Integer,
    Long,
    Float,
    Double,
    Boolean,
    String,
    Time,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Long => "LONG",
            ColumnType::Float => "FLOAT",
            ColumnType::Double => "DOUBLE",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::String => "STRING",
            ColumnType::Time => "TIME",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a TIME column is written in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeFormat {
    /// Seconds since the epoch, integral or fractional.
    Unix,
    /// ISO-8601 date-time, with or without offset (UTC assumed when absent).
    Iso,
    /// A strftime pattern, interpreted in local time unless it carries an offset.
    Custom,
}

/// Resolved time parsing rule for one column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeParser {
    Unix,
    Iso,
    Pattern(String),
}

impl TimeParser {
    /// Parse a timestamp into epoch milliseconds.
    pub fn parse_millis(&self, raw: &str) -> Result<i64, String> {
        match self {
            TimeParser::Unix => {
                if let Ok(secs) = raw.parse::<i64>() {
                    return secs
                        .checked_mul(1000)
                        .ok_or_else(|| format!("unix timestamp out of range: {}", raw));
                }
                let secs: f64 = raw
                    .parse()
                    .map_err(|_| format!("invalid unix timestamp: {}", raw))?;
                if !secs.is_finite() {
                    return Err(format!("invalid unix timestamp: {}", raw));
                }
                Ok((secs * 1000.0).round() as i64)
            },
            TimeParser::Iso => {
                if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
                    return Ok(dt.timestamp_millis());
                }
                NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                    .map(|naive| naive.and_utc().timestamp_millis())
                    .map_err(|e| format!("invalid ISO timestamp '{}': {}", raw, e))
            },
            TimeParser::Pattern(pattern) => {
                if let Ok(dt) = DateTime::parse_from_str(raw, pattern) {
                    return Ok(dt.timestamp_millis());
                }
                let naive = NaiveDateTime::parse_from_str(raw, pattern)
                    .or_else(|_| {
                        NaiveDate::parse_from_str(raw, pattern)
                            .map(|date| date.and_hms_opt(0, 0, 0).unwrap_or_default())
                    })
                    .map_err(|e| format!("timestamp '{}' does not match '{}': {}", raw, pattern, e))?;
                Local
                    .from_local_datetime(&naive)
                    .earliest()
                    .map(|dt| dt.timestamp_millis())
                    .ok_or_else(|| format!("timestamp '{}' does not exist in local time", raw))
            },
        }
    }
}

/// A parsed CSV cell.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Integer(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Boolean(bool),
    String(String),
    /// Epoch milliseconds
    Time(i64),
}

impl FieldValue {
    /// Parse a raw cell. Empty cells carry no value.
    pub fn parse(
        column_type: ColumnType,
        raw: &str,
        time: Option<&TimeParser>,
    ) -> Result<Option<Self>, String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }

        let value = match column_type {
            ColumnType::Integer => FieldValue::Integer(
                trimmed.parse().map_err(|_| format!("invalid INTEGER: {}", trimmed))?,
            ),
            ColumnType::Long => {
                FieldValue::Long(trimmed.parse().map_err(|_| format!("invalid LONG: {}", trimmed))?)
            },
            ColumnType::Float => {
                FieldValue::Float(trimmed.parse().map_err(|_| format!("invalid FLOAT: {}", trimmed))?)
            },
            ColumnType::Double => FieldValue::Double(
                trimmed.parse().map_err(|_| format!("invalid DOUBLE: {}", trimmed))?,
            ),
            ColumnType::Boolean => FieldValue::Boolean(
                parse_bool(trimmed).ok_or_else(|| format!("invalid BOOLEAN: {}", trimmed))?,
            ),
            ColumnType::String => FieldValue::String(raw.to_string()),
            ColumnType::Time => {
                let parser = time.ok_or_else(|| "TIME column without a time format".to_string())?;
                FieldValue::Time(parser.parse_millis(trimmed)?)
            },
        };
        Ok(Some(value))
    }

    pub fn column_type(&self) -> ColumnType {
        match self {
            FieldValue::Integer(_) => ColumnType::Integer,
            FieldValue::Long(_) => ColumnType::Long,
            FieldValue::Float(_) => ColumnType::Float,
            FieldValue::Double(_) => ColumnType::Double,
            FieldValue::Boolean(_) => ColumnType::Boolean,
            FieldValue::String(_) => ColumnType::String,
            FieldValue::Time(_) => ColumnType::Time,
        }
    }
}

/// Rendering used for path segments and TEXT conversion.
impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Integer(v) => write!(f, "{}", v),
            FieldValue::Long(v) => write!(f, "{}", v),
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Double(v) => write!(f, "{}", v),
            FieldValue::Boolean(v) => write!(f, "{}", v),
            FieldValue::String(v) => f.write_str(v),
            FieldValue::Time(ms) => match DateTime::<Utc>::from_timestamp_millis(*ms) {
                Some(dt) => f.write_str(&dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
                None => write!(f, "{}", ms),
            },
        }
    }
}

pub(crate) fn parse_bool(raw: &str) -> Option<bool> {
    if raw.eq_ignore_ascii_case("true") {
        Some(true)
    } else if raw.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

// ============================================================================
// Destination side
// ============================================================================

/// Value type of a destination series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SeriesType {
    Boolean,
    Int32,
    Int64,
    Float,
    Double,
    Text,
}

impl SeriesType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeriesType::Boolean => "BOOLEAN",
            SeriesType::Int32 => "INT32",
            SeriesType::Int64 => "INT64",
            SeriesType::Float => "FLOAT",
            SeriesType::Double => "DOUBLE",
            SeriesType::Text => "TEXT",
        }
    }
}

impl FromStr for SeriesType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BOOLEAN" => Ok(SeriesType::Boolean),
            "INT32" => Ok(SeriesType::Int32),
            "INT64" => Ok(SeriesType::Int64),
            "FLOAT" => Ok(SeriesType::Float),
            "DOUBLE" => Ok(SeriesType::Double),
            "TEXT" => Ok(SeriesType::Text),
            _ => Err(format!("unknown data type: {}", s)),
        }
    }
}

impl fmt::Display for SeriesType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Series encoding as understood by the destination store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Encoding {
    #[serde(rename = "PLAIN")]
    Plain,
    #[serde(rename = "DICTIONARY")]
    Dictionary,
    #[serde(rename = "RLE")]
    Rle,
    #[serde(rename = "DIFF")]
    Diff,
    #[serde(rename = "TS_2DIFF")]
    Ts2Diff,
    #[serde(rename = "BITMAP")]
    Bitmap,
    #[serde(rename = "GORILLA_V1")]
    GorillaV1,
    #[serde(rename = "REGULAR")]
    Regular,
    #[serde(rename = "GORILLA")]
    Gorilla,
    #[serde(rename = "ZIGZAG")]
    Zigzag,
    #[serde(rename = "CHIMP")]
    Chimp,
    #[serde(rename = "SPRINTZ")]
    Sprintz,
    #[serde(rename = "RLBE")]
    Rlbe,
}

impl Encoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Plain => "PLAIN",
            Encoding::Dictionary => "DICTIONARY",
            Encoding::Rle => "RLE",
            Encoding::Diff => "DIFF",
            Encoding::Ts2Diff => "TS_2DIFF",
            Encoding::Bitmap => "BITMAP",
            Encoding::GorillaV1 => "GORILLA_V1",
            Encoding::Regular => "REGULAR",
            Encoding::Gorilla => "GORILLA",
            Encoding::Zigzag => "ZIGZAG",
            Encoding::Chimp => "CHIMP",
            Encoding::Sprintz => "SPRINTZ",
            Encoding::Rlbe => "RLBE",
        }
    }

    /// Default encoding for a series type: PLAIN for text, RLE otherwise.
    pub fn default_for(data_type: SeriesType) -> Self {
        match data_type {
            SeriesType::Text => Encoding::Plain,
            _ => Encoding::Rle,
        }
    }
}

impl FromStr for Encoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PLAIN" => Ok(Encoding::Plain),
            "DICTIONARY" => Ok(Encoding::Dictionary),
            "RLE" => Ok(Encoding::Rle),
            "DIFF" => Ok(Encoding::Diff),
            "TS_2DIFF" => Ok(Encoding::Ts2Diff),
            "BITMAP" => Ok(Encoding::Bitmap),
            "GORILLA_V1" => Ok(Encoding::GorillaV1),
            "REGULAR" => Ok(Encoding::Regular),
            "GORILLA" => Ok(Encoding::Gorilla),
            "ZIGZAG" => Ok(Encoding::Zigzag),
            "CHIMP" => Ok(Encoding::Chimp),
            "SPRINTZ" => Ok(Encoding::Sprintz),
            "RLBE" => Ok(Encoding::Rlbe),
            _ => Err(format!("unknown encoding: {}", s)),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Series compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Compression {
    Uncompressed,
    #[default]
    Snappy,
    Gzip,
    Lz4,
    Zstd,
    Lzma2,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::Uncompressed => "UNCOMPRESSED",
            Compression::Snappy => "SNAPPY",
            Compression::Gzip => "GZIP",
            Compression::Lz4 => "LZ4",
            Compression::Zstd => "ZSTD",
            Compression::Lzma2 => "LZMA2",
        }
    }
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "UNCOMPRESSED" => Ok(Compression::Uncompressed),
            "SNAPPY" => Ok(Compression::Snappy),
            "GZIP" => Ok(Compression::Gzip),
            "LZ4" => Ok(Compression::Lz4),
            "ZSTD" => Ok(Compression::Zstd),
            "LZMA2" => Ok(Compression::Lzma2),
            _ => Err(format!("unknown compression: {}", s)),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared or observed shape of one destination series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SeriesSchema {
    pub data_type: SeriesType,
    pub encoding: Encoding,
    pub compression: Compression,
}

impl fmt::Display for SeriesSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.data_type, self.encoding, self.compression)
    }
}

/// A value ready to be written to a destination series.
#[derive(Debug, Clone, PartialEq)]
pub enum SeriesValue {
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    Text(String),
}

impl SeriesValue {
    pub fn series_type(&self) -> SeriesType {
        match self {
            SeriesValue::Boolean(_) => SeriesType::Boolean,
            SeriesValue::Int32(_) => SeriesType::Int32,
            SeriesValue::Int64(_) => SeriesType::Int64,
            SeriesValue::Float(_) => SeriesType::Float,
            SeriesValue::Double(_) => SeriesType::Double,
            SeriesValue::Text(_) => SeriesType::Text,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            SeriesValue::Boolean(v) => serde_json::Value::from(*v),
            SeriesValue::Int32(v) => serde_json::Value::from(*v),
            SeriesValue::Int64(v) => serde_json::Value::from(*v),
            SeriesValue::Float(v) => serde_json::Value::from(*v),
            SeriesValue::Double(v) => serde_json::Value::from(*v),
            SeriesValue::Text(v) => serde_json::Value::from(v.as_str()),
        }
    }
}
