//! Ledger records and their closed status domains.
//!
//! Statuses are stored as upper-case text. Reading a value outside the
//! domain is an error, never a silent default.

use super::ProgressError;
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

macro_rules! status_domain {
    ($(#[$meta:meta])* $name:ident, $domain:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = ProgressError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    _ => Err(ProgressError::InvalidStatus {
                        domain: $domain,
                        value: s.to_string(),
                    }),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = ProgressError;

            fn try_from(value: String) -> Result<Self, ProgressError> {
                value.parse()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

status_domain!(
    /// Lifecycle of a source file.
    SourceStatus, "source" {
        Pending => "PENDING",
        InProgress => "IN_PROGRESS",
        Completed => "COMPLETED",
        Failed => "FAILED",
    }
);

status_domain!(
    /// Lifecycle of one migration attempt.
    JobStatus, "job" {
        Pending => "PENDING",
        InProgress => "IN_PROGRESS",
        Completed => "COMPLETED",
        Failed => "FAILED",
    }
);

status_domain!(
    /// Progress of a single row.
    RowStatus, "row" {
        Pending => "PENDING",
        Processing => "PROCESSING",
        Retry => "RETRY",
        Completed => "COMPLETED",
        Failed => "FAILED",
    }
);

status_domain!(
    /// Severity of an audit trail entry.
    AuditLevel, "log level" {
        Info => "INFO",
        Warning => "WARNING",
        Error => "ERROR",
    }
);

impl SourceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SourceStatus::Completed | SourceStatus::Failed)
    }
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// One source file tracked by the ledger.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SourceRecord {
    pub id: i64,
    pub path: String,
    pub source_name: String,
    #[sqlx(try_from = "String")]
    pub status: SourceStatus,
    pub total_rows: i64,
    pub processed_rows: i64,
    pub failed_rows: i64,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub has_failed_rows: bool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRecord {
    pub id: i64,
    pub source_id: i64,
    #[sqlx(try_from = "String")]
    pub status: JobStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub processed_rows: i64,
    pub failed_rows: i64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RowProgress {
    pub source_id: i64,
    pub row_identity: String,
    pub row_number: i64,
    #[sqlx(try_from = "String")]
    pub status: RowStatus,
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AuditEntry {
    pub id: i64,
    pub source_id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    #[sqlx(try_from = "String")]
    pub level: AuditLevel,
    pub message: String,
}
