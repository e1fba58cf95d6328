//! Streaming batch reader
//!
//! Walks the files of one source in order and yields [`ReadEvent`]s:
//! `FileOpened`, then any number of `Rows` batches, then `FileFinished`,
//! repeated per file, and finally a single `Exhausted`. Batches never span
//! files.
//!
//! Replay is decided once per file when it is opened. A file whose previous
//! pass reached its end is read in replay mode: only the row numbers the
//! ledger holds as replayable are emitted, possibly none, and reading stops
//! after the last of them. Otherwise the whole file is read and rows already
//! `COMPLETED` are skipped.
//!
//! Records are read before any ledger transaction opens. Every emitted row
//! is then upserted `PENDING` (first pass) or `RETRY` (replay); rows that
//! fail to parse move to `FAILED` with the parse error and are reported in
//! [`Batch::rejected`].

use crate::config::SourceSettings;
use crate::progress::{rows, sources, ProgressError, ProgressStore, RowStatus};
use crate::types::{ColumnType, FieldValue, TimeParser};
use csv_async::{AsyncReader, AsyncReaderBuilder, StringRecord};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::File;
use tracing::{debug, info, warn};
use tsm_common::RowIdentity;

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("Failed to open {path}: {error}")]
    Open {
        source_id: i64,
        path: String,
        #[source]
        error: std::io::Error,
    },

    #[error("Failed to read {path}: {error}")]
    Read {
        source_id: i64,
        path: String,
        #[source]
        error: csv_async::Error,
    },

    #[error("{path}: column '{column}' not found in header")]
    MissingColumn {
        source_id: i64,
        path: String,
        column: String,
    },

    #[error("Progress store error for source {source_id}: {error}")]
    Progress {
        source_id: i64,
        #[source]
        error: ProgressError,
    },

    #[error("Reader used after it reported exhaustion")]
    Terminal,
}

impl ReaderError {
    /// The source whose file was abandoned, if any.
    pub fn source_id(&self) -> Option<i64> {
        match self {
            ReaderError::Open { source_id, .. }
            | ReaderError::Read { source_id, .. }
            | ReaderError::MissingColumn { source_id, .. }
            | ReaderError::Progress { source_id, .. } => Some(*source_id),
            ReaderError::Terminal => None,
        }
    }
}

/// A file to read and the ledger source tracking it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTarget {
    pub source_id: i64,
    pub path: PathBuf,
}

/// One successfully parsed row.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRow {
    pub identity: RowIdentity,
    /// 1-based, header excluded
    pub row_number: i64,
    /// Epoch milliseconds, `None` when the time cell was empty.
    pub event_time: Option<i64>,
    /// Values by join key, the time column included. Empty cells are absent.
    pub fields: HashMap<String, FieldValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub source_id: i64,
    pub path: String,
    pub rows: Vec<ParsedRow>,
    /// Rows emitted in this batch that failed to parse.
    pub rejected: Vec<RowIdentity>,
}

impl Batch {
    /// Rows emitted, parsed or not.
    pub fn emitted(&self) -> usize {
        self.rows.len() + self.rejected.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedFile {
    pub source_id: i64,
    pub path: String,
    /// Number of rows to replay, `None` on a full pass.
    pub replay_rows: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedFile {
    pub source_id: i64,
    pub path: String,
    /// Data rows read from the file during this pass.
    pub rows_read: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReadEvent {
    FileOpened(OpenedFile),
    Rows(Batch),
    FileFinished(FinishedFile),
    Exhausted,
}

struct ResolvedColumn {
    index: usize,
    name: String,
    key: String,
    column_type: ColumnType,
    time: Option<TimeParser>,
}

struct OpenFile {
    source_id: i64,
    path: String,
    reader: AsyncReader<File>,
    columns: Vec<ResolvedColumn>,
    replay: Option<BTreeSet<i64>>,
    row_number: i64,
    ended: bool,
}

impl OpenFile {
    fn replay_done(&self) -> bool {
        match self.replay {
            Some(ref set) => set.last().map_or(true, |last| self.row_number >= *last),
            None => false,
        }
    }

    fn parse(&self, record: &StringRecord) -> Result<(Option<i64>, HashMap<String, FieldValue>), String> {
        let mut event_time = None;
        let mut fields = HashMap::with_capacity(self.columns.len());

        for column in &self.columns {
            let raw = record
                .get(column.index)
                .ok_or_else(|| format!("Missing value for column '{}'", column.name))?;
            let value = FieldValue::parse(column.column_type, raw, column.time.as_ref())
                .map_err(|e| format!("Column '{}': {}", column.name, e))?;

            match value {
                Some(FieldValue::Time(ms)) if column.column_type == ColumnType::Time => {
                    event_time = Some(ms);
                    fields.insert(column.key.clone(), FieldValue::Time(ms));
                },
                Some(value) => {
                    fields.insert(column.key.clone(), value);
                },
                None => {},
            }
        }
        Ok((event_time, fields))
    }
}

/// A record read from the file but not yet recorded in the ledger.
struct ReadRow {
    identity: RowIdentity,
    row_number: i64,
    parsed: Result<(Option<i64>, HashMap<String, FieldValue>), String>,
}

enum State {
    Closed,
    Open(Box<OpenFile>),
    Exhausted,
}

pub struct BatchReader {
    store: ProgressStore,
    source: Arc<SourceSettings>,
    pending: VecDeque<FileTarget>,
    batch_size: usize,
    max_retry_count: i64,
    state: State,
}

impl BatchReader {
    pub fn new(
        store: ProgressStore,
        source: Arc<SourceSettings>,
        files: Vec<FileTarget>,
        batch_size: usize,
        max_retry_count: i64,
    ) -> Self {
        Self {
            store,
            source,
            pending: files.into(),
            batch_size: batch_size.max(1),
            max_retry_count,
            state: State::Closed,
        }
    }

    /// Advance the reader by one event.
    ///
    /// An error abandons the current file; the next call moves on to the
    /// following one.
    ///
    /// # Errors
    ///
    /// `ReaderError::Terminal` if called again after `Exhausted` was returned.
    pub async fn read_batch(&mut self) -> Result<ReadEvent, ReaderError> {
        match std::mem::replace(&mut self.state, State::Closed) {
            State::Exhausted => {
                self.state = State::Exhausted;
                Err(ReaderError::Terminal)
            },
            State::Closed => match self.open_next_file().await? {
                Some(opened) => Ok(ReadEvent::FileOpened(opened)),
                None => {
                    self.state = State::Exhausted;
                    Ok(ReadEvent::Exhausted)
                },
            },
            State::Open(mut file) => {
                if file.ended {
                    debug!(source_id = file.source_id, path = %file.path, "File closed");
                    return Ok(ReadEvent::FileFinished(FinishedFile {
                        source_id: file.source_id,
                        path: file.path.clone(),
                        rows_read: file.row_number,
                    }));
                }
                let batch = self.fill_batch(&mut file).await?;
                self.state = State::Open(file);
                Ok(ReadEvent::Rows(batch))
            },
        }
    }

    /// Open the next pending file and decide its mode.
    /// Returns `None` once every file has been opened.
    pub async fn open_next_file(&mut self) -> Result<Option<OpenedFile>, ReaderError> {
        let Some(target) = self.pending.pop_front() else {
            return Ok(None);
        };
        let source_id = target.source_id;
        let path = target.path.to_string_lossy().into_owned();
        let progress = |error: ProgressError| ReaderError::Progress { source_id, error };

        let replay = {
            let mut conn = self.store.acquire().await.map_err(progress)?;
            let record = sources::get(&mut conn, source_id).await.map_err(progress)?;
            if record.total_rows > 0 {
                Some(
                    rows::replayable_row_numbers(&mut conn, source_id, self.max_retry_count)
                        .await
                        .map_err(progress)?,
                )
            } else {
                None
            }
        };

        let file = File::open(&target.path).await.map_err(|error| ReaderError::Open {
            source_id,
            path: path.clone(),
            error,
        })?;
        let mut reader = AsyncReaderBuilder::new()
            .delimiter(self.source.delimiter_byte())
            .quote(self.source.quote_byte())
            .has_headers(true)
            .flexible(true)
            .create_reader(file);

        let headers = reader.headers().await.map_err(|error| ReaderError::Read {
            source_id,
            path: path.clone(),
            error,
        })?;
        let mut columns = Vec::with_capacity(self.source.columns.len());
        for column in &self.source.columns {
            let index = headers
                .iter()
                .position(|h| h.trim() == column.name)
                .ok_or_else(|| ReaderError::MissingColumn {
                    source_id,
                    path: path.clone(),
                    column: column.name.clone(),
                })?;
            columns.push(ResolvedColumn {
                index,
                name: column.name.clone(),
                key: column.key().to_string(),
                column_type: column.column_type,
                time: column.time_parser(),
            });
        }

        let replay_rows = replay.as_ref().map(BTreeSet::len);
        match replay_rows {
            Some(count) => info!(source_id, path = %path, rows = count, "Replaying failed rows"),
            None => info!(source_id, path = %path, "Reading file"),
        }

        self.state = State::Open(Box::new(OpenFile {
            source_id,
            path: path.clone(),
            reader,
            columns,
            replay,
            row_number: 0,
            ended: false,
        }));

        Ok(Some(OpenedFile {
            source_id,
            path,
            replay_rows,
        }))
    }

    /// Fill one batch. Records are read and parsed outside the ledger
    /// transaction so the write gate is never held across file I/O. Rows
    /// already `COMPLETED` are dropped when recorded, so reading repeats
    /// until the batch is full or the file ends.
    async fn fill_batch(&self, file: &mut OpenFile) -> Result<Batch, ReaderError> {
        let mut batch = Batch {
            source_id: file.source_id,
            path: file.path.clone(),
            rows: Vec::new(),
            rejected: Vec::new(),
        };

        while batch.emitted() < self.batch_size && !file.ended {
            let read = Self::read_ahead(file, self.batch_size - batch.emitted()).await?;
            self.record(file, read, &mut batch).await?;
        }

        debug!(
            source_id = batch.source_id,
            rows = batch.rows.len(),
            rejected = batch.rejected.len(),
            "Batch read"
        );
        Ok(batch)
    }

    async fn read_ahead(file: &mut OpenFile, wanted: usize) -> Result<Vec<ReadRow>, ReaderError> {
        let mut read = Vec::with_capacity(wanted);
        let mut record = StringRecord::new();

        while read.len() < wanted {
            if file.replay_done() {
                file.ended = true;
                break;
            }
            let more = file
                .reader
                .read_record(&mut record)
                .await
                .map_err(|error| ReaderError::Read {
                    source_id: file.source_id,
                    path: file.path.clone(),
                    error,
                })?;
            if !more {
                file.ended = true;
                break;
            }

            file.row_number += 1;
            let row_number = file.row_number;
            if let Some(ref set) = file.replay {
                if !set.contains(&row_number) {
                    continue;
                }
            }
            read.push(ReadRow {
                identity: RowIdentity::derive(file.source_id, &file.path, row_number),
                row_number,
                parsed: file.parse(&record),
            });
        }
        Ok(read)
    }

    /// Record read rows in one transaction and move them into `batch`.
    async fn record(&self, file: &OpenFile, read: Vec<ReadRow>, batch: &mut Batch) -> Result<(), ReaderError> {
        let source_id = file.source_id;
        let progress = |error: ProgressError| ReaderError::Progress { source_id, error };
        let initial = if file.replay.is_some() {
            RowStatus::Retry
        } else {
            RowStatus::Pending
        };

        let mut tx = self.store.begin().await.map_err(progress)?;
        for row in read {
            let stored = rows::upsert(&mut tx, source_id, &row.identity, row.row_number, initial, None)
                .await
                .map_err(progress)?;
            if stored.is_none() {
                continue;
            }

            match row.parsed {
                Ok((event_time, fields)) => batch.rows.push(ParsedRow {
                    identity: row.identity,
                    row_number: row.row_number,
                    event_time,
                    fields,
                }),
                Err(reason) => {
                    warn!(source_id, row = row.row_number, error = %reason, "Row rejected");
                    rows::update_status(&mut tx, source_id, &row.identity, RowStatus::Failed, Some(&reason))
                        .await
                        .map_err(progress)?;
                    batch.rejected.push(row.identity);
                },
            }
        }
        if file.ended && file.replay.is_none() {
            sources::set_total_rows(&mut tx, source_id, file.row_number)
                .await
                .map_err(progress)?;
        }
        tx.commit().await.map_err(progress)
    }

    /// Drop the open file without finishing it; the next read moves on to
    /// the following file.
    pub fn abandon_file(&mut self) {
        if let State::Open(ref file) = self.state {
            debug!(source_id = file.source_id, path = %file.path, "File abandoned");
            self.state = State::Closed;
        }
    }

    /// Drop the open file, if any, and stop reading. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let State::Open(ref file) = self.state {
            debug!(source_id = file.source_id, path = %file.path, "File closed early");
        }
        self.pending.clear();
        self.state = State::Exhausted;
    }
}
