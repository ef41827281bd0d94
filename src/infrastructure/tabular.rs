//! # Tabular Input & Output
//!
//! Reading key columns out of delimited text and spreadsheets, and persisting
//! result records as a merged, deduplicated delimited table.
//!
//! Output writes are whole-file replacements (temp sibling + rename) so a crash
//! mid-write never leaves a truncated table behind. When the target is locked by
//! another process (spreadsheet apps on Windows hold an exclusive lock), the
//! write is retried with a slowly growing backoff and finally diverted to a
//! uniquely named sibling file.

#![allow(clippy::uninlined_format_args)]

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::{KEY_COLUMN, Key, RECORD_COLUMNS, Record};

/// Tabular read/write errors
#[derive(Error, Debug)]
pub enum TabularError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Malformed delimited file {path:?}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("Spreadsheet error in {path:?}: {message}")]
    Spreadsheet { path: PathBuf, message: String },

    #[error("Spreadsheet support is not compiled in; cannot read {0:?}")]
    CodecUnavailable(PathBuf),

    #[error("Unsupported tabular format: {0:?}")]
    UnsupportedFormat(PathBuf),
}

impl TabularError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn csv(path: &Path, source: csv::Error) -> Self {
        Self::Csv {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// File formats recognised by extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabularFormat {
    Csv,
    Tsv,
    Spreadsheet,
}

impl TabularFormat {
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "csv" => Some(Self::Csv),
            "tsv" | "tab" => Some(Self::Tsv),
            "xlsx" | "xlsm" | "xlsb" | "xls" | "ods" => Some(Self::Spreadsheet),
            _ => None,
        }
    }

    /// Formats the result writer can produce
    #[must_use]
    pub const fn is_writable(self) -> bool {
        matches!(self, Self::Csv | Self::Tsv)
    }

    #[must_use]
    pub const fn delimiter(self) -> u8 {
        match self {
            Self::Tsv => b'\t',
            _ => b',',
        }
    }
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// Read raw key candidates from the first column of a csv/tsv/spreadsheet file.
///
/// A first row whose value is not purely numeric is a header and skipped;
/// blank cells are dropped. Values are returned untouched otherwise, the caller
/// normalizes them.
pub fn read_keys(path: &Path) -> Result<Vec<String>, TabularError> {
    match TabularFormat::from_path(path) {
        Some(format @ (TabularFormat::Csv | TabularFormat::Tsv)) => read_delimited_column(path, format),
        Some(TabularFormat::Spreadsheet) => read_spreadsheet_column(path),
        None => Err(TabularError::UnsupportedFormat(path.to_path_buf())),
    }
}

/// [`read_keys`] on the blocking pool
pub async fn load_keys(path: &Path) -> Result<Vec<String>, TabularError> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || read_keys(&owned))
        .await
        .map_err(|e| TabularError::io(path, io::Error::other(e)))?
}

fn collect_first_column<I>(cells: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut values = Vec::new();
    let mut first = true;
    for cell in cells {
        let value = cell.trim().trim_start_matches('\u{feff}').trim().to_string();
        if value.is_empty() {
            continue;
        }
        if first {
            first = false;
            if !value.chars().all(|c| c.is_ascii_digit()) {
                debug!("Skipping header cell {:?}", value);
                continue;
            }
        }
        values.push(value);
    }
    values
}

fn read_delimited_column(path: &Path, format: TabularFormat) -> Result<Vec<String>, TabularError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(format.delimiter())
        .from_path(path)
        .map_err(|e| TabularError::csv(path, e))?;

    let mut cells = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|e| TabularError::csv(path, e))?;
        if let Some(cell) = row.get(0) {
            cells.push(cell.to_string());
        }
    }
    Ok(collect_first_column(cells))
}

#[cfg(feature = "spreadsheet")]
fn read_spreadsheet_column(path: &Path) -> Result<Vec<String>, TabularError> {
    use calamine::{Data, Reader, open_workbook_auto};

    fn cell_text(cell: &Data) -> String {
        match cell {
            Data::Empty => String::new(),
            Data::String(s) => s.clone(),
            Data::Int(i) => i.to_string(),
            // Numeric cells come back as floats; `501.0` must read as `501`
            #[allow(clippy::cast_possible_truncation)]
            Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
            other => other.to_string(),
        }
    }

    let spreadsheet_err = |message: String| TabularError::Spreadsheet {
        path: path.to_path_buf(),
        message,
    };

    let mut workbook = open_workbook_auto(path).map_err(|e| spreadsheet_err(e.to_string()))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| spreadsheet_err("workbook has no worksheets".into()))?
        .map_err(|e| spreadsheet_err(e.to_string()))?;

    let cells = range.rows().filter_map(|row| row.first().map(cell_text));
    Ok(collect_first_column(cells))
}

#[cfg(not(feature = "spreadsheet"))]
fn read_spreadsheet_column(path: &Path) -> Result<Vec<String>, TabularError> {
    Err(TabularError::CodecUnavailable(path.to_path_buf()))
}

// ---------------------------------------------------------------------------
// Output paths
// ---------------------------------------------------------------------------

/// `result_<input-stem>.csv` next to the input
#[must_use]
pub fn default_output_path(input: &Path) -> PathBuf {
    let stem = input.file_stem().and_then(|s| s.to_str()).unwrap_or("input");
    input.with_file_name(format!("result_{}.csv", stem))
}

/// Replace an unwritable output format with `.csv`; `None` when no change is needed
#[must_use]
pub fn substitute_writable_format(path: &Path) -> Option<PathBuf> {
    match TabularFormat::from_path(path) {
        Some(format) if format.is_writable() => None,
        _ => Some(path.with_extension("csv")),
    }
}

/// `<stem>_<pid>_<unix-ts>.<ext>` sibling used when the target stays locked
#[must_use]
pub fn alternate_output_path(path: &Path) -> PathBuf {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("result");
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("csv");
    let ts = chrono::Utc::now().timestamp();
    path.with_file_name(format!("{}_{}_{}.{}", stem, std::process::id(), ts, ext))
}

fn is_lock_error(error: &io::Error) -> bool {
    // 32/33: ERROR_SHARING_VIOLATION / ERROR_LOCK_VIOLATION on Windows
    error.kind() == io::ErrorKind::PermissionDenied
        || (cfg!(windows) && matches!(error.raw_os_error(), Some(32 | 33)))
}

// ---------------------------------------------------------------------------
// Output writer
// ---------------------------------------------------------------------------

/// Persists result records, merging with whatever is already on disk
#[async_trait]
pub trait ResultWriter: Send + Sync {
    /// Merge `records` into the output and return the path actually written
    async fn write(&self, records: &[Record]) -> Result<PathBuf, TabularError>;

    /// Keys already present in the output (resumption set)
    async fn existing_keys(&self) -> Result<HashSet<Key>, TabularError>;

    /// Configured output location
    fn target(&self) -> &Path;
}

/// Writes one complete table to one path. Blocking; called off the async runtime.
pub trait TableSink: Send + Sync + fmt::Debug {
    fn write_table(&self, path: &Path, delimiter: u8, rows: &[Vec<String>]) -> io::Result<()>;
}

/// Header plus rows into a hidden temp sibling, then renamed over the target
#[derive(Debug, Default, Clone, Copy)]
pub struct AtomicFileSink;

impl TableSink for AtomicFileSink {
    fn write_table(&self, path: &Path, delimiter: u8, rows: &[Vec<String>]) -> io::Result<()> {
        let file_name = path.file_name().and_then(|s| s.to_str()).unwrap_or("result");
        let tmp_path = path.with_file_name(format!(".{}.tmp", file_name));

        let result = (|| {
            let mut writer = csv::WriterBuilder::new().delimiter(delimiter).from_path(&tmp_path)?;
            writer.write_record(RECORD_COLUMNS)?;
            for row in rows {
                writer.write_record(row)?;
            }
            writer.flush()?;
            Ok::<(), csv::Error>(())
        })();

        if let Err(e) = result {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(match e.into_kind() {
                csv::ErrorKind::Io(io) => io,
                other => io::Error::other(format!("{:?}", other)),
            });
        }

        std::fs::rename(&tmp_path, path).inspect_err(|_| {
            let _ = std::fs::remove_file(&tmp_path);
        })
    }
}

/// csv/tsv writer with header repair, last-write-wins merge and lock tolerance
#[derive(Debug, Clone)]
pub struct DelimitedResultWriter {
    path: PathBuf,
    format: TabularFormat,
    retries: u32,
    base_backoff: Duration,
    sink: Arc<dyn TableSink>,
}

impl DelimitedResultWriter {
    pub fn new(path: impl Into<PathBuf>, retries: u32, base_backoff: Duration) -> Result<Self, TabularError> {
        let path = path.into();
        let format = TabularFormat::from_path(&path)
            .filter(|f| f.is_writable())
            .ok_or_else(|| TabularError::UnsupportedFormat(path.clone()))?;
        Ok(Self {
            path,
            format,
            retries,
            base_backoff,
            sink: Arc::new(AtomicFileSink),
        })
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn TableSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Delay before retry number `attempt` (0-based): `base * (1 + attempt / 3)`
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff.mul_f64(1.0 + f64::from(attempt) / 3.0)
    }

    fn merge_rows(existing: Vec<(Key, Vec<String>)>, records: &[Record]) -> Vec<Vec<String>> {
        let mut rows: Vec<Vec<String>> = Vec::new();
        let mut index: HashMap<Key, usize> = HashMap::new();

        let new_rows = records.iter().map(|r| (r.key.clone(), r.to_row()));
        for (key, row) in existing.into_iter().chain(new_rows) {
            match index.get(&key) {
                Some(&pos) => rows[pos] = row,
                None => {
                    index.insert(key, rows.len());
                    rows.push(row);
                }
            }
        }
        rows
    }

    async fn load_rows(&self) -> Result<Vec<(Key, Vec<String>)>, TabularError> {
        let path = self.path.clone();
        let format = self.format;
        tokio::task::spawn_blocking(move || read_result_rows(&path, format))
            .await
            .map_err(|e| TabularError::io(&self.path, io::Error::other(e)))?
    }

    async fn write_table(&self, path: &Path, rows: &Arc<Vec<Vec<String>>>) -> io::Result<()> {
        let sink = Arc::clone(&self.sink);
        let path = path.to_path_buf();
        let rows = Arc::clone(rows);
        let delimiter = self.format.delimiter();
        tokio::task::spawn_blocking(move || sink.write_table(&path, delimiter, &rows))
            .await
            .map_err(io::Error::other)?
    }
}

#[async_trait]
impl ResultWriter for DelimitedResultWriter {
    async fn write(&self, records: &[Record]) -> Result<PathBuf, TabularError> {
        let existing = self.load_rows().await?;
        let rows = Arc::new(Self::merge_rows(existing, records));

        for attempt in 0..self.retries {
            match self.write_table(&self.path, &rows).await {
                Ok(()) => {
                    debug!("Wrote {} rows to {:?}", rows.len(), self.path);
                    return Ok(self.path.clone());
                }
                Err(e) if is_lock_error(&e) => {
                    let backoff = self.backoff(attempt);
                    warn!(
                        "🔒 Output {:?} is locked (attempt {}/{}), retrying in {:?}",
                        self.path,
                        attempt + 1,
                        self.retries,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(TabularError::io(&self.path, e)),
            }
        }

        let alternate = alternate_output_path(&self.path);
        warn!("Output {:?} stayed locked, writing to {:?} instead", self.path, alternate);
        self.write_table(&alternate, &rows)
            .await
            .map_err(|e| TabularError::io(&alternate, e))?;
        info!("💾 Wrote {} rows to alternate file {:?}", rows.len(), alternate);
        Ok(alternate)
    }

    async fn existing_keys(&self) -> Result<HashSet<Key>, TabularError> {
        Ok(self.load_rows().await?.into_iter().map(|(key, _)| key).collect())
    }

    fn target(&self) -> &Path {
        &self.path
    }
}

/// Read a prior result table, normalising its rows to [`RECORD_COLUMNS`].
///
/// - header identical to the schema: rows taken as they are
/// - header differs but has a `ZIP` column: columns mapped by name
/// - no recognisable header: rows taken positionally, the first row too when it holds a key
pub fn read_result_rows(path: &Path, format: TabularFormat) -> Result<Vec<(Key, Vec<String>)>, TabularError> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.len() == 0 => return Ok(Vec::new()),
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(TabularError::io(path, e)),
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(format.delimiter())
        .from_path(path)
        .map_err(|e| TabularError::csv(path, e))?;

    let mut raw_rows = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|e| TabularError::csv(path, e))?;
        if row.iter().all(|cell| cell.trim().is_empty()) {
            continue;
        }
        raw_rows.push(row.iter().map(ToString::to_string).collect::<Vec<_>>());
    }

    let Some(first) = raw_rows.first() else {
        return Ok(Vec::new());
    };
    let header: Vec<String> = first
        .iter()
        .map(|c| c.trim().trim_start_matches('\u{feff}').to_string())
        .collect();

    let width = RECORD_COLUMNS.len();
    let rows: Vec<Vec<String>> = if header.iter().map(String::as_str).eq(RECORD_COLUMNS) {
        raw_rows.into_iter().skip(1).collect()
    } else if let Some(positions) = column_positions(&header) {
        warn!("Output {:?} has a different header, remapping columns by name", path);
        raw_rows
            .into_iter()
            .skip(1)
            .map(|row| {
                positions
                    .iter()
                    .map(|pos| pos.and_then(|i| row.get(i)).cloned().unwrap_or_default())
                    .collect()
            })
            .collect()
    } else {
        warn!("Output {:?} has no recognisable header, rebuilding it", path);
        let first_is_data = header.first().is_some_and(|c| !c.is_empty() && c.chars().all(|ch| ch.is_ascii_digit()));
        raw_rows.into_iter().skip(usize::from(!first_is_data)).collect()
    };

    Ok(rows
        .into_iter()
        .filter_map(|mut row| {
            row.resize(width, String::new());
            let key = Key::parse(&row[0])?;
            row[0] = key.to_string();
            Some((key, row))
        })
        .collect())
}

fn column_positions(header: &[String]) -> Option<Vec<Option<usize>>> {
    let find = |name: &str| header.iter().position(|h| h.eq_ignore_ascii_case(name));
    find(KEY_COLUMN)?;
    Some(RECORD_COLUMNS.iter().map(|col| find(col)).collect())
}
