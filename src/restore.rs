//! Bulk restore of a CSV backup into the candle table.

use std::fmt;
use std::fs;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};

use csv::StringRecord;
use thiserror::Error;
use tracing::{info, warn};
use zip::ZipArchive;

use crate::backup::{
    checksum_path, file_sha256_hex, is_zip_path, parse_checksum_line, percent_of, BackupConfig,
    BACKUP_HEADER,
};
use crate::candle::{format_ts_ms, parse_interval, parse_ts_ms, Candle};
use crate::store::{KeySummary, SqliteCandleStore, StoreError, StoredCandle};

pub const RESTORE_BATCH_SIZE: usize = 1_000;
const SKIPPED_LINES_KEPT: usize = 100;

/// What to do when the table already holds rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnExistingData {
    #[default]
    Abort,
    Overwrite,
    Append,
}

impl OnExistingData {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Abort => "abort",
            Self::Overwrite => "overwrite",
            Self::Append => "append",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "abort" => Some(Self::Abort),
            "overwrite" | "replace" => Some(Self::Overwrite),
            "append" => Some(Self::Append),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreConfig {
    pub input_path: PathBuf,
    pub verify_checksum: bool,
    pub on_existing: OnExistingData,
    pub batch_size: usize,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            input_path: BackupConfig::default().backup_path(),
            verify_checksum: true,
            on_existing: OnExistingData::Abort,
            batch_size: RESTORE_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("invalid restore config: {0}")]
    InvalidConfig(String),
    #[error("backup file {0} does not exist")]
    MissingBackup(PathBuf),
    #[error("zip archive {0} has no CSV entry")]
    MissingCsvEntry(PathBuf),
    #[error("unexpected backup header: {found:?}")]
    InvalidHeader { found: Vec<String> },
    #[error("invalid checksum sidecar {path}: '{content}'")]
    InvalidChecksumSidecar { path: PathBuf, content: String },
    #[error("checksum mismatch for {path}: expected {expected}, actual {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("table already holds {rows} rows and the existing-data policy is abort")]
    ExistingData { rows: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub input_path: PathBuf,
    pub checksum_verified: bool,
    pub on_existing: OnExistingData,
    pub cleared_rows: u64,
    pub rows_read: u64,
    pub rows_imported: u64,
    pub rows_skipped: u64,
    /// Starting line of each skipped record, up to the first 100.
    pub skipped_lines: Vec<u64>,
    pub batches: u64,
    pub final_row_count: u64,
    pub summaries: Vec<KeySummary>,
}

impl fmt::Display for RestoreReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "restore completed from {}", self.input_path.display())?;
        writeln!(
            f,
            "  checksum:  {}",
            if self.checksum_verified {
                "verified"
            } else {
                "not verified"
            }
        )?;
        writeln!(
            f,
            "  policy:    {} ({} rows cleared)",
            self.on_existing.as_str(),
            self.cleared_rows
        )?;
        writeln!(
            f,
            "  rows:      {} read, {} imported, {} skipped in {} batches",
            self.rows_read, self.rows_imported, self.rows_skipped, self.batches
        )?;
        if !self.skipped_lines.is_empty() {
            let lines: Vec<String> = self.skipped_lines.iter().map(u64::to_string).collect();
            writeln!(f, "  skipped:   lines {}", lines.join(", "))?;
        }
        write!(f, "  table:     {} rows", self.final_row_count)?;
        for summary in &self.summaries {
            write!(
                f,
                "\n    {} ({}): {} rows ({} to {})",
                summary.symbol,
                summary.time_frame,
                summary.rows,
                format_ts_ms(summary.first_open_time_ms),
                format_ts_ms(summary.last_open_time_ms)
            )?;
        }
        Ok(())
    }
}

/// Loads a `.csv` or `.zip` backup into the store.
///
/// The checksum and header are checked before the existing-data policy is
/// applied, so a bad file never clears the table. Each batch commits on its
/// own; a store failure mid-file leaves earlier batches in place.
pub fn restore_backup(
    store: &SqliteCandleStore,
    cfg: &RestoreConfig,
) -> Result<RestoreReport, RestoreError> {
    if cfg.batch_size == 0 {
        return Err(RestoreError::InvalidConfig(
            "batch_size must be greater than zero".to_string(),
        ));
    }
    let path = &cfg.input_path;
    if !path.is_file() {
        return Err(RestoreError::MissingBackup(path.clone()));
    }

    let checksum_verified = if cfg.verify_checksum {
        verify_checksum(path)?
    } else {
        false
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(open_backup(path)?);
    let header = reader.headers()?.clone();
    if !header_matches(&header) {
        return Err(RestoreError::InvalidHeader {
            found: header.iter().map(str::to_string).collect(),
        });
    }

    let total_rows = count_records(path)?;

    let existing = store.row_count()?;
    let cleared_rows = match cfg.on_existing {
        OnExistingData::Abort if existing > 0 => {
            return Err(RestoreError::ExistingData { rows: existing });
        }
        OnExistingData::Overwrite if existing > 0 => store.clear()?,
        _ => 0,
    };

    info!(
        component = "restore",
        event = "restore.start",
        path = %path.display(),
        policy = cfg.on_existing.as_str(),
        total_rows,
        existing_rows = existing,
        cleared_rows,
        checksum_verified
    );

    let mut rows_read = 0u64;
    let mut rows_imported = 0u64;
    let mut rows_skipped = 0u64;
    let mut skipped_lines: Vec<u64> = Vec::new();
    let mut batches = 0u64;
    let mut batch: Vec<StoredCandle> = Vec::with_capacity(cfg.batch_size);

    for record in reader.records() {
        rows_read += 1;
        let (line, parsed) = match record {
            Ok(record) => (
                record.position().map(|pos| pos.line()),
                parse_backup_record(&record),
            ),
            Err(err) if err.is_io_error() => return Err(err.into()),
            Err(err) => (err.position().map(|pos| pos.line()), Err(err.to_string())),
        };
        match parsed {
            Ok(row) => batch.push(row),
            Err(reason) => {
                rows_skipped += 1;
                let line = line.unwrap_or_default();
                if skipped_lines.len() < SKIPPED_LINES_KEPT {
                    skipped_lines.push(line);
                }
                warn!(
                    component = "restore",
                    event = "restore.row.skipped",
                    line,
                    reason = %reason
                );
                continue;
            }
        }

        if batch.len() >= cfg.batch_size {
            rows_imported +=
                commit_batch(store, &mut batch, &mut batches, rows_read, total_rows)?;
        }
    }
    if !batch.is_empty() {
        rows_imported += commit_batch(store, &mut batch, &mut batches, rows_read, total_rows)?;
    }

    let final_row_count = store.row_count()?;
    let summaries = store.key_summaries()?;

    info!(
        component = "restore",
        event = "restore.done",
        path = %path.display(),
        rows_read,
        rows_imported,
        rows_skipped,
        batches,
        final_row_count
    );

    Ok(RestoreReport {
        input_path: path.clone(),
        checksum_verified,
        on_existing: cfg.on_existing,
        cleared_rows,
        rows_read,
        rows_imported,
        rows_skipped,
        skipped_lines,
        batches,
        final_row_count,
        summaries,
    })
}

fn commit_batch(
    store: &SqliteCandleStore,
    batch: &mut Vec<StoredCandle>,
    batches: &mut u64,
    rows_read: u64,
    total_rows: u64,
) -> Result<u64, RestoreError> {
    let inserted = store.insert_stored(batch)? as u64;
    *batches += 1;
    info!(
        component = "restore",
        event = "restore.batch.committed",
        batch = *batches,
        rows = inserted,
        rows_read,
        total_rows,
        percent = percent_of(rows_read, total_rows)
    );
    batch.clear();
    Ok(inserted)
}

/// `Ok(false)` when no sidecar exists next to the backup.
fn verify_checksum(path: &Path) -> Result<bool, RestoreError> {
    let sidecar = checksum_path(path);
    if !sidecar.is_file() {
        warn!(
            component = "restore",
            event = "restore.checksum.missing",
            path = %path.display()
        );
        return Ok(false);
    }

    let content = fs::read_to_string(&sidecar)?;
    let expected =
        parse_checksum_line(&content).ok_or_else(|| RestoreError::InvalidChecksumSidecar {
            path: sidecar.clone(),
            content: content.trim().to_string(),
        })?;
    let actual = file_sha256_hex(path)?;
    if actual != expected {
        return Err(RestoreError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected,
            actual,
        });
    }
    Ok(true)
}

/// Data records in the backup, read in a separate pass so batches can report
/// how far through the file they are.
fn count_records(path: &Path) -> Result<u64, RestoreError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(open_backup(path)?);
    let mut record = csv::ByteRecord::new();
    let mut total = 0u64;
    loop {
        match reader.read_byte_record(&mut record) {
            Ok(true) => total += 1,
            Ok(false) => break,
            Err(err) if err.is_io_error() => return Err(err.into()),
            Err(_) => total += 1,
        }
    }
    Ok(total)
}

fn open_backup(path: &Path) -> Result<Box<dyn Read>, RestoreError> {
    if !is_zip_path(path) {
        return Ok(Box::new(fs::File::open(path)?));
    }

    let mut archive = ZipArchive::new(fs::File::open(path)?)?;
    for idx in 0..archive.len() {
        let mut entry = archive.by_index(idx)?;
        if entry.is_dir() || !entry.name().to_ascii_lowercase().ends_with(".csv") {
            continue;
        }
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf)?;
        return Ok(Box::new(Cursor::new(buf)));
    }
    Err(RestoreError::MissingCsvEntry(path.to_path_buf()))
}

fn header_matches(header: &StringRecord) -> bool {
    header.len() == BACKUP_HEADER.len()
        && header
            .iter()
            .zip(BACKUP_HEADER)
            .all(|(found, expected)| found.trim().trim_start_matches('\u{feff}') == expected)
}

fn parse_backup_record(record: &StringRecord) -> Result<StoredCandle, String> {
    if record.len() != BACKUP_HEADER.len() {
        return Err(format!(
            "expected {} fields, found {}",
            BACKUP_HEADER.len(),
            record.len()
        ));
    }
    let symbol = field(record, 0);
    if symbol.is_empty() {
        return Err("empty Symbol".to_string());
    }
    let interval = parse_interval(field(record, 1)).map_err(|err| err.to_string())?;
    let open_time_ms = parse_timestamp(field(record, 2), "OpenTime")?;
    let close_time_ms = match field(record, 8) {
        "" => open_time_ms + interval.duration_ms(),
        raw => parse_timestamp(raw, "CloseTime")?,
    };
    let created_at_ms = match field(record, 9) {
        "" => None,
        raw => Some(parse_timestamp(raw, "CreatedAt")?),
    };

    Ok(StoredCandle {
        candle: Candle {
            symbol: symbol.to_string(),
            interval,
            open_time_ms,
            open: parse_price(field(record, 3), "OpenPrice")?,
            high: parse_price(field(record, 4), "HighPrice")?,
            low: parse_price(field(record, 5), "LowPrice")?,
            close: parse_price(field(record, 6), "ClosePrice")?,
            volume: parse_price(field(record, 7), "Volume")?,
            close_time_ms,
        },
        created_at_ms,
    })
}

fn field(record: &StringRecord, idx: usize) -> &str {
    record.get(idx).unwrap_or("").trim()
}

fn parse_timestamp(raw: &str, column: &str) -> Result<i64, String> {
    parse_ts_ms(raw).ok_or_else(|| format!("invalid {column} '{raw}'"))
}

fn parse_price(raw: &str, column: &str) -> Result<f64, String> {
    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() && value >= 0.0 => Ok(value),
        _ => Err(format!("invalid {column} '{raw}'")),
    }
}
