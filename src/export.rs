//! CSV export of the candle table.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;
use zip::write::SimpleFileOptions;
use zip::CompressionMethod;

use crate::backup::{
    checksum_line, checksum_path, file_sha256_hex, percent_of, tmp_path, write_atomic,
    BackupConfig, BACKUP_HEADER,
};
use crate::candle::format_ts_ms;
use crate::store::{SqliteCandleStore, StoreError, StoredCandle};

const PROGRESS_EVERY_ROWS: u64 = 10_000;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("invalid backup file name '{0}'")]
    InvalidFileName(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportReport {
    pub path: PathBuf,
    pub checksum_path: PathBuf,
    pub rows: u64,
    pub bytes: u64,
    pub sha256: String,
}

impl fmt::Display for ExportReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "export completed")?;
        writeln!(f, "  file:     {}", self.path.display())?;
        writeln!(f, "  size:     {:.1} MB", self.bytes as f64 / (1024.0 * 1024.0))?;
        writeln!(f, "  rows:     {}", self.rows)?;
        write!(f, "  sha256:   {}", self.sha256)
    }
}

/// Writes every stored row, ordered by open time, to the configured backup
/// file. The target only appears once it is complete; a checksum sidecar is
/// written next to it.
pub fn export_backup(
    store: &SqliteCandleStore,
    cfg: &BackupConfig,
) -> Result<ExportReport, ExportError> {
    if !store.path().exists() {
        return Err(StoreError::Missing(store.path().to_path_buf()).into());
    }
    if cfg.file_name.trim().is_empty() || cfg.file_name.contains(['/', '\\']) {
        return Err(ExportError::InvalidFileName(cfg.file_name.clone()));
    }

    fs::create_dir_all(&cfg.dir)?;
    let out_path = cfg.backup_path();
    let csv_tmp = tmp_path(&cfg.dir.join(&cfg.file_name));

    info!(
        component = "export",
        event = "export.start",
        store = %store.path().display(),
        path = %out_path.display(),
        zip = cfg.zip
    );

    let rows = match write_csv(store, &csv_tmp) {
        Ok(rows) => rows,
        Err(err) => {
            let _ = fs::remove_file(&csv_tmp);
            return Err(err);
        }
    };

    if cfg.zip {
        let zip_tmp = tmp_path(&out_path);
        let zipped = zip_single_entry(&csv_tmp, &zip_tmp, &cfg.file_name);
        fs::remove_file(&csv_tmp)?;
        if let Err(err) = zipped {
            let _ = fs::remove_file(&zip_tmp);
            return Err(err);
        }
        fs::rename(&zip_tmp, &out_path)?;
    } else {
        fs::rename(&csv_tmp, &out_path)?;
    }

    let sha256 = file_sha256_hex(&out_path)?;
    let sidecar = checksum_path(&out_path);
    write_atomic(&sidecar, checksum_line(&sha256, &out_path).as_bytes())?;
    let bytes = fs::metadata(&out_path)?.len();

    info!(
        component = "export",
        event = "export.done",
        path = %out_path.display(),
        rows,
        bytes,
        sha256 = %sha256
    );

    Ok(ExportReport {
        path: out_path,
        checksum_path: sidecar,
        rows,
        bytes,
        sha256,
    })
}

fn write_csv(store: &SqliteCandleStore, path: &Path) -> Result<u64, ExportError> {
    let file = fs::File::create(path)?;
    let mut writer = csv::Writer::from_writer(file);
    writer.write_record(BACKUP_HEADER)?;

    let total_rows = store.row_count()?;
    let mut written = 0u64;
    let rows = store.for_each_row_ordered(|row| -> Result<(), ExportError> {
        writer.write_record(backup_record(&row))?;
        written += 1;
        if written % PROGRESS_EVERY_ROWS == 0 || written == total_rows {
            info!(
                component = "export",
                event = "export.progress",
                rows_written = written,
                total_rows,
                percent = percent_of(written, total_rows)
            );
        }
        Ok(())
    })?;

    writer.flush()?;
    let file = writer
        .into_inner()
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;
    file.sync_all()?;
    Ok(rows)
}

fn backup_record(row: &StoredCandle) -> [String; 10] {
    let c = &row.candle;
    [
        c.symbol.clone(),
        c.interval.as_str().to_string(),
        format_ts_ms(c.open_time_ms),
        c.open.to_string(),
        c.high.to_string(),
        c.low.to_string(),
        c.close.to_string(),
        c.volume.to_string(),
        format_ts_ms(c.close_time_ms),
        row.created_at_ms.map(format_ts_ms).unwrap_or_default(),
    ]
}

fn zip_single_entry(src: &Path, dst: &Path, entry_name: &str) -> Result<(), ExportError> {
    let mut input = fs::File::open(src)?;
    let mut zip = zip::ZipWriter::new(fs::File::create(dst)?);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    zip.start_file(entry_name, options)?;
    io::copy(&mut input, &mut zip)?;
    let file = zip.finish()?;
    file.sync_all()?;
    Ok(())
}
