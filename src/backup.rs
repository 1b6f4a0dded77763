//! Backup file layout shared by export and restore.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

pub const BACKUP_HEADER: [&str; 10] = [
    "Symbol",
    "TimeFrame",
    "OpenTime",
    "OpenPrice",
    "HighPrice",
    "LowPrice",
    "ClosePrice",
    "Volume",
    "CloseTime",
    "CreatedAt",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupConfig {
    pub dir: PathBuf,
    /// Name of the CSV file, also used as the entry name inside a zip.
    pub file_name: String,
    pub zip: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/backups"),
            file_name: "market_data_backup.csv".to_string(),
            zip: false,
        }
    }
}

impl BackupConfig {
    /// File written by export and read by restore.
    pub fn backup_path(&self) -> PathBuf {
        let csv_path = self.dir.join(&self.file_name);
        if self.zip {
            csv_path.with_extension("zip")
        } else {
            csv_path
        }
    }
}

/// `<file>.sha256` next to the backup.
pub fn checksum_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".sha256");
    path.with_file_name(name)
}

pub(crate) fn is_zip_path(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("zip"))
        .unwrap_or(false)
}

pub(crate) fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = tmp_path(path);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(tmp, path)
}

pub(crate) fn file_sha256_hex(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub(crate) fn checksum_line(digest_hex: &str, path: &Path) -> String {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    format!("{digest_hex}  {name}\n")
}

/// First token of a sidecar, lowercased, if it is a 64-char hex digest.
pub(crate) fn parse_checksum_line(content: &str) -> Option<String> {
    let token = content.split_whitespace().next()?;
    if token.len() != 64 || hex::decode(token).is_err() {
        return None;
    }
    Some(token.to_ascii_lowercase())
}

/// Share of `total` covered by `done`, as a percentage. An empty input is complete.
pub(crate) fn percent_of(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    done as f64 * 100.0 / total as f64
}
