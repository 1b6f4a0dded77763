//! Environment-driven configuration for the binaries.
//!
//! Every variable is optional; unset or blank values keep the defaults of the
//! corresponding config struct. Values that are present but unparseable are
//! rejected with the variable name instead of being ignored.

use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

use crate::backup::BackupConfig;
use crate::candle::{parse_interval, parse_ts_ms};
use crate::feed::{FeedConfig, BINANCE_MAX_PAGE_LIMIT};
use crate::importer::ImportConfig;
use crate::observability::parse_bool;
use crate::restore::{OnExistingData, RestoreConfig};
use crate::store::StoreConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}='{value}' is invalid: {reason}")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}

pub(crate) fn read_var(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

fn invalid(var: &'static str, value: &str, reason: impl Display) -> ConfigError {
    ConfigError::InvalidValue {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_var<T>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match read_var(var) {
        Some(raw) => raw.parse().map_err(|err| invalid(var, &raw, err)),
        None => Ok(default),
    }
}

fn bool_var(var: &'static str, default: bool) -> Result<bool, ConfigError> {
    match read_var(var) {
        Some(raw) => parse_bool(&raw).ok_or_else(|| invalid(var, &raw, "expected true/false")),
        None => Ok(default),
    }
}

/// Epoch as integer milliseconds, `YYYY-MM-DD` or `YYYY-MM-DD HH:MM:SS` (UTC).
fn parse_epoch(raw: &str) -> Option<i64> {
    if let Ok(ms) = raw.parse::<i64>() {
        return Some(ms);
    }
    parse_ts_ms(raw).or_else(|| parse_ts_ms(&format!("{raw} 00:00:00")))
}

pub fn store_config_from_env() -> Result<StoreConfig, ConfigError> {
    let mut cfg = StoreConfig::default();
    if let Some(path) = read_var("KLINE_INGEST_DB_PATH") {
        cfg.path = PathBuf::from(path);
    }
    Ok(cfg)
}

pub fn feed_config_from_env() -> Result<FeedConfig, ConfigError> {
    let defaults = FeedConfig::default();
    let base_url = read_var("KLINE_INGEST_FEED_BASE_URL").unwrap_or(defaults.base_url);
    if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
        return Err(invalid(
            "KLINE_INGEST_FEED_BASE_URL",
            &base_url,
            "expected an http(s) URL",
        ));
    }
    Ok(FeedConfig {
        base_url,
        http_timeout_ms: parse_var("KLINE_INGEST_HTTP_TIMEOUT_MS", defaults.http_timeout_ms)?,
    })
}

pub fn import_config_from_env() -> Result<ImportConfig, ConfigError> {
    let defaults = ImportConfig::default();

    let symbol = read_var("KLINE_INGEST_SYMBOL")
        .map(|raw| raw.to_ascii_uppercase())
        .unwrap_or(defaults.symbol);
    let interval = match read_var("KLINE_INGEST_INTERVAL") {
        Some(raw) => {
            parse_interval(&raw).map_err(|err| invalid("KLINE_INGEST_INTERVAL", &raw, err))?
        }
        None => defaults.interval,
    };

    let page_limit = parse_var("KLINE_INGEST_PAGE_LIMIT", defaults.page_limit)?;
    if page_limit == 0 || page_limit > BINANCE_MAX_PAGE_LIMIT {
        return Err(invalid(
            "KLINE_INGEST_PAGE_LIMIT",
            &page_limit.to_string(),
            format!("must be within 1..={BINANCE_MAX_PAGE_LIMIT}"),
        ));
    }

    let epoch_ms = match read_var("KLINE_INGEST_EPOCH") {
        Some(raw) => parse_epoch(&raw).ok_or_else(|| {
            invalid(
                "KLINE_INGEST_EPOCH",
                &raw,
                "expected milliseconds, YYYY-MM-DD or YYYY-MM-DD HH:MM:SS",
            )
        })?,
        None => defaults.epoch_ms,
    };

    Ok(ImportConfig {
        symbol,
        interval,
        page_limit,
        epoch_ms,
        rate_limit_ms: parse_var("KLINE_INGEST_RATE_LIMIT_MS", defaults.rate_limit_ms)?,
        max_fetch_retries: parse_var("KLINE_INGEST_MAX_FETCH_RETRIES", defaults.max_fetch_retries)?,
        retry_backoff_ms: parse_var("KLINE_INGEST_RETRY_BACKOFF_MS", defaults.retry_backoff_ms)?,
        cadence: defaults.cadence,
    })
}

pub fn backup_config_from_env() -> Result<BackupConfig, ConfigError> {
    let defaults = BackupConfig::default();
    let file_name = read_var("KLINE_INGEST_BACKUP_FILE").unwrap_or(defaults.file_name);
    if file_name.contains(['/', '\\']) {
        return Err(invalid(
            "KLINE_INGEST_BACKUP_FILE",
            &file_name,
            "expected a bare file name; use KLINE_INGEST_BACKUP_DIR for the directory",
        ));
    }
    Ok(BackupConfig {
        dir: read_var("KLINE_INGEST_BACKUP_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.dir),
        file_name,
        zip: bool_var("KLINE_INGEST_BACKUP_ZIP", defaults.zip)?,
    })
}

pub fn restore_config_from_env() -> Result<RestoreConfig, ConfigError> {
    let defaults = RestoreConfig::default();
    let on_existing = match read_var("KLINE_INGEST_ON_EXISTING") {
        Some(raw) => OnExistingData::parse(&raw).ok_or_else(|| {
            invalid(
                "KLINE_INGEST_ON_EXISTING",
                &raw,
                "expected abort, overwrite or append",
            )
        })?,
        None => defaults.on_existing,
    };
    Ok(RestoreConfig {
        input_path: backup_config_from_env()?.backup_path(),
        verify_checksum: bool_var("KLINE_INGEST_VERIFY_CHECKSUM", defaults.verify_checksum)?,
        on_existing,
        batch_size: defaults.batch_size,
    })
}

/// Candidate stores for the probe: `KLINE_INGEST_PROBE_PATHS` (comma
/// separated) or, when unset, the configured store plus the default location.
pub fn probe_configs_from_env() -> Result<Vec<StoreConfig>, ConfigError> {
    let primary = store_config_from_env()?;
    let mut paths: Vec<PathBuf> = match read_var("KLINE_INGEST_PROBE_PATHS") {
        Some(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(PathBuf::from)
            .collect(),
        None => vec![primary.path.clone(), StoreConfig::default().path],
    };
    let mut seen = Vec::with_capacity(paths.len());
    paths.retain(|path| {
        if seen.contains(path) {
            false
        } else {
            seen.push(path.clone());
            true
        }
    });

    Ok(paths
        .into_iter()
        .map(|path| StoreConfig {
            path,
            ..primary.clone()
        })
        .collect())
}

#[cfg(test)]
pub(crate) mod test_env {
    use std::env;
    use std::sync::{Mutex, OnceLock};

    fn env_lock() -> &'static Mutex<()> {
        static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    /// Runs `f` with the given variables set (or removed), restoring them after.
    pub(crate) fn with_env_vars<R>(vars: &[(&str, Option<&str>)], f: impl FnOnce() -> R) -> R {
        let _guard = env_lock()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let previous: Vec<(String, Option<String>)> = vars
            .iter()
            .map(|(key, _)| ((*key).to_string(), env::var(key).ok()))
            .collect();

        for (key, value) in vars {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }

        let output = f();

        for (key, value) in previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }

        output
    }
}
