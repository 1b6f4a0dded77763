//! SQLite-backed candle store.
//!
//! Every call opens its own connection and releases it before returning. The
//! store keeps no in-memory state between calls, so the table itself is the
//! only resumption record.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::candle::{parse_interval, Candle, InstrumentKey};

pub const MARKET_DATA_TABLE: &str = "market_data";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/market_data.sqlite"),
            busy_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store at {0} does not exist")]
    Missing(PathBuf),
    #[error("stored row has unsupported time frame '{0}'")]
    UnknownTimeFrame(String),
    #[error("batch insert confirmed {confirmed} of {submitted} rows")]
    PartialInsert { submitted: usize, confirmed: usize },
}

/// Persisted candle row including its creation stamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCandle {
    pub candle: Candle,
    pub created_at_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySummary {
    pub symbol: String,
    pub time_frame: String,
    pub rows: u64,
    pub first_open_time_ms: i64,
    pub last_open_time_ms: i64,
}

/// Resume-point lookup and all-or-nothing batch persistence.
pub trait CandleStore {
    /// Highest stored open time for the key, `None` when the key has no rows.
    fn latest_open_time(&self, key: &InstrumentKey) -> Result<Option<i64>, StoreError>;

    /// Inserts the whole batch in one transaction and returns the row count.
    /// On failure nothing from the batch is applied.
    fn insert_batch(&self, rows: &[Candle]) -> Result<usize, StoreError>;
}

impl<T: CandleStore + ?Sized> CandleStore for &T {
    fn latest_open_time(&self, key: &InstrumentKey) -> Result<Option<i64>, StoreError> {
        (**self).latest_open_time(key)
    }

    fn insert_batch(&self, rows: &[Candle]) -> Result<usize, StoreError> {
        (**self).insert_batch(rows)
    }
}

#[derive(Debug, Clone)]
pub struct SqliteCandleStore {
    cfg: StoreConfig,
}

impl SqliteCandleStore {
    pub fn new(cfg: StoreConfig) -> Self {
        Self { cfg }
    }

    pub fn path(&self) -> &Path {
        &self.cfg.path
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        if let Some(parent) = self.cfg.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&self.cfg.path)?;
        conn.busy_timeout(Duration::from_millis(self.cfg.busy_timeout_ms))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            ",
        )?;
        ensure_schema(&conn)?;
        Ok(conn)
    }

    /// Inserts rows keeping their original creation stamps; rows without one
    /// are stamped with the current time.
    pub fn insert_stored(&self, rows: &[StoredCandle]) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut conn = self.connect()?;
        let now_ms = Utc::now().timestamp_millis();
        let tx = conn.transaction()?;
        let mut inserted = 0usize;
        {
            let mut stmt = tx.prepare(
                "
                INSERT INTO market_data (
                    symbol,
                    time_frame,
                    open_time_ms,
                    open_price,
                    high_price,
                    low_price,
                    close_price,
                    volume,
                    close_time_ms,
                    created_at_ms
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ",
            )?;

            for row in rows {
                let c = &row.candle;
                inserted += stmt.execute(params![
                    c.symbol,
                    c.interval.as_str(),
                    c.open_time_ms,
                    c.open,
                    c.high,
                    c.low,
                    c.close,
                    c.volume,
                    c.close_time_ms,
                    row.created_at_ms.unwrap_or(now_ms),
                ])?;
            }
        }

        if inserted != rows.len() {
            warn!(
                component = "store",
                event = "store.insert.rollback",
                submitted = rows.len(),
                confirmed = inserted
            );
            tx.rollback()?;
            return Err(StoreError::PartialInsert {
                submitted: rows.len(),
                confirmed: inserted,
            });
        }

        tx.commit()?;
        Ok(inserted)
    }

    pub fn row_count(&self) -> Result<u64, StoreError> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM market_data", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn key_row_count(&self, key: &InstrumentKey) -> Result<u64, StoreError> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM market_data WHERE symbol = ?1 AND time_frame = ?2",
            params![key.symbol, key.interval.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn key_summaries(&self) -> Result<Vec<KeySummary>, StoreError> {
        let conn = self.connect()?;
        key_summaries(&conn)
    }

    pub fn clear(&self) -> Result<u64, StoreError> {
        let conn = self.connect()?;
        let deleted = conn.execute("DELETE FROM market_data", [])?;
        Ok(deleted as u64)
    }

    /// Open times for one key in ascending order.
    pub fn open_times(&self, key: &InstrumentKey) -> Result<Vec<i64>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "
            SELECT open_time_ms
            FROM market_data
            WHERE symbol = ?1 AND time_frame = ?2
            ORDER BY open_time_ms
            ",
        )?;
        let times = stmt
            .query_map(params![key.symbol, key.interval.as_str()], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(times)
    }

    /// Streams every row ordered by open time without collecting the table.
    pub fn for_each_row_ordered<E>(
        &self,
        mut f: impl FnMut(StoredCandle) -> Result<(), E>,
    ) -> Result<u64, E>
    where
        E: From<StoreError>,
    {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare(
                "
                SELECT
                    symbol,
                    time_frame,
                    open_time_ms,
                    open_price,
                    high_price,
                    low_price,
                    close_price,
                    volume,
                    close_time_ms,
                    created_at_ms
                FROM market_data
                ORDER BY open_time_ms, symbol, time_frame
                ",
            )
            .map_err(StoreError::from)?;
        let mut rows = stmt.query([]).map_err(StoreError::from)?;

        let mut visited = 0u64;
        while let Some(row) = rows.next().map_err(StoreError::from)? {
            let stored = stored_candle_from_row(row)?;
            f(stored)?;
            visited += 1;
        }
        Ok(visited)
    }
}

impl CandleStore for SqliteCandleStore {
    fn latest_open_time(&self, key: &InstrumentKey) -> Result<Option<i64>, StoreError> {
        let conn = self.connect()?;
        let latest: Option<i64> = conn.query_row(
            "
            SELECT MAX(open_time_ms)
            FROM market_data
            WHERE symbol = ?1 AND time_frame = ?2
            ",
            params![key.symbol, key.interval.as_str()],
            |row| row.get(0),
        )?;
        Ok(latest)
    }

    fn insert_batch(&self, rows: &[Candle]) -> Result<usize, StoreError> {
        let stored: Vec<StoredCandle> = rows
            .iter()
            .cloned()
            .map(|candle| StoredCandle {
                candle,
                created_at_ms: None,
            })
            .collect();
        self.insert_stored(&stored)
    }
}

fn stored_candle_from_row(row: &rusqlite::Row<'_>) -> Result<StoredCandle, StoreError> {
    let time_frame: String = row.get(1)?;
    let interval =
        parse_interval(&time_frame).map_err(|_| StoreError::UnknownTimeFrame(time_frame))?;

    Ok(StoredCandle {
        candle: Candle {
            symbol: row.get(0)?,
            interval,
            open_time_ms: row.get(2)?,
            open: row.get(3)?,
            high: row.get(4)?,
            low: row.get(5)?,
            close: row.get(6)?,
            volume: row.get(7)?,
            close_time_ms: row.get(8)?,
        },
        created_at_ms: row.get(9)?,
    })
}

fn ensure_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS market_data (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            symbol TEXT NOT NULL,
            time_frame TEXT NOT NULL,
            open_time_ms INTEGER NOT NULL,
            open_price REAL NOT NULL,
            high_price REAL NOT NULL,
            low_price REAL NOT NULL,
            close_price REAL NOT NULL,
            volume REAL NOT NULL,
            close_time_ms INTEGER NOT NULL,
            created_at_ms INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_market_data_key_open
            ON market_data (symbol, time_frame, open_time_ms);
        ",
    )?;
    Ok(())
}

pub(crate) fn open_read_only(path: &Path) -> Result<Connection, StoreError> {
    if !path.exists() {
        return Err(StoreError::Missing(path.to_path_buf()));
    }
    Ok(Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?)
}

pub(crate) fn table_exists(conn: &Connection, table: &str) -> Result<bool, StoreError> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1 LIMIT 1",
            params![table],
            |row| row.get::<_, i64>(0),
        )
        .optional()?
        .is_some();
    Ok(exists)
}

/// `(name, declared type)` pairs in column order.
pub(crate) fn table_columns(
    conn: &Connection,
    table: &str,
) -> Result<Vec<(String, String)>, StoreError> {
    let pragma = format!("PRAGMA table_info({table})");
    let mut stmt = conn.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push((row.get(1)?, row.get(2)?));
    }
    Ok(out)
}

pub(crate) fn key_summaries(conn: &Connection) -> Result<Vec<KeySummary>, StoreError> {
    let mut stmt = conn.prepare(
        "
        SELECT symbol, time_frame, COUNT(*), MIN(open_time_ms), MAX(open_time_ms)
        FROM market_data
        GROUP BY symbol, time_frame
        ORDER BY COUNT(*) DESC, symbol, time_frame
        ",
    )?;
    let summaries = stmt
        .query_map([], |row| {
            Ok(KeySummary {
                symbol: row.get(0)?,
                time_frame: row.get(1)?,
                rows: row.get::<_, i64>(2)? as u64,
                first_open_time_ms: row.get(3)?,
                last_open_time_ms: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(summaries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle::Interval;
    use tempfile::tempdir;

    fn candle(symbol: &str, open_time_ms: i64) -> Candle {
        Candle {
            symbol: symbol.to_string(),
            interval: Interval::M1,
            open_time_ms,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10.0,
            close_time_ms: open_time_ms + 60_000,
        }
    }

    fn store_in(dir: &Path) -> SqliteCandleStore {
        SqliteCandleStore::new(StoreConfig {
            path: dir.join("nested/market.sqlite"),
            ..StoreConfig::default()
        })
    }

    #[test]
    fn latest_open_time_is_none_for_empty_key() {
        let temp = tempdir().unwrap();
        let store = store_in(temp.path());
        let key = InstrumentKey::new("BTCUSDT", Interval::M1);

        assert_eq!(store.latest_open_time(&key).unwrap(), None);
        assert_eq!(store.row_count().unwrap(), 0);
    }

    #[test]
    fn latest_open_time_is_scoped_to_key() {
        let temp = tempdir().unwrap();
        let store = store_in(temp.path());

        store
            .insert_batch(&[candle("BTCUSDT", 0), candle("BTCUSDT", 60_000)])
            .unwrap();
        store.insert_batch(&[candle("ETHUSDT", 600_000)]).unwrap();

        let btc = InstrumentKey::new("BTCUSDT", Interval::M1);
        let btc_5m = InstrumentKey::new("BTCUSDT", Interval::M5);
        assert_eq!(store.latest_open_time(&btc).unwrap(), Some(60_000));
        assert_eq!(store.latest_open_time(&btc_5m).unwrap(), None);
        assert_eq!(store.key_row_count(&btc).unwrap(), 2);
    }

    #[test]
    fn failing_row_rolls_back_the_whole_batch() {
        let temp = tempdir().unwrap();
        let store = store_in(temp.path());
        store.insert_batch(&[candle("BTCUSDT", 0)]).unwrap();

        let mut bad = candle("BTCUSDT", 120_000);
        bad.open = f64::NAN;
        // NOT NULL rejects NaN, which SQLite binds as NULL.
        let result = store.insert_batch(&[candle("BTCUSDT", 60_000), bad]);

        assert!(result.is_err());
        assert_eq!(store.row_count().unwrap(), 1);
        assert_eq!(
            store
                .latest_open_time(&InstrumentKey::new("BTCUSDT", Interval::M1))
                .unwrap(),
            Some(0)
        );
    }

    #[test]
    fn summaries_and_ordered_scan_cover_every_key() {
        let temp = tempdir().unwrap();
        let store = store_in(temp.path());
        store
            .insert_batch(&[candle("ETHUSDT", 60_000), candle("BTCUSDT", 0)])
            .unwrap();
        store.insert_batch(&[candle("BTCUSDT", 60_000)]).unwrap();

        let summaries = store.key_summaries().unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].symbol, "BTCUSDT");
        assert_eq!(summaries[0].rows, 2);
        assert_eq!(summaries[0].last_open_time_ms, 60_000);

        let mut seen = Vec::new();
        let visited = store
            .for_each_row_ordered(|row| -> Result<(), StoreError> {
                seen.push((row.candle.symbol, row.candle.open_time_ms));
                assert!(row.created_at_ms.is_some());
                Ok(())
            })
            .unwrap();
        assert_eq!(visited, 3);
        assert_eq!(
            seen,
            vec![
                ("BTCUSDT".to_string(), 0),
                ("BTCUSDT".to_string(), 60_000),
                ("ETHUSDT".to_string(), 60_000),
            ]
        );

        assert_eq!(store.clear().unwrap(), 3);
        assert_eq!(store.row_count().unwrap(), 0);
    }
}
