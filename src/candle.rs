//! Candle data model and interval arithmetic.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const SECOND_MS: i64 = 1_000;
const MINUTE_MS: i64 = 60 * SECOND_MS;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;
const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Fixed-width bucket sizes accepted by the Binance klines endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    S1,
    M1,
    M3,
    M5,
    M15,
    M30,
    H1,
    H2,
    H4,
    H6,
    H8,
    H12,
    D1,
    D3,
    W1,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntervalError {
    #[error("unsupported interval label: {0}")]
    Unsupported(String),
}

impl Interval {
    pub const ALL: [Interval; 15] = [
        Self::S1,
        Self::M1,
        Self::M3,
        Self::M5,
        Self::M15,
        Self::M30,
        Self::H1,
        Self::H2,
        Self::H4,
        Self::H6,
        Self::H8,
        Self::H12,
        Self::D1,
        Self::D3,
        Self::W1,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::S1 => "1s",
            Self::M1 => "1m",
            Self::M3 => "3m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H2 => "2h",
            Self::H4 => "4h",
            Self::H6 => "6h",
            Self::H8 => "8h",
            Self::H12 => "12h",
            Self::D1 => "1d",
            Self::D3 => "3d",
            Self::W1 => "1w",
        }
    }

    pub fn duration_ms(self) -> i64 {
        match self {
            Self::S1 => SECOND_MS,
            Self::M1 => MINUTE_MS,
            Self::M3 => 3 * MINUTE_MS,
            Self::M5 => 5 * MINUTE_MS,
            Self::M15 => 15 * MINUTE_MS,
            Self::M30 => 30 * MINUTE_MS,
            Self::H1 => HOUR_MS,
            Self::H2 => 2 * HOUR_MS,
            Self::H4 => 4 * HOUR_MS,
            Self::H6 => 6 * HOUR_MS,
            Self::H8 => 8 * HOUR_MS,
            Self::H12 => 12 * HOUR_MS,
            Self::D1 => DAY_MS,
            Self::D3 => 3 * DAY_MS,
            Self::W1 => 7 * DAY_MS,
        }
    }

    /// Start of the bucket containing `ts_ms`.
    ///
    /// Buckets are aligned to the Unix epoch. Binance weekly candles open on
    /// Mondays, which the epoch (a Thursday) does not line up with, so `1w`
    /// floors to the preceding Monday 00:00 UTC instead.
    pub fn floor_ms(self, ts_ms: i64) -> i64 {
        match self {
            Self::W1 => {
                let monday_offset = 4 * DAY_MS;
                (ts_ms - monday_offset).div_euclid(self.duration_ms()) * self.duration_ms()
                    + monday_offset
            }
            _ => ts_ms.div_euclid(self.duration_ms()) * self.duration_ms(),
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn parse_interval(input: &str) -> Result<Interval, IntervalError> {
    Interval::ALL
        .into_iter()
        .find(|interval| interval.as_str() == input.trim())
        .ok_or_else(|| IntervalError::Unsupported(input.to_string()))
}

/// The unit of resumption: one symbol at one interval.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstrumentKey {
    pub symbol: String,
    pub interval: Interval,
}

impl InstrumentKey {
    pub fn new(symbol: impl Into<String>, interval: Interval) -> Self {
        Self {
            symbol: symbol.into(),
            interval,
        }
    }
}

impl fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.symbol, self.interval)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub interval: Interval,
    pub open_time_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time_ms: i64,
}

impl Candle {
    pub fn key(&self) -> InstrumentKey {
        InstrumentKey::new(self.symbol.clone(), self.interval)
    }
}

pub(crate) fn utc_from_ms(ts_ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ts_ms).single()
}

/// `YYYY-MM-DD HH:MM:SS` rendering used in reports and backup files.
pub fn format_ts_ms(ts_ms: i64) -> String {
    utc_from_ms(ts_ms)
        .map(|dt| dt.format(TS_FORMAT).to_string())
        .unwrap_or_else(|| format!("<invalid ts {ts_ms}>"))
}

/// Inverse of [`format_ts_ms`]; the input is read as UTC.
pub fn parse_ts_ms(raw: &str) -> Option<i64> {
    NaiveDateTime::parse_from_str(raw.trim(), TS_FORMAT)
        .ok()
        .map(|naive| naive.and_utc().timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_parse_back_to_the_same_interval() {
        for interval in Interval::ALL {
            assert_eq!(parse_interval(interval.as_str()), Ok(interval));
        }
        assert_eq!(
            parse_interval("7m"),
            Err(IntervalError::Unsupported("7m".to_string()))
        );
    }

    #[test]
    fn floor_aligns_to_bucket_start() {
        let ts = 1_704_067_262_123; // 2024-01-01 00:01:02.123
        assert_eq!(Interval::M1.floor_ms(ts), 1_704_067_260_000);
        assert_eq!(Interval::H1.floor_ms(ts), 1_704_067_200_000);
        assert_eq!(Interval::D1.floor_ms(ts), 1_704_067_200_000);
    }

    #[test]
    fn weekly_floor_lands_on_monday() {
        // 2024-01-03 (Wednesday) -> 2024-01-01 (Monday)
        let wednesday = 1_704_240_000_000;
        assert_eq!(Interval::W1.floor_ms(wednesday), 1_704_067_200_000);
    }

    #[test]
    fn format_uses_backup_timestamp_layout() {
        assert_eq!(format_ts_ms(1_502_928_000_000), "2017-08-17 00:00:00");
        assert_eq!(parse_ts_ms("2017-08-17 00:00:00"), Some(1_502_928_000_000));
        assert_eq!(parse_ts_ms("2017-08-17T00:00:00Z"), None);
        assert_eq!(parse_ts_ms(""), None);
    }
}
