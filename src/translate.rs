//! Raw upstream kline tuple to [`Candle`] translation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::candle::{Candle, InstrumentKey};

const MIN_FIELDS: usize = 7;

/// One upstream record as received: `[openTime, open, high, low, close, volume, closeTime, ...]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawKline(pub Value);

impl RawKline {
    /// Open time of the record if the first field is readable, even when the
    /// rest of the record is malformed.
    pub fn open_time_ms(&self) -> Option<i64> {
        self.0.as_array()?.first().and_then(json_i64)
    }
}

impl From<Value> for RawKline {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TranslateError {
    #[error("kline record is not an array")]
    NotAnArray,
    #[error("kline record has {found} fields, expected at least {expected}")]
    MissingFields { found: usize, expected: usize },
    #[error("failed to parse field {field} value '{value}'")]
    ParseField { field: &'static str, value: String },
    #[error("field {field} must be finite and non-negative, got {value}")]
    OutOfRange { field: &'static str, value: String },
    #[error("upstream close time {close_time_ms} is outside bucket [{open_time_ms}, {bucket_end_ms}]")]
    CloseTimeOutsideBucket {
        open_time_ms: i64,
        close_time_ms: i64,
        bucket_end_ms: i64,
    },
}

/// Maps one raw record into the store's row shape.
///
/// The close timestamp is derived as `open + interval`. The upstream close
/// time is only checked to fall inside that bucket.
pub fn translate_kline(key: &InstrumentKey, raw: &RawKline) -> Result<Candle, TranslateError> {
    let fields = raw.0.as_array().ok_or(TranslateError::NotAnArray)?;
    if fields.len() < MIN_FIELDS {
        return Err(TranslateError::MissingFields {
            found: fields.len(),
            expected: MIN_FIELDS,
        });
    }

    let open_time_ms = parse_i64(&fields[0], "open_time")?;
    let upstream_close_ms = parse_i64(&fields[6], "close_time")?;
    let bucket_end_ms = open_time_ms.saturating_add(key.interval.duration_ms());
    if upstream_close_ms < open_time_ms || upstream_close_ms > bucket_end_ms {
        return Err(TranslateError::CloseTimeOutsideBucket {
            open_time_ms,
            close_time_ms: upstream_close_ms,
            bucket_end_ms,
        });
    }

    Ok(Candle {
        symbol: key.symbol.clone(),
        interval: key.interval,
        open_time_ms,
        open: parse_price(&fields[1], "open")?,
        high: parse_price(&fields[2], "high")?,
        low: parse_price(&fields[3], "low")?,
        close: parse_price(&fields[4], "close")?,
        volume: parse_price(&fields[5], "volume")?,
        close_time_ms: bucket_end_ms,
    })
}

fn json_i64(value: &Value) -> Option<i64> {
    if let Some(v) = value.as_i64() {
        return Some(v);
    }
    value.as_str()?.trim().parse().ok()
}

fn parse_i64(value: &Value, field: &'static str) -> Result<i64, TranslateError> {
    json_i64(value).ok_or_else(|| TranslateError::ParseField {
        field,
        value: value.to_string(),
    })
}

fn parse_price(value: &Value, field: &'static str) -> Result<f64, TranslateError> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| TranslateError::ParseField {
        field,
        value: value.to_string(),
    })?;

    if !parsed.is_finite() || parsed < 0.0 {
        return Err(TranslateError::OutOfRange {
            field,
            value: value.to_string(),
        });
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle::Interval;
    use serde_json::json;

    fn key() -> InstrumentKey {
        InstrumentKey::new("BTCUSDT", Interval::M1)
    }

    #[test]
    fn binance_tuple_translates_with_derived_close_time() {
        let raw = RawKline(json!([
            1_502_942_400_000i64,
            "4261.48000000",
            "4261.48000000",
            "4261.48000000",
            "4261.48000000",
            "1.77518300",
            1_502_942_459_999i64,
            "7564.90685084",
            3,
            "0.07518300",
            "320.39085084",
            "0"
        ]));

        let candle = translate_kline(&key(), &raw).unwrap();
        assert_eq!(candle.symbol, "BTCUSDT");
        assert_eq!(candle.open_time_ms, 1_502_942_400_000);
        assert_eq!(candle.close_time_ms, 1_502_942_460_000);
        assert!((candle.open - 4261.48).abs() < 1e-9);
        assert!((candle.volume - 1.775183).abs() < 1e-9);
    }

    #[test]
    fn numeric_fields_may_arrive_as_numbers_or_strings() {
        let raw = RawKline(json!(["60000", 1.5, 2, 1, 1.75, "10", 119_999]));
        let candle = translate_kline(&key(), &raw).unwrap();
        assert_eq!(candle.open_time_ms, 60_000);
        assert_eq!(candle.high, 2.0);
    }

    #[test]
    fn malformed_records_are_rejected() {
        assert_eq!(
            translate_kline(&key(), &RawKline(json!({"openTime": 1}))),
            Err(TranslateError::NotAnArray)
        );
        assert!(matches!(
            translate_kline(&key(), &RawKline(json!([0, "1", "1"]))),
            Err(TranslateError::MissingFields { found: 3, .. })
        ));
        assert!(matches!(
            translate_kline(&key(), &RawKline(json!([0, "abc", "1", "1", "1", "1", 59_999]))),
            Err(TranslateError::ParseField { field: "open", .. })
        ));
        assert!(matches!(
            translate_kline(&key(), &RawKline(json!([0, "1", "1", "1", "1", "-2", 59_999]))),
            Err(TranslateError::OutOfRange { field: "volume", .. })
        ));
        assert!(matches!(
            translate_kline(&key(), &RawKline(json!([0, "1", "1", "1", "1", null, 59_999]))),
            Err(TranslateError::ParseField { field: "volume", .. })
        ));
    }

    #[test]
    fn close_time_outside_bucket_is_malformed() {
        let raw = RawKline(json!([0, "1", "1", "1", "1", "1", 120_000]));
        assert!(matches!(
            translate_kline(&key(), &raw),
            Err(TranslateError::CloseTimeOutsideBucket { .. })
        ));
    }

    #[test]
    fn open_time_is_readable_from_otherwise_broken_records() {
        let raw = RawKline(json!([180_000, "oops"]));
        assert_eq!(raw.open_time_ms(), Some(180_000));
        assert_eq!(RawKline(json!("nope")).open_time_ms(), None);
    }
}
