//! Upstream market feed client for the Binance klines endpoint.

use std::time::Duration;

use reqwest::Url;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::candle::Interval;
use crate::translate::RawKline;

pub const BINANCE_API_BASE_URL: &str = "https://api.binance.com";
pub const BINANCE_MAX_PAGE_LIMIT: u32 = 1000;
const KLINES_PATH: &str = "/api/v3/klines";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedConfig {
    pub base_url: String,
    pub http_timeout_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            base_url: BINANCE_API_BASE_URL.to_string(),
            http_timeout_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub symbol: String,
    pub interval: Interval,
    pub start_time_ms: i64,
    /// Inclusive upper bound on open time.
    pub end_time_ms: Option<i64>,
    pub limit: u32,
}

/// Transport, status or payload failure. Never used to signal exhaustion.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("HTTP client build error: {0}")]
    HttpClientBuild(String),
    #[error("invalid feed URL {url}: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("HTTP request failed for {url}: {message}")]
    HttpRequest { url: String, message: String },
    #[error("malformed klines payload from {url}: {message}")]
    MalformedPayload { url: String, message: String },
}

/// One page of raw records at or after a start time, ascending by open time.
///
/// An empty page means the upstream has nothing at or after the start.
pub trait MarketFeed {
    fn fetch_page(&self, req: &PageRequest) -> Result<Vec<RawKline>, FeedError>;
}

impl<T: MarketFeed + ?Sized> MarketFeed for &T {
    fn fetch_page(&self, req: &PageRequest) -> Result<Vec<RawKline>, FeedError> {
        (**self).fetch_page(req)
    }
}

pub(crate) trait HttpFetcher {
    fn get_bytes(&self, url: &Url) -> Result<Vec<u8>, FeedError>;
}

struct ReqwestBlockingFetcher {
    client: reqwest::blocking::Client,
}

impl ReqwestBlockingFetcher {
    fn new(timeout_ms: u64) -> Result<Self, FeedError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|err| FeedError::HttpClientBuild(err.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpFetcher for ReqwestBlockingFetcher {
    fn get_bytes(&self, url: &Url) -> Result<Vec<u8>, FeedError> {
        let response =
            self.client
                .get(url.clone())
                .send()
                .map_err(|err| FeedError::HttpRequest {
                    url: url.to_string(),
                    message: err.to_string(),
                })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::HttpRequest {
                url: url.to_string(),
                message: format!("unexpected HTTP status {status}"),
            });
        }

        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| FeedError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })
    }
}

pub struct BinanceKlineFeed {
    base_url: String,
    fetcher: Box<dyn HttpFetcher + Send + Sync>,
}

impl BinanceKlineFeed {
    pub fn new(cfg: &FeedConfig) -> Result<Self, FeedError> {
        let fetcher = ReqwestBlockingFetcher::new(cfg.http_timeout_ms)?;
        Ok(Self {
            base_url: cfg.base_url.clone(),
            fetcher: Box::new(fetcher),
        })
    }

    #[cfg(test)]
    fn with_fetcher(base_url: &str, fetcher: impl HttpFetcher + Send + Sync + 'static) -> Self {
        Self {
            base_url: base_url.to_string(),
            fetcher: Box::new(fetcher),
        }
    }

    fn page_url(&self, req: &PageRequest) -> Result<Url, FeedError> {
        let endpoint = format!("{}{KLINES_PATH}", self.base_url.trim_end_matches('/'));
        let mut params = vec![
            ("symbol", req.symbol.clone()),
            ("interval", req.interval.as_str().to_string()),
            ("startTime", req.start_time_ms.to_string()),
            ("limit", req.limit.to_string()),
        ];
        if let Some(end) = req.end_time_ms {
            params.push(("endTime", end.to_string()));
        }

        Url::parse_with_params(&endpoint, &params).map_err(|err| FeedError::InvalidUrl {
            url: endpoint,
            message: err.to_string(),
        })
    }
}

impl MarketFeed for BinanceKlineFeed {
    fn fetch_page(&self, req: &PageRequest) -> Result<Vec<RawKline>, FeedError> {
        let url = self.page_url(req)?;
        let body = self.fetcher.get_bytes(&url)?;
        let rows = parse_page(&url, &body)?;

        debug!(
            component = "feed",
            event = "feed.page.fetched",
            symbol = %req.symbol,
            interval = req.interval.as_str(),
            start_time_ms = req.start_time_ms,
            rows = rows.len()
        );
        Ok(rows)
    }
}

fn parse_page(url: &Url, body: &[u8]) -> Result<Vec<RawKline>, FeedError> {
    let payload: Value =
        serde_json::from_slice(body).map_err(|err| FeedError::MalformedPayload {
            url: url.to_string(),
            message: err.to_string(),
        })?;

    match payload {
        Value::Array(rows) => Ok(rows.into_iter().map(RawKline).collect()),
        other => Err(FeedError::MalformedPayload {
            url: url.to_string(),
            message: format!("expected top-level array, got {}", json_kind(&other)),
        }),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
