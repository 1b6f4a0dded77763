use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use kline_ingest::{
    CancelToken, Candle, CandleStore, Clock, FeedError, ImportConfig, ImportController,
    InstrumentKey, Interval, MarketFeed, NoopObserver, PageRequest, RawKline, SqliteCandleStore,
    StopReason, StoreConfig, StoreError, DEFAULT_EPOCH_MS,
};
use serde_json::json;
use tempfile::{tempdir, TempDir};

const MIN: i64 = 60_000;
const T0: i64 = DEFAULT_EPOCH_MS;

struct FixedClock(DateTime<Utc>);

impl FixedClock {
    fn at_ms(ts_ms: i64) -> Self {
        Self(
            Utc.timestamp_millis_opt(ts_ms)
                .single()
                .expect("valid clock timestamp"),
        )
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }

    fn sleep(&self, _duration: Duration) {}
}

/// Serves one-minute candles for `[first_open_ms, last_open_ms]` the way the
/// klines endpoint pages them.
struct SyntheticFeed {
    first_open_ms: i64,
    last_open_ms: i64,
    fail_after_calls: Option<usize>,
    cancel_on_call: Option<(usize, CancelToken)>,
    requests: Mutex<Vec<PageRequest>>,
}

impl SyntheticFeed {
    fn minutes(count: i64) -> Self {
        Self {
            first_open_ms: T0,
            last_open_ms: T0 + (count - 1) * MIN,
            fail_after_calls: None,
            cancel_on_call: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    fn requests(&self) -> Vec<PageRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

impl MarketFeed for SyntheticFeed {
    fn fetch_page(&self, req: &PageRequest) -> Result<Vec<RawKline>, FeedError> {
        let call = {
            let mut requests = self.requests.lock().expect("requests lock");
            requests.push(req.clone());
            requests.len()
        };
        if matches!(self.fail_after_calls, Some(limit) if call > limit) {
            return Err(FeedError::HttpRequest {
                url: "synthetic://klines".to_string(),
                message: "simulated outage".to_string(),
            });
        }
        if let Some((on_call, token)) = &self.cancel_on_call {
            if call == *on_call {
                token.cancel();
            }
        }

        let offset = (req.start_time_ms - self.first_open_ms).max(0);
        let first = self.first_open_ms + (offset + MIN - 1) / MIN * MIN;
        let last = req
            .end_time_ms
            .map_or(self.last_open_ms, |end| end.min(self.last_open_ms));

        Ok((0..)
            .map(|i| first + i * MIN)
            .take_while(|open| *open <= last)
            .take(req.limit as usize)
            .map(|open| {
                RawKline(json!([
                    open,
                    "100.0",
                    "101.5",
                    "99.5",
                    "100.75",
                    "3.25",
                    open + MIN - 1
                ]))
            })
            .collect())
    }
}

/// Corrupts one row of the n-th batch so the insert fails inside its transaction.
struct PoisonedStore {
    inner: SqliteCandleStore,
    poison_call: usize,
    calls: Mutex<usize>,
}

impl CandleStore for PoisonedStore {
    fn latest_open_time(&self, key: &InstrumentKey) -> Result<Option<i64>, StoreError> {
        self.inner.latest_open_time(key)
    }

    fn insert_batch(&self, rows: &[Candle]) -> Result<usize, StoreError> {
        let mut calls = self.calls.lock().expect("calls lock");
        *calls += 1;
        if *calls != self.poison_call {
            return self.inner.insert_batch(rows);
        }
        let mut poisoned = rows.to_vec();
        if let Some(last) = poisoned.last_mut() {
            last.open = f64::NAN;
        }
        self.inner.insert_batch(&poisoned)
    }
}

fn temp_store() -> (TempDir, SqliteCandleStore) {
    let temp = tempdir().expect("temp dir should be created");
    let store = SqliteCandleStore::new(StoreConfig {
        path: temp.path().join("market_data.sqlite"),
        ..StoreConfig::default()
    });
    (temp, store)
}

fn config(page_limit: u32) -> ImportConfig {
    ImportConfig {
        symbol: "BTCUSDT".to_string(),
        interval: Interval::M1,
        page_limit,
        max_fetch_retries: 0,
        ..ImportConfig::default()
    }
}

fn key() -> InstrumentKey {
    InstrumentKey::new("BTCUSDT", Interval::M1)
}

fn assert_contiguous(store: &SqliteCandleStore, count: i64) {
    let times = store.open_times(&key()).expect("open times should load");
    let expected: Vec<i64> = (0..count).map(|i| T0 + i * MIN).collect();
    assert_eq!(times, expected);
}

#[test]
fn thousand_candles_land_in_one_page_and_next_run_resumes_after_them() {
    let (_temp, store) = temp_store();
    let feed = SyntheticFeed::minutes(1_000);
    let clock = FixedClock::at_ms(T0 + 5 * 24 * 60 * MIN);

    let controller = ImportController::new(config(1_000), &store, &feed)
        .expect("config should be valid")
        .with_clock(&clock);
    let report = controller.run(&mut NoopObserver).expect("run should finish");

    assert_eq!(report.stop, StopReason::Exhausted);
    assert_eq!(report.batches, 1);
    assert_eq!(report.records_inserted, 1_000);
    assert_eq!(report.cursor_ms, T0 + 1_000 * MIN);
    assert_eq!(report.next_resume_ms, Some(T0 + 1_000 * MIN));
    assert_contiguous(&store, 1_000);

    let requests = feed.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].start_time_ms, T0);
    assert_eq!(requests[1].start_time_ms, T0 + 1_000 * MIN);

    let rerun_feed = SyntheticFeed::minutes(1_000);
    let rerun = ImportController::new(config(1_000), &store, &rerun_feed)
        .expect("config should be valid")
        .with_clock(&clock)
        .run(&mut NoopObserver)
        .expect("rerun should finish");

    assert_eq!(rerun.stop, StopReason::Exhausted);
    assert_eq!(rerun.records_inserted, 0);
    assert_eq!(rerun_feed.requests()[0].start_time_ms, T0 + 1_000 * MIN);
    assert_eq!(store.row_count().expect("row count"), 1_000);
}

#[test]
fn resuming_after_feed_outage_completes_without_duplicates() {
    let (_temp, store) = temp_store();
    // Target is the start of the still-forming minute.
    let clock = FixedClock::at_ms(T0 + 550 * MIN + 5_000);

    let mut flaky = SyntheticFeed::minutes(600);
    flaky.fail_after_calls = Some(3);
    let first = ImportController::new(config(100), &store, &flaky)
        .expect("config should be valid")
        .with_clock(&clock)
        .run(&mut NoopObserver)
        .expect("run should stop cleanly");

    assert!(matches!(first.stop, StopReason::FeedUnavailable { .. }));
    assert!(!first.stop.is_clean());
    assert_eq!(first.records_inserted, 300);
    assert_eq!(first.next_resume_ms, Some(T0 + 300 * MIN));
    assert_eq!(first.session_end_target_ms, T0 + 550 * MIN);

    let healthy = SyntheticFeed::minutes(600);
    let second = ImportController::new(config(100), &store, &healthy)
        .expect("config should be valid")
        .with_clock(&clock)
        .run(&mut NoopObserver)
        .expect("run should finish");

    assert_eq!(second.stop, StopReason::Done);
    assert_eq!(second.records_inserted, 250);
    assert_eq!(second.cursor_ms, T0 + 550 * MIN);

    let requests = healthy.requests();
    assert_eq!(requests[0].start_time_ms, T0 + 300 * MIN);
    assert!(requests
        .iter()
        .all(|req| req.end_time_ms == Some(T0 + 550 * MIN - 1)));
    assert_contiguous(&store, 550);
}

#[test]
fn failed_batch_leaves_no_rows_and_does_not_advance() {
    let (_temp, store) = temp_store();
    let clock = FixedClock::at_ms(T0 + 24 * 60 * MIN);
    let poisoned = PoisonedStore {
        inner: store.clone(),
        poison_call: 2,
        calls: Mutex::new(0),
    };

    let feed = SyntheticFeed::minutes(300);
    let report = ImportController::new(config(100), &poisoned, &feed)
        .expect("config should be valid")
        .with_clock(&clock)
        .run(&mut NoopObserver)
        .expect("run should stop cleanly");

    assert!(matches!(report.stop, StopReason::StoreInsertFailure { .. }));
    assert_eq!(report.batches, 1);
    assert_eq!(report.cursor_ms, T0 + 100 * MIN);
    assert_eq!(report.next_resume_ms, Some(T0 + 100 * MIN));
    assert_contiguous(&store, 100);

    let retry_feed = SyntheticFeed::minutes(300);
    let retry = ImportController::new(config(100), &store, &retry_feed)
        .expect("config should be valid")
        .with_clock(&clock)
        .run(&mut NoopObserver)
        .expect("retry should finish");

    assert_eq!(retry.stop, StopReason::Exhausted);
    assert_eq!(retry_feed.requests()[0].start_time_ms, T0 + 100 * MIN);
    assert_contiguous(&store, 300);
}

#[test]
fn cancellation_lets_the_in_flight_batch_commit() {
    let (_temp, store) = temp_store();
    let clock = FixedClock::at_ms(T0 + 24 * 60 * MIN);
    let cancel = CancelToken::new();

    let mut feed = SyntheticFeed::minutes(1_000);
    feed.cancel_on_call = Some((2, cancel.clone()));
    let report = ImportController::new(config(100), &store, &feed)
        .expect("config should be valid")
        .with_clock(&clock)
        .with_cancel_token(cancel)
        .run(&mut NoopObserver)
        .expect("run should stop cleanly");

    assert_eq!(report.stop, StopReason::Interrupted);
    assert!(report.stop.is_clean());
    assert_eq!(report.batches, 2);
    assert_eq!(feed.requests().len(), 2);
    assert_eq!(report.next_resume_ms, Some(T0 + 200 * MIN));
    assert_contiguous(&store, 200);
}

#[test]
fn independent_keys_resume_independently() {
    let (_temp, store) = temp_store();
    let clock = FixedClock::at_ms(T0 + 24 * 60 * MIN);

    let btc_feed = SyntheticFeed::minutes(50);
    ImportController::new(config(1_000), &store, &btc_feed)
        .expect("config should be valid")
        .with_clock(&clock)
        .run(&mut NoopObserver)
        .expect("btc run should finish");

    let eth_cfg = ImportConfig {
        symbol: "ETHUSDT".to_string(),
        ..config(1_000)
    };
    let eth_feed = SyntheticFeed::minutes(10);
    let eth = ImportController::new(eth_cfg, &store, &eth_feed)
        .expect("config should be valid")
        .with_clock(&clock)
        .run(&mut NoopObserver)
        .expect("eth run should finish");

    assert_eq!(eth_feed.requests()[0].start_time_ms, T0);
    assert_eq!(eth.next_resume_ms, Some(T0 + 10 * MIN));
    assert_eq!(
        store.latest_open_time(&key()).expect("btc latest"),
        Some(T0 + 49 * MIN)
    );
    assert_eq!(store.row_count().expect("row count"), 60);
}
