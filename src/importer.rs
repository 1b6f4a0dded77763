//! Resumable incremental kline import.
//!
//! One controller drives one (symbol, interval) session through
//! fetch -> translate -> insert -> advance cycles. The cursor only moves past
//! a page once the store has confirmed the whole batch, and every run derives
//! its starting cursor from the store's highest open time, so rerunning after
//! any stop is safe.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::candle::{format_ts_ms, Candle, InstrumentKey, Interval};
use crate::feed::{FeedError, MarketFeed, PageRequest, BINANCE_MAX_PAGE_LIMIT};
use crate::progress::{
    estimate_progress, estimate_scope, format_duration, throughput, ProgressInput,
    ProgressSnapshot, ScopeEstimate,
};
use crate::store::{CandleStore, StoreError};
use crate::translate::{translate_kline, RawKline};

/// 2017-08-17T00:00:00Z, before the first BTCUSDT kline on Binance.
pub const DEFAULT_EPOCH_MS: i64 = 1_502_928_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportCadence {
    /// Every batch up to this count gets a full report.
    pub full_report_first: u64,
    pub full_report_every: u64,
    pub quick_line_every: u64,
    pub checkpoint_every: u64,
}

impl Default for ReportCadence {
    fn default() -> Self {
        Self {
            full_report_first: 5,
            full_report_every: 20,
            quick_line_every: 5,
            checkpoint_every: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportConfig {
    pub symbol: String,
    pub interval: Interval,
    pub page_limit: u32,
    /// Starting cursor when the store has no rows for the key.
    pub epoch_ms: i64,
    /// Minimum delay between successive fetch cycles.
    pub rate_limit_ms: u64,
    pub max_fetch_retries: u32,
    pub retry_backoff_ms: u64,
    pub cadence: ReportCadence,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            interval: Interval::M1,
            page_limit: BINANCE_MAX_PAGE_LIMIT,
            epoch_ms: DEFAULT_EPOCH_MS,
            rate_limit_ms: 100,
            max_fetch_retries: 2,
            retry_backoff_ms: 500,
            cadence: ReportCadence::default(),
        }
    }
}

impl ImportConfig {
    pub fn key(&self) -> InstrumentKey {
        InstrumentKey::new(self.symbol.clone(), self.interval)
    }

    fn validate(&self) -> Result<(), ImportError> {
        if self.symbol.is_empty() || self.symbol.chars().any(char::is_whitespace) {
            return Err(ImportError::InvalidConfig(format!(
                "symbol '{}' must be non-empty without whitespace",
                self.symbol
            )));
        }
        if self.page_limit == 0 || self.page_limit > BINANCE_MAX_PAGE_LIMIT {
            return Err(ImportError::InvalidConfig(format!(
                "page_limit must be within 1..={BINANCE_MAX_PAGE_LIMIT}, got {}",
                self.page_limit
            )));
        }
        if self.epoch_ms < 0 {
            return Err(ImportError::InvalidConfig(format!(
                "epoch_ms must not be negative, got {}",
                self.epoch_ms
            )));
        }
        let c = &self.cadence;
        if c.full_report_every == 0 || c.quick_line_every == 0 || c.checkpoint_every == 0 {
            return Err(ImportError::InvalidConfig(
                "report cadences must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("invalid import config: {0}")]
    InvalidConfig(String),
    #[error("failed to read resume point from store: {0}")]
    ResumeLookup(#[source] StoreError),
    #[error("cursor did not advance past {cursor_ms} for {key}")]
    CursorStalled { key: InstrumentKey, cursor_ms: i64 },
}

/// Wall-clock source and sleeper. Swapped out in tests.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
    fn sleep(&self, duration: Duration);
}

impl<T: Clock + ?Sized> Clock for &T {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }

    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// Cooperative cancellation flag, checked between cycles.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Cursor reached the session end target.
    Done,
    /// Upstream returned an empty page before the target was reached.
    Exhausted,
    Interrupted,
    FeedUnavailable { message: String },
    StoreInsertFailure { message: String },
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Exhausted => "exhausted",
            Self::Interrupted => "interrupted",
            Self::FeedUnavailable { .. } => "feed_unavailable",
            Self::StoreInsertFailure { .. } => "store_insert_failure",
        }
    }

    /// Stops that need no operator attention beyond an optional rerun.
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Done | Self::Exhausted | Self::Interrupted)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportReport {
    pub key: InstrumentKey,
    pub stop: StopReason,
    pub batches: u64,
    pub records_seen: u64,
    pub records_inserted: u64,
    pub malformed_skipped: u64,
    pub out_of_window_skipped: u64,
    pub session_start_ms: i64,
    pub session_end_target_ms: i64,
    /// Expected work at session start.
    pub scope: ScopeEstimate,
    /// Session cursor at stop time.
    pub cursor_ms: i64,
    /// Where the next run will start, re-derived from the store.
    pub next_resume_ms: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ImportReport {
    /// Inserted records per wall-clock second.
    pub fn records_per_second(&self) -> Option<f64> {
        throughput(self.records_inserted, self.finished_at - self.started_at)
    }
}

impl fmt::Display for ImportReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "import {} stopped: {}", self.key, self.stop.as_str())?;
        match &self.stop {
            StopReason::FeedUnavailable { message } | StopReason::StoreInsertFailure { message } => {
                writeln!(f, "  reason:    {message}")?;
            }
            _ => {}
        }
        writeln!(
            f,
            "  range:     {} -> {}",
            format_ts_ms(self.session_start_ms),
            format_ts_ms(self.session_end_target_ms)
        )?;
        writeln!(
            f,
            "  scope:     ~{} candles in ~{} batches",
            self.scope.candles, self.scope.batches
        )?;
        writeln!(f, "  batches:   {}", self.batches)?;
        writeln!(
            f,
            "  records:   {} inserted ({} seen, {} malformed, {} out of window)",
            self.records_inserted,
            self.records_seen,
            self.malformed_skipped,
            self.out_of_window_skipped
        )?;
        let elapsed = self.finished_at - self.started_at;
        writeln!(f, "  elapsed:   {}", format_duration(elapsed))?;
        if let Some(rate) = self.records_per_second() {
            writeln!(f, "  rate:      {rate:.0} records/s")?;
        }
        match self.next_resume_ms {
            Some(ts) => write!(f, "  next run:  resumes at {}", format_ts_ms(ts)),
            None => write!(f, "  next run:  resume point unknown (store unreadable)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Full,
    Quick,
    Checkpoint,
}

/// Receives periodic progress while a session runs.
pub trait ImportObserver {
    fn on_progress(&mut self, kind: ReportKind, snapshot: &ProgressSnapshot);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl ImportObserver for NoopObserver {
    fn on_progress(&mut self, _kind: ReportKind, _snapshot: &ProgressSnapshot) {}
}

struct ImportSession {
    session_start_ms: i64,
    session_end_target_ms: i64,
    cursor_ms: i64,
    batches: u64,
    records_seen: u64,
    records_inserted: u64,
    malformed_skipped: u64,
    out_of_window_skipped: u64,
    wall_clock_start: DateTime<Utc>,
}

impl ImportSession {
    fn progress_input(&self) -> ProgressInput {
        ProgressInput {
            session_start_ms: self.session_start_ms,
            session_end_target_ms: self.session_end_target_ms,
            cursor_ms: self.cursor_ms,
            batch_count: self.batches,
            record_count: self.records_inserted,
            wall_clock_start: self.wall_clock_start,
        }
    }
}

enum FetchOutcome {
    Page(Vec<RawKline>),
    Cancelled,
}

pub struct ImportController<S, F, C = SystemClock> {
    cfg: ImportConfig,
    store: S,
    feed: F,
    clock: C,
    cancel: CancelToken,
}

impl<S: CandleStore, F: MarketFeed> ImportController<S, F, SystemClock> {
    pub fn new(cfg: ImportConfig, store: S, feed: F) -> Result<Self, ImportError> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            store,
            feed,
            clock: SystemClock,
            cancel: CancelToken::new(),
        })
    }
}

impl<S, F, C> ImportController<S, F, C> {
    pub fn with_clock<C2: Clock>(self, clock: C2) -> ImportController<S, F, C2> {
        ImportController {
            cfg: self.cfg,
            store: self.store,
            feed: self.feed,
            clock,
            cancel: self.cancel,
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &ImportConfig {
        &self.cfg
    }
}

impl<S: CandleStore, F: MarketFeed, C: Clock> ImportController<S, F, C> {
    /// Next open time to fetch: one interval past the stored maximum, or the
    /// configured epoch for an empty key.
    pub fn resume_point(&self) -> Result<i64, ImportError> {
        let key = self.cfg.key();
        let latest = self
            .store
            .latest_open_time(&key)
            .map_err(ImportError::ResumeLookup)?;
        Ok(match latest {
            Some(ts) => ts.saturating_add(self.cfg.interval.duration_ms()),
            None => self.cfg.epoch_ms,
        })
    }

    pub fn run(&self, observer: &mut dyn ImportObserver) -> Result<ImportReport, ImportError> {
        let key = self.cfg.key();
        let interval_ms = self.cfg.interval.duration_ms();
        let started_at = self.clock.now();

        let start_cursor = self.resume_point()?;
        // Start of the still-forming bucket; fixed for the whole session.
        let end_target = self.cfg.interval.floor_ms(started_at.timestamp_millis());
        let scope = estimate_scope(start_cursor, end_target, interval_ms, self.cfg.page_limit);

        let mut session = ImportSession {
            session_start_ms: start_cursor,
            session_end_target_ms: end_target,
            cursor_ms: start_cursor,
            batches: 0,
            records_seen: 0,
            records_inserted: 0,
            malformed_skipped: 0,
            out_of_window_skipped: 0,
            wall_clock_start: started_at,
        };

        info!(
            component = "importer",
            event = "import.start",
            key = %key,
            cursor = %format_ts_ms(start_cursor),
            end_target = %format_ts_ms(end_target),
            page_limit = self.cfg.page_limit,
            estimated_candles = scope.candles,
            estimated_batches = scope.batches
        );

        let stop = loop {
            if session.batches > 0 {
                self.clock
                    .sleep(Duration::from_millis(self.cfg.rate_limit_ms));
            }
            if self.cancel.is_cancelled() {
                break StopReason::Interrupted;
            }
            if session.cursor_ms >= end_target {
                break StopReason::Done;
            }

            let req = PageRequest {
                symbol: key.symbol.clone(),
                interval: key.interval,
                start_time_ms: session.cursor_ms,
                end_time_ms: Some(end_target - 1),
                limit: self.cfg.page_limit,
            };
            let page = match self.fetch_with_retry(&req) {
                Ok(FetchOutcome::Page(page)) => page,
                Ok(FetchOutcome::Cancelled) => break StopReason::Interrupted,
                Err(err) => {
                    warn!(
                        component = "importer",
                        event = "import.feed.unavailable",
                        key = %key,
                        cursor = %format_ts_ms(session.cursor_ms),
                        error = %err
                    );
                    break StopReason::FeedUnavailable {
                        message: err.to_string(),
                    };
                }
            };
            if page.is_empty() {
                break StopReason::Exhausted;
            }

            let batch = self.translate_page(&key, &page, &mut session);

            if !batch.is_empty() {
                match self.store.insert_batch(&batch) {
                    Ok(confirmed) if confirmed == batch.len() => {
                        session.records_inserted += confirmed as u64;
                    }
                    Ok(confirmed) => {
                        let err = StoreError::PartialInsert {
                            submitted: batch.len(),
                            confirmed,
                        };
                        warn!(
                            component = "importer",
                            event = "import.insert.failed",
                            key = %key,
                            cursor = %format_ts_ms(session.cursor_ms),
                            rows = batch.len(),
                            error = %err
                        );
                        break StopReason::StoreInsertFailure {
                            message: err.to_string(),
                        };
                    }
                    Err(err) => {
                        warn!(
                            component = "importer",
                            event = "import.insert.failed",
                            key = %key,
                            cursor = %format_ts_ms(session.cursor_ms),
                            rows = batch.len(),
                            error = %err
                        );
                        break StopReason::StoreInsertFailure {
                            message: err.to_string(),
                        };
                    }
                }
            }

            // Advance from the raw page so dropped records are not refetched.
            let next_cursor = page
                .iter()
                .filter_map(RawKline::open_time_ms)
                .max()
                .map(|last_open| last_open.saturating_add(interval_ms));
            match next_cursor {
                Some(next) if next > session.cursor_ms => session.cursor_ms = next,
                _ => {
                    warn!(
                        component = "importer",
                        event = "import.cursor.stalled",
                        key = %key,
                        cursor = %format_ts_ms(session.cursor_ms),
                        batches = session.batches,
                        records_inserted = session.records_inserted
                    );
                    return Err(ImportError::CursorStalled {
                        key,
                        cursor_ms: session.cursor_ms,
                    });
                }
            }

            session.batches += 1;
            session.records_seen += page.len() as u64;
            debug!(
                component = "importer",
                event = "import.batch.committed",
                key = %key,
                batch = session.batches,
                rows = batch.len(),
                cursor = %format_ts_ms(session.cursor_ms)
            );
            self.report_progress(&key, &session, observer);
        };

        let next_resume_ms = match self.resume_point() {
            Ok(ts) => Some(ts),
            Err(err) => {
                warn!(
                    component = "importer",
                    event = "import.resume_point.unavailable",
                    key = %key,
                    error = %err
                );
                None
            }
        };

        let report = ImportReport {
            key,
            stop,
            batches: session.batches,
            records_seen: session.records_seen,
            records_inserted: session.records_inserted,
            malformed_skipped: session.malformed_skipped,
            out_of_window_skipped: session.out_of_window_skipped,
            session_start_ms: session.session_start_ms,
            session_end_target_ms: session.session_end_target_ms,
            scope,
            cursor_ms: session.cursor_ms,
            next_resume_ms,
            started_at,
            finished_at: self.clock.now(),
        };

        let next_resume = report
            .next_resume_ms
            .map(format_ts_ms)
            .unwrap_or_else(|| "unknown".to_string());
        info!(
            component = "importer",
            event = "import.stop",
            key = %report.key,
            stop = report.stop.as_str(),
            batches = report.batches,
            records_inserted = report.records_inserted,
            malformed_skipped = report.malformed_skipped,
            records_per_sec = report.records_per_second().unwrap_or(0.0),
            next_resume = %next_resume
        );

        Ok(report)
    }

    fn fetch_with_retry(&self, req: &PageRequest) -> Result<FetchOutcome, FeedError> {
        let mut attempt: u32 = 0;
        loop {
            match self.feed.fetch_page(req) {
                Ok(page) => return Ok(FetchOutcome::Page(page)),
                Err(err) if attempt >= self.cfg.max_fetch_retries => return Err(err),
                Err(err) => {
                    attempt = attempt.saturating_add(1);
                    let shift = attempt.saturating_sub(1).min(10);
                    let backoff_ms = self
                        .cfg
                        .retry_backoff_ms
                        .saturating_mul(1u64 << shift)
                        .max(self.cfg.rate_limit_ms);
                    warn!(
                        component = "importer",
                        event = "import.feed.retry",
                        symbol = %req.symbol,
                        start_time_ms = req.start_time_ms,
                        attempt,
                        backoff_ms,
                        error = %err
                    );
                    self.clock.sleep(Duration::from_millis(backoff_ms));
                    if self.cancel.is_cancelled() {
                        return Ok(FetchOutcome::Cancelled);
                    }
                }
            }
        }
    }

    /// Keeps rows that translate cleanly and sit strictly above the cursor in
    /// ascending order; everything else is counted and dropped.
    fn translate_page(
        &self,
        key: &InstrumentKey,
        page: &[RawKline],
        session: &mut ImportSession,
    ) -> Vec<Candle> {
        let mut batch: Vec<Candle> = Vec::with_capacity(page.len());
        for raw in page {
            match translate_kline(key, raw) {
                Ok(candle) => {
                    let floor = batch
                        .last()
                        .map(|prev| prev.open_time_ms + 1)
                        .unwrap_or(session.cursor_ms);
                    if candle.open_time_ms < floor
                        || candle.open_time_ms >= session.session_end_target_ms
                    {
                        session.out_of_window_skipped += 1;
                        debug!(
                            component = "importer",
                            event = "import.record.out_of_window",
                            key = %key,
                            open_time_ms = candle.open_time_ms
                        );
                        continue;
                    }
                    batch.push(candle);
                }
                Err(err) => {
                    session.malformed_skipped += 1;
                    warn!(
                        component = "importer",
                        event = "import.record.malformed",
                        key = %key,
                        open_time_ms = ?raw.open_time_ms(),
                        error = %err
                    );
                }
            }
        }
        batch
    }

    fn report_progress(
        &self,
        key: &InstrumentKey,
        session: &ImportSession,
        observer: &mut dyn ImportObserver,
    ) {
        let cadence = &self.cfg.cadence;
        let n = session.batches;
        let full = n <= cadence.full_report_first || n % cadence.full_report_every == 0;
        let quick = !full && n % cadence.quick_line_every == 0;
        let checkpoint = n % cadence.checkpoint_every == 0;
        if !(full || quick || checkpoint) {
            return;
        }

        let snapshot = estimate_progress(&session.progress_input(), self.clock.now());
        if full {
            observer.on_progress(ReportKind::Full, &snapshot);
        } else if quick {
            observer.on_progress(ReportKind::Quick, &snapshot);
        }

        if checkpoint {
            info!(
                component = "importer",
                event = "import.checkpoint",
                key = %key,
                batch = n,
                cursor = %format_ts_ms(session.cursor_ms),
                records_inserted = session.records_inserted
            );
            observer.on_progress(ReportKind::Checkpoint, &snapshot);
        } else {
            info!(
                component = "importer",
                event = "import.progress",
                key = %key,
                batch = n,
                percent = snapshot.percent(),
                cursor = %format_ts_ms(session.cursor_ms),
                records_inserted = session.records_inserted
            );
        }
    }
}
