//! Time-span based progress and ETA estimation.
//!
//! Coverage is measured in the timestamp domain (how far the cursor has moved
//! between the session start and its fixed end target), not in batches, so
//! sparse stretches of history do not skew the percentage.

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::candle::format_ts_ms;

const BAR_CELLS: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressInput {
    pub session_start_ms: i64,
    pub session_end_target_ms: i64,
    pub cursor_ms: i64,
    pub batch_count: u64,
    pub record_count: u64,
    pub wall_clock_start: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    /// Fraction of the session's time span covered, in `[0, 1]`.
    pub coverage: f64,
    pub elapsed: ChronoDuration,
    pub eta: Option<DateTime<Utc>>,
    pub remaining: Option<ChronoDuration>,
    pub cursor_ms: i64,
    pub batch_count: u64,
    pub record_count: u64,
}

impl ProgressSnapshot {
    pub fn percent(&self) -> f64 {
        self.coverage * 100.0
    }
}

/// Expected size of a session, from the span still to cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScopeEstimate {
    pub candles: u64,
    pub batches: u64,
}

/// Candles are the remaining span in whole intervals; batches round up to
/// full pages.
pub fn estimate_scope(
    cursor_ms: i64,
    session_end_target_ms: i64,
    interval_ms: i64,
    page_limit: u32,
) -> ScopeEstimate {
    if interval_ms <= 0 || page_limit == 0 || session_end_target_ms <= cursor_ms {
        return ScopeEstimate::default();
    }
    let candles = ((session_end_target_ms - cursor_ms) / interval_ms) as u64;
    ScopeEstimate {
        candles,
        batches: candles.div_ceil(u64::from(page_limit)),
    }
}

/// Records per second over `elapsed`, `None` before any time has passed.
pub fn throughput(records: u64, elapsed: ChronoDuration) -> Option<f64> {
    let ms = elapsed.num_milliseconds();
    (ms > 0).then(|| records as f64 * 1_000.0 / ms as f64)
}

pub fn coverage(session_start_ms: i64, session_end_target_ms: i64, cursor_ms: i64) -> f64 {
    let span = session_end_target_ms - session_start_ms;
    if span <= 0 {
        return 1.0;
    }
    let done = (cursor_ms - session_start_ms) as f64 / span as f64;
    done.clamp(0.0, 1.0)
}

pub fn estimate_progress(input: &ProgressInput, now: DateTime<Utc>) -> ProgressSnapshot {
    let coverage = coverage(
        input.session_start_ms,
        input.session_end_target_ms,
        input.cursor_ms,
    );
    let elapsed = (now - input.wall_clock_start).max(ChronoDuration::zero());

    // A tiny coverage over a long run projects past what chrono can represent.
    let eta = if coverage > 0.0 {
        let projected_total_ms = elapsed.num_milliseconds() as f64 / coverage;
        ChronoDuration::try_milliseconds(projected_total_ms as i64)
            .and_then(|total| input.wall_clock_start.checked_add_signed(total))
    } else {
        None
    };
    let remaining = eta.map(|eta| (eta - now).max(ChronoDuration::zero()));

    ProgressSnapshot {
        coverage,
        elapsed,
        eta,
        remaining,
        cursor_ms: input.cursor_ms,
        batch_count: input.batch_count,
        record_count: input.record_count,
    }
}

pub fn render_bar(coverage: f64) -> String {
    let filled = ((BAR_CELLS as f64) * coverage.clamp(0.0, 1.0)) as usize;
    let mut bar = String::with_capacity(BAR_CELLS * 3);
    bar.extend(std::iter::repeat('█').take(filled));
    bar.extend(std::iter::repeat('░').take(BAR_CELLS - filled));
    bar
}

pub fn format_duration(d: ChronoDuration) -> String {
    let secs = d.num_seconds().max(0);
    format!("{}:{:02}:{:02}", secs / 3_600, (secs / 60) % 60, secs % 60)
}

/// Multi-line progress report.
pub fn render_report(snapshot: &ProgressSnapshot) -> String {
    let eta_line = match (snapshot.eta, snapshot.remaining) {
        (Some(eta), Some(remaining)) => format!(
            "{} ({} remaining)",
            eta.format("%H:%M:%S"),
            format_duration(remaining)
        ),
        _ => "estimating...".to_string(),
    };

    format!(
        "progress [{}] {:.1}%\n  cursor:  {}\n  batches: {}\n  records: {}\n  elapsed: {}\n  eta:     {}",
        render_bar(snapshot.coverage),
        snapshot.percent(),
        format_ts_ms(snapshot.cursor_ms),
        snapshot.batch_count,
        snapshot.record_count,
        format_duration(snapshot.elapsed),
        eta_line
    )
}

/// Single-line status for the between-report cadence.
pub fn render_quick_line(snapshot: &ProgressSnapshot) -> String {
    format!(
        "{:.1}% - batch {} - {} - {} records",
        snapshot.percent(),
        snapshot.batch_count,
        format_ts_ms(snapshot.cursor_ms),
        snapshot.record_count
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn wall_start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).single().unwrap()
    }

    fn input(cursor_ms: i64) -> ProgressInput {
        ProgressInput {
            session_start_ms: 0,
            session_end_target_ms: 1_000_000,
            cursor_ms,
            batch_count: 3,
            record_count: 3_000,
            wall_clock_start: wall_start(),
        }
    }

    #[test]
    fn eta_extrapolates_from_elapsed_over_coverage() {
        let now = wall_start() + ChronoDuration::seconds(120);
        let snap = estimate_progress(&input(250_000), now);

        assert!((snap.coverage - 0.25).abs() < 1e-12);
        assert_eq!(snap.elapsed, ChronoDuration::seconds(120));
        assert_eq!(snap.eta, Some(wall_start() + ChronoDuration::seconds(480)));
        assert_eq!(snap.remaining, Some(ChronoDuration::seconds(360)));
    }

    #[test]
    fn eta_is_unknown_without_coverage() {
        let now = wall_start() + ChronoDuration::seconds(5);
        let snap = estimate_progress(&input(0), now);
        assert_eq!(snap.coverage, 0.0);
        assert_eq!(snap.eta, None);
        assert_eq!(snap.remaining, None);
        assert!(render_report(&snap).contains("estimating..."));
    }

    #[test]
    fn eta_is_unknown_when_projection_overflows() {
        let input = ProgressInput {
            session_start_ms: 0,
            session_end_target_ms: 1_735_689_600_000,
            cursor_ms: 1_000,
            batch_count: 1,
            record_count: 1,
            wall_clock_start: wall_start(),
        };
        let now = wall_start() + ChronoDuration::hours(2);
        let snap = estimate_progress(&input, now);

        assert!(snap.coverage > 0.0);
        assert_eq!(snap.elapsed, ChronoDuration::hours(2));
        assert_eq!(snap.eta, None);
        assert_eq!(snap.remaining, None);
        assert!(render_report(&snap).contains("estimating..."));
    }

    #[test]
    fn coverage_is_clamped_and_complete_for_empty_span() {
        assert_eq!(coverage(0, 100, -50), 0.0);
        assert_eq!(coverage(0, 100, 250), 1.0);
        assert_eq!(coverage(100, 100, 100), 1.0);
        assert_eq!(coverage(200, 100, 0), 1.0);
    }

    #[test]
    fn remaining_never_goes_negative() {
        // Full coverage reached: eta == wall_start + elapsed == now.
        let now = wall_start() + ChronoDuration::seconds(30);
        let snap = estimate_progress(&input(2_000_000), now);
        assert_eq!(snap.coverage, 1.0);
        assert_eq!(snap.remaining, Some(ChronoDuration::zero()));
    }

    #[test]
    fn scope_rounds_partial_pages_up() {
        let minute = 60_000;
        let scope = estimate_scope(0, 2_500 * minute, minute, 1_000);
        assert_eq!(scope.candles, 2_500);
        assert_eq!(scope.batches, 3);

        let year = estimate_scope(0, 525_600 * minute, minute, 1_000);
        assert_eq!(year.batches, 526);

        assert_eq!(estimate_scope(10, 10, minute, 1_000), ScopeEstimate::default());
        assert_eq!(estimate_scope(0, 30 * minute, minute, 1_000).batches, 1);
    }

    #[test]
    fn throughput_needs_elapsed_time() {
        assert_eq!(throughput(500, ChronoDuration::seconds(2)), Some(250.0));
        assert_eq!(throughput(500, ChronoDuration::zero()), None);
    }

    #[test]
    fn bar_fills_proportionally() {
        assert_eq!(render_bar(0.0).chars().filter(|c| *c == '█').count(), 0);
        assert_eq!(render_bar(0.5).chars().filter(|c| *c == '█').count(), 15);
        assert_eq!(render_bar(1.0).chars().count(), 30);
        assert_eq!(format_duration(ChronoDuration::seconds(3_725)), "1:02:05");
    }
}
