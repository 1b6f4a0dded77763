//! Resumable incremental OHLCV kline ingestion.
//!
//! Current implemented scope:
//! - paginated Binance kline import into SQLite, resumed from the stored maximum
//! - time-span progress and ETA reporting
//! - CSV backup export and restore
//! - read-only store probing

mod backup;
mod candle;
mod config;
mod export;
mod feed;
mod importer;
mod observability;
mod probe;
mod progress;
mod restore;
mod store;
mod translate;

pub use backup::{checksum_path, BackupConfig, BACKUP_HEADER};
pub use candle::{
    format_ts_ms, parse_interval, parse_ts_ms, Candle, InstrumentKey, Interval, IntervalError,
};
pub use config::{
    backup_config_from_env, feed_config_from_env, import_config_from_env, probe_configs_from_env,
    restore_config_from_env, store_config_from_env, ConfigError,
};
pub use export::{export_backup, ExportError, ExportReport};
pub use feed::{
    BinanceKlineFeed, FeedConfig, FeedError, MarketFeed, PageRequest, BINANCE_API_BASE_URL,
    BINANCE_MAX_PAGE_LIMIT,
};
pub use importer::{
    CancelToken, Clock, ImportConfig, ImportController, ImportError, ImportObserver, ImportReport,
    NoopObserver, ReportCadence, ReportKind, StopReason, SystemClock, DEFAULT_EPOCH_MS,
};
pub use observability::{
    init_logging, log_app_exit, log_app_start, log_store_selected, logging_config_from_env,
    LogFormat, LoggingConfig, LoggingInitError,
};
pub use probe::{probe_store, probe_stores, ColumnInfo, ProbeOutcome, StoreInventory, StoreProbe};
pub use progress::{
    coverage, estimate_progress, estimate_scope, format_duration, render_bar, render_quick_line,
    render_report, throughput, ProgressInput, ProgressSnapshot, ScopeEstimate,
};
pub use restore::{
    restore_backup, OnExistingData, RestoreConfig, RestoreError, RestoreReport,
    RESTORE_BATCH_SIZE,
};
pub use store::{
    CandleStore, KeySummary, SqliteCandleStore, StoreConfig, StoreError, StoredCandle,
    MARKET_DATA_TABLE,
};
pub use translate::{translate_kline, RawKline, TranslateError};
