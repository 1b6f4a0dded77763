use kline_ingest::{
    feed_config_from_env, format_ts_ms, import_config_from_env, init_logging, log_app_exit,
    log_app_start, log_store_selected, logging_config_from_env, render_quick_line, render_report,
    store_config_from_env, BinanceKlineFeed, CancelToken, ImportController, ImportObserver,
    ImportReport, ProgressSnapshot, ReportKind, SqliteCandleStore,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const COMPONENT: &str = "kline_import";

struct StdoutProgress;

impl ImportObserver for StdoutProgress {
    fn on_progress(&mut self, kind: ReportKind, snapshot: &ProgressSnapshot) {
        match kind {
            ReportKind::Full => println!("{}", render_report(snapshot)),
            ReportKind::Quick => println!("{}", render_quick_line(snapshot)),
            ReportKind::Checkpoint => println!(
                "checkpoint | batch={} cursor={} records={}",
                snapshot.batch_count,
                format_ts_ms(snapshot.cursor_ms),
                snapshot.record_count
            ),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start(COMPONENT, &logging_cfg);

    let import_cfg = import_config_from_env()?;
    let store_cfg = store_config_from_env()?;
    let feed_cfg = feed_config_from_env()?;
    log_store_selected(COMPONENT, &store_cfg.path);

    println!(
        "Kline import start | key={} store={} feed={} page_limit={}",
        import_cfg.key(),
        store_cfg.path.display(),
        feed_cfg.base_url,
        import_cfg.page_limit
    );

    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("Interrupt received, stopping after the current batch...");
            on_interrupt.cancel();
        }
    });

    // The blocking HTTP client must be built, used and dropped off the runtime.
    let report = tokio::task::spawn_blocking(move || -> Result<ImportReport, BoxError> {
        let store = SqliteCandleStore::new(store_cfg);
        let feed = BinanceKlineFeed::new(&feed_cfg)?;
        let controller =
            ImportController::new(import_cfg, store, feed)?.with_cancel_token(cancel);
        Ok(controller.run(&mut StdoutProgress)?)
    })
    .await??;

    println!("{report}");
    log_app_exit(COMPONENT, report.stop.as_str());

    if !report.stop.is_clean() {
        return Err(format!("import stopped: {}", report.stop.as_str()).into());
    }
    Ok(())
}
