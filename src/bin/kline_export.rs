use kline_ingest::{
    backup_config_from_env, export_backup, format_ts_ms, init_logging, log_app_exit, log_app_start,
    log_store_selected, logging_config_from_env, store_config_from_env, SqliteCandleStore,
};

const COMPONENT: &str = "kline_export";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start(COMPONENT, &logging_cfg);

    let store_cfg = store_config_from_env()?;
    let backup_cfg = backup_config_from_env()?;
    log_store_selected(COMPONENT, &store_cfg.path);

    println!(
        "Exporting {} -> {}",
        store_cfg.path.display(),
        backup_cfg.backup_path().display()
    );

    let store = SqliteCandleStore::new(store_cfg);
    let report = export_backup(&store, &backup_cfg)?;
    println!("{report}");

    for summary in store.key_summaries()? {
        println!(
            "  {} ({}): {} rows ({} to {})",
            summary.symbol,
            summary.time_frame,
            summary.rows,
            format_ts_ms(summary.first_open_time_ms),
            format_ts_ms(summary.last_open_time_ms)
        );
    }

    log_app_exit(COMPONENT, "exported");
    Ok(())
}
