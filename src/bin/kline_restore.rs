use kline_ingest::{
    init_logging, log_app_exit, log_app_start, log_store_selected, logging_config_from_env,
    restore_backup, restore_config_from_env, store_config_from_env, SqliteCandleStore,
};

const COMPONENT: &str = "kline_restore";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start(COMPONENT, &logging_cfg);

    let store_cfg = store_config_from_env()?;
    let restore_cfg = restore_config_from_env()?;
    log_store_selected(COMPONENT, &store_cfg.path);

    println!(
        "Restoring {} -> {} | on_existing={} verify_checksum={}",
        restore_cfg.input_path.display(),
        store_cfg.path.display(),
        restore_cfg.on_existing.as_str(),
        restore_cfg.verify_checksum
    );

    let store = SqliteCandleStore::new(store_cfg);
    let report = restore_backup(&store, &restore_cfg)?;
    println!("{report}");

    log_app_exit(COMPONENT, "restored");
    Ok(())
}
