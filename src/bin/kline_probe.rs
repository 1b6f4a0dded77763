use kline_ingest::{
    format_ts_ms, init_logging, log_app_exit, log_app_start, logging_config_from_env,
    probe_configs_from_env, probe_stores, ProbeOutcome,
};

const COMPONENT: &str = "kline_probe";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start(COMPONENT, &logging_cfg);

    let candidates = probe_configs_from_env()?;
    println!("Probing {} candidate store(s)", candidates.len());

    let probes = probe_stores(&candidates);
    for probe in &probes {
        match &probe.outcome {
            ProbeOutcome::Unavailable { reason } => {
                println!("\n{} | unavailable: {}", probe.path.display(), reason);
            }
            ProbeOutcome::Opened(inv) if !inv.table_exists => {
                println!("\n{} | opened, no market_data table", probe.path.display());
            }
            ProbeOutcome::Opened(inv) => {
                println!(
                    "\n{} | opened, market_data rows={}",
                    probe.path.display(),
                    inv.row_count
                );
                let columns: Vec<String> = inv
                    .columns
                    .iter()
                    .map(|col| format!("{} {}", col.name, col.declared_type))
                    .collect();
                println!("  columns: {}", columns.join(", "));
                for summary in &inv.summaries {
                    println!(
                        "  {} ({}): {} rows ({} to {})",
                        summary.symbol,
                        summary.time_frame,
                        summary.rows,
                        format_ts_ms(summary.first_open_time_ms),
                        format_ts_ms(summary.last_open_time_ms)
                    );
                }
            }
        }
    }

    let usable = probes.iter().filter(|probe| probe.is_usable()).count();
    log_app_exit(COMPONENT, if usable > 0 { "found" } else { "none_usable" });
    if usable == 0 {
        return Err("no candidate store holds a market_data table".into());
    }
    Ok(())
}
