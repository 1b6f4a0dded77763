//! Read-only discovery over candidate store locations.

use std::path::PathBuf;

use tracing::{debug, info};

use crate::store::{
    key_summaries, open_read_only, table_columns, table_exists, KeySummary, StoreConfig,
    StoreError, MARKET_DATA_TABLE,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub declared_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreInventory {
    pub table_exists: bool,
    pub columns: Vec<ColumnInfo>,
    pub row_count: u64,
    pub summaries: Vec<KeySummary>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Opened(StoreInventory),
    Unavailable { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreProbe {
    pub path: PathBuf,
    pub outcome: ProbeOutcome,
}

impl StoreProbe {
    /// Opened and holds the candle table.
    pub fn is_usable(&self) -> bool {
        matches!(&self.outcome, ProbeOutcome::Opened(inv) if inv.table_exists)
    }
}

/// Probes every candidate in order. Never writes to or creates a store.
pub fn probe_stores(candidates: &[StoreConfig]) -> Vec<StoreProbe> {
    candidates.iter().map(probe_store).collect()
}

pub fn probe_store(cfg: &StoreConfig) -> StoreProbe {
    let outcome = match inventory(cfg) {
        Ok(inv) => {
            info!(
                component = "probe",
                event = "probe.opened",
                path = %cfg.path.display(),
                table_exists = inv.table_exists,
                rows = inv.row_count
            );
            ProbeOutcome::Opened(inv)
        }
        Err(err) => {
            debug!(
                component = "probe",
                event = "probe.unavailable",
                path = %cfg.path.display(),
                error = %err
            );
            ProbeOutcome::Unavailable {
                reason: err.to_string(),
            }
        }
    };
    StoreProbe {
        path: cfg.path.clone(),
        outcome,
    }
}

fn inventory(cfg: &StoreConfig) -> Result<StoreInventory, StoreError> {
    let conn = open_read_only(&cfg.path)?;
    conn.busy_timeout(std::time::Duration::from_millis(cfg.busy_timeout_ms))?;

    if !table_exists(&conn, MARKET_DATA_TABLE)? {
        return Ok(StoreInventory {
            table_exists: false,
            columns: Vec::new(),
            row_count: 0,
            summaries: Vec::new(),
        });
    }

    let columns = table_columns(&conn, MARKET_DATA_TABLE)?
        .into_iter()
        .map(|(name, declared_type)| ColumnInfo {
            name,
            declared_type,
        })
        .collect();
    let row_count: i64 =
        conn.query_row("SELECT COUNT(*) FROM market_data", [], |row| row.get(0))?;

    Ok(StoreInventory {
        table_exists: true,
        columns,
        row_count: row_count as u64,
        summaries: key_summaries(&conn)?,
    })
}
