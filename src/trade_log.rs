//! Append-only CSV log of executed trades. One row per fill, never
//! mutated after append.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use tracing::info;

use crate::types::TradeAction;

const HEADER: [&str; 7] = [
    "timestamp", "symbol", "action", "quantity", "price", "pnl", "reason",
];

pub struct TradeLog {
    path: PathBuf,
}

impl TradeLog {
    /// Open (creating with a header row if needed) the trade log.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let needs_header = match std::fs::metadata(&path) {
            Ok(meta) => meta.len() == 0,
            Err(_) => true,
        };
        if needs_header {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("cannot create trade log at {}", path.display()))?;
            let mut writer = csv::Writer::from_writer(file);
            writer.write_record(HEADER)?;
            writer.flush()?;
            info!(path = %path.display(), "trade log created");
        }
        Ok(Self { path })
    }

    pub fn record(
        &self,
        symbol: &str,
        action: TradeAction,
        quantity: i64,
        price: f64,
        pnl: f64,
        reason: &str,
    ) -> Result<()> {
        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("cannot open trade log at {}", self.path.display()))?;
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record([
            Local::now().to_rfc3339(),
            symbol.to_string(),
            action.to_string(),
            quantity.to_string(),
            format!("{price:.2}"),
            format!("{pnl:.2}"),
            reason.to_string(),
        ])?;
        writer.flush()?;
        Ok(())
    }
}
