//! Authoritative portfolio state: cash, holdings, watchlist.
//!
//! All reads and mutations go through `PortfolioStore::with_transaction`,
//! which serializes access behind one lock and persists the full snapshot
//! before releasing it. Reconciliation rewrites local state to match the
//! broker, which is always the source of truth after live fills.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::RiskCfg;
use crate::errors::TradingError;
use crate::resilience::ResilientBroker;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub quantity: i64,
    pub entry_price: f64,
    pub instrument_token: u32,
    #[serde(default = "default_exchange")]
    pub exchange: String,
    #[serde(default = "default_product")]
    pub product: String,
    #[serde(default)]
    pub purchase_date: Option<NaiveDate>,
    /// Highest close seen since entry; never decreases while the position
    /// is open and is not reset by partial sells.
    #[serde(default)]
    pub peak_price: Option<f64>,
    #[serde(default)]
    pub last_peak_date: Option<NaiveDate>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
}

fn default_exchange() -> String {
    "NSE".into()
}

fn default_product() -> String {
    "CNC".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchlistEntry {
    pub instrument_token: u32,
    /// Breakout trigger: entry converts to an order once price crosses
    /// above this.
    pub confirmation_price: f64,
    pub added_date: NaiveDate,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Portfolio {
    #[serde(default)]
    pub cash: f64,
    #[serde(default)]
    pub holdings: BTreeMap<String, Position>,
    #[serde(default)]
    pub watchlist: BTreeMap<String, WatchlistEntry>,
}

impl Portfolio {
    pub fn new(cash: f64) -> Self {
        Self {
            cash,
            ..Default::default()
        }
    }

    /// Apply a BUY fill: create the position or fold the fill into the
    /// volume-weighted average entry price.
    pub fn apply_buy_fill(
        &mut self,
        symbol: &str,
        fill_qty: i64,
        fill_price: f64,
        instrument_token: u32,
        today: NaiveDate,
    ) {
        if fill_qty <= 0 {
            return;
        }
        match self.holdings.get_mut(symbol) {
            Some(pos) => {
                let total_cost = pos.entry_price * pos.quantity as f64 + fill_price * fill_qty as f64;
                pos.quantity += fill_qty;
                pos.entry_price = total_cost / pos.quantity as f64;
            }
            None => {
                self.holdings.insert(
                    symbol.to_string(),
                    Position {
                        quantity: fill_qty,
                        entry_price: fill_price,
                        instrument_token,
                        exchange: default_exchange(),
                        product: default_product(),
                        purchase_date: Some(today),
                        peak_price: Some(fill_price),
                        last_peak_date: Some(today),
                        stop_loss: None,
                        take_profit: None,
                    },
                );
            }
        }
    }

    /// Apply a SELL fill; returns realized P&L `(price - entry) * qty`
    /// before costs. A position that reaches zero is removed, never kept
    /// as a zero-quantity row.
    pub fn apply_sell_fill(&mut self, symbol: &str, sell_qty: i64, sell_price: f64) -> f64 {
        let Some(pos) = self.holdings.get_mut(symbol) else {
            return 0.0;
        };
        let qty = sell_qty.min(pos.quantity);
        let realized = (sell_price - pos.entry_price) * qty as f64;
        pos.quantity -= qty;
        self.cash += sell_price * qty as f64;
        if self.holdings.get(symbol).is_some_and(|p| p.quantity == 0) {
            self.holdings.remove(symbol);
        }
        realized
    }

    /// Structural validation of a loaded snapshot.
    pub fn validate(&self) -> Result<(), String> {
        for (symbol, pos) in &self.holdings {
            if pos.quantity < 0 {
                return Err(format!("{symbol}: negative quantity {}", pos.quantity));
            }
            if pos.entry_price < 0.0 {
                return Err(format!("{symbol}: negative entry price {}", pos.entry_price));
            }
            if pos.quantity == 0 {
                return Err(format!("{symbol}: zero-quantity holding row"));
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct PortfolioStore {
    path: PathBuf,
    inner: Mutex<Portfolio>,
}

impl PortfolioStore {
    /// Load the portfolio from disk.
    ///
    /// Policy: a missing file means first-ever startup and initializes a
    /// fresh portfolio with `starting_cash`. A file that exists but fails
    /// to parse or validate means the agent has traded before, so the
    /// corruption is critical and startup halts rather than silently
    /// wiping history.
    pub fn load(path: impl AsRef<Path>, starting_cash: f64) -> Result<Self, TradingError> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            info!(
                path = %path.display(),
                cash = starting_cash,
                "no portfolio file; initializing fresh portfolio"
            );
            let portfolio = Portfolio::new(starting_cash);
            persist_to(&path, &portfolio)?;
            return Ok(Self {
                path,
                inner: Mutex::new(portfolio),
            });
        }

        let raw = std::fs::read_to_string(&path).map_err(|e| {
            TradingError::Critical(format!("cannot read portfolio file {}: {e}", path.display()))
        })?;
        let portfolio: Portfolio = serde_json::from_str(&raw).map_err(|e| {
            TradingError::Critical(format!(
                "portfolio file {} is corrupt ({e}); refusing to reinitialize after prior trading",
                path.display()
            ))
        })?;
        portfolio.validate().map_err(|e| {
            TradingError::Critical(format!(
                "portfolio file {} failed validation ({e}); refusing to reinitialize after prior trading",
                path.display()
            ))
        })?;
        info!(path = %path.display(), holdings = portfolio.holdings.len(), "loaded portfolio");
        Ok(Self {
            path,
            inner: Mutex::new(portfolio),
        })
    }

    /// Run `f` with exclusive access to the live portfolio. When `persist`
    /// is set and `f` succeeds, the full snapshot is written to disk before
    /// the lock is released, so no other transaction can observe an
    /// unpersisted mutation.
    pub async fn with_transaction<R>(
        &self,
        persist: bool,
        f: impl FnOnce(&mut Portfolio) -> Result<R, TradingError>,
    ) -> Result<R, TradingError> {
        let mut guard = self.inner.lock().await;
        let result = f(&mut guard)?;
        if persist {
            self.persist_blocking(&guard)?;
        }
        Ok(result)
    }

    /// Read-only copy for phases that iterate without holding the lock.
    /// Never use a snapshot to decide a mutation; re-check inside a
    /// transaction.
    pub async fn snapshot(&self) -> Portfolio {
        self.inner.lock().await.clone()
    }

    fn persist_blocking(&self, portfolio: &Portfolio) -> Result<(), TradingError> {
        persist_to(&self.path, portfolio)
    }

    /// Rewrite local state to match the broker's holdings and cash.
    /// Returns a human-readable diff summary; idempotent against an
    /// unchanged broker.
    pub async fn reconcile(
        &self,
        broker: &ResilientBroker,
        risk: &RiskCfg,
    ) -> Result<String, TradingError> {
        info!("starting portfolio reconciliation");
        let broker_holdings = broker
            .holdings()
            .await
            .map_err(|e| TradingError::Critical(format!("reconciliation failed: {e}")))?;
        let margins = broker
            .margins()
            .await
            .map_err(|e| TradingError::Critical(format!("reconciliation failed: {e}")))?;

        let mut summary: Vec<String> = Vec::new();
        self.with_transaction(true, |p| {
            if (p.cash - margins.available_cash).abs() > 0.005 {
                summary.push(format!("~ Cash updated to ₹{:.2}", margins.available_cash));
                p.cash = margins.available_cash;
            }

            let broker_symbols: std::collections::BTreeSet<&str> = broker_holdings
                .iter()
                .map(|h| h.tradingsymbol.as_str())
                .collect();

            // Sold or transferred outside the agent.
            let removed: Vec<String> = p
                .holdings
                .keys()
                .filter(|s| !broker_symbols.contains(s.as_str()))
                .cloned()
                .collect();
            for symbol in removed {
                summary.push(format!("- Removed sold holding: {symbol}"));
                p.holdings.remove(&symbol);
            }

            for item in &broker_holdings {
                match p.holdings.get_mut(&item.tradingsymbol) {
                    Some(pos) => {
                        if pos.quantity != item.quantity {
                            summary.push(format!(
                                "~ {} quantity {} -> {}",
                                item.tradingsymbol, pos.quantity, item.quantity
                            ));
                            pos.quantity = item.quantity;
                        }
                        if (pos.entry_price - item.average_price).abs() > 0.005 {
                            summary.push(format!(
                                "~ {} entry price {:.2} -> {:.2}",
                                item.tradingsymbol, pos.entry_price, item.average_price
                            ));
                            pos.entry_price = item.average_price;
                        }
                        pos.instrument_token = item.instrument_token;
                        pos.exchange = item.exchange.clone();
                        pos.product = item.product.clone();
                    }
                    None => {
                        summary.push(format!("+ Added new holding: {}", item.tradingsymbol));
                        p.holdings.insert(
                            item.tradingsymbol.clone(),
                            Position {
                                quantity: item.quantity,
                                entry_price: item.average_price,
                                instrument_token: item.instrument_token,
                                exchange: item.exchange.clone(),
                                product: item.product.clone(),
                                // Unknown purchase date: the holding-period
                                // gate does not apply to adopted positions.
                                purchase_date: None,
                                peak_price: Some(item.average_price),
                                last_peak_date: None,
                                stop_loss: Some(
                                    item.average_price * (1.0 - risk.default_stop_loss_pct / 100.0),
                                ),
                                take_profit: Some(
                                    item.average_price
                                        * (1.0 + risk.default_take_profit_pct / 100.0),
                                ),
                            },
                        );
                    }
                }
            }
            Ok(())
        })
        .await?;

        let report = if summary.is_empty() {
            "Reconciliation complete: no changes detected.".to_string()
        } else {
            format!(
                "Reconciliation complete:\n{}",
                summary
                    .iter()
                    .map(|s| format!("  {s}"))
                    .collect::<Vec<_>>()
                    .join("\n")
            )
        };
        info!("{report}");
        Ok(report)
    }
}

/// Full-overwrite JSON persistence; no partial or append writes.
fn persist_to(path: &Path, portfolio: &Portfolio) -> Result<(), TradingError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| TradingError::Critical(format!("cannot create state dir: {e}")))?;
        }
    }
    let json = serde_json::to_string_pretty(portfolio)
        .map_err(|e| TradingError::Critical(format!("cannot serialize portfolio: {e}")))?;
    std::fs::write(path, json).map_err(|e| {
        TradingError::Critical(format!("cannot persist portfolio to {}: {e}", path.display()))
    })
}

#[derive(Debug, Clone)]
pub struct PortfolioMetrics {
    pub total_value: f64,
    pub holdings_value: f64,
    pub available_cash: f64,
    pub unrealized_pnl: f64,
    pub holdings_count: usize,
}

/// Value the portfolio: live LTP in live mode, last historical close in
/// paper mode. Per-symbol pricing failures degrade to the entry price so a
/// single bad quote cannot sink the whole cycle.
pub async fn portfolio_metrics(
    broker: &ResilientBroker,
    snapshot: &Portfolio,
    paper: bool,
    today: NaiveDate,
) -> PortfolioMetrics {
    let mut holdings_value = 0.0;
    let mut unrealized = 0.0;

    if snapshot.holdings.is_empty() {
        return PortfolioMetrics {
            total_value: snapshot.cash,
            holdings_value: 0.0,
            available_cash: snapshot.cash,
            unrealized_pnl: 0.0,
            holdings_count: 0,
        };
    }

    let mut live_prices: std::collections::HashMap<String, f64> = Default::default();
    if !paper {
        let lookups: Vec<String> = snapshot
            .holdings
            .iter()
            .map(|(s, p)| format!("{}:{}", p.exchange, s))
            .collect();
        match broker.ltp(lookups).await {
            Ok(map) => live_prices = map,
            Err(e) => warn!(error = %e, "could not fetch LTP for portfolio metrics"),
        }
    }

    for (symbol, pos) in &snapshot.holdings {
        let price = if paper {
            match broker
                .historical_data(pos.instrument_token, today - chrono::Duration::days(5), today, "day")
                .await
            {
                Ok(candles) if !candles.is_empty() => candles[candles.len() - 1].close,
                Ok(_) => pos.entry_price,
                Err(e) => {
                    warn!(%symbol, error = %e, "could not price paper holding");
                    pos.entry_price
                }
            }
        } else {
            live_prices
                .get(&format!("{}:{}", pos.exchange, symbol))
                .copied()
                .unwrap_or(pos.entry_price)
        };
        holdings_value += price * pos.quantity as f64;
        unrealized += (price - pos.entry_price) * pos.quantity as f64;
    }

    PortfolioMetrics {
        total_value: snapshot.cash + holdings_value,
        holdings_value,
        available_cash: snapshot.cash,
        unrealized_pnl: unrealized,
        holdings_count: snapshot.holdings.len(),
    }
}
