//! Position-lifecycle orchestration.
//!
//! Per symbol and per cycle: screened candidates may become watchlisted
//! (deferred entry pending breakout confirmation), watchlisted symbols
//! convert to positions once price crosses their confirmation level, held
//! positions run the exit-rule ladder and, failing that, the decision
//! source. Every portfolio mutation happens inside a store transaction;
//! live fills are followed by reconciliation against the broker.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tracing::{error, info, warn};

use crate::alert::Alerter;
use crate::config::AppConfig;
use crate::decision::{DecisionContext, DecisionSource};
use crate::errors::TradingError;
use crate::execution::{place_and_confirm_order, place_paper_order};
use crate::indicators;
use crate::portfolio::{portfolio_metrics, PortfolioMetrics, PortfolioStore, WatchlistEntry};
use crate::resilience::ResilientBroker;
use crate::review::{evaluate_held_position, HeldOutcome};
use crate::risk::RiskEngine;
use crate::screener::{self, Opportunity};
use crate::trade_log::TradeLog;
use crate::types::TradeAction;

/// What happened during one trading cycle, for the summary report.
#[derive(Debug, Default)]
pub struct CycleActivity {
    pub trades: Vec<String>,
    pub holds: Vec<(String, String)>,
    pub watchlisted: Vec<String>,
    pub skipped: BTreeMap<String, Vec<String>>,
}

impl CycleActivity {
    fn skip(&mut self, reason: impl Into<String>, symbol: &str) {
        self.skipped
            .entry(reason.into())
            .or_default()
            .push(symbol.to_string());
    }
}

pub struct Trader {
    broker: ResilientBroker,
    store: Arc<PortfolioStore>,
    decisions: Arc<dyn DecisionSource>,
    alerter: Arc<dyn Alerter>,
    trade_log: TradeLog,
    risk: RiskEngine,
    cfg: AppConfig,
    /// Symbols sold this run; not re-entered until restart.
    cooldown: HashSet<String>,
    last_deep_review: Option<tokio::time::Instant>,
}

impl Trader {
    pub fn new(
        broker: ResilientBroker,
        store: Arc<PortfolioStore>,
        decisions: Arc<dyn DecisionSource>,
        alerter: Arc<dyn Alerter>,
        trade_log: TradeLog,
        cfg: AppConfig,
    ) -> Self {
        let risk = RiskEngine::new(cfg.risk.clone());
        Self {
            broker,
            store,
            decisions,
            alerter,
            trade_log,
            risk,
            cfg,
            cooldown: HashSet::new(),
            last_deep_review: None,
        }
    }

    /// One full trading cycle. Per-symbol failures are logged and skipped;
    /// only critical errors abort the cycle.
    pub async fn run_cycle(&mut self, today: NaiveDate) -> Result<CycleActivity, TradingError> {
        let mut activity = CycleActivity::default();
        let deep = self.deep_review_due();

        // Phase 1: manage open positions.
        let holdings: Vec<(String, u32)> = {
            let snapshot = self.store.snapshot().await;
            snapshot
                .holdings
                .iter()
                .map(|(s, p)| (s.clone(), p.instrument_token))
                .collect()
        };
        if !holdings.is_empty() {
            info!(count = holdings.len(), deep, "managing holdings");
        }
        for (symbol, token) in holdings {
            if let Err(e) = self
                .analyze_held(&symbol, token, today, deep, &mut activity)
                .await
            {
                if e.is_critical() {
                    return Err(e);
                }
                error!(%symbol, error = %e, "error analyzing holding");
                activity.skip("Analysis error", &symbol);
            }
        }

        // Phase 2: watchlist confirmations and expiries.
        self.process_watchlist(today, &mut activity).await?;

        // Phase 3: screened opportunities.
        let opportunities = screener::top_opportunities(
            &self.broker,
            &self.cfg.screener,
            &self.cfg.broker.exchange,
            today,
        )
        .await;
        let snapshot = self.store.snapshot().await;
        for opp in opportunities {
            if snapshot.holdings.contains_key(&opp.symbol)
                || snapshot.watchlist.contains_key(&opp.symbol)
                || self.cooldown.contains(&opp.symbol)
            {
                continue;
            }
            if let Err(e) = self.analyze_candidate(&opp, today, &mut activity).await {
                if e.is_critical() {
                    return Err(e);
                }
                error!(symbol = %opp.symbol, error = %e, "error analyzing opportunity");
                activity.skip("Analysis error", &opp.symbol);
            }
        }

        // Phase 4: cycle report.
        let snapshot = self.store.snapshot().await;
        let metrics =
            portfolio_metrics(&self.broker, &snapshot, self.cfg.is_paper(), today).await;
        let summary = format_cycle_summary(&activity, &metrics);
        info!("{summary}");
        self.alerter.send(&summary).await;

        Ok(activity)
    }

    fn deep_review_due(&mut self) -> bool {
        if !self.cfg.review.enable {
            return false;
        }
        let interval = Duration::from_secs(self.cfg.review.interval_sec);
        let due = self
            .last_deep_review
            .is_none_or(|t| t.elapsed() >= interval);
        if due {
            self.last_deep_review = Some(tokio::time::Instant::now());
        }
        due
    }

    async fn fetch_series(
        &self,
        token: u32,
        today: NaiveDate,
    ) -> Result<Vec<crate::types::Candle>, TradingError> {
        self.broker
            .historical_data(token, today - chrono::Duration::days(90), today, "day")
            .await
    }

    async fn analyze_held(
        &mut self,
        symbol: &str,
        token: u32,
        today: NaiveDate,
        deep: bool,
        activity: &mut CycleActivity,
    ) -> Result<(), TradingError> {
        let candles = self.fetch_series(token, today).await?;
        if candles.len() < indicators::MIN_CANDLES {
            activity.skip("Insufficient historical data", symbol);
            return Ok(());
        }
        let ind = indicators::compute(&candles);
        let price = candles[candles.len() - 1].close;

        // Peak updates must be visible to the next cycle even when no
        // trade happens, so the evaluation itself runs persisted.
        let review_cfg = self.cfg.review.clone();
        let atr_multiplier = self.cfg.risk.atr_multiplier;
        let outcome = {
            let symbol = symbol.to_string();
            let ind = ind.clone();
            self.store
                .with_transaction(true, move |p| {
                    Ok(p.holdings.get_mut(&symbol).map(|pos| {
                        evaluate_held_position(
                            &symbol,
                            pos,
                            price,
                            &ind,
                            today,
                            &review_cfg,
                            atr_multiplier,
                            deep,
                        )
                    }))
                })
                .await?
        };
        let Some(outcome) = outcome else {
            return Ok(());
        };

        match outcome {
            HeldOutcome::HoldGated { reason } => {
                activity.holds.push((symbol.to_string(), reason));
                Ok(())
            }
            HeldOutcome::Exit { reason } => {
                info!(symbol, %reason, "exit rule fired; initiating sell");
                self.execute_sell(symbol, price, today, &reason, activity)
                    .await
            }
            HeldOutcome::NoSignal => {
                let ctx = DecisionContext {
                    symbol: symbol.to_string(),
                    price,
                    is_existing: true,
                    indicators: ind,
                };
                let decision = self.decisions.get_decision(&ctx).await;
                info!(
                    symbol,
                    action = %decision.action,
                    confidence = decision.confidence,
                    reasoning = %decision.reasoning,
                    "decision source consulted"
                );
                match decision.action {
                    TradeAction::Sell if decision.actionable(self.cfg.risk.min_confidence) => {
                        self.execute_sell(symbol, price, today, &decision.reasoning, activity)
                            .await
                    }
                    TradeAction::Sell => {
                        activity.skip(
                            format!("Low confidence ({})", decision.confidence),
                            symbol,
                        );
                        Ok(())
                    }
                    // Never average into an existing position.
                    _ => {
                        activity
                            .holds
                            .push((symbol.to_string(), decision.reasoning));
                        Ok(())
                    }
                }
            }
        }
    }

    async fn execute_sell(
        &mut self,
        symbol: &str,
        price: f64,
        today: NaiveDate,
        reason: &str,
        activity: &mut CycleActivity,
    ) -> Result<(), TradingError> {
        if self.cfg.is_paper() {
            let sell = {
                let symbol = symbol.to_string();
                self.store
                    .with_transaction(true, move |p| {
                        let Some(pos) = p.holdings.get(&symbol) else {
                            return Ok(None);
                        };
                        let quantity = pos.quantity;
                        let entry_price = pos.entry_price;
                        let token = pos.instrument_token;
                        let result = place_paper_order(
                            p,
                            &symbol,
                            TradeAction::Sell,
                            quantity,
                            price,
                            token,
                            today,
                        );
                        Ok(Some((result, quantity, entry_price)))
                    })
                    .await?
            };
            let Some((result, quantity, entry_price)) = sell else {
                return Ok(());
            };
            if result.filled() {
                let pnl = (price - entry_price) * quantity as f64;
                self.log_trade(symbol, TradeAction::Sell, quantity, price, pnl, reason);
                self.cooldown.insert(symbol.to_string());
                activity.trades.push(format!("SOLD {symbol}"));
                self.alerter
                    .send(&format!(
                        "(Paper) Sold {quantity} of {symbol} at ₹{price:.2}. P&L: ₹{pnl:.2} ({reason})"
                    ))
                    .await;
            } else {
                activity.skip("Paper SELL rejected", symbol);
            }
            return Ok(());
        }

        // Live path: confirm the fill before touching local state.
        let held = {
            let symbol = symbol.to_string();
            self.store
                .with_transaction(false, move |p| {
                    Ok(p.holdings
                        .get(&symbol)
                        .map(|pos| (pos.quantity, pos.entry_price)))
                })
                .await?
        };
        let Some((quantity, entry_price)) = held else {
            return Ok(());
        };

        let result = place_and_confirm_order(
            &self.broker,
            &self.cfg.broker.exchange,
            symbol,
            TradeAction::Sell,
            quantity,
            Duration::from_secs(self.cfg.exec.order_poll_interval_sec),
            Duration::from_secs(self.cfg.exec.order_timeout_sec),
        )
        .await?;

        if result.filled() {
            let pnl = (result.average_price - entry_price) * result.filled_quantity as f64;
            self.log_trade(
                symbol,
                TradeAction::Sell,
                result.filled_quantity,
                result.average_price,
                pnl,
                reason,
            );
            self.cooldown.insert(symbol.to_string());
            activity.trades.push(format!("SOLD {symbol}"));
            self.alerter
                .send(&format!(
                    "Sold {} of {symbol} at ₹{:.2}. P&L: ₹{pnl:.2} ({reason}). Order: {}",
                    result.filled_quantity,
                    result.average_price,
                    result.order_id.as_deref().unwrap_or("?")
                ))
                .await;
            // The broker now owns the truth about what is left.
            let report = self.store.reconcile(&self.broker, &self.cfg.risk).await?;
            self.alerter.send(&report).await;
        } else {
            // No terminal fill: prior state stands untouched.
            warn!(symbol, status = %result.status, "SELL did not fill; position unchanged");
            activity.skip(format!("SELL order {}", result.status), symbol);
        }
        Ok(())
    }

    async fn analyze_candidate(
        &mut self,
        opp: &Opportunity,
        today: NaiveDate,
        activity: &mut CycleActivity,
    ) -> Result<(), TradingError> {
        let symbol = opp.symbol.as_str();
        let candles = self.fetch_series(opp.instrument_token, today).await?;
        if candles.len() < indicators::MIN_CANDLES {
            activity.skip("Insufficient historical data", symbol);
            return Ok(());
        }
        let ind = indicators::compute(&candles);
        let price = candles[candles.len() - 1].close;

        let ctx = DecisionContext {
            symbol: symbol.to_string(),
            price,
            is_existing: false,
            indicators: ind.clone(),
        };
        let decision = self.decisions.get_decision(&ctx).await;
        info!(
            symbol,
            action = %decision.action,
            confidence = decision.confidence,
            reasoning = %decision.reasoning,
            "decision source consulted"
        );

        if decision.action != TradeAction::Buy {
            activity.skip("No BUY signal", symbol);
            return Ok(());
        }
        if !decision.actionable(self.cfg.risk.min_confidence) {
            activity.skip(format!("Low confidence ({})", decision.confidence), symbol);
            return Ok(());
        }

        if self.cfg.review.confirm_breakout {
            // Defer entry until price clears the recent high.
            let confirmation_price = candles
                .iter()
                .rev()
                .take(self.cfg.review.breakout_window)
                .map(|c| c.high)
                .fold(f64::MIN, f64::max);
            let entry = WatchlistEntry {
                instrument_token: opp.instrument_token,
                confirmation_price,
                added_date: today,
            };
            {
                let symbol = symbol.to_string();
                self.store
                    .with_transaction(true, move |p| {
                        p.watchlist.insert(symbol, entry);
                        Ok(())
                    })
                    .await?;
            }
            info!(symbol, confirmation_price, "watchlisted pending breakout confirmation");
            activity.watchlisted.push(symbol.to_string());
            Ok(())
        } else {
            self.try_enter(symbol, opp.instrument_token, price, ind.atr_14, today, activity)
                .await
                .map(|_| ())
        }
    }

    async fn process_watchlist(
        &mut self,
        today: NaiveDate,
        activity: &mut CycleActivity,
    ) -> Result<(), TradingError> {
        let entries: Vec<(String, WatchlistEntry)> = {
            let snapshot = self.store.snapshot().await;
            snapshot.watchlist.into_iter().collect()
        };

        for (symbol, entry) in entries {
            let age_days = (today - entry.added_date).num_days();
            if age_days > self.cfg.review.watchlist_expiry_days {
                info!(%symbol, age_days, "watchlist entry expired without confirmation");
                {
                    let symbol = symbol.clone();
                    self.store
                        .with_transaction(true, move |p| {
                            p.watchlist.remove(&symbol);
                            Ok(())
                        })
                        .await?;
                }
                activity.skip("Watchlist expired", &symbol);
                continue;
            }

            let candles = match self.fetch_series(entry.instrument_token, today).await {
                Ok(c) => c,
                Err(e) if e.is_critical() => return Err(e),
                Err(e) => {
                    warn!(%symbol, error = %e, "could not price watchlist entry");
                    continue;
                }
            };
            if candles.len() < indicators::MIN_CANDLES {
                continue;
            }
            // Live mode confirms against a live quote; paper mode settles
            // for the last close.
            let price = if self.cfg.is_paper() {
                candles[candles.len() - 1].close
            } else {
                let instrument = format!("{}:{symbol}", self.cfg.broker.exchange);
                match self.broker.quote(&instrument).await {
                    Ok(q) => q.last_price,
                    Err(e) if e.is_critical() => return Err(e),
                    Err(e) => {
                        warn!(%symbol, error = %e, "could not quote watchlist entry");
                        continue;
                    }
                }
            };
            if price <= entry.confirmation_price {
                continue;
            }

            info!(
                %symbol,
                price,
                confirmation = entry.confirmation_price,
                "breakout confirmed; sizing entry"
            );
            let ind = indicators::compute(&candles);
            let entered = self
                .try_enter(&symbol, entry.instrument_token, price, ind.atr_14, today, activity)
                .await?;
            if entered {
                let symbol = symbol.clone();
                self.store
                    .with_transaction(true, move |p| {
                        p.watchlist.remove(&symbol);
                        Ok(())
                    })
                    .await?;
            }
        }
        Ok(())
    }

    /// Size and place a new BUY. Returns whether a position was opened.
    async fn try_enter(
        &mut self,
        symbol: &str,
        token: u32,
        price: f64,
        atr: Option<f64>,
        today: NaiveDate,
        activity: &mut CycleActivity,
    ) -> Result<bool, TradingError> {
        let snapshot = self.store.snapshot().await;
        if snapshot.holdings.contains_key(symbol) {
            return Ok(false);
        }
        let metrics =
            portfolio_metrics(&self.broker, &snapshot, self.cfg.is_paper(), today).await;

        let sized = match self
            .risk
            .position_size(metrics.total_value, metrics.available_cash, price, atr)
        {
            Ok(s) => s,
            Err(e) => {
                info!(symbol, reason = %e, "entry rejected by sizing");
                activity.skip(e.to_string(), symbol);
                return Ok(false);
            }
        };

        if self.cfg.is_paper() {
            let result = {
                let symbol = symbol.to_string();
                self.store
                    .with_transaction(true, move |p| {
                        let result = place_paper_order(
                            p,
                            &symbol,
                            TradeAction::Buy,
                            sized.quantity,
                            price,
                            token,
                            today,
                        );
                        if result.filled() {
                            if let Some(pos) = p.holdings.get_mut(&symbol) {
                                pos.stop_loss = Some(sized.stop_loss);
                                pos.take_profit = Some(sized.take_profit);
                            }
                        }
                        Ok(result)
                    })
                    .await?
            };
            if result.filled() {
                self.log_trade(symbol, TradeAction::Buy, sized.quantity, price, 0.0, "entry");
                activity.trades.push(format!("BOUGHT {symbol}"));
                self.alerter
                    .send(&format!(
                        "(Paper) Bought {} of {symbol} at ₹{price:.2} (SL {:.2}, TP {:.2})",
                        sized.quantity, sized.stop_loss, sized.take_profit
                    ))
                    .await;
                return Ok(true);
            }
            activity.skip("Paper BUY rejected", symbol);
            return Ok(false);
        }

        let result = place_and_confirm_order(
            &self.broker,
            &self.cfg.broker.exchange,
            symbol,
            TradeAction::Buy,
            sized.quantity,
            Duration::from_secs(self.cfg.exec.order_poll_interval_sec),
            Duration::from_secs(self.cfg.exec.order_timeout_sec),
        )
        .await?;

        if !result.filled() {
            // No terminal fill: no position is created or modified.
            warn!(symbol, status = %result.status, "BUY did not fill");
            activity.skip(format!("BUY order {}", result.status), symbol);
            return Ok(false);
        }

        // Adopt the broker's view of the fill, then stamp our own
        // lifecycle fields on the reconciled position.
        let report = self.store.reconcile(&self.broker, &self.cfg.risk).await?;
        self.alerter.send(&report).await;
        {
            let symbol = symbol.to_string();
            self.store
                .with_transaction(true, move |p| {
                    if let Some(pos) = p.holdings.get_mut(&symbol) {
                        pos.purchase_date = Some(today);
                        pos.peak_price = Some(price);
                        pos.last_peak_date = Some(today);
                        pos.stop_loss = Some(sized.stop_loss);
                        pos.take_profit = Some(sized.take_profit);
                    }
                    Ok(())
                })
                .await?;
        }
        self.log_trade(
            symbol,
            TradeAction::Buy,
            result.filled_quantity,
            result.average_price,
            0.0,
            "entry",
        );
        activity.trades.push(format!("BOUGHT {symbol}"));
        self.alerter
            .send(&format!(
                "Bought {} of {symbol} at ₹{:.2}. Order: {}",
                result.filled_quantity,
                result.average_price,
                result.order_id.as_deref().unwrap_or("?")
            ))
            .await;
        Ok(true)
    }

    fn log_trade(
        &self,
        symbol: &str,
        action: TradeAction,
        quantity: i64,
        price: f64,
        pnl: f64,
        reason: &str,
    ) {
        if let Err(e) = self
            .trade_log
            .record(symbol, action, quantity, price, pnl, reason)
        {
            error!(symbol, error = %e, "could not write trade log");
        }
    }
}

pub fn format_cycle_summary(activity: &CycleActivity, metrics: &PortfolioMetrics) -> String {
    let mut lines = vec!["--- Trading Cycle Report ---".to_string()];

    lines.push(format!("Trades executed: {}", activity.trades.len()));
    for trade in &activity.trades {
        lines.push(format!("  - {trade}"));
    }

    if !activity.watchlisted.is_empty() {
        lines.push(format!("Watchlisted: {}", activity.watchlisted.join(", ")));
    }

    if !activity.holds.is_empty() {
        lines.push(format!("Held positions: {}", activity.holds.len()));
        for (symbol, reason) in &activity.holds {
            lines.push(format!("  - {symbol}: {reason}"));
        }
    }

    if !activity.skipped.is_empty() {
        lines.push("Skipped:".to_string());
        for (reason, symbols) in &activity.skipped {
            lines.push(format!("  - {reason}: {}", symbols.join(", ")));
        }
    }

    lines.push("--- Portfolio ---".to_string());
    lines.push(format!("Cash: ₹{:.2}", metrics.available_cash));
    lines.push(format!(
        "Holdings: {} (value ₹{:.2})",
        metrics.holdings_count, metrics.holdings_value
    ));
    lines.push(format!("Unrealized P&L: ₹{:.2}", metrics.unrealized_pnl));
    lines.push(format!("Total value: ₹{:.2}", metrics.total_value));

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::testkit::RecordingAlerter;
    use crate::broker::testkit::ScriptedKite;
    use crate::decision::Decision;
    use crate::portfolio::Position;
    use crate::resilience::testkit::scripted_broker;
    use crate::types::Candle;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Decision source that always answers with a fixed decision.
    struct StubSource(Mutex<Decision>);

    #[async_trait]
    impl DecisionSource for StubSource {
        async fn get_decision(&self, _ctx: &DecisionContext) -> Decision {
            self.0.lock().unwrap().clone()
        }
    }

    fn day(n: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, n).unwrap()
    }

    fn ramp_candles(len: usize, last_close: f64) -> Vec<Candle> {
        let start = last_close - (len as f64 - 1.0);
        (0..len)
            .map(|i| {
                let close = start + i as f64;
                Candle {
                    date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
                        + chrono::Duration::days(i as i64),
                    open: close,
                    high: close + 1.0,
                    low: close - 1.0,
                    close,
                    volume: 500_000,
                }
            })
            .collect()
    }

    struct Fixture {
        kite: std::sync::Arc<ScriptedKite>,
        trader: Trader,
        alerter: Arc<RecordingAlerter>,
        handle: std::thread::JoinHandle<()>,
        _dir: tempfile::TempDir,
    }

    fn fixture(decision: Decision) -> Fixture {
        let (kite, broker, handle) = scripted_broker();
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            PortfolioStore::load(dir.path().join("portfolio.json"), 100_000.0).unwrap(),
        );
        let alerter = Arc::new(RecordingAlerter::default());
        let trade_log = TradeLog::new(dir.path().join("tradelog.csv")).unwrap();
        let cfg = AppConfig::default();
        assert!(cfg.is_paper());
        let trader = Trader::new(
            broker,
            store,
            Arc::new(StubSource(Mutex::new(decision))),
            alerter.clone(),
            trade_log,
            cfg,
        );
        Fixture {
            kite,
            trader,
            alerter,
            handle,
            _dir: dir,
        }
    }

    fn shutdown(f: Fixture) {
        f.trader.broker.stop_gateway();
        f.handle.join().unwrap();
    }

    async fn seed_position(f: &Fixture, symbol: &str, qty: i64, entry: f64, purchased: NaiveDate) {
        let symbol = symbol.to_string();
        f.trader
            .store
            .with_transaction(true, move |p| {
                p.holdings.insert(
                    symbol,
                    Position {
                        quantity: qty,
                        entry_price: entry,
                        instrument_token: 42,
                        exchange: "NSE".into(),
                        product: "CNC".into(),
                        purchase_date: Some(purchased),
                        peak_price: Some(entry),
                        last_peak_date: Some(purchased),
                        stop_loss: None,
                        take_profit: None,
                    },
                );
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn buy_signal_defers_to_watchlist_with_breakout_trigger() {
        let mut f = fixture(Decision::new(TradeAction::Buy, 8, "uptrend pullback"));
        *f.kite.candles.lock().unwrap() = ramp_candles(60, 159.0);

        let opp = Opportunity {
            symbol: "INFY".into(),
            instrument_token: 42,
            score: 50.0,
        };
        let mut activity = CycleActivity::default();
        f.trader
            .analyze_candidate(&opp, day(10), &mut activity)
            .await
            .unwrap();

        let p = f.trader.store.snapshot().await;
        let entry = &p.watchlist["INFY"];
        // Highest high of the last 20 candles: 159 + 1.
        assert!((entry.confirmation_price - 160.0).abs() < 1e-9);
        assert_eq!(entry.added_date, day(10));
        assert!(p.holdings.is_empty());
        assert_eq!(activity.watchlisted, vec!["INFY"]);

        shutdown(f);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn watchlist_confirms_and_opens_position() {
        let mut f = fixture(Decision::new(TradeAction::Buy, 8, "uptrend pullback"));
        // Price now above the stored confirmation level of 160.
        *f.kite.candles.lock().unwrap() = ramp_candles(60, 161.0);

        let store = f.trader.store.clone();
        store
            .with_transaction(true, |p| {
                p.watchlist.insert(
                    "INFY".into(),
                    WatchlistEntry {
                        instrument_token: 42,
                        confirmation_price: 160.0,
                        added_date: day(9),
                    },
                );
                Ok(())
            })
            .await
            .unwrap();

        let mut activity = CycleActivity::default();
        f.trader
            .process_watchlist(day(10), &mut activity)
            .await
            .unwrap();

        let p = f.trader.store.snapshot().await;
        assert!(p.watchlist.is_empty());
        let pos = &p.holdings["INFY"];
        assert!(pos.quantity > 0);
        assert_eq!(pos.purchase_date, Some(day(10)));
        assert_eq!(pos.peak_price, Some(161.0));
        assert!(pos.stop_loss.is_some());
        // Cash was debited by the fill.
        assert!(p.cash < 100_000.0);
        assert_eq!(activity.trades, vec!["BOUGHT INFY"]);

        shutdown(f);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn watchlist_expires_without_confirmation() {
        let mut f = fixture(Decision::new(TradeAction::Hold, 6, "no setup today"));
        *f.kite.candles.lock().unwrap() = ramp_candles(60, 150.0);

        let store = f.trader.store.clone();
        store
            .with_transaction(true, |p| {
                p.watchlist.insert(
                    "INFY".into(),
                    WatchlistEntry {
                        instrument_token: 42,
                        confirmation_price: 200.0,
                        added_date: day(1),
                    },
                );
                Ok(())
            })
            .await
            .unwrap();

        let mut activity = CycleActivity::default();
        // Expiry is 3 days; day 10 is long past.
        f.trader
            .process_watchlist(day(10), &mut activity)
            .await
            .unwrap();

        let p = f.trader.store.snapshot().await;
        assert!(p.watchlist.is_empty());
        assert!(p.holdings.is_empty());

        shutdown(f);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn decision_sell_exits_position_in_paper_mode() {
        let mut f = fixture(Decision::new(TradeAction::Sell, 9, "confirmed weakness"));
        *f.kite.candles.lock().unwrap() = ramp_candles(60, 159.0);
        seed_position(&f, "INFY", 10, 100.0, day(5)).await;

        let mut activity = CycleActivity::default();
        f.trader
            .analyze_held("INFY", 42, day(10), false, &mut activity)
            .await
            .unwrap();

        let p = f.trader.store.snapshot().await;
        assert!(!p.holdings.contains_key("INFY"));
        // 100_000 + 10 * 159 credited on the simulated fill.
        assert!((p.cash - 101_590.0).abs() < 1e-9);
        assert_eq!(activity.trades, vec!["SOLD INFY"]);
        assert!(f.trader.cooldown.contains("INFY"));
        let alerts = f.alerter.messages.lock().unwrap().clone();
        assert!(alerts.iter().any(|m| m.contains("Sold 10 of INFY")));

        shutdown(f);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fail_safe_decision_takes_no_action() {
        let mut f = fixture(Decision::fail_safe());
        *f.kite.candles.lock().unwrap() = ramp_candles(60, 159.0);
        seed_position(&f, "INFY", 10, 100.0, day(5)).await;

        let mut activity = CycleActivity::default();
        f.trader
            .analyze_held("INFY", 42, day(10), false, &mut activity)
            .await
            .unwrap();

        // Held untouched: the fail-safe HOLD never trades despite its
        // maximum confidence.
        let p = f.trader.store.snapshot().await;
        assert_eq!(p.holdings["INFY"].quantity, 10);
        assert!(activity.trades.is_empty());

        // Same for a new candidate.
        let opp = Opportunity {
            symbol: "TCS".into(),
            instrument_token: 7,
            score: 10.0,
        };
        f.trader
            .analyze_candidate(&opp, day(10), &mut activity)
            .await
            .unwrap();
        let p = f.trader.store.snapshot().await;
        assert!(!p.watchlist.contains_key("TCS"));
        assert!(!p.holdings.contains_key("TCS"));

        shutdown(f);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn min_holding_gate_blocks_decision_sell() {
        let mut f = fixture(Decision::new(TradeAction::Sell, 10, "sell it all now"));
        *f.kite.candles.lock().unwrap() = ramp_candles(60, 159.0);
        // Purchased yesterday; min_holding_days = 3.
        seed_position(&f, "INFY", 10, 100.0, day(9)).await;

        let mut activity = CycleActivity::default();
        f.trader
            .analyze_held("INFY", 42, day(10), true, &mut activity)
            .await
            .unwrap();

        let p = f.trader.store.snapshot().await;
        assert_eq!(p.holdings["INFY"].quantity, 10);
        assert!(activity.trades.is_empty());
        assert!(activity
            .holds
            .iter()
            .any(|(s, reason)| s == "INFY" && reason.contains("min 3")));

        shutdown(f);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cycle_summary_reports_portfolio_state() {
        let mut f = fixture(Decision::new(TradeAction::Hold, 6, "nothing to do"));
        *f.kite.candles.lock().unwrap() = ramp_candles(60, 150.0);

        let activity = f.trader.run_cycle(day(10)).await.unwrap();
        assert!(activity.trades.is_empty());

        let alerts = f.alerter.messages.lock().unwrap().clone();
        assert!(alerts
            .iter()
            .any(|m| m.contains("Trading Cycle Report") && m.contains("Cash: ₹100000.00")));

        shutdown(f);
    }
}
