//! Order execution: live place-and-confirm polling, paper simulation.

use std::time::Duration;

use chrono::NaiveDate;
use tracing::{error, info, warn};

use crate::broker::OrderParams;
use crate::errors::TradingError;
use crate::portfolio::Portfolio;
use crate::resilience::ResilientBroker;
use crate::types::{OrderExecutionResult, OrderStatus, TradeAction};

/// Place a CNC market order and drive it to a terminal state.
///
/// Polls order status at `poll_interval` until COMPLETE or REJECTED /
/// CANCELLED, or until `timeout` elapses. One final status check runs at
/// timeout: a partial fill observed there yields PARTIAL, otherwise
/// TIMEOUT. Mid-poll partials are logged and polling continues.
pub async fn place_and_confirm_order(
    broker: &ResilientBroker,
    exchange: &str,
    symbol: &str,
    action: TradeAction,
    quantity: i64,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<OrderExecutionResult, TradingError> {
    let params = OrderParams {
        tradingsymbol: symbol.to_string(),
        exchange: exchange.to_string(),
        transaction_type: action.to_string(),
        quantity,
    };

    let order_id = match broker.place_order(params).await {
        Ok(id) => id,
        Err(e) if e.is_critical() => return Err(e),
        Err(e) => {
            error!(symbol, %action, error = %e, "order placement failed");
            return Ok(OrderExecutionResult {
                status: OrderStatus::Failed,
                order_id: None,
                filled_quantity: 0,
                average_price: 0.0,
            });
        }
    };
    info!(%order_id, symbol, %action, quantity, "placed order; awaiting confirmation");

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let timed_out = tokio::time::Instant::now() >= deadline;
        let update = match broker.order_history(&order_id).await {
            Ok(mut rows) => rows.pop(),
            Err(e) if e.is_critical() => return Err(e),
            Err(e) => {
                warn!(%order_id, error = %e, "order status check failed");
                None
            }
        };

        if let Some(update) = update {
            match update.status.to_ascii_uppercase().as_str() {
                "COMPLETE" => {
                    info!(%order_id, filled = update.filled_quantity, avg = update.average_price, "order complete");
                    return Ok(OrderExecutionResult {
                        status: OrderStatus::Complete,
                        order_id: Some(order_id),
                        filled_quantity: update.filled_quantity,
                        average_price: update.average_price,
                    });
                }
                "REJECTED" | "CANCELLED" | "CANCELED" => {
                    let reason = update
                        .status_message
                        .unwrap_or_else(|| "no reason reported".into());
                    error!(%order_id, %reason, "order rejected by broker");
                    return Ok(OrderExecutionResult {
                        status: OrderStatus::Rejected,
                        order_id: Some(order_id),
                        filled_quantity: update.filled_quantity,
                        average_price: update.average_price,
                    });
                }
                status => {
                    if update.filled_quantity > 0 {
                        if timed_out {
                            warn!(
                                %order_id,
                                filled = update.filled_quantity,
                                "confirmation window closed on a partial fill"
                            );
                            return Ok(OrderExecutionResult {
                                status: OrderStatus::Partial,
                                order_id: Some(order_id),
                                filled_quantity: update.filled_quantity,
                                average_price: update.average_price,
                            });
                        }
                        info!(
                            %order_id,
                            status,
                            filled = update.filled_quantity,
                            "partial fill; still polling"
                        );
                    }
                }
            }
        }

        if timed_out {
            warn!(%order_id, "order confirmation timed out with no fill");
            return Ok(OrderExecutionResult {
                status: OrderStatus::Timeout,
                order_id: Some(order_id),
                filled_quantity: 0,
                average_price: 0.0,
            });
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Simulate a market fill at `price` against portfolio state that the
/// caller already holds inside a transaction. Paper fills are always
/// complete; an unaffordable BUY or oversized SELL is rejected without
/// mutating anything.
pub fn place_paper_order(
    portfolio: &mut Portfolio,
    symbol: &str,
    action: TradeAction,
    quantity: i64,
    price: f64,
    instrument_token: u32,
    today: NaiveDate,
) -> OrderExecutionResult {
    let rejected = OrderExecutionResult {
        status: OrderStatus::Rejected,
        order_id: None,
        filled_quantity: 0,
        average_price: 0.0,
    };
    if quantity <= 0 || price <= 0.0 {
        return rejected;
    }

    match action {
        TradeAction::Buy => {
            let cost = price * quantity as f64;
            if cost > portfolio.cash {
                warn!(symbol, cost, cash = portfolio.cash, "paper BUY rejected: insufficient cash");
                return rejected;
            }
            portfolio.cash -= cost;
            portfolio.apply_buy_fill(symbol, quantity, price, instrument_token, today);
        }
        TradeAction::Sell => {
            let held = portfolio.holdings.get(symbol).map_or(0, |p| p.quantity);
            if held < quantity {
                warn!(symbol, held, quantity, "paper SELL rejected: insufficient quantity");
                return rejected;
            }
            portfolio.apply_sell_fill(symbol, quantity, price);
        }
        TradeAction::Hold => return rejected,
    }

    info!(symbol, %action, quantity, price, "(paper) simulated fill");
    OrderExecutionResult {
        status: OrderStatus::Complete,
        order_id: None,
        filled_quantity: quantity,
        average_price: price,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::OrderUpdate;
    use crate::resilience::testkit::scripted_broker;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 3).unwrap()
    }

    fn open(filled: i64, avg: f64) -> OrderUpdate {
        OrderUpdate {
            status: "OPEN".into(),
            filled_quantity: filled,
            average_price: avg,
            status_message: None,
        }
    }

    fn complete(filled: i64, avg: f64) -> OrderUpdate {
        OrderUpdate {
            status: "COMPLETE".into(),
            filled_quantity: filled,
            average_price: avg,
            status_message: None,
        }
    }

    // ---------- Paper path ----------

    #[test]
    fn paper_buy_debits_cash_and_creates_position() {
        let mut p = Portfolio::new(100_000.0);
        let result = place_paper_order(&mut p, "INFY", TradeAction::Buy, 10, 100.0, 1, day());
        assert_eq!(result.status, OrderStatus::Complete);
        assert_eq!(result.filled_quantity, 10);
        assert!((p.cash - 99_000.0).abs() < 1e-9);
        let pos = &p.holdings["INFY"];
        assert_eq!(pos.quantity, 10);
        assert_eq!(pos.entry_price, 100.0);
    }

    #[test]
    fn paper_sell_credits_cash_and_removes_at_zero() {
        let mut p = Portfolio::new(100_000.0);
        place_paper_order(&mut p, "INFY", TradeAction::Buy, 10, 100.0, 1, day());
        let result = place_paper_order(&mut p, "INFY", TradeAction::Sell, 10, 110.0, 1, day());
        assert_eq!(result.status, OrderStatus::Complete);
        assert!(!p.holdings.contains_key("INFY"));
        assert!((p.cash - 100_100.0).abs() < 1e-9);
    }

    #[test]
    fn paper_buy_insufficient_cash_rejects_without_mutation() {
        let mut p = Portfolio::new(500.0);
        let result = place_paper_order(&mut p, "INFY", TradeAction::Buy, 10, 100.0, 1, day());
        assert_eq!(result.status, OrderStatus::Rejected);
        assert_eq!(p.cash, 500.0);
        assert!(p.holdings.is_empty());
    }

    #[test]
    fn paper_oversell_rejects_without_mutation() {
        let mut p = Portfolio::new(10_000.0);
        place_paper_order(&mut p, "INFY", TradeAction::Buy, 5, 100.0, 1, day());
        let cash_before = p.cash;
        let result = place_paper_order(&mut p, "INFY", TradeAction::Sell, 6, 110.0, 1, day());
        assert_eq!(result.status, OrderStatus::Rejected);
        assert_eq!(p.cash, cash_before);
        assert_eq!(p.holdings["INFY"].quantity, 5);
    }

    // ---------- Live path ----------

    #[tokio::test]
    async fn live_order_completes_after_open_polls() {
        let (kite, broker, handle) = scripted_broker();
        *kite.order_script.lock().unwrap() =
            vec![open(0, 0.0), open(4, 101.0), complete(10, 101.5)];

        let result = place_and_confirm_order(
            &broker,
            "NSE",
            "INFY",
            TradeAction::Buy,
            10,
            Duration::from_millis(5),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(result.status, OrderStatus::Complete);
        assert_eq!(result.filled_quantity, 10);
        assert!((result.average_price - 101.5).abs() < 1e-9);
        assert!(result.order_id.is_some());

        broker.stop_gateway();
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn live_order_rejection_surfaces_reason() {
        let (kite, broker, handle) = scripted_broker();
        *kite.order_script.lock().unwrap() = vec![OrderUpdate {
            status: "REJECTED".into(),
            filled_quantity: 0,
            average_price: 0.0,
            status_message: Some("insufficient funds".into()),
        }];

        let result = place_and_confirm_order(
            &broker,
            "NSE",
            "INFY",
            TradeAction::Buy,
            10,
            Duration::from_millis(5),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(result.status, OrderStatus::Rejected);

        broker.stop_gateway();
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn live_order_timeout_with_zero_fill_is_timeout() {
        let (kite, broker, handle) = scripted_broker();
        // Stays OPEN and unfilled for the whole window.
        *kite.order_script.lock().unwrap() = vec![open(0, 0.0)];

        let result = place_and_confirm_order(
            &broker,
            "NSE",
            "INFY",
            TradeAction::Buy,
            10,
            Duration::from_millis(5),
            Duration::from_millis(30),
        )
        .await
        .unwrap();

        assert_eq!(result.status, OrderStatus::Timeout);
        assert_eq!(result.filled_quantity, 0);

        broker.stop_gateway();
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn live_order_partial_at_timeout_reports_partial() {
        let (kite, broker, handle) = scripted_broker();
        *kite.order_script.lock().unwrap() = vec![open(0, 0.0), open(6, 99.5)];

        let result = place_and_confirm_order(
            &broker,
            "NSE",
            "INFY",
            TradeAction::Sell,
            10,
            Duration::from_millis(5),
            Duration::from_millis(40),
        )
        .await
        .unwrap();

        assert_eq!(result.status, OrderStatus::Partial);
        assert_eq!(result.filled_quantity, 6);
        assert!((result.average_price - 99.5).abs() < 1e-9);

        broker.stop_gateway();
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn placement_failure_returns_failed_without_polling() {
        let (kite, broker, handle) = scripted_broker();
        kite.fail_all.store(true, std::sync::atomic::Ordering::SeqCst);

        let result = place_and_confirm_order(
            &broker,
            "NSE",
            "INFY",
            TradeAction::Buy,
            10,
            Duration::from_millis(5),
            Duration::from_millis(30),
        )
        .await
        .unwrap();
        assert_eq!(result.status, OrderStatus::Failed);
        assert!(result.order_id.is_none());

        broker.stop_gateway();
        handle.join().unwrap();
    }
}
