//! Core domain types for actions, candles and order results.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TradeAction {
    Buy,
    Sell,
    Hold,
}

impl std::fmt::Display for TradeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeAction::Buy => write!(f, "BUY"),
            TradeAction::Sell => write!(f, "SELL"),
            TradeAction::Hold => write!(f, "HOLD"),
        }
    }
}

/// One daily candle as delivered by the historical-data endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

/// Terminal (or timed-out) outcome of one order placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    /// Full fill.
    Complete,
    /// Some quantity filled when the confirmation window closed.
    Partial,
    /// Broker rejected or cancelled the order.
    Rejected,
    /// Placement itself failed.
    Failed,
    /// No terminal status and no fill within the confirmation window.
    Timeout,
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderStatus::Complete => "COMPLETE",
            OrderStatus::Partial => "PARTIAL",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Failed => "FAILED",
            OrderStatus::Timeout => "TIMEOUT",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub struct OrderExecutionResult {
    pub status: OrderStatus,
    pub order_id: Option<String>,
    pub filled_quantity: i64,
    pub average_price: f64,
}

impl OrderExecutionResult {
    pub fn filled(&self) -> bool {
        matches!(self.status, OrderStatus::Complete | OrderStatus::Partial)
    }
}

pub fn sanitize_symbol(sym: &str) -> String {
    sym.trim().to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_display_matches_wire_format() {
        assert_eq!(TradeAction::Buy.to_string(), "BUY");
        assert_eq!(TradeAction::Sell.to_string(), "SELL");
        assert_eq!(TradeAction::Hold.to_string(), "HOLD");
    }

    #[test]
    fn filled_only_for_terminal_fills() {
        let mk = |status| OrderExecutionResult {
            status,
            order_id: None,
            filled_quantity: 0,
            average_price: 0.0,
        };
        assert!(mk(OrderStatus::Complete).filled());
        assert!(mk(OrderStatus::Partial).filled());
        assert!(!mk(OrderStatus::Rejected).filled());
        assert!(!mk(OrderStatus::Timeout).filled());
    }

    #[test]
    fn sanitize_trims_and_uppercases() {
        assert_eq!(sanitize_symbol("  infy "), "INFY");
    }
}
