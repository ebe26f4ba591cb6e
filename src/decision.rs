//! Decision source contract, the fail-safe default and the rule-based
//! implementation.
//!
//! Fail-safe contract: a decision source NEVER raises. Any internal
//! failure, rate limit or malformed output yields `Decision::fail_safe()`:
//! HOLD at confidence 10. That confidence means "certain about failing
//! safe" — it must never pass a confidence gate, so gating goes through
//! `Decision::actionable`, which checks the `fail_safe` flag explicitly
//! instead of trusting the number.

use async_trait::async_trait;
use tracing::error;

use crate::errors::TradingError;
use crate::indicators::IndicatorSet;
use crate::types::TradeAction;

pub const FAIL_SAFE_REASONING: &str = "Fail-safe: decision source unavailable; holding.";

/// Shortest reasoning string accepted from an external decision source.
const MIN_REASONING_LEN: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub action: TradeAction,
    /// 1..=10.
    pub confidence: u8,
    pub reasoning: String,
    /// Set only on the fail-safe default; excludes the decision from
    /// confidence-gated auto-trading.
    pub fail_safe: bool,
}

impl Decision {
    pub fn new(action: TradeAction, confidence: u8, reasoning: impl Into<String>) -> Self {
        Self {
            action,
            confidence,
            reasoning: reasoning.into(),
            fail_safe: false,
        }
    }

    pub fn fail_safe() -> Self {
        Self {
            action: TradeAction::Hold,
            confidence: 10,
            reasoning: FAIL_SAFE_REASONING.into(),
            fail_safe: true,
        }
    }

    /// Validate output received from an external source.
    pub fn validated(
        action: &str,
        confidence: i64,
        reasoning: &str,
    ) -> Result<Self, TradingError> {
        let action = match action {
            "BUY" => TradeAction::Buy,
            "SELL" => TradeAction::Sell,
            "HOLD" => TradeAction::Hold,
            other => {
                return Err(TradingError::Validation(format!(
                    "decision action must be BUY/SELL/HOLD, got {other:?}"
                )))
            }
        };
        if !(1..=10).contains(&confidence) {
            return Err(TradingError::Validation(format!(
                "decision confidence must be 1..=10, got {confidence}"
            )));
        }
        if reasoning.len() < MIN_REASONING_LEN {
            return Err(TradingError::Validation(
                "decision reasoning too short".into(),
            ));
        }
        Ok(Self::new(action, confidence as u8, reasoning))
    }

    /// Whether a decision-source signal may trigger a trade. Rule-based
    /// exits never go through this gate.
    pub fn actionable(&self, min_confidence: u8) -> bool {
        !self.fail_safe && self.confidence >= min_confidence
    }
}

/// Everything a decision source gets to look at for one symbol.
#[derive(Debug, Clone)]
pub struct DecisionContext {
    pub symbol: String,
    pub price: f64,
    pub is_existing: bool,
    pub indicators: IndicatorSet,
}

#[async_trait]
pub trait DecisionSource: Send + Sync {
    /// Must return the fail-safe decision rather than erroring.
    async fn get_decision(&self, ctx: &DecisionContext) -> Decision;
}

/// Default decision source: the strategy rules evaluated locally.
///
/// New opportunities: BUY on a pullback in an uptrend (price above 50-day
/// SMA, RSI below 55). Existing holdings: SELL on confirmed weakness (RSI
/// above 70 with price below the 5-day EMA); never add to an existing
/// position.
pub struct RuleBasedSource;

#[async_trait]
impl DecisionSource for RuleBasedSource {
    async fn get_decision(&self, ctx: &DecisionContext) -> Decision {
        let ind = &ctx.indicators;
        let (Some(rsi), Some(sma_50), Some(ema_5)) = (ind.rsi_14, ind.sma_50, ind.ema_5) else {
            error!(symbol = %ctx.symbol, "indicators unavailable; returning fail-safe decision");
            return Decision::fail_safe();
        };

        if ctx.is_existing {
            if rsi > 70.0 && ctx.price < ema_5 {
                Decision::new(
                    TradeAction::Sell,
                    8,
                    format!("Overbought reversal: RSI {rsi:.1} with price below 5-day EMA {ema_5:.2}"),
                )
            } else {
                Decision::new(TradeAction::Hold, 6, "No confirmed weakness; uptrend intact")
            }
        } else if ctx.price > sma_50 && rsi < 55.0 {
            Decision::new(
                TradeAction::Buy,
                8,
                format!("Pullback in uptrend: price above 50-day SMA {sma_50:.2}, RSI {rsi:.1}"),
            )
        } else {
            Decision::new(TradeAction::Hold, 6, "No entry setup present")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn indicators(rsi: f64, sma_50: f64, ema_5: f64) -> IndicatorSet {
        IndicatorSet {
            rsi_14: Some(rsi),
            sma_50: Some(sma_50),
            ema_5: Some(ema_5),
            ..Default::default()
        }
    }

    fn ctx(price: f64, is_existing: bool, ind: IndicatorSet) -> DecisionContext {
        DecisionContext {
            symbol: "INFY".into(),
            price,
            is_existing,
            indicators: ind,
        }
    }

    #[test]
    fn fail_safe_is_never_actionable_despite_max_confidence() {
        let d = Decision::fail_safe();
        assert_eq!(d.action, TradeAction::Hold);
        assert_eq!(d.confidence, 10);
        // The numeric value would pass any gate; the flag must not.
        assert!(!d.actionable(7));
        assert!(!d.actionable(1));
    }

    #[test]
    fn confidence_gate_applies_to_real_decisions() {
        let low = Decision::new(TradeAction::Buy, 5, "weak setup, still early");
        let high = Decision::new(TradeAction::Buy, 8, "strong setup confirmed");
        assert!(!low.actionable(7));
        assert!(high.actionable(7));
    }

    #[test]
    fn validated_rejects_malformed_output() {
        assert!(Decision::validated("PURCHASE", 8, "some long reasoning").is_err());
        assert!(Decision::validated("BUY", 0, "some long reasoning").is_err());
        assert!(Decision::validated("BUY", 11, "some long reasoning").is_err());
        assert!(Decision::validated("BUY", 8, "short").is_err());
        let ok = Decision::validated("SELL", 9, "bearish crossover confirmed").unwrap();
        assert_eq!(ok.action, TradeAction::Sell);
        assert!(!ok.fail_safe);
    }

    #[tokio::test]
    async fn rule_source_buys_pullback_in_uptrend() {
        let d = RuleBasedSource
            .get_decision(&ctx(105.0, false, indicators(48.0, 100.0, 104.0)))
            .await;
        assert_eq!(d.action, TradeAction::Buy);
        assert!(d.actionable(7));
    }

    #[tokio::test]
    async fn rule_source_holds_when_extended() {
        let d = RuleBasedSource
            .get_decision(&ctx(105.0, false, indicators(62.0, 100.0, 104.0)))
            .await;
        assert_eq!(d.action, TradeAction::Hold);
    }

    #[tokio::test]
    async fn rule_source_sells_confirmed_weakness() {
        let d = RuleBasedSource
            .get_decision(&ctx(98.0, true, indicators(74.0, 90.0, 100.0)))
            .await;
        assert_eq!(d.action, TradeAction::Sell);
    }

    #[tokio::test]
    async fn missing_indicators_yield_fail_safe() {
        let d = RuleBasedSource
            .get_decision(&ctx(100.0, false, IndicatorSet::default()))
            .await;
        assert!(d.fail_safe);
        assert_eq!(d.action, TradeAction::Hold);
    }
}
