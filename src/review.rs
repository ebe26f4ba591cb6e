//! Exit-rule evaluation for open positions.
//!
//! Rules run in strict priority order each cycle:
//! 1. minimum-holding-period gate (blocks every sell path),
//! 2. hard stop-loss / take-profit breach,
//! 3. ATR trailing stop from the peak price (peak updated first),
//! 4. deep-review signals (time stop, stagnation, technical reversal) when
//!    a deep review is due,
//! then the caller may consult the decision source.
//!
//! Rule-based exits fire unconditionally once their numeric condition is
//! met; only decision-source signals are confidence-gated.

use chrono::NaiveDate;
use tracing::{info, warn};

use crate::config::ReviewCfg;
use crate::indicators::IndicatorSet;
use crate::portfolio::Position;

#[derive(Debug, Clone, PartialEq)]
pub enum HeldOutcome {
    /// The minimum-holding-period gate blocked all sell evaluation.
    HoldGated { reason: String },
    /// A rule fired; sell unconditionally with this reason.
    Exit { reason: String },
    /// No rule fired; the decision source may be consulted.
    NoSignal,
}

/// Evaluate a held position against the exit rules, updating its peak
/// price in place. `deep` enables the periodic deep-review rules.
pub fn evaluate_held_position(
    symbol: &str,
    position: &mut Position,
    price: f64,
    indicators: &IndicatorSet,
    today: NaiveDate,
    cfg: &ReviewCfg,
    atr_multiplier: f64,
    deep: bool,
) -> HeldOutcome {
    // 1. Minimum holding period beats everything, stop-loss included.
    if let Some(purchase_date) = position.purchase_date {
        let holding_days = (today - purchase_date).num_days();
        if holding_days < cfg.min_holding_days {
            let reason = format!(
                "Holding for {holding_days} days (min {})",
                cfg.min_holding_days
            );
            info!(symbol, "{reason}; skipping sell analysis");
            return HeldOutcome::HoldGated { reason };
        }
    }

    // Track the peak before any trailing computation.
    if position.peak_price.is_none() {
        position.peak_price = Some(position.entry_price);
    }
    if price > position.peak_price.unwrap_or(position.entry_price) {
        info!(symbol, price, "updating peak price");
        position.peak_price = Some(price);
        position.last_peak_date = Some(today);
    }

    // 2. Hard thresholds.
    if let Some(stop_loss) = position.stop_loss {
        if price <= stop_loss {
            return HeldOutcome::Exit {
                reason: format!("Hard stop-loss triggered at {stop_loss:.2}"),
            };
        }
    }
    if let Some(take_profit) = position.take_profit {
        if price >= take_profit {
            return HeldOutcome::Exit {
                reason: format!("Take-profit target reached at {take_profit:.2}"),
            };
        }
    }

    // 3. Trailing stop from the peak.
    match indicators.atr_14 {
        Some(atr) if atr > 0.0 => {
            let peak = position.peak_price.unwrap_or(position.entry_price);
            let tsl_price = peak - atr * atr_multiplier;
            if price < tsl_price {
                return HeldOutcome::Exit {
                    reason: format!("Trailing stop-loss triggered at {tsl_price:.2}"),
                };
            }
        }
        _ => {
            warn!(symbol, "invalid ATR; skipping trailing stop check");
        }
    }

    if !deep {
        return HeldOutcome::NoSignal;
    }

    // 4a. Time stop.
    if let Some(purchase_date) = position.purchase_date {
        let holding_days = (today - purchase_date).num_days();
        if holding_days > cfg.time_stop_days {
            return HeldOutcome::Exit {
                reason: format!("Time stop after {holding_days} days"),
            };
        }
    }

    // 4b. Price stagnation: no new peak for too long.
    if let Some(last_peak) = position.last_peak_date.or(position.purchase_date) {
        let days_since_peak = (today - last_peak).num_days();
        if days_since_peak > cfg.stagnation_days {
            return HeldOutcome::Exit {
                reason: format!("Price stagnation for {days_since_peak} days"),
            };
        }
    }

    // 4c. Technical reversal: bearish MACD crossover with RSI below 50.
    if let (Some(macd_line), Some(macd_signal), Some(rsi)) = (
        indicators.macd_line,
        indicators.macd_signal,
        indicators.rsi_14,
    ) {
        if macd_line < macd_signal && rsi < 50.0 {
            return HeldOutcome::Exit {
                reason: format!("Technical reversal (MACD below signal, RSI {rsi:.1})"),
            };
        }
    }

    HeldOutcome::NoSignal
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(n: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, n).unwrap()
    }

    fn position(entry: f64, purchased: NaiveDate) -> Position {
        Position {
            quantity: 10,
            entry_price: entry,
            instrument_token: 1,
            exchange: "NSE".into(),
            product: "CNC".into(),
            purchase_date: Some(purchased),
            peak_price: Some(entry),
            last_peak_date: Some(purchased),
            stop_loss: None,
            take_profit: None,
        }
    }

    fn cfg() -> ReviewCfg {
        ReviewCfg::default()
    }

    fn atr(value: f64) -> IndicatorSet {
        IndicatorSet {
            atr_14: Some(value),
            ..Default::default()
        }
    }

    #[test]
    fn holding_gate_beats_hard_stop_breach() {
        // Purchased yesterday with min_holding_days = 3; even a breached
        // stop-loss must not sell.
        let mut pos = position(100.0, day(9));
        pos.stop_loss = Some(95.0);
        let out = evaluate_held_position(
            "INFY", &mut pos, 80.0, &atr(5.0), day(10), &cfg(), 2.0, true,
        );
        assert!(matches!(out, HeldOutcome::HoldGated { .. }));
    }

    #[test]
    fn hard_stop_fires_after_gate_passes() {
        let mut pos = position(100.0, day(1));
        pos.stop_loss = Some(95.0);
        let out = evaluate_held_position(
            "INFY", &mut pos, 94.0, &atr(5.0), day(10), &cfg(), 2.0, false,
        );
        assert_eq!(
            out,
            HeldOutcome::Exit {
                reason: "Hard stop-loss triggered at 95.00".into()
            }
        );
    }

    #[test]
    fn take_profit_fires() {
        let mut pos = position(100.0, day(1));
        pos.take_profit = Some(115.0);
        let out = evaluate_held_position(
            "INFY", &mut pos, 116.0, &atr(5.0), day(10), &cfg(), 2.0, false,
        );
        assert!(matches!(out, HeldOutcome::Exit { reason } if reason.contains("Take-profit")));
    }

    #[test]
    fn trailing_stop_scenario_from_peak() {
        // Peak 120, ATR 5, multiplier 2 -> trail at 110; price 105 sells.
        let mut pos = position(100.0, day(1));
        pos.peak_price = Some(120.0);
        let out = evaluate_held_position(
            "INFY", &mut pos, 105.0, &atr(5.0), day(10), &cfg(), 2.0, false,
        );
        assert_eq!(
            out,
            HeldOutcome::Exit {
                reason: "Trailing stop-loss triggered at 110.00".into()
            }
        );
    }

    #[test]
    fn peak_updates_before_trailing_check() {
        // Price makes a new high: the trail moves up with it and must not
        // fire on the same candle.
        let mut pos = position(100.0, day(1));
        pos.peak_price = Some(110.0);
        let out = evaluate_held_position(
            "INFY", &mut pos, 125.0, &atr(5.0), day(10), &cfg(), 2.0, false,
        );
        assert_eq!(out, HeldOutcome::NoSignal);
        assert_eq!(pos.peak_price, Some(125.0));
        assert_eq!(pos.last_peak_date, Some(day(10)));
    }

    #[test]
    fn peak_is_monotonic_across_cycles() {
        let mut pos = position(100.0, day(1));
        for (d, price) in [(5, 110.0), (6, 120.0), (7, 115.0), (8, 119.0)] {
            evaluate_held_position(
                "INFY", &mut pos, price, &atr(5.0), day(d), &cfg(), 2.0, false,
            );
        }
        assert_eq!(pos.peak_price, Some(120.0));
        assert_eq!(pos.last_peak_date, Some(day(6)));
    }

    #[test]
    fn invalid_atr_skips_trailing_but_not_hard_stop() {
        let mut pos = position(100.0, day(1));
        pos.stop_loss = Some(95.0);
        pos.peak_price = Some(120.0);
        // Without ATR the trail cannot be computed; 96 is above the hard
        // stop, so nothing fires.
        let out = evaluate_held_position(
            "INFY",
            &mut pos,
            96.0,
            &IndicatorSet::default(),
            day(10),
            &cfg(),
            2.0,
            false,
        );
        assert_eq!(out, HeldOutcome::NoSignal);
    }

    #[test]
    fn time_stop_fires_on_deep_review_only() {
        let mut pos = position(100.0, day(1));
        let shallow = evaluate_held_position(
            "INFY", &mut pos, 101.0, &atr(1.0), day(25), &cfg(), 2.0, false,
        );
        assert_eq!(shallow, HeldOutcome::NoSignal);
        let deep = evaluate_held_position(
            "INFY", &mut pos, 101.0, &atr(1.0), day(25), &cfg(), 2.0, true,
        );
        assert!(matches!(deep, HeldOutcome::Exit { reason } if reason.contains("Time stop")));
    }

    #[test]
    fn stagnation_fires_without_new_peak() {
        let mut pos = position(100.0, day(1));
        pos.peak_price = Some(104.0);
        pos.last_peak_date = Some(day(2));
        // Wide enough trail (104 - 2*2 = 100) that the TSL stays quiet.
        let out = evaluate_held_position(
            "INFY", &mut pos, 101.0, &atr(2.0), day(15), &cfg(), 2.0, true,
        );
        assert!(matches!(out, HeldOutcome::Exit { reason } if reason.contains("stagnation")));
    }

    #[test]
    fn technical_reversal_fires_on_bearish_cross() {
        let mut pos = position(100.0, day(1));
        pos.last_peak_date = Some(day(9));
        let ind = IndicatorSet {
            atr_14: Some(1.0),
            macd_line: Some(-0.5),
            macd_signal: Some(0.2),
            rsi_14: Some(42.0),
            ..Default::default()
        };
        let out =
            evaluate_held_position("INFY", &mut pos, 101.0, &ind, day(10), &cfg(), 2.0, true);
        assert!(matches!(out, HeldOutcome::Exit { reason } if reason.contains("reversal")));
    }
}
