//! Risk-based position sizing before order placement.

use anyhow::Result;

use crate::config::RiskCfg;

/// A sized entry with its derived protective thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizedOrder {
    pub quantity: i64,
    pub stop_loss: f64,
    pub take_profit: f64,
}

pub struct RiskEngine {
    cfg: RiskCfg,
}

impl RiskEngine {
    pub fn new(cfg: RiskCfg) -> Self {
        Self { cfg }
    }

    /// Size a new BUY: `min(risk-based quantity, capital-cap quantity)`,
    /// where the risk-based quantity puts `risk_per_trade_pct` of total
    /// portfolio value at risk down to the ATR stop. Errors describe why
    /// the order must not be placed.
    pub fn position_size(
        &self,
        total_value: f64,
        available_cash: f64,
        price: f64,
        atr: Option<f64>,
    ) -> Result<SizedOrder> {
        let atr = match atr {
            Some(a) if a > 0.0 => a,
            _ => anyhow::bail!("Invalid ATR for risk calculation"),
        };
        if price <= 0.0 {
            anyhow::bail!("Invalid price for risk calculation");
        }

        let stop_loss = price - atr * self.cfg.atr_multiplier;
        let risk_per_share = price - stop_loss;
        if risk_per_share <= 0.0 {
            anyhow::bail!("Risk per share is zero or negative");
        }

        let risk_amount = total_value * (self.cfg.risk_per_trade_pct / 100.0);
        let quantity_by_risk = (risk_amount / risk_per_share) as i64;

        let capital_per_trade = total_value * (self.cfg.max_capital_per_trade_pct / 100.0);
        let quantity_by_capital = (capital_per_trade / price) as i64;

        let quantity = quantity_by_risk.min(quantity_by_capital);
        if quantity <= 0 {
            anyhow::bail!("Calculated quantity is 0");
        }

        let trade_value = quantity as f64 * price;
        if trade_value > available_cash {
            anyhow::bail!(
                "Insufficient cash (needs ₹{:.2}, have ₹{:.2})",
                trade_value,
                available_cash
            );
        }

        Ok(SizedOrder {
            quantity,
            stop_loss,
            take_profit: price + atr * self.cfg.take_profit_atr_multiplier,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> RiskEngine {
        RiskEngine::new(RiskCfg::default())
    }

    #[test]
    fn capital_cap_binds_before_risk_quantity() {
        // risk: 2.5% of 100k = 2500 at 10/share risk -> 250 shares.
        // capital: 8% of 100k = 8000 at 100/share -> 80 shares.
        let sized = engine()
            .position_size(100_000.0, 100_000.0, 100.0, Some(5.0))
            .unwrap();
        assert_eq!(sized.quantity, 80);
        assert!((sized.stop_loss - 90.0).abs() < 1e-9);
        assert!((sized.take_profit - 115.0).abs() < 1e-9);
    }

    #[test]
    fn risk_quantity_binds_for_wide_stops() {
        // ATR 20 -> 40/share risk -> 2500/40 = 62 shares, below the
        // capital cap of 80.
        let sized = engine()
            .position_size(100_000.0, 100_000.0, 100.0, Some(20.0))
            .unwrap();
        assert_eq!(sized.quantity, 62);
    }

    #[test]
    fn degenerate_atr_rejected() {
        assert!(engine()
            .position_size(100_000.0, 100_000.0, 100.0, None)
            .is_err());
        assert!(engine()
            .position_size(100_000.0, 100_000.0, 100.0, Some(0.0))
            .is_err());
    }

    #[test]
    fn zero_quantity_rejected() {
        // Tiny portfolio cannot afford a single expensive share.
        let err = engine()
            .position_size(1_000.0, 1_000.0, 5_000.0, Some(50.0))
            .unwrap_err();
        assert!(err.to_string().contains("quantity is 0"));
    }

    #[test]
    fn insufficient_cash_rejected() {
        // Sizing says 80 shares (8k) but only 5k cash is free.
        let err = engine()
            .position_size(100_000.0, 5_000.0, 100.0, Some(5.0))
            .unwrap_err();
        assert!(err.to_string().contains("Insufficient cash"));
    }
}
