//! Error taxonomy for the trading agent.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TradingError {
    /// Halts the agent: authentication failure, portfolio corruption after
    /// a prior successful save, reconciliation failure.
    #[error("critical: {0}")]
    Critical(String),

    /// Transient: network blips, rate limits, single-symbol failures.
    /// Logged and skipped without aborting the cycle.
    #[error("{0}")]
    Minor(String),

    /// Malformed data that gets downgraded to a fail-safe value where one
    /// exists (empty indicators, fail-safe decision).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Fail-fast rejection while the shared circuit breaker is open.
    #[error("circuit breaker is open for {operation}; call rejected")]
    BreakerOpen { operation: String },
}

impl TradingError {
    pub fn is_critical(&self) -> bool {
        matches!(self, TradingError::Critical(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_classification() {
        assert!(TradingError::Critical("auth".into()).is_critical());
        assert!(!TradingError::Minor("blip".into()).is_critical());
        assert!(!TradingError::BreakerOpen {
            operation: "holdings".into()
        }
        .is_critical());
    }
}
