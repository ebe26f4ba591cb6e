//! Load and validate runtime configuration.

use serde::Deserialize;
use std::{fs, path::Path};

#[derive(Debug, Deserialize, Clone)]
pub struct BrokerCfg {
    /// "paper" (simulated fills against live data) or "live".
    #[serde(default = "d_mode")]
    pub mode: String,
    #[serde(default = "d_exchange")]
    pub exchange: String,
    #[serde(default = "d_base_url")]
    pub base_url: String,
}

impl Default for BrokerCfg {
    fn default() -> Self {
        Self {
            mode: d_mode(),
            exchange: d_exchange(),
            base_url: d_base_url(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RiskCfg {
    /// Percent of total portfolio value risked per new trade.
    #[serde(default = "d_risk_per_trade_pct")]
    pub risk_per_trade_pct: f64,
    /// Percent of total portfolio value any single new trade may consume.
    #[serde(default = "d_max_capital_per_trade_pct")]
    pub max_capital_per_trade_pct: f64,
    /// ATR multiple used for the initial and trailing stop distance.
    #[serde(default = "d_atr_multiplier")]
    pub atr_multiplier: f64,
    #[serde(default = "d_take_profit_atr_multiplier")]
    pub take_profit_atr_multiplier: f64,
    /// Minimum decision confidence (1-10) to act on a decision-source signal.
    /// Rule-based exits are never gated by this.
    #[serde(default = "d_min_confidence")]
    pub min_confidence: u8,
    /// Starting cash for a fresh paper portfolio.
    #[serde(default = "d_virtual_capital")]
    pub virtual_capital: f64,
    /// Stop-loss / take-profit percentages applied to positions adopted
    /// during reconciliation, where no ATR context exists.
    #[serde(default = "d_default_stop_loss_pct")]
    pub default_stop_loss_pct: f64,
    #[serde(default = "d_default_take_profit_pct")]
    pub default_take_profit_pct: f64,
}

impl Default for RiskCfg {
    fn default() -> Self {
        Self {
            risk_per_trade_pct: d_risk_per_trade_pct(),
            max_capital_per_trade_pct: d_max_capital_per_trade_pct(),
            atr_multiplier: d_atr_multiplier(),
            take_profit_atr_multiplier: d_take_profit_atr_multiplier(),
            min_confidence: d_min_confidence(),
            virtual_capital: d_virtual_capital(),
            default_stop_loss_pct: d_default_stop_loss_pct(),
            default_take_profit_pct: d_default_take_profit_pct(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExecCfg {
    #[serde(default = "d_order_poll_interval_sec")]
    pub order_poll_interval_sec: u64,
    #[serde(default = "d_order_timeout_sec")]
    pub order_timeout_sec: u64,
    #[serde(default = "d_retries")]
    pub retries: u32,
    #[serde(default = "d_retry_delay_sec")]
    pub retry_delay_sec: u64,
    #[serde(default = "d_breaker_failure_threshold")]
    pub breaker_failure_threshold: u32,
    #[serde(default = "d_breaker_recovery_timeout_sec")]
    pub breaker_recovery_timeout_sec: u64,
}

impl Default for ExecCfg {
    fn default() -> Self {
        Self {
            order_poll_interval_sec: d_order_poll_interval_sec(),
            order_timeout_sec: d_order_timeout_sec(),
            retries: d_retries(),
            retry_delay_sec: d_retry_delay_sec(),
            breaker_failure_threshold: d_breaker_failure_threshold(),
            breaker_recovery_timeout_sec: d_breaker_recovery_timeout_sec(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateCfg {
    #[serde(default = "d_portfolio_path")]
    pub portfolio_path: String,
    #[serde(default = "d_paper_portfolio_path")]
    pub paper_portfolio_path: String,
    #[serde(default = "d_trade_log_path")]
    pub trade_log_path: String,
}

impl Default for StateCfg {
    fn default() -> Self {
        Self {
            portfolio_path: d_portfolio_path(),
            paper_portfolio_path: d_paper_portfolio_path(),
            trade_log_path: d_trade_log_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReviewCfg {
    #[serde(default = "d_true")]
    pub enable: bool,
    /// Seconds between deep reviews (time stop, stagnation, reversal).
    #[serde(default = "d_review_interval_sec")]
    pub interval_sec: u64,
    /// No sell of any kind before this many days since purchase.
    #[serde(default = "d_min_holding_days")]
    pub min_holding_days: i64,
    #[serde(default = "d_time_stop_days")]
    pub time_stop_days: i64,
    /// No new peak for more than this many days triggers an exit.
    #[serde(default = "d_stagnation_days")]
    pub stagnation_days: i64,
    #[serde(default = "d_watchlist_expiry_days")]
    pub watchlist_expiry_days: i64,
    /// Defer new entries to the watchlist pending breakout confirmation.
    #[serde(default = "d_true")]
    pub confirm_breakout: bool,
    /// Candle window whose highest high becomes the confirmation price.
    #[serde(default = "d_breakout_window")]
    pub breakout_window: usize,
}

impl Default for ReviewCfg {
    fn default() -> Self {
        Self {
            enable: true,
            interval_sec: d_review_interval_sec(),
            min_holding_days: d_min_holding_days(),
            time_stop_days: d_time_stop_days(),
            stagnation_days: d_stagnation_days(),
            watchlist_expiry_days: d_watchlist_expiry_days(),
            confirm_breakout: true,
            breakout_window: d_breakout_window(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScreenerCfg {
    #[serde(default = "d_universe")]
    pub universe: Vec<String>,
    #[serde(default = "d_top_n")]
    pub top_n: usize,
    #[serde(default = "d_min_price")]
    pub min_price: f64,
    #[serde(default = "d_min_avg_volume")]
    pub min_avg_volume: f64,
}

impl Default for ScreenerCfg {
    fn default() -> Self {
        Self {
            universe: d_universe(),
            top_n: d_top_n(),
            min_price: d_min_price(),
            min_avg_volume: d_min_avg_volume(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentCfg {
    #[serde(default = "d_check_interval_sec")]
    pub check_interval_sec: u64,
    /// Consecutive failed cycles before the maintenance pause.
    #[serde(default = "d_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    #[serde(default = "d_error_backoff_base_sec")]
    pub error_backoff_base_sec: u64,
    #[serde(default = "d_error_backoff_cap_sec")]
    pub error_backoff_cap_sec: u64,
    #[serde(default = "d_maintenance_pause_sec")]
    pub maintenance_pause_sec: u64,
}

impl Default for AgentCfg {
    fn default() -> Self {
        Self {
            check_interval_sec: d_check_interval_sec(),
            max_consecutive_errors: d_max_consecutive_errors(),
            error_backoff_base_sec: d_error_backoff_base_sec(),
            error_backoff_cap_sec: d_error_backoff_cap_sec(),
            maintenance_pause_sec: d_maintenance_pause_sec(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub broker: BrokerCfg,
    #[serde(default)]
    pub risk: RiskCfg,
    #[serde(default)]
    pub exec: ExecCfg,
    #[serde(default)]
    pub state: StateCfg,
    #[serde(default)]
    pub review: ReviewCfg,
    #[serde(default)]
    pub screener: ScreenerCfg,
    #[serde(default)]
    pub agent: AgentCfg,
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let s = fs::read_to_string(path)?;
        let cfg: Self = serde_yaml::from_str(&s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn is_paper(&self) -> bool {
        !self.broker.mode.eq_ignore_ascii_case("live")
    }

    pub fn portfolio_path(&self) -> &str {
        if self.is_paper() {
            &self.state.paper_portfolio_path
        } else {
            &self.state.portfolio_path
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !["paper", "live"].contains(&self.broker.mode.to_ascii_lowercase().as_str()) {
            anyhow::bail!("broker.mode must be \"paper\" or \"live\"");
        }
        if !(1..=10).contains(&self.risk.min_confidence) {
            anyhow::bail!("risk.min_confidence must be in 1..=10");
        }
        if self.risk.risk_per_trade_pct <= 0.0 || self.risk.max_capital_per_trade_pct <= 0.0 {
            anyhow::bail!("risk percentages must be positive");
        }
        Ok(())
    }
}

fn d_mode() -> String {
    "paper".into()
}
fn d_exchange() -> String {
    "NSE".into()
}
fn d_base_url() -> String {
    "https://api.kite.trade".into()
}
fn d_risk_per_trade_pct() -> f64 {
    2.5
}
fn d_max_capital_per_trade_pct() -> f64 {
    8.0
}
fn d_atr_multiplier() -> f64 {
    2.0
}
fn d_take_profit_atr_multiplier() -> f64 {
    3.0
}
fn d_min_confidence() -> u8 {
    7
}
fn d_virtual_capital() -> f64 {
    100_000.0
}
fn d_default_stop_loss_pct() -> f64 {
    5.0
}
fn d_default_take_profit_pct() -> f64 {
    10.0
}
fn d_order_poll_interval_sec() -> u64 {
    5
}
fn d_order_timeout_sec() -> u64 {
    120
}
fn d_retries() -> u32 {
    3
}
fn d_retry_delay_sec() -> u64 {
    5
}
fn d_breaker_failure_threshold() -> u32 {
    5
}
fn d_breaker_recovery_timeout_sec() -> u64 {
    300
}
fn d_portfolio_path() -> String {
    "portfolio.json".into()
}
fn d_paper_portfolio_path() -> String {
    "paper_portfolio.json".into()
}
fn d_trade_log_path() -> String {
    "tradelog.csv".into()
}
fn d_true() -> bool {
    true
}
fn d_review_interval_sec() -> u64 {
    60 * 15
}
fn d_min_holding_days() -> i64 {
    3
}
fn d_time_stop_days() -> i64 {
    20
}
fn d_stagnation_days() -> i64 {
    10
}
fn d_watchlist_expiry_days() -> i64 {
    3
}
fn d_breakout_window() -> usize {
    20
}
fn d_universe() -> Vec<String> {
    [
        "RELIANCE",
        "TCS",
        "HDFCBANK",
        "INFY",
        "ICICIBANK",
        "HINDUNILVR",
        "ITC",
        "SBIN",
        "BHARTIARTL",
        "HCLTECH",
        "KOTAKBANK",
        "LT",
        "BAJFINANCE",
        "AXISBANK",
        "MARUTI",
        "ASIANPAINT",
        "SUNPHARMA",
        "TITAN",
        "WIPRO",
        "NESTLEIND",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn d_top_n() -> usize {
    5
}
fn d_min_price() -> f64 {
    100.0
}
fn d_min_avg_volume() -> f64 {
    100_000.0
}
fn d_check_interval_sec() -> u64 {
    60 * 5
}
fn d_max_consecutive_errors() -> u32 {
    5
}
fn d_error_backoff_base_sec() -> u64 {
    60
}
fn d_error_backoff_cap_sec() -> u64 {
    1800
}
fn d_maintenance_pause_sec() -> u64 {
    3600
}
