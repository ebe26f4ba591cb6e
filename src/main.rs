//! Entry point. Wires Kite gateway -> Resilience -> Portfolio -> Trader.

mod alert;
mod broker;
mod config;
mod decision;
mod errors;
mod execution;
mod indicators;
mod kite_client;
mod portfolio;
mod resilience;
mod review;
mod risk;
mod screener;
mod trade_log;
mod trader;
mod types;

use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, FixedOffset, Timelike, Utc, Weekday};
use dotenvy::dotenv;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use crate::alert::{Alerter, LogAlerter};
use crate::broker::BrokerGateway;
use crate::decision::RuleBasedSource;
use crate::portfolio::PortfolioStore;
use crate::resilience::{CircuitBreaker, ResilientBroker, RetryPolicy};
use crate::trade_log::TradeLog;
use crate::trader::Trader;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    // Load config & credentials
    let cfg = config::AppConfig::load("config.yaml")?;
    let api_key = std::env::var("KITE_API_KEY")?;
    let access_token = std::env::var("KITE_ACCESS_TOKEN")?;

    // Blocking Kite client, owned exclusively by the gateway worker
    let client = kite_client::KiteConnect::new(&api_key, &access_token, &cfg.broker.base_url)?;
    let (gateway, worker) = BrokerGateway::spawn(Box::new(client));
    let broker = ResilientBroker::new(
        gateway,
        Arc::new(CircuitBreaker::new(
            cfg.exec.breaker_failure_threshold,
            Duration::from_secs(cfg.exec.breaker_recovery_timeout_sec),
        )),
        RetryPolicy {
            retries: cfg.exec.retries,
            delay: Duration::from_secs(cfg.exec.retry_delay_sec),
        },
    );

    let alerter: Arc<dyn Alerter> = Arc::new(LogAlerter);

    // Authentication check before anything else touches the account
    let profile = match broker.profile().await {
        Ok(p) => p,
        Err(e) => {
            let msg = format!("CRITICAL: broker authentication failed: {e}");
            error!("{msg}");
            alerter.send(&msg).await;
            anyhow::bail!(msg);
        }
    };
    info!(
        user_id = %profile.user_id,
        user = %profile.user_name,
        mode = %cfg.broker.mode,
        "Kite session verified"
    );

    // Portfolio: paper mode starts with virtual capital, live starts empty
    // and reconciles against the broker immediately.
    let starting_cash = if cfg.is_paper() {
        cfg.risk.virtual_capital
    } else {
        0.0
    };
    let store = Arc::new(PortfolioStore::load(cfg.portfolio_path(), starting_cash)?);

    let mut startup_message = format!(
        "AI trading agent ONLINE ({})",
        cfg.broker.mode.to_uppercase()
    );
    if !cfg.is_paper() {
        let report = store.reconcile(&broker, &cfg.risk).await?;
        startup_message.push('\n');
        startup_message.push_str(&report);
    }
    alerter.send(&startup_message).await;

    let trade_log = TradeLog::new(&cfg.state.trade_log_path)?;
    let mut trader = Trader::new(
        broker.clone(),
        Arc::clone(&store),
        Arc::new(RuleBasedSource),
        Arc::clone(&alerter),
        trade_log,
        cfg.clone(),
    );

    info!(
        interval_sec = cfg.agent.check_interval_sec,
        "trader started; entering main loop"
    );
    let exit = trading_loop(&mut trader, &cfg, alerter.as_ref()).await;

    broker.stop_gateway();
    if worker.join().is_err() {
        warn!("broker gateway worker panicked during shutdown");
    }
    info!("agent shutdown complete");
    exit
}

/// Main cooperative loop: one cycle per interval while the market is open,
/// with exponential cooldown on clustered failures and a maintenance pause
/// once they persist. Ctrl-C breaks at any sleep point.
async fn trading_loop(
    trader: &mut Trader,
    cfg: &config::AppConfig,
    alerter: &dyn Alerter,
) -> anyhow::Result<()> {
    let mut consecutive_errors: u32 = 0;

    loop {
        if !is_market_open() {
            info!("market is closed; sleeping for 1 minute");
            if sleep_or_shutdown(Duration::from_secs(60)).await {
                return Ok(());
            }
            continue;
        }

        info!("--- new trading cycle ---");
        let today = ist_now().date_naive();
        match trader.run_cycle(today).await {
            Ok(_) => {
                consecutive_errors = 0;
            }
            Err(e) if e.is_critical() => {
                let msg = format!("CRITICAL: {e}. Agent halting.");
                error!("{msg}");
                alerter.send(&msg).await;
                anyhow::bail!(msg);
            }
            Err(e) => {
                consecutive_errors += 1;
                error!(error = %e, consecutive_errors, "trading cycle failed");
                if consecutive_errors >= cfg.agent.max_consecutive_errors {
                    let pause = Duration::from_secs(cfg.agent.maintenance_pause_sec);
                    let msg = format!(
                        "{consecutive_errors} consecutive cycle failures; pausing for {}s",
                        pause.as_secs()
                    );
                    warn!("{msg}");
                    alerter.send(&msg).await;
                    if sleep_or_shutdown(pause).await {
                        return Ok(());
                    }
                    consecutive_errors = 0;
                    continue;
                }
                let backoff = error_backoff(
                    consecutive_errors,
                    cfg.agent.error_backoff_base_sec,
                    cfg.agent.error_backoff_cap_sec,
                );
                warn!(backoff_sec = backoff.as_secs(), "cooling down after error");
                if sleep_or_shutdown(backoff).await {
                    return Ok(());
                }
                continue;
            }
        }

        if sleep_or_shutdown(Duration::from_secs(cfg.agent.check_interval_sec)).await {
            return Ok(());
        }
    }
}

/// Sleep for `duration`, returning true if shutdown was requested.
async fn sleep_or_shutdown(duration: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested; stopping after current sleep point");
            true
        }
    }
}

/// Exponential per-error backoff, capped.
fn error_backoff(consecutive_errors: u32, base_sec: u64, cap_sec: u64) -> Duration {
    let exp = consecutive_errors.saturating_sub(1).min(16);
    let secs = base_sec.saturating_mul(1u64 << exp).min(cap_sec);
    Duration::from_secs(secs)
}

fn ist_now() -> chrono::DateTime<FixedOffset> {
    let ist = FixedOffset::east_opt(5 * 3600 + 1800).expect("valid IST offset");
    Utc::now().with_timezone(&ist)
}

/// NSE cash session: weekdays, 09:15-15:30 IST.
fn is_market_open() -> bool {
    let now = ist_now();
    if matches!(now.weekday(), Weekday::Sat | Weekday::Sun) {
        return false;
    }
    let minutes = now.hour() * 60 + now.minute();
    (9 * 60 + 15..=15 * 60 + 30).contains(&minutes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(error_backoff(1, 60, 1800), Duration::from_secs(60));
        assert_eq!(error_backoff(2, 60, 1800), Duration::from_secs(120));
        assert_eq!(error_backoff(3, 60, 1800), Duration::from_secs(240));
        assert_eq!(error_backoff(6, 60, 1800), Duration::from_secs(1800));
        // Large counts must not overflow the shift.
        assert_eq!(error_backoff(40, 60, 1800), Duration::from_secs(1800));
    }
}
