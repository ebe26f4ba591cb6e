//! Retry and circuit-breaker protection around broker calls.
//!
//! One breaker instance is shared across every broker operation: a failing
//! broker throttles all trading activity uniformly, not per-symbol. The
//! breaker check runs once per logical call, before the retry loop; a
//! fast-fail while open is terminal for that call and never consumes retry
//! attempts.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use tracing::{info, warn};

use crate::broker::{
    BrokerError, BrokerGateway, BrokerHolding, Instrument, Margins, OrderParams, OrderUpdate,
    Profile, Quote,
};
use crate::errors::TradingError;
use crate::types::Candle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "CLOSED"),
            BreakerState::Open => write!(f, "OPEN"),
            BreakerState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    last_failure: Option<Instant>,
}

/// Consecutive-failure circuit breaker. CLOSED -> OPEN at the threshold;
/// OPEN -> HALF_OPEN lazily once the recovery timeout has elapsed since the
/// last failure; HALF_OPEN -> CLOSED on a trial success.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                last_failure: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Whether a call may proceed. An OPEN breaker past its recovery
    /// timeout moves to HALF_OPEN and lets one trial call through.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Open => {
                let recovered = inner
                    .last_failure
                    .is_some_and(|t| t.elapsed() >= self.recovery_timeout);
                if recovered {
                    inner.state = BreakerState::HalfOpen;
                    info!("circuit breaker HALF_OPEN; allowing a trial call");
                    true
                } else {
                    false
                }
            }
            BreakerState::Closed | BreakerState::HalfOpen => true,
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.failure_count = 0;
        inner.last_failure = None;
        if inner.state != BreakerState::Closed {
            inner.state = BreakerState::Closed;
            info!("circuit breaker CLOSED; broker has recovered");
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());
        if inner.failure_count >= self.failure_threshold && inner.state != BreakerState::Open {
            inner.state = BreakerState::Open;
            warn!(
                failures = inner.failure_count,
                timeout_sec = self.recovery_timeout.as_secs(),
                "circuit breaker OPEN; rejecting broker calls"
            );
        } else if inner.state == BreakerState::HalfOpen {
            // Trial call failed: back to OPEN with a fresh timeout window.
            inner.state = BreakerState::Open;
            warn!("circuit breaker trial call failed; re-opening");
        }
    }
}

/// Retry an async operation with a fixed inter-attempt delay. Exhaustion
/// re-raises the last error.
pub async fn retry_api_call<T, F, Fut>(
    op: &str,
    retries: u32,
    delay: Duration,
    mut f: F,
) -> Result<T, BrokerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BrokerError>>,
{
    let attempts = retries.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                warn!(
                    op,
                    attempt,
                    retries = attempts,
                    error = %e,
                    "API call failed"
                );
                last_err = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    Err(last_err.expect("at least one attempt ran"))
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay: Duration,
}

/// Broker facade every trading component talks to: gateway serialization
/// underneath, breaker + retry on top.
#[derive(Clone)]
pub struct ResilientBroker {
    gateway: BrokerGateway,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
}

impl ResilientBroker {
    pub fn new(gateway: BrokerGateway, breaker: Arc<CircuitBreaker>, retry: RetryPolicy) -> Self {
        Self {
            gateway,
            breaker,
            retry,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Stop the underlying gateway worker (cooperative shutdown).
    pub fn stop_gateway(&self) {
        self.gateway.stop();
    }

    async fn guard<T, F, Fut>(&self, op: &str, f: F) -> Result<T, TradingError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        if !self.breaker.can_execute() {
            return Err(TradingError::BreakerOpen {
                operation: op.to_string(),
            });
        }
        match retry_api_call(op, self.retry.retries, self.retry.delay, f).await {
            Ok(v) => {
                self.breaker.record_success();
                Ok(v)
            }
            Err(e) => {
                self.breaker.record_failure();
                Err(classify(op, e))
            }
        }
    }

    pub async fn profile(&self) -> Result<Profile, TradingError> {
        let gw = self.gateway.clone();
        self.guard("profile", move || {
            let gw = gw.clone();
            async move { gw.profile().await }
        })
        .await
    }

    pub async fn margins(&self) -> Result<Margins, TradingError> {
        let gw = self.gateway.clone();
        self.guard("margins", move || {
            let gw = gw.clone();
            async move { gw.margins().await }
        })
        .await
    }

    pub async fn holdings(&self) -> Result<Vec<BrokerHolding>, TradingError> {
        let gw = self.gateway.clone();
        self.guard("holdings", move || {
            let gw = gw.clone();
            async move { gw.holdings().await }
        })
        .await
    }

    pub async fn instruments(&self, exchange: &str) -> Result<Vec<Instrument>, TradingError> {
        let gw = self.gateway.clone();
        let exchange = exchange.to_string();
        self.guard("instruments", move || {
            let gw = gw.clone();
            let exchange = exchange.clone();
            async move { gw.instruments(&exchange).await }
        })
        .await
    }

    pub async fn ltp(&self, instruments: Vec<String>) -> Result<HashMap<String, f64>, TradingError> {
        let gw = self.gateway.clone();
        self.guard("ltp", move || {
            let gw = gw.clone();
            let instruments = instruments.clone();
            async move { gw.ltp(instruments).await }
        })
        .await
    }

    pub async fn quote(&self, instrument: &str) -> Result<Quote, TradingError> {
        let gw = self.gateway.clone();
        let instrument = instrument.to_string();
        self.guard("quote", move || {
            let gw = gw.clone();
            let instrument = instrument.clone();
            async move { gw.quote(&instrument).await }
        })
        .await
    }

    pub async fn historical_data(
        &self,
        instrument_token: u32,
        from: NaiveDate,
        to: NaiveDate,
        interval: &str,
    ) -> Result<Vec<Candle>, TradingError> {
        let gw = self.gateway.clone();
        let interval = interval.to_string();
        self.guard("historical_data", move || {
            let gw = gw.clone();
            let interval = interval.clone();
            async move { gw.historical_data(instrument_token, from, to, &interval).await }
        })
        .await
    }

    pub async fn place_order(&self, params: OrderParams) -> Result<String, TradingError> {
        let gw = self.gateway.clone();
        self.guard("place_order", move || {
            let gw = gw.clone();
            let params = params.clone();
            async move { gw.place_order(params).await }
        })
        .await
    }

    pub async fn order_history(&self, order_id: &str) -> Result<Vec<OrderUpdate>, TradingError> {
        let gw = self.gateway.clone();
        let order_id = order_id.to_string();
        self.guard("order_history", move || {
            let gw = gw.clone();
            let order_id = order_id.clone();
            async move { gw.order_history(&order_id).await }
        })
        .await
    }
}

fn classify(op: &str, err: BrokerError) -> TradingError {
    match err {
        BrokerError::Auth(m) => TradingError::Critical(format!("broker authentication: {m}")),
        other => TradingError::Minor(format!("{op}: {other}")),
    }
}
