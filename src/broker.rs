//! Broker interface and the async gateway over the blocking Kite client.
//!
//! The underlying client is synchronous and not safe for concurrent use, so
//! a single dedicated worker thread owns it exclusively and drains a request
//! channel one operation at a time. Callers get normal async call/return
//! semantics through a oneshot reply; operation errors are passed through
//! verbatim and never kill the worker.

use std::collections::HashMap;
use std::thread;

use chrono::NaiveDate;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use crate::types::Candle;

#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("broker rejected request: {0}")]
    Api(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("malformed broker payload: {0}")]
    Parse(String),
    /// The gateway worker is stopped; queued requests never execute.
    #[error("broker gateway worker is stopped")]
    WorkerStopped,
}

// ---------- Wire types ----------

#[derive(Debug, Clone, Deserialize)]
pub struct Profile {
    pub user_id: String,
    pub user_name: String,
}

/// Equity margin snapshot, flattened to the one figure the agent needs.
#[derive(Debug, Clone)]
pub struct Margins {
    pub available_cash: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerHolding {
    pub tradingsymbol: String,
    pub quantity: i64,
    pub average_price: f64,
    pub instrument_token: u32,
    pub exchange: String,
    pub product: String,
}

#[derive(Debug, Clone)]
pub struct Instrument {
    pub instrument_token: u32,
    pub tradingsymbol: String,
    pub instrument_type: String,
    pub exchange: String,
}

#[derive(Debug, Clone)]
pub struct Quote {
    pub last_price: f64,
}

/// Market order parameters. Product stays CNC (delivery) so a slip can
/// never open an intraday-margin position.
#[derive(Debug, Clone)]
pub struct OrderParams {
    pub tradingsymbol: String,
    pub exchange: String,
    pub transaction_type: String,
    pub quantity: i64,
}

impl OrderParams {
    pub const PRODUCT: &'static str = "CNC";
    pub const ORDER_TYPE: &'static str = "MARKET";
    pub const VALIDITY: &'static str = "DAY";
}

/// One row of an order's status history.
#[derive(Debug, Clone)]
pub struct OrderUpdate {
    pub status: String,
    pub filled_quantity: i64,
    pub average_price: f64,
    pub status_message: Option<String>,
}

// ---------- Blocking client interface ----------

/// Every broker operation the agent needs, as a blocking call. The gateway
/// worker thread is the only caller.
pub trait KiteApi: Send {
    fn profile(&self) -> Result<Profile, BrokerError>;
    fn margins(&self) -> Result<Margins, BrokerError>;
    fn holdings(&self) -> Result<Vec<BrokerHolding>, BrokerError>;
    fn instruments(&self, exchange: &str) -> Result<Vec<Instrument>, BrokerError>;
    /// Last traded prices keyed by "EXCHANGE:SYMBOL".
    fn ltp(&self, instruments: &[String]) -> Result<HashMap<String, f64>, BrokerError>;
    fn quote(&self, instrument: &str) -> Result<Quote, BrokerError>;
    fn historical_data(
        &self,
        instrument_token: u32,
        from: NaiveDate,
        to: NaiveDate,
        interval: &str,
    ) -> Result<Vec<Candle>, BrokerError>;
    fn place_order(&self, params: &OrderParams) -> Result<String, BrokerError>;
    fn order_history(&self, order_id: &str) -> Result<Vec<OrderUpdate>, BrokerError>;
}

// ---------- Gateway actor ----------

type Reply<T> = oneshot::Sender<Result<T, BrokerError>>;

enum Request {
    Profile(Reply<Profile>),
    Margins(Reply<Margins>),
    Holdings(Reply<Vec<BrokerHolding>>),
    Instruments {
        exchange: String,
        reply: Reply<Vec<Instrument>>,
    },
    Ltp {
        instruments: Vec<String>,
        reply: Reply<HashMap<String, f64>>,
    },
    Quote {
        instrument: String,
        reply: Reply<Quote>,
    },
    HistoricalData {
        instrument_token: u32,
        from: NaiveDate,
        to: NaiveDate,
        interval: String,
        reply: Reply<Vec<Candle>>,
    },
    PlaceOrder {
        params: OrderParams,
        reply: Reply<String>,
    },
    OrderHistory {
        order_id: String,
        reply: Reply<Vec<OrderUpdate>>,
    },
    Shutdown,
}

/// Async handle to the broker worker. Cloning shares the same worker, so
/// broker calls stay strictly serialized no matter how many callers exist.
#[derive(Clone)]
pub struct BrokerGateway {
    tx: mpsc::UnboundedSender<Request>,
}

impl BrokerGateway {
    /// Spawn the worker thread that owns `client` exclusively.
    pub fn spawn(client: Box<dyn KiteApi>) -> (Self, thread::JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = thread::Builder::new()
            .name("broker-gateway".into())
            .spawn(move || worker_loop(client, rx))
            .expect("failed to spawn broker gateway thread");
        (Self { tx }, handle)
    }

    /// Stop the worker. Requests already queued behind the shutdown marker
    /// resolve to `WorkerStopped`; callers still apply their own timeouts.
    pub fn stop(&self) {
        let _ = self.tx.send(Request::Shutdown);
    }

    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Request) -> Result<T, BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| BrokerError::WorkerStopped)?;
        rx.await.map_err(|_| BrokerError::WorkerStopped)?
    }

    pub async fn profile(&self) -> Result<Profile, BrokerError> {
        self.call(Request::Profile).await
    }

    pub async fn margins(&self) -> Result<Margins, BrokerError> {
        self.call(Request::Margins).await
    }

    pub async fn holdings(&self) -> Result<Vec<BrokerHolding>, BrokerError> {
        self.call(Request::Holdings).await
    }

    pub async fn instruments(&self, exchange: &str) -> Result<Vec<Instrument>, BrokerError> {
        let exchange = exchange.to_string();
        self.call(|reply| Request::Instruments { exchange, reply })
            .await
    }

    pub async fn ltp(&self, instruments: Vec<String>) -> Result<HashMap<String, f64>, BrokerError> {
        self.call(|reply| Request::Ltp { instruments, reply }).await
    }

    pub async fn quote(&self, instrument: &str) -> Result<Quote, BrokerError> {
        let instrument = instrument.to_string();
        self.call(|reply| Request::Quote { instrument, reply }).await
    }

    pub async fn historical_data(
        &self,
        instrument_token: u32,
        from: NaiveDate,
        to: NaiveDate,
        interval: &str,
    ) -> Result<Vec<Candle>, BrokerError> {
        let interval = interval.to_string();
        self.call(|reply| Request::HistoricalData {
            instrument_token,
            from,
            to,
            interval,
            reply,
        })
        .await
    }

    pub async fn place_order(&self, params: OrderParams) -> Result<String, BrokerError> {
        self.call(|reply| Request::PlaceOrder { params, reply })
            .await
    }

    pub async fn order_history(&self, order_id: &str) -> Result<Vec<OrderUpdate>, BrokerError> {
        let order_id = order_id.to_string();
        self.call(|reply| Request::OrderHistory { order_id, reply })
            .await
    }
}

fn worker_loop(client: Box<dyn KiteApi>, mut rx: mpsc::UnboundedReceiver<Request>) {
    info!("broker gateway worker started");
    while let Some(req) = rx.blocking_recv() {
        match req {
            Request::Profile(reply) => {
                let _ = reply.send(client.profile());
            }
            Request::Margins(reply) => {
                let _ = reply.send(client.margins());
            }
            Request::Holdings(reply) => {
                let _ = reply.send(client.holdings());
            }
            Request::Instruments { exchange, reply } => {
                let _ = reply.send(client.instruments(&exchange));
            }
            Request::Ltp { instruments, reply } => {
                let _ = reply.send(client.ltp(&instruments));
            }
            Request::Quote { instrument, reply } => {
                let _ = reply.send(client.quote(&instrument));
            }
            Request::HistoricalData {
                instrument_token,
                from,
                to,
                interval,
                reply,
            } => {
                let _ = reply.send(client.historical_data(instrument_token, from, to, &interval));
            }
            Request::PlaceOrder { params, reply } => {
                let _ = reply.send(client.place_order(&params));
            }
            Request::OrderHistory { order_id, reply } => {
                let _ = reply.send(client.order_history(&order_id));
            }
            Request::Shutdown => break,
        }
    }
    // Dropping rx closes the remaining oneshots; their callers observe
    // WorkerStopped.
    info!("broker gateway worker stopped");
}


#[cfg(test)]
mod tests {
    use super::testkit::spawn_scripted;
    use super::*;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn concurrent_callers_never_overlap() {
        let (kite, gw, handle) = spawn_scripted();
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let gw = gw.clone();
            tasks.push(tokio::spawn(async move { gw.profile().await }));
        }
        for t in tasks {
            assert!(t.await.unwrap().is_ok());
        }
        assert!(!kite.overlap_detected.load(Ordering::SeqCst));
        assert_eq!(kite.calls.load(Ordering::SeqCst), 16);
        gw.stop();
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn calls_execute_in_submission_order() {
        let (kite, gw, handle) = spawn_scripted();
        gw.profile().await.unwrap();
        gw.margins().await.unwrap();
        gw.holdings().await.unwrap();
        let ops = kite.ops.lock().unwrap().clone();
        assert_eq!(ops, vec!["profile", "margins", "holdings"]);
        gw.stop();
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn operation_error_passes_through_and_worker_survives() {
        let (kite, gw, handle) = spawn_scripted();
        kite.fail_all.store(true, Ordering::SeqCst);
        let err = gw.holdings().await.unwrap_err();
        assert!(matches!(err, BrokerError::Transport(_)));

        // Worker is still alive and serves the next call.
        kite.fail_all.store(false, Ordering::SeqCst);
        assert!(gw.profile().await.is_ok());
        gw.stop();
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn stopped_worker_rejects_later_calls() {
        let (_kite, gw, handle) = spawn_scripted();
        gw.stop();
        handle.join().unwrap();
        let err = gw.profile().await.unwrap_err();
        assert!(matches!(err, BrokerError::WorkerStopped));
    }
}
