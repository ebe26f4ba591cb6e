//! Thin blocking Kite Connect v3 HTTP client implementing `KiteApi`.
//!
//! Only the gateway worker thread ever calls into this, so the blocking
//! reqwest client needs no synchronization of its own.

use std::collections::HashMap;

use chrono::NaiveDate;
use serde_json::Value;
use tracing::info;

use crate::broker::{
    BrokerError, BrokerHolding, Instrument, KiteApi, Margins, OrderParams, OrderUpdate, Profile,
    Quote,
};
use crate::types::Candle;

const KITE_VERSION: &str = "3";

pub struct KiteConnect {
    http: reqwest::blocking::Client,
    base_url: String,
    authorization: String,
}

impl KiteConnect {
    pub fn new(api_key: &str, access_token: &str, base_url: &str) -> Result<Self, BrokerError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            authorization: format!("token {api_key}:{access_token}"),
        })
    }

    fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value, BrokerError> {
        let resp = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .header("X-Kite-Version", KITE_VERSION)
            .header("Authorization", &self.authorization)
            .query(query)
            .send()
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        Self::unwrap_envelope(resp)
    }

    fn post_form(&self, path: &str, form: &[(&str, String)]) -> Result<Value, BrokerError> {
        let resp = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .header("X-Kite-Version", KITE_VERSION)
            .header("Authorization", &self.authorization)
            .form(form)
            .send()
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        Self::unwrap_envelope(resp)
    }

    /// Kite wraps every JSON response in `{"status": ..., "data": ...}`.
    fn unwrap_envelope(resp: reqwest::blocking::Response) -> Result<Value, BrokerError> {
        let status = resp.status().as_u16();
        let body: Value = resp
            .json()
            .map_err(|e| BrokerError::Parse(e.to_string()))?;
        envelope_data(status, body)
    }
}

fn envelope_data(http_status: u16, body: Value) -> Result<Value, BrokerError> {
    if body.get("status").and_then(Value::as_str) == Some("success") {
        return Ok(body.get("data").cloned().unwrap_or(Value::Null));
    }
    let message = body
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown broker error")
        .to_string();
    let error_type = body.get("error_type").and_then(Value::as_str).unwrap_or("");
    if error_type == "TokenException" || http_status == 403 {
        return Err(BrokerError::Auth(message));
    }
    Err(BrokerError::Api(message))
}

fn as_f64(v: &Value, key: &str) -> f64 {
    v.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}

fn as_i64(v: &Value, key: &str) -> i64 {
    v.get(key).and_then(Value::as_i64).unwrap_or(0)
}

fn as_str<'a>(v: &'a Value, key: &str) -> &'a str {
    v.get(key).and_then(Value::as_str).unwrap_or("")
}

impl KiteApi for KiteConnect {
    fn profile(&self) -> Result<Profile, BrokerError> {
        let data = self.get("/user/profile", &[])?;
        Ok(Profile {
            user_id: as_str(&data, "user_id").to_string(),
            user_name: as_str(&data, "user_name").to_string(),
        })
    }

    fn margins(&self) -> Result<Margins, BrokerError> {
        let data = self.get("/user/margins", &[])?;
        let live_balance = data
            .pointer("/equity/available/live_balance")
            .and_then(Value::as_f64)
            .ok_or_else(|| BrokerError::Parse("missing equity live_balance".into()))?;
        Ok(Margins {
            available_cash: live_balance,
        })
    }

    fn holdings(&self) -> Result<Vec<BrokerHolding>, BrokerError> {
        let data = self.get("/portfolio/holdings", &[])?;
        let rows = data
            .as_array()
            .ok_or_else(|| BrokerError::Parse("holdings payload is not an array".into()))?;
        Ok(rows
            .iter()
            .map(|r| BrokerHolding {
                tradingsymbol: as_str(r, "tradingsymbol").to_string(),
                quantity: as_i64(r, "quantity"),
                average_price: as_f64(r, "average_price"),
                instrument_token: as_i64(r, "instrument_token") as u32,
                exchange: as_str(r, "exchange").to_string(),
                product: as_str(r, "product").to_string(),
            })
            .collect())
    }

    fn instruments(&self, exchange: &str) -> Result<Vec<Instrument>, BrokerError> {
        // The instruments dump is CSV, not the JSON envelope.
        let resp = self
            .http
            .get(format!("{}/instruments/{}", self.base_url, exchange))
            .header("X-Kite-Version", KITE_VERSION)
            .header("Authorization", &self.authorization)
            .send()
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        let text = resp
            .text()
            .map_err(|e| BrokerError::Transport(e.to_string()))?;

        let mut reader = csv::Reader::from_reader(text.as_bytes());
        let headers = reader
            .headers()
            .map_err(|e| BrokerError::Parse(e.to_string()))?
            .clone();
        let col = |name: &str| headers.iter().position(|h| h == name);
        let (Some(tok), Some(sym), Some(kind)) = (
            col("instrument_token"),
            col("tradingsymbol"),
            col("instrument_type"),
        ) else {
            return Err(BrokerError::Parse("instruments dump missing columns".into()));
        };

        let mut out = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| BrokerError::Parse(e.to_string()))?;
            let token: u32 = record
                .get(tok)
                .and_then(|s| s.parse().ok())
                .unwrap_or_default();
            if token == 0 {
                continue;
            }
            out.push(Instrument {
                instrument_token: token,
                tradingsymbol: record.get(sym).unwrap_or_default().to_string(),
                instrument_type: record.get(kind).unwrap_or_default().to_string(),
                exchange: exchange.to_string(),
            });
        }
        info!(exchange, count = out.len(), "fetched instruments dump");
        Ok(out)
    }

    fn ltp(&self, instruments: &[String]) -> Result<HashMap<String, f64>, BrokerError> {
        let query: Vec<(&str, String)> = instruments.iter().map(|i| ("i", i.clone())).collect();
        let data = self.get("/quote/ltp", &query)?;
        let map = data
            .as_object()
            .ok_or_else(|| BrokerError::Parse("ltp payload is not an object".into()))?;
        Ok(map
            .iter()
            .map(|(k, v)| (k.clone(), as_f64(v, "last_price")))
            .collect())
    }

    fn quote(&self, instrument: &str) -> Result<Quote, BrokerError> {
        let data = self.get("/quote", &[("i", instrument.to_string())])?;
        let entry = data
            .get(instrument)
            .ok_or_else(|| BrokerError::Parse(format!("no quote data for {instrument}")))?;
        Ok(Quote {
            last_price: as_f64(entry, "last_price"),
        })
    }

    fn historical_data(
        &self,
        instrument_token: u32,
        from: NaiveDate,
        to: NaiveDate,
        interval: &str,
    ) -> Result<Vec<Candle>, BrokerError> {
        let path = format!("/instruments/historical/{instrument_token}/{interval}");
        let data = self.get(
            &path,
            &[
                ("from", format!("{from} 09:15:00")),
                ("to", format!("{to} 15:30:00")),
            ],
        )?;
        let rows = data
            .get("candles")
            .and_then(Value::as_array)
            .ok_or_else(|| BrokerError::Parse("missing candles array".into()))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let cols = row
                .as_array()
                .ok_or_else(|| BrokerError::Parse("candle row is not an array".into()))?;
            if cols.len() < 6 {
                return Err(BrokerError::Parse("short candle row".into()));
            }
            let ts = cols[0].as_str().unwrap_or("");
            let date = ts
                .get(..10)
                .and_then(|d| d.parse::<NaiveDate>().ok())
                .ok_or_else(|| BrokerError::Parse(format!("bad candle timestamp: {ts}")))?;
            out.push(Candle {
                date,
                open: cols[1].as_f64().unwrap_or(0.0),
                high: cols[2].as_f64().unwrap_or(0.0),
                low: cols[3].as_f64().unwrap_or(0.0),
                close: cols[4].as_f64().unwrap_or(0.0),
                volume: cols[5].as_i64().unwrap_or(0),
            });
        }
        Ok(out)
    }

    fn place_order(&self, params: &OrderParams) -> Result<String, BrokerError> {
        let data = self.post_form(
            "/orders/regular",
            &[
                ("tradingsymbol", params.tradingsymbol.clone()),
                ("exchange", params.exchange.clone()),
                ("transaction_type", params.transaction_type.clone()),
                ("quantity", params.quantity.to_string()),
                ("product", OrderParams::PRODUCT.to_string()),
                ("order_type", OrderParams::ORDER_TYPE.to_string()),
                ("validity", OrderParams::VALIDITY.to_string()),
            ],
        )?;
        let order_id = data
            .get("order_id")
            .and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .ok_or_else(|| BrokerError::Parse("order response missing order_id".into()))?;
        info!(%order_id, symbol = %params.tradingsymbol, side = %params.transaction_type, "placed CNC market order");
        Ok(order_id)
    }

    fn order_history(&self, order_id: &str) -> Result<Vec<OrderUpdate>, BrokerError> {
        let data = self.get(&format!("/orders/{order_id}"), &[])?;
        let rows = data
            .as_array()
            .ok_or_else(|| BrokerError::Parse("order history is not an array".into()))?;
        Ok(rows
            .iter()
            .map(|r| OrderUpdate {
                status: as_str(r, "status").to_string(),
                filled_quantity: as_i64(r, "filled_quantity"),
                average_price: as_f64(r, "average_price"),
                status_message: r
                    .get("status_message")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
            .collect())
    }
}
