//! Screen the configured universe for ranked entry candidates.

use chrono::NaiveDate;
use tracing::{error, info, warn};

use crate::config::ScreenerCfg;
use crate::indicators;
use crate::resilience::ResilientBroker;
use crate::types::sanitize_symbol;

#[derive(Debug, Clone)]
pub struct Opportunity {
    pub symbol: String,
    pub instrument_token: u32,
    pub score: f64,
}

/// Filter the universe by liquidity and price, keep pullbacks in uptrends
/// (price above 50-day SMA, RSI below 55) and rank by how deep the
/// pullback is. Per-symbol failures are logged and skipped.
pub async fn top_opportunities(
    broker: &ResilientBroker,
    cfg: &ScreenerCfg,
    exchange: &str,
    today: NaiveDate,
) -> Vec<Opportunity> {
    let instruments = match broker.instruments(exchange).await {
        Ok(list) => list,
        Err(e) => {
            error!(error = %e, "failed to fetch instruments for screening");
            return Vec::new();
        }
    };
    let token_of = |symbol: &str| {
        instruments
            .iter()
            .find(|i| i.exchange == exchange && i.tradingsymbol == symbol && i.instrument_type == "EQ")
            .map(|i| i.instrument_token)
    };

    let from = today - chrono::Duration::days(90);
    let mut candidates = Vec::new();

    for raw in &cfg.universe {
        let symbol = sanitize_symbol(raw);
        let Some(token) = token_of(&symbol) else {
            continue;
        };
        let candles = match broker.historical_data(token, from, today, "day").await {
            Ok(c) => c,
            Err(e) => {
                warn!(%symbol, error = %e, "could not screen symbol");
                continue;
            }
        };
        if candles.len() < indicators::MIN_CANDLES {
            continue;
        }

        let last = &candles[candles.len() - 1];
        let avg_volume = candles
            .iter()
            .rev()
            .take(20)
            .map(|c| c.volume as f64)
            .sum::<f64>()
            / 20.0;
        if last.close < cfg.min_price || avg_volume < cfg.min_avg_volume {
            continue;
        }

        let ind = indicators::compute(&candles);
        let (Some(sma_50), Some(rsi)) = (ind.sma_50, ind.rsi_14) else {
            continue;
        };
        if last.close <= sma_50 || rsi >= 55.0 {
            continue;
        }

        // Deeper pullback scores higher.
        let score = 100.0 - rsi;
        info!(%symbol, rsi, score, "screening candidate found");
        candidates.push(Opportunity {
            symbol,
            instrument_token: token,
            score,
        });
    }

    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    candidates.truncate(cfg.top_n);
    info!(count = candidates.len(), "screening complete");
    candidates
}
