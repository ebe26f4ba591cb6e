//! Technical indicators computed from daily candles.
//!
//! Insufficient input yields an all-empty set, never an error; callers
//! treat missing fields as "not computable" and fall back to fail-safe
//! behavior.

use crate::types::Candle;
use tracing::warn;

/// Minimum candles needed for the slowest indicator (50-day SMA).
pub const MIN_CANDLES: usize = 50;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndicatorSet {
    pub rsi_14: Option<f64>,
    pub sma_20: Option<f64>,
    pub sma_50: Option<f64>,
    pub ema_5: Option<f64>,
    pub macd_line: Option<f64>,
    pub macd_signal: Option<f64>,
    pub bb_upper: Option<f64>,
    pub bb_lower: Option<f64>,
    pub atr_14: Option<f64>,
}

pub fn compute(candles: &[Candle]) -> IndicatorSet {
    if candles.len() < MIN_CANDLES {
        warn!(
            candles = candles.len(),
            "not enough historical data to calculate indicators"
        );
        return IndicatorSet::default();
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let (macd_line, macd_signal) = macd(&closes, 12, 26, 9);
    let (bb_upper, bb_lower) = bollinger(&closes, 20, 2.0);

    IndicatorSet {
        rsi_14: rsi(&closes, 14),
        sma_20: sma(&closes, 20),
        sma_50: sma(&closes, 50),
        ema_5: ema_series(&closes, 5).last().copied(),
        macd_line,
        macd_signal,
        bb_upper,
        bb_lower,
        atr_14: atr(candles, 14),
    }
}

fn sma(values: &[f64], n: usize) -> Option<f64> {
    if values.len() < n || n == 0 {
        return None;
    }
    let window = &values[values.len() - n..];
    Some(window.iter().sum::<f64>() / n as f64)
}

/// EMA over the whole series, seeded with the SMA of the first `n` values.
/// Returns one entry per value from index `n - 1` onward.
fn ema_series(values: &[f64], n: usize) -> Vec<f64> {
    if values.len() < n || n == 0 {
        return Vec::new();
    }
    let k = 2.0 / (n as f64 + 1.0);
    let seed = values[..n].iter().sum::<f64>() / n as f64;
    let mut out = Vec::with_capacity(values.len() - n + 1);
    out.push(seed);
    let mut prev = seed;
    for v in &values[n..] {
        prev = v * k + prev * (1.0 - k);
        out.push(prev);
    }
    out
}

/// Wilder-smoothed RSI.
fn rsi(closes: &[f64], n: usize) -> Option<f64> {
    if closes.len() < n + 1 {
        return None;
    }
    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let mut avg_gain = deltas[..n].iter().filter(|d| **d > 0.0).sum::<f64>() / n as f64;
    let mut avg_loss = -deltas[..n].iter().filter(|d| **d < 0.0).sum::<f64>() / n as f64;
    for d in &deltas[n..] {
        let gain = d.max(0.0);
        let loss = (-d).max(0.0);
        avg_gain = (avg_gain * (n as f64 - 1.0) + gain) / n as f64;
        avg_loss = (avg_loss * (n as f64 - 1.0) + loss) / n as f64;
    }
    if avg_loss == 0.0 {
        return Some(if avg_gain == 0.0 { 50.0 } else { 100.0 });
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

fn macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> (Option<f64>, Option<f64>) {
    if closes.len() < slow + signal {
        return (None, None);
    }
    let fast_e = ema_series(closes, fast);
    let slow_e = ema_series(closes, slow);
    // slow_e[i] corresponds to closes[slow - 1 + i]; shift the fast series
    // to the same alignment.
    let offset = slow - fast;
    let line_series: Vec<f64> = slow_e
        .iter()
        .enumerate()
        .map(|(i, s)| fast_e[i + offset] - s)
        .collect();
    let line = line_series.last().copied();
    let sig = ema_series(&line_series, signal).last().copied();
    (line, sig)
}

fn bollinger(closes: &[f64], n: usize, width: f64) -> (Option<f64>, Option<f64>) {
    let mid = match sma(closes, n) {
        Some(m) => m,
        None => return (None, None),
    };
    let window = &closes[closes.len() - n..];
    let var = window.iter().map(|c| (c - mid).powi(2)).sum::<f64>() / n as f64;
    let sd = var.sqrt();
    (Some(mid + width * sd), Some(mid - width * sd))
}

/// Wilder-smoothed Average True Range.
fn atr(candles: &[Candle], n: usize) -> Option<f64> {
    if candles.len() < n + 1 {
        return None;
    }
    let trs: Vec<f64> = candles
        .windows(2)
        .map(|w| {
            let (prev, cur) = (&w[0], &w[1]);
            (cur.high - cur.low)
                .max((cur.high - prev.close).abs())
                .max((cur.low - prev.close).abs())
        })
        .collect();
    let mut avg = trs[..n].iter().sum::<f64>() / n as f64;
    for tr in &trs[n..] {
        avg = (avg * (n as f64 - 1.0) + tr) / n as f64;
    }
    Some(avg)
}
