//! Universe discovery: filter the 24h ticker list down to liquid pairs and
//! score each survivor's higher-timeframe trend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::candles::Timeframe;
use crate::error::MarketDataError;
use crate::exchange::retry::{is_retryable, retry_async, RetryConfig};
use crate::exchange::{MarketData, Ticker24h};
use crate::indicators::{adx_series, ema_series, rsi_series};
use crate::settings::Settings;
use crate::snapshot::InstrumentSnapshot;

pub const FIAT_CURRENCIES: &[&str] = &[
    "EUR", "GBP", "JPY", "AUD", "CAD", "CHF", "CNY", "HKD", "NZD", "SEK", "KRW", "SGD", "NOK",
    "MXN", "INR", "RUB", "ZAR", "TRY", "BRL",
];

const MACRO_CANDLES: usize = 100;
const MIN_4H_CANDLES: usize = 51;
const MIN_1H_CANDLES: usize = 15;

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryFilter {
    pub quote_asset: String,
    pub min_quote_volume: f64,
    pub excluded: Vec<String>,
}

impl DiscoveryFilter {
    pub fn from_settings(s: &Settings) -> Self {
        Self {
            quote_asset: s.quote_asset.clone(),
            min_quote_volume: s.min_volume_usd,
            excluded: s.excluded_pairs.clone(),
        }
    }

    pub fn accepts(&self, t: &Ticker24h) -> bool {
        let Some(base) = t.symbol.strip_suffix(self.quote_asset.as_str()) else {
            return false;
        };
        !base.is_empty()
            && !FIAT_CURRENCIES.contains(&base)
            && t.quote_volume > self.min_quote_volume
            && !self.excluded.iter().any(|x| x == &t.symbol)
    }
}

/// Discovery-owned indicator values for one symbol.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacroAnalysis {
    pub macro_trend_score: f64,
    pub adx_4h: f64,
    pub rsi_4h: f64,
    pub rsi_1h: f64,
}

/// Composite 0-100 trend score from 4h candles: EMA20/EMA50 alignment and
/// distance (50), EMA50 slope (20), ADX strength (15), RSI momentum (15).
/// Returns `None` when there are not enough closes for two EMA50 readings.
pub fn macro_trend_score(closes: &[f64], highs: &[f64], lows: &[f64]) -> Option<(f64, f64, f64)> {
    let ema20 = ema_series(closes, 20);
    let ema50 = ema_series(closes, 50);
    let rsi = rsi_series(closes, 14);
    let adx = adx_series(highs, lows, closes, 14).last().copied().unwrap_or(0.0);

    let last_close = *closes.last()?;
    let e20 = *ema20.last()?;
    let e50 = *ema50.last()?;
    let prev_e50 = *ema50.get(ema50.len().checked_sub(2)?)?;
    let rsi = *rsi.last()?;

    let mut score = 0.0;
    if last_close > e50 && e20 > e50 {
        score += 25.0;
        let dist_pct = (last_close - e50) / e50 * 100.0;
        score += (dist_pct * 5.0).min(25.0);
    }
    let slope = e50 - prev_e50;
    if slope > 0.0 {
        let slope_pct = slope / prev_e50 * 100.0;
        score += (slope_pct * 20.0).min(20.0);
    }
    if adx > 20.0 {
        score += ((adx - 20.0) * 0.75).min(15.0);
    }
    if rsi > 50.0 {
        score += ((rsi - 50.0) * 0.75).min(15.0);
    }
    Some((score.clamp(0.0, 100.0), adx, rsi))
}

struct CachedAnalysis {
    analysis: MacroAnalysis,
    computed_at: Instant,
}

pub struct MarketDiscovery {
    source: Arc<dyn MarketData>,
    cache: Mutex<HashMap<String, CachedAnalysis>>,
    ttl: Duration,
    concurrency: usize,
    retry: RetryConfig,
}

impl MarketDiscovery {
    pub fn new(source: Arc<dyn MarketData>, ttl: Duration, concurrency: usize) -> Self {
        Self {
            source,
            cache: Mutex::new(HashMap::new()),
            ttl,
            concurrency: concurrency.max(1),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// One discovery cycle. Fails only when the universe itself cannot be
    /// fetched; symbols whose analysis fails are dropped. Results are ordered
    /// by 24h quote volume, largest first.
    pub async fn discover(&self, filter: &DiscoveryFilter) -> Result<Vec<InstrumentSnapshot>, MarketDataError> {
        info!(target: "scanner", "starting discovery cycle");
        let tickers = retry_async(&self.retry, "ticker universe", is_retryable, || self.source.fetch_tickers()).await?;
        let candidates: Vec<Ticker24h> = tickers.into_iter().filter(|t| filter.accepts(t)).collect();
        if candidates.is_empty() {
            warn!(target: "scanner", "no pairs passed the volume/exclusion filters");
            return Ok(Vec::new());
        }
        info!(target: "scanner", count = candidates.len(), "pairs passed initial filters");

        let mut out: Vec<InstrumentSnapshot> = stream::iter(candidates)
            .map(|t| async move {
                match self.analyze(&t.symbol).await {
                    Ok(Some(a)) => Some(InstrumentSnapshot {
                        macro_trend_score: a.macro_trend_score,
                        adx_4h: a.adx_4h,
                        rsi_4h: a.rsi_4h,
                        rsi_1h: a.rsi_1h,
                        ..InstrumentSnapshot::new(t.symbol, t.last_price, t.quote_volume)
                    }),
                    Ok(None) => {
                        debug!(target: "scanner", symbol = %t.symbol, "insufficient history, skipped");
                        None
                    }
                    Err(e) => {
                        warn!(target: "scanner", symbol = %t.symbol, "could not analyze: {e}");
                        None
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .filter_map(|s| async move { s })
            .collect()
            .await;

        out.sort_by(|a, b| b.volume.total_cmp(&a.volume));
        info!(target: "scanner", monitored = out.len(), "discovery finished");
        Ok(out)
    }

    fn cached(&self, symbol: &str) -> Option<MacroAnalysis> {
        let cache = self.cache.lock().ok()?;
        cache
            .get(symbol)
            .filter(|c| c.computed_at.elapsed() < self.ttl)
            .map(|c| c.analysis)
    }

    async fn analyze(&self, symbol: &str) -> Result<Option<MacroAnalysis>, MarketDataError> {
        if let Some(hit) = self.cached(symbol) {
            return Ok(Some(hit));
        }
        debug!(target: "scanner", %symbol, "long-term analysis");

        let k4h = self.source.fetch_klines(symbol, Timeframe::H4, MACRO_CANDLES).await?;
        if k4h.len() < MIN_4H_CANDLES {
            return Ok(None);
        }
        let k1h = self.source.fetch_klines(symbol, Timeframe::H1, MACRO_CANDLES).await?;
        if k1h.len() < MIN_1H_CANDLES {
            return Ok(None);
        }

        let closes: Vec<f64> = k4h.iter().map(|c| c.close).collect();
        let highs: Vec<f64> = k4h.iter().map(|c| c.high).collect();
        let lows: Vec<f64> = k4h.iter().map(|c| c.low).collect();
        let Some((score, adx_4h, rsi_4h)) = macro_trend_score(&closes, &highs, &lows) else {
            return Ok(None);
        };
        let closes_1h: Vec<f64> = k1h.iter().map(|c| c.close).collect();
        let Some(rsi_1h) = rsi_series(&closes_1h, 14).last().copied() else {
            return Ok(None);
        };

        let analysis = MacroAnalysis { macro_trend_score: score, adx_4h, rsi_4h, rsi_1h };
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(symbol.to_string(), CachedAnalysis { analysis, computed_at: Instant::now() });
        }
        Ok(Some(analysis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticker(symbol: &str, vol: f64) -> Ticker24h {
        Ticker24h { symbol: symbol.to_string(), last_price: 1.0, quote_volume: vol }
    }

    #[test]
    fn test_filter_rules() {
        let f = DiscoveryFilter::from_settings(&Settings::default());
        assert!(f.accepts(&ticker("SOLUSDT", 2e7)));
        assert!(!f.accepts(&ticker("SOLUSDT", 1e7)), "volume must be strictly above the minimum");
        assert!(!f.accepts(&ticker("EURUSDT", 9e9)));
        assert!(!f.accepts(&ticker("USDCUSDT", 9e9)));
        assert!(!f.accepts(&ticker("USDT", 9e9)));
        assert!(!f.accepts(&ticker("SOLBTC", 9e9)));
    }

    #[test]
    fn test_macro_score_bounds_and_direction() {
        let up: Vec<f64> = (0..100).map(|i| 100.0 * 1.01f64.powi(i)).collect();
        let highs: Vec<f64> = up.iter().map(|c| c * 1.005).collect();
        let lows: Vec<f64> = up.iter().map(|c| c * 0.995).collect();
        let (score, _, rsi) = macro_trend_score(&up, &highs, &lows).unwrap();
        assert!(score > 50.0 && score <= 100.0, "score {score}");
        assert!(rsi > 50.0);

        let down: Vec<f64> = up.iter().rev().copied().collect();
        let dh: Vec<f64> = down.iter().map(|c| c * 1.005).collect();
        let dl: Vec<f64> = down.iter().map(|c| c * 0.995).collect();
        let (score, _, _) = macro_trend_score(&down, &dh, &dl).unwrap();
        assert!((0.0..=50.0).contains(&score), "score {score}");
    }

    #[test]
    fn test_macro_score_needs_two_ema50_readings() {
        let flat = vec![10.0; 50];
        assert!(macro_trend_score(&flat, &flat, &flat).is_none());
        let flat = vec![10.0; 51];
        assert!(macro_trend_score(&flat, &flat, &flat).is_some());
    }
}
