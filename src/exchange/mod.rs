use async_trait::async_trait;

use crate::candles::{Candle, Timeframe};
use crate::error::MarketDataError;

mod binance;
pub mod retry;

pub use binance::BinanceRest;

/// One row of the 24h ticker universe.
#[derive(Debug, Clone, PartialEq)]
pub struct Ticker24h {
    pub symbol: String,
    pub last_price: f64,
    /// 24h traded volume in the quote asset.
    pub quote_volume: f64,
}

/// Upstream REST market data. Implemented by [`BinanceRest`] in production and
/// by in-memory fakes in tests.
#[async_trait]
pub trait MarketData: Send + Sync {
    async fn fetch_tickers(&self) -> Result<Vec<Ticker24h>, MarketDataError>;

    /// Most recent `limit` candles, oldest first. The newest row may still be
    /// forming.
    async fn fetch_klines(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, MarketDataError>;
}
