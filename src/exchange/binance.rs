use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::candles::{Candle, Timeframe};
use crate::error::MarketDataError;
use crate::exchange::{MarketData, Ticker24h};

/// Binance spot public REST endpoints.
pub struct BinanceRest {
    client: Client,
    base: String,
}

impl BinanceRest {
    pub fn new(base: impl Into<String>, timeout: Duration) -> Result<Self, MarketDataError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base: base.into().trim_end_matches('/').to_string(),
        })
    }

    async fn get_json(&self, url: &str) -> Result<Value, MarketDataError> {
        debug!(target: "binance_api", %url, "GET");
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(MarketDataError::Status { status: status.as_u16(), body });
        }
        Ok(resp.json().await?)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTicker {
    symbol: String,
    last_price: String,
    quote_volume: String,
}

/// Parses the `/api/v3/ticker/24hr` body. Rows with unparsable numbers are
/// skipped; a body that is not an array is malformed.
pub(crate) fn parse_tickers(body: Value) -> Result<Vec<Ticker24h>, MarketDataError> {
    let Value::Array(rows) = body else {
        return Err(MarketDataError::malformed("ticker universe is not an array"));
    };
    let tickers = rows
        .into_iter()
        .filter_map(|row| serde_json::from_value::<RawTicker>(row).ok())
        .filter_map(|t| {
            Some(Ticker24h {
                last_price: t.last_price.parse().ok()?,
                quote_volume: t.quote_volume.parse().ok()?,
                symbol: t.symbol,
            })
        })
        .collect();
    Ok(tickers)
}

fn num(row: &[Value], idx: usize) -> Option<f64> {
    match row.get(idx)? {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Parses the `/api/v3/klines` body: `[[openTime, "o", "h", "l", "c", "v", ...], ...]`.
pub(crate) fn parse_klines(body: Value) -> Result<Vec<Candle>, MarketDataError> {
    let rows: Vec<Vec<Value>> = serde_json::from_value(body)
        .map_err(|e| MarketDataError::malformed(format!("klines: {e}")))?;
    rows.iter()
        .map(|row| {
            let candle = Candle {
                open_time: row.first().and_then(Value::as_u64)?,
                open: num(row, 1)?,
                high: num(row, 2)?,
                low: num(row, 3)?,
                close: num(row, 4)?,
                volume: num(row, 5)?,
            };
            Some(candle)
        })
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| MarketDataError::malformed("kline row"))
}

#[async_trait]
impl MarketData for BinanceRest {
    async fn fetch_tickers(&self) -> Result<Vec<Ticker24h>, MarketDataError> {
        let url = format!("{}/api/v3/ticker/24hr", self.base);
        parse_tickers(self.get_json(&url).await?)
    }

    async fn fetch_klines(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, MarketDataError> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base, symbol, timeframe, limit
        );
        parse_klines(self.get_json(&url).await?)
    }
}
