//! Exchange market stream: message decoding and the long-lived socket task.

use serde::Deserialize;

use crate::candles::{Candle, Timeframe};

mod stream;

pub use stream::{connect, control_messages, run_stream, StreamConfig, MAX_PARAMS_PER_MESSAGE};

/// A decoded, already-closed market update.
#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    Kline { symbol: String, timeframe: Timeframe, candle: Candle },
    Ticker { symbol: String, price: f64, quote_volume: f64 },
}

#[derive(Debug, Deserialize)]
struct Combined {
    #[allow(dead_code)]
    stream: String,
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "e")]
enum Payload {
    #[serde(rename = "kline")]
    Kline {
        #[serde(rename = "s")]
        symbol: String,
        #[serde(rename = "k")]
        kline: RawKline,
    },
    #[serde(rename = "24hrTicker")]
    Ticker {
        #[serde(rename = "s")]
        symbol: String,
        #[serde(rename = "c")]
        last: String,
        #[serde(rename = "q")]
        quote_volume: String,
    },
}

#[derive(Debug, Deserialize)]
struct RawKline {
    #[serde(rename = "t")]
    open_time: u64,
    #[serde(rename = "i")]
    interval: String,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "x")]
    closed: bool,
}

/// Decodes one text frame. Returns `None` for subscription acks, unknown
/// event types, unsupported intervals, malformed numbers and klines that
/// have not closed yet.
pub fn parse_stream_message(text: &str) -> Option<MarketEvent> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    let value = match serde_json::from_value::<Combined>(value.clone()) {
        Ok(c) => c.data,
        Err(_) => value,
    };
    match serde_json::from_value::<Payload>(value).ok()? {
        Payload::Kline { symbol, kline } => {
            if !kline.closed {
                return None;
            }
            let timeframe = kline.interval.parse().ok()?;
            let candle = Candle {
                open_time: kline.open_time,
                open: kline.open.parse().ok()?,
                high: kline.high.parse().ok()?,
                low: kline.low.parse().ok()?,
                close: kline.close.parse().ok()?,
                volume: kline.volume.parse().ok()?,
            };
            Some(MarketEvent::Kline { symbol, timeframe, candle })
        }
        Payload::Ticker { symbol, last, quote_volume } => Some(MarketEvent::Ticker {
            symbol,
            price: last.parse().ok()?,
            quote_volume: quote_volume.parse().ok()?,
        }),
    }
}
