use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Longest indicator lookback plus one bar for the "previous candle" reads.
pub const DEFAULT_BUFFER_CAPACITY: usize = 201;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Open time, epoch milliseconds
    pub open_time: u64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
        }
    }

    /// Candles fetched when a buffer is hydrated from REST.
    pub fn hydration_limit(&self) -> usize {
        match self {
            Timeframe::M1 => 50,
            _ => DEFAULT_BUFFER_CAPACITY,
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Timeframe::M1),
            "15m" => Ok(Timeframe::M15),
            "1h" => Ok(Timeframe::H1),
            "4h" => Ok(Timeframe::H4),
            other => Err(format!("unsupported timeframe {other}")),
        }
    }
}

/// Percentage move from the first candle's open to the last candle's close.
pub fn window_change_pct(window: &[Candle]) -> Option<f64> {
    let first = window.first()?;
    let last = window.last()?;
    if first.open <= 0.0 {
        return None;
    }
    Some((last.close - first.open) * 100.0 / first.open)
}

/// Fixed-capacity, oldest-first candle history.
#[derive(Debug, Clone)]
pub struct CandleBuffer {
    candles: VecDeque<Candle>,
    capacity: usize,
}

impl CandleBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            candles: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn from_history(capacity: usize, history: Vec<Candle>) -> Self {
        let mut buf = Self::new(capacity);
        for c in history {
            buf.push(c);
        }
        buf
    }

    /// Appends a closed candle, evicting the oldest on overflow. A candle with
    /// the same open time as the newest bar replaces it.
    pub fn push(&mut self, candle: Candle) {
        if let Some(last) = self.candles.back_mut() {
            if last.open_time == candle.open_time {
                *last = candle;
                return;
            }
        }
        self.candles.push_back(candle);
        while self.candles.len() > self.capacity {
            self.candles.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.back()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Candle> + ExactSizeIterator {
        self.candles.iter()
    }

    /// The newest `n` candles, oldest first. Shorter when the buffer holds fewer.
    pub fn tail(&self, n: usize) -> Vec<Candle> {
        let skip = self.candles.len().saturating_sub(n);
        self.candles.iter().skip(skip).copied().collect()
    }

    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.close).collect()
    }

    pub fn highs(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.high).collect()
    }

    pub fn lows(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.low).collect()
    }

    pub fn volumes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.volume).collect()
    }
}
