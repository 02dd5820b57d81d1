//! Technical indicators over ordered price series.
//!
//! Each indicator is a small stateful struct that can be updated incrementally;
//! the `*_series` functions fold them over a slice and return only the values
//! produced once the indicator is warmed up. Callers that only need the latest
//! reading take `.last()`.

use std::collections::VecDeque;

// =============================================================================
// Smoothing primitives
// =============================================================================

/// Simple moving average with fixed window
#[derive(Debug, Clone)]
pub struct Sma {
    window: VecDeque<f64>,
    period: usize,
    sum: f64,
}

impl Sma {
    pub fn new(period: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(period),
            period,
            sum: 0.0,
        }
    }

    pub fn update(&mut self, value: f64) -> f64 {
        self.sum += value;
        self.window.push_back(value);
        if self.window.len() > self.period {
            self.sum -= self.window.pop_front().unwrap_or(0.0);
        }
        self.get()
    }

    pub fn get(&self) -> f64 {
        if self.window.is_empty() {
            0.0
        } else {
            self.sum / self.window.len() as f64
        }
    }

    pub fn is_ready(&self) -> bool {
        self.window.len() >= self.period
    }
}

/// Exponential moving average seeded with the SMA of the first `period` values.
#[derive(Debug, Clone)]
pub struct Ema {
    pub value: f64,
    pub alpha: f64,
    period: usize,
    seed_sum: f64,
    count: usize,
}

impl Ema {
    pub fn new(period: usize) -> Self {
        Self {
            value: 0.0,
            alpha: 2.0 / (period as f64 + 1.0),
            period: period.max(1),
            seed_sum: 0.0,
            count: 0,
        }
    }

    pub fn update(&mut self, price: f64) -> Option<f64> {
        self.count += 1;
        if self.count < self.period {
            self.seed_sum += price;
            return None;
        }
        if self.count == self.period {
            self.seed_sum += price;
            self.value = self.seed_sum / self.period as f64;
        } else {
            self.value = self.value * (1.0 - self.alpha) + price * self.alpha;
        }
        Some(self.value)
    }

    pub fn get(&self) -> f64 {
        self.value
    }

    pub fn is_ready(&self) -> bool {
        self.count >= self.period
    }
}

/// Wilder's smoothing (RMA): SMA seed, then `(prev * (n - 1) + x) / n`.
#[derive(Debug, Clone)]
pub struct Wilder {
    period: usize,
    count: usize,
    sum: f64,
    pub value: f64,
}

impl Wilder {
    pub fn new(period: usize) -> Self {
        Self { period: period.max(1), count: 0, sum: 0.0, value: 0.0 }
    }

    pub fn update(&mut self, x: f64) -> Option<f64> {
        let n = self.period as f64;
        if self.count < self.period {
            self.count += 1;
            self.sum += x;
            if self.count < self.period {
                return None;
            }
            self.value = self.sum / n;
        } else {
            self.value = (self.value * (n - 1.0) + x) / n;
        }
        Some(self.value)
    }
}

/// Rolling population standard deviation over a fixed window
#[derive(Debug, Clone)]
pub struct RollingStd {
    window: VecDeque<f64>,
    period: usize,
}

impl RollingStd {
    pub fn new(period: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(period),
            period,
        }
    }

    pub fn update(&mut self, value: f64) -> f64 {
        self.window.push_back(value);
        if self.window.len() > self.period {
            self.window.pop_front();
        }
        self.get()
    }

    pub fn get(&self) -> f64 {
        let n = self.window.len() as f64;
        if n < 2.0 {
            return 0.0;
        }
        let mean = self.window.iter().sum::<f64>() / n;
        let var = self.window.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        var.sqrt()
    }
}

// =============================================================================
// Classic Technical Indicators
// =============================================================================

/// Relative Strength Index (RSI) with Wilder smoothing
#[derive(Debug, Clone)]
pub struct Rsi {
    period: usize,
    avg_gain: f64,
    avg_loss: f64,
    prev_price: Option<f64>,
    count: usize,
}

impl Rsi {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            avg_gain: 0.0,
            avg_loss: 0.0,
            prev_price: None,
            count: 0,
        }
    }

    pub fn update(&mut self, price: f64) -> Option<f64> {
        if let Some(prev) = self.prev_price {
            let change = price - prev;
            let gain = change.max(0.0);
            let loss = (-change).max(0.0);

            self.count += 1;

            if self.count <= self.period {
                self.avg_gain = (self.avg_gain * (self.count - 1) as f64 + gain) / self.count as f64;
                self.avg_loss = (self.avg_loss * (self.count - 1) as f64 + loss) / self.count as f64;
            } else {
                let alpha = 1.0 / self.period as f64;
                self.avg_gain = self.avg_gain * (1.0 - alpha) + gain * alpha;
                self.avg_loss = self.avg_loss * (1.0 - alpha) + loss * alpha;
            }
        }
        self.prev_price = Some(price);
        if self.is_ready() {
            Some(self.get())
        } else {
            None
        }
    }

    pub fn get(&self) -> f64 {
        if self.avg_loss == 0.0 {
            if self.avg_gain == 0.0 {
                50.0
            } else {
                100.0
            }
        } else {
            let rs = self.avg_gain / self.avg_loss;
            100.0 - (100.0 / (1.0 + rs))
        }
    }

    pub fn is_ready(&self) -> bool {
        self.count >= self.period
    }
}

/// One Bollinger reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Band {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

impl Band {
    /// (upper - lower) / middle
    pub fn width(&self) -> f64 {
        if self.middle == 0.0 {
            0.0
        } else {
            (self.upper - self.lower) / self.middle
        }
    }
}

/// Bollinger Bands
#[derive(Debug, Clone)]
pub struct BollingerBands {
    sma: Sma,
    std: RollingStd,
    multiplier: f64,
}

impl BollingerBands {
    pub fn new(period: usize, multiplier: f64) -> Self {
        Self {
            sma: Sma::new(period),
            std: RollingStd::new(period),
            multiplier,
        }
    }

    pub fn update(&mut self, price: f64) -> Option<Band> {
        let middle = self.sma.update(price);
        let std = self.std.update(price);
        if !self.sma.is_ready() {
            return None;
        }
        let half = std * self.multiplier;
        Some(Band { upper: middle + half, middle, lower: middle - half })
    }
}

fn true_range(high: f64, low: f64, prev_close: Option<f64>) -> f64 {
    match prev_close {
        Some(pc) => (high - low).max((high - pc).abs()).max((low - pc).abs()),
        None => high - low,
    }
}

/// Average True Range (ATR), Wilder smoothed
#[derive(Debug, Clone)]
pub struct Atr {
    smoother: Wilder,
    prev_close: Option<f64>,
}

impl Atr {
    pub fn new(period: usize) -> Self {
        Self {
            smoother: Wilder::new(period),
            prev_close: None,
        }
    }

    pub fn update(&mut self, high: f64, low: f64, close: f64) -> Option<f64> {
        let out = match self.prev_close {
            // The first bar has no previous close and is only used as an anchor.
            None => None,
            Some(_) => self.smoother.update(true_range(high, low, self.prev_close)),
        };
        self.prev_close = Some(close);
        out
    }
}

/// Average Directional Index (trend strength, direction agnostic)
#[derive(Debug, Clone)]
pub struct Adx {
    tr: Wilder,
    plus_dm: Wilder,
    minus_dm: Wilder,
    dx: Wilder,
    prev: Option<(f64, f64, f64)>,
}

impl Adx {
    pub fn new(period: usize) -> Self {
        Self {
            tr: Wilder::new(period),
            plus_dm: Wilder::new(period),
            minus_dm: Wilder::new(period),
            dx: Wilder::new(period),
            prev: None,
        }
    }

    pub fn update(&mut self, high: f64, low: f64, close: f64) -> Option<f64> {
        let Some((ph, pl, pc)) = self.prev.replace((high, low, close)) else {
            return None;
        };

        let up = high - ph;
        let down = pl - low;
        let plus = if up > down && up > 0.0 { up } else { 0.0 };
        let minus = if down > up && down > 0.0 { down } else { 0.0 };

        let tr = self.tr.update(true_range(high, low, Some(pc)));
        let pdm = self.plus_dm.update(plus);
        let mdm = self.minus_dm.update(minus);

        let (Some(tr), Some(pdm), Some(mdm)) = (tr, pdm, mdm) else {
            return None;
        };
        if tr <= 0.0 {
            return self.dx.update(0.0);
        }
        let plus_di = 100.0 * pdm / tr;
        let minus_di = 100.0 * mdm / tr;
        let di_sum = plus_di + minus_di;
        let dx = if di_sum == 0.0 {
            0.0
        } else {
            100.0 * (plus_di - minus_di).abs() / di_sum
        };
        self.dx.update(dx)
    }
}

// =============================================================================
// Series helpers
// =============================================================================

pub fn sma_series(values: &[f64], period: usize) -> Vec<f64> {
    let mut sma = Sma::new(period);
    values
        .iter()
        .filter_map(|&v| {
            let out = sma.update(v);
            sma.is_ready().then_some(out)
        })
        .collect()
}

pub fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    let mut ema = Ema::new(period);
    values.iter().filter_map(|&v| ema.update(v)).collect()
}

pub fn rsi_series(values: &[f64], period: usize) -> Vec<f64> {
    let mut rsi = Rsi::new(period);
    values.iter().filter_map(|&v| rsi.update(v)).collect()
}

pub fn bollinger_series(values: &[f64], period: usize, multiplier: f64) -> Vec<Band> {
    let mut bb = BollingerBands::new(period, multiplier);
    values.iter().filter_map(|&v| bb.update(v)).collect()
}

pub fn atr_series(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Vec<f64> {
    let mut atr = Atr::new(period);
    highs
        .iter()
        .zip(lows)
        .zip(closes)
        .filter_map(|((&h, &l), &c)| atr.update(h, l, c))
        .collect()
}

pub fn adx_series(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Vec<f64> {
    let mut adx = Adx::new(period);
    highs
        .iter()
        .zip(lows)
        .zip(closes)
        .filter_map(|((&h, &l), &c)| adx.update(h, l, c))
        .collect()
}

/// Value at rank `floor(n * pct)` of the sorted sample.
pub fn percentile(values: &[f64], pct: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let idx = ((sorted.len() as f64 * pct).floor() as usize).min(sorted.len() - 1);
    Some(sorted[idx])
}

// =============================================================================
// Tests
// =============================================================================
