//! Per-instrument analysis state shared by the scanner, the analyzer and the
//! dashboard.

use serde::{Deserialize, Serialize};

use crate::indicators::Band;
use crate::settings::Settings;

/// Volume multiple over the 20-candle average that counts as a spike.
pub const VOLUME_SPIKE_MULTIPLE: f64 = 1.5;

/// Macro score above which the higher-timeframe trend is favorable.
pub const FAVORABLE_TREND_SCORE: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceDirection {
    Up,
    Down,
    #[default]
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalGrade {
    StrongBuy,
    Buy,
    Neutral,
    #[default]
    Weak,
}

impl SignalGrade {
    pub fn from_conditions_met(met: u8) -> Self {
        match met {
            5.. => SignalGrade::StrongBuy,
            4 => SignalGrade::Buy,
            3 => SignalGrade::Neutral,
            _ => SignalGrade::Weak,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StrategyConditions {
    pub trend: bool,
    pub squeeze: bool,
    pub breakout: bool,
    pub volume: bool,
    pub safety: bool,
}

impl StrategyConditions {
    pub fn met(&self) -> u8 {
        [self.trend, self.squeeze, self.breakout, self.volume, self.safety]
            .iter()
            .filter(|c| **c)
            .count() as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandSnapshot {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    /// Band width as a percentage of the middle band.
    pub width_pct: f64,
}

impl From<Band> for BandSnapshot {
    fn from(b: Band) -> Self {
        Self { upper: b.upper, middle: b.middle, lower: b.lower, width_pct: b.width() * 100.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InstrumentSnapshot {
    pub symbol: String,
    pub price: f64,
    /// 24h quote volume.
    pub volume: f64,
    pub price_direction: PriceDirection,

    // Discovery (4h / 1h)
    pub macro_trend_score: f64,
    pub adx_4h: f64,
    pub rsi_4h: f64,
    pub rsi_1h: f64,

    // Real-time 15m
    pub is_in_squeeze_15m: bool,
    pub is_atr_falling_15m: bool,
    pub bollinger_bands_15m: Option<BandSnapshot>,
    pub atr_15m: Option<f64>,
    pub adx_15m: Option<f64>,
    pub atr_pct_15m: Option<f64>,
    pub last_volume_15m: Option<f64>,
    pub volume_20_period_avg_15m: Option<f64>,
    pub previous_15m_high: Option<f64>,

    // Real-time 1m
    pub last_volume_1m: Option<f64>,
    pub volume_20_period_avg_1m: Option<f64>,

    pub is_on_hotlist: bool,
    pub conditions: StrategyConditions,
    pub conditions_met_count: u8,
    pub score_value: f64,
    pub grade: SignalGrade,
}

impl InstrumentSnapshot {
    pub fn new(symbol: impl Into<String>, price: f64, volume: f64) -> Self {
        Self { symbol: symbol.into(), price, volume, ..Default::default() }
    }

    pub fn trend_is_favorable(&self) -> bool {
        self.macro_trend_score > FAVORABLE_TREND_SCORE
    }

    /// Applies a streamed 24h ticker. An unchanged price keeps the previous
    /// direction.
    pub fn apply_ticker(&mut self, price: f64, quote_volume: f64) {
        if price > self.price {
            self.price_direction = PriceDirection::Up;
        } else if price < self.price {
            self.price_direction = PriceDirection::Down;
        }
        self.price = price;
        self.volume = quote_volume;
    }

    /// Takes the discovery-owned fields from a fresh analysis, keeping every
    /// real-time field and the hotlist flag.
    pub fn merge_discovery(&mut self, fresh: &InstrumentSnapshot) {
        self.apply_ticker(fresh.price, fresh.volume);
        self.macro_trend_score = fresh.macro_trend_score;
        self.adx_4h = fresh.adx_4h;
        self.rsi_4h = fresh.rsi_4h;
        self.rsi_1h = fresh.rsi_1h;
    }

    /// Recomputes the five conditions, the 0-100 score and the grade.
    pub fn refresh_score(&mut self, settings: &Settings) {
        let volume = match (self.last_volume_1m, self.volume_20_period_avg_1m) {
            (Some(v), Some(avg)) => v > avg * VOLUME_SPIKE_MULTIPLE,
            _ => match (self.last_volume_15m, self.volume_20_period_avg_15m) {
                (Some(v), Some(avg)) => v > avg * VOLUME_SPIKE_MULTIPLE,
                _ => false,
            },
        };
        self.conditions = StrategyConditions {
            trend: self.trend_is_favorable(),
            squeeze: self.is_in_squeeze_15m,
            breakout: self.previous_15m_high.is_some_and(|h| self.price > h),
            volume,
            safety: self.rsi_1h < settings.rsi_overbought_threshold,
        };
        self.conditions_met_count = self.conditions.met();
        self.score_value = 20.0 * f64::from(self.conditions_met_count);
        self.grade = SignalGrade::from_conditions_met(self.conditions_met_count);
    }

    /// Clears the 1m-derived fields once the symbol leaves the hotlist.
    pub fn clear_1m(&mut self) {
        self.last_volume_1m = None;
        self.volume_20_period_avg_1m = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready() -> InstrumentSnapshot {
        InstrumentSnapshot {
            macro_trend_score: 72.0,
            rsi_1h: 55.0,
            is_in_squeeze_15m: true,
            previous_15m_high: Some(99.0),
            last_volume_15m: Some(400.0),
            volume_20_period_avg_15m: Some(100.0),
            ..InstrumentSnapshot::new("SOLUSDT", 100.0, 5e7)
        }
    }

    #[test]
    fn test_all_conditions_grade_strong_buy() {
        let mut s = ready();
        s.refresh_score(&Settings::default());
        assert_eq!(s.conditions_met_count, 5);
        assert_eq!(s.score_value, 100.0);
        assert_eq!(s.grade, SignalGrade::StrongBuy);
    }

    #[test]
    fn test_1m_volume_takes_precedence() {
        let mut s = ready();
        s.last_volume_1m = Some(10.0);
        s.volume_20_period_avg_1m = Some(10.0);
        s.rsi_1h = 80.0;
        s.refresh_score(&Settings::default());
        assert!(!s.conditions.volume);
        assert!(!s.conditions.safety);
        assert_eq!(s.grade, SignalGrade::Neutral);
    }

    #[test]
    fn test_merge_keeps_realtime_fields() {
        let mut s = ready();
        s.is_on_hotlist = true;
        let fresh = InstrumentSnapshot { macro_trend_score: 40.0, rsi_1h: 60.0, ..InstrumentSnapshot::new("SOLUSDT", 98.0, 6e7) };
        s.merge_discovery(&fresh);
        assert_eq!(s.macro_trend_score, 40.0);
        assert_eq!(s.price_direction, PriceDirection::Down);
        assert!(s.is_on_hotlist);
        assert!(s.is_in_squeeze_15m);
        assert_eq!(s.previous_15m_high, Some(99.0));
    }

    #[test]
    fn test_unchanged_price_keeps_direction() {
        let mut s = InstrumentSnapshot::new("X", 1.0, 0.0);
        s.apply_ticker(2.0, 0.0);
        s.apply_ticker(2.0, 0.0);
        assert_eq!(s.price_direction, PriceDirection::Up);
    }
}
