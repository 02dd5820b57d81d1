//! Market-wide circuit breaker keyed on a reference symbol's short-window move.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::candles::{window_change_pct, Candle};
use crate::settings::{after_hours, Settings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitStatus {
    #[default]
    Inactive,
    Alert,
    Active,
}

/// Maps a window change to a status. Thresholds are negative; boundaries are
/// inclusive.
pub fn classify(change_pct: f64, settings: &Settings) -> CircuitStatus {
    if change_pct <= settings.circuit_breaker_block_threshold_pct {
        CircuitStatus::Active
    } else if change_pct <= settings.circuit_breaker_alert_threshold_pct {
        CircuitStatus::Alert
    } else {
        CircuitStatus::Inactive
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerTransition {
    pub from: CircuitStatus,
    pub to: CircuitStatus,
    pub change_pct: f64,
}

#[derive(Debug, Clone, Default)]
pub struct CircuitBreaker {
    status: CircuitStatus,
    last_tripped: Option<DateTime<Utc>>,
    last_change_pct: Option<f64>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> CircuitStatus {
        self.status
    }

    pub fn last_change_pct(&self) -> Option<f64> {
        self.last_change_pct
    }

    /// Feeds the latest reference candles. A short window leaves the status
    /// unchanged. Returns the transition when the status moved.
    pub fn observe(&mut self, candles: &[Candle], settings: &Settings, now: DateTime<Utc>) -> Option<BreakerTransition> {
        let period = settings.circuit_breaker_period_minutes.max(1);
        if candles.len() < period {
            warn!(
                target: "circuit_breaker",
                got = candles.len(),
                want = period,
                "not enough reference candles, status unchanged"
            );
            return None;
        }
        let change_pct = window_change_pct(&candles[candles.len() - period..])?;
        self.last_change_pct = Some(change_pct);

        let to = classify(change_pct, settings);
        if to == self.status {
            return None;
        }
        let from = std::mem::replace(&mut self.status, to);
        if to == CircuitStatus::Active {
            self.last_tripped = Some(now);
        }
        info!(target: "circuit_breaker", ?from, ?to, change_pct, "status changed");
        Some(BreakerTransition { from, to, change_pct })
    }

    /// End of the post-trip cooldown, if one is running at `now`.
    pub fn cooldown_until(&self, settings: &Settings, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let tripped = self.last_tripped?;
        let until = after_hours(tripped, settings.circuit_breaker_cooldown_hours)?;
        (now < until).then_some(until)
    }

    /// Drops back to inactive, e.g. when the breaker is disabled in settings.
    pub fn reset(&mut self) -> Option<BreakerTransition> {
        if self.status == CircuitStatus::Inactive {
            return None;
        }
        let from = std::mem::replace(&mut self.status, CircuitStatus::Inactive);
        Some(BreakerTransition { from, to: CircuitStatus::Inactive, change_pct: self.last_change_pct.unwrap_or(0.0) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn window(start: f64, end: f64, n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let close = if i + 1 == n { end } else { start };
                Candle { open_time: i as u64 * 60_000, open: start, high: start, low: close, close, volume: 1.0 }
            })
            .collect()
    }

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_classify_boundaries_inclusive() {
        let s = Settings::default();
        assert_eq!(classify(-2.5, &s), CircuitStatus::Active);
        assert_eq!(classify(-1.5, &s), CircuitStatus::Alert);
        assert_eq!(classify(-1.49, &s), CircuitStatus::Inactive);
    }

    #[test]
    fn test_trip_records_cooldown() {
        let s = Settings::default();
        let mut cb = CircuitBreaker::new();
        let t = cb.observe(&window(40_000.0, 39_000.0, 5), &s, t0()).unwrap();
        assert_eq!((t.from, t.to), (CircuitStatus::Inactive, CircuitStatus::Active));
        assert_eq!(t.change_pct, -2.5);
        assert!(cb.cooldown_until(&s, t0() + Duration::minutes(59)).is_some());
        assert!(cb.cooldown_until(&s, t0() + Duration::minutes(61)).is_none());

        let huge = Settings { circuit_breaker_cooldown_hours: 1e300, ..Settings::default() };
        assert!(cb.cooldown_until(&huge, t0()).is_none());

        // Same status again is not a transition.
        assert!(cb.observe(&window(40_000.0, 39_000.0, 5), &s, t0()).is_none());
        let t = cb.observe(&window(40_000.0, 40_100.0, 5), &s, t0()).unwrap();
        assert_eq!(t.to, CircuitStatus::Inactive);
    }

    #[test]
    fn test_short_window_keeps_status() {
        let s = Settings::default();
        let mut cb = CircuitBreaker::new();
        assert!(cb.observe(&window(40_000.0, 30_000.0, 4), &s, t0()).is_none());
        assert_eq!(cb.status(), CircuitStatus::Inactive);
        assert!(cb.last_change_pct().is_none());
    }
}
