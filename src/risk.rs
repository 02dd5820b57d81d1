use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::analyzer::Trigger;
use crate::breaker::{CircuitBreaker, CircuitStatus};
use crate::settings::Settings;
use crate::snapshot::SignalGrade;

/// Why an entry signal did not become a position.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EntryRejection {
    #[error("engine is stopped")]
    Stopped,

    #[error("circuit breaker is active")]
    BreakerActive,

    #[error("circuit breaker cooldown until {0}")]
    BreakerCooldown(DateTime<Utc>),

    #[error("{symbol} is in loss cooldown until {until}")]
    LossCooldown { symbol: String, until: DateTime<Utc> },

    #[error("max open positions reached ({0})")]
    MaxPositions(usize),

    #[error("position already open for {0}")]
    AlreadyOpen(String),

    #[error("grade {0:?} is not STRONG_BUY")]
    NotStrongBuy(SignalGrade),

    #[error("1h RSI {rsi:.1} at or above {threshold:.1}")]
    RsiOverbought { rsi: f64, threshold: f64 },

    #[error("parabolic move {change_pct:.2}% over {threshold:.2}%")]
    Parabolic { change_pct: f64, threshold: f64 },

    #[error("missing {0}")]
    MissingMarketData(&'static str),

    #[error("stop {stop} is not below entry {entry}")]
    InvalidStop { stop: f64, entry: f64 },

    #[error("insufficient balance: need {needed:.2}, have {available:.2}")]
    InsufficientBalance { needed: f64, available: f64 },
}

impl EntryRejection {
    /// Rejections that point at a defect rather than a market condition.
    pub fn is_error(&self) -> bool {
        matches!(self, EntryRejection::InvalidStop { .. } | EntryRejection::MissingMarketData(_))
    }
}

/// Engine-side facts the screen needs besides the trigger itself.
pub struct EntryContext<'a> {
    pub running: bool,
    pub breaker: &'a CircuitBreaker,
    pub loss_cooldown_until: Option<DateTime<Utc>>,
    pub open_positions: usize,
    pub already_open: bool,
    pub now: DateTime<Utc>,
}

/// Runs the pre-trade checks in order; the first failing one wins.
pub fn screen_entry(ctx: &EntryContext<'_>, trigger: &Trigger, settings: &Settings) -> Result<(), EntryRejection> {
    if !ctx.running {
        return Err(EntryRejection::Stopped);
    }
    if settings.use_circuit_breaker {
        if ctx.breaker.status() == CircuitStatus::Active {
            return Err(EntryRejection::BreakerActive);
        }
        if let Some(until) = ctx.breaker.cooldown_until(settings, ctx.now) {
            return Err(EntryRejection::BreakerCooldown(until));
        }
    }
    if let Some(until) = ctx.loss_cooldown_until.filter(|u| ctx.now < *u) {
        return Err(EntryRejection::LossCooldown { symbol: trigger.symbol.clone(), until });
    }
    if ctx.open_positions >= settings.max_open_positions {
        return Err(EntryRejection::MaxPositions(settings.max_open_positions));
    }
    if ctx.already_open {
        return Err(EntryRejection::AlreadyOpen(trigger.symbol.clone()));
    }
    if settings.require_strong_buy && trigger.snapshot.grade != SignalGrade::StrongBuy {
        return Err(EntryRejection::NotStrongBuy(trigger.snapshot.grade));
    }
    if settings.use_rsi_safety_filter && trigger.snapshot.rsi_1h >= settings.rsi_overbought_threshold {
        return Err(EntryRejection::RsiOverbought {
            rsi: trigger.snapshot.rsi_1h,
            threshold: settings.rsi_overbought_threshold,
        });
    }
    if settings.use_parabolic_filter {
        if let Some(change_pct) = trigger.short_change_pct {
            if change_pct > settings.parabolic_filter_threshold_pct {
                return Err(EntryRejection::Parabolic { change_pct, threshold: settings.parabolic_filter_threshold_pct });
            }
        }
    }
    if trigger.price.is_nan() || trigger.price <= 0.0 {
        return Err(EntryRejection::MissingMarketData("price"));
    }
    if !trigger.snapshot.atr_15m.is_some_and(|a| a > 0.0) {
        return Err(EntryRejection::MissingMarketData("15m ATR"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::InstrumentSnapshot;
    use crate::trading::profile::TradeProfile;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn trigger() -> Trigger {
        Trigger {
            symbol: "SOLUSDT".into(),
            price: 100.0,
            snapshot: InstrumentSnapshot { rsi_1h: 55.0, atr_15m: Some(2.0), ..InstrumentSnapshot::new("SOLUSDT", 100.0, 1e8) },
            profile: TradeProfile::Sniper,
            aggressive: false,
            structure_broken: true,
            short_change_pct: Some(1.0),
        }
    }

    fn ctx(breaker: &CircuitBreaker) -> EntryContext<'_> {
        EntryContext { running: true, breaker, loss_cooldown_until: None, open_positions: 0, already_open: false, now: now() }
    }

    #[test]
    fn test_clean_signal_passes() {
        let cb = CircuitBreaker::new();
        assert_eq!(screen_entry(&ctx(&cb), &trigger(), &Settings::default()), Ok(()));
    }

    #[test]
    fn test_check_order() {
        let cb = CircuitBreaker::new();
        let s = Settings::default();
        let c = EntryContext { running: false, open_positions: 99, ..ctx(&cb) };
        assert_eq!(screen_entry(&c, &trigger(), &s), Err(EntryRejection::Stopped));

        let c = EntryContext { open_positions: 5, already_open: true, ..ctx(&cb) };
        assert_eq!(screen_entry(&c, &trigger(), &s), Err(EntryRejection::MaxPositions(5)));

        let c = EntryContext { already_open: true, ..ctx(&cb) };
        assert!(matches!(screen_entry(&c, &trigger(), &s), Err(EntryRejection::AlreadyOpen(_))));
    }

    #[test]
    fn test_loss_cooldown_expires() {
        let cb = CircuitBreaker::new();
        let s = Settings::default();
        let c = EntryContext { loss_cooldown_until: Some(now() + Duration::hours(1)), ..ctx(&cb) };
        assert!(matches!(screen_entry(&c, &trigger(), &s), Err(EntryRejection::LossCooldown { .. })));
        let c = EntryContext { loss_cooldown_until: Some(now() - Duration::seconds(1)), ..ctx(&cb) };
        assert!(screen_entry(&c, &trigger(), &s).is_ok());
    }

    #[test]
    fn test_filters() {
        let cb = CircuitBreaker::new();
        let mut t = trigger();
        t.snapshot.rsi_1h = 75.0;
        assert!(matches!(screen_entry(&ctx(&cb), &t, &Settings::default()), Err(EntryRejection::RsiOverbought { .. })));
        let off = Settings { use_rsi_safety_filter: false, ..Settings::default() };
        assert!(screen_entry(&ctx(&cb), &t, &off).is_ok());

        let mut t = trigger();
        t.short_change_pct = Some(3.0);
        assert!(matches!(screen_entry(&ctx(&cb), &t, &Settings::default()), Err(EntryRejection::Parabolic { .. })));

        let strict = Settings { require_strong_buy: true, ..Settings::default() };
        assert!(matches!(screen_entry(&ctx(&cb), &trigger(), &strict), Err(EntryRejection::NotStrongBuy(_))));

        let mut t = trigger();
        t.snapshot.atr_15m = None;
        let err = screen_entry(&ctx(&cb), &t, &Settings::default()).unwrap_err();
        assert!(err.is_error());
    }
}
