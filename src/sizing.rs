//! Position sizing: percentage of balance, adjusted for grade and breaker state.

use crate::breaker::CircuitStatus;
use crate::settings::Settings;
use crate::snapshot::SignalGrade;

/// Percentage of the current balance to commit to a new position.
pub fn position_size_pct(settings: &Settings, grade: SignalGrade, breaker: CircuitStatus) -> f64 {
    let mut pct = if settings.use_dynamic_position_sizing && grade == SignalGrade::StrongBuy {
        settings.strong_buy_position_size_pct
    } else {
        settings.position_size_pct
    };
    if breaker == CircuitStatus::Alert {
        pct *= settings.circuit_breaker_alert_position_size_multiplier;
    }
    pct
}

/// Notional to spend, in quote currency.
pub fn notional(balance: f64, pct: f64) -> f64 {
    (balance * pct / 100.0).max(0.0)
}

/// Base-asset quantity for a notional at `price`.
pub fn quantity(notional: f64, price: f64) -> f64 {
    if price <= 0.0 {
        return 0.0;
    }
    notional / price
}

/// Price after adverse slippage on a buy.
pub fn slipped_entry(price: f64, slippage_pct: f64) -> f64 {
    price * (1.0 + slippage_pct / 100.0)
}
