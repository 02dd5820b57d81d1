//! Strategy and risk parameters persisted in the `settings` document.
//!
//! Keys are SCREAMING_SNAKE_CASE to stay compatible with documents written by
//! earlier versions of the bot. Loading goes through [`Settings::from_document`],
//! which migrates the handful of known legacy keys and then rejects anything
//! it does not recognise.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SettingsError;
use crate::trading::profile::TradeProfile;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default, deny_unknown_fields)]
pub struct Settings {
    // Account
    pub initial_virtual_balance: f64,
    pub max_open_positions: usize,
    pub position_size_pct: f64,
    pub slippage_pct: f64,
    pub transaction_fee_pct: f64,

    // ATR based exits
    pub sl_atr_multiplier: f64,
    pub tp_atr_multiplier: f64,
    pub use_trailing_stop_loss: bool,
    pub trailing_stop_atr_multiplier: f64,
    pub use_adaptive_trailing_stop: bool,
    pub adaptive_trailing_stop_tighten_multiplier: f64,

    // Position management
    pub use_partial_take_profit: bool,
    pub partial_tp_trigger_pct: f64,
    pub partial_tp_sell_qty_pct: f64,
    pub use_auto_breakeven: bool,
    pub breakeven_trigger_pct: f64,
    pub adjust_breakeven_for_fees: bool,

    // Discovery
    pub quote_asset: String,
    pub min_volume_usd: f64,
    pub scanner_discovery_interval_seconds: u64,
    pub excluded_pairs: Vec<String>,

    // Entry filters
    pub use_volume_confirmation: bool,
    pub use_rsi_safety_filter: bool,
    pub rsi_overbought_threshold: f64,
    pub use_parabolic_filter: bool,
    pub parabolic_filter_period_minutes: usize,
    pub parabolic_filter_threshold_pct: f64,
    pub loss_cooldown_hours: f64,
    pub require_strong_buy: bool,
    pub aggressive_entry_profiles: Vec<TradeProfile>,

    // Sizing
    pub use_dynamic_position_sizing: bool,
    pub strong_buy_position_size_pct: f64,

    // Profile selection
    pub use_dynamic_profile_selector: bool,
    pub adx_threshold_range: f64,
    pub atr_pct_threshold_volatile: f64,

    // Circuit breaker
    pub use_circuit_breaker: bool,
    pub circuit_breaker_symbol: String,
    pub circuit_breaker_period_minutes: usize,
    pub circuit_breaker_alert_threshold_pct: f64,
    pub circuit_breaker_block_threshold_pct: f64,
    pub circuit_breaker_alert_position_size_multiplier: f64,
    pub circuit_breaker_cooldown_hours: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            initial_virtual_balance: 10_000.0,
            max_open_positions: 5,
            position_size_pct: 2.0,
            slippage_pct: 0.05,
            transaction_fee_pct: 0.1,

            sl_atr_multiplier: 1.5,
            tp_atr_multiplier: 3.0,
            use_trailing_stop_loss: true,
            trailing_stop_atr_multiplier: 2.0,
            use_adaptive_trailing_stop: true,
            adaptive_trailing_stop_tighten_multiplier: 1.2,

            use_partial_take_profit: false,
            partial_tp_trigger_pct: 0.8,
            partial_tp_sell_qty_pct: 50.0,
            use_auto_breakeven: true,
            breakeven_trigger_pct: 0.5,
            adjust_breakeven_for_fees: true,

            quote_asset: "USDT".to_string(),
            min_volume_usd: 10_000_000.0,
            scanner_discovery_interval_seconds: 3600,
            excluded_pairs: vec!["USDCUSDT".to_string(), "FDUSDUSDT".to_string()],

            use_volume_confirmation: true,
            use_rsi_safety_filter: true,
            rsi_overbought_threshold: 75.0,
            use_parabolic_filter: true,
            parabolic_filter_period_minutes: 5,
            parabolic_filter_threshold_pct: 2.5,
            loss_cooldown_hours: 4.0,
            require_strong_buy: false,
            aggressive_entry_profiles: vec![TradeProfile::VolatilityHunter],

            use_dynamic_position_sizing: false,
            strong_buy_position_size_pct: 3.0,

            use_dynamic_profile_selector: true,
            adx_threshold_range: 20.0,
            atr_pct_threshold_volatile: 5.0,

            use_circuit_breaker: true,
            circuit_breaker_symbol: "BTCUSDT".to_string(),
            circuit_breaker_period_minutes: 5,
            circuit_breaker_alert_threshold_pct: -1.5,
            circuit_breaker_block_threshold_pct: -2.5,
            circuit_breaker_alert_position_size_multiplier: 0.5,
            circuit_breaker_cooldown_hours: 1.0,
        }
    }
}

const MAX_DISCOVERY_INTERVAL_SECS: u64 = 86_400;
const MAX_COOLDOWN_HOURS: f64 = 168.0;
const MAX_PERIOD_MINUTES: usize = 1_440;

/// Keys older documents may carry that no longer map to a setting.
const DROPPED_KEYS: &[&str] = &["USE_MARKET_REGIME_FILTER", "BINANCE_API_KEY", "BINANCE_SECRET_KEY"];

impl Settings {
    /// Parses a stored document, migrating legacy keys. Returns the settings and
    /// a human readable note for every migration applied.
    pub fn from_document(doc: Value) -> Result<(Settings, Vec<String>), SettingsError> {
        let Value::Object(mut map) = doc else {
            return Err(SettingsError::NotAnObject);
        };
        let notes = migrate(&mut map);
        let settings: Settings = serde_json::from_value(Value::Object(map))?;
        settings.check_ranges()?;
        Ok((settings, notes))
    }

    /// Rejects values that cannot be turned into a schedule or a cooldown.
    fn check_ranges(&self) -> Result<(), SettingsError> {
        fn out_of_range(key: &'static str, value: impl ToString) -> SettingsError {
            SettingsError::OutOfRange { key, value: value.to_string() }
        }
        let interval = self.scanner_discovery_interval_seconds;
        if !(1..=MAX_DISCOVERY_INTERVAL_SECS).contains(&interval) {
            return Err(out_of_range("SCANNER_DISCOVERY_INTERVAL_SECONDS", interval));
        }
        for (key, hours) in [
            ("LOSS_COOLDOWN_HOURS", self.loss_cooldown_hours),
            ("CIRCUIT_BREAKER_COOLDOWN_HOURS", self.circuit_breaker_cooldown_hours),
        ] {
            if !(0.0..=MAX_COOLDOWN_HOURS).contains(&hours) {
                return Err(out_of_range(key, hours));
            }
        }
        for (key, minutes) in [
            ("CIRCUIT_BREAKER_PERIOD_MINUTES", self.circuit_breaker_period_minutes),
            ("PARABOLIC_FILTER_PERIOD_MINUTES", self.parabolic_filter_period_minutes),
        ] {
            if !(1..=MAX_PERIOD_MINUTES).contains(&minutes) {
                return Err(out_of_range(key, minutes));
            }
        }
        Ok(())
    }

    /// Overlays `patch` on the current values (top-level keys only) and validates
    /// the result as a whole.
    pub fn merged_with(&self, patch: Value) -> Result<(Settings, Vec<String>), SettingsError> {
        let Value::Object(patch) = patch else {
            return Err(SettingsError::NotAnObject);
        };
        let mut base = match serde_json::to_value(self)? {
            Value::Object(map) => map,
            _ => return Err(SettingsError::NotAnObject),
        };
        for (k, v) in patch {
            base.insert(k, v);
        }
        Settings::from_document(Value::Object(base))
    }

    pub fn to_document(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn discovery_interval(&self) -> Option<TimeDelta> {
        TimeDelta::try_seconds(i64::try_from(self.scanner_discovery_interval_seconds).ok()?)
    }
}

/// `at` plus a fractional number of hours, or `None` when either the span or
/// the sum is not representable.
pub fn after_hours(at: DateTime<Utc>, hours: f64) -> Option<DateTime<Utc>> {
    if !hours.is_finite() {
        return None;
    }
    let span = TimeDelta::try_milliseconds((hours * 3_600_000.0) as i64)?;
    at.checked_add_signed(span)
}

fn migrate(map: &mut Map<String, Value>) -> Vec<String> {
    let mut notes = Vec::new();

    if let Some(v) = map.remove("CIRCUIT_BREAKER_THRESHOLD_PCT") {
        if !map.contains_key("CIRCUIT_BREAKER_BLOCK_THRESHOLD_PCT") {
            map.insert("CIRCUIT_BREAKER_BLOCK_THRESHOLD_PCT".to_string(), v);
            notes.push("CIRCUIT_BREAKER_THRESHOLD_PCT renamed to CIRCUIT_BREAKER_BLOCK_THRESHOLD_PCT".to_string());
        } else {
            notes.push("CIRCUIT_BREAKER_THRESHOLD_PCT dropped (block threshold already set)".to_string());
        }
    }

    for key in DROPPED_KEYS {
        if map.remove(*key).is_some() {
            notes.push(format!("{key} dropped"));
        }
    }

    if let Some(Value::String(csv)) = map.get("EXCLUDED_PAIRS").cloned() {
        let list: Vec<Value> = split_csv(&csv).map(|s| Value::String(s.to_string())).collect();
        map.insert("EXCLUDED_PAIRS".to_string(), Value::Array(list));
        notes.push("EXCLUDED_PAIRS converted from comma separated string".to_string());
    }

    if let Some(Value::String(csv)) = map.get("AGGRESSIVE_ENTRY_PROFILES").cloned() {
        let mut list = Vec::new();
        for name in split_csv(&csv) {
            match TradeProfile::from_legacy_name(name) {
                Some(p) => list.push(serde_json::to_value(p).unwrap_or(Value::Null)),
                None => notes.push(format!("unknown aggressive profile {name:?} dropped")),
            }
        }
        map.insert("AGGRESSIVE_ENTRY_PROFILES".to_string(), Value::Array(list));
        notes.push("AGGRESSIVE_ENTRY_PROFILES converted from comma separated string".to_string());
    }

    notes
}

fn split_csv(csv: &str) -> impl Iterator<Item = &str> {
    csv.split(',').map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_document_yields_defaults() {
        let (s, notes) = Settings::from_document(json!({})).unwrap();
        assert_eq!(s, Settings::default());
        assert!(notes.is_empty());
    }

    #[test]
    fn test_default_document_round_trips() {
        let doc = Settings::default().to_document();
        let (s, _) = Settings::from_document(doc).unwrap();
        assert_eq!(s, Settings::default());
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = Settings::from_document(json!({ "MAX_OPEN_POSITIONS": 3, "TYPO_KEY": 1 }));
        assert!(err.is_err());
    }

    #[test]
    fn test_legacy_document_migrates() {
        let doc = json!({
            "CIRCUIT_BREAKER_THRESHOLD_PCT": -3.0,
            "USE_MARKET_REGIME_FILTER": true,
            "BINANCE_API_KEY": "",
            "EXCLUDED_PAIRS": "USDCUSDT, FDUSDUSDT,",
            "AGGRESSIVE_ENTRY_PROFILES": "Le Chasseur de Volatilité,Le Sniper,Unknown"
        });
        let (s, notes) = Settings::from_document(doc).unwrap();
        assert_eq!(s.circuit_breaker_block_threshold_pct, -3.0);
        assert_eq!(s.excluded_pairs, vec!["USDCUSDT", "FDUSDUSDT"]);
        assert_eq!(
            s.aggressive_entry_profiles,
            vec![TradeProfile::VolatilityHunter, TradeProfile::Sniper]
        );
        assert!(notes.iter().any(|n| n.contains("Unknown")));
        assert!(notes.iter().any(|n| n.contains("USE_MARKET_REGIME_FILTER")));
    }

    #[test]
    fn test_merge_patch_validates() {
        let base = Settings::default();
        let (s, _) = base.merged_with(json!({ "MAX_OPEN_POSITIONS": 9 })).unwrap();
        assert_eq!(s.max_open_positions, 9);
        assert_eq!(s.position_size_pct, base.position_size_pct);

        assert!(base.merged_with(json!({ "MAX_OPEN_POSITIONS": "many" })).is_err());
        assert!(base.merged_with(json!([1, 2])).is_err());
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        let base = Settings::default();
        for patch in [
            json!({ "SCANNER_DISCOVERY_INTERVAL_SECONDS": 10_000_000_000_000_000u64 }),
            json!({ "SCANNER_DISCOVERY_INTERVAL_SECONDS": 0 }),
            json!({ "LOSS_COOLDOWN_HOURS": 1e10 }),
            json!({ "LOSS_COOLDOWN_HOURS": -1.0 }),
            json!({ "CIRCUIT_BREAKER_COOLDOWN_HOURS": 169.0 }),
            json!({ "CIRCUIT_BREAKER_PERIOD_MINUTES": 0 }),
        ] {
            let err = base.merged_with(patch.clone()).unwrap_err();
            assert!(matches!(err, SettingsError::OutOfRange { .. }), "{patch}: {err}");
        }
        let (s, _) = base
            .merged_with(json!({ "SCANNER_DISCOVERY_INTERVAL_SECONDS": 86_400, "LOSS_COOLDOWN_HOURS": 168.0 }))
            .unwrap();
        assert_eq!(s.discovery_interval(), Some(TimeDelta::days(1)));
    }

    #[test]
    fn test_after_hours_never_overflows() {
        let at = DateTime::<Utc>::MAX_UTC;
        assert_eq!(after_hours(at, 1.0), None);
        assert_eq!(after_hours(at, f64::NAN), None);
        let t = DateTime::<Utc>::UNIX_EPOCH;
        assert_eq!(after_hours(t, 1.5), Some(t + TimeDelta::minutes(90)));
        assert!(after_hours(t, 1e300).is_none());
    }
}
