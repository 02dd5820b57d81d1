use serde::{Deserialize, Serialize};

use crate::settings::Settings;

/// Named exit parameter presets. `Custom` takes every value from settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeProfile {
    Custom,
    Sniper,
    Scalper,
    VolatilityHunter,
}

impl TradeProfile {
    /// Accepts the canonical names as well as the display names older
    /// settings documents stored.
    pub fn from_legacy_name(name: &str) -> Option<Self> {
        match name.trim() {
            "CUSTOM" | "PERSONNALISE" => Some(TradeProfile::Custom),
            "SNIPER" | "Le Sniper" => Some(TradeProfile::Sniper),
            "SCALPER" | "Le Scalpeur" => Some(TradeProfile::Scalper),
            "VOLATILITY_HUNTER" | "Le Chasseur de Volatilité" => Some(TradeProfile::VolatilityHunter),
            _ => None,
        }
    }

    /// Exit parameters for this profile. Position size and filters always
    /// come from settings.
    pub fn exit_plan(&self, settings: &Settings) -> ExitPlan {
        match self {
            TradeProfile::Custom => ExitPlan {
                sl_atr_multiplier: settings.sl_atr_multiplier,
                tp_atr_multiplier: settings.tp_atr_multiplier,
                use_trailing_stop: settings.use_trailing_stop_loss,
                trailing_atr_multiplier: settings.trailing_stop_atr_multiplier,
                use_adaptive_trailing: settings.use_adaptive_trailing_stop,
                tighten_multiplier: settings.adaptive_trailing_stop_tighten_multiplier,
            },
            TradeProfile::Sniper => ExitPlan {
                sl_atr_multiplier: 1.5,
                tp_atr_multiplier: 4.0,
                use_trailing_stop: true,
                trailing_atr_multiplier: 2.0,
                use_adaptive_trailing: true,
                tighten_multiplier: 1.2,
            },
            TradeProfile::Scalper => ExitPlan {
                sl_atr_multiplier: 1.2,
                tp_atr_multiplier: 1.5,
                use_trailing_stop: false,
                trailing_atr_multiplier: settings.trailing_stop_atr_multiplier,
                use_adaptive_trailing: false,
                tighten_multiplier: settings.adaptive_trailing_stop_tighten_multiplier,
            },
            TradeProfile::VolatilityHunter => ExitPlan {
                sl_atr_multiplier: 2.5,
                tp_atr_multiplier: 6.0,
                use_trailing_stop: true,
                trailing_atr_multiplier: 1.2,
                use_adaptive_trailing: true,
                tighten_multiplier: 1.0,
            },
        }
    }
}

/// Stop/target/trailing multipliers, frozen on the position at entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExitPlan {
    pub sl_atr_multiplier: f64,
    pub tp_atr_multiplier: f64,
    pub use_trailing_stop: bool,
    pub trailing_atr_multiplier: f64,
    pub use_adaptive_trailing: bool,
    pub tighten_multiplier: f64,
}

/// Picks the profile from the 15m regime: ranging markets scalp, volatile
/// markets widen out, everything else snipes. Missing indicators fall through
/// to `Sniper`.
pub fn select_profile(settings: &Settings, adx_15m: Option<f64>, atr_pct_15m: Option<f64>) -> TradeProfile {
    if !settings.use_dynamic_profile_selector {
        return TradeProfile::Custom;
    }
    match (adx_15m, atr_pct_15m) {
        (Some(adx), _) if adx < settings.adx_threshold_range => TradeProfile::Scalper,
        (_, Some(atr_pct)) if atr_pct > settings.atr_pct_threshold_volatile => TradeProfile::VolatilityHunter,
        _ => TradeProfile::Sniper,
    }
}
