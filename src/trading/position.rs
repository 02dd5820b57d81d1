use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::snapshot::InstrumentSnapshot;
use crate::trading::profile::{ExitPlan, TradeProfile};

/// Execution mode label. Every mode fills against simulated prices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradingMode {
    #[default]
    Virtual,
    RealPaper,
    RealLive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeStatus {
    Pending,
    Filled,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    StopLoss,
    TakeProfit,
    Manual,
    CircuitBreaker,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: u64,
    pub mode: TradingMode,
    pub symbol: String,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    /// Remaining quantity; reduced by a partial take-profit.
    pub quantity: f64,
    pub initial_quantity: f64,
    pub stop_loss: f64,
    pub initial_stop_loss: f64,
    pub take_profit: f64,
    pub highest_price_since_entry: f64,
    pub status: TradeStatus,
    pub entry_snapshot: InstrumentSnapshot,
    pub profile: TradeProfile,
    pub exit_plan: ExitPlan,
    pub atr_at_entry: f64,
    pub initial_risk_per_unit: f64,
    pub trailing_multiplier: f64,
    pub trailing_tightened: bool,
    pub is_at_breakeven: bool,
    pub partial_tp_hit: bool,
    /// PnL already booked by partial exits.
    pub realized_pnl: f64,

    #[serde(default)]
    pub exit_price: Option<f64>,
    #[serde(default)]
    pub exit_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pnl: Option<f64>,
    #[serde(default)]
    pub pnl_pct: Option<f64>,
    #[serde(default)]
    pub close_reason: Option<CloseReason>,
}

impl Position {
    /// Mark-to-market PnL of the remaining quantity plus what partial exits
    /// already booked.
    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        self.realized_pnl + (price - self.entry_price) * self.quantity
    }

    /// Raises the stop. Never lowers it.
    pub(crate) fn raise_stop(&mut self, candidate: f64) -> bool {
        if candidate > self.stop_loss {
            self.stop_loss = candidate;
            true
        } else {
            false
        }
    }
}
