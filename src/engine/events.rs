//! Everything that flows into and out of the coordinator.

use serde_json::Value;

use crate::candles::{Candle, Timeframe};
use crate::dashboard::PushEvent;
use crate::discovery::DiscoveryFilter;
use crate::error::{ControlError, MarketDataError};
use crate::feed::MarketEvent;
use crate::snapshot::InstrumentSnapshot;
use crate::storage::Document;
use crate::subscriptions::SubscriptionPlan;
use crate::trading::TradingMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Discovery,
    Monitor,
    Breaker,
}

/// Inputs to [`BotState::handle_event`](super::BotState::handle_event).
#[derive(Debug)]
pub enum Event {
    Timer(TimerKind),
    Market(MarketEvent),
    DiscoveryFinished(Result<Vec<InstrumentSnapshot>, MarketDataError>),
    Hydrated {
        symbol: String,
        timeframe: Timeframe,
        result: Result<Vec<Candle>, MarketDataError>,
    },
    BreakerCandles(Result<Vec<Candle>, MarketDataError>),
}

impl From<MarketEvent> for Event {
    fn from(ev: MarketEvent) -> Self {
        Event::Market(ev)
    }
}

/// Side effects requested by the state machine. The coordinator executes
/// them; none of them feed back synchronously.
#[derive(Debug, Clone)]
pub enum Command {
    RunDiscovery(DiscoveryFilter),
    Hydrate { symbol: String, timeframe: Timeframe, limit: usize },
    FetchBreakerCandles { symbol: String, limit: usize },
    Feed(SubscriptionPlan),
    Persist(Document),
    Push(PushEvent),
}

/// Dashboard requests. Wire names are the SCREAMING_SNAKE_CASE `type` of the
/// client message.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlRequest {
    GetFullScannerList,
    GetStatus,
    StartBot,
    StopBot,
    SetMode(TradingMode),
    UpdateSettings(Value),
    CloseTrade(u64),
    ClearData,
    GetSettings,
    GetPositions,
    GetHistory,
    GetPerformanceStats,
}

impl ControlRequest {
    pub fn name(&self) -> &'static str {
        match self {
            ControlRequest::GetFullScannerList => "GET_FULL_SCANNER_LIST",
            ControlRequest::GetStatus => "GET_STATUS",
            ControlRequest::StartBot => "START_BOT",
            ControlRequest::StopBot => "STOP_BOT",
            ControlRequest::SetMode(_) => "SET_MODE",
            ControlRequest::UpdateSettings(_) => "UPDATE_SETTINGS",
            ControlRequest::CloseTrade(_) => "CLOSE_TRADE",
            ControlRequest::ClearData => "CLEAR_DATA",
            ControlRequest::GetSettings => "GET_SETTINGS",
            ControlRequest::GetPositions => "GET_POSITIONS",
            ControlRequest::GetHistory => "GET_HISTORY",
            ControlRequest::GetPerformanceStats => "GET_PERFORMANCE_STATS",
        }
    }
}

pub type ControlReply = Result<Value, ControlError>;
