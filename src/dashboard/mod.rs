//! Dashboard push channel: typed events, the fan-out hub and the socket server.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::breaker::CircuitStatus;
use crate::snapshot::InstrumentSnapshot;
use crate::trading::{Position, TradingMode};

pub mod protocol;
pub mod server;

/// An open position with its mark-to-market view.
#[derive(Debug, Clone, Serialize)]
pub struct PositionView {
    #[serde(flatten)]
    pub position: Position,
    pub current_price: Option<f64>,
    pub unrealized_pnl: Option<f64>,
}

impl PositionView {
    pub fn new(position: Position, current_price: Option<f64>) -> Self {
        let unrealized_pnl = current_price.map(|p| position.unrealized_pnl(p));
        Self { position, current_price, unrealized_pnl }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BotStatus {
    pub is_running: bool,
    pub trading_mode: TradingMode,
    pub circuit_breaker_status: CircuitStatus,
    pub circuit_breaker_change_pct: Option<f64>,
    pub balance: f64,
    pub open_positions: usize,
    pub max_open_positions: usize,
    pub monitored_pairs: usize,
    pub top_pairs: Vec<String>,
    pub hotlist: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    /// Display category: `ERROR`, `WARN`, or the subsystem for info-level records.
    pub level: String,
    pub message: String,
}

/// Answer to one client request, sent only to the requesting socket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandResult {
    pub request: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Server-to-client message, framed as `{"type": ..., "payload": ...}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PushEvent {
    ScannerUpdate(InstrumentSnapshot),
    PositionsUpdated(Vec<PositionView>),
    PriceUpdate { symbol: String, price: f64 },
    LogEntry(LogEntry),
    BotStatusUpdate(BotStatus),
    FullScannerList(Vec<InstrumentSnapshot>),
    CommandResult(CommandResult),
}

impl PushEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            PushEvent::ScannerUpdate(_) => "SCANNER_UPDATE",
            PushEvent::PositionsUpdated(_) => "POSITIONS_UPDATED",
            PushEvent::PriceUpdate { .. } => "PRICE_UPDATE",
            PushEvent::LogEntry(_) => "LOG_ENTRY",
            PushEvent::BotStatusUpdate(_) => "BOT_STATUS_UPDATE",
            PushEvent::FullScannerList(_) => "FULL_SCANNER_LIST",
            PushEvent::CommandResult(_) => "COMMAND_RESULT",
        }
    }
}

/// Broadcast fan-out to every connected dashboard. Publishing with no
/// subscribers is not an error; slow subscribers lose the oldest events.
#[derive(Debug, Clone)]
pub struct PushHub {
    tx: broadcast::Sender<PushEvent>,
}

impl PushHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: PushEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
