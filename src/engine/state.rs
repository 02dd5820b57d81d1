use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::analyzer::RealtimeAnalyzer;
use crate::breaker::CircuitBreaker;
use crate::dashboard::{BotStatus, PositionView};
use crate::settings::Settings;
use crate::snapshot::InstrumentSnapshot;
use crate::storage::RuntimeState;
use crate::subscriptions::SubscriptionManager;
use crate::trading::TradingEngine;

/// Symbols listed in the status `top_pairs` field.
const TOP_PAIRS: usize = 15;

/// All mutable bot state. Owned by exactly one coordinator task.
#[derive(Debug)]
pub struct BotState {
    pub(super) settings: Settings,
    /// Monitored instruments in discovery order (24h volume, largest first).
    pub(super) scanner: Vec<InstrumentSnapshot>,
    pub(super) hotlist: BTreeSet<String>,
    pub(super) analyzer: RealtimeAnalyzer,
    pub(super) engine: TradingEngine,
    pub(super) breaker: CircuitBreaker,
    pub(super) subs: SubscriptionManager,
    pub(super) discovery_in_flight: bool,
    pub(super) last_discovery: Option<DateTime<Utc>>,
    pub(super) breaker_in_flight: bool,
}

impl BotState {
    pub fn new(settings: Settings, runtime: RuntimeState) -> Self {
        let engine = TradingEngine::restore(
            runtime.balance,
            runtime.active_positions,
            runtime.trade_history,
            runtime.trade_id_counter,
            runtime.is_running,
            runtime.trading_mode,
        );
        Self {
            settings,
            scanner: Vec::new(),
            hotlist: BTreeSet::new(),
            analyzer: RealtimeAnalyzer::new(),
            engine,
            breaker: CircuitBreaker::new(),
            subs: SubscriptionManager::new(),
            discovery_in_flight: false,
            last_discovery: None,
            breaker_in_flight: false,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn scanner(&self) -> &[InstrumentSnapshot] {
        &self.scanner
    }

    pub fn snapshot(&self, symbol: &str) -> Option<&InstrumentSnapshot> {
        self.scanner.iter().find(|s| s.symbol == symbol)
    }

    pub fn is_monitored(&self, symbol: &str) -> bool {
        self.snapshot(symbol).is_some()
    }

    pub fn hotlist(&self) -> &BTreeSet<String> {
        &self.hotlist
    }

    pub fn analyzer(&self) -> &RealtimeAnalyzer {
        &self.analyzer
    }

    pub fn engine(&self) -> &TradingEngine {
        &self.engine
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subs
    }

    pub fn last_discovery(&self) -> Option<DateTime<Utc>> {
        self.last_discovery
    }

    /// The persisted part of the state.
    pub fn runtime_state(&self) -> RuntimeState {
        RuntimeState {
            balance: self.engine.balance(),
            active_positions: self.engine.positions().to_vec(),
            trade_history: self.engine.history().to_vec(),
            trade_id_counter: self.engine.next_id(),
            is_running: self.engine.is_running(),
            trading_mode: self.engine.mode(),
        }
    }

    pub fn status(&self) -> BotStatus {
        BotStatus {
            is_running: self.engine.is_running(),
            trading_mode: self.engine.mode(),
            circuit_breaker_status: self.breaker.status(),
            circuit_breaker_change_pct: self.breaker.last_change_pct(),
            balance: self.engine.balance(),
            open_positions: self.engine.positions().len(),
            max_open_positions: self.settings.max_open_positions,
            monitored_pairs: self.scanner.len(),
            top_pairs: self.scanner.iter().take(TOP_PAIRS).map(|s| s.symbol.clone()).collect(),
            hotlist: self.hotlist.iter().cloned().collect(),
        }
    }

    pub fn position_views(&self) -> Vec<PositionView> {
        self.engine
            .positions()
            .iter()
            .map(|p| PositionView::new(p.clone(), self.engine.last_price(&p.symbol)))
            .collect()
    }
}
