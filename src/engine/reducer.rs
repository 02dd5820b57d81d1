//! State transitions: `(BotState, Event) -> Vec<Command>` and
//! `(BotState, ControlRequest) -> (ControlReply, Vec<Command>)`.
//!
//! Every handler runs to completion against `&mut BotState`, so a transition
//! is atomic with respect to every other event and request.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use super::events::{Command, ControlReply, ControlRequest, Event, TimerKind};
use super::state::BotState;
use crate::analyzer::{HotlistChange, Ingest};
use crate::breaker::CircuitStatus;
use crate::candles::{Candle, Timeframe};
use crate::dashboard::PushEvent;
use crate::discovery::DiscoveryFilter;
use crate::error::{ControlError, MarketDataError};
use crate::feed::MarketEvent;
use crate::risk::EntryRejection;
use crate::snapshot::InstrumentSnapshot;
use crate::storage::Document;
use crate::subscriptions::required_topics;
use crate::trading::{CloseReason, TradingMode};

fn to_json<T: Serialize + ?Sized>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

impl BotState {
    pub fn handle_event(&mut self, event: Event, now: DateTime<Utc>) -> Vec<Command> {
        let mut out = Vec::new();
        match event {
            Event::Timer(TimerKind::Discovery) => self.on_discovery_timer(now, &mut out),
            Event::Timer(TimerKind::Monitor) => self.on_monitor_timer(now, &mut out),
            Event::Timer(TimerKind::Breaker) => self.on_breaker_timer(&mut out),
            Event::DiscoveryFinished(result) => self.on_discovery(result, now, &mut out),
            Event::Market(MarketEvent::Ticker { symbol, price, quote_volume }) => {
                self.on_ticker(&symbol, price, quote_volume, &mut out)
            }
            Event::Market(MarketEvent::Kline { symbol, timeframe, candle }) => {
                self.on_kline(&symbol, timeframe, candle, now, &mut out)
            }
            Event::Hydrated { symbol, timeframe, result } => {
                self.on_hydrated(&symbol, timeframe, result, &mut out)
            }
            Event::BreakerCandles(result) => self.on_breaker_candles(result, now, &mut out),
        }
        out
    }

    pub fn handle_control(&mut self, request: ControlRequest, now: DateTime<Utc>) -> (ControlReply, Vec<Command>) {
        let mut out = Vec::new();
        let reply = match request {
            ControlRequest::GetFullScannerList => Ok(to_json(&self.scanner)),
            ControlRequest::GetStatus => Ok(to_json(&self.status())),
            ControlRequest::GetSettings => Ok(self.settings.to_document()),
            ControlRequest::GetPositions => Ok(to_json(&self.position_views())),
            ControlRequest::GetHistory => Ok(to_json(self.engine.history())),
            ControlRequest::GetPerformanceStats => Ok(to_json(&self.engine.performance())),
            ControlRequest::StartBot => Ok(self.set_running(true, &mut out)),
            ControlRequest::StopBot => Ok(self.set_running(false, &mut out)),
            ControlRequest::SetMode(mode) => Ok(self.set_mode(mode, &mut out)),
            ControlRequest::UpdateSettings(patch) => self.update_settings(patch, &mut out),
            ControlRequest::CloseTrade(id) => self.close_trade(id, now, &mut out),
            ControlRequest::ClearData => Ok(self.clear_data(&mut out)),
        };
        (reply, out)
    }

    // ---- timers -------------------------------------------------------

    fn on_discovery_timer(&mut self, now: DateTime<Utc>, out: &mut Vec<Command>) {
        // restored positions need their tickers even while discovery keeps failing
        self.reconcile(out);
        if self.discovery_in_flight {
            return;
        }
        let due = match (self.last_discovery, self.settings.discovery_interval()) {
            (None, _) => true,
            (Some(last), Some(interval)) => now - last >= interval,
            (Some(_), None) => false,
        };
        if due {
            self.discovery_in_flight = true;
            out.push(Command::RunDiscovery(DiscoveryFilter::from_settings(&self.settings)));
        }
    }

    fn on_monitor_timer(&mut self, now: DateTime<Utc>, out: &mut Vec<Command>) {
        let outcome = self.engine.monitor_positions(&self.settings, now);
        if outcome.changed {
            self.push_positions(out);
        }
        if !outcome.closed.is_empty() {
            self.reconcile(out);
        }
    }

    fn on_breaker_timer(&mut self, out: &mut Vec<Command>) {
        if !self.settings.use_circuit_breaker {
            if self.breaker.reset().is_some() {
                info!(target: "circuit_breaker", "breaker disabled, status reset");
                out.push(Command::Push(PushEvent::BotStatusUpdate(self.status())));
            }
            return;
        }
        if self.breaker_in_flight {
            return;
        }
        self.breaker_in_flight = true;
        out.push(Command::FetchBreakerCandles {
            symbol: self.settings.circuit_breaker_symbol.clone(),
            limit: self.settings.circuit_breaker_period_minutes.max(1),
        });
    }

    // ---- discovery ----------------------------------------------------

    fn on_discovery(
        &mut self,
        result: Result<Vec<InstrumentSnapshot>, MarketDataError>,
        now: DateTime<Utc>,
        out: &mut Vec<Command>,
    ) {
        self.discovery_in_flight = false;
        let fresh = match result {
            Ok(list) => list,
            Err(e) => {
                error!(target: "scanner", error = %e, "discovery cycle failed, keeping previous universe");
                self.reconcile(out);
                return;
            }
        };
        self.last_discovery = Some(now);

        let removed: Vec<String> = {
            let keep: HashSet<&str> = fresh.iter().map(|s| s.symbol.as_str()).collect();
            self.scanner
                .iter()
                .filter(|s| !keep.contains(s.symbol.as_str()))
                .map(|s| s.symbol.clone())
                .collect()
        };

        let mut previous = std::mem::take(&mut self.scanner);
        let mut next = Vec::with_capacity(fresh.len());
        let mut added = Vec::new();
        for f in fresh {
            let mut snap = match previous.iter().position(|p| p.symbol == f.symbol) {
                Some(i) => {
                    let mut existing = previous.swap_remove(i);
                    existing.merge_discovery(&f);
                    existing
                }
                None => {
                    added.push(f.symbol.clone());
                    f
                }
            };
            snap.refresh_score(&self.settings);
            next.push(snap);
        }
        self.scanner = next;

        for symbol in &removed {
            self.analyzer.forget(symbol);
            if self.hotlist.remove(symbol) {
                info!(target: "scanner", %symbol, "left the universe, removed from hotlist");
            }
        }
        for symbol in added {
            if self.analyzer.begin_hydration(&symbol, Timeframe::M15) {
                out.push(Command::Hydrate { symbol, timeframe: Timeframe::M15, limit: Timeframe::M15.hydration_limit() });
            }
        }
        info!(
            target: "scanner",
            monitored = self.scanner.len(),
            removed = removed.len(),
            "discovery cycle complete"
        );
        self.reconcile(out);
        out.push(Command::Push(PushEvent::FullScannerList(self.scanner.clone())));
    }

    // ---- stream -------------------------------------------------------

    fn on_ticker(&mut self, symbol: &str, price: f64, quote_volume: f64, out: &mut Vec<Command>) {
        let held = self.engine.has_position(symbol);
        self.engine.update_price(symbol, price);
        if let Some(snap) = self.scanner.iter_mut().find(|s| s.symbol == symbol) {
            snap.apply_ticker(price, quote_volume);
            out.push(Command::Push(PushEvent::ScannerUpdate(snap.clone())));
        } else if !held {
            return;
        }
        out.push(Command::Push(PushEvent::PriceUpdate { symbol: symbol.to_string(), price }));
    }

    fn on_kline(&mut self, symbol: &str, tf: Timeframe, candle: Candle, now: DateTime<Utc>, out: &mut Vec<Command>) {
        let wanted = match tf {
            Timeframe::M15 => self.is_monitored(symbol),
            Timeframe::M1 => self.hotlist.contains(symbol),
            _ => false,
        };
        if !wanted {
            debug!(target: "binance_ws", %symbol, %tf, "kline for untracked stream ignored");
            return;
        }
        match self.analyzer.ingest(symbol, tf, candle) {
            Ingest::NeedsHydration => out.push(Command::Hydrate {
                symbol: symbol.to_string(),
                timeframe: tf,
                limit: tf.hydration_limit(),
            }),
            Ingest::InFlight => {}
            Ingest::Appended => match tf {
                Timeframe::M15 => self.evaluate_macro(symbol, out),
                _ => self.evaluate_trigger(symbol, now, out),
            },
        }
    }

    fn on_hydrated(
        &mut self,
        symbol: &str,
        tf: Timeframe,
        result: Result<Vec<Candle>, MarketDataError>,
        out: &mut Vec<Command>,
    ) {
        let history = match result {
            Ok(h) => Some(h),
            Err(e) => {
                warn!(target: "binance_api", %symbol, %tf, error = %e, "hydration failed");
                None
            }
        };
        if !self.analyzer.finish_hydration(symbol, tf, history) {
            return;
        }
        let still_wanted = match tf {
            Timeframe::M15 => self.is_monitored(symbol),
            _ => self.hotlist.contains(symbol),
        };
        if !still_wanted {
            self.analyzer.drop_timeframe(symbol, tf);
            return;
        }
        debug!(target: "scanner", %symbol, %tf, "buffer hydrated");
        if tf == Timeframe::M15 {
            self.evaluate_macro(symbol, out);
        }
    }

    // ---- analysis -----------------------------------------------------

    fn evaluate_macro(&mut self, symbol: &str, out: &mut Vec<Command>) {
        let Some(snap) = self.scanner.iter_mut().find(|s| s.symbol == symbol) else {
            return;
        };
        let Some(change) = self.analyzer.macro_gate(snap) else {
            return;
        };
        snap.refresh_score(&self.settings);
        out.push(Command::Push(PushEvent::ScannerUpdate(snap.clone())));

        match change {
            HotlistChange::Entered => {
                self.hotlist.insert(symbol.to_string());
                info!(target: "scanner", %symbol, "added to hotlist");
                if self.analyzer.begin_hydration(symbol, Timeframe::M1) {
                    out.push(Command::Hydrate {
                        symbol: symbol.to_string(),
                        timeframe: Timeframe::M1,
                        limit: Timeframe::M1.hydration_limit(),
                    });
                }
                self.reconcile(out);
            }
            HotlistChange::Left => {
                snap.clear_1m();
                self.hotlist.remove(symbol);
                self.analyzer.drop_timeframe(symbol, Timeframe::M1);
                info!(target: "scanner", %symbol, "removed from hotlist");
                self.reconcile(out);
            }
            HotlistChange::Unchanged => {}
        }
    }

    fn evaluate_trigger(&mut self, symbol: &str, now: DateTime<Utc>, out: &mut Vec<Command>) {
        let Some(snap) = self.scanner.iter_mut().find(|s| s.symbol == symbol) else {
            return;
        };
        let Some(trigger) = self.analyzer.trigger(snap, &self.settings) else {
            return;
        };
        info!(
            target: "scanner",
            %symbol,
            price = trigger.price,
            profile = ?trigger.profile,
            grade = ?trigger.snapshot.grade,
            "entry trigger fired"
        );

        match self.engine.evaluate_and_open(&trigger, &self.settings, &self.breaker, now) {
            Ok(_) => {
                snap.is_on_hotlist = false;
                snap.clear_1m();
                let update = snap.clone();
                self.hotlist.remove(symbol);
                self.analyzer.drop_timeframe(symbol, Timeframe::M1);
                out.push(Command::Push(PushEvent::ScannerUpdate(update)));
                self.push_positions(out);
                self.reconcile(out);
            }
            Err(EntryRejection::Stopped) => {
                debug!(target: "trade", %symbol, "entry skipped, engine stopped");
            }
            Err(rejection) if rejection.is_error() => {
                error!(target: "trade", %symbol, reason = %rejection, "entry aborted");
            }
            Err(rejection) => {
                info!(target: "trade", %symbol, reason = %rejection, "entry rejected");
            }
        }
    }

    // ---- breaker ------------------------------------------------------

    fn on_breaker_candles(&mut self, result: Result<Vec<Candle>, MarketDataError>, now: DateTime<Utc>, out: &mut Vec<Command>) {
        self.breaker_in_flight = false;
        let candles = match result {
            Ok(c) => c,
            Err(e) => {
                warn!(target: "circuit_breaker", error = %e, "reference candles unavailable, status unchanged");
                return;
            }
        };
        if !self.settings.use_circuit_breaker {
            return;
        }
        let Some(transition) = self.breaker.observe(&candles, &self.settings, now) else {
            return;
        };
        out.push(Command::Push(PushEvent::BotStatusUpdate(self.status())));
        if transition.to != CircuitStatus::Active {
            return;
        }
        warn!(
            target: "circuit_breaker",
            change_pct = transition.change_pct,
            open = self.engine.positions().len(),
            "breaker tripped, closing all positions"
        );
        let closed = self.engine.force_close_all(CloseReason::CircuitBreaker, &self.settings, now);
        if !closed.is_empty() {
            self.push_positions(out);
            self.reconcile(out);
            out.push(Command::Push(PushEvent::BotStatusUpdate(self.status())));
        }
    }

    // ---- control ------------------------------------------------------

    fn set_running(&mut self, running: bool, out: &mut Vec<Command>) -> Value {
        if self.engine.set_running(running) {
            info!(target: "trade", running, "bot run state changed");
            self.persist_state(out);
            out.push(Command::Push(PushEvent::BotStatusUpdate(self.status())));
        }
        to_json(&self.status())
    }

    fn set_mode(&mut self, mode: TradingMode, out: &mut Vec<Command>) -> Value {
        if self.engine.set_mode(mode) {
            info!(target: "trade", ?mode, "trading mode switched");
            self.persist_state(out);
            out.push(Command::Push(PushEvent::BotStatusUpdate(self.status())));
        }
        json!({ "mode": self.engine.mode() })
    }

    fn update_settings(&mut self, patch: Value, out: &mut Vec<Command>) -> ControlReply {
        let (next, notes) = self
            .settings
            .merged_with(patch)
            .map_err(|e| ControlError::InvalidSettings(e.to_string()))?;
        for note in notes {
            info!(note = %note, "settings patch migrated");
        }
        let filter_changed = DiscoveryFilter::from_settings(&self.settings) != DiscoveryFilter::from_settings(&next);
        let breaker_disabled = self.settings.use_circuit_breaker && !next.use_circuit_breaker;
        self.settings = next;

        if filter_changed {
            info!(target: "scanner", "discovery filter changed, rediscovering on next tick");
            self.last_discovery = None;
        }
        if breaker_disabled && self.breaker.reset().is_some() {
            out.push(Command::Push(PushEvent::BotStatusUpdate(self.status())));
        }
        out.push(Command::Persist(Document::Settings(self.settings.clone())));
        info!("settings updated");
        Ok(self.settings.to_document())
    }

    fn close_trade(&mut self, id: u64, now: DateTime<Utc>, out: &mut Vec<Command>) -> ControlReply {
        let closed = self
            .engine
            .close_at_market(id, CloseReason::Manual, &self.settings, now)
            .ok_or(ControlError::UnknownTrade(id))?;
        self.push_positions(out);
        self.reconcile(out);
        Ok(to_json(&closed))
    }

    fn clear_data(&mut self, out: &mut Vec<Command>) -> Value {
        warn!(target: "trade", "trade data cleared");
        self.engine.clear(self.settings.initial_virtual_balance);
        self.push_positions(out);
        self.reconcile(out);
        out.push(Command::Push(PushEvent::BotStatusUpdate(self.status())));
        to_json(&self.status())
    }

    // ---- helpers ------------------------------------------------------

    fn persist_state(&self, out: &mut Vec<Command>) {
        out.push(Command::Persist(Document::State(self.runtime_state())));
    }

    /// Persists the state document and pushes the open positions.
    fn push_positions(&self, out: &mut Vec<Command>) {
        self.persist_state(out);
        out.push(Command::Push(PushEvent::PositionsUpdated(self.position_views())));
    }

    fn reconcile(&mut self, out: &mut Vec<Command>) {
        let required = required_topics(
            self.scanner.iter().map(|s| s.symbol.as_str()),
            self.hotlist.iter().map(String::as_str),
            self.engine.open_symbols(),
        );
        let plan = self.subs.reconcile(required);
        if !plan.is_empty() {
            debug!(
                target: "binance_ws",
                subscribe = plan.subscribe.len(),
                unsubscribe = plan.unsubscribe.len(),
                "subscriptions reconciled"
            );
            out.push(Command::Feed(plan));
        }
    }
}
