//! Simulated execution and position lifecycle.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::analyzer::Trigger;
use crate::breaker::CircuitBreaker;
use crate::risk::{screen_entry, EntryContext, EntryRejection};
use crate::settings::{after_hours, Settings};
use crate::sizing;

pub mod position;
pub mod profile;

pub use position::{CloseReason, Position, TradeStatus, TradingMode};
pub use profile::{ExitPlan, TradeProfile};

/// Result of one monitoring pass.
#[derive(Debug, Default)]
pub struct MonitorOutcome {
    pub closed: Vec<Position>,
    /// True when any open position was modified or closed.
    pub changed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PerformanceStats {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub total_pnl: f64,
    pub win_rate: f64,
}

#[derive(Debug, Clone)]
pub struct TradingEngine {
    balance: f64,
    positions: Vec<Position>,
    history: Vec<Position>,
    next_id: u64,
    running: bool,
    mode: TradingMode,
    prices: HashMap<String, f64>,
    loss_cooldowns: HashMap<String, DateTime<Utc>>,
}

impl TradingEngine {
    pub fn new(initial_balance: f64) -> Self {
        Self {
            balance: initial_balance,
            positions: Vec::new(),
            history: Vec::new(),
            next_id: 1,
            running: true,
            mode: TradingMode::Virtual,
            prices: HashMap::new(),
            loss_cooldowns: HashMap::new(),
        }
    }

    /// Rebuilds the engine from persisted fields. Positions with an id at or
    /// above the stored counter push the counter past them.
    pub fn restore(
        balance: f64,
        positions: Vec<Position>,
        history: Vec<Position>,
        next_id: u64,
        running: bool,
        mode: TradingMode,
    ) -> Self {
        let max_id = positions.iter().chain(history.iter()).map(|p| p.id).max().unwrap_or(0);
        Self {
            balance,
            positions,
            history,
            next_id: next_id.max(max_id + 1),
            running,
            mode,
            prices: HashMap::new(),
            loss_cooldowns: HashMap::new(),
        }
    }

    pub fn balance(&self) -> f64 {
        self.balance
    }

    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    pub fn history(&self) -> &[Position] {
        &self.history
    }

    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn mode(&self) -> TradingMode {
        self.mode
    }

    pub fn set_running(&mut self, running: bool) -> bool {
        std::mem::replace(&mut self.running, running) != running
    }

    pub fn set_mode(&mut self, mode: TradingMode) -> bool {
        std::mem::replace(&mut self.mode, mode) != mode
    }

    pub fn has_position(&self, symbol: &str) -> bool {
        self.positions.iter().any(|p| p.symbol == symbol)
    }

    pub fn open_symbols(&self) -> impl Iterator<Item = &str> {
        self.positions.iter().map(|p| p.symbol.as_str())
    }

    pub fn update_price(&mut self, symbol: &str, price: f64) {
        if price > 0.0 {
            self.prices.insert(symbol.to_string(), price);
        }
    }

    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.prices.get(symbol).copied()
    }

    pub fn loss_cooldown_until(&self, symbol: &str) -> Option<DateTime<Utc>> {
        self.loss_cooldowns.get(symbol).copied()
    }

    /// Screens a trigger and, if it passes, opens a simulated position.
    /// Returns the new position's id.
    pub fn evaluate_and_open(
        &mut self,
        trigger: &Trigger,
        settings: &Settings,
        breaker: &CircuitBreaker,
        now: DateTime<Utc>,
    ) -> Result<u64, EntryRejection> {
        let ctx = EntryContext {
            running: self.running,
            breaker,
            loss_cooldown_until: self.loss_cooldown_until(&trigger.symbol),
            open_positions: self.positions.len(),
            already_open: self.has_position(&trigger.symbol),
            now,
        };
        screen_entry(&ctx, trigger, settings)?;

        let atr = trigger.snapshot.atr_15m.ok_or(EntryRejection::MissingMarketData("15m ATR"))?;
        let plan = trigger.profile.exit_plan(settings);
        let entry = sizing::slipped_entry(trigger.price, settings.slippage_pct);
        let stop = entry - atr * plan.sl_atr_multiplier;
        if stop.is_nan() || stop >= entry {
            return Err(EntryRejection::InvalidStop { stop, entry });
        }
        let risk_per_unit = entry - stop;
        let take_profit = entry + risk_per_unit * (plan.tp_atr_multiplier / plan.sl_atr_multiplier);

        let pct = sizing::position_size_pct(settings, trigger.snapshot.grade, breaker.status());
        let notional = sizing::notional(self.balance, pct);
        let quantity = sizing::quantity(notional, entry);
        if quantity <= 0.0 || notional > self.balance {
            return Err(EntryRejection::InsufficientBalance { needed: notional, available: self.balance });
        }

        let id = self.next_id;
        self.next_id += 1;
        let mut position = Position {
            id,
            mode: self.mode,
            symbol: trigger.symbol.clone(),
            entry_price: entry,
            entry_time: now,
            quantity,
            initial_quantity: quantity,
            stop_loss: stop,
            initial_stop_loss: stop,
            take_profit,
            highest_price_since_entry: entry,
            status: TradeStatus::Pending,
            entry_snapshot: trigger.snapshot.clone(),
            profile: trigger.profile,
            exit_plan: plan,
            atr_at_entry: atr,
            initial_risk_per_unit: risk_per_unit,
            trailing_multiplier: plan.trailing_atr_multiplier,
            trailing_tightened: false,
            is_at_breakeven: false,
            partial_tp_hit: false,
            realized_pnl: 0.0,
            exit_price: None,
            exit_time: None,
            pnl: None,
            pnl_pct: None,
            close_reason: None,
        };
        // Simulated fill: single attempt, immediate.
        position.status = TradeStatus::Filled;
        self.balance -= notional;

        info!(
            target: "trade",
            id,
            symbol = %position.symbol,
            profile = ?position.profile,
            qty = quantity,
            entry,
            stop,
            take_profit,
            "position opened"
        );
        self.positions.push(position);
        Ok(id)
    }

    /// One pass over the open positions at the latest known prices.
    pub fn monitor_positions(&mut self, settings: &Settings, now: DateTime<Utc>) -> MonitorOutcome {
        let mut out = MonitorOutcome::default();
        if !self.running {
            return out;
        }
        let mut exits: Vec<(u64, f64, CloseReason)> = Vec::new();

        for pos in &mut self.positions {
            let Some(&price) = self.prices.get(&pos.symbol) else {
                continue;
            };
            if price > pos.highest_price_since_entry {
                pos.highest_price_since_entry = price;
                out.changed = true;
            }
            if price <= pos.stop_loss {
                exits.push((pos.id, pos.stop_loss, CloseReason::StopLoss));
                continue;
            }
            if price >= pos.take_profit {
                exits.push((pos.id, pos.take_profit, CloseReason::TakeProfit));
                continue;
            }

            if settings.use_partial_take_profit
                && !pos.partial_tp_hit
                && price >= pos.entry_price * (1.0 + settings.partial_tp_trigger_pct / 100.0)
            {
                let sold = pos.quantity * settings.partial_tp_sell_qty_pct / 100.0;
                self.balance += sold * price;
                pos.realized_pnl += (price - pos.entry_price) * sold;
                pos.quantity -= sold;
                pos.partial_tp_hit = true;
                out.changed = true;
                info!(target: "trade", id = pos.id, symbol = %pos.symbol, sold, price, "partial take-profit");
            }

            if settings.use_auto_breakeven
                && !pos.is_at_breakeven
                && price >= pos.entry_price * (1.0 + settings.breakeven_trigger_pct / 100.0)
            {
                let fees = if settings.adjust_breakeven_for_fees {
                    2.0 * settings.transaction_fee_pct / 100.0
                } else {
                    0.0
                };
                pos.raise_stop(pos.entry_price * (1.0 + fees));
                pos.is_at_breakeven = true;
                out.changed = true;
                info!(target: "trade", id = pos.id, symbol = %pos.symbol, stop = pos.stop_loss, "stop moved to breakeven");
            }

            let plan = pos.exit_plan;
            if plan.use_trailing_stop {
                if plan.use_adaptive_trailing
                    && !pos.trailing_tightened
                    && (pos.is_at_breakeven || price >= pos.entry_price + pos.initial_risk_per_unit)
                {
                    pos.trailing_multiplier = plan.tighten_multiplier;
                    pos.trailing_tightened = true;
                    out.changed = true;
                    info!(target: "trade", id = pos.id, symbol = %pos.symbol, mult = plan.tighten_multiplier, "trailing stop tightened");
                }
                let candidate = pos.highest_price_since_entry - pos.atr_at_entry * pos.trailing_multiplier;
                if pos.raise_stop(candidate) {
                    out.changed = true;
                }
            }
        }

        for (id, exit, reason) in exits {
            if let Some(closed) = self.close_trade(id, exit, reason, settings, now) {
                out.closed.push(closed);
                out.changed = true;
            }
        }
        out
    }

    /// Closes a position at `exit_price`. Unknown ids return `None` without
    /// touching any state.
    pub fn close_trade(
        &mut self,
        id: u64,
        exit_price: f64,
        reason: CloseReason,
        settings: &Settings,
        now: DateTime<Utc>,
    ) -> Option<Position> {
        let idx = self.positions.iter().position(|p| p.id == id)?;
        let mut pos = self.positions.remove(idx);

        let pnl = pos.realized_pnl + (exit_price - pos.entry_price) * pos.quantity;
        let cost = pos.entry_price * pos.initial_quantity;
        self.balance += exit_price * pos.quantity;

        pos.status = TradeStatus::Closed;
        pos.exit_price = Some(exit_price);
        pos.exit_time = Some(now);
        pos.pnl = Some(pnl);
        pos.pnl_pct = Some(if cost > 0.0 { pnl / cost * 100.0 } else { 0.0 });
        pos.close_reason = Some(reason);

        if pnl < 0.0 && settings.loss_cooldown_hours > 0.0 {
            match after_hours(now, settings.loss_cooldown_hours) {
                Some(until) => {
                    self.loss_cooldowns.insert(pos.symbol.clone(), until);
                }
                None => warn!(target: "trade", hours = settings.loss_cooldown_hours, "loss cooldown out of range, skipped"),
            }
        }
        info!(
            target: "trade",
            id,
            symbol = %pos.symbol,
            ?reason,
            exit_price,
            pnl,
            pnl_pct = pos.pnl_pct.unwrap_or(0.0),
            "position closed"
        );
        self.history.push(pos.clone());
        Some(pos)
    }

    /// Closes at the last known price, falling back to the entry price.
    pub fn close_at_market(&mut self, id: u64, reason: CloseReason, settings: &Settings, now: DateTime<Utc>) -> Option<Position> {
        let pos = self.positions.iter().find(|p| p.id == id)?;
        let price = self.last_price(&pos.symbol).unwrap_or(pos.entry_price);
        self.close_trade(id, price, reason, settings, now)
    }

    /// Closes every open position. A position that cannot be closed is logged
    /// and skipped.
    pub fn force_close_all(&mut self, reason: CloseReason, settings: &Settings, now: DateTime<Utc>) -> Vec<Position> {
        let ids: Vec<u64> = self.positions.iter().map(|p| p.id).collect();
        let mut closed = Vec::with_capacity(ids.len());
        for id in ids {
            match self.close_at_market(id, reason, settings, now) {
                Some(p) => closed.push(p),
                None => warn!(target: "trade", id, "force close skipped, position no longer open"),
            }
        }
        closed
    }

    /// Wipes balance, positions, history and the id counter.
    pub fn clear(&mut self, initial_balance: f64) {
        self.balance = initial_balance;
        self.positions.clear();
        self.history.clear();
        self.next_id = 1;
        self.loss_cooldowns.clear();
    }

    pub fn performance(&self) -> PerformanceStats {
        let total = self.history.len();
        let wins = self.history.iter().filter(|t| t.pnl.unwrap_or(0.0) > 0.0).count();
        PerformanceStats {
            total_trades: total,
            winning_trades: wins,
            losing_trades: total - wins,
            total_pnl: self.history.iter().filter_map(|t| t.pnl).sum(),
            win_rate: if total > 0 { wins as f64 / total as f64 * 100.0 } else { 0.0 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitStatus;
    use crate::snapshot::{InstrumentSnapshot, SignalGrade};
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn flat() -> Settings {
        Settings {
            slippage_pct: 0.0,
            use_dynamic_profile_selector: false,
            use_trailing_stop_loss: false,
            use_auto_breakeven: false,
            sl_atr_multiplier: 1.0,
            tp_atr_multiplier: 3.0,
            position_size_pct: 10.0,
            initial_virtual_balance: 10_000.0,
            ..Settings::default()
        }
    }

    fn trigger(symbol: &str, price: f64, atr: f64) -> Trigger {
        Trigger {
            symbol: symbol.to_string(),
            price,
            snapshot: InstrumentSnapshot {
                rsi_1h: 50.0,
                atr_15m: Some(atr),
                grade: SignalGrade::Buy,
                ..InstrumentSnapshot::new(symbol, price, 1e8)
            },
            profile: TradeProfile::Custom,
            aggressive: false,
            structure_broken: true,
            short_change_pct: None,
        }
    }

    #[test]
    fn test_open_sets_stop_target_and_debits() {
        let s = Settings { slippage_pct: 0.05, ..flat() };
        let mut eng = TradingEngine::new(10_000.0);
        let id = eng.evaluate_and_open(&trigger("SOLUSDT", 100.0, 2.0), &s, &CircuitBreaker::new(), now()).unwrap();
        let p = &eng.positions()[0];
        assert_eq!(p.id, id);
        assert_eq!(p.status, TradeStatus::Filled);
        assert!((p.entry_price - 100.05).abs() < 1e-9);
        assert!((p.stop_loss - 98.05).abs() < 1e-9);
        assert!((p.take_profit - 106.05).abs() < 1e-9);
        assert!((eng.balance() - 9_000.0).abs() < 1e-9);
        assert!((p.quantity * p.entry_price - 1_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_one_position_per_symbol() {
        let s = flat();
        let mut eng = TradingEngine::new(10_000.0);
        let cb = CircuitBreaker::new();
        eng.evaluate_and_open(&trigger("SOLUSDT", 100.0, 2.0), &s, &cb, now()).unwrap();
        let err = eng.evaluate_and_open(&trigger("SOLUSDT", 101.0, 2.0), &s, &cb, now()).unwrap_err();
        assert_eq!(err, EntryRejection::AlreadyOpen("SOLUSDT".into()));
        assert_eq!(eng.positions().len(), 1);
    }

    #[test]
    fn test_zero_atr_multiplier_is_invalid_stop() {
        let s = Settings { sl_atr_multiplier: 0.0, ..flat() };
        let mut eng = TradingEngine::new(10_000.0);
        let err = eng.evaluate_and_open(&trigger("X", 100.0, 2.0), &s, &CircuitBreaker::new(), now()).unwrap_err();
        assert!(matches!(err, EntryRejection::InvalidStop { .. }));
        assert_eq!(eng.next_id(), 1);
        assert_eq!(eng.balance(), 10_000.0);
    }

    #[test]
    fn test_stop_and_target_exits() {
        let s = flat();
        let cb = CircuitBreaker::new();
        let mut eng = TradingEngine::new(10_000.0);
        eng.evaluate_and_open(&trigger("A", 100.0, 2.0), &s, &cb, now()).unwrap();
        eng.evaluate_and_open(&trigger("B", 100.0, 2.0), &s, &cb, now()).unwrap();

        eng.update_price("A", 97.0);
        eng.update_price("B", 107.0);
        let out = eng.monitor_positions(&s, now());
        assert_eq!(out.closed.len(), 2);
        let a = out.closed.iter().find(|p| p.symbol == "A").unwrap();
        let b = out.closed.iter().find(|p| p.symbol == "B").unwrap();
        assert_eq!(a.close_reason, Some(CloseReason::StopLoss));
        assert_eq!(a.exit_price, Some(98.0));
        assert_eq!(b.close_reason, Some(CloseReason::TakeProfit));
        assert_eq!(b.exit_price, Some(106.0));
        assert!(eng.positions().is_empty());
        assert_eq!(eng.history().len(), 2);
        // A: 10 units, -2 each. B: 900 notional (10% of what was left), 9 units, +6 each.
        assert!((eng.balance() - 10_034.0).abs() < 1e-6);
    }

    #[test]
    fn test_loss_starts_symbol_cooldown() {
        let s = flat();
        let cb = CircuitBreaker::new();
        let mut eng = TradingEngine::new(10_000.0);
        let id = eng.evaluate_and_open(&trigger("A", 100.0, 2.0), &s, &cb, now()).unwrap();
        eng.close_trade(id, 99.0, CloseReason::Manual, &s, now()).unwrap();
        let err = eng.evaluate_and_open(&trigger("A", 100.0, 2.0), &s, &cb, now() + Duration::hours(1)).unwrap_err();
        assert!(matches!(err, EntryRejection::LossCooldown { .. }));
        assert!(eng.evaluate_and_open(&trigger("A", 100.0, 2.0), &s, &cb, now() + Duration::hours(5)).is_ok());
    }

    #[test]
    fn test_unrepresentable_cooldown_does_not_panic() {
        let s = Settings { loss_cooldown_hours: 1e300, ..flat() };
        let cb = CircuitBreaker::new();
        let mut eng = TradingEngine::new(10_000.0);
        let id = eng.evaluate_and_open(&trigger("A", 100.0, 2.0), &s, &cb, now()).unwrap();
        assert!(eng.close_trade(id, 99.0, CloseReason::Manual, &s, now()).is_some());
        assert!(eng.evaluate_and_open(&trigger("A", 100.0, 2.0), &s, &cb, now()).is_ok());
    }

    #[test]
    fn test_unknown_close_is_noop() {
        let s = flat();
        let mut eng = TradingEngine::new(10_000.0);
        assert!(eng.close_trade(42, 1.0, CloseReason::Manual, &s, now()).is_none());
        assert_eq!(eng.balance(), 10_000.0);
        assert!(eng.history().is_empty());
    }

    #[test]
    fn test_partial_then_stop_pnl_adds_up() {
        let s = Settings {
            use_partial_take_profit: true,
            partial_tp_trigger_pct: 1.0,
            partial_tp_sell_qty_pct: 50.0,
            ..flat()
        };
        let cb = CircuitBreaker::new();
        let mut eng = TradingEngine::new(10_000.0);
        let id = eng.evaluate_and_open(&trigger("A", 100.0, 2.0), &s, &cb, now()).unwrap();
        let qty = eng.positions()[0].initial_quantity;

        eng.update_price("A", 101.2);
        let out = eng.monitor_positions(&s, now());
        assert!(out.changed && out.closed.is_empty());
        let p = &eng.positions()[0];
        assert!(p.partial_tp_hit);
        assert!((p.quantity - qty / 2.0).abs() < 1e-12);

        // Second pass above the trigger does not sell again.
        eng.update_price("A", 101.6);
        eng.monitor_positions(&s, now());
        assert!((eng.positions()[0].quantity - qty / 2.0).abs() < 1e-12);

        let closed = eng.close_trade(id, 98.0, CloseReason::StopLoss, &s, now()).unwrap();
        let expected = (101.2 - 100.0) * qty / 2.0 + (98.0 - 100.0) * qty / 2.0;
        assert!((closed.pnl.unwrap() - expected).abs() < 1e-9);
        assert!((eng.balance() - (10_000.0 + expected)).abs() < 1e-9);
    }

    #[test]
    fn test_trailing_stop_never_decreases() {
        let s = Settings {
            use_auto_breakeven: true,
            breakeven_trigger_pct: 0.5,
            ..flat()
        };
        let cb = CircuitBreaker::new();
        let mut eng = TradingEngine::new(10_000.0);
        let mut t = trigger("A", 100.0, 2.0);
        t.profile = TradeProfile::Sniper;
        eng.evaluate_and_open(&t, &s, &cb, now()).unwrap();

        let mut last_stop = eng.positions()[0].stop_loss;
        for price in [100.4, 100.8, 102.5, 104.0, 103.0, 101.9, 105.0, 104.2] {
            eng.update_price("A", price);
            eng.monitor_positions(&s, now());
            let Some(p) = eng.positions().first() else { break };
            assert!(p.stop_loss >= last_stop, "stop fell from {last_stop} to {}", p.stop_loss);
            last_stop = p.stop_loss;
        }
    }

    #[test]
    fn test_breakeven_includes_fees_and_tightens() {
        let s = Settings { use_auto_breakeven: true, breakeven_trigger_pct: 0.5, ..flat() };
        let cb = CircuitBreaker::new();
        let mut eng = TradingEngine::new(10_000.0);
        let mut t = trigger("A", 100.0, 2.0);
        t.profile = TradeProfile::Sniper;
        eng.evaluate_and_open(&t, &s, &cb, now()).unwrap();

        eng.update_price("A", 100.6);
        eng.monitor_positions(&s, now());
        let p = &eng.positions()[0];
        assert!(p.is_at_breakeven);
        assert!((p.stop_loss - 100.2).abs() < 1e-9);
        assert!(p.trailing_tightened);
        assert_eq!(p.trailing_multiplier, 1.2);
    }

    #[test]
    fn test_alert_halves_size() {
        let s = flat();
        let mut cb = CircuitBreaker::new();
        let candles: Vec<_> = (0..5)
            .map(|i| crate::candles::Candle { open_time: i * 60_000, open: 100.0, high: 100.0, low: 98.0, close: if i == 4 { 98.0 } else { 100.0 }, volume: 1.0 })
            .collect();
        cb.observe(&candles, &s, now());
        assert_eq!(cb.status(), CircuitStatus::Alert);

        let mut eng = TradingEngine::new(10_000.0);
        eng.evaluate_and_open(&trigger("A", 100.0, 2.0), &s, &cb, now()).unwrap();
        assert!((eng.balance() - 9_500.0).abs() < 1e-9);
    }

    #[test]
    fn test_force_close_all_uses_last_price_or_entry() {
        let s = flat();
        let cb = CircuitBreaker::new();
        let mut eng = TradingEngine::new(10_000.0);
        eng.evaluate_and_open(&trigger("A", 100.0, 2.0), &s, &cb, now()).unwrap();
        eng.evaluate_and_open(&trigger("B", 50.0, 1.0), &s, &cb, now()).unwrap();
        eng.update_price("A", 99.0);

        let closed = eng.force_close_all(CloseReason::CircuitBreaker, &s, now());
        assert_eq!(closed.len(), 2);
        assert!(closed.iter().all(|p| p.close_reason == Some(CloseReason::CircuitBreaker)));
        let b = closed.iter().find(|p| p.symbol == "B").unwrap();
        assert_eq!(b.exit_price, Some(50.0));
        assert!(eng.positions().is_empty());
    }
}
