//! Real-time candle state: per (symbol, timeframe) buffers, the 15m
//! squeeze gate that drives the hotlist and the 1m momentum trigger.

use std::collections::{HashMap, HashSet};

use crate::candles::{window_change_pct, Candle, CandleBuffer, Timeframe, DEFAULT_BUFFER_CAPACITY};
use crate::indicators::{adx_series, atr_series, bollinger_series, ema_series, percentile};
use crate::settings::Settings;
use crate::snapshot::{BandSnapshot, InstrumentSnapshot, VOLUME_SPIKE_MULTIPLE};
use crate::trading::profile::{select_profile, TradeProfile};

pub const SQUEEZE_LOOKBACK: usize = 50;
pub const SQUEEZE_PERCENTILE: f64 = 0.25;
pub const MIN_15M_CANDLES: usize = 50;
pub const MIN_1M_CANDLES: usize = 21;
const VOLUME_AVG_PERIOD: usize = 20;

type BufferKey = (String, Timeframe);

/// What happened to a streamed candle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    Appended,
    /// No buffer yet; the caller should fetch history. The candle is dropped.
    NeedsHydration,
    /// A hydration is already in flight; the candle is dropped.
    InFlight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotlistChange {
    Entered,
    Left,
    Unchanged,
}

/// A fired 1m entry signal.
#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    pub symbol: String,
    pub price: f64,
    /// Snapshot frozen at signal time.
    pub snapshot: InstrumentSnapshot,
    pub profile: TradeProfile,
    pub aggressive: bool,
    pub structure_broken: bool,
    /// Price change over the parabolic filter window, when enough 1m candles exist.
    pub short_change_pct: Option<f64>,
}

#[derive(Debug, Default)]
pub struct RealtimeAnalyzer {
    buffers: HashMap<BufferKey, CandleBuffer>,
    hydrating: HashSet<BufferKey>,
}

impl RealtimeAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffer(&self, symbol: &str, tf: Timeframe) -> Option<&CandleBuffer> {
        self.buffers.get(&(symbol.to_string(), tf))
    }

    pub fn is_hydrating(&self, symbol: &str, tf: Timeframe) -> bool {
        self.hydrating.contains(&(symbol.to_string(), tf))
    }

    /// Routes a closed candle into its buffer. A missing buffer marks the
    /// pair as hydrating so only one fetch is requested.
    pub fn ingest(&mut self, symbol: &str, tf: Timeframe, candle: Candle) -> Ingest {
        let key = (symbol.to_string(), tf);
        if let Some(buf) = self.buffers.get_mut(&key) {
            buf.push(candle);
            return Ingest::Appended;
        }
        if self.hydrating.insert(key) {
            Ingest::NeedsHydration
        } else {
            Ingest::InFlight
        }
    }

    /// Marks a hydration as started. Returns false when one is already running
    /// or the buffer exists.
    pub fn begin_hydration(&mut self, symbol: &str, tf: Timeframe) -> bool {
        let key = (symbol.to_string(), tf);
        !self.buffers.contains_key(&key) && self.hydrating.insert(key)
    }

    /// Clears the in-flight marker and, on success, installs the buffer.
    /// Returns false when the result was discarded because nothing was waiting
    /// for it.
    pub fn finish_hydration(&mut self, symbol: &str, tf: Timeframe, history: Option<Vec<Candle>>) -> bool {
        let key = (symbol.to_string(), tf);
        if !self.hydrating.remove(&key) {
            return false;
        }
        match history {
            Some(h) => {
                self.buffers.insert(key, CandleBuffer::from_history(DEFAULT_BUFFER_CAPACITY, h));
                true
            }
            None => false,
        }
    }

    pub fn drop_timeframe(&mut self, symbol: &str, tf: Timeframe) {
        let key = (symbol.to_string(), tf);
        self.buffers.remove(&key);
        self.hydrating.remove(&key);
    }

    /// Removes every buffer and in-flight marker for `symbol`.
    pub fn forget(&mut self, symbol: &str) {
        self.buffers.retain(|(s, _), _| s != symbol);
        self.hydrating.retain(|(s, _)| s != symbol);
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Recomputes the 15m fields of `snap` and its hotlist flag. Returns `None`
    /// (leaving `snap` untouched) while history is too short.
    pub fn macro_gate(&self, snap: &mut InstrumentSnapshot) -> Option<HotlistChange> {
        let buf = self.buffer(&snap.symbol, Timeframe::M15)?;
        if buf.len() < MIN_15M_CANDLES {
            return None;
        }
        let closes = buf.closes();
        let highs = buf.highs();
        let lows = buf.lows();
        let volumes = buf.volumes();

        let bands = bollinger_series(&closes, 20, 2.0);
        let atr = atr_series(&highs, &lows, &closes, 14);
        if bands.len() < 2 || atr.len() < 2 {
            return None;
        }

        // Squeeze is judged on the previous closed candle against the widths
        // that precede and include it.
        let widths: Vec<f64> = bands.iter().map(|b| b.width()).collect();
        let prev_idx = widths.len() - 2;
        let history = &widths[..=prev_idx];
        let history = &history[history.len().saturating_sub(SQUEEZE_LOOKBACK)..];
        let threshold = percentile(history, SQUEEZE_PERCENTILE)?;
        let squeeze = widths[prev_idx] <= threshold;

        let current_atr = atr[atr.len() - 1];
        let atr_falling = current_atr < atr[atr.len() - 2];

        snap.is_in_squeeze_15m = squeeze;
        snap.is_atr_falling_15m = atr_falling;
        snap.atr_15m = Some(current_atr);
        snap.adx_15m = adx_series(&highs, &lows, &closes, 14).last().copied();
        snap.atr_pct_15m = (snap.price > 0.0).then(|| current_atr / snap.price * 100.0);
        snap.previous_15m_high = Some(highs[highs.len() - 2]);
        snap.bollinger_bands_15m = bands.last().copied().map(BandSnapshot::from);
        snap.last_volume_15m = volumes.last().copied();
        snap.volume_20_period_avg_15m = trailing_average(&volumes, VOLUME_AVG_PERIOD);

        let was = snap.is_on_hotlist;
        snap.is_on_hotlist = snap.trend_is_favorable() && squeeze && atr_falling;
        Some(match (was, snap.is_on_hotlist) {
            (false, true) => HotlistChange::Entered,
            (true, false) => HotlistChange::Left,
            _ => HotlistChange::Unchanged,
        })
    }

    /// Evaluates the 1m entry trigger for a hotlisted symbol, refreshing the
    /// snapshot's 1m volume fields and score on the way.
    pub fn trigger(&self, snap: &mut InstrumentSnapshot, settings: &Settings) -> Option<Trigger> {
        if !snap.is_on_hotlist {
            return None;
        }
        let buf = self.buffer(&snap.symbol, Timeframe::M1)?;
        if buf.len() < MIN_1M_CANDLES {
            return None;
        }
        let closes = buf.closes();
        let volumes = buf.volumes();
        let ema9 = *ema_series(&closes, 9).last()?;
        let avg_volume = trailing_average(&volumes, VOLUME_AVG_PERIOD)?;
        let candle = *buf.last()?;

        snap.last_volume_1m = Some(candle.volume);
        snap.volume_20_period_avg_1m = Some(avg_volume);
        snap.refresh_score(settings);

        let momentum = candle.close > ema9;
        let volume_ok = !settings.use_volume_confirmation || candle.volume > avg_volume * VOLUME_SPIKE_MULTIPLE;
        let profile = select_profile(settings, snap.adx_15m, snap.atr_pct_15m);
        let aggressive = settings.aggressive_entry_profiles.contains(&profile);
        let structure_broken = snap.previous_15m_high.is_some_and(|h| candle.close > h);

        if !(momentum && volume_ok && (aggressive || structure_broken)) {
            return None;
        }

        let window = settings.parabolic_filter_period_minutes.max(1);
        let short_change_pct = if buf.len() >= window {
            window_change_pct(&buf.tail(window))
        } else {
            None
        };
        let price = if snap.price > 0.0 { snap.price } else { candle.close };
        Some(Trigger {
            symbol: snap.symbol.clone(),
            price,
            snapshot: snap.clone(),
            profile,
            aggressive,
            structure_broken,
            short_change_pct,
        })
    }
}

/// Mean of the `period` values before the newest one.
fn trailing_average(values: &[f64], period: usize) -> Option<f64> {
    if values.len() < period + 1 || period == 0 {
        return None;
    }
    let end = values.len() - 1;
    let window = &values[end - period..end];
    Some(window.iter().sum::<f64>() / period as f64)
}
