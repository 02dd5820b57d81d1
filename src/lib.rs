//! Breakout scanner and simulated trader for Binance spot USDT pairs.
//!
//! Discovery ranks the liquid universe on the 15m macro trend, the analyzer
//! promotes compressed coils to a hotlist and watches them on 1m candles, and
//! the trading engine opens simulated positions on confirmed breakouts. All
//! state is owned by one coordinator task; see [`engine`] and [`coordinator`].

pub mod analyzer;
pub mod breaker;
pub mod candles;
pub mod config;
pub mod coordinator;
pub mod dashboard;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod feed;
pub mod indicators;
pub mod logging;
pub mod risk;
pub mod scheduler;
pub mod settings;
pub mod sizing;
pub mod snapshot;
pub mod storage;
pub mod subscriptions;
pub mod trading;
