//! Event-driven core.
//!
//! ```text
//! timers / stream / task results ──► Event ──► BotState ──► Command ──► coordinator
//! dashboard ──► ControlRequest ─────────────────┘    └──► ControlReply
//! ```
//!
//! `BotState` never performs I/O. Every upstream call, socket write, push
//! and document save is a [`Command`] executed by the coordinator, whose
//! results come back as further events.

pub mod events;
mod reducer;
mod state;

pub use events::{Command, ControlReply, ControlRequest, Event, TimerKind};
pub use state::BotState;
