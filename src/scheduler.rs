//! Periodic timer events for the coordinator queue.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

use crate::engine::{Event, TimerKind};

/// Sends `Event::Timer(kind)` every `period`, starting immediately, until
/// shutdown or the queue closes. Late ticks are skipped, not bunched.
pub fn spawn_ticker(
    kind: TimerKind,
    period: Duration,
    tx: mpsc::Sender<Event>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = interval(period.max(Duration::from_millis(10)));
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticks.tick() => {
                    if tx.send(Event::Timer(kind)).await.is_err() {
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!(?kind, "timer stopped");
    })
}
