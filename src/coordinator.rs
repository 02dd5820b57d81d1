//! Async wiring around [`BotState`]: the single event loop, command
//! execution and the request handle used by the dashboard.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::candles::Timeframe;
use crate::dashboard::PushHub;
use crate::discovery::MarketDiscovery;
use crate::engine::{BotState, Command, ControlReply, ControlRequest, Event};
use crate::error::{ControlError, MarketDataError};
use crate::exchange::MarketData;
use crate::storage::Document;
use crate::subscriptions::Topic;

type ControlMsg = (ControlRequest, oneshot::Sender<ControlReply>);

/// Cloneable request channel into the coordinator.
#[derive(Debug, Clone)]
pub struct BotHandle {
    tx: mpsc::Sender<ControlMsg>,
}

impl BotHandle {
    /// Sends one request and waits for its reply. Fails with
    /// [`ControlError::ShuttingDown`] once the coordinator has stopped.
    pub async fn request(&self, request: ControlRequest) -> ControlReply {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send((request, reply_tx)).await.map_err(|_| ControlError::ShuttingDown)?;
        reply_rx.await.map_err(|_| ControlError::ShuttingDown)?
    }
}

/// Where command side effects go.
pub struct Outlets {
    pub source: Arc<dyn MarketData>,
    pub discovery: Arc<MarketDiscovery>,
    /// Full set of topics the stream task should carry. Publishing never waits
    /// on the stream task.
    pub feed: watch::Sender<BTreeSet<Topic>>,
    pub persist: mpsc::Sender<Document>,
    pub hub: PushHub,
}

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub call: Duration,
    pub discovery: Duration,
}

pub struct Coordinator {
    state: BotState,
    outlets: Outlets,
    timeouts: Timeouts,
    events_tx: mpsc::Sender<Event>,
    events_rx: mpsc::Receiver<Event>,
    control_rx: mpsc::Receiver<ControlMsg>,
}

impl Coordinator {
    /// Builds the coordinator and returns the event queue sender (for timers,
    /// the stream task and tests) plus the dashboard handle.
    pub fn new(
        state: BotState,
        outlets: Outlets,
        timeouts: Timeouts,
        queue_capacity: usize,
    ) -> (Self, mpsc::Sender<Event>, BotHandle) {
        let (events_tx, events_rx) = mpsc::channel(queue_capacity.max(1));
        let (control_tx, control_rx) = mpsc::channel(64);
        let coordinator = Self {
            state,
            outlets,
            timeouts,
            events_tx: events_tx.clone(),
            events_rx,
            control_rx,
        };
        (coordinator, events_tx, BotHandle { tx: control_tx })
    }

    /// Processes events and requests one at a time until `shutdown` flips,
    /// then persists the final state and hands the state back.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> BotState {
        info!("coordinator started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                Some((request, reply_tx)) = self.control_rx.recv() => {
                    let name = request.name();
                    let (reply, commands) = self.state.handle_control(request, Utc::now());
                    if let Err(e) = &reply {
                        warn!(request = name, error = %e, "request refused");
                    }
                    self.execute(commands).await;
                    let _ = reply_tx.send(reply);
                }
                Some(event) = self.events_rx.recv() => {
                    let commands = self.state.handle_event(event, Utc::now());
                    self.execute(commands).await;
                }
                else => break,
            }
        }

        if self.outlets.persist.send(Document::State(self.state.runtime_state())).await.is_err() {
            error!("final state could not be queued for persistence");
        }
        info!("coordinator stopped");
        self.state
    }

    async fn execute(&self, commands: Vec<Command>) {
        for command in commands {
            match command {
                Command::RunDiscovery(filter) => {
                    let discovery = self.outlets.discovery.clone();
                    self.spawn_call(
                        self.timeouts.discovery,
                        async move { discovery.discover(&filter).await },
                        Event::DiscoveryFinished,
                    );
                }
                Command::Hydrate { symbol, timeframe, limit } => {
                    let source = self.outlets.source.clone();
                    let sym = symbol.clone();
                    self.spawn_call(
                        self.timeouts.call,
                        async move { source.fetch_klines(&sym, timeframe, limit).await },
                        move |result| Event::Hydrated { symbol, timeframe, result },
                    );
                }
                Command::FetchBreakerCandles { symbol, limit } => {
                    let source = self.outlets.source.clone();
                    self.spawn_call(
                        self.timeouts.call,
                        async move { source.fetch_klines(&symbol, Timeframe::M1, limit).await },
                        Event::BreakerCandles,
                    );
                }
                Command::Feed(plan) => {
                    debug!(
                        target: "binance_ws",
                        subscribe = plan.subscribe.len(),
                        unsubscribe = plan.unsubscribe.len(),
                        "publishing topic set"
                    );
                    let required = self.state.subscriptions().subscribed();
                    let published = self.outlets.feed.send_if_modified(|current| {
                        if *current == *required {
                            return false;
                        }
                        current.clone_from(required);
                        true
                    });
                    if published && self.outlets.feed.is_closed() {
                        warn!(target: "binance_ws", "stream task gone, topic set not delivered");
                    }
                }
                Command::Persist(doc) => {
                    if self.outlets.persist.send(doc).await.is_err() {
                        error!("persistence writer gone, document dropped");
                    }
                }
                Command::Push(event) => self.outlets.hub.publish(event),
            }
        }
    }

    /// Runs an upstream call off the loop under a deadline and queues its
    /// result as an event.
    fn spawn_call<T, F, W>(&self, limit: Duration, call: F, wrap: W)
    where
        T: Send + 'static,
        F: Future<Output = Result<T, MarketDataError>> + Send + 'static,
        W: FnOnce(Result<T, MarketDataError>) -> Event + Send + 'static,
    {
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = match timeout(limit, call).await {
                Ok(r) => r,
                Err(_) => Err(MarketDataError::Timeout(limit)),
            };
            let _ = tx.send(wrap(result)).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candles::Candle;
    use crate::exchange::Ticker24h;
    use crate::snapshot::InstrumentSnapshot;
    use crate::settings::Settings;
    use crate::storage::RuntimeState;
    use crate::trading::TradingMode;
    use async_trait::async_trait;

    struct Silent;

    #[async_trait]
    impl MarketData for Silent {
        async fn fetch_tickers(&self) -> Result<Vec<Ticker24h>, MarketDataError> {
            Ok(vec![])
        }

        async fn fetch_klines(&self, _: &str, _: Timeframe, _: usize) -> Result<Vec<Candle>, MarketDataError> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_request_reply_and_final_persist() {
        let source: Arc<dyn MarketData> = Arc::new(Silent);
        let discovery = Arc::new(MarketDiscovery::new(source.clone(), Duration::from_secs(60), 2));
        let (feed_tx, _feed_rx) = watch::channel(BTreeSet::new());
        let (persist_tx, mut persist_rx) = mpsc::channel(8);
        let outlets = Outlets { source, discovery, feed: feed_tx, persist: persist_tx, hub: PushHub::new(8) };
        let timeouts = Timeouts { call: Duration::from_secs(1), discovery: Duration::from_secs(1) };
        let state = BotState::new(Settings::default(), RuntimeState::default());

        let (coordinator, _events, handle) = Coordinator::new(state, outlets, timeouts, 16);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(coordinator.run(stop_rx));

        let reply = handle.request(ControlRequest::SetMode(TradingMode::RealLive)).await.unwrap();
        assert_eq!(reply["mode"], "REAL_LIVE");
        let Some(Document::State(saved)) = persist_rx.recv().await else {
            panic!("expected a state document");
        };
        assert_eq!(saved.trading_mode, TradingMode::RealLive);

        stop_tx.send(true).unwrap();
        let final_state = task.await.unwrap();
        assert_eq!(final_state.engine().mode(), TradingMode::RealLive);
        assert!(matches!(persist_rx.recv().await, Some(Document::State(_))));
        assert_eq!(handle.request(ControlRequest::GetStatus).await, Err(ControlError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_unread_feed_never_stalls_the_loop() {
        let source: Arc<dyn MarketData> = Arc::new(Silent);
        let discovery = Arc::new(MarketDiscovery::new(source.clone(), Duration::from_secs(60), 2));
        let (feed_tx, mut feed_rx) = watch::channel(BTreeSet::new());
        let (persist_tx, _persist_rx) = mpsc::channel(8);
        let outlets = Outlets { source, discovery, feed: feed_tx, persist: persist_tx, hub: PushHub::new(8) };
        let timeouts = Timeouts { call: Duration::from_secs(1), discovery: Duration::from_secs(1) };
        let state = BotState::new(Settings::default(), RuntimeState::default());

        let (coordinator, events, handle) = Coordinator::new(state, outlets, timeouts, 512);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(coordinator.run(stop_rx));

        // every cycle swaps the universe and emits a plan nobody reads
        for i in 0..200 {
            let snap = InstrumentSnapshot::new(format!("S{i}USDT"), 1.0, 5e7);
            events.send(Event::DiscoveryFinished(Ok(vec![snap]))).await.unwrap();
        }
        let last = Topic::Ticker("S199USDT".into());
        timeout(Duration::from_secs(5), feed_rx.wait_for(|topics| topics.contains(&last)))
            .await
            .unwrap()
            .unwrap();
        assert!(!feed_rx.borrow().contains(&Topic::Ticker("S0USDT".into())));
        assert_eq!(feed_rx.borrow().len(), 2);
        assert!(handle.request(ControlRequest::GetStatus).await.is_ok());

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
