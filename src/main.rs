use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

use squeezefx::config::Config;
use squeezefx::coordinator::{Coordinator, Outlets, Timeouts};
use squeezefx::dashboard::{server, PushHub};
use squeezefx::discovery::MarketDiscovery;
use squeezefx::engine::{BotState, Event, TimerKind};
use squeezefx::exchange::{BinanceRest, MarketData};
use squeezefx::feed::{run_stream, StreamConfig};
use squeezefx::scheduler::spawn_ticker;
use squeezefx::storage::{spawn_writer, DocumentStore};
use squeezefx::{logging, storage};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("loading configuration")?;

    let hub = PushHub::new(config.push_buffer);
    logging::init(Some(hub.clone())).context("installing log subscriber")?;

    let mut store = DocumentStore::open(&config.sqlite_path)
        .with_context(|| format!("opening store at {}", config.sqlite_path))?;
    let settings = store.load_settings().context("loading settings")?;
    let runtime = store.load_state(&settings).context("loading runtime state")?;
    info!(
        balance = runtime.balance,
        open_positions = runtime.active_positions.len(),
        mode = ?runtime.trading_mode,
        "state restored"
    );
    let state = BotState::new(settings, runtime);

    let source: Arc<dyn MarketData> = Arc::new(
        BinanceRest::new(config.binance_base.clone(), config.http_timeout).context("building HTTP client")?,
    );
    let discovery = Arc::new(MarketDiscovery::new(
        source.clone(),
        config.discovery_cache_ttl,
        config.discovery_concurrency,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (feed_tx, feed_rx) = watch::channel(BTreeSet::new());
    let (persist_tx, persist_rx) = mpsc::channel::<storage::Document>(256);
    let writer = spawn_writer(store, persist_rx);

    let outlets = Outlets { source, discovery, feed: feed_tx, persist: persist_tx, hub: hub.clone() };
    let timeouts = Timeouts { call: config.http_timeout, discovery: config.discovery_timeout };
    let (coordinator, events_tx, handle) = Coordinator::new(state, outlets, timeouts, config.event_channel_cap);

    let stream = StreamConfig {
        url: config.binance_ws_url.clone(),
        connect_timeout: config.ws_connect_timeout,
        reconnect_delay: config.ws_reconnect_delay,
    };
    tokio::spawn(run_stream::<Event>(
        stream,
        feed_rx,
        events_tx.clone(),
        shutdown_rx.clone(),
    ));
    spawn_ticker(TimerKind::Discovery, config.discovery_poll, events_tx.clone(), shutdown_rx.clone());
    spawn_ticker(TimerKind::Monitor, config.monitor_interval, events_tx.clone(), shutdown_rx.clone());
    spawn_ticker(TimerKind::Breaker, config.breaker_interval, events_tx.clone(), shutdown_rx.clone());
    drop(events_tx);

    let listener = TcpListener::bind(config.dashboard_addr)
        .await
        .with_context(|| format!("binding dashboard on {}", config.dashboard_addr))?;
    tokio::spawn(server::serve(
        listener,
        Arc::from(config.app_password.as_str()),
        hub,
        handle,
        shutdown_rx.clone(),
    ));

    let bot = tokio::spawn(coordinator.run(shutdown_rx));

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    // the coordinator owns the last persistence sender, so the writer drains
    // and exits once it has returned
    if let Err(e) = bot.await {
        error!("coordinator task failed: {e}");
    }
    if let Err(e) = writer.await {
        error!("persistence writer failed: {e}");
    }
    info!("bye");
    Ok(())
}
