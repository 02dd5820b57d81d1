use std::collections::BTreeSet;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{parse_stream_message, MarketEvent};
use crate::error::MarketDataError;
use crate::subscriptions::{SubscriptionManager, Topic};

/// Upper bound on stream names per SUBSCRIBE/UNSUBSCRIBE frame.
pub const MAX_PARAMS_PER_MESSAGE: usize = 200;

/// Builds the control frames for `topics`, chunked, each with a fresh id.
pub fn control_messages(method: &str, topics: &[Topic], next_id: &mut u64) -> Vec<String> {
    topics
        .chunks(MAX_PARAMS_PER_MESSAGE)
        .map(|chunk| {
            let params: Vec<String> = chunk.iter().map(Topic::to_string).collect();
            let id = *next_id;
            *next_id += 1;
            json!({ "method": method, "params": params, "id": id }).to_string()
        })
        .collect()
}

pub type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens the socket, giving up after `limit`.
pub async fn connect(url: &str, limit: Duration) -> Result<Socket, MarketDataError> {
    match timeout(limit, connect_async(url)).await {
        Ok(Ok((ws, _))) => Ok(ws),
        Ok(Err(e)) => Err(MarketDataError::Stream(e.to_string())),
        Err(_) => Err(MarketDataError::Timeout(limit)),
    }
}

async fn send_all<S>(write: &mut S, frames: Vec<String>) -> Result<(), WsError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    for frame in frames {
        debug!(target: "binance_ws", %frame, "control frame");
        write.send(Message::Text(frame)).await?;
    }
    Ok(())
}

/// Connection parameters for [`run_stream`].
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub url: String,
    pub connect_timeout: Duration,
    pub reconnect_delay: Duration,
}

/// Runs the market stream until `shutdown` flips, the topic sender is dropped
/// or the event queue closes. `topics` always holds the full required set;
/// the task diffs it against what the socket carries, so any number of
/// updates made while it is busy collapse into one plan.
pub async fn run_stream<E>(
    config: StreamConfig,
    mut topics: watch::Receiver<BTreeSet<Topic>>,
    events: mpsc::Sender<E>,
    mut shutdown: watch::Receiver<bool>,
) where
    E: From<MarketEvent> + Send + 'static,
{
    let mut active = SubscriptionManager::new();
    let mut next_id: u64 = 1;

    loop {
        if *shutdown.borrow() {
            return;
        }

        match connect(&config.url, config.connect_timeout).await {
            Err(e) => warn!(target: "binance_ws", error = %e, "connect failed"),
            Ok(ws) => {
                active.reconcile(topics.borrow_and_update().clone());
                info!(target: "binance_ws", topics = active.subscribed().len(), "connected");
                let (mut write, mut read) = ws.split();
                let all: Vec<Topic> = active.subscribed().iter().cloned().collect();
                if let Err(e) = send_all(&mut write, control_messages("SUBSCRIBE", &all, &mut next_id)).await {
                    warn!(target: "binance_ws", error = %e, "resubscribe failed");
                } else {
                    loop {
                        tokio::select! {
                            _ = shutdown.changed() => {
                                let _ = write.close().await;
                                info!(target: "binance_ws", "stream stopped");
                                return;
                            }
                            changed = topics.changed() => {
                                if changed.is_err() {
                                    let _ = write.close().await;
                                    return;
                                }
                                let plan = active.reconcile(topics.borrow_and_update().clone());
                                let mut frames = control_messages("UNSUBSCRIBE", &plan.unsubscribe, &mut next_id);
                                frames.extend(control_messages("SUBSCRIBE", &plan.subscribe, &mut next_id));
                                if let Err(e) = send_all(&mut write, frames).await {
                                    warn!(target: "binance_ws", error = %e, "subscription update failed");
                                    break;
                                }
                            }
                            msg = read.next() => match msg {
                                Some(Ok(Message::Text(text))) => {
                                    if let Some(ev) = parse_stream_message(&text) {
                                        if events.send(E::from(ev)).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                                Some(Ok(Message::Ping(payload))) => {
                                    if write.send(Message::Pong(payload)).await.is_err() {
                                        break;
                                    }
                                }
                                Some(Ok(Message::Close(frame))) => {
                                    warn!(target: "binance_ws", ?frame, "server closed the stream");
                                    break;
                                }
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    warn!(target: "binance_ws", error = %e, "read failed");
                                    break;
                                }
                                None => break,
                            }
                        }
                    }
                }
            }
        }

        let delay = config.reconnect_delay;
        warn!(target: "binance_ws", delay_ms = delay.as_millis() as u64, "reconnecting");
        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown.changed() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candles::Timeframe;
    use tokio::net::TcpListener;

    #[test]
    fn test_control_frames_are_chunked_with_increasing_ids() {
        let topics: Vec<Topic> = (0..450).map(|i| Topic::Ticker(format!("S{i}USDT"))).collect();
        let mut id = 7;
        let frames = control_messages("SUBSCRIBE", &topics, &mut id);
        assert_eq!(frames.len(), 3);
        assert_eq!(id, 10);

        let first: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(first["method"], "SUBSCRIBE");
        assert_eq!(first["id"], 7);
        assert_eq!(first["params"].as_array().unwrap().len(), MAX_PARAMS_PER_MESSAGE);
        let last: serde_json::Value = serde_json::from_str(&frames[2]).unwrap();
        assert_eq!(last["params"].as_array().unwrap().len(), 50);
    }

    #[test]
    fn test_empty_topic_list_sends_nothing() {
        let mut id = 1;
        assert!(control_messages("UNSUBSCRIBE", &[], &mut id).is_empty());
        assert_eq!(id, 1);
    }

    #[tokio::test]
    async fn test_connect_gives_up_on_silent_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hold = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let limit = Duration::from_millis(100);
        let started = std::time::Instant::now();
        let err = connect(&format!("ws://{addr}/ws"), limit).await.unwrap_err();
        assert!(matches!(err, MarketDataError::Timeout(d) if d == limit));
        assert!(started.elapsed() < Duration::from_secs(5));
        hold.abort();
    }

    async fn next_frame(server: &mut WebSocketStream<TcpStream>) -> serde_json::Value {
        loop {
            if let Message::Text(text) = server.next().await.unwrap().unwrap() {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_subscribes_on_connect_and_sends_only_the_net_change() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let a = Topic::Ticker("AUSDT".into());
        let b = Topic::Kline("BUSDT".into(), Timeframe::M1);
        let c = Topic::Ticker("CUSDT".into());

        let (topics_tx, topics_rx) = watch::channel(BTreeSet::from([a.clone()]));
        let (events_tx, _events_rx) = mpsc::channel::<MarketEvent>(4);
        let (stop_tx, stop_rx) = watch::channel(false);
        let config = StreamConfig {
            url: format!("ws://{addr}/ws"),
            connect_timeout: Duration::from_secs(2),
            reconnect_delay: Duration::from_secs(5),
        };
        let task = tokio::spawn(run_stream(config, topics_rx, events_tx, stop_rx));

        let (socket, _) = listener.accept().await.unwrap();
        let mut server = tokio_tungstenite::accept_async(socket).await.unwrap();
        let first = next_frame(&mut server).await;
        assert_eq!(first["method"], "SUBSCRIBE");
        assert_eq!(first["params"], json!(["ausdt@ticker"]));

        // two updates before the task runs again collapse into one diff
        topics_tx.send_replace(BTreeSet::from([a.clone(), b.clone()]));
        topics_tx.send_replace(BTreeSet::from([b, c]));
        let unsub = next_frame(&mut server).await;
        assert_eq!(unsub["method"], "UNSUBSCRIBE");
        assert_eq!(unsub["params"], json!(["ausdt@ticker"]));
        let sub = next_frame(&mut server).await;
        assert_eq!(sub["method"], "SUBSCRIBE");
        assert_eq!(sub["params"], json!(["cusdt@ticker", "busdt@kline_1m"]));

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }
}
