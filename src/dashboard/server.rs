//! WebSocket server for dashboard clients: password-gated handshake, push
//! fan-out and per-socket request/reply.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{StatusCode, Uri};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::protocol::{parse_request, reply_frame};
use super::PushHub;
use crate::coordinator::BotHandle;

/// True when the request URI carries `token=<password>` in its query.
pub fn authorized(uri: &Uri, password: &str) -> bool {
    let Some(query) = uri.query() else {
        return false;
    };
    url::form_urlencoded::parse(query.as_bytes()).any(|(k, v)| k == "token" && v == password)
}

fn unauthorized() -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some("unauthorized".to_string()));
    *resp.status_mut() = StatusCode::UNAUTHORIZED;
    resp
}

/// Accepts dashboard connections until shutdown.
pub async fn serve(
    listener: TcpListener,
    password: Arc<str>,
    hub: PushHub,
    handle: BotHandle,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Ok(addr) = listener.local_addr() {
        info!("dashboard server listening on {addr}");
    }
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_client(
                        stream,
                        peer,
                        password.clone(),
                        hub.clone(),
                        handle.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => warn!("dashboard accept failed: {e}"),
            },
        }
    }
    info!("dashboard server stopped");
}

async fn handle_client(
    stream: TcpStream,
    peer: SocketAddr,
    password: Arc<str>,
    hub: PushHub,
    handle: BotHandle,
    mut shutdown: watch::Receiver<bool>,
) {
    let gate = |req: &Request, resp: Response| {
        if authorized(req.uri(), &password) {
            Ok(resp)
        } else {
            Err(unauthorized())
        }
    };
    let ws = match accept_hdr_async(stream, gate).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("dashboard handshake with {peer} refused: {e}");
            return;
        }
    };
    info!("dashboard client {peer} connected");

    let (mut sink, mut source) = ws.split();
    let mut pushes = hub.subscribe();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            push = pushes.recv() => match push {
                Ok(event) => {
                    let Ok(text) = serde_json::to_string(&event) else { continue };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("dashboard client {peer} lagged, skipped {skipped} events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = source.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let frame = answer(&handle, &text).await;
                    let Ok(text) = serde_json::to_string(&frame) else { continue };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = sink.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("dashboard client {peer} errored: {e}");
                    break;
                }
            },
        }
    }
    info!("dashboard client {peer} disconnected");
}

async fn answer(handle: &BotHandle, text: &str) -> Value {
    match parse_request(text) {
        Ok(request) => {
            let name = request.name();
            reply_frame(name, handle.request(request).await)
        }
        Err(e) => {
            warn!("unreadable dashboard message: {e}");
            reply_frame("UNKNOWN", Err(e))
        }
    }
}
