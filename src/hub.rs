//! WebSocket mediation between a session's PTY and any number of
//! connected browser clients.
//!
//! Admission (token + session existence) is checked *before*
//! `ws.on_upgrade` is called, so a rejected connection comes back as a
//! plain HTTP 400/401 rather than an upgrade that immediately closes —
//! the same check-before-upgrade shape this codebase's WASM terminal
//! bridge uses for its own admission gate.

use crate::dev_terminal::{DevEvent, DevTerminal};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::registry::{Registry, SessionEvent};
use crate::security;
use crate::token_store::TokenStore;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Grace period after an `exit` frame before the server-side socket is
/// closed, giving the client time to render the final frame.
const EXIT_GRACE: Duration = Duration::from_millis(1500);
const NOT_INITIALIZED: &str = "Terminal not initialized. Send init first.";

#[derive(serde::Deserialize)]
pub struct SessionWsQuery {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub token: String,
}

#[derive(serde::Deserialize)]
pub struct DevWsQuery {
    pub token: String,
}

pub struct HubState {
    pub registry: Arc<Registry>,
    pub tokens: Arc<TokenStore>,
    pub dev: Arc<DevTerminal>,
}

pub async fn session_ws(
    State(state): State<Arc<HubState>>,
    Query(query): Query<SessionWsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if !state.tokens.verify(&query.token).await {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let Ok(id) = Uuid::parse_str(&query.session_id) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    if !state.registry.exists(id) {
        return StatusCode::BAD_REQUEST.into_response();
    }

    ws.on_upgrade(move |socket| async move {
        serve_session(socket, state.registry.clone(), id).await;
    })
}

async fn send(
    sink: &mut futures::stream::SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(message).unwrap_or_else(|_| "{}".to_string());
    sink.send(Message::Text(text)).await
}

/// Per-connection state for the `/ws` protocol: the first `init` message
/// spawns (or re-attaches to) the session's PTY; everything before that
/// is `input` rejected with an error and `resize` silently ignored, per
/// the upgrade contract.
async fn serve_session(socket: WebSocket, registry: Arc<Registry>, id: Uuid) {
    let (mut sink, mut stream) = socket.split();

    let mut events: Option<tokio::sync::broadcast::Receiver<SessionEvent>> = None;

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::Init { cols, rows }) => {
                                if events.is_some() {
                                    continue; // init is idempotent per connection
                                }
                                if let Err(msg) = security::validate_terminal_dimensions(cols, rows) {
                                    let _ = send(&mut sink, &ServerMessage::Error { message: msg }).await;
                                    continue;
                                }
                                let Some(entry) = registry.get(id) else { break };

                                // Subscribe before start() so the status/error
                                // events start() fires synchronously on a
                                // spawn failure are not lost to the race of
                                // subscribing only after it returns.
                                let mut rx = entry.callbacks().subscribe();
                                registry.start(id, cols, rows).await;

                                let ready = ServerMessage::Ready {
                                    session_id: id.to_string(),
                                    is_new: None,
                                };
                                if send(&mut sink, &ready).await.is_err() {
                                    break;
                                }
                                let history = entry.history_snapshot().await;
                                if !history.is_empty() {
                                    let _ = send(&mut sink, &ServerMessage::History { data: history }).await;
                                }
                                // Drain anything start() already published
                                // (status/error on immediate spawn failure)
                                // before folding the receiver into the main
                                // select loop.
                                while let Ok(event) = rx.try_recv() {
                                    if !deliver(&mut sink, id, event).await {
                                        break;
                                    }
                                }
                                events = Some(rx);
                            }
                            Ok(ClientMessage::Input { data }) => {
                                if events.is_none() {
                                    let _ = send(&mut sink, &ServerMessage::Error {
                                        message: NOT_INITIALIZED.to_string(),
                                    }).await;
                                    continue;
                                }
                                registry.write(id, data.as_bytes()).await;
                            }
                            Ok(ClientMessage::Resize { cols, rows }) => {
                                if events.is_none() {
                                    continue; // silently ignored before init
                                }
                                registry.resize(id, cols, rows).await;
                            }
                            Ok(ClientMessage::Ping) => {
                                if send(&mut sink, &ServerMessage::Pong).await.is_err() {
                                    break;
                                }
                            }
                            Ok(ClientMessage::Kill) => {
                                debug!("ignoring dev-only kill message on a named session");
                            }
                            Err(e) => {
                                debug!(error = %e, "rejected malformed client message");
                                let _ = send(&mut sink, &ServerMessage::Error {
                                    message: "unrecognized message".to_string(),
                                }).await;
                            }
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        let _ = send(&mut sink, &ServerMessage::Error {
                            message: "binary frames are not supported".to_string(),
                        }).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket read error");
                        break;
                    }
                }
            }
            event = async {
                match events.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                match event {
                    Ok(event) => {
                        if !deliver(&mut sink, id, event).await {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

/// Delivers one session event to a client's sink. Returns `false` when the
/// connection should be torn down afterward (send failure, or the
/// post-`exit` grace period elapsing).
async fn deliver(
    sink: &mut futures::stream::SplitSink<WebSocket, Message>,
    id: Uuid,
    event: SessionEvent,
) -> bool {
    match event {
        SessionEvent::Output(data) => send(sink, &ServerMessage::Output { data }).await.is_ok(),
        SessionEvent::Status(status) => send(
            sink,
            &ServerMessage::Status {
                status: status.as_wire().to_string(),
                session_id: id.to_string(),
            },
        )
        .await
        .is_ok(),
        SessionEvent::Exit(info) => {
            let _ = send(
                sink,
                &ServerMessage::Exit {
                    code: info.exit_code,
                    signal: info.signal,
                },
            )
            .await;
            tokio::time::sleep(EXIT_GRACE).await;
            false
        }
        SessionEvent::Error(message) => send(sink, &ServerMessage::Error { message }).await.is_ok(),
    }
}

pub async fn dev_ws(
    State(state): State<Arc<HubState>>,
    Query(query): Query<DevWsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if !state.tokens.verify(&query.token).await {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| async move {
        serve_dev(socket, state.dev.clone()).await;
    })
}

async fn serve_dev(socket: WebSocket, dev: Arc<DevTerminal>) {
    let (mut sink, mut stream) = socket.split();

    // The dev PTY spawns lazily once the client sends `init`, converging
    // concurrent connects onto the same shared process.
    let mut events: Option<tokio::sync::broadcast::Receiver<DevEvent>> = None;

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::Init { cols, rows }) => {
                                if let Err(msg) = security::validate_terminal_dimensions(cols, rows) {
                                    let _ = send(&mut sink, &ServerMessage::Error { message: msg }).await;
                                    continue;
                                }
                                match dev.spawn_or_attach().await {
                                    Ok(is_new) => {
                                        dev.resize(cols, rows).await;
                                        events = dev.subscribe().await;
                                        let _ = send(&mut sink, &ServerMessage::Ready {
                                            session_id: "dev".to_string(),
                                            is_new: Some(is_new),
                                        }).await;
                                        let history = dev.history_snapshot().await;
                                        if !history.is_empty() {
                                            let _ = send(&mut sink, &ServerMessage::History { data: history }).await;
                                        }
                                    }
                                    Err(e) => {
                                        let _ = send(&mut sink, &ServerMessage::Error { message: e.to_string() }).await;
                                    }
                                }
                            }
                            Ok(ClientMessage::Input { data }) => {
                                if events.is_none() {
                                    let _ = send(&mut sink, &ServerMessage::Error {
                                        message: NOT_INITIALIZED.to_string(),
                                    }).await;
                                    continue;
                                }
                                dev.write(data.as_bytes()).await;
                            }
                            Ok(ClientMessage::Resize { cols, rows }) => {
                                if events.is_none() {
                                    continue;
                                }
                                dev.resize(cols, rows).await;
                            }
                            Ok(ClientMessage::Kill) => {
                                dev.kill().await;
                                let _ = send(&mut sink, &ServerMessage::Killed).await;
                                events = None;
                            }
                            Ok(ClientMessage::Ping) => {
                                if send(&mut sink, &ServerMessage::Pong).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!(error = %e, "rejected malformed dev client message");
                                let _ = send(&mut sink, &ServerMessage::Error {
                                    message: "unrecognized message".to_string(),
                                }).await;
                            }
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        let _ = send(&mut sink, &ServerMessage::Error {
                            message: "binary frames are not supported".to_string(),
                        }).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "dev websocket read error");
                        break;
                    }
                }
            }
            event = async {
                match events.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                match event {
                    Ok(DevEvent::Output(data)) => {
                        if send(&mut sink, &ServerMessage::Output { data }).await.is_err() {
                            break;
                        }
                    }
                    Ok(DevEvent::Exit(info)) => {
                        let _ = send(&mut sink, &ServerMessage::Exit {
                            code: info.exit_code,
                            signal: info.signal,
                        }).await;
                        events = None;
                    }
                    Ok(DevEvent::Error(message)) => {
                        let _ = send(&mut sink, &ServerMessage::Error { message }).await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => { events = None; }
                }
            }
        }
    }
}
