//! WebSocket endpoints: `/ws/status` (broadcast-only viewer feed) and
//! `/ws/control` (authenticated per-player command channel), grounded in
//! `app/ws/status_handler.py` and `app/ws/control_handler.py`.
//!
//! Both sockets follow the same shape: split into sender/receiver, forward
//! a channel of outbound messages to the sender with a per-send timeout,
//! and read inbound frames on the receiver half. Capacity and auth
//! failures still complete the WebSocket handshake (a close frame cannot
//! be sent otherwise) and close immediately with the appropriate code.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};

use protocol::{
    ControlClientMessage, ControlServerMessage, StatusServerMessage, CLOSE_AUTH_FAILED, CLOSE_CAPACITY,
    CLOSE_LIVENESS, CLOSE_REPLACED,
};

use crate::state::AppState;

const MAX_MESSAGE_BYTES: usize = 1024;
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(axum::extract::ws::CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

/// Same as [`close_with`] but for an already-split sender half.
async fn close_split(
    sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    code: u16,
    reason: &'static str,
) {
    let _ = sender
        .send(Message::Close(Some(axum::extract::ws::CloseFrame { code, reason: reason.into() })))
        .await;
}

// -- /ws/status -----------------------------------------------------------

pub async fn status_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| status_socket(socket, state))
}

async fn status_socket(socket: WebSocket, state: AppState) {
    let max = state.supervisor.settings.max_viewer_connections as usize;
    if state.supervisor.fanout.viewer_count().await >= max {
        close_with(socket, CLOSE_CAPACITY, "viewer capacity reached").await;
        return;
    }

    let (mut sender, mut receiver) = socket.split();
    let (id, mut rx) = state.supervisor.fanout.register().await;
    let send_timeout = Duration::from_millis(state.supervisor.settings.status_send_timeout_ms);
    let mut ping_timer = tokio::time::interval(Duration::from_secs(state.supervisor.settings.status_ping_interval_s));

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(outbound) = outbound else { break };
                if send_status(&mut sender, &outbound, send_timeout).await.is_err() {
                    break;
                }
            }
            _ = ping_timer.tick() => {
                if send_status(&mut sender, &StatusServerMessage::Ping, send_timeout).await.is_err() {
                    break;
                }
            }
            // Status is a broadcast-only socket: any inbound frame is read
            // purely to detect the client closing the connection.
            incoming = receiver.next() => {
                if incoming.is_none() {
                    break;
                }
                if let Some(Err(_)) = incoming {
                    break;
                }
            }
        }
    }

    state.supervisor.fanout.unregister(id).await;
}

async fn send_status(
    sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    message: &StatusServerMessage,
    send_timeout: Duration,
) -> Result<(), ()> {
    let text = serde_json::to_string(message).unwrap_or_default();
    match tokio::time::timeout(send_timeout, sender.send(Message::Text(text.into()))).await {
        Ok(Ok(())) => Ok(()),
        _ => Err(()),
    }
}

// -- /ws/control ------------------------------------------------------------

pub async fn control_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| control_socket(socket, state))
}

async fn control_socket(socket: WebSocket, state: AppState) {
    let max = state.supervisor.settings.max_control_connections;
    if state.supervisor.control.connection_count() >= max {
        close_with(socket, CLOSE_CAPACITY, "control capacity reached").await;
        return;
    }

    let (mut sender, mut receiver) = socket.split();

    let entry_id = match authenticate(&state, &mut sender, &mut receiver).await {
        Some(id) => id,
        None => return,
    };

    let mut rx = state.supervisor.control.register(entry_id.clone()).await;

    if state.supervisor.turn.active_entry_id().await.as_deref() == Some(entry_id.as_str()) {
        let snapshot = state.supervisor.turn.snapshot().await;
        let _ = send_control(&mut sender, &ControlServerMessage::StateUpdate(snapshot)).await;
    }

    let send_timeout = Duration::from_millis(state.supervisor.settings.control_send_timeout_ms);
    let liveness_timeout = Duration::from_secs(state.supervisor.settings.control_liveness_timeout_s);
    let mut ping_timer = tokio::time::interval(Duration::from_secs(state.supervisor.settings.control_ping_interval_s));

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(outbound) = outbound else {
                    close_split(&mut sender, CLOSE_REPLACED, "replaced by a new connection").await;
                    return;
                };
                if timed_send(&mut sender, &outbound, send_timeout).await.is_err() {
                    break;
                }
            }
            _ = ping_timer.tick() => {
                if state.supervisor.control.is_stale(&entry_id, liveness_timeout).await {
                    close_split(&mut sender, CLOSE_LIVENESS, "no activity within liveness window").await;
                    state.supervisor.control.unregister(&entry_id).await;
                    return;
                }
                if timed_send(&mut sender, &ControlServerMessage::Ping, send_timeout).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if text.len() > MAX_MESSAGE_BYTES {
                            continue;
                        }
                        match serde_json::from_str::<ControlClientMessage>(&text) {
                            Ok(ControlClientMessage::LatencyPing { sent_at_ms }) => {
                                // Bypasses the per-connection rate limit entirely: it
                                // never reaches `ControlChannel::dispatch`.
                                let _ = timed_send(
                                    &mut sender,
                                    &ControlServerMessage::LatencyPong { sent_at_ms },
                                    send_timeout,
                                )
                                .await;
                            }
                            Ok(msg) => state.supervisor.control.dispatch(&entry_id, msg).await,
                            Err(_) => {}
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    state.supervisor.control.unregister(&entry_id).await;
}

/// Read the first frame: it must be a text `{"type":"auth","token":...}`
/// message within [`AUTH_TIMEOUT`], and the token must resolve to a queue
/// entry. Any other outcome closes with [`CLOSE_AUTH_FAILED`] and returns
/// `None`.
async fn authenticate(
    state: &AppState,
    sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    receiver: &mut (impl futures_util::Stream<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<String> {
    let first = tokio::time::timeout(AUTH_TIMEOUT, receiver.next()).await;
    let Ok(Some(Ok(Message::Text(text)))) = first else {
        let _ = sender
            .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                code: CLOSE_AUTH_FAILED,
                reason: "authentication timed out or connection closed".into(),
            })))
            .await;
        return None;
    };

    let Ok(ControlClientMessage::Auth { token }) = serde_json::from_str::<ControlClientMessage>(&text) else {
        let _ = sender
            .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                code: CLOSE_AUTH_FAILED,
                reason: "first message must be auth".into(),
            })))
            .await;
        return None;
    };

    let token_hash = claw_core::store::hash_token(&token);
    let entry = match state.supervisor.queue.get_by_token(token_hash).await {
        Ok(Some(entry)) => entry,
        _ => {
            let _ = sender
                .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                    code: CLOSE_AUTH_FAILED,
                    reason: "invalid token".into(),
                })))
                .await;
            return None;
        }
    };

    if send_control(sender, &ControlServerMessage::AuthOk { entry_id: entry.id.clone() }).await.is_err() {
        return None;
    }

    Some(entry.id)
}

async fn send_control(
    sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    message: &ControlServerMessage,
) -> Result<(), ()> {
    let text = serde_json::to_string(message).unwrap_or_default();
    sender.send(Message::Text(text.into())).await.map_err(|_| ())
}

async fn timed_send(
    sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    message: &ControlServerMessage,
    send_timeout: Duration,
) -> Result<(), ()> {
    let text = serde_json::to_string(message).unwrap_or_default();
    match tokio::time::timeout(send_timeout, sender.send(Message::Text(text.into()))).await {
        Ok(Ok(())) => Ok(()),
        _ => Err(()),
    }
}
