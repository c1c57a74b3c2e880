use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};

use hearth_core::auth::Identity;
use hearth_core::envelope::Namespace;
use hearth_engine::registry::Connection;

use crate::dispatch;
use crate::server::AppState;

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Run one authenticated WebSocket to completion: split into reader and
/// writer tasks, then funnel the close through [`finish_disconnect`].
pub async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    identity: Identity,
    channel: Namespace,
) {
    let (conn, mut rx) = state.registry.register(&identity, channel);
    tracing::info!(
        connection_id = %conn.id,
        user_id = %conn.user_id,
        channel = %channel,
        "connection established"
    );

    if channel == Namespace::Presence {
        if let Err(e) = state.presence.handle_connect(&conn) {
            tracing::error!(connection_id = %conn.id, error = %e, "presence connect failed");
        }
    }

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer: drain the send queue, ping periodically.
    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping.tick() => {
                    if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Reader: dispatch inbound frames, track pongs for liveness.
    let reader_state = state.clone();
    let reader_conn = Arc::clone(&conn);
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    dispatch::dispatch_text(&reader_state, &reader_conn, text.as_str()).await;
                }
                WsMessage::Pong(_) => reader_conn.touch(),
                WsMessage::Close(_) => break,
                WsMessage::Ping(_) => {} // axum answers pongs itself
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }

    finish_disconnect(&state, &conn);
}

/// The single teardown path for closed and evicted connections. Removing
/// from the registry first means the presence check below sees the world
/// without this connection.
pub fn finish_disconnect(state: &AppState, conn: &Connection) {
    state.registry.remove(&conn.id);
    tracing::info!(connection_id = %conn.id, user_id = %conn.user_id, "connection closed");

    if conn.channel == Namespace::Signaling
        && !state.registry.has_channel(&conn.user_id, Namespace::Signaling)
    {
        state.calls.on_disconnect(&conn.user_id);
    }

    if let Err(e) = state.presence.handle_disconnect(&conn.user_id) {
        tracing::error!(user_id = %conn.user_id, error = %e, "disconnect presence update failed");
    }
}
