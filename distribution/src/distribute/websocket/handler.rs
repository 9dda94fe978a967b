//! Upgrade route and per-socket session loop

use super::WsShared;
use crate::distribute::connections::ClientConnection;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use synopticon_core::now_millis;
use tokio::sync::mpsc;

/// How long the writer gets to flush after the reader stops
const WRITER_DRAIN: Duration = Duration::from_secs(1);

/// Close code for sockets refused because the server is full
const TRY_AGAIN_LATER: u16 = 1013;

pub(super) fn router(shared: Arc<WsShared>) -> Router {
    Router::new()
        .route(&shared.config.path, get(upgrade))
        .route("/health", get(health))
        .with_state(shared)
}

async fn upgrade(ws: WebSocketUpgrade, State(shared): State<Arc<WsShared>>) -> Response {
    if shared.at_capacity() {
        tracing::warn!(
            distributor = %shared.lifecycle.name(),
            connections = shared.registry.len(),
            "websocket upgrade rejected, at capacity"
        );
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    }
    ws.on_upgrade(move |socket| run_connection(socket, shared))
}

async fn health(State(shared): State<Arc<WsShared>>) -> Json<Value> {
    Json(json!({
        "status": shared.stats.health(),
        "connections": shared.registry.len(),
        "timestamp": now_millis(),
    }))
}

/// Client control message
#[derive(Debug, Deserialize)]
struct ControlFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    event: Option<String>,
}

async fn run_connection(socket: WebSocket, shared: Arc<WsShared>) {
    let client_id = format!("ws_{}", ulid::Ulid::new());
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(shared.config.channel_capacity.max(1));
    let conn = Arc::new(ClientConnection::new(client_id.clone(), tx));

    // Re-checked here since several upgrades may pass the route check at once
    if !shared
        .registry
        .try_insert(Arc::clone(&conn), shared.config.max_connections)
    {
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: TRY_AGAIN_LATER,
                reason: "too many connections".into(),
            })))
            .await;
        return;
    }
    tracing::info!(distributor = %shared.lifecycle.name(), %client_id, "websocket client connected");

    reply(
        &conn,
        json!({
            "event": "welcome",
            "data": { "clientId": client_id, "subscriptions": [] },
            "timestamp": now_millis(),
        }),
    );

    let mut writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            () = shared.cancel.cancelled() => break,
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    conn.touch();
                    handle_control(&shared, &conn, text.as_str());
                }
                Some(Ok(Message::Binary(data))) => {
                    conn.touch();
                    match std::str::from_utf8(&data) {
                        Ok(text) => handle_control(&shared, &conn, text),
                        Err(_) => reply(&conn, error_frame("binary frames must be UTF-8 JSON")),
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => conn.touch(),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::debug!(%client_id, error = %e, "websocket read error");
                    break;
                }
            }
        }
    }

    shared.registry.remove(&client_id);
    drop(conn);
    if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        writer.abort();
    }
    tracing::info!(distributor = %shared.lifecycle.name(), %client_id, "websocket client disconnected");
}

/// Apply one control frame and queue the reply
fn handle_control(shared: &WsShared, conn: &ClientConnection<Message>, text: &str) {
    let frame: ControlFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            reply(conn, error_frame(&format!("invalid message: {e}")));
            return;
        }
    };
    let event = frame.event.filter(|e| !e.is_empty());

    let response = match (frame.kind.as_str(), event) {
        ("subscribe", Some(event)) => {
            shared.registry.subscribe(&conn.id, &event);
            tracing::debug!(client_id = %conn.id, %event, "subscribed");
            json!({ "type": "subscribed", "event": event })
        }
        ("unsubscribe", Some(event)) => {
            shared.registry.unsubscribe(&conn.id, &event);
            tracing::debug!(client_id = %conn.id, %event, "unsubscribed");
            json!({ "type": "unsubscribed", "event": event })
        }
        ("subscribe" | "unsubscribe", None) => error_frame("missing event"),
        ("ping", _) => json!({ "type": "pong", "timestamp": now_millis() }),
        ("get-status" | "status", _) => json!({ "type": "status", "status": shared.status() }),
        (other, _) => error_frame(&format!("unknown message type: {other}")),
    };
    reply(conn, response);
}

fn error_frame(message: &str) -> Value {
    json!({ "type": "error", "message": message })
}

fn reply(conn: &ClientConnection<Message>, frame: Value) {
    conn.send(Message::Text(frame.to_string().into()));
}
