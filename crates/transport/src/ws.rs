//! WebSocket surface (spec §6): `send_message` in, `stream_chunk` out.
//!
//! Grounded on `openintent-web`'s `ws.rs` (`ws_handler` → `handle_socket`,
//! `InboundMessage`/`OutboundMessage` with typed constructors, the
//! `Message::Text`/`Message::Close` match) — generalized from its single
//! `done`/`text_delta` pair to the chunk envelope §6 specifies, and from a
//! request/response round trip to forwarding a live `TransportChunk` stream
//! as it's produced.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::info;

use aigent_runtime::TransportChunk;

use crate::state::SharedState;

#[derive(Deserialize)]
struct InboundMessage {
    message: String,
}

/// The `{ type, content, is_complete, timestamp }` envelope §6 specifies.
#[derive(Serialize)]
struct StreamEnvelope {
    #[serde(rename = "type")]
    kind: &'static str,
    content: serde_json::Value,
    is_complete: bool,
    timestamp: DateTime<Utc>,
}

impl StreamEnvelope {
    fn new(kind: &'static str, content: serde_json::Value, is_complete: bool) -> Self {
        Self { kind, content, is_complete, timestamp: Utc::now() }
    }

    fn content(text: String) -> Self {
        Self::new("content", json!(text), false)
    }

    fn thinking(text: String) -> Self {
        Self::new("thinking", json!(text), false)
    }

    fn tool_call(id: String, name: String, arguments: serde_json::Value) -> Self {
        Self::new("tool_call", json!({ "id": id, "name": name, "arguments": arguments }), false)
    }

    fn tool_result(call_id: String, name: Option<String>, success: bool, content: String) -> Self {
        Self::new(
            "tool_result",
            json!({ "call_id": call_id, "name": name, "success": success, "content": content }),
            false,
        )
    }

    fn error(message: String) -> Self {
        Self::new("error", json!(message), true)
    }

    fn done() -> Self {
        Self::new("content", json!(""), true)
    }
}

fn to_envelope(chunk: TransportChunk) -> StreamEnvelope {
    match chunk {
        TransportChunk::Content(delta) => StreamEnvelope::content(delta),
        TransportChunk::Thinking(delta) => StreamEnvelope::thinking(delta),
        TransportChunk::ToolCall { id, name, arguments } => StreamEnvelope::tool_call(id, name, arguments),
        TransportChunk::ToolResult { call_id, name, success, content } => {
            StreamEnvelope::tool_result(call_id, name, success, content)
        }
        TransportChunk::Error(message) => StreamEnvelope::error(message),
        TransportChunk::Done { is_complete } => {
            if is_complete {
                StreamEnvelope::done()
            } else {
                StreamEnvelope::new("content", json!(""), false)
            }
        }
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: SharedState) {
    info!("websocket client connected");

    while let Some(Ok(msg)) = socket.recv().await {
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => continue,
        };

        let inbound: InboundMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                if send(&mut socket, &StreamEnvelope::error(e.to_string())).await.is_err() {
                    return;
                }
                continue;
            }
        };

        if inbound.message.trim().is_empty() {
            if send(&mut socket, &StreamEnvelope::error("message must not be empty".to_string())).await.is_err() {
                return;
            }
            continue;
        }

        let (tx, mut rx) = mpsc::channel::<TransportChunk>(256);
        let chat = state.chat.clone();
        let context = state.context.clone();
        let turn = tokio::spawn(async move {
            let mut context = context.lock().await;
            chat.run_turn(&mut context, inbound.message, tx).await;
        });

        while let Some(chunk) = rx.recv().await {
            if send(&mut socket, &to_envelope(chunk)).await.is_err() {
                turn.abort();
                return;
            }
        }
        let _ = turn.await;
    }

    info!("websocket client disconnected");
}

async fn send(socket: &mut WebSocket, envelope: &StreamEnvelope) -> Result<(), axum::Error> {
    let text = serde_json::to_string(envelope).unwrap_or_else(|_| "{\"type\":\"error\"}".to_string());
    socket.send(Message::Text(text.into())).await
}
