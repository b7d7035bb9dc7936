//! REST handlers for the routes in spec §6.
//!
//! Grounded on `openintent-web`'s `api.rs` (one handler per route, `Json`
//! request/response bodies, `State<Arc<AppState>>` extraction) — generalized
//! from its single `/api/chat` + `/api/status` pair to the full route table
//! the scheduler and memory store need.

use aigent_llm::ChatMessage;
use aigent_runtime::{MemoryTask, TransportChunk};
use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;

use crate::state::SharedState;

fn error_response(status: StatusCode, message: impl Into<String>) -> impl IntoResponse {
    (status, Json(json!({ "error": message.into(), "status": "error" })))
}

#[derive(Deserialize)]
pub struct ChatBody {
    pub message: String,
}

/// `POST /chat`: drains the chat loop to completion and returns the
/// concatenated content deltas as the final assistant response.
pub async fn chat(State(state): State<SharedState>, Json(body): Json<ChatBody>) -> impl IntoResponse {
    if body.message.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "message must not be empty").into_response();
    }

    let (tx, mut rx) = mpsc::channel::<TransportChunk>(256);
    let collector = tokio::spawn(async move {
        let mut content = String::new();
        let mut error = None;
        while let Some(chunk) = rx.recv().await {
            match chunk {
                TransportChunk::Content(delta) => content.push_str(&delta),
                TransportChunk::Error(message) => error = Some(message),
                _ => {}
            }
        }
        (content, error)
    });

    {
        let mut context = state.context.lock().await;
        state.chat.run_turn(&mut context, body.message, tx).await;
    }

    let (content, error) = collector.await.unwrap_or_default();
    match error {
        Some(message) => error_response(StatusCode::BAD_GATEWAY, message).into_response(),
        None => Json(json!({
            "response": content,
            "status": "success",
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }))
        .into_response(),
    }
}

#[derive(Serialize)]
struct HistoryEntry {
    role: String,
    content: Option<String>,
}

/// `GET /history`: a snapshot of the live conversation context.
pub async fn history(State(state): State<SharedState>) -> impl IntoResponse {
    let context = state.context.lock().await;
    let history: Vec<HistoryEntry> = context
        .iter()
        .map(|message| HistoryEntry { role: role_label(message).to_string(), content: message.content.clone() })
        .collect();
    Json(json!({ "history": history, "status": "success" }))
}

fn role_label(message: &ChatMessage) -> &'static str {
    match message.role {
        aigent_llm::ChatRole::System => "system",
        aigent_llm::ChatRole::User => "user",
        aigent_llm::ChatRole::Assistant => "assistant",
        aigent_llm::ChatRole::Tool => "tool",
    }
}

/// `GET /health`: liveness, feature flags, and a scheduler snapshot.
pub async fn health(State(state): State<SharedState>) -> impl IntoResponse {
    let sleep_agent = match &state.scheduler {
        Some(scheduler) => {
            let status = scheduler.status().await;
            json!({ "initialized": true, "status": format!("{:?}", status.state).to_lowercase() })
        }
        None => json!({ "initialized": false, "status": "disabled" }),
    };

    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "streaming_support": true,
        "ai_system_initialized": true,
        "sleep_agent": sleep_agent,
    }))
}

/// `POST /clear`: drop the live conversation context.
pub async fn clear(State(state): State<SharedState>) -> impl IntoResponse {
    let mut context = state.context.lock().await;
    context.clear();
    Json(json!({ "status": "success", "message": "conversation cleared" }))
}

/// `GET /memory/core`: the structured memory snapshot (§4.3.7) that's also
/// prepended to every chat turn's system prompt.
pub async fn memory_core(State(state): State<SharedState>) -> impl IntoResponse {
    let snapshot = state.memory.snapshot().await;
    Json(json!({ "core_memory": snapshot, "status": "success" }))
}

/// `GET /sleep_agent/status`: the scheduler's point-in-time state.
pub async fn sleep_agent_status(State(state): State<SharedState>) -> impl IntoResponse {
    match &state.scheduler {
        Some(scheduler) => {
            let status = scheduler.status().await;
            Json(json!({
                "status": {
                    "state": format!("{:?}", status.state).to_lowercase(),
                    "queue_size": status.queue_size,
                    "foreground_active": status.foreground_active,
                    "last_foreground_activity": status.last_foreground_activity.to_rfc3339(),
                },
                "success": true,
            }))
            .into_response()
        }
        None => error_response(StatusCode::SERVICE_UNAVAILABLE, "sleep-time scheduler is disabled").into_response(),
    }
}

/// `POST /sleep_agent/trigger`: force-enqueue a memory task over the
/// current live context, bypassing the message-count trigger.
pub async fn sleep_agent_trigger(State(state): State<SharedState>) -> impl IntoResponse {
    let Some(scheduler) = &state.scheduler else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "sleep-time scheduler is disabled").into_response();
    };

    let context = state.context.lock().await.clone();
    let context_size = context.len();
    scheduler.enqueue_task(MemoryTask { id: uuid::Uuid::new_v4().to_string(), context }).await;

    Json(json!({ "context_size": context_size, "message": "memory task enqueued" })).into_response()
}

#[derive(Deserialize)]
pub struct SetModelBody {
    pub model: String,
}

/// `POST /set_model`: swap the primary model identifier.
pub async fn set_model(State(state): State<SharedState>, Json(body): Json<SetModelBody>) -> impl IntoResponse {
    state.chat.set_model(body.model);
    Json(json!({ "ok": true }))
}

/// `POST /set_sleep_model`: swap the secondary model identifier.
pub async fn set_sleep_model(State(state): State<SharedState>, Json(body): Json<SetModelBody>) -> impl IntoResponse {
    match &state.scheduler {
        Some(scheduler) => {
            scheduler.set_model(body.model);
            Json(json!({ "ok": true })).into_response()
        }
        None => error_response(StatusCode::SERVICE_UNAVAILABLE, "sleep-time scheduler is disabled").into_response(),
    }
}
