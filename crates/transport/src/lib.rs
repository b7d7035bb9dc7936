//! HTTP + WebSocket transport adapter (spec §6).
//!
//! Grounded on `openintent-web`'s `WebServer` (`router()`/`start()` split,
//! `CorsLayer`, `Arc<AppState>` shared via `.with_state`) — generalized from
//! its session-store-backed REST surface to the route table this system's
//! chat loop and sleep-time scheduler need.

mod http;
mod state;
mod ws;

use std::sync::Arc;

use aigent_memory::MemoryStore;
use aigent_runtime::{ChatLoop, SchedulerHandle};
use axum::Router;
use axum::http::{HeaderValue, Method};
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;

pub use state::{AppState, SharedState};

/// Bind address and port the HTTP/WebSocket listener uses.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub bind_address: String,
    pub port: u16,
}

impl TransportConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Composes the Axum router and owns the state every handler shares.
pub struct TransportServer {
    config: TransportConfig,
    state: SharedState,
}

impl TransportServer {
    pub fn new(config: TransportConfig, chat: Arc<ChatLoop>, memory: Arc<MemoryStore>, scheduler: Option<SchedulerHandle>) -> Self {
        let state = Arc::new(AppState::new(chat, memory, scheduler));
        Self { config, state }
    }

    pub fn addr(&self) -> String {
        self.config.addr()
    }

    fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin("*".parse::<HeaderValue>().expect("static origin parses"))
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(tower_http::cors::Any);

        Router::new()
            .route("/chat", post(http::chat))
            .route("/history", get(http::history))
            .route("/health", get(http::health))
            .route("/clear", post(http::clear))
            .route("/memory/core", get(http::memory_core))
            .route("/sleep_agent/status", get(http::sleep_agent_status))
            .route("/sleep_agent/trigger", post(http::sleep_agent_trigger))
            .route("/set_model", post(http::set_model))
            .route("/set_sleep_model", post(http::set_sleep_model))
            .route("/ws", get(ws::ws_handler))
            .layer(cors)
            .with_state(Arc::clone(&self.state))
    }

    /// Binds the TCP listener and serves until the process is killed.
    pub async fn serve(self) -> anyhow::Result<()> {
        let addr = self.addr();
        let router = self.router();

        tracing::info!(%addr, "starting transport server");

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aigent_llm::{ChatMessage, GatewayConfig, LlmGateway, StreamChunk};
    use aigent_memory::{CoreMemoryStore, EmbedFn, MemoryStore, RecallLog, VectorMemoryStore};
    use aigent_exec::{ExecutionPolicy, ToolExecutor};
    use aigent_tools::ToolRegistry;
    use async_trait::async_trait;
    use futures::stream;
    use std::path::PathBuf;
    use std::pin::Pin;
    use tower::ServiceExt;

    struct EchoGateway;

    #[async_trait]
    impl LlmGateway for EchoGateway {
        async fn query(&self, _config: &GatewayConfig, _messages: &[ChatMessage]) -> Pin<Box<dyn futures::Stream<Item = StreamChunk> + Send>> {
            Box::pin(stream::iter(vec![StreamChunk::Content("hi there".to_string())]))
        }
    }

    async fn test_server() -> TransportServer {
        let dir = tempfile::tempdir().unwrap();
        let core = CoreMemoryStore::load(dir.path().join("core")).unwrap();
        let vector = VectorMemoryStore::load(dir.path().join("vector")).unwrap();
        let recall = RecallLog::open(dir.path().join("recall.redb")).unwrap();
        let embed: EmbedFn = Arc::new(|text: String| {
            Box::pin(async move { Ok(text.chars().map(|c| c as u32 as f32).collect()) })
        });
        let memory = Arc::new(MemoryStore::new(core, vector, recall, embed));
        let tools = Arc::new(ToolRegistry::default());
        let executor = Arc::new(ToolExecutor::new(ExecutionPolicy { workspace_root: PathBuf::from("."), ..ExecutionPolicy::default() }));
        let chat = Arc::new(ChatLoop::new(
            Arc::new(EchoGateway),
            "ollama/test".to_string(),
            8000,
            "be helpful".to_string(),
            memory.clone(),
            tools,
            executor,
            None,
            5,
        ));
        TransportServer::new(
            TransportConfig { bind_address: "127.0.0.1".to_string(), port: 0 },
            chat,
            memory,
            None,
        )
    }

    #[tokio::test]
    async fn health_reports_disabled_scheduler() {
        let server = test_server().await;
        let router = server.router();
        let response = router
            .oneshot(axum::http::Request::builder().uri("/health").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["sleep_agent"]["initialized"], false);
        assert_eq!(json["streaming_support"], true);
    }

    #[tokio::test]
    async fn chat_endpoint_returns_gateway_content() {
        let server = test_server().await;
        let router = server.router();
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/chat")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(serde_json::json!({ "message": "hello" }).to_string()))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["response"], "hi there");
        assert_eq!(json["status"], "success");
    }

    #[tokio::test]
    async fn clear_empties_history() {
        let server = test_server().await;
        let router = server.router();
        let chat_request = axum::http::Request::builder()
            .method("POST")
            .uri("/chat")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(serde_json::json!({ "message": "hello" }).to_string()))
            .unwrap();
        router.clone().oneshot(chat_request).await.unwrap();

        let clear_request = axum::http::Request::builder()
            .method("POST")
            .uri("/clear")
            .body(axum::body::Body::empty())
            .unwrap();
        router.clone().oneshot(clear_request).await.unwrap();

        let history_request = axum::http::Request::builder().uri("/history").body(axum::body::Body::empty()).unwrap();
        let response = router.oneshot(history_request).await.unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["history"].as_array().unwrap().len(), 0);
    }
}
