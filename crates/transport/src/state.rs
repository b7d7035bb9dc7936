//! Shared state handed to every Axum handler (spec §6).
//!
//! One process serves one conversation: the live context is a single
//! `Mutex<Vec<ChatMessage>>` guarded for the duration of a turn, which
//! serializes concurrent `/chat` and `/ws` requests against each other by
//! design (§5's single-user-per-process assumption).

use std::sync::Arc;

use aigent_llm::ChatMessage;
use aigent_memory::MemoryStore;
use aigent_runtime::{ChatLoop, SchedulerHandle};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

pub struct AppState {
    pub chat: Arc<ChatLoop>,
    pub memory: Arc<MemoryStore>,
    pub scheduler: Option<SchedulerHandle>,
    pub context: Arc<Mutex<Vec<ChatMessage>>>,
    pub started_at: DateTime<Utc>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(chat: Arc<ChatLoop>, memory: Arc<MemoryStore>, scheduler: Option<SchedulerHandle>) -> Self {
        Self {
            chat,
            memory,
            scheduler,
            context: Arc::new(Mutex::new(Vec::new())),
            started_at: Utc::now(),
        }
    }
}
