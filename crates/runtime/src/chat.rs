//! Chat reasoning loop (spec §4.5): the iterative tool-calling turn manager
//! that drives one foreground request from a user message to a final
//! `is_complete` chunk.
//!
//! Grounded on the teacher's `tool_loop.rs` (`run_tool_loop`,
//! `MAX_TOOL_ROUNDS` pattern — generalized from 5 to `MAX_LOOPS = 25` and
//! from "omit tools on last round" to the spec's sentinel-suffix-on-cap
//! behavior) and `runtime/chat.rs` (`respond_and_remember_stream`'s prompt
//! assembly order and channel-based streaming).

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use aigent_exec::ToolExecutor;
use aigent_llm::{ChatMessage, ChatRole, GatewayConfig, LlmGateway, Provider, StreamChunk};
use aigent_memory::MemoryStore;
use aigent_tools::{ToolCallRecord, ToolRegistry, ToolResultRecord};

use crate::context;
use crate::sleep::{MemoryTask, SchedulerHandle};
use crate::turn::run_model_turn;

/// Single-request iteration cap (spec §4.5).
pub const MAX_LOOPS: usize = 25;

const LOOP_CAP_SENTINEL: &str =
    "\n\n[reached the maximum number of reasoning iterations for this turn; stopping here]";

/// One chunk forwarded to the transport layer over the life of a request.
#[derive(Debug, Clone)]
pub enum TransportChunk {
    Thinking(String),
    Content(String),
    ToolCall { id: String, name: String, arguments: serde_json::Value },
    ToolResult { call_id: String, name: Option<String>, success: bool, content: String },
    Error(String),
    Done { is_complete: bool },
}

pub struct ChatLoop {
    gateway: Arc<dyn LlmGateway>,
    model_identifier: std::sync::RwLock<String>,
    max_tokens: usize,
    static_system_prompt: String,
    memory: Arc<MemoryStore>,
    tools: Arc<ToolRegistry>,
    executor: Arc<ToolExecutor>,
    scheduler: Option<SchedulerHandle>,
    sleep_trigger: usize,
    pending_turns: Mutex<Vec<ChatMessage>>,
    user_message_count: AtomicUsize,
}

impl ChatLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway: Arc<dyn LlmGateway>,
        model_identifier: String,
        max_tokens: usize,
        static_system_prompt: String,
        memory: Arc<MemoryStore>,
        tools: Arc<ToolRegistry>,
        executor: Arc<ToolExecutor>,
        scheduler: Option<SchedulerHandle>,
        sleep_trigger: usize,
    ) -> Self {
        Self {
            gateway,
            model_identifier: std::sync::RwLock::new(model_identifier),
            max_tokens,
            static_system_prompt,
            memory,
            tools,
            executor,
            scheduler,
            sleep_trigger,
            pending_turns: Mutex::new(Vec::new()),
            user_message_count: AtomicUsize::new(0),
        }
    }

    fn gateway_config(&self) -> GatewayConfig {
        let model_identifier = self.model_identifier.read().expect("model identifier lock poisoned").clone();
        let (provider, _) = Provider::parse_identifier(&model_identifier);
        GatewayConfig {
            provider,
            model_identifier,
            tool_schemas: Some(aigent_tools::specs_to_openai_tools(&self.tools.tool_schemas())),
            max_tokens: self.max_tokens,
            temperature: 0.7,
            think_level: None,
        }
    }

    /// `POST /set_model`: swap the primary model identifier used by the
    /// next turn onward.
    pub fn set_model(&self, model_identifier: String) {
        *self.model_identifier.write().expect("model identifier lock poisoned") = model_identifier;
    }

    pub fn current_model(&self) -> String {
        self.model_identifier.read().expect("model identifier lock poisoned").clone()
    }

    async fn record(&self, message: ChatMessage) {
        self.pending_turns.lock().await.push(message);
    }

    /// Run one full request/response turn, appending to `context` in place
    /// and forwarding typed chunks over `chunks` as they're produced.
    pub async fn run_turn(&self, context: &mut Vec<ChatMessage>, user_message: String, chunks: mpsc::Sender<TransportChunk>) {
        if let Some(scheduler) = &self.scheduler {
            scheduler.notify_foreground_start().await;
        }

        let user_msg = ChatMessage::user(user_message);
        context.push(user_msg.clone());
        self.record(user_msg).await;
        let message_count = self.user_message_count.fetch_add(1, Ordering::SeqCst) + 1;

        let mut k = 0usize;
        let mut hit_cap = false;
        let mut terminal_error = false;

        loop {
            if k >= MAX_LOOPS {
                hit_cap = true;
                break;
            }

            let snapshot = self.memory.snapshot().await;
            let system_messages = vec![ChatMessage::system(format!("{}\n{}", self.static_system_prompt, snapshot))];

            let (kept, trimmed) = context::trim(std::mem::take(context), self.max_tokens, &system_messages);
            if !trimmed.is_empty() {
                for message in &trimmed {
                    if let Some(content) = &message.content {
                        let _ = self.memory.recall_append(role_label(&message.role), content);
                    }
                }
            }
            *context = kept;

            let config = self.gateway_config();
            let mut prompt = system_messages;
            prompt.extend(context.iter().cloned());

            let tx = chunks.clone();
            let turn = run_model_turn(self.gateway.as_ref(), &config, &prompt, move |chunk| {
                if let Some(transport_chunk) = to_transport_chunk(chunk) {
                    let _ = tx.try_send(transport_chunk);
                }
            }).await;

            if let Some(error) = turn.error {
                warn!(loop_k = k, %error, "llm gateway stream error; terminating turn");
                if !turn.content.is_empty() {
                    context.push(ChatMessage::assistant(turn.content));
                }
                let _ = chunks.send(TransportChunk::Error(error)).await;
                terminal_error = true;
                break;
            }

            let assistant_msg = ChatMessage::assistant_with_tool_calls(turn.content.clone(), turn.tool_calls.clone());
            context.push(assistant_msg.clone());
            self.record(assistant_msg).await;

            info!(loop_k = k, tool_call_count = turn.tool_calls.len(), "chat loop iteration complete");

            if turn.tool_calls.is_empty() {
                break;
            }

            let calls: Vec<ToolCallRecord> = turn.tool_calls.iter()
                .map(|tc| ToolCallRecord { id: tc.id.clone(), name: tc.function.name.clone(), arguments: tc.function.arguments.clone() })
                .collect();
            let results = self.executor.process_batch(&self.tools, &calls).await;

            let mut produced = 0usize;
            for result in &results {
                let (call_id, name, success, content) = describe_result(result);
                let tool_msg = ChatMessage::tool_result(call_id.clone(), content.clone());
                context.push(tool_msg.clone());
                self.record(tool_msg).await;
                let _ = chunks.send(TransportChunk::ToolResult { call_id, name, success, content }).await;
                produced += 1;
            }

            if produced == 0 {
                break;
            }
            k += 1;
        }

        if hit_cap {
            warn!(loop_k = k, "chat loop hit MAX_LOOPS");
            context.push(ChatMessage::assistant(LOOP_CAP_SENTINEL));
        }

        if !terminal_error {
            let _ = chunks.send(TransportChunk::Done { is_complete: true }).await;
        }

        if let Some(scheduler) = &self.scheduler {
            scheduler.notify_foreground_end().await;
        }

        if message_count >= self.sleep_trigger {
            self.user_message_count.store(0, Ordering::SeqCst);
            let handoff: Vec<ChatMessage> = std::mem::take(&mut *self.pending_turns.lock().await);
            if let Some(scheduler) = &self.scheduler {
                scheduler.enqueue_task(MemoryTask { id: uuid::Uuid::new_v4().to_string(), context: handoff }).await;
            }
        }
    }
}

fn role_label(role: &ChatRole) -> &'static str {
    match role {
        ChatRole::System => "system",
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
        ChatRole::Tool => "tool",
    }
}

fn to_transport_chunk(chunk: &StreamChunk) -> Option<TransportChunk> {
    match chunk {
        StreamChunk::Content(delta) => Some(TransportChunk::Content(delta.clone())),
        StreamChunk::Thinking(delta) => Some(TransportChunk::Thinking(delta.clone())),
        StreamChunk::ToolCall { id, name, arguments } => Some(TransportChunk::ToolCall {
            id: id.clone(),
            name: name.clone(),
            arguments: arguments.clone(),
        }),
        StreamChunk::Error(_) => None,
    }
}

fn describe_result(result: &ToolResultRecord) -> (String, Option<String>, bool, String) {
    match result {
        ToolResultRecord::Ok { call_id, name, result } => {
            let content = match result {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (call_id.clone(), Some(name.clone()), true, content)
        }
        ToolResultRecord::Err { call_id, name, error } => (call_id.clone(), name.clone(), false, error.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aigent_exec::ExecutionPolicy;
    use aigent_memory::{CoreMemoryStore, RecallLog, VectorMemoryStore};
    use async_trait::async_trait;
    use futures::stream;
    use std::path::PathBuf;
    use std::pin::Pin;

    struct ScriptedGateway {
        rounds: Mutex<std::collections::VecDeque<Vec<StreamChunk>>>,
    }

    #[async_trait]
    impl LlmGateway for ScriptedGateway {
        async fn query(&self, _config: &GatewayConfig, _messages: &[ChatMessage]) -> Pin<Box<dyn futures::Stream<Item = StreamChunk> + Send>> {
            let chunks = self.rounds.lock().await.pop_front().unwrap_or_default();
            Box::pin(stream::iter(chunks))
        }
    }

    async fn memory_store(dir: &tempfile::TempDir) -> Arc<MemoryStore> {
        let core = CoreMemoryStore::load(dir.path().join("core")).unwrap();
        let vector = VectorMemoryStore::load(dir.path().join("vector")).unwrap();
        let recall = RecallLog::open(dir.path().join("recall.redb")).unwrap();
        let embed: aigent_memory::EmbedFn = Arc::new(|text: String| {
            Box::pin(async move { Ok(text.chars().map(|c| c as u32 as f32).collect()) })
        });
        Arc::new(MemoryStore::new(core, vector, recall, embed))
    }

    fn chat_loop(gateway: Arc<dyn LlmGateway>, memory: Arc<MemoryStore>, tools: Arc<ToolRegistry>, sleep_trigger: usize) -> ChatLoop {
        let executor = Arc::new(ToolExecutor::new(ExecutionPolicy { workspace_root: PathBuf::from("."), ..ExecutionPolicy::default() }));
        ChatLoop::new(
            gateway,
            "ollama/test".to_string(),
            8000,
            "you are a helpful assistant".to_string(),
            memory,
            tools,
            executor,
            None,
            sleep_trigger,
        )
    }

    #[tokio::test]
    async fn turn_without_tool_calls_completes_after_one_round() {
        let dir = tempfile::tempdir().unwrap();
        let memory = memory_store(&dir).await;
        let tools = Arc::new(ToolRegistry::default());
        let gateway = Arc::new(ScriptedGateway {
            rounds: Mutex::new(std::collections::VecDeque::from([vec![StreamChunk::Content("hello there".to_string())]])),
        });
        let chat = chat_loop(gateway, memory, tools, 5);

        let mut context = Vec::new();
        let (tx, mut rx) = mpsc::channel(32);
        chat.run_turn(&mut context, "hi".to_string(), tx).await;

        let mut saw_done = false;
        while let Ok(chunk) = rx.try_recv() {
            if let TransportChunk::Done { is_complete } = chunk {
                saw_done = is_complete;
            }
        }
        assert!(saw_done);
        assert_eq!(context.len(), 2);
        assert_eq!(context[0].role, ChatRole::User);
        assert_eq!(context[1].content.as_deref(), Some("hello there"));
    }

    #[tokio::test]
    async fn turn_executes_tool_call_and_appends_result() {
        let dir = tempfile::tempdir().unwrap();
        let memory = memory_store(&dir).await;
        let mut registry = ToolRegistry::default();
        registry.register(Box::new(aigent_tools::builtins::RollDiceTool));
        let tools = Arc::new(registry);

        let gateway = Arc::new(ScriptedGateway {
            rounds: Mutex::new(std::collections::VecDeque::from([
                vec![StreamChunk::ToolCall { id: "1".to_string(), name: "roll_dice".to_string(), arguments: serde_json::json!({"dice_str": "2d6"}) }],
                vec![StreamChunk::Content("you rolled something".to_string())],
            ])),
        });
        let chat = chat_loop(gateway, memory, tools, 5);

        let mut context = Vec::new();
        let (tx, _rx) = mpsc::channel(32);
        chat.run_turn(&mut context, "roll some dice".to_string(), tx).await;

        assert!(context.iter().any(|m| m.role == ChatRole::Tool));
        assert_eq!(context.last().unwrap().content.as_deref(), Some("you rolled something"));
    }

    #[tokio::test]
    async fn loop_cap_appends_sentinel_when_tools_never_stop() {
        let dir = tempfile::tempdir().unwrap();
        let memory = memory_store(&dir).await;
        let mut registry = ToolRegistry::default();
        registry.register(Box::new(aigent_tools::builtins::RollDiceTool));
        let tools = Arc::new(registry);

        let endless = vec![StreamChunk::ToolCall { id: "1".to_string(), name: "roll_dice".to_string(), arguments: serde_json::json!({"dice_str": "1d6"}) }];
        let rounds: std::collections::VecDeque<Vec<StreamChunk>> = std::iter::repeat(endless).take(MAX_LOOPS + 2).collect();
        let gateway = Arc::new(ScriptedGateway { rounds: Mutex::new(rounds) });
        let chat = chat_loop(gateway, memory, tools, 5);

        let mut context = Vec::new();
        let (tx, _rx) = mpsc::channel(64);
        chat.run_turn(&mut context, "keep rolling".to_string(), tx).await;

        let last_content = context.last().unwrap().content.clone().unwrap_or_default();
        assert!(last_content.contains("maximum number of reasoning iterations"));
    }

    #[tokio::test]
    async fn error_chunk_terminates_loop_and_surfaces_error() {
        let dir = tempfile::tempdir().unwrap();
        let memory = memory_store(&dir).await;
        let tools = Arc::new(ToolRegistry::default());
        let gateway = Arc::new(ScriptedGateway {
            rounds: Mutex::new(std::collections::VecDeque::from([vec![
                StreamChunk::Content("partial answer".to_string()),
                StreamChunk::Error("provider timed out".to_string()),
            ]])),
        });
        let chat = chat_loop(gateway, memory, tools, 5);

        let mut context = Vec::new();
        let (tx, mut rx) = mpsc::channel(32);
        chat.run_turn(&mut context, "hi".to_string(), tx).await;

        assert_eq!(context.last().unwrap().content.as_deref(), Some("partial answer"));
        let mut saw_error = false;
        while let Ok(chunk) = rx.try_recv() {
            if matches!(chunk, TransportChunk::Error(_)) {
                saw_error = true;
            }
        }
        assert!(saw_error);
    }
}
