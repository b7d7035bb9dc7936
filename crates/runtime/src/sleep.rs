//! Sleep-time memory-curation scheduler (spec §4.6): a background state
//! machine that drains a queue of [`MemoryTask`]s through a bounded
//! secondary reasoning loop whenever the foreground chat loop has been
//! quiet for a while.
//!
//! Grounded on the original prototype's `SleepTimeAgent`/`AgentState`
//! (`_should_pause`, `_calculate_sleep_time`, the "no tools called" nudge)
//! for the FSM shape, and on the teacher's `run_unified_daemon` background
//! task layout (`watch::channel` shutdown, bounded join) for the Rust task
//! idioms.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::time::sleep;
use tracing::{info, instrument, warn};

use aigent_llm::{ChatMessage, GatewayConfig, LlmGateway};
use aigent_memory::MemoryStore;
use aigent_tools::{ToolCallRecord, ToolRegistry};

use crate::context;
use crate::turn::run_model_turn;

/// A bounded reasoning loop never runs more than this many iterations
/// regardless of whether the model keeps asking for more tool calls.
pub const MAX_PROCESS_ITERATIONS: usize = 10;

const PAUSE_POLL_INTERVAL: Duration = Duration::from_secs(2);
const NUDGE_MESSAGE: &str =
    "No tool call was made this iteration. Call a memory tool (vector_search, \
     vector_memory_edit, core_memory_edit) or finish_edits if no further edits are needed.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Processing,
    Paused,
    Shutdown,
}

/// A private, owned snapshot of conversation turns handed off from the
/// foreground loop — the scheduler never mutates the live chat context.
#[derive(Debug, Clone)]
pub struct MemoryTask {
    pub id: String,
    pub context: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemEventKind {
    ForegroundStart,
    ForegroundEnd,
}

#[derive(Debug, Clone)]
pub struct SystemEvent {
    pub kind: SystemEventKind,
}

struct Inner {
    state: SchedulerState,
    foreground_active: bool,
    last_foreground_activity: DateTime<Utc>,
    current_interval: f64,
}

/// Configuration the scheduler needs from `SchedulerConfig` plus the model
/// identifier for its secondary gateway session.
#[derive(Debug, Clone)]
pub struct SchedulerParams {
    pub min_sleep_interval: f64,
    pub max_sleep_interval: f64,
    pub pause_delay_after_main: f64,
    pub max_concurrent_tasks: usize,
    pub sleep_agent_context_tokens: usize,
    pub model_identifier: String,
    pub static_system_prompt: String,
}

/// A point-in-time view of the scheduler's state for `/sleep_agent/status`.
#[derive(Debug, Clone)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub queue_size: usize,
    pub foreground_active: bool,
    pub last_foreground_activity: DateTime<Utc>,
}

/// Cheaply-cloned front door for submitting tasks and foreground signals.
/// The scheduler's two long-lived loops (main, event) live behind this.
#[derive(Clone)]
pub struct SchedulerHandle {
    task_queue: Arc<Mutex<VecDeque<MemoryTask>>>,
    events: mpsc::Sender<SystemEvent>,
    inner: Arc<Mutex<Inner>>,
    shutdown: watch::Sender<bool>,
    model_identifier: Arc<std::sync::RwLock<String>>,
}

impl SchedulerHandle {
    pub async fn enqueue_task(&self, task: MemoryTask) {
        self.task_queue.lock().await.push_back(task);
    }

    pub async fn notify_foreground_start(&self) {
        let _ = self.events.send(SystemEvent { kind: SystemEventKind::ForegroundStart }).await;
    }

    pub async fn notify_foreground_end(&self) {
        let _ = self.events.send(SystemEvent { kind: SystemEventKind::ForegroundEnd }).await;
    }

    pub async fn state(&self) -> SchedulerState {
        self.inner.lock().await.state
    }

    /// Snapshot for `GET /sleep_agent/status` (spec §6): current state,
    /// queue depth, and the foreground-activity fields the pause gate
    /// reads from.
    pub async fn status(&self) -> SchedulerStatus {
        let queue_size = self.task_queue.lock().await.len();
        let inner = self.inner.lock().await;
        SchedulerStatus {
            state: inner.state,
            queue_size,
            foreground_active: inner.foreground_active,
            last_foreground_activity: inner.last_foreground_activity,
        }
    }

    /// `POST /set_sleep_model`: swap the secondary model identifier used by
    /// the next `process(task)` iteration onward.
    pub fn set_model(&self, model_identifier: String) {
        *self.model_identifier.write().expect("model identifier lock poisoned") = model_identifier;
    }

    pub fn current_model(&self) -> String {
        self.model_identifier.read().expect("model identifier lock poisoned").clone()
    }

    /// Cooperative shutdown: sets the flag observed at every suspension
    /// point in the main/event loops. Does not forcibly abort in-flight
    /// `process(task)` work; callers join with their own deadline.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

pub struct Scheduler {
    params: SchedulerParams,
    gateway: Arc<dyn LlmGateway>,
    memory: Arc<MemoryStore>,
    tools: Arc<ToolRegistry>,
    task_queue: Arc<Mutex<VecDeque<MemoryTask>>>,
    inner: Arc<Mutex<Inner>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    events_tx: mpsc::Sender<SystemEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<SystemEvent>>>,
    semaphore: Arc<Semaphore>,
    model_identifier: Arc<std::sync::RwLock<String>>,
}

impl Scheduler {
    pub fn new(params: SchedulerParams, gateway: Arc<dyn LlmGateway>, memory: Arc<MemoryStore>, tools: Arc<ToolRegistry>) -> (Self, SchedulerHandle) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::channel(64);
        let task_queue = Arc::new(Mutex::new(VecDeque::new()));
        let inner = Arc::new(Mutex::new(Inner {
            state: SchedulerState::Idle,
            foreground_active: false,
            last_foreground_activity: Utc::now(),
            current_interval: params.min_sleep_interval,
        }));
        let semaphore = Arc::new(Semaphore::new(params.max_concurrent_tasks.max(1)));
        let model_identifier = Arc::new(std::sync::RwLock::new(params.model_identifier.clone()));

        let handle = SchedulerHandle {
            task_queue: task_queue.clone(),
            events: events_tx.clone(),
            inner: inner.clone(),
            shutdown: shutdown_tx.clone(),
            model_identifier: model_identifier.clone(),
        };

        let scheduler = Self {
            params,
            gateway,
            memory,
            tools,
            task_queue,
            inner,
            shutdown_tx,
            shutdown_rx,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            semaphore,
            model_identifier,
        };

        (scheduler, handle)
    }

    /// Runs the main loop and the event loop concurrently until shutdown.
    /// Consumes `self` — intended to be the body of a single `tokio::spawn`
    /// at process bootstrap.
    pub async fn run(self: Arc<Self>) {
        let events_rx = self.events_rx.lock().await.take();
        let Some(events_rx) = events_rx else {
            warn!("Scheduler::run called more than once; ignoring");
            return;
        };

        let main = self.clone().run_main_loop();
        let events = self.clone().run_event_loop(events_rx);
        tokio::join!(main, events);
    }

    async fn should_pause(&self) -> bool {
        let inner = self.inner.lock().await;
        if inner.foreground_active {
            return true;
        }
        let elapsed = (Utc::now() - inner.last_foreground_activity).num_milliseconds() as f64 / 1000.0;
        elapsed < self.params.pause_delay_after_main
    }

    async fn set_state(&self, state: SchedulerState) {
        self.inner.lock().await.state = state;
    }

    async fn next_backoff_interval(&self) -> f64 {
        let mut inner = self.inner.lock().await;
        let next = (inner.current_interval * 1.5).min(self.params.max_sleep_interval);
        inner.current_interval = next;
        next
    }

    async fn reset_backoff(&self) {
        self.inner.lock().await.current_interval = self.params.min_sleep_interval;
    }

    #[instrument(skip(self))]
    async fn run_main_loop(self: Arc<Self>) {
        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            if self.should_pause().await {
                self.set_state(SchedulerState::Paused).await;
                sleep(PAUSE_POLL_INTERVAL).await;
                continue;
            }

            let task = self.task_queue.lock().await.pop_front();
            match task {
                Some(task) => {
                    self.set_state(SchedulerState::Processing).await;
                    self.reset_backoff().await;
                    let permit = self.semaphore.clone().acquire_owned().await.expect("semaphore never closed");
                    let scheduler = self.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(e) = scheduler.process(task).await {
                            warn!(error = %e, "sleep-time memory task failed");
                        }
                    });
                }
                None => {
                    self.set_state(SchedulerState::Idle).await;
                    let interval = self.next_backoff_interval().await;
                    sleep(Duration::from_secs_f64(interval)).await;
                }
            }
        }
        self.set_state(SchedulerState::Shutdown).await;
        self.task_queue.lock().await.clear();
    }

    #[instrument(skip(self, events_rx))]
    async fn run_event_loop(self: Arc<Self>, mut events_rx: mpsc::Receiver<SystemEvent>) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                event = events_rx.recv() => {
                    let Some(event) = event else { break };
                    let mut inner = self.inner.lock().await;
                    inner.last_foreground_activity = Utc::now();
                    inner.foreground_active = matches!(event.kind, SystemEventKind::ForegroundStart);
                }
            }
        }
    }

    fn gateway_config(&self) -> GatewayConfig {
        let model_identifier = self.model_identifier.read().expect("model identifier lock poisoned").clone();
        let (provider, _) = aigent_llm::Provider::parse_identifier(&model_identifier);
        GatewayConfig {
            provider,
            model_identifier,
            tool_schemas: Some(aigent_tools::specs_to_openai_tools(&self.tools.tool_schemas())),
            max_tokens: self.params.sleep_agent_context_tokens,
            temperature: 0.2,
            think_level: None,
        }
    }

    /// Runs the bounded reasoning loop for one task (spec §4.6, `process(task)`).
    #[instrument(skip(self, task), fields(task_id = %task.id))]
    async fn process(&self, task: MemoryTask) -> anyhow::Result<()> {
        let mut private_context = task.context;

        for iteration in 0..MAX_PROCESS_ITERATIONS {
            let snapshot = self.memory.snapshot().await;
            let system_messages = vec![ChatMessage::system(format!("{}\n{}", self.params.static_system_prompt, snapshot))];

            let (kept, _trimmed) = context::trim(
                std::mem::take(&mut private_context),
                self.params.sleep_agent_context_tokens,
                &system_messages,
            );
            private_context = kept;

            let mut prompt = system_messages;
            prompt.extend(private_context.iter().cloned());

            let config = self.gateway_config();
            let turn = run_model_turn(self.gateway.as_ref(), &config, &prompt, |_| {}).await;

            if let Some(error) = turn.error {
                warn!(%error, iteration, "sleep agent stream error; aborting task");
                return Ok(());
            }

            let assistant_msg = ChatMessage::assistant_with_tool_calls(turn.content.clone(), turn.tool_calls.clone());
            private_context.push(assistant_msg);

            if turn.tool_calls.is_empty() {
                private_context.push(ChatMessage::user(NUDGE_MESSAGE));
                info!(iteration, "sleep agent issued no tool calls; nudging");
                continue;
            }

            let finished = turn.tool_calls.iter().any(|tc| tc.function.name == "finish_edits");

            let calls: Vec<ToolCallRecord> = turn.tool_calls.iter()
                .map(|tc| ToolCallRecord { id: tc.id.clone(), name: tc.function.name.clone(), arguments: tc.function.arguments.clone() })
                .collect();
            let results = self.tools.process_batch(&calls).await;
            for result in &results {
                let (call_id, content) = result_message(result);
                private_context.push(ChatMessage::tool_result(call_id, content));
            }

            info!(iteration, tool_call_count = calls.len(), "sleep agent iteration complete");

            if finished {
                return Ok(());
            }
        }

        warn!(task_id = %task.id, "sleep agent hit MAX_PROCESS_ITERATIONS without finish_edits");
        Ok(())
    }
}

fn result_message(result: &aigent_tools::ToolResultRecord) -> (String, String) {
    match result {
        aigent_tools::ToolResultRecord::Ok { call_id, result, .. } => {
            let content = match result {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (call_id.clone(), content)
        }
        aigent_tools::ToolResultRecord::Err { call_id, error, .. } => (call_id.clone(), format!("error: {error}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aigent_llm::{Provider, StreamChunk};
    use aigent_memory::{CoreMemoryStore, RecallLog, VectorMemoryStore};
    use aigent_tools::builtins::{CoreMemoryEditTool, FinishEditsTool, VectorMemoryEditTool, VectorSearchTool};
    use async_trait::async_trait;
    use futures::stream;
    use std::pin::Pin;

    struct ScriptedGateway {
        rounds: Mutex<VecDeque<Vec<StreamChunk>>>,
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

    fn sleep_tools(memory: Arc<MemoryStore>) -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::default();
        registry.register(Box::new(VectorSearchTool { memory: memory.clone(), top_n: 3, threshold: 0.0 }));
        registry.register(Box::new(VectorMemoryEditTool { memory: memory.clone() }));
        registry.register(Box::new(CoreMemoryEditTool { memory }));
        registry.register(Box::new(FinishEditsTool));
        Arc::new(registry)
    }

    fn params() -> SchedulerParams {
        SchedulerParams {
            min_sleep_interval: 5.0,
            max_sleep_interval: 60.0,
            pause_delay_after_main: 10.0,
            max_concurrent_tasks: 2,
            sleep_agent_context_tokens: 4000,
            model_identifier: "ollama/test-sleep".to_string(),
            static_system_prompt: "you curate memory".to_string(),
        }
    }

    #[tokio::test]
    async fn process_terminates_on_finish_edits() {
        let dir = tempfile::tempdir().unwrap();
        let memory = memory_store(&dir).await;
        let tools = sleep_tools(memory.clone());
        let gateway = Arc::new(ScriptedGateway {
            rounds: Mutex::new(VecDeque::from([vec![StreamChunk::ToolCall {
                id: "1".to_string(),
                name: "finish_edits".to_string(),
                arguments: serde_json::json!({}),
            }]])),
        });
        let (scheduler, _handle) = Scheduler::new(params(), gateway, memory, tools);
        let task = MemoryTask { id: "t1".to_string(), context: vec![ChatMessage::user("please review recent memories")] };
        scheduler.process(task).await.unwrap();
    }

    #[tokio::test]
    async fn process_nudges_when_no_tool_call_then_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let memory = memory_store(&dir).await;
        let tools = sleep_tools(memory.clone());
        let gateway = Arc::new(ScriptedGateway {
            rounds: Mutex::new(VecDeque::from([
                vec![StreamChunk::Content("thinking about it".to_string())],
                vec![StreamChunk::ToolCall { id: "1".to_string(), name: "finish_edits".to_string(), arguments: serde_json::json!({}) }],
            ])),
        });
        let (scheduler, _handle) = Scheduler::new(params(), gateway, memory, tools);
        let task = MemoryTask { id: "t2".to_string(), context: vec![] };
        scheduler.process(task).await.unwrap();
    }

    #[tokio::test]
    async fn process_stops_at_iteration_cap_without_finish_edits() {
        let dir = tempfile::tempdir().unwrap();
        let memory = memory_store(&dir).await;
        let tools = sleep_tools(memory.clone());
        let endless_round = vec![StreamChunk::ToolCall {
            id: "1".to_string(),
            name: "vector_search".to_string(),
            arguments: serde_json::json!({"query": "anything"}),
        }];
        let rounds: VecDeque<Vec<StreamChunk>> = std::iter::repeat(endless_round).take(MAX_PROCESS_ITERATIONS + 5).collect();
        let gateway = Arc::new(ScriptedGateway { rounds: Mutex::new(rounds) });
        let (scheduler, _handle) = Scheduler::new(params(), gateway, memory, tools);
        let task = MemoryTask { id: "t3".to_string(), context: vec![] };
        // Never calls finish_edits; must return via the iteration cap, not hang.
        scheduler.process(task).await.unwrap();
    }

    #[tokio::test]
    async fn should_pause_true_immediately_after_construction() {
        let dir = tempfile::tempdir().unwrap();
        let memory = memory_store(&dir).await;
        let tools = sleep_tools(memory.clone());
        let gateway = Arc::new(ScriptedGateway { rounds: Mutex::new(VecDeque::new()) });
        let (scheduler, _handle) = Scheduler::new(params(), gateway, memory, tools);
        assert!(scheduler.should_pause().await);
    }

    #[tokio::test]
    async fn foreground_start_event_sets_pause_flag() {
        let dir = tempfile::tempdir().unwrap();
        let memory = memory_store(&dir).await;
        let tools = sleep_tools(memory.clone());
        let gateway = Arc::new(ScriptedGateway { rounds: Mutex::new(VecDeque::new()) });
        let (scheduler, handle) = Scheduler::new(params(), gateway, memory, tools);
        let scheduler = Arc::new(scheduler);

        let events_rx = scheduler.events_rx.lock().await.take().unwrap();
        let event_loop = tokio::spawn(scheduler.clone().run_event_loop(events_rx));

        handle.notify_foreground_start().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(scheduler.inner.lock().await.foreground_active);

        handle.shutdown();
        let _ = event_loop.await;
    }

    #[tokio::test]
    async fn backoff_caps_at_max_sleep_interval() {
        let dir = tempfile::tempdir().unwrap();
        let memory = memory_store(&dir).await;
        let tools = sleep_tools(memory.clone());
        let gateway = Arc::new(ScriptedGateway { rounds: Mutex::new(VecDeque::new()) });
        let mut p = params();
        p.min_sleep_interval = 5.0;
        p.max_sleep_interval = 8.0;
        let (scheduler, _handle) = Scheduler::new(p, gateway, memory, tools);

        let first = scheduler.next_backoff_interval().await;
        let second = scheduler.next_backoff_interval().await;
        let third = scheduler.next_backoff_interval().await;
        assert!(first > 5.0 && first <= 8.0);
        assert!(second <= 8.0);
        assert_eq!(third, 8.0);
    }
}
