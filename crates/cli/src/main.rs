//! Process bootstrap (spec §6, §9): loads configuration, wires the memory
//! store, the two LLM gateway sessions, the tool registries, the chat loop,
//! and the sleep-time scheduler, then serves the HTTP/WebSocket transport
//! until the process is killed.
//!
//! Grounded on the teacher's `main.rs` (`dotenvy::dotenv()` +
//! `tracing_subscriber::fmt().with_env_filter(...)` startup sequence) and
//! `server/mod.rs::make_ollama_embed_fn` (the embedding closure shape),
//! generalized from an interactive TUI/daemon entry point to a single
//! non-interactive server process.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use aigent_config::AppConfig;
use aigent_exec::{default_registry, ExecutionPolicy, ToolExecutor};
use aigent_llm::HttpGateway;
use aigent_memory::{CoreMemoryStore, EmbedFn, MemoryStore, RecallLog, VectorMemoryStore};
use aigent_runtime::{ChatLoop, Scheduler, SchedulerParams};
use aigent_tools::ToolRegistry;
use aigent_transport::{TransportConfig, TransportServer};

#[derive(Debug, Parser)]
#[command(name = "aigent", version, about = "Conversational-AI backend with sleep-time memory curation")]
struct Cli {
    /// Path to the TOML configuration document (spec §6 Configuration).
    #[arg(long, default_value = "config/default.toml")]
    config: PathBuf,
}

fn init_tracing(config: &aigent_config::TelemetryConfig) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = tracing_subscriber::fmt::layer();

    match &config.log_file {
        Some(path) => {
            let path = PathBuf::from(path);
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| "aigent.log".to_string());
            let file_appender = tracing_appender::rolling::never(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            // Leaked deliberately: the guard must outlive the process, and the
            // process's only exit path is a kill signal.
            Box::leak(Box::new(guard));
            let file_layer = tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false);
            tracing_subscriber::registry().with(filter).with(stdout_layer).with(file_layer).init();
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stdout_layer).init();
        }
    }
}

/// Builds an async embedding function against Ollama's `/api/embeddings`
/// endpoint for `embed_model`.
fn make_ollama_embed_fn(model: &str, base_url: &str) -> EmbedFn {
    let model = model.to_string();
    let url = format!("{}/api/embeddings", base_url.trim_end_matches('/'));
    let client = reqwest::Client::builder().timeout(Duration::from_secs(30)).build().unwrap_or_default();

    Arc::new(move |text: String| {
        let client = client.clone();
        let url = url.clone();
        let model = model.clone();
        Box::pin(async move {
            let body = serde_json::json!({ "model": model, "prompt": text });
            let response = client.post(&url).json(&body).send().await
                .map_err(|e| aigent_config::AigentError::provider(e.to_string()))?;
            let json: serde_json::Value = response.json().await
                .map_err(|e| aigent_config::AigentError::provider(e.to_string()))?;
            let embedding: Vec<f32> = json["embedding"]
                .as_array()
                .ok_or_else(|| aigent_config::AigentError::provider("embeddings response missing 'embedding' array"))?
                .iter()
                .filter_map(|v| v.as_f64().map(|f| f as f32))
                .collect();
            Ok(embedding)
        })
    })
}

/// Builds the memory-editing tool set the sleep-time scheduler's secondary
/// reasoning loop uses exclusively (spec §4.6).
fn sleep_agent_registry(memory: Arc<MemoryStore>) -> ToolRegistry {
    use aigent_tools::builtins::{CoreMemoryEditTool, FinishEditsTool, VectorMemoryEditTool, VectorSearchTool};

    let mut registry = ToolRegistry::default();
    registry.register(Box::new(VectorSearchTool { memory: memory.clone(), top_n: 5, threshold: 0.4 }));
    registry.register(Box::new(VectorMemoryEditTool { memory: memory.clone() }));
    registry.register(Box::new(CoreMemoryEditTool { memory }));
    registry.register(Box::new(FinishEditsTool));
    registry
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config).with_context(|| format!("loading config from {}", cli.config.display()))?;

    init_tracing(&config.telemetry);
    tracing::info!(config_path = %cli.config.display(), "starting aigent backend");

    let core = CoreMemoryStore::load(&config.storage.core_dir)
        .with_context(|| format!("loading core memory from {}", config.storage.core_dir))?;
    let vector = VectorMemoryStore::load_with_cache(&config.storage.vector_dir, &config.storage.cache_file)
        .with_context(|| format!("loading vector memory from {}", config.storage.vector_dir))?;
    let recall_path = PathBuf::from(&config.storage.recall_dir).join("recall.redb");
    if let Some(parent) = recall_path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating recall directory {}", parent.display()))?;
    }
    let recall = RecallLog::open(&recall_path).with_context(|| format!("opening recall log at {}", recall_path.display()))?;
    let embed_fn = make_ollama_embed_fn(&config.llm.embed_model, &config.llm.ollama_base_url);
    let memory = Arc::new(MemoryStore::new(core, vector, recall, embed_fn));

    let gateway = Arc::new(HttpGateway::new());

    let workspace_root = PathBuf::from(&config.agent.workspace_path);
    let foreground_tools = Arc::new(default_registry(workspace_root.clone()));

    let policy = ExecutionPolicy::from_config(&config, workspace_root);
    let executor = Arc::new(ToolExecutor::new(policy));

    let static_system_prompt = "You are Aigent, a persistent memory-centric assistant.".to_string();

    let scheduler_enabled = config.scheduler.sleep_agent_message_trigger > 0;
    let (scheduler_handle, scheduler_task) = if scheduler_enabled {
        let sleep_tools = Arc::new(sleep_agent_registry(memory.clone()));
        let params = SchedulerParams {
            min_sleep_interval: config.scheduler.min_sleep_interval,
            max_sleep_interval: config.scheduler.max_sleep_interval,
            pause_delay_after_main: config.scheduler.pause_delay_after_main,
            max_concurrent_tasks: config.scheduler.max_concurrent_tasks,
            sleep_agent_context_tokens: config.tokens.sleep_agent_context,
            model_identifier: config.llm.sleep_agent_model.clone(),
            static_system_prompt: static_system_prompt.clone(),
        };
        let (scheduler, handle) = Scheduler::new(params, gateway.clone(), memory.clone(), sleep_tools);
        let scheduler = Arc::new(scheduler);
        let task = tokio::spawn(scheduler.run());
        (Some(handle), Some(task))
    } else {
        tracing::info!("sleep_agent_message_trigger <= 0; sleep-time scheduler disabled");
        (None, None)
    };

    let sleep_trigger = config.scheduler.sleep_agent_message_trigger.max(0) as usize;
    let chat = Arc::new(ChatLoop::new(
        gateway,
        config.llm.main_model.clone(),
        config.tokens.max_tokens,
        static_system_prompt,
        memory.clone(),
        foreground_tools,
        executor,
        scheduler_handle.clone(),
        sleep_trigger,
    ));

    let transport = TransportServer::new(
        TransportConfig { bind_address: config.transport.bind_address.clone(), port: config.transport.port },
        chat,
        memory,
        scheduler_handle.clone(),
    );

    let serve_result = transport.serve().await;

    if let Some(handle) = scheduler_handle {
        handle.shutdown();
    }
    if let Some(task) = scheduler_task {
        // Background tasks are daemonic (spec §5): don't let a stuck
        // process(task) block exit beyond a bounded join timeout.
        if tokio::time::timeout(Duration::from_secs(10), task).await.is_err() {
            tracing::warn!("sleep-time scheduler did not shut down within 10s; exiting anyway");
        }
    }

    serve_result
}
