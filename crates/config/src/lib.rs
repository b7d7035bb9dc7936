use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub mod error;
pub use error::AigentError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    pub workspace_path: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "Aigent".to_string(),
            workspace_path: ".".to_string(),
        }
    }
}

/// Model identifiers and the provider registry key (`scheme/path`, e.g.
/// `ollama/llama3.1:8b` or `openrouter/openai/gpt-4o-mini`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub main_model: String,
    pub sleep_agent_model: String,
    pub embed_model: String,
    pub ollama_base_url: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            main_model: "ollama/llama3.1:8b".to_string(),
            sleep_agent_model: "ollama/llama3.1:8b".to_string(),
            embed_model: "ollama/nomic-embed-text".to_string(),
            ollama_base_url: "http://localhost:11434".to_string(),
        }
    }
}

/// Token budgets referenced by the context manager and the sleep scheduler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    pub max_tokens: usize,
    pub sleep_agent_context: usize,
    pub compressor_max_tokens: usize,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            max_tokens: 8_000,
            sleep_agent_context: 4_000,
            compressor_max_tokens: 2_000,
        }
    }
}

/// Storage locations (§6 persisted state layout).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub context_dir: String,
    pub core_dir: String,
    pub vector_dir: String,
    /// Path to the durable embedding cache set (spec §3), a JSON file
    /// listing which vector-block labels currently have a fresh embedding.
    pub cache_file: String,
    pub recall_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            context_dir: ".aigent/context".to_string(),
            core_dir: ".aigent/memory/core".to_string(),
            vector_dir: ".aigent/memory/vector".to_string(),
            cache_file: ".aigent/memory/vector/.embedding_cache.json".to_string(),
            recall_dir: ".aigent/memory/recall".to_string(),
        }
    }
}

/// Sandbox tool family toggles and per-tool approval requirements.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub use_web: bool,
    pub use_filesystem: bool,
    /// Tool name → whether invoking it requires interactive user approval.
    pub approval_required: HashMap<String, bool>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        let mut approval_required = HashMap::new();
        approval_required.insert("run_shell".to_string(), true);
        approval_required.insert("write_file".to_string(), true);
        Self {
            use_web: false,
            use_filesystem: true,
            approval_required,
        }
    }
}

/// Sleep-time scheduler timing (§4.6, §6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Enqueue a memory task after every N user turns. `<= 0` disables the
    /// scheduler entirely.
    pub sleep_agent_message_trigger: i64,
    pub min_sleep_interval: f64,
    pub max_sleep_interval: f64,
    pub pause_delay_after_main: f64,
    /// Width of the concurrent-scheduler semaphore.
    pub max_concurrent_tasks: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sleep_agent_message_trigger: 5,
            min_sleep_interval: 5.0,
            max_sleep_interval: 60.0,
            pause_delay_after_main: 10.0,
            max_concurrent_tasks: 2,
        }
    }
}

/// HTTP + WebSocket bind address (§6 External Interfaces).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub bind_address: String,
    pub port: u16,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 8787,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
    pub log_file: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub llm: LlmConfig,
    pub tokens: TokenConfig,
    pub storage: StorageConfig,
    pub tools: ToolsConfig,
    pub scheduler: SchedulerConfig,
    pub transport: TransportConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("OLLAMA_BASE_URL") {
            if !value.is_empty() {
                config.llm.ollama_base_url = value;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// Whether `tool_name` requires interactive approval before running.
    /// Tools absent from the map default to not requiring approval.
    pub fn tool_requires_approval(&self, tool_name: &str) -> bool {
        self.tools.approval_required.get(tool_name).copied().unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = AppConfig::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        config.save_to(&path).unwrap();
        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.llm.main_model, config.llm.main_model);
        assert_eq!(loaded.scheduler.sleep_agent_message_trigger, 5);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = AppConfig::load_from("/nonexistent/path/does-not-exist.toml").unwrap();
        assert_eq!(config.transport.port, 8787);
    }

    #[test]
    fn tool_requires_approval_defaults_false_for_unknown_tool() {
        let config = AppConfig::default();
        assert!(!config.tool_requires_approval("roll_dice"));
        assert!(config.tool_requires_approval("run_shell"));
    }
}
