//! Provider-agnostic LLM gateway (spec §4.1).
//!
//! `LlmGateway::query` opens a streaming session against one provider and
//! yields a lazy stream of typed [`StreamChunk`]s: incremental `Content`
//! deltas, incremental `Thinking` deltas (split out of `<think>…</think>`
//! markers so callers never see the raw tags), fully-formed `ToolCall`
//! records, or a terminal `Error`. The gateway is stateless across calls
//! except for the thinking-split cursor, which lives for the duration of a
//! single stream.

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub mod thinking;

use thinking::ThinkSplitter;

// ── Chat message types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: Some(content.into()), tool_calls: vec![], tool_call_id: None }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: Some(content.into()), tool_calls: vec![], tool_call_id: None }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: Some(content.into()), tool_calls: vec![], tool_call_id: None }
    }
    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        let content = content.into();
        Self {
            role: ChatRole::Assistant,
            content: if content.is_empty() { None } else { Some(content) },
            tool_calls,
            tool_call_id: None,
        }
    }
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self { role: ChatRole::Tool, content: Some(content.into()), tool_calls: vec![], tool_call_id: Some(tool_call_id.into()) }
    }

    /// Rough wire-size estimate used for token accounting (see `token_estimate`
    /// in `aigent-runtime::context`): role tag + content + serialized tool calls.
    pub fn serialize_for_estimate(&self) -> String {
        let mut s = format!("{:?}:", self.role);
        if let Some(content) = &self.content {
            s.push_str(content);
        }
        for call in &self.tool_calls {
            s.push_str(&call.function.name);
            s.push_str(&call.function.arguments.to_string());
        }
        s
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_tool_call_type")]
    pub r#type: String,
    pub function: ToolCallFunction,
}

fn default_tool_call_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

// ── Typed stream chunks (redesign: replaces raw token callbacks) ────────────

/// One typed increment of a streamed response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StreamChunk {
    /// Incremental text delta from the model's normal output channel.
    Content(String),
    /// Incremental text delta from an internal reasoning channel. The
    /// `<think>`/`</think>` markers that wrapped it on the wire are stripped
    /// before the consumer ever sees this variant.
    Thinking(String),
    /// A fully-formed tool invocation.
    ToolCall { id: String, name: String, arguments: serde_json::Value },
    /// Terminal: the stream ends after this chunk.
    Error(String),
}

/// Construction parameters for a gateway session (spec §4.1).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub provider: Provider,
    pub model_identifier: String,
    pub tool_schemas: Option<serde_json::Value>,
    pub max_tokens: usize,
    pub temperature: f32,
    pub think_level: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Provider {
    Ollama,
    OpenRouter,
}

impl Provider {
    /// Resolve a `scheme/path` model identifier (spec redesign note: provider
    /// branching by string prefix becomes a registry keyed by scheme) into
    /// `(provider, model_path)`.
    pub fn parse_identifier(identifier: &str) -> (Self, &str) {
        match identifier.split_once('/') {
            Some(("ollama", rest)) => (Provider::Ollama, rest),
            Some(("openrouter", rest)) => (Provider::OpenRouter, rest),
            _ => (Provider::Ollama, identifier),
        }
    }
}

/// A single streaming query against one provider. Stateless across calls
/// except for the thinking-split cursor, which is local to each `query`.
#[async_trait]
pub trait LlmGateway: Send + Sync {
    /// Open a streaming session. The returned stream is finite; dropping it
    /// cancels the underlying request.
    async fn query(
        &self,
        config: &GatewayConfig,
        messages: &[ChatMessage],
    ) -> Pin<Box<dyn Stream<Item = StreamChunk> + Send>>;
}

#[derive(Debug, Clone, Default)]
pub struct HttpGateway {
    ollama: OllamaClient,
    openrouter: OpenRouterClient,
}

impl HttpGateway {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LlmGateway for HttpGateway {
    async fn query(
        &self,
        config: &GatewayConfig,
        messages: &[ChatMessage],
    ) -> Pin<Box<dyn Stream<Item = StreamChunk> + Send>> {
        let (tx, rx) = mpsc::channel::<StreamChunk>(64);
        let config = config.clone();
        let messages = messages.to_vec();
        let gateway = self.clone();

        tokio::spawn(async move {
            let result = match config.provider {
                Provider::Ollama => gateway.ollama.stream_chat(&config, &messages, &tx).await,
                Provider::OpenRouter => gateway.openrouter.stream_chat(&config, &messages, &tx).await,
            };
            if let Err(err) = result {
                let _ = tx.send(StreamChunk::Error(err.to_string())).await;
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }
}

// ── Ollama client ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
}

impl Default for OllamaClient {
    fn default() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl OllamaClient {
    async fn stream_chat(
        &self,
        config: &GatewayConfig,
        messages: &[ChatMessage],
        tx: &mpsc::Sender<StreamChunk>,
    ) -> anyhow::Result<()> {
        let base_url = std::env::var("OLLAMA_BASE_URL").unwrap_or_else(|_| "http://localhost:11434".to_string());
        let endpoint = format!("{}/api/chat", base_url.trim_end_matches('/'));
        let (_, model) = Provider::parse_identifier(&config.model_identifier);

        let mut payload = json!({
            "model": model,
            "messages": messages_to_ollama(messages),
            "stream": true,
            "options": { "temperature": config.temperature },
        });
        if let Some(tools) = &config.tool_schemas {
            payload["tools"] = tools.clone();
        }

        let mut response = self.client.post(&endpoint).json(&payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("ollama error ({status}): {body}");
        }

        let mut splitter = ThinkSplitter::new();
        while let Some(chunk) = response.chunk().await? {
            let text = String::from_utf8_lossy(&chunk);
            for line in text.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else { continue };
                if let Some(content) = value.get("message").and_then(|m| m.get("content")).and_then(|v| v.as_str()) {
                    for piece in splitter.feed(content) {
                        if tx.send(piece).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                if value.get("done").and_then(|v| v.as_bool()).unwrap_or(false) {
                    if let Some(calls) = value.get("message").and_then(|m| m.get("tool_calls")).and_then(|v| v.as_array()) {
                        for chunk in parse_ollama_tool_calls(calls) {
                            if tx.send(chunk).await.is_err() {
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
        for piece in splitter.flush() {
            let _ = tx.send(piece).await;
        }
        Ok(())
    }
}

fn messages_to_ollama(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
    messages.iter().map(|m| {
        let role = match m.role {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::Tool => "tool",
        };
        let mut msg = json!({ "role": role });
        if let Some(content) = &m.content {
            msg["content"] = json!(content);
        }
        if !m.tool_calls.is_empty() {
            let calls: Vec<serde_json::Value> = m.tool_calls.iter().map(|tc| json!({
                "function": { "name": tc.function.name, "arguments": tc.function.arguments }
            })).collect();
            msg["tool_calls"] = json!(calls);
        }
        if let Some(id) = &m.tool_call_id {
            msg["tool_call_id"] = json!(id);
        }
        msg
    }).collect()
}

fn parse_ollama_tool_calls(calls: &[serde_json::Value]) -> Vec<StreamChunk> {
    calls.iter().enumerate().filter_map(|(i, call)| {
        let func = call.get("function")?;
        let name = func.get("name")?.as_str()?.to_string();
        let arguments = func.get("arguments").cloned().unwrap_or(json!({}));
        Some(StreamChunk::ToolCall { id: format!("call_{i}"), name, arguments })
    }).collect()
}

// ── OpenRouter client ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OpenRouterClient {
    client: reqwest::Client,
}

impl Default for OpenRouterClient {
    fn default() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl OpenRouterClient {
    async fn stream_chat(
        &self,
        config: &GatewayConfig,
        messages: &[ChatMessage],
        tx: &mpsc::Sender<StreamChunk>,
    ) -> anyhow::Result<()> {
        let api_key = std::env::var("OPENROUTER_API_KEY").unwrap_or_default();
        if api_key.trim().is_empty() {
            anyhow::bail!("OpenRouter key missing. Set OPENROUTER_API_KEY.");
        }
        let (_, model) = Provider::parse_identifier(&config.model_identifier);

        let mut payload = json!({
            "model": model,
            "messages": messages_to_openai(messages),
            "stream": true,
            "temperature": config.temperature,
        });
        if let Some(tools) = &config.tool_schemas {
            payload["tools"] = tools.clone();
        }

        let mut response = self.client
            .post("https://openrouter.ai/api/v1/chat/completions")
            .bearer_auth(&api_key)
            .header("HTTP-Referer", "https://aigent.local")
            .header("X-Title", "Aigent")
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("openrouter error ({status}): {body}");
        }

        let mut splitter = ThinkSplitter::new();
        let mut tool_call_map: HashMap<usize, (String, String, String)> = HashMap::new();

        while let Some(chunk) = response.chunk().await? {
            let text = String::from_utf8_lossy(&chunk);
            for line in text.lines() {
                let line = line.trim();
                if line.is_empty() || line == "data: [DONE]" {
                    continue;
                }
                let Some(data) = line.strip_prefix("data: ") else { continue };
                let Ok(value) = serde_json::from_str::<serde_json::Value>(data) else { continue };
                let Some(choice) = value.get("choices").and_then(|c| c.get(0)) else { continue };
                let Some(delta) = choice.get("delta") else { continue };

                if let Some(content) = delta.get("content").and_then(|v| v.as_str()) {
                    for piece in splitter.feed(content) {
                        if tx.send(piece).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                if let Some(calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
                    for call in calls {
                        let idx = call.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                        let entry = tool_call_map.entry(idx).or_default();
                        if let Some(id) = call.get("id").and_then(|v| v.as_str()) {
                            entry.0 = id.to_string();
                        }
                        if let Some(func) = call.get("function") {
                            if let Some(name) = func.get("name").and_then(|v| v.as_str()) {
                                entry.1 = name.to_string();
                            }
                            if let Some(args) = func.get("arguments").and_then(|v| v.as_str()) {
                                entry.2.push_str(args);
                            }
                        }
                    }
                }
            }
        }
        for piece in splitter.flush() {
            let _ = tx.send(piece).await;
        }

        let mut indices: Vec<usize> = tool_call_map.keys().copied().collect();
        indices.sort();
        for idx in indices {
            let (id, name, args_str) = &tool_call_map[&idx];
            let arguments = serde_json::from_str(args_str).unwrap_or(json!({}));
            let id = if id.is_empty() { format!("call_{idx}") } else { id.clone() };
            let _ = tx.send(StreamChunk::ToolCall { id, name: name.clone(), arguments }).await;
        }

        Ok(())
    }
}

fn messages_to_openai(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
    messages.iter().map(|m| {
        let role = match m.role {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::Tool => "tool",
        };
        let mut msg = json!({ "role": role, "content": m.content.clone().unwrap_or_default() });
        if !m.tool_calls.is_empty() {
            let calls: Vec<serde_json::Value> = m.tool_calls.iter().map(|tc| json!({
                "id": tc.id,
                "type": "function",
                "function": { "name": tc.function.name, "arguments": tc.function.arguments.to_string() }
            })).collect();
            msg["tool_calls"] = json!(calls);
        }
        if let Some(id) = &m.tool_call_id {
            msg["tool_call_id"] = json!(id);
        }
        msg
    }).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_identifier_resolves_scheme() {
        assert_eq!(Provider::parse_identifier("ollama/llama3.1:8b"), (Provider::Ollama, "llama3.1:8b"));
        assert_eq!(Provider::parse_identifier("openrouter/openai/gpt-4o-mini"), (Provider::OpenRouter, "openai/gpt-4o-mini"));
    }

    #[test]
    fn parse_identifier_defaults_to_ollama_without_scheme() {
        assert_eq!(Provider::parse_identifier("llama3.1:8b"), (Provider::Ollama, "llama3.1:8b"));
    }

    #[test]
    fn chat_message_constructors_set_expected_roles() {
        assert_eq!(ChatMessage::system("hi").role, ChatRole::System);
        assert_eq!(ChatMessage::user("hi").role, ChatRole::User);
        let tool_msg = ChatMessage::tool_result("call_1", "42");
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call_1"));
    }
}
