//! Shared low-level machinery for draining one streamed model turn: both
//! the foreground chat loop (§4.5) and the sleep-time scheduler's bounded
//! reasoning loop (§4.6) drive a model one iteration at a time and collect
//! the same three things out of the stream — accumulated content text, any
//! tool calls, and a terminal error if one occurred.

use futures::StreamExt;

use aigent_llm::{ChatMessage, GatewayConfig, LlmGateway, StreamChunk, ToolCall, ToolCallFunction};

/// Outcome of draining a single `llm.query(...)` stream to completion.
#[derive(Debug, Default)]
pub struct ModelTurn {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    /// Set when the stream ended with a `StreamChunk::Error`.
    pub error: Option<String>,
}

/// Drain `gateway.query(messages)` to completion, invoking `on_chunk` for
/// every chunk as it arrives (so callers can forward `content`/`thinking`
/// to a transport unchanged), and return the accumulated turn.
pub async fn run_model_turn(
    gateway: &dyn LlmGateway,
    config: &GatewayConfig,
    messages: &[ChatMessage],
    mut on_chunk: impl FnMut(&StreamChunk),
) -> ModelTurn {
    let mut stream = gateway.query(config, messages).await;
    let mut turn = ModelTurn::default();

    while let Some(chunk) = stream.next().await {
        on_chunk(&chunk);
        match chunk {
            StreamChunk::Content(delta) => turn.content.push_str(&delta),
            StreamChunk::Thinking(_) => {}
            StreamChunk::ToolCall { id, name, arguments } => {
                turn.tool_calls.push(ToolCall {
                    id,
                    r#type: "function".to_string(),
                    function: ToolCallFunction { name, arguments },
                });
            }
            StreamChunk::Error(message) => {
                turn.error = Some(message);
                break;
            }
        }
    }

    turn
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::pin::Pin;
    use futures::stream;

    struct ScriptedGateway {
        chunks: Vec<StreamChunk>,
    }

    #[async_trait]
    impl LlmGateway for ScriptedGateway {
        async fn query(
            &self,
            _config: &GatewayConfig,
            _messages: &[ChatMessage],
        ) -> Pin<Box<dyn futures::Stream<Item = StreamChunk> + Send>> {
            Box::pin(stream::iter(self.chunks.clone()))
        }
    }

    fn config() -> GatewayConfig {
        GatewayConfig {
            provider: aigent_llm::Provider::Ollama,
            model_identifier: "ollama/test".to_string(),
            tool_schemas: None,
            max_tokens: 100,
            temperature: 0.0,
            think_level: None,
        }
    }

    #[tokio::test]
    async fn accumulates_content_and_tool_calls() {
        let gateway = ScriptedGateway {
            chunks: vec![
                StreamChunk::Content("hello ".to_string()),
                StreamChunk::Content("world".to_string()),
                StreamChunk::ToolCall { id: "1".to_string(), name: "roll_dice".to_string(), arguments: serde_json::json!({"dice_str":"2d6"}) },
            ],
        };
        let mut forwarded = Vec::new();
        let turn = run_model_turn(&gateway, &config(), &[], |c| forwarded.push(c.clone())).await;
        assert_eq!(turn.content, "hello world");
        assert_eq!(turn.tool_calls.len(), 1);
        assert!(turn.error.is_none());
        assert_eq!(forwarded.len(), 3);
    }

    #[tokio::test]
    async fn stops_accumulating_after_error_chunk() {
        let gateway = ScriptedGateway {
            chunks: vec![
                StreamChunk::Content("partial".to_string()),
                StreamChunk::Error("boom".to_string()),
                StreamChunk::Content("never seen".to_string()),
            ],
        };
        let turn = run_model_turn(&gateway, &config(), &[], |_| {}).await;
        assert_eq!(turn.content, "partial");
        assert_eq!(turn.error.as_deref(), Some("boom"));
    }
}
