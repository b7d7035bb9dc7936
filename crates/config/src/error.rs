//! Shared error taxonomy (see spec §7: Error Handling Design).
//!
//! Every crate in the workspace that needs to surface a typed failure to a
//! caller — rather than an opaque `anyhow::Error` — returns `AigentError` at
//! its public boundary. Application-level call sites (CLI bootstrap,
//! transport handlers) keep using `anyhow::Result` with `.context(...)`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AigentError {
    /// Missing or invalid configuration. Fatal at startup; nowhere else.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The LLM gateway failed to complete a streaming request.
    #[error("provider error: {0}")]
    Provider(String),

    /// A registered tool raised, or was given malformed arguments.
    #[error("tool '{tool}' failed: {message}")]
    ToolExecution { tool: String, message: String },

    /// I/O failure or a size-cap violation in the memory store.
    #[error("storage error: {0}")]
    Storage(String),

    /// The user (or policy) denied a gated action.
    #[error("execution of '{tool}' was denied")]
    Authorization { tool: String },

    /// A malformed wire message crossed the transport boundary.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The sleep-time scheduler's queue or lifecycle became inconsistent.
    #[error("scheduling error: {0}")]
    Scheduling(String),
}

impl AigentError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolExecution { tool: tool.into(), message: message.into() }
    }
}
