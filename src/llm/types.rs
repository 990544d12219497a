//! Common types for LLM interactions

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque identifier of one in-flight stream. The caller cancels a request by
/// discarding the ref and ignoring further events tagged with it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamRef(pub String);

impl StreamRef {
    pub fn fresh() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for StreamRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of one content block in a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Thinking,
    Text,
    ToolCall,
}

/// Why the model stopped emitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
}

/// Normalized stream protocol. Indices are monotonic within a stream but not
/// necessarily dense.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    StreamStarted,
    ContentBlockStart {
        index: u32,
        kind: BlockKind,
    },
    ContentDelta {
        index: u32,
        delta: String,
    },
    ToolCall {
        index: u32,
        id: String,
        name: String,
        arguments: Value,
    },
    ContentBlockStop {
        index: u32,
    },
    StreamComplete {
        stop_reason: StopReason,
        input_tokens: u64,
        output_tokens: u64,
        cache_context: Option<Value>,
    },
    StreamError {
        reason: String,
        recoverable: bool,
    },
}

/// What flows into the caller's inbox: every event tagged with its stream.
pub type StreamMessage = (StreamRef, StreamEvent);

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    User,
    Assistant,
}

/// Content block in a chat message
#[derive(Debug, Clone, PartialEq)]
pub enum ChatBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

impl ChatBlock {
    pub fn text(s: impl Into<String>) -> Self {
        ChatBlock::Text { text: s.into() }
    }

    pub fn tool_result(
        tool_use_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        ChatBlock::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error,
        }
    }
}

/// Message in a chat request
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Vec<ChatBlock>,
}

/// Tool definition carried in a chat request
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// A streaming chat request
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
    /// Opaque provider data threaded verbatim from the previous
    /// `StreamComplete` to enable prefix caching.
    pub cache_context: Option<Value>,
}

/// One listed model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub provider: String,
    pub context_window: usize,
}
