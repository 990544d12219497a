//! Database schema and persisted domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// SQL schema for initialization
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS console_history_blocks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    track_id INTEGER NOT NULL,
    block_type TEXT NOT NULL,
    status TEXT NOT NULL,
    command TEXT,
    output TEXT NOT NULL DEFAULT '',
    prompt TEXT,
    started_at TEXT NOT NULL,
    finished_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_console_history_track
    ON console_history_blocks(track_id, id);

CREATE TABLE IF NOT EXISTS turns (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    track_id INTEGER NOT NULL,
    model TEXT NOT NULL,
    status TEXT NOT NULL,
    "trigger" TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_turns_track ON turns(track_id, id);

CREATE TABLE IF NOT EXISTS chat_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    track_id INTEGER NOT NULL,
    turn_id INTEGER,
    position INTEGER NOT NULL,
    entry_type TEXT NOT NULL,
    created_at TEXT NOT NULL,

    UNIQUE (track_id, position),
    FOREIGN KEY (turn_id) REFERENCES turns(id) ON DELETE SET NULL
);

CREATE INDEX IF NOT EXISTS idx_chat_entries_track
    ON chat_entries(track_id, position);

CREATE TABLE IF NOT EXISTS chat_messages (
    entry_id INTEGER PRIMARY KEY,
    role TEXT NOT NULL,
    message_type TEXT NOT NULL,
    content TEXT NOT NULL,

    FOREIGN KEY (entry_id) REFERENCES chat_entries(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS chat_tool_invocations (
    entry_id INTEGER PRIMARY KEY,
    tool_call_id TEXT NOT NULL,
    tool_name TEXT NOT NULL,
    arguments TEXT NOT NULL,
    console_prompt TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL,
    result_content TEXT,
    error_message TEXT,
    duration_ms INTEGER,
    denied_reason TEXT,

    FOREIGN KEY (entry_id) REFERENCES chat_entries(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS chat_console_contexts (
    entry_id INTEGER PRIMARY KEY,
    content TEXT NOT NULL,

    FOREIGN KEY (entry_id) REFERENCES chat_entries(id) ON DELETE CASCADE
);
"#;

/// Console history block kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Startup,
    Command,
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockType::Startup => write!(f, "startup"),
            BlockType::Command => write!(f, "command"),
        }
    }
}

/// Console history block lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    Running,
    Finished,
    Interrupted,
}

impl fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockStatus::Running => write!(f, "running"),
            BlockStatus::Finished => write!(f, "finished"),
            BlockStatus::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Chat entry discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Message,
    ToolInvocation,
    ConsoleContext,
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryType::Message => write!(f, "message"),
            EntryType::ToolInvocation => write!(f, "tool_invocation"),
            EntryType::ConsoleContext => write!(f, "console_context"),
        }
    }
}

/// Message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

impl fmt::Display for ChatRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatRole::User => write!(f, "user"),
            ChatRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// Message flavor. Only `user+prompt`, `assistant+thinking` and
/// `assistant+response` are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatMessageType {
    Prompt,
    Thinking,
    Response,
}

impl fmt::Display for ChatMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatMessageType::Prompt => write!(f, "prompt"),
            ChatMessageType::Thinking => write!(f, "thinking"),
            ChatMessageType::Response => write!(f, "response"),
        }
    }
}

/// Whether a (role, message type) pair is storable.
pub fn valid_message_pair(role: ChatRole, message_type: ChatMessageType) -> bool {
    matches!(
        (role, message_type),
        (ChatRole::User, ChatMessageType::Prompt)
            | (ChatRole::Assistant, ChatMessageType::Thinking)
            | (ChatRole::Assistant, ChatMessageType::Response)
    )
}

/// Turn lifecycle. `Idle` is the live resting state; persisted turn rows are
/// created at `Pending` and never return to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Idle,
    Pending,
    Streaming,
    PendingApproval,
    ExecutingTools,
    Finished,
    Error,
    Cancelled,
}

impl TurnStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TurnStatus::Finished | TurnStatus::Error | TurnStatus::Cancelled
        )
    }
}

impl fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnStatus::Idle => write!(f, "idle"),
            TurnStatus::Pending => write!(f, "pending"),
            TurnStatus::Streaming => write!(f, "streaming"),
            TurnStatus::PendingApproval => write!(f, "pending_approval"),
            TurnStatus::ExecutingTools => write!(f, "executing_tools"),
            TurnStatus::Finished => write!(f, "finished"),
            TurnStatus::Error => write!(f, "error"),
            TurnStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Tool invocation lifecycle; transitions are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Pending,
    Approved,
    Denied,
    Executing,
    Success,
    Error,
    Timeout,
    Cancelled,
}

impl ToolStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ToolStatus::Denied
                | ToolStatus::Success
                | ToolStatus::Error
                | ToolStatus::Timeout
                | ToolStatus::Cancelled
        )
    }

    /// Terminal because the tool actually ran (or ran out of time), as
    /// opposed to being denied before execution.
    pub fn is_executed_terminal(self) -> bool {
        matches!(
            self,
            ToolStatus::Success | ToolStatus::Error | ToolStatus::Timeout
        )
    }
}

impl fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolStatus::Pending => write!(f, "pending"),
            ToolStatus::Approved => write!(f, "approved"),
            ToolStatus::Denied => write!(f, "denied"),
            ToolStatus::Executing => write!(f, "executing"),
            ToolStatus::Success => write!(f, "success"),
            ToolStatus::Error => write!(f, "error"),
            ToolStatus::Timeout => write!(f, "timeout"),
            ToolStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Persisted turn row.
#[derive(Debug, Clone)]
pub struct TurnRow {
    pub id: i64,
    pub track_id: i64,
    pub model: String,
    pub status: TurnStatus,
    pub trigger: String,
    pub created_at: DateTime<Utc>,
}

/// Persisted chat entry with its content.
#[derive(Debug, Clone)]
pub struct ChatEntryRow {
    pub id: i64,
    pub track_id: i64,
    pub turn_id: Option<i64>,
    pub position: i64,
    pub created_at: DateTime<Utc>,
    pub content: ChatEntryContent,
}

#[derive(Debug, Clone)]
pub enum ChatEntryContent {
    Message {
        role: ChatRole,
        message_type: ChatMessageType,
        content: String,
    },
    ToolInvocation {
        tool_call_id: String,
        tool_name: String,
        arguments: Value,
        console_prompt: String,
        status: ToolStatus,
        result_content: Option<String>,
        error_message: Option<String>,
        duration_ms: Option<i64>,
        denied_reason: Option<String>,
    },
    ConsoleContext {
        content: String,
    },
}

/// Persisted console history block row.
#[derive(Debug, Clone)]
pub struct ConsoleBlockRow {
    pub id: i64,
    pub track_id: i64,
    pub block_type: BlockType,
    pub status: BlockStatus,
    pub command: Option<String>,
    pub output: String,
    pub prompt: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

pub(super) fn parse_block_type(s: &str) -> BlockType {
    match s {
        "command" => BlockType::Command,
        _ => BlockType::Startup,
    }
}

pub(super) fn parse_block_status(s: &str) -> BlockStatus {
    match s {
        "finished" => BlockStatus::Finished,
        "interrupted" => BlockStatus::Interrupted,
        _ => BlockStatus::Running,
    }
}

pub(super) fn parse_turn_status(s: &str) -> TurnStatus {
    match s {
        "pending" => TurnStatus::Pending,
        "streaming" => TurnStatus::Streaming,
        "pending_approval" => TurnStatus::PendingApproval,
        "executing_tools" => TurnStatus::ExecutingTools,
        "finished" => TurnStatus::Finished,
        "error" => TurnStatus::Error,
        "cancelled" => TurnStatus::Cancelled,
        _ => TurnStatus::Idle,
    }
}

pub(super) fn parse_tool_status(s: &str) -> ToolStatus {
    match s {
        "approved" => ToolStatus::Approved,
        "denied" => ToolStatus::Denied,
        "executing" => ToolStatus::Executing,
        "success" => ToolStatus::Success,
        "error" => ToolStatus::Error,
        "timeout" => ToolStatus::Timeout,
        "cancelled" => ToolStatus::Cancelled,
        _ => ToolStatus::Pending,
    }
}

pub(super) fn parse_role(s: &str) -> ChatRole {
    match s {
        "assistant" => ChatRole::Assistant,
        _ => ChatRole::User,
    }
}

pub(super) fn parse_message_type(s: &str) -> ChatMessageType {
    match s {
        "thinking" => ChatMessageType::Thinking,
        "response" => ChatMessageType::Response,
        _ => ChatMessageType::Prompt,
    }
}
