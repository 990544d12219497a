//! Track runtime state
//!
//! Plain values only; all mutation happens through the fold and apply
//! functions in this module's siblings. The authoritative copy of persisted
//! rows is the database, identified here by the `id`/`entry_id` fields once a
//! persist action has completed.

use crate::bus::ConsoleStatus;
use crate::db::{BlockStatus, BlockType, ChatMessageType, ToolStatus, TurnStatus};
use crate::llm::{StopReason, StreamRef};
use crate::markdown::MarkdownRenderer;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// One unit of console activity held in memory. `id` is set once persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryBlock {
    pub id: Option<i64>,
    pub block_type: BlockType,
    pub status: BlockStatus,
    pub command: Option<String>,
    pub command_id: Option<String>,
    pub output: String,
    pub prompt: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl HistoryBlock {
    pub fn startup(output: String, started_at: DateTime<Utc>) -> Self {
        Self {
            id: None,
            block_type: BlockType::Startup,
            status: BlockStatus::Running,
            command: None,
            command_id: None,
            output,
            prompt: None,
            started_at,
            finished_at: None,
        }
    }

    pub fn command(
        command: String,
        command_id: Option<String>,
        output: String,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            block_type: BlockType::Command,
            status: BlockStatus::Running,
            command: Some(command),
            command_id,
            output,
            prompt: None,
            started_at,
            finished_at: None,
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }
}

/// Console sub-state: folded view of the track's console events.
#[derive(Debug, Clone, Default)]
pub struct ConsoleState {
    pub status: Option<ConsoleStatus>,
    pub current_prompt: String,
    pub history: Vec<HistoryBlock>,
    pub command_id: Option<String>,
    /// Set when a dispatch was rejected with `console_busy` before the busy
    /// event itself has been observed; cleared by the next console signal.
    /// Gates sequential dispatch so reconciliation cannot spin.
    pub busy_hint: bool,
}

impl ConsoleState {
    pub fn status_or_offline(&self) -> ConsoleStatus {
        self.status.unwrap_or(ConsoleStatus::Offline)
    }
}

/// One in-flight streamed chat entry (not yet persisted).
#[derive(Debug, Clone)]
pub struct StreamingEntry {
    pub message_type: ChatMessageType,
    pub document: MarkdownRenderer,
}

/// Stream sub-state: llm content-block index to position mapping plus the
/// streaming documents.
#[derive(Debug, Clone, Default)]
pub struct StreamState {
    pub blocks: HashMap<u32, i64>,
    pub entries: BTreeMap<i64, StreamingEntry>,
}

/// One tool invocation tracked by the turn, keyed by its chat entry id.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub entry_id: i64,
    pub position: i64,
    pub tool_call_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub sequential: bool,
    pub status: ToolStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub command_id: Option<String>,
}

/// Turn sub-state.
#[derive(Debug, Clone)]
pub struct TurnState {
    pub status: TurnStatus,
    pub turn_id: Option<i64>,
    pub model: Option<String>,
    pub stream_ref: Option<StreamRef>,
    /// Stop reason of the finished stream; `None` while streaming or idle.
    pub stream_done: Option<StopReason>,
    pub tools: BTreeMap<i64, ToolInvocation>,
    pub command_to_tool: HashMap<String, i64>,
    pub last_cache_context: Option<Value>,
    pub autonomous: bool,
    /// How many console history blocks have already been surfaced into chat
    /// as console-context entries.
    pub context_watermark: usize,
}

impl Default for TurnState {
    fn default() -> Self {
        Self {
            status: TurnStatus::Idle,
            turn_id: None,
            model: None,
            stream_ref: None,
            stream_done: None,
            tools: BTreeMap::new(),
            command_to_tool: HashMap::new(),
            last_cache_context: None,
            autonomous: false,
            context_watermark: 0,
        }
    }
}

/// Full live state of one track.
#[derive(Debug, Clone)]
pub struct TrackState {
    pub track_id: i64,
    pub console: ConsoleState,
    pub stream: StreamState,
    pub turn: TurnState,
    next_position: i64,
}

impl TrackState {
    /// `next_position` is seeded from the highest persisted position + 1.
    pub fn new(track_id: i64, next_position: i64) -> Self {
        Self {
            track_id,
            console: ConsoleState::default(),
            stream: StreamState::default(),
            turn: TurnState::default(),
            next_position: next_position.max(1),
        }
    }

    /// Allocate the next chat entry position; strictly increasing per track.
    pub fn alloc_position(&mut self) -> i64 {
        let position = self.next_position;
        self.next_position += 1;
        position
    }

    pub fn peek_next_position(&self) -> i64 {
        self.next_position
    }
}
