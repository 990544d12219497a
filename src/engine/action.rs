//! Actions emitted by the pure engine
//!
//! The shell interprets these in order. Actions with out-values
//! (`CreateTurn` -> turn id, `PersistToolInvocation` -> entry id,
//! `StartLlm` -> stream ref) are applied back into the state through the
//! apply functions on `TrackState` before the next action runs.

use super::state::HistoryBlock;
use crate::db::{ChatMessageType, ToolStatus, TurnStatus};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Insert a console history block; the row id is applied back onto the
    /// in-memory block at `index`.
    PersistConsoleBlock { index: usize, block: HistoryBlock },

    /// Create the turn row; yields the turn id.
    CreateTurn { model: String, trigger: String },

    /// Insert the user's prompt entry for the current turn.
    PersistUserPrompt { position: i64, content: String },

    /// Insert a finished assistant message entry (thinking or response).
    PersistAssistantMessage {
        position: i64,
        message_type: ChatMessageType,
        content: String,
    },

    /// Insert a console-context entry capturing console activity between
    /// turns.
    PersistConsoleContext { position: i64, content: String },

    /// Insert a tool invocation entry; yields the entry id.
    PersistToolInvocation {
        position: i64,
        tool_call_id: String,
        tool_name: String,
        arguments: Value,
        console_prompt: String,
        sequential: bool,
        status: ToolStatus,
    },

    /// Move a tool to a new status, updating the row and the live state.
    UpdateToolStatus {
        entry_id: i64,
        status: ToolStatus,
        result_content: Option<String>,
        error_message: Option<String>,
        duration_ms: Option<i64>,
        denied_reason: Option<String>,
    },

    /// Move the turn to a new status, updating the row and the live state.
    UpdateTurnStatus { status: TurnStatus },

    /// Begin execution of an approved tool: status update plus command
    /// routing, resolved by the shell against the tool registry.
    ExecuteTool { entry_id: i64 },

    /// Start the next LLM request for the current turn, threading the stored
    /// cache context. Clears the tool set; yields the stream ref.
    StartLlm,

    /// Lightweight notifications; subscribers re-query authoritative state.
    BroadcastConsole,
    BroadcastChat,
}

impl Action {
    pub fn update_tool(entry_id: i64, status: ToolStatus) -> Self {
        Action::UpdateToolStatus {
            entry_id,
            status,
            result_content: None,
            error_message: None,
            duration_ms: None,
            denied_reason: None,
        }
    }
}
