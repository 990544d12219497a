//! Events folded into the track engine

use crate::bus::{CommandStatus, ConsoleStatus};
use crate::llm::{StreamEvent, StreamRef};

/// The console-facing slice of a `ConsoleUpdated` bus event.
#[derive(Debug, Clone)]
pub struct ConsoleSignal {
    pub status: ConsoleStatus,
    pub command_id: Option<String>,
    pub command: Option<String>,
    pub output: String,
    pub prompt: String,
}

/// Everything that can change a track's state.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// `ConsoleUpdated` for this track.
    Console(ConsoleSignal),

    /// Normalized LLM stream event; the shell has already filtered stale refs.
    Llm {
        stream_ref: StreamRef,
        event: StreamEvent,
    },

    /// User submits an AI prompt.
    StartTurn { text: String, model: String },

    /// User approves a pending tool.
    ApproveTool { entry_id: i64 },

    /// User denies a pending tool.
    DenyTool { entry_id: i64, reason: String },

    /// User abandons the active turn; the shell has already dropped the
    /// stream ref.
    CancelTurn,

    /// Per-track auto-approval flag.
    SetAutonomous(bool),

    /// Wall-clock cap for an executing tool elapsed.
    ToolTimeout { entry_id: i64 },

    /// `CommandResult` for a bash command issued by this track.
    BashResult {
        command_id: String,
        status: CommandStatus,
        output: String,
        exit_code: Option<i32>,
        error: Option<String>,
    },
}
