//! Trait abstractions for the track shell's I/O
//!
//! These keep the executor testable: the store, the command route to the
//! controller, and the LLM launcher all have mock implementations.

use crate::controller::{CommandError, ControllerHandle};
use crate::db::{
    ChatEntryRow, ChatMessageType, ChatRole, Database, NewConsoleBlock, NewToolInvocation,
    ToolStatus, ToolUpdate, TurnStatus,
};
use crate::llm::{ChatRequest, LlmError, ModelRegistry, StreamHandle, StreamMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Persistence the track engine owns: chat entries, turns, console history.
pub trait TrackStore: Send + Sync {
    fn max_position(&self, track_id: i64) -> Result<i64, String>;

    fn create_turn_with_prompt(
        &self,
        track_id: i64,
        model: &str,
        trigger: &str,
        position: i64,
        prompt: &str,
        now: DateTime<Utc>,
    ) -> Result<(i64, i64), String>;

    fn update_turn_status(&self, turn_id: i64, status: TurnStatus) -> Result<(), String>;

    #[allow(clippy::too_many_arguments)]
    fn insert_message(
        &self,
        track_id: i64,
        turn_id: Option<i64>,
        position: i64,
        role: ChatRole,
        message_type: ChatMessageType,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<i64, String>;

    fn insert_tool_invocation(
        &self,
        track_id: i64,
        turn_id: Option<i64>,
        position: i64,
        tool: &NewToolInvocation,
        now: DateTime<Utc>,
    ) -> Result<i64, String>;

    fn update_tool_invocation(
        &self,
        entry_id: i64,
        status: ToolStatus,
        update: &ToolUpdate,
    ) -> Result<(), String>;

    fn insert_console_context(
        &self,
        track_id: i64,
        position: i64,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<i64, String>;

    fn list_chat_entries(&self, track_id: i64) -> Result<Vec<ChatEntryRow>, String>;

    fn insert_console_block(
        &self,
        track_id: i64,
        block: &NewConsoleBlock,
    ) -> Result<i64, String>;
}

/// Route for tool commands into the container controller.
#[async_trait]
pub trait CommandRouter: Send + Sync {
    async fn send_msf(&self, track_id: i64, command: &str) -> Result<String, CommandError>;
    async fn send_bash(&self, track_id: i64, command: &str) -> Result<String, CommandError>;
}

/// Starts LLM streams; events arrive in the given sink tagged by ref.
pub trait StreamLauncher: Send + Sync {
    fn launch(
        &self,
        request: ChatRequest,
        sink: mpsc::Sender<StreamMessage>,
    ) -> Result<StreamHandle, LlmError>;
}

// ============================================================================
// Production adapters
// ============================================================================

impl TrackStore for Database {
    fn max_position(&self, track_id: i64) -> Result<i64, String> {
        Database::max_position(self, track_id).map_err(|e| e.to_string())
    }

    fn create_turn_with_prompt(
        &self,
        track_id: i64,
        model: &str,
        trigger: &str,
        position: i64,
        prompt: &str,
        now: DateTime<Utc>,
    ) -> Result<(i64, i64), String> {
        Database::create_turn_with_prompt(self, track_id, model, trigger, position, prompt, now)
            .map_err(|e| e.to_string())
    }

    fn update_turn_status(&self, turn_id: i64, status: TurnStatus) -> Result<(), String> {
        Database::update_turn_status(self, turn_id, status).map_err(|e| e.to_string())
    }

    fn insert_message(
        &self,
        track_id: i64,
        turn_id: Option<i64>,
        position: i64,
        role: ChatRole,
        message_type: ChatMessageType,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<i64, String> {
        Database::insert_message(
            self,
            track_id,
            turn_id,
            position,
            role,
            message_type,
            content,
            now,
        )
        .map_err(|e| e.to_string())
    }

    fn insert_tool_invocation(
        &self,
        track_id: i64,
        turn_id: Option<i64>,
        position: i64,
        tool: &NewToolInvocation,
        now: DateTime<Utc>,
    ) -> Result<i64, String> {
        Database::insert_tool_invocation(self, track_id, turn_id, position, tool, now)
            .map_err(|e| e.to_string())
    }

    fn update_tool_invocation(
        &self,
        entry_id: i64,
        status: ToolStatus,
        update: &ToolUpdate,
    ) -> Result<(), String> {
        Database::update_tool_invocation(self, entry_id, status, update).map_err(|e| e.to_string())
    }

    fn insert_console_context(
        &self,
        track_id: i64,
        position: i64,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<i64, String> {
        Database::insert_console_context(self, track_id, position, content, now)
            .map_err(|e| e.to_string())
    }

    fn list_chat_entries(&self, track_id: i64) -> Result<Vec<ChatEntryRow>, String> {
        Database::list_chat_entries(self, track_id).map_err(|e| e.to_string())
    }

    fn insert_console_block(
        &self,
        track_id: i64,
        block: &NewConsoleBlock,
    ) -> Result<i64, String> {
        Database::insert_console_block(self, track_id, block).map_err(|e| e.to_string())
    }
}

/// Routes commands through the track's container controller.
#[derive(Clone)]
pub struct ControllerRouter {
    controller: ControllerHandle,
}

impl ControllerRouter {
    pub fn new(controller: ControllerHandle) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl CommandRouter for ControllerRouter {
    async fn send_msf(&self, track_id: i64, command: &str) -> Result<String, CommandError> {
        self.controller
            .send_metasploit_command(track_id, command)
            .await
    }

    async fn send_bash(&self, track_id: i64, command: &str) -> Result<String, CommandError> {
        self.controller.send_bash_command(track_id, command).await
    }
}

/// Launches streams through the model registry.
#[derive(Clone)]
pub struct RegistryLauncher {
    registry: Arc<ModelRegistry>,
}

impl RegistryLauncher {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self { registry }
    }
}

impl StreamLauncher for RegistryLauncher {
    fn launch(
        &self,
        request: ChatRequest,
        sink: mpsc::Sender<StreamMessage>,
    ) -> Result<StreamHandle, LlmError> {
        self.registry.chat(request, sink)
    }
}
