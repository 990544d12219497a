//! In-process event bus
//!
//! Topics are keyed by workspace id; every subscriber of a workspace sees all
//! events published for it. Missed events are not replayed — subscribers
//! re-query authoritative state from the owning actor on `*Changed`
//! notifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

const TOPIC_CAPACITY: usize = 256;

/// Process-wide broker handle. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    topics: Arc<Mutex<HashMap<i64, broadcast::Sender<Event>>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Subscribe to all events of one workspace.
    pub fn subscribe(&self, workspace_id: i64) -> broadcast::Receiver<Event> {
        let mut topics = self.topics.lock().expect("bus lock poisoned");
        topics
            .entry(workspace_id)
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }

    /// Deliver an event to all current subscribers of its workspace.
    pub fn broadcast(&self, event: Event) {
        let sender = {
            let topics = self.topics.lock().expect("bus lock poisoned");
            topics.get(&event.workspace_id()).cloned()
        };
        if let Some(sender) = sender {
            // A send error only means there are no subscribers right now.
            let _ = sender.send(event);
        }
    }
}

/// Everything published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    ContainerUpdated(ContainerUpdated),
    ConsoleUpdated(ConsoleUpdated),
    CommandIssued(CommandIssued),
    CommandResult(CommandResult),
    WorkspaceChanged(WorkspaceChanged),
    ConsoleChanged(ConsoleChanged),
    ChatChanged(ChatChanged),
    DatabaseUpdated(DatabaseUpdated),
}

impl Event {
    pub fn workspace_id(&self) -> i64 {
        match self {
            Event::ContainerUpdated(e) => e.workspace_id,
            Event::ConsoleUpdated(e) => e.workspace_id,
            Event::CommandIssued(e) => e.workspace_id,
            Event::CommandResult(e) => e.workspace_id,
            Event::WorkspaceChanged(e) => e.workspace_id,
            Event::ConsoleChanged(e) => e.workspace_id,
            Event::ChatChanged(e) => e.workspace_id,
            Event::DatabaseUpdated(e) => e.workspace_id,
        }
    }
}

/// Container status as seen by subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Offline,
    Starting,
    Running,
}

/// Console status as seen by subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleStatus {
    Offline,
    Starting,
    Ready,
    Busy,
}

/// Kind of a container-scoped command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Metasploit,
    Bash,
}

/// Lifecycle status of a container-scoped command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Running,
    Finished,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerUpdated {
    pub workspace_id: i64,
    pub container_id: i64,
    pub slug: String,
    pub name: String,
    pub image: String,
    pub status: ContainerStatus,
    pub docker_container_id: Option<String>,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleUpdated {
    pub workspace_id: i64,
    pub container_id: i64,
    pub track_id: i64,
    pub status: ConsoleStatus,
    pub command_id: Option<String>,
    pub command: Option<String>,
    pub output: String,
    pub prompt: String,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandIssued {
    pub workspace_id: i64,
    pub container_id: i64,
    pub track_id: i64,
    pub command_id: String,
    pub kind: CommandKind,
    pub command: String,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub workspace_id: i64,
    pub container_id: i64,
    pub track_id: i64,
    pub command_id: String,
    pub kind: CommandKind,
    pub command: String,
    pub output: String,
    pub prompt: String,
    pub status: CommandStatus,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceChanged {
    pub workspace_id: i64,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleChanged {
    pub workspace_id: i64,
    pub track_id: i64,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChanged {
    pub workspace_id: i64,
    pub track_id: i64,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseUpdated {
    pub workspace_id: i64,
    pub changes: Value,
    pub totals: Value,
    pub ts: DateTime<Utc>,
}
