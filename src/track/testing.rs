//! Mocks and shell-level tests for the track engine
//!
//! The store is a real in-memory database; the controller route and the LLM
//! launcher are recorded/scripted.

use super::traits::{CommandRouter, StreamLauncher};
use super::*;
use crate::bus::{
    CommandKind, CommandResult, CommandStatus, ConsoleUpdated, Event,
};
use crate::controller::CommandError;
use crate::db::ChatEntryContent;
use crate::llm::{
    BlockKind, ChatRequest, LlmError, StopReason, StreamEvent, StreamHandle, StreamMessage,
    StreamRef,
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct RecordingRouter {
    pub msf: Mutex<Vec<String>>,
    pub bash: Mutex<Vec<String>>,
    pub msf_response: Mutex<Option<CommandError>>,
    counter: AtomicU32,
}

impl RecordingRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            msf: Mutex::new(Vec::new()),
            bash: Mutex::new(Vec::new()),
            msf_response: Mutex::new(None),
            counter: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl CommandRouter for Arc<RecordingRouter> {
    async fn send_msf(&self, _track_id: i64, command: &str) -> Result<String, CommandError> {
        if let Some(err) = *self.msf_response.lock().expect("msf response") {
            return Err(err);
        }
        self.msf.lock().expect("msf").push(command.to_string());
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(format!("msf-cmd-{n}"))
    }

    async fn send_bash(&self, _track_id: i64, command: &str) -> Result<String, CommandError> {
        self.bash.lock().expect("bash").push(command.to_string());
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(format!("bash-cmd-{n}"))
    }
}

pub struct ScriptedLauncher {
    scripts: Mutex<VecDeque<Vec<StreamEvent>>>,
    pub requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn queue(&self, events: Vec<StreamEvent>) {
        self.scripts.lock().expect("scripts").push_back(events);
    }
}

impl StreamLauncher for Arc<ScriptedLauncher> {
    fn launch(
        &self,
        request: ChatRequest,
        sink: tokio::sync::mpsc::Sender<StreamMessage>,
    ) -> Result<StreamHandle, LlmError> {
        self.requests.lock().expect("requests").push(request);
        let script = self
            .scripts
            .lock()
            .expect("scripts")
            .pop_front()
            .ok_or_else(|| LlmError::unknown("no script queued"))?;

        let stream_ref = StreamRef::fresh();
        let cancel = CancellationToken::new();
        let handle = StreamHandle {
            stream_ref: stream_ref.clone(),
            cancel: cancel.clone(),
        };
        tokio::spawn(async move {
            for event in script {
                if cancel.is_cancelled() {
                    return;
                }
                if sink.send((stream_ref.clone(), event)).await.is_err() {
                    return;
                }
            }
        });
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ConsoleStatus;
    use crate::db::{Database, ToolStatus, TurnStatus};

    fn meta() -> TrackMeta {
        TrackMeta {
            workspace_id: 1,
            container_id: 7,
            track_id: 42,
        }
    }

    struct Harness {
        bus: EventBus,
        db: Database,
        router: Arc<RecordingRouter>,
        launcher: Arc<ScriptedLauncher>,
        handle: TrackHandle,
    }

    fn harness() -> Harness {
        let bus = EventBus::new();
        let db = Database::open_in_memory().expect("db");
        let router = RecordingRouter::new();
        let launcher = ScriptedLauncher::new();
        let handle = spawn_track(
            meta(),
            db.clone(),
            router.clone(),
            launcher.clone(),
            Arc::new(Config::default()),
            bus.clone(),
            "claude-4.5-sonnet".to_string(),
        );
        Harness {
            bus,
            db,
            router,
            launcher,
            handle,
        }
    }

    fn console_event(
        status: ConsoleStatus,
        command_id: Option<&str>,
        command: Option<&str>,
        output: &str,
        prompt: &str,
    ) -> Event {
        Event::ConsoleUpdated(ConsoleUpdated {
            workspace_id: 1,
            container_id: 7,
            track_id: 42,
            status,
            command_id: command_id.map(str::to_string),
            command: command.map(str::to_string),
            output: output.to_string(),
            prompt: prompt.to_string(),
            ts: Utc::now(),
        })
    }

    async fn wait_for<F>(h: &Harness, what: &str, predicate: F) -> TrackSnapshot
    where
        F: Fn(&TrackSnapshot) -> bool,
    {
        for _ in 0..400 {
            if let Some(snap) = h.handle.snapshot().await {
                if predicate(&snap) {
                    return snap;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("track never reached: {what}");
    }

    async fn console_ready(h: &Harness) {
        h.bus
            .broadcast(console_event(ConsoleStatus::Starting, None, None, "", ""));
        h.bus.broadcast(console_event(
            ConsoleStatus::Ready,
            None,
            None,
            "",
            "msf6 > ",
        ));
        wait_for(h, "console ready", |s| {
            s.console_status == ConsoleStatus::Ready
        })
        .await;
    }

    fn tool_turn_script() -> Vec<StreamEvent> {
        vec![
            StreamEvent::StreamStarted,
            StreamEvent::ContentBlockStart {
                index: 0,
                kind: BlockKind::Text,
            },
            StreamEvent::ContentDelta {
                index: 0,
                delta: "Scanning".to_string(),
            },
            StreamEvent::ContentBlockStop { index: 0 },
            StreamEvent::ContentBlockStart {
                index: 1,
                kind: BlockKind::ToolCall,
            },
            StreamEvent::ToolCall {
                index: 1,
                id: "abc".to_string(),
                name: "msf_command".to_string(),
                arguments: json!({"command": "db_nmap 10.0.0.1"}),
            },
            StreamEvent::ContentBlockStop { index: 1 },
            StreamEvent::StreamComplete {
                stop_reason: StopReason::ToolUse,
                input_tokens: 10,
                output_tokens: 20,
                cache_context: Some(json!({"cached_messages": 1})),
            },
        ]
    }

    fn closing_script() -> Vec<StreamEvent> {
        vec![
            StreamEvent::StreamStarted,
            StreamEvent::ContentBlockStart {
                index: 0,
                kind: BlockKind::Text,
            },
            StreamEvent::ContentDelta {
                index: 0,
                delta: "Scan complete.".to_string(),
            },
            StreamEvent::ContentBlockStop { index: 0 },
            StreamEvent::StreamComplete {
                stop_reason: StopReason::EndTurn,
                input_tokens: 30,
                output_tokens: 5,
                cache_context: Some(json!({"cached_messages": 3})),
            },
        ]
    }

    #[tokio::test]
    async fn autonomous_turn_executes_tool_and_finishes() {
        let h = harness();
        h.handle.set_autonomous(true).await;
        console_ready(&h).await;

        h.launcher.queue(tool_turn_script());
        h.launcher.queue(closing_script());

        let turn_id = h
            .handle
            .start_chat_turn("scan 10.0.0.1", None)
            .await
            .expect("turn started");

        // The tool reaches the controller route.
        wait_for(&h, "msf command routed", |s| {
            s.tools.iter().any(|(_, st)| *st == ToolStatus::Executing)
        })
        .await;
        assert_eq!(
            h.router.msf.lock().expect("msf").as_slice(),
            &["db_nmap 10.0.0.1".to_string()]
        );

        // Console runs the command and comes back ready.
        h.bus.broadcast(console_event(
            ConsoleStatus::Busy,
            Some("msf-cmd-0"),
            Some("db_nmap 10.0.0.1"),
            "Nmap done\n",
            "",
        ));
        h.bus.broadcast(console_event(
            ConsoleStatus::Ready,
            None,
            None,
            "",
            "msf6 > ",
        ));

        wait_for(&h, "turn finished", |s| {
            s.turn_status == TurnStatus::Finished
        })
        .await;

        // Second request carried the cache context from the first stream.
        let requests = h.launcher.requests.lock().expect("requests");
        assert_eq!(requests.len(), 2);
        assert_eq!(
            requests[1].cache_context,
            Some(json!({"cached_messages": 1}))
        );
        drop(requests);

        // Persisted: prompt, response, tool invocation (success), closing
        // response, with strictly increasing positions.
        let entries = h.db.list_chat_entries(42).expect("entries");
        let positions: Vec<i64> = entries.iter().map(|e| e.position).collect();
        let mut sorted = positions.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(positions, sorted, "positions strictly increasing");

        let mut kinds = Vec::new();
        for entry in &entries {
            match &entry.content {
                ChatEntryContent::Message {
                    role, message_type, ..
                } => kinds.push(format!("{role}:{message_type}")),
                ChatEntryContent::ToolInvocation { status, result_content, .. } => {
                    assert_eq!(*status, ToolStatus::Success);
                    assert_eq!(result_content.as_deref(), Some("Nmap done\n"));
                    kinds.push("tool".to_string());
                }
                ChatEntryContent::ConsoleContext { .. } => kinds.push("context".to_string()),
            }
        }
        assert_eq!(
            kinds,
            vec!["user:prompt", "assistant:response", "tool", "assistant:response"]
        );

        let turn = h.db.get_turn(turn_id).expect("turn row");
        assert_eq!(turn.status, TurnStatus::Finished);

        // Console history: startup proven by the command, both persisted.
        let blocks = h.db.list_console_blocks(42).expect("blocks");
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].command.as_deref(), Some("db_nmap 10.0.0.1"));
        h.handle.shutdown().await;
    }

    #[tokio::test]
    async fn approval_gate_holds_tool_until_denied() {
        let h = harness();
        console_ready(&h).await;
        h.launcher.queue(tool_turn_script());

        h.handle
            .start_chat_turn("scan 10.0.0.1", None)
            .await
            .expect("turn started");

        let snap = wait_for(&h, "approval gate", |s| {
            s.turn_status == TurnStatus::PendingApproval
        })
        .await;
        assert!(h.router.msf.lock().expect("msf").is_empty(), "nothing routed");

        let (entry_id, status) = snap.tools[0];
        assert_eq!(status, ToolStatus::Pending);

        h.handle
            .deny_tool(entry_id, "not safe")
            .await
            .expect("denied");

        // All tools denied, nothing executed: finished without another
        // request.
        wait_for(&h, "turn finished", |s| {
            s.turn_status == TurnStatus::Finished
        })
        .await;
        assert_eq!(h.launcher.requests.lock().expect("requests").len(), 1);
        assert!(h.router.msf.lock().expect("msf").is_empty());

        let entries = h.db.list_chat_entries(42).expect("entries");
        let denied = entries.iter().any(|e| {
            matches!(
                &e.content,
                ChatEntryContent::ToolInvocation {
                    status: ToolStatus::Denied,
                    denied_reason: Some(reason),
                    ..
                } if reason == "not safe"
            )
        });
        assert!(denied, "denied tool persisted with reason");
        h.handle.shutdown().await;
    }

    #[tokio::test]
    async fn parallel_bash_tool_completes_via_command_result() {
        let h = harness();
        h.handle.set_autonomous(true).await;
        console_ready(&h).await;

        h.launcher.queue(vec![
            StreamEvent::StreamStarted,
            StreamEvent::ToolCall {
                index: 0,
                id: "t1".to_string(),
                name: "bash_command".to_string(),
                arguments: json!({"command": "id"}),
            },
            StreamEvent::StreamComplete {
                stop_reason: StopReason::ToolUse,
                input_tokens: 1,
                output_tokens: 1,
                cache_context: None,
            },
        ]);
        h.launcher.queue(closing_script());

        h.handle
            .start_chat_turn("who am i", None)
            .await
            .expect("turn started");

        wait_for(&h, "bash routed", |s| {
            s.tools.iter().any(|(_, st)| *st == ToolStatus::Executing)
        })
        .await;
        assert_eq!(h.router.bash.lock().expect("bash").as_slice(), &["id".to_string()]);

        // The controller reports the bash result on the bus.
        h.bus.broadcast(Event::CommandResult(CommandResult {
            workspace_id: 1,
            container_id: 7,
            track_id: 42,
            command_id: "bash-cmd-0".to_string(),
            kind: CommandKind::Bash,
            command: "id".to_string(),
            output: "uid=0(root)\n".to_string(),
            prompt: String::new(),
            status: CommandStatus::Finished,
            exit_code: Some(0),
            error: None,
            ts: Utc::now(),
        }));

        wait_for(&h, "turn finished", |s| {
            s.turn_status == TurnStatus::Finished
        })
        .await;

        let entries = h.db.list_chat_entries(42).expect("entries");
        let success = entries.iter().any(|e| {
            matches!(
                &e.content,
                ChatEntryContent::ToolInvocation {
                    status: ToolStatus::Success,
                    result_content: Some(content),
                    ..
                } if content == "uid=0(root)\n"
            )
        });
        assert!(success, "bash tool closed from the command result");
        h.handle.shutdown().await;
    }

    #[tokio::test]
    async fn stream_error_fails_turn_without_retry() {
        let h = harness();
        console_ready(&h).await;
        h.launcher.queue(vec![
            StreamEvent::StreamStarted,
            StreamEvent::StreamError {
                reason: "overloaded".to_string(),
                recoverable: true,
            },
        ]);

        let turn_id = h
            .handle
            .start_chat_turn("hello", None)
            .await
            .expect("turn started");

        wait_for(&h, "turn error", |s| s.turn_status == TurnStatus::Error).await;
        assert_eq!(h.launcher.requests.lock().expect("requests").len(), 1);
        assert_eq!(
            h.db.get_turn(turn_id).expect("turn").status,
            TurnStatus::Error
        );

        // The user decides: a new prompt starts a fresh turn.
        h.launcher.queue(closing_script());
        let second = h
            .handle
            .start_chat_turn("try again", None)
            .await
            .expect("second turn");
        assert!(second > turn_id);
        h.handle.shutdown().await;
    }

    #[tokio::test]
    async fn second_prompt_rejected_while_turn_active() {
        let h = harness();
        console_ready(&h).await;
        // Script that never completes: stream started only.
        h.launcher.queue(vec![StreamEvent::StreamStarted]);

        h.handle
            .start_chat_turn("first", None)
            .await
            .expect("turn started");

        let err = h
            .handle
            .start_chat_turn("second", None)
            .await
            .expect_err("busy");
        assert!(matches!(err, TrackError::Engine(EngineError::TurnActive)));
        h.handle.shutdown().await;
    }
}
