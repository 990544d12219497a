//! Track runtime executor
//!
//! The shell around the pure engine: receives bus events, LLM stream events
//! and user calls, folds them, interprets the resulting actions, and runs
//! reconciliation to a fixed point after every event.

use super::traits::{CommandRouter, StreamLauncher, TrackStore};
use super::{TrackError, TrackMeta, TrackSnapshot};
use crate::bus::{ChatChanged, CommandKind, ConsoleChanged, Event, EventBus};
use crate::config::Config;
use crate::controller::CommandError;
use crate::db::{
    ChatEntryContent, ChatMessageType, ChatRole, NewConsoleBlock, NewToolInvocation, ToolStatus,
    ToolUpdate, TurnStatus,
};
use crate::engine::{self, Action, ConsoleSignal, EngineEvent, TrackState};
use crate::llm::{
    ChatBlock, ChatMessage, ChatRequest, ChatRole as LlmRole, StreamHandle, StreamMessage,
};
use crate::tools::{ToolCatalog, BASH_COMMAND, MSF_COMMAND};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

const SYSTEM_PROMPT: &str = "You are a security research assistant operating a Metasploit \
console and a shell inside an isolated lab container. Use the msf_command tool for \
Metasploit console commands and the bash_command tool for shell commands. Only ever touch \
targets inside the lab.";

const MAX_TOKENS: u32 = 8192;
const RECONCILE_BOUND: u32 = 64;

pub(super) enum TrackMsg {
    Bus(Event),
    Llm(StreamMessage),
    ToolTimeout {
        entry_id: i64,
    },
    StartChatTurn {
        text: String,
        model: Option<String>,
        reply: oneshot::Sender<Result<i64, TrackError>>,
    },
    ApproveTool {
        entry_id: i64,
        reply: oneshot::Sender<Result<(), TrackError>>,
    },
    DenyTool {
        entry_id: i64,
        reason: String,
        reply: oneshot::Sender<Result<(), TrackError>>,
    },
    CancelTurn {
        reply: oneshot::Sender<()>,
    },
    SetAutonomous {
        value: bool,
        reply: oneshot::Sender<()>,
    },
    SendConsoleCommand {
        text: String,
        reply: oneshot::Sender<Result<String, CommandError>>,
    },
    Snapshot {
        reply: oneshot::Sender<TrackSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

pub(super) struct TrackRuntime<S, R, L> {
    meta: TrackMeta,
    state: TrackState,
    store: S,
    router: R,
    launcher: L,
    catalog: ToolCatalog,
    config: Arc<Config>,
    bus: EventBus,
    default_model: String,
    tx: mpsc::Sender<TrackMsg>,
    llm_tx: mpsc::Sender<StreamMessage>,
    stream: Option<StreamHandle>,
    /// Turn/trigger captured by `CreateTurn`, consumed by the prompt persist.
    pending_turn: Option<(String, String)>,
}

impl<S, R, L> TrackRuntime<S, R, L>
where
    S: TrackStore,
    R: CommandRouter,
    L: StreamLauncher,
{
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        meta: TrackMeta,
        state: TrackState,
        store: S,
        router: R,
        launcher: L,
        config: Arc<Config>,
        bus: EventBus,
        default_model: String,
        tx: mpsc::Sender<TrackMsg>,
        llm_tx: mpsc::Sender<StreamMessage>,
    ) -> Self {
        Self {
            meta,
            state,
            store,
            router,
            launcher,
            catalog: ToolCatalog::builtin(),
            config,
            bus,
            default_model,
            tx,
            llm_tx,
            stream: None,
            pending_turn: None,
        }
    }

    pub(super) async fn run(mut self, mut rx: mpsc::Receiver<TrackMsg>) {
        tracing::info!(track_id = self.meta.track_id, "track engine starting");
        while let Some(msg) = rx.recv().await {
            if self.dispatch(msg).await {
                break;
            }
        }
        tracing::info!(track_id = self.meta.track_id, "track engine stopped");
    }

    /// Returns true on shutdown.
    async fn dispatch(&mut self, msg: TrackMsg) -> bool {
        match msg {
            TrackMsg::Bus(event) => {
                if let Some(event) = self.translate_bus_event(event) {
                    let _ = self.process(event).await;
                }
            }
            TrackMsg::Llm((stream_ref, event)) => {
                // Events for an abandoned stream are discarded.
                if self.state.turn.stream_ref.as_ref() == Some(&stream_ref) {
                    let _ = self.process(EngineEvent::Llm { stream_ref, event }).await;
                }
            }
            TrackMsg::ToolTimeout { entry_id } => {
                let _ = self.process(EngineEvent::ToolTimeout { entry_id }).await;
            }
            TrackMsg::StartChatTurn { text, model, reply } => {
                let model = model.unwrap_or_else(|| self.default_model.clone());
                let result = self
                    .process(EngineEvent::StartTurn { text, model })
                    .await
                    .and_then(|()| self.state.turn.turn_id.ok_or(TrackError::NoTurn));
                let _ = reply.send(result);
            }
            TrackMsg::ApproveTool { entry_id, reply } => {
                let result = self.process(EngineEvent::ApproveTool { entry_id }).await;
                let _ = reply.send(result);
            }
            TrackMsg::DenyTool {
                entry_id,
                reason,
                reply,
            } => {
                let result = self.process(EngineEvent::DenyTool { entry_id, reason }).await;
                let _ = reply.send(result);
            }
            TrackMsg::CancelTurn { reply } => {
                if let Some(stream) = self.stream.take() {
                    stream.abort();
                }
                self.state.turn.stream_ref = None;
                let _ = self.process(EngineEvent::CancelTurn).await;
                let _ = reply.send(());
            }
            TrackMsg::SetAutonomous { value, reply } => {
                let _ = self.process(EngineEvent::SetAutonomous(value)).await;
                let _ = reply.send(());
            }
            TrackMsg::SendConsoleCommand { text, reply } => {
                let result = self.router.send_msf(self.meta.track_id, &text).await;
                let _ = reply.send(result);
            }
            TrackMsg::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            TrackMsg::Shutdown { reply } => {
                if let Some(stream) = self.stream.take() {
                    stream.abort();
                }
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    fn translate_bus_event(&self, event: Event) -> Option<EngineEvent> {
        match event {
            Event::ConsoleUpdated(e) if e.track_id == self.meta.track_id => {
                Some(EngineEvent::Console(ConsoleSignal {
                    status: e.status,
                    command_id: e.command_id,
                    command: e.command,
                    output: e.output,
                    prompt: e.prompt,
                }))
            }
            Event::CommandResult(e)
                if e.track_id == self.meta.track_id
                    && e.kind == CommandKind::Bash
                    && self.state.turn.command_to_tool.contains_key(&e.command_id) =>
            {
                Some(EngineEvent::BashResult {
                    command_id: e.command_id,
                    status: e.status,
                    output: e.output,
                    exit_code: e.exit_code,
                    error: e.error,
                })
            }
            _ => None,
        }
    }

    async fn process(&mut self, event: EngineEvent) -> Result<(), TrackError> {
        let actions = engine::fold(&mut self.state, &event, &self.catalog, Utc::now())
            .map_err(TrackError::Engine)?;
        self.interpret_all(actions).await;

        for round in 0..RECONCILE_BOUND {
            let actions = engine::reconcile(&self.state);
            if actions.is_empty() {
                break;
            }
            if round + 1 == RECONCILE_BOUND {
                // One-way statuses make this unreachable; a hit means a bug
                // worth crashing the actor over (supervision restarts it).
                panic!("track {} reconcile did not converge", self.meta.track_id);
            }
            self.interpret_all(actions).await;
        }
        Ok(())
    }

    async fn interpret_all(&mut self, actions: Vec<Action>) {
        for action in actions {
            self.interpret(action).await;
        }
    }

    async fn interpret(&mut self, action: Action) {
        let now = Utc::now();
        match action {
            Action::PersistConsoleBlock { index, block } => {
                let row = NewConsoleBlock {
                    block_type: block.block_type,
                    status: block.status,
                    command: block.command.clone(),
                    output: block.output.clone(),
                    prompt: block.prompt.clone(),
                    started_at: block.started_at,
                    finished_at: block.finished_at,
                };
                match self.store.insert_console_block(self.meta.track_id, &row) {
                    Ok(id) => self.state.apply_block_persisted(index, id),
                    Err(e) => {
                        tracing::error!(track_id = self.meta.track_id, error = %e, "console block persist failed");
                    }
                }
            }

            Action::CreateTurn { model, trigger } => {
                self.pending_turn = Some((model, trigger));
            }

            Action::PersistUserPrompt { position, content } => {
                if let Some((model, trigger)) = self.pending_turn.take() {
                    match self.store.create_turn_with_prompt(
                        self.meta.track_id,
                        &model,
                        &trigger,
                        position,
                        &content,
                        now,
                    ) {
                        Ok((turn_id, _entry_id)) => {
                            self.state.apply_turn_created(turn_id, &model);
                        }
                        Err(e) => {
                            tracing::error!(track_id = self.meta.track_id, error = %e, "turn creation failed");
                        }
                    }
                } else if let Err(e) = self.store.insert_message(
                    self.meta.track_id,
                    self.state.turn.turn_id,
                    position,
                    ChatRole::User,
                    ChatMessageType::Prompt,
                    &content,
                    now,
                ) {
                    tracing::error!(track_id = self.meta.track_id, error = %e, "prompt persist failed");
                }
            }

            Action::PersistAssistantMessage {
                position,
                message_type,
                content,
            } => {
                if let Err(e) = self.store.insert_message(
                    self.meta.track_id,
                    self.state.turn.turn_id,
                    position,
                    ChatRole::Assistant,
                    message_type,
                    &content,
                    now,
                ) {
                    tracing::error!(track_id = self.meta.track_id, error = %e, "message persist failed");
                }
            }

            Action::PersistConsoleContext { position, content } => {
                if let Err(e) =
                    self.store
                        .insert_console_context(self.meta.track_id, position, &content, now)
                {
                    tracing::error!(track_id = self.meta.track_id, error = %e, "context persist failed");
                }
            }

            Action::PersistToolInvocation {
                position,
                tool_call_id,
                tool_name,
                arguments,
                console_prompt,
                sequential,
                status,
            } => {
                let row = NewToolInvocation {
                    tool_call_id: tool_call_id.clone(),
                    tool_name: tool_name.clone(),
                    arguments: arguments.clone(),
                    console_prompt,
                    status,
                };
                match self.store.insert_tool_invocation(
                    self.meta.track_id,
                    self.state.turn.turn_id,
                    position,
                    &row,
                    now,
                ) {
                    Ok(entry_id) => {
                        self.state.apply_tool_persisted(
                            entry_id,
                            position,
                            &tool_call_id,
                            &tool_name,
                            arguments,
                            sequential,
                            status,
                        );
                    }
                    Err(e) => {
                        tracing::error!(track_id = self.meta.track_id, error = %e, "tool persist failed");
                    }
                }
            }

            Action::UpdateToolStatus {
                entry_id,
                status,
                result_content,
                error_message,
                duration_ms,
                denied_reason,
            } => {
                self.state.apply_tool_status(entry_id, status, now);
                let update = ToolUpdate {
                    result_content,
                    error_message,
                    duration_ms,
                    denied_reason,
                };
                if let Err(e) = self.store.update_tool_invocation(entry_id, status, &update) {
                    tracing::error!(track_id = self.meta.track_id, entry_id, error = %e, "tool update failed");
                }
            }

            Action::UpdateTurnStatus { status } => {
                self.state.apply_turn_status(status);
                if let Some(turn_id) = self.state.turn.turn_id {
                    if let Err(e) = self.store.update_turn_status(turn_id, status) {
                        tracing::error!(track_id = self.meta.track_id, turn_id, error = %e, "turn update failed");
                    }
                }
            }

            Action::ExecuteTool { entry_id } => self.execute_tool(entry_id).await,

            Action::StartLlm => self.start_llm().await,

            Action::BroadcastConsole => {
                self.bus.broadcast(Event::ConsoleChanged(ConsoleChanged {
                    workspace_id: self.meta.workspace_id,
                    track_id: self.meta.track_id,
                    ts: now,
                }));
            }

            Action::BroadcastChat => {
                self.bus.broadcast(Event::ChatChanged(ChatChanged {
                    workspace_id: self.meta.workspace_id,
                    track_id: self.meta.track_id,
                    ts: now,
                }));
            }
        }
    }

    async fn execute_tool(&mut self, entry_id: i64) {
        let Some(tool) = self.state.turn.tools.get(&entry_id).cloned() else {
            return;
        };

        // Unknown tool name: immediate error, nothing routed.
        if self.catalog.get(&tool.tool_name).is_none() {
            self.fail_tool(entry_id, format!("unknown tool: {}", tool.tool_name))
                .await;
            return;
        }
        let Some(command) = ToolCatalog::command_argument(&tool.arguments) else {
            self.fail_tool(entry_id, "missing command argument".to_string())
                .await;
            return;
        };

        let now = Utc::now();
        self.state
            .apply_tool_status(entry_id, ToolStatus::Executing, now);
        if let Err(e) =
            self.store
                .update_tool_invocation(entry_id, ToolStatus::Executing, &ToolUpdate::default())
        {
            tracing::error!(track_id = self.meta.track_id, entry_id, error = %e, "tool update failed");
        }

        match tool.tool_name.as_str() {
            MSF_COMMAND => match self.router.send_msf(self.meta.track_id, &command).await {
                Ok(_command_id) => self.arm_tool_timeout(entry_id, &tool.tool_name),
                Err(CommandError::ConsoleBusy) => {
                    // Someone else holds the console; retry on the next
                    // console-ready reconcile.
                    self.state.apply_tool_requeued(entry_id);
                    if let Err(e) = self.store.update_tool_invocation(
                        entry_id,
                        ToolStatus::Approved,
                        &ToolUpdate::default(),
                    ) {
                        tracing::error!(track_id = self.meta.track_id, entry_id, error = %e, "tool update failed");
                    }
                }
                Err(e) => self.fail_tool(entry_id, e.to_string()).await,
            },
            BASH_COMMAND => match self.router.send_bash(self.meta.track_id, &command).await {
                Ok(command_id) => {
                    self.state.apply_tool_command(entry_id, &command_id);
                    self.arm_tool_timeout(entry_id, &tool.tool_name);
                }
                Err(e) => self.fail_tool(entry_id, e.to_string()).await,
            },
            _ => {
                self.fail_tool(entry_id, format!("unknown tool: {}", tool.tool_name))
                    .await;
            }
        }
    }

    // Inlined rather than routed through `interpret` so the async call graph
    // stays non-recursive.
    async fn fail_tool(&mut self, entry_id: i64, message: String) {
        self.state
            .apply_tool_status(entry_id, ToolStatus::Error, Utc::now());
        let update = ToolUpdate {
            error_message: Some(message),
            ..ToolUpdate::default()
        };
        if let Err(e) = self
            .store
            .update_tool_invocation(entry_id, ToolStatus::Error, &update)
        {
            tracing::error!(track_id = self.meta.track_id, entry_id, error = %e, "tool update failed");
        }
        self.broadcast_chat();
    }

    fn broadcast_chat(&self) {
        self.bus.broadcast(Event::ChatChanged(ChatChanged {
            workspace_id: self.meta.workspace_id,
            track_id: self.meta.track_id,
            ts: Utc::now(),
        }));
    }

    fn set_turn_error(&mut self) {
        self.state.apply_turn_status(TurnStatus::Error);
        if let Some(turn_id) = self.state.turn.turn_id {
            if let Err(e) = self.store.update_turn_status(turn_id, TurnStatus::Error) {
                tracing::error!(track_id = self.meta.track_id, turn_id, error = %e, "turn update failed");
            }
        }
        self.broadcast_chat();
    }

    fn arm_tool_timeout(&self, entry_id: i64, tool_name: &str) {
        let timeout = self.config.tool_timeout_for(tool_name);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(TrackMsg::ToolTimeout { entry_id }).await;
        });
    }

    async fn start_llm(&mut self) {
        let request = match self.build_chat_request() {
            Ok(request) => request,
            Err(e) => {
                tracing::error!(track_id = self.meta.track_id, error = %e, "request build failed");
                self.set_turn_error();
                return;
            }
        };

        match self.launcher.launch(request, self.llm_tx.clone()) {
            Ok(handle) => {
                if let Some(previous) = self.stream.replace(handle.clone()) {
                    previous.abort();
                }
                self.state.apply_stream_started(handle.stream_ref);
            }
            Err(e) => {
                tracing::error!(track_id = self.meta.track_id, error = %e, "llm launch failed");
                self.set_turn_error();
            }
        }
    }

    fn build_chat_request(&self) -> Result<ChatRequest, String> {
        let entries = self.store.list_chat_entries(self.meta.track_id)?;
        let model = self
            .state
            .turn
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());

        let mut messages: Vec<ChatMessage> = Vec::new();
        for entry in entries {
            match entry.content {
                ChatEntryContent::Message {
                    role,
                    message_type,
                    content,
                } => {
                    // Thinking is not replayed to the provider.
                    if message_type == ChatMessageType::Thinking {
                        continue;
                    }
                    let llm_role = match role {
                        ChatRole::User => LlmRole::User,
                        ChatRole::Assistant => LlmRole::Assistant,
                    };
                    push_block(&mut messages, llm_role, ChatBlock::text(content));
                }
                ChatEntryContent::ToolInvocation {
                    tool_call_id,
                    tool_name,
                    arguments,
                    status,
                    result_content,
                    error_message,
                    denied_reason,
                    ..
                } => {
                    let Some((result, is_error)) = tool_result_payload(
                        status,
                        result_content,
                        error_message,
                        denied_reason,
                    ) else {
                        continue;
                    };
                    push_block(
                        &mut messages,
                        LlmRole::Assistant,
                        ChatBlock::ToolUse {
                            id: tool_call_id.clone(),
                            name: tool_name,
                            input: arguments,
                        },
                    );
                    push_block(
                        &mut messages,
                        LlmRole::User,
                        ChatBlock::tool_result(tool_call_id, result, is_error),
                    );
                }
                ChatEntryContent::ConsoleContext { content } => {
                    push_block(&mut messages, LlmRole::User, ChatBlock::text(content));
                }
            }
        }

        Ok(ChatRequest {
            model,
            system: SYSTEM_PROMPT.to_string(),
            messages,
            tools: self.catalog.definitions(),
            max_tokens: MAX_TOKENS,
            cache_context: self.state.turn.last_cache_context.clone(),
        })
    }

    fn snapshot(&self) -> TrackSnapshot {
        TrackSnapshot {
            console_status: self.state.console.status_or_offline(),
            prompt: self.state.console.current_prompt.clone(),
            history_blocks: self.state.console.history.len(),
            turn_status: self.state.turn.status,
            turn_id: self.state.turn.turn_id,
            autonomous: self.state.turn.autonomous,
            tools: self
                .state
                .turn
                .tools
                .values()
                .map(|t| (t.entry_id, t.status))
                .collect(),
        }
    }
}

/// Providers require alternating roles; adjacent same-role blocks merge.
fn push_block(messages: &mut Vec<ChatMessage>, role: LlmRole, block: ChatBlock) {
    match messages.last_mut() {
        Some(last) if last.role == role => last.content.push(block),
        _ => messages.push(ChatMessage {
            role,
            content: vec![block],
        }),
    }
}

/// What a terminal tool reports back to the model. Non-terminal rows (from a
/// mid-flight snapshot) are skipped entirely.
fn tool_result_payload(
    status: ToolStatus,
    result_content: Option<String>,
    error_message: Option<String>,
    denied_reason: Option<String>,
) -> Option<(String, bool)> {
    match status {
        ToolStatus::Success => Some((result_content.unwrap_or_default(), false)),
        ToolStatus::Error => Some((
            error_message.unwrap_or_else(|| "tool failed".to_string()),
            true,
        )),
        ToolStatus::Timeout => Some(("tool execution timed out".to_string(), true)),
        ToolStatus::Denied => Some((
            format!(
                "Denied by user: {}",
                denied_reason.unwrap_or_else(|| "no reason given".to_string())
            ),
            true,
        )),
        ToolStatus::Cancelled => Some(("cancelled".to_string(), true)),
        ToolStatus::Pending | ToolStatus::Approved | ToolStatus::Executing => None,
    }
}
