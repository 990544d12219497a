//! Track engine core
//!
//! Pure state transitions for console history, LLM stream accumulation, and
//! turn reconciliation. `fold` ingests one event and returns the actions the
//! shell must execute; `reconcile` is then run to fixed point. No I/O happens
//! in this module tree.

mod action;
mod console;
mod event;
#[cfg(test)]
mod proptests;
mod reconcile;
pub mod state;
mod stream;

pub use action::Action;
pub use event::{ConsoleSignal, EngineEvent};
pub use reconcile::{reconcile, EngineError};
pub use state::{HistoryBlock, ToolInvocation, TrackState};

use crate::bus::ConsoleStatus;
use crate::db::{ToolStatus, TurnStatus};
use crate::llm::StreamRef;
use crate::tools::ToolCatalog;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Ingest one event. The returned actions are executed in order by the shell;
/// afterwards the shell runs `reconcile` until it returns no actions.
pub fn fold(
    state: &mut TrackState,
    event: &EngineEvent,
    catalog: &ToolCatalog,
    now: DateTime<Utc>,
) -> Result<Vec<Action>, EngineError> {
    match event {
        EngineEvent::Console(signal) => {
            let prev = state.console.status_or_offline();
            let mut actions = console::fold_console(state, signal, now);
            if prev == ConsoleStatus::Busy && signal.status == ConsoleStatus::Ready {
                actions.extend(reconcile::on_console_ready(state, now));
            }
            if signal.status == ConsoleStatus::Offline && prev != ConsoleStatus::Offline {
                actions.extend(reconcile::on_console_offline(state, now));
            }
            Ok(actions)
        }

        EngineEvent::Llm { event, .. } => {
            let mut actions = stream::fold_stream(state, event);
            actions.extend(reconcile::fold_turn_stream(state, event, catalog));
            Ok(actions)
        }

        EngineEvent::StartTurn { text, model } => reconcile::start_turn(state, text, model),

        EngineEvent::ApproveTool { entry_id } => reconcile::approve_tool(state, *entry_id),

        EngineEvent::DenyTool { entry_id, reason } => {
            reconcile::deny_tool(state, *entry_id, reason)
        }

        EngineEvent::CancelTurn => Ok(reconcile::cancel_turn(state)),

        EngineEvent::SetAutonomous(value) => {
            state.turn.autonomous = *value;
            Ok(vec![Action::BroadcastChat])
        }

        EngineEvent::ToolTimeout { entry_id } => {
            Ok(reconcile::tool_timeout(state, *entry_id, now))
        }

        EngineEvent::BashResult {
            command_id,
            status,
            output,
            exit_code,
            error,
        } => Ok(reconcile::bash_result(
            state,
            command_id,
            *status,
            output,
            *exit_code,
            error.as_deref(),
            now,
        )),
    }
}

// Apply functions: out-values of executed actions flow back into the state
// through these before the next action runs.
impl TrackState {
    /// `CreateTurn` yielded a turn id.
    pub fn apply_turn_created(&mut self, turn_id: i64, model: &str) {
        self.turn.turn_id = Some(turn_id);
        self.turn.model = Some(model.to_string());
        self.turn.status = TurnStatus::Pending;
        self.turn.tools.clear();
        self.turn.command_to_tool.clear();
        self.turn.stream_done = None;
        self.turn.stream_ref = None;
    }

    pub fn apply_turn_status(&mut self, status: TurnStatus) {
        self.turn.status = status;
    }

    /// `PersistToolInvocation` yielded an entry id.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_tool_persisted(
        &mut self,
        entry_id: i64,
        position: i64,
        tool_call_id: &str,
        tool_name: &str,
        arguments: Value,
        sequential: bool,
        status: ToolStatus,
    ) {
        self.turn.tools.insert(
            entry_id,
            ToolInvocation {
                entry_id,
                position,
                tool_call_id: tool_call_id.to_string(),
                tool_name: tool_name.to_string(),
                arguments,
                sequential,
                status,
                started_at: None,
                command_id: None,
            },
        );
    }

    pub fn apply_tool_status(&mut self, entry_id: i64, status: ToolStatus, now: DateTime<Utc>) {
        if let Some(tool) = self.turn.tools.get_mut(&entry_id) {
            if status == ToolStatus::Executing && tool.started_at.is_none() {
                tool.started_at = Some(now);
            }
            tool.status = status;
        }
    }

    /// A rejected dispatch (console busy) returns the tool to `approved`; the
    /// next reconcile retries once the console frees up. This is the single
    /// sanctioned backwards transition. The busy hint keeps sequential
    /// dispatch quiet until a real console signal arrives.
    pub fn apply_tool_requeued(&mut self, entry_id: i64) {
        if let Some(tool) = self.turn.tools.get_mut(&entry_id) {
            if tool.status == ToolStatus::Executing {
                tool.status = ToolStatus::Approved;
                tool.started_at = None;
            }
        }
        self.console.busy_hint = true;
    }

    /// `SendBashCommand` yielded a command id.
    pub fn apply_tool_command(&mut self, entry_id: i64, command_id: &str) {
        if let Some(tool) = self.turn.tools.get_mut(&entry_id) {
            tool.command_id = Some(command_id.to_string());
        }
        self.turn
            .command_to_tool
            .insert(command_id.to_string(), entry_id);
    }

    /// `StartLlm` yielded a stream ref: a fresh request is in flight.
    pub fn apply_stream_started(&mut self, stream_ref: StreamRef) {
        self.turn.stream_ref = Some(stream_ref);
        self.turn.status = TurnStatus::Pending;
        self.turn.tools.clear();
        self.turn.command_to_tool.clear();
        self.turn.stream_done = None;
    }

    /// `PersistConsoleBlock` yielded a row id.
    pub fn apply_block_persisted(&mut self, index: usize, id: i64) {
        if let Some(block) = self.console.history.get_mut(index) {
            block.id = Some(id);
        }
    }
}

#[cfg(test)]
pub(crate) mod testkit {
    //! A miniature interpreter for pure-level tests: applies actions the way
    //! the shell does, recording routed commands and LLM launches.

    use super::*;
    use crate::tools;

    #[derive(Default)]
    pub struct Interpreted {
        pub next_entry_id: i64,
        pub next_turn_id: i64,
        pub persisted_messages: Vec<(i64, String)>,
        pub persisted_tools: Vec<(i64, String, ToolStatus)>,
        pub routed_msf: Vec<(i64, String)>,
        pub routed_bash: Vec<(i64, String)>,
        pub llm_requests: u32,
        pub turn_statuses: Vec<TurnStatus>,
        pub reconcile_rounds: u32,
    }

    impl Interpreted {
        pub fn new() -> Self {
            Self {
                next_entry_id: 100,
                next_turn_id: 1,
                ..Self::default()
            }
        }

        /// Interpret actions, then run reconcile to fixed point (bounded).
        pub fn run(&mut self, state: &mut TrackState, actions: Vec<Action>) {
            let now = Utc::now();
            self.interpret(state, actions, now);
            for round in 0.. {
                assert!(round < 64, "reconcile did not reach a fixed point");
                let actions = reconcile(state);
                if actions.is_empty() {
                    break;
                }
                self.reconcile_rounds += 1;
                self.interpret(state, actions, now);
            }
        }

        fn interpret(&mut self, state: &mut TrackState, actions: Vec<Action>, now: DateTime<Utc>) {
            for action in actions {
                match action {
                    Action::CreateTurn { model, .. } => {
                        let turn_id = self.next_turn_id;
                        self.next_turn_id += 1;
                        state.apply_turn_created(turn_id, &model);
                    }
                    Action::PersistUserPrompt { position, content } => {
                        self.persisted_messages.push((position, content));
                    }
                    Action::PersistAssistantMessage {
                        position, content, ..
                    } => {
                        self.persisted_messages.push((position, content));
                    }
                    Action::PersistConsoleContext { position, content } => {
                        self.persisted_messages.push((position, content));
                    }
                    Action::PersistToolInvocation {
                        position,
                        tool_call_id,
                        tool_name,
                        arguments,
                        sequential,
                        status,
                        ..
                    } => {
                        let entry_id = self.next_entry_id;
                        self.next_entry_id += 1;
                        self.persisted_tools
                            .push((entry_id, tool_name.clone(), status));
                        state.apply_tool_persisted(
                            entry_id,
                            position,
                            &tool_call_id,
                            &tool_name,
                            arguments,
                            sequential,
                            status,
                        );
                    }
                    Action::UpdateToolStatus {
                        entry_id, status, ..
                    } => {
                        state.apply_tool_status(entry_id, status, now);
                    }
                    Action::UpdateTurnStatus { status } => {
                        state.apply_turn_status(status);
                        self.turn_statuses.push(status);
                    }
                    Action::ExecuteTool { entry_id } => {
                        state.apply_tool_status(entry_id, ToolStatus::Executing, now);
                        let tool = state.turn.tools[&entry_id].clone();
                        match tool.tool_name.as_str() {
                            tools::MSF_COMMAND => {
                                let command = tool.arguments["command"]
                                    .as_str()
                                    .unwrap_or_default()
                                    .to_string();
                                self.routed_msf.push((entry_id, command));
                            }
                            tools::BASH_COMMAND => {
                                let command = tool.arguments["command"]
                                    .as_str()
                                    .unwrap_or_default()
                                    .to_string();
                                let command_id = format!("bash-{entry_id}");
                                state.apply_tool_command(entry_id, &command_id);
                                self.routed_bash.push((entry_id, command));
                            }
                            _ => {
                                state.apply_tool_status(entry_id, ToolStatus::Error, now);
                            }
                        }
                    }
                    Action::StartLlm => {
                        self.llm_requests += 1;
                        state.apply_stream_started(StreamRef::fresh());
                    }
                    Action::PersistConsoleBlock { index, .. } => {
                        let entry_id = self.next_entry_id;
                        self.next_entry_id += 1;
                        state.apply_block_persisted(index, entry_id);
                    }
                    Action::BroadcastConsole | Action::BroadcastChat => {}
                }
            }
        }
    }
}
