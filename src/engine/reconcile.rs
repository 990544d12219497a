//! Turn sub-engine and reconciliation
//!
//! `reconcile` is the single decision point: invoked after every
//! state-changing event and run to fixed point by the shell. It terminates
//! because positions strictly increase and tool/turn statuses are one-way.

use super::action::Action;
use super::console::latest_command_output;
use super::state::TrackState;
use super::stream::{discard_stream, finalize_stream};
use crate::bus::{CommandStatus, ConsoleStatus};
use crate::db::{BlockStatus, BlockType, ToolStatus, TurnStatus};
use crate::llm::{StopReason, StreamEvent};
use crate::tools::ToolCatalog;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("a turn is already active")]
    TurnActive,
    #[error("unknown tool entry {0}")]
    UnknownEntry(i64),
    #[error("tool entry {0} is not pending")]
    NotPending(i64),
}

/// User submits an AI prompt. Rejected while a turn is in flight.
pub fn start_turn(
    state: &mut TrackState,
    text: &str,
    model: &str,
) -> Result<Vec<Action>, EngineError> {
    if !matches!(
        state.turn.status,
        TurnStatus::Idle | TurnStatus::Finished | TurnStatus::Error | TurnStatus::Cancelled
    ) {
        return Err(EngineError::TurnActive);
    }

    let mut actions = Vec::new();

    // Console activity since the previous turn travels with the new turn as
    // a console-context entry.
    let watermark = state.turn.context_watermark.min(state.console.history.len());
    let context: Vec<String> = state.console.history[watermark..]
        .iter()
        .filter(|b| {
            b.block_type == BlockType::Command
                && matches!(b.status, BlockStatus::Finished | BlockStatus::Interrupted)
        })
        .map(|b| {
            format!(
                "{}{}\n{}",
                b.prompt.as_deref().unwrap_or("> "),
                b.command.as_deref().unwrap_or(""),
                b.output
            )
        })
        .collect();
    state.turn.context_watermark = state.console.history.len();
    if !context.is_empty() {
        let position = state.alloc_position();
        actions.push(Action::PersistConsoleContext {
            position,
            content: context.join("\n"),
        });
    }

    let position = state.alloc_position();
    actions.extend([
        Action::CreateTurn {
            model: model.to_string(),
            trigger: "user".to_string(),
        },
        Action::PersistUserPrompt {
            position,
            content: text.to_string(),
        },
        Action::StartLlm,
        Action::BroadcastChat,
    ]);
    Ok(actions)
}

pub fn approve_tool(state: &mut TrackState, entry_id: i64) -> Result<Vec<Action>, EngineError> {
    let tool = state
        .turn
        .tools
        .get(&entry_id)
        .ok_or(EngineError::UnknownEntry(entry_id))?;
    if tool.status != ToolStatus::Pending {
        return Err(EngineError::NotPending(entry_id));
    }
    Ok(vec![
        Action::update_tool(entry_id, ToolStatus::Approved),
        Action::BroadcastChat,
    ])
}

pub fn deny_tool(
    state: &mut TrackState,
    entry_id: i64,
    reason: &str,
) -> Result<Vec<Action>, EngineError> {
    let tool = state
        .turn
        .tools
        .get(&entry_id)
        .ok_or(EngineError::UnknownEntry(entry_id))?;
    if tool.status != ToolStatus::Pending {
        return Err(EngineError::NotPending(entry_id));
    }
    Ok(vec![
        Action::UpdateToolStatus {
            entry_id,
            status: ToolStatus::Denied,
            result_content: None,
            error_message: None,
            duration_ms: None,
            denied_reason: Some(reason.to_string()),
        },
        Action::BroadcastChat,
    ])
}

/// User abandons the active turn. In-flight stream content is discarded, not
/// persisted; every non-terminal tool is cancelled.
pub fn cancel_turn(state: &mut TrackState) -> Vec<Action> {
    if matches!(
        state.turn.status,
        TurnStatus::Idle | TurnStatus::Finished | TurnStatus::Error | TurnStatus::Cancelled
    ) {
        return vec![];
    }
    discard_stream(state);
    state.turn.stream_done = None;
    state.turn.command_to_tool.clear();

    let mut actions = Vec::new();
    let open: Vec<i64> = state
        .turn
        .tools
        .values()
        .filter(|t| !t.status.is_terminal())
        .map(|t| t.entry_id)
        .collect();
    for entry_id in open {
        actions.push(Action::update_tool(entry_id, ToolStatus::Cancelled));
    }
    actions.push(Action::UpdateTurnStatus {
        status: TurnStatus::Cancelled,
    });
    actions.push(Action::BroadcastChat);
    actions
}

/// Wall-clock cap elapsed for a tool; only meaningful while it executes.
pub fn tool_timeout(state: &mut TrackState, entry_id: i64, now: DateTime<Utc>) -> Vec<Action> {
    let Some(tool) = state.turn.tools.get(&entry_id) else {
        return vec![];
    };
    if tool.status != ToolStatus::Executing {
        return vec![];
    }
    let duration_ms = tool
        .started_at
        .map(|t| (now - t).num_milliseconds().max(0));
    if let Some(command_id) = &tool.command_id {
        state.turn.command_to_tool.remove(command_id.as_str());
    }
    vec![
        Action::UpdateToolStatus {
            entry_id,
            status: ToolStatus::Timeout,
            result_content: None,
            error_message: Some("tool execution timed out".to_string()),
            duration_ms,
            denied_reason: None,
        },
        Action::BroadcastChat,
    ]
}

/// Stream events that drive the turn (content blocks are the stream fold's).
pub fn fold_turn_stream(
    state: &mut TrackState,
    event: &StreamEvent,
    catalog: &ToolCatalog,
) -> Vec<Action> {
    match event {
        StreamEvent::StreamStarted => {
            if state.turn.status == TurnStatus::Pending {
                vec![
                    Action::UpdateTurnStatus {
                        status: TurnStatus::Streaming,
                    },
                    Action::BroadcastChat,
                ]
            } else {
                vec![]
            }
        }

        StreamEvent::ToolCall {
            id, name, arguments, ..
        } => {
            let position = state.alloc_position();
            // Autonomous tracks bypass the approval gate.
            let status = if state.turn.autonomous {
                ToolStatus::Approved
            } else {
                ToolStatus::Pending
            };
            vec![
                Action::PersistToolInvocation {
                    position,
                    tool_call_id: id.clone(),
                    tool_name: name.clone(),
                    arguments: arguments.clone(),
                    console_prompt: state.console.current_prompt.clone(),
                    sequential: catalog.is_sequential(name),
                    status,
                },
                Action::BroadcastChat,
            ]
        }

        StreamEvent::StreamComplete {
            stop_reason,
            cache_context,
            ..
        } => {
            let mut actions = finalize_stream(state);
            state.turn.stream_done = Some(*stop_reason);
            if cache_context.is_some() {
                state.turn.last_cache_context = cache_context.clone();
            }
            match stop_reason {
                StopReason::EndTurn | StopReason::MaxTokens if state.turn.tools.is_empty() => {
                    actions.push(Action::UpdateTurnStatus {
                        status: TurnStatus::Finished,
                    });
                    actions.push(Action::BroadcastChat);
                }
                _ => {}
            }
            actions
        }

        StreamEvent::StreamError { reason, recoverable } => {
            tracing::warn!(
                track_id = state.track_id,
                reason = %reason,
                recoverable,
                "llm stream error"
            );
            discard_stream(state);
            state.turn.stream_done = None;
            vec![
                Action::UpdateTurnStatus {
                    status: TurnStatus::Error,
                },
                Action::BroadcastChat,
            ]
        }

        _ => vec![],
    }
}

/// Console became ready while a sequential tool was executing: that tool is
/// the one whose command just completed; the latest command block holds its
/// output.
pub fn on_console_ready(state: &mut TrackState, now: DateTime<Utc>) -> Vec<Action> {
    let Some(tool) = state
        .turn
        .tools
        .values()
        .find(|t| t.sequential && t.status == ToolStatus::Executing)
    else {
        return vec![];
    };
    let entry_id = tool.entry_id;
    let duration_ms = tool
        .started_at
        .map(|t| (now - t).num_milliseconds().max(0));
    let result_content = latest_command_output(state)
        .map(|block| block.output.clone())
        .unwrap_or_default();

    vec![
        Action::UpdateToolStatus {
            entry_id,
            status: ToolStatus::Success,
            result_content: Some(result_content),
            error_message: None,
            duration_ms,
            denied_reason: None,
        },
        Action::BroadcastChat,
    ]
}

/// Console (and so the container) went away: every executing tool errors and
/// the turn fails rather than continuing against a dead console.
pub fn on_console_offline(state: &mut TrackState, now: DateTime<Utc>) -> Vec<Action> {
    let executing: Vec<i64> = state
        .turn
        .tools
        .values()
        .filter(|t| t.status == ToolStatus::Executing)
        .map(|t| t.entry_id)
        .collect();
    if executing.is_empty() {
        return vec![];
    }

    let mut actions = Vec::new();
    for entry_id in executing {
        let duration_ms = state.turn.tools[&entry_id]
            .started_at
            .map(|t| (now - t).num_milliseconds().max(0));
        actions.push(Action::UpdateToolStatus {
            entry_id,
            status: ToolStatus::Error,
            result_content: None,
            error_message: Some("container_stopped".to_string()),
            duration_ms,
            denied_reason: None,
        });
    }
    state.turn.command_to_tool.clear();
    actions.push(Action::UpdateTurnStatus {
        status: TurnStatus::Error,
    });
    actions.push(Action::BroadcastChat);
    actions
}

/// Terminal result of a bash command correlated back to its tool.
pub fn bash_result(
    state: &mut TrackState,
    command_id: &str,
    status: CommandStatus,
    output: &str,
    exit_code: Option<i32>,
    error: Option<&str>,
    now: DateTime<Utc>,
) -> Vec<Action> {
    let Some(&entry_id) = state.turn.command_to_tool.get(command_id) else {
        return vec![];
    };
    match status {
        // Streaming output is observable on the bus; the tool row only
        // records the terminal result.
        CommandStatus::Running => vec![],
        CommandStatus::Finished => {
            state.turn.command_to_tool.remove(command_id);
            let duration_ms = state
                .turn
                .tools
                .get(&entry_id)
                .and_then(|t| t.started_at)
                .map(|t| (now - t).num_milliseconds().max(0));
            let result_content = match exit_code {
                Some(0) | None => output.to_string(),
                Some(code) => format!("{output}\n[exit code {code}]"),
            };
            vec![
                Action::UpdateToolStatus {
                    entry_id,
                    status: ToolStatus::Success,
                    result_content: Some(result_content),
                    error_message: None,
                    duration_ms,
                    denied_reason: None,
                },
                Action::BroadcastChat,
            ]
        }
        CommandStatus::Error => {
            state.turn.command_to_tool.remove(command_id);
            let duration_ms = state
                .turn
                .tools
                .get(&entry_id)
                .and_then(|t| t.started_at)
                .map(|t| (now - t).num_milliseconds().max(0));
            vec![
                Action::UpdateToolStatus {
                    entry_id,
                    status: ToolStatus::Error,
                    result_content: None,
                    error_message: Some(error.unwrap_or("bash command failed").to_string()),
                    duration_ms,
                    denied_reason: None,
                },
                Action::BroadcastChat,
            ]
        }
    }
}

/// The single decision point: converts the current state into the next
/// actions, one concern per pass.
pub fn reconcile(state: &TrackState) -> Vec<Action> {
    let turn = &state.turn;

    // 1. Nothing to decide on a resting or terminal turn.
    if matches!(
        turn.status,
        TurnStatus::Idle | TurnStatus::Finished | TurnStatus::Error | TurnStatus::Cancelled
    ) {
        return vec![];
    }

    // 2. Pending tools pull the turn into the approval gate.
    if turn.tools.values().any(|t| t.status == ToolStatus::Pending)
        && turn.status != TurnStatus::PendingApproval
    {
        return vec![
            Action::UpdateTurnStatus {
                status: TurnStatus::PendingApproval,
            },
            Action::BroadcastChat,
        ];
    }

    // 3. Approved tools move a streaming turn into execution.
    if turn.status == TurnStatus::Streaming
        && turn.tools.values().any(|t| t.status == ToolStatus::Approved)
    {
        return vec![Action::UpdateTurnStatus {
            status: TurnStatus::ExecutingTools,
        }];
    }

    if matches!(
        turn.status,
        TurnStatus::PendingApproval | TurnStatus::ExecutingTools
    ) {
        // 4. One sequential tool at a time, and only against a ready console.
        let sequential_executing = turn
            .tools
            .values()
            .any(|t| t.sequential && t.status == ToolStatus::Executing);
        if state.console.status_or_offline() == ConsoleStatus::Ready
            && !state.console.busy_hint
            && !sequential_executing
        {
            if let Some(tool) = turn
                .tools
                .values()
                .filter(|t| t.sequential && t.status == ToolStatus::Approved)
                .min_by_key(|t| t.position)
            {
                return vec![Action::ExecuteTool {
                    entry_id: tool.entry_id,
                }];
            }
        }

        // 5. Approved parallel tools all start in one batch.
        let parallel: Vec<i64> = turn
            .tools
            .values()
            .filter(|t| !t.sequential && t.status == ToolStatus::Approved)
            .map(|t| t.entry_id)
            .collect();
        if !parallel.is_empty() {
            return parallel
                .into_iter()
                .map(|entry_id| Action::ExecuteTool { entry_id })
                .collect();
        }

        // 6. All tools terminal: continue the conversation if anything
        // actually ran; an all-denied set just finishes the turn.
        if !turn.tools.is_empty()
            && turn.stream_done.is_some()
            && turn.tools.values().all(|t| t.status.is_terminal())
        {
            if turn
                .tools
                .values()
                .any(|t| t.status.is_executed_terminal())
            {
                return vec![
                    Action::UpdateTurnStatus {
                        status: TurnStatus::Pending,
                    },
                    Action::StartLlm,
                    Action::BroadcastChat,
                ];
            }
            return vec![
                Action::UpdateTurnStatus {
                    status: TurnStatus::Finished,
                },
                Action::BroadcastChat,
            ];
        }
    }

    // 7. A completed stream with no tools closes the turn.
    if turn.status == TurnStatus::Streaming
        && turn.stream_done.is_some()
        && turn.tools.is_empty()
    {
        return vec![
            Action::UpdateTurnStatus {
                status: TurnStatus::Finished,
            },
            Action::BroadcastChat,
        ];
    }

    // 8. Fixed point.
    vec![]
}
