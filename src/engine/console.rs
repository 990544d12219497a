//! Console history fold
//!
//! Folds `ConsoleUpdated` signals into history blocks. Startup blocks persist
//! lazily: only a command completion in the same connection proves the
//! startup was real, so unproven startups are discarded when the next fresh
//! connection begins.

use super::action::Action;
use super::event::ConsoleSignal;
use super::state::{HistoryBlock, TrackState};
use crate::bus::ConsoleStatus;
use crate::db::{BlockStatus, BlockType};
use chrono::{DateTime, Utc};

pub fn fold_console(
    state: &mut TrackState,
    signal: &ConsoleSignal,
    now: DateTime<Utc>,
) -> Vec<Action> {
    let prev = state.console.status_or_offline();
    let next = signal.status;
    state.console.status = Some(next);
    state.console.busy_hint = false;
    if !signal.prompt.is_empty() {
        state.console.current_prompt = signal.prompt.clone();
    }

    let mut actions = Vec::new();

    match (prev, next) {
        (ConsoleStatus::Starting, ConsoleStatus::Starting) => {
            append_to_running(state, &signal.output, now);
        }
        (_, ConsoleStatus::Starting) => {
            begin_connection(state, signal, now);
        }
        (ConsoleStatus::Starting, ConsoleStatus::Ready) => {
            // Finished but NOT persisted; a command completion will prove it.
            if let Some(block) = state.console.history.last_mut() {
                if block.block_type == BlockType::Startup && block.status == BlockStatus::Running {
                    block.status = BlockStatus::Finished;
                    block.finished_at = Some(now);
                    block.prompt = Some(state.console.current_prompt.clone());
                }
            }
        }
        (ConsoleStatus::Ready, ConsoleStatus::Busy) => {
            let command = signal.command.clone().unwrap_or_default();
            state.console.command_id = signal.command_id.clone();
            state.console.history.push(HistoryBlock::command(
                command,
                signal.command_id.clone(),
                signal.output.clone(),
                now,
            ));
        }
        (ConsoleStatus::Busy, ConsoleStatus::Busy) => {
            append_to_running(state, &signal.output, now);
        }
        (ConsoleStatus::Busy, ConsoleStatus::Ready) => {
            actions.extend(complete_command(state, now));
            state.console.command_id = None;
        }
        (_, ConsoleStatus::Offline) => {
            for block in &mut state.console.history {
                if block.status == BlockStatus::Running {
                    block.status = BlockStatus::Interrupted;
                    block.finished_at = Some(now);
                }
            }
            state.console.command_id = None;
        }
        _ => {}
    }

    actions.push(Action::BroadcastConsole);
    actions
}

/// Fresh connection: drop trailing unproven startups, retire any other
/// unproven startup from a dead connection, open a new startup block.
fn begin_connection(state: &mut TrackState, signal: &ConsoleSignal, now: DateTime<Utc>) {
    while state
        .console
        .history
        .last()
        .is_some_and(|b| b.block_type == BlockType::Startup && !b.is_persisted())
    {
        state.console.history.pop();
    }
    for block in &mut state.console.history {
        if block.block_type == BlockType::Startup
            && !block.is_persisted()
            && block.status == BlockStatus::Finished
        {
            block.status = BlockStatus::Interrupted;
        }
    }
    state
        .console
        .history
        .push(HistoryBlock::startup(signal.output.clone(), now));
}

fn append_to_running(state: &mut TrackState, output: &str, now: DateTime<Utc>) {
    if output.is_empty() {
        return;
    }
    match state
        .console
        .history
        .last_mut()
        .filter(|b| b.status == BlockStatus::Running)
    {
        Some(block) => block.output.push_str(output),
        None => {
            // Output with no open block: open a startup block to hold it.
            state
                .console
                .history
                .push(HistoryBlock::startup(output.to_string(), now));
        }
    }
}

/// Command completion: persist the proven startups, then the command itself.
fn complete_command(state: &mut TrackState, now: DateTime<Utc>) -> Vec<Action> {
    let mut actions = Vec::new();
    let prompt = state.console.current_prompt.clone();

    for (index, block) in state.console.history.iter().enumerate() {
        if block.block_type == BlockType::Startup
            && block.status == BlockStatus::Finished
            && !block.is_persisted()
        {
            actions.push(Action::PersistConsoleBlock {
                index,
                block: block.clone(),
            });
        }
    }

    if let Some((index, block)) = state
        .console
        .history
        .iter_mut()
        .enumerate()
        .rev()
        .find(|(_, b)| b.block_type == BlockType::Command && b.status == BlockStatus::Running)
    {
        block.status = BlockStatus::Finished;
        block.finished_at = Some(now);
        block.prompt = Some(prompt);
        actions.push(Action::PersistConsoleBlock {
            index,
            block: block.clone(),
        });
    }

    actions
}

/// Output of the most recently completed command block, for tool results.
pub fn latest_command_output(state: &TrackState) -> Option<&HistoryBlock> {
    state
        .console
        .history
        .iter()
        .rev()
        .find(|b| b.block_type == BlockType::Command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ConsoleStatus;

    fn signal(status: ConsoleStatus, output: &str, prompt: &str) -> ConsoleSignal {
        ConsoleSignal {
            status,
            command_id: None,
            command: None,
            output: output.to_string(),
            prompt: prompt.to_string(),
        }
    }

    fn busy_signal(command_id: &str, command: &str, output: &str) -> ConsoleSignal {
        ConsoleSignal {
            status: ConsoleStatus::Busy,
            command_id: Some(command_id.to_string()),
            command: Some(command.to_string()),
            output: output.to_string(),
            prompt: String::new(),
        }
    }

    fn fold(state: &mut TrackState, s: ConsoleSignal) -> Vec<Action> {
        fold_console(state, &s, Utc::now())
    }

    fn persist_count(actions: &[Action]) -> usize {
        actions
            .iter()
            .filter(|a| matches!(a, Action::PersistConsoleBlock { .. }))
            .count()
    }

    #[test]
    fn startup_then_command_persists_both() {
        let mut state = TrackState::new(42, 1);

        let a = fold(&mut state, signal(ConsoleStatus::Starting, "banner\n", ""));
        assert_eq!(persist_count(&a), 0);
        let a = fold(&mut state, signal(ConsoleStatus::Ready, "", "msf6 > "));
        assert_eq!(persist_count(&a), 0, "startup is not persisted before proof");
        assert_eq!(state.console.history.len(), 1);
        assert_eq!(state.console.history[0].status, BlockStatus::Finished);

        let a = fold(&mut state, busy_signal("c1", "db_status", "connected\n"));
        assert_eq!(persist_count(&a), 0);
        assert_eq!(state.console.command_id.as_deref(), Some("c1"));

        let a = fold(&mut state, signal(ConsoleStatus::Ready, "", "msf6 > "));
        // Startup is proven by the command completion; both persist.
        assert_eq!(persist_count(&a), 2);
        assert_eq!(state.console.command_id, None);
        let command = &state.console.history[1];
        assert_eq!(command.status, BlockStatus::Finished);
        assert_eq!(command.prompt.as_deref(), Some("msf6 > "));
    }

    #[test]
    fn unproven_startup_discarded_on_fresh_connection() {
        let mut state = TrackState::new(42, 1);

        fold(&mut state, signal(ConsoleStatus::Starting, "banner A\n", ""));
        fold(&mut state, signal(ConsoleStatus::Ready, "", "msf6 > "));
        fold(&mut state, signal(ConsoleStatus::Offline, "", ""));

        // New connection: the unproven startup disappears.
        fold(&mut state, signal(ConsoleStatus::Starting, "banner B\n", ""));
        assert_eq!(state.console.history.len(), 1);
        assert_eq!(state.console.history[0].output, "banner B\n");
    }

    #[test]
    fn busy_deltas_accumulate() {
        let mut state = TrackState::new(42, 1);
        fold(&mut state, signal(ConsoleStatus::Starting, "", ""));
        fold(&mut state, signal(ConsoleStatus::Ready, "", "msf6 > "));
        fold(&mut state, busy_signal("c1", "db_nmap 10.0.0.1", "start\n"));
        fold(
            &mut state,
            signal(ConsoleStatus::Busy, "host found\n", ""),
        );

        let block = state.console.history.last().expect("command block");
        assert_eq!(block.output, "start\nhost found\n");
        assert_eq!(block.status, BlockStatus::Running);
    }

    #[test]
    fn offline_interrupts_running_blocks_without_persisting() {
        let mut state = TrackState::new(42, 1);
        fold(&mut state, signal(ConsoleStatus::Starting, "", ""));
        fold(&mut state, signal(ConsoleStatus::Ready, "", "msf6 > "));
        fold(&mut state, busy_signal("c1", "sleep 30", ""));

        let a = fold(&mut state, signal(ConsoleStatus::Offline, "", ""));
        assert_eq!(persist_count(&a), 0);

        let block = state.console.history.last().expect("command block");
        assert_eq!(block.status, BlockStatus::Interrupted);
        assert!(block.finished_at.is_some());
        assert_eq!(state.console.command_id, None);
    }

    #[test]
    fn stale_startup_from_dead_connection_never_persists() {
        let mut state = TrackState::new(42, 1);
        // Connection 1: startup proven-pending, command interrupted.
        fold(&mut state, signal(ConsoleStatus::Starting, "banner A\n", ""));
        fold(&mut state, signal(ConsoleStatus::Ready, "", "msf6 > "));
        fold(&mut state, busy_signal("c1", "sleep 30", ""));
        fold(&mut state, signal(ConsoleStatus::Offline, "", ""));

        // Connection 2: new startup, command completes.
        fold(&mut state, signal(ConsoleStatus::Starting, "banner B\n", ""));
        fold(&mut state, signal(ConsoleStatus::Ready, "", "msf6 > "));
        fold(&mut state, busy_signal("c2", "db_status", "ok\n"));
        let a = fold(&mut state, signal(ConsoleStatus::Ready, "", "msf6 > "));

        // Only connection 2's startup and command persist.
        let persisted: Vec<_> = a
            .iter()
            .filter_map(|action| match action {
                Action::PersistConsoleBlock { block, .. } => Some(block.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(persisted.len(), 2);
        assert_eq!(persisted[0].block_type, BlockType::Startup);
        assert_eq!(persisted[0].output, "banner B\n");
        assert_eq!(persisted[1].block_type, BlockType::Command);
    }

    #[test]
    fn prompt_tracks_latest_signal() {
        let mut state = TrackState::new(42, 1);
        fold(&mut state, signal(ConsoleStatus::Starting, "", "msf6 > "));
        assert_eq!(state.console.current_prompt, "msf6 > ");
        fold(
            &mut state,
            signal(ConsoleStatus::Ready, "", "msf6 exploit(handler) > "),
        );
        assert_eq!(state.console.current_prompt, "msf6 exploit(handler) > ");
    }
}
