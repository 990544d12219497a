//! LLM stream fold
//!
//! Maps content-block indices to monotonically allocated chat positions,
//! feeds deltas through the streaming markdown documents, and persists each
//! entry when its block closes. Tool-call blocks are the turn sub-engine's
//! concern (`reconcile`), not handled here.

use super::action::Action;
use super::state::{StreamingEntry, TrackState};
use crate::db::ChatMessageType;
use crate::llm::{BlockKind, StreamEvent};
use crate::markdown::MarkdownRenderer;

pub fn fold_stream(state: &mut TrackState, event: &StreamEvent) -> Vec<Action> {
    match event {
        StreamEvent::ContentBlockStart { index, kind } => {
            let message_type = match kind {
                BlockKind::Thinking => ChatMessageType::Thinking,
                BlockKind::Text => ChatMessageType::Response,
                BlockKind::ToolCall => return vec![],
            };
            let position = state.alloc_position();
            state.stream.blocks.insert(*index, position);
            state.stream.entries.insert(
                position,
                StreamingEntry {
                    message_type,
                    document: MarkdownRenderer::new(),
                },
            );
            vec![Action::BroadcastChat]
        }

        StreamEvent::ContentDelta { index, delta } => {
            let Some(position) = state.stream.blocks.get(index) else {
                return vec![];
            };
            if let Some(entry) = state.stream.entries.get_mut(position) {
                entry.document.put_and_render(delta);
            }
            vec![Action::BroadcastChat]
        }

        StreamEvent::ContentBlockStop { index } => {
            let Some(position) = state.stream.blocks.remove(index) else {
                return vec![];
            };
            finalize_entry(state, position)
        }

        // StreamStarted / ToolCall / StreamComplete / StreamError drive the
        // turn sub-engine.
        _ => vec![],
    }
}

/// Persist every still-streaming entry (stream finalization) and clear the
/// index mapping. Positions keep increasing; they are never reused.
pub fn finalize_stream(state: &mut TrackState) -> Vec<Action> {
    state.stream.blocks.clear();
    let positions: Vec<i64> = state.stream.entries.keys().copied().collect();
    let mut actions = Vec::new();
    for position in positions {
        actions.extend(finalize_entry(state, position));
    }
    actions
}

/// Drop in-flight entries without persisting (abandoned stream).
pub fn discard_stream(state: &mut TrackState) {
    state.stream.blocks.clear();
    state.stream.entries.clear();
}

fn finalize_entry(state: &mut TrackState, position: i64) -> Vec<Action> {
    let Some(entry) = state.stream.entries.remove(&position) else {
        return vec![];
    };
    vec![
        Action::PersistAssistantMessage {
            position,
            message_type: entry.message_type,
            content: entry.document.source().to_string(),
        },
        Action::BroadcastChat,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(index: u32, kind: BlockKind) -> StreamEvent {
        StreamEvent::ContentBlockStart { index, kind }
    }

    fn delta(index: u32, text: &str) -> StreamEvent {
        StreamEvent::ContentDelta {
            index,
            delta: text.to_string(),
        }
    }

    #[test]
    fn blocks_map_to_increasing_positions() {
        let mut state = TrackState::new(42, 5);

        fold_stream(&mut state, &start(0, BlockKind::Thinking));
        fold_stream(&mut state, &start(2, BlockKind::Text)); // indices need not be dense

        assert_eq!(state.stream.blocks[&0], 5);
        assert_eq!(state.stream.blocks[&2], 6);
        assert_eq!(state.peek_next_position(), 7);
    }

    #[test]
    fn stop_persists_accumulated_content() {
        let mut state = TrackState::new(42, 1);

        fold_stream(&mut state, &start(0, BlockKind::Text));
        fold_stream(&mut state, &delta(0, "Scanning"));
        fold_stream(&mut state, &delta(0, " now"));
        let actions = fold_stream(&mut state, &StreamEvent::ContentBlockStop { index: 0 });

        match &actions[0] {
            Action::PersistAssistantMessage {
                position,
                message_type,
                content,
            } => {
                assert_eq!(*position, 1);
                assert_eq!(*message_type, ChatMessageType::Response);
                assert_eq!(content, "Scanning now");
            }
            other => panic!("expected persist, got {other:?}"),
        }
        assert!(state.stream.entries.is_empty());
    }

    #[test]
    fn thinking_blocks_persist_as_thinking() {
        let mut state = TrackState::new(42, 1);
        fold_stream(&mut state, &start(0, BlockKind::Thinking));
        fold_stream(&mut state, &delta(0, "hmm"));
        let actions = fold_stream(&mut state, &StreamEvent::ContentBlockStop { index: 0 });
        assert!(matches!(
            &actions[0],
            Action::PersistAssistantMessage {
                message_type: ChatMessageType::Thinking,
                ..
            }
        ));
    }

    #[test]
    fn finalize_flushes_unstopped_entries() {
        let mut state = TrackState::new(42, 1);
        fold_stream(&mut state, &start(0, BlockKind::Text));
        fold_stream(&mut state, &delta(0, "partial"));

        let actions = finalize_stream(&mut state);
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::PersistAssistantMessage { content, .. } if content == "partial"
        )));
        assert!(state.stream.blocks.is_empty());
        assert!(state.stream.entries.is_empty());
    }

    #[test]
    fn tool_call_blocks_are_ignored_here() {
        let mut state = TrackState::new(42, 1);
        let actions = fold_stream(&mut state, &start(1, BlockKind::ToolCall));
        assert!(actions.is_empty());
        assert_eq!(state.peek_next_position(), 1, "no position allocated");
    }

    #[test]
    fn discard_drops_without_persisting() {
        let mut state = TrackState::new(42, 1);
        fold_stream(&mut state, &start(0, BlockKind::Text));
        fold_stream(&mut state, &delta(0, "gone"));
        discard_stream(&mut state);
        assert!(state.stream.entries.is_empty());
    }
}
