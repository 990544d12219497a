//! Property tests for the pure core

use super::testkit::Interpreted;
use super::*;
use crate::db::{ToolStatus, TurnStatus};
use crate::llm::StopReason;
use crate::tools::ToolCatalog;
use chrono::Utc;
use proptest::prelude::*;
use serde_json::json;

fn arb_tool_status() -> impl Strategy<Value = ToolStatus> {
    prop_oneof![
        Just(ToolStatus::Pending),
        Just(ToolStatus::Approved),
        Just(ToolStatus::Denied),
        Just(ToolStatus::Executing),
        Just(ToolStatus::Success),
        Just(ToolStatus::Error),
        Just(ToolStatus::Timeout),
    ]
}

fn arb_turn_status() -> impl Strategy<Value = TurnStatus> {
    prop_oneof![
        Just(TurnStatus::Idle),
        Just(TurnStatus::Pending),
        Just(TurnStatus::Streaming),
        Just(TurnStatus::PendingApproval),
        Just(TurnStatus::ExecutingTools),
        Just(TurnStatus::Finished),
        Just(TurnStatus::Error),
    ]
}

fn arb_tool_name() -> impl Strategy<Value = &'static str> {
    prop_oneof![
        Just(crate::tools::MSF_COMMAND),
        Just(crate::tools::BASH_COMMAND),
        Just("mystery_tool"),
    ]
}

proptest! {
    /// Reconciliation terminates from any reachable-ish state and is a no-op
    /// afterwards until a new external event arrives.
    #[test]
    fn reconcile_reaches_fixed_point(
        tools in prop::collection::vec((arb_tool_name(), arb_tool_status()), 0..6),
        turn_status in arb_turn_status(),
        console_ready in any::<bool>(),
        stream_done in any::<bool>(),
    ) {
        let catalog = ToolCatalog::builtin();
        let mut state = TrackState::new(42, 1);
        state.console.status = Some(if console_ready {
            crate::bus::ConsoleStatus::Ready
        } else {
            crate::bus::ConsoleStatus::Busy
        });
        state.turn.status = turn_status;
        state.turn.turn_id = Some(1);
        if stream_done {
            state.turn.stream_done = Some(StopReason::ToolUse);
        }
        for (i, (name, status)) in tools.iter().enumerate() {
            let entry_id = 100 + i as i64;
            let position = state.alloc_position();
            state.apply_tool_persisted(
                entry_id,
                position,
                &format!("call-{i}"),
                name,
                json!({"command": "x"}),
                catalog.is_sequential(name),
                *status,
            );
        }

        // `run` panics internally if 64 rounds do not reach a fixed point.
        let mut interp = Interpreted::new();
        interp.run(&mut state, vec![]);
        prop_assert!(reconcile(&state).is_empty());
    }

    /// Positions allocated by the stream fold are strictly increasing with no
    /// reuse, regardless of block index order.
    #[test]
    fn stream_positions_strictly_increase(
        indices in prop::collection::vec(0u32..8, 1..12),
        seed in 1i64..100,
    ) {
        let catalog = ToolCatalog::builtin();
        let mut state = TrackState::new(42, seed);
        let mut seen = Vec::new();
        let stream_ref = crate::llm::StreamRef::fresh();

        for (i, index) in indices.iter().enumerate() {
            // Unique synthetic index per event so every start opens a block.
            let index = index + (i as u32) * 10;
            let before = state.peek_next_position();
            let _ = fold(
                &mut state,
                &EngineEvent::Llm {
                    stream_ref: stream_ref.clone(),
                    event: crate::llm::StreamEvent::ContentBlockStart {
                        index,
                        kind: crate::llm::BlockKind::Text,
                    },
                },
                &catalog,
                Utc::now(),
            );
            let allocated = state.stream.blocks[&index];
            prop_assert_eq!(allocated, before);
            prop_assert!(seen.iter().all(|p| *p < allocated));
            seen.push(allocated);
        }
    }

    /// Reconcile never tries to move a terminal tool.
    #[test]
    fn terminal_tools_stay_terminal(
        start in arb_tool_status(),
    ) {
        let catalog = ToolCatalog::builtin();
        let mut state = TrackState::new(42, 1);
        state.turn.status = TurnStatus::ExecutingTools;
        state.turn.stream_done = Some(StopReason::ToolUse);
        state.apply_tool_persisted(
            100,
            1,
            "call-0",
            crate::tools::MSF_COMMAND,
            json!({"command": "x"}),
            catalog.is_sequential(crate::tools::MSF_COMMAND),
            start,
        );

        if start.is_terminal() {
            for action in reconcile(&state) {
                if let Action::ExecuteTool { entry_id } = action {
                    prop_assert_ne!(entry_id, 100);
                }
                if let Action::UpdateToolStatus { entry_id, status, .. } = action {
                    prop_assert!(!(entry_id == 100 && !status.is_terminal()));
                }
            }
        }
    }
}
