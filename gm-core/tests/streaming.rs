//! Frame ordering produced for real turns.

use gm_core::gm::{TurnMetadata, TurnResponse};
use gm_core::protocol::{chunk_text, ClientMessage, ServerMessage, StreamEncoder};
use gm_core::session::GamePhase;
use gm_core::testing::{dice_total, TestHarness};
use gm_core::Language;
use proptest::prelude::*;
use serde_json::json;

fn frame_types(frames: &[ServerMessage]) -> Vec<String> {
    frames
        .iter()
        .map(|frame| {
            let value = serde_json::to_value(frame).unwrap();
            value["type"].as_str().unwrap().to_string()
        })
        .collect()
}

#[tokio::test]
async fn test_dice_turn_frame_order() {
    let encoder = StreamEncoder::new(Language::En, 10);
    let mut harness = TestHarness::new();
    harness.expect_tool_use(
        "request_dice_check",
        json!({"intention": "strike the guard", "dice_formula": "2d6"}),
    );

    let mut frames = encoder.begin_turn(false);
    let result = harness.input("attack the guard").await;
    frames.extend(encoder.finish_turn(&result, harness.phase()));

    assert_eq!(
        frame_types(&frames),
        vec!["status", "phase", "status", "phase", "dice_check"]
    );
    assert_eq!(
        frames[3],
        ServerMessage::Phase {
            phase: GamePhase::DiceCheck
        }
    );
    let ServerMessage::DiceCheck { check_request } = &frames[4] else {
        panic!("expected a dice check frame");
    };
    assert_eq!(check_request.dice_formula, "2d6");

    let text = "Your strike lands, but the guard stands firm.";
    harness.expect_text(text);
    let mut frames = encoder.begin_turn(true);
    let result = harness.roll(dice_total(9, &[5, 4])).await;
    frames.extend(encoder.finish_turn(&result, harness.phase()));

    let chunks = chunk_text(text, 10).len();
    let mut expected = vec!["status", "phase", "status", "phase"];
    expected.extend(std::iter::repeat("content").take(chunks));
    expected.extend(["complete", "phase"]);
    assert_eq!(frame_types(&frames), expected);

    let contents: Vec<(String, bool, usize)> = frames
        .iter()
        .filter_map(|frame| match frame {
            ServerMessage::Content {
                chunk,
                is_partial,
                chunk_index,
            } => Some((chunk.clone(), *is_partial, *chunk_index)),
            _ => None,
        })
        .collect();
    let joined: String = contents.iter().map(|(c, _, _)| c.as_str()).collect();
    assert_eq!(joined, text);
    assert!(contents[..chunks - 1].iter().all(|(_, partial, _)| *partial));
    assert!(!contents[chunks - 1].1);
    assert_eq!(
        contents.iter().map(|(_, _, i)| *i).collect::<Vec<_>>(),
        (0..chunks).collect::<Vec<_>>()
    );

    let ServerMessage::Complete { content, metadata, success } = &frames[frames.len() - 2] else {
        panic!("expected a complete frame");
    };
    assert_eq!(content, text);
    assert!(*success);
    assert_eq!(metadata.turn, 1);
    assert_eq!(
        frames.last(),
        Some(&ServerMessage::Phase {
            phase: GamePhase::WaitingInput
        })
    );
}

#[tokio::test]
async fn test_failure_frames_report_resting_phase() {
    let encoder = StreamEncoder::new(Language::En, 40);
    let mut harness = TestHarness::new();

    let result = harness.roll(dice_total(7, &[3, 4])).await;
    let frames = encoder.finish_turn(&result, harness.phase());

    assert_eq!(frame_types(&frames), vec!["error", "complete", "phase"]);
    let value = serde_json::to_value(&frames[0]).unwrap();
    assert_eq!(value["data"]["kind"], "state_error");
    let ServerMessage::Complete {
        content,
        metadata,
        success,
    } = &frames[1]
    else {
        panic!("expected complete frame");
    };
    assert!(!*success);
    assert!(content.is_empty());
    assert!(!metadata.requires_dice);
    assert_eq!(metadata.phase, GamePhase::WaitingInput);
    assert_eq!(
        frames[2],
        ServerMessage::Phase {
            phase: GamePhase::WaitingInput
        }
    );
}

#[tokio::test]
async fn test_sync_after_reconnect_repeats_pending_check() {
    let encoder = StreamEncoder::new(Language::En, 40);
    let mut harness = TestHarness::new();
    harness.expect_tool_use("request_dice_check", json!({"intention": "pick the lock"}));
    harness.input("pick the lock").await.unwrap();

    let frames = encoder.sync(harness.session.snapshot());

    assert_eq!(frame_types(&frames), vec!["sync", "phase", "dice_check"]);
}

#[test]
fn test_client_frames_drive_a_turn() {
    let msg = ClientMessage::decode(
        r#"{"type": "dice_result", "data": {"total": 10, "all_rolls": [6, 4, 1], "kept_rolls": [6, 4], "lang": "en"}}"#,
    )
    .unwrap();
    let ClientMessage::DiceResult { result, lang } = msg else {
        panic!("expected a dice result");
    };
    assert_eq!(result.dropped_rolls, vec![1]);
    assert_eq!(lang, Some(Language::En));
}

proptest! {
    #[test]
    fn prop_narrative_chunks_are_ordered(text in "[a-z 骰子]{0,120}", size in 1usize..50) {
        let encoder = StreamEncoder::new(Language::En, size);
        let response = TurnResponse {
            success: true,
            content: text.clone(),
            metadata: TurnMetadata::default(),
            error: None,
        };
        let frames = encoder.finish_turn(&Ok(response), GamePhase::WaitingInput);

        let types = frame_types(&frames);
        prop_assert_eq!(&types[..2], ["status", "phase"]);
        prop_assert_eq!(types.iter().filter(|t| *t == "complete").count(), 1);
        prop_assert_eq!(&types[types.len() - 2..], ["complete", "phase"]);

        let chunks: Vec<(String, bool, usize)> = frames
            .iter()
            .filter_map(|frame| match frame {
                ServerMessage::Content { chunk, is_partial, chunk_index } => {
                    Some((chunk.clone(), *is_partial, *chunk_index))
                }
                _ => None,
            })
            .collect();

        let len = text.chars().count();
        prop_assert_eq!(chunks.len(), len.div_ceil(size));
        for (i, (chunk, is_partial, index)) in chunks.iter().enumerate() {
            prop_assert_eq!(*index, i);
            prop_assert_eq!(*is_partial, i + 1 < chunks.len());
            prop_assert!(chunk.chars().count() <= size);
        }
        let joined: String = chunks.iter().map(|(c, _, _)| c.as_str()).collect();
        prop_assert_eq!(joined, text);
    }
}
