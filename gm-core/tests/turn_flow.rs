//! Turn lifecycle: suspension on dice checks, resumption, guards and failures.

use claude::{ContentBlock, Role};
use gm_core::config::GmConfig;
use gm_core::dice::Outcome;
use gm_core::error::GmError;
use gm_core::session::{GamePhase, MessageRole, Session};
use gm_core::testing::{
    assert_pending_check, assert_phase, dice_result, dice_total, ScriptedModel, TestHarness,
};
use gm_core::{GameMaster, Language};
use serde_json::json;
use std::sync::Arc;

fn attack_check() -> serde_json::Value {
    json!({"intention": "strike the guard", "dice_formula": "2d6"})
}

/// Tool results carried by the last user message of a request.
fn last_tool_results(request: &claude::Request) -> Vec<(String, String, bool)> {
    let last = request.messages.last().expect("request has messages");
    assert_eq!(last.role, Role::User);
    last.content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => Some((tool_use_id.clone(), content.clone(), *is_error)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_plain_turn_completes() {
    let mut harness = TestHarness::new();
    harness.expect_text("The guard eyes you through the rain.");

    let response = harness.input("I walk up to the gate").await.unwrap();

    assert!(response.success);
    assert!(!response.requires_dice());
    assert_eq!(response.metadata.turn, 1);
    assert_eq!(response.metadata.iterations, 1);
    assert_eq!(harness.session.turn_count(), 1);
    assert_phase(&harness, GamePhase::WaitingInput);

    let log = harness.session.messages();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].role, MessageRole::Player);
    assert_eq!(log[0].content, "I walk up to the gate");
    assert_eq!(log[1].role, MessageRole::Narrator);
    assert_eq!(log[1].turn, 1);
}

#[tokio::test]
async fn test_attack_suspends_then_resumes() {
    let mut harness = TestHarness::new();
    harness.expect_tool_use("request_dice_check", attack_check());

    let response = harness.input("attack the guard").await.unwrap();

    assert!(response.success);
    assert!(response.requires_dice());
    assert!(response.content.is_empty());
    assert_eq!(response.metadata.phase, GamePhase::DiceCheck);
    assert_eq!(response.metadata.turn, 1);
    let check = response.metadata.check_request.clone().unwrap();
    assert_eq!(check.dice_formula, "2d6");
    assert!(!check.instructions.is_empty());
    assert_pending_check(&harness, "2d6");
    assert_eq!(harness.session.turn_count(), 0);
    assert_eq!(harness.session.messages().len(), 1);

    harness.expect_text("Your blade scrapes his helm; he staggers but holds the gate.");
    let response = harness.roll(dice_total(9, &[5, 4])).await.unwrap();

    assert!(response.success);
    assert!(!response.requires_dice());
    assert_eq!(response.metadata.turn, 1);
    assert_eq!(response.metadata.iterations, 2);
    assert_eq!(
        response.metadata.dice_result.as_ref().map(|r| r.outcome),
        Some(Outcome::Partial)
    );
    assert_phase(&harness, GamePhase::WaitingInput);
    assert_eq!(harness.session.turn_count(), 1);
    assert_eq!(harness.session.last_check_result.as_ref().map(|r| r.total), Some(9));
    assert!(harness.session.suspended_turn().is_none());

    // Exactly one narrator message closes the turn.
    let log = harness.session.messages();
    assert_eq!(log.len(), 2);
    assert_eq!(log[1].role, MessageRole::Narrator);
    assert_eq!(log[1].turn, 1);
    assert_eq!(
        log[1].content,
        "Your blade scrapes his helm; he staggers but holds the gate."
    );

    // The resumed call answers the dice tool use with the roll and its tier.
    let requests = harness.model.requests();
    assert_eq!(requests.len(), 2);
    let results = last_tool_results(&requests[1]);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, "toolu_001");
    assert!(results[0].1.contains("total 9"));
    assert!(results[0].1.contains("partial success"));
    assert!(!results[0].2);
}

#[tokio::test]
async fn test_resume_without_pending_check() {
    let mut harness = TestHarness::new();
    let before = harness.session.clone();

    let err = harness.roll(dice_result(&[3, 3])).await.unwrap_err();

    assert!(matches!(err, GmError::State(_)));
    assert_eq!(harness.session, before);
    assert_eq!(harness.model.call_count(), 0);
}

#[tokio::test]
async fn test_input_rejected_while_check_pending() {
    let mut harness = TestHarness::new();
    harness.expect_tool_use("request_dice_check", attack_check());
    harness.input("attack the guard").await.unwrap();
    let before = harness.session.clone();

    let err = harness.input("run away").await.unwrap_err();

    assert!(matches!(err, GmError::State(_)));
    assert_eq!(harness.session, before);
    assert_eq!(harness.model.call_count(), 1);
}

#[tokio::test]
async fn test_empty_input_rejected() {
    let mut harness = TestHarness::new();
    let err = harness.input("   ").await.unwrap_err();
    assert!(matches!(err, GmError::Validation(_)));
    assert_eq!(harness.model.call_count(), 0);
}

#[tokio::test]
async fn test_model_failure_leaves_session_untouched() {
    let mut harness = TestHarness::new();
    harness.expect_failure("connection reset");
    let before = harness.session.clone();

    let err = harness.input("open the gate").await.unwrap_err();

    assert!(matches!(err, GmError::ModelInvocation(_)));
    assert!(err.is_retryable());
    assert_eq!(harness.session, before);

    harness.expect_text("The gate groans open.");
    let response = harness.input("open the gate").await.unwrap();
    assert_eq!(response.content, "The gate groans open.");
    assert_eq!(harness.session.turn_count(), 1);
}

#[tokio::test]
async fn test_model_failure_during_resume_keeps_check() {
    let mut harness = TestHarness::new();
    harness.expect_tool_use("request_dice_check", attack_check());
    harness.input("attack the guard").await.unwrap();
    let before = harness.session.clone();

    harness.expect_failure("overloaded");
    let err = harness.roll(dice_total(11, &[5, 6])).await.unwrap_err();
    assert!(matches!(err, GmError::ModelInvocation(_)));
    assert_eq!(harness.session, before);
    assert_pending_check(&harness, "2d6");

    harness.expect_text("He drops his halberd.");
    let response = harness.roll(dice_total(11, &[5, 6])).await.unwrap();
    assert_eq!(response.content, "He drops his halberd.");
    assert_phase(&harness, GamePhase::WaitingInput);
}

#[tokio::test]
async fn test_invalid_formula_falls_back() {
    let mut harness = TestHarness::new();
    harness.expect_tool_use(
        "request_dice_check",
        json!({"intention": "climb the wall", "dice_formula": "d"}),
    );

    let response = harness.input("climb the wall").await.unwrap();

    assert_eq!(response.metadata.check_request.unwrap().dice_formula, "2d6");
}

#[tokio::test]
async fn test_chained_checks_in_one_turn() {
    let mut harness = TestHarness::new();
    harness.expect_tool_use("request_dice_check", attack_check());
    harness.input("attack the guard").await.unwrap();

    harness.expect_tool_use(
        "request_dice_check",
        json!({"intention": "keep your footing", "dice_formula": "3d6kh2"}),
    );
    let response = harness.roll(dice_total(10, &[4, 6])).await.unwrap();

    assert!(response.requires_dice());
    assert_eq!(response.metadata.turn, 1);
    assert_pending_check(&harness, "3d6kh2");
    assert_eq!(harness.session.turn_count(), 0);
    assert_eq!(harness.session.messages().len(), 1);
    assert_eq!(harness.session.last_check_result.as_ref().map(|r| r.total), Some(10));

    harness.expect_text("You stay upright as the guard falls.");
    let response = harness.roll(dice_result(&[6, 5, 1])).await.unwrap();
    assert!(!response.requires_dice());
    assert_eq!(response.metadata.iterations, 3);
    assert_eq!(harness.session.turn_count(), 1);
    assert_eq!(harness.session.messages().len(), 2);
}

#[tokio::test]
async fn test_iteration_cap_ends_turn_with_fallback() {
    let mut harness =
        TestHarness::new().map_gm(|gm| gm.with_config(GmConfig::default().with_max_iterations(2)));
    harness
        .expect_tool_use("search_lore", json!({"query": "keep"}))
        .expect_tool_use("search_lore", json!({"query": "keep again"}))
        .expect_text("never reached");

    let response = harness.input("tell me about the keep").await.unwrap();

    assert!(response.success);
    assert!(response.metadata.hit_iteration_cap);
    assert_eq!(response.metadata.iterations, 2);
    assert_eq!(response.content, Language::En.fallback_narrative());
    assert_eq!(harness.model.call_count(), 2);
    assert_phase(&harness, GamePhase::WaitingInput);
}

#[tokio::test]
async fn test_resume_gets_a_call_past_the_cap() {
    let mut harness =
        TestHarness::new().map_gm(|gm| gm.with_config(GmConfig::default().with_max_iterations(1)));
    harness.expect_tool_use("request_dice_check", attack_check());
    harness.input("attack the guard").await.unwrap();

    harness.expect_text("The guard yields.");
    let response = harness.roll(dice_total(12, &[6, 6])).await.unwrap();

    assert_eq!(response.content, "The guard yields.");
    assert!(!response.metadata.hit_iteration_cap);
}

#[tokio::test]
async fn test_duplicate_dice_requests_in_one_response() {
    let mut harness = TestHarness::new();
    harness.expect_tool_uses(vec![
        ("request_dice_check", attack_check()),
        ("request_dice_check", json!({"intention": "dodge", "dice_formula": "2d6"})),
    ]);

    let response = harness.input("attack the guard").await.unwrap();
    assert_eq!(
        response.metadata.check_request.unwrap().intention,
        "strike the guard"
    );

    harness.expect_text("Steel rings on steel.");
    harness.roll(dice_total(8, &[4, 4])).await.unwrap();

    let requests = harness.model.requests();
    let results = last_tool_results(&requests[1]);
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].0, "toolu_002");
    assert!(results[0].2);
    assert_eq!(results[1].0, "toolu_001");
    assert!(!results[1].2);
}

#[tokio::test]
async fn test_suspended_session_survives_serialization() {
    let mut harness = TestHarness::new();
    harness.expect_tool_use("request_dice_check", attack_check());
    harness.input("attack the guard").await.unwrap();
    let transcript = harness.session.suspended_turn().unwrap().transcript.clone();

    let json = serde_json::to_string(&harness.session).unwrap();
    let mut restored: Session = serde_json::from_str(&json).unwrap();
    assert!(restored.validate().is_ok());
    assert_eq!(restored.phase(), GamePhase::DiceCheck);

    let model = Arc::new(ScriptedModel::new().with_text("The guard reels."));
    let gm = GameMaster::new(model.clone());
    let response = gm
        .resume_after_dice(&mut restored, dice_total(9, &[4, 5]), Language::En)
        .await
        .unwrap();

    assert_eq!(response.content, "The guard reels.");
    assert_eq!(restored.turn_count(), 1);
    let request = &model.requests()[0];
    assert_eq!(&request.messages[..transcript.len()], &transcript[..]);
    assert_eq!(request.messages.len(), transcript.len() + 1);
}

#[tokio::test]
async fn test_history_carries_previous_turns() {
    let mut harness = TestHarness::new();
    harness.expect_text("Rain drips from the gate arch.");
    harness.input("look around").await.unwrap();
    harness.expect_text("The guard shrugs.");
    harness.input("greet the guard").await.unwrap();

    let requests = harness.model.requests();
    let second = &requests[1];
    assert_eq!(second.messages.len(), 3);
    assert_eq!(second.messages[0].role, Role::User);
    assert_eq!(second.messages[1].text(), "Rain drips from the gate arch.");
    assert_eq!(second.messages[2].text(), "greet the guard");
    assert!(second.system.as_deref().unwrap_or_default().contains("Sergeant Hala"));
}

#[tokio::test]
async fn test_language_switch_is_recorded() {
    let mut harness = TestHarness::new();
    harness.language = Language::Zh;
    harness.expect_tool_use("request_dice_check", json!({"intention": "撬锁"}));

    let response = harness.input("我试着撬锁").await.unwrap();

    assert_eq!(harness.session.language, Language::Zh);
    let check = response.metadata.check_request.unwrap();
    assert!(check.instructions.contains("撬锁"));
}
