//! Testing utilities for the engine.
//!
//! This module provides tools for integration testing:
//! - `ScriptedModel` for deterministic model replies without API calls
//! - `ScriptedDelegate` and `StaticLore` to stand in for delegates and lore
//! - `TestHarness` for scripted turns against a sample world
//! - Assertion helpers for verifying session state

use crate::context::ContextSlice;
use crate::delegate::{DelegateAgent, DelegateError, DelegateKind, DelegateReply, DelegateRegistry};
use crate::dice::{DiceFormula, DiceResult, Outcome};
use crate::error::GmError;
use crate::gm::{GameMaster, TurnResponse};
use crate::lang::Language;
use crate::llm::ModelProvider;
use crate::lore::{LoreError, LoreQuery, LoreService};
use crate::session::{GamePhase, PlayerProfile, Session};
use crate::world::WorldPack;
use async_trait::async_trait;
use claude::{ContentBlock, Request, Response, StopReason, Usage};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Text returned once a [`ScriptedModel`] runs out of replies.
pub const NO_MORE_REPLIES: &str = "The Game Master has no more scripted responses.";

// ============================================================================
// Scripted model
// ============================================================================

#[derive(Debug, Clone)]
enum Scripted {
    Reply(Response),
    Fail(String),
}

/// A model provider that replays queued responses in order.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    queue: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<Request>>,
    next_id: Mutex<usize>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a plain narrative reply.
    pub fn with_text(self, text: impl Into<String>) -> Self {
        self.push_text(text);
        self
    }

    /// Queue a reply that calls one tool.
    pub fn with_tool_use(self, name: &str, input: serde_json::Value) -> Self {
        self.push_tool_uses("", vec![(name, input)]);
        self
    }

    /// Queue a reply that calls several tools in one response.
    pub fn with_tool_uses(self, calls: Vec<(&str, serde_json::Value)>) -> Self {
        self.push_tool_uses("", calls);
        self
    }

    /// Queue a failed call.
    pub fn with_failure(self, message: impl Into<String>) -> Self {
        self.push_failure(message);
        self
    }

    pub fn push_text(&self, text: impl Into<String>) {
        let content = vec![ContentBlock::Text { text: text.into() }];
        self.push_response(response(content, StopReason::EndTurn));
    }

    /// Queue a tool-calling reply, optionally with text alongside the calls.
    pub fn push_tool_uses(&self, text: &str, calls: Vec<(&str, serde_json::Value)>) {
        let mut content = Vec::new();
        if !text.is_empty() {
            content.push(ContentBlock::Text {
                text: text.to_string(),
            });
        }
        for (name, input) in calls {
            content.push(ContentBlock::ToolUse {
                id: self.next_tool_id(),
                name: name.to_string(),
                input,
            });
        }
        self.push_response(response(content, StopReason::ToolUse));
    }

    pub fn push_response(&self, response: Response) {
        self.queue.lock().push_back(Scripted::Reply(response));
    }

    pub fn push_failure(&self, message: impl Into<String>) {
        self.queue.lock().push_back(Scripted::Fail(message.into()));
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn remaining(&self) -> usize {
        self.queue.lock().len()
    }

    fn next_tool_id(&self) -> String {
        let mut next = self.next_id.lock();
        *next += 1;
        format!("toolu_{:03}", *next)
    }
}

fn response(content: Vec<ContentBlock>, stop_reason: StopReason) -> Response {
    Response {
        id: "msg_scripted".to_string(),
        model: "scripted".to_string(),
        content,
        stop_reason,
        usage: Usage::default(),
    }
}

#[async_trait]
impl ModelProvider for ScriptedModel {
    async fn complete(&self, request: Request) -> Result<Response, claude::Error> {
        self.requests.lock().push(request);
        match self.queue.lock().pop_front() {
            Some(Scripted::Reply(response)) => Ok(response),
            Some(Scripted::Fail(message)) => Err(claude::Error::Network(message)),
            None => Ok(response(
                vec![ContentBlock::Text {
                    text: NO_MORE_REPLIES.to_string(),
                }],
                StopReason::EndTurn,
            )),
        }
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

// ============================================================================
// Delegates and lore
// ============================================================================

/// A delegate that records the slices it receives and replays replies.
///
/// Once the queue is empty the last reply repeats.
pub struct ScriptedDelegate {
    kind: DelegateKind,
    replies: Mutex<VecDeque<DelegateReply>>,
    last: Mutex<Option<DelegateReply>>,
    received: Mutex<Vec<ContextSlice>>,
    fail: bool,
}

impl ScriptedDelegate {
    pub fn new(kind: DelegateKind) -> Self {
        Self {
            kind,
            replies: Mutex::new(VecDeque::new()),
            last: Mutex::new(None),
            received: Mutex::new(Vec::new()),
            fail: false,
        }
    }

    pub fn with_reply(self, reply: DelegateReply) -> Self {
        self.replies.lock().push_back(reply);
        self
    }

    /// Every call fails as if the delegate's model were unreachable.
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Slices passed to this delegate, in call order.
    pub fn received(&self) -> Vec<ContextSlice> {
        self.received.lock().clone()
    }
}

#[async_trait]
impl DelegateAgent for ScriptedDelegate {
    fn kind(&self) -> DelegateKind {
        self.kind
    }

    async fn process(&self, context: &ContextSlice) -> Result<DelegateReply, DelegateError> {
        self.received.lock().push(context.clone());
        if self.fail {
            return Err(DelegateError::Model(claude::Error::Network(
                "delegate offline".to_string(),
            )));
        }
        let next = self.replies.lock().pop_front();
        let mut last = self.last.lock();
        if let Some(reply) = next {
            *last = Some(reply);
        }
        Ok(last
            .clone()
            .unwrap_or_else(|| DelegateReply::success("...")))
    }
}

/// A lore service that answers every query with the same text.
pub struct StaticLore {
    text: String,
    unavailable: bool,
    queries: Mutex<Vec<LoreQuery>>,
}

impl StaticLore {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            unavailable: false,
            queries: Mutex::new(Vec::new()),
        }
    }

    /// A backend whose every search fails.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::new("")
        }
    }

    pub fn queries(&self) -> Vec<LoreQuery> {
        self.queries.lock().clone()
    }
}

#[async_trait]
impl LoreService for StaticLore {
    async fn search(&self, query: &LoreQuery) -> Result<String, LoreError> {
        self.queries.lock().push(query.clone());
        if self.unavailable {
            return Err(LoreError::Unavailable("index offline".to_string()));
        }
        Ok(self.text.clone())
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Build a dice result from explicit rolls, keeping all of them.
pub fn dice_result(rolls: &[u32]) -> DiceResult {
    let formula = DiceFormula {
        count: rolls.len().max(1) as u32,
        sides: 6,
        keep: None,
    };
    formula.resolve(rolls.to_vec())
}

/// Build a dice result from a submitted total, as a client would report it.
pub fn dice_total(total: i32, rolls: &[u32]) -> DiceResult {
    DiceResult {
        total,
        all_rolls: rolls.to_vec(),
        kept_rolls: rolls.to_vec(),
        dropped_rolls: Vec::new(),
        outcome: Outcome::from_total(total),
    }
}

/// Test harness for running scripted turns.
pub struct TestHarness {
    pub model: Arc<ScriptedModel>,
    pub gm: GameMaster,
    pub session: Session,
    pub language: Language,
}

impl TestHarness {
    /// A harness on the sample world with a player named "Ari".
    pub fn new() -> Self {
        Self::with_pack(&WorldPack::sample())
    }

    pub fn with_pack(pack: &WorldPack) -> Self {
        let model = Arc::new(ScriptedModel::new());
        let gm = GameMaster::new(model.clone());
        let session = Session::new(pack, PlayerProfile::new("Ari"), Language::En);
        Self {
            model,
            gm,
            session,
            language: Language::En,
        }
    }

    /// Replace the delegate registry.
    pub fn with_registry(mut self, registry: DelegateRegistry) -> Self {
        self.gm = self.gm.with_registry(registry);
        self
    }

    pub fn with_lore(mut self, lore: Arc<dyn LoreService>) -> Self {
        self.gm = self.gm.with_lore(lore);
        self
    }

    /// Apply a change to the Game Master, e.g. a custom config.
    pub fn map_gm(mut self, f: impl FnOnce(GameMaster) -> GameMaster) -> Self {
        self.gm = f(self.gm);
        self
    }

    pub fn expect_text(&mut self, text: impl Into<String>) -> &mut Self {
        self.model.push_text(text);
        self
    }

    pub fn expect_tool_use(&mut self, name: &str, input: serde_json::Value) -> &mut Self {
        self.model.push_tool_uses("", vec![(name, input)]);
        self
    }

    pub fn expect_tool_uses(&mut self, calls: Vec<(&str, serde_json::Value)>) -> &mut Self {
        self.model.push_tool_uses("", calls);
        self
    }

    pub fn expect_failure(&mut self, message: impl Into<String>) -> &mut Self {
        self.model.push_failure(message);
        self
    }

    /// Send player input.
    pub async fn input(&mut self, text: &str) -> Result<TurnResponse, GmError> {
        self.gm.process(&mut self.session, text, self.language).await
    }

    /// Submit a roll for the pending check.
    pub async fn roll(&mut self, result: DiceResult) -> Result<TurnResponse, GmError> {
        self.gm
            .resume_after_dice(&mut self.session, result, self.language)
            .await
    }

    pub fn phase(&self) -> GamePhase {
        self.session.phase()
    }

    pub fn relationship(&self, npc_id: &str) -> Option<i32> {
        self.session.world.npc(npc_id).map(|npc| npc.relationship)
    }

    pub fn last_narrative(&self) -> Option<&str> {
        self.session.last_message().map(|m| m.content.as_str())
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Assertion Helpers
// ============================================================================

#[track_caller]
pub fn assert_phase(harness: &TestHarness, phase: GamePhase) {
    assert_eq!(
        harness.phase(),
        phase,
        "Expected phase {phase}, got {}",
        harness.phase()
    );
}

/// Assert the session is suspended on a check with the given formula.
#[track_caller]
pub fn assert_pending_check(harness: &TestHarness, formula: &str) {
    let pending = harness
        .session
        .pending_check()
        .unwrap_or_else(|| panic!("Expected a pending dice check"));
    assert_eq!(pending.dice_formula, formula);
    assert_phase(harness, GamePhase::DiceCheck);
}

#[track_caller]
pub fn assert_relationship(harness: &TestHarness, npc_id: &str, expected: i32) {
    assert_eq!(
        harness.relationship(npc_id),
        Some(expected),
        "Expected relationship {expected} with '{npc_id}'"
    );
}
