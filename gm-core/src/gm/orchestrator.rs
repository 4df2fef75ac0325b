//! The Game Master: drives one turn of play.
//!
//! A turn is a bounded loop of model calls. Each iteration either ends the
//! turn with narrative text, runs the requested tools and loops again, or
//! suspends the turn on a dice check. The session is only borrowed for
//! reading while the loop runs; all of a turn's changes are committed in one
//! step at the end, so a failed model call leaves the session untouched.

use super::tools::{GmTools, ToolDispatcher, ToolEffect, ToolOutcome};
use crate::config::GmConfig;
use crate::delegate::DelegateRegistry;
use crate::dice::DiceResult;
use crate::error::GmError;
use crate::lang::Language;
use crate::llm::ModelProvider;
use crate::lore::LoreService;
use crate::session::{
    DiceCheckRequest, GamePhase, Message, MessageRole, RelationChange, Session, SuspendedTurn,
    TurnNotes,
};
use chrono::Utc;
use claude::{ContentBlock, Request, Role, ToolResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

// ============================================================================
// Responses
// ============================================================================

/// Metadata returned with every turn response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnMetadata {
    pub requires_dice: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_request: Option<DiceCheckRequest>,
    /// The turn this response belongs to.
    pub turn: u32,
    pub phase: GamePhase,
    #[serde(default)]
    pub agents_called: Vec<String>,
    #[serde(default)]
    pub relation_changes: Vec<RelationChange>,
    #[serde(default)]
    pub lore_queries: Vec<String>,
    /// Model calls spent on the turn so far, including before any suspension.
    pub iterations: usize,
    #[serde(default)]
    pub hit_iteration_cap: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dice_result: Option<DiceResult>,
}

/// Result of `process` or `resume_after_dice` as seen by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnResponse {
    pub success: bool,
    pub content: String,
    pub metadata: TurnMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TurnResponse {
    /// Response for a call that failed before changing anything. `phase` is
    /// where the session rests after the failure.
    pub fn failure(error: &GmError, phase: GamePhase) -> Self {
        Self {
            success: false,
            content: String::new(),
            metadata: TurnMetadata {
                phase,
                requires_dice: phase == GamePhase::DiceCheck,
                ..Default::default()
            },
            error: Some(error.to_string()),
        }
    }

    pub fn requires_dice(&self) -> bool {
        self.metadata.requires_dice
    }
}

// ============================================================================
// Loop state
// ============================================================================

/// Progress of the tool loop for the turn in flight.
struct TurnProgress {
    player_input: String,
    transcript: Vec<claude::Message>,
    iteration: usize,
    notes: TurnNotes,
    language: Language,
}

enum LoopEnd {
    Narrative {
        text: String,
        hit_cap: bool,
        notes: TurnNotes,
        iterations: usize,
    },
    Suspended(Box<SuspendedTurn>),
}

/// The Game Master.
pub struct GameMaster {
    model: Arc<dyn ModelProvider>,
    registry: DelegateRegistry,
    /// Cleared once a caller supplies its own registry.
    standard_registry: bool,
    lore: Option<Arc<dyn LoreService>>,
    config: GmConfig,
}

impl GameMaster {
    /// Create a Game Master with the standard delegates and no lore service.
    ///
    /// The standard delegates follow later `with_config` and `with_lore`
    /// calls until `with_registry` replaces them.
    pub fn new(model: Arc<dyn ModelProvider>) -> Self {
        let mut gm = Self {
            model,
            registry: DelegateRegistry::new(),
            standard_registry: true,
            lore: None,
            config: GmConfig::default(),
        };
        gm.rebuild_standard_registry();
        gm
    }

    pub fn with_config(mut self, config: GmConfig) -> Self {
        self.config = config;
        self.rebuild_standard_registry();
        self
    }

    pub fn with_registry(mut self, registry: DelegateRegistry) -> Self {
        self.registry = registry;
        self.standard_registry = false;
        self
    }

    pub fn with_lore(mut self, lore: Arc<dyn LoreService>) -> Self {
        self.lore = Some(lore);
        self.rebuild_standard_registry();
        self
    }

    fn rebuild_standard_registry(&mut self) {
        if !self.standard_registry {
            return;
        }
        self.registry = DelegateRegistry::standard(
            self.model.clone(),
            self.lore.clone(),
            self.config.delegate_model().map(str::to_string),
            self.config.delegate_max_tokens,
        );
    }

    pub fn config(&self) -> &GmConfig {
        &self.config
    }

    pub fn registry(&self) -> &DelegateRegistry {
        &self.registry
    }

    /// Handle one player action.
    ///
    /// Fails with `Validation` on empty input and with `State` unless the
    /// session is waiting for input. Returns an empty narrative with
    /// `requires_dice` set when the turn pauses on a dice check.
    pub async fn process(
        &self,
        session: &mut Session,
        player_input: &str,
        lang: Language,
    ) -> Result<TurnResponse, GmError> {
        let player_input = player_input.trim();
        if player_input.is_empty() {
            return Err(GmError::Validation("player input is empty".to_string()));
        }
        match session.phase() {
            GamePhase::WaitingInput => {}
            GamePhase::DiceCheck => {
                return Err(GmError::State(
                    "a dice check is pending; submit the roll before acting again".to_string(),
                ))
            }
            other => return Err(GmError::State(format!("session is in phase {other}"))),
        }

        let turn = session.current_turn();
        info!(session_id = %session.id, turn, "Processing player input");

        let mut transcript = self.history(session);
        match transcript.last_mut() {
            Some(last) if last.role == Role::User => last.content.push(ContentBlock::Text {
                text: player_input.to_string(),
            }),
            _ => transcript.push(claude::Message::user(player_input)),
        }

        let progress = TurnProgress {
            player_input: player_input.to_string(),
            transcript,
            iteration: 0,
            notes: TurnNotes::default(),
            language: lang,
        };

        let end = self
            .run_loop(session, progress, self.config.max_iterations)
            .await?;
        let player_message = Message::player(player_input, turn);
        Ok(self.commit(session, end, lang, Some(player_message), None))
    }

    /// Continue a suspended turn with the player's roll.
    ///
    /// Fails with `State` when no turn is suspended. The loop picks up at the
    /// iteration where it paused and is granted at least one more model call.
    pub async fn resume_after_dice(
        &self,
        session: &mut Session,
        result: DiceResult,
        lang: Language,
    ) -> Result<TurnResponse, GmError> {
        let suspended = session
            .suspended_turn()
            .cloned()
            .ok_or_else(GmError::no_pending_check)?;

        info!(
            session_id = %session.id,
            turn = session.current_turn(),
            total = result.total,
            outcome = %result.outcome,
            "Resuming turn after dice check"
        );

        let mut results = suspended.pending_results;
        results.push(ContentBlock::tool_result(
            suspended.tool_use_id.clone(),
            ToolResult::success(result.describe(lang)),
        ));

        let mut transcript = suspended.transcript;
        transcript.push(claude::Message::tool_results(results));

        let progress = TurnProgress {
            player_input: suspended.player_input,
            transcript,
            iteration: suspended.iteration,
            notes: suspended.notes,
            language: lang,
        };

        let budget_end = self.config.max_iterations.max(suspended.iteration + 1);
        let end = self.run_loop(session, progress, budget_end).await?;
        Ok(self.commit(session, end, lang, None, Some(result)))
    }

    /// Recent log as model messages, starting with a player message and
    /// never repeating a role twice in a row.
    fn history(&self, session: &Session) -> Vec<claude::Message> {
        let mut messages: Vec<claude::Message> = Vec::new();
        for entry in session.recent_messages(self.config.history_window) {
            let role = match entry.role {
                MessageRole::Player => Role::User,
                MessageRole::Narrator => Role::Assistant,
            };
            if messages.is_empty() && role == Role::Assistant {
                continue;
            }
            match messages.last_mut() {
                Some(last) if last.role == role => {
                    last.content.push(ContentBlock::Text {
                        text: entry.content.clone(),
                    });
                }
                _ => messages.push(claude::Message {
                    role,
                    content: vec![ContentBlock::Text {
                        text: entry.content.clone(),
                    }],
                }),
            }
        }
        messages
    }

    async fn run_loop(
        &self,
        session: &Session,
        mut progress: TurnProgress,
        budget_end: usize,
    ) -> Result<LoopEnd, GmError> {
        let lang = progress.language;
        let system = self.build_system_prompt(session, lang);
        let tools = GmTools::all();
        let lore = self.lore.as_deref();

        let mut prior_results: Vec<String> = progress
            .transcript
            .iter()
            .flat_map(|m| m.content.iter())
            .filter_map(|block| match block {
                ContentBlock::ToolResult {
                    content,
                    is_error: false,
                    ..
                } => Some(content.clone()),
                _ => None,
            })
            .collect();
        let mut narrative = String::new();

        while progress.iteration < budget_end {
            progress.iteration += 1;
            debug!(
                session_id = %session.id,
                iteration = progress.iteration,
                "Calling model"
            );

            let mut request = Request::new(progress.transcript.clone())
                .with_system(&system)
                .with_max_tokens(self.config.max_tokens)
                .with_tools(tools.clone());
            if let Some(ref model) = self.config.model {
                request = request.with_model(model);
            }
            if let Some(temp) = self.config.temperature {
                request = request.with_temperature(temp);
            }

            let response = self.model.complete(request).await.map_err(|e| {
                warn!(session_id = %session.id, error = %e, "Model call failed");
                GmError::from(e)
            })?;

            let text = response.text();
            if !text.trim().is_empty() {
                narrative = text.trim().to_string();
            }

            let tool_uses = response.tool_uses();
            if tool_uses.is_empty() {
                return Ok(LoopEnd::Narrative {
                    text: narrative,
                    hit_cap: false,
                    notes: progress.notes,
                    iterations: progress.iteration,
                });
            }

            progress.transcript.push(claude::Message {
                role: Role::Assistant,
                content: response.content.clone(),
            });

            let mut results = Vec::new();
            let mut dice: Option<(String, DiceCheckRequest)> = None;
            for tool_use in &tool_uses {
                if dice.is_some() && GmTools::is_dice_check(&tool_use.name) {
                    results.push(ContentBlock::tool_result(
                        tool_use.id.clone(),
                        ToolResult::error(lang.duplicate_dice_check()),
                    ));
                    continue;
                }

                let dispatcher = ToolDispatcher {
                    session,
                    registry: &self.registry,
                    lore,
                    language: lang,
                    player_input: &progress.player_input,
                    prior_results: &prior_results,
                };
                match dispatcher.dispatch(tool_use).await {
                    ToolOutcome::Completed { result, effects } => {
                        apply_effects(&mut progress.notes, effects);
                        if !result.is_error {
                            prior_results.push(result.content.clone());
                        }
                        results.push(ContentBlock::tool_result(tool_use.id.clone(), result));
                    }
                    ToolOutcome::SuspendForDice(request) => {
                        dice = Some((tool_use.id.clone(), request));
                    }
                }
            }

            if let Some((tool_use_id, check_request)) = dice {
                info!(
                    session_id = %session.id,
                    iteration = progress.iteration,
                    formula = %check_request.dice_formula,
                    "Suspending turn for dice check"
                );
                return Ok(LoopEnd::Suspended(Box::new(SuspendedTurn {
                    player_input: progress.player_input,
                    iteration: progress.iteration,
                    notes: progress.notes,
                    transcript: progress.transcript,
                    pending_results: results,
                    tool_use_id,
                    check_request,
                    language: lang,
                    suspended_at: Utc::now(),
                })));
            }

            progress.transcript.push(claude::Message::tool_results(results));
        }

        warn!(
            session_id = %session.id,
            iterations = progress.iteration,
            "Tool loop hit its iteration cap"
        );
        Ok(LoopEnd::Narrative {
            text: narrative,
            hit_cap: true,
            notes: progress.notes,
            iterations: progress.iteration,
        })
    }

    /// Apply a finished loop to the session. This is the only place a turn
    /// mutates session state.
    fn commit(
        &self,
        session: &mut Session,
        end: LoopEnd,
        lang: Language,
        player_message: Option<Message>,
        dice_result: Option<DiceResult>,
    ) -> TurnResponse {
        session.language = lang;
        if let Some(result) = &dice_result {
            session.last_check_result = Some(result.clone());
        }

        match end {
            LoopEnd::Suspended(suspended) => {
                let metadata = TurnMetadata {
                    requires_dice: true,
                    check_request: Some(suspended.check_request.clone()),
                    turn: session.current_turn(),
                    phase: GamePhase::DiceCheck,
                    agents_called: suspended.notes.agents_called.clone(),
                    relation_changes: suspended.notes.relation_changes.clone(),
                    lore_queries: suspended.notes.lore_queries.clone(),
                    iterations: suspended.iteration,
                    hit_iteration_cap: false,
                    dice_result,
                };
                session.suspend(player_message, *suspended);
                TurnResponse {
                    success: true,
                    content: String::new(),
                    metadata,
                    error: None,
                }
            }
            LoopEnd::Narrative {
                text,
                hit_cap,
                notes,
                iterations,
            } => {
                // Relation changes gathered before a suspension travel in the
                // suspended turn's notes and are applied here, once.
                let mut relation_changes = notes.relation_changes;
                for change in &mut relation_changes {
                    change.new_value = session
                        .world
                        .apply_relation_change(&change.npc_id, change.delta);
                }

                let content = if text.trim().is_empty() {
                    lang.fallback_narrative().to_string()
                } else {
                    text
                };

                let turn = session.current_turn();
                session.complete_turn(player_message, Message::narrator(content.clone(), turn));
                info!(session_id = %session.id, turn, "Turn complete");

                TurnResponse {
                    success: true,
                    content,
                    metadata: TurnMetadata {
                        requires_dice: false,
                        check_request: None,
                        turn,
                        phase: GamePhase::WaitingInput,
                        agents_called: notes.agents_called,
                        relation_changes,
                        lore_queries: notes.lore_queries,
                        iterations,
                        hit_iteration_cap: hit_cap,
                        dice_result,
                    },
                    error: None,
                }
            }
        }
    }

    fn build_system_prompt(&self, session: &Session, lang: Language) -> String {
        let mut prompt = String::new();

        match &self.config.custom_system_prompt {
            Some(custom) => prompt.push_str(custom),
            None => {
                prompt.push_str(include_str!("prompts/gm_base.txt"));
                prompt.push_str("\n\n");
                prompt.push_str(include_str!("prompts/dice_checks.txt"));
            }
        }

        prompt.push_str("\n\n## Current Scene\n");
        prompt.push_str(&format!("Location: {}\n", session.current_location));
        if let Some(region) = session.current_region() {
            prompt.push_str(&format!("Region: {region}\n"));
        }
        for fact in &session.world.scene_facts {
            prompt.push_str(&format!("- {fact}\n"));
        }

        let present: Vec<_> = session
            .active_npc_ids
            .iter()
            .filter_map(|id| session.world.npc(id))
            .collect();
        if !present.is_empty() {
            prompt.push_str("\n## Characters Present\n");
            for npc in present {
                prompt.push_str(&format!(
                    "- {} (agent: {}): {}\n",
                    npc.sheet.name,
                    npc.agent_name(),
                    npc.sheet.description
                ));
            }
        }

        prompt.push_str(&format!("\n## Player\nName: {}\n", session.player.name));
        if !session.player.traits.is_empty() {
            let traits: Vec<_> = session.player.traits.iter().map(String::as_str).collect();
            prompt.push_str(&format!("Traits: {}\n", traits.join(", ")));
        }
        if !session.player.tags.is_empty() {
            let tags: Vec<_> = session.player.tags.iter().map(String::as_str).collect();
            prompt.push_str(&format!("Tags: {}\n", tags.join(", ")));
        }

        let routes = self.registry.describe_routes();
        if !routes.is_empty() {
            prompt.push_str(&format!("\n## Agents\n{}\n", routes.join(", ")));
        }
        if !session.world.rules_summary.is_empty() {
            prompt.push_str(&format!("\n## Rules\n{}\n", session.world.rules_summary));
        }

        prompt.push_str(&format!("\nTurn {}. {}", session.current_turn(), lang.reply_instruction()));
        prompt
    }
}

fn apply_effects(notes: &mut TurnNotes, effects: Vec<ToolEffect>) {
    for effect in effects {
        match effect {
            ToolEffect::AgentCalled(name) => notes.agents_called.push(name),
            ToolEffect::RelationChange { npc_id, delta } => {
                notes.relation_changes.push(RelationChange {
                    npc_id,
                    delta,
                    new_value: None,
                })
            }
            ToolEffect::LoreQueried(query) => notes.lore_queries.push(query),
        }
    }
}
