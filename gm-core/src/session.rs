//! Session state.
//!
//! A [`Session`] is the single mutable entity of a game. Its phase, turn
//! counter, message log and suspended turn are private: only the Game Master
//! changes them, and only at the end of a turn, so a failed turn leaves them
//! exactly as they were.

use crate::dice::{DiceFormula, DiceResult};
use crate::lang::Language;
use crate::world::{WorldPack, WorldState};
use chrono::{DateTime, Utc};
use gm_macros::Tool;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(SessionId)
    }
}

/// Where a session is in its turn lifecycle.
///
/// A stored session is only ever `WaitingInput` or `DiceCheck`; the other two
/// phases exist while a turn is being streamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GamePhase {
    #[default]
    WaitingInput,
    Processing,
    DiceCheck,
    Narrating,
}

impl GamePhase {
    pub fn is_resting(&self) -> bool {
        matches!(self, GamePhase::WaitingInput | GamePhase::DiceCheck)
    }
}

impl fmt::Display for GamePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GamePhase::WaitingInput => "waiting_input",
            GamePhase::Processing => "processing",
            GamePhase::DiceCheck => "dice_check",
            GamePhase::Narrating => "narrating",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Message log
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    Player,
    Narrator,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<GamePhase>,
}

/// One entry of the append-only log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub turn: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

impl Message {
    pub fn player(content: impl Into<String>, turn: u32) -> Self {
        Self {
            role: MessageRole::Player,
            content: content.into(),
            timestamp: Utc::now(),
            turn,
            metadata: None,
        }
    }

    pub fn narrator(content: impl Into<String>, turn: u32) -> Self {
        Self {
            role: MessageRole::Narrator,
            content: content.into(),
            timestamp: Utc::now(),
            turn,
            metadata: Some(MessageMetadata {
                agent: Some("gm".to_string()),
                phase: Some(GamePhase::Narrating),
            }),
        }
    }
}

// ============================================================================
// Dice checks and suspension
// ============================================================================

/// Player attributes that bear on a check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Tool)]
pub struct InfluencingFactors {
    /// Character traits that help or hinder the attempt
    #[serde(default)]
    #[tool(optional)]
    pub traits: BTreeSet<String>,
    /// Situational tags such as 'outnumbered' or 'high ground'
    #[serde(default)]
    #[tool(optional)]
    pub tags: BTreeSet<String>,
}

/// Ask the player to roll dice before the outcome of a risky action is narrated.
/// Use this whenever the result of the player's attempt is genuinely uncertain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Tool)]
#[tool(name = "request_dice_check")]
pub struct DiceCheckRequest {
    /// What the player is attempting, in one sentence
    pub intention: String,
    /// Traits and tags that influence the roll
    #[serde(default)]
    #[tool(optional)]
    pub influencing_factors: InfluencingFactors,
    /// Dice formula such as '2d6', '3d6kh2' or '3d6kl2'. Defaults to 2d6.
    #[serde(default)]
    #[tool(optional)]
    pub dice_formula: String,
    /// Short explanation of the stakes shown to the player, in the player's language
    #[serde(default)]
    #[tool(optional)]
    pub instructions: String,
}

impl DiceCheckRequest {
    pub fn new(intention: impl Into<String>) -> Self {
        Self {
            intention: intention.into(),
            influencing_factors: InfluencingFactors::default(),
            dice_formula: String::new(),
            instructions: String::new(),
        }
    }

    pub fn with_formula(mut self, formula: impl Into<String>) -> Self {
        self.dice_formula = formula.into();
        self
    }

    /// Canonical form: a valid formula (2d6 when invalid) and non-empty instructions.
    pub fn normalized(mut self, lang: Language) -> Self {
        let formula = DiceFormula::parse_or_default(&self.dice_formula);
        self.dice_formula = formula.to_string();
        self.intention = self.intention.trim().to_string();
        if self.instructions.trim().is_empty() {
            self.instructions = lang.default_dice_instructions(&self.intention, &self.dice_formula);
        }
        self
    }

    pub fn formula(&self) -> DiceFormula {
        DiceFormula::parse_or_default(&self.dice_formula)
    }
}

/// A relationship shift reported by an NPC delegate during a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationChange {
    pub npc_id: String,
    pub delta: i32,
    /// Value after the change was applied at commit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<i32>,
}

/// Side effects gathered while a turn's tool loop runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnNotes {
    #[serde(default)]
    pub agents_called: Vec<String>,
    #[serde(default)]
    pub relation_changes: Vec<RelationChange>,
    #[serde(default)]
    pub lore_queries: Vec<String>,
}

/// A turn paused on a dice check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspendedTurn {
    pub player_input: String,
    /// Loop iterations already spent when the turn paused.
    pub iteration: usize,
    pub notes: TurnNotes,
    /// Model transcript up to and including the dice request.
    pub transcript: Vec<claude::Message>,
    /// Results of other tools called alongside the dice request.
    #[serde(default)]
    pub pending_results: Vec<claude::ContentBlock>,
    pub tool_use_id: String,
    pub check_request: DiceCheckRequest,
    pub language: Language,
    pub suspended_at: DateTime<Utc>,
}

// ============================================================================
// Session
// ============================================================================

/// The player's identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerProfile {
    pub name: String,
    #[serde(default)]
    pub traits: BTreeSet<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl PlayerProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_trait(mut self, t: impl Into<String>) -> Self {
        self.traits.insert(t.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }
}

/// Broken session invariants, found when loading or validating a session.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("phase is {phase} but suspended turn present is {suspended}")]
    PhaseMismatch { phase: GamePhase, suspended: bool },
    #[error("session stored in transient phase {0}")]
    TransientPhase(GamePhase),
}

/// A single-player game session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub world_pack_id: String,
    pub player: PlayerProfile,
    pub current_location: String,
    #[serde(default)]
    pub active_npc_ids: BTreeSet<String>,
    pub language: Language,
    /// Transient per-turn data kept by callers.
    #[serde(default)]
    pub scratch: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub last_check_result: Option<DiceResult>,
    #[serde(default)]
    pub world: WorldState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(rename = "current_phase")]
    phase: GamePhase,
    turn_count: u32,
    messages: Vec<Message>,
    suspended_turn: Option<SuspendedTurn>,
}

impl Session {
    /// Start a new game from a world pack.
    pub fn new(pack: &WorldPack, player: PlayerProfile, language: Language) -> Self {
        let now = Utc::now();
        let mut messages = Vec::new();
        if let Some(opening) = pack.opening.as_ref().filter(|o| !o.trim().is_empty()) {
            messages.push(Message::narrator(opening.clone(), 0));
        }

        Self {
            id: SessionId::new(),
            world_pack_id: pack.id.clone(),
            player,
            current_location: pack.starting_location.clone(),
            active_npc_ids: pack.world.npcs_at(&pack.starting_location).into_iter().collect(),
            language,
            scratch: BTreeMap::new(),
            last_check_result: None,
            world: pack.world.clone(),
            created_at: now,
            updated_at: now,
            phase: GamePhase::WaitingInput,
            turn_count: 0,
            messages,
            suspended_turn: None,
        }
    }

    pub fn phase(&self) -> GamePhase {
        self.phase
    }

    pub fn turn_count(&self) -> u32 {
        self.turn_count
    }

    /// Turn number of the turn in progress (or about to start).
    pub fn current_turn(&self) -> u32 {
        self.turn_count + 1
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// The last `n` messages, oldest first.
    pub fn recent_messages(&self, n: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }

    pub fn suspended_turn(&self) -> Option<&SuspendedTurn> {
        self.suspended_turn.as_ref()
    }

    pub fn pending_check(&self) -> Option<&DiceCheckRequest> {
        self.suspended_turn.as_ref().map(|s| &s.check_request)
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended_turn.is_some()
    }

    pub fn current_region(&self) -> Option<&str> {
        self.world.resolve_region(&self.current_location)
    }

    /// Check the phase/suspension invariant.
    pub fn validate(&self) -> Result<(), SessionError> {
        if !self.phase.is_resting() {
            return Err(SessionError::TransientPhase(self.phase));
        }
        let suspended = self.suspended_turn.is_some();
        if (self.phase == GamePhase::DiceCheck) != suspended {
            return Err(SessionError::PhaseMismatch {
                phase: self.phase,
                suspended,
            });
        }
        Ok(())
    }

    /// Pause the current turn on a dice check. `player_message` is present
    /// when the turn started in this call rather than in an earlier resume.
    pub(crate) fn suspend(&mut self, player_message: Option<Message>, suspended: SuspendedTurn) {
        if let Some(message) = player_message {
            self.messages.push(message);
        }
        self.suspended_turn = Some(suspended);
        self.phase = GamePhase::DiceCheck;
        self.updated_at = Utc::now();
    }

    /// Close the current turn with the narrator's message.
    pub(crate) fn complete_turn(&mut self, player_message: Option<Message>, narrator: Message) {
        if let Some(message) = player_message {
            self.messages.push(message);
        }
        self.messages.push(narrator);
        self.suspended_turn = None;
        self.phase = GamePhase::WaitingInput;
        self.turn_count += 1;
        self.updated_at = Utc::now();
    }

    /// State a reconnecting client needs to resynchronize.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id,
            phase: self.phase,
            turn_count: self.turn_count,
            language: self.language,
            last_message: self.messages.last().cloned(),
            pending_check: self.pending_check().cloned(),
        }
    }
}

/// Read-only view of a session used for reconnect sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub phase: GamePhase,
    pub turn_count: u32,
    pub language: Language,
    pub last_message: Option<Message>,
    pub pending_check: Option<DiceCheckRequest>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(&WorldPack::sample(), PlayerProfile::new("Ari"), Language::En)
    }

    #[test]
    fn test_new_session_rests_waiting() {
        let s = session();
        assert_eq!(s.phase(), GamePhase::WaitingInput);
        assert_eq!(s.turn_count(), 0);
        assert!(s.validate().is_ok());
        assert!(s.active_npc_ids.contains("guard"));
        assert_eq!(s.current_region(), Some("Northern Marches"));
    }

    #[test]
    fn test_dice_request_normalization() {
        let req = DiceCheckRequest::new("climb the wall")
            .with_formula("bogus")
            .normalized(Language::En);
        assert_eq!(req.dice_formula, "2d6");
        assert!(req.instructions.contains("climb the wall"));

        let req = DiceCheckRequest::new("x").with_formula("3D6KH2").normalized(Language::En);
        assert_eq!(req.dice_formula, "3d6kh2");
    }

    #[test]
    fn test_dice_request_tolerates_missing_fields() {
        let input = serde_json::json!({"intention": "sneak past"});
        let req = DiceCheckRequest::from_input(&input).unwrap();
        assert!(req.dice_formula.is_empty());
        assert!(req.influencing_factors.traits.is_empty());
    }

    #[test]
    fn test_dice_request_schema() {
        let tool = DiceCheckRequest::as_tool();
        assert_eq!(tool.name, "request_dice_check");
        let required = tool.input_schema["required"].as_array().unwrap();
        assert_eq!(required.len(), 1);
        let factors = &tool.input_schema["properties"]["influencing_factors"];
        assert_eq!(factors["properties"]["traits"]["uniqueItems"], true);
    }

    #[test]
    fn test_validate_detects_mismatch() {
        let mut s = session();
        s.phase = GamePhase::DiceCheck;
        assert_eq!(
            s.validate(),
            Err(SessionError::PhaseMismatch {
                phase: GamePhase::DiceCheck,
                suspended: false
            })
        );
        s.phase = GamePhase::Narrating;
        assert_eq!(s.validate(), Err(SessionError::TransientPhase(GamePhase::Narrating)));
    }

    #[test]
    fn test_session_id_parse() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<SessionId>().is_err());
    }
}
