//! Context slices handed to delegate agents.
//!
//! A slice is assembled field by field from the one record a delegate is
//! entitled to. Nothing is copied wholesale from the session, so data that
//! belongs to another NPC has no path into the slice.

use crate::delegate::{DelegateKind, DelegateTarget};
use crate::dice::DiceResult;
use crate::lang::Language;
use crate::session::Session;
use crate::world::{NpcRecord, NpcSheet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("no NPC record for agent '{0}'")]
    UnknownNpc(String),
}

/// Observable facts about the current scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneContext {
    pub location: String,
    pub region: Option<String>,
    pub facts: Vec<String>,
}

/// What an NPC delegate sees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NpcSlice {
    pub npc_id: String,
    pub sheet: NpcSheet,
    pub memories: Vec<String>,
    pub relationship: i32,
    pub secrets: Vec<String>,
    pub scene: SceneContext,
    pub player_name: String,
    pub player_input: String,
    pub instruction: String,
    pub language: Language,
}

/// What the rule adjudicator sees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSlice {
    pub rules_summary: String,
    pub player_traits: BTreeSet<String>,
    pub player_tags: BTreeSet<String>,
    pub last_check_result: Option<DiceResult>,
    pub prior_results: Vec<String>,
    pub player_input: String,
    pub instruction: String,
    pub language: Language,
}

/// What the lore delegate sees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoreSlice {
    pub world_pack_id: String,
    pub location: String,
    pub region: Option<String>,
    pub query: String,
    pub language: Language,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContextSlice {
    Npc(NpcSlice),
    Rule(RuleSlice),
    Lore(LoreSlice),
}

impl ContextSlice {
    pub fn kind(&self) -> DelegateKind {
        match self {
            ContextSlice::Npc(_) => DelegateKind::Npc,
            ContextSlice::Rule(_) => DelegateKind::Rule,
            ContextSlice::Lore(_) => DelegateKind::Lore,
        }
    }

    pub fn language(&self) -> Language {
        match self {
            ContextSlice::Npc(s) => s.language,
            ContextSlice::Rule(s) => s.language,
            ContextSlice::Lore(s) => s.language,
        }
    }

    pub fn as_npc(&self) -> Option<&NpcSlice> {
        match self {
            ContextSlice::Npc(s) => Some(s),
            _ => None,
        }
    }
}

/// Per-call inputs that do not come from the session.
#[derive(Debug, Clone, Copy)]
pub struct SliceRequest<'a> {
    pub player_input: &'a str,
    pub instruction: &'a str,
    pub language: Language,
    /// Tool results already produced this turn.
    pub prior_results: &'a [String],
}

/// Build the slice for `target`.
pub fn build_slice(
    target: &DelegateTarget,
    session: &Session,
    request: SliceRequest<'_>,
) -> Result<ContextSlice, ContextError> {
    match target.kind {
        DelegateKind::Npc => {
            let npc_id = target.subject.as_deref().unwrap_or(&target.name);
            let record = session
                .world
                .npc(npc_id)
                .ok_or_else(|| ContextError::UnknownNpc(target.name.clone()))?;
            Ok(ContextSlice::Npc(npc_slice(record, session, request)))
        }
        DelegateKind::Rule => Ok(ContextSlice::Rule(RuleSlice {
            rules_summary: session.world.rules_summary.clone(),
            player_traits: session.player.traits.clone(),
            player_tags: session.player.tags.clone(),
            last_check_result: session.last_check_result.clone(),
            prior_results: request.prior_results.to_vec(),
            player_input: request.player_input.to_string(),
            instruction: request.instruction.to_string(),
            language: request.language,
        })),
        DelegateKind::Lore => Ok(ContextSlice::Lore(LoreSlice {
            world_pack_id: session.world_pack_id.clone(),
            location: session.current_location.clone(),
            region: session.current_region().map(str::to_string),
            query: if request.instruction.trim().is_empty() {
                request.player_input.to_string()
            } else {
                request.instruction.to_string()
            },
            language: request.language,
        })),
    }
}

fn npc_slice(record: &NpcRecord, session: &Session, request: SliceRequest<'_>) -> NpcSlice {
    NpcSlice {
        npc_id: record.id.clone(),
        sheet: record.sheet.clone(),
        memories: record.memories.clone(),
        relationship: record.relationship,
        secrets: record.secrets.clone(),
        scene: SceneContext {
            location: session.current_location.clone(),
            region: session.current_region().map(str::to_string),
            facts: session.world.scene_facts.clone(),
        },
        player_name: session.player.name.clone(),
        player_input: request.player_input.to_string(),
        instruction: request.instruction.to_string(),
        language: request.language,
    }
}
