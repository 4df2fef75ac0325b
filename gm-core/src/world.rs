//! World state carried inside a session.
//!
//! NPC records are the only place private character data lives. Delegates
//! never see a `WorldState`; they get a slice built from a single record.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Bounds for an NPC's attitude toward the player.
pub const RELATIONSHIP_RANGE: (i32, i32) = (-100, 100);

// ============================================================================
// NPCs
// ============================================================================

/// Public-facing character sheet of an NPC.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NpcSheet {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub personality: String,
    #[serde(default)]
    pub speech_style: String,
    #[serde(default)]
    pub goals: Vec<String>,
}

/// Everything the world knows about one NPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NpcRecord {
    /// Stable id; the agent name for this NPC is `npc_<id>`.
    pub id: String,
    pub sheet: NpcSheet,
    #[serde(default)]
    pub memories: Vec<String>,
    /// Attitude toward the player, clamped to [`RELATIONSHIP_RANGE`].
    #[serde(default)]
    pub relationship: i32,
    #[serde(default)]
    pub secrets: Vec<String>,
    #[serde(default)]
    pub location: Option<String>,
}

impl NpcRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            sheet: NpcSheet {
                name: name.into(),
                ..Default::default()
            },
            memories: Vec::new(),
            relationship: 0,
            secrets: Vec::new(),
            location: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.sheet.description = description.into();
        self
    }

    pub fn with_personality(mut self, personality: impl Into<String>) -> Self {
        self.sheet.personality = personality.into();
        self
    }

    pub fn with_memory(mut self, memory: impl Into<String>) -> Self {
        self.memories.push(memory.into());
        self
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secrets.push(secret.into());
        self
    }

    pub fn at(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// The delegate name the model uses to talk to this NPC.
    pub fn agent_name(&self) -> String {
        format!("npc_{}", self.id)
    }

    /// Shift the relationship by `delta`, returning the new clamped value.
    pub fn adjust_relationship(&mut self, delta: i32) -> i32 {
        let (min, max) = RELATIONSHIP_RANGE;
        self.relationship = self.relationship.saturating_add(delta).clamp(min, max);
        self.relationship
    }
}

// ============================================================================
// World state
// ============================================================================

/// Mutable world data owned by a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldState {
    #[serde(default)]
    pub npcs: BTreeMap<String, NpcRecord>,
    /// Location name to region name.
    #[serde(default)]
    pub regions: BTreeMap<String, String>,
    /// Facts about the current scene that any participant could observe.
    #[serde(default)]
    pub scene_facts: Vec<String>,
    #[serde(default)]
    pub rules_summary: String,
}

impl WorldState {
    pub fn add_npc(&mut self, npc: NpcRecord) {
        self.npcs.insert(npc.id.clone(), npc);
    }

    /// Look up an NPC by id, accepting the `npc_` agent prefix.
    pub fn npc(&self, id: &str) -> Option<&NpcRecord> {
        self.npcs
            .get(id)
            .or_else(|| id.strip_prefix("npc_").and_then(|bare| self.npcs.get(bare)))
    }

    fn npc_mut(&mut self, id: &str) -> Option<&mut NpcRecord> {
        let key = if self.npcs.contains_key(id) {
            id.to_string()
        } else {
            id.strip_prefix("npc_")?.to_string()
        };
        self.npcs.get_mut(&key)
    }

    pub fn resolve_region(&self, location: &str) -> Option<&str> {
        self.regions.get(location).map(String::as_str)
    }

    /// Ids of NPCs placed at `location`.
    pub fn npcs_at(&self, location: &str) -> Vec<String> {
        self.npcs
            .values()
            .filter(|npc| npc.location.as_deref() == Some(location))
            .map(|npc| npc.id.clone())
            .collect()
    }

    /// Apply a relationship delta. Returns the new value, or `None` for an unknown NPC.
    pub fn apply_relation_change(&mut self, id: &str, delta: i32) -> Option<i32> {
        self.npc_mut(id).map(|npc| npc.adjust_relationship(delta))
    }

    /// Remember something an NPC witnessed.
    pub fn remember(&mut self, id: &str, memory: impl Into<String>) -> bool {
        match self.npc_mut(id) {
            Some(npc) => {
                npc.memories.push(memory.into());
                true
            }
            None => false,
        }
    }
}

// ============================================================================
// World packs
// ============================================================================

/// Initial content a session is created from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldPack {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub starting_location: String,
    /// Narrator text shown when a new game starts.
    #[serde(default)]
    pub opening: Option<String>,
    #[serde(default)]
    pub world: WorldState,
}

impl WorldPack {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_starting_location(mut self, location: impl Into<String>) -> Self {
        self.starting_location = location.into();
        self
    }

    pub fn with_npc(mut self, npc: NpcRecord) -> Self {
        self.world.add_npc(npc);
        self
    }

    pub fn with_region(mut self, location: impl Into<String>, region: impl Into<String>) -> Self {
        self.world.regions.insert(location.into(), region.into());
        self
    }

    pub fn with_scene_fact(mut self, fact: impl Into<String>) -> Self {
        self.world.scene_facts.push(fact.into());
        self
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// A small built-in pack used when no pack file is supplied.
    pub fn sample() -> Self {
        WorldPack::new("border-keep", "The Border Keep")
            .with_starting_location("Keep Gate")
            .with_region("Keep Gate", "Northern Marches")
            .with_region("Old Tavern", "Northern Marches")
            .with_scene_fact("Rain hammers the gatehouse roof.")
            .with_scene_fact("A single guard blocks the gate with a halberd.")
            .with_npc(
                NpcRecord::new("guard", "Sergeant Hala")
                    .with_description("A weathered gate sergeant in a dented helm.")
                    .with_personality("Dutiful, tired, quietly fair.")
                    .with_memory("Saw smugglers slip past last night.")
                    .with_secret("Owes the smugglers' captain a gambling debt.")
                    .at("Keep Gate"),
            )
            .with_npc(
                NpcRecord::new("innkeeper", "Bram Tallow")
                    .with_description("A round innkeeper with flour on his sleeves.")
                    .with_personality("Gossipy and warm.")
                    .with_secret("Hides a wanted priest in the cellar.")
                    .at("Old Tavern"),
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_npc_lookup_accepts_agent_prefix() {
        let pack = WorldPack::sample();
        assert!(pack.world.npc("guard").is_some());
        assert!(pack.world.npc("npc_guard").is_some());
        assert!(pack.world.npc("npc_dragon").is_none());
    }

    #[test]
    fn test_relationship_is_clamped() {
        let mut world = WorldPack::sample().world;
        assert_eq!(world.apply_relation_change("npc_guard", -30), Some(-30));
        assert_eq!(world.apply_relation_change("guard", -500), Some(-100));
        assert_eq!(world.apply_relation_change("guard", 250), Some(100));
        assert_eq!(world.apply_relation_change("nobody", 5), None);
    }

    #[test]
    fn test_regions_and_placement() {
        let world = WorldPack::sample().world;
        assert_eq!(world.resolve_region("Keep Gate"), Some("Northern Marches"));
        assert_eq!(world.resolve_region("Nowhere"), None);
        assert_eq!(world.npcs_at("Keep Gate"), vec!["guard".to_string()]);
    }

    #[test]
    fn test_pack_json_defaults() {
        let json = r#"{"id": "p", "name": "Pack", "world": {"npcs": {"a": {"id": "a", "sheet": {"name": "A"}}}}}"#;
        let pack = WorldPack::from_json(json).unwrap();
        let npc = pack.world.npc("a").unwrap();
        assert_eq!(npc.relationship, 0);
        assert!(npc.secrets.is_empty());
    }
}
