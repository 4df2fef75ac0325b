//! Session persistence for save/load.
//!
//! A save is the whole session, including a pending dice check, so a game
//! saved mid-check resumes exactly where it paused.

use crate::session::{GamePhase, Session, SessionError, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

/// Errors from persistence operations.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("Saved session is inconsistent: {0}")]
    Invalid(#[from] SessionError),
}

/// Current save file version.
pub const SAVE_VERSION: u32 = 1;

/// Quick-access facts about a save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveMetadata {
    pub session_id: SessionId,
    pub player_name: String,
    pub world_pack_id: String,
    pub location: String,
    pub turn_count: u32,
    pub phase: GamePhase,
    pub saved_at: DateTime<Utc>,
}

/// A saved session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedSession {
    /// Save format version for compatibility checking.
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub metadata: SaveMetadata,
    pub session: Session,
}

impl SavedSession {
    pub fn new(session: Session) -> Self {
        let saved_at = Utc::now();
        let metadata = SaveMetadata {
            session_id: session.id,
            player_name: session.player.name.clone(),
            world_pack_id: session.world_pack_id.clone(),
            location: session.current_location.clone(),
            turn_count: session.turn_count(),
            phase: session.phase(),
            saved_at,
        };
        Self {
            version: SAVE_VERSION,
            saved_at,
            metadata,
            session,
        }
    }

    pub fn to_json(&self) -> Result<String, PersistError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse and validate a save.
    pub fn from_json(json: &str) -> Result<Self, PersistError> {
        let saved: Self = serde_json::from_str(json)?;
        if saved.version != SAVE_VERSION {
            return Err(PersistError::VersionMismatch {
                expected: SAVE_VERSION,
                found: saved.version,
            });
        }
        saved.session.validate()?;
        Ok(saved)
    }

    /// Save to a JSON file.
    pub async fn save_json(&self, path: impl AsRef<Path>) -> Result<(), PersistError> {
        let content = self.to_json()?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, content).await?;
        Ok(())
    }

    /// Load from a JSON file.
    pub async fn load_json(path: impl AsRef<Path>) -> Result<Self, PersistError> {
        let content = fs::read_to_string(path).await?;
        Self::from_json(&content)
    }

    /// Read a save's metadata without validating the full session.
    pub async fn peek_metadata(path: impl AsRef<Path>) -> Result<SaveMetadata, PersistError> {
        let content = fs::read_to_string(path).await?;

        #[derive(Deserialize)]
        struct Partial {
            version: u32,
            metadata: SaveMetadata,
        }

        let partial: Partial = serde_json::from_str(&content)?;
        if partial.version != SAVE_VERSION {
            return Err(PersistError::VersionMismatch {
                expected: SAVE_VERSION,
                found: partial.version,
            });
        }
        Ok(partial.metadata)
    }
}

/// Default file for a session inside a save directory.
pub fn session_save_path(base_dir: impl AsRef<Path>, id: SessionId) -> PathBuf {
    base_dir.as_ref().join(format!("session_{id}.json"))
}

/// Information about a save file.
#[derive(Debug, Clone)]
pub struct SaveInfo {
    pub path: PathBuf,
    pub metadata: SaveMetadata,
}

/// List readable saves in a directory, most recent first.
pub async fn list_saves(dir: impl AsRef<Path>) -> Result<Vec<SaveInfo>, PersistError> {
    let mut saves = Vec::new();
    let mut entries = fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|e| e == "json") {
            if let Ok(metadata) = SavedSession::peek_metadata(&path).await {
                saves.push(SaveInfo { path, metadata });
            }
        }
    }

    saves.sort_by(|a, b| b.metadata.saved_at.cmp(&a.metadata.saved_at));
    Ok(saves)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::Language;
    use crate::session::PlayerProfile;
    use crate::world::WorldPack;

    fn session() -> Session {
        Session::new(&WorldPack::sample(), PlayerProfile::new("Ari"), Language::En)
    }

    #[test]
    fn test_round_trip_json() {
        let saved = SavedSession::new(session());
        let json = saved.to_json().unwrap();
        let loaded = SavedSession::from_json(&json).unwrap();
        assert_eq!(loaded.session, saved.session);
        assert_eq!(loaded.metadata.player_name, "Ari");
    }

    #[test]
    fn test_version_mismatch() {
        let mut saved = SavedSession::new(session());
        saved.version = 99;
        let json = serde_json::to_string(&saved).unwrap();
        assert!(matches!(
            SavedSession::from_json(&json),
            Err(PersistError::VersionMismatch { expected: 1, found: 99 })
        ));
    }

    #[test]
    fn test_saved_field_names() {
        let value = serde_json::to_value(SavedSession::new(session())).unwrap();
        let session = &value["session"];
        assert_eq!(session["current_phase"], "waiting_input");
        assert_eq!(session["turn_count"], 0);
        assert!(session.get("phase").is_none());
        assert!(session["suspended_turn"].is_null());
    }

    #[test]
    fn test_rejects_broken_invariant() {
        let saved = SavedSession::new(session());
        let mut value = serde_json::to_value(&saved).unwrap();
        value["session"]["current_phase"] = serde_json::json!("dice_check");
        let json = value.to_string();
        assert!(matches!(SavedSession::from_json(&json), Err(PersistError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_save_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let session = session();
        let path = session_save_path(dir.path(), session.id);
        SavedSession::new(session.clone()).save_json(&path).await.unwrap();

        let loaded = SavedSession::load_json(&path).await.unwrap();
        assert_eq!(loaded.session.id, session.id);

        let saves = list_saves(dir.path()).await.unwrap();
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].metadata.session_id, session.id);
    }
}
