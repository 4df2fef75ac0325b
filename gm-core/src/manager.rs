//! In-memory registry of live sessions.
//!
//! Each session sits behind its own async mutex. A turn holds that mutex for
//! its whole duration, and a second turn for the same session is rejected
//! with [`GmError::Busy`] instead of queued. A live session is never
//! replaced by a registration for the same id.

use crate::dice::DiceResult;
use crate::error::GmError;
use crate::gm::{GameMaster, TurnResponse};
use crate::lang::Language;
use crate::persist::{session_save_path, SavedSession};
use crate::session::{GamePhase, PlayerProfile, Session, SessionId, SessionSnapshot};
use crate::world::WorldPack;
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};

struct SessionSlot {
    session: Arc<tokio::sync::Mutex<Session>>,
    last_active: Mutex<DateTime<Utc>>,
}

impl SessionSlot {
    fn new(session: Session) -> Self {
        Self {
            session: Arc::new(tokio::sync::Mutex::new(session)),
            last_active: Mutex::new(Utc::now()),
        }
    }

    fn touch(&self) {
        *self.last_active.lock() = Utc::now();
    }
}

/// Owns every live session and runs turns against them.
pub struct SessionManager {
    gm: Arc<GameMaster>,
    sessions: RwLock<HashMap<SessionId, Arc<SessionSlot>>>,
    save_dir: Option<PathBuf>,
}

impl SessionManager {
    pub fn new(gm: Arc<GameMaster>) -> Self {
        Self {
            gm,
            sessions: RwLock::new(HashMap::new()),
            save_dir: None,
        }
    }

    pub fn with_save_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.save_dir = Some(dir.into());
        self
    }

    pub fn game_master(&self) -> &GameMaster {
        &self.gm
    }

    pub fn save_dir(&self) -> Option<&Path> {
        self.save_dir.as_deref()
    }

    /// Start a new game and return its id.
    pub fn create_session(
        &self,
        pack: &WorldPack,
        player: PlayerProfile,
        language: Language,
    ) -> SessionId {
        let session = Session::new(pack, player, language);
        let id = session.id;
        info!(session_id = %id, "Starting session");
        self.sessions
            .write()
            .insert(id, Arc::new(SessionSlot::new(session)));
        id
    }

    /// Register an existing session.
    ///
    /// If a session with the same id is already live it is kept and the
    /// argument is discarded; while that session is mid-turn this fails with
    /// `Busy`.
    pub fn insert(&self, session: Session) -> Result<SessionId, GmError> {
        let id = session.id;
        let mut sessions = self.sessions.write();
        if let Some(live) = sessions.get(&id) {
            if live.session.try_lock().is_err() {
                return Err(GmError::Busy(id));
            }
            debug!(session_id = %id, "Session already live; keeping it");
            return Ok(id);
        }
        info!(session_id = %id, "Registering session");
        sessions.insert(id, Arc::new(SessionSlot::new(session)));
        Ok(id)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn remove(&self, id: SessionId) -> bool {
        self.sessions.write().remove(&id).is_some()
    }

    fn slot(&self, id: SessionId) -> Result<Arc<SessionSlot>, GmError> {
        self.sessions
            .read()
            .get(&id)
            .cloned()
            .ok_or(GmError::SessionNotFound(id))
    }

    /// Take the session for one call. Fails with `Busy` if a turn is
    /// already running; no other caller can start one until the lease drops.
    pub fn lease(&self, id: SessionId) -> Result<TurnLease, GmError> {
        let slot = self.slot(id)?;
        let session = slot
            .session
            .clone()
            .try_lock_owned()
            .map_err(|_| GmError::Busy(id))?;
        slot.touch();
        Ok(TurnLease {
            gm: self.gm.clone(),
            slot,
            session,
        })
    }

    /// Run a player action. Fails with `Busy` if a turn is already running.
    pub async fn process(
        &self,
        id: SessionId,
        player_input: &str,
        lang: Option<Language>,
    ) -> Result<TurnResponse, GmError> {
        self.lease(id)?.process(player_input, lang).await
    }

    /// Resume a suspended turn. Fails with `Busy` if a turn is already running.
    pub async fn resume_after_dice(
        &self,
        id: SessionId,
        result: DiceResult,
        lang: Option<Language>,
    ) -> Result<TurnResponse, GmError> {
        self.lease(id)?.resume_after_dice(result, lang).await
    }

    /// Current phase, waiting for any running turn to finish.
    pub async fn phase(&self, id: SessionId) -> Result<GamePhase, GmError> {
        let slot = self.slot(id)?;
        let session = slot.session.lock().await;
        Ok(session.phase())
    }

    /// Reconnect view, waiting for any running turn to finish.
    pub async fn snapshot(&self, id: SessionId) -> Result<SessionSnapshot, GmError> {
        let slot = self.slot(id)?;
        let session = slot.session.lock().await;
        Ok(session.snapshot())
    }

    /// A copy of the session, waiting for any running turn to finish.
    pub async fn session(&self, id: SessionId) -> Result<Session, GmError> {
        let slot = self.slot(id)?;
        let session = slot.session.lock().await;
        Ok(session.clone())
    }

    /// Save a session into the configured save directory.
    pub async fn save(&self, id: SessionId) -> Result<PathBuf, GmError> {
        let dir = self
            .save_dir
            .clone()
            .ok_or_else(|| GmError::Configuration("no save directory configured".to_string()))?;
        let path = session_save_path(&dir, id);
        self.save_to(id, &path).await?;
        Ok(path)
    }

    pub async fn save_to(&self, id: SessionId, path: impl AsRef<Path>) -> Result<(), GmError> {
        let session = self.session(id).await?;
        SavedSession::new(session).save_json(path.as_ref()).await?;
        info!(session_id = %id, path = %path.as_ref().display(), "Saved session");
        Ok(())
    }

    /// Load a save and register it. A live session with the same id wins
    /// over the file, see [`SessionManager::insert`].
    pub async fn load(&self, path: impl AsRef<Path>) -> Result<SessionId, GmError> {
        let saved = SavedSession::load_json(path).await?;
        self.insert(saved.session)
    }

    /// Load a session by id from the save directory unless it is already live.
    pub async fn restore(&self, id: SessionId) -> Result<SessionId, GmError> {
        if self.contains(id) {
            return Ok(id);
        }
        let dir = self.save_dir.as_ref().ok_or(GmError::SessionNotFound(id))?;
        let path = session_save_path(dir, id);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(GmError::SessionNotFound(id));
        }
        match self.load(path).await {
            // Another caller restored it first and already started a turn.
            Err(GmError::Busy(_)) => Ok(id),
            other => other,
        }
    }

    /// Drop sessions idle for longer than `max_idle` that are not mid-turn.
    pub fn evict_idle(&self, max_idle: Duration) -> Vec<SessionId> {
        let cutoff = Utc::now() - max_idle;
        let mut sessions = self.sessions.write();
        let idle: Vec<SessionId> = sessions
            .iter()
            .filter(|(_, slot)| *slot.last_active.lock() < cutoff && slot.session.try_lock().is_ok())
            .map(|(id, _)| *id)
            .collect();
        for id in &idle {
            sessions.remove(id);
            debug!(session_id = %id, "Evicted idle session");
        }
        idle
    }
}

/// Exclusive hold on one session for a single call.
pub struct TurnLease {
    gm: Arc<GameMaster>,
    slot: Arc<SessionSlot>,
    session: OwnedMutexGuard<Session>,
}

impl TurnLease {
    pub fn session_id(&self) -> SessionId {
        self.session.id
    }

    pub async fn process(
        mut self,
        player_input: &str,
        lang: Option<Language>,
    ) -> Result<TurnResponse, GmError> {
        let lang = lang.unwrap_or(self.session.language);
        let result = self.gm.process(&mut self.session, player_input, lang).await;
        self.slot.touch();
        result
    }

    pub async fn resume_after_dice(
        mut self,
        result: DiceResult,
        lang: Option<Language>,
    ) -> Result<TurnResponse, GmError> {
        let lang = lang.unwrap_or(self.session.language);
        let response = self
            .gm
            .resume_after_dice(&mut self.session, result, lang)
            .await;
        self.slot.touch();
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedModel;

    fn manager() -> SessionManager {
        let model = Arc::new(ScriptedModel::new().with_text("The gate creaks open."));
        SessionManager::new(Arc::new(GameMaster::new(model)))
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let manager = manager();
        let err = manager.process(SessionId::new(), "look", None).await.unwrap_err();
        assert!(matches!(err, GmError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_process_through_manager() {
        let manager = manager();
        let id = manager.create_session(&WorldPack::sample(), PlayerProfile::new("Ari"), Language::En);
        let response = manager.process(id, "open the gate", None).await.unwrap();
        assert_eq!(response.content, "The gate creaks open.");
        assert_eq!(manager.snapshot(id).await.unwrap().turn_count, 1);
    }

    #[tokio::test]
    async fn test_lease_blocks_other_calls() {
        let manager = manager();
        let id = manager.create_session(&WorldPack::sample(), PlayerProfile::new("Ari"), Language::En);

        let lease = manager.lease(id).unwrap();
        assert_eq!(lease.session_id(), id);
        assert!(matches!(manager.lease(id), Err(GmError::Busy(_))));
        assert!(matches!(
            manager.process(id, "open the gate", None).await,
            Err(GmError::Busy(_))
        ));
        assert!(manager.evict_idle(Duration::seconds(-1)).is_empty());

        let response = lease.process("open the gate", None).await.unwrap();
        assert!(response.success);
        assert!(manager.lease(id).is_ok());
    }

    #[tokio::test]
    async fn test_insert_keeps_live_session() {
        let manager = manager();
        let id = manager.create_session(&WorldPack::sample(), PlayerProfile::new("Ari"), Language::En);
        manager.process(id, "open the gate", None).await.unwrap();

        let mut stale = Session::new(&WorldPack::sample(), PlayerProfile::new("Bo"), Language::Zh);
        stale.id = id;
        assert_eq!(manager.insert(stale.clone()).unwrap(), id);
        let live = manager.session(id).await.unwrap();
        assert_eq!(live.player.name, "Ari");
        assert_eq!(live.turn_count(), 1);

        let _lease = manager.lease(id).unwrap();
        assert!(matches!(manager.insert(stale), Err(GmError::Busy(_))));
    }

    #[tokio::test]
    async fn test_evict_idle() {
        let manager = manager();
        let id = manager.create_session(&WorldPack::sample(), PlayerProfile::new("Ari"), Language::En);
        assert!(manager.evict_idle(Duration::hours(1)).is_empty());
        assert_eq!(manager.evict_idle(Duration::seconds(-1)), vec![id]);
        assert!(!manager.contains(id));
    }

    #[tokio::test]
    async fn test_save_requires_directory() {
        let manager = manager();
        let id = manager.create_session(&WorldPack::sample(), PlayerProfile::new("Ari"), Language::En);
        assert!(matches!(manager.save(id).await, Err(GmError::Configuration(_))));
    }
}
