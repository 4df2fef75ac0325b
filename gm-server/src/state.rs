//! Shared server state.

use gm_core::error::GmError;
use gm_core::protocol::{ClientMessage, ServerMessage, StreamEncoder};
use gm_core::session::{GamePhase, PlayerProfile, SessionId};
use gm_core::{Language, SessionManager, WorldPack};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;

/// State handed to every connection.
pub struct AppState {
    pub manager: Arc<SessionManager>,
    /// World pack used for new sessions.
    pub pack: WorldPack,
    pub chunk_size: usize,
    pub default_language: Language,
}

/// Query string accepted on `/ws`.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    /// Reattach to an existing session instead of starting a new one.
    pub session_id: Option<String>,
    pub player: Option<String>,
    pub lang: Option<String>,
}

impl ConnectParams {
    pub fn language(&self, fallback: Language) -> Language {
        Language::resolve(self.lang.as_deref(), fallback)
    }

    pub fn player(&self) -> PlayerProfile {
        let name = self
            .player
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or("Traveler");
        PlayerProfile::new(name)
    }
}

impl AppState {
    /// Find the session a connection asked for, or start a new one.
    ///
    /// An unparseable or unknown id falls through to a new session.
    pub async fn attach(&self, params: &ConnectParams) -> (SessionId, bool) {
        if let Some(id) = params.session_id.as_deref().and_then(|s| s.parse::<SessionId>().ok()) {
            match self.manager.restore(id).await {
                Ok(id) => return (id, true),
                Err(e) => tracing::warn!(session_id = %id, error = %e, "Cannot reattach session"),
            }
        }
        let language = params.language(self.default_language);
        let id = self.manager.create_session(&self.pack, params.player(), language);
        (id, false)
    }

    /// Run one client request against the session and queue its frames.
    ///
    /// The session is leased before anything is sent, so a request that
    /// arrives mid-turn gets only its rejection and never a second set of
    /// turn-start frames.
    pub async fn run_turn(
        &self,
        session_id: SessionId,
        msg: ClientMessage,
        language: Language,
        tx: &mpsc::Sender<ServerMessage>,
    ) {
        let encoder = StreamEncoder::new(language, self.chunk_size);
        let lease = match self.manager.lease(session_id) {
            Ok(lease) => lease,
            Err(e) => {
                tracing::debug!(session_id = %session_id, error = %e, "Turn rejected");
                let phase = self.resting_phase(session_id, &e).await;
                send_all(tx, encoder.failure(&e, phase)).await;
                return;
            }
        };

        let result = match msg {
            ClientMessage::PlayerInput { content, .. } => {
                send_all(tx, encoder.begin_turn(false)).await;
                lease.process(&content, Some(language)).await
            }
            ClientMessage::DiceResult { result, .. } => {
                send_all(tx, encoder.begin_turn(true)).await;
                lease.resume_after_dice(result, Some(language)).await
            }
            ClientMessage::Ping => return,
        };

        let phase = match &result {
            Ok(response) => response.metadata.phase,
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Turn failed");
                self.resting_phase(session_id, e).await
            }
        };
        send_all(tx, encoder.finish_turn(&result, phase)).await;

        if result.is_ok() && self.manager.save_dir().is_some() {
            if let Err(e) = self.manager.save(session_id).await {
                tracing::warn!(session_id = %session_id, error = %e, "Autosave failed");
            }
        }
    }

    /// Phase to report after a failed call.
    pub async fn resting_phase(&self, id: SessionId, error: &GmError) -> GamePhase {
        if matches!(error, GmError::Busy(_)) {
            return GamePhase::Processing;
        }
        self.manager
            .phase(id)
            .await
            .unwrap_or(GamePhase::WaitingInput)
    }
}

/// Queue frames in order. A closed channel means the client left; the
/// turn's result is already committed to the session.
pub async fn send_all(tx: &mpsc::Sender<ServerMessage>, frames: Vec<ServerMessage>) {
    for frame in frames {
        if tx.send(frame).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gm_core::testing::ScriptedModel;
    use gm_core::GameMaster;

    fn drain(mut rx: mpsc::Receiver<ServerMessage>) -> Vec<String> {
        let mut types = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            let value = serde_json::to_value(&frame).unwrap();
            types.push(value["type"].as_str().unwrap().to_string());
        }
        types
    }

    fn input(content: &str) -> ClientMessage {
        ClientMessage::PlayerInput {
            content: content.to_string(),
            lang: None,
        }
    }

    fn state() -> AppState {
        let gm = GameMaster::new(Arc::new(ScriptedModel::new()));
        AppState {
            manager: Arc::new(SessionManager::new(Arc::new(gm))),
            pack: WorldPack::sample(),
            chunk_size: 40,
            default_language: Language::En,
        }
    }

    #[test]
    fn test_params_defaults() {
        let params = ConnectParams::default();
        assert_eq!(params.player().name, "Traveler");
        assert_eq!(params.language(Language::Zh), Language::Zh);

        let params = ConnectParams {
            lang: Some("en-US".to_string()),
            player: Some("  Ari ".to_string()),
            ..Default::default()
        };
        assert_eq!(params.player().name, "Ari");
        assert_eq!(params.language(Language::Zh), Language::En);
    }

    #[tokio::test]
    async fn test_attach_reuses_live_session() {
        let state = state();
        let (id, reattached) = state.attach(&ConnectParams::default()).await;
        assert!(!reattached);

        let params = ConnectParams {
            session_id: Some(id.to_string()),
            ..Default::default()
        };
        assert_eq!(state.attach(&params).await, (id, true));

        let params = ConnectParams {
            session_id: Some("not-a-uuid".to_string()),
            ..Default::default()
        };
        let (other, reattached) = state.attach(&params).await;
        assert_ne!(other, id);
        assert!(!reattached);
    }

    #[tokio::test]
    async fn test_rejected_turn_sends_no_turn_start() {
        let model = ScriptedModel::new().with_text("The gate creaks open.");
        let gm = GameMaster::new(Arc::new(model));
        let state = AppState {
            manager: Arc::new(SessionManager::new(Arc::new(gm))),
            pack: WorldPack::sample(),
            chunk_size: 40,
            default_language: Language::En,
        };
        let (id, _) = state.attach(&ConnectParams::default()).await;

        let lease = state.manager.lease(id).unwrap();
        let (tx, rx) = mpsc::channel(64);
        state.run_turn(id, input("run"), Language::En, &tx).await;
        drop(tx);
        assert_eq!(drain(rx), vec!["error", "phase"]);

        drop(lease);
        let (tx, rx) = mpsc::channel(64);
        state.run_turn(id, input("open the gate"), Language::En, &tx).await;
        drop(tx);
        let types = drain(rx);
        assert_eq!(&types[..2], ["status", "phase"]);
        assert_eq!(types.iter().filter(|t| *t == "complete").count(), 1);
        assert_eq!(types.last().map(String::as_str), Some("phase"));
    }

    #[tokio::test]
    async fn test_busy_reports_processing() {
        let state = state();
        let (id, _) = state.attach(&ConnectParams::default()).await;
        assert_eq!(
            state.resting_phase(id, &GmError::Busy(id)).await,
            GamePhase::Processing
        );
        assert_eq!(
            state.resting_phase(id, &GmError::Validation("empty".into())).await,
            GamePhase::WaitingInput
        );
    }
}
