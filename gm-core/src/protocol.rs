//! Streaming wire protocol.
//!
//! Every frame is a JSON object `{"type": ..., "data": ...}`. Client frames
//! are decoded through a loose envelope so that legacy names and aliases are
//! accepted; server frames are produced by [`StreamEncoder`] in a fixed order:
//!
//! - turn start: `status`, `phase(processing)`
//! - narrative: `status`, `phase(narrating)`, `content` chunks, `complete`, `phase(waiting_input)`
//! - dice check: `status`, `phase(dice_check)`, `dice_check`
//! - failure: `error`, `phase(<current>)`

use crate::dice::{DiceResult, DiceSubmission};
use crate::error::{ErrorKind, GmError};
use crate::gm::{TurnMetadata, TurnResponse};
use crate::lang::Language;
use crate::session::{DiceCheckRequest, GamePhase, SessionSnapshot};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: &'static str, reason: String },
}

// ============================================================================
// Client -> server
// ============================================================================

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct PlayerInputData {
    #[serde(default, alias = "action")]
    content: String,
    #[serde(default)]
    lang: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DiceResultData {
    #[serde(flatten)]
    roll: DiceSubmission,
    #[serde(default)]
    lang: Option<String>,
}

/// A decoded client frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    PlayerInput {
        content: String,
        lang: Option<Language>,
    },
    DiceResult {
        result: DiceResult,
        lang: Option<Language>,
    },
    Ping,
}

impl ClientMessage {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        match envelope.kind.as_str() {
            "player_input" | "player_action" => {
                let data: PlayerInputData =
                    serde_json::from_value(envelope.data).map_err(|e| ProtocolError::InvalidPayload {
                        kind: "player_input",
                        reason: e.to_string(),
                    })?;
                Ok(ClientMessage::PlayerInput {
                    content: data.content,
                    lang: data.lang.as_deref().map(Language::from_code),
                })
            }
            "dice_result" => {
                let data: DiceResultData =
                    serde_json::from_value(envelope.data).map_err(|e| ProtocolError::InvalidPayload {
                        kind: "dice_result",
                        reason: e.to_string(),
                    })?;
                Ok(ClientMessage::DiceResult {
                    result: data.roll.normalize(),
                    lang: data.lang.as_deref().map(Language::from_code),
                })
            }
            "ping" => Ok(ClientMessage::Ping),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

// ============================================================================
// Server -> client
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    Status {
        phase: GamePhase,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent: Option<String>,
    },
    Content {
        chunk: String,
        is_partial: bool,
        chunk_index: usize,
    },
    Complete {
        content: String,
        metadata: TurnMetadata,
        success: bool,
    },
    DiceCheck {
        check_request: DiceCheckRequest,
    },
    Phase {
        phase: GamePhase,
    },
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<ErrorKind>,
    },
    Pong,
    /// Sent on reconnect so the client can rebuild its view.
    Sync {
        snapshot: SessionSnapshot,
    },
}

impl ServerMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn error(error: impl Into<String>, kind: Option<ErrorKind>) -> Self {
        ServerMessage::Error {
            error: error.into(),
            kind,
        }
    }
}

/// Split `text` into chunks of at most `size` characters.
pub fn chunk_text(text: &str, size: usize) -> Vec<String> {
    let size = size.max(1);
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(size).map(|c| c.iter().collect()).collect()
}

/// Turns orchestrator results into ordered server frames.
#[derive(Debug, Clone, Copy)]
pub struct StreamEncoder {
    pub language: Language,
    pub chunk_size: usize,
}

impl StreamEncoder {
    pub fn new(language: Language, chunk_size: usize) -> Self {
        Self {
            language,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Frames sent as soon as a turn starts or resumes.
    pub fn begin_turn(&self, resuming: bool) -> Vec<ServerMessage> {
        let message = if resuming {
            self.language.status_resuming()
        } else {
            self.language.status_thinking()
        };
        vec![
            ServerMessage::Status {
                phase: GamePhase::Processing,
                message: message.to_string(),
                agent: Some("gm".to_string()),
            },
            ServerMessage::Phase {
                phase: GamePhase::Processing,
            },
        ]
    }

    /// Frames for a finished call. `phase` is the session's phase after the
    /// call and is only used for failures.
    pub fn finish_turn(
        &self,
        result: &Result<TurnResponse, GmError>,
        phase: GamePhase,
    ) -> Vec<ServerMessage> {
        match result {
            Ok(response) if response.requires_dice() => self.dice_check(response),
            Ok(response) => self.narrative(response),
            Err(error) => self.failure(error, phase),
        }
    }

    fn narrative(&self, response: &TurnResponse) -> Vec<ServerMessage> {
        let mut frames = vec![
            ServerMessage::Status {
                phase: GamePhase::Narrating,
                message: self.language.status_narrating().to_string(),
                agent: Some("gm".to_string()),
            },
            ServerMessage::Phase {
                phase: GamePhase::Narrating,
            },
        ];

        let chunks = chunk_text(&response.content, self.chunk_size);
        let last = chunks.len().saturating_sub(1);
        frames.extend(
            chunks
                .into_iter()
                .enumerate()
                .map(|(chunk_index, chunk)| ServerMessage::Content {
                    chunk,
                    is_partial: chunk_index < last,
                    chunk_index,
                }),
        );

        frames.push(ServerMessage::Complete {
            content: response.content.clone(),
            metadata: response.metadata.clone(),
            success: response.success,
        });
        frames.push(ServerMessage::Phase {
            phase: GamePhase::WaitingInput,
        });
        frames
    }

    fn dice_check(&self, response: &TurnResponse) -> Vec<ServerMessage> {
        let mut frames = vec![
            ServerMessage::Status {
                phase: GamePhase::DiceCheck,
                message: self.language.status_dice_check().to_string(),
                agent: Some("gm".to_string()),
            },
            ServerMessage::Phase {
                phase: GamePhase::DiceCheck,
            },
        ];
        if let Some(check_request) = &response.metadata.check_request {
            frames.push(ServerMessage::DiceCheck {
                check_request: check_request.clone(),
            });
        }
        frames
    }

    /// Error frame, a failed `complete`, then the phase the session actually
    /// rests in. A `Busy` rejection belongs to no turn and gets no `complete`.
    pub fn failure(&self, error: &GmError, phase: GamePhase) -> Vec<ServerMessage> {
        let mut frames = vec![ServerMessage::error(error.to_string(), Some(error.kind()))];
        if !matches!(error, GmError::Busy(_)) {
            let response = TurnResponse::failure(error, phase);
            frames.push(ServerMessage::Complete {
                content: response.content,
                metadata: response.metadata,
                success: response.success,
            });
        }
        frames.push(ServerMessage::Phase { phase });
        frames
    }

    /// Frames that resynchronize a reconnecting client.
    pub fn sync(&self, snapshot: SessionSnapshot) -> Vec<ServerMessage> {
        let phase = snapshot.phase;
        let pending = snapshot.pending_check.clone();
        let mut frames = vec![ServerMessage::Sync { snapshot }, ServerMessage::Phase { phase }];
        if let Some(check_request) = pending {
            frames.push(ServerMessage::DiceCheck { check_request });
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dice::Outcome;
    use serde_json::json;

    #[test]
    fn test_decode_player_input_and_legacy_action() {
        let msg = ClientMessage::decode(r#"{"type": "player_input", "data": {"content": "look", "lang": "zh-CN"}}"#)
            .unwrap();
        assert_eq!(
            msg,
            ClientMessage::PlayerInput {
                content: "look".to_string(),
                lang: Some(Language::Zh)
            }
        );

        let msg = ClientMessage::decode(r#"{"type": "player_action", "data": {"action": "run"}}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::PlayerInput {
                content: "run".to_string(),
                lang: None
            }
        );
    }

    #[test]
    fn test_decode_dice_result() {
        let msg = ClientMessage::decode(
            r#"{"type": "dice_result", "data": {"total": 9, "all_rolls": [5, 4], "kept_rolls": [5, 4], "outcome": "partial"}}"#,
        )
        .unwrap();
        let ClientMessage::DiceResult { result, lang } = msg else {
            panic!("expected dice result");
        };
        assert_eq!(result.total, 9);
        assert_eq!(result.outcome, Outcome::Partial);
        assert!(result.dropped_rolls.is_empty());
        assert_eq!(lang, None);
    }

    #[test]
    fn test_decode_ping_and_errors() {
        assert_eq!(ClientMessage::decode(r#"{"type": "ping"}"#).unwrap(), ClientMessage::Ping);
        assert!(matches!(
            ClientMessage::decode(r#"{"type": "dance"}"#),
            Err(ProtocolError::UnknownType(_))
        ));
        assert!(matches!(ClientMessage::decode("nope"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(
            ClientMessage::decode(r#"{"type": "dice_result", "data": {"all_rolls": [1]}}"#),
            Err(ProtocolError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn test_server_message_shape() {
        let value = serde_json::to_value(ServerMessage::Phase {
            phase: GamePhase::DiceCheck,
        })
        .unwrap();
        assert_eq!(value, json!({"type": "phase", "data": {"phase": "dice_check"}}));

        let value = serde_json::to_value(ServerMessage::Pong).unwrap();
        assert_eq!(value, json!({"type": "pong"}));
    }

    #[test]
    fn test_chunk_text_counts_chars() {
        assert_eq!(chunk_text("", 4), Vec::<String>::new());
        assert_eq!(chunk_text("abcdefghij", 4), vec!["abcd", "efgh", "ij"]);
        assert_eq!(chunk_text("骰子已经落定", 4), vec!["骰子已经", "落定"]);
    }

    #[test]
    fn test_busy_failure_has_no_complete() {
        let encoder = StreamEncoder::new(Language::En, 40);
        let busy = GmError::Busy(crate::session::SessionId::new());
        let frames = encoder.failure(&busy, GamePhase::Processing);
        assert_eq!(frames.len(), 2);
        assert!(matches!(
            &frames[0],
            ServerMessage::Error { kind: Some(ErrorKind::SessionBusy), .. }
        ));
        assert_eq!(frames[1], ServerMessage::Phase { phase: GamePhase::Processing });

        let invalid = GmError::Validation("player input is empty".to_string());
        let frames = encoder.failure(&invalid, GamePhase::DiceCheck);
        assert!(matches!(
            &frames[1],
            ServerMessage::Complete { success: false, metadata, .. }
                if metadata.requires_dice && metadata.phase == GamePhase::DiceCheck
        ));
    }
}
