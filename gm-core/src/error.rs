//! Caller-facing error taxonomy for the turn engine.

use crate::persist::PersistError;
use crate::session::SessionId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by the Game Master and the session manager.
///
/// Tool failures never appear here: they are turned into text for the model.
#[derive(Debug, Error)]
pub enum GmError {
    /// Empty or malformed player input. Nothing was changed.
    #[error("Invalid input: {0}")]
    Validation(String),

    /// The call does not fit the session's current phase. Nothing was changed.
    #[error("Invalid state: {0}")]
    State(String),

    /// The model provider failed. The session is untouched and the call may be retried.
    #[error("Model invocation failed: {0}")]
    ModelInvocation(String),

    /// No usable model provider is configured.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Another turn is already running for this session.
    #[error("Session {0} is busy with another turn")]
    Busy(SessionId),

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Persistence error: {0}")]
    Persist(#[from] PersistError),
}

/// Wire-level classification of a [`GmError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    StateError,
    ModelInvocationError,
    ConfigurationError,
    SessionBusy,
    SessionNotFound,
    PersistenceError,
    ProtocolError,
}

impl GmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GmError::Validation(_) => ErrorKind::ValidationError,
            GmError::State(_) => ErrorKind::StateError,
            GmError::ModelInvocation(_) => ErrorKind::ModelInvocationError,
            GmError::Configuration(_) => ErrorKind::ConfigurationError,
            GmError::Busy(_) => ErrorKind::SessionBusy,
            GmError::SessionNotFound(_) => ErrorKind::SessionNotFound,
            GmError::Persist(_) => ErrorKind::PersistenceError,
        }
    }

    /// Whether the caller can simply send the same request again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GmError::ModelInvocation(_) | GmError::Busy(_))
    }

    pub fn no_pending_check() -> Self {
        GmError::State("no pending state: there is no dice check to resume".to_string())
    }
}

impl From<claude::Error> for GmError {
    fn from(err: claude::Error) -> Self {
        if err.is_configuration() {
            GmError::Configuration(err.to_string())
        } else {
            GmError::ModelInvocation(err.to_string())
        }
    }
}
