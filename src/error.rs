use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Tmux error: {0}")]
    Tmux(String),

    #[error("Launch error: {0}")]
    Launch(String),

    #[error("Send error: {0}")]
    Send(String),

    #[error("Session surface unavailable: {0}")]
    Unavailable(String),

    #[error("Resource '{resource}' is already claimed by session {owner}")]
    AlreadyClaimed {
        resource: String,
        owner: crate::session::SessionId,
    },

    #[error("Session {caller} does not own the claim on '{resource}'")]
    NotOwner {
        resource: String,
        caller: crate::session::SessionId,
    },

    #[error("Invalid plan: {0}")]
    Construction(String),

    #[error("Invalid session transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl Error {
    /// Classify this error for the failure record kept on a session.
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::Launch(_) => FailureKind::Launch,
            Error::Send(_) => FailureKind::Send,
            Error::Unavailable(_) => FailureKind::Unavailable,
            _ => FailureKind::Internal,
        }
    }
}

/// Error kind recorded on a session that ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Launch,
    Send,
    Unavailable,
    Internal,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Launch => write!(f, "launch_error"),
            FailureKind::Send => write!(f, "send_error"),
            FailureKind::Unavailable => write!(f, "unavailable"),
            FailureKind::Internal => write!(f, "internal"),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
