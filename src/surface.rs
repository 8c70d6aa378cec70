//! The session surface capability: somewhere an agent runs that accepts text
//! and shows text back.
//!
//! The orchestration core only ever talks to an agent through this trait.
//! [`crate::tmux::TmuxSurface`] is the production implementation.

use serde::{Deserialize, Serialize};

use crate::Result;

/// Opaque name of a live surface (a tmux session name for `TmuxSurface`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SurfaceHandle(pub String);

impl SurfaceHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SurfaceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Create, drive, observe and tear down agent surfaces.
///
/// Methods are blocking; callers run them on the blocking pool.
/// Implementations report failures as `Error::Launch` from `create`,
/// `Error::Send` from `send` and `Error::Unavailable` from `capture`.
pub trait SessionSurface: Send + Sync {
    fn create(&self, label: &str) -> Result<SurfaceHandle>;

    fn send(&self, handle: &SurfaceHandle, text: &str) -> Result<()>;

    fn capture(&self, handle: &SurfaceHandle) -> Result<String>;

    fn destroy(&self, handle: &SurfaceHandle) -> Result<()>;

    fn exists(&self, handle: &SurfaceHandle) -> bool;

    /// Text that asks the agent to exit on its own; `None` skips the request.
    fn exit_command(&self) -> Option<&str> {
        None
    }
}
