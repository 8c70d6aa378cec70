//! Session records: one supervised agent and its persisted progress.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::error::FailureKind;
use crate::plan::Step;
use crate::surface::SurfaceHandle;
use crate::{clog, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Lifecycle states of a supervised session.
///
/// ```text
/// Created -> Launching -> AwaitingInput -> Active <-> Idle -> Advancing -> AwaitingInput
/// ```
///
/// `Completed`, `Failed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Created,
    Launching,
    AwaitingInput,
    Active,
    Idle,
    Advancing,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Cancelled
        )
    }

    pub fn can_transition(&self, target: SessionState) -> bool {
        use SessionState::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (*self, target),
            (Created, Launching)
                | (Launching, AwaitingInput)
                | (AwaitingInput, Active)
                | (Active, Idle)
                | (Idle, Active)
                | (Idle, Advancing)
                | (Advancing, AwaitingInput)
                | (AwaitingInput | Active | Idle | Advancing, Completed)
                | (_, Failed)
                | (_, Cancelled)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Created => "created",
            SessionState::Launching => "launching",
            SessionState::AwaitingInput => "awaiting_input",
            SessionState::Active => "active",
            SessionState::Idle => "idle",
            SessionState::Advancing => "advancing",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// One entry in a session's append-only history.
///
/// Retries and other notable non-transitions are recorded with
/// `from == to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub timestamp: DateTime<Utc>,
    pub from: SessionState,
    pub to: SessionState,
    pub note: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub run_id: RunId,
    /// Creation order within the run, starting at 0.
    pub slot: usize,
    pub label: String,
    state: SessionState,
    /// Index into `assigned_steps` of the last dispatched step; -1 before any.
    current_step_index: i64,
    assigned_steps: Vec<Step>,
    history: Vec<SessionEvent>,
    pub last_activity: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub launched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub surface: Option<SurfaceHandle>,
    /// Whether the initial instruction has been delivered.
    #[serde(default)]
    pub instruction_delivered: bool,
    #[serde(default)]
    pub failure: Option<FailureKind>,
}

impl Session {
    pub fn new(run_id: RunId, slot: usize, assigned_steps: Vec<Step>) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            run_id,
            slot,
            label: format!("agent-{}", slot),
            state: SessionState::Created,
            current_step_index: -1,
            assigned_steps,
            history: Vec::new(),
            last_activity: now,
            created_at: now,
            launched_at: None,
            surface: None,
            instruction_delivered: false,
            failure: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn current_step_index(&self) -> i64 {
        self.current_step_index
    }

    pub fn assigned_steps(&self) -> &[Step] {
        &self.assigned_steps
    }

    pub fn history(&self) -> &[SessionEvent] {
        &self.history
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Move to `target`, appending a history event.
    pub fn transition(&mut self, target: SessionState, note: impl Into<String>) -> Result<()> {
        if !self.state.can_transition(target) {
            return Err(Error::InvalidTransition {
                from: self.state.to_string(),
                to: target.to_string(),
            });
        }
        let note = note.into();
        clog!(
            "Session {} ({}): {} -> {} {}",
            self.id.short(),
            self.label,
            self.state,
            target,
            note
        );
        self.history.push(SessionEvent {
            timestamp: Utc::now(),
            from: self.state,
            to: target,
            note,
        });
        self.state = target;
        Ok(())
    }

    /// Append a history event without changing state.
    pub fn record(&mut self, note: impl Into<String>) {
        self.history.push(SessionEvent {
            timestamp: Utc::now(),
            from: self.state,
            to: self.state,
            note: note.into(),
        });
    }

    /// Move to `Failed`, remembering the error kind.
    pub fn fail(&mut self, error: &Error) -> Result<()> {
        self.failure = Some(error.kind());
        self.transition(SessionState::Failed, format!("{}", error))
    }

    /// The step that would be dispatched next, if any.
    pub fn next_step(&self) -> Option<&Step> {
        self.assigned_steps.get((self.current_step_index + 1) as usize)
    }

    pub fn has_remaining_steps(&self) -> bool {
        self.next_step().is_some()
    }

    /// Assigned steps not yet dispatched.
    pub fn pending_steps(&self) -> &[Step] {
        let start = ((self.current_step_index + 1) as usize).min(self.assigned_steps.len());
        &self.assigned_steps[start..]
    }

    /// The most recently dispatched step.
    pub fn current_step(&self) -> Option<&Step> {
        usize::try_from(self.current_step_index)
            .ok()
            .and_then(|i| self.assigned_steps.get(i))
    }

    /// Record that `count` further steps were dispatched in one message.
    pub fn mark_dispatched(&mut self, count: usize) {
        self.current_step_index += count as i64;
    }

    /// Append newly assigned steps; earlier assignments are never touched.
    pub fn extend_assignment(&mut self, steps: Vec<Step>) {
        self.assigned_steps.extend(steps);
    }

    pub fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.last_activity {
            self.last_activity = at;
        }
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_activity).to_std().unwrap_or_default()
    }
}
