//! Run-level driver: start, resume, status and cancel.
//!
//! Each session slot runs in its own tokio task with a child cancellation
//! token. A housekeeping task shares the run's polling cadence: it watches
//! for an external cancel request and drains the claim request inbox.

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::claims::{ClaimInbox, ClaimTable};
use super::coordinator::{Coordinator, DistributionPolicy};
use super::machine::{MachineContext, SessionMachine};
use super::observer::IdlePolicy;
use crate::config::Config;
use crate::error::FailureKind;
use crate::instructions::{initial_message, ClaimPaths};
use crate::plan::Plan;
use crate::session::{RunId, Session, SessionId, SessionState};
use crate::state::{RunRecord, SessionStore};
use crate::surface::SessionSurface;
use crate::util::blocking;
use crate::{clog, clog_debug, clog_error, clog_warn, Error, Result};

pub const MAX_AGENTS: usize = 20;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub agents: usize,
    pub policy: DistributionPolicy,
    pub project_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    PartialSuccess { completed: usize, failed: usize },
    Failed,
    Cancelled,
}

impl RunOutcome {
    pub fn from_sessions(sessions: &[Session]) -> Self {
        let count = |state| sessions.iter().filter(|s| s.state() == state).count();
        let completed = count(SessionState::Completed);
        let failed = count(SessionState::Failed);
        let cancelled = count(SessionState::Cancelled);

        if !sessions.is_empty() && completed == sessions.len() {
            RunOutcome::Succeeded
        } else if cancelled > 0 {
            RunOutcome::Cancelled
        } else if completed == 0 {
            RunOutcome::Failed
        } else {
            RunOutcome::PartialSuccess { completed, failed }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Succeeded)
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Succeeded => write!(f, "succeeded"),
            RunOutcome::PartialSuccess { completed, failed } => write!(
                f,
                "partial success ({} completed, {} failed)",
                completed, failed
            ),
            RunOutcome::Failed => write!(f, "failed"),
            RunOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Point-in-time view of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub id: SessionId,
    pub label: String,
    pub state: SessionState,
    pub current_step_index: i64,
    /// Text of the most recently dispatched step.
    pub current_step: Option<String>,
    pub assigned_steps: usize,
    pub idle_for: Duration,
    pub failure: Option<FailureKind>,
    /// Resources the session holds in the claim table.
    pub claims: Vec<String>,
}

impl SessionReport {
    pub fn from_session(session: &Session, claims: &ClaimTable) -> Self {
        Self {
            id: session.id,
            label: session.label.clone(),
            state: session.state(),
            current_step_index: session.current_step_index(),
            current_step: session.current_step().map(|s| s.content.clone()),
            assigned_steps: session.assigned_steps().len(),
            idle_for: session.idle_for(Utc::now()),
            failure: session.failure,
            claims: claims
                .held_by(session.id)
                .into_iter()
                .map(|c| c.resource_key.clone())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub outcome: RunOutcome,
    pub sessions: Vec<SessionReport>,
}

pub struct Orchestrator {
    config: Config,
    store: SessionStore,
}

impl Orchestrator {
    pub fn new(config: Config, store: SessionStore) -> Self {
        Self { config, store }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Create a run: persist its record and one `Created` session per slot.
    ///
    /// Nothing is launched until [`Run::drive`] is awaited.
    pub async fn start<F>(&self, plan: Plan, options: RunOptions, make_surface: F) -> Result<Run>
    where
        F: FnOnce(&RunRecord) -> Arc<dyn SessionSurface>,
    {
        if !(1..=MAX_AGENTS).contains(&options.agents) {
            return Err(Error::Validation(format!(
                "agent count must be between 1 and {}, got {}",
                MAX_AGENTS, options.agents
            )));
        }
        if options.policy == DistributionPolicy::Bundled(0) {
            return Err(Error::Construction(
                "bundle size must be at least 1".to_string(),
            ));
        }
        let idle_policy = Arc::new(IdlePolicy::from_config(&self.config)?);

        let record = RunRecord::new(plan, options.policy, options.agents, options.project_dir);
        self.store.save_run(&record).await?;
        clog!(
            "Run {} created: {} agent(s), policy {}, {} step(s)",
            record.id.short(),
            record.agents,
            record.policy,
            record.plan.len()
        );

        let claims = ClaimTable::open(&self.store.claims_path(record.id))?;
        let mut coordinator = Coordinator::new(Arc::new(record.plan.clone()), record.policy, claims)?;

        let mut sessions = Vec::with_capacity(record.agents);
        for slot in 0..record.agents {
            let mut session = Session::new(record.id, slot, Vec::new());
            session.extend_assignment(coordinator.initial_assignment(session.id));
            self.store.put(&session).await?;
            sessions.push(session);
        }

        let surface = make_surface(&record);
        self.assemble(record, coordinator, sessions, surface, idle_policy, false)
            .await
    }

    /// Re-enter a persisted run at each session's stored state.
    pub async fn resume<F>(&self, run_id: RunId, make_surface: F) -> Result<Run>
    where
        F: FnOnce(&RunRecord) -> Arc<dyn SessionSurface>,
    {
        let record = self.store.load_run(run_id).await?;
        let sessions = self.store.list_run(run_id).await?;
        if sessions.is_empty() {
            return Err(Error::SessionNotFound(format!("no sessions for run {}", run_id)));
        }
        self.store.clear_cancel(run_id).await?;
        let idle_policy = Arc::new(IdlePolicy::from_config(&self.config)?);

        let claims = ClaimTable::open(&self.store.claims_path(record.id))?;
        let mut coordinator = Coordinator::new(Arc::new(record.plan.clone()), record.policy, claims)?;
        coordinator.restore(&sessions);
        let reaped = coordinator.reap_stale()?;
        clog!(
            "Resuming run {}: {} session(s), {} stale claim(s) released",
            record.id.short(),
            sessions.len(),
            reaped.len()
        );

        let surface = make_surface(&record);
        self.assemble(record, coordinator, sessions, surface, idle_policy, true)
            .await
    }

    /// Current state of every session in a run, as persisted.
    pub async fn status(&self, run_id: RunId) -> Result<Vec<SessionReport>> {
        let sessions = self.store.list_run(run_id).await?;
        let path = self.store.claims_path(run_id);
        let claims = blocking(move || ClaimTable::load(&path)).await?;
        Ok(sessions
            .iter()
            .map(|s| SessionReport::from_session(s, &claims))
            .collect())
    }

    /// Ask the driver of `run_id` to cancel, wherever it runs.
    pub async fn cancel(&self, run_id: RunId) -> Result<()> {
        clog!("Cancel requested for run {}", run_id.short());
        self.store.request_cancel(run_id).await
    }

    async fn assemble(
        &self,
        record: RunRecord,
        coordinator: Coordinator,
        sessions: Vec<Session>,
        surface: Arc<dyn SessionSurface>,
        idle_policy: Arc<IdlePolicy>,
        resumed: bool,
    ) -> Result<Run> {
        let ctx = Arc::new(MachineContext {
            surface,
            store: self.store.clone(),
            coordinator: Arc::new(Mutex::new(coordinator)),
            idle_policy,
            distribution: record.policy,
            timing: self.config.timing.clone(),
        });
        let claim_paths = ClaimPaths {
            table: self.store.claims_path(record.id),
            requests: self.store.claim_requests_dir(record.id),
        };
        let inbox = ClaimInbox::open(&claim_paths.requests)?;
        let session_ids = sessions.iter().map(|s| s.id).collect();

        let mut machines = Vec::new();
        let mut finished = Vec::new();
        for session in sessions {
            if session.is_terminal() {
                finished.push(session);
                continue;
            }
            let message = initial_message(
                &record.plan,
                record.policy,
                record.agents,
                &claim_paths,
                session.id,
            );
            let mut machine = SessionMachine::new(session, Arc::clone(&ctx), message);
            if resumed {
                machine.recover().await?;
                if machine.is_terminal() {
                    finished.push(machine.into_session());
                    continue;
                }
            }
            machines.push(machine);
        }

        Ok(Run {
            record,
            ctx,
            machines,
            finished,
            session_ids,
            inbox,
            cancel: CancellationToken::new(),
            poll_interval: self.config.timing.poll_interval(),
            stagger: self.config.timing.stagger(),
            cancel_timeout: self.config.timing.cancel_timeout(),
        })
    }
}

/// A run ready to be driven.
pub struct Run {
    record: RunRecord,
    ctx: Arc<MachineContext>,
    machines: Vec<SessionMachine>,
    finished: Vec<Session>,
    session_ids: Vec<SessionId>,
    inbox: ClaimInbox,
    cancel: CancellationToken,
    poll_interval: Duration,
    stagger: Duration,
    cancel_timeout: Duration,
}

impl Run {
    pub fn id(&self) -> RunId {
        self.record.id
    }

    pub fn record(&self) -> &RunRecord {
        &self.record
    }

    /// Cancelling this token cancels the run within one polling cycle.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drive every session to a terminal state and report the outcome.
    pub async fn drive(self) -> Result<RunReport> {
        let Run {
            record,
            ctx,
            machines,
            mut finished,
            session_ids,
            inbox,
            cancel,
            poll_interval,
            stagger,
            cancel_timeout,
        } = self;
        let run_id = record.id;

        let stop_housekeeping = CancellationToken::new();
        let housekeeping = tokio::spawn(housekeep(
            Arc::clone(&ctx),
            inbox,
            run_id,
            session_ids,
            cancel.clone(),
            stop_housekeeping.clone(),
            poll_interval,
        ));

        let mut launches = 0u32;
        let slots: Vec<(SessionId, JoinHandle<Session>)> = machines
            .into_iter()
            .map(|machine| {
                let delay = if machine.session().state() == SessionState::Created {
                    let delay = stagger.saturating_mul(launches);
                    launches += 1;
                    delay
                } else {
                    Duration::ZERO
                };
                let id = machine.session().id;
                let handle = tokio::spawn(drive_slot(
                    machine,
                    cancel.child_token(),
                    delay,
                    poll_interval,
                    cancel_timeout,
                ));
                (id, handle)
            })
            .collect();

        let (ids, handles): (Vec<SessionId>, Vec<JoinHandle<Session>>) = slots.into_iter().unzip();
        for (id, joined) in ids.into_iter().zip(join_all(handles).await) {
            match joined {
                Ok(session) => finished.push(session),
                Err(e) => {
                    clog_error!("Session task {} panicked: {}", id.short(), e);
                    finished.push(ctx.store.get(id).await?);
                }
            }
        }

        stop_housekeeping.cancel();
        if let Err(e) = housekeeping.await {
            clog_warn!("Housekeeping task ended abnormally: {}", e);
        }
        ctx.coordinator.lock().await.reap_stale()?;
        if cancel.is_cancelled() {
            ctx.store.clear_cancel(run_id).await?;
        }

        finished.sort_by_key(|s| s.slot);
        let outcome = RunOutcome::from_sessions(&finished);
        clog!("Run {} finished: {}", run_id.short(), outcome);
        let coordinator = ctx.coordinator.lock().await;
        Ok(RunReport {
            run_id,
            outcome,
            sessions: finished
                .iter()
                .map(|s| SessionReport::from_session(s, coordinator.claims()))
                .collect(),
        })
    }
}

async fn drive_slot(
    mut machine: SessionMachine,
    token: CancellationToken,
    delay: Duration,
    poll_interval: Duration,
    cancel_timeout: Duration,
) -> Session {
    if !delay.is_zero() {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }

    loop {
        if token.is_cancelled() {
            if let Err(e) = machine.cancel(cancel_timeout).await {
                clog_error!("Cancelling session {} failed: {}", machine.session().id.short(), e);
            }
            break;
        }
        if machine.is_terminal() {
            break;
        }

        // Never dropped mid-way: a tick may be holding a surface that is
        // created but not yet recorded on the session.
        if let Err(e) = machine.tick().await {
            if let Err(e) = machine.abort(e).await {
                clog_error!("Session {} could not be failed: {}", machine.session().id.short(), e);
                break;
            }
        }
        if machine.is_terminal() {
            break;
        }

        tokio::select! {
            _ = token.cancelled() => {}
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
    machine.into_session()
}

async fn housekeep(
    ctx: Arc<MachineContext>,
    inbox: ClaimInbox,
    run_id: RunId,
    session_ids: Vec<SessionId>,
    cancel: CancellationToken,
    stop: CancellationToken,
    poll_interval: Duration,
) {
    let mut interval = tokio::time::interval(poll_interval);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = interval.tick() => {
                if !cancel.is_cancelled() && ctx.store.cancel_requested(run_id) {
                    clog!("Run {}: cancel marker found", run_id.short());
                    cancel.cancel();
                }

                let drained = {
                    let inbox = inbox.clone();
                    blocking(move || inbox.drain()).await
                };
                let requests = match drained {
                    Ok(requests) => requests,
                    Err(e) => {
                        clog_warn!("Failed to drain claim inbox: {}", e);
                        continue;
                    }
                };

                let mut coordinator = ctx.coordinator.lock().await;
                for request in &requests {
                    let Some(session) = resolve_session(&request.session, &session_ids) else {
                        clog_warn!("Claim request from unknown session '{}'", request.session);
                        continue;
                    };
                    clog_debug!(
                        "Claim request {:?} '{}' from {}",
                        request.action,
                        request.resource,
                        session.short()
                    );
                    if let Err(e) = coordinator.handle_request(session, request) {
                        clog_warn!("Claim request from {} failed: {}", session.short(), e);
                    }
                }
                if let Err(e) = coordinator.reap_stale() {
                    clog_warn!("Failed to reap stale claims: {}", e);
                }
            }
        }
    }
}

/// Match a full session id or its short prefix against the run's sessions.
fn resolve_session(reference: &str, sessions: &[SessionId]) -> Option<SessionId> {
    let reference = reference.trim();
    if reference.is_empty() {
        return None;
    }
    if let Ok(id) = reference.parse::<SessionId>() {
        return sessions.contains(&id).then_some(id);
    }
    let mut matches = sessions
        .iter()
        .filter(|id| id.to_string().starts_with(reference));
    match (matches.next(), matches.next()) {
        (Some(id), None) => Some(*id),
        _ => None,
    }
}
