//! Per-session state machine.
//!
//! A [`SessionMachine`] owns one [`Session`] record and drives it through
//! its lifecycle, one poll-act cycle per [`SessionMachine::tick`]. Every
//! transition is persisted to the store before the next one is attempted, so
//! the store always reflects the last transition taken.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::coordinator::{Coordinator, DistributionPolicy};
use super::observer::{Debounce, IdlePolicy, Observation, OutputObserver, Verdict};
use crate::config::Timing;
use crate::instructions::{dispatch_message, notice_message};
use crate::plan::Step;
use crate::session::{Session, SessionState};
use crate::state::SessionStore;
use crate::surface::{SessionSurface, SurfaceHandle};
use crate::util::{blocking, blocking_with_timeout, retry_with_backoff};
use crate::{clog, clog_debug, clog_error, clog_warn, Error, Result};

const EXIT_POLL: Duration = Duration::from_millis(100);

/// Collaborators shared by every machine in a run.
pub struct MachineContext {
    pub surface: Arc<dyn SessionSurface>,
    pub store: SessionStore,
    pub coordinator: Arc<Mutex<Coordinator>>,
    pub idle_policy: Arc<IdlePolicy>,
    pub distribution: DistributionPolicy,
    pub timing: Timing,
}

pub struct SessionMachine {
    session: Session,
    ctx: Arc<MachineContext>,
    observer: OutputObserver,
    debounce: Debounce,
    initial_message: String,
}

impl SessionMachine {
    pub fn new(session: Session, ctx: Arc<MachineContext>, initial_message: String) -> Self {
        let observer = OutputObserver::new(Arc::clone(&ctx.idle_policy));
        let debounce = Debounce::new(ctx.idle_policy.debounce());
        Self {
            session,
            ctx,
            observer,
            debounce,
            initial_message,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn into_session(self) -> Session {
        self.session
    }

    pub fn is_terminal(&self) -> bool {
        self.session.is_terminal()
    }

    /// Check a reloaded session against its surface before driving it.
    ///
    /// A session that was past `Created` but whose surface is gone goes
    /// straight to `Failed`; relaunching would desynchronize its step index.
    pub async fn recover(&mut self) -> Result<()> {
        if self.session.is_terminal() || self.session.state() == SessionState::Created {
            return Ok(());
        }
        let alive = match self.session.surface.clone() {
            Some(handle) => {
                let surface = Arc::clone(&self.ctx.surface);
                blocking(move || Ok(surface.exists(&handle))).await?
            }
            None => false,
        };
        if alive {
            self.session.record("resumed");
            self.persist().await
        } else {
            self.fail(Error::Unavailable(
                "surface no longer exists on resume".to_string(),
            ))
            .await
        }
    }

    /// Run one poll-act cycle.
    pub async fn tick(&mut self) -> Result<()> {
        let now = Utc::now();
        match self.session.state() {
            SessionState::Created => self.launch().await,
            SessionState::Launching => self.finish_launch(now).await,
            SessionState::AwaitingInput => self.deliver(now).await,
            SessionState::Active => self.watch_active(now).await,
            SessionState::Idle => self.watch_idle(now).await,
            SessionState::Advancing => self.advance().await,
            SessionState::Completed | SessionState::Failed | SessionState::Cancelled => Ok(()),
        }
    }

    /// Fail the session after an internal error escaped `tick`.
    pub async fn abort(&mut self, error: Error) -> Result<()> {
        if self.session.is_terminal() {
            return Ok(());
        }
        clog_error!("Session {} aborted: {}", self.session.id.short(), error);
        self.fail(error).await
    }

    /// Terminate the surface and move to `Cancelled`.
    ///
    /// The agent is first asked to exit and given `timeout` to disappear;
    /// after that the surface is destroyed and the forced case is logged.
    pub async fn cancel(&mut self, timeout: Duration) -> Result<()> {
        if self.session.is_terminal() {
            return Ok(());
        }
        if let Some(handle) = self.session.surface.clone() {
            self.terminate(handle, timeout).await;
        }
        self.transition(SessionState::Cancelled, "run cancelled").await?;
        self.finished().await
    }

    async fn terminate(&mut self, handle: SurfaceHandle, timeout: Duration) {
        let exit_command = self.ctx.surface.exit_command().map(str::to_string);
        let graceful = match &exit_command {
            Some(cmd) => self.request_exit(&handle, cmd, timeout).await,
            None => false,
        };
        if graceful {
            self.session.record("surface exited on request");
            return;
        }

        let surface = Arc::clone(&self.ctx.surface);
        let target = handle.clone();
        let destroyed = blocking_with_timeout(timeout, move || surface.destroy(&target)).await;
        match (destroyed, exit_command.is_some()) {
            (Ok(()), false) => self.session.record("surface destroyed"),
            (Ok(()), true) => {
                clog_warn!(
                    "Session {}: exit not confirmed within {:?}, forced termination of {}",
                    self.session.id.short(),
                    timeout,
                    handle
                );
                self.session
                    .record(format!("forced termination after {:?}", timeout));
            }
            (Err(e), _) => {
                clog_error!(
                    "Session {}: forced termination of {} failed: {}",
                    self.session.id.short(),
                    handle,
                    e
                );
                self.session
                    .record(format!("forced termination failed: {}", e));
            }
        }
    }

    async fn request_exit(&mut self, handle: &SurfaceHandle, cmd: &str, timeout: Duration) -> bool {
        let surface = Arc::clone(&self.ctx.surface);
        let target = handle.clone();
        let text = cmd.to_string();
        if let Err(e) = blocking_with_timeout(timeout, move || surface.send(&target, &text)).await {
            clog_debug!("Exit request to {} failed: {}", handle, e);
            return false;
        }

        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            let surface = Arc::clone(&self.ctx.surface);
            let target = handle.clone();
            match blocking(move || Ok(surface.exists(&target))).await {
                Ok(false) => return true,
                Ok(true) => {}
                Err(e) => {
                    clog_debug!("Exit check for {} failed: {}", handle, e);
                    return false;
                }
            }
            tokio::time::sleep(EXIT_POLL).await;
        }
        false
    }

    async fn launch(&mut self) -> Result<()> {
        self.transition(SessionState::Launching, "creating surface")
            .await?;

        let surface = Arc::clone(&self.ctx.surface);
        let label = self.session.label.clone();
        let mut retries = Vec::new();
        let created = retry_with_backoff(
            &format!("launch {}", label),
            self.ctx.timing.launch_retries,
            self.ctx.timing.launch_backoff(),
            || {
                let surface = Arc::clone(&surface);
                let label = label.clone();
                blocking(move || surface.create(&label))
            },
            |attempt, e| retries.push(format!("launch retry {}: {}", attempt, e)),
        )
        .await;
        for note in retries {
            self.session.record(note);
        }

        match created {
            Ok(handle) => {
                let now = Utc::now();
                self.session.surface = Some(handle.clone());
                self.session.launched_at = Some(now);
                self.session.touch(now);
                self.transition(SessionState::AwaitingInput, format!("surface {} created", handle))
                    .await
            }
            Err(e @ Error::Launch(_)) => self.fail(e).await,
            Err(e) => self.fail(Error::Launch(e.to_string())).await,
        }
    }

    /// A resumed session caught mid-launch with its surface still alive.
    async fn finish_launch(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.session.launched_at.is_none() {
            self.session.launched_at = Some(now);
        }
        self.transition(SessionState::AwaitingInput, "surface found on resume")
            .await
    }

    async fn deliver(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.session.instruction_delivered {
            return self
                .transition(SessionState::Active, "dispatch confirmed")
                .await;
        }

        if let Some(launched) = self.session.launched_at {
            let grace = chrono::Duration::from_std(self.ctx.timing.launch_grace())
                .unwrap_or_else(|_| chrono::Duration::zero());
            if now < launched + grace {
                return Ok(());
            }
        }

        if !self.initial_message.is_empty() {
            let text = self.initial_message.clone();
            if let Err(e) = self.send_with_retries(text, "initial instruction").await {
                return self.fail(e).await;
            }
        }
        self.session.instruction_delivered = true;
        if self.ctx.distribution == DistributionPolicy::Collaborative {
            let count = self.session.pending_steps().len();
            self.session.mark_dispatched(count);
        }
        self.transition(SessionState::Active, "initial instruction delivered")
            .await
    }

    async fn watch_active(&mut self, now: DateTime<Utc>) -> Result<()> {
        let observation = self.sample(now).await;
        match observation.verdict {
            Verdict::Unavailable => {
                self.fail(Error::Unavailable("capture failed".to_string()))
                    .await
            }
            Verdict::Busy => self.note_activity(&observation).await,
            Verdict::Idle => {
                self.debounce.observe(Verdict::Idle, now);
                self.transition(SessionState::Idle, "output quiet").await
            }
        }
    }

    async fn watch_idle(&mut self, now: DateTime<Utc>) -> Result<()> {
        let observation = self.sample(now).await;
        match observation.verdict {
            Verdict::Unavailable => {
                self.fail(Error::Unavailable("capture failed".to_string()))
                    .await
            }
            Verdict::Busy => {
                self.debounce.reset();
                if let Some(at) = observation.activity {
                    self.session.touch(at);
                }
                self.transition(SessionState::Active, "output resumed").await
            }
            Verdict::Idle => {
                if !self.debounce.observe(Verdict::Idle, now) {
                    return Ok(());
                }
                self.debounce.reset();
                self.on_settled().await
            }
        }
    }

    /// Idleness held for the debounce window: advance or complete.
    async fn on_settled(&mut self) -> Result<()> {
        if !self.session.has_remaining_steps() {
            let more = self
                .ctx
                .coordinator
                .lock()
                .await
                .next_assignment(self.session.id);
            if !more.is_empty() {
                let ids: Vec<String> = more.iter().map(|s| s.number.to_string()).collect();
                self.session
                    .record(format!("assigned step(s) {}", ids.join(", ")));
                self.session.extend_assignment(more);
            }
        }

        if self.session.has_remaining_steps() {
            self.transition(SessionState::Advancing, "idle; dispatching next step")
                .await?;
            return self.advance().await;
        }

        let notices = self
            .ctx
            .coordinator
            .lock()
            .await
            .take_notices(self.session.id);
        if !notices.is_empty() {
            return self.deliver_notices(notices).await;
        }
        self.transition(SessionState::Completed, "all assigned steps done")
            .await?;
        self.finished().await
    }

    /// Refusals queued after the last step went out; the agent must hear
    /// about them before the session can complete.
    async fn deliver_notices(&mut self, notices: Vec<String>) -> Result<()> {
        let text = notice_message(&notices, self.session.id);
        if let Err(e) = self.send_with_retries(text, "coordinator notices").await {
            return self.fail(e).await;
        }
        self.session
            .record(format!("delivered {} notice(s)", notices.len()));
        self.transition(SessionState::Active, "coordinator notices delivered")
            .await
    }

    async fn advance(&mut self) -> Result<()> {
        let steps: Vec<Step> = match self.ctx.distribution {
            DistributionPolicy::Bundled(_) => self.session.pending_steps().to_vec(),
            _ => self.session.next_step().cloned().into_iter().collect(),
        };
        if steps.is_empty() {
            self.transition(SessionState::Completed, "nothing left to dispatch")
                .await?;
            return self.finished().await;
        }

        let notices = self
            .ctx
            .coordinator
            .lock()
            .await
            .take_notices(self.session.id);
        let text = dispatch_message(&steps, &notices, self.session.id);
        let what = describe(&steps);
        if let Err(e) = self.send_with_retries(text, &what).await {
            return self.fail(e).await;
        }

        self.session.mark_dispatched(steps.len());
        self.transition(SessionState::AwaitingInput, format!("dispatched {}", what))
            .await?;
        self.transition(SessionState::Active, "dispatch confirmed")
            .await
    }

    async fn send_with_retries(&mut self, text: String, what: &str) -> Result<()> {
        let Some(handle) = self.session.surface.clone() else {
            return Err(Error::Unavailable("session has no surface".to_string()));
        };
        let surface = Arc::clone(&self.ctx.surface);
        let text = Arc::new(text);
        let mut retries = Vec::new();
        let sent = retry_with_backoff(
            &format!("send {} to {}", what, self.session.label),
            self.ctx.timing.dispatch_retries,
            self.ctx.timing.dispatch_backoff(),
            || {
                let surface = Arc::clone(&surface);
                let handle = handle.clone();
                let text = Arc::clone(&text);
                blocking(move || surface.send(&handle, &text))
            },
            |attempt, e| retries.push(format!("send retry {} ({}): {}", attempt, what, e)),
        )
        .await;
        for note in retries {
            self.session.record(note);
        }
        sent.map_err(|e| match e {
            Error::Send(_) => e,
            other => Error::Send(other.to_string()),
        })?;

        // Quiet time only counts from the moment the agent was given work.
        let now = Utc::now();
        self.observer.mark_activity(now);
        self.debounce.reset();
        self.session.touch(now);
        Ok(())
    }

    async fn sample(&mut self, now: DateTime<Utc>) -> Observation {
        let capture = match self.session.surface.clone() {
            Some(handle) => {
                let surface = Arc::clone(&self.ctx.surface);
                blocking(move || surface.capture(&handle)).await
            }
            None => Err(Error::Unavailable("session has no surface".to_string())),
        };
        self.observer.observe(capture, now)
    }

    async fn note_activity(&mut self, observation: &Observation) -> Result<()> {
        if let Some(at) = observation.activity {
            self.session.touch(at);
            self.persist().await?;
        }
        Ok(())
    }

    async fn fail(&mut self, error: Error) -> Result<()> {
        clog_warn!(
            "Session {} ({}) failed: {}",
            self.session.id.short(),
            self.session.label,
            error
        );
        self.session.fail(&error)?;
        self.persist().await?;
        self.finished().await
    }

    /// Bookkeeping once the session is terminal.
    async fn finished(&mut self) -> Result<()> {
        let released = self
            .ctx
            .coordinator
            .lock()
            .await
            .session_finished(self.session.id)?;
        if !released.is_empty() {
            self.session
                .record(format!("released claims: {}", released.join(", ")));
            self.persist().await?;
        }
        if self.session.state() == SessionState::Completed {
            let line = format!(
                "{} {} {} {}",
                Utc::now().to_rfc3339(),
                self.session.id,
                self.session.label,
                describe(self.session.assigned_steps())
            );
            self.ctx
                .store
                .append_completed(self.session.run_id, line)
                .await?;
        }
        clog!(
            "Session {} ({}) finished: {}",
            self.session.id.short(),
            self.session.label,
            self.session.state()
        );
        Ok(())
    }

    async fn transition(&mut self, target: SessionState, note: impl Into<String>) -> Result<()> {
        self.session.transition(target, note)?;
        self.persist().await
    }

    async fn persist(&self) -> Result<()> {
        self.ctx.store.put(&self.session).await
    }
}

fn describe(steps: &[Step]) -> String {
    match steps {
        [] => "no steps".to_string(),
        [single] => format!("step {}", single.number),
        many => {
            let numbers: Vec<String> = many.iter().map(|s| s.number.to_string()).collect();
            format!("steps {}", numbers.join(","))
        }
    }
}
