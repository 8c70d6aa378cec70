//! Work distribution across sessions.
//!
//! The coordinator owns the plan-to-session assignment and the claim table.
//! It is shared by every session task of a run behind one async mutex, so an
//! assignment or claim decision is always made against a consistent view.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use super::claims::{Claim, ClaimAction, ClaimRequest, ClaimTable};
use crate::plan::{Plan, Step};
use crate::session::{Session, SessionId};
use crate::{clog, clog_debug, Error, Result};

/// How plan steps are spread over sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionPolicy {
    /// One step per dispatch, each step to exactly one session.
    Sequential,
    /// Contiguous groups of this many steps, each group sent as one message.
    Bundled(usize),
    /// Every session sees the whole plan and coordinates through claims.
    Collaborative,
}

impl std::fmt::Display for DistributionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DistributionPolicy::Sequential => write!(f, "sequential"),
            DistributionPolicy::Bundled(k) => write!(f, "bundled({})", k),
            DistributionPolicy::Collaborative => write!(f, "collaborative"),
        }
    }
}

pub struct Coordinator {
    plan: Arc<Plan>,
    policy: DistributionPolicy,
    /// Step indices per unit of work, in plan order.
    units: Vec<Vec<usize>>,
    next_unit: usize,
    /// `(session, unit index)` in the order units were handed out.
    assignments: Vec<(SessionId, usize)>,
    claims: ClaimTable,
    finished: HashSet<SessionId>,
    notices: HashMap<SessionId, Vec<String>>,
}

impl Coordinator {
    pub fn new(plan: Arc<Plan>, policy: DistributionPolicy, claims: ClaimTable) -> Result<Self> {
        let indices: Vec<usize> = (0..plan.steps.len()).collect();
        let units = match policy {
            DistributionPolicy::Sequential => indices.into_iter().map(|i| vec![i]).collect(),
            DistributionPolicy::Bundled(0) => {
                return Err(Error::Construction(
                    "bundle size must be at least 1".to_string(),
                ))
            }
            DistributionPolicy::Bundled(k) => indices.chunks(k).map(|c| c.to_vec()).collect(),
            DistributionPolicy::Collaborative => Vec::new(),
        };
        clog_debug!(
            "Coordinator::new policy={} steps={} units={}",
            policy,
            plan.steps.len(),
            units.len()
        );
        Ok(Self {
            plan,
            policy,
            units,
            next_unit: 0,
            assignments: Vec::new(),
            claims,
            finished: HashSet::new(),
            notices: HashMap::new(),
        })
    }

    /// Steps a session starts with when it is created.
    pub fn initial_assignment(&mut self, session: SessionId) -> Vec<Step> {
        match self.policy {
            DistributionPolicy::Collaborative => self.plan.steps.clone(),
            _ => self.next_assignment(session),
        }
    }

    /// Hand the lowest-numbered unassigned unit to `session`.
    ///
    /// Returns an empty list when every unit has been handed out, and always
    /// under the collaborative policy.
    pub fn next_assignment(&mut self, session: SessionId) -> Vec<Step> {
        let Some(unit) = self.units.get(self.next_unit) else {
            return Vec::new();
        };
        let steps: Vec<Step> = unit.iter().map(|&i| self.plan.steps[i].clone()).collect();
        clog!(
            "Assigned unit {} ({} step(s)) to session {}",
            self.next_unit,
            steps.len(),
            session.short()
        );
        self.assignments.push((session, self.next_unit));
        self.next_unit += 1;
        steps
    }

    pub fn assignments(&self) -> &[(SessionId, usize)] {
        &self.assignments
    }

    pub fn remaining_units(&self) -> usize {
        self.units.len() - self.next_unit
    }

    /// Rebuild assignment and liveness state from persisted sessions.
    pub fn restore(&mut self, sessions: &[Session]) {
        self.assignments.clear();
        self.next_unit = 0;

        let mut owners: HashMap<usize, SessionId> = HashMap::new();
        for session in sessions {
            for step in session.assigned_steps() {
                owners.insert(step.id, session.id);
            }
            if session.is_terminal() {
                self.finished.insert(session.id);
            }
        }

        let mut assigned = BTreeSet::new();
        for (idx, unit) in self.units.iter().enumerate() {
            if let Some(owner) = unit.first().and_then(|first| owners.get(first)) {
                self.assignments.push((*owner, idx));
                assigned.insert(idx);
            }
        }
        self.next_unit = assigned.iter().next_back().map(|i| i + 1).unwrap_or(0);
        clog!(
            "Coordinator restored: {} unit(s) assigned, {} remaining, {} finished session(s)",
            self.assignments.len(),
            self.remaining_units(),
            self.finished.len()
        );
    }

    /// Note that `session` has reached a terminal state and drop its claims.
    pub fn session_finished(&mut self, session: SessionId) -> Result<Vec<String>> {
        self.finished.insert(session);
        self.notices.remove(&session);
        self.claims.release_all(session)
    }

    pub fn is_finished(&self, session: &SessionId) -> bool {
        self.finished.contains(session)
    }

    pub fn acquire(&mut self, key: &str, session: SessionId) -> Result<Claim> {
        let finished = &self.finished;
        self.claims.acquire(key, session, |id| finished.contains(id))
    }

    pub fn release(&mut self, key: &str, session: SessionId) -> Result<()> {
        self.claims.release(key, session)
    }

    /// Release claims whose owners have finished.
    pub fn reap_stale(&mut self) -> Result<Vec<Claim>> {
        let finished = &self.finished;
        self.claims.reap_stale(|id| finished.contains(id))
    }

    pub fn claims(&self) -> &ClaimTable {
        &self.claims
    }

    /// Apply one inbox request from `session`.
    ///
    /// Refusals are queued as notices for the session's next dispatch.
    pub fn handle_request(&mut self, session: SessionId, request: &ClaimRequest) -> Result<()> {
        let outcome = match request.action {
            ClaimAction::Acquire => self.acquire(&request.resource, session).map(|_| ()),
            ClaimAction::Release => self.release(&request.resource, session),
        };
        match outcome {
            Err(e @ (Error::AlreadyClaimed { .. } | Error::NotOwner { .. })) => {
                self.push_notice(session, format!("Claim request refused: {}", e));
                Ok(())
            }
            other => other,
        }
    }

    pub fn push_notice(&mut self, session: SessionId, notice: String) {
        self.notices.entry(session).or_default().push(notice);
    }

    pub fn take_notices(&mut self, session: SessionId) -> Vec<String> {
        self.notices.remove(&session).unwrap_or_default()
    }
}
