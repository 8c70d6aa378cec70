use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::write_json_atomic;
use crate::orchestration::DistributionPolicy;
use crate::plan::Plan;
use crate::session::{RunId, Session, SessionId};
use crate::util::blocking;
use crate::{clog_debug, clog_warn, Error, Result};

/// Everything needed to resume a run besides its sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub plan: Plan,
    pub policy: DistributionPolicy,
    pub agents: usize,
    pub project_dir: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn new(plan: Plan, policy: DistributionPolicy, agents: usize, project_dir: PathBuf) -> Self {
        Self {
            id: RunId::new(),
            plan,
            policy,
            agents,
            project_dir,
            created_at: Utc::now(),
        }
    }
}

/// File-backed store: one JSON document per session, one directory per run.
///
/// Every write replaces its file atomically, so a crash leaves the last
/// complete record on disk.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root.join("sessions"))?;
        fs::create_dir_all(root.join("runs"))?;
        clog_debug!("SessionStore::open root={}", root.display());
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: RunId) -> PathBuf {
        self.root.join("runs").join(run_id.to_string())
    }

    pub fn claims_path(&self, run_id: RunId) -> PathBuf {
        self.run_dir(run_id).join("claims").join("claims.json")
    }

    pub fn claim_requests_dir(&self, run_id: RunId) -> PathBuf {
        self.run_dir(run_id).join("claims").join("requests")
    }

    pub fn completed_log_path(&self, run_id: RunId) -> PathBuf {
        self.run_dir(run_id).join("completed.log")
    }

    fn cancel_marker(&self, run_id: RunId) -> PathBuf {
        self.run_dir(run_id).join("cancel")
    }

    fn session_path(&self, id: SessionId) -> PathBuf {
        self.root.join("sessions").join(format!("{}.json", id))
    }

    /// Persist a session, replacing any previous record with the same id.
    pub async fn put(&self, session: &Session) -> Result<()> {
        let path = self.session_path(session.id);
        let snapshot = session.clone();
        blocking(move || write_json_atomic(&path, &snapshot)).await
    }

    pub async fn get(&self, id: SessionId) -> Result<Session> {
        let path = self.session_path(id);
        blocking(move || {
            if !path.exists() {
                return Err(Error::SessionNotFound(id.to_string()));
            }
            Ok(serde_json::from_str(&fs::read_to_string(&path)?)?)
        })
        .await
    }

    /// All sessions, ordered by run creation time then slot.
    pub async fn list(&self) -> Result<Vec<Session>> {
        let dir = self.root.join("sessions");
        blocking(move || {
            let mut sessions = Vec::new();
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match fs::read_to_string(&path)
                    .map_err(Error::from)
                    .and_then(|s| serde_json::from_str::<Session>(&s).map_err(Error::from))
                {
                    Ok(session) => sessions.push(session),
                    Err(e) => clog_warn!("Skipping unreadable session {}: {}", path.display(), e),
                }
            }
            sessions.sort_by(|a, b| (a.created_at, a.slot).cmp(&(b.created_at, b.slot)));
            Ok(sessions)
        })
        .await
    }

    pub async fn list_run(&self, run_id: RunId) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = self
            .list()
            .await?
            .into_iter()
            .filter(|s| s.run_id == run_id)
            .collect();
        sessions.sort_by_key(|s| s.slot);
        Ok(sessions)
    }

    pub async fn save_run(&self, record: &RunRecord) -> Result<()> {
        let run_dir = self.run_dir(record.id);
        let snapshot = record.clone();
        blocking(move || write_json_atomic(&run_dir.join("run.json"), &snapshot)).await
    }

    pub async fn load_run(&self, run_id: RunId) -> Result<RunRecord> {
        let path = self.run_dir(run_id).join("run.json");
        blocking(move || {
            if !path.exists() {
                return Err(Error::RunNotFound(run_id.to_string()));
            }
            Ok(serde_json::from_str(&fs::read_to_string(&path)?)?)
        })
        .await
    }

    /// Resolve a full run id or a unique prefix of one.
    pub async fn find_run(&self, query: &str) -> Result<RunRecord> {
        if let Ok(id) = query.parse::<RunId>() {
            return self.load_run(id).await;
        }
        let mut matches: Vec<RunRecord> = self
            .list_runs()
            .await?
            .into_iter()
            .filter(|r| r.id.to_string().starts_with(query))
            .collect();
        match matches.len() {
            1 => Ok(matches.remove(0)),
            0 => Err(Error::RunNotFound(query.to_string())),
            n => Err(Error::Validation(format!(
                "run id prefix '{}' is ambiguous ({} matches)",
                query, n
            ))),
        }
    }

    /// Known runs, newest first.
    pub async fn list_runs(&self) -> Result<Vec<RunRecord>> {
        let dir = self.root.join("runs");
        blocking(move || {
            let mut runs = Vec::new();
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path().join("run.json");
                if !path.exists() {
                    continue;
                }
                match fs::read_to_string(&path)
                    .map_err(Error::from)
                    .and_then(|s| serde_json::from_str::<RunRecord>(&s).map_err(Error::from))
                {
                    Ok(record) => runs.push(record),
                    Err(e) => clog_warn!("Skipping unreadable run {}: {}", path.display(), e),
                }
            }
            runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(runs)
        })
        .await
    }

    /// Ask a driver, possibly in another process, to cancel `run_id`.
    pub async fn request_cancel(&self, run_id: RunId) -> Result<()> {
        let marker = self.cancel_marker(run_id);
        let run_dir = self.run_dir(run_id);
        blocking(move || {
            if !run_dir.join("run.json").exists() {
                return Err(Error::RunNotFound(run_id.to_string()));
            }
            fs::write(&marker, Utc::now().to_rfc3339())?;
            Ok(())
        })
        .await
    }

    pub fn cancel_requested(&self, run_id: RunId) -> bool {
        self.cancel_marker(run_id).exists()
    }

    pub async fn clear_cancel(&self, run_id: RunId) -> Result<()> {
        let marker = self.cancel_marker(run_id);
        blocking(move || {
            if marker.exists() {
                fs::remove_file(&marker)?;
            }
            Ok(())
        })
        .await
    }

    /// Append a line to the run's completion log.
    pub async fn append_completed(&self, run_id: RunId, line: String) -> Result<()> {
        let path = self.completed_log_path(run_id);
        blocking(move || {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            writeln!(file, "{}", line)?;
            Ok(())
        })
        .await
    }
}
