//! Advisory resource claims shared by concurrent sessions.
//!
//! A claim marks one session's intent to modify a resource (usually a file
//! path). The table is cooperative: nothing stops two agents writing the same
//! file, but the table never grants a key that a live session already holds.
//!
//! Agents talk to the table through a request inbox: each request is a small
//! JSON file dropped into `claims/requests/`, drained by the driver once per
//! polling cycle. The current table is mirrored to `claims/claims.json` so
//! agents can read who holds what.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::session::SessionId;
use crate::state::write_json_atomic;
use crate::{clog, clog_debug, clog_warn, Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub resource_key: String,
    pub owner_session_id: SessionId,
    pub acquired_at: DateTime<Utc>,
}

/// At most one claim per resource key.
#[derive(Debug, Default)]
pub struct ClaimTable {
    claims: BTreeMap<String, Claim>,
    path: Option<PathBuf>,
}

impl ClaimTable {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open a table mirrored to `path`, loading existing claims if present.
    pub fn open(path: &Path) -> Result<Self> {
        let mut table = Self::load(path)?;
        clog_debug!("ClaimTable::open path={} claims={}", path.display(), table.len());
        table.path = Some(path.to_path_buf());
        table.persist()?;
        Ok(table)
    }

    /// Read-only snapshot of the table at `path`; changes are not mirrored.
    pub fn load(path: &Path) -> Result<Self> {
        let claims = if path.exists() {
            let list: Vec<Claim> = serde_json::from_str(&fs::read_to_string(path)?)?;
            list.into_iter()
                .map(|c| (c.resource_key.clone(), c))
                .collect()
        } else {
            BTreeMap::new()
        };
        Ok(Self { claims, path: None })
    }

    /// Grant `key` to `owner`.
    ///
    /// Re-acquiring a key the caller already holds succeeds unchanged. A key
    /// held by a session for which `is_terminal` returns true is reclaimed.
    pub fn acquire<F>(&mut self, key: &str, owner: SessionId, is_terminal: F) -> Result<Claim>
    where
        F: Fn(&SessionId) -> bool,
    {
        if let Some(existing) = self.claims.get(key) {
            if existing.owner_session_id == owner {
                return Ok(existing.clone());
            }
            if !is_terminal(&existing.owner_session_id) {
                clog_debug!(
                    "Claim on '{}' refused for {}: held by {}",
                    key,
                    owner.short(),
                    existing.owner_session_id.short()
                );
                return Err(Error::AlreadyClaimed {
                    resource: key.to_string(),
                    owner: existing.owner_session_id,
                });
            }
            clog_warn!(
                "Reclaiming '{}' from finished session {}",
                key,
                existing.owner_session_id.short()
            );
        }

        let claim = Claim {
            resource_key: key.to_string(),
            owner_session_id: owner,
            acquired_at: Utc::now(),
        };
        self.claims.insert(key.to_string(), claim.clone());
        self.persist()?;
        clog!("Claim granted: '{}' -> {}", key, owner.short());
        Ok(claim)
    }

    pub fn release(&mut self, key: &str, caller: SessionId) -> Result<()> {
        match self.claims.get(key) {
            Some(claim) if claim.owner_session_id == caller => {
                self.claims.remove(key);
                self.persist()?;
                clog!("Claim released: '{}' by {}", key, caller.short());
                Ok(())
            }
            _ => Err(Error::NotOwner {
                resource: key.to_string(),
                caller,
            }),
        }
    }

    /// Drop every claim held by `owner`, returning the released keys.
    pub fn release_all(&mut self, owner: SessionId) -> Result<Vec<String>> {
        let keys: Vec<String> = self
            .claims
            .values()
            .filter(|c| c.owner_session_id == owner)
            .map(|c| c.resource_key.clone())
            .collect();
        if keys.is_empty() {
            return Ok(keys);
        }
        for key in &keys {
            self.claims.remove(key);
        }
        self.persist()?;
        clog!("Released {} claim(s) held by {}", keys.len(), owner.short());
        Ok(keys)
    }

    /// Release claims whose owners have reached a terminal state.
    pub fn reap_stale<F>(&mut self, is_terminal: F) -> Result<Vec<Claim>>
    where
        F: Fn(&SessionId) -> bool,
    {
        let stale: Vec<Claim> = self
            .claims
            .values()
            .filter(|c| is_terminal(&c.owner_session_id))
            .cloned()
            .collect();
        if stale.is_empty() {
            return Ok(stale);
        }
        for claim in &stale {
            clog_warn!(
                "Auto-releasing stale claim '{}' held by {}",
                claim.resource_key,
                claim.owner_session_id.short()
            );
            self.claims.remove(&claim.resource_key);
        }
        self.persist()?;
        Ok(stale)
    }

    pub fn get(&self, key: &str) -> Option<&Claim> {
        self.claims.get(key)
    }

    pub fn held_by(&self, owner: SessionId) -> Vec<&Claim> {
        self.claims
            .values()
            .filter(|c| c.owner_session_id == owner)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    fn persist(&self) -> Result<()> {
        if let Some(path) = &self.path {
            let list: Vec<&Claim> = self.claims.values().collect();
            write_json_atomic(path, &list)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimAction {
    Acquire,
    Release,
}

/// A claim request written by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRequest {
    /// Full session id or its 8-character short form.
    pub session: String,
    pub action: ClaimAction,
    pub resource: String,
}

/// Directory of pending claim requests.
#[derive(Debug, Clone)]
pub struct ClaimInbox {
    dir: PathBuf,
}

impl ClaimInbox {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Remove and return pending requests in file-name order.
    ///
    /// Unparseable files are deleted and logged.
    pub fn drain(&self) -> Result<Vec<ClaimRequest>> {
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect();
        paths.sort();

        let mut requests = Vec::with_capacity(paths.len());
        for path in paths {
            let parsed = fs::read_to_string(&path)
                .map_err(Error::from)
                .and_then(|s| serde_json::from_str::<ClaimRequest>(&s).map_err(Error::from));
            match parsed {
                Ok(request) => requests.push(request),
                Err(e) => clog_warn!("Discarding malformed claim request {}: {}", path.display(), e),
            }
            if let Err(e) = fs::remove_file(&path) {
                clog_warn!("Failed to remove claim request {}: {}", path.display(), e);
            }
        }
        Ok(requests)
    }
}
