//! Idle detection for agent output.
//!
//! The observer samples a session's captured pane text and decides whether
//! the agent is waiting for input. Ties go to busy:
//!
//! - **Empty output** is always busy (the agent has not drawn anything yet).
//! - **Changed output** is busy and refreshes the activity timestamp.
//! - **Unchanged output** is idle only once the quiet interval has passed
//!   *and* none of the configured busy markers appear in the tail.
//! - **Capture failure** is `Unavailable`, never idle.
//!
//! Idle verdicts are then fed through [`Debounce`], which only fires once
//! idleness has held across a full window spanning at least two samples.
//!
//! ## Example
//!
//! ```
//! use chrono::{Duration as ChronoDuration, Utc};
//! use conductor::orchestration::{IdlePolicy, OutputObserver, Verdict};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let policy = IdlePolicy::new(&["esc to interrupt"], Duration::from_secs(5), Duration::from_secs(10)).unwrap();
//! let mut observer = OutputObserver::new(Arc::new(policy));
//! let t0 = Utc::now();
//!
//! assert_eq!(observer.observe(Ok("> ".to_string()), t0).verdict, Verdict::Busy);
//! let later = t0 + ChronoDuration::seconds(6);
//! assert_eq!(observer.observe(Ok("> ".to_string()), later).verdict, Verdict::Idle);
//! ```

use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::{clog_trace, Error, Result};

/// Busy markers are only matched against this many trailing non-empty lines.
const TAIL_LINES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Idle,
    Busy,
    Unavailable,
}

/// Result of one observer sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub verdict: Verdict,
    /// Set when the output changed; the new last-activity timestamp.
    pub activity: Option<DateTime<Utc>>,
}

impl Observation {
    fn busy() -> Self {
        Self {
            verdict: Verdict::Busy,
            activity: None,
        }
    }
}

/// Tunable idle-detection policy: busy markers, quiet interval, debounce window.
#[derive(Debug, Clone)]
pub struct IdlePolicy {
    busy_patterns: Vec<Regex>,
    quiet_interval: Duration,
    debounce: Duration,
}

impl IdlePolicy {
    pub fn new<S: AsRef<str>>(
        busy_patterns: &[S],
        quiet_interval: Duration,
        debounce: Duration,
    ) -> Result<Self> {
        let busy_patterns = busy_patterns
            .iter()
            .map(|p| {
                Regex::new(p.as_ref()).map_err(|e| {
                    Error::Validation(format!("invalid busy pattern '{}': {}", p.as_ref(), e))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            busy_patterns,
            quiet_interval,
            debounce,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            &config.observer.busy_patterns,
            config.timing.quiet_interval(),
            config.timing.debounce(),
        )
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// Whether the tail of `text` shows an operation still in progress.
    pub fn shows_work_in_progress(&self, text: &str) -> bool {
        let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        let start = lines.len().saturating_sub(TAIL_LINES);
        lines[start..]
            .iter()
            .any(|line| self.busy_patterns.iter().any(|re| re.is_match(line)))
    }
}

/// Per-session sampler that remembers the previous snapshot.
#[derive(Debug)]
pub struct OutputObserver {
    policy: Arc<IdlePolicy>,
    last_snapshot: Option<String>,
    last_change: Option<DateTime<Utc>>,
}

impl OutputObserver {
    pub fn new(policy: Arc<IdlePolicy>) -> Self {
        Self {
            policy,
            last_snapshot: None,
            last_change: None,
        }
    }

    /// Restart the quiet clock at `at`.
    ///
    /// Called after text is sent to the agent: the screen may not change
    /// until the agent starts echoing, and that gap is not idleness.
    pub fn mark_activity(&mut self, at: DateTime<Utc>) {
        self.last_change = Some(at);
    }

    /// Judge one capture taken at `now`.
    pub fn observe(&mut self, capture: Result<String>, now: DateTime<Utc>) -> Observation {
        let raw = match capture {
            Ok(raw) => raw,
            Err(e) => {
                clog_trace!("observer: capture failed: {}", e);
                return Observation {
                    verdict: Verdict::Unavailable,
                    activity: None,
                };
            }
        };

        let snapshot = normalize(&raw);
        if snapshot.is_empty() {
            return Observation::busy();
        }

        if self.last_snapshot.as_deref() != Some(snapshot.as_str()) {
            self.last_snapshot = Some(snapshot);
            self.last_change = Some(now);
            return Observation {
                verdict: Verdict::Busy,
                activity: Some(now),
            };
        }

        let quiet_for = self
            .last_change
            .map(|t| (now - t).to_std().unwrap_or_default())
            .unwrap_or_default();
        if quiet_for < self.policy.quiet_interval {
            return Observation::busy();
        }

        if self.policy.shows_work_in_progress(&snapshot) {
            return Observation::busy();
        }

        Observation {
            verdict: Verdict::Idle,
            activity: None,
        }
    }
}

/// Tracks consecutive idle samples until they span the debounce window.
#[derive(Debug, Clone)]
pub struct Debounce {
    window: Duration,
    first_idle: Option<DateTime<Utc>>,
}

impl Debounce {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            first_idle: None,
        }
    }

    /// Feed a verdict; returns `true` once idleness has held for the window.
    ///
    /// The first idle sample only starts the window, so a single sample can
    /// never satisfy it. Any non-idle verdict restarts the count.
    pub fn observe(&mut self, verdict: Verdict, now: DateTime<Utc>) -> bool {
        if verdict != Verdict::Idle {
            self.first_idle = None;
            return false;
        }
        match self.first_idle {
            None => {
                self.first_idle = Some(now);
                false
            }
            Some(start) => (now - start).to_std().unwrap_or_default() >= self.window,
        }
    }

    pub fn reset(&mut self) {
        self.first_idle = None;
    }
}

fn normalize(raw: &str) -> String {
    raw.lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
