use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{clog_debug, Error, Result};

const DEFAULT_COMMAND: &str = "claude --dangerously-skip-permissions";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub command: Option<String>,
    pub state_dir: Option<String>,
    #[serde(default)]
    pub timing: Timing,
    #[serde(default)]
    pub observer: ObserverConfig,
}

/// Polling, debounce and retry knobs. All values are milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    pub poll_interval_ms: u64,
    /// Output must be unchanged this long before the observer calls it idle.
    pub quiet_interval_ms: u64,
    /// Idle must hold across this window before a session is advanced.
    pub debounce_ms: u64,
    pub launch_grace_ms: u64,
    pub stagger_ms: u64,
    pub cancel_timeout_ms: u64,
    pub launch_retries: u32,
    pub launch_backoff_ms: u64,
    pub dispatch_retries: u32,
    pub dispatch_backoff_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            quiet_interval_ms: 5_000,
            debounce_ms: 10_000,
            launch_grace_ms: 10_000,
            stagger_ms: 5_000,
            cancel_timeout_ms: 10_000,
            launch_retries: 3,
            launch_backoff_ms: 1_000,
            dispatch_retries: 3,
            dispatch_backoff_ms: 500,
        }
    }
}

impl Timing {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn quiet_interval(&self) -> Duration {
        Duration::from_millis(self.quiet_interval_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn launch_grace(&self) -> Duration {
        Duration::from_millis(self.launch_grace_ms)
    }

    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }

    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_timeout_ms)
    }

    pub fn launch_backoff(&self) -> Duration {
        Duration::from_millis(self.launch_backoff_ms)
    }

    pub fn dispatch_backoff(&self) -> Duration {
        Duration::from_millis(self.dispatch_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObserverConfig {
    /// Regex patterns that mark the captured tail as still working.
    pub busy_patterns: Vec<String>,
    /// Number of trailing pane lines captured per sample.
    pub capture_lines: u16,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            busy_patterns: vec![
                r"(?i)esc to interrupt".to_string(),
                r"(?i)\b(thinking|working|running|compacting)\b.*(…|\.\.\.)\s*$".to_string(),
                r"[✻✽✶✳✢·]\s+\w+…".to_string(),
            ],
            capture_lines: 50,
        }
    }
}

impl Config {
    pub fn home_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".conductor"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::home_dir()?.join("conductor.toml"))
    }

    /// Root directory for run records, session records and claim tables.
    pub fn state_dir(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Self::home_dir(),
        }
    }

    pub fn effective_command(&self) -> &str {
        self.command.as_deref().unwrap_or(DEFAULT_COMMAND)
    }

    /// The agent command line split into program and arguments.
    pub fn agent_argv(&self) -> Vec<String> {
        self.effective_command()
            .split_whitespace()
            .map(String::from)
            .collect()
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        clog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            clog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        clog_debug!(
            "Config loaded: command={:?} state_dir={:?} poll={}ms debounce={}ms",
            config.command,
            config.state_dir,
            config.timing.poll_interval_ms,
            config.timing.debounce_ms
        );
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        clog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.timing.poll_interval_ms == 0 {
            return Err(Error::Validation(
                "timing.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.effective_command().trim().is_empty() {
            return Err(Error::Validation("command cannot be empty".to_string()));
        }
        if self.observer.capture_lines == 0 {
            return Err(Error::Validation(
                "observer.capture_lines must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
