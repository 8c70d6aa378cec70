use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use uuid::Uuid;

use crate::config::Config;
use crate::surface::{SessionSurface, SurfaceHandle};
use crate::{clog_debug, clog_trace, clog_warn, Error, Result};

const SESSION_PREFIX: &str = "conductor_";
/// Pause between pasting text and pressing Enter; the agent drops the
/// keypress if it arrives while the paste is still being rendered.
const PASTE_SETTLE: Duration = Duration::from_millis(200);

pub struct Tmux;

impl Tmux {
    pub fn create_session(name: &str, cwd: &Path, cmd: &[String]) -> Result<()> {
        if cmd.is_empty() {
            return Err(Error::Validation("Command cannot be empty".to_string()));
        }

        let cmd_str = cmd
            .iter()
            .map(|s| shell_escape(s))
            .collect::<Vec<_>>()
            .join(" ");
        clog_debug!(
            "Tmux::create_session name={} cwd={} cmd={}",
            name,
            cwd.display(),
            cmd_str
        );
        let output = Command::new("tmux")
            .args([
                "new-session",
                "-d",
                "-s",
                name,
                "-c",
                &cwd.display().to_string(),
                &cmd_str,
            ])
            .output()?;

        if !output.status.success() {
            let err = format!(
                "Failed to create session '{}': {}",
                name,
                String::from_utf8_lossy(&output.stderr)
            );
            clog_warn!("tmux create_session failed: {}", err);
            return Err(Error::Tmux(err));
        }

        clog_debug!("Tmux session created: {}", name);
        Ok(())
    }

    pub fn kill_session(name: &str) -> Result<()> {
        clog_debug!("Tmux::kill_session name={}", name);
        let output = Command::new("tmux")
            .args(["kill-session", "-t", name])
            .output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("session not found") && !stderr.contains("can't find session") {
                clog_warn!("Failed to kill tmux session '{}': {}", name, stderr);
                return Err(Error::Tmux(format!(
                    "Failed to kill session '{}': {}",
                    name, stderr
                )));
            }
            clog_debug!("Tmux session '{}' not found (already dead?)", name);
        } else {
            clog_debug!("Tmux session killed: {}", name);
        }
        Ok(())
    }

    /// Capture only the last N lines of a tmux pane.
    pub fn capture_pane_tail(name: &str, lines: u16) -> Result<String> {
        let start = format!("-{}", lines);
        let output = Command::new("tmux")
            .args(["capture-pane", "-t", name, "-p", "-S", &start])
            .output()?;
        if !output.status.success() {
            return Err(Error::Tmux(format!(
                "Failed to capture pane tail '{}': {}",
                name,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        let content = String::from_utf8_lossy(&output.stdout).to_string();
        clog_trace!("capture_pane_tail {}: {} bytes", name, content.len());
        Ok(content)
    }

    pub fn session_exists(name: &str) -> bool {
        Command::new("tmux")
            .args(["has-session", "-t", name])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    pub fn send_keys(name: &str, keys: &[&str]) -> Result<()> {
        clog_trace!("Tmux::send_keys name={} keys={:?}", name, keys);
        let output = Command::new("tmux")
            .args(["send-keys", "-t", name])
            .args(keys)
            .output()?;
        if !output.status.success() {
            return Err(Error::Tmux(format!(
                "Failed to send keys to '{}': {}",
                name,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    /// Paste `text` into the pane through a named buffer and press Enter.
    ///
    /// Going through a buffer keeps multi-line text together as one message;
    /// `send-keys` would submit each line separately.
    pub fn paste_and_submit(name: &str, text: &str) -> Result<()> {
        let buffer = format!("conductor_{}", &Uuid::new_v4().simple().to_string()[..8]);
        clog_debug!(
            "Tmux::paste_and_submit name={} buffer={} chars={}",
            name,
            buffer,
            text.chars().count()
        );

        let mut child = Command::new("tmux")
            .args(["load-buffer", "-b", &buffer, "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(text.as_bytes())?;
        }
        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(Error::Tmux(format!(
                "Failed to load buffer for '{}': {}",
                name,
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let output = Command::new("tmux")
            .args(["paste-buffer", "-d", "-b", &buffer, "-t", name])
            .output()?;
        if !output.status.success() {
            return Err(Error::Tmux(format!(
                "Failed to paste buffer into '{}': {}",
                name,
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        std::thread::sleep(PASTE_SETTLE);
        Self::send_keys(name, &["C-m"])
    }

    pub fn is_available() -> bool {
        Command::new("tmux")
            .arg("-V")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    pub fn session_name(run_short: &str, label: &str) -> String {
        format!(
            "{}{}_{}",
            SESSION_PREFIX,
            sanitize_session_name(run_short),
            sanitize_session_name(label)
        )
    }
}

/// One detached tmux session per agent, all rooted in the project directory.
pub struct TmuxSurface {
    run_short: String,
    project_dir: PathBuf,
    command: Vec<String>,
    exit_command: Option<&'static str>,
    capture_lines: u16,
}

impl TmuxSurface {
    pub fn new(run_short: &str, project_dir: &Path, config: &Config) -> Self {
        let command = config.agent_argv();
        Self {
            run_short: run_short.to_string(),
            project_dir: project_dir.to_path_buf(),
            exit_command: exit_command_for(&command),
            command,
            capture_lines: config.observer.capture_lines,
        }
    }
}

/// Find the configured agent program on PATH.
pub fn locate_agent(config: &Config) -> Result<PathBuf> {
    let argv = config.agent_argv();
    let program = argv.first().map(String::as_str).unwrap_or_default();
    which::which(program).map_err(|e| {
        Error::Validation(format!("agent binary '{}' not found on PATH: {}", program, e))
    })
}

/// Claude quits on `/exit`. Anything else is stopped by killing its session.
fn exit_command_for(command: &[String]) -> Option<&'static str> {
    command
        .first()
        .filter(|program| program.contains("claude"))
        .map(|_| "/exit")
}

impl SessionSurface for TmuxSurface {
    fn create(&self, label: &str) -> Result<SurfaceHandle> {
        let name = Tmux::session_name(&self.run_short, label);
        if Tmux::session_exists(&name) {
            return Err(Error::Launch(format!("tmux session '{}' already exists", name)));
        }
        Tmux::create_session(&name, &self.project_dir, &self.command)
            .map_err(|e| Error::Launch(e.to_string()))?;
        Ok(SurfaceHandle(name))
    }

    fn send(&self, handle: &SurfaceHandle, text: &str) -> Result<()> {
        if !Tmux::session_exists(handle.as_str()) {
            return Err(Error::Send(format!("tmux session '{}' not found", handle)));
        }
        Tmux::paste_and_submit(handle.as_str(), text).map_err(|e| Error::Send(e.to_string()))
    }

    fn capture(&self, handle: &SurfaceHandle) -> Result<String> {
        if !Tmux::session_exists(handle.as_str()) {
            return Err(Error::Unavailable(format!(
                "tmux session '{}' not found",
                handle
            )));
        }
        Tmux::capture_pane_tail(handle.as_str(), self.capture_lines)
            .map_err(|e| Error::Unavailable(e.to_string()))
    }

    fn destroy(&self, handle: &SurfaceHandle) -> Result<()> {
        Tmux::kill_session(handle.as_str())
    }

    fn exists(&self, handle: &SurfaceHandle) -> bool {
        Tmux::session_exists(handle.as_str())
    }

    fn exit_command(&self) -> Option<&str> {
        self.exit_command
    }
}

fn shell_escape(s: &str) -> String {
    if s.chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.' || c == '/')
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

fn sanitize_session_name(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
