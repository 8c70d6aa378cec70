//! File logging shared by every conductor process.
//!
//! `run`, `resume`, `status` and `cancel` may all be live at once, so the log
//! is opened in append mode and rotated once it grows past [`ROTATE_BYTES`].
//! Lines written after [`set_run`] carry the run's short id.
//!
//! Levels:
//! - ERROR: session failures, forced terminations that failed
//! - WARN: retries, refused claims, stale claims reaped
//! - INFO: run lifecycle and session transitions
//! - DEBUG: claim requests, exit checks
//! - TRACE: observer samples
//!
//! `--debug` or `CONDUCTOR_DEBUG=1` selects DEBUG; `CONDUCTOR_LOG=<level>`
//! selects any level.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{OnceLock, RwLock};

pub const ROTATE_BYTES: u64 = 5 * 1024 * 1024;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static RUN_TAG: RwLock<Option<String>> = RwLock::new(None);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

/// Log to `~/.conductor/conductor.log`.
pub fn init_with_debug(debug: bool) {
    if let Some(dir) = dirs::home_dir().map(|h| h.join(".conductor")) {
        init_in(&dir, debug);
    }
}

/// Log to `dir/conductor.log`. Only the first call per process picks the path.
pub fn init_in(dir: &Path, debug: bool) {
    set_level(level_from_env(debug));

    let _ = fs::create_dir_all(dir);
    let path = dir.join("conductor.log");
    if let Err(e) = rotate_if_large(&path, ROTATE_BYTES) {
        eprintln!("conductor: could not rotate {}: {}", path.display(), e);
    }
    LOG_PATH.set(path).ok();
}

fn level_from_env(debug: bool) -> LogLevel {
    if let Some(level) = std::env::var("CONDUCTOR_LOG")
        .ok()
        .and_then(|v| v.parse().ok())
    {
        return level;
    }
    let env_debug = std::env::var("CONDUCTOR_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if debug || env_debug {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

/// Move `path` to `path.1` once it reaches `limit` bytes.
pub fn rotate_if_large(path: &Path, limit: u64) -> std::io::Result<bool> {
    match fs::metadata(path) {
        Ok(meta) if meta.len() >= limit => {
            fs::rename(path, path.with_extension("log.1"))?;
            Ok(true)
        }
        Ok(_) => Ok(false),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);
}

pub fn get_level() -> LogLevel {
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

pub fn is_debug() -> bool {
    get_level() >= LogLevel::Debug
}

/// Tag every following line with `run`.
pub fn set_run(run: &str) {
    if let Ok(mut tag) = RUN_TAG.write() {
        *tag = Some(run.to_string());
    }
}

pub fn path() -> Option<&'static Path> {
    LOG_PATH.get().map(PathBuf::as_path)
}

fn format_line(level: LogLevel, run: Option<&str>, msg: &str) -> String {
    let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
    let pid = std::process::id();
    match run {
        Some(run) => format!("[{}] [{}] [{}] [run {}] {}", timestamp, level.as_str(), pid, run, msg),
        None => format!("[{}] [{}] [{}] {}", timestamp, level.as_str(), pid, msg),
    }
}

pub fn log_at(level: LogLevel, msg: &str) {
    if level > get_level() {
        return;
    }
    let Some(path) = LOG_PATH.get() else {
        return;
    };
    let tag = RUN_TAG.read().ok().and_then(|t| t.clone());
    let line = format_line(level, tag.as_deref(), msg);
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
        let _ = writeln!(file, "{}", line);
    }
}

pub fn log(msg: &str) {
    log_at(LogLevel::Info, msg);
}

pub fn error(msg: &str) {
    log_at(LogLevel::Error, msg);
}

pub fn warn(msg: &str) {
    log_at(LogLevel::Warn, msg);
}

pub fn debug(msg: &str) {
    log_at(LogLevel::Debug, msg);
}

pub fn trace(msg: &str) {
    log_at(LogLevel::Trace, msg);
}

/// INFO.
#[macro_export]
macro_rules! clog {
    ($($arg:tt)*) => {
        $crate::log::log(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! clog_error {
    ($($arg:tt)*) => {
        $crate::log::error(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! clog_warn {
    ($($arg:tt)*) => {
        $crate::log::warn(&format!($($arg)*))
    };
}

/// DEBUG; dropped unless debug logging is on.
#[macro_export]
macro_rules! clog_debug {
    ($($arg:tt)*) => {
        $crate::log::debug(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! clog_trace {
    ($($arg:tt)*) => {
        $crate::log::trace(&format!($($arg)*))
    };
}
