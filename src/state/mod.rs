//! Durable run and session state under the conductor state directory.
//!
//! ```text
//! <state_dir>/
//!   sessions/<session_id>.json
//!   runs/<run_id>/run.json
//!   runs/<run_id>/claims/claims.json
//!   runs/<run_id>/claims/requests/*.json
//!   runs/<run_id>/completed.log
//!   runs/<run_id>/cancel
//! ```

mod store;

pub use store::{RunRecord, SessionStore};

use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

use crate::Result;

/// Serialize `value` as pretty JSON and replace `path` atomically.
///
/// Readers see either the previous file or the new one, never a partial write.
/// Each call stages into its own temp file beside `path`, so concurrent writers
/// to one path never share a staging file; the last rename wins.
pub(crate) fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    if !parent.exists() {
        fs::create_dir_all(parent)?;
    }
    let mut staged = NamedTempFile::new_in(parent)?;
    serde_json::to_writer_pretty(&mut staged, value)?;
    staged.flush()?;
    staged.persist(path).map_err(|e| e.error)?;
    Ok(())
}
