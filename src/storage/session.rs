//! Per-episode session directories.
//!
//! Layout under the recorded-data root:
//!
//! ```text
//! recorded_data/
//!   <session_id>/
//!     status.txt        "success" | "fail", written once on ACTIVE -> RESETTING
//!     task/             recording + logs of the task routine
//!     restore/          recording + logs of the reset/recovery routine
//! ```
//!
//! Session ids are `max(existing numeric directory names) + 1`, so numbering
//! is append-only and tolerates gaps.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;
use walkdir::WalkDir;

use crate::error::StorageError;

/// Name of the outcome marker inside a session directory.
pub const STATUS_FILE: &str = "status.txt";

/// Errors that can occur while managing session directories.
#[derive(Debug, Error)]
pub enum SessionError {
    /// IO operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Storage operation failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// The computed session directory already exists.
    #[error("Session directory {0:?} already exists")]
    Collision(PathBuf),

    /// A status file held something other than the two outcome literals.
    #[error("Invalid status '{0}'")]
    InvalidStatus(String),
}

/// Final outcome of one episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EpisodeOutcome {
    Success,
    Fail,
}

impl EpisodeOutcome {
    /// Maps the Task Controller's `failed` flag to an outcome.
    pub fn from_failed(failed: bool) -> Self {
        if failed {
            Self::Fail
        } else {
            Self::Success
        }
    }

    /// The literal written to `status.txt`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Fail => "fail",
        }
    }
}

impl fmt::Display for EpisodeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EpisodeOutcome {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "success" => Ok(Self::Success),
            "fail" => Ok(Self::Fail),
            other => Err(SessionError::InvalidStatus(other.to_string())),
        }
    }
}

/// Returns the next free session id under `root`.
///
/// A missing root yields `1`. Non-numeric entries are ignored.
pub fn next_session_id(root: &Path) -> Result<u64, SessionError> {
    if !root.exists() {
        return Ok(1);
    }

    let mut max_id = 0;
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(id) = entry.file_name().to_str().and_then(parse_session_id) {
            max_id = max_id.max(id);
        }
    }
    Ok(max_id + 1)
}

fn parse_session_id(name: &str) -> Option<u64> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

/// On-disk record of one episode.
#[derive(Debug, Clone)]
pub struct EpisodeDirectory {
    /// Monotonic session number.
    pub session_id: u64,
    /// `<root>/<session_id>`.
    pub session_dir: PathBuf,
    /// Output directory while the task routine runs.
    pub task_dir: PathBuf,
    /// Output directory while the reset/recovery routine runs.
    pub restore_dir: PathBuf,
    /// `<session_dir>/status.txt`.
    pub status_file: PathBuf,
}

impl EpisodeDirectory {
    /// Allocates and creates the next session directory under `root`.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Collision` if the computed directory appeared
    /// concurrently, or an IO error if the layout cannot be created.
    pub fn create(root: &Path) -> Result<Self, SessionError> {
        fs::create_dir_all(root)?;
        let session_id = next_session_id(root)?;
        let session_dir = root.join(session_id.to_string());

        match fs::create_dir(&session_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(SessionError::Collision(session_dir));
            }
            Err(e) => return Err(e.into()),
        }

        let dir = Self::at(root, session_id);
        fs::create_dir_all(&dir.task_dir)?;
        fs::create_dir_all(&dir.restore_dir)?;
        Ok(dir)
    }

    /// Describes the session directory for `session_id` without touching disk.
    pub fn at(root: &Path, session_id: u64) -> Self {
        let session_dir = root.join(session_id.to_string());
        Self {
            session_id,
            task_dir: session_dir.join("task"),
            restore_dir: session_dir.join("restore"),
            status_file: session_dir.join(STATUS_FILE),
            session_dir,
        }
    }

    /// Writes `status.txt`. Fails if the file already exists.
    pub fn write_status(&self, outcome: EpisodeOutcome) -> Result<(), SessionError> {
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.status_file)
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(StorageError::StatusAlreadyWritten(
                    self.status_file.display().to_string(),
                )
                .into());
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(outcome.as_str().as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    /// Reads `status.txt`, if the episode ever reached `RESETTING`.
    pub fn read_status(&self) -> Result<Option<EpisodeOutcome>, SessionError> {
        read_status(&self.session_dir)
    }
}

fn read_status(session_dir: &Path) -> Result<Option<EpisodeOutcome>, SessionError> {
    let path = session_dir.join(STATUS_FILE);
    if !path.exists() {
        return Ok(None);
    }
    fs::read_to_string(path)?.parse().map(Some)
}

/// Outcome of one session found on disk.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub session_id: u64,
    /// `None` when the episode never reached `RESETTING`.
    pub outcome: Option<EpisodeOutcome>,
}

/// Aggregate of every session under a recorded-data root.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub successes: usize,
    pub failures: usize,
    pub incomplete: usize,
    pub sessions: Vec<SessionRecord>,
}

impl RunSummary {
    /// Total number of sessions found.
    pub fn total(&self) -> usize {
        self.sessions.len()
    }

    /// Success rate among sessions with an outcome, as a percentage.
    pub fn success_rate(&self) -> f64 {
        let decided = self.successes + self.failures;
        if decided == 0 {
            return 0.0;
        }
        (self.successes as f64 / decided as f64) * 100.0
    }
}

/// Scans `root` and tallies session outcomes.
///
/// Sessions with an unreadable or invalid status file count as incomplete.
pub fn summarize(root: &Path) -> Result<RunSummary, SessionError> {
    let mut summary = RunSummary::default();
    if !root.exists() {
        return Ok(summary);
    }

    for entry in WalkDir::new(root).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| {
            SessionError::Io(
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("directory walk failed")),
            )
        })?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let Some(session_id) = entry.file_name().to_str().and_then(parse_session_id) else {
            continue;
        };

        let outcome = read_status(entry.path()).ok().flatten();
        match outcome {
            Some(EpisodeOutcome::Success) => summary.successes += 1,
            Some(EpisodeOutcome::Fail) => summary.failures += 1,
            None => summary.incomplete += 1,
        }
        summary.sessions.push(SessionRecord {
            session_id,
            outcome,
        });
    }

    summary.sessions.sort_by_key(|s| s.session_id);
    Ok(summary)
}
