//! On-disk episode storage.
//!
//! Everything a run produces lives under one recorded-data root:
//!
//! - **Session directories**: one numbered directory per episode with a
//!   `task/` and a `restore/` recording, plus the `status.txt` outcome marker
//! - **JSON logs**: append-only `orders.json` and `states.json` arrays inside
//!   each recording directory
//!
//! # Usage
//!
//! ```rust,ignore
//! use autograsper::storage::{EpisodeDirectory, EpisodeOutcome, JsonArrayLog};
//!
//! let episode = EpisodeDirectory::create(Path::new("recorded_data"))?;
//! JsonArrayLog::states_in(&episode.task_dir).append(&snapshot)?;
//! episode.write_status(EpisodeOutcome::Success)?;
//!
//! let summary = autograsper::storage::summarize(Path::new("recorded_data"))?;
//! println!("{} of {} succeeded", summary.successes, summary.total());
//! ```

pub mod json_log;
pub mod session;

// Re-export main types for convenience
pub use json_log::{JsonArrayLog, ORDERS_FILE, STATES_FILE};
pub use session::{
    next_session_id, summarize, EpisodeDirectory, EpisodeOutcome, RunSummary, SessionError,
    SessionRecord, STATUS_FILE,
};
