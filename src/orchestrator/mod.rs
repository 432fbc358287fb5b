//! Episode orchestration.
//!
//! The orchestrator runs on the calling thread and owns four workers:
//!
//! | thread | loop |
//! |---|---|
//! | task controller | [`TaskController::run`](crate::controller::TaskController::run) |
//! | activity monitor | [`ActivityMonitor::run`] |
//! | recorder | [`Recorder::record`](crate::recorder::Recorder::record), spawned on the first ACTIVE |
//! | image mirror | [`ImageMirror::run`], spawned with the recorder |
//!
//! All of them share one [`OrchestrationContext`]. Any fault raises the
//! [`ErrorFlag`]; every loop observes it at its next iteration and the
//! orchestrator joins every thread before returning.

pub mod context;
pub mod episode;
pub mod monitor;

pub use context::{ErrorFlag, OrchestrationContext, SharedActivityState};
pub use episode::{
    EpisodeOrchestrator, EpisodeReport, OrchestratorError, OrchestratorTimings, RecorderParts,
    RunReport,
};
pub use monitor::{ActivityMonitor, ImageMirror};
