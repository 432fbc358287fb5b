//! Cross-thread orchestration state.
//!
//! One [`OrchestrationContext`] is built per run and shared by reference
//! (`Arc`) with every worker thread. It owns:
//!
//! - the process-wide [`ErrorFlag`]
//! - the [`SharedActivityState`] behind its own mutex (phase, pending
//!   transitions, recorder handle, worker join handles)
//! - a shutdown flag that releases the Image Mirror at `FINISHED`
//!
//! The bottom-frame buffer is not here: it lives in the Recorder behind a
//! separate mutex.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::error;

use crate::controller::EpisodePhase;
use crate::recorder::Recorder;

/// A monotonic, process-wide error signal.
///
/// Any thread may raise it; no thread can clear it. Every long-running loop
/// polls it and exits at its next iteration boundary once it is raised.
#[derive(Debug, Clone, Default)]
pub struct ErrorFlag {
    inner: Arc<ErrorFlagInner>,
}

#[derive(Debug, Default)]
struct ErrorFlagInner {
    raised: AtomicBool,
    reason: OnceLock<String>,
}

impl ErrorFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the flag. Returns `true` if this call was the first to raise it.
    ///
    /// Only the first reason is kept.
    pub fn raise(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let first = self.inner.reason.set(reason.clone()).is_ok();
        self.inner.raised.store(true, Ordering::SeqCst);
        if first {
            error!(reason = %reason, "Error flag raised");
        }
        first
    }

    pub fn is_raised(&self) -> bool {
        self.inner.raised.load(Ordering::SeqCst)
    }

    /// The reason given by the first `raise`.
    pub fn reason(&self) -> Option<String> {
        self.inner.reason.get().cloned()
    }
}

/// Phase and worker handles shared between the Activity Monitor (writer) and
/// the Episode Orchestrator (reader).
#[derive(Default)]
pub struct SharedActivityState {
    phase: EpisodePhase,
    pending: VecDeque<EpisodePhase>,
    /// Created lazily on the first `ACTIVE`.
    pub recorder: Option<Arc<Recorder>>,
    pub recorder_thread: Option<JoinHandle<()>>,
    pub mirror_thread: Option<JoinHandle<()>>,
}

impl SharedActivityState {
    /// The most recently published phase.
    pub fn phase(&self) -> EpisodePhase {
        self.phase
    }

    /// Records a phase change. Called only by the Activity Monitor.
    pub fn publish(&mut self, phase: EpisodePhase) {
        self.phase = phase;
        self.pending.push_back(phase);
    }

    /// Takes every transition published since the last call, oldest first.
    pub fn take_transitions(&mut self) -> Vec<EpisodePhase> {
        self.pending.drain(..).collect()
    }

    /// Takes both worker join handles, leaving `None` behind.
    pub fn take_worker_threads(&mut self) -> (Option<JoinHandle<()>>, Option<JoinHandle<()>>) {
        (self.recorder_thread.take(), self.mirror_thread.take())
    }
}

/// Everything the orchestration threads share.
pub struct OrchestrationContext {
    error: ErrorFlag,
    shutdown: AtomicBool,
    state: Mutex<SharedActivityState>,
    poll_interval: Duration,
    #[cfg(test)]
    fault: Mutex<Option<&'static str>>,
}

impl OrchestrationContext {
    pub fn new(poll_interval: Duration) -> Arc<Self> {
        Self::with_error_flag(poll_interval, ErrorFlag::new())
    }

    /// Builds a context around an existing flag, e.g. one a signal handler
    /// also holds.
    pub fn with_error_flag(poll_interval: Duration, error: ErrorFlag) -> Arc<Self> {
        Arc::new(Self {
            error,
            shutdown: AtomicBool::new(false),
            state: Mutex::new(SharedActivityState::default()),
            poll_interval,
            #[cfg(test)]
            fault: Mutex::new(None),
        })
    }

    pub fn error_flag(&self) -> &ErrorFlag {
        &self.error
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Locks the shared state. A poisoned lock is recovered so that teardown
    /// can always reach the join handles.
    pub fn lock_state(&self) -> MutexGuard<'_, SharedActivityState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Releases loops that run until the run is over (the Image Mirror).
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// True once a worker loop should exit for any reason.
    pub fn should_stop(&self) -> bool {
        self.error.is_raised() || self.is_shutdown()
    }

    /// Makes the loop of `worker` panic at its next iteration.
    #[cfg(test)]
    pub(crate) fn inject_panic(&self, worker: &'static str) {
        *self.fault.lock().unwrap_or_else(PoisonError::into_inner) = Some(worker);
    }

    #[cfg(test)]
    pub(crate) fn fail_point(&self, worker: &'static str) {
        let injected = *self.fault.lock().unwrap_or_else(PoisonError::into_inner);
        if injected == Some(worker) {
            panic!("injected fault in {worker}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_flag_is_monotonic() {
        let flag = ErrorFlag::new();
        assert!(!flag.is_raised());
        assert!(flag.reason().is_none());

        assert!(flag.raise("first"));
        assert!(!flag.raise("second"));

        assert!(flag.is_raised());
        assert_eq!(flag.reason().as_deref(), Some("first"));
    }

    #[test]
    fn test_error_flag_clones_share_state() {
        let flag = ErrorFlag::new();
        let clone = flag.clone();

        let handle = std::thread::spawn(move || clone.raise("from worker"));
        assert!(handle.join().expect("join"));

        assert!(flag.is_raised());
    }

    #[test]
    fn test_transitions_drain_in_order() {
        let mut state = SharedActivityState::default();
        assert_eq!(state.phase(), EpisodePhase::Startup);

        state.publish(EpisodePhase::Active);
        state.publish(EpisodePhase::Resetting);

        assert_eq!(state.phase(), EpisodePhase::Resetting);
        assert_eq!(
            state.take_transitions(),
            vec![EpisodePhase::Active, EpisodePhase::Resetting]
        );
        assert!(state.take_transitions().is_empty());
    }

    #[test]
    fn test_context_stop_conditions() {
        let ctx = OrchestrationContext::new(Duration::from_millis(5));
        assert!(!ctx.should_stop());

        ctx.request_shutdown();
        assert!(ctx.should_stop());
        assert!(!ctx.error_flag().is_raised());

        let ctx = OrchestrationContext::new(Duration::from_millis(5));
        ctx.error_flag().raise("boom");
        assert!(ctx.should_stop());
    }
}
