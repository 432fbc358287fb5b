//! Episode Orchestrator: the reactive driver of a run.
//!
//! The orchestrator drains the transitions published by the Activity Monitor
//! and performs exactly one set of side effects per transition:
//!
//! | transition | action |
//! |---|---|
//! | `→ ACTIVE` (not the first) | pause the Recorder, wait between experiments, resume |
//! | `→ ACTIVE` | allocate a session directory, point orders and the Recorder at `task/`, raise `start_flag` |
//! | `→ RESETTING` | write `status.txt`, point orders and the Recorder at `restore/` |
//! | `→ FINISHED` | stop the Recorder, join the Recorder and Image Mirror, exit |
//!
//! The Recorder and Image Mirror threads are only spawned on the first
//! `ACTIVE`.

use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::TimingSettings;
use crate::controller::{EpisodePhase, TaskController};
use crate::recorder::{Recorder, RecorderError, RecorderSettings, VideoWriterFactory};
use crate::robot::RobotTransport;
use crate::storage::{EpisodeDirectory, EpisodeOutcome, SessionError};
use crate::vision::Undistorter;

use super::{ActivityMonitor, ErrorFlag, ImageMirror, OrchestrationContext};

/// Errors that end a run.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Recorder error: {0}")]
    Recorder(#[from] RecorderError),

    #[error("Failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The error flag was raised somewhere in the run.
    #[error("Run aborted: {0}")]
    Aborted(String),
}

/// Everything needed to build the Recorder on the first `ACTIVE`.
pub struct RecorderParts {
    pub robot: Arc<dyn RobotTransport>,
    pub undistorter: Arc<dyn Undistorter>,
    pub writers: Arc<dyn VideoWriterFactory>,
    pub settings: RecorderSettings,
}

/// Pauses taken by the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorTimings {
    /// Recorder pause between two episodes.
    pub time_between_experiments: Duration,
    /// Wait between starting a recording and raising `start_flag`.
    pub start_settle: Duration,
    /// Wait between stopping the Recorder and joining it.
    pub stop_settle: Duration,
}

impl OrchestratorTimings {
    pub fn from_settings(timing: &TimingSettings) -> Self {
        Self {
            time_between_experiments: timing.time_between_experiments(),
            start_settle: timing.start_settle(),
            stop_settle: timing.stop_settle(),
        }
    }
}

impl Default for OrchestratorTimings {
    fn default() -> Self {
        Self::from_settings(&TimingSettings::default())
    }
}

/// Outcome of one completed episode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EpisodeReport {
    pub session_id: u64,
    pub outcome: EpisodeOutcome,
}

/// Outcomes of every episode that reached `RESETTING` during a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub episodes: Vec<EpisodeReport>,
}

impl RunReport {
    pub fn successes(&self) -> usize {
        self.count(EpisodeOutcome::Success)
    }

    pub fn failures(&self) -> usize {
        self.count(EpisodeOutcome::Fail)
    }

    fn count(&self, outcome: EpisodeOutcome) -> usize {
        self.episodes.iter().filter(|e| e.outcome == outcome).count()
    }
}

/// Raises the error flag if the owning thread unwinds.
struct PanicGuard {
    error: ErrorFlag,
    name: &'static str,
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            self.error.raise(format!("{} thread panicked", self.name));
        }
    }
}

fn spawn_worker<F>(
    name: &'static str,
    error: ErrorFlag,
    body: F,
) -> Result<JoinHandle<()>, OrchestratorError>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let _guard = PanicGuard { error, name };
            body();
        })
        .map_err(|source| OrchestratorError::Spawn { name, source })
}

/// The reactive driver. Runs on the calling thread.
pub struct EpisodeOrchestrator {
    ctx: Arc<OrchestrationContext>,
    controller: Arc<TaskController>,
    phases: Option<Receiver<EpisodePhase>>,
    recorder_parts: RecorderParts,
    root_dir: PathBuf,
    timings: OrchestratorTimings,
    current: Option<EpisodeDirectory>,
    previous: EpisodePhase,
    seen_active: bool,
    report: RunReport,
}

impl EpisodeOrchestrator {
    /// `phases` is the receiving end of the channel `controller` publishes on.
    pub fn new(
        ctx: Arc<OrchestrationContext>,
        controller: Arc<TaskController>,
        phases: Receiver<EpisodePhase>,
        recorder_parts: RecorderParts,
        root_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            ctx,
            controller,
            phases: Some(phases),
            recorder_parts,
            root_dir: root_dir.into(),
            timings: OrchestratorTimings::default(),
            current: None,
            previous: EpisodePhase::Startup,
            seen_active: false,
            report: RunReport::default(),
        }
    }

    /// Builder method to set the orchestrator's pauses.
    pub fn with_timings(mut self, timings: OrchestratorTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Runs until the controller reaches FINISHED or the error flag is
    /// raised, then joins every worker thread.
    ///
    /// # Errors
    ///
    /// Returns `OrchestratorError::Aborted` with the first recorded reason
    /// when the error flag was raised, or the orchestrator's own error.
    pub fn run(mut self) -> Result<RunReport, OrchestratorError> {
        info!(root = %self.root_dir.display(), "Orchestrator started");
        let error = self.ctx.error_flag().clone();
        let mut workers = Vec::new();

        let result = self
            .spawn_core(&mut workers)
            .and_then(|()| self.drive());
        if let Err(e) = &result {
            error!(error = %e, "Orchestrator failed");
            error.raise(e.to_string());
        }

        self.teardown(workers);

        match result {
            Ok(()) if !error.is_raised() => {
                info!(
                    episodes = self.report.episodes.len(),
                    successes = self.report.successes(),
                    "Run complete"
                );
                Ok(self.report)
            }
            Ok(()) => Err(OrchestratorError::Aborted(
                error.reason().unwrap_or_else(|| "unknown".to_string()),
            )),
            Err(OrchestratorError::Aborted(reason)) => Err(OrchestratorError::Aborted(
                error.reason().unwrap_or(reason),
            )),
            Err(e) => Err(e),
        }
    }

    fn spawn_core(
        &mut self,
        workers: &mut Vec<(&'static str, JoinHandle<()>)>,
    ) -> Result<(), OrchestratorError> {
        let error = self.ctx.error_flag().clone();

        let controller = Arc::clone(&self.controller);
        let flag = error.clone();
        let handle = spawn_worker("task-controller", error.clone(), move || {
            if let Err(e) = controller.run(&flag) {
                error!(error = %e, "Task controller failed");
                flag.raise(e.to_string());
            }
        })?;
        workers.push(("task-controller", handle));

        if let Some(phases) = self.phases.take() {
            let monitor = ActivityMonitor::new(Arc::clone(&self.ctx), phases);
            let handle = spawn_worker("activity-monitor", error, move || {
                monitor.run();
            })?;
            workers.push(("activity-monitor", handle));
        }
        Ok(())
    }

    fn drive(&mut self) -> Result<(), OrchestratorError> {
        loop {
            if self.ctx.error_flag().is_raised() {
                return Err(OrchestratorError::Aborted(
                    self.ctx.error_flag().reason().unwrap_or_default(),
                ));
            }

            let transitions = self.ctx.lock_state().take_transitions();
            for phase in transitions {
                debug!(from = %self.previous, to = %phase, "Reacting to transition");
                match phase {
                    EpisodePhase::Active => self.on_active()?,
                    EpisodePhase::Resetting => self.on_resetting()?,
                    EpisodePhase::Finished => {
                        self.previous = phase;
                        self.on_finished();
                        return Ok(());
                    }
                    EpisodePhase::Startup => {}
                }
                self.previous = phase;
            }

            thread::sleep(self.ctx.poll_interval());
        }
    }

    fn on_active(&mut self) -> Result<(), OrchestratorError> {
        if self.seen_active {
            if let Some(recorder) = self.recorder() {
                debug!(
                    pause_secs = self.timings.time_between_experiments.as_secs(),
                    "Pausing recorder between experiments"
                );
                recorder.pause();
                self.sleep_unless_stopped(self.timings.time_between_experiments);
                recorder.resume();
            }
        }

        let episode = EpisodeDirectory::create(&self.root_dir)?;
        self.controller.set_output_dir(Some(episode.task_dir.clone()));

        match self.recorder() {
            Some(recorder) => recorder.start_new_recording(&episode.task_dir)?,
            None => self.start_recorder(&episode.task_dir)?,
        }
        self.sleep_unless_stopped(self.timings.start_settle);

        self.controller.raise_start_flag();
        info!(
            session_id = episode.session_id,
            task_dir = %episode.task_dir.display(),
            "Episode started"
        );
        self.current = Some(episode);
        self.seen_active = true;
        Ok(())
    }

    fn on_resetting(&mut self) -> Result<(), OrchestratorError> {
        let Some(episode) = self.current.as_ref() else {
            warn!("RESETTING observed without an active episode");
            return Ok(());
        };

        let outcome = EpisodeOutcome::from_failed(self.controller.last_outcome_failed());
        episode.write_status(outcome)?;
        self.controller.set_output_dir(Some(episode.restore_dir.clone()));
        if let Some(recorder) = self.recorder() {
            recorder.start_new_recording(&episode.restore_dir)?;
        }

        info!(session_id = episode.session_id, outcome = %outcome, "Episode outcome recorded");
        self.report.episodes.push(EpisodeReport {
            session_id: episode.session_id,
            outcome,
        });
        Ok(())
    }

    fn on_finished(&mut self) {
        info!("Controller finished, stopping workers");
        self.ctx.request_shutdown();
        if let Some(recorder) = self.recorder() {
            recorder.stop();
            self.sleep_unless_stopped(self.timings.stop_settle);
        }
        self.join_recording_threads();
    }

    fn recorder(&self) -> Option<Arc<Recorder>> {
        self.ctx.lock_state().recorder.clone()
    }

    /// Builds the Recorder aimed at `output_dir` and spawns the Recorder and
    /// Image Mirror threads. The recording is started before the capture
    /// thread exists, so its first tick already writes into `output_dir`.
    fn start_recorder(&self, output_dir: &Path) -> Result<(), OrchestratorError> {
        let parts = &self.recorder_parts;
        let recorder = Arc::new(Recorder::new(
            Arc::clone(&parts.robot),
            Arc::clone(&parts.undistorter),
            Arc::clone(&parts.writers),
            output_dir,
            parts.settings.clone(),
        ));
        recorder.start_new_recording(output_dir)?;

        let mut state = self.ctx.lock_state();
        state.recorder = Some(Arc::clone(&recorder));

        let error = self.ctx.error_flag().clone();
        let capture = Arc::clone(&recorder);
        state.recorder_thread = Some(spawn_worker("recorder", error.clone(), move || {
            if let Err(e) = capture.record(&error) {
                error!(error = %e, "Recorder failed");
                error.raise(format!("recorder: {e}"));
            }
        })?);

        let mirror = ImageMirror::new(
            Arc::clone(&self.ctx),
            Arc::clone(&recorder),
            Arc::clone(&self.controller),
        );
        state.mirror_thread = Some(spawn_worker(
            "image-mirror",
            self.ctx.error_flag().clone(),
            move || {
                mirror.run();
            },
        )?);

        info!(output_dir = %output_dir.display(), "Recorder threads started");
        Ok(())
    }

    fn join_recording_threads(&self) {
        let (recorder_thread, mirror_thread) = self.ctx.lock_state().take_worker_threads();
        if let Some(handle) = recorder_thread {
            self.join("recorder", handle);
        }
        if let Some(handle) = mirror_thread {
            self.join("image-mirror", handle);
        }
    }

    fn join(&self, name: &'static str, handle: JoinHandle<()>) {
        if handle.join().is_err() {
            self.ctx
                .error_flag()
                .raise(format!("{name} thread panicked"));
        }
        debug!(thread = name, "Joined thread");
    }

    /// Joins every worker, whichever of them caused the run to end.
    fn teardown(&self, workers: Vec<(&'static str, JoinHandle<()>)>) {
        self.ctx.request_shutdown();
        self.join_recording_threads();
        for (name, handle) in workers {
            self.join(name, handle);
        }
        info!("All threads joined");
    }

    /// Sleeps for `duration`, returning early once the error flag is raised.
    fn sleep_unless_stopped(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        let step = self.ctx.poll_interval().max(Duration::from_millis(1));
        loop {
            if self.ctx.error_flag().is_raised() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            thread::sleep(step.min(deadline - now));
        }
    }
}
