//! Task Controller: the episode state machine.
//!
//! The controller cycles `STARTUP → ACTIVE → RESETTING → STARTUP` forever
//! and only reaches `FINISHED` on an explicit request (operator abort or the
//! episode cap). Every phase change is published on an mpsc channel; the
//! Activity Monitor is the only receiver.
//!
//! The task-specific routines come from a [`TaskStrategy`]. A recoverable
//! failure sets `failed`, which selects the recovery routine instead of the
//! normal reset on the following `RESETTING`. Any [`TaskError`] is fatal.

pub mod motion;
pub mod tasks;

use std::fmt;
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::TimingSettings;
use crate::orchestrator::ErrorFlag;
use crate::orders::OrderExecutor;
use crate::robot::Frame;
use crate::vision::ObjectLocator;

pub use tasks::{
    strategy_for, GraspTask, ShuffleTask, StackTask, TaskContext, TaskError, TaskOutcome,
    TaskStrategy,
};

/// Phase of the episode cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EpisodePhase {
    #[default]
    Startup,
    Active,
    Resetting,
    Finished,
}

impl fmt::Display for EpisodePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Startup => "STARTUP",
            Self::Active => "ACTIVE",
            Self::Resetting => "RESETTING",
            Self::Finished => "FINISHED",
        };
        f.write_str(name)
    }
}

/// Errors that end the controller loop.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Task '{task}' failed fatally: {source}")]
    Task {
        task: &'static str,
        #[source]
        source: TaskError,
    },
}

/// Pauses used by the controller loop.
#[derive(Debug, Clone)]
pub struct ControllerTimings {
    /// How often the start signal is checked.
    pub poll_interval: Duration,
    /// Delay between orders of the shared motion routines.
    pub order_delay: Duration,
    /// Pause after a direct robot call.
    pub settle: Duration,
    /// Pause after the task routine, before RESETTING.
    pub post_task_delay: Duration,
    /// Pause after entering RESETTING.
    pub reset_settle: Duration,
}

impl Default for ControllerTimings {
    fn default() -> Self {
        Self::from_settings(&TimingSettings::default())
    }
}

impl ControllerTimings {
    pub fn from_settings(timing: &TimingSettings) -> Self {
        Self {
            poll_interval: timing.poll_interval(),
            order_delay: timing.order_settle(),
            settle: timing.start_settle(),
            post_task_delay: timing.post_task_delay(),
            reset_settle: timing.reset_settle(),
        }
    }
}

#[derive(Debug, Default)]
struct ControllerState {
    phase: EpisodePhase,
    failed: bool,
    start_flag: bool,
    finish_requested: bool,
    last_outcome_failed: bool,
    episodes_completed: u64,
}

/// Drives the robot through episodes.
pub struct TaskController {
    executor: Arc<OrderExecutor>,
    locator: Arc<dyn ObjectLocator>,
    strategy: Mutex<Box<dyn TaskStrategy>>,
    state: Mutex<ControllerState>,
    bottom_image: Mutex<Option<Arc<Frame>>>,
    phases: Sender<EpisodePhase>,
    timings: ControllerTimings,
    start_position: [f64; 2],
    max_episodes: Option<u64>,
}

impl TaskController {
    /// Creates a controller publishing its phase changes on `phases`.
    pub fn new(
        executor: Arc<OrderExecutor>,
        locator: Arc<dyn ObjectLocator>,
        strategy: Box<dyn TaskStrategy>,
        phases: Sender<EpisodePhase>,
    ) -> Self {
        Self {
            executor,
            locator,
            strategy: Mutex::new(strategy),
            state: Mutex::new(ControllerState::default()),
            bottom_image: Mutex::new(None),
            phases,
            timings: ControllerTimings::default(),
            start_position: [0.0, 0.7],
            max_episodes: None,
        }
    }

    /// Builder method to set the loop timings.
    pub fn with_timings(mut self, timings: ControllerTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Builder method to set the ready pose.
    pub fn with_start_position(mut self, position: [f64; 2]) -> Self {
        self.start_position = position;
        self
    }

    /// Builder method to request `FINISHED` after `max` completed episodes.
    pub fn with_max_episodes(mut self, max: Option<u64>) -> Self {
        self.max_episodes = max;
        self
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The phase the controller is currently in.
    pub fn phase(&self) -> EpisodePhase {
        self.lock().phase
    }

    /// Whether the running episode's outcome check failed.
    pub fn failed(&self) -> bool {
        self.lock().failed
    }

    /// Outcome of the episode that most recently entered RESETTING.
    ///
    /// Unlike [`failed`](Self::failed) this is not cleared before the next
    /// STARTUP.
    pub fn last_outcome_failed(&self) -> bool {
        self.lock().last_outcome_failed
    }

    /// Signals that recording is running and the task may start.
    pub fn raise_start_flag(&self) {
        self.lock().start_flag = true;
    }

    pub fn start_flag(&self) -> bool {
        self.lock().start_flag
    }

    /// Asks the controller to reach FINISHED at its next phase boundary.
    pub fn request_finish(&self) {
        info!("Finish requested");
        self.lock().finish_requested = true;
    }

    pub fn finish_requested(&self) -> bool {
        self.lock().finish_requested
    }

    pub fn episodes_completed(&self) -> u64 {
        self.lock().episodes_completed
    }

    /// Points order persistence at `dir`.
    pub fn set_output_dir(&self, dir: Option<PathBuf>) {
        self.executor.set_output_dir(dir);
    }

    /// Replaces the working bottom-camera frame.
    pub fn set_bottom_image(&self, frame: Arc<Frame>) {
        *self.bottom_image.lock().unwrap_or_else(PoisonError::into_inner) = Some(frame);
    }

    pub fn bottom_image(&self) -> Option<Arc<Frame>> {
        self.bottom_image
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_phase(&self, phase: EpisodePhase) {
        self.lock().phase = phase;
        debug!(phase = %phase, "Phase changed");
        if self.phases.send(phase).is_err() {
            debug!(phase = %phase, "No phase observer");
        }
    }

    fn task_context(&self) -> TaskContext<'_> {
        TaskContext::new(&self.executor, self.locator.as_ref(), &self.bottom_image)
            .with_start_position(self.start_position)
            .with_order_delay(self.timings.order_delay)
            .with_settle(self.timings.settle)
    }

    /// Runs episodes until FINISHED is requested or `error` is raised.
    ///
    /// # Errors
    ///
    /// Returns `ControllerError::Task` when a task routine fails fatally. An
    /// abort caused by `error` is not an error.
    pub fn run(&self, error: &ErrorFlag) -> Result<(), ControllerError> {
        let mut strategy = self.strategy.lock().unwrap_or_else(PoisonError::into_inner);
        let task = strategy.name();
        info!(task, "Task controller started");

        let fatal = |source: TaskError| ControllerError::Task { task, source };
        let ctx = self.task_context();

        macro_rules! step {
            ($result:expr) => {
                match $result {
                    Ok(value) => value,
                    Err(e) if e.is_abort() || error.is_raised() => {
                        info!(task, "Task controller aborted");
                        return Ok(());
                    }
                    Err(e) => return Err(fatal(e)),
                }
            };
        }

        self.set_phase(EpisodePhase::Startup);
        step!(motion::startup(&ctx, self.start_position));

        loop {
            if error.is_raised() {
                info!(task, "Task controller stopped by error flag");
                return Ok(());
            }
            if self.finish_requested() {
                break;
            }

            step!(motion::go_to_start(&ctx));
            self.set_phase(EpisodePhase::Active);

            if !self.wait_for_start(error) {
                if error.is_raised() {
                    return Ok(());
                }
                break;
            }

            match step!(strategy.perform_task(&ctx)) {
                TaskOutcome::Succeeded => info!(task, "Task succeeded"),
                TaskOutcome::Failed { reason } => {
                    warn!(task, reason = %reason, "Task failed");
                    self.lock().failed = true;
                }
            }
            thread::sleep(self.timings.post_task_delay);

            let failed = {
                let mut state = self.lock();
                state.last_outcome_failed = state.failed;
                state.failed
            };
            self.set_phase(EpisodePhase::Resetting);
            thread::sleep(self.timings.reset_settle);

            if failed {
                step!(strategy.recover_after_fail(&ctx));
            } else {
                step!(strategy.reset_task(&ctx));
            }

            let completed = {
                let mut state = self.lock();
                state.failed = false;
                state.episodes_completed += 1;
                state.episodes_completed
            };
            info!(task, episodes = completed, "Episode complete");
            if self.max_episodes.is_some_and(|max| completed >= max) {
                info!(task, max_episodes = completed, "Episode cap reached");
                self.lock().finish_requested = true;
            }

            self.set_phase(EpisodePhase::Startup);
        }

        self.set_phase(EpisodePhase::Finished);
        info!(task, "Task controller finished");
        Ok(())
    }

    /// Waits for the start flag and consumes it. Returns `false` when the wait
    /// was cut short by a finish request or the error flag.
    fn wait_for_start(&self, error: &ErrorFlag) -> bool {
        loop {
            {
                let mut state = self.lock();
                if state.start_flag {
                    state.start_flag = false;
                    return true;
                }
                if state.finish_requested {
                    return false;
                }
            }
            if error.is_raised() {
                return false;
            }
            thread::sleep(self.timings.poll_interval);
        }
    }
}
