//! Task strategies.
//!
//! The controller owns exactly one [`TaskStrategy`] and calls it at fixed
//! points of the episode cycle: `perform_task` while ACTIVE, then either
//! `reset_task` or `recover_after_fail` while RESETTING. A recoverable
//! failure (target not visible, grasp missed, stack fell over) is reported as
//! [`TaskOutcome::Failed`]; `TaskError` is only for faults that must end the
//! run.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ExperimentConfig, TaskKind};
use crate::orders::{OrderError, OrderExecutor, OrderIntent};
use crate::robot::Frame;
use crate::vision::{ObjectLocator, VisionError};

use super::motion;

/// Maximum random offset added to the detected target position.
const GRASP_JITTER: f64 = 0.08;

/// The grasp counts as successful when the target ends up this close to the
/// grasp position.
const GRASP_SUCCESS_RADIUS: f64 = 0.12;

/// Minimum distance from the workspace centre for a reset target block.
const GRASP_RESET_MARGIN: f64 = 0.25;

/// Lowest z the gripper closes at when picking up a block.
const MIN_PICK_HEIGHT: f64 = 0.02;

/// Clearance subtracted from a block's height to get its pick height.
const PICK_CLEARANCE: f64 = 0.20;

/// Fatal errors raised by a task routine.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Order execution failed: {0}")]
    Order(#[from] OrderError),

    #[error("Vision error: {0}")]
    Vision(#[from] VisionError),

    #[error("No free position found for {requested} blocks")]
    NoFreePosition { requested: usize },

    #[error("Task misconfigured: {0}")]
    Misconfigured(String),

    #[error("{0}")]
    Fault(String),
}

impl TaskError {
    /// True when the error only means the run was aborted while orders were
    /// queued.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Order(OrderError::Aborted))
    }
}

/// Result of one `perform_task` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    Failed { reason: String },
}

impl TaskOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Everything a task routine may touch.
pub struct TaskContext<'a> {
    pub executor: &'a OrderExecutor,
    pub locator: &'a dyn ObjectLocator,
    bottom_image: &'a Mutex<Option<Arc<Frame>>>,
    /// Ready pose the arm returns to.
    pub start_position: [f64; 2],
    /// Delay between queued orders for shared motion routines.
    pub order_delay: Duration,
    /// Short pause after a direct robot call.
    pub settle: Duration,
}

impl<'a> TaskContext<'a> {
    pub fn new(
        executor: &'a OrderExecutor,
        locator: &'a dyn ObjectLocator,
        bottom_image: &'a Mutex<Option<Arc<Frame>>>,
    ) -> Self {
        Self {
            executor,
            locator,
            bottom_image,
            start_position: [0.0, 0.7],
            order_delay: Duration::from_secs(1),
            settle: Duration::from_millis(500),
        }
    }

    pub fn with_start_position(mut self, position: [f64; 2]) -> Self {
        self.start_position = position;
        self
    }

    pub fn with_order_delay(mut self, delay: Duration) -> Self {
        self.order_delay = delay;
        self
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// The most recent bottom-camera frame mirrored from the Recorder.
    pub fn bottom_image(&self) -> Option<Arc<Frame>> {
        self.bottom_image
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Locates the `color` block in the latest bottom frame.
    ///
    /// Returns `None` when the block is not visible or no frame has been
    /// mirrored yet.
    pub fn locate(&self, color: &str) -> Result<Option<[f64; 2]>, TaskError> {
        let Some(frame) = self.bottom_image() else {
            debug!(color, "No bottom image available");
            return Ok(None);
        };
        Ok(self.locator.locate(&frame, color)?)
    }

    /// Whether every colour in `colors` is visible, or `None` without a frame.
    pub fn all_visible(&self, colors: &[String]) -> Result<Option<bool>, TaskError> {
        match self.bottom_image() {
            Some(frame) => Ok(Some(self.locator.all_visible(&frame, colors)?)),
            None => Ok(None),
        }
    }

    pub fn queue(&self, orders: &[OrderIntent], delay: Duration) -> Result<usize, TaskError> {
        Ok(self.executor.queue(orders, delay)?)
    }
}

/// The task-specific routines of an episode.
pub trait TaskStrategy: Send {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Runs the task while ACTIVE.
    fn perform_task(&mut self, ctx: &TaskContext<'_>) -> Result<TaskOutcome, TaskError>;

    /// Restores the workspace after a successful episode.
    fn reset_task(&mut self, ctx: &TaskContext<'_>) -> Result<(), TaskError>;

    /// Brings the workspace back to a known state after a failed episode.
    fn recover_after_fail(&mut self, ctx: &TaskContext<'_>) -> Result<(), TaskError>;
}

/// Builds the strategy selected by `config.experiment.task`.
///
/// `seed` makes random placements reproducible.
pub fn strategy_for(
    config: &ExperimentConfig,
    seed: Option<u64>,
) -> Result<Box<dyn TaskStrategy>, TaskError> {
    let rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    let experiment = &config.experiment;
    let delay = experiment.order_delay_secs.map(Duration::from_secs_f64);

    let strategy: Box<dyn TaskStrategy> = match experiment.task {
        TaskKind::Grasp => {
            let mut task = GraspTask::new(experiment.target_color.clone(), rng);
            if let Some(delay) = delay {
                task = task.with_order_delay(delay);
            }
            Box::new(task)
        }
        TaskKind::Stack => {
            let mut task = StackTask::new(
                experiment.colors.clone(),
                experiment.block_heights.clone(),
                rng,
            )?
            .with_position_bank(experiment.position_bank.clone(), experiment.object_size)
            .with_stack_position(experiment.stack_position);
            if let Some(delay) = delay {
                task = task.with_order_delay(delay);
            }
            Box::new(task)
        }
        TaskKind::Shuffle => {
            let mut task = ShuffleTask::new(experiment.colors.clone(), rng)
                .with_position_bank(experiment.position_bank.clone(), experiment.object_size);
            if let Some(delay) = delay {
                task = task.with_order_delay(delay);
            }
            Box::new(task)
        }
    };
    Ok(strategy)
}

/// Grasp a single block near its detected position.
pub struct GraspTask {
    target_color: String,
    order_delay: Duration,
    reset_delay: Duration,
    rng: StdRng,
}

impl GraspTask {
    pub fn new(target_color: impl Into<String>, rng: StdRng) -> Self {
        Self {
            target_color: target_color.into(),
            order_delay: Duration::from_secs(4),
            reset_delay: Duration::from_secs(2),
            rng,
        }
    }

    /// Sets the delay for both the grasp and the reset sequences.
    pub fn with_order_delay(mut self, delay: Duration) -> Self {
        self.order_delay = delay;
        self.reset_delay = delay;
        self
    }
}

impl TaskStrategy for GraspTask {
    fn name(&self) -> &'static str {
        "grasp"
    }

    fn perform_task(&mut self, ctx: &TaskContext<'_>) -> Result<TaskOutcome, TaskError> {
        let Some(object) = ctx.locate(&self.target_color)? else {
            return Ok(TaskOutcome::failed(format!(
                "{} block not visible",
                self.target_color
            )));
        };

        let grasp = [
            object[0] + self.rng.random_range(-GRASP_JITTER..=GRASP_JITTER),
            object[1] + self.rng.random_range(-GRASP_JITTER..=GRASP_JITTER),
        ];
        info!(?object, ?grasp, "Grasping");
        ctx.queue(
            &[
                OrderIntent::move_to(grasp),
                OrderIntent::gripper_open(),
                OrderIntent::move_z(0.0),
                OrderIntent::gripper_close(),
            ],
            self.order_delay,
        )?;

        let Some(after) = ctx.locate(&self.target_color)? else {
            return Ok(TaskOutcome::failed("target lost after grasp"));
        };
        let offset = motion::distance(grasp, after);
        if offset < GRASP_SUCCESS_RADIUS {
            Ok(TaskOutcome::Succeeded)
        } else {
            Ok(TaskOutcome::failed(format!(
                "target {offset:.3} away from grasp position"
            )))
        }
    }

    fn reset_task(&mut self, ctx: &TaskContext<'_>) -> Result<(), TaskError> {
        let Some(object) = ctx.locate(&self.target_color)? else {
            warn!(color = %self.target_color, "Target not visible, skipping reposition");
            return motion::go_to_start(ctx);
        };
        let target = motion::random_block_position(&mut self.rng, GRASP_RESET_MARGIN);
        debug!(?object, ?target, "Repositioning target block");

        ctx.queue(&[OrderIntent::gripper_open()], self.reset_delay)?;
        motion::pickup_and_place(ctx, object, 0.0, 0.0, target, self.reset_delay)?;
        motion::go_to_start(ctx)
    }

    fn recover_after_fail(&mut self, ctx: &TaskContext<'_>) -> Result<(), TaskError> {
        ctx.queue(&[OrderIntent::gripper_open()], Duration::ZERO)?;
        thread::sleep(ctx.settle);
        motion::go_to_start(ctx)?;
        ctx.queue(&[OrderIntent::gripper_open()], Duration::ZERO)?;
        Ok(())
    }
}

/// Stack coloured blocks on top of each other.
pub struct StackTask {
    colors: Vec<String>,
    heights: Vec<f64>,
    position_bank: Vec<[f64; 2]>,
    object_size: f64,
    stack_position: [f64; 2],
    order_delay: Duration,
    rng: StdRng,
}

impl StackTask {
    /// `colors` and `heights` are ordered bottom block first.
    ///
    /// # Errors
    ///
    /// Returns `TaskError::Misconfigured` if the lists are empty or differ in
    /// length.
    pub fn new(colors: Vec<String>, heights: Vec<f64>, rng: StdRng) -> Result<Self, TaskError> {
        if colors.is_empty() {
            return Err(TaskError::Misconfigured("no block colors".to_string()));
        }
        if colors.len() != heights.len() {
            return Err(TaskError::Misconfigured(format!(
                "{} colors but {} block heights",
                colors.len(),
                heights.len()
            )));
        }
        Ok(Self {
            colors,
            heights,
            position_bank: vec![[0.2, 0.2], [0.8, 0.2], [0.8, 0.8]],
            object_size: 0.1,
            stack_position: [0.5, 0.5],
            order_delay: Duration::from_millis(1500),
            rng,
        })
    }

    pub fn with_position_bank(mut self, bank: Vec<[f64; 2]>, object_size: f64) -> Self {
        self.position_bank = bank;
        self.object_size = object_size;
        self
    }

    pub fn with_stack_position(mut self, position: [f64; 2]) -> Self {
        self.stack_position = position;
        self
    }

    pub fn with_order_delay(mut self, delay: Duration) -> Self {
        self.order_delay = delay;
        self
    }

    fn stack_objects(&self, ctx: &TaskContext<'_>) -> Result<TaskOutcome, TaskError> {
        let bottom_color = &self.colors[0];
        let mut stack_height = 0.0;

        for (color, height) in self.colors.iter().zip(&self.heights) {
            let Some(bottom) = ctx.locate(bottom_color)? else {
                return Ok(TaskOutcome::failed(format!("{bottom_color} block not visible")));
            };
            let Some(object) = ctx.locate(color)? else {
                return Ok(TaskOutcome::failed(format!("{color} block not visible")));
            };

            let target = if color == bottom_color {
                self.stack_position
            } else {
                bottom
            };
            let pick_height = (height - PICK_CLEARANCE).max(MIN_PICK_HEIGHT);
            debug!(color = %color, stack_height, "Stacking block");
            motion::pickup_and_place(ctx, object, pick_height, stack_height, target, self.order_delay)?;
            stack_height += height;
        }
        Ok(TaskOutcome::Succeeded)
    }
}

impl TaskStrategy for StackTask {
    fn name(&self) -> &'static str {
        "stack"
    }

    fn perform_task(&mut self, ctx: &TaskContext<'_>) -> Result<TaskOutcome, TaskError> {
        let outcome = self.stack_objects(ctx)?;
        if outcome.is_failed() {
            return Ok(outcome);
        }

        match ctx.all_visible(&self.colors)? {
            Some(false) => Ok(TaskOutcome::Succeeded),
            Some(true) => Ok(TaskOutcome::failed("all blocks still visible")),
            None => Ok(TaskOutcome::failed("no bottom image to check the stack")),
        }
    }

    fn reset_task(&mut self, ctx: &TaskContext<'_>) -> Result<(), TaskError> {
        let positions = motion::pick_random_positions(
            &mut self.rng,
            &self.position_bank,
            self.heights.len(),
            self.object_size,
            &[[0.5, 0.5]],
        )?;
        motion::reset_blocks(ctx, &positions, &self.heights, self.stack_position, self.order_delay)
    }

    fn recover_after_fail(&mut self, ctx: &TaskContext<'_>) -> Result<(), TaskError> {
        motion::clear_center(ctx)
    }
}

/// Scatter the visible blocks over random positions from the bank.
pub struct ShuffleTask {
    colors: Vec<String>,
    position_bank: Vec<[f64; 2]>,
    object_size: f64,
    order_delay: Duration,
    rng: StdRng,
}

impl ShuffleTask {
    pub fn new(colors: Vec<String>, rng: StdRng) -> Self {
        Self {
            colors,
            position_bank: vec![[0.2, 0.2], [0.8, 0.2], [0.8, 0.8]],
            object_size: 0.1,
            order_delay: Duration::from_millis(1500),
            rng,
        }
    }

    pub fn with_position_bank(mut self, bank: Vec<[f64; 2]>, object_size: f64) -> Self {
        self.position_bank = bank;
        self.object_size = object_size;
        self
    }

    pub fn with_order_delay(mut self, delay: Duration) -> Self {
        self.order_delay = delay;
        self
    }

    fn raise_open(&self, ctx: &TaskContext<'_>) -> Result<(), TaskError> {
        ctx.queue(
            &[OrderIntent::gripper_open(), OrderIntent::move_z(1.0)],
            self.order_delay,
        )?;
        Ok(())
    }
}

impl TaskStrategy for ShuffleTask {
    fn name(&self) -> &'static str {
        "shuffle"
    }

    fn perform_task(&mut self, ctx: &TaskContext<'_>) -> Result<TaskOutcome, TaskError> {
        let positions = motion::pick_random_positions(
            &mut self.rng,
            &self.position_bank,
            self.colors.len(),
            self.object_size,
            &[],
        )?;

        let mut missing = Vec::new();
        for (color, target) in self.colors.iter().zip(positions) {
            match ctx.locate(color)? {
                Some(object) => {
                    motion::pickup_and_place(ctx, object, 0.0, 0.0, target, self.order_delay)?;
                }
                None => missing.push(color.as_str()),
            }
        }

        if missing.is_empty() {
            Ok(TaskOutcome::Succeeded)
        } else {
            Ok(TaskOutcome::failed(format!(
                "not visible: {}",
                missing.join(", ")
            )))
        }
    }

    fn reset_task(&mut self, ctx: &TaskContext<'_>) -> Result<(), TaskError> {
        self.raise_open(ctx)
    }

    fn recover_after_fail(&mut self, ctx: &TaskContext<'_>) -> Result<(), TaskError> {
        self.raise_open(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orders::OrderKind;
    use crate::robot::{RobotCall, SimulatedRobot};
    use std::collections::{HashMap, VecDeque};

    /// Answers `locate` from per-colour scripts; the last answer repeats.
    #[derive(Default)]
    struct ScriptedLocator {
        answers: Mutex<HashMap<String, VecDeque<Option<[f64; 2]>>>>,
    }

    impl ScriptedLocator {
        fn answer(self, color: &str, answers: &[Option<[f64; 2]>]) -> Self {
            self.answers
                .lock()
                .unwrap()
                .insert(color.to_string(), answers.iter().copied().collect());
            self
        }
    }

    impl ObjectLocator for ScriptedLocator {
        fn locate(&self, _frame: &Frame, color: &str) -> Result<Option<[f64; 2]>, VisionError> {
            let mut answers = self.answers.lock().unwrap();
            let queue = answers
                .get_mut(color)
                .ok_or_else(|| VisionError::UnknownColor(color.to_string()))?;
            if queue.len() > 1 {
                Ok(queue.pop_front().flatten())
            } else {
                Ok(queue.front().copied().flatten())
            }
        }
    }

    struct Fixture {
        robot: Arc<SimulatedRobot>,
        executor: OrderExecutor,
        image: Mutex<Option<Arc<Frame>>>,
    }

    impl Fixture {
        fn new() -> Self {
            let robot = Arc::new(SimulatedRobot::new("sim"));
            let executor = OrderExecutor::new(robot.clone(), Duration::ZERO)
                .with_ramp_step_delay(Duration::ZERO);
            Self {
                robot,
                executor,
                image: Mutex::new(Some(Arc::new(Frame::new(4, 4)))),
            }
        }

        fn ctx<'a>(&'a self, locator: &'a dyn ObjectLocator) -> TaskContext<'a> {
            TaskContext::new(&self.executor, locator, &self.image)
                .with_order_delay(Duration::ZERO)
                .with_settle(Duration::ZERO)
        }
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn test_grasp_succeeds_when_target_stays_close() {
        let fixture = Fixture::new();
        let locator = ScriptedLocator::default().answer("green", &[Some([0.5, 0.5])]);
        let mut task = GraspTask::new("green", rng()).with_order_delay(Duration::ZERO);

        let outcome = task.perform_task(&fixture.ctx(&locator)).expect("perform");

        assert_eq!(outcome, TaskOutcome::Succeeded);
        let calls = fixture.robot.calls();
        let RobotCall::MoveXy { x, y } = calls[0] else {
            panic!("expected a MOVE_XY first, got {:?}", calls[0]);
        };
        assert!((x - 0.5).abs() <= GRASP_JITTER + 1e-9);
        assert!((y - 0.5).abs() <= GRASP_JITTER + 1e-9);
        assert!(calls.contains(&RobotCall::MoveZ { z: 0.0 }));
    }

    #[test]
    fn test_grasp_fails_when_target_moves_away() {
        let fixture = Fixture::new();
        let locator =
            ScriptedLocator::default().answer("green", &[Some([0.5, 0.5]), Some([0.9, 0.9])]);
        let mut task = GraspTask::new("green", rng()).with_order_delay(Duration::ZERO);

        let outcome = task.perform_task(&fixture.ctx(&locator)).expect("perform");

        assert!(outcome.is_failed());
    }

    #[test]
    fn test_grasp_without_target_is_recoverable() {
        let fixture = Fixture::new();
        let locator = ScriptedLocator::default().answer("green", &[None]);
        let mut task = GraspTask::new("green", rng());

        let outcome = task.perform_task(&fixture.ctx(&locator)).expect("perform");

        assert!(matches!(outcome, TaskOutcome::Failed { .. }));
        assert!(fixture.robot.calls().is_empty());
    }

    #[test]
    fn test_grasp_without_image_is_recoverable() {
        let fixture = Fixture::new();
        *fixture.image.lock().unwrap() = None;
        let locator = ScriptedLocator::default().answer("green", &[Some([0.5, 0.5])]);
        let mut task = GraspTask::new("green", rng());

        let outcome = task.perform_task(&fixture.ctx(&locator)).expect("perform");

        assert!(outcome.is_failed());
    }

    #[test]
    fn test_grasp_recovery_leaves_gripper_open_at_ready_pose() {
        let fixture = Fixture::new();
        let locator = ScriptedLocator::default();
        let mut task = GraspTask::new("green", rng());

        task.recover_after_fail(&fixture.ctx(&locator)).expect("recover");

        let calls = fixture.robot.calls();
        assert_eq!(calls.last(), Some(&RobotCall::Gripper { angle: 1.0 }));
        assert!(calls.contains(&RobotCall::MoveXy { x: 0.0, y: 0.7 }));
    }

    #[test]
    fn test_grasp_reset_moves_block_off_center() {
        let fixture = Fixture::new();
        let locator = ScriptedLocator::default().answer("green", &[Some([0.5, 0.5])]);
        let mut task = GraspTask::new("green", rng()).with_order_delay(Duration::ZERO);

        task.reset_task(&fixture.ctx(&locator)).expect("reset");

        let placed: Vec<[f64; 2]> = fixture
            .robot
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                RobotCall::MoveXy { x, y } => Some([x, y]),
                _ => None,
            })
            .collect();
        // object, target, ready pose
        assert_eq!(placed.len(), 3);
        assert_eq!(placed[0], [0.5, 0.5]);
        assert!(motion::distance(placed[1], [0.5, 0.5]) > GRASP_RESET_MARGIN);
        assert_eq!(placed[2], [0.0, 0.7]);
    }

    #[test]
    fn test_stack_rejects_mismatched_heights() {
        let err = StackTask::new(vec!["red".into(), "green".into()], vec![0.1], rng())
            .err()
            .expect("mismatch");
        assert!(matches!(err, TaskError::Misconfigured(_)));
    }

    #[test]
    fn test_stack_success_when_blocks_hidden() {
        let fixture = Fixture::new();
        let locator = ScriptedLocator::default()
            .answer("red", &[Some([0.2, 0.2]), Some([0.2, 0.2]), Some([0.5, 0.5]), None])
            .answer("green", &[Some([0.8, 0.8])]);
        let mut task = StackTask::new(vec!["red".into(), "green".into()], vec![0.25, 0.25], rng())
            .expect("task")
            .with_order_delay(Duration::ZERO);

        let outcome = task.perform_task(&fixture.ctx(&locator)).expect("perform");

        assert_eq!(outcome, TaskOutcome::Succeeded);
        let calls = fixture.robot.calls();
        // first block goes to the stack position, second onto the first
        assert!(calls.contains(&RobotCall::MoveXy { x: 0.2, y: 0.2 }));
        assert!(calls.contains(&RobotCall::MoveXy { x: 0.8, y: 0.8 }));
        assert!(calls.contains(&RobotCall::MoveZ { z: 0.25 }));
    }

    #[test]
    fn test_stack_fails_when_all_blocks_visible() {
        let fixture = Fixture::new();
        let locator = ScriptedLocator::default()
            .answer("red", &[Some([0.5, 0.5])])
            .answer("green", &[Some([0.8, 0.8])]);
        let mut task = StackTask::new(vec!["red".into(), "green".into()], vec![0.25, 0.25], rng())
            .expect("task")
            .with_order_delay(Duration::ZERO);

        let outcome = task.perform_task(&fixture.ctx(&locator)).expect("perform");

        assert!(outcome.is_failed());
    }

    #[test]
    fn test_stack_missing_block_fails_without_orders() {
        let fixture = Fixture::new();
        let locator = ScriptedLocator::default()
            .answer("red", &[Some([0.5, 0.5])])
            .answer("green", &[None]);
        let mut task = StackTask::new(vec!["green".into(), "red".into()], vec![0.25, 0.25], rng())
            .expect("task");

        let outcome = task.perform_task(&fixture.ctx(&locator)).expect("perform");

        assert!(outcome.is_failed());
        assert!(fixture.robot.calls().is_empty());
    }

    #[test]
    fn test_stack_reset_and_recover() {
        let fixture = Fixture::new();
        let locator = ScriptedLocator::default();
        let mut task = StackTask::new(vec!["red".into(), "green".into()], vec![0.25, 0.25], rng())
            .expect("task")
            .with_order_delay(Duration::ZERO)
            .with_position_bank(vec![[0.2, 0.2], [0.8, 0.8]], 0.1);

        task.reset_task(&fixture.ctx(&locator)).expect("reset");
        let calls = fixture.robot.calls();
        assert!(calls.contains(&RobotCall::MoveXy { x: 0.2, y: 0.2 }));
        assert!(calls.contains(&RobotCall::MoveXy { x: 0.8, y: 0.8 }));

        task.recover_after_fail(&fixture.ctx(&locator)).expect("recover");
        assert_eq!(fixture.robot.calls().last(), Some(&RobotCall::MoveZ { z: 1.0 }));
    }

    #[test]
    fn test_shuffle_reports_missing_blocks() {
        let fixture = Fixture::new();
        let locator = ScriptedLocator::default()
            .answer("red", &[Some([0.5, 0.5])])
            .answer("green", &[None]);
        let mut task = ShuffleTask::new(vec!["red".into(), "green".into()], rng())
            .with_position_bank(vec![[0.2, 0.2], [0.8, 0.8]], 0.1)
            .with_order_delay(Duration::ZERO);

        let outcome = task.perform_task(&fixture.ctx(&locator)).expect("perform");

        assert_eq!(outcome, TaskOutcome::failed("not visible: green"));
        assert!(fixture
            .robot
            .calls()
            .contains(&RobotCall::MoveXy { x: 0.5, y: 0.5 }));
    }

    #[test]
    fn test_shuffle_recovery_raises_open_gripper() {
        let fixture = Fixture::new();
        let locator = ScriptedLocator::default();
        let mut task = ShuffleTask::new(vec!["red".into()], rng()).with_order_delay(Duration::ZERO);

        task.recover_after_fail(&fixture.ctx(&locator)).expect("recover");

        assert_eq!(
            fixture.robot.calls(),
            vec![RobotCall::Gripper { angle: 1.0 }, RobotCall::MoveZ { z: 1.0 }]
        );
    }

    #[test]
    fn test_abort_is_distinguished() {
        assert!(TaskError::Order(OrderError::Aborted).is_abort());
        assert!(!TaskError::Fault("boom".into()).is_abort());
        assert!(!TaskError::Order(OrderError::InvalidOrder {
            kind: OrderKind::MoveZ,
            reason: "nan".into()
        })
        .is_abort());
    }

    #[test]
    fn test_strategy_for_config() {
        let config = ExperimentConfig::default().with_task(TaskKind::Shuffle);
        let strategy = strategy_for(&config, Some(1)).expect("strategy");
        assert_eq!(strategy.name(), "shuffle");

        let config = ExperimentConfig::default().with_task(TaskKind::Stack);
        assert!(matches!(
            strategy_for(&config, Some(1)).err(),
            Some(TaskError::Misconfigured(_))
        ));
    }
}
