//! Robot orders and their execution.
//!
//! An [`Order`] is one normalized motion or gripper command. The
//! [`OrderExecutor`] dispatches it to the robot transport, and persists it to
//! the current output directory's `orders.json` only when the dispatch
//! succeeded. `orders.json` therefore never contains an order the robot did
//! not receive.
//!
//! A `GRIPPER_CLOSE` without an explicit angle is a compliant close: a short
//! ramp of decreasing gripper angles, each dispatched and persisted as its own
//! order.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{StorageError, TransportError};
use crate::orchestrator::ErrorFlag;
use crate::robot::RobotTransport;
use crate::storage::JsonArrayLog;

/// First angle of the compliant closing ramp.
pub const RAMP_START: f64 = 0.30;

/// Last angle of the compliant closing ramp.
pub const RAMP_END: f64 = 0.20;

/// Angle decrement between ramp steps.
pub const RAMP_STEP: f64 = 0.02;

/// Default pause between ramp steps.
pub const DEFAULT_RAMP_STEP_DELAY: Duration = Duration::from_millis(50);

/// Errors that abort order execution.
///
/// Transport failures are not errors at this level: they are logged and the
/// order is dropped.
#[derive(Debug, Error)]
pub enum OrderError {
    /// The order is missing parameters or carries non-finite values.
    #[error("Invalid {kind} order: {reason}")]
    InvalidOrder { kind: OrderKind, reason: String },

    /// A dispatched order could not be persisted.
    #[error("Failed to persist order: {0}")]
    Storage(#[from] StorageError),

    /// The run was aborted while orders were still queued.
    #[error("Order queue aborted")]
    Aborted,
}

/// The command family of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderKind {
    MoveXy,
    MoveZ,
    GripperOpen,
    GripperClose,
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::MoveXy => "MOVE_XY",
            Self::MoveZ => "MOVE_Z",
            Self::GripperOpen => "GRIPPER_OPEN",
            Self::GripperClose => "GRIPPER_CLOSE",
        };
        f.write_str(name)
    }
}

/// A dispatched order, as persisted to `orders.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    #[serde(rename = "order_type")]
    pub kind: OrderKind,
    #[serde(rename = "order_value")]
    pub params: Vec<f64>,
    /// Robot-side dispatch timestamp, seconds since the epoch.
    #[serde(rename = "time")]
    pub issued_at: f64,
}

/// An order that has not been dispatched yet.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderIntent {
    pub kind: OrderKind,
    pub params: Vec<f64>,
}

impl OrderIntent {
    pub fn new(kind: OrderKind, params: Vec<f64>) -> Self {
        Self { kind, params }
    }

    pub fn move_xy(x: f64, y: f64) -> Self {
        Self::new(OrderKind::MoveXy, vec![x, y])
    }

    pub fn move_to(position: [f64; 2]) -> Self {
        Self::move_xy(position[0], position[1])
    }

    pub fn move_z(z: f64) -> Self {
        Self::new(OrderKind::MoveZ, vec![z])
    }

    pub fn gripper_open() -> Self {
        Self::new(OrderKind::GripperOpen, Vec::new())
    }

    /// Compliant close through the ramp.
    pub fn gripper_close() -> Self {
        Self::new(OrderKind::GripperClose, Vec::new())
    }

    /// Close to an explicit angle in one command.
    pub fn gripper_to(angle: f64) -> Self {
        Self::new(OrderKind::GripperClose, vec![angle])
    }
}

/// Returns the compliant closing ramp angles, `0.30` down to `0.20`.
pub fn closing_ramp() -> Vec<f64> {
    let steps = ((RAMP_START - RAMP_END) / RAMP_STEP).round() as u32;
    (0..=steps)
        .map(|i| {
            let angle = RAMP_START - f64::from(i) * RAMP_STEP;
            (angle * 100.0).round() / 100.0
        })
        .collect()
}

/// Dispatches orders to the robot and persists the ones that were sent.
pub struct OrderExecutor {
    robot: Arc<dyn RobotTransport>,
    output_dir: Mutex<Option<PathBuf>>,
    settle: Duration,
    ramp_step_delay: Duration,
    abort: Option<ErrorFlag>,
}

impl OrderExecutor {
    /// Creates an executor that waits `settle` after every dispatched order.
    pub fn new(robot: Arc<dyn RobotTransport>, settle: Duration) -> Self {
        Self {
            robot,
            output_dir: Mutex::new(None),
            settle,
            ramp_step_delay: DEFAULT_RAMP_STEP_DELAY,
            abort: None,
        }
    }

    /// Sets the pause between closing-ramp steps.
    pub fn with_ramp_step_delay(mut self, delay: Duration) -> Self {
        self.ramp_step_delay = delay;
        self
    }

    /// Makes `queue` stop between orders once `flag` is raised.
    pub fn with_abort_flag(mut self, flag: ErrorFlag) -> Self {
        self.abort = Some(flag);
        self
    }

    /// Sets where dispatched orders are persisted. `None` disables persistence.
    pub fn set_output_dir(&self, dir: Option<PathBuf>) {
        *self.output_dir.lock().unwrap_or_else(PoisonError::into_inner) = dir;
    }

    pub fn output_dir(&self) -> Option<PathBuf> {
        self.output_dir
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn robot(&self) -> &Arc<dyn RobotTransport> {
        &self.robot
    }

    /// Executes one order.
    ///
    /// Returns the dispatch timestamp, or `None` if the transport rejected the
    /// order. Rejected orders are logged and not persisted.
    ///
    /// # Errors
    ///
    /// Returns `OrderError::InvalidOrder` for missing or non-finite parameters
    /// and `OrderError::Storage` if a dispatched order cannot be persisted.
    pub fn execute(&self, intent: &OrderIntent) -> Result<Option<f64>, OrderError> {
        let kind = intent.kind;
        let params = normalize_params(intent)?;

        if kind == OrderKind::GripperClose && params.is_empty() {
            let first = self.run_closing_ramp()?;
            thread::sleep(self.settle);
            return Ok(first);
        }

        let result = match kind {
            OrderKind::MoveXy => self.robot.move_xy(params[0], params[1]),
            OrderKind::MoveZ => self.robot.move_z(params[0]),
            OrderKind::GripperOpen => self.robot.gripper_open(),
            OrderKind::GripperClose => self.robot.move_gripper(params[0]),
        };

        let issued_at = match self.dispatched(kind, &params, result) {
            Some(ts) => ts,
            None => return Ok(None),
        };
        self.persist(Order {
            kind,
            params,
            issued_at,
        })?;
        thread::sleep(self.settle);
        Ok(Some(issued_at))
    }

    /// Executes `orders` one after another, sleeping `delay` after each.
    ///
    /// Returns the number of orders the robot accepted.
    pub fn queue(&self, orders: &[OrderIntent], delay: Duration) -> Result<usize, OrderError> {
        let mut dispatched = 0;
        for intent in orders {
            if self.abort.as_ref().is_some_and(ErrorFlag::is_raised) {
                return Err(OrderError::Aborted);
            }
            if self.execute(intent)?.is_some() {
                dispatched += 1;
            }
            thread::sleep(delay);
        }
        Ok(dispatched)
    }

    fn run_closing_ramp(&self) -> Result<Option<f64>, OrderError> {
        let mut first = None;
        for angle in closing_ramp() {
            let result = self.robot.move_gripper(angle);
            let Some(issued_at) = self.dispatched(OrderKind::GripperClose, &[angle], result)
            else {
                warn!(angle, "Closing ramp interrupted");
                break;
            };
            self.persist(Order {
                kind: OrderKind::GripperClose,
                params: vec![angle],
                issued_at,
            })?;
            first.get_or_insert(issued_at);
            thread::sleep(self.ramp_step_delay);
        }
        Ok(first)
    }

    fn dispatched(
        &self,
        kind: OrderKind,
        params: &[f64],
        result: Result<f64, TransportError>,
    ) -> Option<f64> {
        match result {
            Ok(ts) => {
                debug!(robot = %self.robot.name(), order = %kind, params = ?params, "Order dispatched");
                Some(ts)
            }
            Err(e) => {
                warn!(robot = %self.robot.name(), order = %kind, params = ?params, error = %e, "Order failed, not persisted");
                None
            }
        }
    }

    fn persist(&self, order: Order) -> Result<(), OrderError> {
        if let Some(dir) = self.output_dir() {
            JsonArrayLog::orders_in(&dir).append(&order)?;
        }
        Ok(())
    }
}

fn normalize_params(intent: &OrderIntent) -> Result<Vec<f64>, OrderError> {
    let required = match intent.kind {
        OrderKind::MoveXy => 2,
        OrderKind::MoveZ => 1,
        OrderKind::GripperOpen | OrderKind::GripperClose => 0,
    };
    if intent.params.len() < required {
        return Err(OrderError::InvalidOrder {
            kind: intent.kind,
            reason: format!("expected {required} parameters, got {}", intent.params.len()),
        });
    }
    if intent.params.iter().any(|p| !p.is_finite()) {
        return Err(OrderError::InvalidOrder {
            kind: intent.kind,
            reason: "parameters must be finite".to_string(),
        });
    }

    Ok(match intent.kind {
        OrderKind::MoveXy | OrderKind::MoveZ => intent.params[..required]
            .iter()
            .map(|p| p.clamp(0.0, 1.0))
            .collect(),
        OrderKind::GripperOpen => Vec::new(),
        OrderKind::GripperClose => intent.params.iter().take(1).copied().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::robot::{RobotCall, SimulatedRobot};
    use tempfile::TempDir;

    fn executor(robot: Arc<SimulatedRobot>, dir: &TempDir) -> OrderExecutor {
        let executor = OrderExecutor::new(robot, Duration::ZERO).with_ramp_step_delay(Duration::ZERO);
        executor.set_output_dir(Some(dir.path().to_path_buf()));
        executor
    }

    fn persisted(dir: &TempDir) -> Vec<Order> {
        JsonArrayLog::orders_in(dir.path())
            .read_all()
            .expect("read orders")
    }

    #[test]
    fn test_closing_ramp_values() {
        assert_eq!(closing_ramp(), vec![0.30, 0.28, 0.26, 0.24, 0.22, 0.20]);
    }

    #[test]
    fn test_empty_close_runs_ramp() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let robot = Arc::new(SimulatedRobot::new("sim"));
        let executor = executor(robot.clone(), &temp_dir);

        let ts = executor.execute(&OrderIntent::gripper_close()).expect("execute");

        assert!(ts.is_some());
        assert_eq!(robot.gripper_angles(), closing_ramp());
        let orders = persisted(&temp_dir);
        assert_eq!(orders.len(), 6);
        assert!(orders.iter().all(|o| o.kind == OrderKind::GripperClose));
        let angles: Vec<f64> = orders.iter().map(|o| o.params[0]).collect();
        assert_eq!(angles, closing_ramp());
    }

    #[test]
    fn test_explicit_close_is_single_command() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let robot = Arc::new(SimulatedRobot::new("sim"));
        let executor = executor(robot.clone(), &temp_dir);

        executor.execute(&OrderIntent::gripper_to(0.4)).expect("execute");

        assert_eq!(robot.gripper_angles(), vec![0.4]);
        assert_eq!(persisted(&temp_dir).len(), 1);
    }

    #[test]
    fn test_params_are_clamped_before_dispatch() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let robot = Arc::new(SimulatedRobot::new("sim"));
        let executor = executor(robot.clone(), &temp_dir);

        executor.execute(&OrderIntent::move_xy(1.4, -0.2)).expect("execute");
        executor.execute(&OrderIntent::move_z(2.0)).expect("execute");

        assert_eq!(
            robot.calls(),
            vec![RobotCall::MoveXy { x: 1.0, y: 0.0 }, RobotCall::MoveZ { z: 1.0 }]
        );
        let orders = persisted(&temp_dir);
        assert_eq!(orders[0].params, vec![1.0, 0.0]);
        assert_eq!(orders[1].params, vec![1.0]);
    }

    #[test]
    fn test_failed_dispatch_not_persisted() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let robot = Arc::new(SimulatedRobot::new("sim"));
        let executor = executor(robot.clone(), &temp_dir);

        robot.fail_next_commands(1);
        let dispatched = executor
            .queue(
                &[
                    OrderIntent::move_z(0.5),
                    OrderIntent::move_xy(0.2, 0.3),
                    OrderIntent::gripper_open(),
                ],
                Duration::ZERO,
            )
            .expect("queue");

        assert_eq!(dispatched, 2);
        let orders = persisted(&temp_dir);
        assert_eq!(orders.len(), robot.calls().len());
        assert_eq!(orders[0].kind, OrderKind::MoveXy);
        assert_eq!(orders[1].kind, OrderKind::GripperOpen);
    }

    #[test]
    fn test_ramp_stops_at_first_failure() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let robot = Arc::new(SimulatedRobot::new("sim"));
        let executor = executor(robot.clone(), &temp_dir);

        robot.fail_after(2);
        let ts = executor.execute(&OrderIntent::gripper_close()).expect("execute");

        assert!(ts.is_some());
        assert_eq!(robot.gripper_angles(), vec![0.30, 0.28]);
        let angles: Vec<f64> = persisted(&temp_dir).iter().map(|o| o.params[0]).collect();
        assert_eq!(angles, vec![0.30, 0.28]);
    }

    #[test]
    fn test_missing_params_rejected() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let robot = Arc::new(SimulatedRobot::new("sim"));
        let executor = executor(robot.clone(), &temp_dir);

        let err = executor
            .execute(&OrderIntent::new(OrderKind::MoveXy, vec![0.5]))
            .expect_err("should fail");

        assert!(matches!(err, OrderError::InvalidOrder { .. }));
        assert!(robot.calls().is_empty());
        assert!(persisted(&temp_dir).is_empty());
    }

    #[test]
    fn test_no_output_dir_skips_persistence() {
        let robot = Arc::new(SimulatedRobot::new("sim"));
        let executor = OrderExecutor::new(robot.clone(), Duration::ZERO);

        executor.execute(&OrderIntent::move_z(0.3)).expect("execute");

        assert_eq!(robot.calls().len(), 1);
        assert!(executor.output_dir().is_none());
    }

    #[test]
    fn test_queue_aborts_when_flag_raised() {
        let robot = Arc::new(SimulatedRobot::new("sim"));
        let flag = ErrorFlag::new();
        let executor = OrderExecutor::new(robot.clone(), Duration::ZERO).with_abort_flag(flag.clone());

        flag.raise("test");
        let result = executor.queue(&[OrderIntent::move_z(0.3)], Duration::ZERO);

        assert!(matches!(result, Err(OrderError::Aborted)));
        assert!(robot.calls().is_empty());
    }

    #[test]
    fn test_order_json_shape() {
        let order = Order {
            kind: OrderKind::MoveXy,
            params: vec![0.1, 0.2],
            issued_at: 12.5,
        };
        let json = serde_json::to_value(&order).expect("serialize");
        assert_eq!(json["order_type"], "MOVE_XY");
        assert_eq!(json["order_value"], serde_json::json!([0.1, 0.2]));
        assert_eq!(json["time"], 12.5);
    }
}
