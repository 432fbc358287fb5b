//! In-process simulated robot.
//!
//! Tracks a normalized pose, renders flat synthetic camera frames and records
//! every command it receives. Faults can be injected either deterministically
//! (`fail_next_commands`) or randomly (`with_failure_rate`), mirroring the
//! request failures the real API produces.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::TransportError;

use super::{now_timestamp, Frame, RobotStateSnapshot, RobotTransport, TimedFrame};

/// Default simulated camera resolution.
const DEFAULT_FRAME_SIZE: (u32, u32) = (64, 48);

/// A command received by the simulated robot.
#[derive(Debug, Clone, PartialEq)]
pub enum RobotCall {
    MoveXy { x: f64, y: f64 },
    MoveZ { z: f64 },
    Gripper { angle: f64 },
    Rotate { angle: i32 },
}

#[derive(Debug, Clone)]
struct Pose {
    x: f64,
    y: f64,
    z: f64,
    rotation: i32,
    claw: f64,
}

/// Simulated gripper robot.
pub struct SimulatedRobot {
    name: String,
    frame_size: (u32, u32),
    pose: Mutex<Pose>,
    calls: Mutex<Vec<RobotCall>>,
    failing_commands: AtomicUsize,
    fail_after: Mutex<Option<usize>>,
    images_unavailable: AtomicBool,
    failure_rate: f64,
    rng: Mutex<StdRng>,
    frames_served: AtomicU64,
}

impl SimulatedRobot {
    /// Creates a simulated robot resting at the top-center of the workspace.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            frame_size: DEFAULT_FRAME_SIZE,
            pose: Mutex::new(Pose {
                x: 0.5,
                y: 0.5,
                z: 1.0,
                rotation: 0,
                claw: 1.0,
            }),
            calls: Mutex::new(Vec::new()),
            failing_commands: AtomicUsize::new(0),
            fail_after: Mutex::new(None),
            images_unavailable: AtomicBool::new(false),
            failure_rate: 0.0,
            rng: Mutex::new(StdRng::seed_from_u64(0)),
            frames_served: AtomicU64::new(0),
        }
    }

    /// Sets the synthetic camera resolution.
    pub fn with_frame_size(mut self, width: u32, height: u32) -> Self {
        self.frame_size = (width.max(1), height.max(1));
        self
    }

    /// Makes each call fail with probability `rate`, seeded for reproducibility.
    pub fn with_failure_rate(mut self, rate: f64, seed: u64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Makes the next `count` command calls fail.
    pub fn fail_next_commands(&self, count: usize) {
        self.failing_commands.store(count, Ordering::SeqCst);
    }

    /// Lets `successes` more commands through, then fails exactly one.
    pub fn fail_after(&self, successes: usize) {
        *self
            .fail_after
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(successes);
    }

    /// Makes image reads fail until cleared.
    pub fn set_images_unavailable(&self, unavailable: bool) {
        self.images_unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Returns every command received so far, in order.
    pub fn calls(&self) -> Vec<RobotCall> {
        self.calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Returns the gripper angles received so far, in order.
    pub fn gripper_angles(&self) -> Vec<f64> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RobotCall::Gripper { angle } => Some(angle),
                _ => None,
            })
            .collect()
    }

    fn random_failure(&self) -> bool {
        if self.failure_rate <= 0.0 {
            return false;
        }
        let mut rng = self
            .rng
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        rng.random::<f64>() < self.failure_rate
    }

    fn dispatch(&self, call: RobotCall) -> Result<f64, TransportError> {
        let injected = self
            .failing_commands
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let scheduled = {
            let mut countdown = self
                .fail_after
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match *countdown {
                Some(0) => {
                    *countdown = None;
                    true
                }
                Some(n) => {
                    *countdown = Some(n - 1);
                    false
                }
                None => false,
            }
        };
        if injected || scheduled || self.random_failure() {
            return Err(TransportError::Simulated(format!("command {call:?} dropped")));
        }

        {
            let mut pose = self
                .pose
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match &call {
                RobotCall::MoveXy { x, y } => {
                    pose.x = *x;
                    pose.y = *y;
                }
                RobotCall::MoveZ { z } => pose.z = *z,
                RobotCall::Gripper { angle } => pose.claw = *angle,
                RobotCall::Rotate { angle } => pose.rotation = *angle,
            }
        }

        self.calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(call);
        Ok(now_timestamp())
    }

    fn render(&self, shade: u8) -> Result<TimedFrame, TransportError> {
        if self.images_unavailable.load(Ordering::SeqCst) || self.random_failure() {
            return Err(TransportError::Simulated("image not available".to_string()));
        }
        let served = self.frames_served.fetch_add(1, Ordering::SeqCst);
        let (width, height) = self.frame_size;
        let tint = (served % 200) as u8;
        let frame = Frame::from_pixel(width, height, image::Rgb([shade, tint, shade]));
        Ok(TimedFrame {
            frame,
            timestamp: now_timestamp(),
        })
    }
}

impl RobotTransport for SimulatedRobot {
    fn name(&self) -> &str {
        &self.name
    }

    fn move_xy(&self, x: f64, y: f64) -> Result<f64, TransportError> {
        self.dispatch(RobotCall::MoveXy { x, y })
    }

    fn move_z(&self, z: f64) -> Result<f64, TransportError> {
        self.dispatch(RobotCall::MoveZ { z })
    }

    fn move_gripper(&self, angle: f64) -> Result<f64, TransportError> {
        self.dispatch(RobotCall::Gripper { angle })
    }

    fn rotate(&self, angle: i32) -> Result<f64, TransportError> {
        self.dispatch(RobotCall::Rotate { angle })
    }

    fn get_state(&self) -> Result<RobotStateSnapshot, TransportError> {
        if self.random_failure() {
            return Err(TransportError::Simulated("state not available".to_string()));
        }
        let pose = self
            .pose
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        Ok(RobotStateSnapshot::at_pose(
            pose.x,
            pose.y,
            pose.z,
            f64::from(pose.rotation),
            pose.claw,
            now_timestamp(),
        ))
    }

    fn get_top_image(&self) -> Result<TimedFrame, TransportError> {
        self.render(160)
    }

    fn get_bottom_image(&self) -> Result<TimedFrame, TransportError> {
        self.render(90)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commands_update_state() {
        let robot = SimulatedRobot::new("sim");
        robot.move_xy(0.2, 0.7).expect("move");
        robot.move_z(0.1).expect("move z");
        robot.gripper_close().expect("close");

        let state = robot.get_state().expect("state");
        assert_eq!(state.x_norm, 0.2);
        assert_eq!(state.y_norm, 0.7);
        assert_eq!(state.z_norm, 0.1);
        assert_eq!(state.claw_norm, 0.0);
        assert_eq!(robot.calls().len(), 3);
    }

    #[test]
    fn test_fail_next_commands() {
        let robot = SimulatedRobot::new("sim");
        robot.fail_next_commands(2);

        assert!(robot.move_z(0.5).is_err());
        assert!(robot.move_z(0.5).is_err());
        assert!(robot.move_z(0.5).is_ok());
        assert_eq!(robot.calls(), vec![RobotCall::MoveZ { z: 0.5 }]);
    }

    #[test]
    fn test_fail_after() {
        let robot = SimulatedRobot::new("sim");
        robot.fail_after(1);

        assert!(robot.move_z(0.1).is_ok());
        assert!(robot.move_z(0.2).is_err());
        assert!(robot.move_z(0.3).is_ok());
        assert_eq!(robot.calls().len(), 2);
    }

    #[test]
    fn test_images_unavailable() {
        let robot = SimulatedRobot::new("sim").with_frame_size(8, 6);
        let frame = robot.get_top_image().expect("frame");
        assert_eq!(frame.frame.dimensions(), (8, 6));

        robot.set_images_unavailable(true);
        assert!(robot.get_bottom_image().is_err());
    }

    #[test]
    fn test_full_failure_rate_fails_everything() {
        let robot = SimulatedRobot::new("sim").with_failure_rate(1.0, 7);
        assert!(robot.move_xy(0.1, 0.1).is_err());
        assert!(robot.get_state().is_err());
        assert!(robot.calls().is_empty());
    }
}
