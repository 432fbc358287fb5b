//! Robot transport boundary.
//!
//! The orchestration core talks to the gripper robot exclusively through the
//! [`RobotTransport`] trait. Every call is a single, blocking, stateless
//! request that may fail; callers must tolerate a [`TransportError`] without
//! crashing.
//!
//! Two transports are provided:
//!
//! - [`HttpRobot`]: the CloudGripper HTTP API
//! - [`SimulatedRobot`]: an in-process robot with synthetic frames and
//!   optional failure injection, used by `--simulate` and the tests

pub mod http;
pub mod sim;

use serde::{Deserialize, Serialize};

use crate::error::TransportError;

pub use http::HttpRobot;
pub use sim::{RobotCall, SimulatedRobot};

/// A decoded RGB camera frame.
pub type Frame = image::RgbImage;

/// A camera frame together with the robot-side capture timestamp.
#[derive(Debug, Clone)]
pub struct TimedFrame {
    /// The decoded image.
    pub frame: Frame,
    /// Seconds since the epoch, as reported by the robot.
    pub timestamp: f64,
}

/// One telemetry sample read from the robot's state endpoint.
///
/// Appended verbatim to an episode's `states.json`; never mutated after
/// append. Fields the robot reports beyond the known ones are preserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotStateSnapshot {
    pub x_norm: f64,
    pub y_norm: f64,
    pub z_norm: f64,
    pub rotation: f64,
    pub claw_norm: f64,
    #[serde(default)]
    pub z_current: f64,
    #[serde(default)]
    pub rotation_current: f64,
    #[serde(default)]
    pub claw_current: f64,
    /// Capture timestamp, seconds since the epoch.
    #[serde(rename = "time", default)]
    pub timestamp: f64,
    /// Any additional telemetry the robot reports.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RobotStateSnapshot {
    /// Creates a snapshot with zero currents and no extra fields.
    pub fn at_pose(x: f64, y: f64, z: f64, rotation: f64, claw: f64, timestamp: f64) -> Self {
        Self {
            x_norm: x,
            y_norm: y,
            z_norm: z,
            rotation,
            claw_norm: claw,
            z_current: 0.0,
            rotation_current: 0.0,
            claw_current: 0.0,
            timestamp,
            extra: serde_json::Map::new(),
        }
    }
}

/// The black-box robot API consumed by the orchestration core.
///
/// Command calls return the robot-side dispatch timestamp (seconds since
/// the epoch). Positions are normalized to `[0, 1]`.
pub trait RobotTransport: Send + Sync {
    /// Robot identifier, e.g. `robot23`.
    fn name(&self) -> &str;

    fn move_xy(&self, x: f64, y: f64) -> Result<f64, TransportError>;

    fn move_z(&self, z: f64) -> Result<f64, TransportError>;

    /// Moves the gripper to `angle`; `1.0` is fully open, `0.0` closed.
    fn move_gripper(&self, angle: f64) -> Result<f64, TransportError>;

    fn rotate(&self, angle: i32) -> Result<f64, TransportError>;

    fn get_state(&self) -> Result<RobotStateSnapshot, TransportError>;

    fn get_top_image(&self) -> Result<TimedFrame, TransportError>;

    fn get_bottom_image(&self) -> Result<TimedFrame, TransportError>;

    fn gripper_open(&self) -> Result<f64, TransportError> {
        self.move_gripper(1.0)
    }

    fn gripper_close(&self) -> Result<f64, TransportError> {
        self.move_gripper(0.0)
    }
}

/// Returns the current wall-clock time as seconds since the epoch.
pub fn now_timestamp() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_serializes_time_field() {
        let snapshot = RobotStateSnapshot::at_pose(0.1, 0.2, 0.3, 0.0, 1.0, 42.5);
        let json = serde_json::to_value(&snapshot).expect("serialize");

        assert_eq!(json["time"], 42.5);
        assert_eq!(json["x_norm"], 0.1);
        assert!(json.get("timestamp").is_none());
    }

    #[test]
    fn test_snapshot_preserves_unknown_fields() {
        let raw = serde_json::json!({
            "x_norm": 0.5,
            "y_norm": 0.5,
            "z_norm": 1.0,
            "rotation": 0,
            "claw_norm": 0.3,
            "x_current": 12,
        });

        let snapshot: RobotStateSnapshot = serde_json::from_value(raw).expect("deserialize");

        assert_eq!(snapshot.claw_norm, 0.3);
        assert_eq!(snapshot.z_current, 0.0);
        assert_eq!(snapshot.extra.get("x_current"), Some(&serde_json::json!(12)));
    }

    #[test]
    fn test_now_timestamp_is_recent() {
        let ts = now_timestamp();
        // 2020-01-01T00:00:00Z
        assert!(ts > 1_577_836_800.0);
    }
}
