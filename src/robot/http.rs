//! CloudGripper HTTP transport.
//!
//! Thin blocking wrapper over the robot's REST API. Requests are issued with
//! an async `reqwest` client driven to completion on a shared tokio runtime
//! handle, so the transport can be called from plain OS threads.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::runtime::Handle;
use tracing::debug;

use crate::error::TransportError;

use super::{RobotStateSnapshot, RobotTransport, TimedFrame};

/// Default API endpoint template; `{robot}` is replaced by the robot id.
pub const DEFAULT_API_BASE: &str = "https://cloudgripper.eecs.kth.se:8443/{robot}/api/v1.1/robot";

/// Default request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
struct CommandResponse {
    time: f64,
}

#[derive(Debug, Deserialize)]
struct StateResponse {
    state: RobotStateSnapshot,
    timestamp: f64,
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    data: String,
    time: f64,
}

/// HTTP client for one CloudGripper robot.
pub struct HttpRobot {
    /// Robot identifier, e.g. `robot23`.
    name: String,
    /// Resolved API base URL for this robot.
    base_api: String,
    /// API token sent as the `apiKey` header.
    token: String,
    client: Client,
    runtime: Handle,
}

impl HttpRobot {
    /// Creates a transport for `name`.
    ///
    /// # Arguments
    ///
    /// * `name` - Robot identifier substituted into `api_base`
    /// * `token` - API token (normally from `ROBOT_TOKEN`)
    /// * `api_base` - URL template containing `{robot}`
    /// * `timeout` - Per-request timeout
    /// * `runtime` - Handle of a tokio runtime that is not driving the caller
    ///
    /// # Errors
    ///
    /// Returns `TransportError::UnknownRobot` for an empty robot id and
    /// `TransportError::RequestFailed` if the HTTP client cannot be built.
    pub fn new(
        name: impl Into<String>,
        token: impl Into<String>,
        api_base: &str,
        timeout: Duration,
        runtime: Handle,
    ) -> Result<Self, TransportError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(TransportError::UnknownRobot(name));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::RequestFailed(format!("failed to build client: {e}")))?;

        Ok(Self {
            base_api: api_base.replace("{robot}", &name),
            name,
            token: token.into(),
            client,
            runtime,
        })
    }

    /// Returns the resolved API base URL.
    pub fn base_api(&self) -> &str {
        &self.base_api
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, TransportError> {
        let url = format!("{}{}", self.base_api, path);
        debug!(robot = %self.name, url = %url, "Robot API request");

        self.runtime.block_on(async {
            let response = self
                .client
                .get(&url)
                .header("apiKey", &self.token)
                .send()
                .await
                .map_err(|e| TransportError::RequestFailed(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                return Err(TransportError::ApiError {
                    code: status.as_u16(),
                    message,
                });
            }

            response
                .json::<T>()
                .await
                .map_err(|e| TransportError::MalformedResponse(e.to_string()))
        })
    }

    fn command(&self, path: &str) -> Result<f64, TransportError> {
        self.get_json::<CommandResponse>(path).map(|r| r.time)
    }

    fn image(&self, path: &str) -> Result<TimedFrame, TransportError> {
        let response: ImageResponse = self.get_json(path)?;
        Ok(TimedFrame {
            frame: decode_frame(&response.data)?,
            timestamp: response.time,
        })
    }
}

/// Decodes a base64-encoded JPEG/PNG payload into an RGB frame.
pub fn decode_frame(data: &str) -> Result<super::Frame, TransportError> {
    let bytes = BASE64
        .decode(data.trim())
        .map_err(|e| TransportError::ImageDecode(e.to_string()))?;
    let image =
        image::load_from_memory(&bytes).map_err(|e| TransportError::ImageDecode(e.to_string()))?;
    Ok(image.to_rgb8())
}

impl RobotTransport for HttpRobot {
    fn name(&self) -> &str {
        &self.name
    }

    fn move_xy(&self, x: f64, y: f64) -> Result<f64, TransportError> {
        self.command(&format!("/gcode/{x}/{y}"))
    }

    fn move_z(&self, z: f64) -> Result<f64, TransportError> {
        self.command(&format!("/up_down/{z}"))
    }

    fn move_gripper(&self, angle: f64) -> Result<f64, TransportError> {
        self.command(&format!("/grip/{angle}"))
    }

    fn rotate(&self, angle: i32) -> Result<f64, TransportError> {
        self.command(&format!("/rotate/{angle}"))
    }

    fn get_state(&self) -> Result<RobotStateSnapshot, TransportError> {
        let response: StateResponse = self.get_json("/getState")?;
        let mut state = response.state;
        state.timestamp = response.timestamp;
        Ok(state)
    }

    fn get_top_image(&self) -> Result<TimedFrame, TransportError> {
        self.image("/getImageTop")
    }

    fn get_bottom_image(&self) -> Result<TimedFrame, TransportError> {
        self.image("/getImageBase")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime")
    }

    #[test]
    fn test_base_api_substitutes_robot() {
        let rt = runtime();
        let robot = HttpRobot::new(
            "robot23",
            "token",
            DEFAULT_API_BASE,
            Duration::from_secs(1),
            rt.handle().clone(),
        )
        .expect("robot");

        assert_eq!(
            robot.base_api(),
            "https://cloudgripper.eecs.kth.se:8443/robot23/api/v1.1/robot"
        );
        assert_eq!(robot.name(), "robot23");
    }

    #[test]
    fn test_empty_robot_id_rejected() {
        let rt = runtime();
        let result = HttpRobot::new(
            "  ",
            "token",
            DEFAULT_API_BASE,
            Duration::from_secs(1),
            rt.handle().clone(),
        );
        assert!(matches!(result, Err(TransportError::UnknownRobot(_))));
    }

    #[test]
    fn test_decode_frame_roundtrips_png() {
        let frame = image::RgbImage::from_pixel(4, 3, image::Rgb([10, 200, 30]));
        let mut bytes = Vec::new();
        frame
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .expect("encode");

        let decoded = decode_frame(&BASE64.encode(&bytes)).expect("decode");

        assert_eq!(decoded.dimensions(), (4, 3));
        assert_eq!(decoded.get_pixel(2, 1), &image::Rgb([10, 200, 30]));
    }

    #[test]
    fn test_decode_frame_rejects_garbage() {
        assert!(matches!(
            decode_frame("not base64!!"),
            Err(TransportError::ImageDecode(_))
        ));
    }

    #[test]
    fn test_state_response_parses_integer_timestamp() {
        let raw = r#"{"state": {"x_norm": 0.1, "y_norm": 0.2, "z_norm": 1, "rotation": 0, "claw_norm": 1}, "timestamp": 1700000000}"#;
        let parsed: StateResponse = serde_json::from_str(raw).expect("parse");
        assert_eq!(parsed.timestamp, 1_700_000_000.0);
        assert_eq!(parsed.state.y_norm, 0.2);
    }
}
