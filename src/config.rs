//! Experiment configuration.
//!
//! The configuration is a YAML file read once at startup. It carries the
//! robot identity, the bottom-camera calibration, task parameters, loop
//! timings, recording options and the colour ranges used by the object
//! locator. A few values can be overridden from the environment.
//!
//! A missing file, a missing `experiment` or `camera` section, or an invalid
//! value is fatal before any thread is spawned.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::robot::http::{DEFAULT_API_BASE, DEFAULT_REQUEST_TIMEOUT_SECS};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "autograsper/config.yaml";

/// Environment variable holding the robot API token.
pub const TOKEN_ENV: &str = "ROBOT_TOKEN";

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// A required section is absent from the configuration file.
    #[error("The '{0}' section is missing from the configuration file")]
    MissingSection(String),

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// The configuration file could not be parsed.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which task strategy the controller runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Grasp a single target block near its detected position.
    #[default]
    Grasp,
    /// Stack the configured blocks on top of each other.
    Stack,
    /// Scatter blocks to random positions (reset-only episodes).
    Shuffle,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Grasp => "grasp",
            Self::Stack => "stack",
            Self::Shuffle => "shuffle",
        };
        f.write_str(name)
    }
}

impl FromStr for TaskKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "grasp" => Ok(Self::Grasp),
            "stack" => Ok(Self::Stack),
            "shuffle" => Ok(Self::Shuffle),
            other => Err(ConfigError::InvalidValue {
                key: "experiment.task".to_string(),
                message: format!("unknown task '{other}'"),
            }),
        }
    }
}

/// Robot identity and transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotSettings {
    /// Robot identifier, substituted into `api_base`.
    pub id: String,
    /// API URL template containing `{robot}`.
    pub api_base: String,
    /// Per-request timeout.
    pub request_timeout_secs: u64,
}

impl Default for RobotSettings {
    fn default() -> Self {
        Self {
            id: "robot23".to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

/// Bottom-camera calibration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraSettings {
    /// 3x3 intrinsic matrix.
    pub matrix: [[f64; 3]; 3],
    /// Fisheye distortion coefficients `k1..k4`.
    pub distortion: [f64; 4],
    /// Pixel positions (in the undistorted, rotated frame) of the robot
    /// workspace corners `(0,0)`, `(0,1)`, `(1,0)`, `(1,1)`.
    #[serde(default = "default_pixel_corners")]
    pub pixel_corners: [[f64; 2]; 4],
}

fn default_pixel_corners() -> [[f64; 2]; 4] {
    [[150.0, 69.0], [149.0, 441.0], [534.0, 67.0], [535.0, 435.0]]
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            matrix: [[505.2, 0.0, 324.5], [0.0, 505.6, 233.5], [0.0, 0.0, 1.0]],
            distortion: [-0.077, -0.048, 0.122, -0.097],
            pixel_corners: default_pixel_corners(),
        }
    }
}

/// Task parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentSettings {
    #[serde(default)]
    pub task: TaskKind,
    /// Block colours, bottom of the stack first.
    #[serde(default)]
    pub colors: Vec<String>,
    /// Block heights in normalized z, same order as `colors`.
    #[serde(default)]
    pub block_heights: Vec<f64>,
    /// Candidate positions for scattering blocks.
    #[serde(default = "default_position_bank")]
    pub position_bank: Vec<[f64; 2]>,
    #[serde(default = "default_center")]
    pub stack_position: [f64; 2],
    /// Minimum spacing between scattered blocks.
    #[serde(default = "default_object_size")]
    pub object_size: f64,
    /// Colour of the block the grasp task targets.
    #[serde(default = "default_target_color")]
    pub target_color: String,
    /// Ready pose the arm returns to before each episode.
    #[serde(default = "default_start_position")]
    pub start_position: [f64; 2],
    /// Delay between queued orders; each task variant has its own default.
    #[serde(default)]
    pub order_delay_secs: Option<f64>,
    /// Stop after this many completed episodes.
    #[serde(default)]
    pub max_episodes: Option<u64>,
}

impl Default for ExperimentSettings {
    fn default() -> Self {
        Self {
            task: TaskKind::default(),
            colors: Vec::new(),
            block_heights: Vec::new(),
            position_bank: default_position_bank(),
            stack_position: default_center(),
            object_size: default_object_size(),
            target_color: default_target_color(),
            start_position: default_start_position(),
            order_delay_secs: None,
            max_episodes: None,
        }
    }
}

fn default_position_bank() -> Vec<[f64; 2]> {
    vec![[0.2, 0.2], [0.8, 0.2], [0.8, 0.8]]
}

fn default_center() -> [f64; 2] {
    [0.5, 0.5]
}

fn default_object_size() -> f64 {
    0.1
}

fn default_target_color() -> String {
    "green".to_string()
}

fn default_start_position() -> [f64; 2] {
    [0.0, 0.7]
}

/// Loop and settle timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSettings {
    /// Recorder pause between episodes.
    pub time_between_experiments_secs: u64,
    /// Activity Monitor / Image Mirror polling interval.
    pub poll_interval_ms: u64,
    /// Settle time between starting a recording and raising `start_flag`.
    pub start_settle_ms: u64,
    /// Settle time between stopping the Recorder and joining it.
    pub stop_settle_ms: u64,
    /// Settle time after each dispatched order.
    pub order_settle_ms: u64,
    /// Pause after the task routine, before entering RESETTING.
    pub post_task_delay_ms: u64,
    /// Pause after entering RESETTING, before reset or recovery.
    pub reset_settle_ms: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            time_between_experiments_secs: 10,
            poll_interval_ms: 100,
            start_settle_ms: 500,
            stop_settle_ms: 1000,
            order_settle_ms: 1000,
            post_task_delay_ms: 2000,
            reset_settle_ms: 2000,
        }
    }
}

impl TimingSettings {
    /// All timings zero except a 1 ms poll interval. Used by tests.
    pub fn immediate() -> Self {
        Self {
            time_between_experiments_secs: 0,
            poll_interval_ms: 1,
            start_settle_ms: 0,
            stop_settle_ms: 0,
            order_settle_ms: 0,
            post_task_delay_ms: 0,
            reset_settle_ms: 0,
        }
    }

    pub fn time_between_experiments(&self) -> Duration {
        Duration::from_secs(self.time_between_experiments_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn start_settle(&self) -> Duration {
        Duration::from_millis(self.start_settle_ms)
    }

    pub fn stop_settle(&self) -> Duration {
        Duration::from_millis(self.stop_settle_ms)
    }

    pub fn order_settle(&self) -> Duration {
        Duration::from_millis(self.order_settle_ms)
    }

    pub fn post_task_delay(&self) -> Duration {
        Duration::from_millis(self.post_task_delay_ms)
    }

    pub fn reset_settle(&self) -> Duration {
        Duration::from_millis(self.reset_settle_ms)
    }
}

/// Recording options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingSettings {
    /// Root of the per-session directories.
    pub root_dir: PathBuf,
    /// Frames per video segment; one segment per recording when unset.
    pub segment_length: Option<u64>,
    /// Frame rate written into the video container.
    pub fps: f64,
    /// Delay between capture ticks.
    pub tick_interval_ms: u64,
    /// ffmpeg binary used by the video writer.
    pub ffmpeg: PathBuf,
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("recorded_data"),
            segment_length: None,
            fps: 5.0,
            tick_interval_ms: 500,
            ffmpeg: PathBuf::from("ffmpeg"),
        }
    }
}

impl RecordingSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// An HSV range on the OpenCV scale (H in `0..=180`, S and V in `0..=255`).
///
/// Hues that wrap around zero (red) use the optional second range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorRange {
    pub lower1: [u8; 3],
    pub upper1: [u8; 3],
    #[serde(default)]
    pub lower2: Option<[u8; 3]>,
    #[serde(default)]
    pub upper2: Option<[u8; 3]>,
}

/// Named colour ranges for the object locator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorSettings {
    /// Minimum number of matching pixels for a detection.
    pub min_area: u32,
    pub ranges: BTreeMap<String, ColorRange>,
}

impl Default for ColorSettings {
    fn default() -> Self {
        let mut ranges = BTreeMap::new();
        ranges.insert(
            "red".to_string(),
            ColorRange {
                lower1: [0, 120, 70],
                upper1: [10, 255, 255],
                lower2: Some([170, 120, 70]),
                upper2: Some([180, 255, 255]),
            },
        );
        ranges.insert(
            "green".to_string(),
            ColorRange {
                lower1: [40, 70, 50],
                upper1: [80, 255, 255],
                lower2: None,
                upper2: None,
            },
        );
        ranges.insert(
            "blue".to_string(),
            ColorRange {
                lower1: [100, 120, 50],
                upper1: [130, 255, 255],
                lower2: None,
                upper2: None,
            },
        );
        ranges.insert(
            "yellow".to_string(),
            ColorRange {
                lower1: [20, 100, 100],
                upper1: [35, 255, 255],
                lower2: None,
                upper2: None,
            },
        );
        Self {
            min_area: 290,
            ranges,
        }
    }
}

/// Complete experiment configuration.
///
/// `Default` gives the built-in calibration and a grasp task; files must still
/// carry the `camera` and `experiment` sections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperimentConfig {
    #[serde(default)]
    pub robot: RobotSettings,
    pub camera: CameraSettings,
    pub experiment: ExperimentSettings,
    #[serde(default)]
    pub timing: TimingSettings,
    #[serde(default)]
    pub recording: RecordingSettings,
    #[serde(default)]
    pub colors: ColorSettings,
    /// API token; never read from the file.
    #[serde(skip)]
    pub token: Option<String>,
}

impl ExperimentConfig {
    /// Loads and validates the configuration file at `path`, then applies
    /// environment overrides.
    ///
    /// # Environment Variables
    ///
    /// - `ROBOT_TOKEN`: API token for the HTTP transport
    /// - `AUTOGRASPER_ROBOT_ID`: Overrides `robot.id`
    /// - `AUTOGRASPER_RECORDED_DATA`: Overrides `recording.root_dir`
    /// - `AUTOGRASPER_MAX_EPISODES`: Overrides `experiment.max_episodes`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file is missing or unparsable, a required
    /// section is absent, or a value is invalid.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml_str(&contents)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a configuration document without touching the environment.
    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let document: serde_yaml::Value = serde_yaml::from_str(contents)?;
        for section in ["experiment", "camera"] {
            if document.get(section).is_none() {
                return Err(ConfigError::MissingSection(section.to_string()));
            }
        }
        Ok(serde_yaml::from_value(document)?)
    }

    /// Applies environment variable overrides.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var(TOKEN_ENV) {
            if !val.trim().is_empty() {
                self.token = Some(val);
            }
        }

        if let Ok(val) = std::env::var("AUTOGRASPER_ROBOT_ID") {
            self.robot.id = val;
        }

        if let Ok(val) = std::env::var("AUTOGRASPER_RECORDED_DATA") {
            self.recording.root_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("AUTOGRASPER_MAX_EPISODES") {
            self.experiment.max_episodes = Some(parse_env_value(&val, "AUTOGRASPER_MAX_EPISODES")?);
        }

        Ok(())
    }

    /// Returns the API token or an error naming the variable to set.
    pub fn require_token(&self) -> Result<&str, ConfigError> {
        self.token
            .as_deref()
            .ok_or_else(|| ConfigError::MissingEnvVar(TOKEN_ENV.to_string()))
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.robot.id.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "robot.id cannot be empty".to_string(),
            ));
        }

        if self.timing.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationFailed(
                "timing.poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.recording.fps <= 0.0 {
            return Err(ConfigError::ValidationFailed(
                "recording.fps must be greater than 0".to_string(),
            ));
        }

        if self.recording.segment_length == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "recording.segment_length must be greater than 0".to_string(),
            ));
        }

        if self.camera.matrix[0][0] == 0.0 || self.camera.matrix[1][1] == 0.0 {
            return Err(ConfigError::ValidationFailed(
                "camera.matrix must have non-zero focal lengths".to_string(),
            ));
        }

        let experiment = &self.experiment;
        if experiment.task == TaskKind::Stack || experiment.task == TaskKind::Shuffle {
            if experiment.colors.is_empty() {
                return Err(ConfigError::ValidationFailed(format!(
                    "experiment.colors cannot be empty for the {} task",
                    experiment.task
                )));
            }
            if experiment.colors.len() != experiment.block_heights.len() {
                return Err(ConfigError::ValidationFailed(
                    "experiment.colors and experiment.block_heights must have the same length"
                        .to_string(),
                ));
            }
            if experiment.position_bank.is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "experiment.position_bank cannot be empty".to_string(),
                ));
            }
        }

        if experiment.object_size < 0.0 {
            return Err(ConfigError::ValidationFailed(
                "experiment.object_size cannot be negative".to_string(),
            ));
        }

        let required_colors = experiment
            .colors
            .iter()
            .chain(std::iter::once(&experiment.target_color));
        for color in required_colors {
            if !self.colors.ranges.contains_key(color) {
                return Err(ConfigError::ValidationFailed(format!(
                    "colour '{color}' has no range in colors.ranges"
                )));
            }
        }

        Ok(())
    }

    /// Builder method to set the task variant.
    pub fn with_task(mut self, task: TaskKind) -> Self {
        self.experiment.task = task;
        self
    }

    /// Builder method to set the robot identifier.
    pub fn with_robot_id(mut self, id: impl Into<String>) -> Self {
        self.robot.id = id.into();
        self
    }

    /// Builder method to set the recorded-data root.
    pub fn with_root_dir(mut self, root: impl Into<PathBuf>) -> Self {
        self.recording.root_dir = root.into();
        self
    }

    /// Builder method to set the episode cap.
    pub fn with_max_episodes(mut self, max: u64) -> Self {
        self.experiment.max_episodes = Some(max);
        self
    }

    /// Builder method to set the timings.
    pub fn with_timing(mut self, timing: TimingSettings) -> Self {
        self.timing = timing;
        self
    }
}

/// Parses an environment variable value into the target type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MINIMAL: &str = r#"
camera:
  matrix: [[505.2, 0.0, 324.5], [0.0, 505.6, 233.5], [0.0, 0.0, 1.0]]
  distortion: [-0.077, -0.048, 0.122, -0.097]
experiment:
  task: grasp
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = ExperimentConfig::from_yaml_str(MINIMAL).expect("parse");

        assert_eq!(config.robot.id, "robot23");
        assert_eq!(config.experiment.task, TaskKind::Grasp);
        assert_eq!(config.experiment.target_color, "green");
        assert_eq!(config.timing.time_between_experiments_secs, 10);
        assert_eq!(config.timing.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.recording.root_dir, PathBuf::from("recorded_data"));
        assert_eq!(config.recording.segment_length, None);
        assert_eq!(config.colors.min_area, 290);
        assert!(config.token.is_none());
        config.validate().expect("valid");
    }

    #[test]
    fn test_missing_camera_section() {
        let err = ExperimentConfig::from_yaml_str("experiment:\n  task: stack\n")
            .expect_err("should fail");
        assert!(matches!(err, ConfigError::MissingSection(ref s) if s == "camera"));
    }

    #[test]
    fn test_missing_experiment_section() {
        let yaml = "camera:\n  matrix: [[1,0,0],[0,1,0],[0,0,1]]\n  distortion: [0,0,0,0]\n";
        let err = ExperimentConfig::from_yaml_str(yaml).expect_err("should fail");
        assert!(matches!(err, ConfigError::MissingSection(ref s) if s == "experiment"));
    }

    #[test]
    fn test_stack_requires_matching_heights() {
        let yaml = format!(
            "{MINIMAL}  colors: [red, green]\n  block_heights: [0.2]\n"
        )
        .replace("task: grasp", "task: stack");
        let config = ExperimentConfig::from_yaml_str(&yaml).expect("parse");

        let err = config.validate().expect_err("should fail");
        assert!(matches!(err, ConfigError::ValidationFailed(_)));
    }

    #[test]
    fn test_unknown_colour_rejected() {
        let yaml = format!("{MINIMAL}  target_color: purple\n");
        let config = ExperimentConfig::from_yaml_str(&yaml).expect("parse");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let path = temp_dir.path().join("config.yaml");
        let yaml = format!(
            "{MINIMAL}robot:\n  id: robot7\nrecording:\n  segment_length: 30\n  fps: 3.0\n"
        );
        std::fs::write(&path, yaml).expect("write");

        let config = ExperimentConfig::load(&path).expect("load");

        assert_eq!(config.recording.segment_length, Some(30));
        assert_eq!(config.recording.fps, 3.0);
        assert_eq!(config.recording.tick_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_load_missing_file() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let err = ExperimentConfig::load(&temp_dir.path().join("absent.yaml"))
            .expect_err("should fail");
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_task_kind_parse() {
        assert_eq!("Stack".parse::<TaskKind>().expect("parse"), TaskKind::Stack);
        assert_eq!(TaskKind::Shuffle.to_string(), "shuffle");
        assert!("juggle".parse::<TaskKind>().is_err());
    }

    #[test]
    fn test_builders() {
        let config = ExperimentConfig::from_yaml_str(MINIMAL)
            .expect("parse")
            .with_task(TaskKind::Shuffle)
            .with_max_episodes(3)
            .with_timing(TimingSettings::immediate());

        assert_eq!(config.experiment.task, TaskKind::Shuffle);
        assert_eq!(config.experiment.max_episodes, Some(3));
        assert_eq!(config.timing.order_settle(), Duration::ZERO);
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = ExperimentConfig::default();
        config.validate().expect("valid");
        assert_eq!(config.camera.matrix[0][0], 505.2);
        assert_eq!(config.experiment.task, TaskKind::Grasp);
    }

    #[test]
    fn test_require_token() {
        let mut config = ExperimentConfig::from_yaml_str(MINIMAL).expect("parse");
        assert!(matches!(
            config.require_token(),
            Err(ConfigError::MissingEnvVar(_))
        ));
        config.token = Some("secret".to_string());
        assert_eq!(config.require_token().expect("token"), "secret");
    }
}
