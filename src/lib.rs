//! autograsper: autonomous data collection for a remote gripper robot.
//!
//! The library drives a robot through repeated episodes of a task and a
//! reset, recording both cameras and the robot state for every episode.
//!
//! # Components
//!
//! - [`controller`]: the episode state machine and the pluggable task strategies
//! - [`orders`]: order dispatch and the append-only `orders.json` log
//! - [`recorder`]: the capture loop writing video segments and `states.json`
//! - [`orchestrator`]: the threads and the reactive driver tying them together
//! - [`storage`]: session directories, JSON logs and run summaries
//! - [`robot`]: the transport boundary (HTTP API and simulator)
//! - [`vision`]: bottom-camera undistortion and colour-block location

// Core modules
pub mod cli;
pub mod config;
pub mod controller;
pub mod error;
pub mod orchestrator;
pub mod orders;
pub mod recorder;
pub mod robot;
pub mod storage;
pub mod vision;

// Re-export commonly used types
pub use config::{ConfigError, ExperimentConfig, TaskKind};
pub use controller::{EpisodePhase, TaskController, TaskOutcome, TaskStrategy};
pub use error::{StorageError, TransportError};
pub use orchestrator::{EpisodeOrchestrator, ErrorFlag, OrchestrationContext, RunReport};
pub use orders::{Order, OrderExecutor, OrderIntent, OrderKind};
pub use recorder::Recorder;
pub use robot::{RobotTransport, SimulatedRobot};
