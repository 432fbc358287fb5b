//! Bottom-camera vision.
//!
//! Two collaborators sit behind traits so the orchestration core never
//! depends on a particular implementation:
//!
//! - [`Undistorter`]: rectifies a raw bottom-camera frame
//! - [`ObjectLocator`]: finds a coloured block and maps it to robot coordinates

pub mod locator;
pub mod undistort;

use thiserror::Error;

use crate::robot::Frame;

pub use locator::ColorLocator;
pub use undistort::{FisheyeUndistorter, NoUndistortion};

/// Errors raised by the vision collaborators.
#[derive(Debug, Error)]
pub enum VisionError {
    /// No colour range is configured under this name.
    #[error("Color '{0}' not found in configuration")]
    UnknownColor(String),

    /// The pixel-to-robot calibration corners do not define a homography.
    #[error("Degenerate pixel calibration: {0}")]
    DegenerateCalibration(String),
}

/// Rectifies raw bottom-camera frames.
pub trait Undistorter: Send + Sync {
    fn undistort(&self, frame: &Frame) -> Frame;
}

/// Locates coloured objects in a rectified bottom-camera frame.
pub trait ObjectLocator: Send + Sync {
    /// Returns the normalized robot-frame `[x, y]` of the `color` block, or
    /// `None` when it is not visible.
    fn locate(&self, frame: &Frame, color: &str) -> Result<Option<[f64; 2]>, VisionError>;

    /// True when every colour in `colors` is visible.
    fn all_visible(&self, frame: &Frame, colors: &[String]) -> Result<bool, VisionError> {
        for color in colors {
            if self.locate(frame, color)?.is_none() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
