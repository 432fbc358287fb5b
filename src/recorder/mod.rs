//! Continuous camera and telemetry recorder.
//!
//! Each tick captures a synchronized triple from the robot (top frame,
//! undistorted bottom frame, telemetry snapshot), writes both frames to the
//! current video segments and appends the snapshot to `states.json`. The
//! latest bottom frame is kept in a buffer that the Image Mirror copies from.
//!
//! Output layout of one recording directory:
//!
//! ```text
//! <output_dir>/
//!   states.json
//!   Video/video_<n>.mp4          top camera
//!   Bottom_Video/video_<n>.mp4   undistorted bottom camera
//!   Final_Image/final_image_<n>.jpg
//! ```
//!
//! The capture loop is the only writer of the segments. Other threads may
//! only redirect it with [`Recorder::start_new_recording`], stop it, or pause
//! it.

pub mod video;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::RecordingSettings;
use crate::error::{StorageError, TransportError};
use crate::orchestrator::ErrorFlag;
use crate::robot::{Frame, RobotTransport};
use crate::storage::JsonArrayLog;
use crate::vision::Undistorter;

pub use video::{
    FfmpegWriterFactory, MemoryWriterFactory, SegmentRecord, VideoWriter, VideoWriterFactory,
};

/// Top-camera segment directory.
pub const VIDEO_DIR: &str = "Video";

/// Bottom-camera segment directory.
pub const BOTTOM_VIDEO_DIR: &str = "Bottom_Video";

/// Final snapshot directory.
pub const FINAL_IMAGE_DIR: &str = "Final_Image";

/// Errors raised by the recorder. Any of them is fatal to the run.
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Video encoder error: {0}")]
    Encoder(String),

    #[error("Robot error: {0}")]
    Transport(#[from] TransportError),
}

/// Capture options.
#[derive(Debug, Clone)]
pub struct RecorderSettings {
    /// Frames per segment; a single segment per recording when `None`.
    pub segment_length: Option<u64>,
    pub fps: f64,
    /// Delay between ticks.
    pub tick_interval: Duration,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            segment_length: None,
            fps: 5.0,
            tick_interval: Duration::from_millis(500),
        }
    }
}

impl From<&RecordingSettings> for RecorderSettings {
    fn from(recording: &RecordingSettings) -> Self {
        Self {
            segment_length: recording.segment_length,
            fps: recording.fps,
            tick_interval: recording.tick_interval(),
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A frame pair and a snapshot were written.
    Captured,
    /// A robot read failed; nothing was written.
    Skipped,
}

struct Segments {
    output_dir: PathBuf,
    frame_counter: u64,
    video_counter: u64,
    top: Option<Box<dyn VideoWriter>>,
    bottom: Option<Box<dyn VideoWriter>>,
}

impl Segments {
    fn video_dir(&self) -> PathBuf {
        self.output_dir.join(VIDEO_DIR)
    }

    fn bottom_video_dir(&self) -> PathBuf {
        self.output_dir.join(BOTTOM_VIDEO_DIR)
    }

    fn final_image_dir(&self) -> PathBuf {
        self.output_dir.join(FINAL_IMAGE_DIR)
    }

    fn create_dirs(&self) -> Result<(), RecorderError> {
        fs::create_dir_all(self.video_dir())?;
        fs::create_dir_all(self.bottom_video_dir())?;
        fs::create_dir_all(self.final_image_dir())?;
        Ok(())
    }

    /// Closes both writers. Both are attempted even if the first fails.
    fn finish_writers(&mut self) -> Result<(), RecorderError> {
        let top = self.top.take().map(|w| w.finish()).transpose();
        let bottom = self.bottom.take().map(|w| w.finish()).transpose();
        top?;
        bottom?;
        Ok(())
    }
}

/// The recorder. Shared as `Arc<Recorder>` between its capture thread and
/// the orchestrator.
pub struct Recorder {
    robot: Arc<dyn RobotTransport>,
    undistorter: Arc<dyn Undistorter>,
    writers: Arc<dyn VideoWriterFactory>,
    settings: RecorderSettings,
    segments: Mutex<Segments>,
    bottom_image: Mutex<Option<Arc<Frame>>>,
    stop_flag: AtomicBool,
    paused: AtomicBool,
}

impl Recorder {
    pub fn new(
        robot: Arc<dyn RobotTransport>,
        undistorter: Arc<dyn Undistorter>,
        writers: Arc<dyn VideoWriterFactory>,
        output_dir: impl Into<PathBuf>,
        mut settings: RecorderSettings,
    ) -> Self {
        // a zero-length segment means one segment per recording
        settings.segment_length = settings.segment_length.filter(|&length| length > 0);
        Self {
            robot,
            undistorter,
            writers,
            settings,
            segments: Mutex::new(Segments {
                output_dir: output_dir.into(),
                frame_counter: 0,
                video_counter: 0,
                top: None,
                bottom: None,
            }),
            bottom_image: Mutex::new(None),
            stop_flag: AtomicBool::new(false),
            paused: AtomicBool::new(false),
        }
    }

    fn lock_segments(&self) -> MutexGuard<'_, Segments> {
        self.segments.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs the capture loop until [`stop`](Self::stop) is called or `error`
    /// is raised.
    ///
    /// On a normal stop the segments are closed and a final top-camera image
    /// is written. On an error the segments are still closed before the error
    /// is returned; the caller escalates it.
    pub fn record(&self, error: &ErrorFlag) -> Result<(), RecorderError> {
        info!(
            robot = %self.robot.name(),
            output_dir = %self.output_dir().display(),
            segment_length = ?self.settings.segment_length,
            "Recorder started"
        );
        self.lock_segments().create_dirs()?;

        let result = self.capture_loop(error);
        let closed = self.lock_segments().finish_writers();
        if let Err(e) = result {
            if let Err(close_err) = closed {
                warn!(error = %close_err, "Failed to close segments after recorder error");
            }
            return Err(e);
        }
        closed?;

        if self.stop_flag.load(Ordering::SeqCst) {
            if let Err(e) = self.write_final_image() {
                warn!(error = %e, "Failed to save final image");
            }
        }
        info!(frames = self.frame_counter(), "Recorder stopped");
        Ok(())
    }

    fn capture_loop(&self, error: &ErrorFlag) -> Result<(), RecorderError> {
        loop {
            if self.stop_flag.load(Ordering::SeqCst) || error.is_raised() {
                return Ok(());
            }
            if !self.paused.load(Ordering::SeqCst) {
                self.tick()?;
            }
            thread::sleep(self.settings.tick_interval);
        }
    }

    /// Captures and writes one frame pair and one telemetry snapshot.
    ///
    /// A failed robot read skips the tick without counting a frame. Writer
    /// and disk failures are returned.
    pub fn tick(&self) -> Result<TickOutcome, RecorderError> {
        let captured = self
            .robot
            .get_top_image()
            .and_then(|top| Ok((top, self.robot.get_bottom_image()?)))
            .and_then(|(top, bottom)| Ok((top, bottom, self.robot.get_state()?)));
        let (top, raw_bottom, state) = match captured {
            Ok(triple) => triple,
            Err(e) => {
                warn!(robot = %self.robot.name(), error = %e, "Skipping frame");
                return Ok(TickOutcome::Skipped);
            }
        };

        let bottom = Arc::new(self.undistorter.undistort(&raw_bottom.frame));
        *self
            .bottom_image
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&bottom));

        let mut segments = self.lock_segments();
        let start_segment = match self.settings.segment_length {
            Some(length) => segments.frame_counter % length == 0,
            None => segments.top.is_none(),
        };
        if start_segment {
            self.rotate_segments(&mut segments, &top.frame, &bottom)?;
        }

        if let Some(writer) = segments.top.as_mut() {
            writer.write_frame(&top.frame)?;
        }
        if let Some(writer) = segments.bottom.as_mut() {
            writer.write_frame(&bottom)?;
        }
        JsonArrayLog::states_in(&segments.output_dir).append(&state)?;

        segments.frame_counter += 1;
        debug!(frame = segments.frame_counter, segment = segments.video_counter, "Frame recorded");
        Ok(TickOutcome::Captured)
    }

    /// Closes the current pair of writers, then opens the next pair.
    fn rotate_segments(
        &self,
        segments: &mut Segments,
        top: &Frame,
        bottom: &Frame,
    ) -> Result<(), RecorderError> {
        segments.finish_writers()?;

        let name = format!("video_{}.mp4", segments.video_counter);
        let (top_w, top_h) = top.dimensions();
        let (bottom_w, bottom_h) = bottom.dimensions();
        segments.top = Some(self.writers.open(
            &segments.video_dir().join(&name),
            top_w,
            top_h,
            self.settings.fps,
        )?);
        segments.bottom = Some(self.writers.open(
            &segments.bottom_video_dir().join(&name),
            bottom_w,
            bottom_h,
            self.settings.fps,
        )?);
        segments.video_counter += 1;
        debug!(segment = %name, output_dir = %segments.output_dir.display(), "Started video segment");
        Ok(())
    }

    /// Redirects the capture loop to `new_output_dir`.
    ///
    /// Closes the current segments, recreates the directory layout and resets
    /// the frame and segment counters. The capture loop keeps running; the
    /// next tick opens fresh segments in the new directory.
    pub fn start_new_recording(&self, new_output_dir: &Path) -> Result<(), RecorderError> {
        let mut segments = self.lock_segments();
        segments.finish_writers()?;
        segments.output_dir = new_output_dir.to_path_buf();
        segments.create_dirs()?;
        segments.frame_counter = 0;
        segments.video_counter = 0;
        self.stop_flag.store(false, Ordering::SeqCst);
        info!(output_dir = %new_output_dir.display(), "Started new recording");
        Ok(())
    }

    /// Captures one top-camera image into `Final_Image/`.
    pub fn write_final_image(&self) -> Result<PathBuf, RecorderError> {
        let top = self.robot.get_top_image()?;
        let segments = self.lock_segments();
        fs::create_dir_all(segments.final_image_dir())?;
        let path = segments
            .final_image_dir()
            .join(format!("final_image_{}.jpg", segments.video_counter));
        top.frame.save_with_format(&path, image::ImageFormat::Jpeg)?;
        info!(path = %path.display(), "Saved final image");
        Ok(path)
    }

    /// Asks the capture loop to exit at the top of its next tick.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        debug!("Recorder stop requested");
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_flag.load(Ordering::SeqCst)
    }

    /// Suspends capture without closing the segments.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// The most recent undistorted bottom frame, if any tick succeeded yet.
    pub fn latest_bottom_image(&self) -> Option<Arc<Frame>> {
        self.bottom_image
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn output_dir(&self) -> PathBuf {
        self.lock_segments().output_dir.clone()
    }

    /// Frames written since the last `start_new_recording`.
    pub fn frame_counter(&self) -> u64 {
        self.lock_segments().frame_counter
    }

    /// Segments opened since the last `start_new_recording`.
    pub fn video_counter(&self) -> u64 {
        self.lock_segments().video_counter
    }
}
