//! Video segment writers.
//!
//! The Recorder only sees the [`VideoWriter`] / [`VideoWriterFactory`] pair.
//! The production writer pipes raw RGB frames into an `ffmpeg` subprocess
//! that encodes an MPEG-4 `.mp4`; [`MemoryWriterFactory`] counts frames in
//! memory and is used by tests and dry runs.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};

use image::imageops::{self, FilterType};
use tracing::{debug, warn};

use crate::robot::Frame;

use super::RecorderError;

/// One open video segment.
pub trait VideoWriter: Send {
    /// Appends a frame. Frames of a different size are resized to the
    /// segment's size.
    fn write_frame(&mut self, frame: &Frame) -> Result<(), RecorderError>;

    /// Flushes and closes the segment.
    fn finish(self: Box<Self>) -> Result<(), RecorderError>;
}

/// Opens video segments.
pub trait VideoWriterFactory: Send + Sync {
    fn open(
        &self,
        path: &Path,
        width: u32,
        height: u32,
        fps: f64,
    ) -> Result<Box<dyn VideoWriter>, RecorderError>;
}

fn fit_to(frame: &Frame, width: u32, height: u32) -> Option<Frame> {
    if frame.dimensions() == (width, height) {
        None
    } else {
        Some(imageops::resize(frame, width, height, FilterType::Triangle))
    }
}

/// Spawns one `ffmpeg` process per segment.
#[derive(Debug, Clone)]
pub struct FfmpegWriterFactory {
    binary: PathBuf,
}

impl FfmpegWriterFactory {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for FfmpegWriterFactory {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl VideoWriterFactory for FfmpegWriterFactory {
    fn open(
        &self,
        path: &Path,
        width: u32,
        height: u32,
        fps: f64,
    ) -> Result<Box<dyn VideoWriter>, RecorderError> {
        // stderr must not be a pipe: nothing drains it while frames are written
        let stderr_log = tempfile::tempfile()?;
        let mut child = Command::new(&self.binary)
            .args(["-y", "-loglevel", "error", "-f", "rawvideo", "-pix_fmt", "rgb24"])
            .args(["-s", &format!("{width}x{height}")])
            .args(["-r", &fps.to_string()])
            .args(["-i", "-"])
            .args(["-vf", "pad=ceil(iw/2)*2:ceil(ih/2)*2"])
            .args(["-c:v", "mpeg4", "-q:v", "5", "-pix_fmt", "yuv420p"])
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr_log.try_clone()?))
            .spawn()
            .map_err(|e| {
                RecorderError::Encoder(format!(
                    "failed to spawn {}: {e}",
                    self.binary.display()
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RecorderError::Encoder("ffmpeg stdin unavailable".to_string()))?;

        debug!(path = %path.display(), width, height, fps, "Opened video segment");
        Ok(Box::new(FfmpegWriter {
            child,
            stdin: Some(stdin),
            stderr_log,
            width,
            height,
            path: path.to_path_buf(),
        }))
    }
}

/// A segment being encoded by an `ffmpeg` child process.
pub struct FfmpegWriter {
    child: Child,
    stdin: Option<ChildStdin>,
    stderr_log: File,
    width: u32,
    height: u32,
    path: PathBuf,
}

impl VideoWriter for FfmpegWriter {
    fn write_frame(&mut self, frame: &Frame) -> Result<(), RecorderError> {
        let resized = fit_to(frame, self.width, self.height);
        let raw = resized.as_ref().unwrap_or(frame).as_raw();
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| RecorderError::Encoder("segment already finished".to_string()))?;
        stdin.write_all(raw).map_err(|e| {
            RecorderError::Encoder(format!("write to {} failed: {e}", self.path.display()))
        })
    }

    fn finish(mut self: Box<Self>) -> Result<(), RecorderError> {
        drop(self.stdin.take());
        let status = self
            .child
            .wait()
            .map_err(|e| RecorderError::Encoder(format!("ffmpeg did not exit: {e}")))?;
        if !status.success() {
            let stderr = self.stderr_tail();
            warn!(path = %self.path.display(), status = %status, "ffmpeg failed");
            return Err(RecorderError::Encoder(format!(
                "ffmpeg exited with {} for {}: {}",
                status,
                self.path.display(),
                stderr
            )));
        }
        debug!(path = %self.path.display(), "Closed video segment");
        Ok(())
    }
}

impl FfmpegWriter {
    /// Last lines ffmpeg wrote to stderr, capped in size.
    fn stderr_tail(&mut self) -> String {
        const TAIL_LINES: usize = 5;
        const TAIL_BYTES: u64 = 2048;
        let mut raw = Vec::new();
        let read = self
            .stderr_log
            .seek(SeekFrom::End(0))
            .and_then(|len| {
                self.stderr_log
                    .seek(SeekFrom::Start(len.saturating_sub(TAIL_BYTES)))
            })
            .and_then(|_| self.stderr_log.read_to_end(&mut raw));
        if let Err(e) = read {
            return format!("<stderr unavailable: {e}>");
        }
        let text = String::from_utf8_lossy(&raw);
        let lines: Vec<&str> = text.trim().lines().collect();
        lines[lines.len().saturating_sub(TAIL_LINES)..].join("\n")
    }
}

/// Summary of one in-memory segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRecord {
    pub width: u32,
    pub height: u32,
    pub frames: usize,
    pub finished: bool,
}

#[derive(Default)]
struct MemoryState {
    segments: BTreeMap<PathBuf, SegmentRecord>,
    opened: usize,
    fail_after: Option<usize>,
}

/// Records segments in memory and leaves an empty placeholder file at each
/// segment path.
#[derive(Clone, Default)]
pub struct MemoryWriterFactory {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryWriterFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every `open` after the first `opened` ones fail.
    pub fn with_open_failure_after(self, opened: usize) -> Self {
        self.lock().fail_after = Some(opened);
        self
    }

    /// All segments opened so far, by path.
    pub fn segments(&self) -> BTreeMap<PathBuf, SegmentRecord> {
        self.lock().segments.clone()
    }

    /// Number of frames written to the segment at `path`.
    pub fn frames_in(&self, path: &Path) -> Option<usize> {
        self.lock().segments.get(path).map(|s| s.frames)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl VideoWriterFactory for MemoryWriterFactory {
    fn open(
        &self,
        path: &Path,
        width: u32,
        height: u32,
        _fps: f64,
    ) -> Result<Box<dyn VideoWriter>, RecorderError> {
        let mut state = self.lock();
        if state.fail_after.is_some_and(|limit| state.opened >= limit) {
            return Err(RecorderError::Encoder(format!(
                "refusing to open {}",
                path.display()
            )));
        }
        File::create(path)?;
        state.opened += 1;
        state.segments.insert(
            path.to_path_buf(),
            SegmentRecord {
                width,
                height,
                frames: 0,
                finished: false,
            },
        );
        Ok(Box::new(MemoryWriter {
            state: Arc::clone(&self.state),
            path: path.to_path_buf(),
            width,
            height,
        }))
    }
}

struct MemoryWriter {
    state: Arc<Mutex<MemoryState>>,
    path: PathBuf,
    width: u32,
    height: u32,
}

impl VideoWriter for MemoryWriter {
    fn write_frame(&mut self, frame: &Frame) -> Result<(), RecorderError> {
        let resized = fit_to(frame, self.width, self.height);
        let frame = resized.as_ref().unwrap_or(frame);
        debug_assert_eq!(frame.dimensions(), (self.width, self.height));

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(segment) = state.segments.get_mut(&self.path) {
            segment.frames += 1;
        }
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<(), RecorderError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(segment) = state.segments.get_mut(&self.path) {
            segment.finished = true;
        }
        Ok(())
    }
}
