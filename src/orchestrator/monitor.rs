//! Activity Monitor and Image Mirror loops.

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;

use tracing::{debug, info};

use crate::controller::{EpisodePhase, TaskController};
use crate::recorder::Recorder;

use super::OrchestrationContext;

/// Forwards the controller's phase changes to [`SharedActivityState`].
///
/// Consecutive duplicates are dropped, so every published entry is a real
/// transition and none is reported twice.
///
/// [`SharedActivityState`]: super::SharedActivityState
pub struct ActivityMonitor {
    ctx: Arc<OrchestrationContext>,
    phases: Receiver<EpisodePhase>,
}

impl ActivityMonitor {
    pub fn new(ctx: Arc<OrchestrationContext>, phases: Receiver<EpisodePhase>) -> Self {
        Self { ctx, phases }
    }

    /// Runs until FINISHED is observed, the error flag is raised, or the
    /// controller hangs up. Returns the number of transitions published.
    pub fn run(self) -> usize {
        info!("Activity monitor started");
        let mut last: Option<EpisodePhase> = None;
        let mut published = 0;

        loop {
            #[cfg(test)]
            self.ctx.fail_point("activity-monitor");
            if self.ctx.error_flag().is_raised() {
                debug!("Activity monitor stopped by error flag");
                break;
            }

            match self.phases.recv_timeout(self.ctx.poll_interval()) {
                Ok(phase) => {
                    if last != Some(phase) {
                        self.ctx.lock_state().publish(phase);
                        published += 1;
                        debug!(phase = %phase, previous = ?last, "Transition observed");
                        last = Some(phase);
                    }
                    if phase == EpisodePhase::Finished {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("Phase channel closed");
                    break;
                }
            }
        }

        info!(transitions = published, "Activity monitor stopped");
        published
    }
}

/// Copies the Recorder's latest bottom frame into the controller's working
/// image at the polling interval.
pub struct ImageMirror {
    ctx: Arc<OrchestrationContext>,
    recorder: Arc<Recorder>,
    controller: Arc<TaskController>,
}

impl ImageMirror {
    pub fn new(
        ctx: Arc<OrchestrationContext>,
        recorder: Arc<Recorder>,
        controller: Arc<TaskController>,
    ) -> Self {
        Self {
            ctx,
            recorder,
            controller,
        }
    }

    /// Runs until the error flag or the shutdown flag is raised. Returns the
    /// number of distinct frames copied.
    pub fn run(self) -> usize {
        info!("Image mirror started");
        let mut last: Option<Arc<crate::robot::Frame>> = None;
        let mut copied = 0;

        while !self.ctx.should_stop() {
            #[cfg(test)]
            self.ctx.fail_point("image-mirror");
            if let Some(frame) = self.recorder.latest_bottom_image() {
                let fresh = !matches!(&last, Some(prev) if Arc::ptr_eq(prev, &frame));
                if fresh {
                    self.controller.set_bottom_image(Arc::clone(&frame));
                    last = Some(frame);
                    copied += 1;
                }
            }
            thread::sleep(self.ctx.poll_interval());
        }

        info!(frames = copied, "Image mirror stopped");
        copied
    }
}
