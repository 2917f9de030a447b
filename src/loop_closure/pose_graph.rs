//! Pose-graph worker: 4-DoF (xyz + yaw) trajectory alignment after loop
//! closure.
//!
//! Pending optimization requests are coalesced to the newest index. The
//! alignment anchors the loop keyframe through its loop edge, extracts the
//! yaw-only drift between the expected and the dead-reckoned pose (roll and
//! pitch are observable and trusted as-is), rewrites every corrected
//! keyframe pose, and publishes the fresh correction.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info, warn};

use crate::fusion::correction::Correction;
use crate::fusion::FusionCore;
use crate::geometry::{normalize_angle, yaw_of, yaw_rotation};
use crate::output::correct_frame;

use super::keyframe_db::KeyFrameDatabase;

/// Idle poll interval; optimization also wakes on a queued index.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Align the trajectory through the loop edge of `anchor_index`.
///
/// The anchor's expected pose follows from the old keyframe's corrected pose
/// composed with the loop's relative pose; the drift between expected and
/// VIO pose (yaw + translation only) becomes the new global correction and
/// is applied to every keyframe.
pub fn optimize_4dof(db: &mut KeyFrameDatabase, anchor_index: u64) -> Option<Correction> {
    let anchor = db.get(anchor_index)?;
    let old_index = anchor.loop_to?;
    let relative = anchor.loop_relative?;
    let Some(old) = db.get(old_index) else {
        warn!(old_index, "loop edge targets an evicted keyframe, skipping");
        return None;
    };

    let p_expected = old.p + old.q * relative.t;
    let yaw_expected = yaw_of(&(old.q * relative.q));
    let yaw_drift = normalize_angle(yaw_expected - yaw_of(&anchor.vio_q));
    let r = yaw_rotation(yaw_drift);
    let t = p_expected - r * anchor.vio_p;

    let correction = Correction { r, t };
    db.apply_drift(&correction);
    Some(correction)
}

pub struct PoseGraphWorker {
    core: Arc<FusionCore>,
    rx: Receiver<u64>,
    runs: u64,
}

impl PoseGraphWorker {
    pub fn new(core: Arc<FusionCore>, rx: Receiver<u64>) -> Self {
        Self { core, rx, runs: 0 }
    }

    pub fn run(mut self) {
        info!("pose-graph worker started");
        loop {
            if self.core.is_shutdown() {
                break;
            }
            let index = match self.rx.recv_timeout(POLL_INTERVAL) {
                Ok(index) => index,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            // Coalesce: only the newest pending index matters.
            let index = self.rx.try_iter().last().unwrap_or(index);
            self.optimize(index);
        }
        info!(runs = self.runs, "pose-graph worker exiting");
    }

    fn optimize(&mut self, index: u64) {
        let correction = {
            let mut db = self.core.keyframes.lock();
            optimize_4dof(&mut db, index)
        };
        let Some(correction) = correction else {
            debug!(index, "nothing to optimize");
            return;
        };
        self.runs += 1;
        self.core.correction.set(correction);

        let (snapshot, path) = {
            let db = self.core.keyframes.lock();
            (db.snapshot(), db.path())
        };
        self.core.publisher.publish_pose_graph(&snapshot);
        self.core.publisher.publish_refined_path(&path);

        // Republish the last frame outputs under the fresh correction.
        let latest = self.core.latest_frame.lock().clone();
        if let Some(vio) = latest {
            self.core
                .publisher
                .publish_frame(&correct_frame(&vio, &correction));
        }
        info!(index, "pose graph optimized");
    }
}
