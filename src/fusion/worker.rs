//! Fusion worker: the sole consumer of paired measurements.
//!
//! Waits on the ingress condvar until the pairer yields a batch, feeds each
//! tuple into the back-end estimator, runs the loop-closure keyframe section,
//! publishes refined outputs under the current global correction, and
//! re-seeds the fast predictor from the optimized window tail.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info, warn};

use crate::estimator::{
    Estimator, RetrieveData, SolverStage, MAX_LOOP_TRANSLATION, MAX_LOOP_YAW_DEG,
};
use crate::loop_closure::keyframe::{KeyFrame, LoopRelative};
use crate::msg::ImuSample;
use crate::output::{correct_frame, VioFrame};

use super::correction::Correction;
use super::pairing::{pair_measurements, MeasurementBatch};
use super::FusionCore;

/// Condvar re-check interval; shutdown is polled at this cadence.
const WAIT_TIMEOUT: Duration = Duration::from_millis(100);

pub struct FusionWorker {
    core: Arc<FusionCore>,
    estimator: Box<dyn Estimator>,
    /// Timestamp of the last IMU sample fed to the estimator.
    current_time: Option<f64>,
    kf_tx: Sender<KeyFrame>,
    retrieve_rx: Receiver<RetrieveData>,
    posegraph_tx: Sender<u64>,
}

impl FusionWorker {
    pub fn new(
        core: Arc<FusionCore>,
        estimator: Box<dyn Estimator>,
        kf_tx: Sender<KeyFrame>,
        retrieve_rx: Receiver<RetrieveData>,
        posegraph_tx: Sender<u64>,
    ) -> Self {
        Self {
            core,
            estimator,
            current_time: None,
            kf_tx,
            retrieve_rx,
            posegraph_tx,
        }
    }

    pub fn run(mut self) {
        info!("fusion worker started");
        loop {
            let batches = {
                let mut q = self.core.queues.lock();
                loop {
                    if self.core.is_shutdown() {
                        info!("fusion worker exiting");
                        return;
                    }
                    let batches = pair_measurements(&mut q);
                    if !batches.is_empty() {
                        break batches;
                    }
                    self.core.queues.wait(&mut q, WAIT_TIMEOUT);
                }
            };

            for batch in batches {
                self.process_batch(batch);
            }
            self.reseed_predictor();
        }
    }

    fn process_batch(&mut self, batch: MeasurementBatch) {
        for sample in &batch.imus {
            self.send_imu(sample);
        }

        debug!(t = batch.frame.t, points = batch.frame.points.len(), "processing vision frame");
        self.estimator.process_image(&batch.frame);
        self.core
            .set_nonlinear(self.estimator.stage() == SolverStage::NonLinear);

        if self.core.config.loop_closure {
            self.keyframe_section();
        }

        if let Some((r, t)) = self.estimator.take_relocalization() {
            self.core.correction.set(Correction { r, t });
        }

        self.publish_frame(batch.frame.t);
    }

    fn send_imu(&mut self, sample: &ImuSample) {
        let previous = self.current_time.unwrap_or(sample.t);
        let dt = sample.t - previous;
        self.current_time = Some(sample.t);
        self.estimator.process_imu(dt, sample.acc, sample.gyr);
    }

    /// Build a keyframe for every marginalized window entry and shepherd the
    /// loop handshake: stale records out, fresh records in, answered records
    /// sanity-checked and forwarded to pose-graph optimization.
    fn keyframe_section(&mut self) {
        if let Some(t0) = self.estimator.oldest_frame_time() {
            self.estimator.loop_inbox().retain(|rd| rd.t >= t0);
        }
        let fresh: Vec<RetrieveData> = self.retrieve_rx.try_iter().collect();
        self.estimator.loop_inbox().extend(fresh);

        if !(self.estimator.marginalized_keyframe()
            && self.estimator.stage() == SolverStage::NonLinear)
        {
            return;
        }
        let Some(snapshot) = self.estimator.keyframe_snapshot() else {
            return;
        };
        let Some((image, _)) = self.core.images.pop_for(snapshot.t) else {
            debug!(t = snapshot.t, "no raw image for keyframe yet");
            return;
        };

        let correction = self.core.correction.get();
        let (q, p) = correction.apply(snapshot.q, snapshot.p);
        let kf = KeyFrame::new(
            snapshot.t,
            snapshot.p,
            snapshot.q,
            p,
            q,
            image,
            snapshot.features,
        );
        if self.kf_tx.try_send(kf).is_err() {
            warn!("keyframe inbox unavailable, dropping keyframe");
        }

        let oldest = self.estimator.oldest_frame_time();
        let Some(rd) = self.estimator.loop_inbox().first().cloned() else {
            return;
        };
        if !rd.relative_pose || oldest.map_or(true, |t0| (t0 - rd.t).abs() > 1e-9) {
            return;
        }
        if rd.relative_yaw.abs() > MAX_LOOP_YAW_DEG || rd.relative_t.norm() > MAX_LOOP_TRANSLATION {
            debug!(
                yaw = rd.relative_yaw,
                distance = rd.relative_t.norm(),
                "wrong loop, rejecting"
            );
            self.core.keyframes.lock().remove_loop(rd.cur_index);
            return;
        }
        let relative = LoopRelative {
            t: rd.relative_t,
            q: rd.relative_q,
            yaw: rd.relative_yaw,
        };
        if self
            .core
            .keyframes
            .lock()
            .update_loop_connection(rd.cur_index, relative)
            && self.posegraph_tx.try_send(rd.cur_index).is_err()
        {
            warn!("pose-graph inbox unavailable, dropping optimization request");
        }
    }

    fn publish_frame(&mut self, t: f64) {
        let tail = self.estimator.window_tail();
        let vio = VioFrame {
            t,
            p: tail.p,
            q: tail.q,
            v: tail.v,
            key_poses: self.estimator.window_positions(),
            camera_offset: self.estimator.camera_offset(),
            landmarks: self.estimator.landmarks(),
        };
        let correction = self.core.correction.get();
        let outputs = correct_frame(&vio, &correction);
        *self.core.latest_frame.lock() = Some(vio);
        self.core.publisher.publish_frame(&outputs);
    }

    /// Re-base the fast predictor onto the optimized window tail, replaying
    /// the still-queued IMU tail. Buffer lock before predictor lock.
    fn reseed_predictor(&mut self) {
        if self.estimator.stage() != SolverStage::NonLinear {
            return;
        }
        let Some(t_latest) = self.current_time else {
            return;
        };
        let tail = self.estimator.window_tail();
        let correction = self.core.correction.get();

        let steps = {
            let q = self.core.queues.lock();
            let mut predictor = self.core.predictor.lock();
            predictor.reseed(&tail, t_latest, &correction, q.imu.iter())
        };
        if let Some(audit) = self.core.audit.lock().as_ref() {
            for step in &steps {
                audit.record(step.into());
            }
        }
    }
}
