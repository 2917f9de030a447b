//! VioNode - top-level orchestration.
//!
//! Owns the shared [`FusionCore`], spawns the fusion worker and (in
//! loop-closure mode) the loop detector and pose-graph workers, and exposes
//! the producer callbacks a transport layer hooks into. Shutdown is
//! cooperative and joins every thread.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use crossbeam_channel::bounded;
use nalgebra::Vector3;
use tracing::{info, warn};

use crate::audit::AuditSink;
use crate::config::NodeConfig;
use crate::estimator::Estimator;
use crate::fusion::worker::FusionWorker;
use crate::fusion::FusionCore;
use crate::loop_closure::{LoopDetector, PlaceRecognizer, PoseGraphWorker};
use crate::msg::{FeatureFrame, ImuSample, MonoImage};
use crate::output::{Odometry, Publisher};

/// Capacity of the keyframe channel towards the loop detector. The detector
/// keeps only the newest pending keyframe anyway.
const KEYFRAME_CHANNEL_CAPACITY: usize = 5;

/// Capacity of the handshake and pose-graph index channels.
const INBOX_CAPACITY: usize = 16;

pub struct VioNode {
    core: Arc<FusionCore>,
    fusion_handle: Option<JoinHandle<()>>,
    detector_handle: Option<JoinHandle<()>>,
    pose_graph_handle: Option<JoinHandle<()>>,
    audit_handle: Option<JoinHandle<()>>,
}

impl VioNode {
    /// Build the shared core and spawn all workers.
    pub fn spawn(
        config: NodeConfig,
        estimator: Box<dyn Estimator>,
        recognizer: Box<dyn PlaceRecognizer>,
        publisher: Arc<dyn Publisher>,
    ) -> Result<Self> {
        let (audit, audit_handle) = match &config.predict_log {
            Some(path) => {
                let (sink, handle) = AuditSink::create(path)?;
                (Some(sink), Some(handle))
            }
            None => (None, None),
        };
        let loop_closure = config.loop_closure;
        let core = FusionCore::new(config, publisher, audit);

        let (kf_tx, kf_rx) = bounded(KEYFRAME_CHANNEL_CAPACITY);
        let (retrieve_tx, retrieve_rx) = bounded(INBOX_CAPACITY);
        let (posegraph_tx, posegraph_rx) = bounded(INBOX_CAPACITY);

        let fusion = FusionWorker::new(core.clone(), estimator, kf_tx, retrieve_rx, posegraph_tx);
        let fusion_handle = thread::Builder::new()
            .name("fusion".into())
            .spawn(move || fusion.run())
            .context("Failed to spawn fusion worker")?;

        let (detector_handle, pose_graph_handle) = if loop_closure {
            let detector = LoopDetector::new(core.clone(), kf_rx, retrieve_tx, recognizer);
            let detector_handle = thread::Builder::new()
                .name("loop-detect".into())
                .spawn(move || detector.run())
                .context("Failed to spawn loop detector")?;

            let pose_graph = PoseGraphWorker::new(core.clone(), posegraph_rx);
            let pose_graph_handle = thread::Builder::new()
                .name("pose-graph".into())
                .spawn(move || pose_graph.run())
                .context("Failed to spawn pose-graph worker")?;
            (Some(detector_handle), Some(pose_graph_handle))
        } else {
            (None, None)
        };

        Ok(Self {
            core,
            fusion_handle: Some(fusion_handle),
            detector_handle,
            pose_graph_handle,
            audit_handle,
        })
    }

    /// IMU producer callback: enqueue for fusion, advance the fast
    /// predictor, and publish high-rate odometry once the solver is
    /// non-linear. Buffer lock and predictor lock are taken in sequence,
    /// never nested.
    pub fn on_imu(&self, sec: i64, nsec: u32, acc: Vector3<f64>, gyr: Vector3<f64>) {
        let sample = ImuSample::from_stamp(sec, nsec, acc, gyr);
        self.core.queues.push_imu(sample);

        let step = {
            let mut predictor = self.core.predictor.lock();
            predictor.step(&sample)
        };
        if let Some(step) = step {
            if self.core.is_nonlinear() {
                self.core.publisher.publish_latest_odometry(&Odometry {
                    t: sample.t,
                    p: step.p,
                    q: step.q,
                    v: step.v,
                });
            }
            if let Some(audit) = self.core.audit.lock().as_ref() {
                audit.record((&step).into());
            }
        }
    }

    /// Feature-frame producer callback.
    pub fn on_feature_frame(
        &self,
        sec: i64,
        nsec: u32,
        points: &[Vector3<f64>],
        encoded_ids: &[f64],
    ) {
        let frame = FeatureFrame::decode(sec, nsec, points, encoded_ids, self.core.config.num_of_cam);
        self.core.queues.push_feature(frame);
    }

    /// Raw image producer callback; only consumed in loop-closure mode.
    pub fn on_image(&self, image: MonoImage, t: f64) {
        if self.core.config.loop_closure {
            self.core.images.push(image, t);
        }
    }

    pub fn core(&self) -> &Arc<FusionCore> {
        &self.core
    }

    /// Stop all workers and wait for them; flushes the audit sink.
    pub fn shutdown(&mut self) {
        self.core.request_shutdown();
        for handle in [
            self.fusion_handle.take(),
            self.detector_handle.take(),
            self.pose_graph_handle.take(),
        ]
        .into_iter()
        .flatten()
        {
            let _ = handle.join();
        }
        // Closing the sender lets the audit sink flush and exit.
        if let Some(sink) = self.core.audit.lock().take() {
            if sink.dropped() > 0 {
                warn!(dropped = sink.dropped(), "audit records lost to backpressure");
            }
        }
        if let Some(handle) = self.audit_handle.take() {
            let _ = handle.join();
        }
        info!(
            imu_dropped = self.core.queues.imu_dropped(),
            features_dropped = self.core.queues.features_dropped(),
            "node stopped"
        );
    }
}

impl Drop for VioNode {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use nalgebra::{UnitQuaternion, Vector2};

    use crate::estimator::SimpleEstimator;
    use crate::geometry::Pose;
    use crate::loop_closure::keyframe::{Descriptor, KeyFrame};
    use crate::loop_closure::recognizer::LoopHit;
    use crate::output::{PublishEvent, RecordingPublisher};

    /// Wait until `predicate` holds or fail after `timeout`.
    fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if predicate() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn feature_points() -> (Vec<Vector3<f64>>, Vec<f64>) {
        let points = vec![Vector3::new(0.1, 0.2, 1.0), Vector3::new(-0.2, 0.1, 1.0)];
        let ids = vec![1.0, 2.0];
        (points, ids)
    }

    #[test]
    fn test_node_end_to_end_odometry() {
        let publisher = Arc::new(RecordingPublisher::new());
        let config = NodeConfig {
            window_size: 2,
            ..NodeConfig::default()
        };
        let estimator = SimpleEstimator::with_gravity(2, Vector3::zeros());
        let mut node = VioNode::spawn(
            config,
            Box::new(estimator),
            Box::new(crate::loop_closure::BruteForceRecognizer::new()),
            publisher.clone(),
        )
        .unwrap();

        let (points, ids) = feature_points();
        // 10 frames at 1 Hz, IMU straddling each frame boundary.
        for i in 0..10u32 {
            let t = 1 + i as i64;
            node.on_imu(t, 200_000_000, Vector3::zeros(), Vector3::zeros());
            node.on_imu(t, 600_000_000, Vector3::zeros(), Vector3::zeros());
            node.on_imu(t + 1, 100_000_000, Vector3::zeros(), Vector3::zeros());
            node.on_feature_frame(t + 1, 0, &points, &ids);
        }

        // The fusion worker catches up and flips the solver stage.
        assert!(wait_until(Duration::from_secs(5), || node.core().is_nonlinear()));
        assert!(wait_until(Duration::from_secs(5), || {
            publisher
                .events
                .lock()
                .iter()
                .filter(|e| matches!(e, PublishEvent::Frame(_)))
                .count()
                >= 5
        }));

        // High-rate odometry flows once the stage is non-linear.
        node.on_imu(12, 0, Vector3::zeros(), Vector3::zeros());
        assert!(wait_until(Duration::from_secs(1), || {
            publisher
                .events
                .lock()
                .iter()
                .any(|e| matches!(e, PublishEvent::LatestOdometry(_)))
        }));

        node.shutdown();
    }

    /// Fires one scripted loop hit with a PnP pose revealing drift.
    struct OneShotRecognizer {
        fire_at: u64,
        old_index: u64,
        pnp_pose: Pose,
    }

    impl PlaceRecognizer for OneShotRecognizer {
        fn describe(&mut self, _image: &MonoImage) -> (Vec<Vector2<f64>>, Vec<Descriptor>) {
            (vec![], vec![])
        }

        fn query(&mut self, kf: &KeyFrame) -> Option<LoopHit> {
            (kf.global_index == self.fire_at).then(|| LoopHit {
                old_index: self.old_index,
                inliers: 100,
                matched_feature_ids: vec![],
                measurements_norm: vec![],
                pnp_pose: Some(self.pnp_pose),
            })
        }

        fn forget(&mut self, _indices: &[u64]) {}
    }

    #[test]
    fn test_node_loop_closure_updates_correction() {
        let publisher = Arc::new(RecordingPublisher::new());
        let config = NodeConfig {
            loop_closure: true,
            window_size: 4,
            max_keyframe_num: 10_000,
            ..NodeConfig::default()
        };
        let estimator = SimpleEstimator::with_gravity(4, Vector3::zeros());
        // PnP sees the old place shifted and rotated relative to what VIO
        // believes: the drift the pose graph must absorb.
        let recognizer = OneShotRecognizer {
            fire_at: 77,
            old_index: 40,
            pnp_pose: Pose::new(
                crate::geometry::yaw_rotation(-5.0_f64.to_radians()),
                Vector3::new(-0.5, 0.0, 0.0),
            ),
        };
        let mut node = VioNode::spawn(
            config,
            Box::new(estimator),
            Box::new(recognizer),
            publisher.clone(),
        )
        .unwrap();

        let (points, ids) = feature_points();
        let mut expected_keyframes = 0usize;
        for i in 0..95u32 {
            let t = 1 + i as i64;
            node.on_image(MonoImage::new(4, 4, vec![i as u8; 16]), t as f64 + 1.0);
            node.on_imu(t, 200_000_000, Vector3::zeros(), Vector3::zeros());
            node.on_imu(t, 600_000_000, Vector3::zeros(), Vector3::zeros());
            node.on_imu(t + 1, 100_000_000, Vector3::zeros(), Vector3::zeros());
            node.on_feature_frame(t + 1, 0, &points, &ids);

            // Window of 5 entries: marginalization starts at the 6th frame.
            if i >= 5 {
                expected_keyframes += 1;
                // Pace the producers so no keyframe is coalesced away and
                // indices stay aligned with the scripted hit.
                let want = expected_keyframes;
                assert!(
                    wait_until(Duration::from_secs(5), || {
                        node.core().keyframes.lock().len() >= want.min(90)
                    }),
                    "detector fell behind at frame {i}"
                );
            }
        }

        // The accepted loop reaches the pose graph and moves the correction.
        assert!(
            wait_until(Duration::from_secs(5), || {
                node.core().correction.get() != crate::fusion::correction::Correction::identity()
            }),
            "correction never updated"
        );
        assert!(wait_until(Duration::from_secs(5), || {
            publisher
                .events
                .lock()
                .iter()
                .any(|e| matches!(e, PublishEvent::RefinedPath(_)))
        }));

        // The loop annotation survived on the anchor keyframe.
        let db = node.core().keyframes.lock();
        let anchor = db.get(77).expect("anchor keyframe present");
        assert_eq!(anchor.loop_to, Some(40));
        assert!(anchor.loop_relative.is_some());
        assert!(db.get(40).expect("old keyframe present").is_looped);
        drop(db);

        node.shutdown();
    }
}
