//! Loop-detection worker.
//!
//! Consumes keyframes from the fusion worker (keeping only the newest when
//! it falls behind), registers them into the keyframe database and the
//! place-recognition index, and turns qualified revisits into handshake
//! records for the back-end. Slow detection or database growth triggers
//! downsampling.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::estimator::RetrieveData;
use crate::fusion::FusionCore;
use crate::geometry::Pose;

use super::keyframe::KeyFrame;
use super::recognizer::PlaceRecognizer;

/// Brief sleep between iterations, and the shutdown poll cadence.
const RECV_TIMEOUT: Duration = Duration::from_millis(10);

/// Detection slower than this triggers database downsampling.
const SLOW_DETECTION: Duration = Duration::from_secs(1);

/// Temporal guard: a loop must span more than this many keyframes...
const MIN_LOOP_GAP: u64 = 35;
/// ...and may not target the very beginning of the run.
const MIN_OLD_INDEX: u64 = 30;

pub struct LoopDetector {
    core: Arc<FusionCore>,
    kf_rx: Receiver<KeyFrame>,
    retrieve_tx: Sender<RetrieveData>,
    recognizer: Box<dyn PlaceRecognizer>,
    next_index: u64,
    stale_dropped: u64,
}

impl LoopDetector {
    pub fn new(
        core: Arc<FusionCore>,
        kf_rx: Receiver<KeyFrame>,
        retrieve_tx: Sender<RetrieveData>,
        recognizer: Box<dyn PlaceRecognizer>,
    ) -> Self {
        Self {
            core,
            kf_rx,
            retrieve_tx,
            recognizer,
            next_index: 0,
            stale_dropped: 0,
        }
    }

    pub fn run(mut self) {
        info!("loop detector started");
        loop {
            if self.core.is_shutdown() {
                break;
            }
            if !self.poll() {
                break;
            }
        }
        info!(
            keyframes = self.next_index,
            stale_dropped = self.stale_dropped,
            "loop detector exiting"
        );
    }

    /// One receive cycle. Returns false when the inbox has disconnected.
    fn poll(&mut self) -> bool {
        let first = match self.kf_rx.recv_timeout(RECV_TIMEOUT) {
            Ok(kf) => kf,
            Err(RecvTimeoutError::Timeout) => return true,
            Err(RecvTimeoutError::Disconnected) => return false,
        };
        // Take the newest pending keyframe, drop the rest.
        let mut kf = first;
        for newer in self.kf_rx.try_iter() {
            kf = newer;
            self.stale_dropped += 1;
        }
        self.process_keyframe(kf);
        true
    }

    fn process_keyframe(&mut self, mut kf: KeyFrame) {
        kf.global_index = self.next_index;
        self.next_index += 1;

        let started = Instant::now();
        if let Some(image) = kf.image.clone() {
            let (keypoints, descriptors) = self.recognizer.describe(&image);
            kf.keypoints = keypoints;
            kf.descriptors = descriptors;
        }
        let hit = self.recognizer.query(&kf);
        let elapsed = started.elapsed();
        debug!(index = kf.global_index, ?elapsed, "loop detection pass");

        let mut accepted = None;
        if let Some(hit) = hit {
            if hit.inliers > self.core.config.min_loop_num
                && kf.global_index > hit.old_index + MIN_LOOP_GAP
                && hit.old_index > MIN_OLD_INDEX
            {
                accepted = self.emit_handshake(&kf, hit);
            } else {
                debug!(
                    inliers = hit.inliers,
                    old = hit.old_index,
                    "loop candidate below thresholds"
                );
            }
        }

        kf.release_image();
        let cur_index = kf.global_index;
        let snapshot = {
            let mut db = self.core.keyframes.lock();
            db.add(kf);
            accepted.map(|old_index| {
                db.mark_loop(cur_index, old_index);
                db.snapshot()
            })
        };
        if let Some(snapshot) = snapshot {
            self.core.publisher.publish_pose_graph(&snapshot);
        }

        self.maybe_downsample(elapsed);
    }

    /// Build the handshake record for a qualified candidate and hand it to
    /// the fusion worker. Returns the old keyframe index once the record is
    /// on its way.
    fn emit_handshake(
        &mut self,
        kf: &KeyFrame,
        hit: super::recognizer::LoopHit,
    ) -> Option<u64> {
        let old_index = hit.old_index;
        let old_pose = {
            let db = self.core.keyframes.lock();
            db.get(old_index).map(|old| (old.vio_p, old.vio_q))
        };
        let Some((p_old, q_old)) = old_pose else {
            warn!(old_index, "loop candidate refers to unknown keyframe, discarding");
            debug_assert!(false, "loop candidate target missing from database");
            return None;
        };

        info!(
            cur = kf.global_index,
            old = old_index,
            inliers = hit.inliers,
            "loop detected"
        );
        let loop_pose = hit.pnp_pose.unwrap_or(Pose::new(q_old, p_old));
        let record = RetrieveData::new(
            kf.global_index,
            kf.t,
            p_old,
            q_old,
            loop_pose,
            hit.measurements_norm,
            hit.matched_feature_ids,
        );
        if self.retrieve_tx.try_send(record).is_err() {
            warn!("handshake inbox unavailable, dropping loop");
            return None;
        }
        Some(old_index)
    }

    fn maybe_downsample(&mut self, elapsed: Duration) {
        let needed = elapsed > SLOW_DETECTION
            || self.core.keyframes.lock().len() > self.core.config.max_keyframe_num;
        if !needed {
            return;
        }
        let erased = self.core.keyframes.lock().downsample();
        if !erased.is_empty() {
            info!(erased = erased.len(), "keyframe database downsampled");
            self.recognizer.forget(&erased);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use nalgebra::{UnitQuaternion, Vector3};

    use crate::config::NodeConfig;
    use crate::fusion::FusionCore;
    use crate::loop_closure::keyframe::Descriptor;
    use crate::loop_closure::recognizer::LoopHit;
    use crate::msg::MonoImage;
    use crate::output::{PublishEvent, RecordingPublisher};

    /// Recognizer stub answering from a queue of scripted hits.
    struct ScriptedRecognizer {
        hits: Vec<Option<LoopHit>>,
        forgotten: Vec<u64>,
    }

    impl ScriptedRecognizer {
        fn new(hits: Vec<Option<LoopHit>>) -> Self {
            Self {
                hits,
                forgotten: Vec::new(),
            }
        }
    }

    impl PlaceRecognizer for ScriptedRecognizer {
        fn describe(&mut self, _image: &MonoImage) -> (Vec<nalgebra::Vector2<f64>>, Vec<Descriptor>) {
            (vec![], vec![])
        }

        fn query(&mut self, _kf: &KeyFrame) -> Option<LoopHit> {
            if self.hits.is_empty() {
                None
            } else {
                self.hits.remove(0)
            }
        }

        fn forget(&mut self, indices: &[u64]) {
            self.forgotten.extend_from_slice(indices);
        }
    }

    struct Rig {
        detector: LoopDetector,
        kf_tx: Sender<KeyFrame>,
        retrieve_rx: Receiver<RetrieveData>,
        core: Arc<FusionCore>,
        publisher: Arc<RecordingPublisher>,
    }

    fn rig(hits: Vec<Option<LoopHit>>) -> Rig {
        let publisher = Arc::new(RecordingPublisher::new());
        let core = FusionCore::new(
            NodeConfig {
                loop_closure: true,
                min_loop_num: 5,
                ..NodeConfig::default()
            },
            publisher.clone(),
            None,
        );
        let (kf_tx, kf_rx) = bounded(16);
        let (retrieve_tx, retrieve_rx) = bounded(16);
        let detector = LoopDetector::new(
            core.clone(),
            kf_rx,
            retrieve_tx,
            Box::new(ScriptedRecognizer::new(hits)),
        );
        Rig {
            detector,
            kf_tx,
            retrieve_rx,
            core,
            publisher,
        }
    }

    fn keyframe(t: f64, x: f64) -> KeyFrame {
        KeyFrame::new(
            t,
            Vector3::new(x, 0.0, 0.0),
            UnitQuaternion::identity(),
            Vector3::new(x, 0.0, 0.0),
            UnitQuaternion::identity(),
            MonoImage::new(2, 2, vec![0; 4]),
            vec![],
        )
    }

    fn hit(old_index: u64, inliers: usize) -> LoopHit {
        LoopHit {
            old_index,
            inliers,
            matched_feature_ids: vec![1, 2, 3],
            measurements_norm: vec![],
            pnp_pose: None,
        }
    }

    #[test]
    fn test_indices_assigned_in_arrival_order() {
        let mut r = rig(vec![None, None]);
        r.detector.process_keyframe(keyframe(1.0, 0.0));
        r.detector.process_keyframe(keyframe(2.0, 1.0));
        let db = r.core.keyframes.lock();
        assert!(db.get(0).is_some());
        assert!(db.get(1).is_some());
        // Images are released once described.
        assert!(db.get(0).unwrap().image.is_none());
    }

    #[test]
    fn test_poll_keeps_only_newest_pending_keyframe() {
        let mut r = rig(vec![None]);
        r.kf_tx.send(keyframe(1.0, 0.0)).unwrap();
        r.kf_tx.send(keyframe(2.0, 1.0)).unwrap();
        r.kf_tx.send(keyframe(3.0, 2.0)).unwrap();
        assert!(r.detector.poll());
        let db = r.core.keyframes.lock();
        assert_eq!(db.len(), 1);
        assert_eq!(db.get(0).unwrap().t, 3.0);
        drop(db);
        assert_eq!(r.detector.stale_dropped, 2);
    }

    #[test]
    fn test_temporal_guard_blocks_recent_loops() {
        // Candidate 10 frames back: plenty of inliers, still refused.
        let mut r = rig(vec![Some(hit(60, 50))]);
        r.detector.next_index = 70;
        r.core.keyframes.lock().add({
            let mut kf = keyframe(6.0, 6.0);
            kf.global_index = 60;
            kf
        });
        r.detector.process_keyframe(keyframe(7.0, 7.0));
        assert!(r.retrieve_rx.try_recv().is_err());
        assert!(r.core.keyframes.lock().get(70).unwrap().loop_to.is_none());
    }

    #[test]
    fn test_weak_candidate_refused() {
        let mut r = rig(vec![Some(hit(40, 3))]);
        r.detector.next_index = 100;
        r.detector.process_keyframe(keyframe(10.0, 10.0));
        assert!(r.retrieve_rx.try_recv().is_err());
    }

    #[test]
    fn test_accepted_candidate_emits_handshake_and_marks_both() {
        let mut r = rig(vec![Some(hit(40, 50))]);
        r.detector.next_index = 100;
        r.core.keyframes.lock().add({
            let mut kf = keyframe(4.0, 4.0);
            kf.global_index = 40;
            kf
        });
        r.detector.process_keyframe(keyframe(10.0, 10.0));

        let record = r.retrieve_rx.try_recv().expect("handshake emitted");
        assert_eq!(record.cur_index, 100);
        assert_eq!(record.t, 10.0);
        approx::assert_relative_eq!(record.p_old, Vector3::new(4.0, 0.0, 0.0), epsilon = 1e-12);
        // No PnP backend: recovered pose falls back to the stored old pose.
        approx::assert_relative_eq!(record.loop_pose.p, record.p_old, epsilon = 1e-12);
        assert!(!record.relative_pose);

        let db = r.core.keyframes.lock();
        assert_eq!(db.get(100).unwrap().loop_to, Some(40));
        assert!(db.get(40).unwrap().is_looped);
        drop(db);
        let snapshots = r
            .publisher
            .take()
            .into_iter()
            .filter(|e| matches!(e, PublishEvent::PoseGraph(_)))
            .count();
        assert_eq!(snapshots, 1);
    }

    #[cfg(not(debug_assertions))]
    #[test]
    fn test_missing_old_keyframe_discards_candidate() {
        let mut r = rig(vec![Some(hit(40, 50))]);
        r.detector.next_index = 100;
        // Database does not contain keyframe 40.
        r.detector.process_keyframe(keyframe(10.0, 10.0));
        assert!(r.retrieve_rx.try_recv().is_err());
        assert!(r.core.keyframes.lock().get(100).unwrap().loop_to.is_none());
    }

    #[test]
    fn test_database_growth_triggers_downsampling() {
        let publisher = Arc::new(RecordingPublisher::new());
        let core = FusionCore::new(
            NodeConfig {
                loop_closure: true,
                max_keyframe_num: 10,
                ..NodeConfig::default()
            },
            publisher,
            None,
        );
        let (_kf_tx, kf_rx) = bounded::<KeyFrame>(16);
        let (retrieve_tx, _retrieve_rx) = bounded(16);
        let mut detector = LoopDetector::new(
            core.clone(),
            kf_rx,
            retrieve_tx,
            Box::new(ScriptedRecognizer::new(vec![])),
        );
        for i in 0..15 {
            detector.process_keyframe(keyframe(i as f64, i as f64));
        }
        assert!(core.keyframes.lock().len() < 15);
        let forgotten = {
            // recognizer is boxed away; verify through the database size and
            // the fact indices stayed stable for the survivors
            let db = core.keyframes.lock();
            db.get(14).is_some()
        };
        assert!(forgotten);
    }
}
