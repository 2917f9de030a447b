//! Publication seam towards downstream transport.
//!
//! The fusion pipeline hands fully-formed snapshots to a [`Publisher`];
//! actual transport wiring stays outside the crate. `TracingPublisher` logs
//! for replay runs, `RecordingPublisher` captures events for tests.

use nalgebra::{UnitQuaternion, Vector3};
use parking_lot::Mutex;
use tracing::debug;

use crate::fusion::correction::Correction;
use crate::geometry::Pose;

/// Pose + velocity at a timestamp, world frame.
#[derive(Debug, Clone, Copy)]
pub struct Odometry {
    pub t: f64,
    pub p: Vector3<f64>,
    pub q: UnitQuaternion<f64>,
    pub v: Vector3<f64>,
}

/// Per-frame estimator snapshot in the (uncorrected) estimator frame.
///
/// Kept around so the pose-graph worker can republish under a fresh
/// correction without touching the estimator.
#[derive(Debug, Clone)]
pub struct VioFrame {
    pub t: f64,
    pub p: Vector3<f64>,
    pub q: UnitQuaternion<f64>,
    pub v: Vector3<f64>,
    pub key_poses: Vec<Vector3<f64>>,
    pub camera_offset: Pose,
    pub landmarks: Vec<Vector3<f64>>,
}

/// Everything published once per fused frame, already in the corrected
/// world frame.
#[derive(Debug, Clone)]
pub struct FrameOutputs {
    pub odometry: Odometry,
    pub key_poses: Vec<Vector3<f64>>,
    pub camera_pose: Pose,
    pub point_cloud: Vec<Vector3<f64>>,
    pub tf: Pose,
}

/// One pose of the refined (loop-closed) trajectory.
#[derive(Debug, Clone, Copy)]
pub struct PathPose {
    pub t: f64,
    pub p: Vector3<f64>,
    pub q: UnitQuaternion<f64>,
}

/// Visualization snapshot of the keyframe graph.
#[derive(Debug, Clone, Default)]
pub struct PoseGraphSnapshot {
    /// `(global_index, corrected position)` per keyframe, index order.
    pub nodes: Vec<(u64, Vector3<f64>)>,
    /// `(cur_index, old_index)` per accepted loop.
    pub loop_edges: Vec<(u64, u64)>,
}

/// Apply the global correction to a frame snapshot.
pub fn correct_frame(vio: &VioFrame, correction: &Correction) -> FrameOutputs {
    let (q, p) = correction.apply(vio.q, vio.p);
    let camera_pose = Pose::new(q * vio.camera_offset.q, p + q * vio.camera_offset.p);
    FrameOutputs {
        odometry: Odometry {
            t: vio.t,
            p,
            q,
            v: vio.v,
        },
        key_poses: vio
            .key_poses
            .iter()
            .map(|kp| correction.apply_point(*kp))
            .collect(),
        camera_pose,
        point_cloud: vio
            .landmarks
            .iter()
            .map(|lm| correction.apply_point(*lm))
            .collect(),
        tf: Pose::new(q, p),
    }
}

/// Downstream publication contract.
pub trait Publisher: Send + Sync {
    /// High-rate dead-reckoned odometry, once per IMU sample.
    fn publish_latest_odometry(&self, odometry: &Odometry);

    /// Refined per-frame outputs after each optimization.
    fn publish_frame(&self, outputs: &FrameOutputs);

    /// Keyframe graph visualization, on loop events.
    fn publish_pose_graph(&self, snapshot: &PoseGraphSnapshot);

    /// Loop-closed trajectory, after pose-graph optimization.
    fn publish_refined_path(&self, path: &[PathPose]);
}

/// Logs every publication at DEBUG; used by the replay binary.
#[derive(Debug, Default)]
pub struct TracingPublisher;

impl Publisher for TracingPublisher {
    fn publish_latest_odometry(&self, odometry: &Odometry) {
        debug!(
            t = odometry.t,
            x = odometry.p.x,
            y = odometry.p.y,
            z = odometry.p.z,
            "latest odometry"
        );
    }

    fn publish_frame(&self, outputs: &FrameOutputs) {
        debug!(
            t = outputs.odometry.t,
            key_poses = outputs.key_poses.len(),
            points = outputs.point_cloud.len(),
            "frame outputs"
        );
    }

    fn publish_pose_graph(&self, snapshot: &PoseGraphSnapshot) {
        debug!(
            nodes = snapshot.nodes.len(),
            loops = snapshot.loop_edges.len(),
            "pose graph"
        );
    }

    fn publish_refined_path(&self, path: &[PathPose]) {
        debug!(poses = path.len(), "refined path");
    }
}

/// Captures every publication; test helper.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    pub events: Mutex<Vec<PublishEvent>>,
}

#[derive(Debug, Clone)]
pub enum PublishEvent {
    LatestOdometry(Odometry),
    Frame(FrameOutputs),
    PoseGraph(PoseGraphSnapshot),
    RefinedPath(Vec<PathPose>),
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<PublishEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl Publisher for RecordingPublisher {
    fn publish_latest_odometry(&self, odometry: &Odometry) {
        self.events
            .lock()
            .push(PublishEvent::LatestOdometry(*odometry));
    }

    fn publish_frame(&self, outputs: &FrameOutputs) {
        self.events.lock().push(PublishEvent::Frame(outputs.clone()));
    }

    fn publish_pose_graph(&self, snapshot: &PoseGraphSnapshot) {
        self.events
            .lock()
            .push(PublishEvent::PoseGraph(snapshot.clone()));
    }

    fn publish_refined_path(&self, path: &[PathPose]) {
        self.events
            .lock()
            .push(PublishEvent::RefinedPath(path.to_vec()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use crate::geometry::yaw_rotation;

    #[test]
    fn test_correct_frame_applies_correction_everywhere() {
        let vio = VioFrame {
            t: 1.0,
            p: Vector3::new(1.0, 0.0, 0.0),
            q: UnitQuaternion::identity(),
            v: Vector3::new(0.5, 0.0, 0.0),
            key_poses: vec![Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0)],
            camera_offset: Pose::identity(),
            landmarks: vec![Vector3::new(2.0, 0.0, 0.0)],
        };
        let correction = Correction {
            r: yaw_rotation(std::f64::consts::FRAC_PI_2),
            t: Vector3::zeros(),
        };
        let out = correct_frame(&vio, &correction);
        assert_relative_eq!(out.odometry.p, Vector3::new(0.0, 1.0, 0.0), epsilon = 1e-12);
        assert_relative_eq!(out.point_cloud[0], Vector3::new(0.0, 2.0, 0.0), epsilon = 1e-12);
        assert_relative_eq!(out.key_poses[1], Vector3::new(0.0, 1.0, 0.0), epsilon = 1e-12);
        // Velocity passes through untouched.
        assert_relative_eq!(out.odometry.v, vio.v, epsilon = 1e-12);
    }

    #[test]
    fn test_recording_publisher_captures_in_order() {
        let publisher = RecordingPublisher::new();
        publisher.publish_latest_odometry(&Odometry {
            t: 0.0,
            p: Vector3::zeros(),
            q: UnitQuaternion::identity(),
            v: Vector3::zeros(),
        });
        publisher.publish_refined_path(&[]);
        let events = publisher.take();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], PublishEvent::LatestOdometry(_)));
        assert!(matches!(events[1], PublishEvent::RefinedPath(_)));
        assert!(publisher.take().is_empty());
    }
}
