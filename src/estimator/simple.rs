//! Compact dead-reckoning estimator backend.
//!
//! Stands in for the full nonlinear sliding-window optimizer behind the
//! [`Estimator`](super::Estimator) trait: it integrates IMU with the same
//! midpoint scheme as the fast predictor, keeps a bounded window of frame
//! states, and answers loop handshakes from its window poses. Good enough to
//! drive the node end-to-end in replay runs and tests; not a VIO solver.

use std::collections::VecDeque;

use nalgebra::{UnitQuaternion, Vector2, Vector3};

use crate::geometry::{delta_q, normalize_angle, yaw_of, yaw_rotation};
use crate::msg::{FeatureFrame, FeaturePoint};

use super::{
    Estimator, KeyframeFeature, KeyframeSnapshot, RetrieveData, SolverStage, WindowTail,
    MAX_LOOP_TRANSLATION, MAX_LOOP_YAW_DEG,
};

/// Standard gravity in the world frame; a level accelerometer reads +g.
pub const GRAVITY: Vector3<f64> = Vector3::new(0.0, 0.0, 9.81);

#[derive(Debug, Clone, Copy)]
struct FrameState {
    t: f64,
    p: Vector3<f64>,
    q: UnitQuaternion<f64>,
    v: Vector3<f64>,
}

pub struct SimpleEstimator {
    gravity: Vector3<f64>,
    /// Window holds `window_size + 1` frame states once full.
    capacity: usize,

    p: Vector3<f64>,
    q: UnitQuaternion<f64>,
    v: Vector3<f64>,
    ba: Vector3<f64>,
    bg: Vector3<f64>,
    acc_0: Vector3<f64>,
    gyr_0: Vector3<f64>,
    imu_seen: bool,

    frames: VecDeque<FrameState>,
    marginalized: bool,
    stage: SolverStage,

    last_points: Vec<FeaturePoint>,
    inbox: Vec<RetrieveData>,
    relocalization: Option<(UnitQuaternion<f64>, Vector3<f64>)>,
}

impl SimpleEstimator {
    pub fn new(window_size: usize) -> Self {
        Self::with_gravity(window_size, GRAVITY)
    }

    pub fn with_gravity(window_size: usize, gravity: Vector3<f64>) -> Self {
        Self {
            gravity,
            capacity: window_size + 1,
            p: Vector3::zeros(),
            q: UnitQuaternion::identity(),
            v: Vector3::zeros(),
            ba: Vector3::zeros(),
            bg: Vector3::zeros(),
            acc_0: Vector3::zeros(),
            gyr_0: Vector3::zeros(),
            imu_seen: false,
            frames: VecDeque::new(),
            marginalized: false,
            stage: SolverStage::Initial,
            last_points: Vec::new(),
            inbox: Vec::new(),
            relocalization: None,
        }
    }

    /// Answer the oldest pending handshake while its header is still inside
    /// the window: fill the cur→old relative pose and derive the
    /// relocalization drift that maps the PnP-recovered old pose onto the
    /// stored one.
    fn answer_loop_handshake(&mut self) {
        let Some(rd) = self.inbox.first_mut() else {
            return;
        };
        if rd.relative_pose {
            return;
        }
        let Some(hit) = self
            .frames
            .iter()
            .find(|f| (f.t - rd.t).abs() < 1e-9)
            .copied()
        else {
            return;
        };

        let loop_q = rd.loop_pose.q;
        let loop_p = rd.loop_pose.p;
        rd.relative_q = loop_q.inverse() * hit.q;
        rd.relative_t = loop_q.inverse() * (hit.p - loop_p);
        rd.relative_yaw = normalize_angle(yaw_of(&hit.q) - yaw_of(&loop_q)).to_degrees();
        rd.relative_pose = true;

        // Only a geometrically sane loop is trusted for relocalization; the
        // handshake fields are reported either way so the caller can judge.
        if rd.relative_yaw.abs() > MAX_LOOP_YAW_DEG || rd.relative_t.norm() > MAX_LOOP_TRANSLATION {
            return;
        }
        rd.relocalized = true;

        let yaw_drift = normalize_angle(yaw_of(&rd.q_old) - yaw_of(&loop_q));
        let r = yaw_rotation(yaw_drift);
        let t = rd.p_old - r * loop_p;
        self.relocalization = Some((r, t));
    }
}

impl Estimator for SimpleEstimator {
    fn process_imu(&mut self, dt: f64, acc: Vector3<f64>, gyr: Vector3<f64>) {
        if !self.imu_seen {
            self.acc_0 = acc;
            self.gyr_0 = gyr;
            self.imu_seen = true;
            return;
        }
        let un_acc_0 = self.q * (self.acc_0 - self.ba) - self.gravity;
        let un_gyr = 0.5 * (self.gyr_0 + gyr) - self.bg;
        self.q = UnitQuaternion::from_quaternion(
            self.q.into_inner() * delta_q(un_gyr * dt).into_inner(),
        );
        let un_acc_1 = self.q * (acc - self.ba) - self.gravity;
        let un_acc = 0.5 * (un_acc_0 + un_acc_1);
        self.p += dt * self.v + 0.5 * dt * dt * un_acc;
        self.v += dt * un_acc;
        self.acc_0 = acc;
        self.gyr_0 = gyr;
    }

    fn process_image(&mut self, frame: &FeatureFrame) {
        self.frames.push_back(FrameState {
            t: frame.t,
            p: self.p,
            q: self.q,
            v: self.v,
        });
        self.marginalized = self.frames.len() > self.capacity;
        if self.marginalized {
            self.frames.pop_front();
        }
        if self.frames.len() == self.capacity {
            self.stage = SolverStage::NonLinear;
        }
        self.last_points = frame.points.clone();
        self.answer_loop_handshake();
    }

    fn stage(&self) -> SolverStage {
        self.stage
    }

    fn marginalized_keyframe(&self) -> bool {
        self.marginalized
    }

    fn window_tail(&self) -> WindowTail {
        WindowTail {
            p: self.p,
            q: self.q,
            v: self.v,
            ba: self.ba,
            bg: self.bg,
            acc: self.acc_0,
            gyr: self.gyr_0,
            gravity: self.gravity,
        }
    }

    fn oldest_frame_time(&self) -> Option<f64> {
        self.frames.front().map(|f| f.t)
    }

    fn keyframe_snapshot(&self) -> Option<KeyframeSnapshot> {
        // Keyframe slot is the third-newest window entry.
        if self.frames.len() < 3 {
            return None;
        }
        let slot = &self.frames[self.frames.len() - 3];
        let features = self
            .last_points
            .iter()
            .map(|fp| KeyframeFeature {
                feature_id: fp.feature_id,
                // Unit-depth stand-in for triangulation.
                point: slot.q * fp.point + slot.p,
                obs: Vector2::new(fp.point.x, fp.point.y),
            })
            .collect();
        Some(KeyframeSnapshot {
            t: slot.t,
            p: slot.p,
            q: slot.q,
            features,
        })
    }

    fn window_positions(&self) -> Vec<Vector3<f64>> {
        self.frames.iter().map(|f| f.p).collect()
    }

    fn landmarks(&self) -> Vec<Vector3<f64>> {
        self.last_points
            .iter()
            .map(|fp| self.q * fp.point + self.p)
            .collect()
    }

    fn loop_inbox(&mut self) -> &mut Vec<RetrieveData> {
        &mut self.inbox
    }

    fn take_relocalization(&mut self) -> Option<(UnitQuaternion<f64>, Vector3<f64>)> {
        self.relocalization.take()
    }
}
