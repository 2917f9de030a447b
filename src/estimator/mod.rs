//! Narrow contract to the nonlinear sliding-window back-end.
//!
//! The fusion worker drives an [`Estimator`] with interleaved IMU samples and
//! feature frames, reads back the sliding-window tail to re-seed the fast
//! predictor, and exchanges loop-closure handshake records through the
//! estimator's inbox. The optimizer internals stay behind this trait; the
//! crate ships a compact dead-reckoning backend ([`simple::SimpleEstimator`])
//! for replay runs and tests.

pub mod simple;

use nalgebra::{UnitQuaternion, Vector2, Vector3};

use crate::geometry::Pose;
use crate::msg::FeatureFrame;

pub use simple::SimpleEstimator;

/// Sanity bounds on an answered loop. Relative poses beyond these are
/// geometric nonsense: the loop is rejected and its annotation removed.
pub const MAX_LOOP_YAW_DEG: f64 = 30.0;
pub const MAX_LOOP_TRANSLATION: f64 = 20.0;

/// Externally visible solver state.
///
/// High-rate odometry publication is gated on `NonLinear`: before the window
/// is initialized the dead-reckoned pose has no usable anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverStage {
    Initial,
    NonLinear,
}

/// Snapshot of the newest window entry, used to re-seed the fast predictor
/// after each optimization.
#[derive(Debug, Clone, Copy)]
pub struct WindowTail {
    pub p: Vector3<f64>,
    pub q: UnitQuaternion<f64>,
    pub v: Vector3<f64>,
    /// Accelerometer bias.
    pub ba: Vector3<f64>,
    /// Gyroscope bias.
    pub bg: Vector3<f64>,
    /// Last raw IMU sample consumed by the estimator, body frame.
    pub acc: Vector3<f64>,
    pub gyr: Vector3<f64>,
    /// Gravity vector in the estimator's world frame.
    pub gravity: Vector3<f64>,
}

/// A window feature attached to a marginalized keyframe, for loop matching.
#[derive(Debug, Clone, Copy)]
pub struct KeyframeFeature {
    pub feature_id: u64,
    /// Triangulated position in the estimator's world frame.
    pub point: Vector3<f64>,
    /// Normalized observation in the keyframe.
    pub obs: Vector2<f64>,
}

/// State of the window slot that was just marginalized into a keyframe.
#[derive(Debug, Clone)]
pub struct KeyframeSnapshot {
    pub t: f64,
    pub p: Vector3<f64>,
    pub q: UnitQuaternion<f64>,
    pub features: Vec<KeyframeFeature>,
}

/// Loop-closure handshake record exchanged between the loop detector, the
/// fusion worker, and the estimator.
///
/// The detector fills the identity and the PnP-recovered old pose; the
/// estimator, once the record's header reaches the window tail, fills the
/// `relative_*` fields and flips `relative_pose`.
#[derive(Debug, Clone)]
pub struct RetrieveData {
    /// Keyframe database index of the newer frame of the loop.
    pub cur_index: u64,
    /// Header timestamp of that keyframe.
    pub t: f64,
    /// Old keyframe pose from the database (VIO frame).
    pub p_old: Vector3<f64>,
    pub q_old: UnitQuaternion<f64>,
    /// Old pose as recovered by PnP against the current window features.
    pub loop_pose: Pose,
    /// Matched normalized observations in the old frame.
    pub measurements: Vec<Vector2<f64>>,
    /// Feature ids of the matches, in the current window's numbering.
    pub feature_ids: Vec<u64>,
    /// Set by the estimator once `relative_*` are valid.
    pub relative_pose: bool,
    pub relative_t: Vector3<f64>,
    pub relative_q: UnitQuaternion<f64>,
    /// Degrees; the fusion worker rejects loops beyond 30°.
    pub relative_yaw: f64,
    pub relocalized: bool,
}

impl RetrieveData {
    pub fn new(
        cur_index: u64,
        t: f64,
        p_old: Vector3<f64>,
        q_old: UnitQuaternion<f64>,
        loop_pose: Pose,
        measurements: Vec<Vector2<f64>>,
        feature_ids: Vec<u64>,
    ) -> Self {
        Self {
            cur_index,
            t,
            p_old,
            q_old,
            loop_pose,
            measurements,
            feature_ids,
            relative_pose: false,
            relative_t: Vector3::zeros(),
            relative_q: UnitQuaternion::identity(),
            relative_yaw: 0.0,
            relocalized: false,
        }
    }
}

/// Sliding-window estimator contract consumed by the fusion worker.
pub trait Estimator: Send {
    /// Feed one IMU sample; `dt` is the gap to the previous sample fed.
    fn process_imu(&mut self, dt: f64, acc: Vector3<f64>, gyr: Vector3<f64>);

    /// Feed the feature frame paired with the IMU samples just fed.
    fn process_image(&mut self, frame: &FeatureFrame);

    fn stage(&self) -> SolverStage;

    /// Whether the last `process_image` marginalized the oldest window entry
    /// (i.e. produced a keyframe).
    fn marginalized_keyframe(&self) -> bool;

    fn window_tail(&self) -> WindowTail;

    /// Header timestamp of the oldest frame still in the window.
    fn oldest_frame_time(&self) -> Option<f64>;

    /// State of the keyframe slot (third-newest window entry), valid after a
    /// marginalizing `process_image`.
    fn keyframe_snapshot(&self) -> Option<KeyframeSnapshot>;

    /// Positions of all window frames, for key-pose publication.
    fn window_positions(&self) -> Vec<Vector3<f64>>;

    /// Triangulated landmarks, for point-cloud publication.
    fn landmarks(&self) -> Vec<Vector3<f64>>;

    /// Loop handshake records owned by the estimator. The fusion worker
    /// drains stale entries and pushes fresh ones from the detector here.
    fn loop_inbox(&mut self) -> &mut Vec<RetrieveData>;

    /// Global-frame correction produced by in-window relocalization against
    /// an absorbed loop, if any. Consumed once.
    fn take_relocalization(&mut self) -> Option<(UnitQuaternion<f64>, Vector3<f64>)>;

    /// Body-to-camera extrinsic, for camera-pose publication.
    fn camera_offset(&self) -> Pose {
        Pose::identity()
    }
}
