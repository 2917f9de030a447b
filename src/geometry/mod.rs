//! Small rotation helpers for dead-reckoning and 4-DoF pose alignment.
//!
//! Dead-reckoning integrates gyro increments with the first-order quaternion
//! exponential; the pose-graph side only ever reasons about heading, so the
//! yaw extraction/rebuild pair lives here too.

use nalgebra::{Quaternion, UnitQuaternion, Vector3};

/// Body pose: orientation plus position in the world frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub q: UnitQuaternion<f64>,
    pub p: Vector3<f64>,
}

impl Pose {
    pub fn identity() -> Self {
        Self {
            q: UnitQuaternion::identity(),
            p: Vector3::zeros(),
        }
    }

    pub fn new(q: UnitQuaternion<f64>, p: Vector3<f64>) -> Self {
        Self { q, p }
    }
}

/// First-order quaternion increment for a small rotation vector `theta`.
///
/// `δq(θ) = [1, θ/2]`, normalized. For the gyro rates and sample periods seen
/// here the first-order form matches the exact exponential well below the
/// renormalization tolerance.
pub fn delta_q(theta: Vector3<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::from_quaternion(Quaternion::new(
        1.0,
        theta.x / 2.0,
        theta.y / 2.0,
        theta.z / 2.0,
    ))
}

/// Heading (rotation about world Z) of a body orientation, in radians.
///
/// ZYX convention: `yaw = atan2(2(qw·qz + qx·qy), 1 − 2(qy² + qz²))`.
pub fn yaw_of(q: &UnitQuaternion<f64>) -> f64 {
    let w = q.w;
    let (x, y, z) = (q.i, q.j, q.k);
    (2.0 * (w * z + x * y)).atan2(1.0 - 2.0 * (y * y + z * z))
}

/// Pure-yaw rotation about world Z.
pub fn yaw_rotation(yaw: f64) -> UnitQuaternion<f64> {
    UnitQuaternion::from_axis_angle(&Vector3::z_axis(), yaw)
}

/// Wraps an angle in radians into `(-π, π]`.
pub fn normalize_angle(angle: f64) -> f64 {
    let mut a = angle % (2.0 * std::f64::consts::PI);
    if a > std::f64::consts::PI {
        a -= 2.0 * std::f64::consts::PI;
    } else if a <= -std::f64::consts::PI {
        a += 2.0 * std::f64::consts::PI;
    }
    a
}
