//! Global-frame correction shared between the fusion worker, the pose-graph
//! worker, and odometry publication.

use nalgebra::{UnitQuaternion, Vector3};
use parking_lot::RwLock;

/// Rigid transform applied on top of the estimator's local frame to produce
/// the loop-closed world frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correction {
    pub r: UnitQuaternion<f64>,
    pub t: Vector3<f64>,
}

impl Correction {
    pub fn identity() -> Self {
        Self {
            r: UnitQuaternion::identity(),
            t: Vector3::zeros(),
        }
    }

    /// Map a pose from the estimator frame into the corrected world frame.
    /// Velocities are left untouched by convention.
    pub fn apply(
        &self,
        q: UnitQuaternion<f64>,
        p: Vector3<f64>,
    ) -> (UnitQuaternion<f64>, Vector3<f64>) {
        (self.r * q, self.r * p + self.t)
    }

    pub fn apply_point(&self, p: Vector3<f64>) -> Vector3<f64> {
        self.r * p + self.t
    }
}

impl Default for Correction {
    fn default() -> Self {
        Self::identity()
    }
}

/// Shared cell holding the current correction.
///
/// Read by every publication site, written only by the pose-graph worker and
/// the in-window relocalization path; both components become visible in one
/// write.
#[derive(Debug, Default)]
pub struct CorrectionCell {
    inner: RwLock<Correction>,
}

impl CorrectionCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Correction {
        *self.inner.read()
    }

    pub fn set(&self, correction: Correction) {
        *self.inner.write() = correction;
    }
}
