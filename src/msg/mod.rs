//! Wire-level message types exchanged between the transport callbacks and
//! the fusion pipeline.

use std::sync::Arc;

use nalgebra::Vector3;
use tracing::warn;

/// Single inertial measurement: body-frame specific force and angular rate.
#[derive(Debug, Clone, Copy)]
pub struct ImuSample {
    /// Monotonic timestamp in seconds.
    pub t: f64,
    /// Linear acceleration (m/s²), body frame.
    pub acc: Vector3<f64>,
    /// Angular velocity (rad/s), body frame.
    pub gyr: Vector3<f64>,
}

impl ImuSample {
    /// Build a sample from a split transport stamp.
    pub fn from_stamp(sec: i64, nsec: u32, acc: Vector3<f64>, gyr: Vector3<f64>) -> Self {
        Self {
            t: sec as f64 + nsec as f64 * 1e-9,
            acc,
            gyr,
        }
    }
}

/// One tracked feature observation: a normalized bearing (`z = 1`) on a
/// specific camera.
#[derive(Debug, Clone, Copy)]
pub struct FeaturePoint {
    pub feature_id: u64,
    pub camera_id: u32,
    /// Normalized image coordinates, `point.z == 1`.
    pub point: Vector3<f64>,
}

/// Timestamped set of feature observations produced by the visual front-end.
#[derive(Debug, Clone)]
pub struct FeatureFrame {
    /// Monotonic timestamp in seconds.
    pub t: f64,
    pub points: Vec<FeaturePoint>,
}

impl FeatureFrame {
    /// Decode a transport feature frame.
    ///
    /// The front-end packs `feature_id * num_of_cam + camera_id` into a float
    /// channel alongside each point. Channel values are integer-valued by
    /// construction; decoding rounds to the nearest integer. Points whose
    /// third coordinate is not 1 are not normalized bearings and are skipped
    /// with a warning.
    pub fn decode(
        sec: i64,
        nsec: u32,
        points: &[Vector3<f64>],
        encoded_ids: &[f64],
        num_of_cam: u32,
    ) -> Self {
        let t = sec as f64 + nsec as f64 * 1e-9;
        let num_of_cam = num_of_cam.max(1) as u64;
        let mut decoded = Vec::with_capacity(points.len());
        for (point, &encoded) in points.iter().zip(encoded_ids) {
            if (point.z - 1.0).abs() > 1e-9 {
                warn!(t, z = point.z, "feature point is not a normalized bearing, skipping");
                debug_assert!(false, "feature point with z != 1");
                continue;
            }
            let v = encoded.round() as u64;
            decoded.push(FeaturePoint {
                feature_id: v / num_of_cam,
                camera_id: (v % num_of_cam) as u32,
                point: *point,
            });
        }
        Self { t, points: decoded }
    }
}

/// Mono8 image, cheap to clone (pixels behind an `Arc`).
#[derive(Debug, Clone)]
pub struct MonoImage {
    pub width: u32,
    pub height: u32,
    pub data: Arc<[u8]>,
}

impl MonoImage {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), (width * height) as usize);
        Self {
            width,
            height,
            data: data.into(),
        }
    }
}
