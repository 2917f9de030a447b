//! Keyframes retained for place recognition and pose-graph alignment.

use nalgebra::{UnitQuaternion, Vector2, Vector3};

use crate::estimator::KeyframeFeature;
use crate::msg::MonoImage;

/// 256-bit binary descriptor.
pub type Descriptor = [u8; 32];

/// Relative pose of an accepted loop edge (cur → old), as estimated by the
/// back-end once the loop's header reached the sliding window.
#[derive(Debug, Clone, Copy)]
pub struct LoopRelative {
    pub t: Vector3<f64>,
    pub q: UnitQuaternion<f64>,
    /// Degrees.
    pub yaw: f64,
}

/// A selected frame kept by the keyframe database.
///
/// Carries both the raw VIO pose and the globally-corrected pose; the image
/// is released once descriptors have been extracted.
#[derive(Debug, Clone)]
pub struct KeyFrame {
    /// Stable database index, assigned by the loop detector.
    pub global_index: u64,
    pub t: f64,

    /// Pose in the estimator's (uncorrected) frame.
    pub vio_p: Vector3<f64>,
    pub vio_q: UnitQuaternion<f64>,

    /// Pose in the loop-closed world frame.
    pub p: Vector3<f64>,
    pub q: UnitQuaternion<f64>,

    pub image: Option<MonoImage>,
    pub keypoints: Vec<Vector2<f64>>,
    pub descriptors: Vec<Descriptor>,
    /// Window features captured at marginalization, for loop matching.
    pub features: Vec<KeyframeFeature>,

    /// Old keyframe this one closes a loop against, once detected.
    pub loop_to: Option<u64>,
    /// Filled by the fusion worker after the back-end confirmed the loop.
    pub loop_relative: Option<LoopRelative>,
    /// Some newer keyframe closes a loop against this one.
    pub is_looped: bool,
}

impl KeyFrame {
    pub fn new(
        t: f64,
        vio_p: Vector3<f64>,
        vio_q: UnitQuaternion<f64>,
        p: Vector3<f64>,
        q: UnitQuaternion<f64>,
        image: MonoImage,
        features: Vec<KeyframeFeature>,
    ) -> Self {
        Self {
            global_index: 0,
            t,
            vio_p,
            vio_q,
            p,
            q,
            image: Some(image),
            keypoints: Vec::new(),
            descriptors: Vec::new(),
            features,
            loop_to: None,
            loop_relative: None,
            is_looped: false,
        }
    }

    /// Drop pixel data once descriptors are extracted.
    pub fn release_image(&mut self) {
        self.image = None;
    }

    /// Clear a rejected loop annotation.
    pub fn remove_loop(&mut self) {
        self.loop_to = None;
        self.loop_relative = None;
    }
}
