//! Place-recognition seam for loop detection.
//!
//! The real system uses a BRIEF bag-of-words vocabulary with geometric
//! verification and PnP pose recovery; all of that sits behind
//! [`PlaceRecognizer`]. The bundled [`BruteForceRecognizer`] is a very small
//! stand-in: grid-sampled binary descriptors matched by Hamming distance.
//! It recognizes genuinely similar images and can be upgraded without
//! touching the detector.

use nalgebra::Vector2;

use crate::geometry::Pose;
use crate::msg::MonoImage;

use super::keyframe::{Descriptor, KeyFrame};

/// A loop candidate returned by the recognizer.
#[derive(Debug, Clone)]
pub struct LoopHit {
    pub old_index: u64,
    /// Geometrically consistent matches; gates acceptance.
    pub inliers: usize,
    /// Matched feature ids in the current window's numbering.
    pub matched_feature_ids: Vec<u64>,
    /// Matched normalized observations in the old frame.
    pub measurements_norm: Vec<Vector2<f64>>,
    /// Old pose recovered by PnP against current window landmarks, when the
    /// backend provides one.
    pub pnp_pose: Option<Pose>,
}

pub trait PlaceRecognizer: Send {
    /// Extract keypoints and binary descriptors from a keyframe image.
    fn describe(&mut self, image: &MonoImage) -> (Vec<Vector2<f64>>, Vec<Descriptor>);

    /// Register the keyframe into the index and search earlier keyframes for
    /// a revisit.
    fn query(&mut self, kf: &KeyFrame) -> Option<LoopHit>;

    /// Drop evicted keyframes from the index.
    fn forget(&mut self, indices: &[u64]);
}

/// Hamming distance below which two descriptors count as a match.
const MATCH_THRESHOLD: u32 = 40;

/// Descriptor sampling grid (per axis).
const GRID: u32 = 8;

struct IndexEntry {
    index: u64,
    keypoints: Vec<Vector2<f64>>,
    descriptors: Vec<Descriptor>,
}

/// Exhaustive descriptor matcher over all indexed keyframes.
#[derive(Default)]
pub struct BruteForceRecognizer {
    entries: Vec<IndexEntry>,
}

impl BruteForceRecognizer {
    pub fn new() -> Self {
        Self::default()
    }

    fn matches(a: &[Descriptor], b: &[Descriptor]) -> Vec<(usize, usize)> {
        let mut pairs = Vec::new();
        for (i, da) in a.iter().enumerate() {
            let best = b
                .iter()
                .enumerate()
                .map(|(j, db)| (j, hamming(da, db)))
                .min_by_key(|&(_, d)| d);
            if let Some((j, d)) = best {
                if d <= MATCH_THRESHOLD {
                    pairs.push((i, j));
                }
            }
        }
        pairs
    }
}

fn hamming(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x ^ y).count_ones())
        .sum()
}

impl PlaceRecognizer for BruteForceRecognizer {
    /// Keypoints on a fixed grid; each descriptor samples the 32 pixels
    /// following the grid point in row-major order.
    fn describe(&mut self, image: &MonoImage) -> (Vec<Vector2<f64>>, Vec<Descriptor>) {
        let mut keypoints = Vec::new();
        let mut descriptors = Vec::new();
        if image.width == 0 || image.height == 0 {
            return (keypoints, descriptors);
        }
        let step_x = (image.width / GRID).max(1);
        let step_y = (image.height / GRID).max(1);
        let len = image.data.len();
        for gy in 0..GRID {
            for gx in 0..GRID {
                let x = gx * step_x;
                let y = gy * step_y;
                if x >= image.width || y >= image.height {
                    continue;
                }
                let offset = (y * image.width + x) as usize;
                let mut descriptor = [0u8; 32];
                for (k, byte) in descriptor.iter_mut().enumerate() {
                    *byte = image.data[(offset + k) % len];
                }
                keypoints.push(Vector2::new(
                    x as f64 / image.width as f64,
                    y as f64 / image.height as f64,
                ));
                descriptors.push(descriptor);
            }
        }
        (keypoints, descriptors)
    }

    fn query(&mut self, kf: &KeyFrame) -> Option<LoopHit> {
        let mut best: Option<(usize, Vec<(usize, usize)>)> = None;
        for (slot, entry) in self.entries.iter().enumerate() {
            let pairs = Self::matches(&kf.descriptors, &entry.descriptors);
            if best.as_ref().map_or(true, |(_, b)| pairs.len() > b.len()) {
                best = Some((slot, pairs));
            }
        }

        self.entries.push(IndexEntry {
            index: kf.global_index,
            keypoints: kf.keypoints.clone(),
            descriptors: kf.descriptors.clone(),
        });

        let (slot, pairs) = best?;
        if pairs.is_empty() {
            return None;
        }
        let entry = &self.entries[slot];
        let measurements_norm = pairs
            .iter()
            .map(|&(_, j)| entry.keypoints[j])
            .collect::<Vec<_>>();
        // Window feature ids are not tracked by this matcher; hand back the
        // keyframe's own features in match order as an approximation.
        let matched_feature_ids = kf
            .features
            .iter()
            .take(pairs.len())
            .map(|f| f.feature_id)
            .collect();
        Some(LoopHit {
            old_index: entry.index,
            inliers: pairs.len(),
            matched_feature_ids,
            measurements_norm,
            pnp_pose: None,
        })
    }

    fn forget(&mut self, indices: &[u64]) {
        self.entries.retain(|e| !indices.contains(&e.index));
    }
}
