//! Node configuration.
//!
//! Loaded from a YAML file; every field has a default so partial configs and
//! tests can construct one directly.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Recognized options of the fusion node.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    /// Transport name of the IMU stream.
    pub imu_topic: String,
    /// Transport name of the raw image stream (loop closure only).
    pub image_topic: String,
    /// Enables the loop coordinator (detector + pose-graph workers).
    pub loop_closure: bool,
    /// Bag-of-words vocabulary, consumed by the place-recognition backend.
    pub voc_file: PathBuf,
    /// Descriptor sampling pattern, consumed by the place-recognition backend.
    pub pattern_file: PathBuf,
    /// Camera calibration file, consumed by collaborators.
    pub cam_names: PathBuf,
    pub image_col: u32,
    pub image_row: u32,
    /// Number of cameras multiplexed into one feature frame.
    pub num_of_cam: u32,
    /// Sliding-window length of the back-end estimator.
    pub window_size: usize,
    /// Minimum geometric inliers for a loop candidate.
    pub min_loop_num: usize,
    /// Keyframe database size that triggers downsampling.
    pub max_keyframe_num: usize,
    /// Optional CSV audit log of every dead-reckoning step.
    pub predict_log: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            imu_topic: "/imu0".into(),
            image_topic: "/cam0/image_raw".into(),
            loop_closure: false,
            voc_file: PathBuf::from("support/brief_k10L6.bin"),
            pattern_file: PathBuf::from("support/brief_pattern.yml"),
            cam_names: PathBuf::from("config/camera.yaml"),
            image_col: 752,
            image_row: 480,
            num_of_cam: 1,
            window_size: 10,
            min_loop_num: 25,
            max_keyframe_num: 200,
            predict_log: None,
        }
    }
}

impl NodeConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open config {}", path.display()))?;
        serde_yaml::from_reader(file)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }
}
