//! Keyframe database: owned keyframes behind stable indices.
//!
//! Components never hold keyframes directly; they refer to them by
//! `global_index` and look them up here. The database also derives the
//! refined path and the pose-graph visualization snapshot, and is the single
//! place corrected poses get rewritten after a pose-graph run.

use std::collections::BTreeMap;

use tracing::warn;

use crate::fusion::correction::Correction;
use crate::output::{PathPose, PoseGraphSnapshot};

use super::keyframe::{KeyFrame, LoopRelative};

#[derive(Debug, Default)]
pub struct KeyFrameDatabase {
    frames: BTreeMap<u64, KeyFrame>,
}

impl KeyFrameDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, kf: KeyFrame) {
        self.frames.insert(kf.global_index, kf);
    }

    pub fn get(&self, index: u64) -> Option<&KeyFrame> {
        self.frames.get(&index)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Attach the back-end's relative pose to an accepted loop. Returns
    /// false when the keyframe has been evicted in the meantime.
    pub fn update_loop_connection(&mut self, index: u64, relative: LoopRelative) -> bool {
        match self.frames.get_mut(&index) {
            Some(kf) => {
                kf.loop_relative = Some(relative);
                true
            }
            None => {
                warn!(index, "loop connection for unknown keyframe, dropping");
                false
            }
        }
    }

    /// Clear the loop annotation of a rejected candidate.
    pub fn remove_loop(&mut self, index: u64) {
        if let Some(kf) = self.frames.get_mut(&index) {
            kf.remove_loop();
        }
    }

    /// Mark both endpoints of a detected loop.
    pub fn mark_loop(&mut self, cur_index: u64, old_index: u64) {
        if let Some(cur) = self.frames.get_mut(&cur_index) {
            cur.loop_to = Some(old_index);
        }
        if let Some(old) = self.frames.get_mut(&old_index) {
            old.is_looped = true;
        }
    }

    /// Thin out the database, keeping loop endpoints and the newest frame.
    /// Every second plain keyframe is evicted; the erased indices are
    /// returned so the place-recognition index can forget them too.
    pub fn downsample(&mut self) -> Vec<u64> {
        let newest = self.frames.keys().next_back().copied();
        let mut erase = Vec::new();
        let mut keep_next = true;
        for (index, kf) in &self.frames {
            if kf.loop_to.is_some() || kf.is_looped || Some(*index) == newest {
                continue;
            }
            if keep_next {
                keep_next = false;
            } else {
                erase.push(*index);
                keep_next = true;
            }
        }
        for index in &erase {
            self.frames.remove(index);
        }
        erase
    }

    /// Rewrite every corrected pose from the VIO pose and a fresh drift.
    pub fn apply_drift(&mut self, correction: &Correction) {
        for kf in self.frames.values_mut() {
            let (q, p) = correction.apply(kf.vio_q, kf.vio_p);
            kf.q = q;
            kf.p = p;
        }
    }

    /// Loop-closed trajectory, index order.
    pub fn path(&self) -> Vec<PathPose> {
        self.frames
            .values()
            .map(|kf| PathPose {
                t: kf.t,
                p: kf.p,
                q: kf.q,
            })
            .collect()
    }

    /// Visualization snapshot: corrected node positions plus loop edges.
    pub fn snapshot(&self) -> PoseGraphSnapshot {
        PoseGraphSnapshot {
            nodes: self.frames.values().map(|kf| (kf.global_index, kf.p)).collect(),
            loop_edges: self
                .frames
                .values()
                .filter_map(|kf| kf.loop_to.map(|old| (kf.global_index, old)))
                .collect(),
        }
    }
}
