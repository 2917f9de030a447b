//! CSV replay of recorded IMU and feature streams.
//!
//! Stands in for live transport subscriptions: the two streams are merged in
//! timestamp order and pushed through the node's producer callbacks exactly
//! as a transport layer would.
//!
//! Formats (`#` comments, no header):
//! - `imu.csv`: `timestamp_ns, wx, wy, wz, ax, ay, az`
//! - `features.csv`: `timestamp_ns, feature_id, camera_id, x, y` with
//!   rows of one frame sharing a timestamp.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use csv::ReaderBuilder;
use nalgebra::Vector3;

use crate::node::VioNode;

#[derive(Debug, Clone)]
pub struct ImuRecord {
    pub sec: i64,
    pub nsec: u32,
    pub acc: Vector3<f64>,
    pub gyr: Vector3<f64>,
}

#[derive(Debug, Clone)]
pub struct FrameRecord {
    pub sec: i64,
    pub nsec: u32,
    /// Normalized bearings, `z = 1`.
    pub points: Vec<Vector3<f64>>,
    /// `feature_id * num_of_cam + camera_id`, float-encoded.
    pub encoded_ids: Vec<f64>,
}

impl ImuRecord {
    fn t(&self) -> f64 {
        self.sec as f64 + self.nsec as f64 * 1e-9
    }
}

impl FrameRecord {
    fn t(&self) -> f64 {
        self.sec as f64 + self.nsec as f64 * 1e-9
    }
}

#[derive(Debug)]
pub enum ReplayEvent<'a> {
    Imu(&'a ImuRecord),
    Frame(&'a FrameRecord),
}

#[derive(Debug)]
pub struct ReplayDataset {
    pub imu: Vec<ImuRecord>,
    pub frames: Vec<FrameRecord>,
}

impl ReplayDataset {
    pub fn load<P: AsRef<Path>>(root: P, num_of_cam: u32) -> Result<Self> {
        let root = root.as_ref();
        let imu = load_imu(root.join("imu.csv"))?;
        let frames = load_frames(root.join("features.csv"), num_of_cam)?;
        Ok(Self { imu, frames })
    }

    /// Both streams merged in timestamp order; IMU wins ties so a frame is
    /// always preceded by its straddling samples.
    pub fn events(&self) -> impl Iterator<Item = ReplayEvent<'_>> + '_ {
        let mut imu = self.imu.iter().peekable();
        let mut frames = self.frames.iter().peekable();
        std::iter::from_fn(move || match (imu.peek(), frames.peek()) {
            (Some(s), Some(f)) => {
                if s.t() <= f.t() {
                    imu.next().map(ReplayEvent::Imu)
                } else {
                    frames.next().map(ReplayEvent::Frame)
                }
            }
            (Some(_), None) => imu.next().map(ReplayEvent::Imu),
            (None, Some(_)) => frames.next().map(ReplayEvent::Frame),
            (None, None) => None,
        })
    }

    /// Push the whole dataset through the node's callbacks.
    pub fn feed(&self, node: &VioNode) {
        for event in self.events() {
            match event {
                ReplayEvent::Imu(s) => node.on_imu(s.sec, s.nsec, s.acc, s.gyr),
                ReplayEvent::Frame(f) => {
                    node.on_feature_frame(f.sec, f.nsec, &f.points, &f.encoded_ids)
                }
            }
        }
    }
}

fn split_ns(ts: u64) -> (i64, u32) {
    ((ts / 1_000_000_000) as i64, (ts % 1_000_000_000) as u32)
}

fn load_imu(path: PathBuf) -> Result<Vec<ImuRecord>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .from_path(&path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let mut records = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        if rec.len() < 7 {
            continue;
        }
        let ts: u64 = rec[0].trim().parse()?;
        let (sec, nsec) = split_ns(ts);
        let gyr = Vector3::new(
            rec[1].trim().parse()?,
            rec[2].trim().parse()?,
            rec[3].trim().parse()?,
        );
        let acc = Vector3::new(
            rec[4].trim().parse()?,
            rec[5].trim().parse()?,
            rec[6].trim().parse()?,
        );
        records.push(ImuRecord { sec, nsec, acc, gyr });
    }
    Ok(records)
}

fn load_frames(path: PathBuf, num_of_cam: u32) -> Result<Vec<FrameRecord>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .from_path(&path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let mut frames: Vec<FrameRecord> = Vec::new();
    let mut current_ts: Option<u64> = None;
    for rec in rdr.records() {
        let rec = rec?;
        if rec.len() < 5 {
            continue;
        }
        let ts: u64 = rec[0].trim().parse()?;
        let feature_id: u64 = rec[1].trim().parse()?;
        let camera_id: u32 = rec[2].trim().parse()?;
        let x: f64 = rec[3].trim().parse()?;
        let y: f64 = rec[4].trim().parse()?;

        if current_ts != Some(ts) {
            let (sec, nsec) = split_ns(ts);
            frames.push(FrameRecord {
                sec,
                nsec,
                points: Vec::new(),
                encoded_ids: Vec::new(),
            });
            current_ts = Some(ts);
        }
        if let Some(frame) = frames.last_mut() {
            frame.points.push(Vector3::new(x, y, 1.0));
            frame
                .encoded_ids
                .push((feature_id * num_of_cam.max(1) as u64 + camera_id as u64) as f64);
        }
    }
    Ok(frames)
}
