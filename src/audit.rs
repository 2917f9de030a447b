//! Optional audit log of every dead-reckoning step.
//!
//! The hot path hands records to a bounded channel and never blocks; a sink
//! worker serializes them to CSV. Rows are flushed every `FLUSH_EVERY`
//! records and once more on shutdown, so a short run still lands on disk.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Sender, TrySendError};
use serde::Serialize;
use tracing::{info, warn};

use crate::fusion::predictor::PredictionStep;

/// In-flight records before the hot path starts dropping.
const CHANNEL_CAPACITY: usize = 1024;

/// Flush cadence of the CSV writer.
const FLUSH_EVERY: usize = 100;

/// One drop warning per this many lost records.
const DROP_WARN_EVERY: u64 = 100;

/// Flattened CSV row; field names follow the capture schema.
#[derive(Debug, Clone, Serialize)]
pub struct PredictionRecord {
    pub imu_timestamp_sec: i64,
    pub imu_timestamp_nsec: u32,

    pub imu_angular_velocity_x: f64,
    pub imu_angular_velocity_y: f64,
    pub imu_angular_velocity_z: f64,

    pub imu_linear_acceleration_x: f64,
    pub imu_linear_acceleration_y: f64,
    pub imu_linear_acceleration_z: f64,

    pub previous_time: f64,

    pub previous_angular_velocity_x: f64,
    pub previous_angular_velocity_y: f64,
    pub previous_angular_velocity_z: f64,

    pub previous_linear_acceleration_x: f64,
    pub previous_linear_acceleration_y: f64,
    pub previous_linear_acceleration_z: f64,

    pub previous_px: f64,
    pub previous_py: f64,
    pub previous_pz: f64,

    pub previous_vx: f64,
    pub previous_vy: f64,
    pub previous_vz: f64,

    pub previous_qw: f64,
    pub previous_qx: f64,
    pub previous_qy: f64,
    pub previous_qz: f64,

    pub bias_drx: f64,
    pub bias_dry: f64,
    pub bias_drz: f64,

    pub bias_dvx: f64,
    pub bias_dvy: f64,
    pub bias_dvz: f64,

    pub estimator_gx: f64,
    pub estimator_gy: f64,
    pub estimator_gz: f64,

    pub dt: f64,

    pub px: f64,
    pub py: f64,
    pub pz: f64,

    pub vx: f64,
    pub vy: f64,
    pub vz: f64,

    pub qw: f64,
    pub qx: f64,
    pub qy: f64,
    pub qz: f64,
}

impl From<&PredictionStep> for PredictionRecord {
    fn from(step: &PredictionStep) -> Self {
        Self {
            imu_timestamp_sec: step.t_sec,
            imu_timestamp_nsec: step.t_nsec,
            imu_angular_velocity_x: step.gyr_raw.x,
            imu_angular_velocity_y: step.gyr_raw.y,
            imu_angular_velocity_z: step.gyr_raw.z,
            imu_linear_acceleration_x: step.acc_raw.x,
            imu_linear_acceleration_y: step.acc_raw.y,
            imu_linear_acceleration_z: step.acc_raw.z,
            previous_time: step.previous_time,
            previous_angular_velocity_x: step.previous_gyr.x,
            previous_angular_velocity_y: step.previous_gyr.y,
            previous_angular_velocity_z: step.previous_gyr.z,
            previous_linear_acceleration_x: step.previous_acc.x,
            previous_linear_acceleration_y: step.previous_acc.y,
            previous_linear_acceleration_z: step.previous_acc.z,
            previous_px: step.previous_p.x,
            previous_py: step.previous_p.y,
            previous_pz: step.previous_p.z,
            previous_vx: step.previous_v.x,
            previous_vy: step.previous_v.y,
            previous_vz: step.previous_v.z,
            previous_qw: step.previous_q.w,
            previous_qx: step.previous_q.i,
            previous_qy: step.previous_q.j,
            previous_qz: step.previous_q.k,
            bias_drx: step.bias_gyr.x,
            bias_dry: step.bias_gyr.y,
            bias_drz: step.bias_gyr.z,
            bias_dvx: step.bias_acc.x,
            bias_dvy: step.bias_acc.y,
            bias_dvz: step.bias_acc.z,
            estimator_gx: step.gravity.x,
            estimator_gy: step.gravity.y,
            estimator_gz: step.gravity.z,
            dt: step.dt,
            px: step.p.x,
            py: step.p.y,
            pz: step.p.z,
            vx: step.v.x,
            vy: step.v.y,
            vz: step.v.z,
            qw: step.q.w,
            qx: step.q.i,
            qy: step.q.j,
            qz: step.q.k,
        }
    }
}

/// Clone-able handle used by the hot path.
#[derive(Debug, Clone)]
pub struct AuditSink {
    tx: Sender<PredictionRecord>,
    dropped: Arc<AtomicU64>,
}

impl AuditSink {
    /// Open the CSV file and spawn the sink worker.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<(Self, JoinHandle<()>)> {
        let path = path.as_ref().to_path_buf();
        let writer = csv::Writer::from_path(&path)
            .with_context(|| format!("Failed to open audit log {}", path.display()))?;
        let (tx, rx) = bounded::<PredictionRecord>(CHANNEL_CAPACITY);

        let handle = thread::Builder::new()
            .name("audit-sink".into())
            .spawn(move || {
                let mut writer = writer;
                let mut pending = 0usize;
                let mut written = 0u64;
                // Runs until every sender handle is dropped.
                for record in rx.iter() {
                    if let Err(e) = writer.serialize(&record) {
                        warn!(error = %e, "audit row lost");
                        continue;
                    }
                    written += 1;
                    pending += 1;
                    if pending >= FLUSH_EVERY {
                        if let Err(e) = writer.flush() {
                            warn!(error = %e, "audit flush failed");
                        }
                        pending = 0;
                    }
                }
                if let Err(e) = writer.flush() {
                    warn!(error = %e, "final audit flush failed");
                }
                info!(rows = written, "audit sink closed");
            })
            .context("Failed to spawn audit sink thread")?;

        Ok((
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            handle,
        ))
    }

    /// Non-blocking; drops the record when the sink is behind.
    pub fn record(&self, record: PredictionRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if n % DROP_WARN_EVERY == 1 {
                    warn!(dropped = n, "audit sink behind, dropping records");
                }
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
