//! Pairing of queued IMU samples with feature frames.
//!
//! Pure function over the locked buffer contents: repeatedly takes the oldest
//! frame together with every IMU sample up to its timestamp. The first IMU
//! sample past the frame stays queued so the next batch can integrate across
//! the frame boundary.

use tracing::warn;

use crate::msg::{FeatureFrame, ImuSample};

use super::ingress::Queues;

/// One synchronized measurement tuple.
#[derive(Debug, Clone)]
pub struct MeasurementBatch {
    pub imus: Vec<ImuSample>,
    pub frame: FeatureFrame,
}

/// Extract every currently pairable `(IMU batch, frame)` tuple.
///
/// Startup races are transient and resolve themselves:
/// - newest IMU not yet past the oldest frame: wait, keeping the frame;
/// - oldest IMU already at or past the oldest frame: that frame can never
///   get a sample strictly before it, drop it and retry.
pub fn pair_measurements(q: &mut Queues) -> Vec<MeasurementBatch> {
    let mut batches = Vec::new();

    loop {
        let (Some(newest_imu), Some(oldest_frame)) = (q.imu.back(), q.features.front()) else {
            return batches;
        };

        if newest_imu.t <= oldest_frame.t {
            warn!(
                frame_t = oldest_frame.t,
                "wait for imu, only should happen at the beginning"
            );
            q.waited_for_imu += 1;
            return batches;
        }

        if q.imu.front().is_some_and(|s| s.t >= oldest_frame.t) {
            warn!(
                frame_t = oldest_frame.t,
                "throw frame, only should happen at the beginning"
            );
            q.features.pop_front();
            continue;
        }

        let Some(frame) = q.features.pop_front() else {
            return batches;
        };
        let mut imus = Vec::new();
        while q.imu.front().is_some_and(|s| s.t <= frame.t) {
            if let Some(sample) = q.imu.pop_front() {
                imus.push(sample);
            }
        }
        batches.push(MeasurementBatch { imus, frame });
    }
}
