//! Ingress buffers between the transport callbacks and the fusion worker.
//!
//! IMU and feature queues share one lock and one condition variable: a push
//! takes the lock, appends, and wakes the single fusion consumer. The raw
//! image queue (loop-closure mode) lives under its own lock since only the
//! keyframe path reads it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::warn;

use crate::msg::{FeatureFrame, ImuSample, MonoImage};

/// Per-stream capacity; sized for burst safety at high IMU rates.
pub const QUEUE_CAPACITY: usize = 2000;

/// One overflow warning per this many dropped messages.
const DROP_WARN_EVERY: u64 = 100;

/// Buffer contents, guarded by the shared lock.
#[derive(Debug, Default)]
pub struct Queues {
    pub imu: VecDeque<ImuSample>,
    pub features: VecDeque<FeatureFrame>,
    /// Times the pairer had to wait for IMU to catch up with a frame.
    pub waited_for_imu: u64,
}

/// IMU + feature ingress, single consumer.
#[derive(Debug, Default)]
pub struct MeasurementQueues {
    inner: Mutex<Queues>,
    available: Condvar,
    imu_dropped: AtomicU64,
    features_dropped: AtomicU64,
}

impl MeasurementQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_imu(&self, sample: ImuSample) {
        {
            let mut q = self.inner.lock();
            if q.imu.len() == QUEUE_CAPACITY {
                q.imu.pop_front();
                let n = self.imu_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if n % DROP_WARN_EVERY == 1 {
                    warn!(dropped = n, "imu queue full, dropping oldest sample");
                }
            }
            q.imu.push_back(sample);
        }
        self.available.notify_one();
    }

    pub fn push_feature(&self, frame: FeatureFrame) {
        {
            let mut q = self.inner.lock();
            if q.features.len() == QUEUE_CAPACITY {
                q.features.pop_front();
                let n = self.features_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if n % DROP_WARN_EVERY == 1 {
                    warn!(dropped = n, "feature queue full, dropping oldest frame");
                }
            }
            q.features.push_back(frame);
        }
        self.available.notify_one();
    }

    /// Exclusive access for the pairer / reseed path.
    pub fn lock(&self) -> MutexGuard<'_, Queues> {
        self.inner.lock()
    }

    /// Park the fusion worker until a producer signals or the timeout runs
    /// out (shutdown is re-checked by the caller either way).
    pub fn wait(&self, guard: &mut MutexGuard<'_, Queues>, timeout: Duration) {
        self.available.wait_for(guard, timeout);
    }

    /// Wake the consumer unconditionally (shutdown).
    pub fn notify_all(&self) {
        self.available.notify_all();
    }

    pub fn imu_dropped(&self) -> u64 {
        self.imu_dropped.load(Ordering::Relaxed)
    }

    pub fn features_dropped(&self) -> u64 {
        self.features_dropped.load(Ordering::Relaxed)
    }
}

/// Raw image queue consumed by the keyframe path in loop-closure mode.
#[derive(Debug, Default)]
pub struct ImageQueue {
    inner: Mutex<VecDeque<(MonoImage, f64)>>,
    dropped: AtomicU64,
}

impl ImageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, image: MonoImage, t: f64) {
        let mut q = self.inner.lock();
        if q.len() == QUEUE_CAPACITY {
            q.pop_front();
            let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if n % DROP_WARN_EVERY == 1 {
                warn!(dropped = n, "image queue full, dropping oldest image");
            }
        }
        q.push_back((image, t));
    }

    /// Drop every image older than `t` and pop the first at or after it.
    pub fn pop_for(&self, t: f64) -> Option<(MonoImage, f64)> {
        let mut q = self.inner.lock();
        while let Some((_, front_t)) = q.front() {
            if *front_t < t {
                q.pop_front();
            } else {
                break;
            }
        }
        q.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    fn imu(t: f64) -> ImuSample {
        ImuSample {
            t,
            acc: Vector3::zeros(),
            gyr: Vector3::zeros(),
        }
    }

    fn image(w: u32) -> MonoImage {
        MonoImage::new(w, 1, vec![0; w as usize])
    }

    #[test]
    fn test_push_preserves_order() {
        let q = MeasurementQueues::new();
        for t in [0.1, 0.2, 0.3] {
            q.push_imu(imu(t));
        }
        let guard = q.lock();
        let ts: Vec<f64> = guard.imu.iter().map(|s| s.t).collect();
        assert_eq!(ts, vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let q = MeasurementQueues::new();
        for i in 0..(QUEUE_CAPACITY + 3) {
            q.push_imu(imu(i as f64));
        }
        let guard = q.lock();
        assert_eq!(guard.imu.len(), QUEUE_CAPACITY);
        assert_eq!(guard.imu.front().unwrap().t, 3.0);
        drop(guard);
        assert_eq!(q.imu_dropped(), 3);
    }

    #[test]
    fn test_pop_for_discards_older_images() {
        let q = ImageQueue::new();
        q.push(image(1), 1.0);
        q.push(image(2), 2.0);
        q.push(image(3), 3.0);
        let (img, t) = q.pop_for(1.5).unwrap();
        assert_eq!(t, 2.0);
        assert_eq!(img.width, 2);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_pop_for_empty_after_drain() {
        let q = ImageQueue::new();
        q.push(image(1), 1.0);
        assert!(q.pop_for(5.0).is_none());
        assert!(q.is_empty());
    }
}
