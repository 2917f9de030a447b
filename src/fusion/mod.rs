//! Sensor-fusion core: ingress buffering, measurement pairing, high-rate
//! dead-reckoning, and the fusion worker that drives the back-end.
//!
//! All cross-thread state lives in one [`FusionCore`] value; workers and
//! callbacks receive shared handles. Lock order is fixed: the measurement
//! buffer lock may be taken before the predictor lock, never the other way
//! round; the correction cell and the keyframe database are only ever taken
//! on their own.

pub mod correction;
pub mod ingress;
pub mod pairing;
pub mod predictor;
pub mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::audit::AuditSink;
use crate::config::NodeConfig;
use crate::estimator::simple::GRAVITY;
use crate::loop_closure::keyframe_db::KeyFrameDatabase;
use crate::output::{Publisher, VioFrame};

use correction::CorrectionCell;
use ingress::{ImageQueue, MeasurementQueues};
use predictor::Predictor;

/// Shared state of the fusion node.
pub struct FusionCore {
    pub config: NodeConfig,
    pub queues: MeasurementQueues,
    pub images: ImageQueue,
    pub predictor: Mutex<Predictor>,
    pub correction: CorrectionCell,
    pub keyframes: Mutex<KeyFrameDatabase>,
    pub publisher: Arc<dyn Publisher>,
    /// Taken out at shutdown so the sink worker sees its channel close.
    pub audit: Mutex<Option<AuditSink>>,
    /// Last per-frame estimator snapshot (uncorrected), for republication
    /// after a pose-graph run.
    pub latest_frame: Mutex<Option<VioFrame>>,

    /// Cached estimator stage; gates high-rate odometry publication from
    /// the IMU callback. Single writer (the fusion worker).
    nonlinear: AtomicBool,
    shutdown: AtomicBool,
}

impl FusionCore {
    pub fn new(
        config: NodeConfig,
        publisher: Arc<dyn Publisher>,
        audit: Option<AuditSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            queues: MeasurementQueues::new(),
            images: ImageQueue::new(),
            predictor: Mutex::new(Predictor::new(GRAVITY)),
            correction: CorrectionCell::new(),
            keyframes: Mutex::new(KeyFrameDatabase::new()),
            publisher,
            audit: Mutex::new(audit),
            latest_frame: Mutex::new(None),
            nonlinear: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn is_nonlinear(&self) -> bool {
        self.nonlinear.load(Ordering::SeqCst)
    }

    pub fn set_nonlinear(&self, value: bool) {
        self.nonlinear.store(value, Ordering::SeqCst);
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.queues.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}
