//! High-rate dead-reckoning between optimizer updates.
//!
//! Every IMU sample advances the predictor with midpoint integration; after
//! each fusion batch the state is re-based onto the optimizer's window tail
//! (with the global correction applied) and the queued IMU tail is replayed,
//! so the published pose is always "last optimized state + queued IMU".

use nalgebra::{UnitQuaternion, Vector3};
use tracing::warn;

use crate::estimator::WindowTail;
use crate::geometry::delta_q;
use crate::msg::ImuSample;

use super::correction::Correction;

/// Sensor gaps beyond this still integrate, but loudly.
pub const DT_MAX: f64 = 0.1;

/// Everything one integration step read and produced; feeds the latest
/// odometry publication and the audit sink.
#[derive(Debug, Clone)]
pub struct PredictionStep {
    /// Raw sample stamp, split the way the transport delivered it.
    pub t_sec: i64,
    pub t_nsec: u32,
    pub acc_raw: Vector3<f64>,
    pub gyr_raw: Vector3<f64>,

    /// State before the step.
    pub previous_time: f64,
    pub previous_acc: Vector3<f64>,
    pub previous_gyr: Vector3<f64>,
    pub previous_p: Vector3<f64>,
    pub previous_v: Vector3<f64>,
    pub previous_q: UnitQuaternion<f64>,

    pub bias_gyr: Vector3<f64>,
    pub bias_acc: Vector3<f64>,
    pub gravity: Vector3<f64>,
    pub dt: f64,

    /// State after the step.
    pub p: Vector3<f64>,
    pub v: Vector3<f64>,
    pub q: UnitQuaternion<f64>,
}

/// Dead-reckoning state. One instance, always mutated under its lock: the
/// IMU callback steps it, the fusion worker re-seeds it.
#[derive(Debug)]
pub struct Predictor {
    t_latest: Option<f64>,
    p: Vector3<f64>,
    q: UnitQuaternion<f64>,
    v: Vector3<f64>,
    ba: Vector3<f64>,
    bg: Vector3<f64>,
    acc_prev: Vector3<f64>,
    gyr_prev: Vector3<f64>,
    gravity: Vector3<f64>,
    healthy: bool,
}

impl Predictor {
    pub fn new(gravity: Vector3<f64>) -> Self {
        Self {
            t_latest: None,
            p: Vector3::zeros(),
            q: UnitQuaternion::identity(),
            v: Vector3::zeros(),
            ba: Vector3::zeros(),
            bg: Vector3::zeros(),
            acc_prev: Vector3::zeros(),
            gyr_prev: Vector3::zeros(),
            gravity,
            healthy: true,
        }
    }

    pub fn t_latest(&self) -> Option<f64> {
        self.t_latest
    }

    pub fn pose(&self) -> (Vector3<f64>, UnitQuaternion<f64>, Vector3<f64>) {
        (self.p, self.q, self.v)
    }

    /// False after a non-finite state was detected; the next reseed restores
    /// it.
    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// Integrate one sample. Returns the step record, or `None` when the
    /// sample only initialized the state or had to be skipped.
    pub fn step(&mut self, sample: &ImuSample) -> Option<PredictionStep> {
        let Some(t_prev) = self.t_latest else {
            self.t_latest = Some(sample.t);
            self.acc_prev = sample.acc;
            self.gyr_prev = sample.gyr;
            return None;
        };

        let dt = sample.t - t_prev;
        if dt < 0.0 {
            warn!(dt, t = sample.t, "imu sample went back in time, skipping");
            return None;
        }
        if dt > DT_MAX {
            warn!(dt, t = sample.t, "imu gap exceeds {DT_MAX}s, integrating anyway");
        }
        if !self.healthy {
            return None;
        }

        let previous = (self.p, self.v, self.q);

        let un_acc_0 = self.q * (self.acc_prev - self.ba) - self.gravity;
        let un_gyr = 0.5 * (self.gyr_prev + sample.gyr) - self.bg;
        self.q = UnitQuaternion::from_quaternion(
            self.q.into_inner() * delta_q(un_gyr * dt).into_inner(),
        );
        let un_acc_1 = self.q * (sample.acc - self.ba) - self.gravity;
        let un_acc = 0.5 * (un_acc_0 + un_acc_1);
        self.p += dt * self.v + 0.5 * dt * dt * un_acc;
        self.v += dt * un_acc;

        if !self.is_finite() {
            warn!(t = sample.t, "predictor state went non-finite, awaiting reseed");
            self.healthy = false;
            return None;
        }

        let step = PredictionStep {
            t_sec: sample.t.trunc() as i64,
            t_nsec: (sample.t.fract() * 1e9).round() as u32,
            acc_raw: sample.acc,
            gyr_raw: sample.gyr,
            previous_time: t_prev,
            previous_acc: self.acc_prev,
            previous_gyr: self.gyr_prev,
            previous_p: previous.0,
            previous_v: previous.1,
            previous_q: previous.2,
            bias_gyr: self.bg,
            bias_acc: self.ba,
            gravity: self.gravity,
            dt,
            p: self.p,
            v: self.v,
            q: self.q,
        };

        self.acc_prev = sample.acc;
        self.gyr_prev = sample.gyr;
        self.t_latest = Some(sample.t);

        Some(step)
    }

    /// Re-base onto the optimizer's window tail and replay the queued IMU
    /// tail. `t_latest` restarts from the last IMU time the estimator
    /// consumed; the correction rotates position and orientation but leaves
    /// velocity in the estimator frame, matching publication.
    pub fn reseed<'a>(
        &mut self,
        tail: &WindowTail,
        t_latest: f64,
        correction: &Correction,
        queued: impl IntoIterator<Item = &'a ImuSample>,
    ) -> Vec<PredictionStep> {
        self.t_latest = Some(t_latest);
        let (q, p) = correction.apply(tail.q, tail.p);
        self.q = q;
        self.p = p;
        self.v = tail.v;
        self.ba = tail.ba;
        self.bg = tail.bg;
        self.acc_prev = tail.acc;
        self.gyr_prev = tail.gyr;
        self.gravity = tail.gravity;
        self.healthy = true;

        queued.into_iter().filter_map(|s| self.step(s)).collect()
    }

    fn is_finite(&self) -> bool {
        self.p.iter().all(|x| x.is_finite())
            && self.v.iter().all(|x| x.is_finite())
            && self.q.into_inner().coords.iter().all(|x| x.is_finite())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn imu(t: f64, acc: Vector3<f64>, gyr: Vector3<f64>) -> ImuSample {
        ImuSample { t, acc, gyr }
    }

    fn zero_g_predictor() -> Predictor {
        Predictor::new(Vector3::zeros())
    }

    #[test]
    fn test_first_sample_initializes_without_integrating() {
        let mut pred = zero_g_predictor();
        let step = pred.step(&imu(1.0, Vector3::new(1.0, 0.0, 0.0), Vector3::zeros()));
        assert!(step.is_none());
        assert_eq!(pred.t_latest(), Some(1.0));
        let (p, _, v) = pred.pose();
        assert_relative_eq!(p.norm(), 0.0);
        assert_relative_eq!(v.norm(), 0.0);
    }

    #[test]
    fn test_t_latest_tracks_every_sample() {
        let mut pred = zero_g_predictor();
        for i in 0..5 {
            let t = 1.0 + i as f64 * 0.01;
            pred.step(&imu(t, Vector3::zeros(), Vector3::zeros()));
            assert_eq!(pred.t_latest(), Some(t));
        }
    }

    #[test]
    fn test_constant_velocity_coasts() {
        // Gravity-compensated samples with zero acceleration: position
        // advances linearly, orientation stays put.
        let mut pred = zero_g_predictor();
        pred.reseed(
            &WindowTail {
                p: Vector3::zeros(),
                q: UnitQuaternion::identity(),
                v: Vector3::new(1.0, 0.0, 0.0),
                ba: Vector3::zeros(),
                bg: Vector3::zeros(),
                acc: Vector3::zeros(),
                gyr: Vector3::zeros(),
                gravity: Vector3::zeros(),
            },
            0.0,
            &Correction::identity(),
            [],
        );
        for i in 1..=10 {
            pred.step(&imu(i as f64 * 0.01, Vector3::zeros(), Vector3::zeros()));
        }
        let (p, q, v) = pred.pose();
        assert_relative_eq!(p, Vector3::new(0.1, 0.0, 0.0), epsilon = 1e-9);
        assert_relative_eq!(v, Vector3::new(1.0, 0.0, 0.0), epsilon = 1e-9);
        assert_relative_eq!(q.angle(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_constant_acceleration_kinematics() {
        // a = 2 m/s² along x for T = 1 s: Δp = ½aT², Δv = aT.
        let mut pred = zero_g_predictor();
        let a = Vector3::new(2.0, 0.0, 0.0);
        pred.step(&imu(0.0, a, Vector3::zeros()));
        for i in 1..=1000 {
            pred.step(&imu(i as f64 * 1e-3, a, Vector3::zeros()));
        }
        let (p, _, v) = pred.pose();
        assert_relative_eq!(p.x, 1.0, epsilon = 1e-6);
        assert_relative_eq!(v.x, 2.0, epsilon = 1e-6);
    }

    #[test]
    fn test_pure_yaw_rotation() {
        // Hovering upright under gravity while yawing at π/2 rad/s for 1 s.
        let g = Vector3::new(0.0, 0.0, 9.81);
        let mut pred = Predictor::new(g);
        let w = Vector3::new(0.0, 0.0, std::f64::consts::FRAC_PI_2);
        pred.step(&imu(0.0, g, w));
        for i in 1..=1000 {
            pred.step(&imu(i as f64 * 1e-3, g, w));
        }
        let (p, q, v) = pred.pose();
        assert_relative_eq!(
            crate::geometry::yaw_of(&q),
            std::f64::consts::FRAC_PI_2,
            epsilon = 1e-3
        );
        assert!(p.norm() < 1e-3);
        assert!(v.norm() < 1e-3);
    }

    #[test]
    fn test_quaternion_stays_normalized() {
        let mut pred = zero_g_predictor();
        let w = Vector3::new(0.5, -0.8, 0.3);
        pred.step(&imu(0.0, Vector3::zeros(), w));
        for i in 1..=500 {
            pred.step(&imu(i as f64 * 2e-3, Vector3::zeros(), w));
            let (_, q, _) = pred.pose();
            assert!((q.into_inner().norm() - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_negative_dt_is_skipped() {
        let mut pred = zero_g_predictor();
        pred.step(&imu(1.0, Vector3::zeros(), Vector3::zeros()));
        pred.step(&imu(1.01, Vector3::new(1.0, 0.0, 0.0), Vector3::zeros()));
        let before = pred.pose();
        assert!(pred
            .step(&imu(0.5, Vector3::new(9.0, 9.0, 9.0), Vector3::zeros()))
            .is_none());
        assert_eq!(pred.pose(), before);
        assert_eq!(pred.t_latest(), Some(1.01));
    }

    #[test]
    fn test_large_gap_still_integrates() {
        let mut pred = zero_g_predictor();
        pred.step(&imu(0.0, Vector3::new(1.0, 0.0, 0.0), Vector3::zeros()));
        let step = pred.step(&imu(0.5, Vector3::new(1.0, 0.0, 0.0), Vector3::zeros()));
        assert!(step.is_some());
        let (p, _, _) = pred.pose();
        assert!(p.x > 0.0);
    }

    #[test]
    fn test_non_finite_state_marks_unhealthy_and_reseed_recovers() {
        let mut pred = zero_g_predictor();
        pred.step(&imu(0.0, Vector3::zeros(), Vector3::zeros()));
        pred.step(&imu(0.01, Vector3::new(f64::NAN, 0.0, 0.0), Vector3::zeros()));
        assert!(!pred.is_healthy());
        // Further samples are ignored until the worker re-seeds.
        assert!(pred
            .step(&imu(0.02, Vector3::zeros(), Vector3::zeros()))
            .is_none());

        let tail = WindowTail {
            p: Vector3::new(1.0, 2.0, 3.0),
            q: UnitQuaternion::identity(),
            v: Vector3::zeros(),
            ba: Vector3::zeros(),
            bg: Vector3::zeros(),
            acc: Vector3::zeros(),
            gyr: Vector3::zeros(),
            gravity: Vector3::zeros(),
        };
        pred.reseed(&tail, 0.02, &Correction::identity(), []);
        assert!(pred.is_healthy());
        let (p, _, _) = pred.pose();
        assert_relative_eq!(p, Vector3::new(1.0, 2.0, 3.0), epsilon = 1e-12);
    }

    #[test]
    fn test_reseed_identity_with_empty_queue_is_noop() {
        let mut pred = zero_g_predictor();
        pred.step(&imu(0.0, Vector3::zeros(), Vector3::zeros()));
        for i in 1..=20 {
            pred.step(&imu(i as f64 * 0.01, Vector3::zeros(), Vector3::zeros()));
        }
        let (p, q, v) = pred.pose();
        let tail = WindowTail {
            p,
            q,
            v,
            ba: Vector3::zeros(),
            bg: Vector3::zeros(),
            acc: Vector3::zeros(),
            gyr: Vector3::zeros(),
            gravity: Vector3::zeros(),
        };
        let records = pred.reseed(&tail, 0.2, &Correction::identity(), []);
        assert!(records.is_empty());
        assert_eq!(pred.pose(), (p, q, v));
        assert_eq!(pred.t_latest(), Some(0.2));
    }

    #[test]
    fn test_reseed_replay_matches_direct_integration() {
        // Integrating the tail directly and reseed-plus-replay must agree.
        let samples: Vec<ImuSample> = (0..50)
            .map(|i| {
                imu(
                    i as f64 * 0.005,
                    Vector3::new(0.1, -0.2, 0.05),
                    Vector3::new(0.01, 0.02, -0.03),
                )
            })
            .collect();

        let mut direct = zero_g_predictor();
        for s in &samples {
            direct.step(s);
        }

        let tail = WindowTail {
            p: Vector3::zeros(),
            q: UnitQuaternion::identity(),
            v: Vector3::zeros(),
            ba: Vector3::zeros(),
            bg: Vector3::zeros(),
            acc: samples[0].acc,
            gyr: samples[0].gyr,
            gravity: Vector3::zeros(),
        };
        let mut reseeded = zero_g_predictor();
        reseeded.reseed(&tail, samples[0].t, &Correction::identity(), &samples[1..]);

        let (p_a, q_a, v_a) = direct.pose();
        let (p_b, q_b, v_b) = reseeded.pose();
        assert_relative_eq!(p_a, p_b, epsilon = 1e-12);
        assert_relative_eq!(v_a, v_b, epsilon = 1e-12);
        assert_relative_eq!(q_a.angle_to(&q_b), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_reseed_applies_correction() {
        let mut pred = zero_g_predictor();
        let correction = Correction {
            r: crate::geometry::yaw_rotation(std::f64::consts::FRAC_PI_2),
            t: Vector3::new(10.0, 0.0, 0.0),
        };
        let tail = WindowTail {
            p: Vector3::new(1.0, 0.0, 0.0),
            q: UnitQuaternion::identity(),
            v: Vector3::new(1.0, 0.0, 0.0),
            ba: Vector3::zeros(),
            bg: Vector3::zeros(),
            acc: Vector3::zeros(),
            gyr: Vector3::zeros(),
            gravity: Vector3::zeros(),
        };
        pred.reseed(&tail, 0.0, &correction, []);
        let (p, q, v) = pred.pose();
        assert_relative_eq!(p, Vector3::new(10.0, 1.0, 0.0), epsilon = 1e-12);
        assert_relative_eq!(
            crate::geometry::yaw_of(&q),
            std::f64::consts::FRAC_PI_2,
            epsilon = 1e-12
        );
        // Velocity is not rotated into the corrected frame.
        assert_relative_eq!(v, Vector3::new(1.0, 0.0, 0.0), epsilon = 1e-12);
    }
}
