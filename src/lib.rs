//! Real-time sensor-fusion core of a visual-inertial odometry node.
//!
//! Pairs an IMU stream with feature frames from an upstream visual
//! front-end, dead-reckons at IMU rate between optimizer updates, drives a
//! sliding-window estimator behind a narrow trait, and coordinates
//! loop-closure detection and 4-DoF pose-graph alignment on separate
//! workers feeding back a global-frame correction.

pub mod audit;
pub mod config;
pub mod estimator;
pub mod fusion;
pub mod geometry;
pub mod io;
pub mod loop_closure;
pub mod msg;
pub mod node;
pub mod output;
