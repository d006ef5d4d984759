//! Mathematical utilities for the racing stack
//!
//! Yaw-only rotation frames for gates, quaternion/Euler conversion for
//! observations, and the clamped cubic spline used for reference paths.

pub mod rotation;
pub mod spline;

pub use rotation::*;
pub use spline::*;
