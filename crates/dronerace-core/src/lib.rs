//! # Drone Race Core
//!
//! Shared geometry and data model for the gate-racing control stack.
//!
//! ## Modules
//!
//! - [`math`]: Rotation helpers (yaw-only frames, quaternion/Euler conversion) and splines
//! - [`track`]: Gates, obstacles and the nominal race track
//! - [`observation`]: Per-tick observation from the environment and its validation

pub mod math;
pub mod track;
pub mod observation;

pub use observation::{Observation, ObservationError, TargetGate};
pub use track::{Gate, Obstacle, Track};

/// Gravity constant [m/s²]
pub const GRAVITY: f64 = 9.81;
