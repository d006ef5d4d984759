//! Drone Race MPC
//!
//! Online control core of an autonomous gate-racing quadrotor. At a fixed
//! control rate it turns an observation into an attitude-level command
//! `[thrust, roll, pitch, yaw]` by solving a soft-constrained tracking OCP:
//!
//! ```text
//! minimize    J = Σₖ ‖yₖ - yₖ,ref‖²_W + ‖x_N - x_N,ref‖²_{W_e} + slack penalty
//! subject to  x₀ = x_meas
//!             xₖ₊₁ = f(xₖ, uₖ)
//!             h_gate(xₖ, p) + s ≥ 0   (4 ellipsoids per gate)
//!             h_obs(xₖ, p) + s ≥ 0    (1 cylinder per active obstacle)
//! ```
//!
//! # Components
//!
//! - [`config`]: TOML-loadable configuration and its validation
//! - [`ocp`]: State/control layout and the OCP definition handed to the solver
//! - [`constraints`]: Collision bodies, slack setup and the stage parameter vector
//! - [`trajectory`]: Waypoints through the gates and the sampled reference
//! - [`weights`]: Cost weights and the post-replan weight ramp
//! - [`solver`]: Capability interface of the external optimizer
//! - [`controller`]: Per-tick orchestration, race progress and replanning
//! - [`telemetry`]: Bounded per-tick flight log

pub mod config;
pub mod ocp;
pub mod constraints;
pub mod trajectory;
pub mod weights;
pub mod solver;
pub mod controller;
pub mod telemetry;

// Re-exports
pub use config::{ConfigError, ControllerConfig};
pub use constraints::CollisionAvoidance;
pub use controller::{ControllerError, RaceController, RaceProgress};
pub use ocp::OcpDefinition;
pub use solver::{OcpSolver, SolverError, SolverStatus};
pub use trajectory::{ReferenceTrajectory, TrajectoryPlanner};
pub use weights::{MpcWeights, WeightScheduler};
