//! OCP solver interface
//!
//! The numerical optimizer is an external collaborator. The controller only
//! needs a narrow capability: configure once from an [`OcpDefinition`], set
//! per-stage data, solve, read back predicted states. Any backend that
//! can do this (generated acados code, a custom SQP, a test double)
//! implements [`OcpSolver`].

use nalgebra::DMatrix;
use thiserror::Error;

use crate::ocp::OcpDefinition;

/// Solver errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SolverError {
    #[error("Solver setup failed: {0}")]
    Setup(String),
    #[error("Stage {stage} outside horizon 0..={horizon}")]
    InvalidStage { stage: usize, horizon: usize },
    #[error("Invalid {field} dimension: expected {expected}, got {got}")]
    DimensionMismatch {
        field: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("Solver not configured")]
    NotConfigured,
}

/// acados-style solver status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum SolverStatus {
    Unknown = -1,
    Success = 0,
    NaNDetected = 1,
    MaxIterations = 2,
    MinStep = 3,
    QpFailure = 4,
    Ready = 5,
    Unbounded = 6,
    Timeout = 7,
    QpScalingFailed = 8,
    Infeasible = 9,
}

impl From<i32> for SolverStatus {
    fn from(code: i32) -> Self {
        match code {
            0 => SolverStatus::Success,
            1 => SolverStatus::NaNDetected,
            2 => SolverStatus::MaxIterations,
            3 => SolverStatus::MinStep,
            4 => SolverStatus::QpFailure,
            5 => SolverStatus::Ready,
            6 => SolverStatus::Unbounded,
            7 => SolverStatus::Timeout,
            8 => SolverStatus::QpScalingFailed,
            9 => SolverStatus::Infeasible,
            _ => SolverStatus::Unknown,
        }
    }
}

impl SolverStatus {
    pub fn is_success(self) -> bool {
        self == SolverStatus::Success
    }

    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Capability interface of the external trajectory optimizer
///
/// Stages run `0..=horizon()`; stage `horizon()` is terminal and takes a
/// terminal reference and weight matrix.
pub trait OcpSolver {
    /// Configure the solver from the problem definition
    fn setup(&mut self, ocp: &OcpDefinition) -> Result<(), SolverError>;

    /// Number of shooting nodes N
    fn horizon(&self) -> usize;

    /// Pin the stage-0 state to `x0`
    fn set_initial_state(&mut self, x0: &[f64]) -> Result<(), SolverError>;

    /// Set `yref` (or `yref_e` at the terminal stage)
    fn set_reference(&mut self, stage: usize, yref: &[f64]) -> Result<(), SolverError>;

    /// Set the stage parameter vector `p`
    fn set_parameters(&mut self, stage: usize, p: &[f64]) -> Result<(), SolverError>;

    /// Set `W` (or `W_e` at the terminal stage)
    fn set_weights(&mut self, stage: usize, w: &DMatrix<f64>) -> Result<(), SolverError>;

    /// Run the optimizer; bounded in iterations, never blocks past its budget
    fn solve(&mut self) -> SolverStatus;

    /// Predicted state at `stage`
    fn state(&self, stage: usize) -> Result<Vec<f64>, SolverError>;

    /// Discard warm-start memory between episodes
    fn reset(&mut self) {}
}

/// Check a stage index against the horizon
pub fn check_stage(stage: usize, horizon: usize) -> Result<(), SolverError> {
    if stage > horizon {
        Err(SolverError::InvalidStage { stage, horizon })
    } else {
        Ok(())
    }
}

/// Check a vector length
pub fn check_dimension(
    field: &'static str,
    expected: usize,
    got: usize,
) -> Result<(), SolverError> {
    if expected != got {
        Err(SolverError::DimensionMismatch { field, expected, got })
    } else {
        Ok(())
    }
}
