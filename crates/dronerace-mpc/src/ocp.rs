//! Optimal Control Problem (OCP) Definition
//!
//! Attitude-level tracking OCP for a racing quadrotor:
//!
//! ```text
//! minimize    J = Σₖ ‖yₖ - yₖ,ref‖²_W + ‖x_N - x_N,ref‖²_{W_e} + Σₖ zₗᵀsₖ + sₖᵀZₗsₖ
//! subject to  x₀ = x_meas
//!             xₖ₊₁ = f(xₖ, uₖ)            (attitude-commanded quadrotor)
//!             h(xₖ, p) + sₖ ≥ 0,  sₖ ≥ 0  (soft collision bodies)
//! ```
//!
//! The dynamics `f` and the numerical solve live behind [`crate::solver::OcpSolver`];
//! this module fixes the vector layouts and the constraint/cost fields the
//! solver is configured with.

use nalgebra::{DMatrix, Vector3};

use crate::config::ControllerConfig;
use crate::constraints::ConstraintExpr;

/// State dimension
pub const NX: usize = 14;
/// Control dimension
pub const NU: usize = 4;
/// Stage cost output dimension (state and control)
pub const NY: usize = NX + NU;
/// Terminal cost output dimension
pub const NY_E: usize = NX;

/// State vector of the OCP
///
/// Layout: `[pos(3), vel(3), rpy(3), f_collective, f_cmd, rpy_cmd(3)]`.
/// The commanded thrust and attitude are states integrated from the rate
/// controls, so the command sent to the vehicle is smooth by construction.
#[derive(Debug, Clone, PartialEq)]
pub struct OcpState {
    /// Position in world frame [m]
    pub pos: Vector3<f64>,
    /// Velocity in world frame [m/s]
    pub vel: Vector3<f64>,
    /// Roll, pitch, yaw [rad]
    pub rpy: Vector3<f64>,
    /// Collective thrust currently produced [N]
    pub f_collective: f64,
    /// Commanded collective thrust [N]
    pub f_cmd: f64,
    /// Commanded roll, pitch, yaw [rad]
    pub rpy_cmd: Vector3<f64>,
}

impl OcpState {
    /// Hovering at `pos` with level attitude
    pub fn hover(pos: Vector3<f64>, hover_thrust: f64) -> Self {
        Self {
            pos,
            vel: Vector3::zeros(),
            rpy: Vector3::zeros(),
            f_collective: hover_thrust,
            f_cmd: hover_thrust,
            rpy_cmd: Vector3::zeros(),
        }
    }

    /// Pack into a flat vector (solver layout)
    pub fn to_vector(&self) -> [f64; NX] {
        let mut v = [0.0; NX];
        v[0..3].copy_from_slice(self.pos.as_slice());
        v[3..6].copy_from_slice(self.vel.as_slice());
        v[6..9].copy_from_slice(self.rpy.as_slice());
        v[9] = self.f_collective;
        v[10] = self.f_cmd;
        v[11..14].copy_from_slice(self.rpy_cmd.as_slice());
        v
    }

    /// Unpack from a flat vector (solver layout)
    pub fn from_vector(v: &[f64]) -> Option<Self> {
        if v.len() != NX {
            return None;
        }
        Some(Self {
            pos: Vector3::new(v[0], v[1], v[2]),
            vel: Vector3::new(v[3], v[4], v[5]),
            rpy: Vector3::new(v[6], v[7], v[8]),
            f_collective: v[9],
            f_cmd: v[10],
            rpy_cmd: Vector3::new(v[11], v[12], v[13]),
        })
    }

    /// Command channels `[f_collective, f_cmd, roll_cmd, pitch_cmd, yaw_cmd]`
    pub fn command_channels(&self) -> CommandChannels {
        CommandChannels {
            f_collective: self.f_collective,
            f_cmd: self.f_cmd,
            rpy_cmd: self.rpy_cmd,
        }
    }

    /// Action sent to the vehicle: `[thrust, roll, pitch, yaw]`
    pub fn action(&self) -> [f64; 4] {
        [self.f_cmd, self.rpy_cmd.x, self.rpy_cmd.y, self.rpy_cmd.z]
    }
}

/// Thrust and attitude command states carried from one solve to the next
///
/// These are not measured, so the initial state of each solve takes them
/// from the previous accepted solution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommandChannels {
    pub f_collective: f64,
    pub f_cmd: f64,
    pub rpy_cmd: Vector3<f64>,
}

impl CommandChannels {
    pub fn hover(hover_thrust: f64) -> Self {
        Self {
            f_collective: hover_thrust,
            f_cmd: hover_thrust,
            rpy_cmd: Vector3::zeros(),
        }
    }
}

/// Reference point for one shooting node
#[derive(Debug, Clone, PartialEq)]
pub struct ReferencePoint {
    /// Desired position
    pub position: Vector3<f64>,
    /// Desired velocity
    pub velocity: Vector3<f64>,
    /// Thrust that the reference expects (hover)
    pub thrust: f64,
}

impl ReferencePoint {
    /// Stage reference `yref` (NY entries): position and velocity targets,
    /// level attitude, hover thrust and zero command rates
    pub fn stage_vector(&self) -> [f64; NY] {
        let mut y = [0.0; NY];
        y[0..3].copy_from_slice(self.position.as_slice());
        y[3..6].copy_from_slice(self.velocity.as_slice());
        y[9] = self.thrust;
        y[10] = self.thrust;
        y
    }

    /// Terminal reference `yref_e` (NY_E entries)
    pub fn terminal_vector(&self) -> [f64; NY_E] {
        let mut y = [0.0; NY_E];
        y.copy_from_slice(&self.stage_vector()[..NY_E]);
        y
    }
}

/// Named symbolic parameter block in the model's parameter vector
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSymbol {
    pub name: String,
    /// Offset into the stage parameter vector
    pub offset: usize,
    pub len: usize,
}

/// Symbolic model interface handed to the external code generator
#[derive(Debug, Clone)]
pub struct QuadrotorModel {
    pub name: String,
    pub nx: usize,
    pub nu: usize,
    /// Stage parameters `p`, in layout order
    pub parameters: Vec<ParameterSymbol>,
    /// Nonlinear path constraints `h(x, p)`
    pub con_h_expr: Vec<ConstraintExpr>,
}

impl QuadrotorModel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nx: NX,
            nu: NU,
            parameters: Vec::new(),
            con_h_expr: Vec::new(),
        }
    }

    /// Total length of the parameter vector
    pub fn np(&self) -> usize {
        self.parameters.iter().map(|p| p.len).sum()
    }

    /// Append a parameter block and return its offset
    pub fn add_parameter(&mut self, name: impl Into<String>, len: usize) -> usize {
        let offset = self.np();
        self.parameters.push(ParameterSymbol {
            name: name.into(),
            offset,
            len,
        });
        offset
    }

    /// Evaluate every path constraint at `pos` for parameters `p`
    pub fn eval_constraints(&self, pos: &Vector3<f64>, p: &[f64]) -> Vec<f64> {
        self.con_h_expr.iter().map(|h| h.eval(pos, p)).collect()
    }
}

/// Problem dimensions beyond nx/nu
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OcpDims {
    /// Number of nonlinear path constraints
    pub nh: usize,
    /// Number of soft nonlinear path constraints
    pub nsh: usize,
}

/// Constraint bounds and slack configuration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OcpConstraints {
    /// Lower bounds of `h`
    pub lh: Vec<f64>,
    /// Upper bounds of `h`
    pub uh: Vec<f64>,
    /// Indices of `h` that are softened
    pub idxsh: Vec<usize>,
    /// Lower bounds of the lower slacks
    pub lsh: Vec<f64>,
    /// Upper bounds of the upper slacks
    pub ush: Vec<f64>,
    /// Indices of bounded states
    pub idxbx: Vec<usize>,
    pub lbx: Vec<f64>,
    pub ubx: Vec<f64>,
    /// Initial state (stage-0 equality bound)
    pub x0: [f64; NX],
}

/// Least-squares tracking cost and slack penalties
#[derive(Debug, Clone, PartialEq)]
pub struct OcpCost {
    /// Stage weight matrix (NY x NY)
    pub w: DMatrix<f64>,
    /// Terminal weight matrix (NY_E x NY_E)
    pub w_e: DMatrix<f64>,
    /// Linear penalty on lower slacks
    pub zl: Vec<f64>,
    /// Linear penalty on upper slacks
    pub zu: Vec<f64>,
    /// Diagonal quadratic penalty on lower slacks (`Zl`)
    pub zl_diag: Vec<f64>,
    /// Diagonal quadratic penalty on upper slacks (`Zu`)
    pub zu_diag: Vec<f64>,
}

/// OCP problem definition
///
/// Contains all information needed to generate and configure the solver.
#[derive(Debug, Clone)]
pub struct OcpDefinition {
    pub model: QuadrotorModel,
    pub dims: OcpDims,
    pub constraints: OcpConstraints,
    pub cost: OcpCost,
    /// Number of shooting nodes N
    pub n_horizon: usize,
    /// Horizon duration [s]
    pub horizon_time: f64,
    /// Initial stage parameter values
    pub parameter_values: Vec<f64>,
}

impl OcpDefinition {
    /// Base problem: dynamics, tracking cost and command bounds
    ///
    /// Collision constraints and their parameters are attached afterwards by
    /// [`crate::constraints::CollisionAvoidance`].
    pub fn new(config: &ControllerConfig) -> Self {
        let weights = &config.weights.nominal;
        let vehicle = &config.vehicle;
        let hover = OcpState::hover(Vector3::zeros(), vehicle.hover_thrust());

        // Thrust command and commanded roll/pitch
        let idxbx = vec![10, 11, 12];
        let lbx = vec![vehicle.thrust_min, -vehicle.max_tilt, -vehicle.max_tilt];
        let ubx = vec![vehicle.thrust_max, vehicle.max_tilt, vehicle.max_tilt];

        Self {
            model: QuadrotorModel::new("drone_race_attitude"),
            dims: OcpDims::default(),
            constraints: OcpConstraints {
                idxbx,
                lbx,
                ubx,
                x0: hover.to_vector(),
                ..OcpConstraints::default()
            },
            cost: OcpCost {
                w: weights.stage_matrix(),
                w_e: weights.terminal_matrix(),
                zl: Vec::new(),
                zu: Vec::new(),
                zl_diag: Vec::new(),
                zu_diag: Vec::new(),
            },
            n_horizon: config.horizon.num_nodes,
            horizon_time: config.horizon.horizon_time,
            parameter_values: Vec::new(),
        }
    }

    pub fn nx(&self) -> usize {
        self.model.nx
    }

    pub fn nu(&self) -> usize {
        self.model.nu
    }

    /// Number of shooting nodes
    pub fn n(&self) -> usize {
        self.n_horizon
    }

    /// Uniform shooting interval [s]
    pub fn step(&self) -> f64 {
        self.horizon_time / self.n_horizon as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_state_vector_layout() {
        let state = OcpState {
            pos: Vector3::new(1.0, 2.0, 3.0),
            vel: Vector3::new(0.1, 0.2, 0.3),
            rpy: Vector3::new(0.01, 0.02, 0.03),
            f_collective: 0.3,
            f_cmd: 0.31,
            rpy_cmd: Vector3::new(0.1, -0.1, 0.5),
        };
        let v = state.to_vector();

        assert_relative_eq!(v[2], 3.0);
        assert_relative_eq!(v[9], 0.3);
        assert_relative_eq!(v[10], 0.31);
        assert_relative_eq!(v[13], 0.5);
        assert_eq!(OcpState::from_vector(&v), Some(state));
        assert_eq!(OcpState::from_vector(&v[..13]), None);
    }

    #[test]
    fn test_action_uses_command_channels() {
        let mut state = OcpState::hover(Vector3::zeros(), 0.3);
        state.f_collective = 0.28;
        state.rpy_cmd = Vector3::new(0.1, 0.2, 0.0);

        assert_eq!(state.action(), [0.3, 0.1, 0.2, 0.0]);
    }

    #[test]
    fn test_reference_vectors() {
        let r = ReferencePoint {
            position: Vector3::new(1.0, 0.0, 1.0),
            velocity: Vector3::new(0.5, 0.0, 0.0),
            thrust: 0.32,
        };
        let y = r.stage_vector();
        let y_e = r.terminal_vector();

        assert_eq!(y.len(), NY);
        assert_eq!(y_e.len(), NY_E);
        assert_relative_eq!(y[3], 0.5);
        assert_relative_eq!(y[10], 0.32);
        assert_relative_eq!(y[17], 0.0);
        assert_relative_eq!(y_e[9], 0.32);
    }

    #[test]
    fn test_model_parameter_offsets() {
        let mut model = QuadrotorModel::new("test");
        assert_eq!(model.add_parameter("a", 2), 0);
        assert_eq!(model.add_parameter("b", 4), 2);
        assert_eq!(model.np(), 6);
    }

    #[test]
    fn test_ocp_definition() {
        let config = ControllerConfig::default();
        let ocp = OcpDefinition::new(&config);

        assert_eq!(ocp.nx(), 14);
        assert_eq!(ocp.nu(), 4);
        assert_eq!(ocp.n(), 60);
        assert_eq!(ocp.cost.w.shape(), (NY, NY));
        assert_eq!(ocp.cost.w_e.shape(), (NY_E, NY_E));
        assert_eq!(ocp.constraints.idxbx.len(), ocp.constraints.lbx.len());
        assert_relative_eq!(ocp.step(), 2.0 / 60.0, epsilon = 1e-12);
        assert_relative_eq!(ocp.constraints.x0[10], config.vehicle.hover_thrust());
    }
}
