//! Collision avoidance constraints
//!
//! Gates and obstacles become keep-out bodies for the OCP:
//! - each gate border is covered by four ellipsoids (right, top, left,
//!   bottom bar) in the gate's yaw-rotated frame
//! - each active obstacle is an infinitely high vertical cylinder
//!
//! Every body contributes one scalar path constraint `h(p) ≥ 0`. The
//! constraints are softened with a one-sided slack penalty, so the solver
//! pays for entering a body instead of failing to find a feasible point.
//!
//! Parameter layout (shared by every stage):
//!
//! ```text
//! p = [ox₀, oy₀, ..., ox_{M'-1}, oy_{M'-1},  gx₀, gy₀, gz₀, ψ₀, ..., ψ_{G-1}]
//!      active obstacles (xy only)            gates (center + yaw)
//! ```

use dronerace_core::math::yaw_rotation;
use dronerace_core::{Observation, ObservationError};
use nalgebra::{Matrix3, Vector3};

use crate::config::{CollisionConfig, ConfigError};
use crate::ocp::{OcpDefinition, QuadrotorModel};
use crate::solver::{OcpSolver, SolverError};

/// Ellipsoids per gate
pub const ELLIPSOIDS_PER_GATE: usize = 4;
/// Parameters per gate: x, y, z, yaw
pub const GATE_PARAMS: usize = 4;
/// Parameters per active obstacle: x, y
pub const OBSTACLE_PARAMS: usize = 2;

/// Symbolic path constraint over the drone position and stage parameters
#[derive(Debug, Clone, PartialEq)]
pub enum ConstraintExpr {
    /// `|p_xy - o_xy|² - r²` with `o_xy = p[offset..offset + 2]`
    Cylinder { offset: usize, radius: f64 },
    /// `(p - c)ᵀ Rᵀ diag(1/a², 1/b², 1/c²) R (p - c) - 1`
    ///
    /// The gate pose is `p[offset..offset + 4]`; the ellipsoid center is
    /// `c = gate + R * midpoint` with `R = Rz(yaw)`.
    Ellipsoid {
        offset: usize,
        midpoint: Vector3<f64>,
        axes: Vector3<f64>,
    },
}

impl ConstraintExpr {
    /// Start of the body's block in the parameter vector
    pub fn offset(&self) -> usize {
        match *self {
            ConstraintExpr::Cylinder { offset, .. } | ConstraintExpr::Ellipsoid { offset, .. } => {
                offset
            }
        }
    }

    /// Parameter entries read starting at [`Self::offset`]
    pub fn param_len(&self) -> usize {
        match self {
            ConstraintExpr::Cylinder { .. } => OBSTACLE_PARAMS,
            ConstraintExpr::Ellipsoid { .. } => GATE_PARAMS,
        }
    }

    /// Evaluate at drone position `pos` for parameter vector `p`
    ///
    /// # Panics
    ///
    /// If `p` is shorter than `offset() + param_len()`. Vectors built by
    /// [`CollisionAvoidance::update_parameters`] always fit the model.
    pub fn eval(&self, pos: &Vector3<f64>, p: &[f64]) -> f64 {
        debug_assert!(
            p.len() >= self.offset() + self.param_len(),
            "parameter vector too short: {} < {}",
            p.len(),
            self.offset() + self.param_len()
        );
        match *self {
            ConstraintExpr::Cylinder { offset, radius } => {
                let dx = pos.x - p[offset];
                let dy = pos.y - p[offset + 1];
                dx * dx + dy * dy - radius * radius
            }
            ConstraintExpr::Ellipsoid { offset, midpoint, axes } => {
                let gate = Vector3::new(p[offset], p[offset + 1], p[offset + 2]);
                let rot = yaw_rotation(p[offset + 3]);
                let center = gate + rot * midpoint;
                let d = rot * (pos - center);
                let inv = Vector3::new(
                    1.0 / (axes.x * axes.x),
                    1.0 / (axes.y * axes.y),
                    1.0 / (axes.z * axes.z),
                );
                d.component_mul(&d).dot(&inv) - 1.0
            }
        }
    }
}

/// Vertical keep-out cylinder around an obstacle (visualization)
#[derive(Debug, Clone, PartialEq)]
pub struct Cylinder {
    /// Obstacle index in the observation
    pub obstacle: usize,
    /// Axis position, z set to 0
    pub pos: Vector3<f64>,
    pub radius: f64,
}

/// Gate-border ellipsoid (visualization)
#[derive(Debug, Clone, PartialEq)]
pub struct Ellipsoid {
    pub gate: usize,
    pub center: Vector3<f64>,
    /// Semi-axes in the gate frame
    pub axes: Vector3<f64>,
    /// Gate frame rotation
    pub rotation: Matrix3<f64>,
}

/// Latest obstacle and gate poses pushed into the parameters
#[derive(Debug, Clone, PartialEq)]
struct Snapshot {
    obstacles: Vec<Vector3<f64>>,
    gates: Vec<(Vector3<f64>, f64)>,
}

/// Builds and updates the collision constraints of the OCP
#[derive(Debug, Clone)]
pub struct CollisionAvoidance {
    num_gates: usize,
    num_obstacles: usize,
    obstacle_radius: f64,
    slack_penalty: f64,
    upper_bound: f64,
    /// Obstacle slot -> active index, `None` if ignored
    active_slot: Vec<Option<usize>>,
    active_indices: Vec<usize>,
    ellipsoid_midpoints: [Vector3<f64>; ELLIPSOIDS_PER_GATE],
    ellipsoid_axes: [Vector3<f64>; ELLIPSOIDS_PER_GATE],
    params: Vec<f64>,
    snapshot: Option<Snapshot>,
}

impl CollisionAvoidance {
    /// Set up collision bodies for `num_gates` gates and `num_obstacles`
    /// obstacles, minus the ignored ones
    pub fn new(
        num_gates: usize,
        num_obstacles: usize,
        config: &CollisionConfig,
    ) -> Result<Self, ConfigError> {
        config.validate(num_obstacles)?;

        let mut active_slot = vec![Some(0); num_obstacles];
        for &i in &config.ignored_obstacles {
            active_slot[i] = None;
        }
        let mut active_indices = Vec::with_capacity(num_obstacles);
        for (i, slot) in active_slot.iter_mut().enumerate() {
            if slot.is_some() {
                *slot = Some(active_indices.len());
                active_indices.push(i);
            }
        }

        let half = config.gate_length / 2.0;
        let r = config.ellipsoid_radius;
        let l = config.ellipsoid_length / 2.0;
        let ellipsoid_midpoints = [
            Vector3::new(half, 0.0, 0.0),
            Vector3::new(0.0, 0.0, half),
            Vector3::new(-half, 0.0, 0.0),
            Vector3::new(0.0, 0.0, -half),
        ];
        // Vertical bars are long in z, horizontal bars long in x
        let ellipsoid_axes = [
            Vector3::new(r, r, l),
            Vector3::new(l, r, r),
            Vector3::new(r, r, l),
            Vector3::new(l, r, r),
        ];

        let num_params = OBSTACLE_PARAMS * active_indices.len() + GATE_PARAMS * num_gates;

        Ok(Self {
            num_gates,
            num_obstacles,
            obstacle_radius: config.obstacle_radius,
            slack_penalty: config.slack_penalty,
            upper_bound: config.upper_bound,
            active_slot,
            active_indices,
            ellipsoid_midpoints,
            ellipsoid_axes,
            params: vec![0.0; num_params],
            snapshot: None,
        })
    }

    pub fn num_gates(&self) -> usize {
        self.num_gates
    }

    pub fn num_obstacles(&self) -> usize {
        self.num_obstacles
    }

    pub fn num_active_obstacles(&self) -> usize {
        self.active_indices.len()
    }

    /// Number of constraint slots: `4 * gates + active obstacles`
    pub fn num_constraints(&self) -> usize {
        ELLIPSOIDS_PER_GATE * self.num_gates + self.num_active_obstacles()
    }

    /// Length of the stage parameter vector
    pub fn num_parameters(&self) -> usize {
        self.params.len()
    }

    /// Obstacle indices that take part in collision avoidance
    pub fn active_obstacle_indices(&self) -> &[usize] {
        &self.active_indices
    }

    /// Append collision parameters and constraint expressions to the model
    ///
    /// Cylinders come first, then four ellipsoids per gate, matching the
    /// parameter layout.
    pub fn setup_model(&self, model: &mut QuadrotorModel) -> Result<(), ConfigError> {
        if !model.parameters.is_empty() {
            return Err(ConfigError::ParameterLayoutConflict("stage parameters"));
        }
        if !model.con_h_expr.is_empty() {
            return Err(ConfigError::ParameterLayoutConflict("path constraints"));
        }

        for k in 0..self.num_active_obstacles() {
            let offset = model.add_parameter(format!("p_obs{k}"), OBSTACLE_PARAMS);
            model.con_h_expr.push(ConstraintExpr::Cylinder {
                offset,
                radius: self.obstacle_radius,
            });
        }

        for i in 0..self.num_gates {
            let offset = model.add_parameter(format!("p_gate{i}"), GATE_PARAMS);
            for (midpoint, axes) in self.ellipsoid_midpoints.iter().zip(&self.ellipsoid_axes) {
                model.con_h_expr.push(ConstraintExpr::Ellipsoid {
                    offset,
                    midpoint: *midpoint,
                    axes: *axes,
                });
            }
        }
        Ok(())
    }

    /// Configure bounds, slacks and penalties of the collision constraints
    pub fn setup_ocp(&self, ocp: &mut OcpDefinition) {
        let n = self.num_constraints();

        ocp.dims.nh = n;
        ocp.dims.nsh = n;

        ocp.constraints.lh = vec![0.0; n];
        ocp.constraints.uh = vec![self.upper_bound; n];
        ocp.constraints.idxsh = (0..n).collect();
        ocp.constraints.lsh = vec![0.0; n];
        ocp.constraints.ush = vec![self.upper_bound; n];

        ocp.cost.zl_diag = vec![self.slack_penalty; n];
        ocp.cost.zu_diag = vec![0.0; n];
        ocp.cost.zl = vec![self.slack_penalty; n];
        ocp.cost.zu = vec![0.0; n];

        ocp.parameter_values = vec![0.0; ocp.model.np()];
    }

    /// Take the obstacle and gate poses from `obs` and rebuild the parameter
    /// vector in place
    pub fn update_parameters(&mut self, obs: &Observation) -> Result<&[f64], ObservationError> {
        if obs.obstacles_pos.len() != self.num_obstacles {
            return Err(ObservationError::ObstacleCount {
                expected: self.num_obstacles,
                got: obs.obstacles_pos.len(),
            });
        }
        if obs.gates_pos.len() != self.num_gates {
            return Err(ObservationError::GateCount {
                expected: self.num_gates,
                got: obs.gates_pos.len(),
            });
        }
        if obs.gates_quat.len() != self.num_gates {
            return Err(ObservationError::GateOrientationCount {
                expected: self.num_gates,
                got: obs.gates_quat.len(),
            });
        }

        for (i, pos) in obs.obstacles_pos.iter().enumerate() {
            if let Some(k) = self.active_slot[i] {
                self.params[OBSTACLE_PARAMS * k] = pos.x;
                self.params[OBSTACLE_PARAMS * k + 1] = pos.y;
            }
        }

        let base = OBSTACLE_PARAMS * self.num_active_obstacles();
        let mut gates = Vec::with_capacity(self.num_gates);
        for i in 0..self.num_gates {
            let pos = obs.gates_pos[i];
            let yaw = obs.gate_yaw(i).unwrap_or(0.0);
            let p = &mut self.params[base + GATE_PARAMS * i..base + GATE_PARAMS * (i + 1)];
            p[..3].copy_from_slice(pos.as_slice());
            p[3] = yaw;
            gates.push((pos, yaw));
        }

        self.snapshot = Some(Snapshot {
            obstacles: obs.obstacles_pos.clone(),
            gates,
        });
        Ok(&self.params)
    }

    /// Push the current parameter vector into every stage `0..=N`
    ///
    /// All stages share the same snapshot; moving bodies are not predicted.
    pub fn apply_parameters<S: OcpSolver>(&self, solver: &mut S) -> Result<(), SolverError> {
        for stage in 0..=solver.horizon() {
            solver.set_parameters(stage, &self.params)?;
        }
        Ok(())
    }

    /// Current stage parameter vector
    pub fn parameters(&self) -> &[f64] {
        &self.params
    }

    /// Forget the last snapshot (episode reset)
    pub fn clear(&mut self) {
        self.params.iter_mut().for_each(|p| *p = 0.0);
        self.snapshot = None;
    }

    /// Keep-out cylinders of the active obstacles, empty before the first update
    pub fn obstacle_cylinders(&self) -> Vec<Cylinder> {
        let Some(snapshot) = &self.snapshot else {
            return Vec::new();
        };
        self.active_indices
            .iter()
            .map(|&i| {
                let p = snapshot.obstacles[i];
                Cylinder {
                    obstacle: i,
                    pos: Vector3::new(p.x, p.y, 0.0),
                    radius: self.obstacle_radius,
                }
            })
            .collect()
    }

    /// Gate-border ellipsoids, empty before the first update
    pub fn gate_ellipsoids(&self) -> Vec<Ellipsoid> {
        let Some(snapshot) = &self.snapshot else {
            return Vec::new();
        };
        let mut bodies = Vec::with_capacity(ELLIPSOIDS_PER_GATE * self.num_gates);
        for (gate, (pos, yaw)) in snapshot.gates.iter().enumerate() {
            let rotation = yaw_rotation(*yaw);
            for (midpoint, axes) in self.ellipsoid_midpoints.iter().zip(&self.ellipsoid_axes) {
                bodies.push(Ellipsoid {
                    gate,
                    center: pos + rotation * midpoint,
                    axes: *axes,
                    rotation,
                });
            }
        }
        bodies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    fn observation(num_gates: usize, num_obstacles: usize) -> Observation {
        Observation {
            pos: Vector3::new(0.0, 0.0, 1.0),
            vel: Vector3::zeros(),
            quat: [0.0, 0.0, 0.0, 1.0],
            gates_pos: (0..num_gates)
                .map(|i| Vector3::new(i as f64, 2.0 * i as f64, 1.0))
                .collect(),
            gates_quat: vec![[0.0, 0.0, 0.0, 1.0]; num_gates],
            obstacles_pos: (0..num_obstacles)
                .map(|i| Vector3::new(10.0 + i as f64, 20.0 + i as f64, 0.5))
                .collect(),
            target_gate: 0,
        }
    }

    fn handler(num_gates: usize, num_obstacles: usize, ignored: Vec<usize>) -> CollisionAvoidance {
        let config = CollisionConfig {
            ignored_obstacles: ignored,
            ..CollisionConfig::default()
        };
        CollisionAvoidance::new(num_gates, num_obstacles, &config).unwrap()
    }

    #[test]
    fn test_counts_with_ignored_obstacles() {
        for num_obstacles in 0..5 {
            for ignored_count in 0..=num_obstacles {
                let ignored: Vec<usize> = (0..ignored_count).collect();
                let h = handler(3, num_obstacles, ignored);
                let active = num_obstacles - ignored_count;

                assert_eq!(h.num_constraints(), 4 * 3 + active);
                assert_eq!(h.num_parameters(), 2 * active + 4 * 3);
            }
        }
    }

    #[test]
    fn test_active_indices_skip_ignored() {
        let h = handler(1, 4, vec![2, 0]);
        assert_eq!(h.active_obstacle_indices(), &[1, 3]);
    }

    #[test]
    fn test_rejects_out_of_range_ignored_index() {
        let config = CollisionConfig {
            ignored_obstacles: vec![3],
            ..CollisionConfig::default()
        };
        assert!(matches!(
            CollisionAvoidance::new(2, 3, &config),
            Err(ConfigError::IgnoredObstacleOutOfRange { index: 3, num_obstacles: 3 })
        ));
    }

    #[test]
    fn test_parameter_layout() {
        let mut h = handler(2, 3, vec![1]);
        let mut obs = observation(2, 3);
        let half = 0.25_f64;
        obs.gates_quat[1] = [0.0, 0.0, half.sin(), half.cos()];

        let p = h.update_parameters(&obs).unwrap().to_vec();

        assert_eq!(p.len(), 2 * 2 + 4 * 2);
        // Obstacles 0 and 2, xy only
        assert_eq!(&p[0..4], &[10.0, 20.0, 12.0, 22.0]);
        // Gate 0
        assert_eq!(&p[4..8], &[0.0, 0.0, 1.0, 0.0]);
        // Gate 1
        assert_eq!(&p[8..11], &[1.0, 2.0, 1.0]);
        assert_relative_eq!(p[11], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_zero_active_obstacles() {
        let mut h = handler(2, 2, vec![0, 1]);
        let p = h.update_parameters(&observation(2, 2)).unwrap();

        assert_eq!(p.len(), 8);
        assert_eq!(h.num_constraints(), 8);
        assert!(h.obstacle_cylinders().is_empty());
    }

    #[test]
    fn test_update_rejects_wrong_shapes() {
        let mut h = handler(2, 1, Vec::new());
        assert_eq!(
            h.update_parameters(&observation(3, 1)).unwrap_err(),
            ObservationError::GateCount { expected: 2, got: 3 }
        );
        assert_eq!(
            h.update_parameters(&observation(2, 0)).unwrap_err(),
            ObservationError::ObstacleCount { expected: 1, got: 0 }
        );
    }

    #[test]
    fn test_model_expressions() {
        let h = handler(2, 3, vec![1]);
        let mut model = QuadrotorModel::new("test");
        h.setup_model(&mut model).unwrap();

        assert_eq!(model.con_h_expr.len(), h.num_constraints());
        assert_eq!(model.np(), h.num_parameters());
        assert_eq!(model.parameters[0].name, "p_obs0");
        assert_eq!(model.parameters[2].name, "p_gate0");
        assert!(matches!(model.con_h_expr[0], ConstraintExpr::Cylinder { offset: 0, .. }));
        assert!(matches!(model.con_h_expr[2], ConstraintExpr::Ellipsoid { offset: 4, .. }));
        assert!(matches!(model.con_h_expr[6], ConstraintExpr::Ellipsoid { offset: 8, .. }));

        // Building twice would corrupt the layout
        assert!(matches!(
            h.setup_model(&mut model),
            Err(ConfigError::ParameterLayoutConflict(_))
        ));
    }

    #[test]
    fn test_ocp_slack_configuration() {
        let config = ControllerConfig::default();
        let h = handler(4, 2, Vec::new());
        let mut ocp = OcpDefinition::new(&config);
        h.setup_model(&mut ocp.model).unwrap();
        h.setup_ocp(&mut ocp);

        let n = 4 * 4 + 2;
        assert_eq!(ocp.dims.nsh, n);
        assert_eq!(ocp.constraints.lh, vec![0.0; n]);
        assert!(ocp.constraints.uh.iter().all(|&u| u == 1e10));
        assert_eq!(ocp.constraints.idxsh, (0..n).collect::<Vec<_>>());
        assert_eq!(ocp.cost.zl, vec![1e4; n]);
        assert_eq!(ocp.cost.zl_diag, vec![1e4; n]);
        assert_eq!(ocp.cost.zu, vec![0.0; n]);
        assert_eq!(ocp.cost.zu_diag, vec![0.0; n]);
        assert_eq!(ocp.parameter_values.len(), 2 * 2 + 4 * 4);
    }

    #[test]
    fn test_ellipsoid_center_is_minus_one() {
        let h = handler(1, 0, Vec::new());
        let mut model = QuadrotorModel::new("test");
        h.setup_model(&mut model).unwrap();

        let p = [0.3, -0.2, 1.1, 0.9];
        let gate = Vector3::new(p[0], p[1], p[2]);
        for expr in &model.con_h_expr {
            let ConstraintExpr::Ellipsoid { midpoint, .. } = expr else {
                panic!("gate-only model has a cylinder");
            };
            let center = gate + yaw_rotation(p[3]) * midpoint;
            assert_relative_eq!(expr.eval(&center, &p), -1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_cylinder_boundary_is_zero() {
        let h = handler(0, 1, Vec::new());
        let mut model = QuadrotorModel::new("test");
        h.setup_model(&mut model).unwrap();

        let p = [1.0, -2.0];
        let r = CollisionConfig::default().obstacle_radius;
        let on_boundary = Vector3::new(1.0 + r * 0.6, -2.0 + r * 0.8, 37.0);

        assert_relative_eq!(model.con_h_expr[0].eval(&on_boundary, &p), 0.0, epsilon = 1e-12);
        assert!(model.con_h_expr[0].eval(&Vector3::new(1.0, -2.0, -5.0), &p) < 0.0);
        assert!(model.con_h_expr[0].eval(&Vector3::new(2.0, -2.0, 1.0), &p) > 0.0);
    }

    #[test]
    fn test_param_len_matches_layout() {
        let h = handler(1, 1, Vec::new());
        let mut model = QuadrotorModel::new("test");
        h.setup_model(&mut model).unwrap();

        let needed = model
            .con_h_expr
            .iter()
            .map(|e| e.offset() + e.param_len())
            .max();
        assert_eq!(needed, Some(model.np()));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "parameter vector too short")]
    fn test_short_parameter_vector_rejected() {
        let expr = ConstraintExpr::Ellipsoid {
            offset: 2,
            midpoint: Vector3::zeros(),
            axes: Vector3::new(0.12, 0.12, 0.35),
        };
        expr.eval(&Vector3::zeros(), &[0.0; 4]);
    }

    #[test]
    fn test_gate_opening_is_free() {
        let h = handler(1, 0, Vec::new());
        let mut model = QuadrotorModel::new("test");
        h.setup_model(&mut model).unwrap();

        let p = [2.0, 1.0, 1.0, FRAC_PI_2];
        let values = model.eval_constraints(&Vector3::new(2.0, 1.0, 1.0), &p);

        assert_eq!(values.len(), 4);
        assert!(values.iter().all(|&v| v > 0.0));
    }

    #[test]
    fn test_bodies_empty_before_update() {
        let h = handler(2, 2, Vec::new());
        assert!(h.obstacle_cylinders().is_empty());
        assert!(h.gate_ellipsoids().is_empty());
    }

    #[test]
    fn test_visualization_bodies() {
        let mut h = handler(2, 3, vec![0]);
        let mut obs = observation(2, 3);
        obs.gates_quat[0] = [0.0, 0.0, (FRAC_PI_2 / 2.0).sin(), (FRAC_PI_2 / 2.0).cos()];
        h.update_parameters(&obs).unwrap();

        let cylinders = h.obstacle_cylinders();
        assert_eq!(cylinders.len(), 2);
        assert_eq!(cylinders[0].obstacle, 1);
        assert_relative_eq!(cylinders[0].pos, Vector3::new(11.0, 21.0, 0.0));

        let ellipsoids = h.gate_ellipsoids();
        assert_eq!(ellipsoids.len(), 8);
        // Right bar of gate 0, rotated a quarter turn
        let half = CollisionConfig::default().gate_length / 2.0;
        assert_relative_eq!(ellipsoids[0].center, Vector3::new(0.0, half, 1.0), epsilon = 1e-12);
        assert_eq!(ellipsoids[4].gate, 1);

        h.clear();
        assert!(h.gate_ellipsoids().is_empty());
    }
}
