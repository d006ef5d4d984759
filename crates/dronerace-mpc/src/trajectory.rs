//! Reference trajectory generation
//!
//! The controller tracks a position reference sampled at the control rate.
//! It is generated once from the nominal track at episode start and replaced
//! wholesale when a gate is observed away from where it was expected.
//!
//! Waypoints pass each gate through three points on its normal (approach,
//! center, exit) so the drone crosses the opening head-on. A cubic spline
//! timed by chord length at the cruise speed connects them.

use dronerace_core::math::{CubicSpline, SplineError};
use dronerace_core::Gate;
use nalgebra::Vector3;
use thiserror::Error;

use crate::config::ReplanConfig;

/// Trajectory generation errors
#[derive(Debug, Error, PartialEq)]
pub enum TrajectoryError {
    #[error("Need at least two distinct waypoints, got {0}")]
    TooFewWaypoints(usize),
    #[error("Non-finite waypoint at index {0}")]
    NonFiniteWaypoint(usize),
    #[error("Reference has {positions} positions but {velocities} velocities")]
    LengthMismatch { positions: usize, velocities: usize },
    #[error("Reference trajectory is empty")]
    Empty,
    #[error("Spline fit failed: {0}")]
    Spline(#[from] SplineError),
}

/// Position and velocity reference sampled at the control rate
///
/// Sample `k` is the reference for tick `start_tick + k`; ticks past the end
/// hold the final sample.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceTrajectory {
    positions: Vec<Vector3<f64>>,
    velocities: Vec<Vector3<f64>>,
    start_tick: u64,
    dt: f64,
}

impl ReferenceTrajectory {
    pub fn new(
        positions: Vec<Vector3<f64>>,
        velocities: Vec<Vector3<f64>>,
        start_tick: u64,
        dt: f64,
    ) -> Result<Self, TrajectoryError> {
        if positions.len() != velocities.len() {
            return Err(TrajectoryError::LengthMismatch {
                positions: positions.len(),
                velocities: velocities.len(),
            });
        }
        if positions.is_empty() {
            return Err(TrajectoryError::Empty);
        }
        let finite = |v: &Vector3<f64>| v.iter().all(|x| x.is_finite());
        if let Some(i) = positions
            .iter()
            .zip(&velocities)
            .position(|(p, v)| !(finite(p) && finite(v)))
        {
            return Err(TrajectoryError::NonFiniteWaypoint(i));
        }
        Ok(Self { positions, velocities, start_tick, dt })
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Always false; construction rejects empty references
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Tick at which sample 0 applies
    pub fn start_tick(&self) -> u64 {
        self.start_tick
    }

    /// Sample spacing [s]
    pub fn dt(&self) -> f64 {
        self.dt
    }

    /// Sample index for `tick`, clamped to the final sample
    pub fn sample_index(&self, tick: u64) -> usize {
        let offset = tick.saturating_sub(self.start_tick);
        usize::try_from(offset)
            .unwrap_or(usize::MAX)
            .min(self.len() - 1)
    }

    /// Position of sample `index`, clamped to the final sample
    pub fn position(&self, index: usize) -> Vector3<f64> {
        self.positions[index.min(self.len() - 1)]
    }

    /// Velocity of sample `index`, clamped to the final sample (at rest)
    pub fn velocity(&self, index: usize) -> Vector3<f64> {
        self.velocities[index.min(self.len() - 1)]
    }

    /// All samples as points
    pub fn points(&self) -> Vec<Vector3<f64>> {
        self.positions.clone()
    }

    /// Samples from `index` to the end
    pub fn points_from(&self, index: usize) -> Vec<Vector3<f64>> {
        self.positions[index.min(self.len() - 1)..].to_vec()
    }
}

/// Builds waypoint sequences and reference trajectories
#[derive(Debug, Clone)]
pub struct TrajectoryPlanner {
    dt: f64,
    gate_offset: f64,
    speed: f64,
    lookahead_time: f64,
    min_spacing: f64,
}

impl TrajectoryPlanner {
    pub fn new(freq: f64, config: &ReplanConfig) -> Self {
        Self {
            dt: 1.0 / freq,
            gate_offset: config.gate_offset,
            speed: config.speed,
            lookahead_time: config.lookahead_time,
            min_spacing: config.min_waypoint_spacing,
        }
    }

    /// Waypoints from `start` through every gate of the nominal track
    pub fn initial_waypoints(&self, start: Vector3<f64>, gates: &[Gate]) -> Vec<Vector3<f64>> {
        let mut waypoints = vec![start];
        for gate in gates {
            self.push_gate_waypoints(&mut waypoints, gate);
        }
        waypoints
    }

    /// Waypoints bridging the current state to gate `target` and every
    /// gate after it
    ///
    /// The target gate is crossed in the direction the drone is moving. The
    /// first leg follows the current velocity for the lookahead time so the
    /// new path bends away from the old one gradually; close to the gate the
    /// lookahead point and the approach point can already lie at or past the
    /// next crossing and are dropped.
    pub fn generate_smooth_replanning_waypoints(
        &self,
        pos: Vector3<f64>,
        vel: Vector3<f64>,
        gates: &[Gate],
        target: usize,
    ) -> Vec<Vector3<f64>> {
        let lookahead = pos + vel * self.lookahead_time;
        let Some(gate) = gates.get(target) else {
            return vec![pos, lookahead];
        };

        let normal = crossing_normal(gate, pos, vel);
        let ahead = |p: &Vector3<f64>| (p - pos).dot(&normal) > 0.0;
        let [approach, center, exit] = self.gate_waypoints(gate, normal);

        let mut crossing = Vec::with_capacity(3);
        // Between approach and center: head straight for the opening
        if ahead(&approach) || !ahead(&center) {
            crossing.push(approach);
        }
        crossing.push(center);
        crossing.push(exit);

        let mut waypoints = vec![pos];
        let first = crossing[0];
        let overshoots = ahead(&first) && (first - lookahead).dot(&normal) <= 0.0;
        if !overshoots {
            waypoints.push(lookahead);
        }
        waypoints.extend(crossing);
        for gate in gates.iter().skip(target + 1) {
            self.push_gate_waypoints(&mut waypoints, gate);
        }
        waypoints
    }

    /// Approach, center and exit points of `gate`
    ///
    /// The normal is oriented away from the previous waypoint, so the gate is
    /// crossed from whichever side the path arrives.
    fn push_gate_waypoints(&self, waypoints: &mut Vec<Vector3<f64>>, gate: &Gate) {
        let mut normal = gate.normal();
        if let Some(prev) = waypoints.last() {
            if normal.dot(&(gate.pos - prev)) < 0.0 {
                normal = -normal;
            }
        }
        waypoints.extend(self.gate_waypoints(gate, normal));
    }

    fn gate_waypoints(&self, gate: &Gate, normal: Vector3<f64>) -> [Vector3<f64>; 3] {
        [
            gate.pos - normal * self.gate_offset,
            gate.pos,
            gate.pos + normal * self.gate_offset,
        ]
    }

    /// Fit and sample a reference through `waypoints`
    ///
    /// Waypoints closer than the minimum spacing to their predecessor are
    /// dropped. With `start_velocity` the path leaves the first waypoint at
    /// that velocity.
    pub fn generate_trajectory_from_waypoints(
        &self,
        waypoints: &[Vector3<f64>],
        start_velocity: Option<Vector3<f64>>,
        start_tick: u64,
    ) -> Result<ReferenceTrajectory, TrajectoryError> {
        let mut points: Vec<Vector3<f64>> = Vec::with_capacity(waypoints.len());
        for (i, w) in waypoints.iter().enumerate() {
            if !w.iter().all(|v| v.is_finite()) {
                return Err(TrajectoryError::NonFiniteWaypoint(i));
            }
            match points.last() {
                Some(last) if (w - last).norm() < self.min_spacing => {}
                _ => points.push(*w),
            }
        }
        if points.len() < 2 {
            return Err(TrajectoryError::TooFewWaypoints(points.len()));
        }

        let mut knots = Vec::with_capacity(points.len());
        let mut t = 0.0;
        knots.push(t);
        for pair in points.windows(2) {
            t += (pair[1] - pair[0]).norm() / self.speed;
            knots.push(t);
        }

        let spline = CubicSpline::new(knots, points, start_velocity)?;
        ReferenceTrajectory::new(
            spline.sample_positions(self.dt),
            spline.sample_velocities(self.dt),
            start_tick,
            self.dt,
        )
    }
}

/// Gate normal pointing along the drone's motion through the gate
///
/// Falls back to the side of the gate the drone is on when the velocity is
/// parallel to the gate plane.
fn crossing_normal(gate: &Gate, pos: Vector3<f64>, vel: Vector3<f64>) -> Vector3<f64> {
    let normal = gate.normal();
    let along = normal.dot(&vel);
    let side = if along.abs() > 1e-6 {
        along
    } else {
        normal.dot(&(gate.pos - pos))
    };
    if side < 0.0 {
        -normal
    } else {
        normal
    }
}
