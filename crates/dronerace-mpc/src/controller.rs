//! Race Controller
//!
//! Per-tick orchestration of the racing MPC. Each call to
//! [`RaceController::compute_control`]:
//!
//! 1. pushes the observed obstacle and gate poses into the solver parameters
//! 2. advances race progress from the `target_gate` signal
//! 3. replans if the targeted gate moved while the drone approaches it
//! 4. advances the weight schedule
//! 5. sets the horizon references from the active trajectory
//! 6. solves, holding the previous action if the solve fails
//! 7. returns `[thrust, roll, pitch, yaw]`
//!
//! [`RaceController::step_callback`] then closes the tick. The controller is
//! single-threaded and owns all episode state; [`RaceController::episode_reset`]
//! restores it to what it was right after construction.

use std::collections::BTreeSet;

use dronerace_core::{Gate, Observation, ObservationError, TargetGate};
use log::{debug, info, trace, warn};
use nalgebra::{DMatrix, Vector3};
use thiserror::Error;

use crate::config::{ConfigError, ControllerConfig};
use crate::constraints::{CollisionAvoidance, Cylinder, Ellipsoid};
use crate::ocp::{CommandChannels, OcpDefinition, OcpState, ReferencePoint, NX};
use crate::solver::{OcpSolver, SolverError, SolverStatus};
use crate::telemetry::{FlightLog, TickRecord};
use crate::trajectory::{ReferenceTrajectory, TrajectoryError, TrajectoryPlanner};
use crate::weights::{MpcWeights, WeightScheduler};

/// Controller errors
///
/// Only `Observation` can come out of a control tick; the others are
/// construction failures.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Malformed observation: {0}")]
    Observation(#[from] ObservationError),
    #[error("Solver error: {0}")]
    Solver(#[from] SolverError),
    #[error("Initial trajectory failed: {0}")]
    Trajectory(#[from] TrajectoryError),
}

/// Race progress, `Racing -> Finished` only
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaceProgress {
    Racing { gates_passed: usize },
    Finished,
}

/// Mutable state of one episode
#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeState {
    pub tick: u64,
    pub progress: RaceProgress,
    pub flight_successful: bool,
    /// Gates already replanned for
    pub updated_gates: BTreeSet<usize>,
    pub last_replanning_tick: Option<u64>,
    /// Gate poses the active trajectory was planned through
    pub known_gates: Vec<Gate>,
    pub trajectory: ReferenceTrajectory,
    pub last_action: [f64; 4],
    /// Command states of the last accepted solution
    pub commands: CommandChannels,
    pub last_status: Option<SolverStatus>,
    pub replanned_this_tick: bool,
}

/// Receding-horizon race controller
pub struct RaceController<S: OcpSolver> {
    solver: S,
    config: ControllerConfig,
    ocp: OcpDefinition,
    collision: CollisionAvoidance,
    planner: TrajectoryPlanner,
    scheduler: WeightScheduler,
    state: EpisodeState,
    /// State right after construction, restored on reset
    initial_state: EpisodeState,
    flight_log: FlightLog,
    hover_thrust: f64,
}

impl<S: OcpSolver> RaceController<S> {
    /// Build the OCP, configure `solver` and plan the initial trajectory
    /// from the drone's starting position through the nominal track
    pub fn new(
        config: ControllerConfig,
        obs: &Observation,
        mut solver: S,
    ) -> Result<Self, ControllerError> {
        config.validate()?;

        let track = &config.env.track;
        let num_gates = track.num_gates();
        let num_obstacles = track.num_obstacles();
        if obs.gates_pos.len() != num_gates {
            return Err(ConfigError::GateCountMismatch {
                configured: num_gates,
                observed: obs.gates_pos.len(),
            }
            .into());
        }
        if obs.obstacles_pos.len() != num_obstacles {
            return Err(ConfigError::ObstacleCountMismatch {
                configured: num_obstacles,
                observed: obs.obstacles_pos.len(),
            }
            .into());
        }
        obs.validate(num_gates, num_obstacles)?;

        let collision = CollisionAvoidance::new(num_gates, num_obstacles, &config.collision)?;
        let mut ocp = OcpDefinition::new(&config);
        collision.setup_model(&mut ocp.model)?;
        collision.setup_ocp(&mut ocp);

        solver.setup(&ocp)?;
        if solver.horizon() != ocp.n() {
            return Err(SolverError::DimensionMismatch {
                field: "horizon",
                expected: ocp.n(),
                got: solver.horizon(),
            }
            .into());
        }

        let planner = TrajectoryPlanner::new(config.env.freq, &config.replanning);
        let waypoints = planner.initial_waypoints(obs.pos, &track.gates);
        let trajectory = planner.generate_trajectory_from_waypoints(&waypoints, None, 0)?;

        let scheduler = WeightScheduler::new(
            config.weights.nominal.clone(),
            config.weights.replanning.clone(),
            &config.schedule,
        );

        let hover_thrust = config.vehicle.hover_thrust();
        let state = EpisodeState {
            tick: 0,
            progress: RaceProgress::Racing { gates_passed: 0 },
            flight_successful: false,
            updated_gates: BTreeSet::new(),
            last_replanning_tick: None,
            known_gates: track.gates.clone(),
            trajectory,
            last_action: [hover_thrust, 0.0, 0.0, 0.0],
            commands: CommandChannels::hover(hover_thrust),
            last_status: None,
            replanned_this_tick: false,
        };

        info!(
            "Race controller ready: {} gates, {}/{} obstacles active, N={} over {:.2}s, {} samples",
            num_gates,
            collision.num_active_obstacles(),
            num_obstacles,
            ocp.n(),
            ocp.horizon_time,
            state.trajectory.len()
        );

        let mut controller = Self {
            solver,
            flight_log: FlightLog::new(config.telemetry.log_capacity),
            config,
            ocp,
            collision,
            planner,
            scheduler,
            initial_state: state.clone(),
            state,
            hover_thrust,
        };
        controller.apply_weights()?;
        Ok(controller)
    }

    /// Compute the action for this tick
    ///
    /// Fails only on a malformed observation. Solver trouble is absorbed by
    /// holding the previous action.
    pub fn compute_control(&mut self, obs: &Observation) -> Result<[f64; 4], ControllerError> {
        obs.validate(self.total_gates(), self.collision.num_obstacles())?;
        self.state.replanned_this_tick = false;

        self.collision.update_parameters(obs)?;
        if let Err(e) = self.collision.apply_parameters(&mut self.solver) {
            warn!("Tick {}: failed to push collision parameters: {}", self.state.tick, e);
        }

        self.update_progress(obs.target());

        if let (RaceProgress::Racing { .. }, TargetGate::Gate(target)) =
            (self.state.progress, obs.target())
        {
            self.state.replanned_this_tick = self.check_and_execute_replanning(obs, target);
        }

        if self.scheduler.update(self.state.tick) {
            trace!(
                "Tick {}: q_pos = {:.2}",
                self.state.tick,
                self.scheduler.current().q_pos
            );
            if let Err(e) = self.apply_weights() {
                warn!("Tick {}: failed to push cost weights: {}", self.state.tick, e);
            }
        }

        let action = match self.execute_mpc_control(obs) {
            Ok(action) => action,
            Err(e) => {
                warn!(
                    "Tick {}: solver interface error: {}, holding previous action",
                    self.state.tick, e
                );
                self.state.last_action
            }
        };
        self.state.last_action = action;
        Ok(action)
    }

    /// Close the tick: log it and advance the tick counter
    ///
    /// Returns whether the race is finished.
    pub fn step_callback(
        &mut self,
        action: &[f64; 4],
        obs: &Observation,
        reward: f64,
        terminated: bool,
        truncated: bool,
    ) -> bool {
        let tracking_error = self.tracking_error(&obs.pos);
        self.flight_log.push(TickRecord {
            tick: self.state.tick,
            pos: obs.pos,
            action: *action,
            reward,
            status: self.state.last_status,
            gates_passed: self.gates_passed(),
            replanned: self.state.replanned_this_tick,
            tracking_error,
        });
        debug!(
            "Tick {}: pos=[{:.3}, {:.3}, {:.3}] err={:.3} gates={} status={:?}",
            self.state.tick,
            obs.pos.x,
            obs.pos.y,
            obs.pos.z,
            tracking_error,
            self.gates_passed(),
            self.state.last_status
        );

        self.state.tick += 1;
        if terminated || truncated {
            debug!(
                "Episode ended at tick {} (terminated={}, truncated={})",
                self.state.tick, terminated, truncated
            );
        }
        self.is_finished()
    }

    /// Clear all episode state
    pub fn episode_reset(&mut self) {
        info!(
            "Episode reset after {} ticks: {} gates passed, {} replans, {} failed solves logged",
            self.state.tick,
            self.gates_passed(),
            self.state.updated_gates.len(),
            self.flight_log.failed_solves()
        );

        self.state = self.initial_state.clone();
        self.scheduler.reset();
        self.collision.clear();
        self.flight_log.clear();
        self.solver.reset();
        if let Err(e) = self.apply_weights() {
            warn!("Failed to restore nominal weights on reset: {}", e);
        }
    }

    fn update_progress(&mut self, target: TargetGate) {
        match (self.state.progress, target) {
            (RaceProgress::Finished, _) => {}
            (RaceProgress::Racing { .. }, TargetGate::Finished) => {
                self.state.progress = RaceProgress::Finished;
                self.state.flight_successful = true;
                info!(
                    "Race finished at tick {}: all {} gates passed",
                    self.state.tick,
                    self.total_gates()
                );
            }
            (RaceProgress::Racing { gates_passed }, TargetGate::Gate(next)) => {
                if next > gates_passed {
                    self.state.progress = RaceProgress::Racing { gates_passed: next };
                    info!("Tick {}: gate {} passed", self.state.tick, next - 1);
                }
            }
        }
    }

    /// Replan if gate `target` was observed away from its known pose
    ///
    /// Fires only after the first tick, outside the cooldown, once per gate,
    /// for a displacement above the threshold, and while the drone flies
    /// toward the gate. Returns whether the trajectory was replaced.
    pub fn check_and_execute_replanning(&mut self, obs: &Observation, target: usize) -> bool {
        let tick = self.state.tick;
        if tick == 0 {
            return false;
        }
        if let Some(last) = self.state.last_replanning_tick {
            if tick.saturating_sub(last) < self.config.replanning.cooldown_ticks {
                return false;
            }
        }
        if self.state.updated_gates.contains(&target) {
            return false;
        }
        let (Some(observed), Some(known)) =
            (obs.gates_pos.get(target), self.state.known_gates.get(target))
        else {
            return false;
        };

        let displacement = (observed - known.pos).norm();
        if displacement <= self.config.replanning.threshold {
            return false;
        }
        if !self.is_drone_approaching_gate(obs, target) {
            return false;
        }

        let gates = observed_gates(obs);
        let waypoints =
            self.planner
                .generate_smooth_replanning_waypoints(obs.pos, obs.vel, &gates, target);

        match self
            .planner
            .generate_trajectory_from_waypoints(&waypoints, Some(obs.vel), tick)
        {
            Ok(trajectory) => {
                info!(
                    "Tick {}: gate {} moved {:.3} m, replanned through {} waypoints ({} samples)",
                    tick,
                    target,
                    displacement,
                    waypoints.len(),
                    trajectory.len()
                );
                self.state.trajectory = trajectory;
                self.state.updated_gates.insert(target);
                self.state.last_replanning_tick = Some(tick);
                self.state.known_gates[target] = gates[target].clone();
                self.scheduler.activate(tick);
                true
            }
            Err(e) => {
                warn!(
                    "Tick {}: replanning for gate {} failed ({}), keeping current trajectory",
                    tick, target, e
                );
                self.state.last_replanning_tick = Some(tick);
                false
            }
        }
    }

    /// Whether the velocity has a positive component toward gate `gate`
    pub fn is_drone_approaching_gate(&self, obs: &Observation, gate: usize) -> bool {
        obs.gates_pos
            .get(gate)
            .map(|g| (g - obs.pos).dot(&obs.vel) > 0.0)
            .unwrap_or(false)
    }

    fn execute_mpc_control(&mut self, obs: &Observation) -> Result<[f64; 4], SolverError> {
        let commands = self.state.commands;
        let x0 = OcpState {
            pos: obs.pos,
            vel: obs.vel,
            rpy: obs.rpy(),
            f_collective: commands.f_collective,
            f_cmd: commands.f_cmd,
            rpy_cmd: commands.rpy_cmd,
        };
        self.solver.set_initial_state(&x0.to_vector())?;
        self.set_mpc_references()?;

        let status = self.solver.solve();
        self.state.last_status = Some(status);
        if !status.is_success() {
            warn!(
                "Tick {}: solver returned {:?} ({}), holding previous action",
                self.state.tick,
                status,
                status.code()
            );
            return Ok(self.state.last_action);
        }

        let x1 = self.solver.state(1)?;
        let next = OcpState::from_vector(&x1).ok_or(SolverError::DimensionMismatch {
            field: "x",
            expected: NX,
            got: x1.len(),
        })?;
        let action = next.action();
        if !action.iter().all(|v| v.is_finite()) {
            warn!("Tick {}: non-finite solution, holding previous action", self.state.tick);
            return Ok(self.state.last_action);
        }

        self.state.commands = next.command_channels();
        Ok(action)
    }

    /// References for every stage, offset by `tick - start_tick`
    ///
    /// Stages are mapped onto trajectory samples by time, so a horizon
    /// coarser than the control period skips samples. Past the end of the
    /// trajectory the final sample is held.
    fn set_mpc_references(&mut self) -> Result<(), SolverError> {
        let trajectory = &self.state.trajectory;
        let base = trajectory.sample_index(self.state.tick);
        let samples_per_stage = self.ocp.step() * self.config.env.freq;
        let n = self.solver.horizon();

        for stage in 0..=n {
            let index = base + (stage as f64 * samples_per_stage).round() as usize;
            let reference = ReferencePoint {
                position: trajectory.position(index),
                velocity: trajectory.velocity(index),
                thrust: self.hover_thrust,
            };
            if stage < n {
                self.solver.set_reference(stage, &reference.stage_vector())?;
            } else {
                self.solver.set_reference(stage, &reference.terminal_vector())?;
            }
        }
        Ok(())
    }

    /// Push the scheduler's current weights into every stage
    fn apply_weights(&mut self) -> Result<(), SolverError> {
        let weights = self.scheduler.current();
        let w: DMatrix<f64> = weights.stage_matrix();
        let w_e = weights.terminal_matrix();
        let n = self.solver.horizon();
        for stage in 0..n {
            self.solver.set_weights(stage, &w)?;
        }
        self.solver.set_weights(n, &w_e)
    }

    fn tracking_error(&self, pos: &Vector3<f64>) -> f64 {
        let trajectory = &self.state.trajectory;
        (pos - trajectory.position(trajectory.sample_index(self.state.tick))).norm()
    }

    fn stage_position(&self, stage: usize) -> Result<Vector3<f64>, SolverError> {
        let x = self.solver.state(stage)?;
        if x.len() < 3 {
            return Err(SolverError::DimensionMismatch {
                field: "x",
                expected: NX,
                got: x.len(),
            });
        }
        Ok(Vector3::new(x[0], x[1], x[2]))
    }

    /// Predicted positions for stages `0..N` and the full reference path
    pub fn predicted_trajectory(
        &self,
    ) -> Result<(Vec<Vector3<f64>>, Vec<Vector3<f64>>), SolverError> {
        let predicted = (0..self.solver.horizon())
            .map(|stage| self.stage_position(stage))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((predicted, self.state.trajectory.points()))
    }

    /// Predicted positions for stages `0..=N`
    pub fn predicted_path(&self) -> Result<Vec<Vector3<f64>>, SolverError> {
        (0..=self.solver.horizon())
            .map(|stage| self.stage_position(stage))
            .collect()
    }

    /// Reference path from the current sample onward
    pub fn path(&self) -> Vec<Vector3<f64>> {
        let trajectory = &self.state.trajectory;
        trajectory.points_from(trajectory.sample_index(self.state.tick))
    }

    pub fn obstacle_cylinders(&self) -> Vec<Cylinder> {
        self.collision.obstacle_cylinders()
    }

    pub fn gate_ellipsoids(&self) -> Vec<Ellipsoid> {
        self.collision.gate_ellipsoids()
    }

    pub fn tick(&self) -> u64 {
        self.state.tick
    }

    pub fn gates_passed(&self) -> usize {
        match self.state.progress {
            RaceProgress::Racing { gates_passed } => gates_passed,
            RaceProgress::Finished => self.total_gates(),
        }
    }

    pub fn total_gates(&self) -> usize {
        self.collision.num_gates()
    }

    pub fn progress(&self) -> RaceProgress {
        self.state.progress
    }

    pub fn is_finished(&self) -> bool {
        self.state.progress == RaceProgress::Finished
    }

    pub fn flight_successful(&self) -> bool {
        self.state.flight_successful
    }

    pub fn updated_gates(&self) -> &BTreeSet<usize> {
        &self.state.updated_gates
    }

    pub fn last_replanning_tick(&self) -> Option<u64> {
        self.state.last_replanning_tick
    }

    pub fn weights_adjusted(&self) -> bool {
        self.scheduler.is_adjusted()
    }

    pub fn current_weights(&self) -> &MpcWeights {
        self.scheduler.current()
    }

    pub fn weight_scheduler(&self) -> &WeightScheduler {
        &self.scheduler
    }

    pub fn trajectory(&self) -> &ReferenceTrajectory {
        &self.state.trajectory
    }

    pub fn episode_state(&self) -> &EpisodeState {
        &self.state
    }

    pub fn last_status(&self) -> Option<SolverStatus> {
        self.state.last_status
    }

    pub fn flight_log(&self) -> &FlightLog {
        &self.flight_log
    }

    pub fn collision_avoidance(&self) -> &CollisionAvoidance {
        &self.collision
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn ocp(&self) -> &OcpDefinition {
        &self.ocp
    }

    pub fn freq(&self) -> f64 {
        self.config.env.freq
    }

    pub fn horizon(&self) -> usize {
        self.ocp.n()
    }

    pub fn horizon_time(&self) -> f64 {
        self.ocp.horizon_time
    }

    pub fn solver(&self) -> &S {
        &self.solver
    }

    pub fn solver_mut(&mut self) -> &mut S {
        &mut self.solver
    }
}

/// Observed gate poses as track gates
fn observed_gates(obs: &Observation) -> Vec<Gate> {
    obs.gates_pos
        .iter()
        .enumerate()
        .map(|(i, pos)| Gate::new(*pos, obs.gate_yaw(i).unwrap_or(0.0)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Solver that always converges to a fixed state
    struct FixedSolver {
        n: usize,
        state: Vec<f64>,
        status: SolverStatus,
    }

    impl OcpSolver for FixedSolver {
        fn setup(&mut self, ocp: &OcpDefinition) -> Result<(), SolverError> {
            self.n = ocp.n();
            Ok(())
        }
        fn horizon(&self) -> usize {
            self.n
        }
        fn set_initial_state(&mut self, _x0: &[f64]) -> Result<(), SolverError> {
            Ok(())
        }
        fn set_reference(&mut self, _stage: usize, _yref: &[f64]) -> Result<(), SolverError> {
            Ok(())
        }
        fn set_parameters(&mut self, _stage: usize, _p: &[f64]) -> Result<(), SolverError> {
            Ok(())
        }
        fn set_weights(&mut self, _stage: usize, _w: &DMatrix<f64>) -> Result<(), SolverError> {
            Ok(())
        }
        fn solve(&mut self) -> SolverStatus {
            self.status
        }
        fn state(&self, _stage: usize) -> Result<Vec<f64>, SolverError> {
            Ok(self.state.clone())
        }
    }

    fn observation() -> Observation {
        let track = ControllerConfig::default().env.track;
        Observation {
            pos: Vector3::new(0.0, 0.0, 1.0),
            vel: Vector3::zeros(),
            quat: [0.0, 0.0, 0.0, 1.0],
            gates_pos: track.gate_positions(),
            gates_quat: track.gates.iter().map(|g| g.quaternion_xyzw()).collect(),
            obstacles_pos: track.obstacles.iter().map(|o| o.pos).collect(),
            target_gate: 0,
        }
    }

    fn controller(status: SolverStatus) -> RaceController<FixedSolver> {
        let mut state = vec![0.0; NX];
        state[2] = 1.0;
        state[9] = 0.3;
        state[10] = 0.3;
        let solver = FixedSolver { n: 0, state, status };
        RaceController::new(ControllerConfig::default(), &observation(), solver).unwrap()
    }

    #[test]
    fn test_progress_never_regresses() {
        let mut c = controller(SolverStatus::Success);

        c.update_progress(TargetGate::Gate(2));
        c.update_progress(TargetGate::Gate(1));
        assert_eq!(c.gates_passed(), 2);

        c.update_progress(TargetGate::Finished);
        c.update_progress(TargetGate::Gate(0));
        assert!(c.is_finished());
        assert_eq!(c.gates_passed(), 4);
    }

    #[test]
    fn test_action_from_command_states() {
        let mut c = controller(SolverStatus::Success);
        let action = c.compute_control(&observation()).unwrap();

        assert_relative_eq!(action[0], 0.3);
        assert_eq!(c.last_status(), Some(SolverStatus::Success));
        assert_relative_eq!(c.episode_state().commands.f_cmd, 0.3);
    }

    #[test]
    fn test_failed_solve_holds_hover() {
        let mut c = controller(SolverStatus::QpFailure);
        let action = c.compute_control(&observation()).unwrap();

        assert_relative_eq!(action[0], 0.033 * 9.81, epsilon = 1e-12);
        assert_eq!(&action[1..], &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_wrong_state_length_is_absorbed() {
        let mut c = controller(SolverStatus::Success);
        c.solver_mut().state = vec![0.0; 5];

        let action = c.compute_control(&observation()).unwrap();
        assert_eq!(action.len(), 4);
        assert_relative_eq!(action[0], 0.033 * 9.81, epsilon = 1e-12);
    }

    #[test]
    fn test_malformed_observation_is_fatal() {
        let mut c = controller(SolverStatus::Success);
        let mut obs = observation();
        obs.obstacles_pos.pop();

        assert!(matches!(
            c.compute_control(&obs),
            Err(ControllerError::Observation(ObservationError::ObstacleCount { .. }))
        ));
    }

    #[test]
    fn test_gate_count_mismatch_at_construction() {
        let mut obs = observation();
        obs.gates_pos.pop();
        obs.gates_quat.pop();
        let solver = FixedSolver { n: 0, state: vec![0.0; NX], status: SolverStatus::Success };

        assert!(matches!(
            RaceController::new(ControllerConfig::default(), &obs, solver),
            Err(ControllerError::Config(ConfigError::GateCountMismatch {
                configured: 4,
                observed: 3
            }))
        ));
    }
}
