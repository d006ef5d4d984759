//! Cost weights and the post-replan weight schedule
//!
//! After a replan the controller briefly tracks the new reference more
//! tightly. The scheduler ramps from the nominal weights toward the
//! replanning weights, holds them, and restores the nominal set exactly
//! once the adjustment window has elapsed.
//!
//! ```text
//! weight
//!   ^        ______________
//!   |       /              |
//!   |      /               |
//!   |_____/                |________
//!   +-----+-----+----------+-------> tick
//!       start  start+ramp  start+duration
//! ```

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::config::ScheduleConfig;
use crate::ocp::{NX, NY};

/// Diagonal weights of the tracking cost
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MpcWeights {
    /// Position tracking
    pub q_pos: f64,
    /// Velocity tracking
    pub q_vel: f64,
    /// Attitude (roll, pitch, yaw)
    pub q_rpy: f64,
    /// Collective thrust and thrust command
    pub q_thrust: f64,
    /// Attitude commands
    pub q_cmd: f64,
    /// Thrust command rate
    pub r_thrust_rate: f64,
    /// Attitude command rates
    pub r_rpy_rate: f64,
    /// Scaling of the terminal cost
    pub terminal_scale: f64,
}

impl Default for MpcWeights {
    fn default() -> Self {
        Self {
            q_pos: 50.0,
            q_vel: 10.0,
            q_rpy: 10.0,
            q_thrust: 0.01,
            q_cmd: 0.01,
            r_thrust_rate: 0.01,
            r_rpy_rate: 0.01,
            terminal_scale: 1.0,
        }
    }
}

impl MpcWeights {
    /// Field names paired with values, in declaration order
    pub fn named_entries(&self) -> [(&'static str, f64); 8] {
        [
            ("q_pos", self.q_pos),
            ("q_vel", self.q_vel),
            ("q_rpy", self.q_rpy),
            ("q_thrust", self.q_thrust),
            ("q_cmd", self.q_cmd),
            ("r_thrust_rate", self.r_thrust_rate),
            ("r_rpy_rate", self.r_rpy_rate),
            ("terminal_scale", self.terminal_scale),
        ]
    }

    /// Linear blend: `self` at `alpha = 0`, `target` at `alpha = 1`
    pub fn lerp(&self, target: &Self, alpha: f64) -> Self {
        let blend = |a: f64, b: f64| a + (b - a) * alpha;
        Self {
            q_pos: blend(self.q_pos, target.q_pos),
            q_vel: blend(self.q_vel, target.q_vel),
            q_rpy: blend(self.q_rpy, target.q_rpy),
            q_thrust: blend(self.q_thrust, target.q_thrust),
            q_cmd: blend(self.q_cmd, target.q_cmd),
            r_thrust_rate: blend(self.r_thrust_rate, target.r_thrust_rate),
            r_rpy_rate: blend(self.r_rpy_rate, target.r_rpy_rate),
            terminal_scale: blend(self.terminal_scale, target.terminal_scale),
        }
    }

    /// Stage cost matrix W (NY x NY)
    ///
    /// Layout follows `y = [pos(3), vel(3), rpy(3), f_collective, f_cmd,
    /// rpy_cmd(3), df_cmd, drpy_cmd(3)]`.
    pub fn stage_matrix(&self) -> DMatrix<f64> {
        let mut diag = Vec::with_capacity(NY);
        diag.extend_from_slice(&self.state_diagonal());
        diag.push(self.r_thrust_rate);
        diag.extend_from_slice(&[self.r_rpy_rate; 3]);
        DMatrix::from_diagonal(&nalgebra::DVector::from_vec(diag))
    }

    /// Terminal cost matrix W_e (NX x NX)
    pub fn terminal_matrix(&self) -> DMatrix<f64> {
        let diag: Vec<f64> = self
            .state_diagonal()
            .iter()
            .map(|w| w * self.terminal_scale)
            .collect();
        DMatrix::from_diagonal(&nalgebra::DVector::from_vec(diag))
    }

    fn state_diagonal(&self) -> [f64; NX] {
        let mut d = [0.0; NX];
        d[0..3].fill(self.q_pos);
        d[3..6].fill(self.q_vel);
        d[6..9].fill(self.q_rpy);
        d[9..11].fill(self.q_thrust);
        d[11..14].fill(self.q_cmd);
        d
    }
}

/// Interpolation profile of the ramp
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RampShape {
    #[default]
    Linear,
    /// `3s² - 2s³`, zero slope at both ends
    SmoothStep,
}

impl RampShape {
    /// Map normalized ramp progress in [0, 1] to a blend factor in [0, 1]
    pub fn apply(self, s: f64) -> f64 {
        let s = s.clamp(0.0, 1.0);
        match self {
            RampShape::Linear => s,
            RampShape::SmoothStep => s * s * (3.0 - 2.0 * s),
        }
    }
}

/// Scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleState {
    /// Nominal weights in effect
    Nominal,
    /// Adjustment window open since `start_tick`
    Adjusting { start_tick: u64 },
}

/// Ramps cost weights after a replan and restores the baseline afterwards
#[derive(Debug, Clone, PartialEq)]
pub struct WeightScheduler {
    baseline: MpcWeights,
    aggressive: MpcWeights,
    current: MpcWeights,
    state: ScheduleState,
    duration_ticks: u64,
    ramp_ticks: u64,
    shape: RampShape,
}

impl WeightScheduler {
    pub fn new(baseline: MpcWeights, aggressive: MpcWeights, schedule: &ScheduleConfig) -> Self {
        Self {
            current: baseline.clone(),
            baseline,
            aggressive,
            state: ScheduleState::Nominal,
            duration_ticks: schedule.duration_ticks,
            ramp_ticks: schedule.ramp_ticks,
            shape: schedule.shape,
        }
    }

    /// Open (or reopen) the adjustment window at `tick`
    ///
    /// The current weights are left untouched; the ramp starts from the
    /// baseline on the next [`Self::update`].
    pub fn activate(&mut self, tick: u64) {
        self.state = ScheduleState::Adjusting { start_tick: tick };
    }

    /// Advance the schedule to `tick`, returns whether the weights changed
    pub fn update(&mut self, tick: u64) -> bool {
        let ScheduleState::Adjusting { start_tick } = self.state else {
            return false;
        };

        let next = if tick >= start_tick + self.duration_ticks {
            self.state = ScheduleState::Nominal;
            self.baseline.clone()
        } else {
            let alpha = self.blend_factor(tick.saturating_sub(start_tick));
            self.baseline.lerp(&self.aggressive, alpha)
        };

        let changed = next != self.current;
        self.current = next;
        changed
    }

    /// Back to nominal weights with no open window
    pub fn reset(&mut self) {
        self.current = self.baseline.clone();
        self.state = ScheduleState::Nominal;
    }

    fn blend_factor(&self, elapsed: u64) -> f64 {
        if elapsed == 0 {
            0.0
        } else if self.ramp_ticks == 0 {
            1.0
        } else {
            self.shape.apply(elapsed as f64 / self.ramp_ticks as f64)
        }
    }

    pub fn current(&self) -> &MpcWeights {
        &self.current
    }

    pub fn baseline(&self) -> &MpcWeights {
        &self.baseline
    }

    pub fn aggressive(&self) -> &MpcWeights {
        &self.aggressive
    }

    pub fn state(&self) -> ScheduleState {
        self.state
    }

    /// Whether an adjustment window is open
    pub fn is_adjusted(&self) -> bool {
        matches!(self.state, ScheduleState::Adjusting { .. })
    }

    pub fn start_tick(&self) -> Option<u64> {
        match self.state {
            ScheduleState::Adjusting { start_tick } => Some(start_tick),
            ScheduleState::Nominal => None,
        }
    }

    pub fn duration_ticks(&self) -> u64 {
        self.duration_ticks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn scheduler(shape: RampShape) -> WeightScheduler {
        let baseline = MpcWeights::default();
        let aggressive = MpcWeights {
            q_pos: 150.0,
            ..baseline.clone()
        };
        let schedule = ScheduleConfig {
            duration_ticks: 40,
            ramp_ticks: 10,
            shape,
        };
        WeightScheduler::new(baseline, aggressive, &schedule)
    }

    #[test]
    fn test_baseline_at_activation() {
        let mut s = scheduler(RampShape::Linear);
        s.activate(100);

        assert!(s.is_adjusted());
        assert!(!s.update(100));
        assert_eq!(s.current(), s.baseline());
    }

    #[test]
    fn test_linear_ramp_is_monotonic_and_reaches_target() {
        let mut s = scheduler(RampShape::Linear);
        s.activate(0);

        let mut last = s.current().q_pos;
        for tick in 0..40 {
            s.update(tick);
            assert!(s.current().q_pos >= last);
            last = s.current().q_pos;
        }
        s.update(5);
        assert_relative_eq!(s.current().q_pos, 100.0, epsilon = 1e-12);
        s.update(10);
        assert_relative_eq!(s.current().q_pos, 150.0, epsilon = 1e-12);
        s.update(39);
        assert_relative_eq!(s.current().q_pos, 150.0, epsilon = 1e-12);
    }

    #[test]
    fn test_restores_baseline_exactly() {
        let mut s = scheduler(RampShape::SmoothStep);
        s.activate(7);
        s.update(20);
        assert!(s.current().q_pos > s.baseline().q_pos);

        assert!(s.update(7 + 40 + 10));
        assert!(!s.is_adjusted());
        assert_eq!(s.current(), s.baseline());
        assert_eq!(s.start_tick(), None);
    }

    #[test]
    fn test_reactivation_restarts_window() {
        let mut s = scheduler(RampShape::Linear);
        s.activate(0);
        s.update(30);
        s.activate(30);

        assert_eq!(s.start_tick(), Some(30));
        s.update(30);
        assert_eq!(s.current(), s.baseline());
        s.update(69);
        assert!(s.is_adjusted());
        s.update(70);
        assert!(!s.is_adjusted());
    }

    #[test]
    fn test_update_without_activation_is_noop() {
        let mut s = scheduler(RampShape::Linear);
        assert!(!s.update(1000));
        assert_eq!(s.state(), ScheduleState::Nominal);
    }

    #[test]
    fn test_smoothstep_profile() {
        assert_relative_eq!(RampShape::SmoothStep.apply(0.0), 0.0);
        assert_relative_eq!(RampShape::SmoothStep.apply(0.5), 0.5);
        assert_relative_eq!(RampShape::SmoothStep.apply(1.0), 1.0);
        assert_relative_eq!(RampShape::SmoothStep.apply(2.0), 1.0);
    }

    #[test]
    fn test_cost_matrices() {
        let w = MpcWeights::default();
        let stage = w.stage_matrix();
        let terminal = MpcWeights {
            terminal_scale: 2.0,
            ..w.clone()
        }
        .terminal_matrix();

        assert_eq!(stage.shape(), (18, 18));
        assert_eq!(terminal.shape(), (14, 14));
        assert_relative_eq!(stage[(0, 0)], w.q_pos);
        assert_relative_eq!(stage[(4, 4)], w.q_vel);
        assert_relative_eq!(stage[(14, 14)], w.r_thrust_rate);
        assert_relative_eq!(stage[(17, 17)], w.r_rpy_rate);
        assert_relative_eq!(stage[(0, 1)], 0.0);
        assert_relative_eq!(terminal[(2, 2)], 2.0 * w.q_pos);
    }
}
