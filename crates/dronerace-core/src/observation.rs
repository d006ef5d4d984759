//! Per-tick observation from the environment
//!
//! Observations cross the boundary between the simulator (or hardware stack)
//! and the controller. A malformed observation is rejected here, before any
//! of it reaches the constraint parameters or the solver.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::math::{quaternion_from_xyzw, quaternion_to_rpy, yaw_from_xyzw};

/// Observation validation errors
#[derive(Debug, Error, PartialEq)]
pub enum ObservationError {
    #[error("Expected {expected} gate positions, got {got}")]
    GateCount { expected: usize, got: usize },
    #[error("Expected {expected} gate orientations, got {got}")]
    GateOrientationCount { expected: usize, got: usize },
    #[error("Expected {expected} obstacle positions, got {got}")]
    ObstacleCount { expected: usize, got: usize },
    #[error("Non-finite value in field `{0}`")]
    NonFinite(&'static str),
    #[error("Degenerate quaternion in field `{0}`")]
    DegenerateQuaternion(&'static str),
    #[error("Target gate {target} outside -1..{num_gates}")]
    TargetOutOfRange { target: i32, num_gates: usize },
}

/// Race-progress signal carried by `target_gate`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetGate {
    /// Index of the gate the drone has to fly through next
    Gate(usize),
    /// All gates passed (`target_gate == -1`)
    Finished,
}

/// Environment observation for one control tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Drone position [m]
    pub pos: Vector3<f64>,
    /// Drone velocity [m/s]
    pub vel: Vector3<f64>,
    /// Drone attitude, scalar-last `[x, y, z, w]`
    pub quat: [f64; 4],
    /// Observed gate centers, in race order
    pub gates_pos: Vec<Vector3<f64>>,
    /// Observed gate orientations, scalar-last
    pub gates_quat: Vec<[f64; 4]>,
    /// Observed obstacle positions
    pub obstacles_pos: Vec<Vector3<f64>>,
    /// Next gate index, `-1` once the race is complete
    pub target_gate: i32,
}

impl Observation {
    /// Check shapes, finiteness and the target index
    pub fn validate(&self, num_gates: usize, num_obstacles: usize) -> Result<(), ObservationError> {
        if self.gates_pos.len() != num_gates {
            return Err(ObservationError::GateCount {
                expected: num_gates,
                got: self.gates_pos.len(),
            });
        }
        if self.gates_quat.len() != num_gates {
            return Err(ObservationError::GateOrientationCount {
                expected: num_gates,
                got: self.gates_quat.len(),
            });
        }
        if self.obstacles_pos.len() != num_obstacles {
            return Err(ObservationError::ObstacleCount {
                expected: num_obstacles,
                got: self.obstacles_pos.len(),
            });
        }

        let finite = |v: &Vector3<f64>| v.iter().all(|x| x.is_finite());
        if !finite(&self.pos) {
            return Err(ObservationError::NonFinite("pos"));
        }
        if !finite(&self.vel) {
            return Err(ObservationError::NonFinite("vel"));
        }
        if !self.gates_pos.iter().all(finite) {
            return Err(ObservationError::NonFinite("gates_pos"));
        }
        if !self.obstacles_pos.iter().all(finite) {
            return Err(ObservationError::NonFinite("obstacles_pos"));
        }

        check_quaternion(&self.quat, "quat")?;
        for q in &self.gates_quat {
            check_quaternion(q, "gates_quat")?;
        }

        if self.target_gate < -1 || self.target_gate >= num_gates as i32 {
            return Err(ObservationError::TargetOutOfRange {
                target: self.target_gate,
                num_gates,
            });
        }
        Ok(())
    }

    /// Interpret `target_gate`
    ///
    /// Any negative value is treated as completion; [`Self::validate`]
    /// rejects everything below `-1`.
    pub fn target(&self) -> TargetGate {
        if self.target_gate < 0 {
            TargetGate::Finished
        } else {
            TargetGate::Gate(self.target_gate as usize)
        }
    }

    /// Observed yaw of gate `i`
    pub fn gate_yaw(&self, i: usize) -> Option<f64> {
        self.gates_quat.get(i).map(yaw_from_xyzw)
    }

    /// Drone roll, pitch, yaw
    pub fn rpy(&self) -> Vector3<f64> {
        quaternion_to_rpy(&quaternion_from_xyzw(&self.quat))
    }
}

fn check_quaternion(q: &[f64; 4], field: &'static str) -> Result<(), ObservationError> {
    if !q.iter().all(|x| x.is_finite()) {
        return Err(ObservationError::NonFinite(field));
    }
    let norm_sq: f64 = q.iter().map(|x| x * x).sum();
    if norm_sq < 1e-12 {
        return Err(ObservationError::DegenerateQuaternion(field));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn observation() -> Observation {
        Observation {
            pos: Vector3::new(0.0, 0.0, 1.0),
            vel: Vector3::zeros(),
            quat: [0.0, 0.0, 0.0, 1.0],
            gates_pos: vec![Vector3::new(1.0, 0.0, 1.0), Vector3::new(2.0, 1.0, 1.0)],
            gates_quat: vec![[0.0, 0.0, 0.0, 1.0]; 2],
            obstacles_pos: vec![Vector3::new(0.5, 0.5, 1.0)],
            target_gate: 0,
        }
    }

    #[test]
    fn test_valid_observation() {
        assert_eq!(observation().validate(2, 1), Ok(()));
        assert_eq!(observation().target(), TargetGate::Gate(0));
    }

    #[test]
    fn test_finished_target() {
        let mut obs = observation();
        obs.target_gate = -1;

        assert_eq!(obs.validate(2, 1), Ok(()));
        assert_eq!(obs.target(), TargetGate::Finished);
    }

    #[test]
    fn test_rejects_wrong_shapes() {
        let obs = observation();
        assert_eq!(
            obs.validate(3, 1),
            Err(ObservationError::GateCount { expected: 3, got: 2 })
        );
        assert_eq!(
            obs.validate(2, 0),
            Err(ObservationError::ObstacleCount { expected: 0, got: 1 })
        );

        let mut obs = observation();
        obs.gates_quat.pop();
        assert_eq!(
            obs.validate(2, 1),
            Err(ObservationError::GateOrientationCount { expected: 2, got: 1 })
        );
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut obs = observation();
        obs.vel.x = f64::NAN;
        assert_eq!(obs.validate(2, 1), Err(ObservationError::NonFinite("vel")));

        let mut obs = observation();
        obs.quat = [0.0; 4];
        assert_eq!(obs.validate(2, 1), Err(ObservationError::DegenerateQuaternion("quat")));

        let mut obs = observation();
        obs.target_gate = 2;
        assert_eq!(
            obs.validate(2, 1),
            Err(ObservationError::TargetOutOfRange { target: 2, num_gates: 2 })
        );
    }

    #[test]
    fn test_gate_yaw() {
        let mut obs = observation();
        let half = 0.4_f64;
        obs.gates_quat[1] = [0.0, 0.0, half.sin(), half.cos()];

        assert_relative_eq!(obs.gate_yaw(1).unwrap(), 0.8, epsilon = 1e-12);
        assert!(obs.gate_yaw(5).is_none());
    }

    #[test]
    fn test_missing_key_fails_to_deserialize() {
        let json = r#"{
            "pos": [0.0, 0.0, 1.0],
            "vel": [0.0, 0.0, 0.0],
            "quat": [0.0, 0.0, 0.0, 1.0],
            "gates_pos": [],
            "gates_quat": [],
            "obstacles_pos": []
        }"#;

        assert!(serde_json::from_str::<Observation>(json).is_err());
    }

    #[test]
    fn test_deserializes_complete_observation_ignoring_extras() {
        let json = r#"{
            "pos": [0.0, 0.0, 1.0],
            "vel": [0.5, 0.0, 0.0],
            "quat": [0.0, 0.0, 0.0, 1.0],
            "gates_pos": [[1.0, 0.0, 1.0]],
            "gates_quat": [[0.0, 0.0, 0.0, 1.0]],
            "obstacles_pos": [],
            "target_gate": 0,
            "gates_visited": [true]
        }"#;
        let obs: Observation = serde_json::from_str(json).unwrap();

        assert_eq!(obs.validate(1, 0), Ok(()));
        assert_relative_eq!(obs.vel.x, 0.5);
    }
}
