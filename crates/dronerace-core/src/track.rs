//! Race track model
//!
//! The nominal track comes from static configuration: gate poses and
//! obstacle positions as they were laid out before the race. During flight
//! the observed poses may differ from these by a few centimeters.

use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::math::{gate_normal, quaternion_from_rpy, quaternion_to_xyzw};

/// A gate of the nominal track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gate {
    /// Gate center [m]
    pub pos: Vector3<f64>,
    /// Roll, pitch, yaw [rad]; only yaw is used by the racing geometry
    #[serde(default = "Vector3::zeros")]
    pub rpy: Vector3<f64>,
}

impl Gate {
    pub fn new(pos: Vector3<f64>, yaw: f64) -> Self {
        Self {
            pos,
            rpy: Vector3::new(0.0, 0.0, yaw),
        }
    }

    pub fn yaw(&self) -> f64 {
        self.rpy.z
    }

    pub fn orientation(&self) -> UnitQuaternion<f64> {
        quaternion_from_rpy(&self.rpy)
    }

    /// Orientation as scalar-last `[x, y, z, w]`, as observations carry it
    pub fn quaternion_xyzw(&self) -> [f64; 4] {
        quaternion_to_xyzw(&self.orientation())
    }

    /// Flight direction through the gate opening
    pub fn normal(&self) -> Vector3<f64> {
        gate_normal(self.yaw())
    }
}

/// A static obstacle (vertical pole) of the nominal track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Obstacle {
    /// Obstacle position [m]; the pole extends vertically through it
    pub pos: Vector3<f64>,
}

impl Obstacle {
    pub fn new(pos: Vector3<f64>) -> Self {
        Self { pos }
    }
}

/// Nominal race track
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Track {
    /// Gates in race order
    #[serde(default)]
    pub gates: Vec<Gate>,
    #[serde(default)]
    pub obstacles: Vec<Obstacle>,
}

impl Track {
    pub fn num_gates(&self) -> usize {
        self.gates.len()
    }

    pub fn num_obstacles(&self) -> usize {
        self.obstacles.len()
    }

    pub fn gate_positions(&self) -> Vec<Vector3<f64>> {
        self.gates.iter().map(|g| g.pos).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_gate_yaw_and_normal() {
        let gate = Gate::new(Vector3::new(2.0, 1.0, 1.0), FRAC_PI_2);

        assert_relative_eq!(gate.yaw(), FRAC_PI_2, epsilon = 1e-12);
        assert_relative_eq!(gate.normal(), Vector3::new(-1.0, 0.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_gate_quaternion_is_unit() {
        let gate = Gate::new(Vector3::zeros(), 1.2);
        let q = gate.quaternion_xyzw();
        let norm: f64 = q.iter().map(|v| v * v).sum::<f64>().sqrt();

        assert_relative_eq!(norm, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_track_deserializes_from_json() {
        let json = r#"{
            "gates": [
                {"pos": [1.0, 0.0, 1.0], "rpy": [0.0, 0.0, 0.0]},
                {"pos": [2.0, 1.0, 1.0]}
            ],
            "obstacles": [{"pos": [0.5, 0.5, 0.5]}]
        }"#;
        let track: Track = serde_json::from_str(json).unwrap();

        assert_eq!(track.num_gates(), 2);
        assert_eq!(track.num_obstacles(), 1);
        assert_relative_eq!(track.gates[1].yaw(), 0.0);
    }
}
