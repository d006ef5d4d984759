//! Controller configuration
//!
//! Everything the race controller needs before the first tick: control rate,
//! nominal track, horizon, collision-body dimensions, cost weights and the
//! replanning policy. Loaded from TOML; every section falls back to its
//! defaults when omitted.

use std::collections::BTreeSet;
use std::path::Path;

use dronerace_core::{Gate, Obstacle, Track, GRAVITY};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::weights::{MpcWeights, RampShape};

/// Configuration errors, all detected before the first control tick
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Ignored obstacle index {index} out of range (track has {num_obstacles} obstacles)")]
    IgnoredObstacleOutOfRange { index: usize, num_obstacles: usize },
    #[error("Ignored obstacle index {0} listed twice")]
    DuplicateIgnoredObstacle(usize),
    #[error("Track has {configured} gates but the observation reports {observed}")]
    GateCountMismatch { configured: usize, observed: usize },
    #[error("Track has {configured} obstacles but the observation reports {observed}")]
    ObstacleCountMismatch { configured: usize, observed: usize },
    #[error("Track must contain at least one gate")]
    EmptyTrack,
    #[error("Horizon must have at least one node")]
    ZeroHorizon,
    #[error("`{0}` must be positive and finite")]
    NonPositive(&'static str),
    #[error("Replanning weight `{0}` is below its nominal value")]
    WeakerReplanningWeights(&'static str),
    #[error("Ramp of {ramp} ticks exceeds the adjustment window of {duration} ticks")]
    RampLongerThanWindow { ramp: u64, duration: u64 },
    #[error("Thrust bounds are inverted: min {min} >= max {max}")]
    InvertedThrustBounds { min: f64, max: f64 },
    #[error("Model already declares {0}; collision parameters must own the parameter layout")]
    ParameterLayoutConflict(&'static str),
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Main controller configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Control rate and nominal track
    pub env: EnvConfig,
    /// OCP horizon
    pub horizon: HorizonConfig,
    /// Vehicle parameters
    pub vehicle: VehicleConfig,
    /// Collision bodies and soft-constraint penalties
    pub collision: CollisionConfig,
    /// Nominal and replanning cost weights
    pub weights: WeightsConfig,
    /// Weight ramp after a replan
    pub schedule: ScheduleConfig,
    /// Replanning policy
    pub replanning: ReplanConfig,
    /// In-memory flight log
    pub telemetry: TelemetryConfig,
}

impl ControllerConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Control period [s]
    pub fn dt(&self) -> f64 {
        1.0 / self.env.freq
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("env.freq", self.env.freq)?;
        if self.env.track.gates.is_empty() {
            return Err(ConfigError::EmptyTrack);
        }

        if self.horizon.num_nodes == 0 {
            return Err(ConfigError::ZeroHorizon);
        }
        positive("horizon.horizon_time", self.horizon.horizon_time)?;

        positive("vehicle.mass", self.vehicle.mass)?;
        if self.vehicle.thrust_min >= self.vehicle.thrust_max {
            return Err(ConfigError::InvertedThrustBounds {
                min: self.vehicle.thrust_min,
                max: self.vehicle.thrust_max,
            });
        }
        positive("vehicle.max_tilt", self.vehicle.max_tilt)?;

        self.collision.validate(self.env.track.num_obstacles())?;

        self.weights.validate()?;

        if self.schedule.duration_ticks == 0 {
            return Err(ConfigError::NonPositive("schedule.duration_ticks"));
        }
        if self.schedule.ramp_ticks > self.schedule.duration_ticks {
            return Err(ConfigError::RampLongerThanWindow {
                ramp: self.schedule.ramp_ticks,
                duration: self.schedule.duration_ticks,
            });
        }

        positive("replanning.threshold", self.replanning.threshold)?;
        positive("replanning.speed", self.replanning.speed)?;
        positive("replanning.min_waypoint_spacing", self.replanning.min_waypoint_spacing)?;
        non_negative("replanning.gate_offset", self.replanning.gate_offset)?;
        non_negative("replanning.lookahead_time", self.replanning.lookahead_time)?;

        if self.telemetry.log_capacity == 0 {
            return Err(ConfigError::NonPositive("telemetry.log_capacity"));
        }
        Ok(())
    }
}

fn positive(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NonPositive(name))
    }
}

fn non_negative(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NonPositive(name))
    }
}

/// Environment configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    /// Control frequency [Hz]
    pub freq: f64,
    /// Nominal track layout
    pub track: Track,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            freq: 50.0,
            track: demo_track(),
        }
    }
}

/// Four-gate loop used when no track is configured
fn demo_track() -> Track {
    Track {
        gates: vec![
            Gate::new(Vector3::new(1.0, 0.0, 1.0), 0.0),
            Gate::new(Vector3::new(2.0, 1.0, 1.0), 1.57),
            Gate::new(Vector3::new(1.0, 2.0, 1.2), 3.14),
            Gate::new(Vector3::new(0.0, 1.0, 1.0), -1.57),
        ],
        obstacles: vec![
            Obstacle::new(Vector3::new(0.5, 0.5, 0.5)),
            Obstacle::new(Vector3::new(1.5, 1.5, 0.8)),
        ],
    }
}

/// Horizon configuration for the OCP
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HorizonConfig {
    /// Number of shooting nodes N
    pub num_nodes: usize,
    /// Total horizon time [s]
    pub horizon_time: f64,
}

impl Default for HorizonConfig {
    fn default() -> Self {
        Self {
            num_nodes: 60,
            horizon_time: 2.0,
        }
    }
}

/// Vehicle parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VehicleConfig {
    /// Mass [kg]
    pub mass: f64,
    /// Minimum collective thrust [N]
    pub thrust_min: f64,
    /// Maximum collective thrust [N]
    pub thrust_max: f64,
    /// Bound on commanded roll and pitch [rad]
    pub max_tilt: f64,
}

impl Default for VehicleConfig {
    fn default() -> Self {
        Self {
            mass: 0.033,
            thrust_min: 0.1,
            thrust_max: 0.6,
            max_tilt: 0.5,
        }
    }
}

impl VehicleConfig {
    /// Collective thrust that balances gravity [N]
    pub fn hover_thrust(&self) -> f64 {
        self.mass * GRAVITY
    }
}

/// Collision bodies and their soft-constraint penalties
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollisionConfig {
    /// Side length of the gate opening [m]
    pub gate_length: f64,
    /// Length of each gate-border ellipsoid [m]
    pub ellipsoid_length: f64,
    /// Cross-section radius of each gate-border ellipsoid [m]
    pub ellipsoid_radius: f64,
    /// Radius of the keep-out cylinder around each obstacle [m]
    pub obstacle_radius: f64,
    /// Obstacles excluded from collision avoidance
    pub ignored_obstacles: Vec<usize>,
    /// Penalty on violating a collision constraint (linear and quadratic)
    pub slack_penalty: f64,
    /// Upper bound sentinel making the constraints one-sided
    pub upper_bound: f64,
}

impl Default for CollisionConfig {
    fn default() -> Self {
        Self {
            gate_length: 0.5,
            ellipsoid_length: 0.7,
            ellipsoid_radius: 0.12,
            obstacle_radius: 0.15,
            ignored_obstacles: Vec::new(),
            slack_penalty: 1e4,
            upper_bound: 1e10,
        }
    }
}

impl CollisionConfig {
    /// Check dimensions and the ignored set against the obstacle count
    pub fn validate(&self, num_obstacles: usize) -> Result<(), ConfigError> {
        positive("collision.gate_length", self.gate_length)?;
        positive("collision.ellipsoid_length", self.ellipsoid_length)?;
        positive("collision.ellipsoid_radius", self.ellipsoid_radius)?;
        positive("collision.obstacle_radius", self.obstacle_radius)?;
        positive("collision.slack_penalty", self.slack_penalty)?;
        positive("collision.upper_bound", self.upper_bound)?;

        let mut seen = BTreeSet::new();
        for &index in &self.ignored_obstacles {
            if index >= num_obstacles {
                return Err(ConfigError::IgnoredObstacleOutOfRange { index, num_obstacles });
            }
            if !seen.insert(index) {
                return Err(ConfigError::DuplicateIgnoredObstacle(index));
            }
        }
        Ok(())
    }
}

/// Nominal and replanning weight sets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightsConfig {
    /// Steady-state tracking weights
    pub nominal: MpcWeights,
    /// Tighter tracking weights used right after a replan
    pub replanning: MpcWeights,
}

impl Default for WeightsConfig {
    fn default() -> Self {
        let nominal = MpcWeights::default();
        let replanning = MpcWeights {
            q_pos: 120.0,
            q_vel: 15.0,
            ..nominal.clone()
        };
        Self { nominal, replanning }
    }
}

impl WeightsConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in self.nominal.named_entries() {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::NonPositive(name));
            }
        }
        for ((name, nominal), (_, replanning)) in self
            .nominal
            .named_entries()
            .into_iter()
            .zip(self.replanning.named_entries())
        {
            if !replanning.is_finite() || replanning < nominal {
                return Err(ConfigError::WeakerReplanningWeights(name));
            }
        }
        Ok(())
    }
}

/// Weight ramp after a replan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Ticks from activation until the nominal weights are restored
    pub duration_ticks: u64,
    /// Ticks to ramp from nominal to replanning weights
    pub ramp_ticks: u64,
    /// Interpolation profile of the ramp
    pub shape: RampShape,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            duration_ticks: 50,
            ramp_ticks: 15,
            shape: RampShape::Linear,
        }
    }
}

/// Replanning policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplanConfig {
    /// Gate displacement that triggers a replan [m]
    pub threshold: f64,
    /// Minimum ticks between two replans
    pub cooldown_ticks: u64,
    /// Distance of approach and exit waypoints from the gate center [m]
    pub gate_offset: f64,
    /// Cruise speed used to time the waypoints [m/s]
    pub speed: f64,
    /// Velocity lookahead for the first replanning waypoint [s]
    pub lookahead_time: f64,
    /// Waypoints closer than this to their predecessor are dropped [m]
    pub min_waypoint_spacing: f64,
}

impl Default for ReplanConfig {
    fn default() -> Self {
        Self {
            threshold: 0.05,
            cooldown_ticks: 10,
            gate_offset: 0.3,
            speed: 1.5,
            lookahead_time: 0.2,
            min_waypoint_spacing: 0.05,
        }
    }
}

/// In-memory flight log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Number of tick records kept
    pub log_capacity: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { log_capacity: 3000 }
    }
}
