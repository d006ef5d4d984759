//! Cubic spline through 3D waypoints
//!
//! C² piecewise-cubic interpolation parameterized by time. The start can be
//! clamped to a given velocity so that a replacement path leaves the
//! vehicle's current state without a velocity jump; the end is natural
//! (zero second derivative).

use nalgebra::{DMatrix, Vector3};
use thiserror::Error;

/// Spline construction errors
#[derive(Debug, Error, PartialEq)]
pub enum SplineError {
    #[error("At least two waypoints are required, got {0}")]
    TooFewPoints(usize),
    #[error("Knot and waypoint counts differ: {knots} knots, {points} waypoints")]
    LengthMismatch { knots: usize, points: usize },
    #[error("Knots must be strictly increasing (violated at index {0})")]
    NonIncreasingKnots(usize),
    #[error("Non-finite input at index {0}")]
    NonFinite(usize),
    #[error("Spline system is singular")]
    Singular,
}

/// Time-parameterized cubic spline in 3D
#[derive(Debug, Clone)]
pub struct CubicSpline {
    knots: Vec<f64>,
    points: Vec<Vector3<f64>>,
    /// Second derivative at each knot
    moments: Vec<Vector3<f64>>,
}

impl CubicSpline {
    /// Fit a spline through `points` at times `knots`
    ///
    /// With `start_velocity` the first derivative at `knots[0]` is pinned,
    /// otherwise both ends are natural.
    pub fn new(
        knots: Vec<f64>,
        points: Vec<Vector3<f64>>,
        start_velocity: Option<Vector3<f64>>,
    ) -> Result<Self, SplineError> {
        if points.len() < 2 {
            return Err(SplineError::TooFewPoints(points.len()));
        }
        if knots.len() != points.len() {
            return Err(SplineError::LengthMismatch { knots: knots.len(), points: points.len() });
        }
        for (i, (t, p)) in knots.iter().zip(points.iter()).enumerate() {
            if !t.is_finite() || !p.iter().all(|v| v.is_finite()) {
                return Err(SplineError::NonFinite(i));
            }
            if i > 0 && *t <= knots[i - 1] {
                return Err(SplineError::NonIncreasingKnots(i));
            }
        }
        if let Some(v0) = start_velocity {
            if !v0.iter().all(|v| v.is_finite()) {
                return Err(SplineError::NonFinite(0));
            }
        }

        let n = points.len();
        let h: Vec<f64> = knots.windows(2).map(|w| w[1] - w[0]).collect();
        let slope = |i: usize| (points[i + 1] - points[i]) / h[i];

        let mut a = DMatrix::<f64>::zeros(n, n);
        let mut b = DMatrix::<f64>::zeros(n, 3);

        match start_velocity {
            Some(v0) => {
                a[(0, 0)] = 2.0 * h[0];
                a[(0, 1)] = h[0];
                let rhs = 6.0 * (slope(0) - v0);
                b.row_mut(0).copy_from(&rhs.transpose());
            }
            None => a[(0, 0)] = 1.0,
        }

        for i in 1..n - 1 {
            a[(i, i - 1)] = h[i - 1];
            a[(i, i)] = 2.0 * (h[i - 1] + h[i]);
            a[(i, i + 1)] = h[i];
            let rhs = 6.0 * (slope(i) - slope(i - 1));
            b.row_mut(i).copy_from(&rhs.transpose());
        }

        // Natural end
        a[(n - 1, n - 1)] = 1.0;

        let m = a.lu().solve(&b).ok_or(SplineError::Singular)?;
        let moments: Vec<Vector3<f64>> = (0..n)
            .map(|i| Vector3::new(m[(i, 0)], m[(i, 1)], m[(i, 2)]))
            .collect();

        if moments.iter().any(|v| !v.iter().all(|x| x.is_finite())) {
            return Err(SplineError::Singular);
        }

        Ok(Self { knots, points, moments })
    }

    /// First knot time
    pub fn start_time(&self) -> f64 {
        self.knots[0]
    }

    /// Last knot time
    pub fn end_time(&self) -> f64 {
        self.knots[self.knots.len() - 1]
    }

    /// Total duration
    pub fn duration(&self) -> f64 {
        self.end_time() - self.start_time()
    }

    /// Position at time `t`, held constant outside the knot range
    pub fn position(&self, t: f64) -> Vector3<f64> {
        if t <= self.start_time() {
            return self.points[0];
        }
        if t >= self.end_time() {
            return self.points[self.points.len() - 1];
        }
        let (i, a, b, h) = self.locate(t);
        let (m0, m1) = (self.moments[i], self.moments[i + 1]);
        let (y0, y1) = (self.points[i], self.points[i + 1]);

        m0 * (a.powi(3) / (6.0 * h))
            + m1 * (b.powi(3) / (6.0 * h))
            + (y0 / h - m0 * (h / 6.0)) * a
            + (y1 / h - m1 * (h / 6.0)) * b
    }

    /// Velocity at time `t`, zero past the end
    pub fn velocity(&self, t: f64) -> Vector3<f64> {
        if t >= self.end_time() {
            return Vector3::zeros();
        }
        let t = t.max(self.start_time());
        let (i, a, b, h) = self.locate(t);
        let (m0, m1) = (self.moments[i], self.moments[i + 1]);
        let (y0, y1) = (self.points[i], self.points[i + 1]);

        -m0 * (a * a / (2.0 * h)) + m1 * (b * b / (2.0 * h)) - (y0 / h - m0 * (h / 6.0))
            + (y1 / h - m1 * (h / 6.0))
    }

    /// Sample times at fixed spacing `dt`; the last one is the end time
    pub fn sample_times(&self, dt: f64) -> Vec<f64> {
        let count = (self.duration() / dt - 1e-9).ceil().max(0.0) as usize + 1;
        (0..count)
            .map(|k| {
                if k + 1 == count {
                    self.end_time()
                } else {
                    self.start_time() + k as f64 * dt
                }
            })
            .collect()
    }

    /// Positions at [`Self::sample_times`]
    pub fn sample_positions(&self, dt: f64) -> Vec<Vector3<f64>> {
        self.sample_times(dt).into_iter().map(|t| self.position(t)).collect()
    }

    /// Analytic velocities at [`Self::sample_times`], zero at the final sample
    pub fn sample_velocities(&self, dt: f64) -> Vec<Vector3<f64>> {
        self.sample_times(dt).into_iter().map(|t| self.velocity(t)).collect()
    }

    /// Segment index and local coordinates for an interior time
    fn locate(&self, t: f64) -> (usize, f64, f64, f64) {
        let i = self.knots
            .partition_point(|&k| k <= t)
            .saturating_sub(1)
            .min(self.knots.len() - 2);
        let h = self.knots[i + 1] - self.knots[i];
        (i, self.knots[i + 1] - t, t - self.knots[i], h)
    }
}
