//! Rotation utilities
//!
//! Gates only ever rotate about the world z-axis, so most of the geometry
//! works with yaw-only rotation matrices. Observations carry quaternions in
//! scalar-last `[x, y, z, w]` order.

use nalgebra::{Matrix3, Quaternion, UnitQuaternion, Vector3};

/// Rotation matrix about the world z-axis
///
/// ```text
/// Rz(ψ) = [cos ψ  -sin ψ  0]
///         [sin ψ   cos ψ  0]
///         [  0       0    1]
/// ```
pub fn yaw_rotation(yaw: f64) -> Matrix3<f64> {
    let (s, c) = yaw.sin_cos();
    #[rustfmt::skip]
    let rz = Matrix3::new(
          c,  -s, 0.0,
          s,   c, 0.0,
        0.0, 0.0, 1.0,
    );
    rz
}

/// Unit quaternion from scalar-last `[x, y, z, w]` components
///
/// The result is normalized, so slightly denormalized sensor quaternions
/// are accepted.
pub fn quaternion_from_xyzw(q: &[f64; 4]) -> UnitQuaternion<f64> {
    UnitQuaternion::from_quaternion(Quaternion::new(q[3], q[0], q[1], q[2]))
}

/// Scalar-last `[x, y, z, w]` components of a unit quaternion
pub fn quaternion_to_xyzw(q: &UnitQuaternion<f64>) -> [f64; 4] {
    [q.i, q.j, q.k, q.w]
}

/// Roll, pitch, yaw of a quaternion (extrinsic x-y-z convention)
pub fn quaternion_to_rpy(q: &UnitQuaternion<f64>) -> Vector3<f64> {
    let (roll, pitch, yaw) = q.euler_angles();
    Vector3::new(roll, pitch, yaw)
}

/// Quaternion from roll, pitch, yaw (extrinsic x-y-z convention)
pub fn quaternion_from_rpy(rpy: &Vector3<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::from_euler_angles(rpy.x, rpy.y, rpy.z)
}

/// Yaw angle of a scalar-last quaternion
pub fn yaw_from_xyzw(q: &[f64; 4]) -> f64 {
    quaternion_to_rpy(&quaternion_from_xyzw(q)).z
}

/// Flight direction through a gate with the given yaw
///
/// The gate frame spans the opening in its local x-z plane, so the drone
/// crosses it along the local y-axis.
pub fn gate_normal(yaw: f64) -> Vector3<f64> {
    yaw_rotation(yaw) * Vector3::new(0.0, 1.0, 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::{FRAC_PI_2, PI};

    #[test]
    fn test_yaw_rotation_orthogonal() {
        let r = yaw_rotation(0.7);

        assert_relative_eq!(r * r.transpose(), Matrix3::identity(), epsilon = 1e-12);
        assert_relative_eq!(r.determinant(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_yaw_rotation_quarter_turn() {
        let r = yaw_rotation(FRAC_PI_2);
        let x = r * Vector3::new(1.0, 0.0, 0.0);

        assert_relative_eq!(x, Vector3::new(0.0, 1.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_identity_quaternion_xyzw() {
        let q = quaternion_from_xyzw(&[0.0, 0.0, 0.0, 1.0]);
        assert_relative_eq!(quaternion_to_rpy(&q), Vector3::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn test_rpy_roundtrip_through_xyzw() {
        let rpy = Vector3::new(0.1, -0.2, 1.3);
        let xyzw = quaternion_to_xyzw(&quaternion_from_rpy(&rpy));
        let back = quaternion_to_rpy(&quaternion_from_xyzw(&xyzw));

        assert_relative_eq!(back, rpy, epsilon = 1e-10);
    }

    #[test]
    fn test_yaw_from_xyzw() {
        let q = quaternion_to_xyzw(&quaternion_from_rpy(&Vector3::new(0.0, 0.0, 3.0)));
        assert_relative_eq!(yaw_from_xyzw(&q), 3.0, epsilon = 1e-10);
    }

    #[test]
    fn test_gate_normal() {
        assert_relative_eq!(gate_normal(0.0), Vector3::new(0.0, 1.0, 0.0), epsilon = 1e-12);
        assert_relative_eq!(gate_normal(PI), Vector3::new(0.0, -1.0, 0.0), epsilon = 1e-12);
        assert_relative_eq!(gate_normal(-FRAC_PI_2), Vector3::new(1.0, 0.0, 0.0), epsilon = 1e-12);
    }
}
