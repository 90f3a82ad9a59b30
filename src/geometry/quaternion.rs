//! Rotation quaternion with explicit non-zero-norm contract.
//!
//! A [`Quaternion`] represents a rotation up to scale: any non-zero multiple of a
//! unit quaternion denotes the same rotation. Values are **not** renormalized
//! automatically; consumers that need a unit quaternion (rotation matrix,
//! vector rotation, logarithm) normalize on read. Every constructor and every
//! operation that could produce a zero-norm value reports
//! [`GeaError::DegenerateInput`] instead.
//!
//! # Examples
//!
//! ```
//! use gea_solver::geometry::Quaternion;
//! use nalgebra::Vector3;
//!
//! let q = Quaternion::from_axis_angle(&Vector3::z(), std::f64::consts::FRAC_PI_2).unwrap();
//! let rotated = q.rotate(&Vector3::x());
//! assert!((rotated - Vector3::y()).norm() < 1e-12);
//! ```

use crate::error::{GeaError, GeaResult};
use nalgebra::{Matrix3, Vector3, Vector4};
use std::fmt;

/// Norms below this threshold are treated as zero.
pub const MIN_NORM: f64 = 1e-12;

/// Rotation quaternion stored as `[w, x, y, z]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Quaternion {
    coords: Vector4<f64>,
}

impl fmt::Display for Quaternion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Quaternion(w: {:.4}, x: {:.4}, y: {:.4}, z: {:.4})",
            self.w(),
            self.x(),
            self.y(),
            self.z()
        )
    }
}

impl Quaternion {
    /// Create a quaternion from its components.
    ///
    /// # Arguments
    /// * `w` - Real (scalar) part
    /// * `x` - i component
    /// * `y` - j component
    /// * `z` - k component
    ///
    /// Fails with `DegenerateInput` if the norm is (numerically) zero or the
    /// components are not finite.
    pub fn new(w: f64, x: f64, y: f64, z: f64) -> GeaResult<Self> {
        Self::from_coords(Vector4::new(w, x, y, z))
    }

    /// Create a quaternion from a `[w, x, y, z]` vector.
    pub fn from_coords(coords: Vector4<f64>) -> GeaResult<Self> {
        check_norm(&coords)?;
        Ok(Self { coords })
    }

    /// Identity rotation (w=1, x=y=z=0).
    #[inline]
    pub fn identity() -> Self {
        Self {
            coords: Vector4::new(1.0, 0.0, 0.0, 0.0),
        }
    }

    /// Create a unit quaternion from an axis and angle.
    ///
    /// # Formula
    /// q = cos(θ/2) + sin(θ/2) * (ux*i + uy*j + uz*k)
    pub fn from_axis_angle(axis: &Vector3<f64>, angle: f64) -> GeaResult<Self> {
        let axis_norm = axis.norm();
        if axis_norm < MIN_NORM || !axis_norm.is_finite() {
            return Err(GeaError::DegenerateInput(format!(
                "rotation axis has norm {axis_norm:e}"
            )));
        }
        let half = 0.5 * angle;
        let v = axis * (half.sin() / axis_norm);
        Self::new(half.cos(), v.x, v.y, v.z)
    }

    /// Exponential map: unit quaternion of the rotation vector `omega`.
    ///
    /// Uses a Taylor expansion for small angles so that `omega = 0` maps to the
    /// identity exactly.
    pub fn from_scaled_axis(omega: &Vector3<f64>) -> GeaResult<Self> {
        let theta_sq = omega.norm_squared();
        if !theta_sq.is_finite() {
            return Err(GeaError::NumericDivergence(
                "non-finite rotation vector".to_string(),
            ));
        }
        let (real, imag_factor) = if theta_sq < 1e-16 {
            (1.0 - theta_sq / 8.0, 0.5 - theta_sq / 48.0)
        } else {
            let theta = theta_sq.sqrt();
            let half = 0.5 * theta;
            (half.cos(), half.sin() / theta)
        };
        let v = omega * imag_factor;
        Self::new(real, v.x, v.y, v.z)
    }

    /// Create a unit quaternion from a rotation matrix (Shepperd's method).
    ///
    /// The matrix is assumed orthonormal; a non-finite matrix is rejected.
    pub fn from_rotation_matrix(r: &Matrix3<f64>) -> GeaResult<Self> {
        if r.iter().any(|v| !v.is_finite()) {
            return Err(GeaError::NumericDivergence(
                "non-finite rotation matrix".to_string(),
            ));
        }
        let trace = r.trace();
        let coords = if trace > 0.0 {
            let s = 0.5 / (trace + 1.0).sqrt();
            Vector4::new(
                0.25 / s,
                (r[(2, 1)] - r[(1, 2)]) * s,
                (r[(0, 2)] - r[(2, 0)]) * s,
                (r[(1, 0)] - r[(0, 1)]) * s,
            )
        } else if r[(0, 0)] > r[(1, 1)] && r[(0, 0)] > r[(2, 2)] {
            let s = 2.0 * (1.0 + r[(0, 0)] - r[(1, 1)] - r[(2, 2)]).sqrt();
            Vector4::new(
                (r[(2, 1)] - r[(1, 2)]) / s,
                0.25 * s,
                (r[(0, 1)] + r[(1, 0)]) / s,
                (r[(0, 2)] + r[(2, 0)]) / s,
            )
        } else if r[(1, 1)] > r[(2, 2)] {
            let s = 2.0 * (1.0 + r[(1, 1)] - r[(0, 0)] - r[(2, 2)]).sqrt();
            Vector4::new(
                (r[(0, 2)] - r[(2, 0)]) / s,
                (r[(0, 1)] + r[(1, 0)]) / s,
                0.25 * s,
                (r[(1, 2)] + r[(2, 1)]) / s,
            )
        } else {
            let s = 2.0 * (1.0 + r[(2, 2)] - r[(0, 0)] - r[(1, 1)]).sqrt();
            Vector4::new(
                (r[(1, 0)] - r[(0, 1)]) / s,
                (r[(0, 2)] + r[(2, 0)]) / s,
                (r[(1, 2)] + r[(2, 1)]) / s,
                0.25 * s,
            )
        };
        Self::from_coords(coords)
    }

    #[inline]
    pub fn w(&self) -> f64 {
        self.coords[0]
    }

    #[inline]
    pub fn x(&self) -> f64 {
        self.coords[1]
    }

    #[inline]
    pub fn y(&self) -> f64 {
        self.coords[2]
    }

    #[inline]
    pub fn z(&self) -> f64 {
        self.coords[3]
    }

    /// Raw `[w, x, y, z]` components.
    #[inline]
    pub fn coords(&self) -> &Vector4<f64> {
        &self.coords
    }

    /// Imaginary part `(x, y, z)`.
    #[inline]
    pub fn imag(&self) -> Vector3<f64> {
        Vector3::new(self.x(), self.y(), self.z())
    }

    #[inline]
    pub fn norm(&self) -> f64 {
        self.coords.norm()
    }

    #[inline]
    pub fn norm_squared(&self) -> f64 {
        self.coords.norm_squared()
    }

    /// Unit-norm copy of this quaternion.
    pub fn normalized(&self) -> Self {
        Self {
            coords: self.coords / self.norm(),
        }
    }

    /// Conjugate `w - xi - yj - zk`.
    pub fn conjugate(&self) -> Self {
        Self {
            coords: Vector4::new(self.w(), -self.x(), -self.y(), -self.z()),
        }
    }

    /// Multiplicative inverse `q* / |q|²`.
    pub fn inverse(&self) -> GeaResult<Self> {
        let norm_sq = self.norm_squared();
        Self::from_coords(self.conjugate().coords / norm_sq)
    }

    /// Hamilton product `self ⊗ other`.
    ///
    /// # Formula
    /// (w1 + v1)(w2 + v2) = (w1 w2 - v1·v2) + (w1 v2 + w2 v1 + v1 × v2)
    pub fn multiply(&self, other: &Self) -> GeaResult<Self> {
        let (w1, v1) = (self.w(), self.imag());
        let (w2, v2) = (other.w(), other.imag());
        let w = w1 * w2 - v1.dot(&v2);
        let v = v2 * w1 + v1 * w2 + v1.cross(&v2);
        Self::new(w, v.x, v.y, v.z)
    }

    /// Rotation matrix of the normalized quaternion.
    pub fn to_rotation_matrix(&self) -> Matrix3<f64> {
        let q = self.normalized();
        let (w, x, y, z) = (q.w(), q.x(), q.y(), q.z());
        let (xx, yy, zz) = (x * x, y * y, z * z);
        let (xy, xz, yz) = (x * y, x * z, y * z);
        let (wx, wy, wz) = (w * x, w * y, w * z);
        Matrix3::new(
            1.0 - 2.0 * (yy + zz),
            2.0 * (xy - wz),
            2.0 * (xz + wy),
            2.0 * (xy + wz),
            1.0 - 2.0 * (xx + zz),
            2.0 * (yz - wx),
            2.0 * (xz - wy),
            2.0 * (yz + wx),
            1.0 - 2.0 * (xx + yy),
        )
    }

    /// Rotate a 3D vector by the normalized quaternion.
    ///
    /// # Formula
    /// v' = v + w t + q_v × t, with t = 2 q_v × v
    pub fn rotate(&self, v: &Vector3<f64>) -> Vector3<f64> {
        let q = self.normalized();
        let qv = q.imag();
        let t = qv.cross(v) * 2.0;
        v + t * q.w() + qv.cross(&t)
    }

    /// Logarithm map: rotation vector of the normalized quaternion, in the
    /// shortest-path branch (angle in [0, π]).
    pub fn to_scaled_axis(&self) -> Vector3<f64> {
        let q = self.normalized();
        let (w, v) = if q.w() < 0.0 {
            (-q.w(), -q.imag())
        } else {
            (q.w(), q.imag())
        };
        let sin_half = v.norm();
        if sin_half < 1e-10 {
            return v * (2.0 / w);
        }
        let angle = 2.0 * sin_half.atan2(w);
        v * (angle / sin_half)
    }

    /// Rotation angle (radians) between the rotations represented by `self` and `other`.
    pub fn angle_to(&self, other: &Self) -> f64 {
        let dot = self.normalized().coords.dot(&other.normalized().coords).abs();
        2.0 * dot.min(1.0).acos()
    }

    /// Whether both quaternions represent the same rotation within `tolerance`
    /// (handles the q / -q double cover).
    pub fn is_approx(&self, other: &Self, tolerance: f64) -> bool {
        let a = self.normalized().coords;
        let b = other.normalized().coords;
        (a - b).norm() < tolerance || (a + b).norm() < tolerance
    }

    pub fn is_finite(&self) -> bool {
        self.coords.iter().all(|v| v.is_finite())
    }
}

fn check_norm(coords: &Vector4<f64>) -> GeaResult<()> {
    if coords.iter().any(|v| !v.is_finite()) {
        return Err(GeaError::NumericDivergence(format!(
            "non-finite quaternion {coords:?}"
        )));
    }
    let norm = coords.norm();
    if norm < MIN_NORM {
        return Err(GeaError::DegenerateInput(format!(
            "quaternion norm {norm:e} is zero"
        )));
    }
    Ok(())
}
