//! Camera pose: orientation quaternion plus optical center.
//!
//! World points map to camera coordinates as `R (X - c)`, so the equivalent
//! extrinsic translation is `t = -R c` and the projection matrix is `[R | -R c]`.

use super::quaternion::Quaternion;
use crate::error::{GeaError, GeaResult};
use nalgebra::{Matrix3, Matrix4, Point2, Point3, Vector3, Vector6};
use std::fmt;

/// Depths with magnitude below this value cannot be projected.
const MIN_DEPTH: f64 = 1e-12;

/// Orientation and center of a calibrated camera.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraPose {
    pub orientation: Quaternion,
    pub center: Point3<f64>,
}

impl Default for CameraPose {
    fn default() -> Self {
        Self::identity()
    }
}

impl fmt::Display for CameraPose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CameraPose({}, center: [{:.4}, {:.4}, {:.4}])",
            self.orientation, self.center.x, self.center.y, self.center.z
        )
    }
}

impl CameraPose {
    pub fn new(orientation: Quaternion, center: Point3<f64>) -> Self {
        Self {
            orientation,
            center,
        }
    }

    pub fn identity() -> Self {
        Self::new(Quaternion::identity(), Point3::origin())
    }

    /// Build a pose from extrinsics `x_cam = R x_world + t`.
    pub fn from_rotation_translation(r: &Matrix3<f64>, t: &Vector3<f64>) -> GeaResult<Self> {
        let orientation = Quaternion::from_rotation_matrix(r)?;
        let center = Point3::from(-(r.transpose() * t));
        Ok(Self::new(orientation, center))
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.orientation.to_rotation_matrix()
    }

    /// Extrinsic translation `-R c`.
    pub fn translation(&self) -> Vector3<f64> {
        -self.orientation.rotate(&self.center.coords)
    }

    /// Homogeneous 4×4 matrix `[R | -R c; 0 0 0 1]`.
    pub fn to_projection_matrix(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&self.rotation_matrix());
        m.fixed_view_mut::<3, 1>(0, 3)
            .copy_from(&self.translation());
        m
    }

    /// World point expressed in camera coordinates.
    pub fn to_camera_coordinates(&self, point: &Point3<f64>) -> Vector3<f64> {
        self.orientation.rotate(&(point - self.center))
    }

    /// Project a world point to normalized image coordinates.
    pub fn project(&self, point: &Point3<f64>) -> GeaResult<Point2<f64>> {
        let p = self.to_camera_coordinates(point);
        if p.z.abs() < MIN_DEPTH || !p.z.is_finite() {
            return Err(GeaError::DegenerateInput(format!(
                "point {point:?} has depth {:e} in camera",
                p.z
            )));
        }
        Ok(Point2::new(p.x / p.z, p.y / p.z))
    }

    /// Pose whose projection matrix is `self.P * other.P`.
    pub fn compose(&self, other: &CameraPose) -> GeaResult<Self> {
        let orientation = self.orientation.multiply(&other.orientation)?;
        let inv_other = other.orientation.inverse()?;
        let center = other.center + inv_other.rotate(&self.center.coords);
        Ok(Self::new(orientation, center))
    }

    /// Pose whose projection matrix is the inverse of `self.P`.
    pub fn inverse(&self) -> GeaResult<Self> {
        let orientation = self.orientation.inverse()?;
        Ok(Self::new(orientation, Point3::from(self.translation())))
    }

    /// Apply a tangent-space update `delta = [δθ; δc]`.
    ///
    /// The rotation is left-perturbed, `q ← exp(δθ) ⊗ q`, and the center moves
    /// additively, `c ← c + δc`. The orientation is kept at unit norm.
    pub fn retract(&self, delta: &Vector6<f64>) -> GeaResult<Self> {
        if delta.iter().any(|v| !v.is_finite()) {
            return Err(GeaError::NumericDivergence(
                "non-finite pose update".to_string(),
            ));
        }
        let dq = Quaternion::from_scaled_axis(&delta.fixed_rows::<3>(0).into_owned())?;
        let orientation = dq.multiply(&self.orientation.normalized())?.normalized();
        let center = self.center + delta.fixed_rows::<3>(3).into_owned();
        Ok(Self::new(orientation, center))
    }

    pub fn is_finite(&self) -> bool {
        self.orientation.is_finite() && self.center.iter().all(|v| v.is_finite())
    }
}
