//! Geometry primitives consumed by the epipolar optimizer.
//!
//! - [`Quaternion`]: rotation up to scale with an explicit non-zero-norm contract
//! - [`CameraPose`]: orientation plus optical center, projection and composition

use nalgebra::{Matrix3, Vector3};

pub mod camera_pose;
pub mod quaternion;

pub use camera_pose::CameraPose;
pub use quaternion::Quaternion;

/// Index of a camera in the caller-owned pose array.
pub type ViewIndex = usize;

/// Cross-product matrix `[v]×`, such that `[v]× w = v × w`.
#[inline]
pub fn skew_symmetric(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skew_symmetric_cross_product() {
        let a = Vector3::new(0.5, -1.0, 2.0);
        let b = Vector3::new(3.0, 0.25, -0.75);
        assert!((skew_symmetric(&a) * b - a.cross(&b)).norm() < 1e-14);
        assert!((skew_symmetric(&a) + skew_symmetric(&a).transpose()).norm() < 1e-14);
    }
}
