//! Essential matrix of a camera pair and its derivatives.
//!
//! For poses `(R₁, c₁)` and `(R₂, c₂)` with `x = R (X - c)`, the calibrated
//! epipolar constraint is `x₂ᵀ E x₁ = 0` with
//!
//! ```text
//! E = R₂ [t̂]× R₁ᵀ,   t̂ = (c₂ - c₁) / ‖c₂ - c₁‖
//! ```
//!
//! Normalizing the baseline makes the cost independent of the global scale.
//! The tangent parameters of a camera are `[δθ; δc]` applied as
//! `R ← exp([δθ]×) R`, `c ← c + δc` (see [`CameraPose::retract`]), giving
//!
//! ```text
//! ∂E/∂θ₁ₖ = -E [eₖ]×
//! ∂E/∂θ₂ₖ = [eₖ]× E
//! ∂E/∂c₂ₖ = R₂ [(I - t̂ t̂ᵀ) eₖ / ‖t‖]× R₁ᵀ = -∂E/∂c₁ₖ
//! ```

use crate::epipolar::Vector9;
use crate::error::{GeaError, GeaResult};
use crate::geometry::{CameraPose, skew_symmetric};
use crate::reduced::EdgeJacobian;
use nalgebra::{Matrix3, Vector3};

/// Baselines shorter than this leave the epipolar geometry undefined.
pub const MIN_BASELINE: f64 = 1e-12;

/// Row-major vectorization `e[3 i + j] = E[(i, j)]`.
#[inline]
fn vectorize(m: &Matrix3<f64>) -> Vector9 {
    Vector9::from_column_slice(m.transpose().as_slice())
}

fn baseline(first: &CameraPose, second: &CameraPose) -> GeaResult<(Vector3<f64>, f64)> {
    let t = second.center - first.center;
    let length = t.norm();
    if !length.is_finite() {
        return Err(GeaError::NumericDivergence(
            "non-finite camera center".to_string(),
        ));
    }
    if length < MIN_BASELINE {
        return Err(GeaError::DegenerateInput(format!(
            "camera centers coincide (baseline {length:e})"
        )));
    }
    Ok((t, length))
}

/// Essential matrix `R₂ [t̂]× R₁ᵀ` of the pair.
pub fn essential_matrix(first: &CameraPose, second: &CameraPose) -> GeaResult<Matrix3<f64>> {
    let (t, length) = baseline(first, second)?;
    Ok(second.rotation_matrix() * skew_symmetric(&(t / length)) * first.rotation_matrix().transpose())
}

/// Row-major vectorized essential matrix.
pub fn essential_vector(first: &CameraPose, second: &CameraPose) -> GeaResult<Vector9> {
    Ok(vectorize(&essential_matrix(first, second)?))
}

/// Vectorized essential matrix and its 9×12 Jacobian with respect to
/// `[δθ₁, δc₁, δθ₂, δc₂]`.
pub fn linearize_edge(
    first: &CameraPose,
    second: &CameraPose,
) -> GeaResult<(Vector9, EdgeJacobian)> {
    let (t, length) = baseline(first, second)?;
    let direction = t / length;
    let r1_t = first.rotation_matrix().transpose();
    let r2 = second.rotation_matrix();
    let essential = r2 * skew_symmetric(&direction) * r1_t;
    let projector = (Matrix3::identity() - direction * direction.transpose()) / length;

    let mut jacobian = EdgeJacobian::zeros();
    for k in 0..3 {
        let axis = Vector3::ith(k, 1.0);
        let axis_skew = skew_symmetric(&axis);

        let d_theta1 = -(essential * axis_skew);
        let d_theta2 = axis_skew * essential;
        let d_c2 = r2 * skew_symmetric(&(projector * axis)) * r1_t;

        jacobian.set_column(k, &vectorize(&d_theta1));
        jacobian.set_column(3 + k, &vectorize(&(-d_c2)));
        jacobian.set_column(6 + k, &vectorize(&d_theta2));
        jacobian.set_column(9 + k, &vectorize(&d_c2));
    }
    Ok((vectorize(&essential), jacobian))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Quaternion;
    use nalgebra::{Point3, Vector6};

    fn poses() -> (CameraPose, CameraPose) {
        (
            CameraPose::new(
                Quaternion::from_axis_angle(&Vector3::new(0.2, 1.0, -0.1), 0.3).unwrap(),
                Point3::new(0.1, -0.2, 0.3),
            ),
            CameraPose::new(
                Quaternion::from_axis_angle(&Vector3::new(-0.5, 0.3, 1.0), -0.6).unwrap(),
                Point3::new(1.2, 0.4, -0.1),
            ),
        )
    }

    #[test]
    fn test_essential_satisfies_epipolar_constraint() {
        let (a, b) = poses();
        let e = essential_matrix(&a, &b).unwrap();
        let x = Point3::new(0.4, -0.7, 5.0);
        let x1 = a.project(&x).unwrap().to_homogeneous();
        let x2 = b.project(&x).unwrap().to_homogeneous();
        assert!(x2.dot(&(e * x1)).abs() < 1e-12);

        let v = essential_vector(&a, &b).unwrap();
        assert_eq!(v[1], e[(0, 1)]);
        assert_eq!(v[3], e[(1, 0)]);
    }

    #[test]
    fn test_scale_invariance() {
        let (a, b) = poses();
        let scaled = CameraPose::new(b.orientation, a.center + (b.center - a.center) * 3.0);
        let e1 = essential_vector(&a, &b).unwrap();
        let e2 = essential_vector(&a, &scaled).unwrap();
        assert!((e1 - e2).norm() < 1e-12);
    }

    #[test]
    fn test_jacobian_matches_finite_differences() {
        let (a, b) = poses();
        let (_, jacobian) = linearize_edge(&a, &b).unwrap();
        let h = 1e-6;
        for p in 0..12 {
            let mut delta = Vector6::zeros();
            delta[p % 6] = h;
            let (plus, minus) = if p < 6 {
                (
                    essential_vector(&a.retract(&delta).unwrap(), &b).unwrap(),
                    essential_vector(&a.retract(&-delta).unwrap(), &b).unwrap(),
                )
            } else {
                (
                    essential_vector(&a, &b.retract(&delta).unwrap()).unwrap(),
                    essential_vector(&a, &b.retract(&-delta).unwrap()).unwrap(),
                )
            };
            let numeric = (plus - minus) / (2.0 * h);
            let analytic = jacobian.column(p);
            assert!(
                (numeric - analytic).norm() < 1e-7,
                "parameter {p}: {} vs {}",
                numeric,
                analytic
            );
        }
    }

    #[test]
    fn test_coincident_centers_are_degenerate() {
        let (a, _) = poses();
        let b = CameraPose::new(Quaternion::identity(), a.center);
        assert!(matches!(
            linearize_edge(&a, &b),
            Err(GeaError::DegenerateInput(_))
        ));
    }
}
