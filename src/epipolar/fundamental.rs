//! Normalized 8-point fundamental matrix estimation and epipolar residuals.
//!
//! The convention is `p'ᵀ F p = 0` for a correspondence `p → p'`: `F p` is the
//! epipolar line of `p` in the destination view and `Fᵀ p'` the epipolar line
//! of `p'` in the source view.

use super::dlt::{NormalizationTransform, squared_dlt_matrix};
use super::Correspondence;
use crate::error::{GeaError, GeaResult};
use nalgebra::{Matrix3, Point2, SymmetricEigen, Vector2, Vector3};

/// Minimum number of correspondences for the linear estimate.
pub const MIN_CORRESPONDENCES_FOR_FUNDAMENTAL: usize = 8;

/// Frobenius norms at or below this value are considered zero.
const MIN_FUNDAMENTAL_NORM: f64 = 1e-16;

/// Relative eigenvalue gap below which the null space is not one-dimensional.
const NULL_SPACE_GAP: f64 = 1e-12;

/// Line coefficient norms below this value mean the point is an epipole.
const MIN_LINE_NORM: f64 = 1e-15;

/// Estimate a rank-2 fundamental matrix with the normalized 8-point algorithm.
///
/// Both point sets are Hartley-normalized, the squared DLT matrix is
/// accumulated in closed form, and its eigenvector of smallest eigenvalue gives
/// the raw estimate. Rank 2 is enforced by zeroing the smallest singular value
/// before undoing the normalization: `F = T₂ᵀ F̂ T₁`.
///
/// # Errors
/// `DegenerateInput` when there are fewer than 8 correspondences, when the
/// points of a view coincide, when the homogeneous system has no unique
/// solution (e.g. collinear points), or when the result has zero norm.
pub fn compute_fundamental_matrix(correspondences: &[Correspondence]) -> GeaResult<Matrix3<f64>> {
    let n = correspondences.len();
    if n < MIN_CORRESPONDENCES_FOR_FUNDAMENTAL {
        return Err(GeaError::DegenerateInput(format!(
            "fundamental matrix needs at least {MIN_CORRESPONDENCES_FOR_FUNDAMENTAL} correspondences, got {n}"
        )));
    }

    let source_transform =
        NormalizationTransform::from_points(correspondences.iter().map(|c| &c.source))?;
    let destination_transform =
        NormalizationTransform::from_points(correspondences.iter().map(|c| &c.destination))?;
    let omega = squared_dlt_matrix(
        correspondences,
        &source_transform,
        &destination_transform,
        false,
    );
    if omega.iter().any(|v| !v.is_finite()) {
        return Err(GeaError::NumericDivergence(
            "non-finite squared DLT matrix".to_string(),
        ));
    }

    let eigen = SymmetricEigen::new(omega);
    let mut order: Vec<usize> = (0..9).collect();
    order.sort_by(|&a, &b| eigen.eigenvalues[a].total_cmp(&eigen.eigenvalues[b]));
    let largest = eigen.eigenvalues[order[8]];
    let second = eigen.eigenvalues[order[1]];
    if largest <= 0.0 || second <= NULL_SPACE_GAP * largest {
        return Err(GeaError::DegenerateInput(format!(
            "epipolar constraints have no unique solution (eigenvalue ratio {:e})",
            second / largest.max(f64::MIN_POSITIVE)
        )));
    }

    let f = eigen.eigenvectors.column(order[0]);
    let raw = Matrix3::new(f[0], f[1], f[2], f[3], f[4], f[5], f[6], f[7], f[8]);
    let rank2 = enforce_rank_two(&raw)?;

    let fundamental =
        destination_transform.matrix().transpose() * rank2 * source_transform.matrix();
    let norm = fundamental.norm();
    if !norm.is_finite() {
        return Err(GeaError::NumericDivergence(
            "non-finite fundamental matrix".to_string(),
        ));
    }
    if norm <= MIN_FUNDAMENTAL_NORM {
        return Err(GeaError::DegenerateInput(format!(
            "fundamental matrix norm {norm:e} is zero"
        )));
    }
    Ok(fundamental)
}

/// Zero the smallest singular value of `m`.
fn enforce_rank_two(m: &Matrix3<f64>) -> GeaResult<Matrix3<f64>> {
    let svd = m.svd(true, true);
    let u = svd.u.ok_or_else(|| {
        GeaError::LinearAlgebra("SVD did not produce U for the rank-2 projection".to_string())
    })?;
    let v_t = svd.v_t.ok_or_else(|| {
        GeaError::LinearAlgebra("SVD did not produce Vᵀ for the rank-2 projection".to_string())
    })?;
    let mut singular_values = svd.singular_values;
    let smallest = singular_values.imin();
    singular_values[smallest] = 0.0;
    Ok(u * Matrix3::from_diagonal(&singular_values) * v_t)
}

/// Algebraic residual `p'ᵀ F p`.
#[inline]
pub fn epipolar_residual(fundamental: &Matrix3<f64>, correspondence: &Correspondence) -> f64 {
    correspondence
        .destination
        .to_homogeneous()
        .dot(&(fundamental * correspondence.source.to_homogeneous()))
}

/// Sum of the distances from each point to the epipolar line of its match.
///
/// # Formula
/// d = |r| / ‖(F p)₀,₁‖ + |r| / ‖(Fᵀ p')₀,₁‖, with r = p'ᵀ F p
pub fn symmetric_epipolar_distance(
    fundamental: &Matrix3<f64>,
    correspondence: &Correspondence,
) -> GeaResult<f64> {
    let p = correspondence.source.to_homogeneous();
    let q = correspondence.destination.to_homogeneous();
    let line_in_destination = fundamental * p;
    let line_in_source = fundamental.transpose() * q;
    let residual = q.dot(&line_in_destination).abs();

    let norm_destination = line_in_destination.xy().norm();
    let norm_source = line_in_source.xy().norm();
    if norm_destination < MIN_LINE_NORM || norm_source < MIN_LINE_NORM {
        return Err(GeaError::DegenerateInput(
            "correspondence lies on an epipole".to_string(),
        ));
    }
    let distance = residual / norm_destination + residual / norm_source;
    if !distance.is_finite() {
        return Err(GeaError::NumericDivergence(
            "non-finite epipolar distance".to_string(),
        ));
    }
    Ok(distance)
}

/// Same quantity as [`symmetric_epipolar_distance`], computed by constructing
/// each epipolar line and measuring the distance to the foot of the
/// perpendicular from the point.
pub fn symmetric_epipolar_distance_direct(
    fundamental: &Matrix3<f64>,
    correspondence: &Correspondence,
) -> GeaResult<f64> {
    let line_in_destination = fundamental * correspondence.source.to_homogeneous();
    let line_in_source = fundamental.transpose() * correspondence.destination.to_homogeneous();
    Ok(point_line_distance(&line_in_destination, &correspondence.destination)?
        + point_line_distance(&line_in_source, &correspondence.source)?)
}

fn point_line_distance(line: &Vector3<f64>, point: &Point2<f64>) -> GeaResult<f64> {
    let normal = line.xy();
    let norm_sq = normal.norm_squared();
    if norm_sq < MIN_LINE_NORM * MIN_LINE_NORM {
        return Err(GeaError::DegenerateInput(
            "epipolar line is undefined".to_string(),
        ));
    }
    let anchor = Point2::from(normal * (-line.z / norm_sq));
    let direction = Vector2::new(-normal.y, normal.x) / norm_sq.sqrt();
    let foot = anchor + direction * (point - anchor).dot(&direction);
    Ok((point - foot).norm())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{CameraPose, Quaternion, skew_symmetric};
    use nalgebra::{Point3, Vector2, Vector3};

    const TOLERANCE: f64 = 1e-9;

    fn two_view_scene(num_points: usize) -> (Matrix3<f64>, Vec<Correspondence>) {
        let first = CameraPose::identity();
        let second = CameraPose::new(
            Quaternion::from_axis_angle(&Vector3::new(0.1, 1.0, 0.05), 0.15).unwrap(),
            Point3::new(1.0, 0.2, -0.1),
        );
        let mut corrs = Vec::new();
        for i in 0..num_points {
            let t = i as f64;
            let x = Point3::new(
                (1.3 * t).sin() * 1.5,
                (0.7 * t + 0.4).cos() * 1.2,
                5.0 + (2.1 * t).sin(),
            );
            corrs.push(Correspondence::new(
                first.project(&x).unwrap(),
                second.project(&x).unwrap(),
            ));
        }
        let r = second.rotation_matrix();
        let essential = r * skew_symmetric(&(second.center - first.center));
        (essential, corrs)
    }

    #[test]
    fn test_noise_free_estimate_satisfies_constraints() {
        for n in [8, 12, 40] {
            let (_, corrs) = two_view_scene(n);
            let f = compute_fundamental_matrix(&corrs).unwrap();
            let singular_values = f.singular_values();
            assert!(singular_values.min() / singular_values.max() < 1e-10);
            for c in &corrs {
                let d = symmetric_epipolar_distance(&f, c).unwrap();
                assert!(d < 1e-8, "distance {d} for n = {n}");
            }
        }
    }

    #[test]
    fn test_estimate_is_proportional_to_essential_matrix() {
        let (essential, corrs) = two_view_scene(20);
        let f = compute_fundamental_matrix(&corrs).unwrap();
        let f = f / f.norm();
        let e = essential / essential.norm();
        assert!((f - e).norm() < 1e-6 || (f + e).norm() < 1e-6);
    }

    #[test]
    fn test_too_few_correspondences() {
        let (_, corrs) = two_view_scene(7);
        assert!(matches!(
            compute_fundamental_matrix(&corrs),
            Err(GeaError::DegenerateInput(_))
        ));
    }

    #[test]
    fn test_collinear_points_fail() {
        let first = CameraPose::identity();
        let second = CameraPose::new(Quaternion::identity(), Point3::new(1.0, 0.0, 0.0));
        let corrs: Vec<_> = (0..8)
            .map(|i| {
                let t = i as f64;
                let x = Point3::new(-1.0 + 0.3 * t, 0.5 - 0.1 * t, 4.0 + 0.2 * t);
                Correspondence::new(first.project(&x).unwrap(), second.project(&x).unwrap())
            })
            .collect();
        assert!(matches!(
            compute_fundamental_matrix(&corrs),
            Err(GeaError::DegenerateInput(_))
        ));
    }

    #[test]
    fn test_closed_form_distance_matches_line_construction() {
        let (essential, corrs) = two_view_scene(10);
        for (i, c) in corrs.iter().enumerate() {
            let shifted = Correspondence::new(
                c.source,
                c.destination + Vector2::new(0.01 * i as f64, -0.02),
            );
            let closed = symmetric_epipolar_distance(&essential, &shifted).unwrap();
            let direct = symmetric_epipolar_distance_direct(&essential, &shifted).unwrap();
            assert!((closed - direct).abs() < TOLERANCE, "{closed} vs {direct}");
        }
    }

    #[test]
    fn test_residual_sign_convention() {
        let (essential, corrs) = two_view_scene(5);
        for c in &corrs {
            assert!(epipolar_residual(&essential, c).abs() < 1e-12);
        }
    }
}
