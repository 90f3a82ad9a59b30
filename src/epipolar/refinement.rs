//! Iterative inlier refinement of a fundamental matrix fit.

use super::Correspondence;
use super::fundamental::{compute_fundamental_matrix, symmetric_epipolar_distance};
use crate::error::{GeaError, GeaResult};
use nalgebra::Matrix3;
use tracing::debug;

/// Outcome of [`iterative_local_optimization`].
#[derive(Clone, Debug)]
pub struct LocalOptimization {
    pub fundamental: Matrix3<f64>,
    /// Correspondences that survived every pruning round.
    pub inliers: Vec<Correspondence>,
    /// Number of refits performed.
    pub iterations: usize,
    /// Largest symmetric epipolar distance among the inliers.
    pub max_residual: f64,
}

/// Refit F until every remaining correspondence is within `max_error`.
///
/// Each round fits F to the current set and evaluates the symmetric epipolar
/// distance of every correspondence. The fit is accepted once the largest
/// distance is below `max_error`. If the largest distance is below twice the
/// median, outliers cannot be told apart from inliers and the refinement fails
/// with `ConvergenceFailure`. Otherwise every correspondence at or above
/// `max(2 × median, max_error)` is discarded and the loop repeats; falling
/// below `min_inliers` correspondences is also a `ConvergenceFailure`.
///
/// Every round removes at least the worst correspondence, so the loop ends.
pub fn iterative_local_optimization(
    correspondences: &[Correspondence],
    max_error: f64,
    min_inliers: usize,
) -> GeaResult<LocalOptimization> {
    if max_error.is_nan() || max_error <= 0.0 {
        return Err(GeaError::InvalidInput(format!(
            "max_error must be positive, got {max_error}"
        )));
    }
    if correspondences.len() < min_inliers {
        return Err(GeaError::ConvergenceFailure(format!(
            "{} correspondences, {min_inliers} inliers required",
            correspondences.len()
        )));
    }

    let mut current = correspondences.to_vec();
    let mut iterations = 0;
    loop {
        iterations += 1;
        let fundamental = compute_fundamental_matrix(&current)?;
        let residuals = current
            .iter()
            .map(|c| symmetric_epipolar_distance(&fundamental, c))
            .collect::<GeaResult<Vec<f64>>>()?;

        let max_residual = residuals.iter().copied().fold(0.0, f64::max);
        if max_residual < max_error {
            debug!(
                "local optimization converged after {iterations} rounds with {} inliers",
                current.len()
            );
            return Ok(LocalOptimization {
                fundamental,
                inliers: current,
                iterations,
                max_residual,
            });
        }

        let median = upper_median(&residuals);
        if max_residual < 2.0 * median {
            return Err(GeaError::ConvergenceFailure(format!(
                "max residual {max_residual:e} within twice the median {median:e}"
            )));
        }

        let threshold = (2.0 * median).max(max_error);
        let before = current.len();
        current = current
            .into_iter()
            .zip(residuals)
            .filter(|(_, r)| *r < threshold)
            .map(|(c, _)| c)
            .collect();
        debug!(
            "round {iterations}: threshold {threshold:e}, kept {}/{before}",
            current.len()
        );

        if current.len() < min_inliers {
            return Err(GeaError::ConvergenceFailure(format!(
                "only {} inliers left, {min_inliers} required",
                current.len()
            )));
        }
    }
}

/// Element at index `n / 2` of the sorted values.
fn upper_median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    sorted[sorted.len() / 2]
}
