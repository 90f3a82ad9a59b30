//! Two-view epipolar geometry.
//!
//! This module provides:
//! - The closed-form "squared DLT" accumulation shared by fundamental matrix
//!   estimation and reduced-matrix construction ([`dlt`])
//! - Normalized 8-point fundamental matrix estimation and the symmetric
//!   epipolar distance ([`fundamental`])
//! - Iterative inlier refinement of a fundamental matrix fit ([`refinement`])

use nalgebra::Point2;

pub mod dlt;
pub mod fundamental;
pub mod refinement;

pub use dlt::{Matrix9, NormalizationTransform, SquaredDltAccumulator, Vector9, squared_dlt_matrix};
pub use fundamental::{
    MIN_CORRESPONDENCES_FOR_FUNDAMENTAL, compute_fundamental_matrix, epipolar_residual,
    symmetric_epipolar_distance, symmetric_epipolar_distance_direct,
};
pub use refinement::{LocalOptimization, iterative_local_optimization};

/// A pair of matching image points: `source` in the lower-indexed view and
/// `destination` in the higher-indexed one.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Correspondence {
    pub source: Point2<f64>,
    pub destination: Point2<f64>,
}

impl Correspondence {
    pub fn new(source: Point2<f64>, destination: Point2<f64>) -> Self {
        Self {
            source,
            destination,
        }
    }

    /// Same match seen from the other view.
    pub fn swapped(&self) -> Self {
        Self::new(self.destination, self.source)
    }
}
