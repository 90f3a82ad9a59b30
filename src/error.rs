//! Error types for the gea-solver library
//!
//! This module provides the main error and result types used throughout the library.
//! All errors use the `thiserror` crate for automatic trait implementations.
//!
//! Per-edge problems (too few correspondences, failed factorization) never surface
//! here: they are dropped with a warning by the component that detects them. The
//! optimizer reports divergence and exhausted budgets through its status value so
//! the caller still receives the last known-good poses.

use crate::linalg::LinAlgError;
use thiserror::Error;

/// Main result type used throughout the gea-solver library
pub type GeaResult<T> = Result<T, GeaError>;

/// Main error type for the gea-solver library
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeaError {
    /// Not enough data, or data without a unique solution
    #[error("Degenerate input: {0}")]
    DegenerateInput(String),

    /// NaN or Inf detected in pose, gradient or cost state
    #[error("Numeric divergence: {0}")]
    NumericDivergence(String),

    /// Inlier/outlier separation is impossible
    #[error("Convergence failure: {0}")]
    ConvergenceFailure(String),

    /// The linear solver reported singularity or non-convergence
    #[error("Solver failure: {0}")]
    SolverFailure(String),

    /// Invalid input parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Linear algebra related errors
    #[error("Linear algebra error: {0}")]
    LinearAlgebra(String),
}

impl From<LinAlgError> for GeaError {
    fn from(err: LinAlgError) -> Self {
        match err {
            LinAlgError::SingularMatrix(_)
            | LinAlgError::FactorizationFailed(_)
            | LinAlgError::SparseMatrixCreation(_) => GeaError::SolverFailure(err.to_string()),
            LinAlgError::NonFinite(_) => GeaError::NumericDivergence(err.to_string()),
            LinAlgError::InvalidInput(_) | LinAlgError::DimensionMismatch(_) => {
                GeaError::InvalidInput(err.to_string())
            }
            LinAlgError::Unsupported(_) => GeaError::LinearAlgebra(err.to_string()),
        }
    }
}
