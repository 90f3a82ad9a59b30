//! Sparse linear algebra for the pose-graph normal equations.
//!
//! This module provides:
//! - [`SparseBlockMatrix`]: arena-style block-sparse matrix with transpose,
//!   block products, matrix-vector products and compressed-row export
//! - [`SparseLinearSolver`]: strategy interface for solving the damped normal
//!   equations, with sparse Cholesky (faer), dense Cholesky (nalgebra) and
//!   preconditioned conjugate gradient implementations
//! - [`SolverContext`]: caller-owned holder of the chosen solver strategy

use thiserror::Error;

pub mod block_matrix;
pub mod solver;

pub use block_matrix::{CompressedRows, SparseBlockMatrix};
pub use solver::{
    ConjugateGradientSolver, DenseCholeskySolver, LinearSolverType, SolverContext,
    SolverStatistics, SparseCholeskySolver, SparseLinearSolver,
};

/// Result type for linear algebra operations
pub type LinAlgResult<T> = Result<T, LinAlgError>;

/// Errors raised by the linear algebra layer
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LinAlgError {
    /// Out-of-range block index or malformed argument
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operand shapes do not match
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// Operation intentionally not provided
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Matrix is singular or not positive definite
    #[error("Singular matrix: {0}")]
    SingularMatrix(String),

    /// Numerical factorization failed
    #[error("Factorization failed: {0}")]
    FactorizationFailed(String),

    /// Sparse matrix assembly failed
    #[error("Sparse matrix creation failed: {0}")]
    SparseMatrixCreation(String),

    /// NaN or Inf produced
    #[error("Non-finite value: {0}")]
    NonFinite(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linalg_error_display() {
        let err = LinAlgError::Unsupported("transposed right operand".into());
        assert_eq!(
            err.to_string(),
            "Unsupported operation: transposed right operand"
        );
    }
}
