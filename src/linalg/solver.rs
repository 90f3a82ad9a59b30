//! Solver strategies for the damped normal equations.
//!
//! The optimizer never picks a backend itself: the caller builds a
//! [`SolverContext`] once, from a [`LinearSolverType`] or from any boxed
//! [`SparseLinearSolver`], and passes it into every optimization call.

use super::block_matrix::{CompressedRows, SparseBlockMatrix};
use super::{LinAlgError, LinAlgResult};
use faer::linalg::solvers::Solve;
use faer::sparse::linalg::solvers::{Llt, SymbolicLlt};
use faer::sparse::{SparseColMat, Triplet};
use faer::{Mat, Side};
use nalgebra::DVector;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::debug;

/// Common interface for symmetric positive definite system solvers.
pub trait SparseLinearSolver {
    /// Short name for logs and summaries.
    fn name(&self) -> &'static str;

    /// Solve `system · x = rhs`.
    fn solve(&mut self, system: &SparseBlockMatrix, rhs: &DVector<f64>)
    -> LinAlgResult<DVector<f64>>;
}

/// Built-in solver backends.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinearSolverType {
    /// Sparse LLᵀ on the upper triangle (faer)
    #[default]
    SparseCholesky,
    /// Dense LLᵀ (nalgebra), for small systems
    DenseCholesky,
    /// Jacobi-preconditioned conjugate gradient with an inner iteration cap
    ConjugateGradient,
}

impl fmt::Display for LinearSolverType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinearSolverType::SparseCholesky => write!(f, "Sparse Cholesky"),
            LinearSolverType::DenseCholesky => write!(f, "Dense Cholesky"),
            LinearSolverType::ConjugateGradient => write!(f, "Conjugate Gradient"),
        }
    }
}

impl LinearSolverType {
    /// Instantiate the backend. `max_inner_iterations` only affects iterative solvers.
    pub fn create(&self, max_inner_iterations: usize) -> Box<dyn SparseLinearSolver> {
        match self {
            LinearSolverType::SparseCholesky => Box::new(SparseCholeskySolver::new()),
            LinearSolverType::DenseCholesky => Box::new(DenseCholeskySolver),
            LinearSolverType::ConjugateGradient => {
                Box::new(ConjugateGradientSolver::new(max_inner_iterations))
            }
        }
    }
}

fn check_system(system: &SparseBlockMatrix, rhs: &DVector<f64>) -> LinAlgResult<()> {
    if !system.is_square() || system.nrows() != rhs.len() {
        return Err(LinAlgError::DimensionMismatch(format!(
            "{}×{} system with right-hand side of length {}",
            system.nrows(),
            system.ncols(),
            rhs.len()
        )));
    }
    if !system.is_finite() || rhs.iter().any(|v| !v.is_finite()) {
        return Err(LinAlgError::NonFinite(
            "linear system contains NaN or Inf".to_string(),
        ));
    }
    Ok(())
}

fn check_solution(x: DVector<f64>) -> LinAlgResult<DVector<f64>> {
    if x.iter().any(|v| !v.is_finite()) {
        return Err(LinAlgError::NonFinite(
            "solver produced NaN or Inf".to_string(),
        ));
    }
    Ok(x)
}

/// Sparse Cholesky through faer. The symbolic factorization is cached and
/// reused while the sparsity pattern stays the same, which is the case across
/// the iterations of one optimization call.
#[derive(Debug, Default)]
pub struct SparseCholeskySolver {
    symbolic: Option<(Vec<usize>, Vec<usize>, SymbolicLlt<usize>)>,
}

impl SparseCholeskySolver {
    pub fn new() -> Self {
        Self { symbolic: None }
    }

    /// Lower-triangular CSC matrix from the upper-triangular CSR export.
    fn lower_triangle(upper: &CompressedRows) -> LinAlgResult<SparseColMat<usize, f64>> {
        let mut triplets = Vec::with_capacity(upper.nnz());
        for row in 0..upper.nrows {
            for k in upper.row_offsets[row]..upper.row_offsets[row + 1] {
                triplets.push(Triplet::new(upper.col_indices[k], row, upper.values[k]));
            }
        }
        SparseColMat::try_new_from_triplets(upper.nrows, upper.ncols, &triplets)
            .map_err(|e| LinAlgError::SparseMatrixCreation(format!("{e:?}")))
    }
}

impl SparseLinearSolver for SparseCholeskySolver {
    fn name(&self) -> &'static str {
        "sparse-cholesky"
    }

    fn solve(
        &mut self,
        system: &SparseBlockMatrix,
        rhs: &DVector<f64>,
    ) -> LinAlgResult<DVector<f64>> {
        check_system(system, rhs)?;
        let upper = system.to_compressed_rows(true)?;
        let lower = Self::lower_triangle(&upper)?;

        let reuse = matches!(
            &self.symbolic,
            Some((offsets, cols, _)) if *offsets == upper.row_offsets && *cols == upper.col_indices
        );
        if !reuse {
            let symbolic = SymbolicLlt::try_new(lower.symbolic(), Side::Lower)
                .map_err(|e| LinAlgError::FactorizationFailed(format!("{e:?}")))?;
            self.symbolic = Some((upper.row_offsets, upper.col_indices, symbolic));
        }
        let symbolic = match &self.symbolic {
            Some((_, _, symbolic)) => symbolic.clone(),
            None => {
                return Err(LinAlgError::FactorizationFailed(
                    "symbolic factorization unavailable".to_string(),
                ));
            }
        };

        let cholesky = Llt::try_new_with_symbolic(symbolic, lower.as_ref(), Side::Lower)
            .map_err(|e| LinAlgError::SingularMatrix(format!("{e:?}")))?;
        let b = Mat::from_fn(rhs.len(), 1, |i, _| rhs[i]);
        let x = cholesky.solve(b);
        check_solution(DVector::from_fn(rhs.len(), |i, _| x[(i, 0)]))
    }
}

/// Dense Cholesky through nalgebra.
#[derive(Debug, Default, Clone, Copy)]
pub struct DenseCholeskySolver;

impl SparseLinearSolver for DenseCholeskySolver {
    fn name(&self) -> &'static str {
        "dense-cholesky"
    }

    fn solve(
        &mut self,
        system: &SparseBlockMatrix,
        rhs: &DVector<f64>,
    ) -> LinAlgResult<DVector<f64>> {
        check_system(system, rhs)?;
        let cholesky = system.to_dense().cholesky().ok_or_else(|| {
            LinAlgError::SingularMatrix("matrix is not positive definite".to_string())
        })?;
        check_solution(cholesky.solve(rhs))
    }
}

/// Preconditioned conjugate gradient using the block matrix-vector product
/// and a Jacobi (diagonal) preconditioner.
///
/// Stops after `max_iterations` inner iterations even if the relative
/// residual has not reached `tolerance`; the approximate solution is returned.
#[derive(Debug, Clone)]
pub struct ConjugateGradientSolver {
    max_iterations: usize,
    tolerance: f64,
    last_iterations: usize,
    last_relative_residual: f64,
}

impl Default for ConjugateGradientSolver {
    fn default() -> Self {
        Self::new(10)
    }
}

impl ConjugateGradientSolver {
    pub fn new(max_iterations: usize) -> Self {
        Self {
            max_iterations: max_iterations.max(1),
            tolerance: 1e-10,
            last_iterations: 0,
            last_relative_residual: 0.0,
        }
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Inner iterations used by the last solve.
    pub fn last_iterations(&self) -> usize {
        self.last_iterations
    }

    /// `‖b - A x‖ / ‖b‖` after the last solve.
    pub fn last_relative_residual(&self) -> f64 {
        self.last_relative_residual
    }
}

impl SparseLinearSolver for ConjugateGradientSolver {
    fn name(&self) -> &'static str {
        "conjugate-gradient"
    }

    fn solve(
        &mut self,
        system: &SparseBlockMatrix,
        rhs: &DVector<f64>,
    ) -> LinAlgResult<DVector<f64>> {
        check_system(system, rhs)?;
        let n = rhs.len();

        let precond = system
            .diagonal()?
            .map(|d| if d.abs() > 1e-12 { 1.0 / d } else { 1.0 });

        let mut x = DVector::zeros(n);
        let mut r = rhs.clone();
        let mut z = r.component_mul(&precond);
        let mut p = z.clone();
        let mut rz_old = r.dot(&z);

        let b_norm = rhs.norm();
        if b_norm == 0.0 {
            self.last_iterations = 0;
            self.last_relative_residual = 0.0;
            return Ok(x);
        }
        let abs_tol = self.tolerance * b_norm;

        let mut iterations = 0;
        while iterations < self.max_iterations {
            let ap = system.dot_vector(&p, false)?;
            let p_ap = p.dot(&ap);
            if p_ap <= 0.0 {
                if iterations == 0 {
                    return Err(LinAlgError::SingularMatrix(format!(
                        "search direction curvature {p_ap:e} is not positive"
                    )));
                }
                break;
            }

            let alpha = rz_old / p_ap;
            x.axpy(alpha, &p, 1.0);
            r.axpy(-alpha, &ap, 1.0);
            iterations += 1;

            if r.norm() < abs_tol {
                break;
            }

            z = r.component_mul(&precond);
            let rz_new = r.dot(&z);
            let beta = rz_new / rz_old;
            p = &z + &p * beta;
            rz_old = rz_new;
        }

        self.last_iterations = iterations;
        self.last_relative_residual = r.norm() / b_norm;
        debug!(
            "conjugate gradient: {iterations} iterations, relative residual {:.3e}",
            self.last_relative_residual
        );
        check_solution(x)
    }
}

/// Cumulative solver statistics of a [`SolverContext`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SolverStatistics {
    pub solves: usize,
    pub failures: usize,
    pub total_time: Duration,
}

/// Caller-owned solver state, created once and passed into every
/// optimization call.
pub struct SolverContext {
    solver: Box<dyn SparseLinearSolver>,
    statistics: SolverStatistics,
}

impl fmt::Debug for SolverContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SolverContext")
            .field("solver", &self.solver.name())
            .field("statistics", &self.statistics)
            .finish()
    }
}

impl Default for SolverContext {
    fn default() -> Self {
        Self::new(LinearSolverType::default(), 10)
    }
}

impl SolverContext {
    /// Context using a built-in backend.
    pub fn new(solver_type: LinearSolverType, max_inner_iterations: usize) -> Self {
        Self::with_solver(solver_type.create(max_inner_iterations))
    }

    /// Context using a caller-provided backend.
    pub fn with_solver(solver: Box<dyn SparseLinearSolver>) -> Self {
        Self {
            solver,
            statistics: SolverStatistics::default(),
        }
    }

    pub fn solver_name(&self) -> &'static str {
        self.solver.name()
    }

    pub fn statistics(&self) -> &SolverStatistics {
        &self.statistics
    }

    pub fn solve(
        &mut self,
        system: &SparseBlockMatrix,
        rhs: &DVector<f64>,
    ) -> LinAlgResult<DVector<f64>> {
        let start = Instant::now();
        let result = self.solver.solve(system, rhs).and_then(check_solution);
        self.statistics.solves += 1;
        self.statistics.total_time += start.elapsed();
        if result.is_err() {
            self.statistics.failures += 1;
        }
        result
    }
}
