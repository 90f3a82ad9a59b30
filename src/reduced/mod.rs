//! Reduced matrices: per-edge 9×9 summaries of all correspondences.
//!
//! For an edge with correspondences `{(pᵢ, p'ᵢ)}` and a candidate essential
//! matrix `E` (row-major vector `e`), the epipolar cost is
//!
//! ```text
//! Σᵢ (p'ᵢᵀ E pᵢ)² = eᵀ A e,   A = Σᵢ aᵢ aᵢᵀ
//! ```
//!
//! with `aᵢ` the DLT row of the correspondence. `A` is accumulated in closed
//! form, after which the correspondences are no longer needed. A reduced
//! matrix is stored either as `A` itself or as a factor `F` with `F Fᵀ = A`,
//! in which case the cost is evaluated as `‖Fᵀ e‖²`.

use crate::epipolar::{Correspondence, Matrix9, NormalizationTransform, Vector9, squared_dlt_matrix};
use crate::error::{GeaError, GeaResult};
use crate::graph::{CorrespondenceGraph, ViewPair};
use nalgebra::{SMatrix, SVector, SymmetricEigen};
use std::fmt;
use tracing::{debug, warn};

/// Fewest correspondences for a well-posed 9-parameter summary.
pub const MIN_REDUCED_CORRESPONDENCES: usize = 9;

/// Jacobian of `e` with respect to the 12 tangent parameters of both endpoints.
pub type EdgeJacobian = SMatrix<f64, 9, 12>;

/// How a [`ReducedMatrix`] stores its 9×9 matrix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReducedForm {
    /// The squared DLT matrix `A`
    Gram,
    /// A factor `F` with `F Fᵀ = A`
    Factor,
}

/// Normal-equation contribution of one edge.
#[derive(Clone, Debug)]
pub struct EdgeNormalEquations {
    /// `Jᵀ A J`
    pub hessian: SMatrix<f64, 12, 12>,
    /// `Jᵀ A e`
    pub gradient: SVector<f64, 12>,
    /// `eᵀ A e`
    pub cost: f64,
}

/// Immutable 9×9 summary of one edge.
#[derive(Clone, Debug, PartialEq)]
pub struct ReducedMatrix {
    matrix: Matrix9,
    form: ReducedForm,
    num_correspondences: usize,
}

impl ReducedMatrix {
    pub fn new(matrix: Matrix9, form: ReducedForm, num_correspondences: usize) -> Self {
        Self {
            matrix,
            form,
            num_correspondences,
        }
    }

    pub fn matrix(&self) -> &Matrix9 {
        &self.matrix
    }

    pub fn form(&self) -> ReducedForm {
        self.form
    }

    pub fn num_correspondences(&self) -> usize {
        self.num_correspondences
    }

    /// The summarized matrix `A` (reconstructed as `F Fᵀ` for factors).
    pub fn gram(&self) -> Matrix9 {
        match self.form {
            ReducedForm::Gram => self.matrix,
            ReducedForm::Factor => self.matrix * self.matrix.transpose(),
        }
    }

    /// Epipolar cost `eᵀ A e` of a vectorized essential matrix.
    pub fn cost(&self, e: &Vector9) -> f64 {
        match self.form {
            ReducedForm::Gram => e.dot(&(self.matrix * e)),
            ReducedForm::Factor => (self.matrix.transpose() * e).norm_squared(),
        }
    }

    /// Gauss-Newton contribution for residual vector `e` with Jacobian `jacobian`.
    pub fn normal_equations(&self, e: &Vector9, jacobian: &EdgeJacobian) -> EdgeNormalEquations {
        match self.form {
            ReducedForm::Gram => {
                let weighted = self.matrix * jacobian;
                EdgeNormalEquations {
                    hessian: jacobian.transpose() * weighted,
                    gradient: weighted.transpose() * e,
                    cost: e.dot(&(self.matrix * e)),
                }
            }
            ReducedForm::Factor => {
                let factor_t = self.matrix.transpose();
                let whitened = factor_t * jacobian;
                let residual = factor_t * e;
                EdgeNormalEquations {
                    hessian: whitened.transpose() * whitened,
                    gradient: whitened.transpose() * residual,
                    cost: residual.norm_squared(),
                }
            }
        }
    }
}

/// Strategy turning a squared DLT matrix into a [`ReducedMatrix`].
pub trait ReducedMatrixDecomposition: fmt::Debug {
    fn name(&self) -> &'static str;

    /// Decompose `gram`; `regularization` is added to the diagonal before
    /// factoring.
    fn decompose(
        &self,
        gram: &Matrix9,
        regularization: f64,
        num_correspondences: usize,
    ) -> GeaResult<ReducedMatrix>;
}

/// Keep `A` as is.
#[derive(Debug, Clone, Copy, Default)]
pub struct GramDecomposition;

impl ReducedMatrixDecomposition for GramDecomposition {
    fn name(&self) -> &'static str {
        "none"
    }

    fn decompose(
        &self,
        gram: &Matrix9,
        _regularization: f64,
        num_correspondences: usize,
    ) -> GeaResult<ReducedMatrix> {
        Ok(ReducedMatrix::new(
            *gram,
            ReducedForm::Gram,
            num_correspondences,
        ))
    }
}

/// Lower Cholesky factor `L` of `A + λI`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CholeskyDecomposition;

impl ReducedMatrixDecomposition for CholeskyDecomposition {
    fn name(&self) -> &'static str {
        "cholesky"
    }

    fn decompose(
        &self,
        gram: &Matrix9,
        regularization: f64,
        num_correspondences: usize,
    ) -> GeaResult<ReducedMatrix> {
        let regularized = gram + Matrix9::identity() * regularization;
        let cholesky = regularized.cholesky().ok_or_else(|| {
            GeaError::DegenerateInput(format!(
                "reduced matrix is not positive definite (λ = {regularization:e})"
            ))
        })?;
        Ok(ReducedMatrix::new(
            cholesky.l(),
            ReducedForm::Factor,
            num_correspondences,
        ))
    }
}

/// Symmetric square root `Q √|Λ| Qᵀ` of `A + λI`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EigenDecomposition;

impl ReducedMatrixDecomposition for EigenDecomposition {
    fn name(&self) -> &'static str {
        "eigen"
    }

    fn decompose(
        &self,
        gram: &Matrix9,
        regularization: f64,
        num_correspondences: usize,
    ) -> GeaResult<ReducedMatrix> {
        let regularized = gram + Matrix9::identity() * regularization;
        let eigen = SymmetricEigen::new(regularized);
        let sqrt_values = eigen.eigenvalues.map(|v| v.abs().sqrt());
        let root = eigen.eigenvectors
            * Matrix9::from_diagonal(&sqrt_values)
            * eigen.eigenvectors.transpose();
        Ok(ReducedMatrix::new(
            root,
            ReducedForm::Factor,
            num_correspondences,
        ))
    }
}

/// Built-in decomposition strategies.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecompositionMethod {
    /// Keep the squared DLT matrix
    None,
    /// Cholesky factor
    #[default]
    Cholesky,
    /// Eigen-based symmetric square root
    Eigen,
}

impl fmt::Display for DecompositionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecompositionMethod::None => write!(f, "None"),
            DecompositionMethod::Cholesky => write!(f, "Cholesky"),
            DecompositionMethod::Eigen => write!(f, "Eigen"),
        }
    }
}

impl DecompositionMethod {
    pub fn strategy(&self) -> Box<dyn ReducedMatrixDecomposition> {
        match self {
            DecompositionMethod::None => Box::new(GramDecomposition),
            DecompositionMethod::Cholesky => Box::new(CholeskyDecomposition),
            DecompositionMethod::Eigen => Box::new(EigenDecomposition),
        }
    }
}

/// Numeric controls of the reduced-matrix builder.
#[derive(Clone, Debug, PartialEq)]
pub struct ReducedMatrixConfig {
    pub decomposition: DecompositionMethod,
    /// λ added to the diagonal before factoring. Since `‖vec(E)‖² = 2` for
    /// every pose pair, factored edges report their cost offset by `2λ`; the
    /// gradient and the minimizer are unchanged.
    pub regularization: f64,
    /// Edges with fewer correspondences are dropped; never below 9
    pub min_correspondences: usize,
    /// Weight each DLT row by the inverse norms of its homogeneous points
    pub normalize_rows: bool,
}

impl Default for ReducedMatrixConfig {
    fn default() -> Self {
        Self {
            decomposition: DecompositionMethod::default(),
            regularization: 1e-6,
            min_correspondences: MIN_REDUCED_CORRESPONDENCES,
            normalize_rows: false,
        }
    }
}

impl ReducedMatrixConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_decomposition(mut self, decomposition: DecompositionMethod) -> Self {
        self.decomposition = decomposition;
        self
    }

    pub fn with_regularization(mut self, regularization: f64) -> Self {
        self.regularization = regularization;
        self
    }

    pub fn with_min_correspondences(mut self, min_correspondences: usize) -> Self {
        self.min_correspondences = min_correspondences;
        self
    }

    pub fn with_row_normalization(mut self, normalize_rows: bool) -> Self {
        self.normalize_rows = normalize_rows;
        self
    }
}

/// A retained edge of the pose graph.
#[derive(Clone, Debug, PartialEq)]
pub struct ReducedEdge {
    pub pair: ViewPair,
    pub matrix: ReducedMatrix,
}

/// An edge that could not be summarized.
#[derive(Clone, Debug, PartialEq)]
pub struct DroppedEdge {
    pub pair: ViewPair,
    pub reason: GeaError,
}

/// Output of [`ReducedMatrixBuilder::build`].
#[derive(Clone, Debug, Default)]
pub struct ReducedGraph {
    /// Retained edges in canonical pair order
    pub edges: Vec<ReducedEdge>,
    pub dropped: Vec<DroppedEdge>,
}

impl ReducedGraph {
    pub fn num_correspondences(&self) -> usize {
        self.edges
            .iter()
            .map(|e| e.matrix.num_correspondences())
            .sum()
    }
}

/// Builds reduced matrices with a decomposition strategy fixed at construction.
#[derive(Debug)]
pub struct ReducedMatrixBuilder {
    decomposition: Box<dyn ReducedMatrixDecomposition>,
    regularization: f64,
    min_correspondences: usize,
    normalize_rows: bool,
}

impl Default for ReducedMatrixBuilder {
    fn default() -> Self {
        Self::new(&ReducedMatrixConfig::default())
    }
}

impl ReducedMatrixBuilder {
    pub fn new(config: &ReducedMatrixConfig) -> Self {
        Self {
            decomposition: config.decomposition.strategy(),
            regularization: config.regularization,
            min_correspondences: config.min_correspondences.max(MIN_REDUCED_CORRESPONDENCES),
            normalize_rows: config.normalize_rows,
        }
    }

    /// Replace the decomposition strategy with a custom one.
    pub fn with_decomposition(mut self, decomposition: Box<dyn ReducedMatrixDecomposition>) -> Self {
        self.decomposition = decomposition;
        self
    }

    pub fn decomposition_name(&self) -> &'static str {
        self.decomposition.name()
    }

    /// Summarize one edge's correspondences.
    pub fn build_edge(&self, correspondences: &[Correspondence]) -> GeaResult<ReducedMatrix> {
        let n = correspondences.len();
        if n < self.min_correspondences {
            return Err(GeaError::DegenerateInput(format!(
                "{n} correspondences, at least {} required",
                self.min_correspondences
            )));
        }
        let identity = NormalizationTransform::identity();
        let gram = squared_dlt_matrix(correspondences, &identity, &identity, self.normalize_rows);
        if gram.iter().any(|v| !v.is_finite()) {
            return Err(GeaError::NumericDivergence(
                "non-finite squared DLT matrix".to_string(),
            ));
        }
        let reduced = self
            .decomposition
            .decompose(&gram, self.regularization, n)?;
        if reduced.matrix().iter().any(|v| !v.is_finite()) {
            return Err(GeaError::NumericDivergence(format!(
                "{} decomposition produced NaN or Inf",
                self.decomposition.name()
            )));
        }
        Ok(reduced)
    }

    /// Summarize every edge of `graph`; failing edges are dropped with a warning.
    pub fn build(&self, graph: &CorrespondenceGraph) -> ReducedGraph {
        let mut result = ReducedGraph::default();
        for (pair, correspondences) in graph.iter() {
            match self.build_edge(correspondences) {
                Ok(matrix) => result.edges.push(ReducedEdge {
                    pair: *pair,
                    matrix,
                }),
                Err(reason) => {
                    warn!(
                        "dropping edge ({}, {}): {reason}",
                        pair.source(),
                        pair.destination()
                    );
                    result.dropped.push(DroppedEdge {
                        pair: *pair,
                        reason,
                    });
                }
            }
        }
        debug!(
            "built {} reduced matrices ({} decomposition), dropped {}",
            result.edges.len(),
            self.decomposition.name(),
            result.dropped.len()
        );
        result
    }
}
