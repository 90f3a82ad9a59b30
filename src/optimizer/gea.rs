//! Levenberg-Marquardt over camera poses with pairwise epipolar costs.
//!
//! Each retained edge contributes `‖Fᵀ e(pose_a, pose_b)‖²` (or `eᵀ A e`) to the
//! total cost, where `e` is the vectorized essential matrix of the pair. The
//! 6×6 block Hessian holds one block row per free camera; fixed and isolated
//! cameras never enter the system.

use std::time::Instant;

use nalgebra::{DVector, Vector6};
use tracing::{debug, info, warn};

use super::linearization::{essential_vector, linearize_edge};
use super::{GeaConfig, GeaSummary, IterationRecord, OptimizationStatus};
use crate::error::{GeaError, GeaResult};
use crate::geometry::{CameraPose, ViewIndex};
use crate::linalg::{LinAlgError, SolverContext, SparseBlockMatrix};
use crate::reduced::ReducedEdge;

/// Tangent dimension of one camera.
pub const POSE_DOF: usize = 6;

/// Lower bound on a diagonal entry used for Marquardt scaling.
const MIN_DAMPING_DIAGONAL: f64 = 1e-9;

/// Which cameras the optimizer may move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeCameras {
    flags: Vec<bool>,
}

impl FreeCameras {
    pub fn all(num_cameras: usize) -> Self {
        Self {
            flags: vec![true; num_cameras],
        }
    }

    /// The first `num_fixed` cameras are held constant.
    pub fn fix_first(num_cameras: usize, num_fixed: usize) -> Self {
        Self {
            flags: (0..num_cameras).map(|i| i >= num_fixed).collect(),
        }
    }

    /// Only the last `num_free` cameras move.
    pub fn last(num_cameras: usize, num_free: usize) -> Self {
        Self {
            flags: (0..num_cameras).map(|i| num_cameras - i <= num_free).collect(),
        }
    }

    pub fn from_flags(flags: Vec<bool>) -> Self {
        Self { flags }
    }

    pub fn is_free(&self, camera: ViewIndex) -> bool {
        self.flags.get(camera).copied().unwrap_or(false)
    }

    pub fn set_free(&mut self, camera: ViewIndex, free: bool) {
        if let Some(flag) = self.flags.get_mut(camera) {
            *flag = free;
        }
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    pub fn count(&self) -> usize {
        self.flags.iter().filter(|&&f| f).count()
    }
}

/// Gauss-Newton system of the free cameras at the current poses.
#[derive(Debug, Clone)]
pub struct NormalEquations {
    pub hessian: SparseBlockMatrix,
    pub gradient: DVector<f64>,
    /// Total cost over every edge, including edges between fixed cameras
    pub cost: f64,
    /// Edges whose endpoints have coincident centers
    pub skipped_edges: usize,
}

/// Every edge must reference a camera in `poses`.
fn check_edge_indices(poses: &[CameraPose], edges: &[ReducedEdge]) -> GeaResult<()> {
    match edges.iter().find(|e| e.pair.destination() >= poses.len()) {
        Some(edge) => Err(GeaError::InvalidInput(format!(
            "edge ({}, {}) references a camera beyond {}",
            edge.pair.source(),
            edge.pair.destination(),
            poses.len()
        ))),
        None => Ok(()),
    }
}

/// Accumulate `JᵀJ`, `Jᵀr` and the cost of every edge.
///
/// `blocks[camera]` is the block row of a free camera, `None` for cameras held
/// constant. The result does not depend on the order of `edges` beyond
/// floating-point rounding of the sums.
pub fn assemble_normal_equations(
    poses: &[CameraPose],
    edges: &[ReducedEdge],
    blocks: &[Option<usize>],
    num_blocks: usize,
) -> GeaResult<NormalEquations> {
    if blocks.len() != poses.len() {
        return Err(GeaError::InvalidInput(format!(
            "{} block entries for {} poses",
            blocks.len(),
            poses.len()
        )));
    }
    if let Some(block) = blocks.iter().flatten().find(|&&b| b >= num_blocks) {
        return Err(GeaError::InvalidInput(format!(
            "block {block} out of range for {num_blocks} blocks"
        )));
    }
    check_edge_indices(poses, edges)?;

    let mut hessian = SparseBlockMatrix::new(num_blocks, num_blocks, POSE_DOF, POSE_DOF);
    let mut gradient = DVector::<f64>::zeros(num_blocks * POSE_DOF);
    let mut cost = 0.0;
    let mut skipped_edges = 0;

    for edge in edges {
        let (a, b) = (edge.pair.source(), edge.pair.destination());
        let (block_a, block_b) = (blocks[a], blocks[b]);

        if block_a.is_none() && block_b.is_none() {
            match essential_vector(&poses[a], &poses[b]) {
                Ok(e) => cost += edge.matrix.cost(&e),
                Err(GeaError::DegenerateInput(reason)) => {
                    warn!("skipping edge ({a}, {b}): {reason}");
                    skipped_edges += 1;
                }
                Err(err) => return Err(err),
            }
            continue;
        }

        let (e, jacobian) = match linearize_edge(&poses[a], &poses[b]) {
            Ok(linearization) => linearization,
            Err(GeaError::DegenerateInput(reason)) => {
                warn!("skipping edge ({a}, {b}): {reason}");
                skipped_edges += 1;
                continue;
            }
            Err(err) => return Err(err),
        };
        let normal = edge.matrix.normal_equations(&e, &jacobian);
        cost += normal.cost;

        if let Some(i) = block_a {
            hessian.add_to_block(i, i, &normal.hessian.fixed_view::<6, 6>(0, 0))?;
            for k in 0..POSE_DOF {
                gradient[i * POSE_DOF + k] += normal.gradient[k];
            }
        }
        if let Some(j) = block_b {
            hessian.add_to_block(j, j, &normal.hessian.fixed_view::<6, 6>(6, 6))?;
            for k in 0..POSE_DOF {
                gradient[j * POSE_DOF + k] += normal.gradient[POSE_DOF + k];
            }
        }
        if let (Some(i), Some(j)) = (block_a, block_b) {
            let coupling = normal.hessian.fixed_view::<6, 6>(0, 6);
            hessian.add_to_block(i, j, &coupling)?;
            hessian.add_to_block(j, i, &coupling.transpose())?;
        }
    }

    if !cost.is_finite() {
        return Err(GeaError::NumericDivergence(format!("cost is {cost}")));
    }
    if !hessian.is_finite() || gradient.iter().any(|v| !v.is_finite()) {
        return Err(GeaError::NumericDivergence(
            "non-finite Hessian or gradient".to_string(),
        ));
    }
    Ok(NormalEquations {
        hessian,
        gradient,
        cost,
        skipped_edges,
    })
}

/// Total cost of `edges` at `poses`; degenerate edges contribute nothing.
pub fn total_cost(poses: &[CameraPose], edges: &[ReducedEdge]) -> GeaResult<f64> {
    check_edge_indices(poses, edges)?;
    let mut cost = 0.0;
    for edge in edges {
        match essential_vector(&poses[edge.pair.source()], &poses[edge.pair.destination()]) {
            Ok(e) => cost += edge.matrix.cost(&e),
            Err(GeaError::DegenerateInput(_)) => {}
            Err(err) => return Err(err),
        }
    }
    if cost.is_finite() {
        Ok(cost)
    } else {
        Err(GeaError::NumericDivergence(format!("cost is {cost}")))
    }
}

/// RMS epipolar error per correspondence.
fn rms(cost: f64, num_correspondences: usize) -> f64 {
    (cost.max(0.0) / num_correspondences.max(1) as f64).sqrt()
}

enum StepOutcome {
    Accepted { cost: f64, step_norm: f64 },
    Rejected { cost: Option<f64>, step_norm: f64 },
    Diverged(String),
}

/// Global Epipolar Adjustment.
///
/// ```no_run
/// use gea_solver::linalg::SolverContext;
/// use gea_solver::optimizer::{GeaConfig, GlobalEpipolarAdjustment};
/// # fn run(poses: &mut [gea_solver::geometry::CameraPose], edges: &[gea_solver::reduced::ReducedEdge]) -> gea_solver::GeaResult<()> {
/// let mut context = SolverContext::default();
/// let optimizer = GlobalEpipolarAdjustment::with_config(GeaConfig::new().with_max_iterations(50));
/// let summary = optimizer.optimize(poses, edges, &mut context)?;
/// println!("{summary}");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct GlobalEpipolarAdjustment {
    config: GeaConfig,
}

impl GlobalEpipolarAdjustment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: GeaConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GeaConfig {
        &self.config
    }

    /// Optimize every camera except camera 0, which fixes the gauge.
    pub fn optimize(
        &self,
        poses: &mut [CameraPose],
        edges: &[ReducedEdge],
        context: &mut SolverContext,
    ) -> GeaResult<GeaSummary> {
        let free = FreeCameras::fix_first(poses.len(), 1);
        self.optimize_with_free(poses, edges, &free, context)
    }

    /// Incremental mode: only the last `num_free` cameras move.
    pub fn optimize_window(
        &self,
        poses: &mut [CameraPose],
        edges: &[ReducedEdge],
        num_free: usize,
        context: &mut SolverContext,
    ) -> GeaResult<GeaSummary> {
        let free = FreeCameras::last(poses.len(), num_free);
        self.optimize_with_free(poses, edges, &free, context)
    }

    /// Optimize the cameras marked in `free`.
    ///
    /// `poses` is updated in place on every accepted step, so on any status it
    /// holds the last accepted state. `Err` is returned only for invalid input.
    pub fn optimize_with_free(
        &self,
        poses: &mut [CameraPose],
        edges: &[ReducedEdge],
        free: &FreeCameras,
        context: &mut SolverContext,
    ) -> GeaResult<GeaSummary> {
        let start = Instant::now();
        self.validate(poses, edges, free)?;

        let num_correspondences = edges.iter().map(|e| e.matrix.num_correspondences()).sum();
        let mut summary = GeaSummary::new(edges.len(), num_correspondences);
        summary.final_lambda = self.config.initial_lambda;

        let mut connected = vec![false; poses.len()];
        for edge in edges {
            connected[edge.pair.source()] = true;
            connected[edge.pair.destination()] = true;
        }
        let mut blocks = vec![None; poses.len()];
        let mut free_cameras = Vec::new();
        for (camera, block) in blocks.iter_mut().enumerate() {
            if !free.is_free(camera) {
                continue;
            }
            if !connected[camera] {
                warn!("camera {camera} has no edges and is left unmodified");
                summary.isolated_cameras.push(camera);
                continue;
            }
            *block = Some(free_cameras.len());
            free_cameras.push(camera);
        }
        summary.num_free_cameras = free_cameras.len();

        let eval_start = Instant::now();
        let assembled = assemble_normal_equations(poses, edges, &blocks, free_cameras.len());
        summary.evaluation_time += eval_start.elapsed();
        let mut system = match assembled {
            Ok(system) => system,
            Err(GeaError::NumericDivergence(reason)) => {
                summary.status = OptimizationStatus::NumericDivergence(reason);
                summary.total_time = start.elapsed();
                return Ok(summary);
            }
            Err(err) => return Err(err),
        };
        if system.skipped_edges > 0 {
            warn!(
                "{} of {} edges skipped at the initial poses",
                system.skipped_edges,
                edges.len()
            );
        }

        let mut cost = system.cost;
        summary.initial_cost = cost;
        summary.final_cost = cost;
        summary.initial_rms = rms(cost, num_correspondences);
        summary.final_rms = summary.initial_rms;

        if free_cameras.is_empty() {
            summary.status = OptimizationStatus::NoFreeCameras;
            summary.total_time = start.elapsed();
            return Ok(summary);
        }

        let mut lambda = self.config.initial_lambda;
        let mut consecutive_rejects = 0;
        let mut status = OptimizationStatus::MaxIterationsReached;

        for iteration in 0..self.config.max_iterations {
            if cost == 0.0 {
                status = OptimizationStatus::Converged;
                break;
            }

            let solve_start = Instant::now();
            let damped = self.damped_hessian(&system.hessian, lambda)?;
            let step = context.solve(&damped, &-&system.gradient);
            let solve_time = solve_start.elapsed();
            summary.solve_time += solve_time;

            let eval_start = Instant::now();
            let outcome = match step {
                Ok(delta) => self.try_step(poses, edges, &free_cameras, &delta, cost),
                Err(LinAlgError::NonFinite(reason)) => StepOutcome::Diverged(reason),
                Err(err) => {
                    debug!("linear solve failed at iteration {iteration}: {err}");
                    StepOutcome::Rejected {
                        cost: None,
                        step_norm: 0.0,
                    }
                }
            };

            let mut record = IterationRecord {
                iteration,
                cost,
                lambda,
                accepted: false,
                step_norm: 0.0,
                evaluation_time: eval_start.elapsed(),
                solve_time,
            };
            let mut stop = None;

            match outcome {
                StepOutcome::Accepted {
                    cost: new_cost,
                    step_norm,
                } => {
                    let relative_change = (cost - new_cost) / cost;
                    cost = new_cost;
                    lambda = (lambda * self.config.lambda_decrease_factor).max(self.config.lambda_min);
                    consecutive_rejects = 0;
                    summary.successful_steps += 1;

                    match assemble_normal_equations(poses, edges, &blocks, free_cameras.len()) {
                        Ok(next) => system = next,
                        Err(GeaError::NumericDivergence(reason)) => {
                            stop = Some(OptimizationStatus::NumericDivergence(reason));
                        }
                        Err(err) => return Err(err),
                    }
                    record.cost = cost;
                    record.accepted = true;
                    record.step_norm = step_norm;
                    record.evaluation_time = eval_start.elapsed();

                    if stop.is_none() && relative_change < self.config.cost_tolerance {
                        stop = Some(OptimizationStatus::Converged);
                    }
                }
                StepOutcome::Rejected {
                    cost: candidate_cost,
                    step_norm,
                } => {
                    lambda = (lambda * self.config.lambda_increase_factor).min(self.config.lambda_max);
                    consecutive_rejects += 1;
                    summary.unsuccessful_steps += 1;
                    record.step_norm = step_norm;

                    // No representable improvement left around the minimum.
                    let stalled = candidate_cost
                        .is_some_and(|c| (c - cost).abs() <= self.config.cost_tolerance * cost);
                    if stalled {
                        stop = Some(OptimizationStatus::Converged);
                    } else if consecutive_rejects > self.config.max_consecutive_rejects {
                        stop = Some(OptimizationStatus::TooManyRejections);
                    }
                }
                StepOutcome::Diverged(reason) => {
                    summary.unsuccessful_steps += 1;
                    stop = Some(OptimizationStatus::NumericDivergence(reason));
                }
            }

            summary.evaluation_time += record.evaluation_time;
            self.log_iteration(&record, num_correspondences);
            summary.history.push(record);
            summary.iterations = iteration + 1;

            if let Some(reason) = stop {
                status = reason;
                break;
            }
        }

        if let OptimizationStatus::NumericDivergence(reason) = &status {
            warn!("optimization aborted: {reason}");
        }
        summary.status = status;
        summary.final_cost = cost;
        summary.final_rms = rms(cost, num_correspondences);
        summary.final_lambda = lambda;
        summary.total_time = start.elapsed();
        debug!(
            "GEA finished after {} iterations: {} (rms {:.3e} -> {:.3e})",
            summary.iterations, summary.status, summary.initial_rms, summary.final_rms
        );
        Ok(summary)
    }

    fn validate(
        &self,
        poses: &[CameraPose],
        edges: &[ReducedEdge],
        free: &FreeCameras,
    ) -> GeaResult<()> {
        if free.len() != poses.len() {
            return Err(GeaError::InvalidInput(format!(
                "free-camera mask of length {} for {} poses",
                free.len(),
                poses.len()
            )));
        }
        check_edge_indices(poses, edges)?;
        if let Some(camera) = poses.iter().position(|p| !p.is_finite()) {
            return Err(GeaError::NumericDivergence(format!(
                "initial pose of camera {camera} is not finite"
            )));
        }
        Ok(())
    }

    /// `H + λ D` with Marquardt scaling `D = max(diag(H), ε)`, or
    /// `D = trace(H)/dim · I` when adaptive damping is enabled.
    fn damped_hessian(&self, hessian: &SparseBlockMatrix, lambda: f64) -> GeaResult<SparseBlockMatrix> {
        let diagonal = hessian.diagonal()?;
        let damping = if self.config.adaptive_lambda {
            let mean = diagonal.sum() / diagonal.len().max(1) as f64;
            DVector::repeat(diagonal.len(), lambda * mean.max(MIN_DAMPING_DIAGONAL))
        } else {
            diagonal.map(|d| lambda * d.max(MIN_DAMPING_DIAGONAL))
        };
        let mut damped = hessian.clone();
        damped.add_to_diagonal(&damping)?;
        Ok(damped)
    }

    /// Apply `delta` to the free cameras and keep it if the cost decreases.
    fn try_step(
        &self,
        poses: &mut [CameraPose],
        edges: &[ReducedEdge],
        free_cameras: &[ViewIndex],
        delta: &DVector<f64>,
        cost: f64,
    ) -> StepOutcome {
        let step_norm = delta.norm();
        let mut candidate = poses.to_vec();
        for (block, &camera) in free_cameras.iter().enumerate() {
            let update = Vector6::from_iterator(delta.rows(block * POSE_DOF, POSE_DOF).iter().copied());
            match candidate[camera].retract(&update) {
                Ok(pose) => candidate[camera] = pose,
                Err(err) => return StepOutcome::Diverged(err.to_string()),
            }
        }
        match total_cost(&candidate, edges) {
            Ok(new_cost) if new_cost < cost => {
                poses.copy_from_slice(&candidate);
                StepOutcome::Accepted {
                    cost: new_cost,
                    step_norm,
                }
            }
            Ok(new_cost) => StepOutcome::Rejected {
                cost: Some(new_cost),
                step_norm,
            },
            Err(err) => StepOutcome::Diverged(err.to_string()),
        }
    }

    fn log_iteration(&self, record: &IterationRecord, num_correspondences: usize) {
        let line = format!(
            "iter {:>3}: cost {:.6e} rms {:.3e} lambda {:.2e} |step| {:.2e} {}",
            record.iteration,
            record.cost,
            rms(record.cost, num_correspondences),
            record.lambda,
            record.step_norm,
            if record.accepted { "accepted" } else { "rejected" }
        );
        if self.config.verbose {
            info!("{line}");
        } else {
            debug!("{line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epipolar::Correspondence;
    use crate::geometry::Quaternion;
    use crate::graph::ViewPair;
    use crate::linalg::{LinAlgResult, LinearSolverType, SparseLinearSolver};
    use crate::reduced::{DecompositionMethod, ReducedMatrixBuilder, ReducedMatrixConfig};
    use nalgebra::{Point3, Vector3};

    const TOLERANCE: f64 = 1e-9;

    fn ground_truth() -> Vec<CameraPose> {
        vec![
            CameraPose::identity(),
            CameraPose::new(
                Quaternion::from_axis_angle(&Vector3::y(), -0.1).unwrap(),
                Point3::new(1.0, 0.0, 0.0),
            ),
            CameraPose::new(
                Quaternion::from_axis_angle(&Vector3::new(1.0, 0.5, 0.0), 0.08).unwrap(),
                Point3::new(0.5, 0.8, 0.1),
            ),
        ]
    }

    fn points() -> Vec<Point3<f64>> {
        (0..24)
            .map(|i| {
                let t = i as f64;
                Point3::new(
                    (t * 0.7).sin(),
                    (t * 1.3).cos(),
                    5.0 + (t * 0.45).sin(),
                )
            })
            .collect()
    }

    /// Gram-form edges: zero cost at the true poses.
    fn edges(poses: &[CameraPose]) -> Vec<ReducedEdge> {
        let config = ReducedMatrixConfig::new().with_decomposition(DecompositionMethod::None);
        edges_with(poses, &ReducedMatrixBuilder::new(&config))
    }

    fn edges_with(poses: &[CameraPose], builder: &ReducedMatrixBuilder) -> Vec<ReducedEdge> {
        let points = points();
        let mut edges = Vec::new();
        for a in 0..poses.len() {
            for b in (a + 1)..poses.len() {
                let correspondences: Vec<_> = points
                    .iter()
                    .map(|x| {
                        Correspondence::new(poses[a].project(x).unwrap(), poses[b].project(x).unwrap())
                    })
                    .collect();
                edges.push(ReducedEdge {
                    pair: ViewPair::new(a, b).unwrap(),
                    matrix: builder.build_edge(&correspondences).unwrap(),
                });
            }
        }
        edges
    }

    fn perturbed(poses: &[CameraPose]) -> Vec<CameraPose> {
        poses
            .iter()
            .enumerate()
            .map(|(i, p)| {
                if i == 0 {
                    *p
                } else {
                    let s = i as f64;
                    p.retract(&Vector6::new(0.02, -0.01 * s, 0.015, 0.03, -0.02, 0.01 * s))
                        .unwrap()
                }
            })
            .collect()
    }

    #[test]
    fn test_free_cameras() {
        let fixed = FreeCameras::fix_first(4, 1);
        assert!(!fixed.is_free(0));
        assert!(fixed.is_free(3));
        assert_eq!(fixed.count(), 3);

        let window = FreeCameras::last(5, 2);
        assert_eq!(
            (0..5).map(|i| window.is_free(i)).collect::<Vec<_>>(),
            vec![false, false, false, true, true]
        );
        assert!(!window.is_free(10));
        assert_eq!(FreeCameras::last(2, 5).count(), 2);
        assert_eq!(FreeCameras::last(3, usize::MAX).count(), 3);
        assert_eq!(FreeCameras::last(0, usize::MAX).count(), 0);
    }

    #[test]
    fn test_window_larger_than_camera_count() {
        let truth = ground_truth();
        let edges = edges(&truth);
        let mut poses = perturbed(&truth);
        let mut context = SolverContext::default();
        let summary = GlobalEpipolarAdjustment::new()
            .optimize_window(&mut poses, &edges, usize::MAX, &mut context)
            .unwrap();
        assert_eq!(summary.num_free_cameras, 3);
        assert!(summary.final_cost < summary.initial_cost);
    }

    #[test]
    fn test_regularization_adds_constant_offset() {
        // ‖vec(E)‖² = 2 for every pose pair, so λI adds 2λ per edge.
        let lambda = 1e-6;
        let poses = ground_truth();
        let builder = ReducedMatrixBuilder::new(&ReducedMatrixConfig::new().with_regularization(lambda));
        let edges = edges_with(&poses, &builder);
        let blocks = vec![None, Some(0), Some(1)];
        let system = assemble_normal_equations(&poses, &edges, &blocks, 2).unwrap();
        assert!((system.cost - 2.0 * lambda * edges.len() as f64).abs() < 1e-10);
        assert!(system.gradient.norm() < 1e-6);
        assert!((total_cost(&poses, &edges).unwrap() - system.cost).abs() < 1e-14);
    }

    #[test]
    fn test_ground_truth_has_zero_gradient() {
        let poses = ground_truth();
        let edges = edges(&poses);
        let blocks = vec![None, Some(0), Some(1)];
        let system = assemble_normal_equations(&poses, &edges, &blocks, 2).unwrap();
        assert!(system.cost < 1e-12, "cost {}", system.cost);
        assert!(system.gradient.norm() < 1e-6);
        assert_eq!(system.skipped_edges, 0);
        // Both free cameras and their coupling are present.
        assert_eq!(system.hessian.num_blocks(), 4);
    }

    #[test]
    fn test_assembly_is_order_invariant() {
        let truth = ground_truth();
        let edges = edges(&truth);
        let poses = perturbed(&truth);
        let blocks = vec![None, Some(0), Some(1)];

        let forward = assemble_normal_equations(&poses, &edges, &blocks, 2).unwrap();
        let mut reversed_edges = edges.clone();
        reversed_edges.reverse();
        let reversed = assemble_normal_equations(&poses, &reversed_edges, &blocks, 2).unwrap();

        assert!((forward.cost - reversed.cost).abs() < TOLERANCE);
        assert!((forward.gradient - reversed.gradient).norm() < TOLERANCE);
        assert!((forward.hessian.to_dense() - reversed.hessian.to_dense()).norm() < TOLERANCE);
    }

    #[test]
    fn test_hessian_is_symmetric() {
        let truth = ground_truth();
        let edges = edges(&truth);
        let poses = perturbed(&truth);
        let system = assemble_normal_equations(&poses, &edges, &[Some(0), Some(1), Some(2)], 3)
            .unwrap();
        let dense = system.hessian.to_dense();
        assert!((&dense - dense.transpose()).norm() < TOLERANCE);
    }

    #[test]
    fn test_optimize_recovers_noise_free_poses() {
        let truth = ground_truth();
        let edges = edges(&truth);
        let mut poses = perturbed(&truth);
        let before = total_cost(&poses, &edges).unwrap();

        let mut context = SolverContext::default();
        let optimizer = GlobalEpipolarAdjustment::with_config(GeaConfig::new().with_max_iterations(50));
        let summary = optimizer.optimize(&mut poses, &edges, &mut context).unwrap();

        assert!(
            !matches!(summary.status, OptimizationStatus::NumericDivergence(_)),
            "{}",
            summary.status
        );
        assert!(summary.final_cost < 1e-3 * before);
        assert_eq!(poses[0], truth[0]);
        for i in 1..3 {
            assert!(poses[i].orientation.angle_to(&truth[i].orientation) < 1e-3);
        }
    }

    #[test]
    fn test_no_free_cameras() {
        let truth = ground_truth();
        let edges = edges(&truth);
        let mut poses = truth.clone();
        let mut context = SolverContext::default();
        let summary = GlobalEpipolarAdjustment::new()
            .optimize_window(&mut poses, &edges, 0, &mut context)
            .unwrap();
        assert_eq!(summary.status, OptimizationStatus::NoFreeCameras);
        assert_eq!(summary.iterations, 0);
        assert_eq!(poses, truth);
    }

    #[test]
    fn test_out_of_range_edge_is_rejected() {
        let truth = ground_truth();
        let edges = edges(&truth);
        let mut poses = truth[..2].to_vec();
        let mut context = SolverContext::default();
        let result = GlobalEpipolarAdjustment::new().optimize(&mut poses, &edges, &mut context);
        assert!(matches!(result, Err(GeaError::InvalidInput(_))));
    }

    #[test]
    fn test_unchecked_indices_are_rejected() {
        let truth = ground_truth();
        let edges = edges(&truth);
        let poses = &truth[..2];
        assert!(matches!(
            total_cost(poses, &edges),
            Err(GeaError::InvalidInput(_))
        ));
        assert!(matches!(
            assemble_normal_equations(poses, &edges, &[None, Some(0)], 1),
            Err(GeaError::InvalidInput(_))
        ));
        assert!(matches!(
            assemble_normal_equations(&truth, &edges, &[None, Some(0)], 1),
            Err(GeaError::InvalidInput(_))
        ));
        assert!(matches!(
            assemble_normal_equations(&truth, &edges, &[None, Some(0), Some(2)], 2),
            Err(GeaError::InvalidInput(_))
        ));
    }

    /// Solves exactly for the first `good_steps` calls, then steps uphill.
    struct UphillAfter {
        good_steps: usize,
        calls: usize,
        exact: Box<dyn SparseLinearSolver>,
    }

    impl UphillAfter {
        fn new(good_steps: usize) -> Self {
            Self {
                good_steps,
                calls: 0,
                exact: LinearSolverType::DenseCholesky.create(10),
            }
        }
    }

    impl SparseLinearSolver for UphillAfter {
        fn name(&self) -> &'static str {
            "uphill"
        }

        fn solve(
            &mut self,
            system: &SparseBlockMatrix,
            rhs: &DVector<f64>,
        ) -> LinAlgResult<DVector<f64>> {
            self.calls += 1;
            if self.calls <= self.good_steps {
                self.exact.solve(system, rhs)
            } else {
                // `rhs` is the negative gradient.
                Ok(rhs * (-1e-3 / rhs.norm()))
            }
        }
    }

    struct NanSolver;

    impl SparseLinearSolver for NanSolver {
        fn name(&self) -> &'static str {
            "nan"
        }

        fn solve(
            &mut self,
            _system: &SparseBlockMatrix,
            _rhs: &DVector<f64>,
        ) -> LinAlgResult<DVector<f64>> {
            Err(LinAlgError::NonFinite("solver produced NaN or Inf".to_string()))
        }
    }

    #[test]
    fn test_reject_budget_keeps_initial_poses() {
        let truth = ground_truth();
        let edges = edges(&truth);
        let initial = perturbed(&truth);
        let mut poses = initial.clone();
        let mut context = SolverContext::with_solver(Box::new(UphillAfter::new(0)));
        let config = GeaConfig::new()
            .with_max_iterations(20)
            .with_max_consecutive_rejects(2);
        let summary = GlobalEpipolarAdjustment::with_config(config)
            .optimize(&mut poses, &edges, &mut context)
            .unwrap();

        assert_eq!(summary.status, OptimizationStatus::TooManyRejections);
        assert_eq!(summary.iterations, 3);
        assert_eq!(summary.successful_steps, 0);
        assert_eq!(summary.final_cost, summary.initial_cost);
        assert_eq!(poses, initial);
    }

    #[test]
    fn test_reject_budget_returns_last_accepted_poses() {
        let truth = ground_truth();
        let edges = edges(&truth);
        let initial = perturbed(&truth);
        let mut poses = initial.clone();
        let mut context = SolverContext::with_solver(Box::new(UphillAfter::new(1)));
        let config = GeaConfig::new()
            .with_max_iterations(20)
            .with_max_consecutive_rejects(2);
        let summary = GlobalEpipolarAdjustment::with_config(config)
            .optimize(&mut poses, &edges, &mut context)
            .unwrap();

        assert_eq!(summary.status, OptimizationStatus::TooManyRejections);
        assert_eq!(summary.successful_steps, 1);
        assert_eq!(summary.unsuccessful_steps, 3);
        assert!(summary.history[0].accepted);
        assert_eq!(summary.final_cost, summary.history[0].cost);
        assert!(summary.final_cost < summary.initial_cost);
        assert_eq!(total_cost(&poses, &edges).unwrap(), summary.final_cost);
        assert_ne!(poses, initial);
    }

    #[test]
    fn test_non_finite_increment_stops_optimization() {
        let truth = ground_truth();
        let edges = edges(&truth);
        let initial = perturbed(&truth);
        let mut poses = initial.clone();
        let mut context = SolverContext::with_solver(Box::new(NanSolver));
        let summary = GlobalEpipolarAdjustment::new()
            .optimize(&mut poses, &edges, &mut context)
            .unwrap();

        assert!(matches!(
            summary.status,
            OptimizationStatus::NumericDivergence(_)
        ));
        assert_eq!(summary.iterations, 1);
        assert_eq!(poses, initial);
    }

    #[test]
    fn test_non_finite_initial_pose() {
        let truth = ground_truth();
        let edges = edges(&truth);
        let mut poses = truth.clone();
        poses[2].center.x = f64::NAN;
        let mut context = SolverContext::default();
        let result = GlobalEpipolarAdjustment::new().optimize(&mut poses, &edges, &mut context);
        assert!(matches!(result, Err(GeaError::NumericDivergence(_))));
    }
}
