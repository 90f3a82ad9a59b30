//! End-to-end refinement: tracks → correspondence graph → reduced matrices →
//! pose-graph optimization → triangulation.

use std::fmt;
use std::time::{Duration, Instant};

use nalgebra::Point3;
use tracing::{info, warn};

use crate::epipolar::iterative_local_optimization;
use crate::error::{GeaError, GeaResult};
use crate::geometry::CameraPose;
use crate::graph::{CorrespondenceGraph, PointTrack, SimplificationConfig};
use crate::linalg::{LinearSolverType, SolverContext};
use crate::optimizer::{FreeCameras, GeaConfig, GeaSummary, GlobalEpipolarAdjustment};
use crate::reduced::{DroppedEdge, MIN_REDUCED_CORRESPONDENCES, ReducedMatrixBuilder, ReducedMatrixConfig};
use crate::triangulation::{ReprojectionError, reprojection_error};

/// Per-edge outlier rejection before the reduced matrices are built.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutlierFilterConfig {
    /// Symmetric epipolar distance accepted as inlier, in image units
    pub max_error: f64,
    pub min_inliers: usize,
}

impl Default for OutlierFilterConfig {
    fn default() -> Self {
        Self {
            max_error: 1e-3,
            min_inliers: 16,
        }
    }
}

/// Everything [`run_pipeline`] needs besides the data.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Edges with fewer correspondences are dropped when building the graph
    pub min_correspondences: usize,
    pub simplification: Option<SimplificationConfig>,
    pub outlier_filter: Option<OutlierFilterConfig>,
    pub reduced: ReducedMatrixConfig,
    pub optimizer: GeaConfig,
    /// Leading cameras held constant
    pub num_fixed: usize,
    /// When set, only the last `n` cameras are optimized
    pub window: Option<usize>,
    pub linear_solver: LinearSolverType,
    /// Inner iteration cap of iterative solvers
    pub max_inner_iterations: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_correspondences: MIN_REDUCED_CORRESPONDENCES,
            simplification: Some(SimplificationConfig::default()),
            outlier_filter: None,
            reduced: ReducedMatrixConfig::default(),
            optimizer: GeaConfig::default(),
            num_fixed: 1,
            window: None,
            linear_solver: LinearSolverType::default(),
            max_inner_iterations: 100,
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_correspondences(mut self, min_correspondences: usize) -> Self {
        self.min_correspondences = min_correspondences;
        self
    }

    pub fn with_simplification(mut self, simplification: Option<SimplificationConfig>) -> Self {
        self.simplification = simplification;
        self
    }

    pub fn with_outlier_filter(mut self, filter: Option<OutlierFilterConfig>) -> Self {
        self.outlier_filter = filter;
        self
    }

    pub fn with_reduced(mut self, reduced: ReducedMatrixConfig) -> Self {
        self.reduced = reduced;
        self
    }

    pub fn with_optimizer(mut self, optimizer: GeaConfig) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn with_num_fixed(mut self, num_fixed: usize) -> Self {
        self.num_fixed = num_fixed;
        self
    }

    pub fn with_window(mut self, window: Option<usize>) -> Self {
        self.window = window;
        self
    }

    pub fn with_linear_solver(mut self, solver: LinearSolverType, max_inner_iterations: usize) -> Self {
        self.linear_solver = solver;
        self.max_inner_iterations = max_inner_iterations;
        self
    }

    /// Solver context matching `linear_solver`, to be reused across calls.
    pub fn solver_context(&self) -> SolverContext {
        SolverContext::new(self.linear_solver, self.max_inner_iterations)
    }

    fn free_cameras(&self, num_cameras: usize) -> FreeCameras {
        match self.window {
            Some(num_free) => FreeCameras::last(num_cameras, num_free),
            None => FreeCameras::fix_first(num_cameras, self.num_fixed),
        }
    }
}

/// Wall-clock time of each stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageTimings {
    pub graph: Duration,
    pub filtering: Duration,
    pub reduction: Duration,
    pub optimization: Duration,
    pub triangulation: Duration,
}

impl StageTimings {
    pub fn total(&self) -> Duration {
        self.graph + self.filtering + self.reduction + self.optimization + self.triangulation
    }
}

/// Output of [`run_pipeline`].
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub poses: Vec<CameraPose>,
    pub summary: GeaSummary,
    /// Triangulated points from the refined poses, `None` for failed tracks
    pub points: Vec<Option<Point3<f64>>>,
    pub reprojection_before: ReprojectionError,
    pub reprojection_after: ReprojectionError,
    pub num_edges: usize,
    pub dropped_edges: Vec<DroppedEdge>,
    pub timings: StageTimings,
}

impl fmt::Display for PipelineResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.summary)?;
        writeln!(f)?;
        writeln!(f, "=== Pipeline ===")?;
        writeln!(
            f,
            "Edges kept / dropped:      {} / {}",
            self.num_edges,
            self.dropped_edges.len()
        )?;
        writeln!(
            f,
            "Reprojection RMS:          {:.6e} -> {:.6e}",
            self.reprojection_before.rms, self.reprojection_after.rms
        )?;
        writeln!(
            f,
            "Triangulated points:       {} ({} failed)",
            self.reprojection_after.num_points, self.reprojection_after.failed_tracks
        )?;
        writeln!(f, "Graph time:                {:?}", self.timings.graph)?;
        writeln!(f, "Filtering time:            {:?}", self.timings.filtering)?;
        writeln!(f, "Reduction time:            {:?}", self.timings.reduction)?;
        writeln!(f, "Optimization time:         {:?}", self.timings.optimization)?;
        writeln!(f, "Triangulation time:        {:?}", self.timings.triangulation)?;
        Ok(())
    }
}

/// Drop outliers edge by edge; edges that cannot be cleaned are removed.
fn filter_outliers(
    graph: CorrespondenceGraph,
    filter: &OutlierFilterConfig,
) -> (CorrespondenceGraph, Vec<DroppedEdge>) {
    let mut filtered = CorrespondenceGraph::new();
    let mut dropped = Vec::new();
    for (pair, correspondences) in graph.into_edges() {
        match iterative_local_optimization(&correspondences, filter.max_error, filter.min_inliers) {
            Ok(local) => filtered.insert_edge(pair, local.inliers),
            Err(reason) => {
                warn!(
                    "dropping edge ({}, {}) during outlier filtering: {reason}",
                    pair.source(),
                    pair.destination()
                );
                dropped.push(DroppedEdge { pair, reason });
            }
        }
    }
    (filtered, dropped)
}

/// Refine `initial_poses` against the point tracks.
///
/// Tracks hold normalized image coordinates (calibrated cameras).
pub fn run_pipeline(
    tracks: &[PointTrack],
    initial_poses: &[CameraPose],
    config: &PipelineConfig,
    context: &mut SolverContext,
) -> GeaResult<PipelineResult> {
    if let Some(view) = tracks
        .iter()
        .filter_map(|track| track.keys().next_back().copied())
        .max()
        .filter(|&view| view >= initial_poses.len())
    {
        return Err(GeaError::InvalidInput(format!(
            "tracks reference view {view} but only {} poses were given",
            initial_poses.len()
        )));
    }

    let mut timings = StageTimings::default();

    let stage = Instant::now();
    let mut graph = CorrespondenceGraph::from_tracks(tracks, config.min_correspondences);
    let full_edges = graph.num_edges();
    if let Some(simplification) = &config.simplification {
        graph = simplification.apply(graph);
    }
    timings.graph = stage.elapsed();
    info!(
        "correspondence graph: {} edges ({} before simplification), {} correspondences",
        graph.num_edges(),
        full_edges,
        graph.num_correspondences()
    );

    let mut dropped_edges = Vec::new();
    if let Some(filter) = &config.outlier_filter {
        let stage = Instant::now();
        let (filtered, dropped) = filter_outliers(graph, filter);
        graph = filtered;
        dropped_edges.extend(dropped);
        timings.filtering = stage.elapsed();
        info!(
            "outlier filtering kept {} edges, {} correspondences",
            graph.num_edges(),
            graph.num_correspondences()
        );
    }

    let stage = Instant::now();
    let builder = ReducedMatrixBuilder::new(&config.reduced);
    let reduced = builder.build(&graph);
    dropped_edges.extend(reduced.dropped.iter().cloned());
    timings.reduction = stage.elapsed();
    info!(
        "reduced matrices: {} edges ({} decomposition), {} dropped",
        reduced.edges.len(),
        builder.decomposition_name(),
        dropped_edges.len()
    );

    let (_, reprojection_before) = reprojection_error(initial_poses, tracks)?;

    let stage = Instant::now();
    let mut poses = initial_poses.to_vec();
    let optimizer = GlobalEpipolarAdjustment::with_config(config.optimizer.clone());
    let free = config.free_cameras(poses.len());
    let summary = optimizer.optimize_with_free(&mut poses, &reduced.edges, &free, context)?;
    timings.optimization = stage.elapsed();
    info!(
        "optimization: {} after {} iterations, rms {:.3e} -> {:.3e}",
        summary.status, summary.iterations, summary.initial_rms, summary.final_rms
    );

    let stage = Instant::now();
    let (points, reprojection_after) = reprojection_error(&poses, tracks)?;
    timings.triangulation = stage.elapsed();
    info!(
        "reprojection rms {:.3e} -> {:.3e} over {} points",
        reprojection_before.rms, reprojection_after.rms, reprojection_after.num_points
    );

    Ok(PipelineResult {
        poses,
        summary,
        points,
        reprojection_before,
        reprojection_after,
        num_edges: reduced.edges.len(),
        dropped_edges,
        timings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Point2;

    #[test]
    fn test_config_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.min_correspondences, MIN_REDUCED_CORRESPONDENCES);
        assert_eq!(config.num_fixed, 1);
        assert!(config.simplification.is_some());
        assert!(config.outlier_filter.is_none());
        assert_eq!(config.solver_context().solver_name(), "sparse-cholesky");
    }

    #[test]
    fn test_window_overrides_fixed_cameras() {
        let config = PipelineConfig::new().with_num_fixed(2).with_window(Some(1));
        let free = config.free_cameras(4);
        assert_eq!(free.count(), 1);
        assert!(free.is_free(3));

        let config = PipelineConfig::new().with_num_fixed(2);
        assert_eq!(config.free_cameras(4).count(), 2);
    }

    #[test]
    fn test_track_beyond_poses_is_rejected() {
        let mut track = PointTrack::new();
        track.insert(0, Point2::new(0.0, 0.0));
        track.insert(5, Point2::new(0.1, 0.0));
        let poses = vec![CameraPose::identity(); 2];
        let mut context = SolverContext::default();
        let result = run_pipeline(&[track], &poses, &PipelineConfig::default(), &mut context);
        assert!(matches!(result, Err(GeaError::InvalidInput(_))));
    }
}
