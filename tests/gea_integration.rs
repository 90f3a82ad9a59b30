//! End-to-end tests of the pose-graph optimizer on synthetic scenes
//!
//! Covers the noisy three-view scenario, fixed and windowed cameras, isolated
//! cameras, edge-order invariance, every solver backend and decomposition, and
//! the full pipeline.

#![allow(clippy::unwrap_used)]

use gea_solver::geometry::CameraPose;
use gea_solver::graph::SimplificationConfig;
use gea_solver::linalg::{LinearSolverType, SolverContext};
use gea_solver::optimizer::{
    FreeCameras, GeaConfig, GlobalEpipolarAdjustment, OptimizationStatus, total_cost,
};
use gea_solver::pipeline::{OutlierFilterConfig, PipelineConfig, run_pipeline};
use gea_solver::reduced::{DecompositionMethod, ReducedMatrixConfig};
use nalgebra::{Vector2, Vector3};

use gea_test_utils::*;

const NOISE_PX: f64 = 0.5;

#[test]
fn test_three_views_twenty_points() {
    let scene = synthetic_scene(3, 20, NOISE_PX, 1);
    let edges = reduced_edges(&scene.tracks, &ReducedMatrixConfig::default());
    assert_eq!(edges.len(), 3);

    let mut poses = perturb(&scene.truth, 1, 1.5, 0.05, 2);
    let initial_rms = reprojection_rms_px(&poses, &scene.tracks);

    let mut context = SolverContext::default();
    let summary = GlobalEpipolarAdjustment::with_config(GeaConfig::new().with_max_iterations(20))
        .optimize(&mut poses, &edges, &mut context)
        .unwrap();
    let final_rms = reprojection_rms_px(&poses, &scene.tracks);

    assert!(summary.status.is_success(), "{summary}");
    assert!(final_rms < initial_rms, "{final_rms} >= {initial_rms}");
    assert!(
        final_rms <= 1.2 * NOISE_PX,
        "reprojection RMS {final_rms:.3} px exceeds 1.2 sigma"
    );
    assert!(summary.final_rms < summary.initial_rms);
    assert!(max_rotation_error(&poses, &scene.truth) < 0.5_f64.to_radians());
}

#[test]
fn test_accepted_steps_never_increase_cost() {
    let scene = synthetic_scene(5, 40, NOISE_PX, 3);
    let edges = reduced_edges(&scene.tracks, &ReducedMatrixConfig::default());
    let mut poses = perturb(&scene.truth, 1, 2.0, 0.08, 4);

    let mut context = SolverContext::default();
    let summary = GlobalEpipolarAdjustment::with_config(GeaConfig::new().with_max_iterations(30))
        .optimize(&mut poses, &edges, &mut context)
        .unwrap();

    let mut previous = summary.initial_cost;
    for record in &summary.history {
        if record.accepted {
            assert!(record.cost < previous);
        } else {
            assert_eq!(record.cost, previous);
        }
        previous = record.cost;
    }
    assert_eq!(summary.final_cost, previous);
    assert!((total_cost(&poses, &edges).unwrap() - summary.final_cost).abs() < 1e-12);
    assert_eq!(
        summary.successful_steps + summary.unsuccessful_steps,
        summary.iterations
    );
}

#[test]
fn test_adaptive_damping_never_increases_cost() {
    let scene = synthetic_scene(5, 40, NOISE_PX, 21);
    let edges = reduced_edges(&scene.tracks, &ReducedMatrixConfig::default());
    let mut poses = perturb(&scene.truth, 1, 1.5, 0.05, 22);
    let initial_rms = reprojection_rms_px(&poses, &scene.tracks);

    let config = GeaConfig::new()
        .with_max_iterations(40)
        .with_adaptive_lambda(true);
    let mut context = SolverContext::default();
    let summary = GlobalEpipolarAdjustment::with_config(config)
        .optimize(&mut poses, &edges, &mut context)
        .unwrap();

    assert!(
        !matches!(summary.status, OptimizationStatus::NumericDivergence(_)),
        "{summary}"
    );
    assert!(summary.successful_steps > 0);
    let mut previous = summary.initial_cost;
    for record in &summary.history {
        assert!(record.cost <= previous);
        previous = record.cost;
    }
    assert!(summary.final_cost < summary.initial_cost);
    assert!(reprojection_rms_px(&poses, &scene.tracks) < initial_rms);
}

#[test]
fn test_fixed_cameras_are_bit_identical() {
    let scene = synthetic_scene(5, 30, NOISE_PX, 5);
    let edges = reduced_edges(&scene.tracks, &ReducedMatrixConfig::default());
    let initial = perturb(&scene.truth, 0, 1.0, 0.05, 6);
    let mut poses = initial.clone();

    let free = FreeCameras::fix_first(poses.len(), 2);
    let mut context = SolverContext::default();
    let summary = GlobalEpipolarAdjustment::new()
        .optimize_with_free(&mut poses, &edges, &free, &mut context)
        .unwrap();

    assert_eq!(summary.num_free_cameras, 3);
    assert_eq!(poses[0], initial[0]);
    assert_eq!(poses[1], initial[1]);
    assert!(summary.successful_steps > 0);
    assert_ne!(poses[4], initial[4]);
}

#[test]
fn test_windowed_optimization() {
    let scene = synthetic_scene(6, 40, NOISE_PX, 7);
    let edges = reduced_edges(&scene.tracks, &ReducedMatrixConfig::default());

    // Older cameras are already refined; only the newest two are perturbed.
    let mut poses = scene.truth.clone();
    let perturbed = perturb(&scene.truth, 4, 1.0, 0.05, 8);
    poses[4] = perturbed[4];
    poses[5] = perturbed[5];
    let before = max_rotation_error(&poses, &scene.truth);

    let mut context = SolverContext::default();
    let optimizer = GlobalEpipolarAdjustment::new();
    let summary = optimizer
        .optimize_window(&mut poses, &edges, 2, &mut context)
        .unwrap();

    assert_eq!(summary.num_free_cameras, 2);
    assert_eq!(&poses[..4], &scene.truth[..4]);
    assert!(max_rotation_error(&poses, &scene.truth) < 0.25 * before);

    // Feeding the output back in keeps improving or stays put.
    let cost = summary.final_cost;
    let again = optimizer
        .optimize_window(&mut poses, &edges, 2, &mut context)
        .unwrap();
    assert!(again.final_cost <= cost * (1.0 + 1e-12));
    assert!(context.statistics().solves > 0);
}

#[test]
fn test_isolated_camera_is_left_unmodified() {
    let scene = synthetic_scene(4, 30, NOISE_PX, 9);
    let edges = reduced_edges(&scene.tracks, &ReducedMatrixConfig::default());
    let mut poses = perturb(&scene.truth, 1, 1.0, 0.05, 10);
    let lonely = CameraPose::new(poses[2].orientation, poses[2].center + Vector3::x());
    poses.push(lonely);

    let mut context = SolverContext::default();
    let summary = GlobalEpipolarAdjustment::new()
        .optimize(&mut poses, &edges, &mut context)
        .unwrap();

    assert_eq!(summary.isolated_cameras, vec![4]);
    assert_eq!(summary.num_free_cameras, 3);
    assert_eq!(poses[4], lonely);
    assert!(summary.status.is_success(), "{summary}");
}

#[test]
fn test_edge_order_does_not_change_the_result() {
    let scene = synthetic_scene(5, 30, NOISE_PX, 11);
    let edges = reduced_edges(&scene.tracks, &ReducedMatrixConfig::default());
    let mut reversed = edges.clone();
    reversed.reverse();
    let initial = perturb(&scene.truth, 1, 1.0, 0.05, 12);
    let optimizer = GlobalEpipolarAdjustment::with_config(GeaConfig::new().with_max_iterations(10));

    let mut forward_poses = initial.clone();
    let mut context = SolverContext::default();
    let forward = optimizer
        .optimize(&mut forward_poses, &edges, &mut context)
        .unwrap();

    let mut reversed_poses = initial.clone();
    let backward = optimizer
        .optimize(&mut reversed_poses, &reversed, &mut context)
        .unwrap();

    assert_eq!(forward.successful_steps, backward.successful_steps);
    assert!((forward.final_cost - backward.final_cost).abs() <= 1e-9 * forward.initial_cost);
    for (a, b) in forward_poses.iter().zip(&reversed_poses) {
        assert!(a.orientation.angle_to(&b.orientation) < 1e-6);
        assert!((a.center - b.center).norm() < 1e-6);
    }
}

#[test]
fn test_solvers_and_decompositions_agree() {
    let scene = synthetic_scene(4, 30, NOISE_PX, 13);
    let initial = perturb(&scene.truth, 1, 1.0, 0.05, 14);
    let config = GeaConfig::new().with_max_iterations(50);

    let mut results = Vec::new();
    for decomposition in [
        DecompositionMethod::None,
        DecompositionMethod::Cholesky,
        DecompositionMethod::Eigen,
    ] {
        let edges = reduced_edges(
            &scene.tracks,
            &ReducedMatrixConfig::new().with_decomposition(decomposition),
        );
        for solver in [
            LinearSolverType::SparseCholesky,
            LinearSolverType::DenseCholesky,
            LinearSolverType::ConjugateGradient,
        ] {
            let mut poses = initial.clone();
            let mut context = SolverContext::new(solver, 200);
            let summary = GlobalEpipolarAdjustment::with_config(config.clone())
                .optimize(&mut poses, &edges, &mut context)
                .unwrap();
            assert!(
                !matches!(summary.status, OptimizationStatus::NumericDivergence(_)),
                "{decomposition} / {solver}: {summary}"
            );
            assert!(summary.final_cost < summary.initial_cost);
            results.push(poses);
        }
    }

    let reference = &results[0];
    for poses in &results[1..] {
        assert!(max_rotation_error(poses, reference) < 1e-3);
    }
}

#[test]
fn test_pipeline_reduces_reprojection_error() {
    let scene = synthetic_scene(8, 120, NOISE_PX, 15);
    let initial = perturb(&scene.truth, 1, 1.0, 0.05, 16);

    let config = PipelineConfig::new()
        .with_simplification(Some(SimplificationConfig::new(2, 2)))
        .with_optimizer(GeaConfig::new().with_max_iterations(30));
    let mut context = config.solver_context();
    let result = run_pipeline(&scene.tracks, &initial, &config, &mut context).unwrap();

    // 7 + 6 tracking edges, plus at most 2 loop edges for each of the first 5 views.
    assert!(result.num_edges >= 13);
    assert!(result.num_edges <= 13 + 2 * 5);
    assert!(result.dropped_edges.is_empty());
    assert_eq!(result.points.len(), scene.tracks.len());
    assert!(result.reprojection_after.rms < result.reprojection_before.rms);
    assert!(result.reprojection_after.rms * FOCAL <= 1.2 * NOISE_PX);
    assert_eq!(result.poses[0], initial[0]);
    assert!(result.timings.total() >= result.timings.optimization);
}

#[test]
fn test_pipeline_filters_outliers() {
    let mut scene = synthetic_scene(3, 40, NOISE_PX, 17);
    // Corrupt one observation per track for a handful of tracks.
    for track in scene.tracks.iter_mut().take(4) {
        if let Some(p) = track.get_mut(&1) {
            *p += Vector2::new(0.05, -0.04);
        }
    }
    let initial = perturb(&scene.truth, 1, 0.5, 0.02, 18);

    let config = PipelineConfig::new()
        .with_simplification(None)
        .with_outlier_filter(Some(OutlierFilterConfig {
            max_error: 15.0 * NOISE_PX / FOCAL,
            min_inliers: 20,
        }));
    let mut context = config.solver_context();
    let result = run_pipeline(&scene.tracks, &initial, &config, &mut context).unwrap();

    assert_eq!(result.num_edges, 3);
    // Both edges touching view 1 lose at least their four corrupted matches.
    assert!(result.summary.num_correspondences <= 3 * 40 - 2 * 4);
    assert!(result.summary.num_correspondences >= 3 * 20);
    assert!(result.summary.final_cost <= result.summary.initial_cost);
}

#[test]
fn test_pipeline_drops_sparse_edges() {
    let scene = synthetic_scene(3, 12, NOISE_PX, 19);
    let mut tracks = scene.tracks.clone();
    // Views 0 and 2 share only 4 points after removing their observations.
    for track in tracks.iter_mut().skip(4) {
        track.remove(&2);
    }
    let initial = perturb(&scene.truth, 1, 0.5, 0.02, 20);
    let config = PipelineConfig::new().with_simplification(None);
    let mut context = config.solver_context();
    let result = run_pipeline(&tracks, &initial, &config, &mut context).unwrap();

    // Only the (0, 1) edge has enough correspondences left.
    assert_eq!(result.num_edges, 1);
    assert_eq!(result.summary.isolated_cameras, vec![2]);
    assert_eq!(result.poses[2], initial[2]);
}
