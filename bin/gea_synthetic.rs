use std::time::Instant;

use clap::Parser;
use gea_solver::geometry::{CameraPose, Quaternion};
use gea_solver::graph::{PointTrack, SimplificationConfig};
use gea_solver::linalg::LinearSolverType;
use gea_solver::optimizer::GeaConfig;
use gea_solver::pipeline::{PipelineConfig, run_pipeline};
use gea_solver::reduced::{DecompositionMethod, ReducedMatrixConfig};
use gea_solver::{GeaError, init_logger};
use nalgebra::{Point2, Point3, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

#[derive(Parser)]
#[command(name = "gea_synthetic")]
#[command(about = "Run global epipolar adjustment on a synthetic scene")]
struct Args {
    /// Number of cameras along the trajectory
    #[arg(long, default_value = "8")]
    views: usize,

    /// Number of 3D points in the scene
    #[arg(long, default_value = "200")]
    points: usize,

    /// Gaussian pixel noise added to every observation
    #[arg(long, default_value = "0.5")]
    noise: f64,

    /// Focal length in pixels used to convert the noise
    #[arg(long, default_value = "500.0")]
    focal: f64,

    /// Rotation perturbation of the initial poses in degrees
    #[arg(long, default_value = "1.0")]
    rotation_perturbation: f64,

    /// Center perturbation of the initial poses
    #[arg(long, default_value = "0.05")]
    translation_perturbation: f64,

    /// Random seed
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Linear solver: "cholesky", "dense", or "cg"
    #[arg(long, default_value = "cholesky")]
    solver: String,

    /// Reduced matrix decomposition: "none", "cholesky", or "eigen"
    #[arg(long, default_value = "cholesky")]
    decomposition: String,

    /// Maximum number of optimization iterations
    #[arg(short, long, default_value = "20")]
    max_iterations: usize,

    /// Only optimize the last N cameras
    #[arg(long)]
    window: Option<usize>,

    /// Loop-closing edges kept per view (0 disables simplification)
    #[arg(long, default_value = "5")]
    loop_edges: usize,

    /// Views apart that are always connected
    #[arg(long, default_value = "2")]
    tracking_window: usize,

    /// Log every iteration
    #[arg(short, long)]
    verbose: bool,
}

struct Scene {
    truth: Vec<CameraPose>,
    initial: Vec<CameraPose>,
    tracks: Vec<PointTrack>,
}

fn parse_solver(name: &str) -> Result<LinearSolverType, GeaError> {
    match name {
        "cholesky" => Ok(LinearSolverType::SparseCholesky),
        "dense" => Ok(LinearSolverType::DenseCholesky),
        "cg" => Ok(LinearSolverType::ConjugateGradient),
        other => Err(GeaError::InvalidInput(format!("unknown solver '{other}'"))),
    }
}

fn parse_decomposition(name: &str) -> Result<DecompositionMethod, GeaError> {
    match name {
        "none" => Ok(DecompositionMethod::None),
        "cholesky" => Ok(DecompositionMethod::Cholesky),
        "eigen" => Ok(DecompositionMethod::Eigen),
        other => Err(GeaError::InvalidInput(format!(
            "unknown decomposition '{other}'"
        ))),
    }
}

fn gaussian(rng: &mut StdRng, std_dev: f64) -> f64 {
    let u1: f64 = rng.random::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.random();
    std_dev * (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

fn random_unit_vector(rng: &mut StdRng) -> Vector3<f64> {
    loop {
        let v = Vector3::new(
            rng.random_range(-1.0..1.0),
            rng.random_range(-1.0..1.0),
            rng.random_range(-1.0..1.0),
        );
        let norm = v.norm();
        if norm > 1e-3 && norm <= 1.0 {
            return v / norm;
        }
    }
}

/// Cameras on a gently curving path, all looking down +z at a slab of points.
fn generate_scene(args: &Args, rng: &mut StdRng) -> Result<Scene, GeaError> {
    let mut truth = Vec::with_capacity(args.views);
    for i in 0..args.views {
        let s = i as f64;
        let orientation = Quaternion::from_scaled_axis(&Vector3::new(
            0.03 * (0.7 * s).sin(),
            -0.05 * s / args.views.max(1) as f64,
            0.02 * (0.3 * s).cos(),
        ))?;
        let center = Point3::new(0.5 * s, 0.15 * (0.9 * s).sin(), 0.05 * (0.4 * s).cos());
        truth.push(CameraPose::new(orientation, center));
    }

    let extent = 0.5 * args.views as f64;
    let pixel_noise = args.noise / args.focal;
    let mut tracks = Vec::with_capacity(args.points);
    for _ in 0..args.points {
        let point = Point3::new(
            rng.random_range(-1.5..extent + 1.5),
            rng.random_range(-1.5..1.5),
            rng.random_range(5.0..8.0),
        );
        let mut track = PointTrack::new();
        for (view, pose) in truth.iter().enumerate() {
            let Ok(projected) = pose.project(&point) else {
                continue;
            };
            if projected.x.abs() > 0.6 || projected.y.abs() > 0.45 {
                continue;
            }
            track.insert(
                view,
                Point2::new(
                    projected.x + gaussian(rng, pixel_noise),
                    projected.y + gaussian(rng, pixel_noise),
                ),
            );
        }
        if track.len() >= 2 {
            tracks.push(track);
        }
    }

    let angle = args.rotation_perturbation.to_radians();
    let mut initial = truth.clone();
    for pose in initial.iter_mut().skip(1) {
        let rotation = Quaternion::from_axis_angle(&random_unit_vector(rng), angle)?;
        pose.orientation = rotation.multiply(&pose.orientation)?;
        pose.center += random_unit_vector(rng) * args.translation_perturbation;
    }

    Ok(Scene {
        truth,
        initial,
        tracks,
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logger();

    println!("=== GEA SYNTHETIC SCENE ===");
    let mut rng = StdRng::seed_from_u64(args.seed);
    let start = Instant::now();
    let scene = generate_scene(&args, &mut rng)?;
    info!(
        "generated {} views, {} tracks in {:?}",
        scene.truth.len(),
        scene.tracks.len(),
        start.elapsed()
    );

    let simplification = (args.loop_edges > 0)
        .then(|| SimplificationConfig::new(args.loop_edges, args.tracking_window));
    let config = PipelineConfig::new()
        .with_simplification(simplification)
        .with_reduced(
            ReducedMatrixConfig::new().with_decomposition(parse_decomposition(&args.decomposition)?),
        )
        .with_optimizer(
            GeaConfig::new()
                .with_max_iterations(args.max_iterations)
                .with_verbose(args.verbose),
        )
        .with_window(args.window)
        .with_linear_solver(parse_solver(&args.solver)?, 100);

    let mut context = config.solver_context();
    let result = run_pipeline(&scene.tracks, &scene.initial, &config, &mut context)?;

    println!("{result}");

    let (before, after): (f64, f64) = scene
        .truth
        .iter()
        .zip(scene.initial.iter().zip(&result.poses))
        .map(|(truth, (initial, refined))| {
            (
                truth.orientation.angle_to(&initial.orientation),
                truth.orientation.angle_to(&refined.orientation),
            )
        })
        .fold((0.0, 0.0), |(a, b), (x, y)| (a.max(x), b.max(y)));
    println!(
        "Max rotation error:        {:.4}° -> {:.4}°",
        before.to_degrees(),
        after.to_degrees()
    );
    println!(
        "Reprojection RMS (px):     {:.4} -> {:.4}",
        result.reprojection_before.rms * args.focal,
        result.reprojection_after.rms * args.focal
    );
    println!("Solver:                    {:?}", context);
    Ok(())
}
