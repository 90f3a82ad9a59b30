//! Pose-graph optimization driven by pairwise epipolar constraints.
//!
//! This module provides:
//! - [`GlobalEpipolarAdjustment`]: Levenberg-Marquardt over camera poses only,
//!   with fixed-camera and windowed (incremental) modes
//! - [`linearization`]: the essential matrix of a camera pair and its analytic
//!   Jacobians
//! - [`GeaConfig`], [`GeaSummary`] and [`OptimizationStatus`] for control and
//!   diagnostics

use std::fmt;
use std::time::Duration;

use crate::geometry::ViewIndex;

pub mod gea;
pub mod linearization;

pub use gea::{
    FreeCameras, GlobalEpipolarAdjustment, NormalEquations, POSE_DOF, assemble_normal_equations,
    total_cost,
};
pub use linearization::{essential_matrix, essential_vector, linearize_edge};

/// How an optimization call ended.
#[derive(Debug, Clone, PartialEq)]
pub enum OptimizationStatus {
    /// Relative cost change dropped below the tolerance
    Converged,
    /// Iteration budget exhausted
    MaxIterationsReached,
    /// Too many consecutive rejected steps
    TooManyRejections,
    /// NaN or Inf appeared; poses hold the last accepted state
    NumericDivergence(String),
    /// Every camera is fixed or isolated
    NoFreeCameras,
}

impl OptimizationStatus {
    /// True when the optimizer terminated normally.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            OptimizationStatus::Converged | OptimizationStatus::MaxIterationsReached
        )
    }
}

impl fmt::Display for OptimizationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizationStatus::Converged => write!(f, "Converged"),
            OptimizationStatus::MaxIterationsReached => write!(f, "Maximum iterations reached"),
            OptimizationStatus::TooManyRejections => write!(f, "Too many rejected steps"),
            OptimizationStatus::NumericDivergence(msg) => write!(f, "Numeric divergence: {msg}"),
            OptimizationStatus::NoFreeCameras => write!(f, "No free cameras"),
        }
    }
}

/// Configuration of the Levenberg-Marquardt loop.
#[derive(Debug, Clone, PartialEq)]
pub struct GeaConfig {
    pub max_iterations: usize,
    pub initial_lambda: f64,
    pub lambda_min: f64,
    pub lambda_max: f64,
    pub lambda_increase_factor: f64,
    pub lambda_decrease_factor: f64,
    /// Damp with `λ·trace(H)/dim` instead of `λ·diag(H)`
    pub adaptive_lambda: bool,
    /// Relative cost change below which the loop stops
    pub cost_tolerance: f64,
    pub max_consecutive_rejects: usize,
    /// Log per-iteration progress at `info` instead of `debug`
    pub verbose: bool,
}

impl Default for GeaConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            initial_lambda: 1e-3,
            lambda_min: 1e-12,
            lambda_max: 1e12,
            lambda_increase_factor: 10.0,
            lambda_decrease_factor: 0.1,
            adaptive_lambda: false,
            cost_tolerance: 1e-10,
            max_consecutive_rejects: 10,
            verbose: false,
        }
    }
}

impl GeaConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_initial_lambda(mut self, lambda: f64) -> Self {
        self.initial_lambda = lambda;
        self
    }

    pub fn with_lambda_bounds(mut self, min: f64, max: f64) -> Self {
        self.lambda_min = min;
        self.lambda_max = max;
        self
    }

    pub fn with_lambda_factors(mut self, increase: f64, decrease: f64) -> Self {
        self.lambda_increase_factor = increase;
        self.lambda_decrease_factor = decrease;
        self
    }

    pub fn with_adaptive_lambda(mut self, adaptive: bool) -> Self {
        self.adaptive_lambda = adaptive;
        self
    }

    pub fn with_cost_tolerance(mut self, tolerance: f64) -> Self {
        self.cost_tolerance = tolerance;
        self
    }

    pub fn with_max_consecutive_rejects(mut self, rejects: usize) -> Self {
        self.max_consecutive_rejects = rejects;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

/// One iteration of the loop.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationRecord {
    pub iteration: usize,
    /// Cost after the iteration (unchanged when rejected)
    pub cost: f64,
    /// Damping used for the step
    pub lambda: f64,
    pub accepted: bool,
    pub step_norm: f64,
    pub evaluation_time: Duration,
    pub solve_time: Duration,
}

/// Diagnostics of one optimization call.
#[derive(Debug, Clone)]
pub struct GeaSummary {
    pub status: OptimizationStatus,
    pub initial_cost: f64,
    pub final_cost: f64,
    /// `sqrt(cost / correspondences)` before the first step
    pub initial_rms: f64,
    pub final_rms: f64,
    pub iterations: usize,
    pub successful_steps: usize,
    pub unsuccessful_steps: usize,
    pub final_lambda: f64,
    pub num_free_cameras: usize,
    /// Free cameras without any edge, left unmodified
    pub isolated_cameras: Vec<ViewIndex>,
    pub num_edges: usize,
    pub num_correspondences: usize,
    pub evaluation_time: Duration,
    pub solve_time: Duration,
    pub total_time: Duration,
    pub history: Vec<IterationRecord>,
}

impl GeaSummary {
    pub(crate) fn new(num_edges: usize, num_correspondences: usize) -> Self {
        Self {
            status: OptimizationStatus::MaxIterationsReached,
            initial_cost: 0.0,
            final_cost: 0.0,
            initial_rms: 0.0,
            final_rms: 0.0,
            iterations: 0,
            successful_steps: 0,
            unsuccessful_steps: 0,
            final_lambda: 0.0,
            num_free_cameras: 0,
            isolated_cameras: Vec::new(),
            num_edges,
            num_correspondences,
            evaluation_time: Duration::ZERO,
            solve_time: Duration::ZERO,
            total_time: Duration::ZERO,
            history: Vec::new(),
        }
    }
}

impl fmt::Display for GeaSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Global Epipolar Adjustment Summary ===")?;
        writeln!(f, "Status:                    {}", self.status)?;
        writeln!(f, "Free cameras:              {}", self.num_free_cameras)?;
        if !self.isolated_cameras.is_empty() {
            writeln!(f, "Isolated cameras:          {:?}", self.isolated_cameras)?;
        }
        writeln!(
            f,
            "Edges / correspondences:   {} / {}",
            self.num_edges, self.num_correspondences
        )?;
        writeln!(f, "Initial cost:              {:.6e}", self.initial_cost)?;
        writeln!(f, "Final cost:                {:.6e}", self.final_cost)?;
        writeln!(
            f,
            "Cost reduction:            {:.6e} ({:.2}%)",
            self.initial_cost - self.final_cost,
            100.0 * (self.initial_cost - self.final_cost) / self.initial_cost.max(1e-12)
        )?;
        writeln!(f, "Initial RMS:               {:.6e}", self.initial_rms)?;
        writeln!(f, "Final RMS:                 {:.6e}", self.final_rms)?;
        writeln!(f, "Total iterations:          {}", self.iterations)?;
        writeln!(
            f,
            "Successful steps:          {} ({:.1}%)",
            self.successful_steps,
            100.0 * self.successful_steps as f64 / self.iterations.max(1) as f64
        )?;
        writeln!(
            f,
            "Unsuccessful steps:        {} ({:.1}%)",
            self.unsuccessful_steps,
            100.0 * self.unsuccessful_steps as f64 / self.iterations.max(1) as f64
        )?;
        writeln!(f, "Final lambda:              {:.6e}", self.final_lambda)?;
        writeln!(f, "Evaluation time:           {:?}", self.evaluation_time)?;
        writeln!(f, "Solve time:                {:?}", self.solve_time)?;
        writeln!(f, "Total time:                {:?}", self.total_time)?;

        if !self.history.is_empty() {
            writeln!(f)?;
            writeln!(
                f,
                "{:>5}  {:>14}  {:>10}  {:>8}  {:>10}  {:>12}  {:>12}",
                "iter", "cost", "lambda", "accepted", "|step|", "eval", "solve"
            )?;
            for record in &self.history {
                writeln!(
                    f,
                    "{:>5}  {:>14.6e}  {:>10.2e}  {:>8}  {:>10.2e}  {:>12?}  {:>12?}",
                    record.iteration,
                    record.cost,
                    record.lambda,
                    if record.accepted { "yes" } else { "no" },
                    record.step_norm,
                    record.evaluation_time,
                    record.solve_time
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = GeaConfig::new()
            .with_max_iterations(5)
            .with_initial_lambda(1e-2)
            .with_lambda_bounds(1e-6, 1e6)
            .with_lambda_factors(4.0, 0.5)
            .with_adaptive_lambda(true)
            .with_cost_tolerance(1e-6)
            .with_max_consecutive_rejects(3)
            .with_verbose(true);
        assert_eq!(config.max_iterations, 5);
        assert_eq!(config.initial_lambda, 1e-2);
        assert_eq!((config.lambda_min, config.lambda_max), (1e-6, 1e6));
        assert_eq!(config.lambda_increase_factor, 4.0);
        assert_eq!(config.lambda_decrease_factor, 0.5);
        assert!(config.adaptive_lambda);
        assert_eq!(config.max_consecutive_rejects, 3);
        assert!(config.verbose);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(OptimizationStatus::Converged.to_string(), "Converged");
        assert_eq!(
            OptimizationStatus::NumericDivergence("cost is NaN".into()).to_string(),
            "Numeric divergence: cost is NaN"
        );
        assert!(OptimizationStatus::MaxIterationsReached.is_success());
        assert!(!OptimizationStatus::TooManyRejections.is_success());
    }

    #[test]
    fn test_summary_display_contains_history() {
        let mut summary = GeaSummary::new(3, 60);
        summary.status = OptimizationStatus::Converged;
        summary.iterations = 1;
        summary.history.push(IterationRecord {
            iteration: 0,
            cost: 1.5,
            lambda: 1e-3,
            accepted: true,
            step_norm: 0.1,
            evaluation_time: Duration::from_micros(10),
            solve_time: Duration::from_micros(5),
        });
        let text = summary.to_string();
        assert!(text.contains("Global Epipolar Adjustment Summary"));
        assert!(text.contains("Converged"));
        assert!(text.contains("3 / 60"));
        assert!(text.contains("yes"));
    }
}
