//! Global Epipolar Adjustment: pose-graph refinement of camera poses from
//! pairwise 2D-2D correspondences, without estimating 3D structure.
//!
//! Data flows through the modules in order:
//! - [`geometry`]: unit quaternions and camera poses
//! - [`epipolar`]: normalized 8-point fundamental matrix and outlier refinement
//! - [`graph`]: correspondence graph and its simplification
//! - [`reduced`]: 9×9 per-edge summaries of the epipolar cost
//! - [`linalg`]: block-sparse matrices and linear solvers
//! - [`optimizer`]: Levenberg-Marquardt over the camera poses
//! - [`triangulation`] and [`pipeline`]: diagnostics and the end-to-end driver

pub mod epipolar;
pub mod error;
pub mod geometry;
pub mod graph;
pub mod linalg;
pub mod logger;
pub mod optimizer;
pub mod pipeline;
pub mod reduced;
pub mod triangulation;

pub use error::{GeaError, GeaResult};
pub use logger::{init_logger, init_logger_with_level};
