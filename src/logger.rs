//! Logging setup for gea-solver executables
//!
//! The library itself only emits `tracing` events; installing a subscriber is
//! left to executables, which call one of the functions below once at startup.

use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::SystemTime;

/// Targets enabled by default: the library and the bundled binary.
const LOG_TARGETS: [&str; 2] = ["gea_solver", "gea_synthetic"];

/// Filter directives enabling `level` for the crate's own targets only.
fn default_directives(level: Level) -> String {
    let level = level.as_str().to_ascii_lowercase();
    LOG_TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Install a subscriber logging the crate's targets at INFO.
///
/// `RUST_LOG`, when set, replaces the default filter:
/// ```bash
/// RUST_LOG=gea_solver::optimizer=debug cargo run --bin gea_synthetic
/// ```
pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Install a subscriber logging the crate's targets at `default_level`.
///
/// Only the first call installs a subscriber; later calls are no-ops.
pub fn init_logger_with_level(default_level: Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(default_level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(SystemTime)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .try_init()
        .ok();
}
