//! Linear triangulation and reprojection error, used to judge refined poses.

use nalgebra::{Matrix4, Point3, RowVector4, SymmetricEigen};

use crate::error::{GeaError, GeaResult};
use crate::geometry::CameraPose;
use crate::graph::PointTrack;

/// Homogeneous weights below this put the point at infinity.
const MIN_HOMOGENEOUS_WEIGHT: f64 = 1e-12;

/// Triangulate one track from the current poses by linear DLT.
///
/// Each observation `(x, y)` in view `v` contributes the rows
/// `x P₃ - P₁` and `y P₃ - P₂` of `P_v = [R | -R c]`; the point is the
/// eigenvector of `AᵀA` with the smallest eigenvalue.
pub fn triangulate_track(poses: &[CameraPose], track: &PointTrack) -> GeaResult<Point3<f64>> {
    if track.len() < 2 {
        return Err(GeaError::DegenerateInput(format!(
            "track seen in {} view(s), at least 2 required",
            track.len()
        )));
    }

    let mut normal = Matrix4::zeros();
    for (&view, observation) in track {
        let pose = poses.get(view).ok_or_else(|| {
            GeaError::InvalidInput(format!("track references view {view} of {}", poses.len()))
        })?;
        let projection = pose.to_projection_matrix();
        let p1: RowVector4<f64> = projection.row(0).into_owned();
        let p2: RowVector4<f64> = projection.row(1).into_owned();
        let p3: RowVector4<f64> = projection.row(2).into_owned();
        for row in [p3 * observation.x - p1, p3 * observation.y - p2] {
            normal += row.transpose() * row;
        }
    }

    let eigen = SymmetricEigen::new(normal);
    let (smallest, _) = eigen
        .eigenvalues
        .iter()
        .enumerate()
        .fold((0, f64::INFINITY), |best, (i, &v)| if v < best.1 { (i, v) } else { best });
    let x = eigen.eigenvectors.column(smallest);
    if !x.iter().all(|v| v.is_finite()) || x[3].abs() < MIN_HOMOGENEOUS_WEIGHT {
        return Err(GeaError::DegenerateInput(
            "triangulated point lies at infinity".to_string(),
        ));
    }
    Ok(Point3::new(x[0] / x[3], x[1] / x[3], x[2] / x[3]))
}

/// Reprojection statistics over a set of tracks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReprojectionError {
    /// RMS error per image coordinate
    pub rms: f64,
    pub num_points: usize,
    pub num_observations: usize,
    /// Tracks that could not be triangulated or projected
    pub failed_tracks: usize,
}

/// Triangulate every track and measure its reprojection error.
///
/// Returns the triangulated points (`None` for failed tracks) and the error
/// statistics over the successful ones.
pub fn reprojection_error(
    poses: &[CameraPose],
    tracks: &[PointTrack],
) -> GeaResult<(Vec<Option<Point3<f64>>>, ReprojectionError)> {
    let mut points = Vec::with_capacity(tracks.len());
    let mut stats = ReprojectionError::default();
    let mut squared_sum = 0.0;

    for track in tracks {
        let point = match triangulate_track(poses, track) {
            Ok(point) => point,
            Err(GeaError::DegenerateInput(_)) => {
                stats.failed_tracks += 1;
                points.push(None);
                continue;
            }
            Err(err) => return Err(err),
        };

        let mut track_sum = 0.0;
        let mut projected_all = true;
        for (&view, observation) in track {
            match poses[view].project(&point) {
                Ok(projected) => track_sum += (projected - observation).norm_squared(),
                Err(_) => {
                    projected_all = false;
                    break;
                }
            }
        }
        if !projected_all {
            stats.failed_tracks += 1;
            points.push(None);
            continue;
        }

        squared_sum += track_sum;
        stats.num_points += 1;
        stats.num_observations += track.len();
        points.push(Some(point));
    }

    if stats.num_observations > 0 {
        stats.rms = (squared_sum / (2 * stats.num_observations) as f64).sqrt();
    }
    Ok((points, stats))
}
