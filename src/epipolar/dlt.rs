//! Closed-form accumulation of the 9×9 "squared DLT" matrix.
//!
//! For a correspondence `(x, y) → (x', y')` the DLT row is
//!
//! ```text
//! a = [x x', y x', x', x y', y y', y', x, y, 1]
//! ```
//!
//! so that `aᵀ f = p'ᵀ F p` with `f` the row-major vectorization of `F`. The
//! squared DLT matrix is `Σ aᵢ aᵢᵀ`. It is accumulated one correspondence at a
//! time over the 45 unique entries of the upper triangle, so neither the
//! `n × 9` design matrix nor any per-correspondence storage is ever built.

use super::Correspondence;
use crate::error::{GeaError, GeaResult};
use nalgebra::{Matrix3, Point2, SMatrix, SVector, Vector2};

pub type Matrix9 = SMatrix<f64, 9, 9>;
pub type Vector9 = SVector<f64, 9>;

/// Mean distances below this value mean all points coincide.
const MIN_MEAN_DISTANCE: f64 = 1e-12;

/// Similarity moving a point set's centroid to the origin and scaling it to a
/// mean distance of √2 from the origin.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NormalizationTransform {
    pub centroid: Vector2<f64>,
    pub scale: f64,
}

impl Default for NormalizationTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl NormalizationTransform {
    pub fn identity() -> Self {
        Self {
            centroid: Vector2::zeros(),
            scale: 1.0,
        }
    }

    /// Hartley normalization of a point set.
    pub fn from_points<'a, I>(points: I) -> GeaResult<Self>
    where
        I: IntoIterator<Item = &'a Point2<f64>>,
        I::IntoIter: Clone,
    {
        let points = points.into_iter();
        let mut count = 0usize;
        let mut sum = Vector2::zeros();
        for p in points.clone() {
            sum += p.coords;
            count += 1;
        }
        if count == 0 {
            return Err(GeaError::DegenerateInput(
                "cannot normalize an empty point set".to_string(),
            ));
        }
        let centroid = sum / count as f64;
        let total_distance: f64 = points.map(|p| (p.coords - centroid).norm()).sum();
        let mean_distance = total_distance / count as f64;
        if !mean_distance.is_finite() {
            return Err(GeaError::NumericDivergence(
                "non-finite image coordinates".to_string(),
            ));
        }
        if mean_distance < MIN_MEAN_DISTANCE {
            return Err(GeaError::DegenerateInput(format!(
                "all {count} points coincide"
            )));
        }
        Ok(Self {
            centroid,
            scale: std::f64::consts::SQRT_2 / mean_distance,
        })
    }

    #[inline]
    pub fn apply(&self, p: &Point2<f64>) -> Point2<f64> {
        Point2::from((p.coords - self.centroid) * self.scale)
    }

    /// Homogeneous form `[[s, 0, -s cx], [0, s, -s cy], [0, 0, 1]]`.
    pub fn matrix(&self) -> Matrix3<f64> {
        let s = self.scale;
        Matrix3::new(
            s,
            0.0,
            -s * self.centroid.x,
            0.0,
            s,
            -s * self.centroid.y,
            0.0,
            0.0,
            1.0,
        )
    }
}

/// DLT row of a single correspondence.
#[inline]
pub fn dlt_row(source: &Point2<f64>, destination: &Point2<f64>) -> Vector9 {
    let (x, y) = (source.x, source.y);
    let (xp, yp) = (destination.x, destination.y);
    Vector9::from_column_slice(&[x * xp, y * xp, xp, x * yp, y * yp, yp, x, y, 1.0])
}

/// Running sum of `w aᵢ aᵢᵀ` over correspondences, upper triangle only.
#[derive(Clone, Debug)]
pub struct SquaredDltAccumulator {
    upper: [f64; 45],
    count: usize,
}

impl Default for SquaredDltAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl SquaredDltAccumulator {
    pub fn new() -> Self {
        Self {
            upper: [0.0; 45],
            count: 0,
        }
    }

    /// Add one correspondence with weight `weight`.
    pub fn add(&mut self, source: &Point2<f64>, destination: &Point2<f64>, weight: f64) {
        let a = dlt_row(source, destination);
        let mut k = 0;
        for i in 0..9 {
            let wa = weight * a[i];
            for j in i..9 {
                self.upper[k] += wa * a[j];
                k += 1;
            }
        }
        self.count += 1;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Full symmetric 9×9 matrix.
    pub fn matrix(&self) -> Matrix9 {
        let mut m = Matrix9::zeros();
        let mut k = 0;
        for i in 0..9 {
            for j in i..9 {
                m[(i, j)] = self.upper[k];
                m[(j, i)] = self.upper[k];
                k += 1;
            }
        }
        m
    }
}

/// Squared DLT matrix of `correspondences` after applying `source_transform`
/// and `destination_transform` to the respective points.
///
/// With `normalize_rows`, each row is scaled by
/// `1 / sqrt((x² + y² + 1)(x'² + y'² + 1))`, i.e. the algebraic residual is
/// divided by the norms of both homogeneous points.
pub fn squared_dlt_matrix(
    correspondences: &[Correspondence],
    source_transform: &NormalizationTransform,
    destination_transform: &NormalizationTransform,
    normalize_rows: bool,
) -> Matrix9 {
    let mut accumulator = SquaredDltAccumulator::new();
    for c in correspondences {
        let p = source_transform.apply(&c.source);
        let q = destination_transform.apply(&c.destination);
        let weight = if normalize_rows {
            1.0 / ((p.coords.norm_squared() + 1.0) * (q.coords.norm_squared() + 1.0))
        } else {
            1.0
        };
        accumulator.add(&p, &q, weight);
    }
    accumulator.matrix()
}
