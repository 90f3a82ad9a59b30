//! Pairwise correspondence graph.
//!
//! Nodes are views (indices into the caller's pose array) and each edge, keyed
//! by the canonically ordered pair `source < destination`, holds the 2D-2D
//! correspondences shared by the two views. Edges are kept in a `BTreeMap`, so
//! every traversal visits them in the same order.

use crate::epipolar::Correspondence;
use crate::error::{GeaError, GeaResult};
use crate::geometry::ViewIndex;
use nalgebra::Point2;
use std::collections::BTreeMap;

pub mod simplify;

pub use simplify::{SimplificationConfig, simplify};

/// Observations of one 3D point: view index → normalized image coordinates.
pub type PointTrack = BTreeMap<ViewIndex, Point2<f64>>;

/// Canonically ordered pair of distinct views.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ViewPair {
    source: ViewIndex,
    destination: ViewIndex,
}

impl ViewPair {
    /// Order the two views; fails if they are equal.
    pub fn new(a: ViewIndex, b: ViewIndex) -> GeaResult<Self> {
        match a.cmp(&b) {
            std::cmp::Ordering::Less => Ok(Self {
                source: a,
                destination: b,
            }),
            std::cmp::Ordering::Greater => Ok(Self {
                source: b,
                destination: a,
            }),
            std::cmp::Ordering::Equal => Err(GeaError::InvalidInput(format!(
                "view {a} cannot be paired with itself"
            ))),
        }
    }

    #[inline]
    pub fn source(&self) -> ViewIndex {
        self.source
    }

    #[inline]
    pub fn destination(&self) -> ViewIndex {
        self.destination
    }

    /// Index distance `destination - source`.
    #[inline]
    pub fn separation(&self) -> usize {
        self.destination - self.source
    }
}

/// Correspondences grouped by view pair.
#[derive(Clone, Debug, Default)]
pub struct CorrespondenceGraph {
    edges: BTreeMap<ViewPair, Vec<Correspondence>>,
}

impl CorrespondenceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph from per-point visibility and drop edges with fewer
    /// than `min_correspondences` correspondences.
    pub fn from_tracks(tracks: &[PointTrack], min_correspondences: usize) -> Self {
        let mut graph = Self::new();
        for track in tracks {
            graph.add_track(track);
        }
        graph.prune(min_correspondences);
        graph
    }

    /// Add one correspondence per pair of views observing the point.
    pub fn add_track(&mut self, track: &PointTrack) {
        let observations: Vec<(ViewIndex, &Point2<f64>)> =
            track.iter().map(|(&view, point)| (view, point)).collect();
        // Keys are sorted and unique, so every (i, j) below has view_i < view_j.
        for (i, &(view_a, point_a)) in observations.iter().enumerate() {
            for &(view_b, point_b) in &observations[i + 1..] {
                self.edges
                    .entry(ViewPair {
                        source: view_a,
                        destination: view_b,
                    })
                    .or_default()
                    .push(Correspondence::new(*point_a, *point_b));
            }
        }
    }

    /// Add a correspondence observed as `point_a` in `view_a` and `point_b` in
    /// `view_b`, in any view order.
    pub fn add_correspondence(
        &mut self,
        view_a: ViewIndex,
        point_a: Point2<f64>,
        view_b: ViewIndex,
        point_b: Point2<f64>,
    ) -> GeaResult<()> {
        let pair = ViewPair::new(view_a, view_b)?;
        let correspondence = if pair.source() == view_a {
            Correspondence::new(point_a, point_b)
        } else {
            Correspondence::new(point_b, point_a)
        };
        self.edges.entry(pair).or_default().push(correspondence);
        Ok(())
    }

    /// Insert or replace a whole edge.
    pub fn insert_edge(&mut self, pair: ViewPair, correspondences: Vec<Correspondence>) {
        self.edges.insert(pair, correspondences);
    }

    /// Remove edges with fewer than `min_correspondences` correspondences.
    pub fn prune(&mut self, min_correspondences: usize) {
        self.edges
            .retain(|_, correspondences| correspondences.len() >= min_correspondences);
    }

    pub fn edge(&self, pair: &ViewPair) -> Option<&[Correspondence]> {
        self.edges.get(pair).map(Vec::as_slice)
    }

    pub fn contains(&self, pair: &ViewPair) -> bool {
        self.edges.contains_key(pair)
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn num_correspondences(&self) -> usize {
        self.edges.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Largest view index referenced by any edge.
    pub fn max_view(&self) -> Option<ViewIndex> {
        self.edges.keys().map(ViewPair::destination).max()
    }

    /// Edges in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = (&ViewPair, &Vec<Correspondence>)> {
        self.edges.iter()
    }

    pub fn pairs(&self) -> impl Iterator<Item = &ViewPair> {
        self.edges.keys()
    }

    pub fn into_edges(self) -> BTreeMap<ViewPair, Vec<Correspondence>> {
        self.edges
    }
}

impl FromIterator<(ViewPair, Vec<Correspondence>)> for CorrespondenceGraph {
    fn from_iter<T: IntoIterator<Item = (ViewPair, Vec<Correspondence>)>>(iter: T) -> Self {
        Self {
            edges: iter.into_iter().collect(),
        }
    }
}
