//! Cost simplification: bound the number of edges fed to the optimizer.
//!
//! Every "tracking" edge between views at most `s` indices apart is kept.
//! Among the remaining "loop-closing" edges, each source view keeps at most `k`,
//! preferring the ones with the most correspondences. Ties are broken by the
//! smaller destination view, which makes the result independent of insertion
//! order. The optimizer then sees O(views × (s + k)) edges.

use super::{CorrespondenceGraph, ViewPair};
use crate::epipolar::Correspondence;
use crate::geometry::ViewIndex;
use std::collections::BTreeMap;
use tracing::debug;

/// Parameters of [`simplify`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SimplificationConfig {
    /// Maximum loop-closing edges kept per source view (`k`).
    pub max_loop_edges_per_view: usize,
    /// Edges with `|a - b| <= tracking_window` are always kept (`s`).
    pub tracking_window: usize,
}

impl Default for SimplificationConfig {
    fn default() -> Self {
        Self {
            max_loop_edges_per_view: 5,
            tracking_window: 2,
        }
    }
}

impl SimplificationConfig {
    pub fn new(max_loop_edges_per_view: usize, tracking_window: usize) -> Self {
        Self {
            max_loop_edges_per_view,
            tracking_window,
        }
    }

    pub fn apply(&self, graph: CorrespondenceGraph) -> CorrespondenceGraph {
        simplify(graph, self.max_loop_edges_per_view, self.tracking_window)
    }
}

/// Keep all edges spanning at most `s` views and the `k` largest remaining
/// edges of every source view.
pub fn simplify(graph: CorrespondenceGraph, k: usize, s: usize) -> CorrespondenceGraph {
    let total = graph.num_edges();
    let mut kept: Vec<(ViewPair, Vec<Correspondence>)> = Vec::with_capacity(total);
    let mut loop_candidates: BTreeMap<ViewIndex, Vec<(ViewPair, Vec<Correspondence>)>> =
        BTreeMap::new();

    for (pair, correspondences) in graph.into_edges() {
        if pair.separation() <= s {
            kept.push((pair, correspondences));
        } else {
            loop_candidates
                .entry(pair.source())
                .or_default()
                .push((pair, correspondences));
        }
    }

    let tracking = kept.len();
    for (_, mut candidates) in loop_candidates {
        candidates.sort_by(|(pa, ca), (pb, cb)| {
            cb.len()
                .cmp(&ca.len())
                .then_with(|| pa.destination().cmp(&pb.destination()))
        });
        kept.extend(candidates.into_iter().take(k));
    }

    debug!(
        "simplified {total} edges to {} ({tracking} tracking, {} loop-closing)",
        kept.len(),
        kept.len() - tracking
    );
    kept.into_iter().collect()
}
