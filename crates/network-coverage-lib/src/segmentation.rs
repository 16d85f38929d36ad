//! Segment generation strategies
//!
//! Segments are a derived cache: a branch whose segments cannot be generated is logged
//! and left without segments, the other branches are unaffected.

use crate::coverage::{LocationIndex, SegmentCache};
use crate::{
    Branch, BranchId, Locatable, Network, NetworkCoverage, NetworkLocation, NetworkSegment,
    NodeId, Result, SegmentGenerationMethod, utils,
};
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

/// Distinct chainages of the locations on a branch, ascending and within its bounds
fn branch_chainages(coverage: &NetworkCoverage, index: &LocationIndex, branch: &Branch) -> Vec<f64> {
    let mut chainages: Vec<f64> = index
        .get(&branch.id())
        .map(|positions| {
            positions
                .iter()
                .map(|&position| branch.snap_chainage(coverage.locations[position].chainage()))
                .collect()
        })
        .unwrap_or_default();
    chainages.dedup_by(|a, b| (*a - *b).abs() < utils::CHAINAGE_EPSILON);
    chainages
}

/// One segment around each chainage, bounded by the midpoints to its neighbours
pub(crate) fn segments_per_location(
    network: &Network,
    branch: &Branch,
    chainages: &[f64],
) -> Result<Vec<NetworkSegment>> {
    let count = chainages.len();
    let mut segments = Vec::with_capacity(count);
    for (i, chainage) in chainages.iter().enumerate() {
        let start = if i == 0 {
            0.0
        } else {
            (chainages[i - 1] + chainage) / 2.0
        };
        let end = if i + 1 == count {
            branch.length()
        } else {
            (chainage + chainages[i + 1]) / 2.0
        };
        segments.push(NetworkSegment::between(network, branch.id(), start, end)?);
    }
    Ok(segments)
}

/// One segment between each pair of consecutive chainages
pub(crate) fn segments_between_locations(
    network: &Network,
    branch: &Branch,
    chainages: &[f64],
) -> Result<Vec<NetworkSegment>> {
    chainages
        .windows(2)
        .map(|pair| NetworkSegment::between(network, branch.id(), pair[0], pair[1]))
        .collect()
}

/// Segments between consecutive chainages, extended to cover the whole branch
pub(crate) fn segments_fully_covered(
    network: &Network,
    branch: &Branch,
    chainages: &[f64],
) -> Result<Vec<NetworkSegment>> {
    let length = branch.length();
    let mut bounds = Vec::with_capacity(chainages.len() + 2);
    if chainages
        .first()
        .is_none_or(|first| *first > utils::FULL_COVERAGE_EPSILON)
    {
        bounds.push(0.0);
    }
    bounds.extend_from_slice(chainages);
    if bounds
        .last()
        .is_some_and(|last| *last < length - utils::FULL_COVERAGE_EPSILON)
    {
        bounds.push(length);
    }
    segments_between_locations(network, branch, &bounds)
}

/// Segments of one branch for a per-branch method
fn branch_segments(
    network: &Network,
    branch: &Branch,
    chainages: &[f64],
    method: SegmentGenerationMethod,
) -> Result<Vec<NetworkSegment>> {
    match method {
        SegmentGenerationMethod::SegmentPerLocation => {
            segments_per_location(network, branch, chainages)
        }
        SegmentGenerationMethod::SegmentBetweenLocations => {
            segments_between_locations(network, branch, chainages)
        }
        SegmentGenerationMethod::SegmentBetweenLocationsFullyCovered => {
            segments_fully_covered(network, branch, chainages)
        }
        SegmentGenerationMethod::None | SegmentGenerationMethod::RouteBetweenLocations => {
            Ok(Vec::new())
        }
    }
}

/// Chainage of a node end of a branch
#[inline]
fn end_chainage(branch: &Branch, node: NodeId) -> f64 {
    if node == branch.source() {
        0.0
    } else {
        branch.length()
    }
}

/// Segments of the shortest route from `from` to `to`
///
/// Locations on the same branch are joined directly. Otherwise every combination of
/// end nodes is tried and the cheapest connected one wins.
pub(crate) fn route_segments(
    network: &Network,
    from: &NetworkLocation,
    to: &NetworkLocation,
) -> Result<Vec<NetworkSegment>> {
    let from_branch = network.branch(from.branch_id())?;
    let to_branch = network.branch(to.branch_id())?;

    if from_branch.id() == to_branch.id() {
        if (from.chainage() - to.chainage()).abs() < utils::CHAINAGE_EPSILON {
            return Ok(Vec::new());
        }
        return Ok(vec![NetworkSegment::between(
            network,
            from_branch.id(),
            from.chainage(),
            to.chainage(),
        )?]);
    }

    let mut best: Option<(f64, NodeId, NodeId, Vec<BranchId>)> = None;
    for exit in [from_branch.source(), from_branch.target()] {
        for entry in [to_branch.source(), to_branch.target()] {
            let path = network.shortest_path_by_length(exit, entry);
            if exit != entry && path.is_empty() {
                continue;
            }
            let path_length: f64 = path
                .iter()
                .filter_map(|b| network.branch(*b).ok())
                .map(Branch::length)
                .sum();
            let cost = (end_chainage(from_branch, exit) - from.chainage()).abs()
                + path_length
                + (end_chainage(to_branch, entry) - to.chainage()).abs();
            if best.as_ref().is_none_or(|(best_cost, ..)| cost < *best_cost) {
                best = Some((cost, exit, entry, path));
            }
        }
    }

    let Some((_, exit, entry, path)) = best else {
        return Err(crate::NetworkError::InvalidArgument(format!(
            "no route between {} and {}",
            from_branch.id(),
            to_branch.id()
        )));
    };

    let mut segments = Vec::with_capacity(path.len() + 2);
    segments.push(NetworkSegment::between(
        network,
        from_branch.id(),
        from.chainage(),
        end_chainage(from_branch, exit),
    )?);

    let mut node = exit;
    for branch_id in path {
        let branch = network.branch(branch_id)?;
        let (start, end) = if branch.source() == node {
            (0.0, branch.length())
        } else {
            (branch.length(), 0.0)
        };
        segments.push(NetworkSegment::between(network, branch_id, start, end)?);
        node = branch.other_node(node).unwrap_or(node);
    }

    segments.push(NetworkSegment::between(
        network,
        to_branch.id(),
        end_chainage(to_branch, entry),
        to.chainage(),
    )?);

    segments.retain(|segment| segment.length > utils::CHAINAGE_EPSILON);
    Ok(segments)
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl NetworkCoverage {
    /// Segments derived from the locations by the configured generation method
    ///
    /// Cached until the network generation, the method or the locations change. For
    /// per-location and between-location segments only the branches whose locations
    /// changed are regenerated.
    pub fn segments(&self, network: &Network) -> Result<Arc<Vec<NetworkSegment>>> {
        #[cfg(feature = "profiling")]
        profiling::scope!("coverage::segments");

        self.check_network(network)?;
        let generation = network.generation();
        let method = self.segment_generation_method();

        {
            let cache = self.read_cache();
            if let Some(segments) = cache.segments.as_ref()
                && segments.generation == generation
                && segments.method == method
                && let Some(all) = segments.all.as_ref()
            {
                return Ok(Arc::clone(all));
            }
        }

        let index = self.location_index();
        let mut cache = self.write_cache();

        let reusable = cache.segments.take().filter(|segments| {
            segments.generation == generation && segments.method == method && method.is_incremental()
        });

        let all = if method == SegmentGenerationMethod::RouteBetweenLocations {
            let segments = self.generate_route_segments(network);
            cache.segments = Some(SegmentCache {
                generation,
                method,
                all: Some(Arc::clone(&segments)),
                ..SegmentCache::default()
            });
            segments
        } else {
            let mut per_branch: HashMap<BranchId, Vec<NetworkSegment>> = match reusable {
                Some(mut previous) => {
                    tracing::trace!(coverage = %self.name(), branches = previous.dirty.len(), "regenerating dirty segments");
                    for branch in previous.dirty.drain() {
                        previous.per_branch.remove(&branch);
                        let Ok(branch) = network.branch(branch) else {
                            continue;
                        };
                        if let Some((id, segments)) = self.generate_branch(network, &index, branch, method) {
                            previous.per_branch.insert(id, segments);
                        }
                    }
                    previous.per_branch
                }
                None => {
                    tracing::debug!(coverage = %self.name(), ?method, generation, "regenerating all segments");
                    network
                        .branches()
                        .par_iter()
                        .filter_map(|branch| self.generate_branch(network, &index, branch, method))
                        .collect()
                }
            };

            let all: Vec<NetworkSegment> = network
                .branches()
                .iter()
                .filter_map(|branch| per_branch.get(&branch.id()))
                .flatten()
                .cloned()
                .collect();
            let all = Arc::new(all);
            per_branch.shrink_to_fit();
            cache.segments = Some(SegmentCache {
                generation,
                method,
                per_branch,
                dirty: Default::default(),
                all: Some(Arc::clone(&all)),
            });
            all
        };

        Ok(all)
    }

    fn generate_branch(
        &self,
        network: &Network,
        index: &LocationIndex,
        branch: &Branch,
        method: SegmentGenerationMethod,
    ) -> Option<(BranchId, Vec<NetworkSegment>)> {
        let chainages = branch_chainages(self, index, branch);
        if chainages.is_empty() && method != SegmentGenerationMethod::SegmentBetweenLocationsFullyCovered {
            return None;
        }
        match branch_segments(network, branch, &chainages, method) {
            Ok(segments) => {
                tracing::trace!(branch = %branch.id(), count = segments.len(), "generated segments");
                Some((branch.id(), segments))
            }
            Err(err) => {
                tracing::warn!(branch = %branch.id(), %err, "segment generation failed, branch skipped");
                None
            }
        }
    }

    fn generate_route_segments(&self, network: &Network) -> Arc<Vec<NetworkSegment>> {
        let mut segments = Vec::new();
        for pair in self.locations.windows(2) {
            match route_segments(network, &pair[0], &pair[1]) {
                Ok(leg) => segments.extend(leg),
                Err(err) => {
                    tracing::warn!(from = %pair[0].branch_id(), to = %pair[1].branch_id(), %err, "route leg skipped");
                }
            }
        }
        Arc::new(segments)
    }
}
