//! Routes through the network
//!
//! A `Route` is a coverage whose locations describe a path in caller-defined order.
//! Its segments are the shortest paths between consecutive locations.

use crate::coverage::CoverageKind;
use crate::editing::TopologyChange;
use crate::{
    CompletedEdit, CoverageConfig, Locatable, Network, NetworkCoverage, NetworkId, NetworkLocation,
    NetworkSegment, Result, SegmentGenerationMethod, Spanning, TopologyObserver, utils,
};
use std::sync::Arc;

/// A path through the network defined by an ordered list of locations
#[derive(Clone, Debug)]
pub struct Route {
    coverage: NetworkCoverage,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl Route {
    /// Create an empty route over `network`
    pub fn new(name: &str, network: &Network) -> Self {
        let config = CoverageConfig {
            segment_generation_method: SegmentGenerationMethod::RouteBetweenLocations,
            is_auto_sorted: false,
            is_time_dependent: false,
            ..CoverageConfig::default()
        };
        let mut coverage = NetworkCoverage::new(name, network, config);
        coverage.kind = CoverageKind::Route;
        Self { coverage }
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.coverage.name()
    }

    /// Append a location to the path
    ///
    /// # Arguments
    /// * `network` - The network the route was created for
    /// * `location` - Next point to visit; the same point may be visited more than once
    ///
    /// # Returns
    /// The position of the location along the route
    pub fn add_location(&mut self, network: &Network, location: NetworkLocation) -> Result<usize> {
        self.coverage.add_location(network, location)
    }

    /// Remove the location at `position`
    pub fn remove_location(&mut self, position: usize) -> Option<NetworkLocation> {
        (position < self.coverage.locations.len()).then(|| self.coverage.remove_at(position))
    }

    /// Locations in visiting order
    #[inline]
    pub fn locations(&self) -> &[NetworkLocation] {
        self.coverage.locations()
    }

    /// Segments of the path, in travel order
    pub fn segments(&self, network: &Network) -> Result<Arc<Vec<NetworkSegment>>> {
        self.coverage.segments(network)
    }

    /// Length of the path along the network
    pub fn total_length(&self, network: &Network) -> Result<f64> {
        Ok(self.segments(network)?.iter().map(|s| s.length()).sum())
    }

    /// Distance travelled along the route until `location` is first reached
    ///
    /// Returns `None` when the location is not on the route.
    pub fn route_chainage(&self, network: &Network, location: &NetworkLocation) -> Result<Option<f64>> {
        let segments = self.segments(network)?;
        let mut travelled = 0.0;
        for segment in segments.iter() {
            if segment.branch_id() == location.branch_id() && segment.contains(location.chainage()) {
                let into_segment = (location.chainage() - segment.chainage()).abs();
                return Ok(Some(travelled + into_segment.min(segment.length())));
            }
            travelled += segment.length();
        }

        // A route made of a single point has no segments
        Ok(self
            .locations()
            .first()
            .filter(|first| first.same_point(location))
            .map(|_| 0.0))
    }

    /// The route viewed as a plain coverage
    #[inline]
    pub fn as_coverage(&self) -> &NetworkCoverage {
        &self.coverage
    }
}

impl TopologyObserver for Route {
    fn network_id(&self) -> NetworkId {
        self.coverage.network_id()
    }

    fn on_edit_completed(&mut self, network: &Network, edit: &CompletedEdit) -> Result<()> {
        self.coverage.check_network(network)?;
        for change in &edit.changes {
            if let TopologyChange::BranchSplit { branch, .. } = change {
                tracing::trace!(route = %self.name(), %branch, "route left untouched by split");
                continue;
            }
            self.coverage.apply_change(change);
        }
        self.coverage.invalidate();

        let dangling = self
            .locations()
            .iter()
            .filter(|location| {
                network
                    .branch(location.branch_id())
                    .is_ok_and(|b| location.chainage() > b.length() + utils::CHAINAGE_EPSILON)
            })
            .count();
        if dangling > 0 {
            tracing::warn!(route = %self.name(), dangling, "route locations beyond their branch end");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BranchId, BranchSpec, editing};
    use geo::Point;

    fn chain() -> (Network, Vec<BranchId>) {
        let mut network = Network::new("chain");
        let nodes: Vec<_> = (0..4)
            .map(|i| network.add_node(&format!("n{i}"), Point::new(10.0 * i as f64, 0.0)))
            .collect();
        let branches = nodes
            .windows(2)
            .enumerate()
            .map(|(i, pair)| {
                network
                    .add_branch(BranchSpec::new(format!("b{i}"), pair[0], pair[1]))
                    .unwrap()
            })
            .collect();
        (network, branches)
    }

    fn location(branch: BranchId, chainage: f64) -> NetworkLocation {
        NetworkLocation::new(branch, chainage).unwrap()
    }

    #[test]
    fn test_route_keeps_caller_order() {
        let (network, branches) = chain();
        let mut route = Route::new("ride", &network);
        route.add_location(&network, location(branches[2], 5.0)).unwrap();
        route.add_location(&network, location(branches[0], 5.0)).unwrap();
        route.add_location(&network, location(branches[2], 5.0)).unwrap();

        assert_eq!(route.locations().len(), 3);
        assert_eq!(route.locations()[0].branch_id(), branches[2]);
        assert_eq!(
            route.as_coverage().segment_generation_method(),
            SegmentGenerationMethod::RouteBetweenLocations
        );
        assert!((route.total_length(&network).unwrap() - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_route_chainage() {
        let (network, branches) = chain();
        let mut route = Route::new("ride", &network);
        route.add_location(&network, location(branches[0], 2.0)).unwrap();
        route.add_location(&network, location(branches[2], 8.0)).unwrap();

        let along = route
            .route_chainage(&network, &location(branches[1], 4.0))
            .unwrap();
        assert!((along.unwrap() - 12.0).abs() < 1e-9);
        assert_eq!(
            route
                .route_chainage(&network, &location(branches[0], 1.0))
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_route_is_immune_to_split() {
        let (mut network, branches) = chain();
        let mut route = Route::new("ride", &network);
        route.add_location(&network, location(branches[0], 8.0)).unwrap();
        route.add_location(&network, location(branches[2], 2.0)).unwrap();

        editing::split_branch_at_node(&mut network, branches[0], 5.0, &mut [&mut route])
            .unwrap()
            .unwrap();
        assert_eq!(route.locations()[0].branch_id(), branches[0]);
        assert_eq!(route.locations()[0].chainage(), 8.0);
    }

    #[test]
    fn test_route_follows_reverse_in_place() {
        let (mut network, branches) = chain();
        let mut route = Route::new("ride", &network);
        route.add_location(&network, location(branches[1], 8.0)).unwrap();
        route.add_location(&network, location(branches[1], 2.0)).unwrap();

        editing::reverse_branch(&mut network, branches[1], &mut [&mut route]).unwrap();
        let chainages: Vec<f64> = route.locations().iter().map(|l| l.chainage()).collect();
        assert_eq!(chainages, vec![2.0, 8.0]);
        assert!((route.total_length(&network).unwrap() - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_remove_location() {
        let (network, branches) = chain();
        let mut route = Route::new("ride", &network);
        route.add_location(&network, location(branches[0], 1.0)).unwrap();
        assert!(route.remove_location(3).is_none());
        assert_eq!(route.remove_location(0).unwrap().chainage(), 1.0);
        assert!(route.locations().is_empty());
    }
}
