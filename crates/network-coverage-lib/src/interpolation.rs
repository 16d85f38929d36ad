//! Coverage evaluation: exact lookup, interpolation along a branch and across
//! pass-through nodes, and the time fallback
//!
//! Single-point and batch evaluation both go through [`BranchEvaluator`], so a batch of
//! chainages yields exactly the values of evaluating each chainage on its own.

use crate::coverage::LocationIndex;
use crate::{
    Branch, BranchId, InterpolationType, Locatable, Network, NetworkCoverage, NetworkError,
    NetworkLocation, NodeId, Result, utils,
};
use geo::Point;
use std::cell::OnceCell;
use std::collections::HashSet;

/// A known value at some distance from the query point
#[derive(Debug, Clone, Copy, PartialEq)]
struct Bound {
    distance: f64,
    value: f64,
}

impl Bound {
    #[inline]
    fn offset(self, extra: f64) -> Self {
        Self {
            distance: extra + self.distance,
            value: self.value,
        }
    }
}

/// Evaluates one branch of one value slice
struct BranchEvaluator<'a> {
    coverage: &'a NetworkCoverage,
    network: &'a Network,
    branch: &'a Branch,
    index: &'a LocationIndex,
    slice: &'a [f64],
    /// `(chainage, value)` of the locations on the branch, ascending chainage
    samples: Vec<(f64, f64)>,
    /// Nearest known value beyond the source node, measured from the node
    upstream: OnceCell<Option<Bound>>,
    /// Nearest known value beyond the target node, measured from the node
    downstream: OnceCell<Option<Bound>>,
}

impl<'a> BranchEvaluator<'a> {
    fn new(
        coverage: &'a NetworkCoverage,
        network: &'a Network,
        branch: &'a Branch,
        index: &'a LocationIndex,
        slice: &'a [f64],
    ) -> Self {
        let samples = index
            .get(&branch.id())
            .map(|positions| {
                positions
                    .iter()
                    .map(|&position| (coverage.locations[position].chainage(), slice[position]))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            coverage,
            network,
            branch,
            index,
            slice,
            samples,
            upstream: OnceCell::new(),
            downstream: OnceCell::new(),
        }
    }

    fn upstream(&self) -> Option<Bound> {
        *self
            .upstream
            .get_or_init(|| self.search_across(self.branch.source()))
    }

    fn downstream(&self) -> Option<Bound> {
        *self
            .downstream
            .get_or_init(|| self.search_across(self.branch.target()))
    }

    /// Walk through pass-through nodes starting at `node` until a branch with known
    /// values is found
    ///
    /// Stops without a result at fan-out or ambiguous nodes, at the end of the ordered
    /// chain, and when the walk comes back to a branch it already crossed.
    fn search_across(&self, node: NodeId) -> Option<Bound> {
        #[cfg(feature = "profiling")]
        profiling::scope!("interpolation::search_across");

        let start = self.branch.id();
        let mut visited: HashSet<BranchId> = HashSet::from([start]);
        let mut current = start;
        let mut node = node;
        let mut distance = 0.0;

        loop {
            let next = self.network.pass_through_branch(current, node)?;
            if !visited.insert(next) {
                tracing::trace!(branch = %start, %next, "cross-node search looped back");
                return None;
            }
            let next_branch = self.network.branch(next).ok()?;
            let enters_at_source = next_branch.source() == node;

            if let Some(positions) = self.index.get(&next).filter(|p| !p.is_empty()) {
                let position = if enters_at_source {
                    positions[0]
                } else {
                    positions[positions.len() - 1]
                };
                let chainage = self.coverage.locations[position].chainage();
                let into_branch = if enters_at_source {
                    chainage
                } else {
                    next_branch.length() - chainage
                };
                return Some(Bound {
                    distance: distance + into_branch,
                    value: self.slice[position],
                });
            }

            distance += next_branch.length();
            node = next_branch.other_node(node)?;
            current = next;
        }
    }

    fn combine(&self, upstream: Option<Bound>, downstream: Option<Bound>) -> f64 {
        let default_value = self.coverage.default_value();
        match self.coverage.interpolation() {
            InterpolationType::None => default_value,
            interpolation => match (upstream, downstream) {
                (Some(up), Some(down)) => match interpolation {
                    InterpolationType::Constant if up.distance <= down.distance => up.value,
                    InterpolationType::Constant => down.value,
                    _ => utils::interpolate_linear(
                        -up.distance,
                        up.value,
                        down.distance,
                        down.value,
                        0.0,
                    ),
                },
                (Some(nearest), None) | (None, Some(nearest)) => nearest.value,
                (None, None) => default_value,
            },
        }
    }

    fn evaluate(&self, chainage: f64) -> f64 {
        let chainage = self.branch.snap_chainage(chainage);
        let length = self.branch.length();
        let samples = &self.samples;

        let position = samples.partition_point(|(c, _)| *c < chainage - utils::CHAINAGE_EPSILON);
        if let Some(&(c, value)) = samples.get(position)
            && (c - chainage).abs() < utils::CHAINAGE_EPSILON
        {
            return value;
        }

        match samples.len() {
            0 => {
                let upstream = self.upstream().map(|b| b.offset(chainage));
                let downstream = self.downstream().map(|b| b.offset(length - chainage));
                if upstream.is_some() && downstream.is_some() {
                    self.combine(upstream, downstream)
                } else {
                    self.coverage.default_value()
                }
            }
            1 => match self.coverage.interpolation() {
                InterpolationType::None => self.coverage.default_value(),
                _ => samples[0].1,
            },
            _ => {
                let upstream = match position.checked_sub(1) {
                    Some(previous) => Some(Bound {
                        distance: chainage - samples[previous].0,
                        value: samples[previous].1,
                    }),
                    None => self.upstream().map(|b| b.offset(chainage)),
                };
                let downstream = match samples.get(position) {
                    Some(&(c, value)) => Some(Bound {
                        distance: c - chainage,
                        value,
                    }),
                    None => self.downstream().map(|b| b.offset(length - chainage)),
                };
                self.combine(upstream, downstream)
            }
        }
    }
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl NetworkCoverage {
    /// Evaluate a coverage that is not time dependent
    pub fn evaluate(&self, network: &Network, location: &NetworkLocation) -> Result<f64> {
        self.evaluate_at(network, None, location)
    }

    /// Evaluate a time-dependent coverage
    ///
    /// Uses the values at `time` when known, otherwise those of the latest earlier time.
    /// Before the first known time the default value is returned.
    pub fn evaluate_at_time(
        &self,
        network: &Network,
        time: f64,
        location: &NetworkLocation,
    ) -> Result<f64> {
        self.evaluate_at(network, Some(time), location)
    }

    /// Evaluate with an optional time, which must be given exactly for time-dependent
    /// coverages
    pub fn evaluate_at(
        &self,
        network: &Network,
        time: Option<f64>,
        location: &NetworkLocation,
    ) -> Result<f64> {
        let values = self.evaluate_within_branch(
            network,
            time,
            location.branch_id(),
            &[location.chainage()],
        )?;
        Ok(values.first().copied().unwrap_or(self.default_value()))
    }

    /// Evaluate at the point on the nearest branch within `tolerance` of `point`
    ///
    /// Returns `None` when no branch is close enough.
    pub fn evaluate_coordinate(
        &self,
        network: &Network,
        time: Option<f64>,
        point: Point<f64>,
        tolerance: f64,
    ) -> Result<Option<f64>> {
        self.check_network(network)?;
        let Some(location) = network.location_at(point, tolerance) else {
            return Ok(None);
        };
        self.evaluate_at(network, time, &location).map(Some)
    }

    /// Evaluate many chainages along one branch
    ///
    /// Results are identical to evaluating each chainage on its own; the location index,
    /// value slice and cross-node searches are shared across the batch.
    pub fn evaluate_within_branch(
        &self,
        network: &Network,
        time: Option<f64>,
        branch: BranchId,
        chainages: &[f64],
    ) -> Result<Vec<f64>> {
        #[cfg(feature = "profiling")]
        profiling::scope!("coverage::evaluate_within_branch");

        self.check_network(network)?;
        let branch_ref = network.branch(branch)?;
        if let Some(&negative) = chainages.iter().find(|c| **c < 0.0 || c.is_nan()) {
            return Err(NetworkError::NegativeChainage(negative));
        }

        let Some(slice) = self.evaluation_slice(time)? else {
            return Ok(vec![self.default_value(); chainages.len()]);
        };
        let index = self.location_index();
        let evaluator = BranchEvaluator::new(self, network, branch_ref, &index, &self.values[slice]);
        Ok(chainages.iter().map(|&c| evaluator.evaluate(c)).collect())
    }

    /// Value at `location` for every known time
    pub fn time_series(
        &self,
        network: &Network,
        location: &NetworkLocation,
    ) -> Result<Vec<(f64, f64)>> {
        if !self.is_time_dependent() {
            return Err(NetworkError::UnexpectedTimeFilter);
        }
        self.times
            .iter()
            .map(|&time| Ok((time, self.evaluate_at(network, Some(time), location)?)))
            .collect()
    }

    /// Time series at the point on the nearest branch within `tolerance`
    pub fn time_series_at_coordinate(
        &self,
        network: &Network,
        point: Point<f64>,
        tolerance: f64,
    ) -> Result<Option<Vec<(f64, f64)>>> {
        self.check_network(network)?;
        let Some(location) = network.location_at(point, tolerance) else {
            return Ok(None);
        };
        self.time_series(network, &location).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BranchSpec, CoverageConfig};
    use geo::LineString;

    /// Three branches of length 10 threaded along the x axis
    fn chain(order_number: i32) -> (Network, [BranchId; 3]) {
        let mut network = Network::new("chain");
        let nodes: Vec<NodeId> = (0..4)
            .map(|i| network.add_node(&format!("n{i}"), Point::new(10.0 * i as f64, 0.0)))
            .collect();
        let mut branches = [BranchId(0); 3];
        for (i, branch) in branches.iter_mut().enumerate() {
            *branch = network
                .add_branch(
                    BranchSpec::new(format!("b{i}"), nodes[i], nodes[i + 1])
                        .with_order_number(order_number),
                )
                .unwrap();
        }
        (network, branches)
    }

    fn location(branch: BranchId, chainage: f64) -> NetworkLocation {
        NetworkLocation::new(branch, chainage).unwrap()
    }

    fn coverage(network: &Network, interpolation: InterpolationType) -> NetworkCoverage {
        NetworkCoverage::new(
            "values",
            network,
            CoverageConfig {
                interpolation,
                default_value: -999.0,
                ..CoverageConfig::default()
            },
        )
    }

    #[test]
    fn test_interpolation_crosses_ordered_nodes() {
        let (network, [b1, b2, b3]) = chain(1);
        let mut coverage = coverage(&network, InterpolationType::Linear);
        coverage.set_value(&network, location(b1, 5.0), 1.0).unwrap();
        coverage.set_value(&network, location(b3, 5.0), 3.0).unwrap();

        let value = coverage.evaluate(&network, &location(b2, 5.0)).unwrap();
        assert!((value - 2.0).abs() < 1e-12, "got {value}");

        let value = coverage.evaluate(&network, &location(b2, 0.0)).unwrap();
        assert!((value - 1.5).abs() < 1e-12, "got {value}");
    }

    #[test]
    fn test_unordered_chain_falls_back_to_default() {
        let (network, [b1, b2, b3]) = chain(crate::UNORDERED);
        let mut coverage = coverage(&network, InterpolationType::Linear);
        coverage.set_value(&network, location(b1, 5.0), 1.0).unwrap();
        coverage.set_value(&network, location(b3, 5.0), 3.0).unwrap();
        assert_eq!(coverage.evaluate(&network, &location(b2, 5.0)).unwrap(), -999.0);
    }

    #[test]
    fn test_fan_out_node_stops_search() {
        let (mut network, [b1, b2, b3]) = chain(1);
        let junction = network.branch(b2).unwrap().target();
        let spur_end = network.add_node("spur", Point::new(20.0, 10.0));
        network
            .add_branch(BranchSpec::new("spur", junction, spur_end).with_order_number(1))
            .unwrap();

        let mut coverage = coverage(&network, InterpolationType::Linear);
        coverage.set_value(&network, location(b1, 5.0), 1.0).unwrap();
        coverage.set_value(&network, location(b3, 5.0), 3.0).unwrap();
        assert_eq!(coverage.evaluate(&network, &location(b2, 5.0)).unwrap(), -999.0);
    }

    #[test]
    fn test_default_value_without_locations() {
        let (network, branches) = chain(1);
        let coverage = coverage(&network, InterpolationType::Linear);
        for branch in branches {
            for chainage in [0.0, 3.3, 10.0] {
                assert_eq!(
                    coverage.evaluate(&network, &location(branch, chainage)).unwrap(),
                    -999.0
                );
            }
        }
    }

    #[test]
    fn test_single_location_covers_branch() {
        let (network, [b1, _, _]) = chain(crate::UNORDERED);
        let mut coverage = coverage(&network, InterpolationType::Linear);
        coverage.set_value(&network, location(b1, 4.0), 7.0).unwrap();
        assert_eq!(coverage.evaluate(&network, &location(b1, 9.0)).unwrap(), 7.0);

        coverage.set_interpolation(InterpolationType::None);
        assert_eq!(coverage.evaluate(&network, &location(b1, 9.0)).unwrap(), -999.0);
        assert_eq!(coverage.evaluate(&network, &location(b1, 4.0)).unwrap(), 7.0);
    }

    #[test]
    fn test_exact_match_and_bounds() {
        let (network, [b1, _, _]) = chain(crate::UNORDERED);
        let mut coverage = coverage(&network, InterpolationType::Linear);
        coverage.set_value(&network, location(b1, 2.0), 0.1).unwrap();
        coverage.set_value(&network, location(b1, 8.0), 0.7).unwrap();

        assert_eq!(coverage.evaluate(&network, &location(b1, 2.0)).unwrap(), 0.1);
        assert_eq!(coverage.evaluate(&network, &location(b1, 8.0)).unwrap(), 0.7);
        for step in 1..60 {
            let chainage = 2.0 + step as f64 * 0.1;
            let value = coverage.evaluate(&network, &location(b1, chainage)).unwrap();
            assert!((0.1..=0.7).contains(&value), "{chainage}: {value}");
        }

        // Outside the range only one side is known on an unordered branch
        assert_eq!(coverage.evaluate(&network, &location(b1, 0.5)).unwrap(), 0.1);
        assert_eq!(coverage.evaluate(&network, &location(b1, 9.5)).unwrap(), 0.7);
    }

    #[test]
    fn test_constant_interpolation_prefers_nearest() {
        let (network, [b1, _, _]) = chain(crate::UNORDERED);
        let mut coverage = coverage(&network, InterpolationType::Constant);
        coverage.set_value(&network, location(b1, 2.0), 1.0).unwrap();
        coverage.set_value(&network, location(b1, 8.0), 2.0).unwrap();

        assert_eq!(coverage.evaluate(&network, &location(b1, 4.0)).unwrap(), 1.0);
        assert_eq!(coverage.evaluate(&network, &location(b1, 5.0)).unwrap(), 1.0);
        assert_eq!(coverage.evaluate(&network, &location(b1, 6.0)).unwrap(), 2.0);
    }

    #[test]
    fn test_batch_matches_single_evaluation() {
        let (network, [b1, b2, b3]) = chain(1);
        let mut coverage = coverage(&network, InterpolationType::Linear);
        coverage.set_value(&network, location(b1, 3.0), 1.0).unwrap();
        coverage.set_value(&network, location(b2, 2.5), 4.0).unwrap();
        coverage.set_value(&network, location(b2, 7.0), -2.0).unwrap();
        coverage.set_value(&network, location(b3, 9.0), 6.0).unwrap();

        let chainages: Vec<f64> = (0..=40).map(|i| i as f64 * 0.25).collect();
        let batch = coverage
            .evaluate_within_branch(&network, None, b2, &chainages)
            .unwrap();
        for (chainage, value) in chainages.iter().zip(&batch) {
            let single = coverage.evaluate(&network, &location(b2, *chainage)).unwrap();
            assert_eq!(single.to_bits(), value.to_bits(), "chainage {chainage}");
        }
    }

    #[test]
    fn test_time_fallback_uses_previous_time() {
        let (network, [b1, _, _]) = chain(1);
        let mut coverage = NetworkCoverage::new(
            "unsteady",
            &network,
            CoverageConfig {
                is_time_dependent: true,
                default_value: -1.0,
                ..CoverageConfig::default()
            },
        );
        let at = location(b1, 5.0);
        coverage.set_value_at_time(&network, 0.0, at.clone(), 1.0).unwrap();
        coverage.set_value_at_time(&network, 10.0, at.clone(), 3.0).unwrap();

        assert_eq!(coverage.evaluate_at_time(&network, 5.0, &at).unwrap(), 1.0);
        assert_eq!(coverage.evaluate_at_time(&network, 10.0, &at).unwrap(), 3.0);
        assert_eq!(coverage.evaluate_at_time(&network, 25.0, &at).unwrap(), 3.0);
        assert_eq!(coverage.evaluate_at_time(&network, -1.0, &at).unwrap(), -1.0);
        assert!(matches!(
            coverage.evaluate(&network, &at),
            Err(NetworkError::TimeFilterRequired)
        ));

        let series = coverage.time_series(&network, &at).unwrap();
        assert_eq!(series, vec![(0.0, 1.0), (10.0, 3.0)]);
    }

    #[test]
    fn test_evaluate_coordinate() {
        let mut network = Network::new("bent");
        let branch = network
            .connect(
                "bent",
                LineString::from(vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0)]),
            )
            .unwrap();
        let mut coverage = coverage(&network, InterpolationType::Linear);
        coverage.set_value(&network, location(branch, 0.0), 0.0).unwrap();
        coverage.set_value(&network, location(branch, 20.0), 20.0).unwrap();

        let value = coverage
            .evaluate_coordinate(&network, None, Point::new(10.1, 5.0), 0.5)
            .unwrap();
        assert!((value.unwrap() - 15.0).abs() < 1e-9);
        assert_eq!(
            coverage
                .evaluate_coordinate(&network, None, Point::new(50.0, 50.0), 0.5)
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_self_referencing_order_numbers_terminate() {
        let mut network = Network::new("ring");
        let a = network.add_node("a", Point::new(0.0, 0.0));
        let b = network.add_node("b", Point::new(10.0, 0.0));
        let first = network
            .add_branch(BranchSpec::new("ab", a, b).with_order_number(3))
            .unwrap();
        network
            .add_branch(
                BranchSpec::new("ba", b, a)
                    .with_geometry(LineString::from(vec![(10.0, 0.0), (5.0, 5.0), (0.0, 0.0)]))
                    .with_order_number(3),
            )
            .unwrap();

        let coverage = coverage(&network, InterpolationType::Linear);
        assert_eq!(coverage.evaluate(&network, &location(first, 5.0)).unwrap(), -999.0);
    }
}
