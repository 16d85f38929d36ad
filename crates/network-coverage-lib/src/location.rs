//! Point locations and directed segments on network branches

use crate::feature::validate_chainage;
use crate::{BranchId, Locatable, Named, Network, NetworkError, Result, Spanning, utils};
use geo::{LineString, Point};
use std::cmp::Ordering;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A point on a branch, the spatial domain element of a coverage
///
/// Two locations are equal when they sit on the same branch within
/// [`utils::CHAINAGE_EPSILON`] of each other; the name plays no part.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NetworkLocation {
    branch: BranchId,
    chainage: f64,
    name: String,
}

impl NetworkLocation {
    /// Create a location, rejecting negative chainages
    pub fn new(branch: BranchId, chainage: f64) -> Result<Self> {
        Ok(Self {
            branch,
            chainage: validate_chainage(chainage)?,
            name: String::new(),
        })
    }

    /// Create a location snapped onto the branch bounds
    pub fn on_branch(network: &Network, branch: BranchId, chainage: f64) -> Result<Self> {
        let branch_ref = network.branch(branch)?;
        Self::new(branch, branch_ref.snap_chainage(validate_chainage(chainage)?))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[inline]
    pub fn branch_id(&self) -> BranchId {
        self.branch
    }

    pub fn set_chainage(&mut self, chainage: f64) -> Result<()> {
        self.chainage = validate_chainage(chainage)?;
        Ok(())
    }

    pub(crate) fn relocate(&mut self, branch: BranchId, chainage: f64) {
        self.branch = branch;
        self.chainage = chainage.max(0.0);
    }

    /// A location whose chainage skipped validation
    #[cfg(test)]
    pub(crate) fn unchecked(branch: BranchId, chainage: f64) -> Self {
        Self {
            branch,
            chainage,
            name: String::new(),
        }
    }

    /// Same branch and chainage within epsilon
    #[inline]
    pub fn same_point(&self, other: &NetworkLocation) -> bool {
        self.branch == other.branch
            && (self.chainage - other.chainage).abs() < utils::CHAINAGE_EPSILON
    }

    /// Order by branch position, then chainage; colocated locations compare equal
    pub fn compare(&self, other: &NetworkLocation, network: &Network) -> Result<Ordering> {
        if self.same_point(other) {
            return Ok(Ordering::Equal);
        }
        if self.branch != other.branch {
            return network.compare_branches(self.branch, other.branch);
        }
        Ok(self.chainage.total_cmp(&other.chainage))
    }

    /// Drawn position of this location
    ///
    /// Computed through linear referencing against the branch polyline, honouring the
    /// custom-length scale factor.
    pub fn geometry(&self, network: &Network) -> Result<Point<f64>> {
        network.point_at(self.branch, self.chainage)
    }

    /// Rebuild a location from a persisted record
    pub fn from_record(network: &Network, record: &LocationRecord) -> Result<Self> {
        let branch = network.branch_at(record.branch_index).ok_or_else(|| {
            NetworkError::InvalidArgument(format!(
                "no branch at position {}",
                record.branch_index
            ))
        })?;
        Self::on_branch(network, branch.id(), record.chainage)
    }
}

impl PartialEq for NetworkLocation {
    fn eq(&self, other: &Self) -> bool {
        self.same_point(other)
    }
}

impl Locatable for NetworkLocation {
    #[inline]
    fn branch(&self) -> Option<BranchId> {
        Some(self.branch)
    }

    #[inline]
    fn chainage(&self) -> f64 {
        self.chainage
    }
}

impl Named for NetworkLocation {
    #[inline]
    fn name(&self) -> &str {
        &self.name
    }
}

impl Spanning for NetworkLocation {}

/// Flat representation of a location for persistence adapters
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LocationRecord {
    /// Position of the branch in network order
    pub branch_index: usize,
    pub chainage: f64,
    pub x: f64,
    pub y: f64,
}

impl Network {
    /// Flatten a location into a record
    pub fn location_record(&self, location: &NetworkLocation) -> Result<LocationRecord> {
        let branch_index = self
            .branch_position(location.branch)
            .ok_or(NetworkError::UnknownBranch(location.branch))?;
        let point = location.geometry(self)?;
        Ok(LocationRecord {
            branch_index,
            chainage: location.chainage,
            x: point.x(),
            y: point.y(),
        })
    }

    /// The location on the closest branch within `tolerance` of `point`
    pub fn location_at(&self, point: Point<f64>, tolerance: f64) -> Option<NetworkLocation> {
        let (branch, chainage, _) = self.nearest_branch(point, tolerance)?;
        NetworkLocation::new(branch, chainage).ok()
    }
}

/// A directed chainage interval on a branch
///
/// Covers `[chainage, chainage + length]` when the direction is positive and
/// `[chainage - length, chainage]` otherwise, starting at `chainage` in both cases.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NetworkSegment {
    pub(crate) branch: BranchId,
    pub(crate) chainage: f64,
    pub(crate) length: f64,
    pub(crate) direction_is_positive: bool,
    pub(crate) name: String,
    pub(crate) geometry: LineString<f64>,
}

impl NetworkSegment {
    /// Segment from `start` to `end` on a branch; the direction follows the sign of
    /// `end - start`
    pub fn between(network: &Network, branch: BranchId, start: f64, end: f64) -> Result<Self> {
        validate_chainage(start)?;
        validate_chainage(end)?;
        let geometry = network.sub_geometry(branch, start, end)?;
        Ok(Self {
            branch,
            chainage: start,
            length: (end - start).abs(),
            direction_is_positive: end >= start,
            name: String::new(),
            geometry,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[inline]
    pub fn branch_id(&self) -> BranchId {
        self.branch
    }

    #[inline]
    pub fn direction_is_positive(&self) -> bool {
        self.direction_is_positive
    }

    /// Chainage where the segment ends, following its direction
    #[inline]
    pub fn end_chainage(&self) -> f64 {
        if self.direction_is_positive {
            self.chainage + self.length
        } else {
            self.chainage - self.length
        }
    }

    #[inline]
    pub fn min_chainage(&self) -> f64 {
        self.chainage.min(self.end_chainage())
    }

    #[inline]
    pub fn max_chainage(&self) -> f64 {
        self.chainage.max(self.end_chainage())
    }

    /// Whether a chainage lies on this segment (bounds included, within epsilon)
    pub fn contains(&self, chainage: f64) -> bool {
        chainage >= self.min_chainage() - utils::CHAINAGE_EPSILON
            && chainage <= self.max_chainage() + utils::CHAINAGE_EPSILON
    }

    /// Drawn geometry, reversed for negative segments
    #[inline]
    pub fn geometry(&self) -> &LineString<f64> {
        &self.geometry
    }
}

impl Locatable for NetworkSegment {
    #[inline]
    fn branch(&self) -> Option<BranchId> {
        Some(self.branch)
    }

    #[inline]
    fn chainage(&self) -> f64 {
        self.chainage
    }
}

impl Named for NetworkSegment {
    #[inline]
    fn name(&self) -> &str {
        &self.name
    }
}

impl Spanning for NetworkSegment {
    #[inline]
    fn length(&self) -> f64 {
        self.length
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BranchSpec, UpdateContext};

    fn bent_network() -> (Network, BranchId) {
        let mut network = Network::new("bent");
        let a = network.add_node("a", Point::new(0.0, 0.0));
        let b = network.add_node("b", Point::new(10.0, 10.0));
        let branch = network
            .add_branch(
                BranchSpec::new("ab", a, b)
                    .with_geometry(LineString::from(vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0)])),
            )
            .unwrap();
        (network, branch)
    }

    #[test]
    fn test_location_equality_ignores_name() {
        let a = NetworkLocation::new(BranchId(1), 5.0).unwrap().with_name("a");
        let b = NetworkLocation::new(BranchId(1), 5.0 + 1e-9).unwrap().with_name("b");
        let c = NetworkLocation::new(BranchId(1), 5.1).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(NetworkLocation::new(BranchId(1), -1.0).is_err());
    }

    #[test]
    fn test_location_geometry_follows_custom_length() {
        let (mut network, branch) = bent_network();
        let location = NetworkLocation::new(branch, 15.0).unwrap();
        let point = location.geometry(&network).unwrap();
        assert!((point.x() - 10.0).abs() < 1e-9 && (point.y() - 5.0).abs() < 1e-9);

        network
            .set_branch_length(branch, 40.0, UpdateContext::Edit)
            .unwrap();
        let point = location.geometry(&network).unwrap();
        assert!((point.x() - 7.5).abs() < 1e-9 && point.y().abs() < 1e-9);
    }

    #[test]
    fn test_location_record_round_trip() {
        let (network, branch) = bent_network();
        let location = NetworkLocation::new(branch, 12.0).unwrap();
        let record = network.location_record(&location).unwrap();
        assert_eq!(record.branch_index, 0);
        assert!((record.x - 10.0).abs() < 1e-9 && (record.y - 2.0).abs() < 1e-9);

        let restored = NetworkLocation::from_record(&network, &record).unwrap();
        assert_eq!(restored, location);

        let bad = LocationRecord {
            branch_index: 4,
            ..record
        };
        assert!(NetworkLocation::from_record(&network, &bad).is_err());
    }

    #[test]
    fn test_location_at_coordinate() {
        let (network, branch) = bent_network();
        let location = network.location_at(Point::new(10.2, 3.0), 0.5).unwrap();
        assert_eq!(location.branch_id(), branch);
        assert!((location.chainage() - 13.0).abs() < 1e-9);
        assert!(network.location_at(Point::new(5.0, 5.0), 0.5).is_none());
    }

    #[test]
    fn test_negative_segment_is_reversed() {
        let (network, branch) = bent_network();
        let segment = NetworkSegment::between(&network, branch, 15.0, 5.0).unwrap();
        assert!(!segment.direction_is_positive());
        assert_eq!(segment.length(), 10.0);
        assert_eq!(segment.end_chainage(), 5.0);
        assert_eq!(segment.min_chainage(), 5.0);
        assert!(segment.contains(10.0));
        assert!(!segment.contains(15.5));

        let first = segment.geometry().0.first().unwrap();
        assert!((first.x - 10.0).abs() < 1e-9 && (first.y - 5.0).abs() < 1e-9);
    }
}
