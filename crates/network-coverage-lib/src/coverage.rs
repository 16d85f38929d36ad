//! Coverages: functions over network locations, optionally also over time
//!
//! Values are stored as one slice per time (a single slice for coverages that are not
//! time dependent), each slice holding one value per location. Everything derived from
//! the locations (per-branch index, segments, point geometry) lives in a lazily rebuilt
//! cache stamped with the network generation it was built at.

use crate::{
    BranchId, Locatable, LocationRecord, Network, NetworkError, NetworkId, NetworkLocation,
    NetworkSegment, Result,
};
use geo::MultiPoint;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// How values between known locations are derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum InterpolationType {
    /// Only exact matches, everything else evaluates to the default value
    None,
    /// Value of the nearest known location
    Constant,
    /// Linear in chainage distance between the two surrounding locations
    #[default]
    Linear,
}

/// Strategy used to derive segments from the locations of a coverage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SegmentGenerationMethod {
    None,
    /// One segment around each location, bounded by the midpoints to its neighbours
    SegmentPerLocation,
    /// One segment between each pair of consecutive locations on a branch
    #[default]
    SegmentBetweenLocations,
    /// As [`SegmentGenerationMethod::SegmentBetweenLocations`], extended to both branch ends
    SegmentBetweenLocationsFullyCovered,
    /// Shortest path between consecutive locations, possibly across branches
    RouteBetweenLocations,
}

impl SegmentGenerationMethod {
    /// Methods whose segments can be regenerated one branch at a time
    #[inline]
    pub(crate) fn is_incremental(self) -> bool {
        matches!(
            self,
            SegmentGenerationMethod::SegmentPerLocation
                | SegmentGenerationMethod::SegmentBetweenLocations
        )
    }
}

/// Configuration for a coverage
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CoverageConfig {
    /// Value returned where no data is available
    pub default_value: f64,
    pub interpolation: InterpolationType,
    pub segment_generation_method: SegmentGenerationMethod,
    /// Keep locations sorted by branch order and chainage
    pub is_auto_sorted: bool,
    /// Values are indexed by time as well as by location
    pub is_time_dependent: bool,
}

impl Default for CoverageConfig {
    fn default() -> Self {
        Self {
            default_value: 0.0,
            interpolation: InterpolationType::Linear,
            segment_generation_method: SegmentGenerationMethod::SegmentBetweenLocations,
            is_auto_sorted: true,
            is_time_dependent: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CoverageKind {
    Coverage,
    Route,
}

/// Indices into the location list per branch, sorted by chainage
pub(crate) type LocationIndex = HashMap<BranchId, Vec<usize>>;

#[derive(Debug, Default)]
pub(crate) struct SegmentCache {
    pub(crate) generation: u64,
    pub(crate) method: SegmentGenerationMethod,
    pub(crate) per_branch: HashMap<BranchId, Vec<NetworkSegment>>,
    /// Branches whose locations changed since the segments were generated
    pub(crate) dirty: HashSet<BranchId>,
    pub(crate) all: Option<Arc<Vec<NetworkSegment>>>,
}

#[derive(Debug, Default)]
pub(crate) struct DerivedCache {
    pub(crate) location_index: Option<Arc<LocationIndex>>,
    pub(crate) geometry: Option<(u64, Arc<MultiPoint<f64>>)>,
    pub(crate) segments: Option<SegmentCache>,
}

/// A function over the locations of one network
///
/// The coverage does not own its network: every operation that needs the network takes
/// it as a parameter and fails with [`NetworkError::NetworkMismatch`] when handed a
/// different one than the coverage was created for.
#[derive(Debug)]
pub struct NetworkCoverage {
    name: String,
    network_id: NetworkId,
    pub(crate) config: CoverageConfig,
    pub(crate) kind: CoverageKind,
    pub(crate) locations: Vec<NetworkLocation>,
    /// Ascending; empty unless time dependent
    pub(crate) times: Vec<f64>,
    /// `values[slice][location]`
    pub(crate) values: Vec<Vec<f64>>,
    pub(crate) cache: RwLock<DerivedCache>,
}

impl Clone for NetworkCoverage {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            network_id: self.network_id,
            config: self.config.clone(),
            kind: self.kind,
            locations: self.locations.clone(),
            times: self.times.clone(),
            values: self.values.clone(),
            cache: RwLock::new(DerivedCache::default()),
        }
    }
}

#[inline]
fn validate_time(time: f64) -> Result<f64> {
    if time.is_nan() {
        return Err(NetworkError::InvalidArgument("time is NaN".to_string()));
    }
    Ok(time)
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl NetworkCoverage {
    /// Create an empty coverage over `network`
    pub fn new(name: &str, network: &Network, config: CoverageConfig) -> Self {
        let values = if config.is_time_dependent {
            Vec::new()
        } else {
            vec![Vec::new()]
        };
        Self {
            name: name.to_string(),
            network_id: network.id(),
            config,
            kind: CoverageKind::Coverage,
            locations: Vec::new(),
            times: Vec::new(),
            values,
            cache: RwLock::new(DerivedCache::default()),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    #[inline]
    pub fn network_id(&self) -> NetworkId {
        self.network_id
    }

    #[inline]
    pub fn config(&self) -> &CoverageConfig {
        &self.config
    }

    #[inline]
    pub fn default_value(&self) -> f64 {
        self.config.default_value
    }

    #[inline]
    pub fn interpolation(&self) -> InterpolationType {
        self.config.interpolation
    }

    #[inline]
    pub fn segment_generation_method(&self) -> SegmentGenerationMethod {
        self.config.segment_generation_method
    }

    #[inline]
    pub fn is_auto_sorted(&self) -> bool {
        self.config.is_auto_sorted
    }

    #[inline]
    pub fn is_time_dependent(&self) -> bool {
        self.config.is_time_dependent
    }

    /// Known times, ascending
    #[inline]
    pub fn times(&self) -> &[f64] {
        &self.times
    }

    #[inline]
    pub fn locations(&self) -> &[NetworkLocation] {
        &self.locations
    }

    pub fn set_default_value(&mut self, value: f64) {
        self.config.default_value = value;
    }

    pub fn set_interpolation(&mut self, interpolation: InterpolationType) {
        self.config.interpolation = interpolation;
    }

    pub fn set_segment_generation_method(&mut self, method: SegmentGenerationMethod) {
        if self.config.segment_generation_method != method {
            self.config.segment_generation_method = method;
            self.cache_mut().segments = None;
        }
    }

    /// Toggle automatic sorting; switching it on sorts the current locations
    pub fn set_auto_sorted(&mut self, network: &Network, is_auto_sorted: bool) -> Result<()> {
        self.check_network(network)?;
        self.config.is_auto_sorted = is_auto_sorted;
        if is_auto_sorted {
            self.sort_locations(network);
        }
        Ok(())
    }

    pub(crate) fn check_network(&self, network: &Network) -> Result<()> {
        if network.id() != self.network_id {
            return Err(NetworkError::NetworkMismatch);
        }
        Ok(())
    }

    pub(crate) fn read_cache(&self) -> RwLockReadGuard<'_, DerivedCache> {
        self.cache.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write_cache(&self) -> RwLockWriteGuard<'_, DerivedCache> {
        self.cache.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn cache_mut(&mut self) -> &mut DerivedCache {
        self.cache.get_mut().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop every derived structure
    pub(crate) fn invalidate(&mut self) {
        *self.cache_mut() = DerivedCache::default();
    }

    /// Invalidate what depends on the locations of the given branches
    pub(crate) fn locations_changed<I>(&mut self, branches: I)
    where
        I: IntoIterator<Item = BranchId>,
    {
        let incremental = self.config.segment_generation_method.is_incremental();
        let cache = self.cache_mut();
        cache.location_index = None;
        cache.geometry = None;
        match cache.segments.as_mut() {
            Some(segments) if incremental => {
                segments.dirty.extend(branches);
                segments.all = None;
            }
            _ => cache.segments = None,
        }
    }

    fn build_location_index(&self) -> LocationIndex {
        let mut index: LocationIndex = HashMap::new();
        for (position, location) in self.locations.iter().enumerate() {
            index.entry(location.branch_id()).or_default().push(position);
        }
        for positions in index.values_mut() {
            positions.sort_by(|a, b| {
                self.locations[*a]
                    .chainage()
                    .total_cmp(&self.locations[*b].chainage())
            });
        }
        index
    }

    /// Per-branch location index, rebuilt after location changes
    pub(crate) fn location_index(&self) -> Arc<LocationIndex> {
        if let Some(index) = self.read_cache().location_index.as_ref() {
            return Arc::clone(index);
        }
        let mut cache = self.write_cache();
        Arc::clone(
            cache
                .location_index
                .get_or_insert_with(|| Arc::new(self.build_location_index())),
        )
    }

    /// Locations on one branch, ordered by chainage
    pub fn locations_on_branch(
        &self,
        network: &Network,
        branch: BranchId,
    ) -> Result<Vec<NetworkLocation>> {
        self.check_network(network)?;
        network.branch(branch)?;
        let index = self.location_index();
        Ok(index
            .get(&branch)
            .map(|positions| {
                positions
                    .iter()
                    .map(|&position| self.locations[position].clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Position of a stored location
    pub fn index_of(&self, location: &NetworkLocation) -> Option<usize> {
        let index = self.location_index();
        index.get(&location.branch_id())?.iter().copied().find(|&position| {
            self.locations[position].same_point(location)
        })
    }

    fn sort_key(network: &Network, location: &NetworkLocation) -> (usize, f64) {
        (
            network
                .branch_position(location.branch_id())
                .unwrap_or(usize::MAX),
            location.chainage(),
        )
    }

    /// Sort locations by network order, permuting every value slice along
    pub(crate) fn sort_locations(&mut self, network: &Network) {
        let mut order: Vec<usize> = (0..self.locations.len()).collect();
        let keys: Vec<(usize, f64)> = self
            .locations
            .iter()
            .map(|location| Self::sort_key(network, location))
            .collect();
        order.sort_by(|&a, &b| {
            keys[a]
                .0
                .cmp(&keys[b].0)
                .then_with(|| keys[a].1.total_cmp(&keys[b].1))
        });
        if order.iter().enumerate().all(|(i, &position)| i == position) {
            return;
        }

        self.locations = order.iter().map(|&i| self.locations[i].clone()).collect();
        for slice in &mut self.values {
            *slice = order.iter().map(|&i| slice[i]).collect();
        }
        let branches: Vec<BranchId> = self.locations.iter().map(|l| l.branch_id()).collect();
        self.locations_changed(branches);
    }

    /// Insert a location, returning its position and whether it is new
    ///
    /// The chainage is snapped onto the branch. An equal location already present is
    /// reused, except on routes which may visit the same point twice.
    pub(crate) fn insert_location(
        &mut self,
        network: &Network,
        location: NetworkLocation,
    ) -> Result<(usize, bool)> {
        let branch = network.branch(location.branch_id())?;
        let mut location = location;
        location.relocate(branch.id(), branch.snap_chainage(location.chainage()));

        let position = if self.config.is_auto_sorted {
            let key = Self::sort_key(network, &location);
            let search = self.locations.binary_search_by(|probe| {
                if probe.same_point(&location) {
                    return std::cmp::Ordering::Equal;
                }
                let probe_key = Self::sort_key(network, probe);
                probe_key
                    .0
                    .cmp(&key.0)
                    .then_with(|| probe_key.1.total_cmp(&key.1))
            });
            match search {
                Ok(existing) => return Ok((existing, false)),
                Err(position) => position,
            }
        } else {
            if self.kind != CoverageKind::Route
                && let Some(existing) = self.index_of(&location)
            {
                return Ok((existing, false));
            }
            self.locations.len()
        };

        let branch_id = location.branch_id();
        self.locations.insert(position, location);
        let default_value = self.config.default_value;
        for slice in &mut self.values {
            slice.insert(position, default_value);
        }
        self.locations_changed([branch_id]);
        Ok((position, true))
    }

    /// Replace all locations; every value is reset to the default value
    pub fn set_locations<I>(&mut self, network: &Network, locations: I) -> Result<()>
    where
        I: IntoIterator<Item = NetworkLocation>,
    {
        self.check_network(network)?;
        let locations: Vec<NetworkLocation> = locations.into_iter().collect();
        for location in &locations {
            network.branch(location.branch_id())?;
        }

        self.locations.clear();
        for slice in &mut self.values {
            slice.clear();
        }
        self.invalidate();
        for location in locations {
            self.insert_location(network, location)?;
        }
        tracing::debug!(coverage = %self.name, locations = self.locations.len(), "locations set");
        Ok(())
    }

    /// Add a location holding the default value, returning its position
    pub fn add_location(&mut self, network: &Network, location: NetworkLocation) -> Result<usize> {
        self.check_network(network)?;
        Ok(self.insert_location(network, location)?.0)
    }

    /// Remove a location and its values
    pub fn remove_location(&mut self, location: &NetworkLocation) -> bool {
        let Some(position) = self.index_of(location) else {
            return false;
        };
        self.remove_at(position);
        true
    }

    pub(crate) fn remove_at(&mut self, position: usize) -> NetworkLocation {
        let location = self.locations.remove(position);
        for slice in &mut self.values {
            slice.remove(position);
        }
        self.locations_changed([location.branch_id()]);
        location
    }

    /// Drop locations whose branch is no longer part of the network
    pub fn remove_dangling_locations(&mut self, network: &Network) -> Result<usize> {
        self.check_network(network)?;
        let keep: Vec<bool> = self
            .locations
            .iter()
            .map(|location| network.branch(location.branch_id()).is_ok())
            .collect();
        let removed = keep.iter().filter(|keep| !**keep).count();
        if removed == 0 {
            return Ok(0);
        }

        let mut flags = keep.iter();
        self.locations.retain(|_| flags.next().copied().unwrap_or(true));
        for slice in &mut self.values {
            let mut flags = keep.iter();
            slice.retain(|_| flags.next().copied().unwrap_or(true));
        }
        self.invalidate();
        tracing::debug!(coverage = %self.name, removed, "removed dangling locations");
        Ok(removed)
    }

    /// Slice index of an exactly known time
    fn time_position(&self, time: f64) -> std::result::Result<usize, usize> {
        self.times.binary_search_by(|probe| probe.total_cmp(&time))
    }

    /// Slice holding exactly `time`
    pub(crate) fn exact_slice(&self, time: Option<f64>) -> Result<usize> {
        match (self.config.is_time_dependent, time) {
            (false, None) => Ok(0),
            (false, Some(_)) => Err(NetworkError::UnexpectedTimeFilter),
            (true, None) => Err(NetworkError::TimeFilterRequired),
            (true, Some(time)) => self
                .time_position(time)
                .map_err(|_| NetworkError::UnknownTime(time)),
        }
    }

    /// Slice used to evaluate at `time`: the exact time if known, else the latest
    /// earlier one; `None` when no earlier time exists
    pub(crate) fn evaluation_slice(&self, time: Option<f64>) -> Result<Option<usize>> {
        match (self.config.is_time_dependent, time) {
            (false, None) => Ok(Some(0)),
            (false, Some(_)) => Err(NetworkError::UnexpectedTimeFilter),
            (true, None) => Err(NetworkError::TimeFilterRequired),
            (true, Some(time)) => Ok(match self.time_position(time) {
                Ok(position) => Some(position),
                Err(0) => None,
                Err(insert_at) => Some(insert_at - 1),
            }),
        }
    }

    /// Slice for `time`, created and filled with the default value when new
    fn ensure_time(&mut self, time: f64) -> Result<usize> {
        validate_time(time)?;
        match self.time_position(time) {
            Ok(position) => Ok(position),
            Err(position) => {
                self.times.insert(position, time);
                self.values.insert(
                    position,
                    vec![self.config.default_value; self.locations.len()],
                );
                Ok(position)
            }
        }
    }

    /// Stored values at an exactly known time (or the only slice)
    pub fn values(&self, time: Option<f64>) -> Result<&[f64]> {
        let slice = self.exact_slice(time)?;
        Ok(&self.values[slice])
    }

    /// Stored value at a location, without interpolation
    pub fn stored_value(&self, time: Option<f64>, location: &NetworkLocation) -> Result<Option<f64>> {
        let slice = self.exact_slice(time)?;
        Ok(self.index_of(location).map(|position| self.values[slice][position]))
    }

    /// Set the value at a location, adding the location when needed
    pub fn set_value(
        &mut self,
        network: &Network,
        location: NetworkLocation,
        value: f64,
    ) -> Result<()> {
        self.check_network(network)?;
        if self.config.is_time_dependent {
            return Err(NetworkError::TimeFilterRequired);
        }
        let (position, _) = self.insert_location(network, location)?;
        self.values[0][position] = value;
        Ok(())
    }

    /// Set the value at a time and location, adding either when needed
    pub fn set_value_at_time(
        &mut self,
        network: &Network,
        time: f64,
        location: NetworkLocation,
        value: f64,
    ) -> Result<()> {
        self.check_network(network)?;
        if !self.config.is_time_dependent {
            return Err(NetworkError::UnexpectedTimeFilter);
        }
        validate_time(time)?;
        network.branch(location.branch_id())?;
        let (position, _) = self.insert_location(network, location)?;
        let slice = self.ensure_time(time)?;
        self.values[slice][position] = value;
        Ok(())
    }

    /// Replace all values of a coverage that is not time dependent
    pub fn set_values(&mut self, values: &[f64]) -> Result<()> {
        if self.config.is_time_dependent {
            return Err(NetworkError::TimeFilterRequired);
        }
        if values.len() != self.locations.len() {
            return Err(NetworkError::ShapeMismatch {
                expected: self.locations.len(),
                actual: values.len(),
            });
        }
        self.values[0].copy_from_slice(values);
        Ok(())
    }

    /// Store one value per location for `time`, replacing what was there
    pub fn add_values_for_time(&mut self, time: f64, values: &[f64]) -> Result<()> {
        if !self.config.is_time_dependent {
            return Err(NetworkError::UnexpectedTimeFilter);
        }
        if values.len() != self.locations.len() {
            return Err(NetworkError::ShapeMismatch {
                expected: self.locations.len(),
                actual: values.len(),
            });
        }
        let slice = self.ensure_time(time)?;
        self.values[slice].copy_from_slice(values);
        Ok(())
    }

    /// Remove a time and its values
    pub fn remove_time(&mut self, time: f64) -> Result<()> {
        let slice = self.exact_slice(Some(time))?;
        self.times.remove(slice);
        self.values.remove(slice);
        Ok(())
    }

    /// Remove all locations, times and values
    pub fn clear(&mut self) {
        self.locations.clear();
        self.times.clear();
        self.values = if self.config.is_time_dependent {
            Vec::new()
        } else {
            vec![Vec::new()]
        };
        self.invalidate();
    }

    /// Drawn positions of all locations, cached until the network or locations change
    pub fn geometry(&self, network: &Network) -> Result<Arc<MultiPoint<f64>>> {
        self.check_network(network)?;
        let generation = network.generation();
        if let Some((built_at, geometry)) = self.read_cache().geometry.as_ref()
            && *built_at == generation
        {
            return Ok(Arc::clone(geometry));
        }

        let points: Vec<_> = self
            .locations
            .iter()
            .filter_map(|location| match location.geometry(network) {
                Ok(point) => Some(point),
                Err(err) => {
                    tracing::trace!(branch = %location.branch_id(), %err, "location without geometry");
                    None
                }
            })
            .collect();
        let geometry = Arc::new(MultiPoint::new(points));
        self.write_cache().geometry = Some((generation, Arc::clone(&geometry)));
        Ok(geometry)
    }

    /// Persistence tuples for every location, in coverage order
    pub fn location_records(&self, network: &Network) -> Result<Vec<LocationRecord>> {
        self.check_network(network)?;
        self.locations
            .iter()
            .map(|location| network.location_record(location))
            .collect()
    }

    /// A borrowed view restricted to one time and/or a set of branches
    pub fn filter(&self, filter: CoverageFilter) -> Result<CoverageView<'_>> {
        let slices = match filter.time {
            Some(time) => vec![self.exact_slice(Some(time))?],
            None => (0..self.values.len()).collect(),
        };
        let indices = match filter.branches.as_ref() {
            Some(branches) => self
                .locations
                .iter()
                .enumerate()
                .filter(|(_, location)| branches.contains(&location.branch_id()))
                .map(|(position, _)| position)
                .collect(),
            None => (0..self.locations.len()).collect(),
        };
        Ok(CoverageView {
            coverage: self,
            time: filter.time,
            slices,
            indices,
            branches: filter.branches,
        })
    }

    /// Add the values of `other`, evaluated at this coverage's locations
    pub fn add_coverage(&mut self, network: &Network, other: &NetworkCoverage) -> Result<()> {
        self.combine(network, other, |a, b| a + b)
    }

    /// Subtract the values of `other`, evaluated at this coverage's locations
    pub fn subtract_coverage(&mut self, network: &Network, other: &NetworkCoverage) -> Result<()> {
        self.combine(network, other, |a, b| a - b)
    }

    fn combine<F>(&mut self, network: &Network, other: &NetworkCoverage, op: F) -> Result<()>
    where
        F: Fn(f64, f64) -> f64,
    {
        if other.network_id != self.network_id {
            return Err(NetworkError::NetworkMismatch);
        }
        self.check_network(network)?;
        if other.is_time_dependent() && !self.is_time_dependent() {
            return Err(NetworkError::TimeFilterRequired);
        }

        let mut evaluated = Vec::with_capacity(self.values.len());
        for slice in 0..self.values.len() {
            let time = other
                .is_time_dependent()
                .then(|| self.times.get(slice).copied())
                .flatten();
            let values = self
                .locations
                .iter()
                .map(|location| other.evaluate_at(network, time, location))
                .collect::<Result<Vec<f64>>>()?;
            evaluated.push(values);
        }

        for (slice, other_values) in self.values.iter_mut().zip(evaluated) {
            for (value, other_value) in slice.iter_mut().zip(other_values) {
                *value = op(*value, other_value);
            }
        }
        Ok(())
    }
}

/// Restriction applied by [`NetworkCoverage::filter`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoverageFilter {
    /// Exact time to keep; all times when absent
    pub time: Option<f64>,
    /// Branches to keep; all branches when absent
    pub branches: Option<Vec<BranchId>>,
}

impl CoverageFilter {
    pub fn at_time(time: f64) -> Self {
        Self {
            time: Some(time),
            branches: None,
        }
    }

    pub fn on_branches(branches: Vec<BranchId>) -> Self {
        Self {
            time: None,
            branches: Some(branches),
        }
    }
}

/// A time slice and/or branch subset of a coverage, sharing its storage
///
/// Interpolation inside the view reads the full data of the parent coverage.
#[derive(Debug, Clone)]
pub struct CoverageView<'a> {
    coverage: &'a NetworkCoverage,
    time: Option<f64>,
    slices: Vec<usize>,
    indices: Vec<usize>,
    branches: Option<Vec<BranchId>>,
}

impl<'a> CoverageView<'a> {
    #[inline]
    pub fn parent(&self) -> &'a NetworkCoverage {
        self.coverage
    }

    /// Times visible through the view
    pub fn times(&self) -> Vec<f64> {
        self.slices
            .iter()
            .filter_map(|&slice| self.coverage.times.get(slice).copied())
            .collect()
    }

    pub fn locations(&self) -> impl Iterator<Item = &'a NetworkLocation> + '_ {
        self.indices
            .iter()
            .map(|&position| &self.coverage.locations[position])
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Values of the visible locations; the view must expose a single time
    pub fn values(&self) -> Result<Vec<f64>> {
        let [slice] = self.slices.as_slice() else {
            return Err(NetworkError::TimeFilterRequired);
        };
        Ok(self
            .indices
            .iter()
            .map(|&position| self.coverage.values[*slice][position])
            .collect())
    }

    /// Evaluate at a location; branches outside the view yield the default value
    pub fn evaluate(&self, network: &Network, location: &NetworkLocation) -> Result<f64> {
        if let Some(branches) = self.branches.as_ref()
            && !branches.contains(&location.branch_id())
        {
            return Ok(self.coverage.default_value());
        }
        if self.coverage.is_time_dependent() && self.time.is_none() {
            return Err(NetworkError::TimeFilterRequired);
        }
        self.coverage.evaluate_at(network, self.time, location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BranchSpec;
    use geo::Point;

    fn line_network() -> (Network, BranchId, BranchId) {
        let mut network = Network::new("line");
        let a = network.add_node("a", Point::new(0.0, 0.0));
        let b = network.add_node("b", Point::new(100.0, 0.0));
        let c = network.add_node("c", Point::new(150.0, 0.0));
        let first = network.add_branch(BranchSpec::new("first", a, b)).unwrap();
        let second = network.add_branch(BranchSpec::new("second", b, c)).unwrap();
        (network, first, second)
    }

    fn location(branch: BranchId, chainage: f64) -> NetworkLocation {
        NetworkLocation::new(branch, chainage).unwrap()
    }

    #[test]
    fn test_locations_are_sorted_and_deduplicated() {
        let (network, first, second) = line_network();
        let mut coverage = NetworkCoverage::new("c", &network, CoverageConfig::default());
        coverage.set_value(&network, location(second, 10.0), 3.0).unwrap();
        coverage.set_value(&network, location(first, 80.0), 2.0).unwrap();
        coverage.set_value(&network, location(first, 20.0), 1.0).unwrap();
        coverage.set_value(&network, location(first, 20.0 + 1e-9), 1.5).unwrap();

        let chainages: Vec<f64> = coverage.locations().iter().map(|l| l.chainage()).collect();
        assert_eq!(chainages, vec![20.0, 80.0, 10.0]);
        assert_eq!(coverage.values(None).unwrap(), &[1.5, 2.0, 3.0]);
    }

    #[test]
    fn test_chainage_is_snapped_on_insert() {
        let (network, first, _) = line_network();
        let mut coverage = NetworkCoverage::new("c", &network, CoverageConfig::default());
        coverage.add_location(&network, location(first, 250.0)).unwrap();
        assert_eq!(coverage.locations()[0].chainage(), 100.0);
    }

    #[test]
    fn test_time_filter_discipline() {
        let (network, first, _) = line_network();
        let mut steady = NetworkCoverage::new("steady", &network, CoverageConfig::default());
        assert!(matches!(
            steady.set_value_at_time(&network, 0.0, location(first, 1.0), 1.0),
            Err(NetworkError::UnexpectedTimeFilter)
        ));
        assert!(matches!(
            steady.values(Some(0.0)),
            Err(NetworkError::UnexpectedTimeFilter)
        ));

        let config = CoverageConfig {
            is_time_dependent: true,
            ..CoverageConfig::default()
        };
        let mut unsteady = NetworkCoverage::new("unsteady", &network, config);
        assert!(matches!(
            unsteady.set_value(&network, location(first, 1.0), 1.0),
            Err(NetworkError::TimeFilterRequired)
        ));
        unsteady
            .set_value_at_time(&network, 10.0, location(first, 1.0), 4.0)
            .unwrap();
        unsteady
            .set_value_at_time(&network, 0.0, location(first, 1.0), 2.0)
            .unwrap();
        assert_eq!(unsteady.times(), &[0.0, 10.0]);
        assert_eq!(unsteady.values(Some(10.0)).unwrap(), &[4.0]);
        assert!(matches!(
            unsteady.values(Some(5.0)),
            Err(NetworkError::UnknownTime(_))
        ));
        assert!(matches!(
            unsteady.values(None),
            Err(NetworkError::TimeFilterRequired)
        ));
    }

    #[test]
    fn test_nan_time_leaves_coverage_untouched() {
        let (network, first, _) = line_network();
        let config = CoverageConfig {
            is_time_dependent: true,
            ..CoverageConfig::default()
        };
        let mut coverage = NetworkCoverage::new("c", &network, config);
        assert!(matches!(
            coverage.set_value_at_time(&network, f64::NAN, location(first, 1.0), 1.0),
            Err(NetworkError::InvalidArgument(_))
        ));
        assert!(coverage.locations().is_empty());
        assert!(coverage.times().is_empty());
        assert!(coverage.add_values_for_time(f64::NAN, &[]).is_err());
        assert!(coverage.times().is_empty());
    }

    #[test]
    fn test_add_values_for_time_checks_shape() {
        let (network, first, second) = line_network();
        let config = CoverageConfig {
            is_time_dependent: true,
            ..CoverageConfig::default()
        };
        let mut coverage = NetworkCoverage::new("c", &network, config);
        coverage
            .set_locations(&network, [location(first, 10.0), location(second, 10.0)])
            .unwrap();

        let err = coverage.add_values_for_time(0.0, &[1.0]).unwrap_err();
        assert!(matches!(
            err,
            NetworkError::ShapeMismatch {
                expected: 2,
                actual: 1
            }
        ));
        assert!(coverage.times().is_empty());

        coverage.add_values_for_time(0.0, &[1.0, 2.0]).unwrap();
        coverage.remove_time(0.0).unwrap();
        assert!(coverage.times().is_empty());
        assert!(coverage.remove_time(0.0).is_err());
    }

    #[test]
    fn test_network_mismatch_rejected() {
        let (network, first, _) = line_network();
        let (other_network, _, _) = line_network();
        let mut coverage = NetworkCoverage::new("c", &network, CoverageConfig::default());
        assert!(matches!(
            coverage.set_value(&other_network, location(first, 1.0), 1.0),
            Err(NetworkError::NetworkMismatch)
        ));

        let other = NetworkCoverage::new("o", &other_network, CoverageConfig::default());
        assert!(matches!(
            coverage.add_coverage(&network, &other),
            Err(NetworkError::NetworkMismatch)
        ));
    }

    #[test]
    fn test_remove_location_and_dangling() {
        let (mut network, first, second) = line_network();
        let mut coverage = NetworkCoverage::new("c", &network, CoverageConfig::default());
        coverage.set_value(&network, location(first, 10.0), 1.0).unwrap();
        coverage.set_value(&network, location(second, 10.0), 2.0).unwrap();

        assert!(coverage.remove_location(&location(first, 10.0)));
        assert!(!coverage.remove_location(&location(first, 10.0)));

        network.remove_branch(second).unwrap();
        assert_eq!(coverage.remove_dangling_locations(&network).unwrap(), 1);
        assert!(coverage.locations().is_empty());
    }

    #[test]
    fn test_filter_view() {
        let (network, first, second) = line_network();
        let config = CoverageConfig {
            is_time_dependent: true,
            default_value: -1.0,
            ..CoverageConfig::default()
        };
        let mut coverage = NetworkCoverage::new("c", &network, config);
        coverage
            .set_locations(&network, [location(first, 10.0), location(second, 10.0)])
            .unwrap();
        coverage.add_values_for_time(0.0, &[1.0, 2.0]).unwrap();
        coverage.add_values_for_time(1.0, &[3.0, 4.0]).unwrap();

        let view = coverage
            .filter(CoverageFilter {
                time: Some(1.0),
                branches: Some(vec![second]),
            })
            .unwrap();
        assert_eq!(view.len(), 1);
        assert_eq!(view.times(), vec![1.0]);
        assert_eq!(view.values().unwrap(), vec![4.0]);
        assert_eq!(view.evaluate(&network, &location(first, 10.0)).unwrap(), -1.0);
        assert_eq!(view.evaluate(&network, &location(second, 10.0)).unwrap(), 4.0);

        let all_times = coverage.filter(CoverageFilter::default()).unwrap();
        assert!(all_times.values().is_err());
        assert!(coverage.filter(CoverageFilter::at_time(0.5)).is_err());
    }

    #[test]
    fn test_add_and_subtract_coverage() {
        let (network, first, _) = line_network();
        let mut target = NetworkCoverage::new("t", &network, CoverageConfig::default());
        target.set_value(&network, location(first, 50.0), 10.0).unwrap();

        let mut other = NetworkCoverage::new("o", &network, CoverageConfig::default());
        other.set_value(&network, location(first, 0.0), 0.0).unwrap();
        other.set_value(&network, location(first, 100.0), 4.0).unwrap();

        target.add_coverage(&network, &other).unwrap();
        assert!((target.values(None).unwrap()[0] - 12.0).abs() < 1e-9);
        target.subtract_coverage(&network, &other).unwrap();
        assert!((target.values(None).unwrap()[0] - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_geometry_and_records() {
        let (network, first, second) = line_network();
        let mut coverage = NetworkCoverage::new("c", &network, CoverageConfig::default());
        coverage
            .set_locations(&network, [location(first, 25.0), location(second, 25.0)])
            .unwrap();

        let geometry = coverage.geometry(&network).unwrap();
        assert_eq!(geometry.0.len(), 2);
        assert!((geometry.0[1].x() - 125.0).abs() < 1e-9);
        assert!(Arc::ptr_eq(&geometry, &coverage.geometry(&network).unwrap()));

        let records = coverage.location_records(&network).unwrap();
        assert_eq!(records[1].branch_index, 1);
        assert_eq!(records[1].chainage, 25.0);
    }

    #[test]
    fn test_clone_starts_with_fresh_cache() {
        let (network, first, _) = line_network();
        let mut coverage = NetworkCoverage::new("c", &network, CoverageConfig::default());
        coverage.set_value(&network, location(first, 25.0), 1.0).unwrap();
        let _ = coverage.location_index();

        let clone = coverage.clone();
        assert!(clone.read_cache().location_index.is_none());
        assert_eq!(clone.locations(), coverage.locations());
    }
}
