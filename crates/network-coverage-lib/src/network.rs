//! Network graph: nodes, branches and the features they own
//!
//! The [`Network`] is an arena. Nodes, branches and features are addressed by copyable
//! handles, so branches refer to their end nodes (and features to their branch) without
//! owning them. The position of a branch in the network's branch list defines the
//! branch order used by every comparison.

use crate::editing::EditSession;
use crate::feature::validate_chainage;
use crate::{BranchFeature, Locatable, NetworkError, Result, utils};
use geo::{BoundingRect, Coord, Distance, Euclidean, LineString, Point, Rect};
use petgraph::algo::astar;
use petgraph::graph::{NodeIndex, UnGraph};
use petgraph::visit::EdgeRef;
use smallvec::SmallVec;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Order number of a branch that takes part in no ordered chain
pub const UNORDERED: i32 = -1;

static NEXT_NETWORK_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkId(u64);

/// Handle of a node within its network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NodeId(pub u64);

/// Handle of a branch within its network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BranchId(pub u64);

/// Handle of a network-owned branch feature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FeatureId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "branch#{}", self.0)
    }
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "feature#{}", self.0)
    }
}

/// How a branch geometry or length update treats the attached features
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateContext {
    /// A user edit: features keep their fractional position on the branch
    Edit,
    /// Part of a topology operation which relocates features itself
    Topology,
}

/// Configuration for a network
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NetworkConfig {
    /// Maximum distance between a geometry end point and an existing node for
    /// [`Network::connect`] to reuse the node instead of creating a new one
    pub node_tolerance: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            node_tolerance: 1e-6,
        }
    }
}

/// A vertex of the network
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) name: String,
    pub(crate) point: Point<f64>,
    pub(crate) incoming: SmallVec<[BranchId; 4]>,
    pub(crate) outgoing: SmallVec<[BranchId; 4]>,
}

impl Node {
    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn point(&self) -> Point<f64> {
        self.point
    }

    /// Branches ending at this node
    #[inline]
    pub fn incoming_branches(&self) -> &[BranchId] {
        &self.incoming
    }

    /// Branches starting at this node
    #[inline]
    pub fn outgoing_branches(&self) -> &[BranchId] {
        &self.outgoing
    }

    /// All connected branches, incoming first
    pub fn branches(&self) -> impl Iterator<Item = BranchId> + '_ {
        self.incoming.iter().chain(self.outgoing.iter()).copied()
    }

    /// Number of branch ends at this node (a self-loop counts twice)
    #[inline]
    pub fn connection_count(&self) -> usize {
        self.incoming.len() + self.outgoing.len()
    }

    /// A node without connections can be removed
    #[inline]
    pub fn is_orphaned(&self) -> bool {
        self.connection_count() == 0
    }

    fn detach(&mut self, branch: BranchId) {
        self.incoming.retain(|b| *b != branch);
        self.outgoing.retain(|b| *b != branch);
    }
}

/// A directed edge of the network
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Branch {
    pub(crate) id: BranchId,
    pub(crate) name: String,
    pub(crate) source: NodeId,
    pub(crate) target: NodeId,
    pub(crate) geometry: LineString<f64>,
    pub(crate) length: f64,
    pub(crate) geometry_length: f64,
    pub(crate) is_length_custom: bool,
    pub(crate) order_number: i32,
    pub(crate) features: Vec<BranchFeature>,
}

impl Branch {
    #[inline]
    pub fn id(&self) -> BranchId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn source(&self) -> NodeId {
        self.source
    }

    #[inline]
    pub fn target(&self) -> NodeId {
        self.target
    }

    #[inline]
    pub fn geometry(&self) -> &LineString<f64> {
        &self.geometry
    }

    /// Logical length, authoritative for all chainage arithmetic
    #[inline]
    pub fn length(&self) -> f64 {
        self.length
    }

    /// Length of the drawn polyline
    #[inline]
    pub fn geometry_length(&self) -> f64 {
        self.geometry_length
    }

    #[inline]
    pub fn is_length_custom(&self) -> bool {
        self.is_length_custom
    }

    #[inline]
    pub fn order_number(&self) -> i32 {
        self.order_number
    }

    /// Features on this branch, sorted by chainage then name
    #[inline]
    pub fn features(&self) -> &[BranchFeature] {
        &self.features
    }

    /// The node at the other end of this branch, if `node` is one of its ends
    pub fn other_node(&self, node: NodeId) -> Option<NodeId> {
        if node == self.source {
            Some(self.target)
        } else if node == self.target {
            Some(self.source)
        } else {
            None
        }
    }

    /// Snap a calculation chainage onto this branch
    #[inline]
    pub fn snap_chainage(&self, chainage: f64) -> f64 {
        utils::snap_chainage(self.length, chainage)
    }

    /// Calculation chainage to geometry chainage
    #[inline]
    pub fn map_chainage(&self, chainage: f64) -> f64 {
        utils::map_chainage(
            self.length,
            self.geometry_length,
            self.is_length_custom,
            chainage,
        )
    }

    /// Geometry chainage to calculation chainage
    #[inline]
    pub fn calculation_chainage(&self, map_chainage: f64) -> f64 {
        utils::calculation_chainage(
            self.length,
            self.geometry_length,
            self.is_length_custom,
            map_chainage,
        )
    }

    /// Point on the drawn geometry at a calculation chainage
    pub fn point_at(&self, chainage: f64) -> Option<Point<f64>> {
        utils::point_along(&self.geometry, self.map_chainage(chainage)).map(Point::from)
    }

    /// Rescale every attached feature by `factor`, snapping onto `new_length`
    pub(crate) fn update_feature_chainages(&mut self, factor: f64, new_length: f64) {
        for feature in &mut self.features {
            feature.chainage = utils::snap_chainage(new_length, feature.chainage * factor);
            if feature.length > 0.0 {
                feature.length =
                    (feature.length * factor).min(new_length - feature.chainage).max(0.0);
            }
        }
    }

    pub(crate) fn sort_features(&mut self) {
        self.features.sort_by(|a, b| {
            a.chainage
                .total_cmp(&b.chainage)
                .then_with(|| a.name.cmp(&b.name))
        });
    }

    pub(crate) fn insert_feature(&mut self, feature: BranchFeature) {
        let position = self.features.partition_point(|f| {
            f.chainage
                .total_cmp(&feature.chainage)
                .then_with(|| f.name.cmp(&feature.name))
                != Ordering::Greater
        });
        self.features.insert(position, feature);
    }
}

/// Parameters for [`Network::add_branch`]
#[derive(Debug, Clone)]
pub struct BranchSpec {
    pub name: String,
    pub source: NodeId,
    pub target: NodeId,
    /// Drawn geometry; a straight line between the end nodes when absent
    pub geometry: Option<LineString<f64>>,
    /// Custom logical length; the geometry length is used when absent
    pub custom_length: Option<f64>,
    /// Preset order number; assigned from the neighbours when absent
    pub order_number: Option<i32>,
}

impl BranchSpec {
    pub fn new(name: impl Into<String>, source: NodeId, target: NodeId) -> Self {
        Self {
            name: name.into(),
            source,
            target,
            geometry: None,
            custom_length: None,
            order_number: None,
        }
    }

    pub fn with_geometry(mut self, geometry: LineString<f64>) -> Self {
        self.geometry = Some(geometry);
        self
    }

    pub fn with_custom_length(mut self, length: f64) -> Self {
        self.custom_length = Some(length);
        self
    }

    pub fn with_order_number(mut self, order_number: i32) -> Self {
        self.order_number = Some(order_number);
        self
    }
}

/// Positions of nodes, branches and features in the arena
#[derive(Debug, Default)]
struct NetworkIndex {
    nodes: HashMap<NodeId, usize>,
    branches: HashMap<BranchId, usize>,
    features: HashMap<FeatureId, (usize, usize)>,
}

/// Undirected connectivity used for path finding, one edge per branch
#[derive(Debug, Default)]
struct BranchGraph {
    graph: UnGraph<NodeId, BranchId>,
    nodes: HashMap<NodeId, NodeIndex>,
}

/// A branched 1-D network
#[derive(Debug)]
pub struct Network {
    id: NetworkId,
    name: String,
    config: NetworkConfig,
    pub(crate) nodes: Vec<Node>,
    pub(crate) branches: Vec<Branch>,
    pub(crate) next_id: u64,
    generation: u64,
    /// Lazily rebuilt after every structural change
    index: OnceLock<NetworkIndex>,
    graph: OnceLock<BranchGraph>,
    pub(crate) edit: Option<EditSession>,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl Network {
    /// Create an empty network with the default configuration
    pub fn new(name: &str) -> Self {
        Self::with_config(name, NetworkConfig::default())
    }

    /// Create an empty network with the given configuration
    pub fn with_config(name: &str, config: NetworkConfig) -> Self {
        Self {
            id: NetworkId(NEXT_NETWORK_ID.fetch_add(1, AtomicOrdering::Relaxed)),
            name: name.to_string(),
            config,
            nodes: Vec::new(),
            branches: Vec::new(),
            next_id: 1,
            generation: 0,
            index: OnceLock::new(),
            graph: OnceLock::new(),
            edit: None,
        }
    }

    #[inline]
    pub fn id(&self) -> NetworkId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Counter bumped by every structural or geometric change
    ///
    /// Derived caches record the generation they were built at and rebuild when it moves.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Branches in network order
    #[inline]
    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.branches.is_empty() && self.nodes.is_empty()
    }

    /// Invalidate positional caches after a structural change
    pub(crate) fn touch(&mut self) {
        self.generation += 1;
        self.index = OnceLock::new();
        self.graph = OnceLock::new();
    }

    pub(crate) fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn index(&self) -> &NetworkIndex {
        self.index.get_or_init(|| {
            tracing::trace!(network = %self.name, generation = self.generation, "rebuilding network index");
            let mut index = NetworkIndex::default();
            for (position, node) in self.nodes.iter().enumerate() {
                index.nodes.insert(node.id, position);
            }
            for (position, branch) in self.branches.iter().enumerate() {
                index.branches.insert(branch.id, position);
                for (feature_position, feature) in branch.features.iter().enumerate() {
                    if let Some(id) = feature.id {
                        index.features.insert(id, (position, feature_position));
                    }
                }
            }
            index
        })
    }

    fn graph(&self) -> &BranchGraph {
        self.graph.get_or_init(|| {
            tracing::trace!(network = %self.name, generation = self.generation, "rebuilding branch graph");
            let mut graph = UnGraph::with_capacity(self.nodes.len(), self.branches.len());
            let mut nodes = HashMap::with_capacity(self.nodes.len());
            for node in &self.nodes {
                nodes.insert(node.id, graph.add_node(node.id));
            }
            for branch in &self.branches {
                if let (Some(&a), Some(&b)) = (nodes.get(&branch.source), nodes.get(&branch.target)) {
                    graph.add_edge(a, b, branch.id);
                }
            }
            BranchGraph { graph, nodes }
        })
    }

    /// Position of a node in the node list
    pub fn node_position(&self, id: NodeId) -> Option<usize> {
        self.index().nodes.get(&id).copied()
    }

    /// Position of a branch in network order
    pub fn branch_position(&self, id: BranchId) -> Option<usize> {
        self.index().branches.get(&id).copied()
    }

    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.node_position(id)
            .map(|position| &self.nodes[position])
            .ok_or(NetworkError::UnknownNode(id))
    }

    pub fn branch(&self, id: BranchId) -> Result<&Branch> {
        self.branch_position(id)
            .map(|position| &self.branches[position])
            .ok_or(NetworkError::UnknownBranch(id))
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        let position = self.node_position(id).ok_or(NetworkError::UnknownNode(id))?;
        Ok(&mut self.nodes[position])
    }

    pub(crate) fn branch_mut(&mut self, id: BranchId) -> Result<&mut Branch> {
        let position = self
            .branch_position(id)
            .ok_or(NetworkError::UnknownBranch(id))?;
        Ok(&mut self.branches[position])
    }

    /// Look up a branch by its position in network order
    pub fn branch_at(&self, position: usize) -> Option<&Branch> {
        self.branches.get(position)
    }

    /// Compare two branches by their position in the network
    pub fn compare_branches(&self, a: BranchId, b: BranchId) -> Result<Ordering> {
        let position_a = self.branch_position(a).ok_or(NetworkError::UnknownBranch(a))?;
        let position_b = self.branch_position(b).ok_or(NetworkError::UnknownBranch(b))?;
        Ok(position_a.cmp(&position_b))
    }

    /// Add a node at the given point
    pub fn add_node(&mut self, name: &str, point: Point<f64>) -> NodeId {
        let id = NodeId(self.allocate_id());
        self.nodes.push(Node {
            id,
            name: name.to_string(),
            point,
            incoming: SmallVec::new(),
            outgoing: SmallVec::new(),
        });
        self.touch();
        id
    }

    /// Remove a node; only orphaned nodes can be removed
    pub fn remove_node(&mut self, id: NodeId) -> Result<()> {
        let node = self.node(id)?;
        if !node.is_orphaned() {
            return Err(NetworkError::InvalidArgument(format!(
                "{id} still has {} connected branches",
                node.connection_count()
            )));
        }
        self.nodes.retain(|n| n.id != id);
        self.touch();
        Ok(())
    }

    /// Add a branch between two existing nodes
    ///
    /// Without a preset order number, the branch is numbered by the order assignment
    /// rule, see [`Network::assign_order_number`].
    pub fn add_branch(&mut self, spec: BranchSpec) -> Result<BranchId> {
        let source_point = self.node(spec.source)?.point;
        let target_point = self.node(spec.target)?.point;

        let geometry = spec.geometry.unwrap_or_else(|| {
            LineString::from(vec![Coord::from(source_point), Coord::from(target_point)])
        });
        if geometry.0.len() < 2 {
            return Err(NetworkError::InvalidGeometry(format!(
                "branch '{}' needs at least two coordinates",
                spec.name
            )));
        }
        let geometry_length = utils::polyline_length(&geometry);

        let (length, is_length_custom) = match spec.custom_length {
            Some(length) if length < 0.0 || length.is_nan() => {
                return Err(NetworkError::InvalidLength(length));
            }
            Some(length) => (length, true),
            None => (geometry_length, false),
        };

        let id = BranchId(self.allocate_id());
        self.branches.push(Branch {
            id,
            name: spec.name,
            source: spec.source,
            target: spec.target,
            geometry,
            length,
            geometry_length,
            is_length_custom,
            order_number: spec.order_number.unwrap_or(UNORDERED),
            features: Vec::new(),
        });
        self.touch();
        self.node_mut(spec.source)?.outgoing.push(id);
        self.node_mut(spec.target)?.incoming.push(id);

        if spec.order_number.is_none() {
            let order_number = self.assign_order_number(id)?;
            self.branch_mut(id)?.order_number = order_number;
        }

        tracing::debug!(branch = %id, length, "added branch");
        Ok(id)
    }

    /// Add a branch from geometry alone, reusing nodes near its end points
    pub fn connect(&mut self, name: &str, geometry: LineString<f64>) -> Result<BranchId> {
        let (Some(first), Some(last)) = (geometry.0.first().copied(), geometry.0.last().copied())
        else {
            return Err(NetworkError::InvalidGeometry(format!(
                "branch '{name}' has no coordinates"
            )));
        };

        let source = match self.node_near(first.into()) {
            Some(node) => node,
            None => self.add_node(&format!("{name}_source"), first.into()),
        };
        let target = match self.node_near(last.into()) {
            Some(node) => node,
            None => self.add_node(&format!("{name}_target"), last.into()),
        };

        self.add_branch(BranchSpec::new(name, source, target).with_geometry(geometry))
    }

    /// The first node within the configured tolerance of `point`
    pub fn node_near(&self, point: Point<f64>) -> Option<NodeId> {
        let tolerance = self.config.node_tolerance;
        self.nodes
            .iter()
            .find(|node| {
                (node.point.x() - point.x()).hypot(node.point.y() - point.y()) <= tolerance
            })
            .map(|node| node.id)
    }

    /// Order number for a freshly connected branch
    ///
    /// - both ends fresh (only this branch): keep the current number
    /// - any end with more than two connections: unordered
    /// - one end with two connections, the other fresh: inherit the highest order
    ///   number among the other branches at the two-connection end
    pub fn assign_order_number(&self, branch: BranchId) -> Result<i32> {
        let current = self.branch(branch)?;
        let source = self.node(current.source)?;
        let target = self.node(current.target)?;
        let (source_count, target_count) = (source.connection_count(), target.connection_count());

        if source_count > 2 || target_count > 2 {
            return Ok(UNORDERED);
        }

        let shared = match (source_count, target_count) {
            (2, 1) => source,
            (1, 2) => target,
            _ => return Ok(current.order_number),
        };

        let inherited = shared
            .branches()
            .filter(|b| *b != branch)
            .filter_map(|b| self.branch(b).ok())
            .map(|b| b.order_number)
            .max()
            .unwrap_or(current.order_number);
        Ok(inherited)
    }

    /// Set the order number of a branch
    pub fn set_order_number(&mut self, branch: BranchId, order_number: i32) -> Result<()> {
        self.branch_mut(branch)?.order_number = order_number;
        self.touch();
        Ok(())
    }

    /// Remove a branch and any node it leaves orphaned
    pub fn remove_branch(&mut self, id: BranchId) -> Result<Branch> {
        let position = self
            .branch_position(id)
            .ok_or(NetworkError::UnknownBranch(id))?;
        let branch = self.branches.remove(position);

        for node_id in [branch.source, branch.target] {
            if let Some(node) = self.nodes.iter_mut().find(|n| n.id == node_id) {
                node.detach(id);
            }
        }
        self.nodes.retain(|node| {
            let orphaned = node.is_orphaned() && (node.id == branch.source || node.id == branch.target);
            if orphaned {
                tracing::debug!(node = %node.id, "removing orphaned node");
            }
            !orphaned
        });

        self.touch();
        Ok(branch)
    }

    /// Replace the drawn geometry of a branch
    ///
    /// With [`UpdateContext::Edit`] the attached features keep their fractional position
    /// whenever the logical length changes (i.e. the length is not custom), and inside an
    /// edit the change is logged for observers, see [`crate::editing::set_branch_geometry`].
    pub fn set_branch_geometry(
        &mut self,
        id: BranchId,
        geometry: LineString<f64>,
        context: UpdateContext,
    ) -> Result<()> {
        if geometry.0.len() < 2 {
            return Err(NetworkError::InvalidGeometry(format!(
                "{id} needs at least two coordinates"
            )));
        }
        let geometry_length = utils::polyline_length(&geometry);
        let branch = self.branch_mut(id)?;
        let old_length = branch.length;

        branch.geometry = geometry;
        branch.geometry_length = geometry_length;
        if !branch.is_length_custom {
            branch.length = geometry_length;
            if context == UpdateContext::Edit {
                branch.update_feature_chainages(
                    utils::scale_factor(old_length, geometry_length),
                    geometry_length,
                );
            }
        }
        let new_length = branch.length;

        self.touch();
        if context == UpdateContext::Edit {
            self.record_rescale(id, old_length, new_length);
        }
        Ok(())
    }

    /// Set a custom logical length, marking the branch length as custom
    ///
    /// Rescales like [`Network::set_branch_geometry`].
    pub fn set_branch_length(
        &mut self,
        id: BranchId,
        length: f64,
        context: UpdateContext,
    ) -> Result<()> {
        if length < 0.0 || length.is_nan() {
            return Err(NetworkError::InvalidLength(length));
        }
        let branch = self.branch_mut(id)?;
        let old_length = branch.length;
        branch.length = length;
        branch.is_length_custom = true;
        if context == UpdateContext::Edit {
            branch.update_feature_chainages(utils::scale_factor(old_length, length), length);
        }
        self.touch();
        if context == UpdateContext::Edit {
            self.record_rescale(id, old_length, length);
        }
        Ok(())
    }

    /// Toggle the custom length flag
    ///
    /// Switching it off makes the geometry length authoritative again, rescaling like
    /// [`Network::set_branch_geometry`].
    pub fn set_length_custom(
        &mut self,
        id: BranchId,
        is_length_custom: bool,
        context: UpdateContext,
    ) -> Result<()> {
        let branch = self.branch_mut(id)?;
        if branch.is_length_custom == is_length_custom {
            return Ok(());
        }
        branch.is_length_custom = is_length_custom;
        let old_length = branch.length;
        if !is_length_custom {
            branch.length = branch.geometry_length;
            if context == UpdateContext::Edit {
                let new_length = branch.length;
                branch.update_feature_chainages(utils::scale_factor(old_length, new_length), new_length);
            }
        }
        let new_length = branch.length;
        self.touch();
        if context == UpdateContext::Edit {
            self.record_rescale(id, old_length, new_length);
        }
        Ok(())
    }

    /// Move a node, dragging the corresponding ends of the connected geometries along
    pub fn move_node(&mut self, id: NodeId, point: Point<f64>) -> Result<()> {
        let node = self.node_mut(id)?;
        node.point = point;
        let (outgoing, incoming) = (node.outgoing.clone(), node.incoming.clone());

        for branch in outgoing {
            let mut geometry = self.branch(branch)?.geometry.clone();
            if let Some(first) = geometry.0.first_mut() {
                *first = point.into();
            }
            self.set_branch_geometry(branch, geometry, UpdateContext::Edit)?;
        }
        for branch in incoming {
            let mut geometry = self.branch(branch)?.geometry.clone();
            if let Some(last) = geometry.0.last_mut() {
                *last = point.into();
            }
            self.set_branch_geometry(branch, geometry, UpdateContext::Edit)?;
        }
        self.touch();
        Ok(())
    }

    /// Attach a feature to a branch
    pub fn add_feature(&mut self, branch: BranchId, mut feature: BranchFeature) -> Result<FeatureId> {
        validate_chainage(feature.chainage)?;
        let id = FeatureId(self.allocate_id());
        let target = self.branch_mut(branch)?;
        feature.id = Some(id);
        feature.branch = Some(branch);
        feature.chainage = target.snap_chainage(feature.chainage);
        target.insert_feature(feature);
        self.touch();
        Ok(id)
    }

    /// Detach a feature from its branch
    pub fn remove_feature(&mut self, id: FeatureId) -> Result<BranchFeature> {
        let (branch_position, feature_position) = self
            .index()
            .features
            .get(&id)
            .copied()
            .ok_or(NetworkError::UnknownFeature(id))?;
        let mut feature = self.branches[branch_position].features.remove(feature_position);
        feature.branch = None;
        self.touch();
        Ok(feature)
    }

    pub fn feature(&self, id: FeatureId) -> Result<&BranchFeature> {
        self.index()
            .features
            .get(&id)
            .map(|&(branch, feature)| &self.branches[branch].features[feature])
            .ok_or(NetworkError::UnknownFeature(id))
    }

    /// Features attached to a branch, sorted by chainage then name
    pub fn features(&self, branch: BranchId) -> Result<&[BranchFeature]> {
        Ok(self.branch(branch)?.features())
    }

    /// Move a feature along its branch
    pub fn set_feature_chainage(&mut self, id: FeatureId, chainage: f64) -> Result<()> {
        validate_chainage(chainage)?;
        let (branch_position, feature_position) = self
            .index()
            .features
            .get(&id)
            .copied()
            .ok_or(NetworkError::UnknownFeature(id))?;
        let branch = &mut self.branches[branch_position];
        branch.features[feature_position].chainage = branch.snap_chainage(chainage);
        branch.sort_features();
        self.touch();
        Ok(())
    }

    /// Drawn position of a feature
    pub fn feature_point(&self, id: FeatureId) -> Result<Point<f64>> {
        let feature = self.feature(id)?;
        let branch_id = feature.branch().ok_or(NetworkError::DetachedFeature)?;
        self.point_at(branch_id, feature.chainage)
    }

    /// Point on the drawn geometry at a calculation chainage
    pub fn point_at(&self, branch: BranchId, chainage: f64) -> Result<Point<f64>> {
        let branch_ref = self.branch(branch)?;
        branch_ref
            .point_at(branch_ref.snap_chainage(chainage))
            .ok_or_else(|| NetworkError::InvalidGeometry(format!("{branch} has no geometry")))
    }

    /// Part of a branch geometry between two calculation chainages
    ///
    /// The line runs backwards when `to < from`.
    pub fn sub_geometry(&self, branch: BranchId, from: f64, to: f64) -> Result<LineString<f64>> {
        let branch = self.branch(branch)?;
        Ok(utils::sub_line(
            &branch.geometry,
            branch.map_chainage(branch.snap_chainage(from)),
            branch.map_chainage(branch.snap_chainage(to)),
        ))
    }

    /// The branch closest to `point` within `tolerance`
    ///
    /// Returns the branch, the calculation chainage of the projected point and the
    /// distance to the branch. Ties resolve to the branch first in network order.
    pub fn nearest_branch(&self, point: Point<f64>, tolerance: f64) -> Option<(BranchId, f64, f64)> {
        let mut best: Option<(BranchId, f64, f64)> = None;
        for branch in &self.branches {
            let offset = Euclidean.distance(&point, &branch.geometry);
            if offset > tolerance || best.is_some_and(|(_, _, best_offset)| offset >= best_offset) {
                continue;
            }
            let Some(projection) = utils::project_onto(&branch.geometry, point.into()) else {
                continue;
            };
            let chainage = branch.snap_chainage(branch.calculation_chainage(projection.along));
            best = Some((branch.id, chainage, offset));
        }
        best
    }

    /// Bounding rectangle of all branch geometries and nodes
    pub fn extent(&self) -> Option<Rect<f64>> {
        let rects = self
            .branches
            .iter()
            .filter_map(|b| b.geometry.bounding_rect())
            .chain(self.nodes.iter().map(|n| n.point.bounding_rect()));

        rects.reduce(|a, b| {
            Rect::new(
                Coord {
                    x: a.min().x.min(b.min().x),
                    y: a.min().y.min(b.min().y),
                },
                Coord {
                    x: a.max().x.max(b.max().x),
                    y: a.max().y.max(b.max().y),
                },
            )
        })
    }

    /// The single other branch with the same order number at `node`
    ///
    /// Interpolation may only cross a node that is a clean pass-through: the branch is
    /// ordered and exactly one other branch at the node shares its order number.
    pub fn pass_through_branch(&self, branch: BranchId, node: NodeId) -> Option<BranchId> {
        let order_number = self.branch(branch).ok()?.order_number;
        if order_number == UNORDERED {
            return None;
        }

        let mut candidates: SmallVec<[BranchId; 4]> = SmallVec::new();
        for other in self.node(node).ok()?.branches() {
            if other == branch || candidates.contains(&other) {
                continue;
            }
            if self.branch(other).is_ok_and(|b| b.order_number == order_number) {
                candidates.push(other);
            }
        }

        match candidates.as_slice() {
            [single] => Some(*single),
            [] => None,
            _ => {
                tracing::trace!(%branch, %node, candidates = candidates.len(), "ambiguous pass-through node");
                None
            }
        }
    }

    /// Shortest path between two nodes with branch lengths as weights
    pub fn shortest_path_by_length(&self, source: NodeId, target: NodeId) -> Vec<BranchId> {
        self.shortest_path(source, target, |branch| branch.length)
    }

    /// Shortest path between two nodes, ignoring branch direction
    ///
    /// Returns the traversed branches in order, or an empty path when either node is
    /// unknown, both are the same, or no route exists.
    pub fn shortest_path<F>(&self, source: NodeId, target: NodeId, weight: F) -> Vec<BranchId>
    where
        F: Fn(&Branch) -> f64,
    {
        #[cfg(feature = "profiling")]
        profiling::scope!("network::shortest_path");

        if source == target || self.node(source).is_err() || self.node(target).is_err() {
            return Vec::new();
        }

        let BranchGraph { graph, nodes } = self.graph();
        let (Some(&start), Some(&end)) = (nodes.get(&source), nodes.get(&target)) else {
            return Vec::new();
        };
        let cost = |branch: BranchId| {
            self.branch(branch)
                .map(|b| weight(b).max(0.0))
                .unwrap_or(f64::INFINITY)
        };
        let Some((_, hops)) = astar(graph, start, |n| n == end, |e| cost(*e.weight()), |_| 0.0)
        else {
            return Vec::new();
        };

        // Parallel branches between two nodes: take the lighter one
        hops.windows(2)
            .filter_map(|pair| {
                graph
                    .edges_connecting(pair[0], pair[1])
                    .map(|edge| *edge.weight())
                    .min_by(|a, b| cost(*a).total_cmp(&cost(*b)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FeatureKind, Named};

    /// Three straight branches of length 10 chained along the x axis
    fn chain(order_number: Option<i32>) -> (Network, Vec<BranchId>) {
        let mut network = Network::new("chain");
        let nodes: Vec<NodeId> = (0..4)
            .map(|i| network.add_node(&format!("n{i}"), Point::new(i as f64 * 10.0, 0.0)))
            .collect();
        let branches = (0..3)
            .map(|i| {
                let mut spec = BranchSpec::new(format!("b{i}"), nodes[i], nodes[i + 1]);
                if let Some(order_number) = order_number {
                    spec = spec.with_order_number(order_number);
                }
                network.add_branch(spec).unwrap()
            })
            .collect();
        (network, branches)
    }

    #[test]
    fn test_add_branch_connects_nodes() {
        let (network, branches) = chain(Some(1));
        assert_eq!(network.branches().len(), 3);
        assert_eq!(network.nodes().len(), 4);

        let middle = network.branch(branches[1]).unwrap();
        assert!((middle.length() - 10.0).abs() < 1e-12);
        assert!(!middle.is_length_custom());
        let source = network.node(middle.source()).unwrap();
        assert_eq!(source.incoming_branches(), &[branches[0]]);
        assert_eq!(source.outgoing_branches(), &[branches[1]]);
    }

    #[test]
    fn test_add_branch_rejects_negative_length() {
        let mut network = Network::new("n");
        let a = network.add_node("a", Point::new(0.0, 0.0));
        let b = network.add_node("b", Point::new(1.0, 0.0));
        let result = network.add_branch(BranchSpec::new("ab", a, b).with_custom_length(-1.0));
        assert!(matches!(result, Err(NetworkError::InvalidLength(_))));
        assert!(network.branches().is_empty());
    }

    #[test]
    fn test_order_assignment_inherits_along_chain() {
        let mut network = Network::new("order");
        let a = network.add_node("a", Point::new(0.0, 0.0));
        let b = network.add_node("b", Point::new(10.0, 0.0));
        let c = network.add_node("c", Point::new(20.0, 0.0));
        let d = network.add_node("d", Point::new(20.0, 10.0));
        let e = network.add_node("e", Point::new(20.0, -10.0));

        let first = network
            .add_branch(BranchSpec::new("ab", a, b).with_order_number(3))
            .unwrap();
        let second = network.add_branch(BranchSpec::new("bc", b, c)).unwrap();
        assert_eq!(network.branch(first).unwrap().order_number(), 3);
        assert_eq!(network.branch(second).unwrap().order_number(), 3);

        // c now has two connections; the third branch at c is inherited, the fourth is not
        let third = network.add_branch(BranchSpec::new("cd", c, d)).unwrap();
        assert_eq!(network.branch(third).unwrap().order_number(), 3);
        let fourth = network.add_branch(BranchSpec::new("ce", c, e)).unwrap();
        assert_eq!(network.branch(fourth).unwrap().order_number(), UNORDERED);
    }

    #[test]
    fn test_fresh_branch_keeps_unordered() {
        let mut network = Network::new("fresh");
        let id = network
            .connect("free", LineString::from(vec![(0.0, 0.0), (5.0, 0.0)]))
            .unwrap();
        assert_eq!(network.branch(id).unwrap().order_number(), UNORDERED);
    }

    #[test]
    fn test_connect_reuses_nodes() {
        let mut network = Network::new("connect");
        network
            .connect("a", LineString::from(vec![(0.0, 0.0), (10.0, 0.0)]))
            .unwrap();
        network
            .connect("b", LineString::from(vec![(10.0, 0.0), (10.0, 10.0)]))
            .unwrap();
        assert_eq!(network.nodes().len(), 3);
    }

    #[test]
    fn test_remove_branch_removes_orphans() {
        let (mut network, branches) = chain(None);
        network.remove_branch(branches[2]).unwrap();
        assert_eq!(network.nodes().len(), 3);
        network.remove_branch(branches[0]).unwrap();
        assert_eq!(network.nodes().len(), 2);
        assert!(network.branch(branches[0]).is_err());
    }

    #[test]
    fn test_compare_branches_follows_position() {
        let (mut network, branches) = chain(None);
        assert_eq!(
            network.compare_branches(branches[0], branches[2]).unwrap(),
            Ordering::Less
        );
        network.remove_branch(branches[0]).unwrap();
        assert!(network.compare_branches(branches[0], branches[2]).is_err());
        assert_eq!(network.branch_position(branches[2]), Some(1));
    }

    #[test]
    fn test_generation_moves_on_change() {
        let (mut network, branches) = chain(None);
        let before = network.generation();
        network
            .set_branch_length(branches[0], 20.0, UpdateContext::Edit)
            .unwrap();
        assert!(network.generation() > before);
    }

    #[test]
    fn test_geometry_change_compensates_features() {
        let (mut network, branches) = chain(None);
        let id = network
            .add_feature(
                branches[0],
                BranchFeature::new("obs", FeatureKind::ObservationPoint, 4.0).unwrap(),
            )
            .unwrap();

        network
            .set_branch_geometry(
                branches[0],
                LineString::from(vec![(0.0, 0.0), (20.0, 0.0)]),
                UpdateContext::Edit,
            )
            .unwrap();
        assert!((network.feature(id).unwrap().chainage() - 8.0).abs() < 1e-9);

        network
            .set_branch_geometry(
                branches[0],
                LineString::from(vec![(0.0, 0.0), (40.0, 0.0)]),
                UpdateContext::Topology,
            )
            .unwrap();
        assert!((network.feature(id).unwrap().chainage() - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_custom_length_maps_chainage() {
        let (mut network, branches) = chain(None);
        network
            .set_branch_length(branches[1], 100.0, UpdateContext::Edit)
            .unwrap();
        let branch = network.branch(branches[1]).unwrap();
        assert!(branch.is_length_custom());
        assert!((branch.map_chainage(50.0) - 5.0).abs() < 1e-12);
        let point = network.point_at(branches[1], 50.0).unwrap();
        assert!((point.x() - 15.0).abs() < 1e-9);

        network
            .set_length_custom(branches[1], false, UpdateContext::Edit)
            .unwrap();
        assert!((network.branch(branches[1]).unwrap().length() - 10.0).abs() < 1e-12);
    }

    #[test]
    fn test_custom_length_round_trip() {
        let (mut network, branches) = chain(None);
        network
            .set_branch_length(branches[0], 37.0, UpdateContext::Edit)
            .unwrap();
        let branch = network.branch(branches[0]).unwrap();
        for step in 0..=37 {
            let chainage = step as f64;
            let back = branch.calculation_chainage(branch.map_chainage(chainage));
            assert!((back - chainage).abs() < 1e-6);
        }
    }

    #[test]
    fn test_shortest_path() {
        let (network, branches) = chain(None);
        let first = network.branch(branches[0]).unwrap().source();
        let last = network.branch(branches[2]).unwrap().target();
        assert_eq!(network.shortest_path_by_length(first, last), branches);
        assert_eq!(
            network.shortest_path_by_length(last, first),
            branches.iter().rev().copied().collect::<Vec<_>>()
        );
        assert!(network.shortest_path_by_length(first, first).is_empty());
        assert!(network.shortest_path_by_length(first, NodeId(999)).is_empty());
    }

    #[test]
    fn test_shortest_path_prefers_lighter_branch() {
        let mut network = Network::new("parallel");
        let a = network.add_node("a", Point::new(0.0, 0.0));
        let b = network.add_node("b", Point::new(10.0, 0.0));
        let long = network
            .add_branch(BranchSpec::new("long", a, b).with_custom_length(50.0))
            .unwrap();
        let short = network.add_branch(BranchSpec::new("short", a, b)).unwrap();
        assert_eq!(network.shortest_path_by_length(a, b), vec![short]);
        let by_id = |branch: &Branch| if branch.id() == long { 1.0 } else { 5.0 };
        assert_eq!(network.shortest_path(a, b, by_id), vec![long]);
    }

    #[test]
    fn test_shortest_path_zero_length_and_rebuilt_graph() {
        let (mut network, branches) = chain(None);
        network
            .set_branch_length(branches[1], 0.0, UpdateContext::Topology)
            .unwrap();
        let first = network.branch(branches[0]).unwrap().source();
        let last = network.branch(branches[2]).unwrap().target();
        assert_eq!(network.shortest_path_by_length(first, last), branches);

        let shortcut = network
            .add_branch(BranchSpec::new("shortcut", first, last).with_custom_length(1.0))
            .unwrap();
        assert_eq!(network.shortest_path_by_length(first, last), vec![shortcut]);
    }

    #[test]
    fn test_shortest_path_disconnected() {
        let mut network = Network::new("islands");
        network
            .connect("a", LineString::from(vec![(0.0, 0.0), (1.0, 0.0)]))
            .unwrap();
        network
            .connect("b", LineString::from(vec![(5.0, 0.0), (6.0, 0.0)]))
            .unwrap();
        let from = network.node_near(Point::new(0.0, 0.0)).unwrap();
        let to = network.node_near(Point::new(6.0, 0.0)).unwrap();
        assert!(network.shortest_path_by_length(from, to).is_empty());
    }

    #[test]
    fn test_pass_through_branch() {
        let (network, branches) = chain(Some(1));
        let middle = network.branch(branches[1]).unwrap();
        assert_eq!(
            network.pass_through_branch(branches[1], middle.source()),
            Some(branches[0])
        );
        assert_eq!(
            network.pass_through_branch(branches[1], middle.target()),
            Some(branches[2])
        );
        let first = network.branch(branches[0]).unwrap();
        assert_eq!(network.pass_through_branch(branches[0], first.source()), None);

        let (unordered, branches) = chain(None);
        let middle = unordered.branch(branches[1]).unwrap();
        assert_eq!(unordered.pass_through_branch(branches[1], middle.source()), None);
    }

    #[test]
    fn test_nearest_branch() {
        let (network, branches) = chain(None);
        let (branch, chainage, offset) = network.nearest_branch(Point::new(14.0, 0.5), 1.0).unwrap();
        assert_eq!(branch, branches[1]);
        assert!((chainage - 4.0).abs() < 1e-9);
        assert!((offset - 0.5).abs() < 1e-9);
        assert!(network.nearest_branch(Point::new(14.0, 5.0), 1.0).is_none());
    }

    #[test]
    fn test_features_sorted_and_removable() {
        let (mut network, branches) = chain(None);
        let late = network
            .add_feature(branches[0], BranchFeature::new("late", FeatureKind::Structure, 9.0).unwrap())
            .unwrap();
        network
            .add_feature(branches[0], BranchFeature::new("early", FeatureKind::Structure, 1.0).unwrap())
            .unwrap();
        let names: Vec<&str> = network
            .branch(branches[0])
            .unwrap()
            .features()
            .iter()
            .map(|f| f.name())
            .collect();
        assert_eq!(names, vec!["early", "late"]);

        let removed = network.remove_feature(late).unwrap();
        assert_eq!(removed.branch(), None);
        assert!(network.feature(late).is_err());
        let early = network.branch(branches[0]).unwrap().features()[0].id().unwrap();
        assert!((network.feature_point(early).unwrap().x() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_extent() {
        let (network, _) = chain(None);
        let extent = network.extent().unwrap();
        assert_eq!(extent.min().x, 0.0);
        assert_eq!(extent.max().x, 30.0);
    }
}
