//! Topology editing: split, merge, reverse and reorder
//!
//! Primitive edits on a [`Network`] are only valid inside a `begin_edit`/`end_edit`
//! bracket. Each primitive records a [`TopologyChange`]; when the outermost edit ends the
//! network hands back a [`CompletedEdit`] and every [`TopologyObserver`] (coverages,
//! routes) relocates its own data from that change log. A cancelled edit restores the
//! network as it was when the edit began, and observers never see it.
//!
//! Geometry and length updates made with [`UpdateContext::Edit`] inside an edit are
//! logged as [`TopologyChange::BranchRescaled`], so observers stretch their locations
//! along with the branch features.
//!
//! The driver functions ([`split_branch_at_node`], [`merge_node_branches`],
//! [`reverse_branch`], [`reorder_branches`], [`set_branch_geometry`],
//! [`set_branch_length`], [`set_length_custom`], [`move_node`]) bracket a single
//! operation, notify the observers and cancel the edit on failure. Observers of another
//! network are rejected before the network is touched.

use crate::coverage::CoverageKind;
use crate::{
    Branch, BranchId, FeatureId, Locatable, Network, NetworkCoverage, NetworkError, NetworkId,
    NetworkLocation, Node, NodeId, Result, UpdateContext, utils,
};
use geo::{LineString, Point};
use std::collections::HashSet;

/// The kind of edit bracketed by [`Network::begin_edit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EditOperation {
    SplitBranch,
    MergeBranches,
    ReverseBranch,
    ReorderBranches,
    /// Geometry, length or node position updates
    UpdateGeometry,
    /// Any other batch of changes
    Other,
}

/// One structural change recorded during an edit
#[derive(Debug, Clone, PartialEq)]
pub enum TopologyChange {
    /// `branch` was cut at `chainage`; everything beyond now lives on `new_branch`
    BranchSplit {
        branch: BranchId,
        new_branch: BranchId,
        new_node: NodeId,
        chainage: f64,
        original_length: f64,
    },
    /// `removed` was appended to `target`, its chainages shifted by `offset`; the merged
    /// branch is `length` long
    BranchesMerged {
        target: BranchId,
        removed: BranchId,
        removed_node: NodeId,
        offset: f64,
        length: f64,
    },
    /// Source and target of `branch` were swapped
    BranchReversed { branch: BranchId, length: f64 },
    /// The listed branches changed position in network order
    BranchesReordered { moved: Vec<BranchId> },
    /// The logical length of `branch` changed; positions on it stretch proportionally
    BranchRescaled {
        branch: BranchId,
        old_length: f64,
        new_length: f64,
    },
}

/// Change log of a finished edit
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedEdit {
    pub operation: EditOperation,
    pub changes: Vec<TopologyChange>,
}

/// Something holding data positioned on a network that must follow its topology
pub trait TopologyObserver {
    /// The network the observed data lives on
    fn network_id(&self) -> NetworkId;

    fn on_edit_completed(&mut self, network: &Network, edit: &CompletedEdit) -> Result<()>;
}

#[derive(Debug)]
struct Snapshot {
    nodes: Vec<Node>,
    branches: Vec<Branch>,
    next_id: u64,
}

/// An open edit on a network
#[derive(Debug)]
pub(crate) struct EditSession {
    operation: EditOperation,
    /// Number of nested `begin_edit` calls inside the outermost one
    depth: usize,
    snapshot: Snapshot,
    changes: Vec<TopologyChange>,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl Network {
    /// Start an edit, or nest into the one already open
    pub fn begin_edit(&mut self, operation: EditOperation) {
        if let Some(session) = self.edit.as_mut() {
            session.depth += 1;
            return;
        }
        tracing::debug!(network = %self.name(), ?operation, "begin edit");
        self.edit = Some(EditSession {
            operation,
            depth: 0,
            snapshot: Snapshot {
                nodes: self.nodes.clone(),
                branches: self.branches.clone(),
                next_id: self.next_id,
            },
            changes: Vec::new(),
        });
    }

    #[inline]
    pub fn is_editing(&self) -> bool {
        self.edit.is_some()
    }

    /// Operation of the open edit
    pub fn edit_operation(&self) -> Option<EditOperation> {
        self.edit.as_ref().map(|session| session.operation)
    }

    /// Finish an edit
    ///
    /// Returns the change log once the outermost edit ends, `None` for nested ones.
    pub fn end_edit(&mut self) -> Result<Option<CompletedEdit>> {
        let session = self.edit.as_mut().ok_or(NetworkError::NotEditing)?;
        if session.depth > 0 {
            session.depth -= 1;
            return Ok(None);
        }
        let Some(session) = self.edit.take() else {
            return Err(NetworkError::NotEditing);
        };
        tracing::debug!(
            network = %self.name(),
            operation = ?session.operation,
            changes = session.changes.len(),
            "end edit"
        );
        Ok(Some(CompletedEdit {
            operation: session.operation,
            changes: session.changes,
        }))
    }

    /// Abandon the open edit, nested ones included, restoring the pre-edit state
    pub fn cancel_edit(&mut self) -> Result<()> {
        let session = self.edit.take().ok_or(NetworkError::NotEditing)?;
        tracing::debug!(network = %self.name(), operation = ?session.operation, "cancel edit");
        self.nodes = session.snapshot.nodes;
        self.branches = session.snapshot.branches;
        self.next_id = session.snapshot.next_id;
        self.touch();
        Ok(())
    }

    fn require_edit(&self) -> Result<()> {
        if self.edit.is_none() {
            return Err(NetworkError::NotEditing);
        }
        Ok(())
    }

    pub(crate) fn record(&mut self, change: TopologyChange) {
        if let Some(session) = self.edit.as_mut() {
            session.changes.push(change);
        }
    }

    /// Log a length change of `branch`; outside an edit nobody is told
    pub(crate) fn record_rescale(&mut self, branch: BranchId, old_length: f64, new_length: f64) {
        if (new_length - old_length).abs() < utils::CHAINAGE_EPSILON {
            return;
        }
        if self.edit.is_none() {
            tracing::trace!(%branch, old_length, new_length, "branch rescaled outside an edit");
            return;
        }
        self.record(TopologyChange::BranchRescaled {
            branch,
            old_length,
            new_length,
        });
    }

    /// Split a branch at a calculation chainage
    ///
    /// Returns the new branch and node, or `None` when the chainage is one of the branch
    /// ends. The new branch runs from the new node to the original target and is
    /// appended to the network; features at or beyond the split move onto it and
    /// features straddling the split are cut in two.
    pub fn split_branch(
        &mut self,
        branch: BranchId,
        chainage: f64,
    ) -> Result<Option<(BranchId, NodeId)>> {
        self.require_edit()?;
        crate::feature::validate_chainage(chainage)?;
        let original = self.branch(branch)?;
        let length = original.length();
        if chainage > length + utils::CHAINAGE_EPSILON {
            return Err(NetworkError::InvalidArgument(format!(
                "cannot split {branch} of length {length} at {chainage}"
            )));
        }
        let chainage = original.snap_chainage(chainage);
        if chainage <= 0.0 || chainage >= length {
            return Ok(None);
        }

        let geometry_chainage = original.map_chainage(chainage);
        let geometry_length = original.geometry_length();
        let split_point = utils::point_along(original.geometry(), geometry_chainage)
            .ok_or_else(|| NetworkError::InvalidGeometry(format!("{branch} has no geometry")))?;
        let first_geometry = utils::sub_line(original.geometry(), 0.0, geometry_chainage);
        let second_geometry =
            utils::sub_line(original.geometry(), geometry_chainage, geometry_length);
        let (first_length, second_length) = if original.is_length_custom() {
            (chainage, length - chainage)
        } else {
            (
                utils::polyline_length(&first_geometry),
                utils::polyline_length(&second_geometry),
            )
        };
        let original_target = original.target();
        let original_name = original.name().to_string();
        let is_length_custom = original.is_length_custom();
        let order_number = original.order_number();

        let new_node = self.add_node(&format!("{original_name}_split"), split_point.into());
        let new_branch = BranchId(self.allocate_id());

        let mut kept = Vec::new();
        let mut moved = Vec::new();
        let features = std::mem::take(&mut self.branch_mut(branch)?.features);
        for mut feature in features {
            if feature.chainage >= chainage - utils::CHAINAGE_EPSILON {
                feature.chainage = utils::snap_chainage(second_length, feature.chainage - chainage);
                feature.length = feature.length.min(second_length - feature.chainage).max(0.0);
                feature.branch = Some(new_branch);
                moved.push(feature);
            } else if feature.end_chainage() > chainage + utils::CHAINAGE_EPSILON {
                let mut second = feature.clone_detached();
                second.id = Some(FeatureId(self.allocate_id()));
                second.name = format!("{}_2", feature.name);
                second.branch = Some(new_branch);
                second.length = (feature.end_chainage() - chainage).min(second_length);

                feature.name = format!("{}_1", feature.name);
                feature.length = chainage - feature.chainage;
                kept.push(feature);
                moved.push(second);
            } else {
                kept.push(feature);
            }
        }

        {
            let original = self.branch_mut(branch)?;
            original.target = new_node;
            original.geometry = first_geometry;
            original.geometry_length = utils::polyline_length(&original.geometry);
            original.length = first_length;
            original.features = kept;
            original.sort_features();
        }

        let mut second = Branch {
            id: new_branch,
            name: format!("{original_name}_{}", new_branch.0),
            source: new_node,
            target: original_target,
            geometry_length: utils::polyline_length(&second_geometry),
            geometry: second_geometry,
            length: second_length,
            is_length_custom,
            order_number,
            features: moved,
        };
        second.sort_features();
        self.branches.push(second);
        self.touch();

        for incoming in self.node_mut(original_target)?.incoming.iter_mut() {
            if *incoming == branch {
                *incoming = new_branch;
            }
        }
        let node = self.node_mut(new_node)?;
        node.incoming.push(branch);
        node.outgoing.push(new_branch);
        self.touch();

        tracing::debug!(%branch, %new_branch, %new_node, chainage, "split branch");
        self.record(TopologyChange::BranchSplit {
            branch,
            new_branch,
            new_node,
            chainage,
            original_length: length,
        });
        Ok(Some((new_branch, new_node)))
    }

    /// Merge the two branches meeting at `node` into the incoming one
    ///
    /// The node must have exactly one incoming and one outgoing branch, and both branches
    /// must agree on whether their length is custom. Returns the kept branch.
    pub fn merge_branches(&mut self, node: NodeId) -> Result<BranchId> {
        self.require_edit()?;
        let shared = self.node(node)?;
        let ([target], [source]) = (shared.incoming_branches(), shared.outgoing_branches()) else {
            return Err(NetworkError::MergePrecondition {
                reason: format!(
                    "{node} has {} incoming and {} outgoing branches",
                    shared.incoming_branches().len(),
                    shared.outgoing_branches().len()
                ),
            });
        };
        let (target, source) = (*target, *source);
        if target == source {
            return Err(NetworkError::MergePrecondition {
                reason: format!("{target} is a loop at {node}"),
            });
        }

        let target_branch = self.branch(target)?;
        let source_branch = self.branch(source)?;
        if target_branch.is_length_custom() != source_branch.is_length_custom() {
            return Err(NetworkError::CustomLengthMismatch);
        }

        let offset = target_branch.length();
        let geometry = utils::concat_lines(target_branch.geometry(), source_branch.geometry());
        let geometry_length = utils::polyline_length(&geometry);
        let length = if target_branch.is_length_custom() {
            offset + source_branch.length()
        } else {
            geometry_length
        };
        let new_target = source_branch.target();

        let removed = self.remove_branch_raw(source)?;
        let mut features = removed.features;
        for feature in &mut features {
            feature.chainage = utils::snap_chainage(length, feature.chainage + offset);
            feature.branch = Some(target);
        }

        {
            let kept = self.branch_mut(target)?;
            kept.target = new_target;
            kept.geometry = geometry;
            kept.geometry_length = geometry_length;
            kept.length = length;
            kept.features.extend(features);
            kept.sort_features();
        }

        for incoming in self.node_mut(new_target)?.incoming.iter_mut() {
            if *incoming == source {
                *incoming = target;
            }
        }
        self.nodes.retain(|n| n.id() != node);
        self.touch();

        tracing::debug!(%target, removed = %source, %node, "merged branches");
        self.record(TopologyChange::BranchesMerged {
            target,
            removed: source,
            removed_node: node,
            offset,
            length,
        });
        Ok(target)
    }

    /// Remove a branch without touching node connectivity
    fn remove_branch_raw(&mut self, id: BranchId) -> Result<Branch> {
        let position = self
            .branch_position(id)
            .ok_or(NetworkError::UnknownBranch(id))?;
        let branch = self.branches.remove(position);
        self.touch();
        Ok(branch)
    }

    /// Swap source and target of a branch, mirroring its geometry and features
    pub fn reverse_branch(&mut self, branch: BranchId) -> Result<()> {
        self.require_edit()?;
        let target = self.branch_mut(branch)?;
        let length = target.length;
        std::mem::swap(&mut target.source, &mut target.target);
        target.geometry.0.reverse();
        for feature in &mut target.features {
            feature.chainage = utils::snap_chainage(length, length - feature.chainage - feature.length);
        }
        target.sort_features();
        let (source, target) = (target.source, target.target);

        if source != target {
            let new_source = self.node_mut(source)?;
            new_source.incoming.retain(|b| *b != branch);
            new_source.outgoing.push(branch);
            let new_target = self.node_mut(target)?;
            new_target.outgoing.retain(|b| *b != branch);
            new_target.incoming.push(branch);
        }
        self.touch();

        tracing::debug!(%branch, "reversed branch");
        self.record(TopologyChange::BranchReversed { branch, length });
        Ok(())
    }

    /// Put the branches in a new network order
    ///
    /// `order` must list every branch exactly once.
    pub fn reorder_branches(&mut self, order: &[BranchId]) -> Result<()> {
        self.require_edit()?;
        let unique: HashSet<BranchId> = order.iter().copied().collect();
        if order.len() != self.branches.len() || unique.len() != order.len() {
            return Err(NetworkError::InvalidArgument(format!(
                "branch order lists {} branches, network has {}",
                order.len(),
                self.branches.len()
            )));
        }
        let mut positions = Vec::with_capacity(order.len());
        for id in order {
            positions.push(self.branch_position(*id).ok_or(NetworkError::UnknownBranch(*id))?);
        }

        let moved: Vec<BranchId> = order
            .iter()
            .zip(&positions)
            .enumerate()
            .filter(|(new_position, (_, old_position))| new_position != *old_position)
            .map(|(_, (id, _))| *id)
            .collect();
        if moved.is_empty() {
            return Ok(());
        }

        let mut branches: Vec<Option<Branch>> = std::mem::take(&mut self.branches)
            .into_iter()
            .map(Some)
            .collect();
        self.branches = positions
            .iter()
            .filter_map(|&position| branches[position].take())
            .collect();
        self.touch();

        tracing::debug!(moved = moved.len(), "reordered branches");
        self.record(TopologyChange::BranchesReordered { moved });
        Ok(())
    }
}

impl NetworkCoverage {
    /// Move the locations selected by `relocate`, keeping their order and values
    pub(crate) fn relocate_locations<F>(&mut self, relocate: F)
    where
        F: Fn(&NetworkLocation) -> Option<(BranchId, f64)>,
    {
        for location in &mut self.locations {
            if let Some((branch, chainage)) = relocate(location) {
                location.relocate(branch, chainage);
            }
        }
    }

    /// Follow one change of a completed edit
    ///
    /// Only the data recorded in the change is used, so a change log replays correctly
    /// whatever the network looks like once the whole edit is done.
    pub(crate) fn apply_change(&mut self, change: &TopologyChange) {
        match change {
            TopologyChange::BranchSplit {
                branch,
                new_branch,
                chainage,
                original_length,
                ..
            } => {
                if self.kind == CoverageKind::Route {
                    return;
                }
                let new_length = original_length - chainage;
                self.relocate_locations(|location| {
                    (location.branch_id() == *branch
                        && location.chainage() >= chainage - utils::CHAINAGE_EPSILON)
                        .then(|| {
                            (
                                *new_branch,
                                utils::snap_chainage(new_length, location.chainage() - chainage),
                            )
                        })
                });
            }
            TopologyChange::BranchesMerged {
                target,
                removed,
                offset,
                length,
                ..
            } => {
                self.relocate_locations(|location| {
                    (location.branch_id() == *removed).then(|| {
                        (
                            *target,
                            utils::snap_chainage(*length, location.chainage() + offset),
                        )
                    })
                });
            }
            TopologyChange::BranchReversed { branch, length } => {
                self.relocate_locations(|location| {
                    (location.branch_id() == *branch).then(|| {
                        (
                            *branch,
                            utils::snap_chainage(*length, length - location.chainage()),
                        )
                    })
                });
            }
            TopologyChange::BranchRescaled {
                branch,
                old_length,
                new_length,
            } => {
                let factor = utils::scale_factor(*old_length, *new_length);
                self.relocate_locations(|location| {
                    (location.branch_id() == *branch).then(|| {
                        (
                            *branch,
                            utils::snap_chainage(*new_length, location.chainage() * factor),
                        )
                    })
                });
            }
            // Positions do not move; the order is restored when the edit settles
            TopologyChange::BranchesReordered { .. } => {}
        }
    }

    /// Bring relocated locations in line with the edited network
    ///
    /// Chainages are snapped onto their branch, a location landing on an earlier one is
    /// dropped with its values, and auto-sorted coverages are sorted again unless
    /// `keep_order` is set.
    pub(crate) fn settle_locations(&mut self, network: &Network, keep_order: bool) {
        for location in &mut self.locations {
            if let Ok(branch) = network.branch(location.branch_id()) {
                location.relocate(branch.id(), branch.snap_chainage(location.chainage()));
            }
        }
        self.drop_colliding_locations();
        if self.config.is_auto_sorted && !keep_order {
            self.sort_locations(network);
        }
        self.invalidate();
    }

    fn drop_colliding_locations(&mut self) {
        let mut order: Vec<usize> = (0..self.locations.len()).collect();
        order.sort_by(|&a, &b| {
            let (first, second) = (&self.locations[a], &self.locations[b]);
            first
                .branch_id()
                .cmp(&second.branch_id())
                .then_with(|| first.chainage().total_cmp(&second.chainage()))
                .then_with(|| a.cmp(&b))
        });

        let mut keep = vec![true; self.locations.len()];
        let mut survivor: Option<usize> = None;
        for position in order {
            match survivor {
                Some(kept) if self.locations[kept].same_point(&self.locations[position]) => {
                    let (earlier, later) = (kept.min(position), kept.max(position));
                    let location = &self.locations[later];
                    tracing::debug!(
                        coverage = %self.name(),
                        branch = %location.branch_id(),
                        chainage = location.chainage(),
                        "relocated location collided, dropped"
                    );
                    keep[later] = false;
                    survivor = Some(earlier);
                }
                _ => survivor = Some(position),
            }
        }
        if keep.iter().all(|keep| *keep) {
            return;
        }

        let mut flags = keep.iter();
        self.locations.retain(|_| flags.next().copied().unwrap_or(true));
        for slice in &mut self.values {
            let mut flags = keep.iter();
            slice.retain(|_| flags.next().copied().unwrap_or(true));
        }
    }
}

impl TopologyObserver for NetworkCoverage {
    fn network_id(&self) -> NetworkId {
        NetworkCoverage::network_id(self)
    }

    fn on_edit_completed(&mut self, network: &Network, edit: &CompletedEdit) -> Result<()> {
        self.check_network(network)?;
        for change in &edit.changes {
            self.apply_change(change);
        }

        let reordered = edit
            .changes
            .iter()
            .any(|change| matches!(change, TopologyChange::BranchesReordered { .. }));
        let keep_order = reordered && self.is_time_dependent();
        if keep_order {
            tracing::warn!(
                coverage = %self.name(),
                "reorder is not supported for time-dependent coverages, locations left in place"
            );
        }
        self.settle_locations(network, keep_order);
        Ok(())
    }
}

/// Run one primitive inside its own edit, notifying observers when it completes
fn run_edit<T, F>(
    network: &mut Network,
    operation: EditOperation,
    observers: &mut [&mut dyn TopologyObserver],
    edit: F,
) -> Result<T>
where
    F: FnOnce(&mut Network) -> Result<T>,
{
    if let Some(stranger) = observers
        .iter()
        .find(|observer| observer.network_id() != network.id())
    {
        tracing::debug!(?operation, observer = ?stranger.network_id(), "observer of another network");
        return Err(NetworkError::NetworkMismatch);
    }

    network.begin_edit(operation);
    let value = match edit(network) {
        Ok(value) => value,
        Err(err) => {
            tracing::debug!(?operation, %err, "edit failed, cancelling");
            network.cancel_edit()?;
            return Err(err);
        }
    };
    if let Some(completed) = network.end_edit()? {
        for observer in observers.iter_mut() {
            observer.on_edit_completed(network, &completed)?;
        }
    }
    Ok(value)
}

/// Split a branch at `chainage`, inserting a node there
///
/// Returns the new node, or `None` when the chainage is a branch end.
pub fn split_branch_at_node(
    network: &mut Network,
    branch: BranchId,
    chainage: f64,
    observers: &mut [&mut dyn TopologyObserver],
) -> Result<Option<NodeId>> {
    run_edit(network, EditOperation::SplitBranch, observers, |network| {
        Ok(network.split_branch(branch, chainage)?.map(|(_, node)| node))
    })
}

/// Merge the two branches at `node`, removing the node
pub fn merge_node_branches(
    network: &mut Network,
    node: NodeId,
    observers: &mut [&mut dyn TopologyObserver],
) -> Result<BranchId> {
    run_edit(network, EditOperation::MergeBranches, observers, |network| {
        network.merge_branches(node)
    })
}

/// Reverse the direction of a branch
pub fn reverse_branch(
    network: &mut Network,
    branch: BranchId,
    observers: &mut [&mut dyn TopologyObserver],
) -> Result<()> {
    run_edit(network, EditOperation::ReverseBranch, observers, |network| {
        network.reverse_branch(branch)
    })
}

/// Put the branches of the network in a new order
pub fn reorder_branches(
    network: &mut Network,
    order: &[BranchId],
    observers: &mut [&mut dyn TopologyObserver],
) -> Result<()> {
    run_edit(network, EditOperation::ReorderBranches, observers, |network| {
        network.reorder_branches(order)
    })
}

/// Replace the geometry of a branch, stretching features and observed locations along
pub fn set_branch_geometry(
    network: &mut Network,
    branch: BranchId,
    geometry: LineString<f64>,
    observers: &mut [&mut dyn TopologyObserver],
) -> Result<()> {
    run_edit(network, EditOperation::UpdateGeometry, observers, |network| {
        network.set_branch_geometry(branch, geometry, UpdateContext::Edit)
    })
}

/// Give a branch a custom length, stretching features and observed locations along
pub fn set_branch_length(
    network: &mut Network,
    branch: BranchId,
    length: f64,
    observers: &mut [&mut dyn TopologyObserver],
) -> Result<()> {
    run_edit(network, EditOperation::UpdateGeometry, observers, |network| {
        network.set_branch_length(branch, length, UpdateContext::Edit)
    })
}

/// Toggle the custom length of a branch, stretching features and observed locations along
pub fn set_length_custom(
    network: &mut Network,
    branch: BranchId,
    is_length_custom: bool,
    observers: &mut [&mut dyn TopologyObserver],
) -> Result<()> {
    run_edit(network, EditOperation::UpdateGeometry, observers, |network| {
        network.set_length_custom(branch, is_length_custom, UpdateContext::Edit)
    })
}

/// Move a node, stretching the connected branches and what is observed on them
pub fn move_node(
    network: &mut Network,
    node: NodeId,
    point: Point<f64>,
    observers: &mut [&mut dyn TopologyObserver],
) -> Result<()> {
    run_edit(network, EditOperation::UpdateGeometry, observers, |network| {
        network.move_node(node, point)
    })
}
