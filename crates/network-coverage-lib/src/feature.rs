//! Branch features: anything positioned on a branch by chainage
//!
//! Positioning, naming and extent are separate capabilities so that network-owned
//! features, coverage locations and segments can share the ordering law without sharing
//! a base type.

use crate::{BranchId, FeatureId, Network, NetworkError, Result};
use std::cmp::Ordering;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Something positioned on a branch by chainage
pub trait Locatable {
    /// The branch this item is attached to, if any
    fn branch(&self) -> Option<BranchId>;

    /// Calculation chainage along the branch
    fn chainage(&self) -> f64;
}

/// Something with a display name, used as ordering tiebreak
pub trait Named {
    fn name(&self) -> &str;
}

/// Something spanning a chainage range on its branch
pub trait Spanning {
    /// Extent along the branch, zero for point features
    fn length(&self) -> f64 {
        0.0
    }
}

/// Reject negative chainages
#[inline]
pub(crate) fn validate_chainage(chainage: f64) -> Result<f64> {
    if chainage < 0.0 || chainage.is_nan() {
        return Err(NetworkError::NegativeChainage(chainage));
    }
    Ok(chainage)
}

/// Total order over branch features
///
/// Features on different branches compare by the branches' position in the network;
/// features on the same branch compare by chainage, then by name.
///
/// # Errors
/// Fails when either feature is detached or its branch is not part of `network`.
pub fn compare_features<A, B>(network: &Network, a: &A, b: &B) -> Result<Ordering>
where
    A: Locatable + Named + ?Sized,
    B: Locatable + Named + ?Sized,
{
    let (Some(branch_a), Some(branch_b)) = (a.branch(), b.branch()) else {
        return Err(NetworkError::DetachedFeature);
    };

    if branch_a != branch_b {
        return network.compare_branches(branch_a, branch_b);
    }

    Ok(a
        .chainage()
        .total_cmp(&b.chainage())
        .then_with(|| a.name().cmp(b.name())))
}

/// Kind of a network-owned branch feature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FeatureKind {
    /// A measurement station
    #[default]
    ObservationPoint,
    /// A hydraulic structure such as a weir or culvert
    Structure,
    /// Anything else
    Other,
}

/// A feature owned by a branch of the network
///
/// The branch keeps its features sorted by chainage and rescales them whenever its
/// length changes.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BranchFeature {
    pub(crate) id: Option<FeatureId>,
    pub(crate) name: String,
    pub(crate) kind: FeatureKind,
    pub(crate) branch: Option<BranchId>,
    pub(crate) chainage: f64,
    pub(crate) length: f64,
}

impl BranchFeature {
    /// Create a detached point feature
    pub fn new(name: impl Into<String>, kind: FeatureKind, chainage: f64) -> Result<Self> {
        Ok(Self {
            id: None,
            name: name.into(),
            kind,
            branch: None,
            chainage: validate_chainage(chainage)?,
            length: 0.0,
        })
    }

    /// Create a detached feature spanning `[chainage, chainage + length]`
    pub fn spanning(
        name: impl Into<String>,
        kind: FeatureKind,
        chainage: f64,
        length: f64,
    ) -> Result<Self> {
        if length < 0.0 || length.is_nan() {
            return Err(NetworkError::InvalidLength(length));
        }
        let mut feature = Self::new(name, kind, chainage)?;
        feature.length = length;
        Ok(feature)
    }

    /// Identifier assigned by the network once attached
    #[inline]
    pub fn id(&self) -> Option<FeatureId> {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> FeatureKind {
        self.kind
    }

    /// Chainage where the feature ends
    #[inline]
    pub fn end_chainage(&self) -> f64 {
        self.chainage + self.length
    }

    /// Set the chainage, rejecting negative values
    pub fn set_chainage(&mut self, chainage: f64) -> Result<()> {
        self.chainage = validate_chainage(chainage)?;
        Ok(())
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Copy of this feature without id, branch and chainage
    pub fn clone_detached(&self) -> Self {
        Self {
            id: None,
            name: self.name.clone(),
            kind: self.kind,
            branch: None,
            chainage: 0.0,
            length: self.length,
        }
    }
}

impl Locatable for BranchFeature {
    #[inline]
    fn branch(&self) -> Option<BranchId> {
        self.branch
    }

    #[inline]
    fn chainage(&self) -> f64 {
        self.chainage
    }
}

impl Named for BranchFeature {
    #[inline]
    fn name(&self) -> &str {
        &self.name
    }
}

impl Spanning for BranchFeature {
    #[inline]
    fn length(&self) -> f64 {
        self.length
    }
}
