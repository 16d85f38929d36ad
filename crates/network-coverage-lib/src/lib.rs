//! Network Coverage Library - Branched 1-D Networks and Functions Over Them
//!
//! This library models a branched network (nodes connected by directed branches, each
//! carrying a continuous chainage coordinate) and coverages: functions whose domain is a
//! set of locations on that network, optionally also time.
//!
//! # Architecture
//!
//! - **[`Network`]**: Arena owning nodes, branches and branch features, addressed by handles
//! - **[`BranchFeature`]**: Network-owned objects positioned on a branch by chainage
//! - **[`NetworkLocation`] / [`NetworkSegment`]**: Point and interval on a branch
//! - **[`NetworkCoverage`]**: Values per (time?, location) with interpolation and segmentation
//! - **[`Route`]**: A coverage whose locations describe a path through the network
//! - **[`editing`]**: Split, merge, reverse and reorder, keeping features and coverages consistent
//!
//! # Chainage
//!
//! All data operations use *calculation* chainage, measured along the logical branch
//! length. When a branch has a custom length the drawn polyline is addressed through
//! *geometry* chainage, see [`utils::map_chainage`].

mod coverage;
pub mod editing;
mod feature;
mod interpolation;
mod location;
mod network;
mod route;
mod segmentation;
pub mod utils;

// Public API exports
pub use coverage::{
    CoverageConfig, CoverageFilter, CoverageView, InterpolationType, NetworkCoverage,
    SegmentGenerationMethod,
};
pub use editing::{CompletedEdit, EditOperation, TopologyChange, TopologyObserver};
pub use feature::{BranchFeature, FeatureKind, Locatable, Named, Spanning, compare_features};
pub use location::{LocationRecord, NetworkLocation, NetworkSegment};
pub use network::{
    Branch, BranchId, BranchSpec, FeatureId, Network, NetworkConfig, NetworkId, Node, NodeId,
    UNORDERED, UpdateContext,
};
pub use route::Route;

/// Error types for network and coverage operations
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("Negative chainage: {0}")]
    NegativeChainage(f64),

    #[error("Invalid length: {0}")]
    InvalidLength(f64),

    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("Unknown branch: {0}")]
    UnknownBranch(BranchId),

    #[error("Unknown feature: {0}")]
    UnknownFeature(FeatureId),

    #[error("Unknown time: {0}")]
    UnknownTime(f64),

    #[error("Branch feature is not attached to a branch")]
    DetachedFeature,

    #[error("Operands belong to different networks")]
    NetworkMismatch,

    #[error("A time filter is required for a time-dependent coverage")]
    TimeFilterRequired,

    #[error("A time filter was given for a coverage that is not time dependent")]
    UnexpectedTimeFilter,

    #[error("Value shape mismatch: expected {expected} values, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    #[error("Merge precondition failed: {reason}")]
    MergePrecondition { reason: String },

    #[error("Cannot merge branches with different custom-length settings")]
    CustomLengthMismatch,

    #[error("Network is not in an edit session")]
    NotEditing,
}

pub type Result<T> = std::result::Result<T, NetworkError>;
