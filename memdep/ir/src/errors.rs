//! Structural errors reported by graph validation.

use thiserror::Error;

use crate::block::BlockId;
use crate::node::NodeId;

pub type GraphResult<T> = Result<T, GraphError>;

/// A precondition of the analysis that the input graph fails to meet.
///
/// These are bugs in the graph handed to the analysis, not recoverable
/// runtime conditions; [`RwGraph::validate`] surfaces them before any query
/// runs.
///
/// [`RwGraph::validate`]: crate::RwGraph::validate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("node {0} reads memory but belongs to no block")]
    DeadCode(NodeId),
    #[error("call {0} to defined callees shares block {1} with other nodes")]
    UnsplitCall(NodeId, BlockId),
    #[error("call {0} mixes defined and undefined callees")]
    MixedCallTargets(NodeId),
    #[error("call {0} has more than one undefined callee")]
    MultipleUndefined(NodeId),
    #[error("non-phi node {0} must-overwrites an unknown offset")]
    UnknownOverwriteOffset(NodeId),
    #[error("non-phi node {0} must-overwrites unknown memory")]
    UnknownOverwriteTarget(NodeId),
}
