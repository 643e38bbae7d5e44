//! Basic blocks of the read/write graph.

use smallvec::SmallVec;

use crate::graph::SubgraphId;
use crate::impl_index;
use crate::node::NodeId;

/// Index of a [`Block`] in the graph's block arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(u32);
impl_index!(BlockId);

/// How the analysis must treat a block.
///
/// [`RwGraph::split_blocks_on_calls`] confines every call to defined callees
/// to a block of its own and tags that block `Call`; the analysis dispatches
/// on the tag rather than inspecting the block's first node, which stops
/// being the call once mu or phi nodes get spliced in.
///
/// [`RwGraph::split_blocks_on_calls`]: crate::RwGraph::split_blocks_on_calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Plain,
    Call(NodeId),
}

/// A basic block: a program-ordered run of nodes plus its CFG edges.
#[derive(Debug, Clone)]
pub struct Block {
    kind: BlockKind,
    subgraph: SubgraphId,
    nodes: Vec<NodeId>,
    preds: SmallVec<[BlockId; 2]>,
    succs: SmallVec<[BlockId; 2]>,
}

impl Block {
    pub(crate) fn new(subgraph: SubgraphId) -> Self {
        Block {
            kind: BlockKind::Plain,
            subgraph,
            nodes: Vec::new(),
            preds: SmallVec::new(),
            succs: SmallVec::new(),
        }
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    pub(crate) fn set_kind(&mut self, kind: BlockKind) {
        self.kind = kind;
    }

    pub fn subgraph(&self) -> SubgraphId {
        self.subgraph
    }

    /// The block's nodes in program order.
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn first(&self) -> Option<NodeId> {
        self.nodes.first().copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn predecessors(&self) -> &[BlockId] {
        &self.preds
    }

    pub fn successors(&self) -> &[BlockId] {
        &self.succs
    }

    pub fn has_predecessors(&self) -> bool {
        !self.preds.is_empty()
    }

    pub fn has_successors(&self) -> bool {
        !self.succs.is_empty()
    }

    /// The unique predecessor, if the block has exactly one.
    pub fn single_predecessor(&self) -> Option<BlockId> {
        match self.preds.as_slice() {
            [pred] => Some(*pred),
            _ => None,
        }
    }

    pub(crate) fn push_node(&mut self, node: NodeId) {
        self.nodes.push(node);
    }

    pub(crate) fn insert_node(&mut self, position: usize, node: NodeId) {
        self.nodes.insert(position, node);
    }

    pub(crate) fn position_of(&self, node: NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| *n == node)
    }

    pub(crate) fn take_nodes(&mut self) -> Vec<NodeId> {
        std::mem::take(&mut self.nodes)
    }

    pub(crate) fn set_nodes(&mut self, nodes: Vec<NodeId>) {
        self.nodes = nodes;
    }

    pub(crate) fn add_pred(&mut self, pred: BlockId) {
        if !self.preds.contains(&pred) {
            self.preds.push(pred);
        }
    }

    pub(crate) fn add_succ(&mut self, succ: BlockId) {
        if !self.succs.contains(&succ) {
            self.succs.push(succ);
        }
    }

    pub(crate) fn replace_pred(&mut self, old: BlockId, new: BlockId) {
        for pred in &mut self.preds {
            if *pred == old {
                *pred = new;
            }
        }
    }

    pub(crate) fn take_succs(&mut self) -> SmallVec<[BlockId; 2]> {
        std::mem::take(&mut self.succs)
    }
}
