//! The read/write graph: arenas for nodes, blocks, and subgraphs, plus the
//! surgery the analysis needs (call-block splitting, node splicing).

use crate::block::{Block, BlockId, BlockKind};
use crate::defsite::MemId;
use crate::errors::{GraphError, GraphResult};
use crate::idx::IndexedMap;
use crate::impl_index;
use crate::node::{CallTarget, NodeId, NodeKind, RwNode};

/// Index of a [`Subgraph`] in the graph's subgraph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubgraphId(u32);
impl_index!(SubgraphId);

/// A procedure: an ordered list of blocks plus the call nodes elsewhere in
/// the graph that target it.
#[derive(Debug, Clone, Default)]
pub struct Subgraph {
    pub(crate) blocks: Vec<BlockId>,
    pub(crate) callers: Vec<NodeId>,
}

impl Subgraph {
    pub fn blocks(&self) -> &[BlockId] {
        &self.blocks
    }

    /// Call nodes in other subgraphs that have this subgraph as a callee.
    pub fn callers(&self) -> &[NodeId] {
        &self.callers
    }
}

/// The whole program as a read/write graph.
///
/// The arenas own every node for the lifetime of the graph, including the
/// phi and mu nodes the analysis creates later; nothing is ever removed, so
/// every [`NodeId`] handed out stays valid.
#[derive(Debug, Clone, Default)]
pub struct RwGraph {
    nodes: IndexedMap<NodeId, RwNode>,
    blocks: IndexedMap<BlockId, Block>,
    subgraphs: IndexedMap<SubgraphId, Subgraph>,
    mems: u32,
}

impl RwGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh abstract memory object.
    pub fn fresh_mem(&mut self) -> MemId {
        let id = MemId::from(self.mems);
        self.mems += 1;
        id
    }

    pub fn add_subgraph(&mut self) -> SubgraphId {
        self.subgraphs.push(Subgraph::default())
    }

    /// Append a new empty block to `subgraph`.
    pub fn add_block(&mut self, subgraph: SubgraphId) -> BlockId {
        let block = self.blocks.push(Block::new(subgraph));
        self.subgraphs[subgraph].blocks.push(block);
        block
    }

    /// Create a node that is not yet placed in any block.
    pub fn add_node(&mut self, kind: NodeKind) -> NodeId {
        self.nodes.push(RwNode::new(kind))
    }

    /// Place `node` at the end of `block`.
    pub fn append_node(&mut self, block: BlockId, node: NodeId) {
        assert!(
            self.nodes[node].block().is_none(),
            "node {node} is already placed"
        );
        self.nodes[node].set_block(block);
        self.blocks[block].push_node(node);
    }

    /// Place `node` at the start of `block`.
    pub fn prepend_node(&mut self, block: BlockId, node: NodeId) {
        assert!(
            self.nodes[node].block().is_none(),
            "node {node} is already placed"
        );
        self.nodes[node].set_block(block);
        self.blocks[block].insert_node(0, node);
    }

    /// Splice `new` into `existing`'s block immediately before it.
    ///
    /// # Panics
    ///
    /// Panics if `existing` is not placed in a block.
    pub fn insert_before(&mut self, new: NodeId, existing: NodeId) {
        let block = self.nodes[existing]
            .block()
            .expect("insertion point must be placed in a block");
        let position = self.blocks[block]
            .position_of(existing)
            .expect("placed node must appear in its block");
        self.nodes[new].set_block(block);
        self.blocks[block].insert_node(position, new);
    }

    /// Add a CFG edge. Parallel edges collapse into one.
    pub fn add_edge(&mut self, from: BlockId, to: BlockId) {
        self.blocks[from].add_succ(to);
        self.blocks[to].add_pred(from);
    }

    /// Register a callee on a call node. Defined callees also record the
    /// call as a caller of the target subgraph.
    pub fn add_callee(&mut self, call: NodeId, target: CallTarget) {
        if let CallTarget::Defined(subgraph) = target {
            self.subgraphs[subgraph].callers.push(call);
        }
        self.nodes[call]
            .call_targets_mut()
            .expect("callees can only be added to call nodes")
            .add(target);
    }

    pub fn node(&self, id: NodeId) -> &RwNode {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut RwNode {
        &mut self.nodes[id]
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id]
    }

    pub fn subgraph(&self, id: SubgraphId) -> &Subgraph {
        &self.subgraphs[id]
    }

    pub fn subgraph_ids(&self) -> impl Iterator<Item = SubgraphId> + '_ {
        self.subgraphs.keys()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &RwNode)> {
        self.nodes.iter()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Confine every call to defined callees to a block of its own and tag
    /// that block [`BlockKind::Call`].
    ///
    /// Blocks without such calls are left untouched. A block that contains
    /// one is sliced into runs of plain nodes and solitary call nodes; the
    /// original id keeps the first slice (and with it the predecessor
    /// edges), new blocks take the rest, and the old successors move to the
    /// last slice.
    pub fn split_blocks_on_calls(&mut self) {
        let subgraphs: Vec<SubgraphId> = self.subgraphs.keys().collect();
        for sg in subgraphs {
            let order = self.subgraphs[sg].blocks.clone();
            let mut new_order = Vec::with_capacity(order.len());
            for block in order {
                if !self.contains_defined_call(block) {
                    new_order.push(block);
                    continue;
                }
                new_order.extend(self.split_block(sg, block));
            }
            self.subgraphs[sg].blocks = new_order;
        }
    }

    fn contains_defined_call(&self, block: BlockId) -> bool {
        self.blocks[block]
            .nodes()
            .iter()
            .any(|n| self.is_defined_call(*n))
    }

    fn is_defined_call(&self, node: NodeId) -> bool {
        self.nodes[node]
            .call()
            .is_some_and(|call| call.calls_defined())
    }

    fn split_block(&mut self, sg: SubgraphId, block: BlockId) -> Vec<BlockId> {
        let nodes = self.blocks[block].take_nodes();
        let mut segments: Vec<(Vec<NodeId>, BlockKind)> = Vec::new();
        let mut run: Vec<NodeId> = Vec::new();
        for node in nodes {
            if self.is_defined_call(node) {
                if !run.is_empty() {
                    segments.push((std::mem::take(&mut run), BlockKind::Plain));
                }
                segments.push((vec![node], BlockKind::Call(node)));
            } else {
                run.push(node);
            }
        }
        if !run.is_empty() {
            segments.push((run, BlockKind::Plain));
        }

        let succs = self.blocks[block].take_succs();

        // the original id keeps the first segment, and with it the
        // predecessor edges
        let mut ids = vec![block];
        for _ in 1..segments.len() {
            ids.push(self.blocks.push(Block::new(sg)));
        }
        for (id, (segment, kind)) in ids.iter().zip(segments) {
            for node in &segment {
                self.nodes[*node].set_block(*id);
            }
            self.blocks[*id].set_nodes(segment);
            self.blocks[*id].set_kind(kind);
        }
        for pair in ids.windows(2) {
            self.blocks[pair[0]].add_succ(pair[1]);
            self.blocks[pair[1]].add_pred(pair[0]);
        }

        // the old successors hang off the last segment
        let last = *ids.last().unwrap_or(&block);
        for succ in succs {
            self.blocks[last].add_succ(succ);
            if last != block {
                self.blocks[succ].replace_pred(block, last);
            }
        }

        log::trace!("split block {block} into {} segments", ids.len());
        ids
    }

    /// Check the structural preconditions of the analysis.
    ///
    /// Expects [`split_blocks_on_calls`] to have run already; a defined call
    /// sharing a block with other nodes is reported, not repaired.
    ///
    /// [`split_blocks_on_calls`]: RwGraph::split_blocks_on_calls
    pub fn validate(&self) -> GraphResult<()> {
        for (id, node) in self.nodes.iter() {
            if let Some(call) = node.call() {
                let defined = call.calls_defined();
                let undefined = call
                    .callees()
                    .iter()
                    .any(|c| matches!(c, CallTarget::Undefined(_)));
                if defined && undefined {
                    return Err(GraphError::MixedCallTargets(id));
                }
                if !defined && call.callees().len() > 1 {
                    return Err(GraphError::MultipleUndefined(id));
                }
                if defined {
                    if let Some(block) = node.block() {
                        let alone = self.blocks[block].len() == 1
                            && self.blocks[block].kind() == BlockKind::Call(id);
                        if !alone {
                            return Err(GraphError::UnsplitCall(id, block));
                        }
                    }
                }
            }
            if !node.is_phi() {
                for ds in &node.overwrites {
                    if ds.target.is_unknown() {
                        return Err(GraphError::UnknownOverwriteTarget(id));
                    }
                    if ds.offset.is_unknown() {
                        return Err(GraphError::UnknownOverwriteOffset(id));
                    }
                }
            }
        }
        Ok(())
    }

    /// [`validate`], plus the strict reading of dead code: any node that
    /// reads memory must be placed in a block.
    ///
    /// [`validate`]: RwGraph::validate
    pub fn validate_strict(&self) -> GraphResult<()> {
        self.validate()?;
        for (id, node) in self.nodes.iter() {
            if node.is_use() && node.block().is_none() {
                return Err(GraphError::DeadCode(id));
            }
        }
        Ok(())
    }
}
