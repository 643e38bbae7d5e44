//! Nodes of the read/write graph.

use smallvec::SmallVec;

use crate::block::BlockId;
use crate::defsite::DefSite;
use crate::graph::SubgraphId;
use crate::impl_index;

/// Index of an [`RwNode`] in the graph's node arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u32);
impl_index!(NodeId);

/// One callee of a call node: either a subgraph whose body is present, or an
/// external function summarized by a standalone node carrying its effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTarget {
    Defined(SubgraphId),
    Undefined(NodeId),
}

/// The callee list of a call node.
#[derive(Debug, Clone, Default)]
pub struct CallTargets {
    callees: SmallVec<[CallTarget; 2]>,
}

impl CallTargets {
    pub fn callees(&self) -> &[CallTarget] {
        &self.callees
    }

    pub(crate) fn add(&mut self, target: CallTarget) {
        self.callees.push(target);
    }

    /// Does the call reach at least one callee with a body in the graph?
    pub fn calls_defined(&self) -> bool {
        self.callees
            .iter()
            .any(|c| matches!(c, CallTarget::Defined(_)))
    }

    /// Does the call reach exactly one callee, an external one?
    pub fn calls_one_undefined(&self) -> bool {
        matches!(self.callees.as_slice(), [CallTarget::Undefined(_)])
    }

    pub fn single_undefined(&self) -> Option<NodeId> {
        match self.callees.as_slice() {
            [CallTarget::Undefined(summary)] => Some(*summary),
            _ => None,
        }
    }

    pub fn defined_callees(&self) -> impl Iterator<Item = SubgraphId> + '_ {
        self.callees.iter().filter_map(|c| match c {
            CallTarget::Defined(sg) => Some(*sg),
            CallTarget::Undefined(_) => None,
        })
    }
}

/// What kind of operation a node performs.
///
/// `Phi` and `Mu` nodes are synthesized by the analysis: a phi merges the
/// definitions reaching a join point, a mu marks an ad-hoc memory-use query
/// spliced in front of an existing node.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// A load, store, or other operation described solely by its def-site
    /// lists.
    Plain,
    Call(CallTargets),
    Phi,
    Mu,
}

/// The operands of a use or phi: the nodes its value may come from.
///
/// The list starts out uninitialized; filling it (even with nothing) marks
/// the owning node's search as complete. A phi's list is transiently empty
/// while its own operands are being resolved, which is what breaks cycles in
/// the search.
#[derive(Debug, Clone, Default)]
pub struct DefUse {
    nodes: Vec<NodeId>,
    initialized: bool,
}

impl DefUse {
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn initialized(&self) -> bool {
        self.initialized
    }

    pub fn add(&mut self, node: NodeId) {
        self.initialized = true;
        self.nodes.push(node);
    }

    pub fn extend(&mut self, nodes: impl IntoIterator<Item = NodeId>) {
        self.initialized = true;
        self.nodes.extend(nodes);
    }
}

/// A node of the read/write graph.
///
/// The three def-site lists are disjoint views of the node's memory behavior:
/// `defs` are may-writes, `overwrites` are must-writes (they kill earlier
/// writers of the same bytes), `uses` are reads.
#[derive(Debug, Clone)]
pub struct RwNode {
    kind: NodeKind,
    block: Option<BlockId>,
    pub defs: Vec<DefSite>,
    pub overwrites: Vec<DefSite>,
    pub uses: Vec<DefSite>,
    pub defuse: DefUse,
}

impl RwNode {
    pub(crate) fn new(kind: NodeKind) -> Self {
        RwNode {
            kind,
            block: None,
            defs: Vec::new(),
            overwrites: Vec::new(),
            uses: Vec::new(),
            defuse: DefUse::default(),
        }
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// The block the node belongs to. Dead code never placed by the builder
    /// has no block.
    pub fn block(&self) -> Option<BlockId> {
        self.block
    }

    pub(crate) fn set_block(&mut self, block: BlockId) {
        self.block = Some(block);
    }

    pub fn is_phi(&self) -> bool {
        matches!(self.kind, NodeKind::Phi)
    }

    pub fn is_mu(&self) -> bool {
        matches!(self.kind, NodeKind::Mu)
    }

    pub fn call(&self) -> Option<&CallTargets> {
        match &self.kind {
            NodeKind::Call(targets) => Some(targets),
            _ => None,
        }
    }

    pub(crate) fn call_targets_mut(&mut self) -> Option<&mut CallTargets> {
        match &mut self.kind {
            NodeKind::Call(targets) => Some(targets),
            _ => None,
        }
    }

    /// Does the node read memory?
    pub fn is_use(&self) -> bool {
        self.is_mu() || !self.uses.is_empty()
    }

    /// Does the node read from a statically unknown location?
    pub fn uses_unknown(&self) -> bool {
        self.uses.iter().any(|ds| ds.target.is_unknown())
    }

    pub fn add_def(&mut self, ds: DefSite) {
        self.defs.push(ds);
    }

    pub fn add_overwrite(&mut self, ds: DefSite) {
        self.overwrites.push(ds);
    }

    pub fn add_use(&mut self, ds: DefSite) {
        self.uses.push(ds);
    }
}
