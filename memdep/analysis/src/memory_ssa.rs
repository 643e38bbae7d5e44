//! Demand-driven memory-SSA construction and reaching-definitions queries.
//!
//! Given a use of memory, the engine answers which writes may have produced
//! the value read there. Per-block state is built lazily by a local pass
//! (LVN); bytes the block does not define are chased through the
//! predecessor graph, materializing phi nodes at join points, at subgraph
//! entries (to pull definitions out of callers), and at call sites (to pull
//! definitions out of callee exits). A phi is installed as its block's
//! definition *before* its operands are resolved, so a search looping back
//! through the same block finds the phi and stops; that is the sole
//! termination argument, and it makes the whole recursion cycle-safe.
//!
//! Results are flattened before they are handed out: consumers only ever
//! see the non-phi writers a phi chain bottoms out in.

use std::collections::{BTreeSet, HashMap, HashSet};

use memdep_ir::{
    BlockId, BlockKind, DefSite, GraphResult, NodeId, NodeKind, Offset, RwGraph, SubgraphId, Target,
};

use crate::definitions::{Definitions, DefinitionsMap, join_definitions};
use crate::intervals::Interval;

/// The phi nodes registered on a subgraph boundary: `inputs` request
/// definitions from callers at the subgraph entry, `outputs` merge the
/// definitions leaving the subgraph for some byte range.
#[derive(Debug, Clone, Default)]
pub struct SubgraphSummary {
    inputs: Vec<NodeId>,
    outputs: Vec<NodeId>,
}

impl SubgraphSummary {
    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }

    fn add_input(&mut self, phi: NodeId) {
        self.inputs.push(phi);
    }

    fn add_output(&mut self, phi: NodeId) {
        self.outputs.push(phi);
    }
}

/// The analysis. Owns the graph for its lifetime; queries may grow the
/// graph with phi and mu nodes, never shrink it.
#[derive(Debug)]
pub struct MemorySsa {
    graph: RwGraph,
    block_defs: HashMap<BlockId, Definitions>,
    cached: HashMap<BlockId, DefinitionsMap>,
    summaries: HashMap<SubgraphId, SubgraphSummary>,
    phis: Vec<NodeId>,
}

impl MemorySsa {
    pub fn new(graph: RwGraph) -> Self {
        MemorySsa {
            graph,
            block_defs: HashMap::new(),
            cached: HashMap::new(),
            summaries: HashMap::new(),
            phis: Vec::new(),
        }
    }

    /// Prepare the graph for queries: confine defined calls to blocks of
    /// their own and check the structural preconditions.
    pub fn run(&mut self) -> GraphResult<()> {
        log::debug!("preparing graph for memory-SSA queries");
        self.graph.split_blocks_on_calls();
        self.graph.validate()
    }

    pub fn graph(&self) -> &RwGraph {
        &self.graph
    }

    pub fn into_graph(self) -> RwGraph {
        self.graph
    }

    /// The boundary phis created so far for `subgraph`.
    pub fn summary(&self, subgraph: SubgraphId) -> Option<&SubgraphSummary> {
        self.summaries.get(&subgraph)
    }

    /// Every phi the analysis has materialized, in creation order.
    pub fn phis(&self) -> &[NodeId] {
        &self.phis
    }

    /// The non-phi definitions reaching `use_node`'s reads, sorted by node
    /// id. The search runs once per node; repeated calls are lookups.
    ///
    /// # Panics
    ///
    /// Panics if `use_node` does not read memory.
    pub fn definitions_of(&mut self, use_node: NodeId) -> Vec<NodeId> {
        assert!(
            self.graph.node(use_node).is_use(),
            "definitions_of expects a node that reads memory"
        );
        self.ensure_definitions(use_node);
        let roots = self.graph.node(use_node).defuse.nodes().to_vec();
        self.flatten_phis(&roots)
    }

    /// The non-phi definitions reaching an ad-hoc read of
    /// `(mem, offset, length)` just before `site`. Splices a mu node into
    /// `site`'s block to carry the query.
    ///
    /// # Panics
    ///
    /// Panics if `site` is not placed in a block.
    pub fn definitions_at(
        &mut self,
        site: NodeId,
        mem: Target,
        offset: impl Into<Offset>,
        length: impl Into<Offset>,
    ) -> Vec<NodeId> {
        let mu = self.insert_use(site, mem, offset.into(), length.into());
        self.definitions_of(mu)
    }

    /// Force the search for every use in every block of every subgraph.
    pub fn compute_all_definitions(&mut self) {
        log::debug!("computing definitions for all uses");
        let subgraphs: Vec<SubgraphId> = self.graph.subgraph_ids().collect();
        for sg in subgraphs {
            let blocks = self.graph.subgraph(sg).blocks().to_vec();
            for block in blocks {
                let nodes = self.graph.block(block).nodes().to_vec();
                for node in nodes {
                    if self.graph.node(node).is_use() {
                        self.ensure_definitions(node);
                    }
                }
            }
        }
    }

    fn ensure_definitions(&mut self, node: NodeId) {
        if !self.graph.node(node).defuse.initialized() {
            let defs = self.find_definitions(node);
            self.graph.node_mut(node).defuse.extend(defs);
        }
    }

    /// Find the definitions of `node`'s reads. May contain phis and
    /// duplicates; [`Self::flatten_phis`] cleans the result up.
    fn find_definitions(&mut self, node: NodeId) -> Vec<NodeId> {
        log::debug!("searching definitions for node {node}");

        if self.graph.node(node).uses_unknown() {
            return self.find_all_reaching_definitions(node);
        }

        // nodes the builder never placed are dead code and define nothing
        let Some(block) = self.graph.node(node).block() else {
            return Vec::new();
        };

        // always recomputed: phis placed by earlier queries change the
        // state between the block start and the node
        let d = self.definitions_up_to(node);
        let uses = self.graph.node(node).uses.clone();
        let mut defs = Vec::new();
        for ds in &uses {
            let found = d.definitions().get(ds);
            if found.is_empty() {
                defs.extend(d.unknown_writes().iter());
            } else {
                defs.extend(found.iter());
            }
            for interval in d.uncovered(ds) {
                defs.extend(self.find_definitions_in_predecessors(block, &subsite(ds, interval)));
            }
        }
        defs
    }

    /// The block state from the block start up to (excluding) `to`.
    fn definitions_up_to(&self, to: NodeId) -> Definitions {
        let mut d = Definitions::default();
        let Some(block) = self.graph.node(to).block() else {
            return d;
        };
        for &node in self.graph.block(block).nodes() {
            if node == to {
                break;
            }
            update_definitions(&self.graph, &mut d, node);
        }
        d
    }

    /// Find the definitions of `ds` reaching the end of `block`, chasing
    /// uncovered bytes further up the CFG.
    fn find_definitions_from(&mut self, block: BlockId, ds: &DefSite) -> Vec<NodeId> {
        if let Some(cache) = self.cached.get(&block) {
            return cache.get(ds).iter().collect();
        }

        self.block_definitions(block, Some(ds));
        let (found, fallback, uncovered) = {
            let d = &self.block_defs[&block];
            (
                d.definitions().get(ds),
                d.unknown_writes().clone(),
                d.uncovered(ds),
            )
        };

        let mut defs: Vec<NodeId> = if found.is_empty() {
            fallback.iter().collect()
        } else {
            found.iter().collect()
        };
        for interval in uncovered {
            defs.extend(self.find_definitions_in_predecessors(block, &subsite(ds, interval)));
        }
        defs
    }

    /// Find the definitions of `ds` in the predecessors of `block`,
    /// materializing phis at joins and boundaries.
    fn find_definitions_in_predecessors(&mut self, block: BlockId, ds: &DefSite) -> Vec<NodeId> {
        debug_assert!(
            !ds.target.is_unknown(),
            "unknown memory is resolved by the all-reaching search"
        );

        let mut defs = Vec::new();
        if let Some(pred) = self.graph.block(block).single_predecessor() {
            // no join point: search the predecessor directly
            let pdefs = self.find_definitions_from(pred, ds);
            self.block_definitions(pred, Some(ds));
            let (fallback, uncovered) = {
                let d = &self.block_defs[&pred];
                (d.unknown_writes().clone(), d.uncovered(ds))
            };
            if pdefs.is_empty() {
                defs.extend(fallback.iter());
            } else {
                defs.extend(pdefs);
            }
            for interval in uncovered {
                defs.extend(self.find_definitions_in_predecessors(pred, &subsite(ds, interval)));
            }
        } else if self.graph.block(block).has_predecessors() {
            let phi = self.create_and_place_phi(block, ds);
            self.find_phi_definitions(phi);
            defs.push(phi);
        } else {
            // subgraph entry: the definitions come from the callers
            self.block_definitions(block, Some(ds));
            let phi = self.create_phi_in(block, ds);
            let subgraph = self.graph.block(block).subgraph();
            self.summaries.entry(subgraph).or_default().add_input(phi);
            self.definitions_from_callers(phi, subgraph, ds);
            defs.push(phi);
        }
        defs
    }

    /// Resolve the operands of a phi placed at a join point, one
    /// predecessor at a time.
    fn find_phi_definitions(&mut self, phi: NodeId) {
        let block = match self.graph.node(phi).block() {
            Some(block) => block,
            None => unreachable!("resolving a phi that was never placed"),
        };
        debug_assert!(
            self.graph.block(block).single_predecessor().is_none(),
            "phi in a block with a single predecessor"
        );
        let ds = match self.graph.node(phi).overwrites.first() {
            Some(ds) => *ds,
            None => unreachable!("phi without an overwrite site"),
        };
        let preds: Vec<BlockId> = self.graph.block(block).predecessors().to_vec();
        for pred in preds {
            let found = self.find_definitions_from(pred, &ds);
            self.graph.node_mut(phi).defuse.extend(found);
        }
    }

    /// Make sure `block`'s state is ready for a query about `ds`: plain
    /// blocks run LVN once, call blocks synthesize phis for whatever part
    /// of `ds` they have not materialized yet. `None` takes the state as
    /// currently accumulated (used by the all-reaching walk, which has no
    /// single def-site to ask about).
    fn block_definitions(&mut self, block: BlockId, ds: Option<&DefSite>) {
        let kind = self.graph.block(block).kind();
        match kind {
            BlockKind::Call(call) => {
                if let Some(ds) = ds {
                    self.definitions_from_call(block, call, ds);
                } else {
                    self.block_defs.entry(block).or_default();
                }
            }
            BlockKind::Plain => {
                let graph = &self.graph;
                let d = self.block_defs.entry(block).or_default();
                if !d.is_processed() {
                    log::trace!("running LVN for block {block}");
                    for &node in graph.block(block).nodes() {
                        update_definitions(graph, d, node);
                    }
                    d.set_processed();
                }
            }
        }
    }

    /// Synthesize the definitions `ds` receives from a call to defined
    /// callees: one phi at the call site, merging one phi per callee that
    /// in turn merges the definitions reaching the callee's exits.
    fn definitions_from_call(&mut self, block: BlockId, call: NodeId, ds: &DefSite) {
        let uncovered = self.block_defs.entry(block).or_default().uncovered(ds);
        for interval in uncovered {
            let site = subsite(ds, interval);
            let phi = self.create_phi_in(block, &site);
            self.graph.append_node(block, phi);

            let callees: Vec<SubgraphId> = match self.graph.node(call).call() {
                Some(targets) => targets.defined_callees().collect(),
                None => unreachable!("call blocks always hold a call node"),
            };
            for callee in callees {
                let callee_phi = self.create_phi(&site);
                self.summaries
                    .entry(callee)
                    .or_default()
                    .add_output(callee_phi);
                self.graph.node_mut(phi).defuse.add(callee_phi);

                let exits: Vec<BlockId> = self
                    .graph
                    .subgraph(callee)
                    .blocks()
                    .iter()
                    .copied()
                    .filter(|b| !self.graph.block(*b).has_successors())
                    .collect();
                for exit in exits {
                    let found = self.find_definitions_from(exit, &site);
                    self.graph.node_mut(callee_phi).defuse.extend(found);
                }
            }
        }
    }

    /// Resolve a subgraph-input phi against every call site of the
    /// subgraph: the definitions reaching a caller's call block are the
    /// definitions entering the callee.
    fn definitions_from_callers(&mut self, phi: NodeId, subgraph: SubgraphId, ds: &DefSite) {
        let callers: Vec<NodeId> = self.graph.subgraph(subgraph).callers().to_vec();
        for call in callers {
            let Some(block) = self.graph.node(call).block() else {
                continue;
            };
            debug_assert!(
                matches!(self.graph.block(block).kind(), BlockKind::Call(_)),
                "caller of a defined subgraph outside a call block"
            );
            let found = self.find_definitions_in_predecessors(block, ds);
            self.graph.node_mut(phi).defuse.extend(found);
        }
    }

    fn create_phi(&mut self, ds: &DefSite) -> NodeId {
        let phi = self.graph.add_node(NodeKind::Phi);
        self.graph.node_mut(phi).add_overwrite(*ds);
        self.phis.push(phi);
        log::debug!("created phi {phi}");
        phi
    }

    /// Create a phi for `ds` and register it as `block`'s definition of
    /// every byte of `ds` the block does not define yet. The registration
    /// happens before any operand is resolved; that is what lets searches
    /// looping back into `block` terminate.
    fn create_phi_in(&mut self, block: BlockId, ds: &DefSite) -> NodeId {
        let phi = self.create_phi(ds);
        let d = self.block_defs.entry(block).or_default();
        let uncovered = d.uncovered(ds);
        for interval in uncovered {
            d.register_phi(&subsite(ds, interval), phi);
        }
        phi
    }

    fn create_and_place_phi(&mut self, block: BlockId, ds: &DefSite) -> NodeId {
        self.block_definitions(block, Some(ds));
        let phi = self.create_phi_in(block, ds);
        self.graph.prepend_node(block, phi);
        phi
    }

    /// A read of unknown memory cannot be answered per interval; collect
    /// every write reaching the node through the CFG instead.
    fn find_all_reaching_definitions(&mut self, from: NodeId) -> Vec<NodeId> {
        log::debug!("finding all reaching definitions for node {from}");
        let Some(block) = self.graph.node(from).block() else {
            return Vec::new();
        };

        let mut d = self.definitions_up_to(from);
        let mut defs = DefinitionsMap::default();
        let mut visited: HashSet<BlockId> = HashSet::new();

        if let Some(pred) = self.graph.block(block).single_predecessor() {
            // the walk must start from an empty accumulator, or the cached
            // map written below would be missing upstream definitions
            debug_assert!(defs.is_empty());
            self.collect_reaching(&mut defs, pred, &mut visited);
            // everything reaching the end of the predecessor is now known;
            // keep it for later queries (write-once)
            self.cached.entry(pred).or_insert_with(|| defs.clone());
        } else {
            let preds: Vec<BlockId> = self.graph.block(block).predecessors().to_vec();
            for pred in preds {
                // fork the accumulator per branch, seeded with this block's
                // kills so already-overwritten bytes are not searched; the
                // seeds are path-dependent, so no caching here
                let mut forked = d.kills().clone();
                self.collect_reaching(&mut forked, pred, &mut visited);
                defs.merge(&forked);
            }
        }

        join_definitions(&defs, &mut d.definitions);
        let all = d.definitions.all_nodes();
        self.flatten_phis(&all)
    }

    fn collect_reaching(
        &mut self,
        defs: &mut DefinitionsMap,
        block: BlockId,
        visited: &mut HashSet<BlockId>,
    ) {
        if !visited.insert(block) {
            if let Some(cache) = self.cached.get(&block) {
                join_definitions(cache, defs);
            }
            return;
        }
        if let Some(cache) = self.cached.get(&block) {
            join_definitions(cache, defs);
            return;
        }

        self.block_definitions(block, None);
        {
            let d = &self.block_defs[&block];
            join_definitions(d.definitions(), defs);
        }

        if let Some(pred) = self.graph.block(block).single_predecessor() {
            self.collect_reaching(defs, pred, visited);
        } else {
            let preds: Vec<BlockId> = self.graph.block(block).predecessors().to_vec();
            for pred in preds {
                let mut forked = defs.clone();
                self.collect_reaching(&mut forked, pred, visited);
                defs.merge(&forked);
            }
        }
    }

    /// Resolve phi chains to the non-phi writers behind them. Visited phis
    /// are tracked so cyclic chains terminate; the result is sorted by node
    /// id.
    fn flatten_phis(&self, roots: &[NodeId]) -> Vec<NodeId> {
        let mut result = BTreeSet::new();
        let mut seen = BTreeSet::new();
        let mut stack: Vec<NodeId> = roots.to_vec();
        while let Some(node) = stack.pop() {
            if self.graph.node(node).is_phi() {
                if seen.insert(node) {
                    stack.extend(self.graph.node(node).defuse.nodes().iter().copied());
                }
            } else {
                result.insert(node);
            }
        }
        result.into_iter().collect()
    }

    /// Splice a mu node carrying the read `(mem, offset, length)` into
    /// `site`'s block, immediately before `site`.
    fn insert_use(&mut self, site: NodeId, mem: Target, offset: Offset, length: Offset) -> NodeId {
        let mu = self.graph.add_node(NodeKind::Mu);
        self.graph
            .node_mut(mu)
            .add_use(DefSite::new(mem, offset, length));
        self.graph.insert_before(mu, site);
        mu
    }
}

/// Fold one node into a block state. External calls contribute their
/// summary node's def-sites, attributed to the call itself.
fn update_definitions(graph: &RwGraph, d: &mut Definitions, node: NodeId) {
    if let Some(call) = graph.node(node).call() {
        debug_assert!(
            !call.calls_defined(),
            "defined calls must be confined to call blocks"
        );
        match call.single_undefined() {
            Some(summary) => d.update(graph, summary, node),
            None => panic!("call {node} has no resolvable callee"),
        }
    } else {
        d.update(graph, node, node);
    }
}

fn subsite(ds: &DefSite, interval: Interval) -> DefSite {
    DefSite {
        target: ds.target,
        offset: interval.start,
        length: interval.length,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(graph: &mut RwGraph, block: BlockId, ds: DefSite) -> NodeId {
        let node = graph.add_node(NodeKind::Plain);
        graph.node_mut(node).add_overwrite(ds);
        graph.append_node(block, node);
        node
    }

    fn load(graph: &mut RwGraph, block: BlockId, ds: DefSite) -> NodeId {
        let node = graph.add_node(NodeKind::Plain);
        graph.node_mut(node).add_use(ds);
        graph.append_node(block, node);
        node
    }

    #[test]
    fn lvn_runs_once_per_block() {
        let mut graph = RwGraph::new();
        let sg = graph.add_subgraph();
        let block = graph.add_block(sg);
        let mem = Target::Mem(graph.fresh_mem());
        let site = DefSite::new(mem, 0u64, 4u64);
        let writer = store(&mut graph, block, site);

        let mut ssa = MemorySsa::new(graph);
        ssa.run().unwrap();

        ssa.block_definitions(block, Some(&site));
        let first = ssa.block_defs[&block].definitions().get(&site);
        ssa.block_definitions(block, Some(&site));
        let second = ssa.block_defs[&block].definitions().get(&site);

        assert_eq!(first, second);
        assert!(first.contains(writer));
        assert!(ssa.block_defs[&block].is_processed());
    }

    #[test]
    fn partial_block_state_stops_before_the_query_point() {
        let mut graph = RwGraph::new();
        let sg = graph.add_subgraph();
        let block = graph.add_block(sg);
        let mem = Target::Mem(graph.fresh_mem());
        let site = DefSite::new(mem, 0u64, 4u64);
        let early = store(&mut graph, block, site);
        let probe = load(&mut graph, block, site);
        let late = store(&mut graph, block, site);

        let ssa = MemorySsa::new(graph);
        let d = ssa.definitions_up_to(probe);
        let found = d.definitions().get(&site);
        assert!(found.contains(early));
        assert!(!found.contains(late));
    }
}
