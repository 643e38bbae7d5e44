//! Aggregate definition maps: which nodes define which bytes of which
//! memory objects, and the per-block state the local pass accumulates.

use itertools::Itertools;
use linked_hash_map::LinkedHashMap;
use memdep_ir::{DefSite, NodeId, RwGraph, Target};

use crate::intervals::{Interval, IntervalMap, NodeSet};

/// `Target → IntervalMap`: the definitions reaching some program point.
///
/// Keyed in insertion order so that every traversal of the map is stable
/// across runs.
#[derive(Debug, Clone)]
pub struct DefinitionsMap {
    map: LinkedHashMap<Target, IntervalMap>,
}

impl Default for DefinitionsMap {
    fn default() -> Self {
        DefinitionsMap {
            map: LinkedHashMap::new(),
        }
    }
}

impl DefinitionsMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Target, &IntervalMap)> {
        self.map.iter()
    }

    pub fn defines_target(&self, target: Target) -> bool {
        self.map.contains_key(&target)
    }

    fn entry(&mut self, target: Target) -> &mut IntervalMap {
        self.map.entry(target).or_insert_with(IntervalMap::default)
    }

    pub fn add(&mut self, ds: &DefSite, node: NodeId) {
        self.entry(ds.target).add(Interval::from_site(ds), node);
    }

    pub fn add_set(&mut self, ds: &DefSite, nodes: &NodeSet) {
        self.entry(ds.target).add_set(Interval::from_site(ds), nodes);
    }

    pub fn add_interval(&mut self, target: Target, interval: Interval, nodes: &NodeSet) {
        self.entry(target).add_set(interval, nodes);
    }

    pub fn update(&mut self, ds: &DefSite, node: NodeId) {
        self.entry(ds.target).update(Interval::from_site(ds), node);
    }

    pub fn get(&self, ds: &DefSite) -> NodeSet {
        match self.map.get(&ds.target) {
            Some(intervals) => intervals.get(&Interval::from_site(ds)),
            None => NodeSet::new(),
        }
    }

    /// Sub-ranges of the query that no stored definition covers. A target
    /// the map has never seen is uncovered wholesale.
    pub fn undefined_intervals(&self, ds: &DefSite) -> Vec<Interval> {
        match self.map.get(&ds.target) {
            Some(intervals) => intervals.uncovered(&Interval::from_site(ds)),
            None => vec![Interval::from_site(ds)],
        }
    }

    /// Insert `node` into every value-set of every target.
    pub fn add_to_all(&mut self, node: NodeId) {
        for (_, intervals) in self.map.iter_mut() {
            intervals.add_to_all(node);
        }
    }

    /// Union every entry of `other` into this map.
    pub fn merge(&mut self, other: &DefinitionsMap) {
        for (target, intervals) in other.iter() {
            for (interval, nodes) in intervals.iter() {
                self.add_interval(*target, *interval, nodes);
            }
        }
    }

    /// Every node stored anywhere in the map, deduplicated and sorted.
    pub fn all_nodes(&self) -> Vec<NodeId> {
        self.map
            .values()
            .flat_map(|intervals| intervals.iter())
            .flat_map(|(_, nodes)| nodes.iter())
            .sorted()
            .dedup()
            .collect()
    }
}

/// Copy definitions from `from` into `to`, but only for byte ranges `to`
/// does not already define. This simulates executing `to` after `from`:
/// whatever `to` defines wins.
pub fn join_definitions(from: &DefinitionsMap, to: &mut DefinitionsMap) {
    for (target, intervals) in from.iter() {
        if !to.defines_target(*target) {
            to.map.insert(*target, intervals.clone());
            continue;
        }
        for (interval, nodes) in intervals.iter() {
            let gaps = match to.map.get(target) {
                Some(existing) => existing.uncovered(interval),
                None => vec![*interval],
            };
            for gap in gaps {
                to.add_interval(*target, gap, nodes);
            }
        }
    }
}

/// The memory state a single basic block accumulates: the definitions and
/// kills its nodes contribute, plus the nodes that write or read memory the
/// analysis cannot name.
#[derive(Debug, Clone, Default)]
pub struct Definitions {
    pub(crate) definitions: DefinitionsMap,
    pub(crate) kills: DefinitionsMap,
    pub(crate) unknown_writes: NodeSet,
    pub(crate) unknown_reads: NodeSet,
    processed: bool,
}

impl Definitions {
    pub fn definitions(&self) -> &DefinitionsMap {
        &self.definitions
    }

    pub fn kills(&self) -> &DefinitionsMap {
        &self.kills
    }

    pub fn unknown_writes(&self) -> &NodeSet {
        &self.unknown_writes
    }

    pub fn unknown_reads(&self) -> &NodeSet {
        &self.unknown_reads
    }

    pub fn is_processed(&self) -> bool {
        self.processed
    }

    pub(crate) fn set_processed(&mut self) {
        self.processed = true;
    }

    pub fn uncovered(&self, ds: &DefSite) -> Vec<Interval> {
        self.definitions.undefined_intervals(ds)
    }

    /// Fold `node`'s def-site lists into this state. `defnode` is the node
    /// the definitions are attributed to; it differs from `node` only for
    /// external calls, where the call stands in for its summary node.
    pub fn update(&mut self, graph: &RwGraph, node: NodeId, defnode: NodeId) {
        let n = graph.node(node);

        // possible definitions
        for ds in &n.defs {
            if ds.target.is_unknown() {
                // any byte of any object may now hold this node's value
                self.definitions.add_to_all(defnode);
                self.unknown_writes.insert(defnode);
            } else {
                self.add_possible(ds, defnode);
            }
        }

        // definitive definitions
        for ds in &n.overwrites {
            debug_assert!(
                graph.node(defnode).is_phi() || !ds.offset.is_unknown(),
                "must-overwrite with an unknown offset on a non-phi node"
            );
            debug_assert!(!ds.target.is_unknown(), "must-overwrite of unknown memory");
            self.kills.add(ds, defnode);
            self.definitions.update(ds, defnode);
        }

        if n.uses_unknown() {
            self.unknown_reads.insert(defnode);
        }
    }

    fn add_possible(&mut self, ds: &DefSite, defnode: NodeId) {
        if self.unknown_writes.is_empty() {
            self.definitions.add(ds, defnode);
        } else {
            // bytes written after an unknown write may still hold its value
            let mut nodes = self.unknown_writes.clone();
            nodes.insert(defnode);
            self.definitions.add_set(ds, &nodes);
        }
    }

    /// Install a freshly created phi as the definition of `ds`.
    pub(crate) fn register_phi(&mut self, ds: &DefSite, phi: NodeId) {
        debug_assert!(self.kills.get(ds).is_empty());
        self.definitions.update(ds, phi);
        self.kills.add(ds, phi);
        if !self.unknown_writes.is_empty() {
            let writes = self.unknown_writes.clone();
            self.definitions.add_set(ds, &writes);
        }
    }
}
