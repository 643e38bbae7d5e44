//! End-to-end reaching-definitions queries over hand-built graphs.

use memdep_analysis::MemorySsa;
use memdep_ir::{BlockId, CallTarget, DefSite, NodeId, NodeKind, Offset, RwGraph, Target};
use proptest::prelude::*;

fn store(graph: &mut RwGraph, block: BlockId, mem: Target, offset: u64, length: u64) -> NodeId {
    let node = graph.add_node(NodeKind::Plain);
    graph
        .node_mut(node)
        .add_overwrite(DefSite::new(mem, offset, length));
    graph.append_node(block, node);
    node
}

fn may_store(graph: &mut RwGraph, block: BlockId, mem: Target, offset: u64, length: u64) -> NodeId {
    let node = graph.add_node(NodeKind::Plain);
    graph
        .node_mut(node)
        .add_def(DefSite::new(mem, offset, length));
    graph.append_node(block, node);
    node
}

fn load(graph: &mut RwGraph, block: BlockId, mem: Target, offset: u64, length: u64) -> NodeId {
    let node = graph.add_node(NodeKind::Plain);
    graph
        .node_mut(node)
        .add_use(DefSite::new(mem, offset, length));
    graph.append_node(block, node);
    node
}

fn analyze(graph: RwGraph) -> MemorySsa {
    let mut ssa = MemorySsa::new(graph);
    ssa.run().expect("graph meets the analysis preconditions");
    ssa
}

#[test]
fn straight_line_store_reaches_load() {
    let mut g = RwGraph::new();
    let sg = g.add_subgraph();
    let b = g.add_block(sg);
    let x = Target::Mem(g.fresh_mem());
    let a = store(&mut g, b, x, 0, 4);
    let u = load(&mut g, b, x, 0, 4);

    let mut ssa = analyze(g);
    assert_eq!(ssa.definitions_of(u), vec![a]);
    assert!(ssa.phis().is_empty());
}

#[test]
fn kill_shadows_earlier_store() {
    let mut g = RwGraph::new();
    let sg = g.add_subgraph();
    let b1 = g.add_block(sg);
    let b2 = g.add_block(sg);
    g.add_edge(b1, b2);
    let x = Target::Mem(g.fresh_mem());
    let _shadowed = store(&mut g, b1, x, 0, 4);
    let killer = store(&mut g, b2, x, 0, 4);
    let u = load(&mut g, b2, x, 0, 4);

    let mut ssa = analyze(g);
    assert_eq!(ssa.definitions_of(u), vec![killer]);
}

#[test]
fn diamond_merges_both_sides() {
    let mut g = RwGraph::new();
    let sg = g.add_subgraph();
    let entry = g.add_block(sg);
    let left = g.add_block(sg);
    let right = g.add_block(sg);
    let join = g.add_block(sg);
    g.add_edge(entry, left);
    g.add_edge(entry, right);
    g.add_edge(left, join);
    g.add_edge(right, join);
    let x = Target::Mem(g.fresh_mem());
    let a = store(&mut g, left, x, 0, 4);
    let b = store(&mut g, right, x, 0, 4);
    let u = load(&mut g, join, x, 0, 4);

    let mut ssa = analyze(g);
    assert_eq!(ssa.definitions_of(u), vec![a, b]);

    // exactly one phi, materialized at the head of the join block
    assert_eq!(ssa.phis().len(), 1);
    let phi = ssa.phis()[0];
    assert_eq!(ssa.graph().block(join).first(), Some(phi));
    assert!(ssa.graph().node(phi).is_phi());
}

#[test]
fn diamond_with_one_silent_side() {
    let mut g = RwGraph::new();
    let sg = g.add_subgraph();
    let entry = g.add_block(sg);
    let left = g.add_block(sg);
    let right = g.add_block(sg);
    let join = g.add_block(sg);
    g.add_edge(entry, left);
    g.add_edge(entry, right);
    g.add_edge(left, join);
    g.add_edge(right, join);
    let x = Target::Mem(g.fresh_mem());
    let a = store(&mut g, left, x, 0, 4);
    let u = load(&mut g, join, x, 0, 4);

    let mut ssa = analyze(g);
    // the silent side contributes nothing: its search bottoms out in an
    // unresolved entry phi, which flattening drops
    assert_eq!(ssa.definitions_of(u), vec![a]);
}

#[test]
fn partial_overwrite_splits_intervals() {
    let mut g = RwGraph::new();
    let sg = g.add_subgraph();
    let b = g.add_block(sg);
    let x = Target::Mem(g.fresh_mem());
    let a = store(&mut g, b, x, 0, 8);
    let inner = store(&mut g, b, x, 2, 4);
    let u = load(&mut g, b, x, 0, 8);

    let mut ssa = analyze(g);
    // bytes 0..2 and 6..8 still come from the outer store
    assert_eq!(ssa.definitions_of(u), vec![a, inner]);

    // but a read of the overwritten middle sees only the inner store
    let narrow = ssa.definitions_at(u, x, 3u64, 2u64);
    assert_eq!(narrow, vec![inner]);
}

#[test]
fn loop_definitions_survive_the_back_edge() {
    let mut g = RwGraph::new();
    let sg = g.add_subgraph();
    let entry = g.add_block(sg);
    let header = g.add_block(sg);
    g.add_edge(entry, header);
    g.add_edge(header, header);
    let x = Target::Mem(g.fresh_mem());
    let a = store(&mut g, entry, x, 0, 4);
    let u = load(&mut g, header, x, 0, 4);

    let mut ssa = analyze(g);
    assert_eq!(ssa.definitions_of(u), vec![a]);

    // the loop phi found itself through the back edge and stopped there
    assert_eq!(ssa.phis().len(), 1);
    let phi = ssa.phis()[0];
    assert!(ssa.graph().node(phi).defuse.nodes().contains(&phi));
}

#[test]
fn store_and_load_in_a_self_loop_block() {
    let mut g = RwGraph::new();
    let sg = g.add_subgraph();
    let entry = g.add_block(sg);
    let l = g.add_block(sg);
    g.add_edge(entry, l);
    g.add_edge(l, l);
    let x = Target::Mem(g.fresh_mem());
    let a = store(&mut g, l, x, 0, 4);
    let u = load(&mut g, l, x, 0, 4);

    let mut ssa = analyze(g);
    // covered inside the block; the back edge is never consulted
    assert_eq!(ssa.definitions_of(u), vec![a]);
    assert!(ssa.phis().is_empty());
}

#[test]
fn unknown_write_is_a_universal_definition() {
    let mut g = RwGraph::new();
    let sg = g.add_subgraph();
    let b = g.add_block(sg);
    let x = Target::Mem(g.fresh_mem());
    let wild = g.add_node(NodeKind::Plain);
    g.node_mut(wild).add_def(DefSite::unknown());
    g.append_node(b, wild);
    let u = load(&mut g, b, x, 0, 4);

    let mut ssa = analyze(g);
    assert_eq!(ssa.definitions_of(u), vec![wild]);
}

#[test]
fn interprocedural_callee_write_reaches_caller() {
    let mut g = RwGraph::new();
    let x = Target::Mem(g.fresh_mem());

    let callee = g.add_subgraph();
    let callee_body = g.add_block(callee);
    let a = store(&mut g, callee_body, x, 0, 4);

    let main = g.add_subgraph();
    let entry = g.add_block(main);
    let call_block = g.add_block(main);
    let after = g.add_block(main);
    g.add_edge(entry, call_block);
    g.add_edge(call_block, after);
    let call = g.add_node(NodeKind::Call(Default::default()));
    g.add_callee(call, CallTarget::Defined(callee));
    g.append_node(call_block, call);
    let u = load(&mut g, after, x, 0, 4);

    let mut ssa = analyze(g);
    assert_eq!(ssa.definitions_of(u), vec![a]);

    // one phi at the call site, one summary output in the callee
    assert_eq!(ssa.phis().len(), 2);
    let summary = ssa.summary(callee).expect("callee was entered");
    assert_eq!(summary.outputs().len(), 1);
    assert!(summary.inputs().is_empty());
    let call_site_phi = ssa.phis()[0];
    assert_eq!(
        ssa.graph().block(call_block).nodes(),
        [call, call_site_phi]
    );
}

#[test]
fn entry_boundary_pulls_definitions_from_callers() {
    let mut g = RwGraph::new();
    let x = Target::Mem(g.fresh_mem());

    let callee = g.add_subgraph();
    let callee_body = g.add_block(callee);
    let u = load(&mut g, callee_body, x, 0, 4);

    let main = g.add_subgraph();
    let entry = g.add_block(main);
    let call_block = g.add_block(main);
    g.add_edge(entry, call_block);
    let a = store(&mut g, entry, x, 0, 4);
    let call = g.add_node(NodeKind::Call(Default::default()));
    g.add_callee(call, CallTarget::Defined(callee));
    g.append_node(call_block, call);

    let mut ssa = analyze(g);
    assert_eq!(ssa.definitions_of(u), vec![a]);

    let summary = ssa.summary(callee).expect("callee entry was crossed");
    assert_eq!(summary.inputs().len(), 1);
    assert!(summary.outputs().is_empty());
}

#[test]
fn ad_hoc_queries_splice_a_mu_node() {
    let mut g = RwGraph::new();
    let sg = g.add_subgraph();
    let b1 = g.add_block(sg);
    let b2 = g.add_block(sg);
    g.add_edge(b1, b2);
    let x = Target::Mem(g.fresh_mem());
    let a = store(&mut g, b1, x, 0, 4);
    let anchor = load(&mut g, b2, x, 0, 4);

    let mut ssa = analyze(g);
    assert_eq!(ssa.definitions_at(anchor, x, 0u64, 4u64), vec![a]);

    // the mu sits in the anchor's block, immediately before it
    let nodes = ssa.graph().block(b2).nodes();
    assert_eq!(nodes.len(), 2);
    assert!(ssa.graph().node(nodes[0]).is_mu());
    assert_eq!(nodes[1], anchor);
}

#[test]
fn queries_are_idempotent_and_phi_free() {
    let mut g = RwGraph::new();
    let sg = g.add_subgraph();
    let entry = g.add_block(sg);
    let left = g.add_block(sg);
    let right = g.add_block(sg);
    let join = g.add_block(sg);
    g.add_edge(entry, left);
    g.add_edge(entry, right);
    g.add_edge(left, join);
    g.add_edge(right, join);
    let x = Target::Mem(g.fresh_mem());
    let a = store(&mut g, left, x, 0, 4);
    let b = store(&mut g, right, x, 0, 4);
    let u = load(&mut g, join, x, 0, 4);

    let mut ssa = analyze(g);
    let first = ssa.definitions_of(u);
    let created = ssa.phis().len();
    let second = ssa.definitions_of(u);

    assert_eq!(first, second);
    assert_eq!(ssa.phis().len(), created, "memoized lookup created phis");
    for node in &first {
        assert!(!ssa.graph().node(*node).is_phi());
    }
    assert_eq!(first, vec![a, b]);
}

#[test]
fn identical_graphs_give_identical_answers() {
    fn build() -> (RwGraph, NodeId) {
        let mut g = RwGraph::new();
        let sg = g.add_subgraph();
        let entry = g.add_block(sg);
        let left = g.add_block(sg);
        let right = g.add_block(sg);
        let join = g.add_block(sg);
        g.add_edge(entry, left);
        g.add_edge(entry, right);
        g.add_edge(left, join);
        g.add_edge(right, join);
        let x = Target::Mem(g.fresh_mem());
        store(&mut g, entry, x, 0, 8);
        store(&mut g, left, x, 0, 4);
        may_store(&mut g, right, x, 2, 4);
        let u = load(&mut g, join, x, 0, 8);
        (g, u)
    }

    let (g1, u1) = build();
    let (g2, u2) = build();
    let mut ssa1 = analyze(g1);
    let mut ssa2 = analyze(g2);
    assert_eq!(ssa1.definitions_of(u1), ssa2.definitions_of(u2));
}

#[test]
fn unknown_reads_collect_all_reaching_writes() {
    let mut g = RwGraph::new();
    let sg = g.add_subgraph();
    let b0 = g.add_block(sg);
    let b1 = g.add_block(sg);
    let b2 = g.add_block(sg);
    g.add_edge(b0, b1);
    g.add_edge(b1, b2);
    let x = Target::Mem(g.fresh_mem());
    let y = Target::Mem(g.fresh_mem());
    let c = may_store(&mut g, b0, y, 0, 8);
    let a = store(&mut g, b1, x, 0, 4);
    let probe = g.add_node(NodeKind::Plain);
    g.node_mut(probe).add_use(DefSite::unknown());
    g.append_node(b2, probe);

    let mut ssa = analyze(g);
    assert_eq!(ssa.definitions_of(probe), vec![c, a]);

    // a second unknown read at the same point reuses the cached walk
    let again = ssa.definitions_at(probe, Target::Unknown, Offset::UNKNOWN, Offset::UNKNOWN);
    assert_eq!(again, vec![c, a]);
}

proptest! {
    // a straight-line program of must-writes has exactly one reaching
    // definition per byte: the last writer
    #[test]
    fn straight_line_must_writes_are_exact(
        writes in proptest::collection::vec((0u64..32, 1u64..8), 1..12),
        query_start in 0u64..32,
        query_length in 1u64..8,
    ) {
        let mut g = RwGraph::new();
        let sg = g.add_subgraph();
        let b = g.add_block(sg);
        let x = Target::Mem(g.fresh_mem());
        let mut last_writer = std::collections::HashMap::new();
        for (offset, length) in &writes {
            let node = store(&mut g, b, x, *offset, *length);
            for byte in *offset..offset + length {
                last_writer.insert(byte, node);
            }
        }
        let anchor = g.add_node(NodeKind::Plain);
        g.append_node(b, anchor);

        let mut ssa = analyze(g);
        let got = ssa.definitions_at(anchor, x, query_start, query_length);

        let expected: std::collections::BTreeSet<NodeId> = (query_start
            ..query_start + query_length)
            .filter_map(|byte| last_writer.get(&byte).copied())
            .collect();
        let expected: Vec<NodeId> = expected.into_iter().collect();
        prop_assert_eq!(got, expected);
    }

    // with may-writes mixed in, the answer over-approximates but never
    // loses a writer that could still be observed
    #[test]
    fn straight_line_searches_are_sound(
        writes in proptest::collection::vec((0u64..32, 1u64..8, any::<bool>()), 1..12),
        query_start in 0u64..32,
        query_length in 1u64..8,
    ) {
        let mut g = RwGraph::new();
        let sg = g.add_subgraph();
        let b = g.add_block(sg);
        let x = Target::Mem(g.fresh_mem());
        let mut live: std::collections::HashMap<u64, Vec<NodeId>> =
            std::collections::HashMap::new();
        for (offset, length, definitive) in &writes {
            let node = if *definitive {
                store(&mut g, b, x, *offset, *length)
            } else {
                may_store(&mut g, b, x, *offset, *length)
            };
            for byte in *offset..offset + length {
                let entry = live.entry(byte).or_default();
                if *definitive {
                    entry.clear();
                }
                entry.push(node);
            }
        }
        let anchor = g.add_node(NodeKind::Plain);
        g.append_node(b, anchor);

        let mut ssa = analyze(g);
        let got: std::collections::BTreeSet<NodeId> = ssa
            .definitions_at(anchor, x, query_start, query_length)
            .into_iter()
            .collect();

        for byte in query_start..query_start + query_length {
            for writer in live.get(&byte).into_iter().flatten() {
                prop_assert!(
                    got.contains(writer),
                    "writer {} of byte {} is missing",
                    writer,
                    byte
                );
            }
        }
    }
}
