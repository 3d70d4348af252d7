//! Fine-grained dependency graph over the next-state region, and its
//! decomposition into the maximal set of independent fibers.
//!
//! Vertices are definition points, commit points, and computations; edges
//! are data dependencies weighted by transferred word count. Combinational
//! logic reachable from more than one commit point is duplicated, once per
//! reaching fiber, trading replicated computation for communication.
use crate::fiber::Fiber;
use itertools::Itertools;
use linked_hash_map::LinkedHashMap;
use petgraph::algo;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::unionfind::UnionFind;
use petgraph::visit::EdgeRef;
use petgraph::Direction::{Incoming, Outgoing};
use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use weft_ir::{Design, SignalId, StmtId};
use weft_utils::{Error, WeftResult};

/// Dependency-graph vertex. A closed sum: every pass matches exhaustively.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DepVertex {
    /// Read-availability point of a signal instance.
    Def(SignalId),
    /// Write-back point of a signal instance at the superstep barrier.
    Commit(SignalId),
    /// A logic statement.
    Comp(StmtId),
}

impl DepVertex {
    pub fn comp(self) -> Option<StmtId> {
        match self {
            DepVertex::Comp(sid) => Some(sid),
            _ => None,
        }
    }
}

/// Edge weight is the transferred word count.
pub type DepGraph = DiGraph<DepVertex, u32>;

/// Build the single fine-grained graph for the next-state region.
///
/// Rejects (taxonomy (a)) more than one clock domain and combinational
/// cycles. A combinational signal with two producers is an
/// internal-consistency violation: the classifier proves single-producer
/// comb logic upstream, so finding one here means a pass corrupted the
/// design, and we abort with context.
pub fn build(design: &Design, region: &[StmtId]) -> WeftResult<DepGraph> {
    let mut graph = DepGraph::new();
    let mut defs: HashMap<SignalId, NodeIndex> = HashMap::new();
    let mut commits: HashMap<SignalId, NodeIndex> = HashMap::new();
    let mut comb_producer: HashMap<SignalId, StmtId> = HashMap::new();
    let mut clock = None;

    for &sid in region {
        let stmt = &design.stmts[sid];
        match stmt.domain {
            weft_ir::Domain::Comb => {}
            weft_ir::Domain::Clocked(clk) => match clock {
                None => clock = Some(clk),
                Some(seen) if seen == clk => {}
                Some(seen) => {
                    return Err(Error::unsupported(format!(
                        "next-state region mixes clock domains {:?} and {:?}",
                        seen, clk
                    )));
                }
            },
            other => unreachable!(
                "statement {:?} with domain {:?} in the next-state region",
                sid, other
            ),
        }

        let comp = graph.add_node(DepVertex::Comp(sid));
        for &read in &stmt.reads {
            let def = *defs
                .entry(read)
                .or_insert_with(|| graph.add_node(DepVertex::Def(read)));
            graph.update_edge(def, comp, design.words(read));
        }
        for &write in &stmt.writes {
            if stmt.domain.is_comb() {
                if let Some(prev) = comb_producer.insert(write, sid) {
                    panic!(
                        "signal {} has two combinational producers ({:?} and {:?}); \
                         upstream classification must guarantee a single producer",
                        design.signals[write].name, prev, sid
                    );
                }
                let def = *defs
                    .entry(write)
                    .or_insert_with(|| graph.add_node(DepVertex::Def(write)));
                graph.update_edge(comp, def, design.words(write));
            } else {
                let commit = *commits
                    .entry(write)
                    .or_insert_with(|| graph.add_node(DepVertex::Commit(write)));
                graph.update_edge(comp, commit, design.words(write));
            }
        }
    }

    if algo::toposort(&graph, None).is_err() {
        return Err(Error::unsupported(
            "combinational cycle in the next-state region",
        ));
    }
    log::debug!(
        "dependence graph: {} vertices, {} edges",
        graph.node_count(),
        graph.edge_count()
    );
    Ok(graph)
}

/// 1-based topological rank by longest path from any source.
///
/// Panics if the graph is cyclic; every graph handed to this function has
/// already passed the acyclicity check in [`build`].
pub fn rank_longest_path<N, E>(graph: &DiGraph<N, E>) -> Vec<u32> {
    let order = algo::toposort(graph, None)
        .unwrap_or_else(|_| panic!("ranking a cyclic graph; acyclicity was checked at build time"));
    let mut rank = vec![0u32; graph.node_count()];
    for idx in order {
        let above = graph
            .neighbors_directed(idx, Incoming)
            .map(|pred| rank[pred.index()])
            .max()
            .unwrap_or(0);
        rank[idx.index()] = above + 1;
    }
    rank
}

/// Split the graph into the maximal set of independent fibers.
///
/// Commit points, and computations with no data definition at all (pure
/// side-effect sinks, which must never be replicated), anchor the fibers.
/// Two commits anchored by a shared writer statement end up in the same
/// fiber; everything else reachable backwards is cloned per fiber.
pub fn split_fibers(design: &Design, graph: &DepGraph) -> Vec<Fiber> {
    let n = graph.node_count();
    let mut uf = UnionFind::<usize>::new(n);
    let mut is_anchor = vec![false; n];

    for idx in graph.node_indices() {
        match graph[idx] {
            DepVertex::Commit(..) => is_anchor[idx.index()] = true,
            DepVertex::Comp(..) => {
                if graph.edges_directed(idx, Outgoing).next().is_none() {
                    is_anchor[idx.index()] = true;
                }
            }
            DepVertex::Def(..) => {}
        }
    }

    // A statement writing several signals welds their commits together.
    for idx in graph.node_indices() {
        if graph[idx].comp().is_none() {
            continue;
        }
        let committed: Vec<NodeIndex> = graph
            .edges_directed(idx, Outgoing)
            .filter(|e| matches!(graph[e.target()], DepVertex::Commit(..)))
            .map(|e| e.target())
            .collect();
        for (a, b) in committed.iter().tuple_windows() {
            uf.union(a.index(), b.index());
        }
    }

    // Stable grouping: anchors in vertex order, keyed by their set root.
    let mut groups: LinkedHashMap<usize, Vec<NodeIndex>> = LinkedHashMap::new();
    for idx in graph.node_indices() {
        if is_anchor[idx.index()] {
            let root = uf.find(idx.index());
            if let Some(group) = groups.get_mut(&root) {
                group.push(idx);
            } else {
                groups.insert(root, vec![idx]);
            }
        }
    }

    let fibers: Vec<Fiber> = groups
        .values()
        .map(|anchors| collect_fiber(graph, anchors))
        .collect();
    log::info!("split into {} independent fibers", fibers.len());

    // Commit uniqueness: each signal's synchronous writer lives in exactly
    // one fiber. Anything else is a broken invariant upstream.
    let mut committed: HashMap<SignalId, usize> = HashMap::new();
    for (ix, fiber) in fibers.iter().enumerate() {
        for &sig in &fiber.commits {
            if let Some(prev) = committed.insert(sig, ix) {
                panic!(
                    "signal {} committed by fibers {} and {}",
                    design.signals[sig].name, prev, ix
                );
            }
        }
    }
    fibers
}

/// Backward-collect everything the anchor set depends on and clone it into
/// a standalone graph.
fn collect_fiber(graph: &DepGraph, anchors: &[NodeIndex]) -> Fiber {
    let mut included: Vec<bool> = vec![false; graph.node_count()];
    let mut worklist: VecDeque<NodeIndex> = VecDeque::new();
    for &idx in anchors {
        included[idx.index()] = true;
        worklist.push_back(idx);
    }
    while let Some(head) = worklist.pop_front() {
        for pred in graph.neighbors_directed(head, Incoming) {
            if !included[pred.index()] {
                included[pred.index()] = true;
                worklist.push_back(pred);
            }
        }
    }

    // A collected computation also drags in the definition points it
    // writes: a value whose lifetime ends inside the fiber still needs its
    // definition vertex present.
    let comb_defs: Vec<NodeIndex> = graph
        .node_indices()
        .filter(|idx| included[idx.index()] && graph[*idx].comp().is_some())
        .flat_map(|idx| {
            graph
                .edges_directed(idx, Outgoing)
                .filter(|e| matches!(graph[e.target()], DepVertex::Def(..)))
                .map(|e| e.target())
        })
        .collect();
    for idx in comb_defs {
        included[idx.index()] = true;
    }

    let mut sub = DepGraph::new();
    let mut clone_of: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    for idx in graph.node_indices() {
        if included[idx.index()] {
            clone_of.insert(idx, sub.add_node(graph[idx]));
        }
    }
    for edge in graph.edge_references() {
        if included[edge.source().index()] && included[edge.target().index()] {
            sub.add_edge(
                clone_of[&edge.source()],
                clone_of[&edge.target()],
                *edge.weight(),
            );
        }
    }
    Fiber::from_graph(sub)
}

/// Dot rendering for debug dumps.
pub fn dot(design: &Design, graph: &DepGraph) -> String {
    let mut out = String::from("digraph dep {\n");
    for idx in graph.node_indices() {
        let (label, shape, color) = match graph[idx] {
            DepVertex::Def(sig) => {
                (format!("DEF {}", design.signals[sig].name), "ellipse", "green")
            }
            DepVertex::Commit(sig) => {
                (format!("COMMIT {}", design.signals[sig].name), "ellipse", "red")
            }
            DepVertex::Comp(sid) => (format!("{:?}", sid), "rect", "black"),
        };
        writeln!(
            out,
            "  n{} [label=\"{}\", shape={}, color={}];",
            idx.index(),
            label,
            shape,
            color
        )
        .unwrap();
    }
    for edge in graph.edge_references() {
        writeln!(
            out,
            "  n{} -> n{} [label=\"{}\"];",
            edge.source().index(),
            edge.target().index(),
            edge.weight()
        )
        .unwrap();
    }
    out.push_str("}\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::*;
    use std::collections::HashSet;

    #[test]
    fn coverage_and_commit_uniqueness() {
        let (design, region) = fanout_design();
        let graph = build(&design, &region).unwrap();
        let fibers = split_fibers(&design, &graph);

        let mut seen: HashSet<weft_ir::StmtId> = HashSet::new();
        for fiber in &fibers {
            seen.extend(fiber.stmts.iter().copied());
        }
        let all: HashSet<weft_ir::StmtId> = region.iter().copied().collect();
        assert_eq!(seen, all, "fibers must cover every input statement");

        let mut commits = HashSet::new();
        for fiber in &fibers {
            for &sig in &fiber.commits {
                assert!(commits.insert(sig), "signal committed twice");
            }
        }
    }

    #[test]
    fn shared_comb_is_duplicated_per_reader() {
        // 4 commit points, one shared comb statement feeding two of them.
        let (design, region) = fanout_design();
        let graph = build(&design, &region).unwrap();
        let fibers = split_fibers(&design, &graph);
        assert_eq!(fibers.len(), 4);

        let shared = region[0]; // the comb statement
        let holders: Vec<_> = fibers
            .iter()
            .filter(|f| f.stmts.contains(&shared))
            .collect();
        assert_eq!(
            holders.len(),
            2,
            "exactly the two reading fibers hold a copy of the shared comb"
        );
        // Duplication soundness: the two copies carry identical content.
        let c0 = holders[0].stmts.iter().find(|&&s| s == shared).unwrap();
        let c1 = holders[1].stmts.iter().find(|&&s| s == shared).unwrap();
        assert_eq!(design.stmts[*c0], design.stmts[*c1]);
    }

    #[test]
    fn comb_cycle_is_rejected() {
        let mut design = weft_ir::Design::new();
        let a = signal(&mut design, "a", 1);
        let b = signal(&mut design, "b", 1);
        let region = vec![
            comb(&mut design, [b], [a], 1),
            comb(&mut design, [a], [b], 1),
        ];
        let err = build(&design, &region).unwrap_err();
        assert!(err.is_unsupported());
    }

    #[test]
    fn multi_clock_is_rejected() {
        let mut design = weft_ir::Design::new();
        let a = signal(&mut design, "a", 1);
        let b = signal(&mut design, "b", 1);
        let s1 = clocked_on(&mut design, 0, [b], [a], 1);
        let s2 = clocked_on(&mut design, 1, [a], [b], 1);
        let err = build(&design, &[s1, s2]).unwrap_err();
        assert!(err.is_unsupported());
    }

    #[test]
    fn sink_computation_anchors_its_own_fiber() {
        let mut design = weft_ir::Design::new();
        let x = signal(&mut design, "x", 1);
        let seq = clocked(&mut design, [x], [x], 4);
        // display-style statement: reads x, writes nothing
        let sink = {
            let s = weft_ir::Stmt::new(
                weft_ir::Domain::Clocked(weft_ir::ClockId(0)),
                [x],
                [],
                2,
            )
            .impure();
            design.add_stmt(s)
        };
        let graph = build(&design, &[seq, sink]).unwrap();
        let fibers = split_fibers(&design, &graph);
        assert_eq!(fibers.len(), 2);
        assert!(fibers.iter().any(|f| f.stmts == vec![sink]));
    }
}
