use crate::dep_graph::{self, DepGraph, DepVertex};
use petgraph::visit::EdgeRef;
use petgraph::Direction::Incoming;
use std::collections::HashMap;
use weft_ir::{CostOracle, Design, SignalId, StmtId};

/// What a fiber computes. Initial fibers package the design's one-time
/// startup logic; they are pinned next to the supervisor during placement
/// and excluded from the communication-minimizing partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FiberClass {
    Compute,
    Initial,
}

/// Concrete (device, tile, worker) coordinate of a fiber, attached to the
/// fiber for the remainder of the pipeline and consumed by module
/// generation downstream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Placement {
    pub device: u32,
    pub tile: u32,
    pub worker: u32,
    /// Device-specific fast path: the fiber owns its whole tile.
    pub supervisor: bool,
}

/// One maximal independent unit of next-state computation, destined for one
/// core. Owns its dependency graph and the ordered list of statements it
/// executes each superstep.
#[derive(Clone, Debug)]
pub struct Fiber {
    pub graph: DepGraph,
    /// Statements in execution order: a valid topological order of the
    /// graph, ties broken by statement id (original source order).
    pub stmts: Vec<StmtId>,
    /// Signals this fiber commits at the superstep barrier. Each signal has
    /// exactly one committing fiber in the whole schedule.
    pub commits: Vec<SignalId>,
    pub class: FiberClass,
    pub placement: Option<Placement>,
}

impl Fiber {
    /// Derive the statement order and commit set from a dependency graph.
    pub fn from_graph(graph: DepGraph) -> Self {
        let rank = dep_graph::rank_longest_path(&graph);
        let mut stmts: Vec<(u32, StmtId)> = graph
            .node_indices()
            .filter_map(|idx| match graph[idx] {
                DepVertex::Comp(sid) => Some((rank[idx.index()], sid)),
                _ => None,
            })
            .collect();
        stmts.sort_unstable();
        let mut commits: Vec<SignalId> = graph
            .node_indices()
            .filter_map(|idx| match graph[idx] {
                DepVertex::Commit(sig) => Some(sig),
                _ => None,
            })
            .collect();
        commits.sort_unstable();
        Fiber {
            graph,
            stmts: stmts.into_iter().map(|(_, sid)| sid).collect(),
            commits,
            class: FiberClass::Compute,
            placement: None,
        }
    }

    /// An initial-logic fiber has no dependency structure worth modeling;
    /// the statements run once, in order, before the first superstep.
    pub fn initial(stmts: Vec<StmtId>) -> Self {
        Fiber {
            graph: DepGraph::new(),
            stmts,
            commits: Vec::new(),
            class: FiberClass::Initial,
            placement: None,
        }
    }

    /// Total instruction-cost estimate of one superstep of this fiber.
    pub fn instr_cost(&self, design: &Design, oracle: &dyn CostOracle) -> u32 {
        self.stmts.iter().map(|&sid| oracle.cost(design, sid)).sum()
    }

    /// Words of state resident on the fiber's core: committed values plus
    /// forever-live inputs (definition points with no local producer).
    pub fn mem_words(&self, design: &Design) -> u32 {
        let mut total = 0;
        let mut counted: HashMap<SignalId, ()> = HashMap::new();
        for idx in self.graph.node_indices() {
            match self.graph[idx] {
                DepVertex::Commit(sig) => {
                    counted.entry(sig).or_insert_with(|| {
                        total += design.words(sig);
                    });
                }
                DepVertex::Def(sig) => {
                    if self.graph.edges_directed(idx, Incoming).next().is_none() {
                        counted.entry(sig).or_insert_with(|| {
                            total += design.words(sig);
                        });
                    }
                }
                DepVertex::Comp(..) => {}
            }
        }
        total
    }

    /// True if any statement calls into the host; such fibers can never be
    /// replicated, merged speculatively, retimed, or resynchronized.
    pub fn has_impure(&self, design: &Design) -> bool {
        self.stmts.iter().any(|&sid| !design.stmts[sid].pure)
    }

    /// Signals this fiber reads at definition points with no local
    /// producer and which some other fiber commits: the fiber's inbound
    /// exchange set.
    pub fn recv_signals<'a>(&'a self, producer: &'a HashMap<SignalId, usize>, own: usize) -> impl Iterator<Item = SignalId> + 'a {
        self.graph.node_indices().filter_map(move |idx| match self.graph[idx] {
            DepVertex::Def(sig) => match producer.get(&sig) {
                Some(&p) if p != own => Some(sig),
                _ => None,
            },
            _ => None,
        })
    }

    /// Structural union of several fibers into one, with clone-once
    /// semantics: a vertex or edge appearing in more than one source fiber
    /// is materialized exactly once in the result.
    pub fn union_group(group: Vec<Fiber>) -> Fiber {
        let mut graph = DepGraph::new();
        let mut nodes: HashMap<DepVertex, petgraph::graph::NodeIndex> = HashMap::new();
        let mut edges: HashMap<(DepVertex, DepVertex), ()> = HashMap::new();
        for fiber in &group {
            for idx in fiber.graph.node_indices() {
                let key = fiber.graph[idx];
                nodes.entry(key).or_insert_with(|| graph.add_node(key));
            }
            for edge in fiber.graph.edge_references() {
                let from = fiber.graph[edge.source()];
                let to = fiber.graph[edge.target()];
                edges.entry((from, to)).or_insert_with(|| {
                    graph.add_edge(nodes[&from], nodes[&to], *edge.weight());
                });
            }
        }
        Fiber::from_graph(graph)
    }

    /// Iterate the definition points of the fiber.
    pub fn def_signals(&self) -> impl Iterator<Item = SignalId> + '_ {
        self.graph.node_indices().filter_map(|idx| match self.graph[idx] {
            DepVertex::Def(sig) => Some(sig),
            _ => None,
        })
    }

    /// Statement ids that are clocked in this fiber.
    pub fn seq_stmts<'a>(&'a self, design: &'a Design) -> impl Iterator<Item = StmtId> + 'a {
        self.stmts
            .iter()
            .copied()
            .filter(|&sid| design.stmts[sid].domain.is_clocked())
    }
}
