//! Per-fiber graph for the resynchronization engine. Same coarse shape as
//! the retiming netlist, but the read proxies stay distinguishable per
//! consumer so a resynced sequential vertex can be cloned selectively into
//! each downstream fiber.
use crate::dep_graph::{self, DepVertex};
use crate::fiber::Fiber;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction::{Incoming, Outgoing};
use std::collections::HashMap;
use std::fmt::Write as _;
use weft_ir::{ClockId, CostOracle, Design, SignalId, StmtId};

/// Resync vertex kinds. The last three only appear after a cut: the
/// sampling commit left in the source fiber, and the sequential /
/// combinational logic replicated into a consumer.
#[derive(Clone, Debug)]
pub enum ResyncVertex {
    Comb {
        stmt: StmtId,
        cost: u32,
    },
    /// The fiber's sequential sink.
    Seq {
        stmts: Vec<StmtId>,
        commits: Vec<SignalId>,
        cost: u32,
    },
    /// Read proxy for a value committed by `writer`.
    SeqRead {
        signal: SignalId,
        writer: usize,
    },
    /// Sampling commit materialized at the cut.
    CombSeq {
        signal: SignalId,
    },
    /// A sequential vertex gone combinational inside a consumer.
    SeqComb {
        stmts: Vec<StmtId>,
        cost: u32,
    },
    /// Combinational logic replicated into a consumer.
    CombComb {
        stmt: StmtId,
        cost: u32,
    },
}

impl ResyncVertex {
    pub fn cost(&self) -> u32 {
        match self {
            ResyncVertex::Comb { cost, .. }
            | ResyncVertex::Seq { cost, .. }
            | ResyncVertex::SeqComb { cost, .. }
            | ResyncVertex::CombComb { cost, .. } => *cost,
            ResyncVertex::SeqRead { .. } | ResyncVertex::CombSeq { .. } => 0,
        }
    }
}

pub type ResyncGraph = DiGraph<ResyncVertex, SignalId>;

/// One fiber's resync graph plus scan bookkeeping.
pub struct ResyncInfo {
    pub graph: ResyncGraph,
    pub sink: NodeIndex,
    pub fiber: usize,
    pub rank: Vec<u32>,
    pub cost: u32,
    pub clock: Option<ClockId>,
    /// Unoptimizable: impure or multi-domain sequential logic.
    pub unopt: bool,
    /// (consumer fiber, read-proxy node in the consumer's graph), one entry
    /// per read proxy of a value this fiber commits.
    pub consumers: Vec<(usize, NodeIndex)>,
}

impl ResyncInfo {
    pub fn at_rank(&self, rank: u32) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph
            .node_indices()
            .filter(move |&idx| self.rank[idx.index()] == rank)
    }

    pub fn rank_cost(&self, rank: u32) -> u32 {
        self.at_rank(rank).map(|v| self.graph[v].cost()).sum()
    }

    pub fn sink_rank(&self) -> u32 {
        self.rank[self.sink.index()]
    }

    pub fn rerank(&mut self) {
        self.rank = dep_graph::rank_longest_path(&self.graph);
    }
}

/// Build one resync graph per fiber.
pub fn build_resync_graphs(
    design: &Design,
    oracle: &dyn CostOracle,
    fibers: &[Fiber],
) -> Vec<ResyncInfo> {
    let mut committed_by: HashMap<SignalId, usize> = HashMap::new();
    for (ix, fiber) in fibers.iter().enumerate() {
        for &sig in &fiber.commits {
            committed_by.insert(sig, ix);
        }
    }

    let mut infos: Vec<ResyncInfo> = fibers
        .iter()
        .enumerate()
        .map(|(ix, fiber)| {
            let mut graph = ResyncGraph::new();
            let seq: Vec<StmtId> = fiber.seq_stmts(design).collect();
            let cost = seq.iter().map(|&sid| oracle.cost(design, sid)).sum();
            let impure = seq.iter().any(|&sid| !design.stmts[sid].pure);
            let mut clock = None;
            let mut multi_domain = false;
            for &sid in &seq {
                match (clock, design.stmts[sid].domain.clock()) {
                    (None, found) => clock = found,
                    (Some(a), Some(b)) if a != b => multi_domain = true,
                    _ => {}
                }
            }
            let sink = graph.add_node(ResyncVertex::Seq {
                stmts: seq,
                commits: fiber.commits.clone(),
                cost,
            });
            ResyncInfo {
                graph,
                sink,
                fiber: ix,
                rank: Vec::new(),
                cost: 0,
                clock,
                unopt: impure || multi_domain,
                consumers: Vec::new(),
            }
        })
        .collect();

    for (ix, fiber) in fibers.iter().enumerate() {
        let mut comb_nodes: HashMap<StmtId, NodeIndex> = HashMap::new();
        let mut links: Vec<(usize, NodeIndex)> = Vec::new();
        {
            let info = &mut infos[ix];
            let sink = info.sink;
            for def in fiber.graph.node_indices() {
                let sig = match fiber.graph[def] {
                    DepVertex::Def(sig) => sig,
                    _ => continue,
                };
                if fiber.graph.edges_directed(def, Outgoing).next().is_none() {
                    continue;
                }
                let pred = if let Some(&writer) = committed_by.get(&sig) {
                    let node = info
                        .graph
                        .add_node(ResyncVertex::SeqRead { signal: sig, writer });
                    links.push((writer, node));
                    Some(node)
                } else {
                    fiber
                        .graph
                        .edges_directed(def, Incoming)
                        .next()
                        .map(|e| e.source())
                        .and_then(|src| fiber.graph[src].comp())
                        .map(|sid| {
                            *comb_nodes.entry(sid).or_insert_with(|| {
                                info.graph.add_node(ResyncVertex::Comb {
                                    stmt: sid,
                                    cost: oracle.cost(design, sid),
                                })
                            })
                        })
                };
                let pred = match pred {
                    Some(pred) => pred,
                    None => continue, // initial-only value, a constant
                };
                let succs: Vec<StmtId> = fiber
                    .graph
                    .edges_directed(def, Outgoing)
                    .filter_map(|e| fiber.graph[e.target()].comp())
                    .collect();
                for sid in succs {
                    if design.stmts[sid].domain.is_clocked() {
                        info.graph.add_edge(pred, sink, sig);
                    } else {
                        let succ = *comb_nodes.entry(sid).or_insert_with(|| {
                            info.graph.add_node(ResyncVertex::Comb {
                                stmt: sid,
                                cost: oracle.cost(design, sid),
                            })
                        });
                        info.graph.add_edge(pred, succ, sig);
                    }
                }
            }
        }
        for (writer, node) in links {
            infos[writer].consumers.push((ix, node));
        }
    }

    for info in infos.iter_mut() {
        info.rerank();
        info.cost = info
            .graph
            .node_indices()
            .map(|v| info.graph[v].cost())
            .sum();
    }
    infos
}

/// Dot rendering for debug dumps.
pub fn dot(design: &Design, info: &ResyncInfo) -> String {
    let mut out = String::from("digraph resync {\n");
    for idx in info.graph.node_indices() {
        let label = match &info.graph[idx] {
            ResyncVertex::Comb { cost, .. } => format!("COMB {}", cost),
            ResyncVertex::Seq { cost, .. } => format!("SEQ {}", cost),
            ResyncVertex::SeqRead { signal, .. } => {
                format!("SeqRead {}", design.signals[*signal].name)
            }
            ResyncVertex::CombSeq { signal } => {
                format!("CombSeq {}", design.signals[*signal].name)
            }
            ResyncVertex::SeqComb { cost, .. } => format!("SeqComb {}", cost),
            ResyncVertex::CombComb { cost, .. } => format!("CombComb {}", cost),
        };
        writeln!(out, "  n{} [label=\"{}\"];", idx.index(), label).unwrap();
    }
    for edge in info.graph.edge_references() {
        writeln!(
            out,
            "  n{} -> n{} [label=\"{}\"];",
            edge.source().index(),
            edge.target().index(),
            design.signals[*edge.weight()].name
        )
        .unwrap();
    }
    out.push_str("}\n");
    out
}
