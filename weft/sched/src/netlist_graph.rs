//! Coarse per-fiber "netlist graph" used by the retiming engine: one vertex
//! per combinational statement, one aggregate sequential sink, and one read
//! proxy per sampled register, with edges labeled by the signal carried.
use crate::dep_graph::{self, DepVertex};
use crate::fiber::Fiber;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction::{Incoming, Outgoing};
use std::collections::HashMap;
use std::fmt::Write as _;
use weft_ir::{ClockId, CostOracle, Design, SignalId, StmtId};

/// Netlist vertex: a closed sum over the retiming graph's vertex kinds.
#[derive(Clone, Debug)]
pub enum NetVertex {
    /// One combinational statement.
    Comb { stmt: StmtId, cost: u32 },
    /// The aggregate sequential sink: every clocked statement of the fiber.
    SeqWrite { stmts: Vec<StmtId>, cost: u32 },
    /// Read proxy for a register committed by some fiber (possibly this
    /// one) and sampled here at the start of the superstep.
    SeqRead { signal: SignalId },
}

impl NetVertex {
    pub fn cost(&self) -> u32 {
        match self {
            NetVertex::Comb { cost, .. } => *cost,
            NetVertex::SeqWrite { cost, .. } => *cost,
            NetVertex::SeqRead { .. } => 0,
        }
    }
}

/// Edges carry the signal whose value flows along them.
pub type NetlistGraph = DiGraph<NetVertex, SignalId>;

/// A fiber's netlist graph plus the cost annotations the retiming scan
/// needs. The three per-vertex scalars satisfy
/// `tvalue + rvalue + bvalue == total_cost` for every vertex.
pub struct NetlistInfo {
    pub graph: NetlistGraph,
    pub sink: NodeIndex,
    pub fiber: usize,
    pub rank: Vec<u32>,
    /// Cost of everything strictly before the vertex's rank.
    pub tvalue: Vec<u32>,
    /// Cost of the vertex's own rank.
    pub rvalue: Vec<u32>,
    /// Cost of everything strictly after the vertex's rank.
    pub bvalue: Vec<u32>,
    pub total_cost: u32,
    /// Fibers with a read proxy for one of this fiber's commits.
    pub readers: Vec<usize>,
    pub clock: Option<ClockId>,
    pub multi_domain: bool,
    /// Sequential logic calls into the host and must not be moved.
    pub impure: bool,
}

impl NetlistInfo {
    /// Max rank that still holds non-sink vertices.
    pub fn max_cut_rank(&self) -> u32 {
        self.rank[self.sink.index()].saturating_sub(1)
    }

    /// Vertices at `rank`, excluding the sink.
    pub fn at_rank(&self, rank: u32) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph
            .node_indices()
            .filter(move |&idx| idx != self.sink && self.rank[idx.index()] == rank)
    }
}

/// Build one netlist graph per fiber.
pub fn build_netlists(
    design: &Design,
    oracle: &dyn CostOracle,
    fibers: &[Fiber],
) -> Vec<NetlistInfo> {
    let mut committed_by: HashMap<SignalId, usize> = HashMap::new();
    for (ix, fiber) in fibers.iter().enumerate() {
        for &sig in &fiber.commits {
            committed_by.insert(sig, ix);
        }
    }

    // First pass: one graph per fiber with just the sequential sink.
    let mut infos: Vec<NetlistInfo> = fibers
        .iter()
        .enumerate()
        .map(|(ix, fiber)| {
            let mut graph = NetlistGraph::new();
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
            let sink = graph.add_node(NetVertex::SeqWrite { stmts: seq, cost });
            NetlistInfo {
                graph,
                sink,
                fiber: ix,
                rank: Vec::new(),
                tvalue: Vec::new(),
                rvalue: Vec::new(),
                bvalue: Vec::new(),
                total_cost: 0,
                readers: Vec::new(),
                clock,
                multi_domain,
                impure,
            }
        })
        .collect();

    // Second pass: wire up combinational logic and read proxies, recording
    // reader links on the committing fiber.
    for (ix, fiber) in fibers.iter().enumerate() {
        let mut comb_nodes: HashMap<StmtId, NodeIndex> = HashMap::new();
        let mut reader_links: Vec<usize> = Vec::new();
        {
            let info = &mut infos[ix];
            let sink = info.sink;
            for def in fiber.graph.node_indices() {
                let sig = match fiber.graph[def] {
                    DepVertex::Def(sig) => sig,
                    _ => continue,
                };
                if fiber.graph.edges_directed(def, Outgoing).next().is_none() {
                    continue; // dead definition point
                }
                let pred = if let Some(&writer) = committed_by.get(&sig) {
                    reader_links.push(writer);
                    Some(info.graph.add_node(NetVertex::SeqRead { signal: sig }))
                } else {
                    fiber
                        .graph
                        .edges_directed(def, Incoming)
                        .next()
                        .map(|e| e.source())
                        .and_then(|src| fiber.graph[src].comp())
                        .map(|sid| {
                            *comb_nodes.entry(sid).or_insert_with(|| {
                                info.graph.add_node(NetVertex::Comb {
                                    stmt: sid,
                                    cost: oracle.cost(design, sid),
                                })
                            })
                        })
                };
                let pred = match pred {
                    Some(pred) => pred,
                    // set by initial logic only, effectively a constant
                    None => continue,
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
                            info.graph.add_node(NetVertex::Comb {
                                stmt: sid,
                                cost: oracle.cost(design, sid),
                            })
                        });
                        info.graph.add_edge(pred, succ, sig);
                    }
                }
            }
        }
        for writer in reader_links {
            if !infos[writer].readers.contains(&ix) {
                infos[writer].readers.push(ix);
            }
        }
    }

    for info in infos.iter_mut() {
        annotate_costs(info);
    }
    infos
}

/// Rank the graph and fill in the three cost scalars per vertex.
fn annotate_costs(info: &mut NetlistInfo) {
    info.rank = dep_graph::rank_longest_path(&info.graph);
    let max_rank = info.rank.iter().copied().max().unwrap_or(0) as usize;

    let mut rank_sum = vec![0u32; max_rank + 1];
    let mut total = 0u32;
    for idx in info.graph.node_indices() {
        let cost = info.graph[idx].cost();
        rank_sum[info.rank[idx.index()] as usize] += cost;
        total += cost;
    }
    let mut prefix = vec![0u32; max_rank + 2];
    for r in 1..=max_rank {
        prefix[r + 1] = prefix[r] + rank_sum[r];
    }

    let n = info.graph.node_count();
    info.tvalue = vec![0; n];
    info.rvalue = vec![0; n];
    info.bvalue = vec![0; n];
    for idx in info.graph.node_indices() {
        let r = info.rank[idx.index()] as usize;
        info.tvalue[idx.index()] = prefix[r];
        info.rvalue[idx.index()] = rank_sum[r];
        info.bvalue[idx.index()] = total - prefix[r] - rank_sum[r];
    }
    info.total_cost = total;
}

/// Dot rendering for debug dumps.
pub fn dot(design: &Design, info: &NetlistInfo) -> String {
    let mut out = String::from("digraph netlist {\n");
    for idx in info.graph.node_indices() {
        let (label, shape) = match &info.graph[idx] {
            NetVertex::Comb { stmt, cost } => (format!("COMB {:?} c={}", stmt, cost), "ellipse"),
            NetVertex::SeqWrite { cost, .. } => (format!("SEQ c={}", cost), "rect"),
            NetVertex::SeqRead { signal } => {
                (format!("READ {}", design.signals[*signal].name), "rect")
            }
        };
        writeln!(
            out,
            "  n{} [label=\"{} r={}\", shape={}];",
            idx.index(),
            label,
            info.rank[idx.index()],
            shape
        )
        .unwrap();
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::*;
    use weft_ir::WordCost;

    #[test]
    fn rank_consistency_invariant() {
        let (design, fibers) = chain_design(&[2, 2, 2], 100, 3);
        let infos = build_netlists(&design, &WordCost, &fibers);
        for info in &infos {
            for idx in info.graph.node_indices() {
                let i = idx.index();
                assert_eq!(
                    info.tvalue[i] + info.rvalue[i] + info.bvalue[i],
                    info.total_cost,
                    "tvalue + rvalue + bvalue must equal the graph total"
                );
            }
        }
    }

    #[test]
    fn readers_are_linked_through_commits() {
        let (design, fibers) = chain_design(&[2, 2], 10, 3);
        let infos = build_netlists(&design, &WordCost, &fibers);
        assert_eq!(infos.len(), 2);
        // the chain fiber commits `reg`, read by the consumer; the consumer
        // commits `inp`, read by the chain: each is the other's reader.
        for info in &infos {
            assert_eq!(info.readers.len(), 1);
            assert_ne!(info.readers[0], info.fiber);
        }
    }

    #[test]
    fn sink_has_the_highest_rank() {
        let (design, fibers) = chain_design(&[5, 1], 7, 2);
        let infos = build_netlists(&design, &WordCost, &fibers);
        for info in &infos {
            let sink_rank = info.rank[info.sink.index()];
            for idx in info.graph.node_indices() {
                assert!(info.rank[idx.index()] <= sink_rank);
            }
        }
    }
}
