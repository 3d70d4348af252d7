//! Hypergraph representation and the k-way partitioner seam.
//!
//! The arrays follow the hMetis convention: for hyperedge `e`,
//! `eind[eptr[e] .. eptr[e + 1]]` lists the nodes on `e`. An external
//! KaHyPar-class partitioner plugs in through [`Partitioner`]; the built-in
//! [`GreedyPartitioner`] keeps the pipeline self-contained and
//! deterministic.
use std::fmt::Write as _;
use weft_utils::WeftResult;

#[derive(Clone, Debug, Default)]
pub struct Hypergraph {
    pub node_weights: Vec<i64>,
    pub edge_weights: Vec<i64>,
    pub eptr: Vec<usize>,
    pub eind: Vec<u32>,
}

impl Hypergraph {
    pub fn with_nodes(node_weights: Vec<i64>) -> Self {
        Hypergraph {
            node_weights,
            edge_weights: Vec::new(),
            eptr: vec![0],
            eind: Vec::new(),
        }
    }

    pub fn num_nodes(&self) -> usize {
        self.node_weights.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edge_weights.len()
    }

    /// Append a hyperedge over `nodes` with the given weight.
    pub fn push_edge(&mut self, nodes: &[u32], weight: i64) {
        debug_assert!(!nodes.is_empty(), "empty hyperedge");
        self.eind.extend_from_slice(nodes);
        self.eptr.push(self.eind.len());
        self.edge_weights.push(weight);
    }

    pub fn edge_nodes(&self, e: usize) -> &[u32] {
        &self.eind[self.eptr[e]..self.eptr[e + 1]]
    }

    /// hMetis text format (weighted edges and nodes), for debug dumps and
    /// for driving an external partitioner by hand.
    pub fn to_hmetis(&self) -> String {
        let mut out = String::new();
        writeln!(out, "{} {} 11", self.num_edges(), self.num_nodes()).unwrap();
        for e in 0..self.num_edges() {
            write!(out, "{}", self.edge_weights[e]).unwrap();
            for &node in self.edge_nodes(e) {
                write!(out, " {}", node).unwrap();
            }
            out.push('\n');
        }
        for &w in &self.node_weights {
            writeln!(out, "{}", w).unwrap();
        }
        out
    }
}

/// One k-way partitioning request.
#[derive(Clone, Copy, Debug)]
pub struct PartitionRequest<'a> {
    pub k: u32,
    /// Imbalance tolerance in (0, 1), ignored when explicit block weights
    /// are given.
    pub imbalance: f64,
    /// Explicit per-block target weights; used when blocks are deliberately
    /// uneven (a partially populated last device).
    pub block_weights: Option<&'a [i64]>,
}

/// Result of a partitioning call: a block id per node and the achieved
/// connectivity objective.
#[derive(Clone, Debug)]
pub struct Partition {
    pub assignment: Vec<u32>,
    pub objective: i64,
}

impl Partition {
    /// Group node indices by block, dropping empty blocks is the caller's
    /// business: callers warn on them (taxonomy (b)), never fail.
    pub fn blocks(&self, k: u32) -> Vec<Vec<usize>> {
        let mut blocks = vec![Vec::new(); k as usize];
        for (node, &b) in self.assignment.iter().enumerate() {
            blocks[b as usize].push(node);
        }
        blocks
    }
}

/// The seam for the external k-way hypergraph partitioner.
pub trait Partitioner {
    fn partition(&self, hg: &Hypergraph, req: &PartitionRequest) -> WeftResult<Partition>;
}

/// Deterministic built-in partitioner: seed blocks largest-node-first under
/// the capacity targets, then run a bounded number of refinement sweeps
/// moving nodes to the block where their hyperedge affinity is highest.
/// Quality is far from a real multilevel partitioner but the interface,
/// balance behavior, and objective reporting match.
#[derive(Clone, Copy, Debug, Default)]
pub struct GreedyPartitioner;

impl GreedyPartitioner {
    const REFINE_SWEEPS: usize = 4;

    fn capacities(hg: &Hypergraph, req: &PartitionRequest) -> Vec<i64> {
        match req.block_weights {
            Some(weights) => weights.to_vec(),
            None => {
                let total: i64 = hg.node_weights.iter().sum();
                let per = (total as f64 / req.k as f64) * (1.0 + req.imbalance);
                vec![per.ceil() as i64; req.k as usize]
            }
        }
    }

    fn connectivity(hg: &Hypergraph, assignment: &[u32], k: u32) -> i64 {
        let mut objective = 0;
        let mut seen = vec![u32::MAX; k as usize];
        for e in 0..hg.num_edges() {
            let mut lambda = 0i64;
            for &node in hg.edge_nodes(e) {
                let b = assignment[node as usize] as usize;
                if seen[b] != e as u32 {
                    seen[b] = e as u32;
                    lambda += 1;
                }
            }
            objective += hg.edge_weights[e] * (lambda - 1).max(0);
        }
        objective
    }
}

impl Partitioner for GreedyPartitioner {
    fn partition(&self, hg: &Hypergraph, req: &PartitionRequest) -> WeftResult<Partition> {
        let k = req.k.max(1) as usize;
        let n = hg.num_nodes();
        let capacities = Self::capacities(hg, req);
        debug_assert_eq!(capacities.len(), k, "one capacity per block");

        // incidence: node -> hyperedges
        let mut incident: Vec<Vec<u32>> = vec![Vec::new(); n];
        for e in 0..hg.num_edges() {
            for &node in hg.edge_nodes(e) {
                incident[node as usize].push(e as u32);
            }
        }

        // Largest nodes first so the heavy ones land while there is room.
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by_key(|&ix| (std::cmp::Reverse(hg.node_weights[ix]), ix));

        let mut assignment = vec![0u32; n];
        let mut assigned = vec![false; n];
        let mut load = vec![0i64; k];
        for &node in &order {
            // Affinity: weight of edges already pinned in a block.
            let mut affinity = vec![0i64; k];
            for &e in &incident[node] {
                for &other in hg.edge_nodes(e as usize) {
                    if other as usize != node && assigned[other as usize] {
                        affinity[assignment[other as usize] as usize] +=
                            hg.edge_weights[e as usize];
                    }
                }
            }
            let mut best = 0usize;
            let mut best_key = (i64::MIN, i64::MIN);
            for b in 0..k {
                if load[b] + hg.node_weights[node] > capacities[b] {
                    continue;
                }
                let key = (affinity[b], capacities[b] - load[b]);
                if key > best_key {
                    best_key = key;
                    best = b;
                }
            }
            if best_key == (i64::MIN, i64::MIN) {
                // Every block is at capacity; put it where the overflow is
                // smallest and let the caller's spill logic deal with it.
                best = (0..k)
                    .min_by_key(|&b| load[b] + hg.node_weights[node] - capacities[b])
                    .unwrap_or(0);
            }
            assignment[node] = best as u32;
            assigned[node] = true;
            load[best] += hg.node_weights[node];
        }

        // Local refinement: move a node when another block offers strictly
        // higher affinity and has room.
        for _ in 0..Self::REFINE_SWEEPS {
            let mut moved = false;
            for node in 0..n {
                let cur = assignment[node] as usize;
                let mut affinity = vec![0i64; k];
                for &e in &incident[node] {
                    for &other in hg.edge_nodes(e as usize) {
                        if other as usize != node {
                            affinity[assignment[other as usize] as usize] +=
                                hg.edge_weights[e as usize];
                        }
                    }
                }
                let mut target = cur;
                for b in 0..k {
                    if b != cur
                        && affinity[b] > affinity[target]
                        && load[b] + hg.node_weights[node] <= capacities[b]
                    {
                        target = b;
                    }
                }
                if target != cur {
                    assignment[node] = target as u32;
                    load[cur] -= hg.node_weights[node];
                    load[target] += hg.node_weights[node];
                    moved = true;
                }
            }
            if !moved {
                break;
            }
        }

        let objective = Self::connectivity(hg, &assignment, req.k.max(1));
        Ok(Partition {
            assignment,
            objective,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn four_node_graph() -> Hypergraph {
        let mut hg = Hypergraph::with_nodes(vec![1, 1, 1, 1]);
        hg.push_edge(&[0, 1], 10);
        hg.push_edge(&[2, 3], 10);
        hg.push_edge(&[1, 2], 1);
        hg
    }

    #[test]
    fn keeps_heavy_edges_uncut() {
        let hg = four_node_graph();
        let part = GreedyPartitioner
            .partition(
                &hg,
                &PartitionRequest {
                    k: 2,
                    imbalance: 0.1,
                    block_weights: None,
                },
            )
            .unwrap();
        assert_eq!(part.assignment[0], part.assignment[1]);
        assert_eq!(part.assignment[2], part.assignment[3]);
        assert_eq!(part.objective, 1);
    }

    #[test]
    fn respects_explicit_block_weights() {
        let hg = Hypergraph::with_nodes(vec![1; 6]);
        let weights = [4i64, 2];
        let part = GreedyPartitioner
            .partition(
                &hg,
                &PartitionRequest {
                    k: 2,
                    imbalance: 0.0,
                    block_weights: Some(&weights),
                },
            )
            .unwrap();
        let blocks = part.blocks(2);
        assert_eq!(blocks[0].len(), 4);
        assert_eq!(blocks[1].len(), 2);
    }

    #[test]
    fn hmetis_dump_shape() {
        let hg = four_node_graph();
        let text = hg.to_hmetis();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("3 4 11"));
        assert_eq!(text.lines().count(), 1 + 3 + 4);
    }
}
