//! Greedy, cost-heap driven merge of fibers down to the target core count.
//!
//! A coarse "core graph" holds one vertex per fiber with its instruction
//! cost, inbound exchange words, and resident memory; edges carry summed
//! word counts between fiber pairs. A min-heap ordered by
//! `(instr_count, recv_words)` drives the pass: the cheapest fiber tries to
//! fuse with the neighbor that yields the cheapest merged core, where the
//! merged cost credits combinational logic the two fibers already share
//! (tracked in per-fiber bit-sets) and the exchange words that become
//! core-local.
use crate::config::{MergeStrategy, SchedConfig};
use crate::fiber::Fiber;
use fixedbitset::FixedBitSet;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction::{Incoming, Outgoing};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use weft_ir::{CostOracle, Design, SignalId, StmtId};
use weft_utils::{Error, WeftResult};

/// Cost of one core. Ordering (and the heap) only look at
/// `(instr, recv)`; memory is a feasibility bound, not an objective.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CostTriple {
    pub instr: u32,
    pub recv: u32,
    pub mem: u32,
}

impl CostTriple {
    pub fn key(self) -> (u32, u32) {
        (self.instr, self.recv)
    }

    fn scaled(self, fraction: f64) -> CostTriple {
        CostTriple {
            instr: (self.instr as f64 * fraction) as u32,
            recv: (self.recv as f64 * fraction) as u32,
            mem: self.mem,
        }
    }
}

struct Core {
    /// Indices of the original fibers fused into this core.
    parts: Vec<usize>,
    cost: CostTriple,
    /// Which duplicated statements this core already contains; merge-cost
    /// evaluation intersects two of these instead of re-walking graphs.
    dup_set: FixedBitSet,
    impure: bool,
    /// Bumped on every cost change or heap removal so stale heap entries
    /// can be recognized and skipped.
    generation: u32,
    in_heap: bool,
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct HeapEntry {
    key: (u32, u32),
    node: usize,
    generation: u32,
}

type CoreGraph = StableDiGraph<Core, u32>;

pub struct CoreMerger {
    graph: CoreGraph,
    dup_cost: Vec<u32>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    target: u32,
    max_mem: u32,
    num_cores: usize,
}

#[derive(Default)]
struct StmtInfo {
    cost: u32,
    visits: u32,
    dup_index: usize,
}

impl CoreMerger {
    /// Build the core graph from the current fiber list.
    pub fn build(
        design: &Design,
        oracle: &dyn CostOracle,
        fibers: &[Fiber],
        target: u32,
        max_mem: u32,
    ) -> Self {
        let mut info: HashMap<StmtId, StmtInfo> = HashMap::new();
        let mut dup_cost: Vec<u32> = Vec::new();
        let mut totals: Vec<CostTriple> = Vec::with_capacity(fibers.len());
        let mut impure: Vec<bool> = Vec::with_capacity(fibers.len());
        let mut producer: HashMap<SignalId, usize> = HashMap::new();

        let mut sequential_cost: u64 = 0;
        for (ix, fiber) in fibers.iter().enumerate() {
            let mut instr = 0u32;
            for &sid in &fiber.stmts {
                let entry = info.entry(sid).or_default();
                if entry.visits == 0 {
                    entry.cost = oracle.cost(design, sid);
                    sequential_cost += entry.cost as u64;
                } else if entry.visits == 1 {
                    // second sighting: this statement is duplicated
                    entry.dup_index = dup_cost.len();
                    dup_cost.push(entry.cost);
                }
                entry.visits += 1;
                instr += entry.cost;
            }
            impure.push(fiber.has_impure(design));
            totals.push(CostTriple {
                instr,
                recv: 0,
                mem: fiber.mem_words(design),
            });
            for &sig in &fiber.commits {
                if let Some(prev) = producer.insert(sig, ix) {
                    panic!(
                        "signal {} produced by fibers {} and {}",
                        design.signals[sig].name, prev, ix
                    );
                }
            }
        }
        log::info!(
            "merge: {} fibers, sequential cost {}, {} duplicated statements",
            fibers.len(),
            sequential_cost,
            dup_cost.len()
        );

        let mut graph = CoreGraph::default();
        let mut nodes: Vec<NodeIndex> = Vec::with_capacity(fibers.len());
        for (ix, fiber) in fibers.iter().enumerate() {
            let mut dup_set = FixedBitSet::with_capacity(dup_cost.len());
            for &sid in &fiber.stmts {
                let entry = &info[&sid];
                if entry.visits > 1 {
                    dup_set.insert(entry.dup_index);
                }
            }
            nodes.push(graph.add_node(Core {
                parts: vec![ix],
                cost: totals[ix],
                dup_set,
                impure: impure[ix],
                generation: 0,
                in_heap: false,
            }));
        }

        // Cross-fiber words, collapsed to one edge per ordered pair.
        let mut channel: HashMap<(usize, usize), u32> = HashMap::new();
        for (ix, fiber) in fibers.iter().enumerate() {
            for sig in fiber.recv_signals(&producer, ix) {
                let src = producer[&sig];
                *channel.entry((src, ix)).or_insert(0) += design.words(sig);
            }
        }
        for ((src, dst), words) in channel {
            graph.add_edge(nodes[src], nodes[dst], words);
        }
        for &node in &nodes {
            let recv: u32 = graph
                .edges_directed(node, Incoming)
                .map(|e| *e.weight())
                .sum();
            graph[node].cost.recv = recv;
        }

        let num_cores = fibers.len();
        CoreMerger {
            graph,
            dup_cost,
            heap: BinaryHeap::new(),
            target,
            max_mem,
            num_cores,
        }
    }

    pub fn num_cores(&self) -> usize {
        self.num_cores
    }

    fn is_feasible(&self, cost: CostTriple) -> bool {
        cost.mem <= self.max_mem
    }

    /// Merged cost of two cores: raw sums minus the duplicate-logic credit
    /// and the exchange words that become local.
    fn cost_after_merge(&self, a: NodeIndex, b: NodeIndex) -> CostTriple {
        let ca = &self.graph[a];
        let cb = &self.graph[b];
        let mut dup_common = 0u32;
        if !self.dup_cost.is_empty() {
            let mut common = ca.dup_set.clone();
            common.intersect_with(&cb.dup_set);
            dup_common = common.ones().map(|ix| self.dup_cost[ix]).sum();
        }
        let mutual: u32 = self
            .graph
            .edges_directed(a, Outgoing)
            .filter(|e| e.target() == b)
            .chain(
                self.graph
                    .edges_directed(b, Outgoing)
                    .filter(|e| e.target() == a),
            )
            .map(|e| *e.weight())
            .sum();
        let raw_instr = ca.cost.instr + cb.cost.instr;
        let raw_recv = ca.cost.recv + cb.cost.recv;
        assert!(raw_instr >= dup_common, "duplicate credit exceeds raw cost");
        assert!(raw_recv >= mutual, "mutual credit exceeds raw receive");
        CostTriple {
            instr: raw_instr - dup_common,
            recv: raw_recv - mutual,
            mem: ca.cost.mem + cb.cost.mem,
        }
    }

    // ---- heap maintenance ----------------------------------------------

    fn heap_insert(&mut self, node: NodeIndex) {
        let core = &mut self.graph[node];
        core.in_heap = true;
        self.heap.push(Reverse(HeapEntry {
            key: core.cost.key(),
            node: node.index(),
            generation: core.generation,
        }));
    }

    fn heap_remove(&mut self, node: NodeIndex) {
        let core = &mut self.graph[node];
        core.in_heap = false;
        core.generation += 1;
    }

    fn entry_valid(&self, entry: &HeapEntry) -> bool {
        let idx = NodeIndex::new(entry.node);
        match self.graph.node_weight(idx) {
            Some(core) => core.in_heap && core.generation == entry.generation,
            None => false,
        }
    }

    /// Empty the heap between passes, invalidating every outstanding entry.
    fn heap_reset(&mut self) {
        let nodes: Vec<NodeIndex> = self.graph.node_indices().collect();
        for node in nodes {
            let core = &mut self.graph[node];
            if core.in_heap {
                core.in_heap = false;
                core.generation += 1;
            }
        }
    }

    /// Discard stale entries and return the cheapest live core.
    fn peek_min(&mut self) -> Option<((u32, u32), NodeIndex)> {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if self.entry_valid(entry) {
                return Some((entry.key, NodeIndex::new(entry.node)));
            }
            self.heap.pop();
        }
        None
    }

    /// The second-cheapest live core.
    fn second_min(&mut self) -> Option<NodeIndex> {
        let first = match self.heap.pop() {
            Some(entry) => entry,
            None => return None,
        };
        let second = self.peek_min().map(|(_, node)| node);
        self.heap.push(first);
        second
    }

    // ---- surgery --------------------------------------------------------

    /// Fuse `b` into `a`: move edges over (summing parallel ones), union
    /// the duplicate sets, apply the merged cost.
    fn do_merge(&mut self, a: NodeIndex, b: NodeIndex, new_cost: CostTriple) {
        self.heap_remove(a);
        self.heap_remove(b);

        let mut moved: Vec<(NodeIndex, u32, bool)> = Vec::new();
        for edge in self.graph.edges_directed(b, Incoming) {
            if edge.source() != a {
                moved.push((edge.source(), *edge.weight(), true));
            }
        }
        for edge in self.graph.edges_directed(b, Outgoing) {
            if edge.target() != a {
                moved.push((edge.target(), *edge.weight(), false));
            }
        }
        let removed = self.graph.remove_node(b).expect("core vanished mid-merge");

        for (other, words, incoming) in moved {
            let (src, dst) = if incoming { (other, a) } else { (a, other) };
            match self.graph.find_edge(src, dst) {
                Some(e) => *self.graph.edge_weight_mut(e).expect("edge vanished") += words,
                None => {
                    self.graph.add_edge(src, dst, words);
                }
            }
        }

        let core = &mut self.graph[a];
        core.parts.extend(removed.parts);
        core.dup_set.union_with(&removed.dup_set);
        core.impure |= removed.impure;
        core.cost = new_cost;
        core.generation += 1;
        self.num_cores -= 1;
        log::debug!(
            "merged into core of {} fibers, cost ({}, {})",
            core.parts.len(),
            new_cost.instr,
            new_cost.recv
        );
        self.heap_insert(a);
    }

    /// Best qualifying neighbor merge for `node`.
    fn best_neighbor(&self, node: NodeIndex, cap: Option<(u32, u32)>) -> Option<(CostTriple, NodeIndex)> {
        let mut best: Option<(CostTriple, NodeIndex)> = None;
        let neighbors: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(node, Incoming)
            .chain(self.graph.neighbors_directed(node, Outgoing))
            .collect();
        for other in neighbors {
            if other == node || !self.graph[other].in_heap {
                continue;
            }
            let cost = self.cost_after_merge(node, other);
            if !self.is_feasible(cost) {
                continue;
            }
            if let Some(cap) = cap {
                if cost.key() >= cap {
                    continue;
                }
            }
            if best.map_or(true, |(b, _)| cost.key() < b.key()) {
                best = Some((cost, other));
            }
        }
        best
    }

    /// One round of the cheapest-fiber heuristic. Returns false when the
    /// pass should give up on the current cheapest core.
    ///
    /// When the cheapest core has no qualifying neighbor, the
    /// second-cheapest core gets a turn: first its own best neighbor, then
    /// a direct pairing with the cheapest. Which fibers end up merged is
    /// the behavior downstream stages rely on; the tie-breaking order is
    /// not.
    fn merge_round(&mut self, node: NodeIndex, cap: Option<(u32, u32)>) -> bool {
        if let Some((cost, other)) = self.best_neighbor(node, cap) {
            self.do_merge(node, other, cost);
            return true;
        }
        let second = match self.second_min() {
            Some(second) => second,
            None => return false,
        };
        if let Some((cost, other)) = self.best_neighbor(second, cap) {
            self.do_merge(second, other, cost);
            return true;
        }
        let pair = self.cost_after_merge(node, second);
        let qualifies =
            self.is_feasible(pair) && cap.map_or(true, |cap| pair.key() < cap);
        if qualifies {
            self.do_merge(node, second, pair);
            return true;
        }
        false
    }

    /// Conservative pass: merge as long as no core grows beyond the
    /// pass-start worst case (scaled by `threshold`). Impure cores do not
    /// participate.
    pub fn conservative(&mut self, threshold: f64) -> usize {
        assert!(self.heap.is_empty(), "heap should be empty between passes");
        if self.num_cores as u32 <= self.target {
            return 0;
        }
        let mut costs: Vec<CostTriple> =
            self.graph.node_indices().map(|n| self.graph[n].cost).collect();
        costs.sort_by_key(|c| c.key());
        let worst = costs.last().expect("at least one core").scaled(threshold);
        if worst.key() == (0, 0) {
            log::info!("conservative merge not possible with a zero cost bound");
            return 0;
        }
        log::info!(
            "conservative merge: worst permissible cost ({}, {})",
            worst.instr,
            worst.recv
        );

        let nodes: Vec<NodeIndex> = self.graph.node_indices().collect();
        for node in nodes {
            if !self.graph[node].impure {
                self.heap_insert(node);
            }
        }

        let mut merges = 0;
        while self.num_cores as u32 > self.target {
            let (key, node) = match self.peek_min() {
                Some(top) => top,
                None => break,
            };
            if key > worst.key() {
                break;
            }
            if self.merge_round(node, Some(worst.key())) {
                merges += 1;
            } else {
                self.heap_remove(node);
            }
        }
        self.heap_reset();
        log::info!("conservative merge fused {} pairs", merges);
        merges
    }

    /// Forced pass: reach the target core count no matter what the worst
    /// case becomes. Only per-core memory remains a hard bound.
    pub fn forced(&mut self) -> WeftResult<usize> {
        assert!(self.heap.is_empty(), "heap should be empty between passes");
        if self.num_cores as u32 <= self.target {
            return Ok(0);
        }
        let nodes: Vec<NodeIndex> = self.graph.node_indices().collect();
        for node in nodes {
            self.heap_insert(node);
        }

        let mut merges = 0;
        while self.num_cores as u32 > self.target {
            let (_, node) = match self.peek_min() {
                Some(top) => top,
                None => break,
            };
            if self.merge_round(node, None) {
                merges += 1;
            } else {
                log::warn!(
                    "could not merge a core with neighbors or the next in line, \
                     possibly out of memory"
                );
                self.heap_remove(node);
            }
        }
        self.heap_reset();
        if self.num_cores as u32 > self.target {
            return Err(Error::resource_exhausted(format!(
                "could not reach the target core count: {} > {} \
                 (per-core memory bound too tight?)",
                self.num_cores, self.target
            )));
        }
        Ok(merges)
    }

    /// Longest-processing-time-first packing, oblivious to communication.
    pub fn lpt(&mut self) -> WeftResult<usize> {
        assert!(self.heap.is_empty(), "heap should be empty between passes");
        if self.num_cores as u32 <= self.target {
            return Ok(0);
        }
        self.graph.clear_edges();

        let mut order: Vec<NodeIndex> = self.graph.node_indices().collect();
        order.sort_by_key(|&n| self.graph[n].cost.key());
        // Seed the places with the largest cores.
        for _ in 0..self.target {
            let node = order.pop().expect("more cores than target");
            self.heap_insert(node);
        }

        let mut merges = 0;
        while let Some(node) = order.pop() {
            let mut parked: Vec<NodeIndex> = Vec::new();
            let mut merged = false;
            while let Some((_, place)) = self.peek_min() {
                let cost = self.cost_after_merge(place, node);
                if self.is_feasible(cost) {
                    self.do_merge(place, node, cost);
                    merges += 1;
                    merged = true;
                    break;
                }
                // look deeper into the heap
                self.heap_remove(place);
                parked.push(place);
            }
            for place in parked {
                self.heap_insert(place);
            }
            if !merged {
                return Err(Error::resource_exhausted(
                    "ran out of per-core memory while packing fibers",
                ));
            }
        }
        self.heap_reset();
        Ok(merges)
    }

    /// Worst per-core cost key currently in the graph.
    pub fn worst_cost(&self) -> (u32, u32) {
        self.graph
            .node_indices()
            .map(|n| self.graph[n].cost.key())
            .max()
            .unwrap_or((0, 0))
    }

    /// Rebuild the fiber list: untouched cores hand back their original
    /// fiber, fused cores are unioned with clone-once semantics.
    pub fn into_fibers(self, fibers: Vec<Fiber>) -> Vec<Fiber> {
        let mut slots: Vec<Option<Fiber>> = fibers.into_iter().map(Some).collect();
        let mut cores: Vec<Vec<usize>> = self
            .graph
            .node_indices()
            .map(|n| self.graph[n].parts.clone())
            .collect();
        cores.sort_by_key(|parts| parts.iter().copied().min().unwrap_or(usize::MAX));
        cores
            .into_iter()
            .map(|parts| {
                if parts.len() == 1 {
                    slots[parts[0]].take().expect("fiber consumed twice")
                } else {
                    let group: Vec<Fiber> = parts
                        .iter()
                        .map(|&ix| slots[ix].take().expect("fiber consumed twice"))
                        .collect();
                    Fiber::union_group(group)
                }
            })
            .collect()
    }
}

/// Merge fibers down to the configured core count with the configured
/// strategy. The default pipeline runs the conservative pass and lets the
/// forced pass absorb whatever is still above target.
pub fn merge_fibers(
    design: &Design,
    oracle: &dyn CostOracle,
    fibers: Vec<Fiber>,
    cfg: &SchedConfig,
) -> WeftResult<Vec<Fiber>> {
    let target = cfg.target_cores();
    if fibers.len() as u32 <= target {
        return Ok(fibers);
    }
    let mut merger = CoreMerger::build(design, oracle, &fibers, target, cfg.max_mem_words);
    match cfg.merge_strategy {
        MergeStrategy::Conservative => {
            merger.conservative(cfg.merge_threshold);
            if merger.num_cores() as u32 > target {
                merger.forced()?;
            }
        }
        MergeStrategy::Forced => {
            merger.forced()?;
        }
        MergeStrategy::Lpt => {
            merger.lpt()?;
        }
    }
    let merged = merger.into_fibers(fibers);
    log::info!("merge finished with {} fibers", merged.len());
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::*;
    use weft_ir::WordCost;

    fn merge_cfg(tiles: u32) -> SchedConfig {
        SchedConfig {
            tiles,
            workers: 1,
            tiles_per_device: tiles,
            ..SchedConfig::default()
        }
    }

    #[test]
    fn dedup_credit_pairs_the_sharing_fibers() {
        // 4 commit points, shared comb C in two of them; target 2 cores.
        let (design, region) = fanout_design();
        let graph = crate::dep_graph::build(&design, &region).unwrap();
        let fibers = crate::dep_graph::split_fibers(&design, &graph);
        assert_eq!(fibers.len(), 4);
        let shared = region[0];

        let merged = merge_fibers(&design, &WordCost, fibers, &merge_cfg(2)).unwrap();
        assert_eq!(merged.len(), 2);
        // The two C-containing fibers must have fused with each other: the
        // duplicate credit makes theirs the cheapest pairing.
        let holders: Vec<_> = merged
            .iter()
            .filter(|f| f.stmts.contains(&shared))
            .collect();
        assert_eq!(holders.len(), 1, "C-fibers merged together, C cloned once");
        let cost = holders[0].instr_cost(&design, &WordCost);
        assert_eq!(cost, 20, "15 + 15 minus the 10-cost duplicate credit");
    }

    #[test]
    fn merge_strictly_decreases_and_bounds_worst_case() {
        // Fuzz with deterministic cost-weighted graphs of 10..200 fibers.
        let mut rng = Lcg::new(0xda7a);
        for round in 0..12 {
            let n = 10 + rng.below(191) as usize;
            let mut design = weft_ir::Design::new();
            let sigs: Vec<_> = (0..n)
                .map(|i| signal(&mut design, &format!("r{}", i), 1))
                .collect();
            let region: Vec<_> = (0..n)
                .map(|i| {
                    let src = rng.below(n as u32) as usize;
                    clocked(
                        &mut design,
                        [sigs[src], sigs[i]],
                        [sigs[i]],
                        1 + rng.below(100),
                    )
                })
                .collect();
            let graph = crate::dep_graph::build(&design, &region).unwrap();
            let fibers = crate::dep_graph::split_fibers(&design, &graph);
            let before = fibers.len();
            let worst_before = fibers
                .iter()
                .map(|f| f.instr_cost(&design, &WordCost))
                .max()
                .unwrap();

            let target = (before / 2).max(1) as u32;
            let mut merger =
                CoreMerger::build(&design, &WordCost, &fibers, target, u32::MAX);
            merger.conservative(1.0);
            let (worst_after, _) = merger.worst_cost();
            let after = merger.num_cores();
            assert!(after <= before, "round {}: fiber count grew", round);
            assert!(
                worst_after <= worst_before,
                "round {}: conservative merge worsened the critical path \
                 ({} > {})",
                round,
                worst_after,
                worst_before
            );
        }
    }

    #[test]
    fn forced_reaches_target_on_disconnected_fibers() {
        let mut design = weft_ir::Design::new();
        let sigs: Vec<_> = (0..6)
            .map(|i| signal(&mut design, &format!("r{}", i), 1))
            .collect();
        let region: Vec<_> = (0..6)
            .map(|i| clocked(&mut design, [sigs[i]], [sigs[i]], 3 + i as u32))
            .collect();
        let graph = crate::dep_graph::build(&design, &region).unwrap();
        let fibers = crate::dep_graph::split_fibers(&design, &graph);
        assert_eq!(fibers.len(), 6);

        let cfg = SchedConfig {
            merge_strategy: MergeStrategy::Forced,
            ..merge_cfg(2)
        };
        let merged = merge_fibers(&design, &WordCost, fibers, &cfg).unwrap();
        assert_eq!(merged.len(), 2);
        // coverage is preserved across merging
        let total: usize = merged.iter().map(|f| f.stmts.len()).sum();
        assert_eq!(total, 6);
    }

    #[test]
    fn lpt_balances_without_communication() {
        let mut design = weft_ir::Design::new();
        let sigs: Vec<_> = (0..4)
            .map(|i| signal(&mut design, &format!("r{}", i), 1))
            .collect();
        let costs = [10u32, 9, 2, 1];
        let region: Vec<_> = (0..4)
            .map(|i| clocked(&mut design, [sigs[i]], [sigs[i]], costs[i]))
            .collect();
        let graph = crate::dep_graph::build(&design, &region).unwrap();
        let fibers = crate::dep_graph::split_fibers(&design, &graph);

        let cfg = SchedConfig {
            merge_strategy: MergeStrategy::Lpt,
            ..merge_cfg(2)
        };
        let merged = merge_fibers(&design, &WordCost, fibers, &cfg).unwrap();
        assert_eq!(merged.len(), 2);
        let mut loads: Vec<u32> = merged
            .iter()
            .map(|f| f.instr_cost(&design, &WordCost))
            .collect();
        loads.sort_unstable();
        assert_eq!(loads, vec![11, 11], "LPT pairs 10+1 and 9+2");
    }
}
