//! Resynchronization: push a fiber's sequential commit to an earlier rank
//! and replicate the logic beyond it into every consumer, removing one
//! synchronization round at the price of duplicated computation.
//!
//! Fibers are processed from most to least costly. A fiber mutated as a
//! consumer is permanently removed from further consideration: a single
//! pass, no transitive re-optimization.
use crate::config::SchedConfig;
use crate::dep_graph;
use crate::fiber::Fiber;
use crate::resync_graph::{self, build_resync_graphs, ResyncInfo, ResyncVertex};
use crate::retime::{sweep_dead_comb, OptimizeReport};
use linked_hash_map::LinkedHashMap;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;
use petgraph::Direction::{Incoming, Outgoing};
use std::collections::{HashMap, HashSet};
use weft_ir::{CostOracle, Design, Domain, LogicClasses, SignalId, Stmt, StmtId, SubstMap};
use weft_utils::{DumpCtx, WeftResult};

/// Ancestor-cone cost evaluation with caching, plus detection of paths
/// from the fiber's own read proxies (register feedback), which drag the
/// below-cut cost along.
struct ConeCost<'a> {
    info: &'a ResyncInfo,
    cache: HashMap<NodeIndex, u32>,
    self_path: HashSet<NodeIndex>,
}

impl<'a> ConeCost<'a> {
    fn new(info: &'a ResyncInfo) -> Self {
        ConeCost {
            info,
            cache: HashMap::new(),
            self_path: HashSet::new(),
        }
    }

    fn cone(&mut self, sink: NodeIndex) -> u32 {
        if let Some(&cached) = self.cache.get(&sink) {
            return cached;
        }
        let mut sum = 0;
        let mut stack = vec![sink];
        let mut seen: HashSet<NodeIndex> = stack.iter().copied().collect();
        while let Some(v) = stack.pop() {
            sum += self.info.graph[v].cost();
            if let ResyncVertex::SeqRead { writer, .. } = &self.info.graph[v] {
                if *writer == self.info.fiber {
                    self.self_path.insert(sink);
                }
            }
            for pred in self.info.graph.neighbors_directed(v, Incoming) {
                if seen.insert(pred) {
                    stack.push(pred);
                }
            }
        }
        self.cache.insert(sink, sum);
        sum
    }

    /// Worst sampled-path cost when cutting below `rank`.
    fn max_cost_above(&mut self, design: &Design, cut: u32, cost_higher: u32) -> u32 {
        let mut worst = 0;
        let verts: Vec<NodeIndex> = self.info.at_rank(cut + 1).collect();
        for v in verts {
            let samples: Vec<(SignalId, NodeIndex)> = self
                .info
                .graph
                .edges_directed(v, Incoming)
                .filter(|e| self.info.rank[e.source().index()] <= cut)
                .map(|e| (*e.weight(), v))
                .collect();
            for (sig, v) in samples {
                let cone = self.cone(v);
                let feedback = if self.self_path.contains(&v) {
                    cost_higher
                } else {
                    0
                };
                worst = worst.max(design.words(sig) + cone + feedback);
            }
        }
        worst
    }
}

/// Cost absorbed by the slowest other consumer when the below-cut logic is
/// replicated into it.
fn max_cost_below(info: &ResyncInfo, costs: &[u32], cost_higher: u32) -> u32 {
    let mut worst = 0;
    for &(consumer, _) in &info.consumers {
        if consumer != info.fiber {
            worst = worst.max(costs[consumer] + cost_higher);
        }
    }
    worst
}

/// Scan ranks from the sink upward; pick the lowest-cost rank above 1 that
/// beats the fiber's current cost on both sides of the cut.
fn find_cut(design: &Design, info: &ResyncInfo, costs: &[u32]) -> Option<(u32, u32)> {
    let max_cost = info.cost;
    let sink_rank = info.sink_rank();
    let mut cone = ConeCost::new(info);
    let mut cost_higher = info.graph[info.sink].cost();
    let mut best: Option<(u32, u32)> = None;
    let mut r = sink_rank.saturating_sub(1);
    while r > 1 {
        let c_above = cone.max_cost_above(design, r, cost_higher);
        let c_below = max_cost_below(info, costs, cost_higher);
        log::debug!(
            "fiber {} rank {}: cost above {} below {}",
            info.fiber,
            r,
            c_above,
            c_below
        );
        let current_best = best.map_or(max_cost, |(_, c)| c);
        if c_above < current_best && c_below < current_best {
            best = Some((r, c_above.max(c_below)));
        }
        cost_higher += info.rank_cost(r);
        r -= 1;
    }
    best
}

/// Resynchronize the design. Same contract as retiming: unsupported input
/// disables the optimization, nothing else fails.
pub fn resync_all(
    design: &mut Design,
    classes: &mut LogicClasses,
    oracle: &dyn CostOracle,
    cfg: &SchedConfig,
    dump: &DumpCtx,
) -> WeftResult<OptimizeReport> {
    let region = classes.next_state_region();
    let graph = match dep_graph::build(design, &region) {
        Ok(graph) => graph,
        Err(err) if err.is_unsupported() => {
            log::warn!("resynchronization disabled: {}", err);
            return Ok(OptimizeReport::default());
        }
        Err(err) => return Err(err),
    };
    let fibers = dep_graph::split_fibers(design, &graph);
    let mut infos = build_resync_graphs(design, oracle, &fibers);
    if dump.enabled(3) {
        for info in &infos {
            dump.write(
                3,
                &format!("resync_{}.dot", info.fiber),
                &resync_graph::dot(design, info),
            );
        }
    }

    let costs: Vec<u32> = infos.iter().map(|i| i.cost).collect();
    let max_cost = costs.iter().copied().max().unwrap_or(0);
    let frac = (1.0 - cfg.resync_threshold).clamp(0.0, 1.0);
    let threshold = (max_cost as f64 * frac) as u32;
    log::info!(
        "resync: considering fibers with cost above {} (max {})",
        threshold,
        max_cost
    );

    // Most costly first, the max-heap pass of the original.
    let mut order: Vec<usize> = (0..infos.len()).collect();
    order.sort_by_key(|&ix| std::cmp::Reverse(costs[ix]));

    let mut removed: HashSet<usize> = HashSet::new();
    let mut report = OptimizeReport::default();
    let mut skipped_unopt = 0usize;
    let mut disabled_transitively = 0usize;
    for ix in order {
        if removed.contains(&ix) {
            continue;
        }
        let info = &infos[ix];
        if costs[ix] < threshold {
            continue;
        }
        if info.unopt {
            // impure or multi-domain sequential logic: counted, skipped,
            // never transformed
            skipped_unopt += 1;
            continue;
        }
        let seq_empty = match &info.graph[info.sink] {
            ResyncVertex::Seq { stmts, .. } => stmts.is_empty(),
            _ => unreachable!("resync sink must be the sequential vertex"),
        };
        if seq_empty {
            continue;
        }
        if let Some((rank, cost)) = find_cut(design, info, &costs) {
            log::info!(
                "resync fiber {} at rank {}: cost {} -> {}",
                ix,
                rank,
                costs[ix],
                cost
            );
            apply_resync(design, classes, &fibers, info, rank, &mut report);
            report.transformed += 1;
            removed.insert(ix);
            for &(consumer, _) in &infos[ix].consumers {
                if removed.insert(consumer) {
                    disabled_transitively += 1;
                }
            }
            transform_graphs(&mut infos, ix, rank);
            if dump.enabled(4) {
                dump.write(
                    4,
                    &format!("resync_cut_{}.dot", ix),
                    &resync_graph::dot(design, &infos[ix]),
                );
            }
        }
    }
    if report.transformed > 0 {
        let swept = sweep_dead_comb(design, classes);
        log::info!(
            "resynced {} fibers ({} unoptimizable skipped, {} disabled \
             transitively), swept {} dead statements",
            report.transformed,
            skipped_unopt,
            disabled_transitively,
            swept
        );
    }
    Ok(report)
}

/// Mirror the accepted cut in the resync graphs themselves: the source
/// gets sampling commits ([`ResyncVertex::CombSeq`]) and loses everything
/// beyond the cut; each consumer receives the moved region as
/// [`ResyncVertex::SeqComb`] / [`ResyncVertex::CombComb`] clones wired into
/// its old read proxies. The transformed graphs feed the debug dumps; the
/// statement-level rewrite happens in [`apply_resync`].
fn transform_graphs(infos: &mut [ResyncInfo], source: usize, cut: u32) {
    let (moved, moved_edges, seq_pos, consumers) = {
        let info = &mut infos[source];
        let rank = info.rank.clone();
        let beyond: Vec<NodeIndex> = info
            .graph
            .node_indices()
            .filter(|v| rank[v.index()] > cut)
            .collect();
        let index_in_moved: HashMap<NodeIndex, usize> = beyond
            .iter()
            .enumerate()
            .map(|(i, &v)| (v, i))
            .collect();
        let moved: Vec<ResyncVertex> = beyond.iter().map(|&v| info.graph[v].clone()).collect();
        let moved_edges: Vec<(usize, usize, SignalId)> = info
            .graph
            .edge_references()
            .filter_map(|e| {
                match (
                    index_in_moved.get(&e.source()),
                    index_in_moved.get(&e.target()),
                ) {
                    (Some(&a), Some(&b)) => Some((a, b, *e.weight())),
                    _ => None,
                }
            })
            .collect();
        let seq_pos = beyond
            .iter()
            .position(|&v| v == info.sink)
            .expect("sink lies beyond every cut");
        let consumers = info.consumers.clone();

        // sampling commits for the crossing values
        let crossing: Vec<(NodeIndex, SignalId)> = info
            .graph
            .edge_references()
            .filter(|e| {
                rank[e.source().index()] <= cut && rank[e.target().index()] > cut
            })
            .map(|e| (e.source(), *e.weight()))
            .collect();
        let mut sampled: HashMap<SignalId, NodeIndex> = HashMap::new();
        for (from, sig) in crossing {
            let sample = *sampled
                .entry(sig)
                .or_insert_with(|| info.graph.add_node(ResyncVertex::CombSeq { signal: sig }));
            info.graph.add_edge(from, sample, sig);
        }
        // drop the moved region from the source
        info.graph
            .retain_nodes(|_, v| v.index() >= rank.len() || rank[v.index()] <= cut);
        info.rerank();
        info.cost = info
            .graph
            .node_indices()
            .map(|v| info.graph[v].cost())
            .sum();
        (moved, moved_edges, seq_pos, consumers)
    };

    let mut consumer_fibers: Vec<usize> = Vec::new();
    for &(consumer, _) in &consumers {
        if consumer != source && !consumer_fibers.contains(&consumer) {
            consumer_fibers.push(consumer);
        }
    }
    for c in consumer_fibers {
        let info = &mut infos[c];
        let clones: Vec<NodeIndex> = moved
            .iter()
            .map(|v| {
                info.graph.add_node(match v {
                    ResyncVertex::Seq { stmts, cost, .. } => ResyncVertex::SeqComb {
                        stmts: stmts.clone(),
                        cost: *cost,
                    },
                    ResyncVertex::Comb { stmt, cost } => ResyncVertex::CombComb {
                        stmt: *stmt,
                        cost: *cost,
                    },
                    other => other.clone(),
                })
            })
            .collect();
        for &(a, b, sig) in &moved_edges {
            info.graph.add_edge(clones[a], clones[b], sig);
        }
        // the old read proxies now feed from the local clone
        let proxies: Vec<NodeIndex> = consumers
            .iter()
            .filter(|(cf, _)| *cf == c)
            .map(|(_, n)| *n)
            .collect();
        for &proxy in &proxies {
            let outs: Vec<(NodeIndex, SignalId)> = info
                .graph
                .edges_directed(proxy, Outgoing)
                .map(|e| (e.target(), *e.weight()))
                .collect();
            for (target, sig) in outs {
                info.graph.add_edge(clones[seq_pos], target, sig);
            }
        }
        let gone: HashSet<NodeIndex> = proxies.into_iter().collect();
        info.graph.retain_nodes(|_, v| !gone.contains(&v));
        info.rerank();
        info.cost = info
            .graph
            .node_indices()
            .map(|v| info.graph[v].cost())
            .sum();
    }
}

/// Rewrite the source fiber and every consumer around the chosen cut.
///
/// The source samples the cut signals into fresh shadow registers and loses
/// everything beyond the cut. Each consumer receives its own clone of the
/// moved logic, combinational now, computing consumer-local copies of the
/// previously committed values.
fn apply_resync(
    design: &mut Design,
    classes: &mut LogicClasses,
    fibers: &[Fiber],
    info: &ResyncInfo,
    cut: u32,
    report: &mut OptimizeReport,
) {
    let clock = info.clock.expect("resynced fiber has a clock domain");
    let (seq_stmts, commits) = match &info.graph[info.sink] {
        ResyncVertex::Seq { stmts, commits, .. } => (stmts.clone(), commits.clone()),
        _ => unreachable!("resync sink must be the sequential vertex"),
    };

    // Sample the values crossing the cut; these become the source fiber's
    // new commits.
    let mut sample_map = SubstMap::default();
    let mut crossing: LinkedHashMap<SignalId, ()> = LinkedHashMap::new();
    for edge in info.graph.edge_references() {
        let from_r = info.rank[edge.source().index()];
        let to_r = info.rank[edge.target().index()];
        if from_r <= cut && to_r > cut && !crossing.contains_key(edge.weight()) {
            crossing.insert(*edge.weight(), ());
        }
    }
    for (&sig, _) in crossing.iter() {
        let shadow = design.fresh_signal_like("__Vresync", sig);
        sample_map.insert(sig, shadow);
        report.new_signals.push(shadow);
        let words = design.words(sig);
        let sid = design.add_stmt(Stmt::assign(Domain::Clocked(clock), shadow, sig, words));
        classes.clocked.push(sid);
    }

    // The moved region: combinational statements beyond the cut plus the
    // sequential logic itself.
    let mut moved_comb: Vec<StmtId> = Vec::new();
    for idx in info.graph.node_indices() {
        if info.rank[idx.index()] > cut {
            if let ResyncVertex::Comb { stmt, .. } = &info.graph[idx] {
                moved_comb.push(*stmt);
            }
        }
    }

    // Clone the moved region into every consumer fiber, each with its own
    // fresh names so no two consumers produce the same signal.
    let consumer_fibers: Vec<usize> = {
        let mut seen = Vec::new();
        for &(consumer, _) in &info.consumers {
            if !seen.contains(&consumer) {
                seen.push(consumer);
            }
        }
        seen
    };
    for &consumer in &consumer_fibers {
        let mut local = SubstMap::default();
        for (from, to) in sample_map.iter() {
            local.insert(from, to);
        }
        // local names for the moved region's outputs and the old commits
        let mut rename = |design: &mut Design, sig: SignalId, report: &mut OptimizeReport| {
            let fresh = design.fresh_signal_like("__Vresync", sig);
            report.new_signals.push(fresh);
            fresh
        };
        for &sid in &moved_comb {
            for w in design.stmts[sid].writes.to_vec() {
                if local.get(w).is_none() {
                    let fresh = rename(design, w, report);
                    local.insert(w, fresh);
                }
            }
        }
        for &x in &commits {
            if local.get(x).is_none() {
                let fresh = rename(design, x, report);
                local.insert(x, fresh);
            }
        }

        // Downstream combinational logic of the consumer reads the old
        // commits; it must be cloned per consumer as well, with its own
        // output names.
        let downstream_comb = consumer_comb_downstream(design, fibers, consumer, &commits);
        for &sid in &downstream_comb {
            for w in design.stmts[sid].writes.to_vec() {
                if local.get(w).is_none() {
                    let fresh = rename(design, w, report);
                    local.insert(w, fresh);
                }
            }
        }

        // moved combinational logic, cloned
        for &sid in &moved_comb {
            let clone = design.stmts.clone_with(sid, &local);
            classes.comb.push(clone);
        }
        // the sequential logic itself, combinational now
        for &sid in &seq_stmts {
            let mut stmt = design.stmts[sid].clone();
            stmt.substitute(&local);
            stmt.domain = Domain::Comb;
            let clone = design.add_stmt(stmt);
            classes.comb.push(clone);
        }
        // consumer-side combinational downstream, cloned
        for &sid in &downstream_comb {
            let clone = design.stmts.clone_with(sid, &local);
            classes.comb.push(clone);
        }
        // the consumer's own sequential statements read the local copies
        for sid in fibers[consumer].seq_stmts(design).collect::<Vec<_>>() {
            design.stmts[sid].substitute(&local);
        }
    }

    // The source fiber loses its sequential logic; the moved combinational
    // originals die in the sweep if nothing else uses them.
    let gone: HashSet<StmtId> = seq_stmts.into_iter().collect();
    classes.clocked.retain(|sid| !gone.contains(sid));
}

/// Combinational statements of `consumer` transitively reading any of the
/// resynced commits, in the consumer fiber's statement order.
fn consumer_comb_downstream(
    design: &Design,
    fibers: &[Fiber],
    consumer: usize,
    commits: &[SignalId],
) -> Vec<StmtId> {
    let fiber = &fibers[consumer];
    let mut tainted: HashSet<SignalId> = commits.iter().copied().collect();
    let mut result: Vec<StmtId> = Vec::new();
    // statement order is topological, one sweep suffices
    for &sid in &fiber.stmts {
        let stmt = &design.stmts[sid];
        if !stmt.domain.is_comb() {
            continue;
        }
        if stmt.reads.iter().any(|r| tainted.contains(r)) {
            tainted.extend(stmt.writes.iter().copied());
            result.push(sid);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::*;
    use weft_ir::WordCost;

    /// Source fiber: heavy head `c0` (cost 80) -> light `c1` (cost 5) ->
    /// sequential sink (cost 5) committing `x`; consumer reads `x`,
    /// commits `inp` (cost 4) which the head reads.
    fn resyncable() -> (weft_ir::Design, StmtId, StmtId) {
        let mut design = weft_ir::Design::new();
        let inp = signal(&mut design, "inp", 1);
        let x = signal(&mut design, "x", 1);
        let w0 = signal(&mut design, "w0", 1);
        let w1 = signal(&mut design, "w1", 1);
        comb(&mut design, [inp], [w0], 80);
        comb(&mut design, [w0], [w1], 5);
        let seq = clocked(&mut design, [w1], [x], 5);
        let consumer = clocked(&mut design, [x], [inp], 4);
        (design, seq, consumer)
    }

    #[test]
    fn pushes_the_tail_into_the_consumer() {
        let (mut design, seq, consumer) = resyncable();
        let mut classes = weft_ir::LogicClasses::gather(&design);
        let report = resync_all(
            &mut design,
            &mut classes,
            &WordCost,
            &SchedConfig::default(),
            &DumpCtx::disabled(),
        )
        .unwrap();
        assert_eq!(report.transformed, 1);
        assert!(!report.new_signals.is_empty());
        // the source's sequential commit is gone from the clocked region,
        // replaced by the sampling commit; the consumer survives
        assert!(!classes.clocked.contains(&seq));
        assert!(classes.clocked.contains(&consumer));
        // the consumer now reads a local copy, not the old commit
        assert!(!design.stmts[consumer].reads_signal(
            design
                .signals
                .iter()
                .find(|(_, s)| s.name.as_str() == "x")
                .map(|(id, _)| id)
                .unwrap()
        ));

        // the rewritten region still builds and splits
        let region = classes.next_state_region();
        let graph = crate::dep_graph::build(&design, &region).unwrap();
        let fibers = crate::dep_graph::split_fibers(&design, &graph);
        assert!(!fibers.is_empty());
    }

    #[test]
    fn impure_fibers_are_skipped() {
        // same shape as `resyncable`, but the source's sequential commit
        // calls into the host
        let mut design = weft_ir::Design::new();
        let inp = signal(&mut design, "inp", 1);
        let x = signal(&mut design, "x", 1);
        let w0 = signal(&mut design, "w0", 1);
        let w1 = signal(&mut design, "w1", 1);
        comb(&mut design, [inp], [w0], 80);
        comb(&mut design, [w0], [w1], 5);
        design.add_stmt(
            weft_ir::Stmt::new(
                weft_ir::Domain::Clocked(weft_ir::ClockId(0)),
                [w1],
                [x],
                5,
            )
            .impure(),
        );
        clocked(&mut design, [x], [inp], 4);
        let mut classes = weft_ir::LogicClasses::gather(&design);
        let report = resync_all(
            &mut design,
            &mut classes,
            &WordCost,
            &SchedConfig::default(),
            &DumpCtx::disabled(),
        )
        .unwrap();
        assert_eq!(report.transformed, 0);
    }

    #[test]
    fn no_op_when_nothing_beats_the_current_cost() {
        // flat cost profile: every cut samples nearly the whole graph
        let mut design = weft_ir::Design::new();
        let inp = signal(&mut design, "inp", 1);
        let x = signal(&mut design, "x", 1);
        let w0 = signal(&mut design, "w0", 1);
        let w1 = signal(&mut design, "w1", 1);
        comb(&mut design, [inp], [w0], 10);
        comb(&mut design, [w0], [w1], 10);
        clocked(&mut design, [w1], [x], 10);
        clocked(&mut design, [x], [inp], 30);
        let stmts_before = design.stmts.len();
        let mut classes = weft_ir::LogicClasses::gather(&design);
        let clocked_before = classes.clocked.clone();
        let report = resync_all(
            &mut design,
            &mut classes,
            &WordCost,
            &SchedConfig::default(),
            &DumpCtx::disabled(),
        )
        .unwrap();
        assert_eq!(report.transformed, 0);
        assert_eq!(design.stmts.len(), stmts_before);
        assert_eq!(classes.clocked, clocked_before);
    }
}
