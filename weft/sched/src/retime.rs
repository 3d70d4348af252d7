//! Retiming: relocate a fiber's sequential boundary to an earlier rank,
//! trading replicated downstream combinational logic for a shorter
//! per-superstep critical path.
//!
//! The engine builds the per-fiber netlist graphs, scans candidate cut
//! ranks from the sink backward, and accepts the rank minimizing
//! `max(costAbove, costBelow)` only when that strictly beats the fiber's
//! current cost and the downstream side does not become the new bottleneck.
//! A fiber whose best achievable cost equals its current cost is left
//! completely untouched.

use crate::dep_graph;
use crate::fiber::Fiber;
use crate::netlist_graph::{self, build_netlists, NetVertex, NetlistInfo};
use linked_hash_map::LinkedHashMap;
use petgraph::visit::EdgeRef;
use std::collections::HashSet;
use weft_ir::{CostOracle, Design, Domain, LogicClasses, SignalId, Stmt, StmtId, SubstMap};
use weft_utils::{DumpCtx, WeftResult};

/// What a netlist transformation did to the design, reported to downstream
/// module generation.
#[derive(Debug, Default)]
pub struct OptimizeReport {
    /// Number of fibers rewritten.
    pub transformed: usize,
    /// Shadow signals appended to the design.
    pub new_signals: Vec<SignalId>,
    /// Renamings applied to surviving statements.
    pub subst: SubstMap,
}

/// Candidate cut for one fiber: the rank and the worst-case cost it yields.
fn find_cut(info: &NetlistInfo, slowest_reader: u32) -> Option<(u32, u32)> {
    let cost_to_beat = info.total_cost;
    let sink_rank = info.rank[info.sink.index()];
    let mut best: Option<(u32, u32)> = None;
    for r in (1..sink_rank).rev() {
        let cost_above = info
            .at_rank(r)
            .map(|v| info.tvalue[v.index()] + info.graph[v].cost())
            .max()
            .unwrap_or(0);
        // everything strictly below the cut lands in the slowest reader
        let suffix = info
            .at_rank(r)
            .next()
            .map(|v| info.bvalue[v.index()])
            .unwrap_or(0);
        let cost_below = slowest_reader + suffix;
        if cost_below > cost_to_beat {
            // only grows as the cut moves up
            break;
        }
        let candidate = cost_above.max(cost_below);
        let current_best = best.map_or(cost_to_beat, |(_, c)| c);
        if candidate < current_best && cost_above >= cost_below {
            best = Some((r, candidate));
        }
        log::debug!(
            "fiber {} rank {}: cost above {} below {}",
            info.fiber,
            r,
            cost_above,
            cost_below
        );
    }
    best
}

/// Try to retime every fiber of the design, most expensive first. Returns
/// the rewrite report; an unsupported region disables the optimization and
/// reports nothing rather than failing the pipeline.
pub fn retime_all(
    design: &mut Design,
    classes: &mut LogicClasses,
    oracle: &dyn CostOracle,
    dump: &DumpCtx,
) -> WeftResult<OptimizeReport> {
    let region = classes.next_state_region();
    let graph = match dep_graph::build(design, &region) {
        Ok(graph) => graph,
        Err(err) if err.is_unsupported() => {
            log::warn!("retiming disabled: {}", err);
            return Ok(OptimizeReport::default());
        }
        Err(err) => return Err(err),
    };
    let fibers = dep_graph::split_fibers(design, &graph);
    let infos = build_netlists(design, oracle, &fibers);
    if dump.enabled(3) {
        for info in &infos {
            dump.write(
                3,
                &format!("netlist_{}.dot", info.fiber),
                &netlist_graph::dot(design, info),
            );
        }
    }

    let costs: Vec<u32> = infos.iter().map(|i| i.total_cost).collect();
    let mut order: Vec<usize> = (0..infos.len()).collect();
    order.sort_by_key(|&ix| std::cmp::Reverse(costs[ix]));

    let mut illegal: HashSet<usize> = HashSet::new();
    let mut chosen: Vec<(usize, u32)> = Vec::new();
    for ix in order {
        let info = &infos[ix];
        if illegal.contains(&ix) {
            continue;
        }
        let seq_empty = match &info.graph[info.sink] {
            NetVertex::SeqWrite { stmts, .. } => stmts.is_empty(),
            _ => unreachable!("netlist sink must be the sequential write"),
        };
        if seq_empty {
            continue;
        }
        if info.impure {
            log::info!("fiber {} has impure sequential logic, not retimed", ix);
            continue;
        }
        if info.readers.is_empty() {
            log::info!("fiber {} has no downstream reader, not retimed", ix);
            continue;
        }
        if info.multi_domain {
            log::info!("fiber {} mixes clock domains, not retimed", ix);
            continue;
        }
        let slowest_reader = info
            .readers
            .iter()
            .map(|&r| costs[r])
            .max()
            .expect("nonempty readers");
        if let Some((rank, cost)) = find_cut(info, slowest_reader) {
            log::info!(
                "retiming fiber {} at rank {}: cost {} -> {}",
                ix,
                rank,
                info.total_cost,
                cost
            );
            chosen.push((ix, rank));
            // further retiming of the readers would work with stale costs
            illegal.extend(info.readers.iter().copied());
        }
    }

    let mut report = OptimizeReport::default();
    for (ix, rank) in chosen {
        apply_retiming(design, classes, &fibers[ix], &infos[ix], rank, &mut report);
        report.transformed += 1;
    }
    if report.transformed > 0 {
        let swept = sweep_dead_comb(design, classes);
        log::info!(
            "retimed {} fibers, swept {} dead combinational statements",
            report.transformed,
            swept
        );
    }
    Ok(report)
}

/// Rewrite one fiber around the chosen cut rank.
///
/// Everything at or above the cut keeps committing: the values crossing the
/// cut are sampled into fresh shadow registers. Everything beyond the cut
/// is frozen into combinational logic guarded by an init flag: the first
/// cycle reads the initial values, later cycles read back the newly
/// introduced shadow commits. The original sequential statements disappear
/// from the clocked region.
fn apply_retiming(
    design: &mut Design,
    classes: &mut LogicClasses,
    fiber: &Fiber,
    info: &NetlistInfo,
    cut: u32,
    report: &mut OptimizeReport,
) {
    let clock = info.clock.expect("retimed fiber has a clock domain");

    // Sample every value crossing the cut.
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
        let shadow = design.fresh_signal_like("__Vretime", sig);
        sample_map.insert(sig, shadow);
        report.new_signals.push(shadow);
        let words = design.words(sig);
        let sid = design.add_stmt(Stmt::assign(Domain::Clocked(clock), shadow, sig, words));
        classes.clocked.push(sid);
    }

    // Clone the combinational logic beyond the cut with fresh lvalues; the
    // originals stay behind for any other fiber that still uses them and
    // are swept later if nothing does.
    let mut clone_subst = SubstMap::default();
    for (from, to) in sample_map.iter() {
        clone_subst.insert(from, to);
    }
    let mut beyond: Vec<StmtId> = Vec::new();
    for idx in info.graph.node_indices() {
        if info.rank[idx.index()] > cut {
            if let NetVertex::Comb { stmt, .. } = &info.graph[idx] {
                beyond.push(*stmt);
            }
        }
    }
    for &sid in &beyond {
        let writes: Vec<SignalId> = design.stmts[sid].writes.to_vec();
        for w in writes {
            if clone_subst.get(w).is_none() {
                let dup = design.fresh_signal_like("__Vretime", w);
                clone_subst.insert(w, dup);
                report.new_signals.push(dup);
            }
        }
    }
    for &sid in &beyond {
        let clone = design.stmts.clone_with(sid, &clone_subst);
        classes.comb.push(clone);
    }

    // Freeze the sequential logic behind an init/latch flag.
    let (seq_stmts, seq_cost) = match &info.graph[info.sink] {
        NetVertex::SeqWrite { stmts, cost } => (stmts.clone(), *cost),
        _ => unreachable!("netlist sink must be the sequential write"),
    };
    let flag = design.fresh_signal("__Vretime_init", 1);
    report.new_signals.push(flag);
    let init_sid = design.add_stmt(Stmt::new(Domain::Initial, [], [flag], 1));
    classes.initial.push(init_sid);

    let mut init_subst = SubstMap::default();
    let mut frozen_reads: Vec<SignalId> = vec![flag];
    let mut commit_reads: Vec<SignalId> = vec![flag];
    let mut commit_writes: Vec<SignalId> = vec![flag];
    for &x in &fiber.commits {
        let x_init = design.fresh_signal_like("__Vretime_init", x);
        let x_next = design.fresh_signal_like("__Vretime_next", x);
        report.new_signals.push(x_init);
        report.new_signals.push(x_next);
        init_subst.insert(x, x_init);
        report.subst.insert(x, x_init);
        frozen_reads.push(x_init);
        frozen_reads.push(x_next);
        commit_reads.push(x);
        commit_writes.push(x_next);
    }
    // Startup logic now initializes the shadow copies; registers without an
    // initializer get a default one so the first-cycle value is defined.
    let mut initialized: HashSet<SignalId> = HashSet::new();
    for &sid in classes.statik.iter().chain(classes.initial.iter()) {
        if sid == init_sid {
            continue;
        }
        for &w in design.stmts[sid].writes.clone().iter() {
            initialized.insert(w);
        }
        design.stmts[sid].substitute(&init_subst);
    }
    for &x in &fiber.commits {
        if !initialized.contains(&x) {
            let x_init = init_subst.get(x).expect("mapped above");
            let sid = design.add_stmt(Stmt::new(Domain::Initial, [], [x_init], 1));
            classes.initial.push(sid);
        }
    }

    // The frozen block reads what the sequential logic read, redirected
    // through the cut, plus the flag and the shadow state.
    for &sid in &seq_stmts {
        for r in design.stmts[sid].reads.to_vec() {
            let redirected = clone_subst.get(r).unwrap_or(r);
            if !frozen_reads.contains(&redirected) {
                frozen_reads.push(redirected);
            }
        }
    }
    let frozen = design.add_stmt(Stmt::new(
        Domain::Comb,
        frozen_reads,
        fiber.commits.iter().copied(),
        seq_cost,
    ));
    classes.comb.push(frozen);

    let commit_cost: u32 = fiber.commits.iter().map(|&x| design.words(x)).sum::<u32>() + 1;
    let commit = design.add_stmt(Stmt::new(
        Domain::Clocked(clock),
        commit_reads,
        commit_writes,
        commit_cost,
    ));
    classes.clocked.push(commit);

    let removed: HashSet<StmtId> = seq_stmts.into_iter().collect();
    classes.clocked.retain(|sid| !removed.contains(sid));
}

/// Drop combinational statements whose outputs nothing reads anymore.
/// Impure statements and pure sinks are kept regardless.
pub fn sweep_dead_comb(design: &Design, classes: &mut LogicClasses) -> usize {
    let mut removed = 0;
    loop {
        let mut read: HashSet<SignalId> = HashSet::new();
        for sid in classes
            .statik
            .iter()
            .chain(classes.initial.iter())
            .chain(classes.finals.iter())
            .chain(classes.comb.iter())
            .chain(classes.clocked.iter())
        {
            read.extend(design.stmts[*sid].reads.iter().copied());
        }
        let before = classes.comb.len();
        classes.comb.retain(|&sid| {
            let stmt = &design.stmts[sid];
            !stmt.pure
                || stmt.writes.is_empty()
                || stmt.writes.iter().any(|w| read.contains(w))
        });
        removed += before - classes.comb.len();
        if classes.comb.len() == before {
            return removed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::*;
    use weft_ir::WordCost;

    fn classes_of(design: &Design) -> LogicClasses {
        LogicClasses::gather(design)
    }

    #[test]
    fn rejects_cut_that_moves_the_bottleneck_downstream() {
        // comb rank chain [2,2,2] with a 100-cost sequential sink and one
        // downstream consumer of cost 3: the only attractive cut pushes the
        // 100-cost block into the consumer, which must be rejected.
        let (mut design, _fibers) = chain_design(&[2, 2, 2], 100, 3);
        let mut classes = classes_of(&design);
        let stmts_before = design.stmts.len();
        let clocked_before = classes.clocked.clone();
        let comb_before = classes.comb.clone();

        let report = retime_all(
            &mut design,
            &mut classes,
            &WordCost,
            &DumpCtx::disabled(),
        )
        .unwrap();
        assert_eq!(report.transformed, 0);
        assert!(report.new_signals.is_empty());
        // no-op optimization leaves the statement lists untouched
        assert_eq!(design.stmts.len(), stmts_before);
        assert_eq!(classes.clocked, clocked_before);
        assert_eq!(classes.comb, comb_before);
    }

    #[test]
    fn retimes_a_heavy_head_chain() {
        // [100,2,2] with a cheap sink: cutting right after the heavy head
        // caps the fiber at 100 and pushes the light tail downstream.
        let (mut design, fibers) = chain_design(&[100, 2, 2], 2, 3);
        let heavy_seq = fibers
            .iter()
            .flat_map(|f| f.seq_stmts(&design).collect::<Vec<_>>())
            .find(|&sid| design.stmts[sid].cost_words == 2)
            .unwrap();
        let mut classes = classes_of(&design);

        let report = retime_all(
            &mut design,
            &mut classes,
            &WordCost,
            &DumpCtx::disabled(),
        )
        .unwrap();
        assert_eq!(report.transformed, 1);
        assert!(!report.new_signals.is_empty());
        // the original sequential statement was frozen out of the clocked
        // region; a sample and a shadow commit took its place
        assert!(!classes.clocked.contains(&heavy_seq));
        assert_eq!(classes.clocked.len(), 3);

        // the rewritten region must still build and split cleanly
        let region = classes.next_state_region();
        let graph = crate::dep_graph::build(&design, &region).unwrap();
        let fibers = crate::dep_graph::split_fibers(&design, &graph);
        assert!(!fibers.is_empty());
    }

    #[test]
    fn impure_sequential_logic_is_never_retimed() {
        let mut design = weft_ir::Design::new();
        let reg = signal(&mut design, "reg", 1);
        let inp = signal(&mut design, "inp", 1);
        let w = signal(&mut design, "w", 1);
        comb(&mut design, [inp], [w], 100);
        design.add_stmt(
            weft_ir::Stmt::new(
                weft_ir::Domain::Clocked(weft_ir::ClockId(0)),
                [w],
                [reg],
                2,
            )
            .impure(),
        );
        clocked(&mut design, [reg], [inp], 3);
        let mut classes = classes_of(&design);
        let report = retime_all(
            &mut design,
            &mut classes,
            &WordCost,
            &DumpCtx::disabled(),
        )
        .unwrap();
        assert_eq!(report.transformed, 0);
    }

    #[test]
    fn sweep_keeps_live_and_impure_statements() {
        let mut design = weft_ir::Design::new();
        let a = signal(&mut design, "a", 1);
        let b = signal(&mut design, "b", 1);
        let dead = signal(&mut design, "dead", 1);
        let live = comb(&mut design, [a], [b], 1);
        let gone = comb(&mut design, [a], [dead], 1);
        clocked(&mut design, [b], [a], 1);
        let mut classes = classes_of(&design);
        let removed = sweep_dead_comb(&design, &mut classes);
        assert_eq!(removed, 1);
        assert!(classes.comb.contains(&live));
        assert!(!classes.comb.contains(&gone));
    }
}
