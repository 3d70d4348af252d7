//! The fixed-order scheduling pipeline.
//!
//! Single-threaded and synchronous: one compiler pass sequence, no internal
//! parallelism. All concurrency modeled here is a target-level abstraction
//! decided at compile time.
use crate::config::SchedConfig;
use crate::dep_graph;
use crate::device;
use crate::fiber::Fiber;
use crate::hyper_merge::hyper_merge;
use crate::hypergraph::Partitioner;
use crate::merge::merge_fibers;
use crate::resync::resync_all;
use crate::retime::{retime_all, OptimizeReport};
use weft_ir::{CostOracle, Design, LogicClasses, SignalId, SubstMap};
use weft_utils::{DumpCtx, WeftResult};

/// Final product of the scheduler: placed fibers plus the signals and
/// renamings the netlist transformations introduced, for module generation
/// to consume.
#[derive(Debug)]
pub struct Schedule {
    pub fibers: Vec<Fiber>,
    pub new_signals: Vec<SignalId>,
    pub subst: SubstMap,
    pub devices_used: u32,
}

/// Run the whole pipeline: classify-validate, retime or resync, build the
/// dependency graph, split, merge down to the core budget, partition across
/// devices, and place.
pub fn schedule(
    design: &mut Design,
    cfg: &SchedConfig,
    oracle: &dyn CostOracle,
    partitioner: &dyn Partitioner,
    dump: &DumpCtx,
) -> WeftResult<Schedule> {
    let mut classes = LogicClasses::gather(design);
    classes.validate(design)?;
    if !classes.finals.is_empty() {
        log::warn!("final logic is not scheduled onto fibers");
    }

    // Netlist transformations first; dependency graphs are rebuilt fresh
    // afterwards. Retiming takes precedence when both are requested.
    let mut opt_report = OptimizeReport::default();
    if cfg.retime {
        opt_report = retime_all(design, &mut classes, oracle, dump)?;
    } else if cfg.resync {
        opt_report = resync_all(design, &mut classes, oracle, cfg, dump)?;
    }

    let region = classes.next_state_region();
    let graph = dep_graph::build(design, &region)?;
    dump.write(3, "dep_graph.dot", &dep_graph::dot(design, &graph));

    let target = cfg.target_cores();
    let mut fibers = if target == 1 && graph.node_count() > 0 {
        vec![Fiber::from_graph(graph)]
    } else {
        dep_graph::split_fibers(design, &graph)
    };
    if dump.enabled(3) {
        for (ix, fiber) in fibers.iter().enumerate() {
            dump.write(3, &format!("fiber_{}.dot", ix), &dep_graph::dot(design, &fiber.graph));
        }
    }

    // Slightly over budget: greedy pairwise merging. Far over budget: the
    // k-way hypergraph partition, with the greedy merger absorbing any
    // remainder.
    if (fibers.len() as u32) > target {
        if (fibers.len() as u32) <= target * cfg.hyper_merge_factor {
            fibers = merge_fibers(design, oracle, fibers, cfg)?;
        } else {
            fibers = hyper_merge(design, oracle, fibers, cfg, partitioner, dump)?;
            if (fibers.len() as u32) > target {
                fibers = merge_fibers(design, oracle, fibers, cfg)?;
            }
        }
    }

    // Startup logic becomes one fiber pinned next to the supervisor.
    if !classes.initial.is_empty() || !classes.statik.is_empty() {
        let mut stmts = classes.statik.clone();
        stmts.extend(classes.initial.iter().copied());
        fibers.push(Fiber::initial(stmts));
    }

    let model = cfg.device_model();
    let parts = device::partition_devices(
        design,
        fibers,
        &model,
        partitioner,
        cfg.imbalance,
        dump,
    )?;
    let devices_used = parts.len() as u32;

    let placed = crate::place::place_all(design, parts, &model, cfg, partitioner, dump)?;
    log::info!(
        "scheduled {} fibers across {} device(s)",
        placed.len(),
        devices_used
    );

    Ok(Schedule {
        fibers: placed,
        new_signals: opt_report.new_signals,
        subst: opt_report.subst,
        devices_used,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MergeStrategy;
    use crate::hypergraph::GreedyPartitioner;
    use crate::test_util::*;
    use std::collections::HashSet;
    use weft_ir::WordCost;

    fn run(design: &mut weft_ir::Design, cfg: &SchedConfig) -> Schedule {
        schedule(
            design,
            cfg,
            &WordCost,
            &GreedyPartitioner,
            &DumpCtx::disabled(),
        )
        .unwrap()
    }

    #[test]
    fn end_to_end_smoke() {
        let (mut design, region) = fanout_design();
        let cfg = SchedConfig {
            tiles: 2,
            workers: 1,
            tiles_per_device: 2,
            ..SchedConfig::default()
        };
        let schedule = run(&mut design, &cfg);
        assert_eq!(schedule.devices_used, 1);
        assert_eq!(schedule.fibers.len(), 2);
        // every fiber is placed and every input statement is covered
        let mut seen = HashSet::new();
        for fiber in &schedule.fibers {
            assert!(fiber.placement.is_some());
            seen.extend(fiber.stmts.iter().copied());
        }
        for sid in region {
            assert!(seen.contains(&sid));
        }
    }

    #[test]
    fn single_core_keeps_one_fiber() {
        let (mut design, _region) = fanout_design();
        let cfg = SchedConfig {
            tiles: 1,
            workers: 1,
            tiles_per_device: 1,
            ..SchedConfig::default()
        };
        let schedule = run(&mut design, &cfg);
        assert_eq!(schedule.fibers.len(), 1);
    }

    #[test]
    fn external_inputs_are_rejected() {
        let mut design = weft_ir::Design::new();
        let x = signal(&mut design, "x", 1);
        let ghost = signal(&mut design, "ghost", 1);
        clocked(&mut design, [ghost], [x], 2);
        let cfg = SchedConfig::default();
        let err = schedule(
            &mut design,
            &cfg,
            &WordCost,
            &GreedyPartitioner,
            &DumpCtx::disabled(),
        )
        .unwrap_err();
        assert!(err.is_unsupported());
    }

    #[test]
    fn initial_logic_rides_along() {
        let mut design = weft_ir::Design::new();
        let x = signal(&mut design, "x", 1);
        design.add_stmt(weft_ir::Stmt::new(weft_ir::Domain::Initial, [], [x], 1));
        clocked(&mut design, [x], [x], 2);
        let cfg = SchedConfig {
            tiles: 2,
            workers: 1,
            tiles_per_device: 2,
            ..SchedConfig::default()
        };
        let schedule = run(&mut design, &cfg);
        let init = schedule
            .fibers
            .iter()
            .find(|f| f.class == crate::fiber::FiberClass::Initial)
            .unwrap();
        let p = init.placement.unwrap();
        assert_eq!((p.device, p.tile, p.worker), (0, 0, 0));
    }

    #[test]
    fn retiming_composes_with_the_pipeline() {
        let (mut design, _fibers) = chain_design(&[100, 2, 2], 2, 3);
        let cfg = SchedConfig {
            tiles: 4,
            workers: 1,
            tiles_per_device: 4,
            retime: true,
            merge_strategy: MergeStrategy::Conservative,
            ..SchedConfig::default()
        };
        let schedule = run(&mut design, &cfg);
        assert!(!schedule.new_signals.is_empty());
        assert!(schedule.fibers.iter().all(|f| f.placement.is_some()));
    }
}
