//! Hypergraph-partitioning merge, for when the fiber count greatly exceeds
//! the available cores and pairwise greedy merging would be hopeless.
//!
//! One hypergraph node per fiber; one hyperedge per statement duplicated
//! across two or more fibers, weighted by its cost. A node's weight charges
//! shared work fractionally — `own − dup + dup/occurrences` — so the
//! partitioner balances the cost the cores will actually see after
//! clone-once unioning.
use crate::config::SchedConfig;
use crate::fiber::Fiber;
use crate::hypergraph::{Hypergraph, PartitionRequest, Partitioner};
use linked_hash_map::LinkedHashMap;
use weft_ir::{CostOracle, Design, StmtId};
use weft_utils::{DumpCtx, WeftResult};

struct CompInfo {
    users: Vec<u32>,
    cost: u32,
}

/// Group fibers into exactly `ways` buckets and union each bucket into one
/// fiber. No-op when the fiber count already fits.
pub fn hyper_merge(
    design: &Design,
    oracle: &dyn CostOracle,
    fibers: Vec<Fiber>,
    cfg: &SchedConfig,
    partitioner: &dyn Partitioner,
    dump: &DumpCtx,
) -> WeftResult<Vec<Fiber>> {
    let ways = cfg.target_cores();
    if fibers.is_empty() || (fibers.len() as u32) <= ways {
        log::info!("no need to hyper-merge {} fibers", fibers.len());
        return Ok(fibers);
    }

    // Statement usage across fibers, in first-sighting order for stable
    // hyperedge numbering between runs.
    let mut info: LinkedHashMap<StmtId, CompInfo> = LinkedHashMap::new();
    let mut sequential_cost: u64 = 0;
    for (gix, fiber) in fibers.iter().enumerate() {
        for &sid in &fiber.stmts {
            if let Some(entry) = info.get_mut(&sid) {
                entry.users.push(gix as u32);
            } else {
                let cost = oracle.cost(design, sid);
                sequential_cost += cost as u64;
                info.insert(
                    sid,
                    CompInfo {
                        users: vec![gix as u32],
                        cost,
                    },
                );
            }
        }
    }

    let mut node_cost = vec![0u64; fibers.len()];
    let mut dup_cost = vec![0u64; fibers.len()];
    let mut dup_cost_norm = vec![0u64; fibers.len()];
    for (_, comp) in info.iter() {
        for &user in &comp.users {
            node_cost[user as usize] += comp.cost as u64;
            if comp.users.len() > 1 {
                dup_cost[user as usize] += comp.cost as u64;
                dup_cost_norm[user as usize] += (comp.cost as usize / comp.users.len()) as u64;
            }
        }
    }
    let node_weights: Vec<i64> = (0..fibers.len())
        .map(|ix| {
            assert!(
                dup_cost[ix] >= dup_cost_norm[ix],
                "non-positive hypernode weight"
            );
            (node_cost[ix] - dup_cost[ix] + dup_cost_norm[ix]) as i64
        })
        .collect();

    let mut hg = Hypergraph::with_nodes(node_weights);
    for (_, comp) in info.iter() {
        if comp.users.len() > 1 {
            hg.push_edge(&comp.users, comp.cost as i64);
        }
    }

    let max_cost = hg.node_weights.iter().copied().max().unwrap_or(0);
    let sum_cost: i64 = hg.node_weights.iter().sum();
    log::info!(
        "hyper-merge: sequential cost {}, max node cost {}, cost sum {}, \
         target per core {:.1}",
        sequential_cost,
        max_cost,
        sum_cost,
        sum_cost as f64 / ways as f64
    );
    dump.write(5, "hypergraph_merge.hmetis", &hg.to_hmetis());

    let partition = partitioner.partition(
        &hg,
        &PartitionRequest {
            k: ways,
            imbalance: cfg.imbalance,
            block_weights: None,
        },
    )?;
    log::info!("hyper-merge objective: {}", partition.objective);

    let mut merged: Vec<Fiber> = Vec::new();
    let mut slots: Vec<Option<Fiber>> = fibers.into_iter().map(Some).collect();
    for (block, nodes) in partition.blocks(ways).into_iter().enumerate() {
        if nodes.is_empty() {
            log::warn!("partitioner returned empty partition {}", block);
            continue;
        }
        if nodes.len() == 1 {
            merged.push(slots[nodes[0]].take().expect("fiber consumed twice"));
        } else {
            let group: Vec<Fiber> = nodes
                .into_iter()
                .map(|ix| slots[ix].take().expect("fiber consumed twice"))
                .collect();
            merged.push(Fiber::union_group(group));
        }
    }
    if (merged.len() as u32) < ways {
        log::warn!(
            "failed to reach the desired core count: {} < {}",
            merged.len(),
            ways
        );
    }
    if (merged.len() as u32) > ways {
        log::warn!(
            "still more fibers than cores after hyper-merge: {} > {}",
            merged.len(),
            ways
        );
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypergraph::GreedyPartitioner;
    use crate::test_util::*;
    use weft_ir::WordCost;

    #[test]
    fn buckets_down_to_target_and_keeps_coverage() {
        let mut design = weft_ir::Design::new();
        let n = 12usize;
        let sigs: Vec<_> = (0..n)
            .map(|i| signal(&mut design, &format!("r{}", i), 1))
            .collect();
        let region: Vec<_> = (0..n)
            .map(|i| clocked(&mut design, [sigs[(i + 1) % n]], [sigs[i]], 5))
            .collect();
        let graph = crate::dep_graph::build(&design, &region).unwrap();
        let fibers = crate::dep_graph::split_fibers(&design, &graph);
        assert_eq!(fibers.len(), n);

        let cfg = SchedConfig {
            tiles: 3,
            workers: 1,
            tiles_per_device: 3,
            ..SchedConfig::default()
        };
        let merged = hyper_merge(
            &design,
            &WordCost,
            fibers,
            &cfg,
            &GreedyPartitioner,
            &DumpCtx::disabled(),
        )
        .unwrap();
        assert!(merged.len() <= 3);
        let total: usize = merged.iter().map(|f| f.stmts.len()).sum();
        assert_eq!(total, n, "every statement still scheduled exactly once");
    }

    #[test]
    fn shared_logic_weight_is_charged_fractionally() {
        // Two fibers sharing C: hypernode weights must be
        // own − dup + dup/2 each, i.e. 15 − 10 + 5 = 10.
        let (design, region) = fanout_design();
        let graph = crate::dep_graph::build(&design, &region).unwrap();
        let fibers = crate::dep_graph::split_fibers(&design, &graph);
        let cfg = SchedConfig {
            tiles: 2,
            workers: 1,
            tiles_per_device: 2,
            ..SchedConfig::default()
        };
        let merged = hyper_merge(
            &design,
            &WordCost,
            fibers,
            &cfg,
            &GreedyPartitioner,
            &DumpCtx::disabled(),
        )
        .unwrap();
        assert_eq!(merged.len(), 2);
        let shared = region[0];
        let holders = merged.iter().filter(|f| f.stmts.contains(&shared)).count();
        assert!(holders >= 1);
    }
}
