//! Tile/worker placement: give every fiber a concrete (device, tile,
//! worker) coordinate, then optionally re-partition the compute fibers to
//! cut inter-device traffic.
use crate::config::SchedConfig;
use crate::device::{DeviceModel, PartitionResult};
use crate::fiber::{Fiber, FiberClass, Placement};
use crate::hypergraph::{Hypergraph, PartitionRequest, Partitioner};
use linked_hash_map::LinkedHashMap;
use std::collections::HashMap;
use weft_ir::{Design, SignalId};
use weft_utils::{DumpCtx, Error, WeftResult};

/// Measured base latency of one exchange by fan-out bucket, plus the
/// per-word cost. Larger fan-outs pay a higher fixed setup overhead.
fn base_cost(fanout: usize) -> i64 {
    if fanout == 1 {
        1194
    } else if fanout <= 8 {
        1254
    } else if fanout <= 16 {
        1264
    } else if fanout <= 32 {
        1289
    } else if fanout <= 64 {
        1322
    } else {
        1325
    }
}

fn fanout_cost(words: i64, fanout: usize) -> i64 {
    base_cost(fanout) + words * 2
}

/// Round-robin (tile, worker) assignment within one device. With several
/// devices in play each device's zeroth tile is kept free for exchange
/// bookkeeping.
fn assign_linear(
    fibers: &mut [Fiber],
    device: u32,
    usable_tiles: u32,
    workers: u32,
    min_tile: u32,
    tile_offset: u32,
) {
    let max_tile = usable_tiles + min_tile;
    let mut tile = min_tile;
    let mut worker = 0;
    for fiber in fibers.iter_mut() {
        if tile == max_tile {
            tile = min_tile;
            worker += 1;
        }
        fiber.placement = Some(Placement {
            device,
            tile: tile + tile_offset,
            worker,
            supervisor: false,
        });
        tile += 1;
    }
}

/// Assign every fiber its placement and run the communication-minimizing
/// re-partition when enabled and several devices are used.
pub fn place_all(
    design: &Design,
    parts: Vec<PartitionResult>,
    model: &DeviceModel,
    cfg: &SchedConfig,
    partitioner: &dyn Partitioner,
    dump: &DumpCtx,
) -> WeftResult<Vec<Fiber>> {
    let devs = parts.len();
    let multi = devs > 1;
    let min_tile = if multi { 1 } else { 0 };

    let mut fibers: Vec<Fiber> = Vec::new();
    for (dev, part) in parts.into_iter().enumerate() {
        let capacity = part.usable_tiles * model.workers;
        let mut batch = part.fibers;
        let compute = batch
            .iter()
            .filter(|f| f.class == FiberClass::Compute)
            .count() as u32;
        if compute > capacity {
            log::warn!(
                "not enough tiles on device {}: {} fibers for {} tile*worker slots",
                dev,
                compute,
                capacity
            );
        }
        // Initial fibers sit next to the supervisor on the zeroth tile.
        for fiber in batch.iter_mut().filter(|f| f.class == FiberClass::Initial) {
            fiber.placement = Some(Placement {
                device: 0,
                tile: 0,
                worker: 0,
                supervisor: false,
            });
        }
        let mut compute_batch: Vec<Fiber> = Vec::new();
        for fiber in batch {
            if fiber.class == FiberClass::Compute {
                compute_batch.push(fiber);
            } else {
                fibers.push(fiber);
            }
        }
        assign_linear(
            &mut compute_batch,
            dev as u32,
            part.usable_tiles,
            model.workers,
            min_tile,
            dev as u32 * model.tiles_per_device,
        );
        fibers.extend(compute_batch);
    }

    if cfg.inter_device_comm && multi {
        repartition_devices(design, &mut fibers, model, devs, cfg, partitioner, dump)?;
    }

    promote_supervisors(&mut fibers, cfg);
    Ok(fibers)
}

/// Second hypergraph pass over compute fibers only: hyperedges are
/// point-to-point exchange channels weighted by fan-out bucketed latency,
/// block weights are the current per-device populations.
fn repartition_devices(
    design: &Design,
    fibers: &mut [Fiber],
    model: &DeviceModel,
    devs: usize,
    cfg: &SchedConfig,
    partitioner: &dyn Partitioner,
    dump: &DumpCtx,
) -> WeftResult<()> {
    let compute: Vec<usize> = fibers
        .iter()
        .enumerate()
        .filter(|(_, f)| f.class == FiberClass::Compute)
        .map(|(ix, _)| ix)
        .collect();
    let index_of: HashMap<usize, u32> = compute
        .iter()
        .enumerate()
        .map(|(node, &fx)| (fx, node as u32))
        .collect();

    // Exchange channels: committed signal -> producer plus all readers.
    let mut producer: HashMap<SignalId, usize> = HashMap::new();
    for &fx in &compute {
        for &sig in &fibers[fx].commits {
            producer.insert(sig, fx);
        }
    }
    struct Net {
        nodes: Vec<u32>,
        words: i64,
    }
    let mut nets: LinkedHashMap<SignalId, Net> = LinkedHashMap::new();
    for &fx in &compute {
        for sig in fibers[fx].recv_signals(&producer, fx) {
            let src = index_of[&producer[&sig]];
            let dst = index_of[&fx];
            if let Some(net) = nets.get_mut(&sig) {
                if !net.nodes.contains(&dst) {
                    net.nodes.push(dst);
                }
            } else {
                nets.insert(
                    sig,
                    Net {
                        nodes: vec![src, dst],
                        words: design.words(sig) as i64,
                    },
                );
            }
        }
    }

    let mut hg = Hypergraph::with_nodes(vec![1; compute.len()]);
    for (_, net) in nets.iter() {
        let mut nodes = net.nodes.clone();
        nodes.sort_unstable();
        let fanout = nodes.len().saturating_sub(1).max(1);
        hg.push_edge(&nodes, fanout_cost(net.words, fanout));
    }
    dump.write(5, "interdevice.hmetis", &hg.to_hmetis());

    // Current per-device population as the block target.
    let mut block_weights = vec![0i64; devs];
    for &fx in &compute {
        let dev = fibers[fx].placement.expect("placed above").device as usize;
        block_weights[dev] += 1;
    }
    let partition = partitioner.partition(
        &hg,
        &PartitionRequest {
            k: devs as u32,
            imbalance: cfg.imbalance,
            block_weights: Some(&block_weights),
        },
    )?;
    log::info!("inter-device partition objective: {}", partition.objective);

    // The partitioner may overfill a device; spill the surplus into any
    // device that still has room under its block target.
    let max_block = (model.tiles_per_device * model.workers) as usize;
    let mut buckets: Vec<Vec<usize>> = vec![Vec::new(); devs];
    let mut overflow: Vec<usize> = Vec::new();
    for (node, &fx) in compute.iter().enumerate() {
        let dev = partition.assignment[node] as usize;
        if buckets[dev].len() < max_block {
            buckets[dev].push(fx);
        } else {
            log::warn!("overloaded device partition {}", dev);
            overflow.push(fx);
        }
    }
    'spill: for fx in overflow {
        for dev in 0..devs {
            if (buckets[dev].len() as i64) < block_weights[dev] {
                buckets[dev].push(fx);
                continue 'spill;
            }
        }
        return Err(Error::resource_exhausted(
            "no device can absorb the partitioner's overflow",
        ));
    }

    // Reassign concrete coordinates inside each device. Tile 0 of device 0
    // stays reserved.
    let tiles_in_last = {
        let rem = model.avail_tiles % model.tiles_per_device;
        if rem == 0 {
            model.tiles_per_device
        } else {
            rem
        }
    };
    for (dev, bucket) in buckets.into_iter().enumerate() {
        let tile_base = dev as u32 * model.tiles_per_device;
        let tile_len = if dev == devs - 1 {
            tiles_in_last
        } else {
            model.tiles_per_device
        };
        let mut tile = if dev == 0 { 1 } else { 0 };
        let mut worker = 0;
        for fx in bucket {
            assert!(worker < model.workers, "worker id overflow on device {}", dev);
            let supervisor = fibers[fx].placement.map_or(false, |p| p.supervisor);
            fibers[fx].placement = Some(Placement {
                device: dev as u32,
                tile: tile + tile_base,
                worker,
                supervisor,
            });
            if tile == tile_len - 1 {
                tile = 0;
                worker += 1;
            } else {
                tile += 1;
            }
        }
    }
    Ok(())
}

/// If every compute fiber landed on worker 0, each owns its whole tile and
/// can be promoted to supervisor mode.
fn promote_supervisors(fibers: &mut [Fiber], cfg: &SchedConfig) {
    if !cfg.supervisor {
        return;
    }
    let max_worker = fibers
        .iter()
        .filter(|f| f.class == FiberClass::Compute)
        .filter_map(|f| f.placement.map(|p| p.worker))
        .max()
        .unwrap_or(0);
    if max_worker == 0 {
        log::info!("promoting all fibers to supervisor mode");
        for fiber in fibers.iter_mut().filter(|f| f.class == FiberClass::Compute) {
            if let Some(p) = fiber.placement.as_mut() {
                p.supervisor = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypergraph::GreedyPartitioner;
    use crate::test_util::*;
    use weft_utils::DumpCtx;

    fn ring(n: usize) -> (weft_ir::Design, Vec<Fiber>) {
        let mut design = weft_ir::Design::new();
        let sigs: Vec<_> = (0..n)
            .map(|i| signal(&mut design, &format!("r{}", i), 1))
            .collect();
        let region: Vec<_> = (0..n)
            .map(|i| clocked(&mut design, [sigs[(i + 1) % n]], [sigs[i]], 4))
            .collect();
        let graph = crate::dep_graph::build(&design, &region).unwrap();
        let fibers = crate::dep_graph::split_fibers(&design, &graph);
        (design, fibers)
    }

    fn cfg(tiles: u32, workers: u32, tiles_per_device: u32) -> SchedConfig {
        SchedConfig {
            tiles,
            workers,
            tiles_per_device,
            ..SchedConfig::default()
        }
    }

    #[test]
    fn single_device_round_robin_and_supervisor() {
        let (design, fibers) = ring(4);
        let cfg = cfg(4, 2, 4);
        let model = cfg.device_model();
        let parts = vec![PartitionResult {
            fibers,
            usable_tiles: 4,
        }];
        let placed = place_all(
            &design,
            parts,
            &model,
            &cfg,
            &GreedyPartitioner,
            &DumpCtx::disabled(),
        )
        .unwrap();
        let mut coords: Vec<(u32, u32)> = placed
            .iter()
            .map(|f| {
                let p = f.placement.unwrap();
                (p.tile, p.worker)
            })
            .collect();
        coords.sort_unstable();
        assert_eq!(coords, vec![(0, 0), (1, 0), (2, 0), (3, 0)]);
        // everything fits on worker 0 => supervisor promotion
        assert!(placed.iter().all(|f| f.placement.unwrap().supervisor));
    }

    #[test]
    fn worker_spill_without_supervisor_promotion() {
        let (design, fibers) = ring(6);
        let cfg = cfg(3, 2, 3);
        let model = cfg.device_model();
        let parts = vec![PartitionResult {
            fibers,
            usable_tiles: 3,
        }];
        let placed = place_all(
            &design,
            parts,
            &model,
            &cfg,
            &GreedyPartitioner,
            &DumpCtx::disabled(),
        )
        .unwrap();
        let workers: Vec<u32> = placed.iter().map(|f| f.placement.unwrap().worker).collect();
        assert!(workers.iter().any(|&w| w == 1), "second worker used");
        assert!(placed.iter().all(|f| !f.placement.unwrap().supervisor));
    }

    #[test]
    fn multi_device_reserves_tile_zero() {
        let (design, fibers) = ring(6);
        // 2 devices of 4 tiles; one tile reserved per device.
        let cfg = cfg(8, 1, 4);
        let model = cfg.device_model();
        let mut parts = Vec::new();
        let mut iter = fibers.into_iter();
        let first: Vec<Fiber> = iter.by_ref().take(3).collect();
        let second: Vec<Fiber> = iter.collect();
        parts.push(PartitionResult {
            fibers: first,
            usable_tiles: 3,
        });
        parts.push(PartitionResult {
            fibers: second,
            usable_tiles: 3,
        });
        let placed = place_all(
            &design,
            parts,
            &model,
            &cfg,
            &GreedyPartitioner,
            &DumpCtx::disabled(),
        )
        .unwrap();
        assert_eq!(placed.len(), 6);
        // Tile 0 of device 0 never hosts a compute fiber.
        assert!(placed
            .iter()
            .all(|f| { f.placement.unwrap().tile != 0 }));
        // Both devices are in use.
        let devices: std::collections::HashSet<u32> =
            placed.iter().map(|f| f.placement.unwrap().device).collect();
        assert_eq!(devices.len(), 2);
    }

    #[test]
    fn initial_fiber_is_pinned() {
        let (design, mut fibers) = ring(3);
        fibers.push(Fiber::initial(vec![]));
        let cfg = cfg(4, 1, 4);
        let model = cfg.device_model();
        let parts = vec![PartitionResult {
            fibers,
            usable_tiles: 4,
        }];
        let placed = place_all(
            &design,
            parts,
            &model,
            &cfg,
            &GreedyPartitioner,
            &DumpCtx::disabled(),
        )
        .unwrap();
        let init = placed
            .iter()
            .find(|f| f.class == FiberClass::Initial)
            .unwrap();
        let p = init.placement.unwrap();
        assert_eq!((p.device, p.tile, p.worker), (0, 0, 0));
    }

    #[test]
    fn fanout_buckets_are_monotone() {
        let mut last = 0;
        for fanout in [1usize, 2, 8, 9, 16, 17, 32, 33, 64, 65, 1000] {
            let cost = fanout_cost(0, fanout);
            assert!(cost >= last);
            last = cost;
        }
    }
}
