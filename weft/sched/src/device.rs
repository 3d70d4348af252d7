//! Multi-device capacity model and the device-level partition of fibers.
use crate::fiber::Fiber;
use crate::hypergraph::{Hypergraph, PartitionRequest, Partitioner};
use linked_hash_map::LinkedHashMap;
use weft_ir::{Design, SignalId};
use weft_utils::{DumpCtx, Error, WeftResult};

/// Shape of the accelerator system: a fixed 2-D grid of (tile, worker)
/// cores per device, possibly several devices.
#[derive(Clone, Copy, Debug)]
pub struct DeviceModel {
    /// Workers per tile.
    pub workers: u32,
    /// Tiles available across the whole system.
    pub avail_tiles: u32,
    /// Tiles in one physical device.
    pub tiles_per_device: u32,
}

impl DeviceModel {
    /// Devices needed to host the full requested grid.
    pub fn num_devices_needed(&self) -> u32 {
        self.num_devices_used(self.avail_tiles * self.workers)
    }

    /// Devices actually touched by `fiber_count` fibers.
    pub fn num_devices_used(&self, fiber_count: u32) -> u32 {
        let used = (self.avail_tiles * self.workers).min(fiber_count).max(1);
        (used - 1) / (self.tiles_per_device * self.workers) + 1
    }

    /// Tiles usable for computation; one tile per device is reserved for
    /// inter-device exchange bookkeeping once several devices are in play.
    pub fn usable_avail_tiles(&self) -> u32 {
        let devs = self.num_devices_needed();
        if devs == 1 {
            self.avail_tiles
        } else {
            self.avail_tiles - devs
        }
    }

    /// Usable tile budget per device. The last device may be only partially
    /// populated when the requested tile count does not fill it.
    pub fn usable_tiles_per_device(&self) -> Vec<u32> {
        let devs = self.num_devices_needed();
        if devs == 1 {
            return vec![self.avail_tiles];
        }
        assert!(
            self.tiles_per_device > 1,
            "multi-device layout needs at least 2 tiles per device"
        );
        let per_dev = self.tiles_per_device - 1;
        let mut last = self.usable_avail_tiles() % per_dev;
        if last == 0 {
            last = per_dev;
        }
        let mut usable = vec![per_dev; (devs - 1) as usize];
        usable.push(last);
        usable
    }

    /// Cores the merge stages aim for. With several devices the zeroth tile
    /// is kept free, so one tile is discounted.
    pub fn ways(&self) -> u32 {
        let tiles = if self.avail_tiles > self.tiles_per_device {
            self.avail_tiles - 1
        } else {
            self.avail_tiles
        };
        tiles * self.workers
    }

    /// Fiber capacity of one device.
    pub fn capacity(&self, device: usize) -> u32 {
        self.usable_tiles_per_device()[device] * self.workers
    }
}

/// Fibers assigned to one device plus the usable-tile bound the placer must
/// respect.
#[derive(Debug)]
pub struct PartitionResult {
    pub fibers: Vec<Fiber>,
    pub usable_tiles: u32,
}

/// Per-device target block weights: proportional to each device's usable
/// tile budget, ceil-scaled so the partitioner has a little slack.
fn fiber_count_per_device(model: &DeviceModel, num_fibers: usize) -> Vec<i64> {
    let devs = model.num_devices_used(num_fibers as u32);
    assert!(devs > 1, "single-device layout needs no block weights");
    let usable = model.usable_tiles_per_device();
    let budget: u32 = usable.iter().take(devs as usize).sum();
    let ratio = num_fibers as f64 / budget as f64;
    usable
        .iter()
        .take(devs as usize)
        .map(|&tiles| (tiles as f64 * ratio).ceil() as i64)
        .collect()
}

/// Partition fibers across devices, minimizing cross-device data volume.
///
/// Hyperedges are signals read by more than one fiber, weighted by word
/// count. Only runs when a single device cannot hold the target core
/// count; otherwise all fibers land on device 0.
pub fn partition_devices(
    design: &Design,
    fibers: Vec<Fiber>,
    model: &DeviceModel,
    partitioner: &dyn Partitioner,
    imbalance: f64,
    dump: &DumpCtx,
) -> WeftResult<Vec<PartitionResult>> {
    let num_fibers = fibers.len();
    let post_merge = (num_fibers as u32).min(model.avail_tiles * model.workers);
    if model.tiles_per_device * model.workers >= post_merge {
        log::info!("a single device is enough, skipping device partitioning");
        return Ok(vec![PartitionResult {
            fibers,
            usable_tiles: model.avail_tiles,
        }]);
    }

    // Hyperedge per committed signal: the producing fiber plus every fiber
    // with a definition point for it.
    struct Net {
        nodes: Vec<u32>,
    }
    let mut nets: LinkedHashMap<SignalId, Net> = LinkedHashMap::new();
    for (ix, fiber) in fibers.iter().enumerate() {
        let ix = ix as u32;
        for &sig in &fiber.commits {
            assert!(
                !nets.contains_key(&sig),
                "signal {} produced by two fibers",
                design.signals[sig].name
            );
            nets.insert(sig, Net { nodes: vec![ix] });
        }
    }
    // Second sweep for the readers, so definition points seen before the
    // committing fiber still land on the net.
    for (ix, fiber) in fibers.iter().enumerate() {
        let ix = ix as u32;
        for sig in fiber.def_signals() {
            if let Some(net) = nets.get_mut(&sig) {
                if !net.nodes.contains(&ix) {
                    net.nodes.push(ix);
                }
            }
        }
    }

    let mut hg = Hypergraph::with_nodes(vec![1; num_fibers]);
    for (&sig, net) in nets.iter() {
        let mut nodes = net.nodes.clone();
        nodes.sort_unstable();
        hg.push_edge(&nodes, design.words(sig) as i64);
    }

    let block_weights = fiber_count_per_device(model, num_fibers);
    let devs = block_weights.len();
    log::info!(
        "partitioning {} fibers over {} devices ({} hyperedges)",
        num_fibers,
        devs,
        hg.num_edges()
    );
    dump.write(3, "device_partition.hmetis", &hg.to_hmetis());

    let partition = partitioner.partition(
        &hg,
        &PartitionRequest {
            k: devs as u32,
            imbalance,
            block_weights: Some(&block_weights),
        },
    )?;
    log::info!("device partition objective: {}", partition.objective);

    let mut per_device: Vec<Vec<Fiber>> = (0..devs).map(|_| Vec::new()).collect();
    let mut overflow: Vec<Fiber> = Vec::new();
    let assignment = partition.assignment;
    for (fiber, dev) in fibers.into_iter().zip(assignment.into_iter()) {
        let dev = dev as usize;
        if per_device[dev].len() < model.capacity(dev) as usize {
            per_device[dev].push(fiber);
        } else {
            log::warn!("device {} over capacity, spilling a fiber", dev);
            overflow.push(fiber);
        }
    }
    'spill: for fiber in overflow {
        for dev in 0..devs {
            if per_device[dev].len() < model.capacity(dev) as usize {
                per_device[dev].push(fiber);
                continue 'spill;
            }
        }
        return Err(Error::resource_exhausted(
            "no device has room for a spilled fiber",
        ));
    }

    let usable = model.usable_tiles_per_device();
    Ok(per_device
        .into_iter()
        .enumerate()
        .map(|(dev, fibers)| PartitionResult {
            fibers,
            usable_tiles: usable[dev],
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypergraph::GreedyPartitioner;
    use crate::test_util::*;
    use weft_utils::DumpCtx;

    fn chain_fibers(n: usize) -> (weft_ir::Design, Vec<Fiber>) {
        let mut design = weft_ir::Design::new();
        let sigs: Vec<_> = (0..n)
            .map(|i| signal(&mut design, &format!("r{}", i), 1))
            .collect();
        let region: Vec<_> = (0..n)
            .map(|i| clocked(&mut design, [sigs[i]], [sigs[(i + 1) % n]], 4))
            .collect();
        let graph = crate::dep_graph::build(&design, &region).unwrap();
        let fibers = crate::dep_graph::split_fibers(&design, &graph);
        (design, fibers)
    }

    #[test]
    fn single_device_passthrough() {
        let (design, fibers) = chain_fibers(4);
        let model = DeviceModel {
            workers: 1,
            avail_tiles: 8,
            tiles_per_device: 8,
        };
        let parts = partition_devices(
            &design,
            fibers,
            &model,
            &GreedyPartitioner,
            0.03,
            &DumpCtx::disabled(),
        )
        .unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].usable_tiles, 8);
        assert_eq!(parts[0].fibers.len(), 4);
    }

    #[test]
    fn respects_device_capacity() {
        let (design, fibers) = chain_fibers(6);
        // 2 devices of 4 tiles each, one tile per device reserved.
        let model = DeviceModel {
            workers: 1,
            avail_tiles: 8,
            tiles_per_device: 4,
        };
        let parts = partition_devices(
            &design,
            fibers,
            &model,
            &GreedyPartitioner,
            0.03,
            &DumpCtx::disabled(),
        )
        .unwrap();
        assert_eq!(parts.len(), 2);
        for (dev, part) in parts.iter().enumerate() {
            assert!(
                part.fibers.len() <= model.capacity(dev) as usize,
                "device {} over its usable budget",
                dev
            );
        }
        let total: usize = parts.iter().map(|p| p.fibers.len()).sum();
        assert_eq!(total, 6);
    }

    #[test]
    fn usable_tiles_reserves_exchange_tile() {
        let model = DeviceModel {
            workers: 2,
            avail_tiles: 8,
            tiles_per_device: 4,
        };
        // 2 devices, 1 tile reserved each: 6 usable, split 3 + 3.
        assert_eq!(model.usable_tiles_per_device(), vec![3, 3]);
        assert_eq!(model.usable_avail_tiles(), 6);
    }
}
