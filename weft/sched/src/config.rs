use crate::device::DeviceModel;

/// How the greedy merger trades balance for core count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Never let the worst-case fiber cost grow past the pass-start worst
    /// case (scaled by [`SchedConfig::merge_threshold`]); may leave more
    /// fibers than cores for a later forced pass to clean up.
    Conservative,
    /// Reach the target core count even if the worst case grows.
    Forced,
    /// Longest-processing-time-first bin packing, oblivious to
    /// communication. Useful as a baseline.
    Lpt,
}

/// Knobs for the whole scheduling pipeline. Mirrors what the driver exposes
/// on the command line.
#[derive(Clone, Debug)]
pub struct SchedConfig {
    /// Total tiles requested, possibly spanning several devices.
    pub tiles: u32,
    /// Workers per tile.
    pub workers: u32,
    /// Tiles in one physical device.
    pub tiles_per_device: u32,
    pub merge_strategy: MergeStrategy,
    /// Fraction of the pass-start worst case the conservative merger may
    /// fill up to.
    pub merge_threshold: f64,
    /// Imbalance tolerance handed to the hypergraph partitioner.
    pub imbalance: f64,
    /// Per-core memory bound in words; merges that would exceed it are
    /// rejected.
    pub max_mem_words: u32,
    /// Fiber-count ratio above which the hypergraph merger takes over from
    /// the greedy one.
    pub hyper_merge_factor: u32,
    pub retime: bool,
    pub resync: bool,
    /// Fibers cheaper than this fraction of the most expensive one are not
    /// considered for resynchronization.
    pub resync_threshold: f64,
    /// Run the second placement partition that minimizes inter-device
    /// traffic.
    pub inter_device_comm: bool,
    /// Promote fibers to supervisor mode when every tile uses one worker.
    pub supervisor: bool,
}

impl Default for SchedConfig {
    fn default() -> Self {
        SchedConfig {
            tiles: 1,
            workers: 1,
            tiles_per_device: 1472,
            merge_strategy: MergeStrategy::Conservative,
            merge_threshold: 1.0,
            imbalance: 0.03,
            max_mem_words: 1 << 16,
            hyper_merge_factor: 2,
            retime: false,
            resync: false,
            resync_threshold: 0.5,
            inter_device_comm: true,
            supervisor: true,
        }
    }
}

impl SchedConfig {
    pub fn device_model(&self) -> DeviceModel {
        DeviceModel {
            workers: self.workers,
            avail_tiles: self.tiles,
            tiles_per_device: self.tiles_per_device,
        }
    }

    /// Number of cores the merge stages aim for.
    pub fn target_cores(&self) -> u32 {
        self.device_model().ways()
    }
}
