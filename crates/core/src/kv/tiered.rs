use super::block::{BlockHash, Tier};
use super::store::BlockStore;
use super::{AllocError, KvCache, KvStats};
use blis_config::KvTierConfig;
use blis_types::{RequestId, Ticks, TICKS_PER_SEC};

/// GPU tier with a CPU overflow tier behind it.
///
/// Fresh blocks spill to CPU once GPU utilization crosses the offload
/// threshold; a hit on a CPU-resident block promotes it back to GPU when a
/// slot can be found, charging the transfer time as latency debt the owning
/// instance consumes on its next step.
#[derive(Debug)]
pub struct TieredKvCache {
    gpu: BlockStore,
    cpu: BlockStore,
    offload_threshold: f64,
    /// Ticks of step latency charged per promoted block.
    transfer_ticks_per_block: Ticks,
    pending_transfer_debt: Ticks,
    offloads: u64,
    promotions: u64,
}

/// Placement of every block one allocation call needs, in block order.
/// Computed without mutating either tier so a capacity failure is free of
/// side effects.
#[derive(Debug, Default)]
struct Placement {
    gpu: Vec<BlockHash>,
    cpu: Vec<BlockHash>,
    /// Subset of `gpu` that currently lives in the CPU tier.
    promoted: Vec<BlockHash>,
}

impl TieredKvCache {
    pub fn new(
        gpu_blocks: usize,
        block_size: usize,
        config: KvTierConfig,
        block_bytes: usize,
    ) -> Self {
        let seconds_per_block = block_bytes as f64 / config.transfer_bandwidth;
        Self {
            gpu: BlockStore::new(Tier::Gpu, gpu_blocks, block_size),
            cpu: BlockStore::new(Tier::Cpu, config.cpu_blocks, block_size),
            offload_threshold: config.offload_threshold,
            transfer_ticks_per_block: (seconds_per_block * TICKS_PER_SEC as f64).ceil() as Ticks,
            pending_transfer_debt: 0,
            offloads: 0,
            promotions: 0,
        }
    }

    fn place(&self, needed: &[BlockHash]) -> Result<Placement, AllocError> {
        // Every block assigned to a tier consumes one unit of that tier's
        // unpinned pool, whether it is a fresh slot or a resurrected cached
        // block; blocks already pinned by another request consume nothing.
        let mut gpu_budget = self.gpu.free_blocks();
        let mut cpu_budget = self.cpu.free_blocks();
        let spill = self.gpu.utilization() >= self.offload_threshold;
        let mut placement = Placement::default();

        for &hash in needed {
            if self.gpu.contains(hash) {
                if !self.gpu.is_pinned(hash) {
                    if gpu_budget == 0 {
                        return Err(AllocError::Exhausted);
                    }
                    gpu_budget -= 1;
                }
                placement.gpu.push(hash);
            } else if self.cpu.contains(hash) {
                if !self.cpu.is_pinned(hash) && gpu_budget > 0 {
                    // Promote: the CPU slot frees up, the GPU slot fills.
                    gpu_budget -= 1;
                    cpu_budget += 1;
                    placement.promoted.push(hash);
                    placement.gpu.push(hash);
                } else {
                    if !self.cpu.is_pinned(hash) {
                        if cpu_budget == 0 {
                            return Err(AllocError::Exhausted);
                        }
                        cpu_budget -= 1;
                    }
                    placement.cpu.push(hash);
                }
            } else if spill && cpu_budget > 0 {
                cpu_budget -= 1;
                placement.cpu.push(hash);
            } else if gpu_budget > 0 {
                gpu_budget -= 1;
                placement.gpu.push(hash);
            } else if cpu_budget > 0 {
                cpu_budget -= 1;
                placement.cpu.push(hash);
            } else {
                return Err(AllocError::Exhausted);
            }
        }
        Ok(placement)
    }
}

impl KvCache for TieredKvCache {
    fn block_size(&self) -> usize {
        self.gpu.block_size()
    }

    fn total_blocks(&self) -> usize {
        self.gpu.total_blocks() + self.cpu.total_blocks()
    }

    fn lookup(&self, hashes: &[BlockHash]) -> usize {
        hashes
            .iter()
            .take_while(|hash| self.gpu.contains(**hash) || self.cpu.contains(**hash))
            .count()
    }

    fn allocate(&mut self, request: RequestId, target: &[BlockHash]) -> Result<(), AllocError> {
        if target.len() > self.total_blocks() {
            return Err(AllocError::OverCapacity);
        }
        let held = self.held(request);
        if target.len() <= held {
            return Ok(());
        }
        let placement = self.place(&target[held..])?;

        // Feasibility is settled; from here every step must succeed. The
        // promoted blocks leave the CPU tier before the GPU plan is drawn so
        // they land there as fresh slots.
        let offloaded = placement
            .cpu
            .iter()
            .filter(|hash| !self.cpu.contains(**hash))
            .count() as u64;
        for hash in &placement.promoted {
            self.cpu.forget(*hash);
        }
        let gpu_plan = self
            .gpu
            .plan(&placement.gpu)
            .expect("placement reserved gpu capacity");
        self.gpu.commit(request, gpu_plan);
        let cpu_plan = self
            .cpu
            .plan(&placement.cpu)
            .expect("placement reserved cpu capacity");
        self.cpu.commit(request, cpu_plan);

        self.offloads += offloaded;
        self.promotions += placement.promoted.len() as u64;
        self.pending_transfer_debt +=
            placement.promoted.len() as Ticks * self.transfer_ticks_per_block;
        Ok(())
    }

    fn release(&mut self, request: RequestId) {
        self.gpu.release(request);
        self.cpu.release(request);
    }

    fn held(&self, request: RequestId) -> usize {
        self.gpu.held(request) + self.cpu.held(request)
    }

    fn free_blocks(&self) -> usize {
        self.gpu.free_blocks() + self.cpu.free_blocks()
    }

    fn used_blocks(&self) -> usize {
        self.gpu.used_blocks() + self.cpu.used_blocks()
    }

    fn utilization(&self) -> f64 {
        // Routing and offload decisions key off GPU pressure.
        self.gpu.utilization()
    }

    fn hit_rate(&self) -> f64 {
        let stats = self.stats();
        let total = stats.hits + stats.misses;
        if total == 0 {
            return 0.0;
        }
        stats.hits as f64 / total as f64
    }

    fn stats(&self) -> KvStats {
        let gpu = self.gpu.stats();
        let cpu = self.cpu.stats();
        // A promoted block re-enters the GPU tier through the fresh path and
        // is recorded there as a miss; semantically it was a hit.
        KvStats {
            hits: gpu.hits + cpu.hits + self.promotions,
            misses: gpu.misses + cpu.misses - self.promotions,
            evictions: gpu.evictions + cpu.evictions,
            offloads: self.offloads,
            promotions: self.promotions,
        }
    }

    fn take_transfer_debt(&mut self) -> Ticks {
        std::mem::take(&mut self.pending_transfer_debt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::block::input_block_hashes;

    fn tiered(gpu_blocks: usize, cpu_blocks: usize, threshold: f64) -> TieredKvCache {
        TieredKvCache::new(
            gpu_blocks,
            16,
            KvTierConfig {
                cpu_blocks,
                offload_threshold: threshold,
                transfer_bandwidth: 64e9,
            },
            // One block transfers in 1 µs at 64 GB/s.
            64_000,
        )
    }

    fn hashes(n: usize, salt: u64) -> Vec<BlockHash> {
        let tokens: Vec<u64> = (0..n * 16).map(|t| t as u64 + salt * 1_000_000).collect();
        input_block_hashes(&tokens, 16)
    }

    #[test]
    fn spills_to_cpu_past_threshold() {
        let mut cache = tiered(4, 4, 0.5);
        cache.allocate(RequestId(1), &hashes(2, 1)).unwrap();
        assert_eq!(cache.stats().offloads, 0);

        // GPU now at 50% utilization: new blocks overflow to CPU.
        cache.allocate(RequestId(2), &hashes(2, 2)).unwrap();
        assert_eq!(cache.stats().offloads, 2);
        assert_eq!(cache.used_blocks(), 4);
    }

    #[test]
    fn promotion_charges_transfer_debt() {
        let mut cache = tiered(4, 4, 0.5);
        cache.allocate(RequestId(1), &hashes(2, 1)).unwrap();
        let spilled = hashes(2, 2);
        cache.allocate(RequestId(2), &spilled).unwrap();
        // Free both so the spilled blocks become promotable and GPU has room.
        cache.release(RequestId(1));
        cache.release(RequestId(2));

        cache.allocate(RequestId(3), &spilled).unwrap();
        let stats = cache.stats();
        assert_eq!(stats.promotions, 2);
        assert_eq!(cache.take_transfer_debt(), 2);
        // Debt resets on read.
        assert_eq!(cache.take_transfer_debt(), 0);
    }

    #[test]
    fn capacity_failure_is_side_effect_free() {
        let mut cache = tiered(2, 2, 1.0);
        cache.allocate(RequestId(1), &hashes(4, 1)).unwrap();
        let before = cache.stats();
        assert_eq!(
            cache.allocate(RequestId(2), &hashes(1, 2)),
            Err(AllocError::Exhausted)
        );
        assert_eq!(cache.stats(), before);
        assert_eq!(cache.held(RequestId(2)), 0);
    }

    #[test]
    fn footprint_beyond_both_tiers_is_over_capacity() {
        let mut cache = tiered(2, 2, 1.0);
        assert_eq!(
            cache.allocate(RequestId(1), &hashes(5, 1)),
            Err(AllocError::OverCapacity)
        );
    }
}
