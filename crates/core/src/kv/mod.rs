//! KV-cache state machine: block-granular allocation with reference-counted
//! prefix sharing, LRU eviction and an optional CPU overflow tier.

pub mod block;
mod store;
mod tiered;

pub use self::block::{
    chain_hash, decode_block_hash, input_block_hashes, target_hashes, BlockHash, BlockMeta, Tier,
};
pub use self::store::{AllocPlan, BlockId, BlockStore};
pub use self::tiered::TieredKvCache;

use blis_config::{KvTierConfig, SimulationConfig};
use blis_types::{RequestId, Ticks};
use serde::Serialize;

/// Why an allocation failed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    /// No free block and no evictable candidate; the caller may preempt and
    /// retry.
    #[error("kv blocks exhausted")]
    Exhausted,
    /// The request's footprint alone exceeds cache capacity; retrying can
    /// only evict-loop. The request must be dropped.
    #[error("request footprint exceeds kv cache capacity")]
    OverCapacity,
}

/// Counters every cache variant reports.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct KvStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Fresh blocks spilled to the CPU tier.
    pub offloads: u64,
    /// CPU-resident blocks promoted back to GPU on hit.
    pub promotions: u64,
}

/// Uniform interface over the single-tier and tiered caches.
///
/// `target` is always the request's complete block-hash list covering its KV
/// footprint after the step being planned; implementations diff it against
/// the blocks the request already holds.
pub trait KvCache {
    fn block_size(&self) -> usize;
    fn total_blocks(&self) -> usize;

    /// Longest cached prefix, in blocks. Pure query.
    fn lookup(&self, hashes: &[BlockHash]) -> usize;

    /// Transactionally pin every block of `target` the request does not
    /// hold yet. On error the cache is exactly as it was before the call.
    fn allocate(&mut self, request: RequestId, target: &[BlockHash]) -> Result<(), AllocError>;

    /// Unpin all blocks held by `request`.
    fn release(&mut self, request: RequestId);

    fn held(&self, request: RequestId) -> usize;
    fn free_blocks(&self) -> usize;
    fn used_blocks(&self) -> usize;
    /// GPU-tier utilization in `[0, 1]`.
    fn utilization(&self) -> f64;
    fn hit_rate(&self) -> f64;
    fn stats(&self) -> KvStats;

    /// Accumulated CPU→GPU transfer latency owed by this cache, reset on
    /// read. Charged by the instance against its next step.
    fn take_transfer_debt(&mut self) -> Ticks {
        0
    }
}

/// Plain single-tier GPU cache.
#[derive(Debug)]
pub struct GpuKvCache {
    store: BlockStore,
}

impl GpuKvCache {
    pub fn new(total_blocks: usize, block_size: usize) -> Self {
        Self {
            store: BlockStore::new(Tier::Gpu, total_blocks, block_size),
        }
    }
}

impl KvCache for GpuKvCache {
    fn block_size(&self) -> usize {
        self.store.block_size()
    }

    fn total_blocks(&self) -> usize {
        self.store.total_blocks()
    }

    fn lookup(&self, hashes: &[BlockHash]) -> usize {
        self.store.lookup(hashes)
    }

    fn allocate(&mut self, request: RequestId, target: &[BlockHash]) -> Result<(), AllocError> {
        if target.len() > self.store.total_blocks() {
            return Err(AllocError::OverCapacity);
        }
        let held = self.store.held(request);
        if target.len() <= held {
            return Ok(());
        }
        let plan = self.store.plan(&target[held..])?;
        self.store.commit(request, plan);
        Ok(())
    }

    fn release(&mut self, request: RequestId) {
        self.store.release(request);
    }

    fn held(&self, request: RequestId) -> usize {
        self.store.held(request)
    }

    fn free_blocks(&self) -> usize {
        self.store.free_blocks()
    }

    fn used_blocks(&self) -> usize {
        self.store.used_blocks()
    }

    fn utilization(&self) -> f64 {
        self.store.utilization()
    }

    fn hit_rate(&self) -> f64 {
        self.store.hit_rate()
    }

    fn stats(&self) -> KvStats {
        self.store.stats()
    }
}

/// Build the cache variant the configuration asks for. `block_bytes` is the
/// KV size of one block, used to convert promoted-block transfers into step
/// latency.
pub fn build_kv_cache(config: &SimulationConfig, block_bytes: usize) -> Box<dyn KvCache> {
    match &config.kv_tier {
        Some(tier) => Box::new(TieredKvCache::new(
            config.total_kv_blocks,
            config.block_size,
            *tier,
            block_bytes,
        )),
        None => Box::new(GpuKvCache::new(config.total_kv_blocks, config.block_size)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_tier_over_capacity_is_distinct() {
        let mut cache = GpuKvCache::new(4, 16);
        let hashes: Vec<BlockHash> = (0..5).map(|i| chain_hash(i, &[i])).collect();
        assert_eq!(
            cache.allocate(RequestId(1), &hashes),
            Err(AllocError::OverCapacity)
        );
        // Nothing was pinned by the failed call.
        assert_eq!(cache.used_blocks(), 0);
    }

    #[test]
    fn tiered_factory_selection() {
        let mut config = SimulationConfig::default();
        assert_eq!(build_kv_cache(&config, 1).total_blocks(), config.total_kv_blocks);
        config.kv_tier = Some(KvTierConfig {
            cpu_blocks: 128,
            offload_threshold: 0.9,
            transfer_bandwidth: 64e9,
        });
        assert_eq!(
            build_kv_cache(&config, 1).total_blocks(),
            config.total_kv_blocks + 128
        );
    }
}
