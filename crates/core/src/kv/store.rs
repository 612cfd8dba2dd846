use super::block::{BlockHash, BlockMeta, Tier};
use super::{AllocError, KvStats};
use blis_types::RequestId;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

pub type BlockId = u32;

/// Planned outcome of one allocation call. Computed without mutating the
/// store, then applied by [`BlockStore::commit`]; a failed plan therefore
/// leaves no trace (allocation is transactional).
#[derive(Debug)]
pub struct AllocPlan {
    /// Cached blocks to pin, in block order.
    reuse: Vec<BlockId>,
    /// Hashes needing a fresh block, in block order.
    fresh: Vec<BlockHash>,
}

/// One tier of reference-counted KV blocks with an interning hash index and
/// deterministic LRU eviction.
///
/// Blocks live in one of three populations: blank (never used, or reset),
/// cached-but-unpinned (`ref_count == 0`, still in the hash index, eligible
/// for reuse on hit and for eviction), and pinned (`ref_count > 0`, owned by
/// at least one request, never evicted). Releasing a request moves its
/// blocks to the cached population; their content survives until the slot
/// is actually reclaimed.
#[derive(Debug)]
pub struct BlockStore {
    tier: Tier,
    block_size: usize,
    blocks: Vec<BlockMeta>,
    /// Blank blocks in id order.
    free: VecDeque<BlockId>,
    /// Unpinned cached blocks ordered by `(lru_stamp, id)`; the first entry
    /// is the next eviction victim.
    evictable: BTreeSet<(u64, BlockId)>,
    index: FxHashMap<BlockHash, BlockId>,
    per_request: BTreeMap<RequestId, Vec<BlockId>>,
    lru_clock: u64,
    stats: KvStats,
}

impl BlockStore {
    pub fn new(tier: Tier, total_blocks: usize, block_size: usize) -> Self {
        Self {
            tier,
            block_size,
            blocks: vec![BlockMeta::blank(tier); total_blocks],
            free: (0..total_blocks as BlockId).collect(),
            evictable: BTreeSet::new(),
            index: FxHashMap::default(),
            per_request: BTreeMap::new(),
            lru_clock: 0,
            stats: KvStats::default(),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn total_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Blocks not pinned by any request (blank or cached-unpinned).
    pub fn free_blocks(&self) -> usize {
        self.free.len() + self.evictable.len()
    }

    /// Blocks pinned by at least one request.
    pub fn used_blocks(&self) -> usize {
        self.total_blocks() - self.free_blocks()
    }

    pub fn utilization(&self) -> f64 {
        if self.blocks.is_empty() {
            return 0.0;
        }
        self.used_blocks() as f64 / self.total_blocks() as f64
    }

    pub fn stats(&self) -> KvStats {
        self.stats
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.stats.hits + self.stats.misses;
        if total == 0 {
            return 0.0;
        }
        self.stats.hits as f64 / total as f64
    }

    pub fn contains(&self, hash: BlockHash) -> bool {
        self.index.contains_key(&hash)
    }

    /// Whether the cached block for `hash` is currently pinned by some
    /// request. False when the hash is not cached at all.
    pub fn is_pinned(&self, hash: BlockHash) -> bool {
        self.index
            .get(&hash)
            .is_some_and(|&id| self.blocks[id as usize].ref_count > 0)
    }

    /// Length of the longest cached prefix of `hashes`. Pure: no counters,
    /// no LRU touches.
    pub fn lookup(&self, hashes: &[BlockHash]) -> usize {
        hashes
            .iter()
            .take_while(|hash| self.index.contains_key(hash))
            .count()
    }

    pub fn held(&self, request: RequestId) -> usize {
        self.per_request.get(&request).map_or(0, Vec::len)
    }

    /// Plan pinning `needed` additional blocks for `request`. Pure; returns
    /// `Exhausted` without side effects when the blocks cannot all be
    /// provided.
    pub fn plan(&self, needed: &[BlockHash]) -> Result<AllocPlan, AllocError> {
        let mut reuse = Vec::new();
        let mut fresh = Vec::new();
        let mut resurrected = 0usize;
        for hash in needed {
            match self.index.get(hash) {
                Some(&id) => {
                    if self.blocks[id as usize].ref_count == 0 {
                        resurrected += 1;
                    }
                    reuse.push(id);
                }
                None => fresh.push(*hash),
            }
        }
        // Unpinned cached blocks we are about to pin cannot double as
        // eviction victims in the same call.
        let available = self.free.len() + self.evictable.len() - resurrected;
        if fresh.len() > available {
            return Err(AllocError::Exhausted);
        }
        Ok(AllocPlan { reuse, fresh })
    }

    /// Apply a plan produced by [`Self::plan`] against the unchanged store.
    pub fn commit(&mut self, request: RequestId, plan: AllocPlan) {
        // Pin reused blocks first so fresh allocation cannot evict them.
        for id in &plan.reuse {
            self.pin_existing(*id);
        }
        self.stats.hits += plan.reuse.len() as u64;

        let mut assigned = Vec::with_capacity(plan.fresh.len());
        for hash in &plan.fresh {
            let id = self.take_blank_or_evict();
            let stamp = self.tick_lru();
            let meta = &mut self.blocks[id as usize];
            meta.hash = Some(*hash);
            meta.ref_count = 1;
            meta.in_use = true;
            meta.last_used = stamp;
            self.index.insert(*hash, id);
            assigned.push(id);
        }
        self.stats.misses += plan.fresh.len() as u64;

        let held = self.per_request.entry(request).or_default();
        held.extend(plan.reuse);
        held.extend(assigned);
    }

    /// Release every block `request` holds. Blocks whose ref count reaches
    /// zero become eviction candidates but keep their content in the index.
    pub fn release(&mut self, request: RequestId) {
        let Some(held) = self.per_request.remove(&request) else {
            return;
        };
        for id in held {
            let meta = &mut self.blocks[id as usize];
            debug_assert!(meta.ref_count > 0, "release of unpinned block {id}");
            meta.ref_count -= 1;
            if meta.ref_count == 0 {
                meta.in_use = false;
                self.evictable.insert((meta.last_used, id));
            }
        }
    }

    /// Drop a cached, unpinned block's content outright, returning its slot
    /// to the blank pool. Used by the tiered cache when promoting a block
    /// out of this tier.
    pub fn forget(&mut self, hash: BlockHash) {
        let Some(id) = self.index.remove(&hash) else {
            return;
        };
        let meta = &mut self.blocks[id as usize];
        debug_assert_eq!(meta.ref_count, 0, "forget of pinned block {id}");
        self.evictable.remove(&(meta.last_used, id));
        *meta = BlockMeta::blank(self.tier);
        self.free.push_back(id);
    }

    fn pin_existing(&mut self, id: BlockId) {
        let stamp = self.tick_lru();
        let meta = &mut self.blocks[id as usize];
        if meta.ref_count == 0 {
            self.evictable.remove(&(meta.last_used, id));
        }
        meta.ref_count += 1;
        meta.in_use = true;
        meta.last_used = stamp;
    }

    fn take_blank_or_evict(&mut self) -> BlockId {
        if let Some(id) = self.free.pop_front() {
            return id;
        }
        let victim = *self
            .evictable
            .iter()
            .next()
            .expect("plan() guaranteed an eviction candidate");
        self.evictable.remove(&victim);
        let (_, id) = victim;
        let old_hash = self.blocks[id as usize]
            .hash
            .expect("evictable block must carry content");
        self.index.remove(&old_hash);
        self.stats.evictions += 1;
        id
    }

    fn tick_lru(&mut self) -> u64 {
        self.lru_clock += 1;
        self.lru_clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::block::input_block_hashes;

    fn store(total: usize) -> BlockStore {
        BlockStore::new(Tier::Gpu, total, 16)
    }

    fn hashes(n: usize, salt: u64) -> Vec<BlockHash> {
        let tokens: Vec<u64> = (0..n * 16).map(|t| t as u64 + salt * 1_000_000).collect();
        input_block_hashes(&tokens, 16)
    }

    fn allocate(store: &mut BlockStore, request: RequestId, needed: &[BlockHash]) {
        let plan = store.plan(needed).unwrap();
        store.commit(request, plan);
    }

    #[test]
    fn conservation_across_allocate_and_release() {
        let mut store = store(8);
        allocate(&mut store, RequestId(1), &hashes(5, 1));
        assert_eq!(store.used_blocks(), 5);
        assert_eq!(store.free_blocks(), 3);

        store.release(RequestId(1));
        assert_eq!(store.used_blocks(), 0);
        assert_eq!(store.free_blocks(), 8);
        // Content survives release: a second pass over the same hashes hits.
        assert_eq!(store.lookup(&hashes(5, 1)), 5);
    }

    #[test]
    fn prefix_sharing_bumps_ref_counts() {
        let mut store = store(8);
        let shared = hashes(4, 1);
        allocate(&mut store, RequestId(1), &shared);
        allocate(&mut store, RequestId(2), &shared);
        // Shared pins: still 4 distinct blocks in use.
        assert_eq!(store.used_blocks(), 4);
        assert_eq!(store.stats().hits, 4);
        assert_eq!(store.stats().misses, 4);

        store.release(RequestId(1));
        // Still pinned by request 2.
        assert_eq!(store.used_blocks(), 4);
        store.release(RequestId(2));
        assert_eq!(store.used_blocks(), 0);
    }

    #[test]
    fn failed_plan_leaves_no_trace() {
        let mut store = store(4);
        allocate(&mut store, RequestId(1), &hashes(4, 1));
        let stats_before = store.stats();

        // Everything is pinned: no candidate for the fifth block.
        let err = store.plan(&hashes(2, 2)).unwrap_err();
        assert_eq!(err, AllocError::Exhausted);
        assert_eq!(store.stats(), stats_before);
        assert_eq!(store.used_blocks(), 4);
        assert_eq!(store.lookup(&hashes(2, 2)), 0);
    }

    #[test]
    fn lru_evicts_coldest_unpinned_first() {
        let mut store = store(4);
        let cold = hashes(2, 1);
        let warm = hashes(2, 2);
        allocate(&mut store, RequestId(1), &cold);
        allocate(&mut store, RequestId(2), &warm);
        store.release(RequestId(1));
        store.release(RequestId(2));

        // Two fresh blocks must evict the two coldest (request 1's).
        allocate(&mut store, RequestId(3), &hashes(2, 3));
        assert_eq!(store.lookup(&cold), 0, "cold blocks evicted");
        assert_eq!(store.lookup(&warm), 2, "warm blocks survive");
        assert_eq!(store.stats().evictions, 2);
    }

    #[test]
    fn pinned_blocks_are_never_victims() {
        let mut store = store(4);
        allocate(&mut store, RequestId(1), &hashes(3, 1));
        allocate(&mut store, RequestId(2), &hashes(1, 2));
        store.release(RequestId(2));

        // One evictable block; asking for two fresh blocks must fail
        // rather than touch anything pinned.
        assert_eq!(store.plan(&hashes(2, 3)).unwrap_err(), AllocError::Exhausted);
        // Asking for one succeeds by evicting request 2's block.
        allocate(&mut store, RequestId(3), &hashes(1, 3));
        assert_eq!(store.lookup(&hashes(3, 1)), 3);
    }

    #[test]
    fn resurrected_blocks_cannot_be_their_own_victims() {
        let mut store = store(2);
        let shared = hashes(2, 1);
        allocate(&mut store, RequestId(1), &shared);
        store.release(RequestId(1));

        // Both blocks are unpinned and cached. Reusing both plus one fresh
        // block cannot fit: the reused pair is excluded from eviction.
        let mut wanted = shared.clone();
        wanted.extend(hashes(1, 2));
        assert_eq!(store.plan(&wanted).unwrap_err(), AllocError::Exhausted);

        // Reusing just the cached pair works and counts as hits.
        allocate(&mut store, RequestId(2), &shared);
        assert_eq!(store.stats().hits, 2);
    }
}
