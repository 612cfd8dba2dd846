use super::snapshot::RouterState;
use crate::request::Request;
use blis_types::InstanceId;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};

/// A composable routing signal. Scores are clamped to `[0, 1]` by the
/// weighted pipeline; stateful scorers learn from decisions through
/// `observe`, which runs synchronously after every pick.
pub trait Scorer {
    fn name(&self) -> &'static str;
    fn score(&self, request: &Request, state: &RouterState) -> BTreeMap<InstanceId, f64>;
    fn observe(&mut self, _request: &Request, _chosen: InstanceId) {}
}

/// Bounded router-side LRU of block hashes per instance. This is the
/// router's belief about what each instance has cached, maintained purely
/// from its own decisions; it never reads instance state.
#[derive(Debug)]
pub struct PrefixIndex {
    capacity: usize,
    per_instance: BTreeMap<InstanceId, LruSet>,
}

#[derive(Debug, Default)]
struct LruSet {
    stamps: FxHashMap<u64, u64>,
    order: BTreeSet<(u64, u64)>,
    clock: u64,
}

impl LruSet {
    fn insert(&mut self, hash: u64, capacity: usize) {
        self.clock += 1;
        if let Some(old) = self.stamps.insert(hash, self.clock) {
            self.order.remove(&(old, hash));
        }
        self.order.insert((self.clock, hash));
        while self.stamps.len() > capacity {
            let (stamp, hash) = *self.order.iter().next().expect("len > capacity");
            self.order.remove(&(stamp, hash));
            self.stamps.remove(&hash);
        }
    }

    fn contains(&self, hash: u64) -> bool {
        self.stamps.contains_key(&hash)
    }
}

impl PrefixIndex {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            per_instance: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, instance: InstanceId, hashes: &[u64]) {
        let set = self.per_instance.entry(instance).or_default();
        for hash in hashes {
            set.insert(*hash, self.capacity);
        }
    }

    /// Whether `instance`'s index holds `hash`.
    pub fn contains(&self, instance: InstanceId, hash: u64) -> bool {
        self.per_instance
            .get(&instance)
            .is_some_and(|set| set.contains(hash))
    }

    /// Fraction of `hashes` believed cached on `instance`.
    pub fn hit_fraction(&self, instance: InstanceId, hashes: &[u64]) -> f64 {
        if hashes.is_empty() {
            return 0.0;
        }
        let Some(set) = self.per_instance.get(&instance) else {
            return 0.0;
        };
        let matched = hashes.iter().filter(|hash| set.contains(**hash)).count();
        matched as f64 / hashes.len() as f64
    }
}

/// Score = fraction of the request's block hashes in the target's
/// router-side prefix index. Stateful: every decision teaches the index.
pub struct PrefixAffinityScorer {
    index: PrefixIndex,
}

impl PrefixAffinityScorer {
    pub fn new(capacity: usize) -> Self {
        Self {
            index: PrefixIndex::new(capacity),
        }
    }
}

impl Scorer for PrefixAffinityScorer {
    fn name(&self) -> &'static str {
        "prefix-affinity"
    }

    fn score(&self, request: &Request, state: &RouterState) -> BTreeMap<InstanceId, f64> {
        state
            .snapshots
            .keys()
            .map(|&id| (id, self.index.hit_fraction(id, &request.block_hashes)))
            .collect()
    }

    fn observe(&mut self, request: &Request, chosen: InstanceId) {
        self.index.record(chosen, &request.block_hashes);
    }
}

/// Min-max normalized queue depth: the least-loaded instance scores 1, the
/// most-loaded 0, and uniform load yields a uniform score.
pub struct QueueDepthScorer;

impl Scorer for QueueDepthScorer {
    fn name(&self) -> &'static str {
        "queue-depth"
    }

    fn score(&self, _request: &Request, state: &RouterState) -> BTreeMap<InstanceId, f64> {
        let depths: Vec<usize> = state.snapshots.values().map(|s| s.queue_depth).collect();
        let (min, max) = match (depths.iter().min(), depths.iter().max()) {
            (Some(&min), Some(&max)) => (min, max),
            _ => return BTreeMap::new(),
        };
        state
            .snapshots
            .iter()
            .map(|(&id, snapshot)| {
                let score = if max == min {
                    1.0
                } else {
                    (max - snapshot.queue_depth) as f64 / (max - min) as f64
                };
                (id, score)
            })
            .collect()
    }
}

/// `1 − kv_utilization`: headroom in the target's KV cache.
pub struct KvUtilizationScorer;

impl Scorer for KvUtilizationScorer {
    fn name(&self) -> &'static str {
        "kv-utilization"
    }

    fn score(&self, _request: &Request, state: &RouterState) -> BTreeMap<InstanceId, f64> {
        state
            .snapshots
            .iter()
            .map(|(&id, snapshot)| (id, 1.0 - snapshot.kv_utilization))
            .collect()
    }
}

/// `1 / (1 + effective_load)`.
pub struct LoadBalanceScorer;

impl Scorer for LoadBalanceScorer {
    fn name(&self) -> &'static str {
        "load-balance"
    }

    fn score(&self, _request: &Request, state: &RouterState) -> BTreeMap<InstanceId, f64> {
        state
            .snapshots
            .iter()
            .map(|(&id, snapshot)| (id, 1.0 / (1.0 + snapshot.effective_load() as f64)))
            .collect()
    }
}
