use blis_types::{InstanceId, Ticks};
use std::collections::BTreeMap;

/// Read-only projection of one instance at routing time.
///
/// Signal freshness is tiered: `pending_requests` is always fresh (the
/// router mutates it under its own event), `queue_depth` and `batch_size`
/// are read when the snapshot is built, and the KV signals are refreshed
/// every `snapshot_refresh_interval` ticks (0 keeps them synchronous too).
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct RoutingSnapshot {
    pub queue_depth: usize,
    pub batch_size: usize,
    pub pending_requests: usize,
    pub kv_utilization: f64,
    pub free_blocks: usize,
    pub cache_hit_rate: f64,
}

impl RoutingSnapshot {
    /// Requests the instance is on the hook for, admitted or not yet
    /// landed.
    pub fn effective_load(&self) -> usize {
        self.queue_depth + self.batch_size + self.pending_requests
    }
}

/// Everything a routing policy sees when deciding.
#[derive(Clone, Debug)]
pub struct RouterState {
    pub snapshots: BTreeMap<InstanceId, RoutingSnapshot>,
    pub clock: Ticks,
}
