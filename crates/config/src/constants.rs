/// Default KV block capacity in tokens.
pub const DEFAULT_BLOCK_SIZE: usize = 16;
/// Default number of GPU KV blocks per instance.
pub const DEFAULT_TOTAL_KV_BLOCKS: usize = 8192;
/// Default per-step token budget for batch formation.
pub const DEFAULT_TOKEN_BUDGET: usize = 8192;
/// Default maximum running-batch size.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 256;
/// Prefills longer than this are chunked to the remaining token budget.
pub const DEFAULT_LONG_PREFILL_THRESHOLD: usize = 2048;
/// Default simulated-time ceiling (10 simulated minutes).
pub const DEFAULT_HORIZON_TICKS: u64 = 600_000_000;
/// Latency between a cluster arrival and its admission decision.
pub const DEFAULT_ADMISSION_LATENCY_TICKS: u64 = 10;
/// Latency between an admission decision and its routing decision.
pub const DEFAULT_ROUTING_LATENCY_TICKS: u64 = 20;
/// Latency between a routing decision and the request landing in the
/// instance's wait queue.
pub const DEFAULT_INJECT_LATENCY_TICKS: u64 = 10;
/// Default refresh interval for tier-3 routing signals (0 = synchronous).
pub const DEFAULT_SNAPSHOT_REFRESH_INTERVAL_TICKS: u64 = 0;
/// Default number of counterfactual candidates recorded per routing decision.
pub const DEFAULT_COUNTERFACTUAL_K: usize = 3;
/// Default capacity of the router-side per-instance prefix index, in block
/// hashes.
pub const DEFAULT_ROUTER_PREFIX_CAPACITY: usize = 4096;

/// Default blackbox step-time coefficients (base, per prefill token, per
/// decode token), in microseconds. Fitted on Llama-3-8B @ H100, TP1.
pub const DEFAULT_BETA: [f64; 3] = [6910.42, 17.67, 2.84];
/// Default blackbox queueing coefficients (base, per input token,
/// per output token), in microseconds.
pub const DEFAULT_ALPHA: [f64; 3] = [100.0, 1.0, 100.0];

/// Causal-mask discount applied to prefill attention FLOPs. Calibrated on
/// H100 against vLLM step traces.
pub const CAUSAL_MASK_DISCOUNT: f64 = 1.8;
/// Achieved fraction of peak bandwidth for decode-phase KV reads.
pub const DECODE_KV_ACCESS_DISCOUNT: f64 = 0.80;
/// Achieved fraction of peak bandwidth for decode-phase activation traffic.
pub const DECODE_ACT_ACCESS_DISCOUNT: f64 = 0.75;
/// Achieved fraction of peak bandwidth for prefill-phase KV writes.
pub const PREFILL_KV_ACCESS_DISCOUNT: f64 = 0.92;
/// Achieved fraction of peak bandwidth for prefill-phase activation traffic.
pub const PREFILL_ACT_ACCESS_DISCOUNT: f64 = 0.85;
/// Smallest representable step duration; keeps the clock strictly advancing
/// whenever work exists.
pub const MIN_STEP_TICKS: u64 = 1;

/// Prefill roofline buckets are powers of two in this inclusive range.
pub const PREFILL_BUCKET_MIN: usize = 512;
pub const PREFILL_BUCKET_MAX: usize = 65_536;
