use crate::constants::*;
use crate::{
    AdmissionKind, ArrivalSpec, ClientSpec, ConfigError, LengthSpec, PriorityKind, RoutingKind,
    ScorerSpec, WorkloadSpec,
};
use blis_types::{SloClass, Ticks};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use strum_macros::{Display, EnumString};

/// What the run prints.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
    ValueEnum,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum OutputFormat {
    Jsonl,
    Summary,
    #[default]
    Both,
}

/// How much the decision recorder captures.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
    EnumString, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum TraceLevel {
    #[default]
    Off,
    /// Admission and routing decisions, with counterfactual candidates.
    Decisions,
    /// Decisions plus request lifecycle transitions.
    Full,
}

/// Blackbox latency-model coefficients, all in microseconds.
///
/// `beta` is the step-time regression (base, per prefill token, per decode
/// token); `alpha` covers queueing (base, per input token) and the
/// per-output-token overhead.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LatencyCoefficients {
    pub alpha: [f64; 3],
    pub beta: [f64; 3],
}

impl Default for LatencyCoefficients {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            beta: DEFAULT_BETA,
        }
    }
}

impl LatencyCoefficients {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let named = [
            ("alpha0", self.alpha[0]),
            ("alpha1", self.alpha[1]),
            ("alpha2", self.alpha[2]),
            ("beta0", self.beta[0]),
            ("beta1", self.beta[1]),
            ("beta2", self.beta[2]),
        ];
        for (name, value) in named {
            if !value.is_finite() {
                return Err(ConfigError::NonFiniteCoefficient { name, value });
            }
        }
        Ok(())
    }
}

/// Optional CPU overflow tier for the KV cache.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KvTierConfig {
    /// CPU-side overflow capacity in blocks.
    pub cpu_blocks: usize,
    /// GPU utilization at or above which new blocks spill to CPU.
    pub offload_threshold: f64,
    /// PCIe/NVLink transfer bandwidth in bytes per second, charged as step
    /// latency when a CPU-resident block is promoted back on hit.
    pub transfer_bandwidth: f64,
}

impl KvTierConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.offload_threshold <= 0.0 || self.offload_threshold > 1.0 {
            return Err(ConfigError::InvalidOffloadThreshold(self.offload_threshold));
        }
        if self.cpu_blocks == 0 {
            return Err(ConfigError::MustBePositive("kv_cpu_blocks"));
        }
        if !(self.transfer_bandwidth > 0.0) {
            return Err(ConfigError::MustBePositive("kv_transfer_bandwidth"));
        }
        Ok(())
    }
}

/// Everything a run needs besides the model/hardware/MFU inputs, which the
/// driver resolves separately. YAML bundles deserialize into this struct;
/// explicit CLI flags override individual fields afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub seed: u64,
    /// Model identifier: a built-in catalog name unless
    /// `model_config_path` points at a HuggingFace `config.json`.
    pub model: String,
    pub model_config_path: Option<PathBuf>,
    /// GPU key into the hardware catalog.
    pub gpu: String,
    pub tensor_parallel: usize,
    pub num_instances: usize,

    pub total_kv_blocks: usize,
    pub block_size: usize,
    pub max_batch_size: usize,
    pub token_budget: usize,
    pub long_prefill_threshold: usize,
    pub horizon: Ticks,

    pub admission: AdmissionKind,
    pub token_bucket_capacity: f64,
    /// Bucket refill in tokens per simulated second.
    pub token_bucket_refill_rate: f64,

    pub routing: RoutingKind,
    pub routing_scorers: Vec<ScorerSpec>,
    pub router_prefix_capacity: usize,
    pub priority: PriorityKind,
    pub snapshot_refresh_interval: Ticks,

    pub trace_level: TraceLevel,
    pub counterfactual_k: usize,

    pub workload: WorkloadSpec,

    pub latency: LatencyCoefficients,
    pub roofline: bool,
    pub bench_data_path: Option<PathBuf>,

    pub kv_tier: Option<KvTierConfig>,

    pub admission_latency: Ticks,
    pub routing_latency: Ticks,
    pub inject_latency: Ticks,

    pub output: OutputFormat,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            model: "llama-3-8b".to_string(),
            model_config_path: None,
            gpu: "h100".to_string(),
            tensor_parallel: 1,
            num_instances: 1,
            total_kv_blocks: DEFAULT_TOTAL_KV_BLOCKS,
            block_size: DEFAULT_BLOCK_SIZE,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            token_budget: DEFAULT_TOKEN_BUDGET,
            long_prefill_threshold: DEFAULT_LONG_PREFILL_THRESHOLD,
            horizon: DEFAULT_HORIZON_TICKS,
            admission: AdmissionKind::Always,
            token_bucket_capacity: 500.0,
            token_bucket_refill_rate: 400.0,
            routing: RoutingKind::RoundRobin,
            routing_scorers: Vec::new(),
            router_prefix_capacity: DEFAULT_ROUTER_PREFIX_CAPACITY,
            priority: PriorityKind::Fcfs,
            snapshot_refresh_interval: DEFAULT_SNAPSHOT_REFRESH_INTERVAL_TICKS,
            trace_level: TraceLevel::Off,
            counterfactual_k: DEFAULT_COUNTERFACTUAL_K,
            workload: WorkloadSpec::Single(ClientSpec {
                name: "default".to_string(),
                tenant: None,
                slo_class: SloClass::Standard,
                arrival: ArrivalSpec::Poisson { rate: 50.0 },
                input_len: LengthSpec::Fixed { value: 512 },
                output_len: LengthSpec::Fixed { value: 512 },
                num_requests: 200,
                prefix: None,
            }),
            latency: LatencyCoefficients::default(),
            roofline: false,
            bench_data_path: None,
            kv_tier: None,
            admission_latency: DEFAULT_ADMISSION_LATENCY_TICKS,
            routing_latency: DEFAULT_ROUTING_LATENCY_TICKS,
            inject_latency: DEFAULT_INJECT_LATENCY_TICKS,
            output: OutputFormat::Both,
        }
    }
}

impl SimulationConfig {
    /// Fatal-at-startup validation; every failure is a single-line
    /// diagnostic naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.tensor_parallel.is_power_of_two() {
            return Err(ConfigError::InvalidTensorParallel(self.tensor_parallel));
        }
        if self.num_instances == 0 {
            return Err(ConfigError::MustBePositive("num_instances"));
        }
        if self.block_size == 0 {
            return Err(ConfigError::MustBePositive("block_size"));
        }
        if self.total_kv_blocks == 0 {
            return Err(ConfigError::MustBePositive("total_kv_blocks"));
        }
        if self.max_batch_size == 0 {
            return Err(ConfigError::MustBePositive("max_batch_size"));
        }
        if self.token_budget == 0 {
            return Err(ConfigError::MustBePositive("token_budget"));
        }
        if self.horizon == 0 {
            return Err(ConfigError::MustBePositive("horizon"));
        }
        if self.admission == AdmissionKind::TokenBucket {
            if !(self.token_bucket_capacity > 0.0) {
                return Err(ConfigError::MustBePositive("token_bucket_capacity"));
            }
            if !(self.token_bucket_refill_rate > 0.0) {
                return Err(ConfigError::MustBePositive("token_bucket_refill_rate"));
            }
        }
        if self.routing == RoutingKind::Weighted && self.routing_scorers.is_empty() {
            return Err(ConfigError::NoScorers);
        }
        if self.roofline && self.bench_data_path.is_none() {
            return Err(ConfigError::MissingBenchData(PathBuf::from("bench_data")));
        }
        self.latency.validate()?;
        if let Some(tier) = &self.kv_tier {
            tier.validate()?;
        }
        self.workload.validate()?;
        Ok(())
    }

    pub fn from_yaml_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::MalformedYaml {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        SimulationConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_bad_tensor_parallel() {
        let mut cfg = SimulationConfig::default();
        cfg.tensor_parallel = 3;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidTensorParallel(3))
        ));
    }

    #[test]
    fn roofline_requires_bench_data() {
        let mut cfg = SimulationConfig::default();
        cfg.roofline = true;
        assert!(matches!(cfg.validate(), Err(ConfigError::MissingBenchData(_))));
        cfg.bench_data_path = Some(PathBuf::from("bench_data"));
        cfg.validate().unwrap();
    }

    #[test]
    fn weighted_requires_scorers() {
        let mut cfg = SimulationConfig::default();
        cfg.routing = RoutingKind::Weighted;
        assert!(matches!(cfg.validate(), Err(ConfigError::NoScorers)));
        cfg.routing_scorers = vec!["queue-depth:1".parse().unwrap()];
        cfg.validate().unwrap();
    }

    #[test]
    fn nan_coefficient_is_fatal() {
        let mut cfg = SimulationConfig::default();
        cfg.latency.beta[1] = f64::NAN;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::NonFiniteCoefficient { name: "beta1", .. })
        ));
    }

    #[test]
    fn yaml_bundle_round_trips() {
        let cfg = SimulationConfig::default();
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let back: SimulationConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, cfg);
    }
}
