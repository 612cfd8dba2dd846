use blis_config::{
    AdmissionKind, ConfigError, OutputFormat, PriorityKind, RoutingKind, ScorerSpec,
    SimulationConfig, TraceLevel, WorkloadSpec,
};
use blis_types::LogLevel;
use clap::Parser;
use std::path::PathBuf;

/// Deterministic discrete-event simulator of an LLM inference cluster.
///
/// Flag precedence: explicit CLI flag > `--config` YAML bundle > built-in
/// default.
#[derive(Parser, Debug, Clone)]
#[command(name = "blis", version, about)]
pub struct Cli {
    /// YAML bundle of simulation defaults; individual flags override it.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Root RNG seed; identical seeds reproduce runs byte for byte.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Built-in model name (see --list-models), unless --model-config is given.
    #[arg(long)]
    pub model: Option<String>,

    /// HuggingFace-style config.json to simulate instead of a built-in model.
    #[arg(long, value_name = "FILE")]
    pub model_config: Option<PathBuf>,

    /// GPU key into the hardware catalog (a100, h100, h200, b200).
    #[arg(long)]
    pub gpu: Option<String>,

    /// Tensor-parallel degree per instance.
    #[arg(long, visible_alias = "tp")]
    pub tensor_parallel: Option<usize>,

    /// Number of serving replicas.
    #[arg(long)]
    pub num_instances: Option<usize>,

    #[arg(long, help_heading = "Scheduling")]
    pub total_kv_blocks: Option<usize>,
    #[arg(long, help_heading = "Scheduling")]
    pub block_size: Option<usize>,
    #[arg(long, help_heading = "Scheduling")]
    pub max_batch_size: Option<usize>,
    #[arg(long, help_heading = "Scheduling")]
    pub token_budget: Option<usize>,
    #[arg(long, help_heading = "Scheduling")]
    pub long_prefill_threshold: Option<usize>,
    /// Simulated-time ceiling in microseconds.
    #[arg(long, help_heading = "Scheduling")]
    pub horizon: Option<u64>,
    #[arg(long, value_enum, help_heading = "Scheduling")]
    pub priority: Option<PriorityKind>,

    #[arg(long, value_enum, help_heading = "Admission")]
    pub admission: Option<AdmissionKind>,
    #[arg(long, help_heading = "Admission")]
    pub token_bucket_capacity: Option<f64>,
    /// Bucket refill in tokens per simulated second.
    #[arg(long, help_heading = "Admission")]
    pub token_bucket_refill_rate: Option<f64>,

    #[arg(long, value_enum, help_heading = "Routing")]
    pub routing: Option<RoutingKind>,
    /// Comma-separated name:weight entries, e.g.
    /// prefix-affinity:3,queue-depth:2,kv-utilization:2.
    #[arg(long, value_delimiter = ',', help_heading = "Routing")]
    pub routing_scorers: Option<Vec<String>>,
    #[arg(long, help_heading = "Routing")]
    pub router_prefix_capacity: Option<usize>,
    /// Tier-3 snapshot refresh interval in microseconds (0 = synchronous).
    #[arg(long, help_heading = "Routing")]
    pub snapshot_refresh_interval: Option<u64>,

    #[arg(long, value_enum, help_heading = "Tracing")]
    pub trace_level: Option<TraceLevel>,
    /// Candidates recorded per routing decision.
    #[arg(long, help_heading = "Tracing")]
    pub counterfactual_k: Option<usize>,

    /// YAML workload spec (single client or multi-client).
    #[arg(long, value_name = "FILE", help_heading = "Workload")]
    pub workload: Option<PathBuf>,

    /// Blackbox queueing coefficients alpha0,alpha1,alpha2 (microseconds).
    #[arg(long, value_delimiter = ',', help_heading = "Latency model")]
    pub alpha: Option<Vec<f64>>,
    /// Blackbox step coefficients beta0,beta1,beta2 (microseconds).
    #[arg(long, value_delimiter = ',', help_heading = "Latency model")]
    pub beta: Option<Vec<f64>>,
    /// Use the analytical roofline model instead of the blackbox regression.
    #[arg(long, help_heading = "Latency model")]
    pub roofline: bool,
    /// Root of the MFU benchmark tables (bench_data/...).
    #[arg(long, value_name = "DIR", help_heading = "Latency model")]
    pub bench_data_path: Option<PathBuf>,

    /// CPU overflow blocks; enables the tiered KV cache.
    #[arg(long, help_heading = "KV cache")]
    pub kv_cpu_blocks: Option<usize>,
    #[arg(long, help_heading = "KV cache")]
    pub kv_offload_threshold: Option<f64>,
    /// CPU<->GPU transfer bandwidth in bytes per second.
    #[arg(long, help_heading = "KV cache")]
    pub kv_transfer_bandwidth: Option<f64>,

    #[arg(long, help_heading = "Pipeline latencies")]
    pub admission_latency: Option<u64>,
    #[arg(long, help_heading = "Pipeline latencies")]
    pub routing_latency: Option<u64>,
    #[arg(long, help_heading = "Pipeline latencies")]
    pub inject_latency: Option<u64>,

    /// What to print: jsonl records, the summary table, or both.
    #[arg(long, value_enum, help_heading = "Output")]
    pub output: Option<OutputFormat>,
    /// Write the aggregate report as JSON to this file.
    #[arg(long, value_name = "FILE", help_heading = "Output")]
    pub metrics_file: Option<PathBuf>,
    /// Write the trace summary as JSON to this file.
    #[arg(long, value_name = "FILE", help_heading = "Output")]
    pub trace_file: Option<PathBuf>,
    /// Append a fitness score to the summary.
    #[arg(long, help_heading = "Output")]
    pub fitness: bool,
    /// Fitness weights ttft,e2e,throughput.
    #[arg(long, value_delimiter = ',', num_args = 3, help_heading = "Output")]
    pub fitness_weights: Option<Vec<f64>>,
    /// Reference output-token rate for the throughput fitness term.
    #[arg(long, help_heading = "Output")]
    pub fitness_throughput_ref: Option<f64>,

    /// Suppress the human-facing stderr channel.
    #[arg(long)]
    pub silent: bool,
    #[arg(long, value_enum)]
    pub log_level: Option<LogLevel>,
}

macro_rules! overlay {
    ($config:expr, $cli:expr, $($field:ident),+ $(,)?) => {
        $(if let Some(value) = $cli.$field {
            $config.$field = value;
        })+
    };
}

impl Cli {
    /// Resolve the final [`SimulationConfig`]: YAML bundle first, explicit
    /// flags on top.
    pub fn into_simulation_config(self) -> Result<SimulationConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => SimulationConfig::from_yaml_file(path)?,
            None => SimulationConfig::default(),
        };

        overlay!(
            config,
            self,
            seed,
            model,
            gpu,
            tensor_parallel,
            num_instances,
            total_kv_blocks,
            block_size,
            max_batch_size,
            token_budget,
            long_prefill_threshold,
            horizon,
            priority,
            admission,
            token_bucket_capacity,
            token_bucket_refill_rate,
            routing,
            router_prefix_capacity,
            snapshot_refresh_interval,
            trace_level,
            counterfactual_k,
            admission_latency,
            routing_latency,
            inject_latency,
            output,
        );
        if let Some(path) = self.model_config {
            config.model_config_path = Some(path);
        }
        if let Some(scorers) = self.routing_scorers {
            config.routing_scorers = scorers
                .iter()
                .map(|entry| entry.parse::<ScorerSpec>())
                .collect::<Result<Vec<_>, _>>()?;
        }
        if let Some(alpha) = self.alpha {
            config.latency.alpha = [alpha[0], alpha[1], alpha[2]];
        }
        if let Some(beta) = self.beta {
            config.latency.beta = [beta[0], beta[1], beta[2]];
        }
        if self.roofline {
            config.roofline = true;
        }
        if let Some(path) = self.bench_data_path {
            config.bench_data_path = Some(path);
        }
        if let Some(cpu_blocks) = self.kv_cpu_blocks {
            let mut tier = config.kv_tier.unwrap_or(blis_config::KvTierConfig {
                cpu_blocks,
                offload_threshold: 0.95,
                transfer_bandwidth: 64e9,
            });
            tier.cpu_blocks = cpu_blocks;
            if let Some(threshold) = self.kv_offload_threshold {
                tier.offload_threshold = threshold;
            }
            if let Some(bandwidth) = self.kv_transfer_bandwidth {
                tier.transfer_bandwidth = bandwidth;
            }
            config.kv_tier = Some(tier);
        }
        if let Some(path) = self.workload {
            let raw =
                std::fs::read_to_string(&path).map_err(|source| ConfigError::FileRead {
                    path: path.clone(),
                    source,
                })?;
            config.workload = serde_yaml::from_str::<WorkloadSpec>(&raw).map_err(|source| {
                ConfigError::MalformedYaml {
                    path: path.clone(),
                    source,
                }
            })?;
        }
        Ok(config)
    }
}
