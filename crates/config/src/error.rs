use std::path::PathBuf;

/// Startup-time configuration failures. Every variant renders as a
/// single-line diagnostic naming the offending field or file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown GPU '{0}'; known GPUs: {1}")]
    UnknownGpu(String, String),

    #[error("unknown model '{0}'; pass --model-config with a config.json")]
    UnknownModel(String),

    #[error("failed to read {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed JSON in {path}: {source}")]
    MalformedJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed YAML in {path}: {source}")]
    MalformedYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("model config field '{0}' is missing or zero")]
    MissingModelField(&'static str),

    #[error("unsupported dtype '{0}'")]
    UnsupportedDtype(String),

    #[error("latency coefficient '{name}' is not finite: {value}")]
    NonFiniteCoefficient { name: &'static str, value: f64 },

    #[error("tensor-parallel degree must be a positive power of two, got {0}")]
    InvalidTensorParallel(usize),

    #[error("'{0}' must be positive")]
    MustBePositive(&'static str),

    #[error("kv offload threshold must be in (0, 1], got {0}")]
    InvalidOffloadThreshold(f64),

    #[error("bench data directory {0} is required when roofline is enabled")]
    MissingBenchData(PathBuf),

    #[error("scorer spec '{0}' is not of the form name:weight")]
    MalformedScorerSpec(String),

    #[error("routing policy 'weighted' requires at least one scorer")]
    NoScorers,

    #[error("workload: {0}")]
    Workload(String),
}
