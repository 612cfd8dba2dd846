use crate::ConfigError;
use blis_types::SloClass;
use serde::{Deserialize, Serialize};

/// Inter-arrival time process for one client stream. Rates are requests per
/// simulated second.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ArrivalSpec {
    /// Deterministic arrivals every `1/rate` seconds.
    FixedRate { rate: f64 },
    /// Exponential inter-arrival gaps.
    Poisson { rate: f64 },
    /// Gamma-distributed gaps; `rate` is the gamma rate parameter (1/scale),
    /// so burstiness grows as `shape` shrinks below 1.
    Gamma { shape: f64, rate: f64 },
    /// Weibull-distributed gaps in seconds.
    Weibull { shape: f64, scale: f64 },
}

impl ArrivalSpec {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ok = match self {
            ArrivalSpec::FixedRate { rate } | ArrivalSpec::Poisson { rate } => *rate > 0.0,
            ArrivalSpec::Gamma { shape, rate } => *shape > 0.0 && *rate > 0.0,
            ArrivalSpec::Weibull { shape, scale } => *shape > 0.0 && *scale > 0.0,
        };
        if ok {
            Ok(())
        } else {
            Err(ConfigError::Workload("arrival parameters must be positive".into()))
        }
    }
}

/// Token-count distribution for input or output lengths. Samples are clamped
/// to at least one token.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum LengthSpec {
    Fixed { value: usize },
    Uniform { min: usize, max: usize },
    Normal { mean: f64, std_dev: f64 },
    LogNormal { mu: f64, sigma: f64 },
}

impl LengthSpec {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ok = match self {
            LengthSpec::Fixed { value } => *value > 0,
            LengthSpec::Uniform { min, max } => *min > 0 && max >= min,
            LengthSpec::Normal { mean, std_dev } => *mean > 0.0 && *std_dev >= 0.0,
            LengthSpec::LogNormal { mu, sigma } => mu.is_finite() && *sigma >= 0.0,
        };
        if ok {
            Ok(())
        } else {
            Err(ConfigError::Workload("length distribution parameters are invalid".into()))
        }
    }
}

/// Shared-prefix structure: requests are spread across `groups` groups, each
/// sharing its first `prefix_tokens` input tokens.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PrefixSpec {
    pub groups: usize,
    pub prefix_tokens: usize,
}

/// One client stream of a multi-client workload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientSpec {
    pub name: String,
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub slo_class: SloClass,
    pub arrival: ArrivalSpec,
    pub input_len: LengthSpec,
    pub output_len: LengthSpec,
    pub num_requests: usize,
    #[serde(default)]
    pub prefix: Option<PrefixSpec>,
}

/// Workload source: a single fixed-shape stream or a list of named clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkloadSpec {
    MultiClient { clients: Vec<ClientSpec> },
    Single(ClientSpec),
}

impl WorkloadSpec {
    pub fn clients(&self) -> &[ClientSpec] {
        match self {
            WorkloadSpec::MultiClient { clients } => clients,
            WorkloadSpec::Single(client) => std::slice::from_ref(client),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let clients = self.clients();
        if clients.is_empty() {
            return Err(ConfigError::Workload("at least one client is required".into()));
        }
        for client in clients {
            client.arrival.validate()?;
            client.input_len.validate()?;
            client.output_len.validate()?;
            if client.num_requests == 0 {
                return Err(ConfigError::Workload(format!(
                    "client '{}' has num_requests = 0",
                    client.name
                )));
            }
            if let Some(prefix) = &client.prefix {
                if prefix.groups == 0 && prefix.prefix_tokens > 0 {
                    return Err(ConfigError::Workload(format!(
                        "client '{}' has prefix tokens but zero prefix groups",
                        client.name
                    )));
                }
            }
        }
        Ok(())
    }
}
