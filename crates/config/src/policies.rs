use crate::ConfigError;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use strum_macros::{Display, EnumString};

/// Admission policy selector. Parameters (bucket capacity, refill rate) live
/// on [`crate::SimulationConfig`].
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
    ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum AdmissionKind {
    #[default]
    Always,
    TokenBucket,
    /// Rejects everything; only useful in tests.
    RejectAll,
}

/// Routing policy selector.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
    ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum RoutingKind {
    #[default]
    RoundRobin,
    LeastLoaded,
    PrefixAffinity,
    Weighted,
}

/// Wait-queue ordering policy.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
    ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum PriorityKind {
    #[default]
    Fcfs,
    /// Currently orders by request age; the seam accepts a true SLO-aware
    /// implementation without interface changes.
    SloBased,
}

/// Scorers composable under the `weighted` routing policy.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum ScorerKind {
    PrefixAffinity,
    QueueDepth,
    KvUtilization,
    LoadBalance,
}

/// A `name:weight` entry from `--routing-scorers`.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScorerSpec {
    pub kind: ScorerKind,
    pub weight: f64,
}

impl FromStr for ScorerSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ConfigError::MalformedScorerSpec(s.to_string());
        let (name, weight) = s.split_once(':').ok_or_else(malformed)?;
        let kind = ScorerKind::from_str(name.trim()).map_err(|_| malformed())?;
        let weight: f64 = weight.trim().parse().map_err(|_| malformed())?;
        if !weight.is_finite() || weight < 0.0 {
            return Err(malformed());
        }
        Ok(Self { kind, weight })
    }
}

impl fmt::Display for ScorerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.weight)
    }
}
