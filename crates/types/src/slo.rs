use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Service-level objective class a request is tagged with by the workload
/// generator. Aggregated metrics are reported per class; the `slo-based`
/// priority policy may consult it.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    ValueEnum,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum SloClass {
    /// Interactive traffic with tight TTFT expectations.
    Interactive,
    /// Default class.
    #[default]
    Standard,
    /// Throughput-oriented background work.
    Batch,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn parses_case_insensitive() {
        assert_eq!(<SloClass as FromStr>::from_str("Interactive").unwrap(), SloClass::Interactive);
        assert_eq!(<SloClass as FromStr>::from_str("batch").unwrap(), SloClass::Batch);
    }
}
