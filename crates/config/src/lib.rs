pub mod constants;
mod error;
mod hardware;
mod model;
mod policies;
mod sim;
mod workload;

pub use self::{
    error::ConfigError,
    hardware::HardwareConfig,
    model::ModelConfig,
    policies::{AdmissionKind, PriorityKind, RoutingKind, ScorerKind, ScorerSpec},
    sim::{KvTierConfig, LatencyCoefficients, OutputFormat, SimulationConfig, TraceLevel},
    workload::{ArrivalSpec, ClientSpec, LengthSpec, PrefixSpec, WorkloadSpec},
};
