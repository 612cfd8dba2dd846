mod ids;
mod log;
mod serde_helpers;
mod slo;
mod state;

pub use self::{
    ids::{InstanceId, RequestId, Ticks, TICKS_PER_MS, TICKS_PER_SEC},
    log::LogLevel,
    serde_helpers::ticks_ms,
    slo::SloClass,
    state::{DropReason, RequestState},
};
