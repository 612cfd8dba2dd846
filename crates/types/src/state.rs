use serde::{Deserialize, Serialize};
use strum_macros::Display;

/// Lifecycle state of a request.
///
/// `Generated` requests exist only inside the workload generator and the
/// cluster-level pipeline; everything from `Queued` onwards is owned by a
/// single instance. `Preempted` is re-entrant: a preempted request goes back
/// to the front of its instance's wait queue and becomes `Running` again once
/// it rejoins the batch.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RequestState {
    #[default]
    Generated,
    Queued,
    Running,
    Completed,
    Preempted,
    Dropped,
}

impl RequestState {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Completed | RequestState::Dropped)
    }
}

/// Why a request was dropped mid-flight.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum DropReason {
    /// The request's KV footprint alone exceeds the instance's total GPU
    /// block capacity; admitting it would evict-loop forever.
    OverCapacity,
    /// The cluster admission policy turned the request away; it never
    /// reached routing.
    AdmissionRejected,
}
