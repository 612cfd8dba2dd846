use serde::{Deserialize, Serialize};
use std::fmt;

/// Simulated time in microseconds. The cluster clock and every event
/// timestamp are expressed in ticks; wall-clock time never enters the
/// simulation.
pub type Ticks = u64;

pub const TICKS_PER_MS: u64 = 1_000;
pub const TICKS_PER_SEC: u64 = 1_000_000;

/// Stable request identifier assigned by the workload generator in arrival
/// order.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Index of a serving replica within the cluster. Doubles as the tie-break
/// key when two instances have events at the same tick.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct InstanceId(pub usize);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instance-{}", self.0)
    }
}
