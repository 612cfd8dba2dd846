use blis_types::InstanceId;

/// Simulator failures. Construction-time variants surface before the first
/// event is popped; invariant variants abort a run that has corrupted its
/// own state and would otherwise produce garbage output.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("latency model: {0}")]
    LatencyModel(String),

    #[error("bench data: {0}")]
    BenchData(#[from] crate::latency::mfu::MfuError),

    #[error(
        "request conservation violated: {arrivals} arrivals != {rejected} rejected + \
         {dropped} dropped + {completed} completed + {in_flight} in flight"
    )]
    RequestConservation {
        arrivals: usize,
        rejected: usize,
        dropped: usize,
        completed: usize,
        in_flight: usize,
    },

    #[error("clock moved backwards: {from} -> {to}")]
    ClockRegression { from: u64, to: u64 },

    #[error("KV accounting corrupt on {instance}: free {free} + used {used} != total {total}")]
    KvConservation {
        instance: InstanceId,
        free: usize,
        used: usize,
        total: usize,
    },
}
