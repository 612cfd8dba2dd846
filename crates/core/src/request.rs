use blis_types::{DropReason, InstanceId, RequestId, RequestState, SloClass, Ticks};

/// A single inference request flowing through the cluster.
///
/// Created by the workload generator, owned by the cluster pipeline until the
/// `Queued` hand-off and by exactly one instance afterwards. The router only
/// ever sees read-only snapshots.
#[derive(Clone, Debug)]
pub struct Request {
    pub id: RequestId,
    /// Cluster arrival tick assigned at generation time.
    pub arrival: Ticks,
    pub input_tokens: usize,
    pub output_tokens: usize,
    /// Chained content hashes of the input-token blocks, in block order.
    /// Two requests with identical input prefixes share hashes up to the
    /// divergence point.
    pub block_hashes: Vec<u64>,
    pub tenant: Option<String>,
    pub slo_class: SloClass,
    /// Optional externally assigned priority score; higher runs earlier
    /// under priority-aware queue ordering.
    pub priority: Option<f64>,

    pub state: RequestState,
    /// Tokens already processed. Prefill ends when this reaches
    /// `input_tokens`; the run completes when `progress - input_tokens`
    /// reaches `output_tokens`.
    pub progress: usize,
    /// Tokens this request will process in the current step; written by
    /// batch formation, consumed by the step phase.
    pub num_new_tokens: usize,

    pub prefill_steps: u32,
    pub decode_steps: u32,
    pub preemption_count: u32,
    pub drop_reason: Option<DropReason>,
    /// Instance that owned the request, once routed.
    pub handled_by: Option<InstanceId>,

    pub admitted_at: Option<Ticks>,
    pub routed_at: Option<Ticks>,
    pub queued_at: Option<Ticks>,
    pub first_token_at: Option<Ticks>,
    pub completed_at: Option<Ticks>,
    /// Tick at which the previous decode token for this request was ready;
    /// basis for per-step ITL.
    pub last_token_at: Option<Ticks>,
    /// Inter-token latencies, one per decode step.
    pub itl: Vec<Ticks>,
}

impl Request {
    pub fn new(
        id: RequestId,
        arrival: Ticks,
        input_tokens: usize,
        output_tokens: usize,
        block_hashes: Vec<u64>,
    ) -> Self {
        Self {
            id,
            arrival,
            input_tokens,
            output_tokens,
            block_hashes,
            tenant: None,
            slo_class: SloClass::default(),
            priority: None,
            state: RequestState::Generated,
            progress: 0,
            num_new_tokens: 0,
            prefill_steps: 0,
            decode_steps: 0,
            preemption_count: 0,
            drop_reason: None,
            handled_by: None,
            admitted_at: None,
            routed_at: None,
            queued_at: None,
            first_token_at: None,
            completed_at: None,
            last_token_at: None,
            itl: Vec::new(),
        }
    }

    /// Input tokens not yet prefilled.
    pub fn remaining_input(&self) -> usize {
        self.input_tokens.saturating_sub(self.progress)
    }

    pub fn in_prefill(&self) -> bool {
        self.progress < self.input_tokens
    }

    /// Output tokens produced so far.
    pub fn output_progress(&self) -> usize {
        self.progress.saturating_sub(self.input_tokens)
    }

    pub fn is_complete(&self) -> bool {
        self.output_progress() >= self.output_tokens
    }

    /// Drop the request terminally.
    pub fn drop_with(&mut self, reason: DropReason, now: Ticks) {
        self.state = RequestState::Dropped;
        self.drop_reason = Some(reason);
        self.completed_at = Some(now);
    }

    /// Forget all per-run progress when preempted; KV blocks are released
    /// by the caller and the request restarts its prefill from scratch on
    /// re-admission (cached blocks make the replay cheap).
    pub fn reset_for_preemption(&mut self) {
        self.state = RequestState::Preempted;
        self.progress = 0;
        self.num_new_tokens = 0;
        self.preemption_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> Request {
        Request::new(RequestId(1), 0, 32, 4, vec![0xa, 0xb])
    }

    #[test]
    fn prefill_then_decode_progress() {
        let mut req = request();
        assert!(req.in_prefill());
        assert_eq!(req.remaining_input(), 32);

        req.progress = 32;
        assert!(!req.in_prefill());
        assert_eq!(req.output_progress(), 0);
        assert!(!req.is_complete());

        req.progress = 36;
        assert!(req.is_complete());
    }

    #[test]
    fn preemption_restarts_prefill() {
        let mut req = request();
        req.state = RequestState::Running;
        req.progress = 33;
        req.reset_for_preemption();
        assert_eq!(req.state, RequestState::Preempted);
        assert_eq!(req.progress, 0);
        assert_eq!(req.preemption_count, 1);
        assert!(req.in_prefill());
    }
}
