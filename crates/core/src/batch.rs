//! Batch formation: FCFS continuous batching with chunked prefill and
//! preemption under KV pressure.
//!
//! The former is a pure decision layer over the instance's queues and KV
//! cache: it mutates the running batch, the wait queue and the cache, and
//! reports what it did in a [`BatchPlan`]; scheduling events and recording
//! metrics stay with the instance step loop.

use crate::kv::{target_hashes, AllocError, KvCache};
use crate::request::Request;
use blis_types::{DropReason, RequestId, RequestState, Ticks};
use std::collections::{BTreeMap, VecDeque};

/// Everything one batch-formation decision sees.
pub struct BatchContext<'a> {
    pub running: &'a mut Vec<RequestId>,
    pub wait_queue: &'a mut VecDeque<RequestId>,
    pub requests: &'a mut BTreeMap<RequestId, Request>,
    pub kv: &'a mut dyn KvCache,
    pub token_budget: usize,
    pub max_batch_size: usize,
    pub long_prefill_threshold: usize,
    pub clock: Ticks,
    pub step_count: u64,
}

/// Outcome of one batch-formation decision.
#[derive(Debug, Default)]
pub struct BatchPlan {
    /// Tokens each batch member processes this step; iterated in sorted
    /// key order by the step phase. Their sum never exceeds the budget.
    pub computed_tokens: BTreeMap<RequestId, usize>,
    /// Requests preempted while forming this batch (now at the front of
    /// the wait queue).
    pub preempted: Vec<RequestId>,
    /// Requests dropped for exceeding cache capacity outright.
    pub dropped: Vec<RequestId>,
}

enum Fit {
    Fitted,
    /// KV pressure and nothing left to preempt.
    Blocked,
    /// The request can never fit; drop it.
    OverCapacity,
}

/// Make room for `request`'s next allocation by preempting from the tail of
/// the running batch: release the victim's blocks, reset its progress and
/// put it back at the front of the wait queue.
fn fit_with_preemption(
    request: RequestId,
    take: usize,
    ctx: &mut BatchContext<'_>,
    plan: &mut BatchPlan,
) -> Fit {
    loop {
        let req = &ctx.requests[&request];
        let target = target_hashes(
            &req.block_hashes,
            request,
            req.progress + take,
            ctx.kv.block_size(),
        );
        match ctx.kv.allocate(request, &target) {
            Ok(()) => return Fit::Fitted,
            Err(AllocError::OverCapacity) => return Fit::OverCapacity,
            Err(AllocError::Exhausted) => {
                // Victims come strictly from the tail; the candidate itself
                // is handled by the caller.
                let Some(&victim) = ctx.running.last().filter(|&&id| id != request) else {
                    return Fit::Blocked;
                };
                ctx.running.pop();
                ctx.kv.release(victim);
                let victim_req = ctx.requests.get_mut(&victim).expect("victim owned by instance");
                victim_req.reset_for_preemption();
                plan.computed_tokens.remove(&victim);
                ctx.wait_queue.push_front(victim);
                plan.preempted.push(victim);
            }
        }
    }
}

/// One FCFS batch-formation decision.
pub fn form_batch(mut ctx: BatchContext<'_>) -> BatchPlan {
    let mut plan = BatchPlan::default();
    let mut used_budget = 0usize;

    // Phase 1: keep the existing batch running. Decode members reserve one
    // token each; members still mid-prefill continue their chunk.
    let mut index = 0;
    while index < ctx.running.len() {
        let id = ctx.running[index];
        let req = &ctx.requests[&id];
        let take = if req.in_prefill() {
            req.remaining_input().min(ctx.token_budget - used_budget)
        } else {
            usize::from(used_budget < ctx.token_budget)
        };
        if take == 0 {
            // Budget exhausted; the request idles in the batch this step.
            index += 1;
            continue;
        }
        match fit_with_preemption(id, take, &mut ctx, &mut plan) {
            Fit::Fitted => {
                used_budget += take;
                plan.computed_tokens.insert(id, take);
                let req = ctx.requests.get_mut(&id).expect("batch member owned by instance");
                req.num_new_tokens = take;
                index += 1;
            }
            Fit::Blocked => {
                // The request is its own tail: preempt it and move on.
                debug_assert_eq!(ctx.running.last(), Some(&id));
                ctx.running.pop();
                ctx.kv.release(id);
                let req = ctx.requests.get_mut(&id).expect("batch member owned by instance");
                req.reset_for_preemption();
                plan.computed_tokens.remove(&id);
                ctx.wait_queue.push_front(id);
                plan.preempted.push(id);
            }
            Fit::OverCapacity => {
                ctx.running.remove(index);
                ctx.kv.release(id);
                let clock = ctx.clock;
                let req = ctx.requests.get_mut(&id).expect("batch member owned by instance");
                req.drop_with(DropReason::OverCapacity, clock);
                plan.computed_tokens.remove(&id);
                plan.dropped.push(id);
            }
        }
    }

    // Phase 2: admit from the head of the wait queue. The candidate is
    // taken off the queue while fitting so preemption victims can land at
    // the front; a candidate that cannot fit goes back to the head.
    while ctx.running.len() < ctx.max_batch_size && used_budget < ctx.token_budget {
        let Some(id) = ctx.wait_queue.pop_front() else {
            break;
        };
        let req = ctx.requests.get_mut(&id).expect("queued request owned by instance");
        // Prefix-cache hit: skip the cached prefix outright. At least one
        // input token is always processed so the step still produces the
        // first logits; the skipped blocks get pinned by the allocation
        // below and count as hits.
        if req.progress == 0 && req.input_tokens > 1 {
            let cached = ctx.kv.lookup(&req.block_hashes);
            req.progress = (cached * ctx.kv.block_size()).min(req.input_tokens - 1);
        }
        let req = &ctx.requests[&id];
        let remaining = req.remaining_input().max(1);
        let budget_left = ctx.token_budget - used_budget;
        let take = remaining.min(budget_left);
        // Short prefills are taken whole or not at all; only prefills past
        // the threshold are chunked.
        if take < remaining && remaining <= ctx.long_prefill_threshold {
            // Forget the speculative prefix skip; it is recomputed against
            // whatever is still cached when the request is next considered.
            ctx.requests.get_mut(&id).expect("queued request owned by instance").progress = 0;
            ctx.wait_queue.push_front(id);
            break;
        }
        match fit_with_preemption(id, take, &mut ctx, &mut plan) {
            Fit::Fitted => {
                ctx.running.push(id);
                used_budget += take;
                plan.computed_tokens.insert(id, take);
                let req = ctx.requests.get_mut(&id).expect("queued request owned by instance");
                req.num_new_tokens = take;
                req.state = RequestState::Running;
            }
            Fit::Blocked => {
                ctx.requests.get_mut(&id).expect("queued request owned by instance").progress = 0;
                ctx.wait_queue.push_front(id);
                break;
            }
            Fit::OverCapacity => {
                let clock = ctx.clock;
                let req = ctx.requests.get_mut(&id).expect("queued request owned by instance");
                req.drop_with(DropReason::OverCapacity, clock);
                plan.dropped.push(id);
            }
        }
    }

    debug_assert!(plan.computed_tokens.values().sum::<usize>() <= ctx.token_budget);
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{input_block_hashes, GpuKvCache};

    const BLOCK: usize = 16;

    fn request_with_salt(id: u64, salt: u64, input: usize, output: usize) -> Request {
        let tokens: Vec<u64> = (0..input as u64).map(|t| t + salt * 1_000_000).collect();
        Request::new(
            RequestId(id),
            0,
            input,
            output,
            input_block_hashes(&tokens, BLOCK),
        )
    }

    fn request(id: u64, input: usize, output: usize) -> Request {
        request_with_salt(id, id, input, output)
    }

    struct Fixture {
        running: Vec<RequestId>,
        wait_queue: VecDeque<RequestId>,
        requests: BTreeMap<RequestId, Request>,
        kv: GpuKvCache,
    }

    impl Fixture {
        fn new(total_blocks: usize) -> Self {
            Self {
                running: Vec::new(),
                wait_queue: VecDeque::new(),
                requests: BTreeMap::new(),
                kv: GpuKvCache::new(total_blocks, BLOCK),
            }
        }

        fn enqueue(&mut self, req: Request) {
            self.wait_queue.push_back(req.id);
            self.requests.insert(req.id, req);
        }

        fn form(&mut self, token_budget: usize, max_batch_size: usize) -> BatchPlan {
            form_batch(BatchContext {
                running: &mut self.running,
                wait_queue: &mut self.wait_queue,
                requests: &mut self.requests,
                kv: &mut self.kv,
                token_budget,
                max_batch_size,
                long_prefill_threshold: 2048,
                clock: 0,
                step_count: 0,
            })
        }

        /// Advance each batch member by its planned tokens, as the step
        /// phase would.
        fn apply(&mut self, plan: &BatchPlan) {
            for (id, tokens) in &plan.computed_tokens {
                self.requests.get_mut(id).unwrap().progress += tokens;
            }
        }
    }

    #[test]
    fn admits_fcfs_until_budget() {
        let mut fx = Fixture::new(1024);
        for id in 1..=3 {
            fx.enqueue(request(id, 512, 64));
        }
        let plan = fx.form(1024, 8);
        // Two full prefills fit the budget; the third waits.
        assert_eq!(fx.running, vec![RequestId(1), RequestId(2)]);
        assert_eq!(plan.computed_tokens[&RequestId(1)], 512);
        assert_eq!(plan.computed_tokens[&RequestId(2)], 512);
        assert_eq!(fx.wait_queue, VecDeque::from([RequestId(3)]));
    }

    #[test]
    fn chunks_long_prefills() {
        let mut fx = Fixture::new(1024);
        fx.enqueue(request(1, 8192, 64));
        let plan = fx.form(2048, 8);
        assert_eq!(plan.computed_tokens[&RequestId(1)], 2048);
        fx.apply(&plan);

        // The chunk continues from the running batch on the next step.
        let plan = fx.form(2048, 8);
        assert_eq!(plan.computed_tokens[&RequestId(1)], 2048);
        fx.apply(&plan);
        assert_eq!(fx.requests[&RequestId(1)].progress, 4096);
    }

    #[test]
    fn short_prefill_is_not_split() {
        let mut fx = Fixture::new(1024);
        fx.enqueue(request(1, 600, 64));
        let plan = fx.form(512, 8);
        // 600 <= threshold and does not fit the 512 budget: head-blocked.
        assert!(plan.computed_tokens.is_empty());
        assert_eq!(fx.wait_queue.len(), 1);
    }

    #[test]
    fn decode_members_reserve_one_token() {
        let mut fx = Fixture::new(1024);
        fx.enqueue(request(1, 32, 8));
        let plan = fx.form(4096, 8);
        fx.apply(&plan);

        fx.enqueue(request(2, 64, 8));
        let plan = fx.form(4096, 8);
        assert_eq!(plan.computed_tokens[&RequestId(1)], 1);
        assert_eq!(plan.computed_tokens[&RequestId(2)], 64);
    }

    #[test]
    fn preempts_tail_under_kv_pressure() {
        // 8 blocks = 128 tokens of KV. Two requests of 64 input tokens fill
        // the cache exactly; decode for the first must evict the second.
        let mut fx = Fixture::new(8);
        fx.enqueue(request(1, 64, 32));
        fx.enqueue(request(2, 64, 32));
        let plan = fx.form(4096, 8);
        assert_eq!(fx.running.len(), 2);
        fx.apply(&plan);

        let plan = fx.form(4096, 8);
        // Request 2 (the tail) is preempted so request 1 can take its
        // decode token; the re-admission of request 2 from the queue head
        // then preempts request 1 in turn, rescinding that token. Both end
        // up replaying their prefill from the cache-warm blocks.
        assert_eq!(plan.preempted, vec![RequestId(2), RequestId(1)]);
        assert_eq!(fx.running, vec![RequestId(2), RequestId(1)]);
        assert!(fx.wait_queue.is_empty());
        assert_eq!(plan.computed_tokens[&RequestId(1)], 64);
        assert_eq!(plan.computed_tokens[&RequestId(2)], 64);
        assert_eq!(fx.requests[&RequestId(1)].preemption_count, 1);
        assert_eq!(fx.requests[&RequestId(2)].preemption_count, 1);
        // Preemption resets prefill progress; the re-admission replay is
        // planned against progress zero.
        assert_eq!(fx.requests[&RequestId(1)].progress, 0);
        // The cache is exactly full and conserved.
        assert_eq!(fx.kv.used_blocks(), 8);
        assert_eq!(fx.kv.free_blocks(), 0);
    }

    #[test]
    fn oversized_request_is_dropped_not_looped() {
        // 4 blocks = 64 tokens total capacity; the request needs 80.
        let mut fx = Fixture::new(4);
        fx.enqueue(request(1, 80, 8));
        let plan = fx.form(4096, 8);
        assert_eq!(plan.dropped, vec![RequestId(1)]);
        assert!(fx.wait_queue.is_empty());
        assert!(fx.running.is_empty());
        assert_eq!(fx.requests[&RequestId(1)].state, RequestState::Dropped);
        assert_eq!(
            fx.requests[&RequestId(1)].drop_reason,
            Some(DropReason::OverCapacity)
        );
        // The failed admission left the cache untouched.
        assert_eq!(fx.kv.used_blocks(), 0);
    }

    #[test]
    fn warm_prefix_skips_cached_prefill() {
        let mut fx = Fixture::new(1024);
        fx.enqueue(request_with_salt(1, 9, 512, 1));
        let plan = fx.form(4096, 8);
        assert_eq!(plan.computed_tokens[&RequestId(1)], 512);
        fx.apply(&plan);
        // Retire request 1, leaving its blocks cached but unpinned.
        fx.running.clear();
        fx.kv.release(RequestId(1));

        // An identical prompt replays only its final input token.
        fx.enqueue(request_with_salt(2, 9, 512, 1));
        let plan = fx.form(4096, 8);
        assert_eq!(plan.computed_tokens[&RequestId(2)], 1);
        assert_eq!(fx.requests[&RequestId(2)].progress, 511);
        // The skipped blocks were pinned as cache hits, not recomputed.
        assert!(fx.kv.stats().hits >= 31);
    }

    #[test]
    fn budget_is_never_exceeded() {
        let mut fx = Fixture::new(4096);
        for id in 1..=20 {
            fx.enqueue(request(id, 512, 16));
        }
        let plan = fx.form(2048, 16);
        assert!(plan.computed_tokens.values().sum::<usize>() <= 2048);
    }

    #[test]
    fn respects_max_batch_size() {
        let mut fx = Fixture::new(4096);
        for id in 1..=8 {
            fx.enqueue(request(id, 16, 16));
        }
        fx.form(4096, 4);
        assert_eq!(fx.running.len(), 4);
        assert_eq!(fx.wait_queue.len(), 4);
    }
}
