//! Routing policies and the weighted scorer pipeline.

pub mod scorers;
mod snapshot;

pub use self::scorers::{
    KvUtilizationScorer, LoadBalanceScorer, PrefixAffinityScorer, PrefixIndex, QueueDepthScorer,
    Scorer,
};
pub use self::snapshot::{RouterState, RoutingSnapshot};

use crate::request::Request;
use blis_config::{RoutingKind, ScorerKind, SimulationConfig};
use blis_types::InstanceId;
use std::collections::BTreeMap;

/// Picks a target instance for every admitted request. `observe` runs
/// synchronously after the decision so stateful policies can learn from it.
pub trait RoutingPolicy {
    fn name(&self) -> &'static str;
    fn route(&mut self, request: &Request, state: &RouterState) -> InstanceId;
    fn observe(&mut self, _request: &Request, _chosen: InstanceId) {}

    /// Per-instance scores backing the last `route` call, when the policy
    /// computes any. Used for counterfactual-regret tracing.
    fn last_scores(&self) -> Option<&BTreeMap<InstanceId, f64>> {
        None
    }
}

pub struct RoundRobin {
    next: usize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self { next: 0 }
    }
}

impl RoutingPolicy for RoundRobin {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn route(&mut self, _request: &Request, state: &RouterState) -> InstanceId {
        let ids: Vec<InstanceId> = state.snapshots.keys().copied().collect();
        let chosen = ids[self.next % ids.len()];
        self.next += 1;
        chosen
    }
}

/// Lowest `queue_depth + batch_size + pending_requests` wins; ties go to
/// the lowest instance index.
pub struct LeastLoaded;

impl RoutingPolicy for LeastLoaded {
    fn name(&self) -> &'static str {
        "least-loaded"
    }

    fn route(&mut self, _request: &Request, state: &RouterState) -> InstanceId {
        least_loaded(state)
    }
}

fn least_loaded(state: &RouterState) -> InstanceId {
    state
        .snapshots
        .iter()
        .min_by_key(|(id, snapshot)| (snapshot.effective_load(), **id))
        .map(|(id, _)| *id)
        .expect("router requires at least one instance")
}

/// Sticky mapping from a request's first content block to an instance, so
/// identical prefixes land on the same replica. The hashed target only
/// wins once its router-side index has seen the prefix; on the first miss
/// (and for requests with no input blocks) the decision falls back to
/// least-loaded, and `observe` teaches the index where the prefix landed.
pub struct PrefixAffinity {
    index: PrefixIndex,
}

impl PrefixAffinity {
    pub fn new(capacity: usize) -> Self {
        Self {
            index: PrefixIndex::new(capacity),
        }
    }
}

impl RoutingPolicy for PrefixAffinity {
    fn name(&self) -> &'static str {
        "prefix-affinity"
    }

    fn route(&mut self, request: &Request, state: &RouterState) -> InstanceId {
        let Some(&lead) = request.block_hashes.first() else {
            return least_loaded(state);
        };
        let ids: Vec<InstanceId> = state.snapshots.keys().copied().collect();
        let target = ids[(lead % ids.len() as u64) as usize];
        if self.index.contains(target, lead) {
            target
        } else {
            least_loaded(state)
        }
    }

    fn observe(&mut self, request: &Request, chosen: InstanceId) {
        if let Some(&lead) = request.block_hashes.first() {
            self.index.record(chosen, std::slice::from_ref(&lead));
        }
    }
}

/// Composable weighted scoring: clamp each scorer's output to `[0, 1]`,
/// normalize weights to sum to one, argmax the weighted sum (ties to the
/// lowest index), then run every scorer's observer on the winner.
pub struct Weighted {
    scorers: Vec<(f64, Box<dyn Scorer>)>,
    last_scores: BTreeMap<InstanceId, f64>,
}

impl Weighted {
    pub fn new(scorers: Vec<(f64, Box<dyn Scorer>)>) -> Self {
        Self {
            scorers,
            last_scores: BTreeMap::new(),
        }
    }
}

impl RoutingPolicy for Weighted {
    fn name(&self) -> &'static str {
        "weighted"
    }

    fn route(&mut self, request: &Request, state: &RouterState) -> InstanceId {
        let weight_total: f64 = self.scorers.iter().map(|(weight, _)| weight).sum();
        let mut combined: BTreeMap<InstanceId, f64> =
            state.snapshots.keys().map(|&id| (id, 0.0)).collect();
        for (weight, scorer) in &self.scorers {
            let normalized = if weight_total > 0.0 {
                weight / weight_total
            } else {
                1.0 / self.scorers.len() as f64
            };
            let scores = scorer.score(request, state);
            for (id, total) in combined.iter_mut() {
                let score = scores.get(id).copied().unwrap_or(0.0).clamp(0.0, 1.0);
                *total += normalized * score;
            }
        }
        let chosen = combined
            .iter()
            // Argmax with ties to the lowest index: strictly-greater wins.
            .fold(None::<(InstanceId, f64)>, |best, (&id, &score)| match best {
                Some((_, best_score)) if score <= best_score => best,
                _ => Some((id, score)),
            })
            .map(|(id, _)| id)
            .expect("router requires at least one instance");
        self.last_scores = combined;
        chosen
    }

    fn observe(&mut self, request: &Request, chosen: InstanceId) {
        for (_, scorer) in &mut self.scorers {
            scorer.observe(request, chosen);
        }
    }

    fn last_scores(&self) -> Option<&BTreeMap<InstanceId, f64>> {
        Some(&self.last_scores)
    }
}

/// Reference scores for counterfactual tracing when the active policy does
/// not produce its own.
pub fn reference_scores(state: &RouterState) -> BTreeMap<InstanceId, f64> {
    state
        .snapshots
        .iter()
        .map(|(&id, snapshot)| (id, 1.0 / (1.0 + snapshot.effective_load() as f64)))
        .collect()
}

fn build_scorer(kind: ScorerKind, config: &SimulationConfig) -> Box<dyn Scorer> {
    match kind {
        ScorerKind::PrefixAffinity => {
            Box::new(PrefixAffinityScorer::new(config.router_prefix_capacity))
        }
        ScorerKind::QueueDepth => Box::new(QueueDepthScorer),
        ScorerKind::KvUtilization => Box::new(KvUtilizationScorer),
        ScorerKind::LoadBalance => Box::new(LoadBalanceScorer),
    }
}

pub fn build_routing_policy(config: &SimulationConfig) -> Box<dyn RoutingPolicy> {
    match config.routing {
        RoutingKind::RoundRobin => Box::new(RoundRobin::new()),
        RoutingKind::LeastLoaded => Box::new(LeastLoaded),
        RoutingKind::PrefixAffinity => {
            Box::new(PrefixAffinity::new(config.router_prefix_capacity))
        }
        RoutingKind::Weighted => Box::new(Weighted::new(
            config
                .routing_scorers
                .iter()
                .map(|spec| (spec.weight, build_scorer(spec.kind, config)))
                .collect(),
        )),
    }
}
