//! Decision and lifecycle tracing.
//!
//! The core emits callbacks through [`TraceSink`]; the recorder behind it
//! is replaceable. The in-memory recorder keeps ordered records and folds
//! them into aggregate statistics on demand.

use blis_types::{InstanceId, RequestId, Ticks};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Clone, Debug, Serialize)]
pub struct AdmissionTrace {
    pub time: Ticks,
    pub request: RequestId,
    pub policy: &'static str,
    pub admitted: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct CandidateScore {
    pub instance: InstanceId,
    pub score: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct RoutingTrace {
    pub time: Ticks,
    pub request: RequestId,
    pub policy: &'static str,
    pub chosen: InstanceId,
    /// `max(scores) − score(chosen)`, clamped to ≥ 0.
    pub regret: f64,
    /// Top-K candidates by score, best first.
    pub candidates: Vec<CandidateScore>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    Queued,
    FirstToken,
    Completed,
    Preempted,
    Dropped,
}

#[derive(Clone, Debug, Serialize)]
pub struct LifecycleTrace {
    pub time: Ticks,
    pub request: RequestId,
    pub instance: InstanceId,
    pub event: LifecycleEvent,
}

/// Receives trace callbacks from the cluster loop. Implementations must not
/// mutate simulation state; they only record.
pub trait TraceSink {
    fn admission(&mut self, record: AdmissionTrace);
    fn routing(&mut self, record: RoutingTrace);
    fn lifecycle(&mut self, record: LifecycleTrace);
}

/// Discards everything; used when tracing is off.
pub struct NoopTrace;

impl TraceSink for NoopTrace {
    fn admission(&mut self, _record: AdmissionTrace) {}
    fn routing(&mut self, _record: RoutingTrace) {}
    fn lifecycle(&mut self, _record: LifecycleTrace) {}
}

/// Ordered in-memory recorder.
#[derive(Default)]
pub struct InMemoryTrace {
    pub admissions: Vec<AdmissionTrace>,
    pub routings: Vec<RoutingTrace>,
    pub lifecycles: Vec<LifecycleTrace>,
}

impl InMemoryTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn summarize(&self) -> TraceSummary {
        let rejections = self.admissions.iter().filter(|a| !a.admitted).count();
        let mut routed_share: BTreeMap<InstanceId, usize> = BTreeMap::new();
        let mut regret_sum = 0.0;
        let mut regret_max: f64 = 0.0;
        for routing in &self.routings {
            *routed_share.entry(routing.chosen).or_default() += 1;
            regret_sum += routing.regret;
            regret_max = regret_max.max(routing.regret);
        }
        TraceSummary {
            admission_decisions: self.admissions.len(),
            rejections,
            routing_decisions: self.routings.len(),
            mean_regret: if self.routings.is_empty() {
                0.0
            } else {
                regret_sum / self.routings.len() as f64
            },
            max_regret: regret_max,
            routed_share,
            lifecycle_events: self.lifecycles.len(),
        }
    }
}

impl TraceSink for InMemoryTrace {
    fn admission(&mut self, record: AdmissionTrace) {
        self.admissions.push(record);
    }

    fn routing(&mut self, record: RoutingTrace) {
        self.routings.push(record);
    }

    fn lifecycle(&mut self, record: LifecycleTrace) {
        self.lifecycles.push(record);
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TraceSummary {
    pub admission_decisions: usize,
    pub rejections: usize,
    pub routing_decisions: usize,
    pub mean_regret: f64,
    pub max_regret: f64,
    pub routed_share: BTreeMap<InstanceId, usize>,
    pub lifecycle_events: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_folds_decisions() {
        let mut trace = InMemoryTrace::new();
        trace.admission(AdmissionTrace {
            time: 0,
            request: RequestId(1),
            policy: "token-bucket",
            admitted: true,
        });
        trace.admission(AdmissionTrace {
            time: 5,
            request: RequestId(2),
            policy: "token-bucket",
            admitted: false,
        });
        for (time, chosen, regret) in [(10, 0, 0.0), (20, 1, 0.25)] {
            trace.routing(RoutingTrace {
                time,
                request: RequestId(1),
                policy: "weighted",
                chosen: InstanceId(chosen),
                regret,
                candidates: Vec::new(),
            });
        }

        let summary = trace.summarize();
        assert_eq!(summary.admission_decisions, 2);
        assert_eq!(summary.rejections, 1);
        assert_eq!(summary.routing_decisions, 2);
        assert_eq!(summary.mean_regret, 0.125);
        assert_eq!(summary.max_regret, 0.25);
        assert_eq!(summary.routed_share[&InstanceId(0)], 1);
    }
}
