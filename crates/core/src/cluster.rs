//! Shared-clock cluster simulation: admission, routing and per-instance
//! event interleaving under one simulated clock.

use crate::admission::{build_admission_policy, AdmissionPolicy};
use crate::error::SimError;
use crate::event::{Event, EventKind, EventQueue};
use crate::instance::{InstanceConfig, SimInstance};
use crate::kv::{build_kv_cache, KvStats};
use crate::latency::build_models;
use crate::metrics::{AggregateReport, RequestRecord};
use crate::request::Request;
use crate::routing::{
    build_routing_policy, reference_scores, RouterState, RoutingPolicy, RoutingSnapshot,
};
use crate::trace::{
    AdmissionTrace, CandidateScore, InMemoryTrace, LifecycleEvent, LifecycleTrace, RoutingTrace,
    TraceSink, TraceSummary,
};
use blis_config::{HardwareConfig, ModelConfig, SimulationConfig, TraceLevel};
use blis_types::{DropReason, InstanceId, RequestId, Ticks};
use std::collections::BTreeMap;

/// Everything a finished run reports.
#[derive(Debug)]
pub struct SimulationReport {
    /// Per-request records sorted by request id.
    pub records: Vec<RequestRecord>,
    pub aggregate: AggregateReport,
    pub trace: Option<TraceSummary>,
}

/// Cached tier-3 signals for one instance.
#[derive(Copy, Clone, Debug, Default)]
struct Tier3Signals {
    kv_utilization: f64,
    free_blocks: usize,
    cache_hit_rate: f64,
}

enum NextEvent {
    Cluster,
    Instance(usize),
}

pub struct ClusterSimulator {
    config: SimulationConfig,
    clock: Ticks,
    events: EventQueue,
    instances: Vec<SimInstance>,
    admission: Box<dyn AdmissionPolicy>,
    router: Box<dyn RoutingPolicy>,
    /// Requests routed but not yet landed, per instance (tier-1 signal).
    pending: Vec<usize>,
    /// Requests owned by the cluster pipeline (pre-`Queued`).
    in_flight: BTreeMap<RequestId, Request>,
    /// Requests that terminated before reaching an instance.
    rejected: Vec<Request>,

    tier3: Vec<Tier3Signals>,
    tier3_at: Option<Ticks>,

    trace: InMemoryTrace,
    external_sink: Option<Box<dyn TraceSink>>,

    arrivals: usize,
}

impl ClusterSimulator {
    pub fn new(
        config: SimulationConfig,
        model: &ModelConfig,
        hardware: &HardwareConfig,
    ) -> Result<Self, SimError> {
        let models = build_models(&config, model, hardware, config.num_instances)?;
        let block_bytes = model.kv_bytes_per_token() * config.block_size;
        let instances: Vec<SimInstance> = models
            .into_iter()
            .enumerate()
            .map(|(index, latency)| {
                SimInstance::new(
                    InstanceId(index),
                    InstanceConfig::from(&config),
                    build_kv_cache(&config, block_bytes),
                    latency,
                )
            })
            .collect();
        let admission = build_admission_policy(&config);
        let router = build_routing_policy(&config);
        let pending = vec![0; config.num_instances];
        let tier3 = vec![Tier3Signals::default(); config.num_instances];
        Ok(Self {
            config,
            clock: 0,
            events: EventQueue::new(),
            instances,
            admission,
            router,
            pending,
            in_flight: BTreeMap::new(),
            rejected: Vec::new(),
            tier3,
            tier3_at: None,
            trace: InMemoryTrace::new(),
            external_sink: None,
            arrivals: 0,
        })
    }

    /// Replace the decision recorder. The built-in in-memory recorder keeps
    /// running for the end-of-run summary; the external sink sees the same
    /// callbacks.
    pub fn with_trace_sink(mut self, sink: Box<dyn TraceSink>) -> Self {
        self.external_sink = Some(sink);
        self
    }

    /// Run to completion or to the horizon.
    pub fn run(&mut self, requests: Vec<Request>) -> Result<SimulationReport, SimError> {
        tracing::debug!(
            requests = requests.len(),
            instances = self.instances.len(),
            admission = self.admission.name(),
            routing = self.router.name(),
            "starting cluster loop"
        );
        for request in requests {
            self.arrivals += 1;
            self.events
                .push(request.arrival, EventKind::ClusterArrival(request.id), None);
            self.in_flight.insert(request.id, request);
        }

        loop {
            let cluster_key = self.events.peek_key();
            let instance_key = self
                .instances
                .iter()
                .enumerate()
                .filter_map(|(index, instance)| {
                    instance.peek_key().map(|(time, _)| (time, index))
                })
                .min_by_key(|&(time, index)| (time, index));

            // Cluster events win ties; tied instances go lowest-index first.
            let next = match (cluster_key, instance_key) {
                (None, None) => break,
                (Some(_), None) => NextEvent::Cluster,
                (None, Some((_, index))) => NextEvent::Instance(index),
                (Some((cluster_time, _)), Some((instance_time, index))) => {
                    if cluster_time <= instance_time {
                        NextEvent::Cluster
                    } else {
                        NextEvent::Instance(index)
                    }
                }
            };

            let event_time = match &next {
                NextEvent::Cluster => cluster_key.expect("peeked above").0,
                NextEvent::Instance(index) => {
                    self.instances[*index].peek_key().expect("peeked above").0
                }
            };
            if event_time > self.config.horizon {
                break;
            }
            if event_time < self.clock {
                return Err(SimError::ClockRegression {
                    from: self.clock,
                    to: event_time,
                });
            }
            self.clock = event_time;

            match next {
                NextEvent::Cluster => {
                    let event = self.events.pop().expect("peeked above");
                    self.dispatch_cluster(event)?;
                }
                NextEvent::Instance(index) => {
                    let event = self.instances[index].pop_event().expect("peeked above");
                    self.dispatch_instance(index, event)?;
                }
            }
        }

        self.finish()
    }

    fn dispatch_cluster(&mut self, event: Event) -> Result<(), SimError> {
        let now = event.time;
        match event.kind {
            EventKind::ClusterArrival(id) => {
                self.events.push(
                    now + self.config.admission_latency,
                    EventKind::AdmissionDecision(id),
                    None,
                );
            }
            EventKind::AdmissionDecision(id) => {
                let admitted = {
                    let request = self
                        .in_flight
                        .get_mut(&id)
                        .expect("admission for unknown request");
                    let admitted = self.admission.admit(request, now);
                    if admitted {
                        request.admitted_at = Some(now);
                    }
                    admitted
                };
                let trace = AdmissionTrace {
                    time: now,
                    request: id,
                    policy: self.admission.name(),
                    admitted,
                };
                self.emit_admission(trace);
                if admitted {
                    self.events.push(
                        now + self.config.routing_latency,
                        EventKind::RoutingDecision(id),
                        None,
                    );
                } else {
                    let mut request = self.in_flight.remove(&id).expect("present above");
                    request.drop_with(DropReason::AdmissionRejected, now);
                    self.rejected.push(request);
                }
            }
            EventKind::RoutingDecision(id) => {
                let state = RouterState {
                    snapshots: self.build_snapshots(),
                    clock: now,
                };
                let request = self.in_flight.get_mut(&id).expect("routing for unknown request");
                let chosen = self.router.route(request, &state);
                self.router.observe(request, chosen);
                request.routed_at = Some(now);
                self.pending[chosen.0] += 1;

                if self.config.trace_level >= TraceLevel::Decisions {
                    let scores = self
                        .router
                        .last_scores()
                        .cloned()
                        .unwrap_or_else(|| reference_scores(&state));
                    let best = scores.values().copied().fold(0.0f64, f64::max);
                    let chosen_score = scores.get(&chosen).copied().unwrap_or(0.0);
                    let regret = (best - chosen_score).max(0.0);
                    let mut candidates: Vec<CandidateScore> = scores
                        .iter()
                        .map(|(&instance, &score)| CandidateScore { instance, score })
                        .collect();
                    candidates.sort_by(|a, b| {
                        b.score
                            .partial_cmp(&a.score)
                            .expect("scores are finite")
                            .then(a.instance.cmp(&b.instance))
                    });
                    candidates.truncate(self.config.counterfactual_k);
                    let trace = RoutingTrace {
                        time: now,
                        request: id,
                        policy: self.router.name(),
                        chosen,
                        regret,
                        candidates,
                    };
                    self.emit_routing(trace);
                }

                self.instances[chosen.0]
                    .schedule_queued(id, now + self.config.inject_latency);
            }
            other => unreachable!("cluster queue held instance event {other:?}"),
        }
        Ok(())
    }

    fn dispatch_instance(&mut self, index: usize, event: Event) -> Result<(), SimError> {
        let now = event.time;
        match event.kind {
            EventKind::Queued(id) => {
                self.pending[index] -= 1;
                let request = self.in_flight.remove(&id).expect("queued unknown request");
                self.instances[index].enqueue(request, now);
                self.emit_lifecycle(LifecycleTrace {
                    time: now,
                    request: id,
                    instance: InstanceId(index),
                    event: LifecycleEvent::Queued,
                });
            }
            EventKind::Step => {
                let outcome = self.instances[index].step(now);
                let (free, used, total) = self.instances[index].kv_accounts();
                if free + used != total {
                    return Err(SimError::KvConservation {
                        instance: InstanceId(index),
                        free,
                        used,
                        total,
                    });
                }
                if self.config.trace_level >= TraceLevel::Full {
                    for id in &outcome.preempted {
                        self.emit_lifecycle(LifecycleTrace {
                            time: now,
                            request: *id,
                            instance: InstanceId(index),
                            event: LifecycleEvent::Preempted,
                        });
                    }
                    let ready = now + outcome.duration;
                    for id in &outcome.completed {
                        self.emit_lifecycle(LifecycleTrace {
                            time: ready,
                            request: *id,
                            instance: InstanceId(index),
                            event: LifecycleEvent::Completed,
                        });
                    }
                    for id in &outcome.dropped {
                        self.emit_lifecycle(LifecycleTrace {
                            time: now,
                            request: *id,
                            instance: InstanceId(index),
                            event: LifecycleEvent::Dropped,
                        });
                    }
                }
            }
            other => unreachable!("instance queue held cluster event {other:?}"),
        }
        Ok(())
    }

    fn build_snapshots(&mut self) -> BTreeMap<InstanceId, RoutingSnapshot> {
        let interval = self.config.snapshot_refresh_interval;
        let stale = match self.tier3_at {
            None => true,
            Some(at) => interval == 0 || self.clock.saturating_sub(at) >= interval,
        };
        if stale {
            for (signals, instance) in self.tier3.iter_mut().zip(&self.instances) {
                *signals = Tier3Signals {
                    kv_utilization: instance.kv_utilization(),
                    free_blocks: instance.kv_free_blocks(),
                    cache_hit_rate: instance.cache_hit_rate(),
                };
            }
            self.tier3_at = Some(self.clock);
        }
        self.instances
            .iter()
            .enumerate()
            .map(|(index, instance)| {
                let signals = &self.tier3[index];
                (
                    InstanceId(index),
                    RoutingSnapshot {
                        // Tier 2: read at snapshot-build time.
                        queue_depth: instance.queue_depth(),
                        batch_size: instance.batch_size(),
                        // Tier 1: router-owned, always fresh.
                        pending_requests: self.pending[index],
                        // Tier 3: refreshed on the configured cadence.
                        kv_utilization: signals.kv_utilization,
                        free_blocks: signals.free_blocks,
                        cache_hit_rate: signals.cache_hit_rate,
                    },
                )
            })
            .collect()
    }

    fn emit_admission(&mut self, record: AdmissionTrace) {
        if self.config.trace_level >= TraceLevel::Decisions {
            if let Some(sink) = &mut self.external_sink {
                sink.admission(record.clone());
            }
            self.trace.admission(record);
        }
    }

    fn emit_routing(&mut self, record: RoutingTrace) {
        if let Some(sink) = &mut self.external_sink {
            sink.routing(record.clone());
        }
        self.trace.routing(record);
    }

    fn emit_lifecycle(&mut self, record: LifecycleTrace) {
        if self.config.trace_level >= TraceLevel::Full {
            if let Some(sink) = &mut self.external_sink {
                sink.lifecycle(record.clone());
            }
            self.trace.lifecycle(record);
        }
    }

    fn finish(&mut self) -> Result<SimulationReport, SimError> {
        let single_instance = self.instances.len() == 1;
        let mut all: Vec<Request> = Vec::new();
        all.append(&mut self.rejected);
        // Requests that never reached an instance are in flight at horizon.
        all.extend(std::mem::take(&mut self.in_flight).into_values());
        let mut kv = KvStats::default();
        let mut preemption_events = 0;
        for instance in &mut self.instances {
            all.extend(instance.take_finished());
            all.extend(instance.drain_in_flight());
            let stats = instance.kv_stats();
            kv.hits += stats.hits;
            kv.misses += stats.misses;
            kv.evictions += stats.evictions;
            kv.offloads += stats.offloads;
            kv.promotions += stats.promotions;
            preemption_events += instance.preemptions_total();
        }
        all.sort_by_key(|request| request.id);

        let records: Vec<RequestRecord> = all
            .iter()
            .map(|request| RequestRecord::from_request(request, single_instance))
            .collect();
        let aggregate = AggregateReport::from_records(&records, kv, preemption_events);

        // Request conservation: every arrival is accounted for exactly once.
        let accounted =
            aggregate.rejected + aggregate.dropped + aggregate.completed + aggregate.in_flight;
        if accounted != self.arrivals {
            return Err(SimError::RequestConservation {
                arrivals: self.arrivals,
                rejected: aggregate.rejected,
                dropped: aggregate.dropped,
                completed: aggregate.completed,
                in_flight: aggregate.in_flight,
            });
        }

        tracing::info!(
            clock = self.clock,
            completed = aggregate.completed,
            rejected = aggregate.rejected,
            dropped = aggregate.dropped,
            in_flight = aggregate.in_flight,
            "simulation finished"
        );
        let trace = (self.config.trace_level > TraceLevel::Off).then(|| self.trace.summarize());
        Ok(SimulationReport {
            records,
            aggregate,
            trace,
        })
    }
}
