//! Per-request output records and aggregated metrics.

use crate::kv::KvStats;
use crate::request::Request;
use blis_types::{ticks_ms, DropReason, RequestState, SloClass, Ticks};
use serde::Serialize;
use std::collections::BTreeMap;

/// One line of the stdout record stream. Field names are a stable contract
/// consumed by downstream analysis.
#[derive(Clone, Debug, Serialize)]
pub struct RequestRecord {
    pub id: u64,
    #[serde(with = "ticks_ms")]
    pub arrival_time: Ticks,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub ttft_ms: Option<f64>,
    pub e2e_ms: Option<f64>,
    pub itl_ms: Vec<f64>,
    pub state: RequestState,
    pub preemption_count: u32,
    /// Omitted on single-instance runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handled_by: Option<usize>,
    pub slo_class: SloClass,
    pub tenant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drop_reason: Option<DropReason>,
}

fn ms(ticks: Ticks) -> f64 {
    ticks as f64 / 1_000.0
}

impl RequestRecord {
    pub fn from_request(request: &Request, single_instance: bool) -> Self {
        Self {
            id: request.id.0,
            arrival_time: request.arrival,
            input_tokens: request.input_tokens,
            output_tokens: request.output_tokens,
            ttft_ms: request
                .first_token_at
                .map(|at| ms(at.saturating_sub(request.arrival))),
            e2e_ms: request
                .completed_at
                .filter(|_| request.state == RequestState::Completed)
                .map(|at| ms(at.saturating_sub(request.arrival))),
            itl_ms: request.itl.iter().map(|&gap| ms(gap)).collect(),
            state: request.state,
            preemption_count: request.preemption_count,
            handled_by: if single_instance {
                None
            } else {
                request.handled_by.map(|id| id.0)
            },
            slo_class: request.slo_class,
            tenant_id: request.tenant.clone(),
            drop_reason: request.drop_reason,
        }
    }
}

/// Mean and nearest-rank percentiles over one latency dimension, in
/// milliseconds.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    pub count: usize,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

impl LatencyStats {
    pub fn from_values(mut values: Vec<f64>) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        values.sort_by(|a, b| a.partial_cmp(b).expect("latencies are finite"));
        let count = values.len();
        let mean = values.iter().sum::<f64>() / count as f64;
        let rank = |p: f64| {
            let index = ((p / 100.0 * count as f64).ceil() as usize).max(1) - 1;
            values[index.min(count - 1)]
        };
        Self {
            count,
            mean,
            p50: rank(50.0),
            p95: rank(95.0),
            p99: rank(99.0),
        }
    }
}

/// End-of-run aggregate over the full record set.
#[derive(Clone, Debug, Default, Serialize)]
pub struct AggregateReport {
    pub arrivals: usize,
    pub completed: usize,
    pub dropped: usize,
    pub rejected: usize,
    pub in_flight: usize,
    /// Requests preempted at least once.
    pub preempted_requests: usize,
    pub preemption_events: u64,

    pub ttft: LatencyStats,
    pub e2e: LatencyStats,
    pub itl: LatencyStats,
    pub per_slo_ttft: BTreeMap<SloClass, LatencyStats>,
    pub per_slo_e2e: BTreeMap<SloClass, LatencyStats>,

    pub throughput_rps: f64,
    pub output_tokens_per_sec: f64,
    pub jain_fairness: f64,
    pub kv: KvStats,
}

impl AggregateReport {
    pub fn from_records(records: &[RequestRecord], kv: KvStats, preemption_events: u64) -> Self {
        let mut report = AggregateReport {
            arrivals: records.len(),
            kv,
            preemption_events,
            ..Default::default()
        };

        let mut ttft = Vec::new();
        let mut e2e = Vec::new();
        let mut itl = Vec::new();
        let mut per_slo: BTreeMap<SloClass, Vec<f64>> = BTreeMap::new();
        let mut per_slo_e2e: BTreeMap<SloClass, Vec<f64>> = BTreeMap::new();
        let mut per_tenant_tokens: BTreeMap<&str, f64> = BTreeMap::new();
        let mut completed_tokens = 0usize;
        let mut last_completion_ms = 0.0f64;
        let mut first_arrival_ms = f64::INFINITY;

        for record in records {
            match record.state {
                RequestState::Completed => {
                    report.completed += 1;
                    completed_tokens += record.output_tokens;
                    if let Some(tenant) = &record.tenant_id {
                        *per_tenant_tokens.entry(tenant).or_default() +=
                            record.output_tokens as f64;
                    }
                }
                RequestState::Dropped => match record.drop_reason {
                    Some(DropReason::AdmissionRejected) => report.rejected += 1,
                    _ => report.dropped += 1,
                },
                _ => report.in_flight += 1,
            }
            if record.preemption_count > 0 {
                report.preempted_requests += 1;
            }
            first_arrival_ms = first_arrival_ms.min(ms(record.arrival_time));
            if let Some(value) = record.ttft_ms {
                ttft.push(value);
                per_slo.entry(record.slo_class).or_default().push(value);
            }
            if let Some(value) = record.e2e_ms {
                e2e.push(value);
                per_slo_e2e.entry(record.slo_class).or_default().push(value);
                last_completion_ms = last_completion_ms.max(ms(record.arrival_time) + value);
            }
            itl.extend(record.itl_ms.iter().copied());
        }

        report.ttft = LatencyStats::from_values(ttft);
        report.e2e = LatencyStats::from_values(e2e);
        report.itl = LatencyStats::from_values(itl);
        report.per_slo_ttft = per_slo
            .into_iter()
            .map(|(class, values)| (class, LatencyStats::from_values(values)))
            .collect();
        report.per_slo_e2e = per_slo_e2e
            .into_iter()
            .map(|(class, values)| (class, LatencyStats::from_values(values)))
            .collect();

        let span_secs = (last_completion_ms - first_arrival_ms.min(last_completion_ms)) / 1_000.0;
        if span_secs > 0.0 {
            report.throughput_rps = report.completed as f64 / span_secs;
            report.output_tokens_per_sec = completed_tokens as f64 / span_secs;
        }
        report.jain_fairness = jain_index(per_tenant_tokens.values().copied());
        report
    }
}

/// Jain fairness index over per-tenant shares: `(Σx)² / (n·Σx²)`; 1.0 for
/// perfectly even shares and for degenerate inputs.
pub fn jain_index(shares: impl Iterator<Item = f64>) -> f64 {
    let shares: Vec<f64> = shares.filter(|x| *x > 0.0).collect();
    if shares.is_empty() {
        return 1.0;
    }
    let sum: f64 = shares.iter().sum();
    let sum_sq: f64 = shares.iter().map(|x| x * x).sum();
    if sum_sq == 0.0 {
        return 1.0;
    }
    (sum * sum) / (shares.len() as f64 * sum_sq)
}

/// User-configurable fitness weighting. Latency terms normalize as
/// `1/(1 + x_ms/1000)` and throughput as `x/(x + ref)` so the two kinds of
/// metric are commensurate.
#[derive(Copy, Clone, Debug, Serialize)]
pub struct FitnessWeights {
    pub ttft: f64,
    pub e2e: f64,
    pub throughput: f64,
    /// Reference output-token rate for the throughput term.
    pub throughput_ref: f64,
}

impl Default for FitnessWeights {
    fn default() -> Self {
        Self {
            ttft: 1.0,
            e2e: 1.0,
            throughput: 1.0,
            throughput_ref: 1000.0,
        }
    }
}

pub fn fitness_score(report: &AggregateReport, weights: &FitnessWeights) -> f64 {
    let latency_term = |ms: f64| 1.0 / (1.0 + ms / 1000.0);
    let throughput = report.output_tokens_per_sec;
    let throughput_term = if throughput + weights.throughput_ref > 0.0 {
        throughput / (throughput + weights.throughput_ref)
    } else {
        0.0
    };
    let weight_sum = weights.ttft + weights.e2e + weights.throughput;
    if weight_sum <= 0.0 {
        return 0.0;
    }
    (weights.ttft * latency_term(report.ttft.mean)
        + weights.e2e * latency_term(report.e2e.mean)
        + weights.throughput * throughput_term)
        / weight_sum
}
