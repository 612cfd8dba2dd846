//! End-to-end cluster scenarios: determinism, conservation, preemption,
//! admission control, prefix affinity and model interchangeability.

use blis_config::{
    AdmissionKind, ArrivalSpec, ClientSpec, LengthSpec, PrefixSpec, RoutingKind, SimulationConfig,
    TraceLevel, WorkloadSpec,
};
use blis_config::{HardwareConfig, ModelConfig};
use blis_core::metrics::RequestRecord;
use blis_core::rng::PartitionedRng;
use blis_core::{workload, ClusterSimulator, SimulationReport};
use blis_types::SloClass;
use std::path::PathBuf;

fn client(rate: f64, input: usize, output: usize, num_requests: usize) -> ClientSpec {
    ClientSpec {
        name: "bench".to_string(),
        tenant: None,
        slo_class: SloClass::Standard,
        arrival: ArrivalSpec::Poisson { rate },
        input_len: LengthSpec::Fixed { value: input },
        output_len: LengthSpec::Fixed { value: output },
        num_requests,
        prefix: None,
    }
}

fn base_config(seed: u64) -> SimulationConfig {
    let mut config = SimulationConfig::default();
    config.seed = seed;
    config.horizon = 3_600_000_000;
    config.workload = WorkloadSpec::Single(client(50.0, 512, 64, 200));
    config
}

fn run(config: &SimulationConfig) -> SimulationReport {
    let model = ModelConfig::builtin(&config.model).unwrap();
    let hardware = HardwareConfig::builtin(&config.gpu).unwrap();
    let mut rng = PartitionedRng::new(config.seed);
    let requests = workload::generate(&config.workload, config.block_size, &mut rng);
    let mut cluster = ClusterSimulator::new(config.clone(), &model, &hardware).unwrap();
    cluster.run(requests).unwrap()
}

fn record_stream(records: &[RequestRecord]) -> String {
    records
        .iter()
        .map(|record| serde_json::to_string(record).unwrap())
        .collect::<Vec<_>>()
        .join("\n")
}

fn assert_conserved(report: &SimulationReport) {
    let aggregate = &report.aggregate;
    assert_eq!(
        aggregate.arrivals,
        aggregate.completed + aggregate.rejected + aggregate.dropped + aggregate.in_flight,
        "request conservation violated"
    );
}

#[test]
fn s1_single_instance_pure_stream_completes() {
    let config = base_config(42);
    let report = run(&config);
    assert_eq!(report.aggregate.completed, 200);
    assert_eq!(report.aggregate.rejected + report.aggregate.dropped, 0);
    assert!(report.aggregate.ttft.p99 >= report.aggregate.ttft.p50);
    assert_conserved(&report);
}

#[test]
fn s1_determinism_byte_identical_streams() {
    let config = base_config(42);
    let first = run(&config);
    let second = run(&config);
    assert_eq!(record_stream(&first.records), record_stream(&second.records));
    assert_eq!(
        serde_json::to_string(&first.aggregate).unwrap(),
        serde_json::to_string(&second.aggregate).unwrap()
    );
}

#[test]
fn s2_token_bucket_rejects_under_burst() {
    let mut config = base_config(42);
    config.workload = WorkloadSpec::Single(ClientSpec {
        arrival: ArrivalSpec::Gamma {
            shape: 0.5,
            rate: 500.0,
        },
        ..client(0.0, 512, 64, 200)
    });
    config.admission = AdmissionKind::TokenBucket;
    config.token_bucket_capacity = 2048.0;
    config.token_bucket_refill_rate = 25_600.0;

    let bucketed = run(&config);
    assert!(bucketed.aggregate.rejected > 0, "burst never tripped the bucket");
    assert!(bucketed.aggregate.completed > 0, "bucket starved everything");
    assert_conserved(&bucketed);

    // H5: shedding load cannot make the survivors slower.
    let mut open = config.clone();
    open.admission = AdmissionKind::Always;
    let open_report = run(&open);
    assert!(bucketed.aggregate.ttft.p99 <= open_report.aggregate.ttft.p99);
    assert_conserved(&open_report);
}

#[test]
fn s3_prefix_affinity_raises_hit_rate_and_lowers_ttft() {
    let mut shared = base_config(7);
    shared.num_instances = 4;
    shared.routing = RoutingKind::Weighted;
    shared.routing_scorers = vec![
        "prefix-affinity:3".parse().unwrap(),
        "queue-depth:2".parse().unwrap(),
        "kv-utilization:2".parse().unwrap(),
    ];
    shared.trace_level = TraceLevel::Decisions;
    shared.workload = WorkloadSpec::Single(ClientSpec {
        prefix: Some(PrefixSpec {
            groups: 10,
            prefix_tokens: 256,
        }),
        ..client(100.0, 512, 32, 400)
    });

    let mut cold = shared.clone();
    cold.workload = WorkloadSpec::Single(ClientSpec {
        prefix: None,
        ..client(100.0, 512, 32, 400)
    });

    let shared_report = run(&shared);
    let cold_report = run(&cold);
    assert_conserved(&shared_report);

    assert!(
        shared_report.aggregate.kv.hits > cold_report.aggregate.kv.hits,
        "shared prefixes produced no extra cache hits ({} vs {})",
        shared_report.aggregate.kv.hits,
        cold_report.aggregate.kv.hits
    );
    assert!(
        shared_report.aggregate.ttft.mean < cold_report.aggregate.ttft.mean,
        "prefix reuse did not lower mean TTFT"
    );

    // Property 9: the weighted policy never regrets its own argmax.
    let trace = shared_report.trace.unwrap();
    assert_eq!(trace.max_regret, 0.0);
}

#[test]
fn s4_preemption_under_kv_pressure() {
    let mut config = base_config(11);
    // Steady-state footprint of the stream comfortably exceeds 96 blocks.
    config.total_kv_blocks = 96;
    config.workload = WorkloadSpec::Single(client(200.0, 256, 128, 40));

    let report = run(&config);
    assert!(report.aggregate.preemption_events > 0, "no preemptions under pressure");
    assert!(report.aggregate.preempted_requests > 0);
    // No infinite preemption loops: the run drains.
    assert_eq!(report.aggregate.in_flight, 0);
    assert_conserved(&report);
}

#[test]
fn s4_oversized_requests_drop_with_reason() {
    let mut config = base_config(13);
    config.total_kv_blocks = 8; // 128 tokens of KV
    config.workload = WorkloadSpec::Single(client(50.0, 512, 16, 10));
    let report = run(&config);
    assert_eq!(report.aggregate.dropped, 10);
    assert!(report
        .records
        .iter()
        .all(|record| record.drop_reason
            == Some(blis_types::DropReason::OverCapacity)));
    assert_conserved(&report);
}

#[test]
fn s5_cluster_shared_clock_determinism() {
    let mut config = base_config(123);
    config.num_instances = 4;
    config.routing = RoutingKind::RoundRobin;
    config.trace_level = TraceLevel::Full;
    config.workload = WorkloadSpec::Single(client(200.0, 256, 64, 500));

    let first = run(&config);
    let second = run(&config);
    assert_eq!(record_stream(&first.records), record_stream(&second.records));
    // Completion ordering across instances is part of the contract.
    assert_eq!(first.trace.unwrap(), second.trace.unwrap());
    assert_eq!(first.aggregate.completed, 500);
}

#[test]
fn s6_roofline_and_blackbox_agree_on_shape() {
    let bench_data = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../bench_data");
    let mut blackbox = base_config(21);
    blackbox.workload = WorkloadSpec::Single(client(50.0, 512, 32, 40));

    let mut roofline = blackbox.clone();
    roofline.roofline = true;
    roofline.bench_data_path = Some(bench_data);

    let blackbox_report = run(&blackbox);
    let roofline_report = run(&roofline);
    assert_eq!(blackbox_report.aggregate.completed, 40);
    assert_eq!(roofline_report.aggregate.completed, 40);

    // Sanity band, not equality: the two models should land within two
    // orders of magnitude on the same workload.
    let ratio = roofline_report.aggregate.e2e.mean / blackbox_report.aggregate.e2e.mean;
    assert!(
        (0.01..=100.0).contains(&ratio),
        "model disagreement out of band: ratio {ratio}"
    );
}

#[test]
fn fcfs_first_tokens_follow_queue_order_without_preemption() {
    let mut config = base_config(5);
    // One full prefill per step: admission is strictly sequential.
    config.token_budget = 512;
    config.max_batch_size = 4;
    config.workload = WorkloadSpec::Single(client(1_000.0, 512, 16, 12));

    let report = run(&config);
    assert_eq!(report.aggregate.preemption_events, 0);
    let mut last_ttft_end = 0.0;
    for record in &report.records {
        let start = record.arrival_time as f64 / 1000.0 + record.ttft_ms.unwrap();
        assert!(
            start >= last_ttft_end,
            "request {} reached first token out of order",
            record.id
        );
        last_ttft_end = start;
    }
}

#[test]
fn tiered_cache_offloads_and_promotes() {
    let mut config = base_config(17);
    config.total_kv_blocks = 128;
    config.kv_tier = Some(blis_config::KvTierConfig {
        cpu_blocks: 256,
        offload_threshold: 0.5,
        transfer_bandwidth: 64e9,
    });
    config.workload = WorkloadSpec::Single(client(200.0, 256, 64, 60));
    let report = run(&config);
    assert!(report.aggregate.kv.offloads > 0, "gpu pressure never spilled to cpu");
    assert_conserved(&report);
}

#[test]
fn slo_classes_aggregate_separately() {
    let mut config = base_config(29);
    config.workload = WorkloadSpec::MultiClient {
        clients: vec![
            ClientSpec {
                name: "interactive".into(),
                tenant: Some("tenant-a".into()),
                slo_class: SloClass::Interactive,
                ..client(40.0, 128, 32, 60)
            },
            ClientSpec {
                name: "batch".into(),
                tenant: Some("tenant-b".into()),
                slo_class: SloClass::Batch,
                ..client(40.0, 1024, 64, 60)
            },
        ],
    };
    let report = run(&config);
    assert_eq!(report.aggregate.completed, 120);
    assert!(report.aggregate.per_slo_ttft.contains_key(&SloClass::Interactive));
    assert!(report.aggregate.per_slo_ttft.contains_key(&SloClass::Batch));
    // Two tenants with similar shares: fairness near 1.
    assert!(report.aggregate.jain_fairness > 0.5);
    assert!((0.0..=1.0).contains(&report.aggregate.jain_fairness));
}
