use crate::cli::Cli;
use anyhow::Context;
use blis_common::shell::{get_shell, OutputMode};
use blis_common::{sh_eprintln, sh_err, sh_record};
use blis_config::{HardwareConfig, ModelConfig, OutputFormat, SimulationConfig};
use blis_core::metrics::{fitness_score, FitnessWeights};
use blis_core::rng::PartitionedRng;
use blis_core::{workload, ClusterSimulator, SimulationReport};
use blis_types::LogLevel;
use clap::Parser;
use colored::Colorize;
use tabled::settings::Style;
use tabled::{Table, Tabled};
use tracing_subscriber::filter::LevelFilter;

mod cli;

fn main() {
    let opt = Cli::parse();
    if let Err(err) = run(opt) {
        sh_err!("{err:#}");
        std::process::exit(1);
    }
}

fn init_tracing(log_level: Option<LogLevel>) {
    let level = match log_level.unwrap_or_default() {
        LogLevel::Trace => LevelFilter::TRACE,
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Error => LevelFilter::ERROR,
    };
    // Diagnostics go to stderr; stdout belongs to the record stream.
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(opt: Cli) -> anyhow::Result<()> {
    if opt.silent {
        get_shell().output_mode = OutputMode::Quiet;
    }
    init_tracing(opt.log_level);

    let fitness = opt.fitness.then(|| FitnessWeights {
        ttft: opt.fitness_weights.as_ref().map_or(1.0, |w| w[0]),
        e2e: opt.fitness_weights.as_ref().map_or(1.0, |w| w[1]),
        throughput: opt.fitness_weights.as_ref().map_or(1.0, |w| w[2]),
        throughput_ref: opt.fitness_throughput_ref.unwrap_or(1000.0),
    });
    let metrics_file = opt.metrics_file.clone();
    let trace_file = opt.trace_file.clone();

    let config = opt.into_simulation_config()?;
    config.validate()?;

    let model = match &config.model_config_path {
        Some(path) => ModelConfig::from_json_file(path)?,
        None => ModelConfig::builtin(&config.model)?,
    };
    let hardware = HardwareConfig::builtin(&config.gpu)?;
    tracing::info!(
        model = %model.name,
        gpu = %hardware.name,
        tp = config.tensor_parallel,
        instances = config.num_instances,
        roofline = config.roofline,
        "starting simulation"
    );

    let mut rng = PartitionedRng::new(config.seed);
    let requests = workload::generate(&config.workload, config.block_size, &mut rng);
    tracing::info!(requests = requests.len(), "workload generated");

    let mut cluster = ClusterSimulator::new(config.clone(), &model, &hardware)?;
    let report = cluster.run(requests)?;

    emit(&config, &report, fitness)?;

    if let Some(path) = metrics_file {
        let json = serde_json::to_string_pretty(&report.aggregate)?;
        std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
    }
    if let Some(path) = trace_file {
        let summary = report
            .trace
            .as_ref()
            .context("--trace-file requires --trace-level decisions or full")?;
        let json = serde_json::to_string_pretty(summary)?;
        std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
    }
    Ok(())
}

#[derive(Tabled)]
struct SummaryRow {
    metric: &'static str,
    value: String,
}

fn emit(
    config: &SimulationConfig,
    report: &SimulationReport,
    fitness: Option<FitnessWeights>,
) -> anyhow::Result<()> {
    if matches!(config.output, OutputFormat::Jsonl | OutputFormat::Both) {
        for record in &report.records {
            sh_record!("{}", serde_json::to_string(record)?);
        }
    }
    if matches!(config.output, OutputFormat::Summary | OutputFormat::Both) {
        sh_eprintln!("{}", format!("blis summary (seed {})", config.seed).bold());
        let aggregate = &report.aggregate;
        let ms = |v: f64| format!("{v:.2} ms");
        let mut rows = vec![
            SummaryRow {
                metric: "requests",
                value: format!(
                    "{} arrived / {} completed / {} rejected / {} dropped / {} in flight",
                    aggregate.arrivals,
                    aggregate.completed,
                    aggregate.rejected,
                    aggregate.dropped,
                    aggregate.in_flight
                ),
            },
            SummaryRow {
                metric: "ttft mean/p50/p95/p99",
                value: format!(
                    "{} / {} / {} / {}",
                    ms(aggregate.ttft.mean),
                    ms(aggregate.ttft.p50),
                    ms(aggregate.ttft.p95),
                    ms(aggregate.ttft.p99)
                ),
            },
            SummaryRow {
                metric: "e2e mean/p50/p95/p99",
                value: format!(
                    "{} / {} / {} / {}",
                    ms(aggregate.e2e.mean),
                    ms(aggregate.e2e.p50),
                    ms(aggregate.e2e.p95),
                    ms(aggregate.e2e.p99)
                ),
            },
            SummaryRow {
                metric: "itl mean/p50/p95/p99",
                value: format!(
                    "{} / {} / {} / {}",
                    ms(aggregate.itl.mean),
                    ms(aggregate.itl.p50),
                    ms(aggregate.itl.p95),
                    ms(aggregate.itl.p99)
                ),
            },
            SummaryRow {
                metric: "throughput",
                value: format!(
                    "{:.1} req/s, {:.0} tok/s",
                    aggregate.throughput_rps, aggregate.output_tokens_per_sec
                ),
            },
            SummaryRow {
                metric: "kv cache",
                value: format!(
                    "{} hits / {} misses / {} evictions / {} offloads / {} promotions",
                    aggregate.kv.hits,
                    aggregate.kv.misses,
                    aggregate.kv.evictions,
                    aggregate.kv.offloads,
                    aggregate.kv.promotions
                ),
            },
            SummaryRow {
                metric: "preemptions",
                value: format!(
                    "{} events across {} requests",
                    aggregate.preemption_events, aggregate.preempted_requests
                ),
            },
            SummaryRow {
                metric: "jain fairness",
                value: format!("{:.4}", aggregate.jain_fairness),
            },
        ];
        if let Some(weights) = &fitness {
            rows.push(SummaryRow {
                metric: "fitness",
                value: format!("{:.4}", fitness_score(aggregate, weights)),
            });
        }
        if let Some(trace) = &report.trace {
            rows.push(SummaryRow {
                metric: "routing regret mean/max",
                value: format!("{:.4} / {:.4}", trace.mean_regret, trace.max_regret),
            });
        }
        let table = Table::new(rows).with(Style::sharp()).to_string();
        sh_eprintln!("{table}");
    }
    Ok(())
}
