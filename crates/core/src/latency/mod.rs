//! Step-time estimation.
//!
//! Two interchangeable models feed step durations back into the event loop:
//! a trained blackbox regression and an analytical roofline model backed by
//! MFU lookup tables. All times are simulated microseconds.

mod blackbox;
pub mod mfu;
mod roofline;

pub use self::blackbox::BlackboxModel;
pub use self::roofline::RooflineModel;

use crate::error::SimError;
use blis_config::{HardwareConfig, ModelConfig, SimulationConfig};
use blis_types::Ticks;

/// Fixed per-step scheduler overhead charged by both models.
pub const SCHEDULING_OVERHEAD_TICKS: Ticks = 5;
/// Fixed overhead charged per preempted request.
pub const PREEMPTION_OVERHEAD_TICKS: Ticks = 50;

/// A prefill participant of one step.
#[derive(Copy, Clone, Debug)]
pub struct PrefillEntry {
    /// Tokens already prefilled before this step.
    pub progress: usize,
    /// New prefill tokens this step (the chunk).
    pub new_tokens: usize,
}

/// A decode participant of one step.
#[derive(Copy, Clone, Debug)]
pub struct DecodeEntry {
    /// Context length the new token attends over.
    pub progress: usize,
}

/// Shape of one continuous-batching step, as handed to a latency model.
#[derive(Clone, Debug, Default)]
pub struct StepBatch {
    pub prefill: Vec<PrefillEntry>,
    pub decode: Vec<DecodeEntry>,
}

impl StepBatch {
    pub fn prefill_tokens(&self) -> usize {
        self.prefill.iter().map(|entry| entry.new_tokens).sum()
    }

    pub fn decode_tokens(&self) -> usize {
        self.decode.len()
    }

    pub fn batch_size(&self) -> usize {
        self.prefill.len() + self.decode.len()
    }
}

/// Step-time estimator. Implementations must be deterministic: identical
/// batches produce identical ticks, map iteration is over sorted keys and
/// floating-point summation order is fixed.
pub trait LatencyModel {
    /// Duration of one step over the whole batch. Called once per step.
    fn step_time(&self, batch: &StepBatch) -> Ticks;

    /// Front-end delay before a freshly queued request can join a batch.
    fn queueing_time(&self, input_tokens: usize) -> Ticks;

    /// Per-output-token post-processing overhead.
    fn output_token_time(&self) -> Ticks;

    /// Per-step scheduler overhead.
    fn scheduling_time(&self) -> Ticks {
        SCHEDULING_OVERHEAD_TICKS
    }

    /// Overhead charged for each preemption performed while forming a batch.
    fn preemption_time(&self) -> Ticks {
        PREEMPTION_OVERHEAD_TICKS
    }
}

/// Build one model per instance. Roofline construction loads the MFU
/// database (once, shared by clone) and is fatal on missing bench data;
/// nothing fails at steady state.
pub fn build_models(
    config: &SimulationConfig,
    model: &ModelConfig,
    hardware: &HardwareConfig,
    count: usize,
) -> Result<Vec<Box<dyn LatencyModel>>, SimError> {
    if config.roofline {
        let bench_root = config
            .bench_data_path
            .as_deref()
            .ok_or_else(|| SimError::LatencyModel("roofline requires --bench-data-path".into()))?;
        let db = mfu::MfuDb::load(bench_root, &hardware.name)?;
        (0..count)
            .map(|_| {
                Ok(Box::new(RooflineModel::new(
                    model.clone(),
                    hardware.clone(),
                    config.tensor_parallel,
                    db.clone(),
                )?) as Box<dyn LatencyModel>)
            })
            .collect()
    } else {
        (0..count)
            .map(|_| Ok(Box::new(BlackboxModel::new(&config.latency)?) as Box<dyn LatencyModel>))
            .collect()
    }
}
