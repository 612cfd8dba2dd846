use super::mfu::{AttnKey, MfuDb};
use super::{DecodeEntry, LatencyModel, PrefillEntry, StepBatch};
use crate::error::SimError;
use blis_config::constants::{
    CAUSAL_MASK_DISCOUNT, DECODE_ACT_ACCESS_DISCOUNT, DECODE_KV_ACCESS_DISCOUNT, MIN_STEP_TICKS,
    PREFILL_ACT_ACCESS_DISCOUNT, PREFILL_BUCKET_MAX, PREFILL_BUCKET_MIN,
    PREFILL_KV_ACCESS_DISCOUNT,
};
use blis_config::{HardwareConfig, ModelConfig};
use blis_types::Ticks;
use std::collections::BTreeMap;

/// Front-end enqueue cost per input token, in microseconds.
const QUEUEING_PER_TOKEN_TICKS: f64 = 0.1;
/// Front-end enqueue base cost, in microseconds.
const QUEUEING_BASE_TICKS: f64 = 50.0;
/// Detokenization and stream-out cost per produced token, in microseconds.
const OUTPUT_TOKEN_TICKS: Ticks = 10;

/// Analytical roofline estimator: per-phase `max(compute, memory)` with
/// MFU-corrected compute and access-discounted memory traffic.
///
/// Compute covers the seven per-layer GEMMs (Q, K, V, O, gate, up, down)
/// with a weight-load floor per projection, plus the attention core with a
/// FLOPs-weighted mean MFU over the batch. Prefill requests are bucketed by
/// power-of-two sequence length; a mixed batch costs
/// `max(prefill, decode) + cpu_overhead`.
#[derive(Debug)]
pub struct RooflineModel {
    model: ModelConfig,
    hardware: HardwareConfig,
    tp: usize,
    mfu: MfuDb,
    /// `(k, n)` of the seven per-layer projections, sharded for TP.
    projections: [(usize, usize); 7],
    heads_per_gpu: usize,
}

impl RooflineModel {
    pub fn new(
        model: ModelConfig,
        hardware: HardwareConfig,
        tp: usize,
        mfu: MfuDb,
    ) -> Result<Self, SimError> {
        if tp == 0 || !tp.is_power_of_two() {
            return Err(SimError::LatencyModel(format!(
                "tensor-parallel degree must be a positive power of two, got {tp}"
            )));
        }
        if model.num_heads % tp != 0 {
            return Err(SimError::LatencyModel(format!(
                "tp={tp} does not divide {} attention heads",
                model.num_heads
            )));
        }
        if !mfu.has_tp(tp as u64) {
            return Err(SimError::LatencyModel(format!(
                "bench data has no decode table for tp={tp}"
            )));
        }
        let hidden = model.hidden_dim;
        let q_out = model.num_heads * model.head_dim / tp;
        // KV heads replicate once tp exceeds their count.
        let kv_out = (model.num_kv_heads * model.head_dim).div_ceil(tp).max(model.head_dim);
        let inter = model.intermediate_dim / tp;
        let projections = [
            (hidden, q_out),  // Q
            (hidden, kv_out), // K
            (hidden, kv_out), // V
            (q_out, hidden),  // O
            (hidden, inter),  // gate
            (hidden, inter),  // up
            (inter, hidden),  // down
        ];
        let heads_per_gpu = model.num_heads / tp;
        Ok(Self {
            model,
            hardware,
            tp,
            mfu,
            projections,
            heads_per_gpu,
        })
    }

    fn attn_key(&self) -> AttnKey {
        (
            self.model.num_heads as u64,
            self.model.num_kv_heads as u64,
            self.model.head_dim as u64,
        )
    }

    /// GEMM time for all projections across all layers at row count `m`,
    /// in microseconds. Each projection pays at least its weight-load
    /// floor.
    fn gemm_time(&self, m: usize) -> f64 {
        let flops_per_tick = self.hardware.flops_per_tick();
        let bytes_per_tick = self.hardware.effective_bytes_per_tick();
        let mut per_layer = 0.0;
        for (k, n) in self.projections {
            let flops = 2.0 * m as f64 * k as f64 * n as f64;
            let mfu = self.mfu.gemm(m as u64, k as u64, n as u64);
            let compute = flops / (flops_per_tick * mfu);
            let weight_floor =
                (k as f64 * n as f64 * self.model.bytes_per_param as f64) / bytes_per_tick;
            per_layer += compute.max(weight_floor);
        }
        per_layer * self.model.num_layers as f64
    }

    fn decode_time(&self, decode: &[DecodeEntry]) -> f64 {
        if decode.is_empty() {
            return 0.0;
        }
        let flops_per_tick = self.hardware.flops_per_tick();
        let bytes_per_tick = self.hardware.effective_bytes_per_tick();
        let batch = decode.len();

        let gemm = self.gemm_time(batch);

        // Attention core: FLOPs-weighted mean MFU over the batch, summed in
        // batch order.
        let mut flops_total = 0.0;
        let mut flops_weighted = 0.0;
        for entry in decode {
            let flops = 4.0
                * self.heads_per_gpu as f64
                * entry.progress as f64
                * self.model.head_dim as f64
                * self.model.num_layers as f64;
            let mfu = self.mfu.decode(
                self.tp as u64,
                self.attn_key(),
                batch as u64,
                entry.progress as u64,
            );
            flops_total += flops;
            flops_weighted += flops * mfu;
        }
        let attention = if flops_total > 0.0 {
            let effective_mfu = flops_weighted / flops_total;
            flops_total / (flops_per_tick * effective_mfu)
        } else {
            0.0
        };
        let compute = gemm + attention;

        let weights = self.model.weight_bytes() as f64 / self.tp as f64;
        let kv_tokens: usize = decode.iter().map(|entry| entry.progress).sum();
        let kv_bytes =
            kv_tokens as f64 * self.model.kv_bytes_per_token() as f64 / self.tp as f64;
        let act_bytes = batch as f64
            * self.model.hidden_dim as f64
            * self.model.bytes_per_param as f64
            * self.model.num_layers as f64
            / self.tp as f64;
        let memory = weights / bytes_per_tick
            + kv_bytes / (bytes_per_tick * DECODE_KV_ACCESS_DISCOUNT)
            + act_bytes / (bytes_per_tick * DECODE_ACT_ACCESS_DISCOUNT);

        compute.max(memory)
    }

    fn prefill_time(&self, prefill: &[PrefillEntry]) -> f64 {
        if prefill.is_empty() {
            return 0.0;
        }
        let flops_per_tick = self.hardware.flops_per_tick();
        let bytes_per_tick = self.hardware.effective_bytes_per_tick();

        // Bucket by power-of-two sequence length; iterate buckets in sorted
        // order so the summation order is fixed.
        let mut buckets: BTreeMap<u64, Vec<PrefillEntry>> = BTreeMap::new();
        for entry in prefill {
            let seq_len = entry.progress + entry.new_tokens;
            let bucket = seq_len
                .next_power_of_two()
                .clamp(PREFILL_BUCKET_MIN, PREFILL_BUCKET_MAX) as u64;
            buckets.entry(bucket).or_default().push(*entry);
        }

        let mut compute = 0.0;
        for (bucket, entries) in &buckets {
            let m: usize = entries.iter().map(|entry| entry.new_tokens).sum();
            let gemm = self.gemm_time(m);

            let mut flops_total = 0.0;
            let mut flops_weighted = 0.0;
            for entry in entries {
                let seq_len = entry.progress + entry.new_tokens;
                // Causal masking touches only the lower triangle; the
                // discount is calibrated on H100.
                let flops = 4.0
                    * self.heads_per_gpu as f64
                    * self.model.head_dim as f64
                    * self.model.num_layers as f64
                    * entry.new_tokens as f64
                    * seq_len as f64
                    / CAUSAL_MASK_DISCOUNT;
                let mfu = self.mfu.prefill(self.attn_key(), *bucket);
                flops_total += flops;
                flops_weighted += flops * mfu;
            }
            let attention = if flops_total > 0.0 {
                let effective_mfu = flops_weighted / flops_total;
                flops_total / (flops_per_tick * effective_mfu)
            } else {
                0.0
            };
            compute += gemm + attention;
        }

        let weights = self.model.weight_bytes() as f64 / self.tp as f64;
        let kv_tokens: usize = prefill
            .iter()
            .map(|entry| entry.progress + entry.new_tokens)
            .sum();
        let kv_bytes =
            kv_tokens as f64 * self.model.kv_bytes_per_token() as f64 / self.tp as f64;
        let new_tokens: usize = prefill.iter().map(|entry| entry.new_tokens).sum();
        let act_bytes = new_tokens as f64
            * self.model.hidden_dim as f64
            * self.model.bytes_per_param as f64
            * self.model.num_layers as f64
            / self.tp as f64;
        let memory = weights / bytes_per_tick
            + kv_bytes / (bytes_per_tick * PREFILL_KV_ACCESS_DISCOUNT)
            + act_bytes / (bytes_per_tick * PREFILL_ACT_ACCESS_DISCOUNT);

        compute.max(memory)
    }

    fn cpu_overhead(&self) -> f64 {
        self.hardware.per_layer_cpu_overhead_us * self.model.num_layers as f64 / self.tp as f64
    }
}

impl LatencyModel for RooflineModel {
    fn step_time(&self, batch: &StepBatch) -> Ticks {
        if batch.batch_size() == 0 {
            return 0;
        }
        // Prefill and decode kernels are assumed to overlap-schedule; the
        // slower phase dominates.
        let ticks = self.prefill_time(&batch.prefill).max(self.decode_time(&batch.decode))
            + self.cpu_overhead();
        (ticks.ceil() as Ticks).max(MIN_STEP_TICKS)
    }

    fn queueing_time(&self, input_tokens: usize) -> Ticks {
        (QUEUEING_BASE_TICKS + QUEUEING_PER_TOKEN_TICKS * input_tokens as f64).round() as Ticks
    }

    fn output_token_time(&self) -> Ticks {
        OUTPUT_TOKEN_TICKS
    }
}
