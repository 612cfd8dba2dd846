use super::{LatencyModel, StepBatch};
use crate::error::SimError;
use blis_config::LatencyCoefficients;
use blis_types::Ticks;

/// Linear regression fitted against measured step traces:
/// `step = β₀ + β₁·prefill_tokens + β₂·decode_tokens`,
/// `queueing = α₀ + α₁·input_len`, per-output-token overhead `α₂`.
#[derive(Clone, Debug)]
pub struct BlackboxModel {
    alpha: [f64; 3],
    beta: [f64; 3],
}

impl BlackboxModel {
    pub fn new(coefficients: &LatencyCoefficients) -> Result<Self, SimError> {
        coefficients
            .validate()
            .map_err(|err| SimError::LatencyModel(err.to_string()))?;
        // Negative slopes would make more work finish faster.
        for (name, value) in [
            ("beta1", coefficients.beta[1]),
            ("beta2", coefficients.beta[2]),
            ("alpha1", coefficients.alpha[1]),
            ("alpha2", coefficients.alpha[2]),
        ] {
            if value < 0.0 {
                return Err(SimError::LatencyModel(format!(
                    "coefficient {name} must be non-negative, got {value}"
                )));
            }
        }
        Ok(Self {
            alpha: coefficients.alpha,
            beta: coefficients.beta,
        })
    }
}

impl LatencyModel for BlackboxModel {
    fn step_time(&self, batch: &StepBatch) -> Ticks {
        if batch.batch_size() == 0 {
            return 0;
        }
        let ticks = self.beta[0]
            + self.beta[1] * batch.prefill_tokens() as f64
            + self.beta[2] * batch.decode_tokens() as f64;
        (ticks.max(0.0).round() as Ticks).max(1)
    }

    fn queueing_time(&self, input_tokens: usize) -> Ticks {
        let ticks = self.alpha[0] + self.alpha[1] * input_tokens as f64;
        ticks.max(0.0).round() as Ticks
    }

    fn output_token_time(&self) -> Ticks {
        self.alpha[2].max(0.0).round() as Ticks
    }
}
