use crate::ConfigError;
use serde::{Deserialize, Serialize};

/// Per-GPU performance envelope used by the roofline model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HardwareConfig {
    pub name: String,
    /// Dense peak throughput in TFLOPS for the modeled dtype.
    pub tflops_peak: f64,
    /// Peak HBM bandwidth in TB/s.
    pub bw_peak_tbs: f64,
    /// Achieved fraction of peak bandwidth; 0.0 is the "disabled" sentinel
    /// and is treated as 1.0.
    #[serde(default)]
    pub bw_efficiency_factor: f64,
    /// CPU-side launch/scheduling overhead per transformer layer, in
    /// microseconds.
    #[serde(default)]
    pub per_layer_cpu_overhead_us: f64,
    pub memory_gib: f64,
}

impl HardwareConfig {
    /// Built-in GPU catalog keyed by the lowercase GPU name.
    pub fn builtin(name: &str) -> Result<Self, ConfigError> {
        let (tflops_peak, bw_peak_tbs, per_layer_cpu_overhead_us, memory_gib) =
            match name.to_ascii_lowercase().as_str() {
                "a100" => (312.0, 2.039, 2.5, 80.0),
                "h100" => (989.0, 3.35, 2.0, 80.0),
                "h200" => (989.0, 4.8, 2.0, 141.0),
                "b200" => (2250.0, 8.0, 1.5, 192.0),
                other => {
                    return Err(ConfigError::UnknownGpu(
                        other.to_string(),
                        Self::known_gpus().join(", "),
                    ))
                }
            };
        Ok(Self {
            name: name.to_ascii_lowercase(),
            tflops_peak,
            bw_peak_tbs,
            bw_efficiency_factor: 0.0,
            per_layer_cpu_overhead_us,
            memory_gib,
        })
    }

    pub fn known_gpus() -> Vec<String> {
        ["a100", "h100", "h200", "b200"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    /// Peak FLOPs per microsecond.
    pub fn flops_per_tick(&self) -> f64 {
        self.tflops_peak * 1e12 / 1e6
    }

    /// Effective bytes per microsecond, with the efficiency factor applied.
    pub fn effective_bytes_per_tick(&self) -> f64 {
        let factor = if self.bw_efficiency_factor > 0.0 {
            self.bw_efficiency_factor
        } else {
            1.0
        };
        self.bw_peak_tbs * 1e12 * factor / 1e6
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_is_case_insensitive() {
        let h100 = HardwareConfig::builtin("H100").unwrap();
        assert_eq!(h100.name, "h100");
        assert!(HardwareConfig::builtin("tpu-v5").is_err());
    }

    #[test]
    fn zero_efficiency_factor_means_disabled() {
        let mut hw = HardwareConfig::builtin("h100").unwrap();
        let full = hw.effective_bytes_per_tick();
        hw.bw_efficiency_factor = 1.0;
        assert_eq!(hw.effective_bytes_per_tick(), full);
        hw.bw_efficiency_factor = 0.5;
        assert!(hw.effective_bytes_per_tick() < full);
    }
}
