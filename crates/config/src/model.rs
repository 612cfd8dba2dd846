use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Transformer shape parameters the latency models need. Parsed from a
/// HuggingFace-style `config.json` with tolerant field aliases, or taken
/// from the built-in catalog when running offline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    pub num_layers: usize,
    pub hidden_dim: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub intermediate_dim: usize,
    pub vocab_size: usize,
    /// Bytes per weight/KV element (2 for fp16/bf16, 1 for fp8, 4 for fp32).
    pub bytes_per_param: usize,
}

/// Raw HuggingFace `config.json` shape. Field names differ across model
/// families; aliases below cover the ones we have met in the wild.
#[derive(Debug, Deserialize)]
struct HfModelConfig {
    #[serde(alias = "model_type", default)]
    _model_type: Option<String>,
    #[serde(alias = "num_hidden_layers", alias = "n_layer")]
    num_hidden_layers: Option<usize>,
    #[serde(alias = "hidden_size", alias = "n_embd")]
    hidden_size: Option<usize>,
    #[serde(alias = "num_attention_heads", alias = "n_head")]
    num_attention_heads: Option<usize>,
    #[serde(
        alias = "num_key_value_heads",
        alias = "num_kv_heads",
        alias = "multi_query_group_num"
    )]
    num_key_value_heads: Option<usize>,
    head_dim: Option<usize>,
    #[serde(alias = "intermediate_size", alias = "ffn_hidden_size")]
    intermediate_size: Option<usize>,
    vocab_size: Option<usize>,
    #[serde(alias = "torch_dtype", alias = "dtype")]
    torch_dtype: Option<String>,
}

fn bytes_for_dtype(dtype: &str) -> Result<usize, ConfigError> {
    match dtype {
        "float16" | "bfloat16" | "fp16" | "bf16" | "half" => Ok(2),
        "float8" | "fp8" | "float8_e4m3fn" | "float8_e5m2" | "int8" => Ok(1),
        "float32" | "fp32" | "float" => Ok(4),
        other => Err(ConfigError::UnsupportedDtype(other.to_string())),
    }
}

impl ModelConfig {
    /// Parse a HuggingFace-style `config.json`.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let hf: HfModelConfig =
            serde_json::from_str(&raw).map_err(|source| ConfigError::MalformedJson {
                path: path.to_path_buf(),
                source,
            })?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "model".to_string());
        Self::from_hf(name, hf)
    }

    fn from_hf(name: String, hf: HfModelConfig) -> Result<Self, ConfigError> {
        let num_layers = hf
            .num_hidden_layers
            .filter(|v| *v > 0)
            .ok_or(ConfigError::MissingModelField("num_hidden_layers"))?;
        let hidden_dim = hf
            .hidden_size
            .filter(|v| *v > 0)
            .ok_or(ConfigError::MissingModelField("hidden_size"))?;
        let num_heads = hf
            .num_attention_heads
            .filter(|v| *v > 0)
            .ok_or(ConfigError::MissingModelField("num_attention_heads"))?;
        // MHA models often omit the KV head count entirely.
        let num_kv_heads = hf.num_key_value_heads.filter(|v| *v > 0).unwrap_or(num_heads);
        let head_dim = match hf.head_dim.filter(|v| *v > 0) {
            Some(d) => d,
            None => {
                if hidden_dim % num_heads != 0 {
                    return Err(ConfigError::MissingModelField("head_dim"));
                }
                hidden_dim / num_heads
            }
        };
        let intermediate_dim = hf
            .intermediate_size
            .filter(|v| *v > 0)
            .ok_or(ConfigError::MissingModelField("intermediate_size"))?;
        let vocab_size = hf
            .vocab_size
            .filter(|v| *v > 0)
            .ok_or(ConfigError::MissingModelField("vocab_size"))?;
        let bytes_per_param = match hf.torch_dtype.as_deref() {
            Some(dtype) => bytes_for_dtype(dtype)?,
            None => 2,
        };
        Ok(Self {
            name,
            num_layers,
            hidden_dim,
            num_heads,
            num_kv_heads,
            head_dim,
            intermediate_dim,
            vocab_size,
            bytes_per_param,
        })
    }

    /// Built-in catalog for offline runs.
    pub fn builtin(name: &str) -> Result<Self, ConfigError> {
        let (num_layers, hidden_dim, num_heads, num_kv_heads, intermediate_dim, vocab_size) =
            match name {
                "llama-3-8b" => (32, 4096, 32, 8, 14336, 128_256),
                "llama-3-70b" => (80, 8192, 64, 8, 28672, 128_256),
                "qwen2-7b" => (28, 3584, 28, 4, 18944, 152_064),
                "mistral-7b" => (32, 4096, 32, 8, 14336, 32_000),
                other => return Err(ConfigError::UnknownModel(other.to_string())),
            };
        Ok(Self {
            name: name.to_string(),
            num_layers,
            hidden_dim,
            num_heads,
            num_kv_heads,
            head_dim: hidden_dim / num_heads,
            intermediate_dim,
            vocab_size,
            bytes_per_param: 2,
        })
    }

    pub fn known_models() -> &'static [&'static str] {
        &["llama-3-8b", "llama-3-70b", "qwen2-7b", "mistral-7b"]
    }

    /// Bytes of KV cache per token across all layers (both K and V).
    pub fn kv_bytes_per_token(&self) -> usize {
        2 * self.num_layers * self.num_kv_heads * self.head_dim * self.bytes_per_param
    }

    /// Total weight bytes (attention + MLP + embedding/unembedding).
    pub fn weight_bytes(&self) -> usize {
        let q = self.hidden_dim * self.num_heads * self.head_dim;
        let kv = 2 * self.hidden_dim * self.num_kv_heads * self.head_dim;
        let o = self.num_heads * self.head_dim * self.hidden_dim;
        let mlp = 3 * self.hidden_dim * self.intermediate_dim;
        let per_layer = q + kv + o + mlp;
        let embeddings = 2 * self.vocab_size * self.hidden_dim;
        (self.num_layers * per_layer + embeddings) * self.bytes_per_param
    }
}
