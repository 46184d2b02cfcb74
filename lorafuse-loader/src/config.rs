use std::path::Path;

use lorafuse_core::{DType, LorafuseError, ModelConfig, Result};
use serde::Deserialize;

pub const CONFIG_FILE: &str = "config.json";

/// The subset of a HuggingFace `config.json` the loader cares about.
/// Everything else is carried through untouched in the raw JSON value.
#[derive(Debug, Deserialize)]
pub struct HfModelConfig {
    #[serde(default)]
    pub model_type: Option<String>,
    #[serde(default)]
    pub architectures: Vec<String>,
    #[serde(default, alias = "n_layer", alias = "num_layers")]
    pub num_hidden_layers: Option<usize>,
    #[serde(default)]
    pub torch_dtype: Option<String>,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default)]
    pub auto_map: Option<serde_json::Value>,
}

impl HfModelConfig {
    pub fn to_model_config(&self) -> ModelConfig {
        ModelConfig {
            model_type: self.model_type.clone(),
            architectures: self.architectures.clone(),
            num_hidden_layers: self.num_hidden_layers,
            torch_dtype: self.torch_dtype.as_deref().and_then(DType::from_torch_name),
            tie_word_embeddings: self.tie_word_embeddings,
            has_remote_code: self.auto_map.is_some(),
        }
    }
}

/// Read `config.json` from a model directory.
///
/// Returns both the typed view and the raw JSON, which is what gets written
/// back next to the merged weights.
pub fn read_model_config(model_dir: &Path) -> Result<(ModelConfig, serde_json::Value)> {
    let path = model_dir.join(CONFIG_FILE);
    let text = std::fs::read_to_string(&path).map_err(|e| {
        LorafuseError::Load(format!("Failed to read {}: {e}", path.display()))
    })?;
    let raw: serde_json::Value = serde_json::from_str(&text)?;
    let parsed: HfModelConfig = serde_json::from_value(raw.clone())?;
    Ok((parsed.to_model_config(), raw))
}

/// Produce the `config.json` that describes the merged, dequantized weights.
pub fn export_config(raw: &serde_json::Value, dtype: DType) -> serde_json::Value {
    let mut out = raw.clone();
    if let Some(obj) = out.as_object_mut() {
        obj.remove("quantization_config");
        obj.insert(
            "torch_dtype".to_string(),
            serde_json::Value::String(dtype.torch_name().to_string()),
        );
    }
    out
}

/// Whether a model directory asks for code outside the library: an `auto_map`
/// in its config or Python modules shipped next to the weights.
pub fn declares_custom_code(model_dir: &Path, config: &ModelConfig) -> bool {
    if config.has_remote_code {
        return true;
    }
    std::fs::read_dir(model_dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .any(|e| e.path().extension().is_some_and(|ext| ext == "py"))
        })
        .unwrap_or(false)
}
