//! PEFT `adapter_config.json`.

use std::collections::HashMap;
use std::path::Path;

use lorafuse_core::{LorafuseError, Result};
use serde::Deserialize;

pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";

/// `target_modules` is either a list of names or a single regex string.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum TargetModules {
    List(Vec<String>),
    Pattern(String),
}

impl Default for TargetModules {
    fn default() -> Self {
        TargetModules::List(Vec::new())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdapterConfig {
    #[serde(default = "default_peft_type")]
    pub peft_type: String,
    pub r: usize,
    #[serde(default = "default_alpha")]
    pub lora_alpha: f32,
    #[serde(default)]
    pub target_modules: TargetModules,
    #[serde(default)]
    pub fan_in_fan_out: bool,
    #[serde(default)]
    pub use_rslora: bool,
    #[serde(default)]
    pub use_dora: bool,
    #[serde(default)]
    pub rank_pattern: HashMap<String, usize>,
    #[serde(default)]
    pub alpha_pattern: HashMap<String, f32>,
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,
    #[serde(default)]
    pub bias: Option<String>,
    #[serde(default)]
    pub modules_to_save: Option<Vec<String>>,
}

fn default_peft_type() -> String {
    "LORA".to_string()
}

fn default_alpha() -> f32 {
    8.0
}

impl AdapterConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject adapters this merger cannot fold in.
    pub fn validate(&self) -> Result<()> {
        if !self.peft_type.eq_ignore_ascii_case("LORA") {
            return Err(LorafuseError::Merge(format!(
                "unsupported adapter type '{}', only LORA can be merged",
                self.peft_type
            )));
        }
        if self.use_dora {
            return Err(LorafuseError::Merge(
                "DoRA adapters (use_dora) are not supported".into(),
            ));
        }
        if self.r == 0 {
            return Err(LorafuseError::Merge("adapter rank r must be positive".into()));
        }
        Ok(())
    }

    /// Rank for `module`, honoring `rank_pattern`.
    pub fn rank_for(&self, module: &str) -> usize {
        lookup_pattern(&self.rank_pattern, module).unwrap_or(self.r)
    }

    /// Alpha for `module`, honoring `alpha_pattern`.
    pub fn alpha_for(&self, module: &str) -> f32 {
        lookup_pattern(&self.alpha_pattern, module).unwrap_or(self.lora_alpha)
    }

    /// Multiplier applied to `B @ A` for `module`.
    pub fn scale_for(&self, module: &str) -> f32 {
        let rank = self.rank_for(module).max(1) as f32;
        let alpha = self.alpha_for(module);
        if self.use_rslora {
            alpha / rank.sqrt()
        } else {
            alpha / rank
        }
    }

    /// Whether `module` is one of the configured targets.
    pub fn targets(&self, module: &str) -> bool {
        match &self.target_modules {
            TargetModules::List(names) => {
                names.is_empty() || names.iter().any(|n| suffix_matches(module, n))
            }
            // Regex targets are not interpreted; every module with weights is accepted.
            TargetModules::Pattern(_) => true,
        }
    }
}

/// Read and validate `adapter_config.json` in `adapter_dir`.
pub fn read_adapter_config(adapter_dir: &Path) -> Result<AdapterConfig> {
    let path = adapter_dir.join(ADAPTER_CONFIG_FILE);
    let text = std::fs::read_to_string(&path)
        .map_err(|e| LorafuseError::Load(format!("Failed to read {}: {e}", path.display())))?;
    AdapterConfig::from_json(&text)
}

/// `key` matches `module` when it equals the module name or a dotted suffix of it.
fn suffix_matches(module: &str, key: &str) -> bool {
    module == key || module.ends_with(&format!(".{key}"))
}

/// The longest matching key wins, so `layers.0.q_proj` beats `q_proj`.
fn lookup_pattern<T: Copy>(patterns: &HashMap<String, T>, module: &str) -> Option<T> {
    patterns
        .iter()
        .filter(|(key, _)| suffix_matches(module, key))
        .max_by_key(|(key, _)| key.len())
        .map(|(_, v)| *v)
}
