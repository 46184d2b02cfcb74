use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::LorafuseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    F16,
    BF16,
    /// 4-bit block-quantized storage, two values per byte.
    Q4,
}

impl DType {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 | DType::BF16 => 2,
            DType::Q4 => 1, // packed: 2 values per byte, but min alloc is 1 byte
        }
    }

    /// Name used by `torch_dtype` in HuggingFace `config.json`.
    pub fn torch_name(&self) -> &'static str {
        match self {
            DType::F32 => "float32",
            DType::F16 => "float16",
            DType::BF16 => "bfloat16",
            DType::Q4 => "uint8",
        }
    }

    /// Parse a `torch_dtype` value. Unknown names yield `None`.
    pub fn from_torch_name(name: &str) -> Option<Self> {
        match name {
            "float32" | "float" => Some(DType::F32),
            "float16" | "half" => Some(DType::F16),
            "bfloat16" => Some(DType::BF16),
            _ => None,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::Q4 => "q4",
        };
        f.write_str(s)
    }
}

impl FromStr for DType {
    type Err = LorafuseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "f32" | "float32" => Ok(DType::F32),
            "f16" | "float16" => Ok(DType::F16),
            "bf16" | "bfloat16" => Ok(DType::BF16),
            other => Err(LorafuseError::InvalidArgument(format!(
                "unknown compute dtype '{other}' (expected f16, bf16 or f32)"
            ))),
        }
    }
}

/// 4-bit encoding used for quantized weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QuantScheme {
    /// NormalFloat: 16 levels placed at quantiles of a unit normal.
    #[default]
    Nf4,
    /// Symmetric integer levels -7..=7.
    Int4,
}

impl FromStr for QuantScheme {
    type Err = LorafuseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nf4" => Ok(QuantScheme::Nf4),
            "int4" => Ok(QuantScheme::Int4),
            other => Err(LorafuseError::InvalidArgument(format!(
                "unknown quantization type '{other}' (expected nf4 or int4)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuantConfig {
    pub scheme: QuantScheme,
    /// Elements sharing one absmax scale.
    pub block_size: usize,
    /// Store the per-block scales as int8 instead of f32.
    pub double_quant: bool,
    /// Dtype for tensors kept dense and for dequantized output.
    /// `None` defers to the checkpoint's `torch_dtype`.
    pub compute_dtype: Option<DType>,
    /// Module names never quantized (matched against dotted path segments).
    pub skip_modules: Vec<String>,
}

impl Default for QuantConfig {
    fn default() -> Self {
        Self {
            scheme: QuantScheme::Nf4,
            block_size: 64,
            double_quant: false,
            compute_dtype: None,
            skip_modules: vec!["lm_head".to_string()],
        }
    }
}

/// How tensors are distributed across compute devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePlacement {
    /// `Single(0)` on one device, `ShardedByLayer` on several.
    #[default]
    Auto,
    Single(usize),
    /// Contiguous ranges of decoder layers per device.
    ShardedByLayer,
    /// Individual tensors balanced by size.
    ShardedByTensor,
}

impl DevicePlacement {
    /// Parse the CLI spelling; `device` is the ordinal used by `single`.
    pub fn parse(mode: &str, device: usize) -> Result<Self, LorafuseError> {
        match mode.to_ascii_lowercase().as_str() {
            "auto" => Ok(DevicePlacement::Auto),
            "single" => Ok(DevicePlacement::Single(device)),
            "layer" => Ok(DevicePlacement::ShardedByLayer),
            "tensor" => Ok(DevicePlacement::ShardedByTensor),
            other => Err(LorafuseError::InvalidArgument(format!(
                "unknown placement '{other}' (expected auto, single, layer or tensor)"
            ))),
        }
    }
}

/// Architecture summary read from a checkpoint's `config.json`.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub model_type: Option<String>,
    pub architectures: Vec<String>,
    pub num_hidden_layers: Option<usize>,
    pub torch_dtype: Option<DType>,
    pub tie_word_embeddings: bool,
    /// True when the repository maps classes onto its own Python code.
    pub has_remote_code: bool,
}

/// Whether repository-supplied Python code may be relied upon.
///
/// Code is never executed; a trusted repository that declares custom code
/// is processed from its serialized artifacts alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrustPolicy {
    pub trust_remote_code: bool,
}

impl TrustPolicy {
    pub fn new(trust_remote_code: bool) -> Self {
        Self { trust_remote_code }
    }

    /// Gate an artifact (`what`) that may declare custom code.
    pub fn check(&self, what: &str, declares_custom_code: bool) -> Result<(), LorafuseError> {
        if !declares_custom_code {
            return Ok(());
        }
        if !self.trust_remote_code {
            return Err(LorafuseError::Trust(format!(
                "{what} declares repository code (auto_map or .py modules); pass --trust_remote_code to accept it"
            )));
        }
        tracing::warn!(
            "{what} declares repository code; continuing with serialized artifacts only, no code is run"
        );
        Ok(())
    }
}
