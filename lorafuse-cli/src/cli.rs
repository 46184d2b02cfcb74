use std::path::PathBuf;

use clap::Parser;
use lorafuse_core::{
    DType, DevicePlacement, LorafuseError, QuantConfig, QuantScheme, Result, TrustPolicy,
};
use lorafuse_hub::CacheScope;
use lorafuse_loader::writer::DEFAULT_MAX_SHARD_SIZE;
use lorafuse_loader::ShardOptions;

#[derive(Parser, Debug)]
#[command(
    name = "merge-lora",
    about = "Merge a LoRA adapter into a 4-bit loaded base model and save the result"
)]
pub struct Cli {
    /// Base model: Hub repo id or local directory
    #[arg(long = "base_model", alias = "base-model")]
    pub base_model: String,

    /// LoRA adapter: Hub repo id or local directory
    #[arg(long = "lora_adapter", alias = "lora-adapter")]
    pub lora_adapter: String,

    /// Where the merged model and tokenizer are written
    #[arg(long = "output_dir", alias = "output-dir", default_value = "/models")]
    pub output_dir: PathBuf,

    /// Shared download cache for the base model
    #[arg(long = "cache_dir", alias = "cache-dir", default_value = "/tmp/base")]
    pub cache_dir: PathBuf,

    /// Download into a temporary cache removed when the run ends
    #[arg(long = "per_run_cache", alias = "per-run-cache")]
    pub per_run_cache: bool,

    /// Base model revision
    #[arg(long, default_value = "main")]
    pub revision: String,

    /// Adapter revision
    #[arg(long = "adapter_revision", alias = "adapter-revision", default_value = "main")]
    pub adapter_revision: String,

    /// HuggingFace access token
    #[arg(long = "hf_token", alias = "hf-token", env = "HF_TOKEN", hide_env_values = true)]
    pub hf_token: Option<String>,

    /// Accept repositories that declare their own Python code (it is never run)
    #[arg(long = "trust_remote_code", alias = "trust-remote-code")]
    pub trust_remote_code: bool,

    /// Device placement: auto, single, layer or tensor
    #[arg(long, default_value = "auto")]
    pub placement: String,

    /// Device ordinal used by `--placement single`
    #[arg(long, default_value = "0")]
    pub device: usize,

    /// Number of devices to plan placement over
    #[arg(long)]
    pub devices: Option<usize>,

    /// 4-bit scheme: nf4 or int4
    #[arg(long = "quant_type", alias = "quant-type", default_value = "nf4")]
    pub quant_type: String,

    /// Elements per quantization block
    #[arg(long = "quant_block_size", alias = "quant-block-size", default_value = "64")]
    pub quant_block_size: usize,

    /// Quantize the per-block scales as well
    #[arg(long = "double_quant", alias = "double-quant")]
    pub double_quant: bool,

    /// Dtype for dense tensors and the saved weights (default: base torch_dtype)
    #[arg(long = "compute_dtype", alias = "compute-dtype")]
    pub compute_dtype: Option<String>,

    /// Modules kept in full precision
    #[arg(
        long = "skip_modules",
        alias = "skip-modules",
        value_delimiter = ',',
        default_value = "lm_head"
    )]
    pub skip_modules: Vec<String>,

    /// Largest safetensors shard written, in bytes
    #[arg(long = "max_shard_size", alias = "max-shard-size", default_value_t = DEFAULT_MAX_SHARD_SIZE)]
    pub max_shard_size: usize,
}

/// Everything one run needs, resolved from the command line.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub base_model: String,
    pub lora_adapter: String,
    pub output_dir: PathBuf,
    pub cache: CacheScope,
    pub revision: String,
    pub adapter_revision: String,
    pub hf_token: Option<String>,
    pub trust: TrustPolicy,
    pub placement: DevicePlacement,
    pub devices: Option<usize>,
    pub quant: QuantConfig,
    pub shard: ShardOptions,
}

impl RunConfig {
    /// Defaults for a base/adapter pair, as the command line would produce them.
    pub fn new(base_model: impl Into<String>, lora_adapter: impl Into<String>) -> Self {
        Self {
            base_model: base_model.into(),
            lora_adapter: lora_adapter.into(),
            output_dir: PathBuf::from("/models"),
            cache: CacheScope::Shared(PathBuf::from("/tmp/base")),
            revision: "main".to_string(),
            adapter_revision: "main".to_string(),
            hf_token: None,
            trust: TrustPolicy::default(),
            placement: DevicePlacement::Auto,
            devices: None,
            quant: QuantConfig::default(),
            shard: ShardOptions::default(),
        }
    }
}

impl Cli {
    pub fn into_run_config(self) -> Result<RunConfig> {
        let placement =
            DevicePlacement::parse(&self.placement, self.device).map_err(as_argument)?;
        let scheme: QuantScheme = self.quant_type.parse().map_err(as_argument)?;
        let compute_dtype = self
            .compute_dtype
            .as_deref()
            .map(str::parse::<DType>)
            .transpose()
            .map_err(as_argument)?;
        if self.quant_block_size == 0 {
            return Err(LorafuseError::Argument(
                "--quant_block_size must be positive".into(),
            ));
        }
        if self.devices == Some(0) {
            return Err(LorafuseError::Argument("--devices must be positive".into()));
        }

        let cache = if self.per_run_cache {
            CacheScope::PerRun
        } else {
            CacheScope::Shared(self.cache_dir)
        };

        Ok(RunConfig {
            base_model: self.base_model,
            lora_adapter: self.lora_adapter,
            output_dir: self.output_dir,
            cache,
            revision: self.revision,
            adapter_revision: self.adapter_revision,
            hf_token: self.hf_token,
            trust: TrustPolicy::new(self.trust_remote_code),
            placement,
            devices: self.devices,
            quant: QuantConfig {
                scheme,
                block_size: self.quant_block_size,
                double_quant: self.double_quant,
                compute_dtype,
                skip_modules: self
                    .skip_modules
                    .into_iter()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            },
            shard: ShardOptions {
                max_shard_size: self.max_shard_size,
            },
        })
    }
}

fn as_argument(err: LorafuseError) -> LorafuseError {
    match err {
        LorafuseError::InvalidArgument(msg) => LorafuseError::Argument(msg),
        other => other,
    }
}
