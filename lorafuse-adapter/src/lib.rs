//! Lorafuse adapter: PEFT LoRA adapters folded into a quantized base model.

pub mod config;
pub mod keys;
pub mod merge;

pub use config::{read_adapter_config, AdapterConfig, TargetModules, ADAPTER_CONFIG_FILE};
pub use keys::{classify, AdapterKey};
pub use merge::{
    load_adapter, merge_adapter, LoraAdapter, MergeReport, MergedModel, ADAPTER_FILES,
    ADAPTER_WEIGHTS_FILE,
};
