//! Lorafuse loader: SafeTensors weight loading, 4-bit quantization,
//! device placement and merged checkpoint writing.

pub mod config;
pub mod model;
pub mod placement;
pub mod quant;
pub mod safetensors;
pub mod writer;

pub use config::{declares_custom_code, export_config, read_model_config, HfModelConfig};
pub use model::{load_quantized_model, should_quantize, ModelTensor, QuantizedModel};
pub use placement::{plan_placement, resolve_placement, DeviceMap, ResolvedPlacement};
pub use quant::{BlockScales, QuantizedTensor};
pub use self::safetensors::{HostTensor, SafeTensorsLoader};
pub use writer::{save_checkpoint, SavedCheckpoint, ShardOptions};
