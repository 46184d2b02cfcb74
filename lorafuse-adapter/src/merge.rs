use std::collections::BTreeMap;
use std::path::Path;

use lorafuse_core::{Backend, LorafuseError, Result};
use lorafuse_loader::{
    save_checkpoint, HostTensor, QuantizedModel, SafeTensorsLoader, SavedCheckpoint, ShardOptions,
};
use tracing::{debug, info, warn};

use crate::config::{read_adapter_config, AdapterConfig, ADAPTER_CONFIG_FILE};
use crate::keys::{base_weight_name, classify, AdapterKey};

pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";
const ADAPTER_PICKLE_FILE: &str = "adapter_model.bin";

/// Files an adapter source is expected to provide.
pub const ADAPTER_FILES: [&str; 3] = [
    ADAPTER_CONFIG_FILE,
    ADAPTER_WEIGHTS_FILE,
    ADAPTER_PICKLE_FILE,
];

#[derive(Debug, Default)]
struct LoraPair {
    a: Option<HostTensor>,
    b: Option<HostTensor>,
    embedding: bool,
}

/// Adapter weights held on the host, grouped by the module they update.
#[derive(Debug)]
pub struct LoraAdapter {
    config: AdapterConfig,
    pairs: BTreeMap<String, LoraPair>,
    replacements: Vec<(String, HostTensor)>,
}

impl LoraAdapter {
    /// Base tensors overwritten outright (biases, `modules_to_save`).
    pub fn replaced_tensors(&self) -> impl Iterator<Item = &str> {
        self.replacements.iter().map(|(name, _)| name.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub modules_merged: usize,
    pub tensors_replaced: usize,
    /// Merged modules not listed in `target_modules`.
    pub untargeted: Vec<String>,
}

/// Base model with the adapter folded in.
pub struct MergedModel<B: Backend> {
    model: QuantizedModel<B>,
    report: MergeReport,
}

impl<B: Backend> MergedModel<B> {
    pub fn model(&self) -> &QuantizedModel<B> {
        &self.model
    }

    pub fn report(&self) -> &MergeReport {
        &self.report
    }

    /// Write the merged weights as a full-precision checkpoint.
    pub fn save(&self, output_dir: &Path, options: &ShardOptions) -> Result<SavedCheckpoint> {
        save_checkpoint(&self.model, output_dir, options)
    }
}

/// Read `adapter_config.json` and `adapter_model.safetensors` from `adapter_dir`.
pub fn load_adapter(adapter_dir: &Path) -> Result<LoraAdapter> {
    let config = read_adapter_config(adapter_dir)?;

    let weights = adapter_dir.join(ADAPTER_WEIGHTS_FILE);
    if !weights.is_file() {
        let reason = if adapter_dir.join(ADAPTER_PICKLE_FILE).is_file() {
            format!("{ADAPTER_PICKLE_FILE} is pickled; convert it to {ADAPTER_WEIGHTS_FILE}")
        } else {
            format!("{ADAPTER_WEIGHTS_FILE} missing")
        };
        return Err(LorafuseError::Load(format!(
            "{}: {reason}",
            adapter_dir.display()
        )));
    }
    let loader = SafeTensorsLoader::from_files(vec![weights])?;

    let mut pairs: BTreeMap<String, LoraPair> = BTreeMap::new();
    let mut replacements = Vec::new();
    for name in loader.tensor_names() {
        match classify(&name) {
            AdapterKey::LoraA { module, embedding } => {
                let pair = pairs.entry(module).or_default();
                pair.a = Some(loader.load_host(&name)?);
                pair.embedding = embedding;
            }
            AdapterKey::LoraB { module, embedding } => {
                let pair = pairs.entry(module).or_default();
                pair.b = Some(loader.load_host(&name)?);
                pair.embedding = embedding;
            }
            AdapterKey::Replace { base_name } => {
                replacements.push((base_name, loader.load_host(&name)?));
            }
            AdapterKey::Ignored => debug!("Skipping adapter tensor {name}"),
        }
    }

    info!(
        "Adapter {}: r={}, alpha={}, {} LoRA module(s), {} replaced tensor(s), trained on {}",
        adapter_dir.display(),
        config.r,
        config.lora_alpha,
        pairs.len(),
        replacements.len(),
        config
            .base_model_name_or_path
            .as_deref()
            .unwrap_or("<unspecified base>"),
    );

    Ok(LoraAdapter {
        config,
        pairs,
        replacements,
    })
}

/// Fold `adapter` into `model`: `W' = deq(W) + scale * (B @ A)` per module.
///
/// Any failure is reported as a merge error naming the module involved.
pub fn merge_adapter<B: Backend>(
    mut model: QuantizedModel<B>,
    adapter: &LoraAdapter,
) -> Result<MergedModel<B>> {
    let config = &adapter.config;
    let mut report = MergeReport::default();

    for (module, pair) in &adapter.pairs {
        let (Some(a), Some(b)) = (&pair.a, &pair.b) else {
            return Err(LorafuseError::Merge(format!(
                "{module}: adapter holds only one of lora_A / lora_B"
            )));
        };
        if !config.targets(module) {
            warn!("{module} carries LoRA weights but is not in target_modules");
            report.untargeted.push(module.clone());
        }
        let scale = config.scale_for(module);
        // Embedding deltas come out as [dim, vocab]; fan_in_fan_out weights are stored [in, out].
        let transpose = pair.embedding || config.fan_in_fan_out;
        merge_pair(&mut model, module, a, b, scale, transpose)
            .map_err(|e| e.into_merge(module))?;
        debug!("Merged {module} (scale {scale})");
        report.modules_merged += 1;
    }

    for (name, host) in &adapter.replacements {
        replace_tensor(&mut model, name, host).map_err(|e| e.into_merge(name))?;
        report.tensors_replaced += 1;
    }

    info!(
        "Merged {} module(s), replaced {} tensor(s)",
        report.modules_merged, report.tensors_replaced
    );
    Ok(MergedModel { model, report })
}

fn merge_pair<B: Backend>(
    model: &mut QuantizedModel<B>,
    module: &str,
    a: &HostTensor,
    b: &HostTensor,
    scale: f32,
    transpose: bool,
) -> Result<()> {
    let target = base_weight_name(module);
    let device = match model.tensor(&target) {
        Some(t) => t.device(),
        None => {
            return Err(LorafuseError::Merge(format!(
                "base model has no tensor '{target}'"
            )))
        }
    };

    let merged = {
        let backend = model.backend();
        let base = model.materialize(&target)?;
        let a = backend.copy_from_host_f32(&a.data, &a.shape, device)?;
        let b = backend.copy_from_host_f32(&b.data, &b.shape, device)?;
        let delta = backend.low_rank_delta(&a, &b, scale)?;
        let delta = if transpose {
            backend.transpose(&delta, 0, 1)?
        } else {
            delta
        };
        backend.add(&base, &delta)?
    };
    model.replace(&target, merged)
}

fn replace_tensor<B: Backend>(
    model: &mut QuantizedModel<B>,
    name: &str,
    host: &HostTensor,
) -> Result<()> {
    let (device, shape) = match model.tensor(name) {
        Some(t) => (t.device(), t.shape().to_vec()),
        None => {
            return Err(LorafuseError::Merge(format!(
                "base model has no tensor '{name}' to replace"
            )))
        }
    };
    if shape != host.shape {
        return Err(LorafuseError::ShapeMismatch {
            expected: shape,
            got: host.shape.clone(),
        });
    }
    let tensor = model
        .backend()
        .copy_from_host_f32(&host.data, &host.shape, device)?;
    model.replace(name, tensor)
}
