//! Sharded safetensors checkpoint writer.
//!
//! Output layout matches what HuggingFace tooling reads back:
//! a single `model.safetensors`, or `model-0000i-of-0000n.safetensors`
//! shards plus `model.safetensors.index.json`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use lorafuse_core::{Backend, DType, LorafuseError, Result};
use safetensors::tensor::TensorView;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{export_config, CONFIG_FILE};
use crate::model::QuantizedModel;

pub const SINGLE_FILE: &str = "model.safetensors";
pub const INDEX_FILE: &str = "model.safetensors.index.json";
pub const GENERATION_CONFIG_FILE: &str = "generation_config.json";

/// Default shard ceiling, matching `save_pretrained`'s "5GB".
pub const DEFAULT_MAX_SHARD_SIZE: usize = 5_000_000_000;

#[derive(Debug, Clone)]
pub struct ShardOptions {
    pub max_shard_size: usize,
}

impl Default for ShardOptions {
    fn default() -> Self {
        Self {
            max_shard_size: DEFAULT_MAX_SHARD_SIZE,
        }
    }
}

/// What ended up on disk.
#[derive(Debug, Clone)]
pub struct SavedCheckpoint {
    pub shards: Vec<PathBuf>,
    pub index: Option<PathBuf>,
    pub config: PathBuf,
    pub total_size: usize,
    pub tensor_count: usize,
    pub dtype: DType,
}

#[derive(Serialize)]
struct ShardIndex<'a> {
    metadata: IndexMetadata,
    weight_map: BTreeMap<&'a str, String>,
}

#[derive(Serialize)]
struct IndexMetadata {
    total_size: usize,
}

pub fn shard_file_name(index: usize, count: usize) -> String {
    if count == 1 {
        SINGLE_FILE.to_string()
    } else {
        format!("model-{:05}-of-{:05}.safetensors", index + 1, count)
    }
}

/// Group names into shards of at most `max_shard_size` bytes.
/// A tensor larger than the ceiling gets a shard to itself.
pub fn plan_shards(sizes: &[(String, usize)], max_shard_size: usize) -> Vec<Vec<String>> {
    let mut shards: Vec<Vec<String>> = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_size = 0usize;
    for (name, size) in sizes {
        if !current.is_empty() && current_size + size > max_shard_size {
            shards.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current.push(name.clone());
        current_size += size;
    }
    if !current.is_empty() {
        shards.push(current);
    }
    shards
}

/// Remove weight files and `generation_config.json` left by an earlier run
/// into the same directory.
pub fn remove_stale_weights(output_dir: &Path) -> Result<usize> {
    let mut removed = 0;
    for entry in std::fs::read_dir(output_dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let stale = name == INDEX_FILE
            || name == GENERATION_CONFIG_FILE
            || (name.starts_with("model") && name.ends_with(".safetensors"));
        if stale && path.is_file() {
            std::fs::remove_file(&path)?;
            debug!("Removed stale weight file {}", path.display());
            removed += 1;
        }
    }
    Ok(removed)
}

/// Dequantize every parameter and write the full checkpoint into `output_dir`.
pub fn save_checkpoint<B: Backend>(
    model: &QuantizedModel<B>,
    output_dir: &Path,
    options: &ShardOptions,
) -> Result<SavedCheckpoint> {
    std::fs::create_dir_all(output_dir)?;
    let removed = remove_stale_weights(output_dir)?;
    if removed > 0 {
        info!("Replacing {removed} weight file(s) from a previous run");
    }

    let dtype = model.compute_dtype();
    let sizes: Vec<(String, usize)> = model
        .names()
        .map(|name| {
            let numel: usize = model
                .tensor(name)
                .map_or(0, |t| t.shape().iter().product());
            (name.to_string(), numel * dtype.size_in_bytes())
        })
        .collect();
    let total_size: usize = sizes.iter().map(|(_, s)| s).sum();
    let plan = plan_shards(&sizes, options.max_shard_size);

    let mut shards = Vec::with_capacity(plan.len());
    let mut weight_map = BTreeMap::new();
    for (idx, names) in plan.iter().enumerate() {
        let file_name = shard_file_name(idx, plan.len());
        let path = output_dir.join(&file_name);
        write_shard(model, names, dtype, &path)?;
        for name in names {
            weight_map.insert(name.as_str(), file_name.clone());
        }
        info!("Wrote {} ({} tensors)", path.display(), names.len());
        shards.push(path);
    }

    let index = if plan.len() > 1 {
        let path = output_dir.join(INDEX_FILE);
        let index = ShardIndex {
            metadata: IndexMetadata { total_size },
            weight_map,
        };
        std::fs::write(&path, serde_json::to_string_pretty(&index)?)?;
        Some(path)
    } else {
        None
    };

    let config = output_dir.join(CONFIG_FILE);
    let exported = export_config(model.raw_config(), dtype);
    std::fs::write(&config, serde_json::to_string_pretty(&exported)?)?;

    let generation = model.source_dir().join(GENERATION_CONFIG_FILE);
    if generation.is_file() {
        std::fs::copy(&generation, output_dir.join(GENERATION_CONFIG_FILE))?;
    }

    Ok(SavedCheckpoint {
        shards,
        index,
        config,
        total_size,
        tensor_count: sizes.len(),
        dtype,
    })
}

fn write_shard<B: Backend>(
    model: &QuantizedModel<B>,
    names: &[String],
    dtype: DType,
    path: &Path,
) -> Result<()> {
    let mut encoded: Vec<(&str, Vec<u8>, Vec<usize>)> = Vec::with_capacity(names.len());
    for name in names {
        let tensor = model.materialize(name)?;
        let values = model.backend().copy_to_host_f32(&tensor)?;
        let shape = model
            .tensor(name)
            .map(|t| t.shape().to_vec())
            .unwrap_or_else(|| vec![values.len()]);
        encoded.push((name.as_str(), encode(&values, dtype)?, shape));
    }

    let st_dtype = match dtype {
        DType::F32 => safetensors::Dtype::F32,
        DType::F16 => safetensors::Dtype::F16,
        DType::BF16 => safetensors::Dtype::BF16,
        DType::Q4 => return Err(LorafuseError::UnsupportedDtype(dtype)),
    };
    let views = encoded
        .iter()
        .map(|(name, bytes, shape)| {
            TensorView::new(st_dtype, shape.clone(), bytes)
                .map(|view| (*name, view))
                .map_err(|e| LorafuseError::Internal(format!("{name}: {e}")))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut metadata = HashMap::new();
    metadata.insert("format".to_string(), "pt".to_string());
    let bytes = safetensors::serialize(views, Some(metadata))
        .map_err(|e| LorafuseError::Internal(format!("SafeTensors serialization failed: {e}")))?;
    std::fs::write(path, bytes)?;
    Ok(())
}

fn encode(values: &[f32], dtype: DType) -> Result<Vec<u8>> {
    let bytes = match dtype {
        DType::F32 => bytemuck::cast_slice::<f32, u8>(values).to_vec(),
        DType::F16 => {
            let half: Vec<half::f16> = values.iter().map(|&v| half::f16::from_f32(v)).collect();
            bytemuck::cast_slice::<half::f16, u8>(&half).to_vec()
        }
        DType::BF16 => {
            let half: Vec<half::bf16> = values.iter().map(|&v| half::bf16::from_f32(v)).collect();
            bytemuck::cast_slice::<half::bf16, u8>(&half).to_vec()
        }
        DType::Q4 => return Err(LorafuseError::UnsupportedDtype(dtype)),
    };
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes(list: &[(&str, usize)]) -> Vec<(String, usize)> {
        list.iter().map(|(n, s)| (n.to_string(), *s)).collect()
    }

    #[test]
    fn test_shard_names() {
        assert_eq!(shard_file_name(0, 1), "model.safetensors");
        assert_eq!(shard_file_name(0, 3), "model-00001-of-00003.safetensors");
        assert_eq!(shard_file_name(2, 3), "model-00003-of-00003.safetensors");
    }

    #[test]
    fn test_plan_shards_respects_ceiling() {
        let plan = plan_shards(&sizes(&[("a", 40), ("b", 40), ("c", 40)]), 100);
        assert_eq!(plan, vec![vec!["a", "b"], vec!["c"]]);
    }

    #[test]
    fn test_oversized_tensor_gets_own_shard() {
        let plan = plan_shards(&sizes(&[("a", 10), ("big", 500), ("c", 10)]), 100);
        assert_eq!(plan, vec![vec!["a"], vec!["big"], vec!["c"]]);
    }

    #[test]
    fn test_remove_stale_weights_keeps_other_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "model.safetensors",
            "model-00001-of-00002.safetensors",
            INDEX_FILE,
            GENERATION_CONFIG_FILE,
            "tokenizer.json",
        ] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        assert_eq!(remove_stale_weights(dir.path()).unwrap(), 4);
        assert!(dir.path().join("tokenizer.json").exists());
        assert!(!dir.path().join(GENERATION_CONFIG_FILE).exists());
        assert!(!dir.path().join("model.safetensors").exists());
    }
}
