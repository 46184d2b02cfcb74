use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use lorafuse_core::{
    Backend, DType, DevicePlacement, LorafuseError, ModelConfig, QuantConfig, Result, Tensor,
    TrustPolicy,
};
use tracing::info;

use crate::config::{declares_custom_code, read_model_config};
use crate::placement::{is_embedding, plan_placement, DeviceMap};
use crate::quant::QuantizedTensor;
use crate::safetensors::SafeTensorsLoader;

/// One parameter of the in-memory model.
#[derive(Debug, Clone)]
pub enum ModelTensor<T: Tensor> {
    Dense(T),
    Quantized { tensor: QuantizedTensor, device: usize },
}

impl<T: Tensor> ModelTensor<T> {
    pub fn shape(&self) -> &[usize] {
        match self {
            ModelTensor::Dense(t) => t.shape(),
            ModelTensor::Quantized { tensor, .. } => tensor.shape(),
        }
    }

    pub fn device(&self) -> usize {
        match self {
            ModelTensor::Dense(t) => t.device(),
            ModelTensor::Quantized { device, .. } => *device,
        }
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self, ModelTensor::Quantized { .. })
    }

    pub fn memory_bytes(&self) -> usize {
        match self {
            ModelTensor::Dense(t) => t.size_bytes(),
            ModelTensor::Quantized { tensor, .. } => tensor.memory_bytes(),
        }
    }
}

/// Base model held in memory with its linear weights in 4-bit form.
pub struct QuantizedModel<B: Backend> {
    config: ModelConfig,
    raw_config: serde_json::Value,
    source_dir: PathBuf,
    compute_dtype: DType,
    tensors: BTreeMap<String, ModelTensor<B::Tensor>>,
    device_map: DeviceMap,
    backend: B,
}

impl<B: Backend> QuantizedModel<B> {
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// `config.json` exactly as read from the source directory.
    pub fn raw_config(&self) -> &serde_json::Value {
        &self.raw_config
    }

    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    pub fn compute_dtype(&self) -> DType {
        self.compute_dtype
    }

    pub fn device_map(&self) -> &DeviceMap {
        &self.device_map
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn tensor(&self, name: &str) -> Option<&ModelTensor<B::Tensor>> {
        self.tensors.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Tensor names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn quantized_count(&self) -> usize {
        self.tensors.values().filter(|t| t.is_quantized()).count()
    }

    pub fn memory_bytes(&self) -> usize {
        self.tensors.values().map(ModelTensor::memory_bytes).sum()
    }

    /// Dense copy of a parameter in the compute dtype, on its assigned device.
    pub fn materialize(&self, name: &str) -> Result<B::Tensor> {
        let entry = self
            .tensors
            .get(name)
            .ok_or_else(|| LorafuseError::Load(format!("Tensor '{name}' not found")))?;
        match entry {
            ModelTensor::Dense(t) => Ok(t.clone()),
            ModelTensor::Quantized { tensor, device } => {
                let values = tensor.dequantize();
                let dense = self
                    .backend
                    .copy_from_host_f32(&values, tensor.shape(), *device)?;
                self.backend.cast(&dense, self.compute_dtype)
            }
        }
    }

    /// Overwrite an existing parameter with a dense tensor.
    ///
    /// The replacement is cast to the compute dtype and must live on the
    /// device the placement assigned to `name`.
    pub fn replace(&mut self, name: &str, tensor: B::Tensor) -> Result<()> {
        let device = match self.tensors.get(name) {
            Some(existing) => existing.device(),
            None => {
                return Err(LorafuseError::Load(format!(
                    "Tensor '{name}' not present in base model"
                )))
            }
        };
        if tensor.device() != device {
            return Err(LorafuseError::InvalidArgument(format!(
                "Tensor '{name}' belongs on device {device}, got device {}",
                tensor.device()
            )));
        }
        let tensor = self.backend.cast(&tensor, self.compute_dtype)?;
        self.tensors
            .insert(name.to_string(), ModelTensor::Dense(tensor));
        Ok(())
    }
}

/// Whether `name` is stored 4-bit under `quant`.
///
/// Only 2-D linear weights qualify; embeddings and any module listed in
/// `skip_modules` stay dense.
pub fn should_quantize(name: &str, shape: &[usize], quant: &QuantConfig) -> bool {
    if shape.len() != 2 || !name.ends_with(".weight") || is_embedding(name) {
        return false;
    }
    let module = name.trim_end_matches(".weight");
    !quant
        .skip_modules
        .iter()
        .any(|skip| module.split('.').any(|segment| segment == skip))
}

/// Load `model_dir` into memory, quantizing linear weights and placing every
/// tensor according to `placement`.
pub fn load_quantized_model<B: Backend + Clone>(
    model_dir: &Path,
    quant: &QuantConfig,
    placement: DevicePlacement,
    trust: TrustPolicy,
    backend: &B,
) -> Result<QuantizedModel<B>> {
    let (config, raw_config) = read_model_config(model_dir)?;
    trust.check(
        &model_dir.display().to_string(),
        declares_custom_code(model_dir, &config),
    )?;

    let compute_dtype = quant
        .compute_dtype
        .or(config.torch_dtype)
        .unwrap_or(DType::F16);

    let loader = SafeTensorsLoader::new(model_dir)?;
    info!(
        "Loading {} tensors from {} file(s) in {} (arch {:?}, compute dtype {})",
        loader.len(),
        loader.files().len(),
        model_dir.display(),
        config.architectures,
        compute_dtype,
    );

    // Size estimates drive the placement plan.
    let mut sizes = Vec::with_capacity(loader.len());
    for name in loader.tensor_names() {
        let shape = loader.shape(&name)?;
        let numel: usize = shape.iter().product();
        let bytes = if should_quantize(&name, &shape, quant) {
            numel.div_ceil(2) + numel.div_ceil(quant.block_size.max(1)) * 4
        } else {
            numel * compute_dtype.size_in_bytes()
        };
        sizes.push((name, bytes));
    }
    let device_map = plan_placement(placement, backend.device_count(), &sizes)?;

    let mut tensors = BTreeMap::new();
    for (name, _) in &sizes {
        let device = device_map.device_of(name).unwrap_or(0);
        let host = loader.load_host(name)?;
        let entry = if should_quantize(name, &host.shape, quant) {
            ModelTensor::Quantized {
                tensor: QuantizedTensor::quantize(&host.data, &host.shape, quant)?,
                device,
            }
        } else {
            let dense = backend.copy_from_host_f32(&host.data, &host.shape, device)?;
            ModelTensor::Dense(backend.cast(&dense, compute_dtype)?)
        };
        tensors.insert(name.clone(), entry);
    }

    let model = QuantizedModel {
        config,
        raw_config,
        source_dir: model_dir.to_path_buf(),
        compute_dtype,
        tensors,
        device_map,
        backend: backend.clone(),
    };
    info!(
        "Base model loaded: {} tensors, {} quantized ({:?}, block {}), {} bytes resident",
        model.len(),
        model.quantized_count(),
        quant.scheme,
        quant.block_size,
        model.memory_bytes(),
    );
    Ok(model)
}
