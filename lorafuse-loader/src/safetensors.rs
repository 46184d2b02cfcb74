use std::collections::HashMap;
use std::path::{Path, PathBuf};

use lorafuse_core::{DType, LorafuseError, Result};
use memmap2::Mmap;
use safetensors::SafeTensors;

/// Weight file extensions that hold pickled PyTorch state dicts.
const PICKLE_EXTENSIONS: [&str; 2] = ["bin", "pt"];

/// Host copy of one tensor, widened to f32.
#[derive(Debug, Clone)]
pub struct HostTensor {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
    /// Dtype the tensor was stored with on disk.
    pub source_dtype: DType,
}

pub struct SafeTensorsLoader {
    files: Vec<PathBuf>,
    mmaps: Vec<Mmap>,
    /// Maps tensor name -> mmap index for O(1) lookup.
    tensor_index: HashMap<String, usize>,
}

impl SafeTensorsLoader {
    /// Open every `*.safetensors` file in `model_dir`.
    pub fn new(model_dir: &Path) -> Result<Self> {
        let mut files = Vec::new();
        let mut pickled = Vec::new();
        for entry in std::fs::read_dir(model_dir)? {
            let path = entry?.path();
            match path.extension().and_then(|ext| ext.to_str()) {
                Some("safetensors") => files.push(path),
                Some(ext) if PICKLE_EXTENSIONS.contains(&ext) => pickled.push(path),
                _ => {}
            }
        }
        files.sort();

        if files.is_empty() {
            if !pickled.is_empty() {
                return Err(LorafuseError::Load(format!(
                    "{:?} only holds pickled weights ({} files); convert them to .safetensors",
                    model_dir,
                    pickled.len()
                )));
            }
            return Err(LorafuseError::Load(format!(
                "No .safetensors files found in {:?}",
                model_dir
            )));
        }
        Self::from_files(files)
    }

    /// Open an explicit list of `*.safetensors` files.
    pub fn from_files(files: Vec<PathBuf>) -> Result<Self> {
        let mmaps = files
            .iter()
            .map(|path| {
                let file = std::fs::File::open(path)?;
                Ok(unsafe { Mmap::map(&file) }?)
            })
            .collect::<std::result::Result<Vec<_>, std::io::Error>>()?;

        // Build tensor name -> file index mapping
        let mut tensor_index = HashMap::new();
        for (idx, mmap) in mmaps.iter().enumerate() {
            let tensors = SafeTensors::deserialize(mmap)
                .map_err(|e| LorafuseError::Load(format!("{}: {e}", files[idx].display())))?;
            for name in tensors.names() {
                tensor_index.insert(name.to_string(), idx);
            }
        }

        Ok(Self {
            files,
            mmaps,
            tensor_index,
        })
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// List all tensor names across all files, sorted.
    pub fn tensor_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tensor_index.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensor_index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tensor_index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tensor_index.is_empty()
    }

    /// Shape of a tensor without decoding its data.
    pub fn shape(&self, name: &str) -> Result<Vec<usize>> {
        self.with_view(name, |view| Ok(view.shape().to_vec()))
    }

    /// Decode a tensor into host memory as f32.
    pub fn load_host(&self, name: &str) -> Result<HostTensor> {
        self.with_view(name, |view| {
            let shape = view.shape().to_vec();
            let (data, source_dtype) = decode_to_f32(view.dtype(), view.data())
                .map_err(|e| LorafuseError::Load(format!("Tensor '{name}': {e}")))?;
            Ok(HostTensor {
                data,
                shape,
                source_dtype,
            })
        })
    }

    fn with_view<T>(
        &self,
        name: &str,
        f: impl FnOnce(&safetensors::tensor::TensorView<'_>) -> Result<T>,
    ) -> Result<T> {
        let idx = self.tensor_index.get(name).ok_or_else(|| {
            LorafuseError::Load(format!("Tensor '{}' not found", name))
        })?;
        let tensors = SafeTensors::deserialize(&self.mmaps[*idx])
            .map_err(|e| LorafuseError::Load(e.to_string()))?;
        let view = tensors
            .tensor(name)
            .map_err(|e| LorafuseError::Load(e.to_string()))?;
        f(&view)
    }
}

/// Decode little-endian tensor bytes into f32 values.
///
/// Mapped data carries no alignment guarantee, so values are read byte-wise
/// rather than cast in place.
fn decode_to_f32(dtype: safetensors::Dtype, data: &[u8]) -> std::result::Result<(Vec<f32>, DType), String> {
    match dtype {
        safetensors::Dtype::F32 => Ok((
            data.chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
            DType::F32,
        )),
        safetensors::Dtype::F16 => Ok((
            data.chunks_exact(2)
                .map(|b| half::f16::from_bits(u16::from_le_bytes([b[0], b[1]])).to_f32())
                .collect(),
            DType::F16,
        )),
        safetensors::Dtype::BF16 => Ok((
            data.chunks_exact(2)
                .map(|b| half::bf16::from_bits(u16::from_le_bytes([b[0], b[1]])).to_f32())
                .collect(),
            DType::BF16,
        )),
        other => Err(format!("unsupported safetensors dtype {other:?}")),
    }
}
