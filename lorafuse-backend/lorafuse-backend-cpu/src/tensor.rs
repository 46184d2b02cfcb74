use std::sync::Arc;

use lorafuse_core::{DType, Tensor};

#[derive(Clone, Debug)]
pub struct CpuTensor {
    pub(crate) data: Arc<Vec<f32>>,
    pub(crate) shape: Vec<usize>,
    pub(crate) dtype: DType,
    pub(crate) device: usize,
}

impl CpuTensor {
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        Self::on_device(data, shape, 0)
    }

    pub fn on_device(data: Vec<f32>, shape: Vec<usize>, device: usize) -> Self {
        Self {
            data: Arc::new(data),
            shape,
            dtype: DType::F32,
            device,
        }
    }

    pub(crate) fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Tensor for CpuTensor {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn device(&self) -> usize {
        self.device
    }
}
