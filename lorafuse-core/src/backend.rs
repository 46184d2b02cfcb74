use crate::tensor::Tensor;
use crate::{DType, Result};

/// Compute backend used to materialize weights and apply adapter deltas.
pub trait Backend: Send + Sync + 'static {
    type Tensor: Tensor;

    fn name(&self) -> &str;
    fn device_count(&self) -> usize;

    // Data transfer
    fn copy_from_host_f32(
        &self,
        data: &[f32],
        shape: &[usize],
        device: usize,
    ) -> Result<Self::Tensor>;
    fn copy_to_host_f32(&self, tensor: &Self::Tensor) -> Result<Vec<f32>>;

    // Core ops
    fn matmul(&self, a: &Self::Tensor, b: &Self::Tensor) -> Result<Self::Tensor>;
    fn add(&self, a: &Self::Tensor, b: &Self::Tensor) -> Result<Self::Tensor>;
    fn mul_scalar(&self, a: &Self::Tensor, scalar: f32) -> Result<Self::Tensor>;
    fn transpose(&self, x: &Self::Tensor, dim0: usize, dim1: usize) -> Result<Self::Tensor>;

    /// Cast a tensor to a different dtype. Returns the input unchanged if already the target dtype.
    fn cast(&self, x: &Self::Tensor, dtype: DType) -> Result<Self::Tensor>;

    /// Low-rank update `scale * (b @ a)`.
    ///
    /// `a`: [rank, in_features], `b`: [out_features, rank].
    /// Returns: [out_features, in_features]
    fn low_rank_delta(
        &self,
        a: &Self::Tensor,
        b: &Self::Tensor,
        scale: f32,
    ) -> Result<Self::Tensor> {
        let product = self.matmul(b, a)?;
        self.mul_scalar(&product, scale)
    }
}
