//! CPU backend for lorafuse merges.

mod backend;
pub mod tensor;

pub use backend::CpuBackend;
pub use tensor::CpuTensor;
