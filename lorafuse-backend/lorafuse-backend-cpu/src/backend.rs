extern crate openblas_src;

use lorafuse_core::{Backend, DType, LorafuseError, Result, Tensor};

use crate::tensor::CpuTensor;

/// CPU backend for lorafuse.
///
/// All data lives in host memory as `Vec<f32>` wrapped in `Arc`. Host memory
/// can be split into several logical devices so that placement plans made for
/// multi-device runs are carried through unchanged. Matrix products go through
/// OpenBLAS; all other ops are pure Rust.
#[derive(Clone)]
pub struct CpuBackend {
    devices: usize,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self { devices: 1 }
    }

    /// Backend exposing `devices` logical devices (at least one).
    pub fn with_devices(devices: usize) -> Self {
        Self {
            devices: devices.max(1),
        }
    }

    fn check_device(&self, device: usize) -> Result<()> {
        if device >= self.devices {
            return Err(LorafuseError::InvalidArgument(format!(
                "device {device} out of range ({} devices)",
                self.devices
            )));
        }
        Ok(())
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_shape(data_len: usize, shape: &[usize]) -> Result<()> {
    let expected: usize = shape.iter().product();
    if data_len != expected {
        return Err(LorafuseError::ShapeMismatch {
            expected: shape.to_vec(),
            got: vec![data_len],
        });
    }
    Ok(())
}

fn validate_same_shape(a: &CpuTensor, b: &CpuTensor) -> Result<()> {
    if a.shape() != b.shape() {
        return Err(LorafuseError::ShapeMismatch {
            expected: a.shape().to_vec(),
            got: b.shape().to_vec(),
        });
    }
    Ok(())
}

fn validate_same_device(a: &CpuTensor, b: &CpuTensor) -> Result<()> {
    if a.device != b.device {
        return Err(LorafuseError::InvalidArgument(format!(
            "operands live on different devices ({} vs {})",
            a.device, b.device
        )));
    }
    Ok(())
}

impl Backend for CpuBackend {
    type Tensor = CpuTensor;

    fn name(&self) -> &str {
        "cpu"
    }

    fn device_count(&self) -> usize {
        self.devices
    }

    // ── Data transfer ───────────────────────────────────────────

    fn copy_from_host_f32(&self, data: &[f32], shape: &[usize], device: usize) -> Result<CpuTensor> {
        validate_shape(data.len(), shape)?;
        self.check_device(device)?;
        Ok(CpuTensor::on_device(data.to_vec(), shape.to_vec(), device))
    }

    fn copy_to_host_f32(&self, tensor: &CpuTensor) -> Result<Vec<f32>> {
        Ok(tensor.data().to_vec())
    }

    // ── Compute ops ────────────────────────────────────────────

    fn matmul(&self, a: &CpuTensor, b: &CpuTensor) -> Result<CpuTensor> {
        let a_shape = a.shape();
        let b_shape = b.shape();
        if a_shape.len() != 2 || b_shape.len() != 2 {
            return Err(LorafuseError::InvalidArgument(
                "matmul requires 2D tensors".into(),
            ));
        }
        validate_same_device(a, b)?;
        let m = a_shape[0];
        let k = a_shape[1];
        let n = b_shape[1];
        if b_shape[0] != k {
            return Err(LorafuseError::ShapeMismatch {
                expected: vec![k, n],
                got: b_shape.to_vec(),
            });
        }
        if m > i32::MAX as usize || n > i32::MAX as usize || k > i32::MAX as usize {
            return Err(LorafuseError::InvalidArgument(
                "matmul dimensions exceed i32::MAX (BLAS limitation)".into(),
            ));
        }
        let mut c = vec![0.0f32; m * n];
        if m == 0 || n == 0 || k == 0 {
            return Ok(CpuTensor::on_device(c, vec![m, n], a.device));
        }
        unsafe {
            cblas::sgemm(
                cblas::Layout::RowMajor,
                cblas::Transpose::None,
                cblas::Transpose::None,
                m as i32,
                n as i32,
                k as i32,
                1.0,
                a.data(),
                k as i32,
                b.data(),
                n as i32,
                0.0,
                &mut c,
                n as i32,
            );
        }
        Ok(CpuTensor::on_device(c, vec![m, n], a.device))
    }

    fn add(&self, a: &CpuTensor, b: &CpuTensor) -> Result<CpuTensor> {
        validate_same_shape(a, b)?;
        validate_same_device(a, b)?;
        let data: Vec<f32> = a
            .data()
            .iter()
            .zip(b.data().iter())
            .map(|(x, y)| x + y)
            .collect();
        Ok(CpuTensor::on_device(data, a.shape().to_vec(), a.device))
    }

    fn mul_scalar(&self, a: &CpuTensor, scalar: f32) -> Result<CpuTensor> {
        let data: Vec<f32> = a.data().iter().map(|x| x * scalar).collect();
        Ok(CpuTensor::on_device(data, a.shape().to_vec(), a.device))
    }

    fn transpose(&self, x: &CpuTensor, dim0: usize, dim1: usize) -> Result<CpuTensor> {
        let shape = x.shape();
        if shape.len() != 2 || !((dim0 == 0 && dim1 == 1) || (dim0 == 1 && dim1 == 0)) {
            return Err(LorafuseError::InvalidArgument(
                "transpose currently only supports 2D tensors with dims (0,1)".into(),
            ));
        }
        let rows = shape[0];
        let cols = shape[1];
        let src = x.data();
        let mut out = vec![0.0f32; rows * cols];
        for r in 0..rows {
            for c in 0..cols {
                out[c * rows + r] = src[r * cols + c];
            }
        }
        Ok(CpuTensor::on_device(out, vec![cols, rows], x.device).with_dtype(x.dtype))
    }

    fn cast(&self, x: &CpuTensor, dtype: DType) -> Result<CpuTensor> {
        if x.dtype == dtype {
            return Ok(x.clone());
        }
        // Values stay f32 in memory, rounded to what the target dtype can hold.
        let data: Vec<f32> = match dtype {
            DType::F32 => x.data().to_vec(),
            DType::F16 => x
                .data()
                .iter()
                .map(|&v| half::f16::from_f32(v).to_f32())
                .collect(),
            DType::BF16 => x
                .data()
                .iter()
                .map(|&v| half::bf16::from_f32(v).to_f32())
                .collect(),
            DType::Q4 => return Err(LorafuseError::UnsupportedDtype(dtype)),
        };
        Ok(CpuTensor::on_device(data, x.shape().to_vec(), x.device).with_dtype(dtype))
    }
}
