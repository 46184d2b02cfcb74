//! Blockwise 4-bit weight quantization.
//!
//! Each block of `block_size` consecutive elements shares one absmax scale.
//! Values are packed two per byte, element `i` in the low nibble of byte
//! `i / 2` when `i` is even and the high nibble when odd.
//!
//! - NF4: `x ≈ absmax * NF4_LEVELS[code]`
//! - INT4: `x ≈ (absmax / 7) * (code - 8)`, code in 1..=15
//!
//! With double quantization the f32 block scales are themselves stored as
//! int8 around their mean, 256 scales per group.

use lorafuse_core::{LorafuseError, QuantConfig, QuantScheme, Result};

/// NormalFloat-4 levels: quantiles of N(0, 1) rescaled to [-1, 1].
pub const NF4_LEVELS: [f32; 16] = [
    -1.0,
    -0.696_192_8,
    -0.525_073_05,
    -0.394_917_5,
    -0.284_441_38,
    -0.184_773_43,
    -0.091_050_036,
    0.0,
    0.079_580_3,
    0.160_930_2,
    0.246_112_3,
    0.337_915_24,
    0.440_709_83,
    0.562_617,
    0.722_956_84,
    1.0,
];

/// Scales per double-quantization group.
pub const SCALE_GROUP_SIZE: usize = 256;

const INT4_MAX: f32 = 7.0;
const INT4_ZERO: u8 = 8;

/// Per-block scale storage.
#[derive(Debug, Clone)]
pub enum BlockScales {
    F32(Vec<f32>),
    /// `scale[i] ≈ codes[i] * group_scales[i / SCALE_GROUP_SIZE] + offset`
    Int8 {
        offset: f32,
        group_scales: Vec<f32>,
        codes: Vec<i8>,
    },
}

impl BlockScales {
    fn encode(scales: Vec<f32>, double_quant: bool) -> Self {
        if !double_quant || scales.is_empty() {
            return BlockScales::F32(scales);
        }
        let offset = scales.iter().sum::<f32>() / scales.len() as f32;
        let mut group_scales = Vec::with_capacity(scales.len().div_ceil(SCALE_GROUP_SIZE));
        let mut codes = Vec::with_capacity(scales.len());
        for group in scales.chunks(SCALE_GROUP_SIZE) {
            let absmax = group
                .iter()
                .map(|s| (s - offset).abs())
                .fold(0.0f32, f32::max);
            let step = absmax / 127.0;
            group_scales.push(step);
            for s in group {
                let code = if step > 0.0 {
                    ((s - offset) / step).round().clamp(-127.0, 127.0) as i8
                } else {
                    0
                };
                codes.push(code);
            }
        }
        BlockScales::Int8 {
            offset,
            group_scales,
            codes,
        }
    }

    pub fn get(&self, block: usize) -> f32 {
        match self {
            BlockScales::F32(scales) => scales[block],
            BlockScales::Int8 {
                offset,
                group_scales,
                codes,
            } => codes[block] as f32 * group_scales[block / SCALE_GROUP_SIZE] + offset,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            BlockScales::F32(scales) => scales.len(),
            BlockScales::Int8 { codes, .. } => codes.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn memory_bytes(&self) -> usize {
        match self {
            BlockScales::F32(scales) => scales.len() * 4,
            BlockScales::Int8 {
                group_scales,
                codes,
                ..
            } => 4 + group_scales.len() * 4 + codes.len(),
        }
    }
}

/// A weight tensor held in 4-bit form.
#[derive(Debug, Clone)]
pub struct QuantizedTensor {
    scheme: QuantScheme,
    shape: Vec<usize>,
    block_size: usize,
    scales: BlockScales,
    data: Vec<u8>,
}

impl QuantizedTensor {
    pub fn quantize(values: &[f32], shape: &[usize], config: &QuantConfig) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if numel != values.len() {
            return Err(LorafuseError::ShapeMismatch {
                expected: shape.to_vec(),
                got: vec![values.len()],
            });
        }
        if config.block_size == 0 {
            return Err(LorafuseError::InvalidArgument(
                "quantization block size must be positive".into(),
            ));
        }

        let mut scales = Vec::with_capacity(numel.div_ceil(config.block_size));
        let mut data = vec![0u8; numel.div_ceil(2)];

        for (block_idx, block) in values.chunks(config.block_size).enumerate() {
            let absmax = block.iter().map(|v| v.abs()).fold(0.0f32, f32::max);
            scales.push(absmax);
            let base = block_idx * config.block_size;
            for (i, &v) in block.iter().enumerate() {
                let code = match config.scheme {
                    QuantScheme::Nf4 => nf4_code(v, absmax),
                    QuantScheme::Int4 => int4_code(v, absmax),
                };
                let pos = base + i;
                if pos % 2 == 0 {
                    data[pos / 2] |= code;
                } else {
                    data[pos / 2] |= code << 4;
                }
            }
        }

        Ok(Self {
            scheme: config.scheme,
            shape: shape.to_vec(),
            block_size: config.block_size,
            scales: BlockScales::encode(scales, config.double_quant),
            data,
        })
    }

    pub fn dequantize(&self) -> Vec<f32> {
        let numel = self.numel();
        let mut out = Vec::with_capacity(numel);
        for pos in 0..numel {
            let byte = self.data[pos / 2];
            let code = if pos % 2 == 0 { byte & 0x0F } else { byte >> 4 };
            let absmax = self.scales.get(pos / self.block_size);
            let v = match self.scheme {
                QuantScheme::Nf4 => NF4_LEVELS[code as usize] * absmax,
                QuantScheme::Int4 => (code as f32 - INT4_ZERO as f32) * absmax / INT4_MAX,
            };
            out.push(v);
        }
        out
    }

    pub fn scheme(&self) -> QuantScheme {
        self.scheme
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn scales(&self) -> &BlockScales {
        &self.scales
    }

    /// Bytes held by packed codes plus scales.
    pub fn memory_bytes(&self) -> usize {
        self.data.len() + self.scales.memory_bytes()
    }
}

/// Nearest NF4 level to `v / absmax`.
fn nf4_code(v: f32, absmax: f32) -> u8 {
    if absmax == 0.0 {
        return 7; // exact zero level
    }
    let x = (v / absmax).clamp(-1.0, 1.0);
    // Levels are sorted: pick the first level whose midpoint with its
    // successor lies above x.
    for i in 0..NF4_LEVELS.len() - 1 {
        let mid = (NF4_LEVELS[i] + NF4_LEVELS[i + 1]) * 0.5;
        if x < mid {
            return i as u8;
        }
    }
    (NF4_LEVELS.len() - 1) as u8
}

fn int4_code(v: f32, absmax: f32) -> u8 {
    if absmax == 0.0 {
        return INT4_ZERO;
    }
    let q = (v / (absmax / INT4_MAX)).round().clamp(-INT4_MAX, INT4_MAX);
    (q as i8 + INT4_ZERO as i8) as u8
}
