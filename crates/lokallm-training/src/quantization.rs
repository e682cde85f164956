//! Blockwise 4-bit storage for frozen base weights.
//!
//! Each block of `block_size` consecutive weights shares an absmax scale and
//! stores one 4-bit code per weight (two codes per byte, low nibble first).
//! With double quantization the absmax scales themselves are stored as
//! 8-bit codes relative to a per-group scale and a global offset.

use crate::error::{TrainingError, TrainingResult};
use crate::job::{QuantType, QuantizationConfig};

/// NormalFloat4 code book (quantiles of N(0, 1), normalised to [-1, 1]).
pub const NF4_CODE: [f32; 16] = [
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

/// E2M1 code book normalised by its largest magnitude (6.0).
pub const FP4_CODE: [f32; 16] = [
    0.0,
    0.083_333_336,
    0.166_666_67,
    0.25,
    0.333_333_34,
    0.5,
    0.666_666_7,
    1.0,
    -0.0,
    -0.083_333_336,
    -0.166_666_67,
    -0.25,
    -0.333_333_34,
    -0.5,
    -0.666_666_7,
    -1.0,
];

/// Number of absmax values sharing one 8-bit scale under double quantization.
pub const DOUBLE_QUANT_GROUP: usize = 256;

#[derive(Debug, Clone)]
enum BlockScales {
    Full(Vec<f32>),
    Double { codes: Vec<i8>, group_scales: Vec<f32>, offset: f32 },
}

impl BlockScales {
    fn quantize(absmax: Vec<f32>, double_quant: bool) -> Self {
        if !double_quant || absmax.is_empty() {
            return Self::Full(absmax);
        }

        let offset = absmax.iter().sum::<f32>() / absmax.len() as f32;
        let mut codes = Vec::with_capacity(absmax.len());
        let mut group_scales = Vec::with_capacity(absmax.len().div_ceil(DOUBLE_QUANT_GROUP));

        for group in absmax.chunks(DOUBLE_QUANT_GROUP) {
            let max_dev = group.iter().map(|a| (a - offset).abs()).fold(0.0f32, f32::max);
            let scale = if max_dev > 0.0 { max_dev / 127.0 } else { 1.0 };
            group_scales.push(scale);
            for a in group {
                codes.push(((a - offset) / scale).round().clamp(-127.0, 127.0) as i8);
            }
        }

        Self::Double { codes, group_scales, offset }
    }

    fn get(&self, block: usize) -> f32 {
        match self {
            Self::Full(values) => values[block],
            Self::Double { codes, group_scales, offset } => {
                f32::from(codes[block]) * group_scales[block / DOUBLE_QUANT_GROUP] + offset
            }
        }
    }

    fn storage_bytes(&self) -> usize {
        match self {
            Self::Full(values) => values.len() * 4,
            Self::Double { codes, group_scales, .. } => codes.len() + group_scales.len() * 4 + 4,
        }
    }
}

/// A row-major `[rows, cols]` matrix stored in 4 bits per weight.
#[derive(Debug, Clone)]
pub struct QuantizedTensor {
    rows: usize,
    cols: usize,
    quant_type: QuantType,
    block_size: usize,
    packed: Vec<u8>,
    scales: BlockScales,
}

fn code_book(quant_type: QuantType) -> &'static [f32; 16] {
    match quant_type {
        QuantType::Nf4 => &NF4_CODE,
        QuantType::Fp4 => &FP4_CODE,
    }
}

fn nearest_code(code: &[f32; 16], value: f32) -> u8 {
    let mut best = 0usize;
    let mut best_dist = f32::INFINITY;
    for (i, c) in code.iter().enumerate() {
        let dist = (c - value).abs();
        if dist < best_dist {
            best = i;
            best_dist = dist;
        }
    }
    best as u8
}

/// Quantizes a row-major matrix.
pub fn quantize_4bit(
    data: &[f32],
    rows: usize,
    cols: usize,
    config: &QuantizationConfig,
) -> TrainingResult<QuantizedTensor> {
    config.validate()?;
    if data.len() != rows * cols {
        return Err(TrainingError::Quantization(format!(
            "tensor has {} values but shape [{rows}, {cols}]",
            data.len()
        )));
    }
    if let Some(bad) = data.iter().find(|v| !v.is_finite()) {
        return Err(TrainingError::Quantization(format!("cannot quantize non-finite weight {bad}")));
    }

    let code = code_book(config.quant_type);
    let mut packed = vec![0u8; data.len().div_ceil(2)];
    let mut absmax = Vec::with_capacity(data.len().div_ceil(config.block_size));

    for (block_idx, block) in data.chunks(config.block_size).enumerate() {
        let amax = block.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        absmax.push(amax);
        let inv = if amax > 0.0 { 1.0 / amax } else { 0.0 };
        for (j, v) in block.iter().enumerate() {
            let idx = block_idx * config.block_size + j;
            let nibble = nearest_code(code, v * inv);
            if idx % 2 == 0 {
                packed[idx / 2] |= nibble;
            } else {
                packed[idx / 2] |= nibble << 4;
            }
        }
    }

    Ok(QuantizedTensor {
        rows,
        cols,
        quant_type: config.quant_type,
        block_size: config.block_size,
        packed,
        scales: BlockScales::quantize(absmax, config.double_quant),
    })
}

impl QuantizedTensor {
    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[must_use]
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn value(&self, idx: usize, code: &[f32; 16]) -> f32 {
        let byte = self.packed[idx / 2];
        let nibble = if idx % 2 == 0 { byte & 0x0f } else { byte >> 4 };
        code[nibble as usize] * self.scales.get(idx / self.block_size)
    }

    /// Reconstructs the full-precision matrix.
    #[must_use]
    pub fn dequantize(&self) -> Vec<f32> {
        let code = code_book(self.quant_type);
        (0..self.len()).map(|i| self.value(i, code)).collect()
    }

    /// Computes `out = W x`, dequantizing on the fly.
    pub fn matvec(&self, x: &[f32], out: &mut [f32]) {
        debug_assert_eq!(x.len(), self.cols);
        debug_assert_eq!(out.len(), self.rows);
        let code = code_book(self.quant_type);
        for (row, o) in out.iter_mut().enumerate() {
            let base = row * self.cols;
            let mut acc = 0.0f32;
            for (col, xv) in x.iter().enumerate() {
                acc += self.value(base + col, code) * xv;
            }
            *o = acc;
        }
    }

    /// Bytes used by codes and scales.
    #[must_use]
    pub fn storage_bytes(&self) -> usize {
        self.packed.len() + self.scales.storage_bytes()
    }
}
