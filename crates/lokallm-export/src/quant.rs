//! ggml tensor encodings used in exported files.

use crate::error::ExportError;
use lokallm_training::f16::{f16_bits_to_f32, f32_to_f16_bits};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Elements per Q4_0 / Q8_0 block.
pub const QK: usize = 32;

/// On-disk tensor type, with its ggml id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GgmlType {
    F32,
    F16,
    Q4_0,
    Q8_0,
}

impl GgmlType {
    #[must_use]
    pub fn id(self) -> u32 {
        match self {
            Self::F32 => 0,
            Self::F16 => 1,
            Self::Q4_0 => 2,
            Self::Q8_0 => 8,
        }
    }

    #[must_use]
    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            0 => Some(Self::F32),
            1 => Some(Self::F16),
            2 => Some(Self::Q4_0),
            8 => Some(Self::Q8_0),
            _ => None,
        }
    }

    /// Bytes needed for `n` elements.
    #[must_use]
    pub fn byte_size(self, n: usize) -> usize {
        match self {
            Self::F32 => n * 4,
            Self::F16 => n * 2,
            Self::Q4_0 => n / QK * 18,
            Self::Q8_0 => n / QK * 34,
        }
    }

    #[must_use]
    pub fn is_block_quantized(self) -> bool {
        matches!(self, Self::Q4_0 | Self::Q8_0)
    }
}

/// Scheme applied to the merged matrices of an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportQuantization {
    #[default]
    Q4_0,
    Q8_0,
    F16,
}

impl ExportQuantization {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Q4_0 => "q4_0",
            Self::Q8_0 => "q8_0",
            Self::F16 => "f16",
        }
    }

    /// `general.file_type` value.
    #[must_use]
    pub fn file_type(self) -> u32 {
        match self {
            Self::F16 => 1,
            Self::Q4_0 => 2,
            Self::Q8_0 => 7,
        }
    }

    /// Encoding for a tensor with the given row length. Vectors stay f32;
    /// rows that do not split into whole blocks fall back to f16.
    #[must_use]
    pub fn tensor_type(self, dims: usize, row_len: usize) -> GgmlType {
        if dims < 2 {
            return GgmlType::F32;
        }
        match self {
            Self::F16 => GgmlType::F16,
            Self::Q4_0 | Self::Q8_0 if row_len % QK != 0 => GgmlType::F16,
            Self::Q4_0 => GgmlType::Q4_0,
            Self::Q8_0 => GgmlType::Q8_0,
        }
    }
}

impl FromStr for ExportQuantization {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "q4_0" | "q4" => Ok(Self::Q4_0),
            "q8_0" | "q8" => Ok(Self::Q8_0),
            "f16" => Ok(Self::F16),
            other => Err(ExportError::UnknownQuantization(other.to_string())),
        }
    }
}

impl std::fmt::Display for ExportQuantization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Encodes `data` (length a multiple of [`QK`] for block types).
#[must_use]
pub fn encode(data: &[f32], ty: GgmlType) -> Vec<u8> {
    match ty {
        GgmlType::F32 => data.iter().flat_map(|v| v.to_le_bytes()).collect(),
        GgmlType::F16 => data.iter().flat_map(|v| f32_to_f16_bits(*v).to_le_bytes()).collect(),
        GgmlType::Q4_0 => quantize_q4_0(data),
        GgmlType::Q8_0 => quantize_q8_0(data),
    }
}

/// Each block: f16 scale `d`, then 16 bytes holding 32 nibbles. Element `j`
/// sits in the low nibble of byte `j`, element `j + 16` in its high nibble.
#[must_use]
pub fn quantize_q4_0(data: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(GgmlType::Q4_0.byte_size(data.len()));
    for block in data.chunks_exact(QK) {
        let mut amax = 0.0f32;
        let mut max = 0.0f32;
        for v in block {
            if v.abs() > amax {
                amax = v.abs();
                max = *v;
            }
        }
        let d = max / -8.0;
        let id = if d == 0.0 { 0.0 } else { 1.0 / d };
        out.extend_from_slice(&f32_to_f16_bits(d).to_le_bytes());
        for j in 0..QK / 2 {
            let lo = ((block[j] * id + 8.5) as i32).clamp(0, 15) as u8;
            let hi = ((block[j + QK / 2] * id + 8.5) as i32).clamp(0, 15) as u8;
            out.push(lo | (hi << 4));
        }
    }
    out
}

#[must_use]
pub fn dequantize_q4_0(bytes: &[u8]) -> Vec<f32> {
    let mut out = Vec::with_capacity(bytes.len() / 18 * QK);
    for block in bytes.chunks_exact(18) {
        let d = f16_bits_to_f32(u16::from_le_bytes([block[0], block[1]]));
        let qs = &block[2..];
        let mut values = [0.0f32; QK];
        for (j, q) in qs.iter().enumerate() {
            values[j] = (f32::from(q & 0x0f) - 8.0) * d;
            values[j + QK / 2] = (f32::from(q >> 4) - 8.0) * d;
        }
        out.extend_from_slice(&values);
    }
    out
}

/// Each block: f16 scale `d = amax / 127`, then 32 signed bytes.
#[must_use]
pub fn quantize_q8_0(data: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(GgmlType::Q8_0.byte_size(data.len()));
    for block in data.chunks_exact(QK) {
        let amax = block.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        let d = amax / 127.0;
        let id = if d == 0.0 { 0.0 } else { 1.0 / d };
        out.extend_from_slice(&f32_to_f16_bits(d).to_le_bytes());
        out.extend(block.iter().map(|v| (v * id).round().clamp(-127.0, 127.0) as i8 as u8));
    }
    out
}

#[must_use]
pub fn dequantize_q8_0(bytes: &[u8]) -> Vec<f32> {
    let mut out = Vec::with_capacity(bytes.len() / 34 * QK);
    for block in bytes.chunks_exact(34) {
        let d = f16_bits_to_f32(u16::from_le_bytes([block[0], block[1]]));
        out.extend(block[2..].iter().map(|q| f32::from(*q as i8) * d));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wave(n: usize) -> Vec<f32> {
        (0..n).map(|i| ((i as f32) * 0.61).cos() * 0.3).collect()
    }

    #[test]
    fn test_q4_0_block_layout() {
        let data = wave(64);
        let bytes = quantize_q4_0(&data);
        assert_eq!(bytes.len(), 2 * 18);

        let back = dequantize_q4_0(&bytes);
        let amax = data.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        for (a, b) in data.iter().zip(&back) {
            // One step is amax / 8. The clamped end of the range can be a full step off.
            assert!((a - b).abs() <= amax / 8.0 + 2e-3, "{a} vs {b}");
        }
    }

    #[test]
    fn test_q4_0_largest_magnitude_is_exact_up_to_f16() {
        let mut data = vec![0.01f32; 32];
        data[7] = -0.8;
        let back = dequantize_q4_0(&quantize_q4_0(&data));
        assert!((back[7] + 0.8).abs() < 1e-3);
    }

    #[test]
    fn test_q8_0_is_tighter_than_q4_0() {
        let data = wave(96);
        let q8 = dequantize_q8_0(&quantize_q8_0(&data));
        let q4 = dequantize_q4_0(&quantize_q4_0(&data));
        let err = |v: &[f32]| data.iter().zip(v).map(|(a, b)| (a - b).abs()).fold(0.0f32, f32::max);
        assert!(err(&q8) < err(&q4));
        assert_eq!(quantize_q8_0(&data).len(), GgmlType::Q8_0.byte_size(96));
    }

    #[test]
    fn test_zero_block_encodes_zero_scale() {
        let bytes = quantize_q4_0(&[0.0; 32]);
        assert_eq!(&bytes[..2], &[0, 0]);
        assert!(dequantize_q4_0(&bytes).iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_tensor_type_selection() {
        assert_eq!(ExportQuantization::Q4_0.tensor_type(1, 64), GgmlType::F32);
        assert_eq!(ExportQuantization::Q4_0.tensor_type(2, 64), GgmlType::Q4_0);
        assert_eq!(ExportQuantization::Q4_0.tensor_type(2, 70), GgmlType::F16);
        assert_eq!(ExportQuantization::F16.tensor_type(2, 64), GgmlType::F16);
        assert_eq!("Q8_0".parse::<ExportQuantization>().unwrap(), ExportQuantization::Q8_0);
        assert!("q5_k".parse::<ExportQuantization>().is_err());
    }
}
