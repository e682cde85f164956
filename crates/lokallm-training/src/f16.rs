//! IEEE 754 half-precision and bfloat16 conversions.
//!
//! Used for the reduced-precision compute path during training and for the
//! block scales of exported GGUF tensors.

/// Converts an `f32` to half-precision bits, rounding to nearest even.
#[must_use]
pub fn f32_to_f16_bits(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exp = ((bits >> 23) & 0xff) as i32;
    let man = bits & 0x007f_ffff;

    if exp == 0xff {
        let nan_bit = if man == 0 { 0 } else { 0x0200 };
        return sign | 0x7c00 | nan_bit;
    }

    let half_exp = exp - 127 + 15;
    if half_exp >= 0x1f {
        return sign | 0x7c00;
    }

    if half_exp <= 0 {
        if half_exp < -10 {
            return sign;
        }
        let man = man | 0x0080_0000;
        let shift = (14 - half_exp) as u32;
        let mut half_man = man >> shift;
        let round_bit = 1u32 << (shift - 1);
        if (man & round_bit) != 0 && (man & (3 * round_bit - 1)) != 0 {
            half_man += 1;
        }
        return sign | half_man as u16;
    }

    let half = (u32::from(sign)) | ((half_exp as u32) << 10) | (man >> 13);
    let round_bit = 0x0000_1000;
    if (man & round_bit) != 0 && (man & (3 * round_bit - 1)) != 0 {
        (half + 1) as u16
    } else {
        half as u16
    }
}

/// Expands half-precision bits to an `f32`.
#[must_use]
pub fn f16_bits_to_f32(half: u16) -> f32 {
    let sign = u32::from(half & 0x8000) << 16;
    let exp = u32::from((half >> 10) & 0x1f);
    let man = u32::from(half & 0x03ff);

    let bits = match (exp, man) {
        (0, 0) => sign,
        (0, _) => {
            // Subnormal: renormalize the mantissa.
            let mut e = 127 - 15 + 1;
            let mut m = man;
            while m & 0x0400 == 0 {
                m <<= 1;
                e -= 1;
            }
            sign | (e << 23) | ((m & 0x03ff) << 13)
        }
        (0x1f, 0) => sign | 0x7f80_0000,
        (0x1f, _) => sign | 0x7fc0_0000,
        _ => sign | ((exp + 127 - 15) << 23) | (man << 13),
    };
    f32::from_bits(bits)
}

/// Rounds through half precision.
#[must_use]
pub fn round_f16(value: f32) -> f32 {
    f16_bits_to_f32(f32_to_f16_bits(value))
}

/// Rounds through bfloat16 (round to nearest even on the dropped mantissa bits).
#[must_use]
pub fn round_bf16(value: f32) -> f32 {
    if value.is_nan() {
        return value;
    }
    let bits = value.to_bits();
    let lsb = (bits >> 16) & 1;
    let rounded = bits.wrapping_add(0x7fff + lsb) & 0xffff_0000;
    f32::from_bits(rounded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f16_exact_values_survive() {
        for v in [0.0f32, 1.0, -2.5, 0.5, 65504.0, -0.125] {
            assert_eq!(round_f16(v), v, "value {v}");
        }
    }

    #[test]
    fn test_f16_overflow_and_subnormals() {
        assert!(round_f16(1.0e6).is_infinite());
        let tiny = 2.0f32.powi(-24);
        assert_eq!(round_f16(tiny), tiny);
        assert_eq!(round_f16(2.0f32.powi(-30)), 0.0);
    }

    #[test]
    fn test_f16_rounds_to_nearest() {
        let v = 1.0f32 + 1.0 / 3000.0;
        let r = round_f16(v);
        assert!((r - v).abs() < 1.0e-3);
    }

    #[test]
    fn test_bf16_keeps_magnitude() {
        let v = 3.141_592_7_f32;
        let r = round_bf16(v);
        assert!((r - v).abs() < 0.02);
        assert_eq!(r.to_bits() & 0xffff, 0);
    }
}
