//! Quantization primitives: affine conversion, fixed-point requantization
//! and zero-point fusion.
//!
//! The fixed-point convention is `real ≈ multiplier / 2^31 * 2^shift` with
//! `multiplier` in `[2^30, 2^31)`, so an accumulator is rescaled by a single
//! 64-bit multiply and a rounding shift of `31 - shift` bits.

use pk_tensor::QuantInfo;

/// `(q - zero_point) * scale`.
#[inline]
pub fn dequantize(q: i32, zero_point: i32, scale: f32) -> f32 {
    (q - zero_point) as f32 * scale
}

/// `round(value / scale) + zero_point`, saturated to `[min, max]`.
#[inline]
pub fn quantize_to_range(value: f32, scale: f32, zero_point: i32, min: i32, max: i32) -> i32 {
    let q = (value / scale).round() as i32;
    q.saturating_add(zero_point).clamp(min, max)
}

/// Quantize to int8, saturating on overflow.
#[inline]
pub fn quantize(value: f32, scale: f32, zero_point: i32) -> i8 {
    quantize_to_range(value, scale, zero_point, i8::MIN as i32, i8::MAX as i32) as i8
}

/// Quantize to the signed 4-bit range `[-8, 7]`.
#[inline]
pub fn quantize_i4(value: f32, scale: f32, zero_point: i32) -> i8 {
    quantize_to_range(value, scale, zero_point, -8, 7) as i8
}

#[inline]
pub fn saturate_i8(v: i32) -> i8 {
    v.clamp(i8::MIN as i32, i8::MAX as i32) as i8
}

#[inline]
pub fn saturate_i4(v: i32) -> i8 {
    v.clamp(-8, 7) as i8
}

/// Split `x` into a mantissa in `[0.5, 1)` and a power-of-two exponent.
fn frexp(x: f64) -> (f64, i32) {
    let mut m = x.abs();
    let mut e = 0;
    while m >= 1.0 {
        m /= 2.0;
        e += 1;
    }
    while m < 0.5 {
        m *= 2.0;
        e -= 1;
    }
    (m.copysign(x), e)
}

/// Derive the fixed-point `(multiplier, shift)` pair for a real scale.
///
/// Returns `(0, 0)` for zero, non-finite, or vanishingly small scales.
pub fn quantize_multiplier(real: f64) -> (i32, i32) {
    if real == 0.0 || !real.is_finite() {
        return (0, 0);
    }
    let (q, mut shift) = frexp(real);
    let mut q_fixed = (q * (1i64 << 31) as f64).round() as i64;
    if q_fixed == 1i64 << 31 {
        q_fixed /= 2;
        shift += 1;
    }
    if shift < -31 {
        return (0, 0);
    }
    (q_fixed as i32, shift)
}

/// Rescale an int32 accumulator: `round(acc * multiplier / 2^(31 - shift))`.
///
/// Rounding is half-up on the exact 64-bit product; the result saturates to
/// the i32 range.
#[inline]
pub fn requantize(acc: i32, multiplier: i32, shift: i32) -> i32 {
    let prod = acc as i64 * multiplier as i64;
    let total = 31 - shift;
    let v = if total <= 0 {
        prod.saturating_mul(1i64 << (-total).min(62))
    } else if total >= 63 {
        0
    } else {
        (prod + (1i64 << (total - 1))) >> total
    };
    v.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

/// Requantize and add the output zero point, then narrow to int8.
#[inline]
pub fn requantize_i8(acc: i32, multiplier: i32, shift: i32, out_zp: i32) -> i8 {
    saturate_i8(requantize(acc, multiplier, shift).saturating_add(out_zp))
}

/// Requantize and add the output zero point, then narrow to int4.
#[inline]
pub fn requantize_i4(acc: i32, multiplier: i32, shift: i32, out_zp: i32) -> i8 {
    saturate_i4(requantize(acc, multiplier, shift).saturating_add(out_zp))
}

/// Fixed-point rescale parameters, one pair per output channel or one
/// shared pair.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelRequant {
    params: Vec<(i32, i32)>,
}

impl ChannelRequant {
    pub fn per_tensor(multiplier: i32, shift: i32) -> Self {
        ChannelRequant {
            params: vec![(multiplier, shift)],
        }
    }

    /// Build from weight quant entries, using their derived pairs when
    /// present and deriving `in * w / out` otherwise.
    pub fn resolve(input: QuantInfo, weights: &[QuantInfo], output: QuantInfo) -> Self {
        let entries: Vec<QuantInfo> = if weights.is_empty() {
            vec![QuantInfo::default()]
        } else {
            weights.to_vec()
        };
        let params = entries
            .iter()
            .map(|w| {
                if w.has_requant() {
                    (w.multiplier, w.shift)
                } else {
                    quantize_multiplier(input.scale as f64 * w.scale as f64 / output.scale as f64)
                }
            })
            .collect();
        ChannelRequant { params }
    }

    /// `(multiplier, shift)` for output channel `c`.
    #[inline]
    pub fn get(&self, c: usize) -> (i32, i32) {
        if self.params.len() > 1 {
            self.params[c]
        } else {
            self.params[0]
        }
    }

    pub fn is_per_channel(&self) -> bool {
        self.params.len() > 1
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// `Σ_k a[r][k]` for each row of a row-major `[rows, k]` matrix.
pub fn row_sums(a: &[i8], rows: usize, k: usize) -> Vec<i32> {
    (0..rows)
        .map(|r| a[r * k..(r + 1) * k].iter().map(|&v| v as i32).sum())
        .collect()
}

/// `Σ_k b[k][c]` for each column of a row-major `[k, cols]` matrix.
pub fn col_sums(b: &[i8], k: usize, cols: usize) -> Vec<i32> {
    let mut sums = vec![0i32; cols];
    for row in b.chunks_exact(cols).take(k) {
        for (s, &v) in sums.iter_mut().zip(row) {
            *s += v as i32;
        }
    }
    sums
}

#[inline]
fn zp_at(zp: &[i32], i: usize) -> i32 {
    match zp.len() {
        0 => 0,
        1 => zp[0],
        _ => zp[i],
    }
}

/// Fold the activation-independent terms of
/// `Σ(w - zw)(x - zx) = Σwx - zw·Σx - zx·Σw + zw·zx·K` into a per-row bias.
///
/// `w_zp` holds one zero point per row, or a single shared one.
pub fn fold_zero_points(
    bias: Option<&[i32]>,
    w_row_sums: &[i32],
    w_zp: &[i32],
    x_zp: i32,
    k: usize,
) -> Vec<i32> {
    w_row_sums
        .iter()
        .enumerate()
        .map(|(r, &sw)| {
            let b = bias.map_or(0, |b| b[r]);
            b - x_zp * sw + zp_at(w_zp, r) * x_zp * k as i32
        })
        .collect()
}

/// Apply the remaining `-zw·Σx` term to a row-major `[rows, cols]`
/// accumulator block.
pub fn apply_weight_zero_point(acc: &mut [i32], cols: usize, w_zp: &[i32], x_col_sums: &[i32]) {
    if w_zp.iter().all(|&z| z == 0) {
        return;
    }
    for (r, row) in acc.chunks_exact_mut(cols).enumerate() {
        let z = zp_at(w_zp, r);
        for (v, &sx) in row.iter_mut().zip(x_col_sums) {
            *v -= z * sx;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantize_roundtrip_and_saturation() {
        assert_eq!(quantize(1.0, 0.5, 3), 5);
        assert_eq!(quantize(1000.0, 0.5, 0), 127);
        assert_eq!(quantize(-1000.0, 0.5, 0), -128);
        assert_eq!(dequantize(5, 3, 0.5), 1.0);
        assert_eq!(quantize_i4(100.0, 1.0, 0), 7);
    }

    #[test]
    fn test_identity_multiplier() {
        let (m, s) = quantize_multiplier(1.0);
        assert_eq!((m, s), (1 << 30, 1));
        for acc in [-1000, -129, -1, 0, 1, 77, 127, 128, 5000] {
            assert_eq!(requantize(acc, m, s), acc);
            assert_eq!(requantize_i8(acc, m, s, 0), saturate_i8(acc));
        }
    }

    #[test]
    fn test_requantize_matches_real_scale() {
        for &real in &[0.0039, 0.25, 0.75, 0.1234, 1.5, 3.0] {
            let (m, s) = quantize_multiplier(real);
            for acc in [-20000, -333, -7, 0, 9, 1024, 31337] {
                let expected = (acc as f64 * real).round();
                let got = requantize(acc, m, s) as f64;
                assert!((got - expected).abs() <= 1.0, "real={real} acc={acc}");
            }
        }
    }

    #[test]
    fn test_zero_multiplier() {
        assert_eq!(quantize_multiplier(0.0), (0, 0));
        assert_eq!(requantize(12345, 0, 0), 0);
    }

    #[test]
    fn test_channel_requant_lookup() {
        let input = QuantInfo::new(0.5, 0);
        let output = QuantInfo::new(1.0, 0);
        let weights = [QuantInfo::new(2.0, 0), QuantInfo::new(4.0, 0)];
        let r = ChannelRequant::resolve(input, &weights, output);
        assert!(r.is_per_channel());
        assert_eq!(r.get(0), quantize_multiplier(1.0));
        assert_eq!(r.get(1), quantize_multiplier(2.0));

        let shared = ChannelRequant::per_tensor(1 << 30, 1);
        assert_eq!(shared.get(17), (1 << 30, 1));
    }

    #[test]
    fn test_zero_point_fusion_matches_direct() {
        let (m, k, n) = (3, 5, 4);
        let w: Vec<i8> = (0..m * k).map(|i| (i as i8 % 7) - 3).collect();
        let x: Vec<i8> = (0..k * n).map(|i| (i as i8 % 5) - 1).collect();
        let w_zp = [1, -2, 0];
        let x_zp = 2;

        let mut raw = vec![0i32; m * n];
        for r in 0..m {
            for c in 0..n {
                raw[r * n + c] = (0..k).map(|p| w[r * k + p] as i32 * x[p * n + c] as i32).sum();
            }
        }
        let bias = fold_zero_points(None, &row_sums(&w, m, k), &w_zp, x_zp, k);
        let mut acc: Vec<i32> = raw
            .iter()
            .enumerate()
            .map(|(i, &v)| v + bias[i / n])
            .collect();
        apply_weight_zero_point(&mut acc, n, &w_zp, &col_sums(&x, k, n));

        for r in 0..m {
            for c in 0..n {
                let direct: i32 = (0..k)
                    .map(|p| (w[r * k + p] as i32 - w_zp[r]) * (x[p * n + c] as i32 - x_zp))
                    .sum();
                assert_eq!(acc[r * n + c], direct);
            }
        }
    }
}
