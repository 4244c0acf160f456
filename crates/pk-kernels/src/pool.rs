//! Max and average pooling over channel-blocked (or, with `packn == 1`,
//! canonical) planes. Padding is implicit: out-of-range taps are skipped.

use half::f16;

use crate::im2col::ConvGeometry;
use crate::parallel::for_each_chunk;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Max,
    /// Average; `count_include_pad` divides by the full window size.
    Avg { count_include_pad: bool },
}

/// Element types pooling is defined for.
pub trait PoolElement: Copy + Send + Sync + 'static {
    type Acc: Copy;

    fn lowest() -> Self;
    fn max(a: Self, b: Self) -> Self;
    fn zero() -> Self::Acc;
    fn add(acc: Self::Acc, v: Self) -> Self::Acc;
    fn div(acc: Self::Acc, count: usize) -> Self;
}

impl PoolElement for f32 {
    type Acc = f32;

    fn lowest() -> Self {
        f32::MIN
    }

    fn max(a: Self, b: Self) -> Self {
        a.max(b)
    }

    fn zero() -> f32 {
        0.0
    }

    fn add(acc: f32, v: Self) -> f32 {
        acc + v
    }

    fn div(acc: f32, count: usize) -> Self {
        acc / count as f32
    }
}

impl PoolElement for f16 {
    type Acc = f32;

    fn lowest() -> Self {
        f16::MIN
    }

    fn max(a: Self, b: Self) -> Self {
        if b > a {
            b
        } else {
            a
        }
    }

    fn zero() -> f32 {
        0.0
    }

    fn add(acc: f32, v: Self) -> f32 {
        acc + v.to_f32()
    }

    fn div(acc: f32, count: usize) -> Self {
        f16::from_f32(acc / count as f32)
    }
}

/// Quantized pooling assumes input and output share scale and zero point.
impl PoolElement for i8 {
    type Acc = i32;

    fn lowest() -> Self {
        i8::MIN
    }

    fn max(a: Self, b: Self) -> Self {
        a.max(b)
    }

    fn zero() -> i32 {
        0
    }

    fn add(acc: i32, v: Self) -> i32 {
        acc + v as i32
    }

    fn div(acc: i32, count: usize) -> Self {
        let n = count as i32;
        // round half away from zero
        let q = if acc >= 0 { (acc + n / 2) / n } else { (acc - n / 2) / n };
        q.clamp(i8::MIN as i32, i8::MAX as i32) as i8
    }
}

/// Pool unpadded blocked input `[C1, in_h, in_w, packn]` into
/// `[C1, out_h, out_w, packn]`.
///
/// An inclusive average adds `pad_value` (zero, or the zero point for int8)
/// for every padded tap; an exclusive one counts only in-range taps.
pub fn pool2d<T: PoolElement>(
    input: &[T],
    out: &mut [T],
    channels: usize,
    geo: &ConvGeometry,
    packn: usize,
    kind: PoolKind,
    pad_value: T,
    parallel: bool,
) {
    let in_size = geo.in_size();
    let out_size = geo.out_size();
    for_each_chunk(out, packn * out_size, parallel, |b, dst| {
        let c0 = b * packn;
        let vl = packn.min(channels - c0);
        let src = &input[c0 * in_size..(c0 + vl) * in_size];
        for oh in 0..geo.out_h {
            let h0 = (oh * geo.stride_h) as isize - geo.pad_top as isize;
            for ow in 0..geo.out_w {
                let w0 = (ow * geo.stride_w) as isize - geo.pad_left as isize;
                let o = (oh * geo.out_w + ow) * vl;
                for lane in 0..vl {
                    let mut best = T::lowest();
                    let mut real = T::zero();
                    let mut padded = T::zero();
                    let mut taps = 0usize;
                    let mut window = 0usize;
                    for kh in 0..geo.kernel_h {
                        let ih = h0 + kh as isize;
                        for kw in 0..geo.kernel_w {
                            let iw = w0 + kw as isize;
                            // taps hanging past the explicit padding never count
                            if ih >= (geo.in_h + geo.pad_down) as isize
                                || iw >= (geo.in_w + geo.pad_right) as isize
                            {
                                continue;
                            }
                            window += 1;
                            if ih < 0 || iw < 0 || ih as usize >= geo.in_h || iw as usize >= geo.in_w {
                                padded = T::add(padded, pad_value);
                                continue;
                            }
                            let v = src[(ih as usize * geo.in_w + iw as usize) * vl + lane];
                            best = T::max(best, v);
                            real = T::add(real, v);
                            padded = T::add(padded, v);
                            taps += 1;
                        }
                    }
                    dst[o + lane] = match kind {
                        PoolKind::Max => best,
                        PoolKind::Avg { count_include_pad: true } => T::div(padded, window.max(1)),
                        PoolKind::Avg { count_include_pad: false } => T::div(real, taps.max(1)),
                    };
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im2col::conv_output_dim;
    use crate::pack::{pack1ton, packnto1};

    fn geo(h: usize, k: usize, s: usize, p: usize) -> ConvGeometry {
        ConvGeometry {
            in_h: h,
            in_w: h,
            out_h: conv_output_dim(h, k, s, 1, p, p).unwrap(),
            out_w: conv_output_dim(h, k, s, 1, p, p).unwrap(),
            kernel_h: k,
            kernel_w: k,
            stride_h: s,
            stride_w: s,
            dilation_h: 1,
            dilation_w: 1,
            pad_top: p,
            pad_left: p,
            pad_down: p,
            pad_right: p,
        }
    }

    #[test]
    fn test_max_2x2s2() {
        let g = geo(4, 2, 2, 0);
        let input: Vec<f32> = (0..16).map(|v| v as f32).collect();
        let mut out = vec![0.0; 4];
        pool2d(&input, &mut out, 1, &g, 1, PoolKind::Max, 0.0, false);
        assert_eq!(out, vec![5.0, 7.0, 13.0, 15.0]);
    }

    #[test]
    fn test_avg_padding_modes() {
        let g = geo(2, 3, 1, 1);
        let input = vec![4.0f32; 4];
        let mut incl = vec![0.0; 4];
        let mut excl = vec![0.0; 4];
        pool2d(&input, &mut incl, 1, &g, 1, PoolKind::Avg { count_include_pad: true }, 0.0, false);
        pool2d(&input, &mut excl, 1, &g, 1, PoolKind::Avg { count_include_pad: false }, 0.0, false);
        assert_eq!(incl, vec![16.0 / 9.0; 4]);
        assert_eq!(excl, vec![4.0; 4]);
    }

    #[test]
    fn test_packed_matches_canonical() {
        let channels = 6;
        let g = geo(5, 3, 2, 1);
        let input: Vec<i8> = (0..channels * 25).map(|v| (v % 50) as i8 - 25).collect();
        let mut reference = vec![0i8; channels * g.out_size()];
        pool2d(&input, &mut reference, channels, &g, 1, PoolKind::Max, 0, false);

        let mut packed = vec![0i8; input.len()];
        pack1ton(&input, &mut packed, channels, 25, 4);
        let mut out = vec![0i8; reference.len()];
        pool2d(&packed, &mut out, channels, &g, 4, PoolKind::Max, 0, true);
        let mut back = vec![0i8; out.len()];
        packnto1(&out, &mut back, channels, g.out_size(), 4);
        assert_eq!(back, reference);
    }

    #[test]
    fn test_int8_average_rounds() {
        assert_eq!(<i8 as PoolElement>::div(5, 2), 3);
        assert_eq!(<i8 as PoolElement>::div(-5, 2), -3);
        assert_eq!(<i8 as PoolElement>::div(4, 3), 1);
    }
}
