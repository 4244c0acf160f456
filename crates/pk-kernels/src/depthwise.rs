//! Depthwise convolution on channel-blocked data.
//!
//! Input, weights and output share the channel blocking: full blocks of
//! `packn` lanes followed by a narrower tail block. With `packn == 1` the
//! same code walks canonical planes. The input is expected to be padded
//! already (zero, or the input zero point for int8).
//!
//! ```text
//!   padded input  [C1, padded_h, padded_w, packn]
//!   weights       [C1, kh*kw, packn]
//!   output        [C1, out_h, out_w, packn]
//! ```

use pk_tensor::Result;

use crate::element::FloatElement;
use crate::im2col::ConvGeometry;
use crate::parallel::for_each_chunk;
use crate::quant::{requantize_i8, ChannelRequant};

/// Reorder `[C, kh, kw]` weights into the blocked `[C1, kh*kw, packn]` form.
pub fn reorder_weights<T: Copy + Default>(src: &[T], channels: usize, maxk: usize, packn: usize) -> Result<Vec<T>> {
    let mut dst = pk_tensor::scratch::alloc(channels * maxk)?;
    let mut c0 = 0;
    while c0 < channels {
        let vl = packn.min(channels - c0);
        let block = &mut dst[c0 * maxk..(c0 + vl) * maxk];
        for k in 0..maxk {
            for lane in 0..vl {
                block[k * vl + lane] = src[(c0 + lane) * maxk + k];
            }
        }
        c0 += vl;
    }
    Ok(dst)
}

/// Block `b` of a blocked buffer with `per_channel` elements per channel.
#[inline]
fn block<T>(data: &[T], b: usize, channels: usize, per_channel: usize, packn: usize) -> (&[T], usize, usize) {
    let c0 = b * packn;
    let vl = packn.min(channels - c0);
    (&data[c0 * per_channel..(c0 + vl) * per_channel], c0, vl)
}

/// Float depthwise convolution, one fan-out unit per channel block.
pub fn depthwise<T: FloatElement>(
    padded: &[T],
    weights: &[T],
    bias: Option<&[T]>,
    out: &mut [T],
    channels: usize,
    geo: &ConvGeometry,
    packn: usize,
    parallel: bool,
) {
    let in_plane = geo.padded_h() * geo.padded_w();
    let maxk = geo.maxk();
    let out_size = geo.out_size();
    let pw = geo.padded_w();
    for_each_chunk(out, packn * out_size, parallel, |b, dst| {
        let (src, c0, vl) = block(padded, b, channels, in_plane, packn);
        let (w, _, _) = block(weights, b, channels, maxk, packn);
        for oh in 0..geo.out_h {
            for ow in 0..geo.out_w {
                let o = (oh * geo.out_w + ow) * vl;
                for lane in 0..vl {
                    let mut acc = bias.map_or(0.0, |b| b[c0 + lane].to_f32());
                    for kh in 0..geo.kernel_h {
                        let ih = oh * geo.stride_h + kh * geo.dilation_h;
                        for kw in 0..geo.kernel_w {
                            let iw = ow * geo.stride_w + kw * geo.dilation_w;
                            let x = src[(ih * pw + iw) * vl + lane].to_f32();
                            let k = w[(kh * geo.kernel_w + kw) * vl + lane].to_f32();
                            acc = x.mul_add(k, acc);
                        }
                    }
                    dst[o + lane] = T::from_f32(acc);
                }
            }
        }
    });
}

/// Zero points and requantization of an int8 depthwise convolution.
#[derive(Debug, Clone)]
pub struct DepthwiseQuant {
    pub input_zp: i32,
    /// One entry per channel, or a single shared entry.
    pub weight_zp: Vec<i32>,
    pub output_zp: i32,
    pub requant: ChannelRequant,
}

impl DepthwiseQuant {
    #[inline]
    fn weight_zp(&self, c: usize) -> i32 {
        match self.weight_zp.len() {
            0 => 0,
            1 => self.weight_zp[0],
            _ => self.weight_zp[c],
        }
    }
}

/// Int8 depthwise convolution with per-channel requantization.
///
/// The quantization parameters are looked up by absolute channel index
/// `c0 + lane`, so the tail block uses its own entries.
pub fn depthwise_i8(
    padded: &[i8],
    weights: &[i8],
    bias: Option<&[i32]>,
    out: &mut [i8],
    channels: usize,
    geo: &ConvGeometry,
    packn: usize,
    quant: &DepthwiseQuant,
    parallel: bool,
) {
    let in_plane = geo.padded_h() * geo.padded_w();
    let maxk = geo.maxk();
    let out_size = geo.out_size();
    let pw = geo.padded_w();
    for_each_chunk(out, packn * out_size, parallel, |b, dst| {
        let (src, c0, vl) = block(padded, b, channels, in_plane, packn);
        let (w, _, _) = block(weights, b, channels, maxk, packn);
        for lane in 0..vl {
            let c = c0 + lane;
            let (mult, shift) = quant.requant.get(c);
            let wzp = quant.weight_zp(c);
            let b0 = bias.map_or(0, |b| b[c]);
            for oh in 0..geo.out_h {
                for ow in 0..geo.out_w {
                    let mut acc = b0;
                    for kh in 0..geo.kernel_h {
                        let ih = oh * geo.stride_h + kh * geo.dilation_h;
                        for kw in 0..geo.kernel_w {
                            let iw = ow * geo.stride_w + kw * geo.dilation_w;
                            let x = src[(ih * pw + iw) * vl + lane] as i32 - quant.input_zp;
                            let k = w[(kh * geo.kernel_w + kw) * vl + lane] as i32 - wzp;
                            acc += x * k;
                        }
                    }
                    dst[(oh * geo.out_w + ow) * vl + lane] = requantize_i8(acc, mult, shift, quant.output_zp);
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
    use crate::pad::padded;
    use crate::quant::quantize_multiplier;
    use pk_tensor::QuantInfo;

    fn geo(h: usize, w: usize) -> ConvGeometry {
        ConvGeometry {
            in_h: h,
            in_w: w,
            out_h: conv_output_dim(h, 3, 1, 1, 1, 1).unwrap(),
            out_w: conv_output_dim(w, 3, 1, 1, 1, 1).unwrap(),
            kernel_h: 3,
            kernel_w: 3,
            stride_h: 1,
            stride_w: 1,
            dilation_h: 1,
            dilation_w: 1,
            pad_top: 1,
            pad_left: 1,
            pad_down: 1,
            pad_right: 1,
        }
    }

    fn run_f32(input: &[f32], kernel: &[f32], channels: usize, g: &ConvGeometry, packn: usize) -> Vec<f32> {
        let mut packed_in = vec![0.0; input.len()];
        pack1ton(input, &mut packed_in, channels, g.in_size(), packn);
        let pad = padded(&packed_in, channels, g, packn, 0.0).unwrap();
        let w = reorder_weights(kernel, channels, g.maxk(), packn).unwrap();
        let mut out = vec![0.0; channels * g.out_size()];
        depthwise(&pad, &w, None, &mut out, channels, g, packn, true);
        let mut canonical = vec![0.0; out.len()];
        packnto1(&out, &mut canonical, channels, g.out_size(), packn);
        canonical
    }

    #[test]
    fn test_ones_border_counts() {
        let g = geo(4, 4);
        let channels = 8;
        let input = vec![1.0f32; channels * 16];
        let kernel = vec![1.0f32; channels * 9];
        let reference = run_f32(&input, &kernel, channels, &g, 1);
        for plane in reference.chunks(16) {
            assert_eq!(
                plane,
                &[4., 6., 6., 4., 6., 9., 9., 6., 6., 9., 9., 6., 4., 6., 6., 4.]
            );
        }
        for packn in [4, 8] {
            assert_eq!(run_f32(&input, &kernel, channels, &g, packn), reference);
        }
    }

    #[test]
    fn test_tail_channel_uses_its_own_quant() {
        // packn 4, five channels: one full block and a one-lane tail
        let packn = 4;
        let channels = packn + 1;
        let g = geo(3, 3);
        let input = vec![1i8; channels * 9];
        let kernel = vec![1i8; channels * 9];
        let weights: Vec<QuantInfo> = (0..channels)
            .map(|c| {
                let (m, s) = quantize_multiplier(if c == packn { 2.0 } else { 1.0 });
                QuantInfo::new(1.0, 0).with_requant(m, s)
            })
            .collect();
        let quant = DepthwiseQuant {
            input_zp: 0,
            weight_zp: vec![0],
            output_zp: 0,
            requant: ChannelRequant::resolve(QuantInfo::default(), &weights, QuantInfo::default()),
        };

        let mut packed_in = vec![0i8; input.len()];
        pack1ton(&input, &mut packed_in, channels, 9, packn);
        let pad = padded(&packed_in, channels, &g, packn, 0).unwrap();
        let w = reorder_weights(&kernel, channels, 9, packn).unwrap();
        let mut out = vec![0i8; channels * 9];
        depthwise_i8(&pad, &w, None, &mut out, channels, &g, packn, &quant, false);
        let mut canonical = vec![0i8; out.len()];
        packnto1(&out, &mut canonical, channels, 9, packn);

        // centre pixel sees 9 ones
        assert_eq!(canonical[4], 9);
        assert_eq!(canonical[packn * 9 + 4], 18);
        assert_eq!(canonical[(packn - 1) * 9 + 4], 9);
    }

    #[test]
    fn test_int8_zero_points_cancel() {
        let g = geo(2, 2);
        let in_zp = 3;
        let input = vec![(1 + in_zp) as i8; 4];
        let kernel = vec![2i8; 9];
        let (m, s) = quantize_multiplier(1.0);
        let quant = DepthwiseQuant {
            input_zp: in_zp,
            weight_zp: vec![0],
            output_zp: -1,
            requant: ChannelRequant::per_tensor(m, s),
        };
        let pad = padded(&input, 1, &g, 1, in_zp as i8).unwrap();
        let w = reorder_weights(&kernel, 1, 9, 1).unwrap();
        let mut out = vec![0i8; 4];
        depthwise_i8(&pad, &w, Some(&[1][..]), &mut out, 1, &g, 1, &quant, false);
        // every output sees the 4 real pixels: 4 * 1 * 2 + bias 1 - 1
        assert_eq!(out, vec![8, 8, 8, 8]);
    }
}
