//! Convolution lowering: padded activations to GEMM columns, and the
//! scatter-accumulate inverse used by transposed convolution.
//!
//! Scalar columns are laid out `[C, kh*kw, out_h*out_w]`. Packed columns
//! keep the channel blocks of the input, `[C1, kh*kw, out_h, out_w, packn]`,
//! with a narrower final block when `C % packn != 0`. Within the GEMM the
//! reduction index of the packed form runs over `(block, kernel pos, lane)`.

use std::ops::AddAssign;

/// Spatial geometry of a 2-D convolution.
///
/// For transposed convolution the geometry describes the matching forward
/// convolution: `in_*` is the transposed output and `out_*` its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConvGeometry {
    pub in_h: usize,
    pub in_w: usize,
    pub out_h: usize,
    pub out_w: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub dilation_h: usize,
    pub dilation_w: usize,
    pub pad_top: usize,
    pub pad_left: usize,
    pub pad_down: usize,
    pub pad_right: usize,
}

impl ConvGeometry {
    pub fn padded_h(&self) -> usize {
        self.in_h + self.pad_top + self.pad_down
    }

    pub fn padded_w(&self) -> usize {
        self.in_w + self.pad_left + self.pad_right
    }

    /// Kernel positions per channel.
    pub fn maxk(&self) -> usize {
        self.kernel_h * self.kernel_w
    }

    pub fn in_size(&self) -> usize {
        self.in_h * self.in_w
    }

    pub fn out_size(&self) -> usize {
        self.out_h * self.out_w
    }
}

/// Output extent of a forward convolution along one axis.
pub fn conv_output_dim(
    input: usize,
    kernel: usize,
    stride: usize,
    dilation: usize,
    pad_before: usize,
    pad_after: usize,
) -> Option<usize> {
    if kernel == 0 || stride == 0 || dilation == 0 {
        return None;
    }
    let effective = dilation * (kernel - 1) + 1;
    let padded = input + pad_before + pad_after;
    padded.checked_sub(effective).map(|d| d / stride + 1)
}

/// Output extent of a transposed convolution along one axis.
pub fn deconv_output_dim(
    input: usize,
    kernel: usize,
    stride: usize,
    dilation: usize,
    pad_before: usize,
    pad_after: usize,
    output_pad: usize,
) -> Option<usize> {
    if input == 0 || kernel == 0 || stride == 0 || dilation == 0 {
        return None;
    }
    ((input - 1) * stride + dilation * (kernel - 1) + 1 + output_pad)
        .checked_sub(pad_before + pad_after)
        .filter(|&d| d > 0)
}

/// `[C, padded_h, padded_w]` to `[C, kh*kw, out_h*out_w]`.
pub fn im2col<T: Copy>(padded: &[T], cols: &mut [T], channels: usize, geo: &ConvGeometry) {
    let (ph, pw) = (geo.padded_h(), geo.padded_w());
    let maxk = geo.maxk();
    let out_size = geo.out_size();
    for c in 0..channels {
        let plane = &padded[c * ph * pw..(c + 1) * ph * pw];
        for kh in 0..geo.kernel_h {
            for kw in 0..geo.kernel_w {
                let row = (c * maxk + kh * geo.kernel_w + kw) * out_size;
                let dst = &mut cols[row..row + out_size];
                for oh in 0..geo.out_h {
                    let ih = oh * geo.stride_h + kh * geo.dilation_h;
                    let src_row = &plane[ih * pw..(ih + 1) * pw];
                    for ow in 0..geo.out_w {
                        dst[oh * geo.out_w + ow] = src_row[ow * geo.stride_w + kw * geo.dilation_w];
                    }
                }
            }
        }
    }
}

/// Packed `[C1, padded_h, padded_w, packn]` to
/// `[C1, kh*kw, out_h, out_w, packn]`, tail block included.
pub fn im2col_packn<T: Copy>(
    padded: &[T],
    cols: &mut [T],
    channels: usize,
    geo: &ConvGeometry,
    packn: usize,
) {
    let (ph, pw) = (geo.padded_h(), geo.padded_w());
    let maxk = geo.maxk();
    let out_size = geo.out_size();
    let mut c0 = 0;
    while c0 < channels {
        let vl = packn.min(channels - c0);
        let src = &padded[c0 * ph * pw..(c0 + vl) * ph * pw];
        let dst = &mut cols[c0 * maxk * out_size..(c0 + vl) * maxk * out_size];
        let mut out = 0;
        for kh in 0..geo.kernel_h {
            for kw in 0..geo.kernel_w {
                for oh in 0..geo.out_h {
                    let ih = oh * geo.stride_h + kh * geo.dilation_h;
                    for ow in 0..geo.out_w {
                        let iw = ow * geo.stride_w + kw * geo.dilation_w;
                        let at = (ih * pw + iw) * vl;
                        dst[out..out + vl].copy_from_slice(&src[at..at + vl]);
                        out += vl;
                    }
                }
            }
        }
        c0 += vl;
    }
}

/// Channel and kernel position of reduction index `kidx` in the packed
/// column order `(block, kernel pos, lane)`.
#[inline]
pub fn packed_k_split(kidx: usize, channels: usize, maxk: usize, packn: usize) -> (usize, usize) {
    let c0 = kidx / (packn * maxk) * packn;
    let vl = packn.min(channels - c0);
    let r = kidx - c0 * maxk;
    (c0 + r % vl, r / vl)
}

/// Offset of GEMM element `B[kidx][n]` inside packed columns.
#[inline]
pub fn packed_col_offset(
    kidx: usize,
    n: usize,
    channels: usize,
    maxk: usize,
    out_size: usize,
    packn: usize,
) -> usize {
    let c0 = kidx / (packn * maxk) * packn;
    let vl = packn.min(channels - c0);
    let r = kidx - c0 * maxk;
    c0 * maxk * out_size + ((r / vl) * out_size + n) * vl + r % vl
}

/// Scatter-accumulate `[C, kh*kw, out_h*out_w]` columns back into
/// `[C, in_h, in_w]` planes.
///
/// Every plane is first set to its bias (or `zero`), then contributions are
/// added in kernel-row, kernel-col, output-row, output-col order.
pub fn col2im<T: Copy + AddAssign>(
    cols: &[T],
    bias: Option<&[T]>,
    zero: T,
    image: &mut [T],
    channels: usize,
    geo: &ConvGeometry,
) {
    let (h, w) = (geo.in_h, geo.in_w);
    let maxk = geo.maxk();
    let out_size = geo.out_size();
    for c in 0..channels {
        let plane = &mut image[c * h * w..(c + 1) * h * w];
        plane.fill(bias.map_or(zero, |b| b[c]));
        for kh in 0..geo.kernel_h {
            for kw in 0..geo.kernel_w {
                let row = &cols[(c * maxk + kh * geo.kernel_w + kw) * out_size..][..out_size];
                for oh in 0..geo.out_h {
                    let ih = (oh * geo.stride_h + kh * geo.dilation_h) as isize - geo.pad_top as isize;
                    if ih < 0 || ih as usize >= h {
                        continue;
                    }
                    for ow in 0..geo.out_w {
                        let iw =
                            (ow * geo.stride_w + kw * geo.dilation_w) as isize - geo.pad_left as isize;
                        if iw >= 0 && (iw as usize) < w {
                            plane[ih as usize * w + iw as usize] += row[oh * geo.out_w + ow];
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::pack1ton;
    use crate::pad::pad_input;

    fn geo3x3(h: usize, w: usize, stride: usize, pad: usize) -> ConvGeometry {
        ConvGeometry {
            in_h: h,
            in_w: w,
            out_h: conv_output_dim(h, 3, stride, 1, pad, pad).unwrap(),
            out_w: conv_output_dim(w, 3, stride, 1, pad, pad).unwrap(),
            kernel_h: 3,
            kernel_w: 3,
            stride_h: stride,
            stride_w: stride,
            dilation_h: 1,
            dilation_w: 1,
            pad_top: pad,
            pad_left: pad,
            pad_down: pad,
            pad_right: pad,
        }
    }

    #[test]
    fn test_output_dims() {
        assert_eq!(conv_output_dim(4, 3, 1, 1, 1, 1), Some(4));
        assert_eq!(conv_output_dim(7, 3, 2, 1, 0, 0), Some(3));
        assert_eq!(conv_output_dim(5, 3, 1, 2, 0, 0), Some(1));
        assert_eq!(conv_output_dim(2, 3, 1, 1, 0, 0), None);
        assert_eq!(deconv_output_dim(3, 3, 2, 1, 1, 1, 1), Some(6));
    }

    #[test]
    fn test_im2col_no_padding() {
        // 1 channel 3x3, kernel 2x2 stride 1 -> out 2x2
        let geo = ConvGeometry {
            in_h: 3,
            in_w: 3,
            out_h: 2,
            out_w: 2,
            kernel_h: 2,
            kernel_w: 2,
            stride_h: 1,
            stride_w: 1,
            dilation_h: 1,
            dilation_w: 1,
            ..Default::default()
        };
        let input: Vec<i32> = (0..9).collect();
        let mut cols = vec![0; 16];
        im2col(&input, &mut cols, 1, &geo);
        assert_eq!(&cols[0..4], &[0, 1, 3, 4]);
        assert_eq!(&cols[12..16], &[4, 5, 7, 8]);
    }

    #[test]
    fn test_packed_columns_match_scalar() {
        let channels = 6;
        let packn = 4;
        let geo = geo3x3(5, 4, 2, 1);
        let input: Vec<i32> = (0..channels * 20).map(|v| v as i32).collect();

        let mut padded = vec![0; channels * geo.padded_h() * geo.padded_w()];
        pad_input(&input, &mut padded, channels, &geo, -1);
        let mut scalar = vec![0; channels * geo.maxk() * geo.out_size()];
        im2col(&padded, &mut scalar, channels, &geo);

        let inner = geo.padded_h() * geo.padded_w();
        let mut padded_packed = vec![0; padded.len()];
        pack1ton(&padded, &mut padded_packed, channels, inner, packn);
        let mut packed = vec![0; scalar.len()];
        im2col_packn(&padded_packed, &mut packed, channels, &geo, packn);

        let k = channels * geo.maxk();
        for kidx in 0..k {
            let (c, kk) = packed_k_split(kidx, channels, geo.maxk(), packn);
            for n in 0..geo.out_size() {
                let at = packed_col_offset(kidx, n, channels, geo.maxk(), geo.out_size(), packn);
                assert_eq!(packed[at], scalar[(c * geo.maxk() + kk) * geo.out_size() + n]);
            }
        }
    }

    #[test]
    fn test_col2im_inverts_sum_of_contributions() {
        // Each input pixel of a 3x3/s1/p1 conv on 4x4 is covered by 9, 6 or 4 windows.
        let geo = geo3x3(4, 4, 1, 1);
        let cols = vec![1.0f32; geo.maxk() * geo.out_size()];
        let mut image = vec![0.0f32; 16];
        col2im(&cols, Some(&[0.5f32][..]), 0.0, &mut image, 1, &geo);
        assert_eq!(image[0], 4.5);
        assert_eq!(image[1], 6.5);
        assert_eq!(image[5], 9.5);
    }
}
