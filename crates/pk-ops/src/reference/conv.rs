//! Direct convolution loops in the f32 domain.

use crate::op::Conv2dParams;

/// `[N, C, H, W]` convolved with `[O, C/g, kh, kw]` into `[N, O, oh, ow]`.
pub(crate) fn conv2d(
    x: &[f32],
    [n, c, h, w]: [usize; 4],
    weights: &[f32],
    out_channels: usize,
    bias: Option<&[f32]>,
    p: &Conv2dParams,
    (oh, ow): (usize, usize),
) -> Vec<f32> {
    let groups = p.groups.max(1);
    let icg = c / groups;
    let ocg = out_channels / groups;
    let maxk = p.kernel_h * p.kernel_w;
    let mut out = vec![0.0f32; n * out_channels * oh * ow];
    for b in 0..n {
        for o in 0..out_channels {
            let g = o / ocg;
            let w_o = &weights[o * icg * maxk..(o + 1) * icg * maxk];
            for y in 0..oh {
                for xo in 0..ow {
                    let mut acc = bias.map_or(0.0, |bias| bias[o]);
                    for ci in 0..icg {
                        let plane = &x[(b * c + g * icg + ci) * h * w..][..h * w];
                        for ky in 0..p.kernel_h {
                            let iy = (y * p.stride_h + ky * p.dilation_h) as isize - p.pad_top as isize;
                            if iy < 0 || iy as usize >= h {
                                continue;
                            }
                            for kx in 0..p.kernel_w {
                                let ix =
                                    (xo * p.stride_w + kx * p.dilation_w) as isize - p.pad_left as isize;
                                if ix < 0 || ix as usize >= w {
                                    continue;
                                }
                                acc += plane[iy as usize * w + ix as usize]
                                    * w_o[(ci * p.kernel_h + ky) * p.kernel_w + kx];
                            }
                        }
                    }
                    out[((b * out_channels + o) * oh + y) * ow + xo] = acc;
                }
            }
        }
    }
    out
}

/// Transposed convolution: `[N, C, H, W]` with `[C, O/g, kh, kw]` into
/// `[N, O, oh, ow]`, scattering every input pixel.
pub(crate) fn deconv2d(
    x: &[f32],
    [n, c, h, w]: [usize; 4],
    weights: &[f32],
    out_channels: usize,
    bias: Option<&[f32]>,
    p: &Conv2dParams,
    (oh, ow): (usize, usize),
) -> Vec<f32> {
    let groups = p.groups.max(1);
    let icg = c / groups;
    let ocg = out_channels / groups;
    let maxk = p.kernel_h * p.kernel_w;
    let mut out = vec![0.0f32; n * out_channels * oh * ow];
    for b in 0..n {
        for o in 0..out_channels {
            let plane = &mut out[(b * out_channels + o) * oh * ow..][..oh * ow];
            plane.fill(bias.map_or(0.0, |bias| bias[o]));
        }
        for ci in 0..c {
            let g = ci / icg;
            for oc in 0..ocg {
                let o = g * ocg + oc;
                let k = &weights[(ci * ocg + oc) * maxk..][..maxk];
                for iy in 0..h {
                    for ix in 0..w {
                        let v = x[((b * c + ci) * h + iy) * w + ix];
                        for ky in 0..p.kernel_h {
                            let y = (iy * p.stride_h + ky * p.dilation_h) as isize - p.pad_top as isize;
                            if y < 0 || y as usize >= oh {
                                continue;
                            }
                            for kx in 0..p.kernel_w {
                                let xo =
                                    (ix * p.stride_w + kx * p.dilation_w) as isize - p.pad_left as isize;
                                if xo < 0 || xo as usize >= ow {
                                    continue;
                                }
                                out[((b * out_channels + o) * oh + y as usize) * ow + xo as usize] +=
                                    v * k[ky * p.kernel_w + kx];
                            }
                        }
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_identity_kernel() {
        let x: Vec<f32> = (0..9).map(|i| i as f32).collect();
        let p = Conv2dParams::new(3, 3).with_pad(1);
        let mut k = vec![0.0; 9];
        k[4] = 1.0;
        let out = conv2d(&x, [1, 1, 3, 3], &k, 1, Some(&[0.5][..]), &p, (3, 3));
        for (o, v) in out.iter().zip(&x) {
            assert_abs_diff_eq!(*o, v + 0.5);
        }
    }

    #[test]
    fn test_deconv_stride2_spreads_pixels() {
        // 1x1 kernel, stride 2: each input lands on an even position
        let x = vec![1.0, 2.0, 3.0, 4.0];
        let p = Conv2dParams::new(1, 1).with_stride(2, 2);
        let out = deconv2d(&x, [1, 1, 2, 2], &[2.0], 1, None, &p, (3, 3));
        assert_eq!(out, vec![2.0, 0.0, 4.0, 0.0, 0.0, 0.0, 6.0, 0.0, 8.0]);
    }
}
