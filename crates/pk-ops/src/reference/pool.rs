use crate::op::PoolParams;

/// Max or average pooling over `[N*C]` planes of `h × w`.
pub(crate) fn pool2d(
    x: &[f32],
    planes: usize,
    (h, w): (usize, usize),
    p: &PoolParams,
    (oh, ow): (usize, usize),
    max: bool,
) -> Vec<f32> {
    let mut out = vec![0.0f32; planes * oh * ow];
    for (plane, dst) in x.chunks_exact(h * w).zip(out.chunks_exact_mut(oh * ow)) {
        for y in 0..oh {
            for xo in 0..ow {
                let mut best = f32::MIN;
                let mut sum = 0.0;
                let mut count = 0;
                for ky in 0..p.kernel_h {
                    let iy = (y * p.stride_h + ky) as isize - p.pad_top as isize;
                    for kx in 0..p.kernel_w {
                        let ix = (xo * p.stride_w + kx) as isize - p.pad_left as isize;
                        if iy < 0 || ix < 0 || iy as usize >= h || ix as usize >= w {
                            continue;
                        }
                        let v = plane[iy as usize * w + ix as usize];
                        best = best.max(v);
                        sum += v;
                        count += 1;
                    }
                }
                dst[y * ow + xo] = if max {
                    best
                } else if p.count_include_pad {
                    sum / (p.kernel_h * p.kernel_w) as f32
                } else {
                    sum / count.max(1) as f32
                };
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_avg_with_and_without_pad() {
        let x = vec![1.0f32; 4];
        let p = PoolParams::new(3, 1).with_pad(1);
        let excl = pool2d(&x, 1, (2, 2), &p, (2, 2), false);
        assert_eq!(excl, vec![1.0; 4]);
        let incl = pool2d(&x, 1, (2, 2), &p.with_count_include_pad(true), (2, 2), false);
        assert_eq!(incl, vec![4.0 / 9.0; 4]);
    }
}
