//! Border padding ahead of im2col.
//!
//! Floating-point tensors pad with zero; quantized tensors must pad with
//! their zero point so the border dequantizes to zero.

use pk_tensor::scratch;
use pk_tensor::Result;

use crate::im2col::ConvGeometry;

/// Pad canonical `[C, in_h, in_w]` planes into `[C, padded_h, padded_w]`.
pub fn pad_input<T: Copy>(src: &[T], dst: &mut [T], channels: usize, geo: &ConvGeometry, value: T) {
    let (ph, pw) = (geo.padded_h(), geo.padded_w());
    for c in 0..channels {
        let s = &src[c * geo.in_size()..(c + 1) * geo.in_size()];
        let d = &mut dst[c * ph * pw..(c + 1) * ph * pw];
        d.fill(value);
        for h in 0..geo.in_h {
            let row = (h + geo.pad_top) * pw + geo.pad_left;
            d[row..row + geo.in_w].copy_from_slice(&s[h * geo.in_w..(h + 1) * geo.in_w]);
        }
    }
}

/// Pad packed `[C1, in_h, in_w, packn]` blocks (tail included) into
/// `[C1, padded_h, padded_w, packn]`.
pub fn pad_input_packn<T: Copy>(
    src: &[T],
    dst: &mut [T],
    channels: usize,
    geo: &ConvGeometry,
    packn: usize,
    value: T,
) {
    let (ph, pw) = (geo.padded_h(), geo.padded_w());
    let mut c0 = 0;
    while c0 < channels {
        let vl = packn.min(channels - c0);
        let s = &src[c0 * geo.in_size()..(c0 + vl) * geo.in_size()];
        let d = &mut dst[c0 * ph * pw..(c0 + vl) * ph * pw];
        d.fill(value);
        for h in 0..geo.in_h {
            let row = ((h + geo.pad_top) * pw + geo.pad_left) * vl;
            let len = geo.in_w * vl;
            d[row..row + len].copy_from_slice(&s[h * len..(h + 1) * len]);
        }
        c0 += vl;
    }
}

/// Allocate and fill a padded copy; packed when `packn > 1`.
pub fn padded<T: Copy>(
    src: &[T],
    channels: usize,
    geo: &ConvGeometry,
    packn: usize,
    value: T,
) -> Result<Vec<T>> {
    let mut dst = scratch::alloc_filled(channels * geo.padded_h() * geo.padded_w(), value)?;
    if packn > 1 {
        pad_input_packn(src, &mut dst, channels, geo, packn, value);
    } else {
        pad_input(src, &mut dst, channels, geo, value);
    }
    Ok(dst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::{pack1ton, packnto1};

    fn geo(pad: usize) -> ConvGeometry {
        ConvGeometry {
            in_h: 2,
            in_w: 2,
            pad_top: pad,
            pad_left: pad,
            pad_down: pad,
            pad_right: pad,
            ..Default::default()
        }
    }

    #[test]
    fn test_zero_point_border() {
        let g = geo(1);
        let out = padded(&[1i8, 2, 3, 4], 1, &g, 1, -5).unwrap();
        assert_eq!(
            out,
            vec![-5, -5, -5, -5, -5, 1, 2, -5, -5, 3, 4, -5, -5, -5, -5, -5]
        );
    }

    #[test]
    fn test_packed_padding_matches_canonical() {
        let g = geo(1);
        let channels = 5;
        let src: Vec<f32> = (0..channels * 4).map(|v| v as f32).collect();
        let canonical = padded(&src, channels, &g, 1, 0.0).unwrap();

        let mut src_packed = vec![0.0; src.len()];
        pack1ton(&src, &mut src_packed, channels, 4, 4);
        let packed = padded(&src_packed, channels, &g, 4, 0.0).unwrap();
        let mut back = vec![0.0; packed.len()];
        packnto1(&packed, &mut back, channels, 16, 4);
        assert_eq!(back, canonical);
    }
}
