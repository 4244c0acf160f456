//! Int8 GEMM with int32 accumulation.
//!
//! Two reduction paths share the row/column tile hierarchy:
//!
//! - [`Int8Path::Widening`]: each lane is widened and multiplied one k step
//!   at a time (the generic micro-kernel with `E = i8`).
//! - [`Int8Path::DotProduct`]: four consecutive k values are reduced per
//!   step. Operands are reordered as `[K/4, tile, 4]` with the reduction
//!   length rounded up to a multiple of four; the padding is zero in both
//!   operands so it contributes nothing.
//!
//! Accumulators start at zero. Bias and requantization are applied by
//! [`requantize_rows`] once the whole K reduction is done.

use crate::profile::VectorProfile;
use crate::quant::{requantize_i4, requantize_i8, ChannelRequant};

use super::kernel::MAX_NR;
use super::tiling::{col_tile, row_tile, TilingParams};

/// k values consumed by one dot-product step.
pub const DOT_LANES: usize = 4;

/// Reduction length of a dot-product operand, rounded up to [`DOT_LANES`].
#[inline]
pub fn dot_k(k: usize) -> usize {
    (k + DOT_LANES - 1) / DOT_LANES * DOT_LANES
}

/// Which int8 reduction a kernel uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Int8Path {
    Widening,
    DotProduct,
}

impl Int8Path {
    pub fn for_profile(profile: &VectorProfile) -> Self {
        if profile.has_dot_product() {
            Int8Path::DotProduct
        } else {
            Int8Path::Widening
        }
    }

    /// Reduction length stored per row/column of a reordered operand.
    pub fn reduction_len(&self, k: usize) -> usize {
        match self {
            Int8Path::Widening => k,
            Int8Path::DotProduct => dot_k(k),
        }
    }

    /// Reorder `A[M,K]` given by `at(row, k)`; `dst` holds
    /// `m * reduction_len(k)` values.
    pub fn reorder_a_with(&self, dst: &mut [i8], m: usize, k: usize, at: impl Fn(usize, usize) -> i8) {
        match self {
            Int8Path::Widening => super::reorder_a_with(dst, m, k, &TilingParams::unblocked(), at),
            Int8Path::DotProduct => reorder_a_dot_with(dst, m, k, at),
        }
    }

    /// Reorder `B[K,N]` given by `at(k, col)`; `dst` holds
    /// `n * reduction_len(k)` values.
    pub fn reorder_b_with(
        &self,
        dst: &mut [i8],
        k: usize,
        n: usize,
        packn: usize,
        at: impl Fn(usize, usize) -> i8,
    ) {
        match self {
            Int8Path::Widening => {
                super::reorder_b_with(dst, k, n, packn, &TilingParams::unblocked(), at)
            }
            Int8Path::DotProduct => reorder_b_dot_with(dst, k, n, packn, at),
        }
    }

    /// Raw `Σ a·b` into row-major `c[m, n]`.
    pub fn gemm(&self, c: &mut [i32], sa: &[i8], sb: &[i8], m: usize, k: usize, n: usize, packn: usize) {
        match self {
            Int8Path::Widening => super::gemm::<i8>(c, sa, sb, None, m, k, n, packn),
            Int8Path::DotProduct => gemm_dot(c, sa, sb, m, k, n, packn),
        }
    }
}

fn reorder_a_dot_with(dst: &mut [i8], m: usize, k: usize, at: impl Fn(usize, usize) -> i8) {
    let k4 = dot_k(k);
    let mut r = 0;
    while r < m {
        let t = row_tile(m - r);
        let tile = &mut dst[r * k4..(r + t) * k4];
        for q in 0..k4 / DOT_LANES {
            for i in 0..t {
                for l in 0..DOT_LANES {
                    let p = q * DOT_LANES + l;
                    tile[(q * t + i) * DOT_LANES + l] = if p < k { at(r + i, p) } else { 0 };
                }
            }
        }
        r += t;
    }
}

fn reorder_b_dot_with(dst: &mut [i8], k: usize, n: usize, packn: usize, at: impl Fn(usize, usize) -> i8) {
    let k4 = dot_k(k);
    let mut c = 0;
    while c < n {
        let w = col_tile(n - c, packn);
        let tile = &mut dst[c * k4..(c + w) * k4];
        for q in 0..k4 / DOT_LANES {
            for j in 0..w {
                for l in 0..DOT_LANES {
                    let p = q * DOT_LANES + l;
                    tile[(q * w + j) * DOT_LANES + l] = if p < k { at(p, c + j) } else { 0 };
                }
            }
        }
        c += w;
    }
}

#[inline(always)]
fn dot4(a: &[i8], b: &[i8]) -> i32 {
    a.iter().zip(b).map(|(&x, &y)| x as i32 * y as i32).sum()
}

#[inline(always)]
fn microkernel_dot<const MR: usize>(a: &[i8], b: &[i8], k4: usize, nr: usize, c: &mut [i32], ldc: usize) {
    let mut acc = [[0i32; MAX_NR]; MR];
    let steps = k4 / DOT_LANES;
    for q in 0..steps {
        let ap = &a[q * MR * DOT_LANES..(q + 1) * MR * DOT_LANES];
        let bp = &b[q * nr * DOT_LANES..(q + 1) * nr * DOT_LANES];
        for (row, a4) in acc.iter_mut().zip(ap.chunks_exact(DOT_LANES)) {
            for (v, b4) in row[..nr].iter_mut().zip(bp.chunks_exact(DOT_LANES)) {
                *v += dot4(a4, b4);
            }
        }
    }
    for (i, row) in acc.iter().enumerate() {
        c[i * ldc..i * ldc + nr].copy_from_slice(&row[..nr]);
    }
}

fn gemm_dot(c: &mut [i32], sa: &[i8], sb: &[i8], m: usize, k: usize, n: usize, packn: usize) {
    let k4 = dot_k(k);
    let mut r = 0;
    while r < m {
        let t = row_tile(m - r);
        let a_tile = &sa[r * k4..(r + t) * k4];
        let mut col = 0;
        while col < n {
            let w = col_tile(n - col, packn);
            let b_tile = &sb[col * k4..(col + w) * k4];
            let c_tile = &mut c[r * n + col..];
            match t {
                12 => microkernel_dot::<12>(a_tile, b_tile, k4, w, c_tile, n),
                8 => microkernel_dot::<8>(a_tile, b_tile, k4, w, c_tile, n),
                4 => microkernel_dot::<4>(a_tile, b_tile, k4, w, c_tile, n),
                2 => microkernel_dot::<2>(a_tile, b_tile, k4, w, c_tile, n),
                _ => microkernel_dot::<1>(a_tile, b_tile, k4, w, c_tile, n),
            }
            col += w;
        }
        r += t;
    }
}

/// Add a per-row bias, requantize with the row's output-channel parameters
/// and narrow to int8.
///
/// Row `r` belongs to output channel `channel_offset + r`, so grouped
/// callers pass the first channel of their group.
pub fn requantize_rows(
    acc: &[i32],
    dst: &mut [i8],
    cols: usize,
    bias: Option<&[i32]>,
    requant: &ChannelRequant,
    channel_offset: usize,
    out_zp: i32,
) {
    for (r, (src, out)) in acc.chunks_exact(cols).zip(dst.chunks_exact_mut(cols)).enumerate() {
        let b = bias.map_or(0, |b| b[r]);
        let (mult, shift) = requant.get(channel_offset + r);
        for (o, &v) in out.iter_mut().zip(src) {
            *o = requantize_i8(v + b, mult, shift, out_zp);
        }
    }
}

/// Like [`requantize_rows`], narrowing to the int4 range instead. Values
/// stay one per byte; callers pack nibbles afterwards.
pub fn requantize_rows_i4(
    acc: &[i32],
    dst: &mut [i8],
    cols: usize,
    bias: Option<&[i32]>,
    requant: &ChannelRequant,
    channel_offset: usize,
    out_zp: i32,
) {
    for (r, (src, out)) in acc.chunks_exact(cols).zip(dst.chunks_exact_mut(cols)).enumerate() {
        let b = bias.map_or(0, |b| b[r]);
        let (mult, shift) = requant.get(channel_offset + r);
        for (o, &v) in out.iter_mut().zip(src) {
            *o = requantize_i4(v + b, mult, shift, out_zp);
        }
    }
}
