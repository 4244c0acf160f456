//! GEMM right operands of one convolution group.

use pk_kernels::im2col::{im2col, im2col_packn, packed_col_offset, packed_k_split, ConvGeometry};
use pk_kernels::pack::packed_offset;
use pk_kernels::pad::padded;
use pk_tensor::{scratch, Result};

use super::capability::ColumnMode;

/// `B[K, N]` with `K = channels * kh * kw` and `N = out_h * out_w`.
pub(crate) enum Columns<'a, T> {
    Direct {
        src: &'a [T],
        channels: usize,
        inner: usize,
        packn: usize,
    },
    Scalar {
        cols: Vec<T>,
        out_size: usize,
    },
    Packed {
        cols: Vec<T>,
        channels: usize,
        maxk: usize,
        out_size: usize,
        packn: usize,
    },
}

impl<'a, T: Copy + Default> Columns<'a, T> {
    /// Lower one group's input planes; `pad` fills the border.
    pub(crate) fn build(
        mode: ColumnMode,
        src: &'a [T],
        channels: usize,
        geo: &ConvGeometry,
        pad: T,
    ) -> Result<Self> {
        let maxk = geo.maxk();
        let out_size = geo.out_size();
        Ok(match mode {
            ColumnMode::Direct { packn } => Columns::Direct {
                src,
                channels,
                inner: geo.in_size(),
                packn,
            },
            ColumnMode::Scalar => {
                let padded = padded(src, channels, geo, 1, pad)?;
                let mut cols = scratch::alloc(channels * maxk * out_size)?;
                im2col(&padded, &mut cols, channels, geo);
                Columns::Scalar { cols, out_size }
            }
            ColumnMode::Packed { packn } => {
                let padded = padded(src, channels, geo, packn, pad)?;
                let mut cols = scratch::alloc(channels * maxk * out_size)?;
                im2col_packn(&padded, &mut cols, channels, geo, packn);
                Columns::Packed {
                    cols,
                    channels,
                    maxk,
                    out_size,
                    packn,
                }
            }
        })
    }

    #[inline]
    pub(crate) fn at(&self, kidx: usize, n: usize) -> T {
        match self {
            Columns::Direct {
                src,
                channels,
                inner,
                packn,
            } => src[packed_offset(kidx, n, *channels, *inner, *packn)],
            Columns::Scalar { cols, out_size } => cols[kidx * out_size + n],
            Columns::Packed {
                cols,
                channels,
                maxk,
                out_size,
                packn,
            } => cols[packed_col_offset(kidx, n, *channels, *maxk, *out_size, *packn)],
        }
    }

    /// `Σ_k B[k][n]` per column, for zero-point compensation.
    pub(crate) fn col_sums(&self, k: usize, n: usize) -> Vec<i32>
    where
        T: Into<i32>,
    {
        (0..n)
            .map(|j| (0..k).map(|p| self.at(p, j).into()).sum())
            .collect()
    }
}

/// Input channel and kernel position of reduction index `kidx`; weights
/// are read in the same order the columns are produced.
#[inline]
pub(crate) fn k_split(mode: ColumnMode, kidx: usize, channels: usize, maxk: usize) -> (usize, usize) {
    match mode {
        ColumnMode::Direct { .. } => (kidx, 0),
        ColumnMode::Scalar => (kidx / maxk, kidx % maxk),
        ColumnMode::Packed { packn } => packed_k_split(kidx, channels, maxk, packn),
    }
}
