use super::kernel::{run_block, GemmElement, Seed};
use super::tiling::{BlockIterator, TilingParams, MIN_M_BLK};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Single-block GEMM on operands from [`super::reorder_a`] and
/// [`super::reorder_b`]. `c` is row-major `[m, n]`; `bias` is per row.
///
/// Integer element types are usually called with `bias = None` and get
/// their bias added alongside requantization.
pub fn gemm<E: GemmElement>(
    c: &mut [E::Out],
    sa: &[E],
    sb: &[E],
    bias: Option<&[E::Out]>,
    m: usize,
    k: usize,
    n: usize,
    packn: usize,
) {
    gemm_blocked(c, sa, sb, bias, m, k, n, packn, &TilingParams::unblocked());
}

/// Run all n and k blocks of one m block into its output rows.
fn m_block<E: GemmElement>(
    c_rows: &mut [E::Out],
    sa: &[E],
    sb: &[E],
    bias: Option<&[E::Out]>,
    m_idx: usize,
    mb: usize,
    k: usize,
    n: usize,
    packn: usize,
    tiling: &TilingParams,
) {
    let a_region = &sa[m_idx * k..(m_idx + mb) * k];
    for (n_idx, nb) in BlockIterator::halving(n, tiling.n_blk, 2 * packn) {
        let b_region = &sb[n_idx * k..(n_idx + nb) * k];
        for (k_idx, kb) in BlockIterator::clipped(k, tiling.k_blk) {
            let a_blk = &a_region[k_idx * mb..k_idx * mb + mb * kb];
            let b_blk = &b_region[k_idx * nb..k_idx * nb + nb * kb];
            let seed = if k_idx == 0 {
                Seed::Bias(bias.map(|b| &b[m_idx..m_idx + mb]))
            } else {
                Seed::Accumulate
            };
            run_block::<E>(a_blk, b_blk, mb, kb, nb, packn, &mut c_rows[n_idx..], n, seed);
        }
    }
}

/// Cache-blocked GEMM on operands from [`super::reorder_a_blocked`] and
/// [`super::reorder_b_blocked`] built with the same `tiling`.
///
/// The first k block seeds the accumulators with the bias; every later k
/// block loads the partial sums back from `c`, accumulates and stores.
pub fn gemm_blocked<E: GemmElement>(
    c: &mut [E::Out],
    sa: &[E],
    sb: &[E],
    bias: Option<&[E::Out]>,
    m: usize,
    k: usize,
    n: usize,
    packn: usize,
    tiling: &TilingParams,
) {
    if m == 0 || n == 0 {
        return;
    }
    if k == 0 {
        for (r, row) in c.chunks_exact_mut(n).take(m).enumerate() {
            row.fill(bias.map_or(E::Out::default(), |b| b[r]));
        }
        return;
    }

    // Split the output into disjoint row ranges, one per m block.
    let mut rows: Vec<(usize, usize, &mut [E::Out])> = Vec::new();
    let mut rest = &mut c[..m * n];
    for (m_idx, mb) in BlockIterator::halving(m, tiling.m_blk, MIN_M_BLK) {
        let (head, tail) = std::mem::take(&mut rest).split_at_mut(mb * n);
        rows.push((m_idx, mb, head));
        rest = tail;
    }

    #[cfg(feature = "parallel")]
    if tiling.parallel && rows.len() > 1 {
        rows.into_par_iter().for_each(|(m_idx, mb, c_rows)| {
            m_block(c_rows, sa, sb, bias, m_idx, mb, k, n, packn, tiling)
        });
        return;
    }

    for (m_idx, mb, c_rows) in rows {
        m_block(c_rows, sa, sb, bias, m_idx, mb, k, n, packn, tiling);
    }
}
