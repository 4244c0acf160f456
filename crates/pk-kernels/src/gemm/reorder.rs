use super::tiling::{col_tile, row_tile, BlockIterator, TilingParams, MIN_M_BLK};

/// Pack rows `[m_idx, m_idx + mb)` × reduction `[k_idx, k_idx + kb)` into
/// row tiles of `[kb, tile]`.
fn pack_a_block<T: Copy>(
    dst: &mut [T],
    m_idx: usize,
    mb: usize,
    k_idx: usize,
    kb: usize,
    at: &impl Fn(usize, usize) -> T,
) {
    let mut r = 0;
    while r < mb {
        let t = row_tile(mb - r);
        let tile = &mut dst[r * kb..(r + t) * kb];
        for p in 0..kb {
            for i in 0..t {
                tile[p * t + i] = at(m_idx + r + i, k_idx + p);
            }
        }
        r += t;
    }
}

/// Pack columns `[n_idx, n_idx + nb)` × reduction `[k_idx, k_idx + kb)`
/// into column tiles of `[kb, tile]`.
fn pack_b_block<T: Copy>(
    dst: &mut [T],
    n_idx: usize,
    nb: usize,
    k_idx: usize,
    kb: usize,
    packn: usize,
    at: &impl Fn(usize, usize) -> T,
) {
    let mut c = 0;
    while c < nb {
        let w = col_tile(nb - c, packn);
        let tile = &mut dst[c * kb..(c + w) * kb];
        for p in 0..kb {
            for j in 0..w {
                tile[p * w + j] = at(k_idx + p, n_idx + c + j);
            }
        }
        c += w;
    }
}

/// Reorder `A[M,K]` given by an accessor `at(row, k)`, blocked per
/// `tiling`. `dst` must hold `m * k` elements.
pub fn reorder_a_with<T: Copy>(
    dst: &mut [T],
    m: usize,
    k: usize,
    tiling: &TilingParams,
    at: impl Fn(usize, usize) -> T,
) {
    for (m_idx, mb) in BlockIterator::halving(m, tiling.m_blk, MIN_M_BLK) {
        for (k_idx, kb) in BlockIterator::clipped(k, tiling.k_blk) {
            let base = m_idx * k + k_idx * mb;
            pack_a_block(&mut dst[base..base + mb * kb], m_idx, mb, k_idx, kb, &at);
        }
    }
}

/// Reorder `B[K,N]` given by an accessor `at(k, col)`, blocked per
/// `tiling`. `dst` must hold `k * n` elements.
pub fn reorder_b_with<T: Copy>(
    dst: &mut [T],
    k: usize,
    n: usize,
    packn: usize,
    tiling: &TilingParams,
    at: impl Fn(usize, usize) -> T,
) {
    for (n_idx, nb) in BlockIterator::halving(n, tiling.n_blk, 2 * packn) {
        for (k_idx, kb) in BlockIterator::clipped(k, tiling.k_blk) {
            let base = n_idx * k + k_idx * nb;
            pack_b_block(&mut dst[base..base + nb * kb], n_idx, nb, k_idx, kb, packn, &at);
        }
    }
}

/// `A[M,K]` (row stride `lda`) to `[M/tile, K, tile]`.
pub fn reorder_a<T: Copy>(src: &[T], dst: &mut [T], m: usize, k: usize, lda: usize) {
    reorder_a_with(dst, m, k, &TilingParams::unblocked(), |r, p| src[r * lda + p]);
}

/// `B[K,N]` (row stride `ldb`) to `[N/tile, K, tile]`.
pub fn reorder_b<T: Copy>(src: &[T], dst: &mut [T], k: usize, n: usize, ldb: usize, packn: usize) {
    reorder_b_with(dst, k, n, packn, &TilingParams::unblocked(), |p, j| {
        src[p * ldb + j]
    });
}

/// Blocked form of [`reorder_a`], matching [`super::gemm_blocked`].
pub fn reorder_a_blocked<T: Copy>(
    src: &[T],
    dst: &mut [T],
    m: usize,
    k: usize,
    lda: usize,
    tiling: &TilingParams,
) {
    reorder_a_with(dst, m, k, tiling, |r, p| src[r * lda + p]);
}

/// Blocked form of [`reorder_b`], matching [`super::gemm_blocked`].
pub fn reorder_b_blocked<T: Copy>(
    src: &[T],
    dst: &mut [T],
    k: usize,
    n: usize,
    ldb: usize,
    packn: usize,
    tiling: &TilingParams,
) {
    reorder_b_with(dst, k, n, packn, tiling, |p, j| src[p * ldb + j]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reorder_a_tiles() {
        // M=3 splits into tiles of 2 and 1
        let src: Vec<i32> = (0..6).collect(); // [3, 2]
        let mut dst = vec![0; 6];
        reorder_a(&src, &mut dst, 3, 2, 2);
        assert_eq!(dst, vec![0, 2, 1, 3, 4, 5]);
    }

    #[test]
    fn test_reorder_b_tiles() {
        // K=2, N=5, packn=2: tiles of 4 then 1
        let src: Vec<i32> = (0..10).collect();
        let mut dst = vec![0; 10];
        reorder_b(&src, &mut dst, 2, 5, 5, 2);
        assert_eq!(dst, vec![0, 1, 2, 3, 5, 6, 7, 8, 4, 9]);
    }

    #[test]
    fn test_reorder_is_permutation() {
        let (m, k) = (29, 70);
        let src: Vec<u32> = (0..(m * k) as u32).collect();
        let mut dst = vec![0u32; m * k];
        reorder_a_blocked(&src, &mut dst, m, k, k, &TilingParams::new(16, 32, 16));
        let mut sorted = dst.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, src);
    }
}
