//! Int4 operands: widened to int8 before the reduction, narrowed and
//! nibble-packed after requantization.
//!
//! Widening first means every tail shape (odd K, partial column tiles)
//! runs through the same int8 tile hierarchy as full tiles.

use pk_tensor::scratch;
use pk_tensor::storage::{pack_nibbles, unpack_nibbles};
use pk_tensor::Result;

use super::int8::Int8Path;

/// Sign-extend `len` packed nibbles into one `i8` per value.
pub fn widen(bytes: &[u8], len: usize) -> Result<Vec<i8>> {
    let mut out = scratch::alloc(len)?;
    unpack_nibbles(bytes, &mut out);
    Ok(out)
}

/// Pack int4-range values two per byte.
pub fn narrow(values: &[i8]) -> Result<Vec<u8>> {
    let mut out = scratch::alloc((values.len() + 1) / 2)?;
    pack_nibbles(values, &mut out);
    Ok(out)
}

/// Raw int4 × int4 GEMM on row-major nibble-packed operands.
pub fn gemm(
    c: &mut [i32],
    a: &[u8],
    b: &[u8],
    m: usize,
    k: usize,
    n: usize,
    packn: usize,
    path: Int8Path,
) -> Result<()> {
    let a = widen(a, m * k)?;
    let b = widen(b, k * n)?;
    let kk = path.reduction_len(k);
    let mut sa = scratch::alloc(m * kk)?;
    let mut sb = scratch::alloc(n * kk)?;
    path.reorder_a_with(&mut sa, m, k, |r, p| a[r * k + p]);
    path.reorder_b_with(&mut sb, k, n, packn, |p, j| b[p * n + j]);
    path.gemm(c, &sa, &sb, m, k, n, packn);
    Ok(())
}
