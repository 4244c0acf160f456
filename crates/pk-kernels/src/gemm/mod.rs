//! Blocked GEMM micro-kernel family.
//!
//! Computes `C[M,N] = A[M,K] · B[K,N] (+ bias)` on operands that were
//! reordered ahead of time so the innermost loop streams contiguous
//! register-width chunks.
//!
//! # Blocking
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │ for m block (M_BLK, halved at the edge, min 12)                  │
//! │   for n block (N_BLK, halved at the edge, min 2*packn)           │
//! │     for k block (K_BLK, clipped at the edge)                     │
//! │       for row tile  (12 → 8 → 4 → 2 → 1)                         │
//! │         for col tile (2*packn → packn → tail)                    │
//! │           k_idx == 0 : acc = bias          (or zero)             │
//! │           k_idx  > 0 : acc = C             (load)                │
//! │           acc += Ã[tile] · B̃[tile]         (FMA over the block)  │
//! │           C = acc                          (store)               │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Reordered operands
//!
//! - [`reorder_a`]: each row tile becomes `[K, tile]`, tiles back to back.
//! - [`reorder_b`]: each column tile becomes `[K, tile]`, tiles back to back.
//!
//! With blocking, the region of m block `m_idx` starts at `m_idx * K` and
//! its k block `k_idx` at `k_idx * m_block` inside it (likewise for B).
//!
//! # Element types
//!
//! [`GemmElement`] fixes the accumulator: f32 for f32 and f16, i32 for int8.
//! Integer products are requantized once per output after the full K
//! reduction (see [`int8`]).

mod blocked;
pub mod int4;
pub mod int8;
mod kernel;
pub mod mixed;
mod reorder;
mod tiling;

pub use blocked::{gemm, gemm_blocked};
pub use kernel::{GemmElement, MAX_NR};
pub use reorder::{
    reorder_a, reorder_a_blocked, reorder_a_with, reorder_b, reorder_b_blocked, reorder_b_with,
};
pub use tiling::{col_tile, row_tile, BlockIterator, TilingParams, MIN_M_BLK, ROW_TILES};

/// Straightforward triple loop, used as the correctness oracle in tests.
#[cfg(test)]
pub(crate) fn naive_f32(a: &[f32], b: &[f32], bias: Option<&[f32]>, m: usize, k: usize, n: usize) -> Vec<f32> {
    let mut c = vec![0.0f32; m * n];
    for i in 0..m {
        for j in 0..n {
            let mut sum = bias.map_or(0.0, |b| b[i]);
            for p in 0..k {
                sum += a[i * k + p] * b[p * n + j];
            }
            c[i * n + j] = sum;
        }
    }
    c
}
