use half::f16;

use super::tiling::{col_tile, row_tile};

/// Widest column tile: two registers of the narrowest lane type at the
/// largest supported vector length.
pub const MAX_NR: usize = 128;

/// Element type of a GEMM operand and the accumulator it widens into.
pub trait GemmElement: Copy + Default + Send + Sync + 'static {
    /// Register accumulator type.
    type Acc: Copy + Default + Send + Sync + 'static;
    /// Type stored in the output matrix.
    type Out: Copy + Default + Send + Sync + 'static;

    fn fma(acc: Self::Acc, a: Self, b: Self) -> Self::Acc;
    fn load(out: Self::Out) -> Self::Acc;
    fn store(acc: Self::Acc) -> Self::Out;
}

impl GemmElement for f32 {
    type Acc = f32;
    type Out = f32;

    #[inline(always)]
    fn fma(acc: f32, a: f32, b: f32) -> f32 {
        a.mul_add(b, acc)
    }

    #[inline(always)]
    fn load(out: f32) -> f32 {
        out
    }

    #[inline(always)]
    fn store(acc: f32) -> f32 {
        acc
    }
}

impl GemmElement for f16 {
    type Acc = f32;
    type Out = f16;

    #[inline(always)]
    fn fma(acc: f32, a: f16, b: f16) -> f32 {
        a.to_f32().mul_add(b.to_f32(), acc)
    }

    #[inline(always)]
    fn load(out: f16) -> f32 {
        out.to_f32()
    }

    #[inline(always)]
    fn store(acc: f32) -> f16 {
        f16::from_f32(acc)
    }
}

impl GemmElement for i8 {
    type Acc = i32;
    type Out = i32;

    #[inline(always)]
    fn fma(acc: i32, a: i8, b: i8) -> i32 {
        acc + a as i32 * b as i32
    }

    #[inline(always)]
    fn load(out: i32) -> i32 {
        out
    }

    #[inline(always)]
    fn store(acc: i32) -> i32 {
        acc
    }
}

/// How a tile's accumulators start out.
#[derive(Clone, Copy)]
pub(crate) enum Seed<'a, O> {
    /// First k block: per-row bias, or zero.
    Bias(Option<&'a [O]>),
    /// Later k blocks: continue from the partial sums already in C.
    Accumulate,
}

/// `MR × nr` tile over `kc` reduction steps.
///
/// `a` is `[kc, MR]`, `b` is `[kc, nr]`, `c` is addressed with row stride
/// `ldc`.
#[inline(always)]
fn microkernel<E: GemmElement, const MR: usize>(
    a: &[E],
    b: &[E],
    kc: usize,
    nr: usize,
    c: &mut [E::Out],
    ldc: usize,
    seed: Seed<'_, E::Out>,
) {
    let mut acc = [[E::Acc::default(); MAX_NR]; MR];
    match seed {
        Seed::Bias(Some(bias)) => {
            for (i, row) in acc.iter_mut().enumerate() {
                row[..nr].fill(E::load(bias[i]));
            }
        }
        Seed::Bias(None) => {}
        Seed::Accumulate => {
            for (i, row) in acc.iter_mut().enumerate() {
                for (j, v) in row[..nr].iter_mut().enumerate() {
                    *v = E::load(c[i * ldc + j]);
                }
            }
        }
    }

    for (ap, bp) in a.chunks_exact(MR).zip(b.chunks_exact(nr)).take(kc) {
        for (row, &av) in acc.iter_mut().zip(ap) {
            for (v, &bv) in row[..nr].iter_mut().zip(bp) {
                *v = E::fma(*v, av, bv);
            }
        }
    }

    for (i, row) in acc.iter().enumerate() {
        for (j, &v) in row[..nr].iter().enumerate() {
            c[i * ldc + j] = E::store(v);
        }
    }
}

/// Run every tile of one `(mb × kb) · (kb × nb)` block.
///
/// `a` and `b` hold the block's reordered tiles; `c` starts at the block's
/// top-left output element.
pub(crate) fn run_block<E: GemmElement>(
    a: &[E],
    b: &[E],
    mb: usize,
    kb: usize,
    nb: usize,
    packn: usize,
    c: &mut [E::Out],
    ldc: usize,
    seed: Seed<'_, E::Out>,
) {
    if kb == 0 {
        return;
    }
    let mut r = 0;
    while r < mb {
        let t = row_tile(mb - r);
        let a_tile = &a[r * kb..(r + t) * kb];
        let row_seed = match seed {
            Seed::Bias(bias) => Seed::Bias(bias.map(|b| &b[r..r + t])),
            Seed::Accumulate => Seed::Accumulate,
        };
        let mut col = 0;
        while col < nb {
            let w = col_tile(nb - col, packn);
            let b_tile = &b[col * kb..(col + w) * kb];
            let c_tile = &mut c[r * ldc + col..];
            match t {
                12 => microkernel::<E, 12>(a_tile, b_tile, kb, w, c_tile, ldc, row_seed),
                8 => microkernel::<E, 8>(a_tile, b_tile, kb, w, c_tile, ldc, row_seed),
                4 => microkernel::<E, 4>(a_tile, b_tile, kb, w, c_tile, ldc, row_seed),
                2 => microkernel::<E, 2>(a_tile, b_tile, kb, w, c_tile, ldc, row_seed),
                _ => microkernel::<E, 1>(a_tile, b_tile, kb, w, c_tile, ldc, row_seed),
            }
            col += w;
        }
        r += t;
    }
}
