//! Mixed-precision and zero-point-compensated GEMM.
//!
//! Two strategies, chosen by which operand is constant at init time:
//!
//! - float activations with int8 weights: the weights are dequantized into
//!   the float domain once ([`dequantize_rows`]) and the float kernels run
//!   unchanged;
//! - int8 × int8 with non-zero zero points: the raw `Σwx` is computed by
//!   the int8 kernels and corrected with
//!   `Σ(w-zw)(x-zx) = Σwx - zw·Σx - zx·Σw + zw·zx·K`, where the
//!   weight-only terms are folded into the bias up front
//!   ([`QuantizedLhs`]).

use pk_tensor::scratch;
use pk_tensor::{QuantInfo, Result, TensorError};

use crate::quant::{apply_weight_zero_point, dequantize, fold_zero_points, row_sums};

use super::int8::Int8Path;

/// Dequantize a row-major `[rows, k]` int8 matrix, one quant entry per row
/// (or one shared entry).
pub fn dequantize_rows(src: &[i8], rows: usize, k: usize, qinfo: &[QuantInfo]) -> Result<Vec<f32>> {
    if qinfo.len() > 1 && qinfo.len() != rows {
        return Err(TensorError::LengthMismatch {
            expected: rows,
            got: qinfo.len(),
        });
    }
    let mut out = scratch::alloc(rows * k)?;
    for r in 0..rows {
        let q = match qinfo {
            [] => QuantInfo::default(),
            [one] => *one,
            per_row => per_row[r],
        };
        for (o, &v) in out[r * k..(r + 1) * k].iter_mut().zip(&src[r * k..(r + 1) * k]) {
            *o = dequantize(v as i32, q.zero_point, q.scale);
        }
    }
    Ok(out)
}

/// Constant int8 left operand, reordered once, with its row sums kept for
/// zero-point folding.
#[derive(Debug, Clone)]
pub struct QuantizedLhs {
    pub data: Vec<i8>,
    pub row_sums: Vec<i32>,
    pub zero_points: Vec<i32>,
    pub m: usize,
    pub k: usize,
    pub path: Int8Path,
}

impl QuantizedLhs {
    /// Reorder a row-major `[m, k]` matrix for `path`.
    pub fn prepare(src: &[i8], m: usize, k: usize, zero_points: Vec<i32>, path: Int8Path) -> Result<Self> {
        let mut data = scratch::alloc(m * path.reduction_len(k))?;
        path.reorder_a_with(&mut data, m, k, |r, p| src[r * k + p]);
        Ok(QuantizedLhs {
            data,
            row_sums: row_sums(src, m, k),
            zero_points,
            m,
            k,
            path,
        })
    }

    /// Bias with the activation zero point folded in.
    pub fn folded_bias(&self, bias: Option<&[i32]>, x_zp: i32) -> Vec<i32> {
        fold_zero_points(bias, &self.row_sums, &self.zero_points, x_zp, self.k)
    }

    /// `c[m, n] = folded_bias + Σ(w-zw)(x-zx)` for an already reordered
    /// right operand whose column sums are `x_col_sums`.
    pub fn gemm(
        &self,
        c: &mut [i32],
        sb: &[i8],
        n: usize,
        packn: usize,
        folded_bias: &[i32],
        x_col_sums: &[i32],
    ) {
        self.path.gemm(c, &self.data, sb, self.m, self.k, n, packn);
        for (row, &b) in c.chunks_exact_mut(n).zip(folded_bias) {
            for v in row.iter_mut() {
                *v += b;
            }
        }
        apply_weight_zero_point(c, n, &self.zero_points, x_col_sums);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gemm::{gemm, reorder_a, reorder_b};
    use crate::quant::col_sums;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_dequantize_rows_rejects_short_quant_list() {
        let w = [1i8; 12];
        let q = [QuantInfo::new(0.5, 0); 2];
        assert!(matches!(
            dequantize_rows(&w, 3, 4, &q),
            Err(TensorError::LengthMismatch { expected: 3, got: 2 })
        ));
        assert_eq!(dequantize_rows(&w, 3, 4, &q[..1]).unwrap(), vec![0.5; 12]);
    }

    #[test]
    fn test_dequantized_weights_drive_float_kernel() {
        let (m, k, n) = (5, 6, 9);
        let w: Vec<i8> = (0..m * k).map(|i| (i % 9) as i8 - 4).collect();
        let q = [QuantInfo::new(0.5, 1)];
        let x: Vec<f32> = (0..k * n).map(|i| i as f32 * 0.1).collect();

        let wf = dequantize_rows(&w, m, k, &q).unwrap();
        let mut sa = vec![0.0; m * k];
        let mut sb = vec![0.0; k * n];
        reorder_a(&wf, &mut sa, m, k, k);
        reorder_b(&x, &mut sb, k, n, n, 4);
        let mut c = vec![0.0; m * n];
        gemm(&mut c, &sa, &sb, None, m, k, n, 4);

        for i in 0..m {
            for j in 0..n {
                let e: f32 = (0..k)
                    .map(|p| (w[i * k + p] as f32 - 1.0) * 0.5 * x[p * n + j])
                    .sum();
                assert_abs_diff_eq!(c[i * n + j], e, epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn test_zero_point_compensation() {
        let (m, k, n) = (4, 7, 10);
        let w: Vec<i8> = (0..m * k).map(|i| (i * 7 % 19) as i8 - 9).collect();
        let x: Vec<i8> = (0..k * n).map(|i| (i * 5 % 23) as i8 - 11).collect();
        let w_zp = vec![2, -1, 0, 3];
        let x_zp = -4;
        let bias = vec![100, -50, 0, 7];

        for path in [Int8Path::Widening, Int8Path::DotProduct] {
            let lhs = QuantizedLhs::prepare(&w, m, k, w_zp.clone(), path).unwrap();
            let mut sb = vec![0i8; n * path.reduction_len(k)];
            path.reorder_b_with(&mut sb, k, n, 8, |p, j| x[p * n + j]);
            let folded = lhs.folded_bias(Some(&bias), x_zp);
            let mut c = vec![0; m * n];
            lhs.gemm(&mut c, &sb, n, 8, &folded, &col_sums(&x, k, n));

            for i in 0..m {
                for j in 0..n {
                    let e: i32 = bias[i]
                        + (0..k)
                            .map(|p| (w[i * k + p] as i32 - w_zp[i]) * (x[p * n + j] as i32 - x_zp))
                            .sum::<i32>();
                    assert_eq!(c[i * n + j], e);
                }
            }
        }
    }
}
