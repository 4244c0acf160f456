//! Fully connected and batched matmul in the f32 domain.

/// `[batch, k] · [o, k]^T + bias` into `[batch, o]`.
pub(crate) fn fully_connected(
    x: &[f32],
    weights: &[f32],
    bias: Option<&[f32]>,
    batch: usize,
    k: usize,
    o: usize,
) -> Vec<f32> {
    let mut out = vec![0.0f32; batch * o];
    for b in 0..batch {
        let row = &x[b * k..(b + 1) * k];
        for j in 0..o {
            let w = &weights[j * k..(j + 1) * k];
            let dot: f32 = row.iter().zip(w).map(|(a, b)| a * b).sum();
            out[b * o + j] = dot + bias.map_or(0.0, |bias| bias[j]);
        }
    }
    out
}

/// Shape of a batched matmul after transposes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MatMulDims {
    pub batch: usize,
    /// B shared by every batch item.
    pub broadcast_b: bool,
    pub m: usize,
    pub k: usize,
    pub n: usize,
    pub trans_a: bool,
    pub trans_b: bool,
}

pub(crate) fn matmul(a: &[f32], b: &[f32], d: &MatMulDims) -> Vec<f32> {
    let MatMulDims { m, k, n, .. } = *d;
    let mut out = vec![0.0f32; d.batch * m * n];
    for bi in 0..d.batch {
        let a = &a[bi * m * k..(bi + 1) * m * k];
        let b = if d.broadcast_b { &b[..k * n] } else { &b[bi * k * n..(bi + 1) * k * n] };
        let c = &mut out[bi * m * n..(bi + 1) * m * n];
        for i in 0..m {
            for j in 0..n {
                let mut acc = 0.0;
                for p in 0..k {
                    let av = if d.trans_a { a[p * m + i] } else { a[i * k + p] };
                    let bv = if d.trans_b { b[j * k + p] } else { b[p * n + j] };
                    acc += av * bv;
                }
                c[i * n + j] = acc;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fully_connected() {
        let out = fully_connected(&[1.0, 2.0], &[1.0, 0.0, 0.0, 1.0, 1.0, 1.0], Some(&[0.0, 0.0, 1.0][..]), 1, 2, 3);
        assert_eq!(out, vec![1.0, 2.0, 4.0]);
    }

    #[test]
    fn test_matmul_transposes_agree() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]; // 2x3
        let at = [1.0, 4.0, 2.0, 5.0, 3.0, 6.0]; // 3x2
        let b = [1.0, 0.0, 0.0, 1.0, 1.0, 1.0]; // 3x2
        let dims = MatMulDims { batch: 1, broadcast_b: true, m: 2, k: 3, n: 2, trans_a: false, trans_b: false };
        let plain = matmul(&a, &b, &dims);
        let transposed = matmul(&at, &b, &MatMulDims { trans_a: true, ..dims });
        assert_eq!(plain, vec![4.0, 5.0, 10.0, 11.0]);
        assert_eq!(plain, transposed);
    }
}
