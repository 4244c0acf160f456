//! Output shape inference and cost estimates.
//!
//! Shapes here are logical: a packed operand contributes `[N, C, spatial..]`
//! regardless of its blocking, and the inferred output is canonical.

use pk_tensor::{Layout, QuantInfo, Shape, Tensor, TensorSpec};

use crate::error::{OpError, Result};
use crate::op::{OpKind, OpParams};

/// Logical dims of a tensor, undoing channel blocking.
pub fn logical_dims(t: &Tensor) -> Vec<usize> {
    let dims = t.shape().dims();
    if !t.layout().is_packed() {
        return dims.to_vec();
    }
    let mut out = vec![t.batch(), t.channels()];
    out.extend_from_slice(&dims[2..dims.len() - 1]);
    out
}

pub fn check_arity(op: OpKind, inputs: &[&Tensor]) -> Result<()> {
    let (lo, hi) = op.arity();
    if inputs.len() < lo || inputs.len() > hi {
        return Err(OpError::InputCount {
            op,
            expected: lo,
            got: inputs.len(),
        });
    }
    Ok(())
}

fn rank4(op: OpKind, t: &Tensor, what: &str) -> Result<[usize; 4]> {
    match logical_dims(t).as_slice() {
        &[n, c, h, w] => Ok([n, c, h, w]),
        other => Err(OpError::invalid(op, format!("{what} must be 4-D, got {other:?}"))),
    }
}

/// Split `[..batch, r, c]` into the batch count and the trailing matrix.
pub(crate) fn matrix_dims(op: OpKind, t: &Tensor, transpose: bool) -> Result<(Vec<usize>, usize, usize)> {
    let dims = logical_dims(t);
    if dims.len() < 2 {
        return Err(OpError::invalid(op, format!("matrix operand must be at least 2-D, got {dims:?}")));
    }
    let (batch, mat) = dims.split_at(dims.len() - 2);
    let (r, c) = if transpose { (mat[1], mat[0]) } else { (mat[0], mat[1]) };
    Ok((batch.to_vec(), r, c))
}

fn conv_shape(op: OpKind, inputs: &[&Tensor], params: &OpParams) -> Result<Vec<usize>> {
    let p = params.conv(op)?;
    let [n, c, h, w] = rank4(op, inputs[0], "input")?;
    let [wo, wi, kh, kw] = rank4(op, inputs[1], "weight")?;
    if (kh, kw) != (p.kernel_h, p.kernel_w) {
        return Err(OpError::invalid(
            op,
            format!("weight kernel {kh}x{kw} disagrees with {}x{}", p.kernel_h, p.kernel_w),
        ));
    }
    let groups = p.groups.max(1);
    if op == OpKind::Deconv2d {
        if wo != c || c % groups != 0 {
            return Err(OpError::invalid(op, format!("weight has {wo} input channels, input has {c}")));
        }
        let geo = p
            .deconv_geometry(h, w)
            .ok_or_else(|| OpError::invalid(op, "transposed output would be empty"))?;
        return Ok(vec![n, wi * groups, geo.in_h, geo.in_w]);
    }
    if wi * groups != c || wo % groups != 0 {
        return Err(OpError::invalid(
            op,
            format!("{c} input channels do not split into {groups} groups of {wi}"),
        ));
    }
    if op == OpKind::DepthwiseConv2d && (groups != c || wo != c) {
        return Err(OpError::invalid(op, "depthwise needs groups == in == out channels"));
    }
    let geo = p
        .geometry(h, w)
        .ok_or_else(|| OpError::invalid(op, format!("kernel does not fit a {h}x{w} input")))?;
    Ok(vec![n, wo, geo.out_h, geo.out_w])
}

/// Per-channel operands of a weighted op must agree with its output
/// channels: weight quant entries are shared (0 or 1) or one per channel,
/// and a bias holds one value per channel.
fn check_channel_operands(op: OpKind, inputs: &[&Tensor], out_channels: usize) -> Result<()> {
    let entries = inputs[1].qinfo().len();
    if entries > 1 && entries != out_channels {
        return Err(OpError::invalid(
            op,
            format!("{entries} per-channel quant entries do not match {out_channels} output channels"),
        ));
    }
    if let Some(bias) = inputs.get(2) {
        if bias.numel() != out_channels {
            return Err(OpError::invalid(
                op,
                format!("bias has {} values for {out_channels} output channels", bias.numel()),
            ));
        }
    }
    Ok(())
}

/// Logical output shape of `op`.
pub fn infer_output(op: OpKind, inputs: &[&Tensor], params: &OpParams) -> Result<Shape> {
    check_arity(op, inputs)?;
    let dims = match op {
        OpKind::Conv2d | OpKind::GroupConv2d | OpKind::DepthwiseConv2d | OpKind::Deconv2d => {
            let dims = conv_shape(op, inputs, params)?;
            check_channel_operands(op, inputs, dims[1])?;
            dims
        }
        OpKind::FullyConnected => {
            let x = logical_dims(inputs[0]);
            let batch = x.first().copied().unwrap_or(1);
            let k: usize = x.iter().skip(1).product();
            match logical_dims(inputs[1]).as_slice() {
                &[o, wk] if wk == k => {
                    check_channel_operands(op, inputs, o)?;
                    vec![batch, o]
                }
                other => {
                    return Err(OpError::invalid(
                        op,
                        format!("weight {other:?} does not match {k} input features"),
                    ))
                }
            }
        }
        OpKind::MatMul => {
            let mp = params.matmul();
            let (batch_a, m, ka) = matrix_dims(op, inputs[0], mp.trans_a)?;
            let (batch_b, kb, n) = matrix_dims(op, inputs[1], mp.trans_b)?;
            if ka != kb {
                return Err(OpError::invalid(op, format!("inner dims {ka} and {kb} differ")));
            }
            let count_a: usize = batch_a.iter().product();
            let count_b: usize = batch_b.iter().product();
            if count_b != 1 && count_b != count_a {
                return Err(OpError::UnsupportedBroadcast {
                    op,
                    detail: "matmul unsupported this broadcast".to_string(),
                });
            }
            let mut dims = batch_a;
            dims.extend_from_slice(&[m, n]);
            dims
        }
        OpKind::MaxPool2d | OpKind::AvgPool2d => {
            let p = params.pool(op)?;
            let [n, c, h, w] = rank4(op, inputs[0], "input")?;
            let geo = p
                .geometry(h, w)
                .ok_or_else(|| OpError::invalid(op, format!("window does not fit a {h}x{w} input")))?;
            vec![n, c, geo.out_h, geo.out_w]
        }
        OpKind::GlobalAvgPool2d => {
            let [n, c, _, _] = rank4(op, inputs[0], "input")?;
            vec![n, c, 1, 1]
        }
        OpKind::Add | OpKind::Sub | OpKind::Mul => {
            let a = Shape::new(logical_dims(inputs[0]));
            let b = Shape::new(logical_dims(inputs[1]));
            return Shape::broadcast_shape(&a, &b).map_err(|e| OpError::UnsupportedBroadcast {
                op,
                detail: e.to_string(),
            });
        }
        OpKind::Relu => logical_dims(inputs[0]),
    };
    Ok(Shape::new(dims))
}

/// Canonical output descriptor: the first input's dtype with `qinfo`.
pub fn output_spec(op: OpKind, inputs: &[&Tensor], params: &OpParams, qinfo: Vec<QuantInfo>) -> Result<TensorSpec> {
    let shape = infer_output(op, inputs, params)?;
    let layout = Layout::canonical_for_rank(shape.ndim()).unwrap_or(Layout::N);
    Ok(TensorSpec::new(inputs[0].dtype(), shape, layout).with_qinfo(qinfo))
}

/// Multiply-accumulate count of one run; zero for malformed inputs.
pub fn estimate_macs(op: OpKind, inputs: &[&Tensor], params: &OpParams) -> u64 {
    let Ok(out) = infer_output(op, inputs, params) else {
        return 0;
    };
    let out_numel = out.numel() as u64;
    let reduction = match op {
        OpKind::Conv2d | OpKind::GroupConv2d | OpKind::DepthwiseConv2d => {
            let w = logical_dims(inputs[1]);
            w[1..].iter().product::<usize>() as u64
        }
        OpKind::Deconv2d => {
            // every input pixel scatters a full kernel into each output channel
            let x = logical_dims(inputs[0]);
            let w = logical_dims(inputs[1]);
            return x.iter().product::<usize>() as u64 * w[1..].iter().product::<usize>() as u64;
        }
        OpKind::FullyConnected => logical_dims(inputs[1]).get(1).copied().unwrap_or(1) as u64,
        OpKind::MatMul => {
            let mp = params.matmul();
            matrix_dims(op, inputs[0], mp.trans_a).map_or(1, |(_, _, k)| k as u64)
        }
        OpKind::MaxPool2d | OpKind::AvgPool2d => params
            .pool(op)
            .map_or(1, |p| (p.kernel_h * p.kernel_w) as u64),
        OpKind::GlobalAvgPool2d => {
            let x = logical_dims(inputs[0]);
            x[2..].iter().product::<usize>() as u64
        }
        OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Relu => 1,
    };
    out_numel * reduction
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{Conv2dParams, MatMulParams, PoolParams};

    fn t(dims: &[usize]) -> Tensor {
        Tensor::zeros(Shape::from_slice(dims))
    }

    #[test]
    fn test_conv_shapes() {
        let x = t(&[2, 8, 9, 9]);
        let w = t(&[16, 4, 3, 3]);
        let p: OpParams = Conv2dParams::new(3, 3).with_stride(2, 2).with_pad(1).with_groups(2).into();
        let out = infer_output(OpKind::GroupConv2d, &[&x, &w], &p).unwrap();
        assert_eq!(out.dims(), &[2, 16, 5, 5]);
        assert_eq!(estimate_macs(OpKind::GroupConv2d, &[&x, &w], &p), 2 * 16 * 25 * 36);

        let bad = t(&[16, 3, 3, 3]);
        assert!(infer_output(OpKind::GroupConv2d, &[&x, &bad], &p).is_err());
    }

    #[test]
    fn test_deconv_shape() {
        let x = t(&[1, 4, 5, 5]);
        let w = t(&[4, 6, 3, 3]);
        let p: OpParams = Conv2dParams::new(3, 3).with_stride(2, 2).with_pad(1).into();
        let out = infer_output(OpKind::Deconv2d, &[&x, &w], &p).unwrap();
        assert_eq!(out.dims(), &[1, 6, 9, 9]);
    }

    #[test]
    fn test_matmul_broadcast_rules() {
        let a = t(&[3, 4, 5]);
        let b = t(&[5, 6]);
        let none = OpParams::None;
        assert_eq!(infer_output(OpKind::MatMul, &[&a, &b], &none).unwrap().dims(), &[3, 4, 6]);

        let b2 = t(&[2, 5, 6]);
        let err = infer_output(OpKind::MatMul, &[&a, &b2], &none).unwrap_err();
        assert!(err.to_string().contains("matmul unsupported this broadcast"));

        let bt = t(&[6, 5]);
        let p: OpParams = MatMulParams { trans_a: false, trans_b: true }.into();
        assert_eq!(infer_output(OpKind::MatMul, &[&a, &bt], &p).unwrap().dims(), &[3, 4, 6]);
    }

    #[test]
    fn test_pool_and_fc_shapes() {
        let x = t(&[1, 4, 7, 7]);
        let p: OpParams = PoolParams::new(3, 2).with_pad(1).into();
        assert_eq!(infer_output(OpKind::MaxPool2d, &[&x], &p).unwrap().dims(), &[1, 4, 4, 4]);
        assert_eq!(
            infer_output(OpKind::GlobalAvgPool2d, &[&x], &OpParams::None).unwrap().dims(),
            &[1, 4, 1, 1]
        );
        let w = t(&[10, 196]);
        assert_eq!(
            infer_output(OpKind::FullyConnected, &[&x, &w], &OpParams::None).unwrap().dims(),
            &[1, 10]
        );
    }

    #[test]
    fn test_channel_operands_must_match_outputs() {
        let x = t(&[1, 4, 5, 5]);
        let w = t(&[4, 4, 3, 3]);
        let p: OpParams = Conv2dParams::new(3, 3).into();
        let two = w.clone().with_qinfo(vec![QuantInfo::new(0.1, 0); 2]);
        let err = infer_output(OpKind::Conv2d, &[&x, &two], &p).unwrap_err();
        assert!(err.to_string().contains("2 per-channel quant entries do not match 4 output channels"));
        let four = w.clone().with_qinfo(vec![QuantInfo::new(0.1, 0); 4]);
        assert!(infer_output(OpKind::Conv2d, &[&x, &four], &p).is_ok());

        let short_bias = t(&[3]);
        assert!(infer_output(OpKind::Conv2d, &[&x, &w, &short_bias], &p).is_err());

        let fx = t(&[2, 8]);
        let fw = t(&[6, 8]).with_qinfo(vec![QuantInfo::new(0.1, 0); 3]);
        assert!(infer_output(OpKind::FullyConnected, &[&fx, &fw], &OpParams::None).is_err());
    }

    #[test]
    fn test_arity() {
        let x = t(&[1, 4]);
        assert!(matches!(
            infer_output(OpKind::Add, &[&x], &OpParams::None),
            Err(OpError::InputCount { .. })
        ));
    }
}
