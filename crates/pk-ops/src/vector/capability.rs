//! Capability cascades of the vector rows.
//!
//! Each check runs dtype first, then layout, then the shape cascade, and
//! returns the decision `init` will follow so both always agree.

use pk_tensor::{DType, Layout, Tensor};

use crate::infer::infer_output;
use crate::kernel::ExecContext;
use crate::op::{OpKind, OpParams};
use crate::tier::Tier;

/// How a convolution produces its GEMM right operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ColumnMode {
    /// 1×1, stride 1, unpadded: the input itself is the column matrix,
    /// read through its blocking (`packn == 1` for canonical input).
    Direct { packn: usize },
    /// im2col on canonical planes.
    Scalar,
    /// im2col on channel blocks of `packn`.
    Packed { packn: usize },
}

fn well_formed(op: OpKind, inputs: &[&Tensor], params: &OpParams) -> bool {
    infer_output(op, inputs, params).is_ok()
}

fn image_layout(t: &Tensor) -> bool {
    matches!(t.layout(), Layout::NCHW | Layout::NC1HWC0)
}

fn weight_layout(t: &Tensor) -> bool {
    !t.layout().is_packed() && !t.layout().is_channel_last()
}

/// Bias dtype a kernel accepts for `dtype` activations.
fn bias_ok(inputs: &[&Tensor], dtype: DType) -> bool {
    inputs.get(2).map_or(true, |b| {
        if dtype.is_quantized() {
            b.dtype() == DType::Int32
        } else {
            b.dtype() == dtype || b.dtype() == DType::F32
        }
    })
}

/// Block width the operand is (or will be) packed at.
fn block_width(x: &Tensor, ctx: &ExecContext) -> usize {
    if x.layout().is_packed() {
        x.packn()
    } else {
        ctx.profile.packn(x.dtype())
    }
}

/// Padded taps store the activation zero point, which must fit an i8.
fn pad_value_fits(x: &Tensor) -> bool {
    !x.dtype().is_quantized() || i8::try_from(x.quant().zero_point).is_ok()
}

/// Channels `c` split evenly into blocks of the operand's width.
fn aligned(x: &Tensor, c: usize, packn: usize) -> bool {
    x.channel_tail() == 0 && c % packn == 0
}

pub(crate) fn conv(op: OpKind, inputs: &[&Tensor], params: &OpParams, ctx: &ExecContext) -> (Tier, ColumnMode) {
    const NO: (Tier, ColumnMode) = (Tier::Unsupported, ColumnMode::Scalar);
    let (x, w) = match inputs {
        [x, w, ..] => (*x, *w),
        _ => return NO,
    };
    let dtype = x.dtype();
    let dtype_ok = match dtype {
        DType::F32 | DType::F16 => w.dtype() == dtype || w.dtype() == DType::Int8,
        DType::Int8 => w.dtype() == DType::Int8,
        DType::Int4 => w.dtype() == DType::Int4 && ctx.profile.has_dot_product(),
        DType::Int32 => false,
    };
    if !dtype_ok || !bias_ok(inputs, dtype) {
        return NO;
    }
    if !image_layout(x) || !weight_layout(w) || !well_formed(op, inputs, params) {
        return NO;
    }
    let Ok(p) = params.conv(op) else {
        return NO;
    };
    if !pad_value_fits(x) {
        return (Tier::Reference, ColumnMode::Scalar);
    }
    let tier = if dtype == DType::Int4 { Tier::Asm } else { Tier::Intrinsic };
    let groups = p.groups.max(1);
    let icg = x.channels() / groups;
    let packn = block_width(x, ctx);
    let is_aligned = aligned(x, icg, packn);
    let pointwise = p.kernel_h == 1
        && p.kernel_w == 1
        && p.stride_h == 1
        && p.stride_w == 1
        && p.pad_top + p.pad_left + p.pad_down + p.pad_right == 0;

    if pointwise {
        let direct = if x.layout().is_packed() && (groups == 1 || is_aligned) {
            x.packn()
        } else {
            1
        };
        return (tier, ColumnMode::Direct { packn: direct });
    }
    if is_aligned && packn > 1 {
        return (tier, ColumnMode::Packed { packn });
    }
    if p.is_dilated() && groups > 1 {
        return (Tier::Reference, ColumnMode::Scalar);
    }
    (tier, ColumnMode::Scalar)
}

pub(crate) fn depthwise(inputs: &[&Tensor], params: &OpParams, ctx: &ExecContext) -> (Tier, usize) {
    let op = OpKind::DepthwiseConv2d;
    let (x, w) = match inputs {
        [x, w, ..] => (*x, *w),
        _ => return (Tier::Unsupported, 1),
    };
    let dtype = x.dtype();
    if !matches!(dtype, DType::F32 | DType::F16 | DType::Int8) || w.dtype() != dtype || !bias_ok(inputs, dtype) {
        return (Tier::Unsupported, 1);
    }
    if !image_layout(x) || !weight_layout(w) || !well_formed(op, inputs, params) {
        return (Tier::Unsupported, 1);
    }
    let Ok(p) = params.conv(op) else {
        return (Tier::Unsupported, 1);
    };
    let packn = block_width(x, ctx);
    if !pad_value_fits(x) {
        return (Tier::Reference, packn);
    }
    if aligned(x, x.channels(), packn) {
        return (Tier::Intrinsic, packn);
    }
    let strided = (p.stride_h, p.stride_w) == (1, 1) || (p.stride_h, p.stride_w) == (2, 2);
    if p.kernel_h == 3 && p.kernel_w == 3 && strided {
        return (Tier::Intrinsic, packn);
    }
    (Tier::Reference, packn)
}

pub(crate) fn deconv(inputs: &[&Tensor], params: &OpParams) -> Tier {
    let op = OpKind::Deconv2d;
    let (x, w) = match inputs {
        [x, w, ..] => (*x, *w),
        _ => return Tier::Unsupported,
    };
    let dtype = x.dtype();
    if !matches!(dtype, DType::F32 | DType::F16) || w.dtype() != dtype || !bias_ok(inputs, dtype) {
        return Tier::Unsupported;
    }
    if !image_layout(x) || !weight_layout(w) || !well_formed(op, inputs, params) {
        return Tier::Unsupported;
    }
    match params.conv(op) {
        Ok(p) if p.groups <= 1 => Tier::Intrinsic,
        Ok(_) => Tier::Reference,
        Err(_) => Tier::Unsupported,
    }
}

pub(crate) fn fully_connected(inputs: &[&Tensor], params: &OpParams) -> Tier {
    let (x, w) = match inputs {
        [x, w, ..] => (*x, *w),
        _ => return Tier::Unsupported,
    };
    let dtype = x.dtype();
    let dtype_ok = match dtype {
        DType::F32 | DType::F16 => w.dtype() == dtype || w.dtype() == DType::Int8,
        DType::Int8 => w.dtype() == DType::Int8,
        _ => false,
    };
    if !dtype_ok || !bias_ok(inputs, dtype) || x.layout().is_channel_last() || !weight_layout(w) {
        return Tier::Unsupported;
    }
    if !well_formed(OpKind::FullyConnected, inputs, params) {
        return Tier::Unsupported;
    }
    Tier::Intrinsic
}

pub(crate) fn matmul(inputs: &[&Tensor], params: &OpParams) -> Tier {
    let (a, b) = match inputs {
        [a, b] => (*a, *b),
        _ => return Tier::Unsupported,
    };
    let dtype = a.dtype();
    if !matches!(dtype, DType::F32 | DType::F16 | DType::Int8) || b.dtype() != dtype {
        return Tier::Unsupported;
    }
    if a.layout().is_packed() || b.layout().is_packed() || !well_formed(OpKind::MatMul, inputs, params) {
        return Tier::Unsupported;
    }
    let mp = params.matmul();
    if mp.trans_a || mp.trans_b {
        return Tier::Reference;
    }
    Tier::Intrinsic
}

pub(crate) fn pool(op: OpKind, inputs: &[&Tensor], params: &OpParams, ctx: &ExecContext) -> (Tier, usize) {
    let x = match inputs {
        [x] => *x,
        _ => return (Tier::Unsupported, 1),
    };
    if !matches!(x.dtype(), DType::F32 | DType::F16 | DType::Int8) {
        return (Tier::Unsupported, 1);
    }
    if !image_layout(x) || !well_formed(op, inputs, params) {
        return (Tier::Unsupported, 1);
    }
    let packn = block_width(x, ctx);
    if !pad_value_fits(x) {
        return (Tier::Reference, packn);
    }
    if op == OpKind::GlobalAvgPool2d {
        return (Tier::Intrinsic, packn);
    }
    let Ok(p) = params.pool(op) else {
        return (Tier::Unsupported, 1);
    };
    let square = p.kernel_h == p.kernel_w && p.stride_h == p.stride_w;
    let stride2 = square && matches!(p.kernel_h, 2 | 3) && p.stride_h == 2 && p.max_pad() <= 1;
    let same3 = square
        && p.kernel_h == 3
        && p.stride_h == 1
        && [p.pad_top, p.pad_left, p.pad_down, p.pad_right] == [1; 4];
    if aligned(x, x.channels(), packn) && (stride2 || same3) {
        return (Tier::Intrinsic, packn);
    }
    (Tier::Reference, packn)
}

pub(crate) fn elementwise(op: OpKind, inputs: &[&Tensor], params: &OpParams) -> Tier {
    let Some(a) = inputs.first() else {
        return Tier::Unsupported;
    };
    let dtype = a.dtype();
    if !matches!(dtype, DType::F32 | DType::F16 | DType::Int8) {
        return Tier::Unsupported;
    }
    if inputs.iter().any(|t| t.dtype() != dtype) || !well_formed(op, inputs, params) {
        return Tier::Unsupported;
    }
    if op.is_binary() {
        let b = inputs[1];
        if a.channel_tail() != 0 || (b.layout().is_packed() && !a.layout().is_packed()) {
            return Tier::Reference;
        }
    }
    Tier::Intrinsic
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{Conv2dParams, PoolParams};
    use pk_kernels::VectorProfile;
    use pk_tensor::{QuantInfo, Shape};

    fn t(dims: &[usize]) -> Tensor {
        Tensor::zeros(Shape::from_slice(dims))
    }

    #[test]
    fn test_conv_cascade() {
        let ctx = ExecContext::default();
        let x = t(&[1, 8, 6, 6]);
        let w1 = t(&[4, 8, 1, 1]);
        let w3 = t(&[4, 8, 3, 3]);
        let pw: OpParams = Conv2dParams::new(1, 1).into();
        let c3: OpParams = Conv2dParams::new(3, 3).with_pad(1).into();
        assert_eq!(conv(OpKind::Conv2d, &[&x, &w1], &pw, &ctx), (Tier::Intrinsic, ColumnMode::Direct { packn: 1 }));
        assert_eq!(conv(OpKind::Conv2d, &[&x, &w3], &c3, &ctx), (Tier::Intrinsic, ColumnMode::Packed { packn: 4 }));

        let odd = t(&[1, 6, 6, 6]);
        let w_odd = t(&[4, 6, 3, 3]);
        assert_eq!(conv(OpKind::Conv2d, &[&odd, &w_odd], &c3, &ctx), (Tier::Intrinsic, ColumnMode::Scalar));

        // dilated, grouped and unaligned
        let g: OpParams = Conv2dParams::new(3, 3).with_pad(2).with_dilation(2, 2).with_groups(2).into();
        let wg = t(&[4, 3, 3, 3]);
        assert_eq!(conv(OpKind::GroupConv2d, &[&odd, &wg], &g, &ctx).0, Tier::Reference);
    }

    #[test]
    fn test_int4_needs_dot_product() {
        let q = vec![QuantInfo::new(1.0, 0)];
        let x = Tensor::from_i4(&[0; 16], Shape::from_slice(&[1, 1, 4, 4]), q.clone()).unwrap();
        let w = Tensor::from_i4(&[0; 9], Shape::from_slice(&[1, 1, 3, 3]), q).unwrap();
        let p: OpParams = Conv2dParams::new(3, 3).into();
        let plain = ExecContext::default();
        assert_eq!(conv(OpKind::Conv2d, &[&x, &w], &p, &plain).0, Tier::Unsupported);
        let dot = ExecContext {
            profile: VectorProfile::default().with_dot_product(true),
            ..plain
        };
        assert_eq!(conv(OpKind::Conv2d, &[&x, &w], &p, &dot).0, Tier::Asm);
    }

    #[test]
    fn test_pool_and_depthwise_cascades() {
        let ctx = ExecContext::default();
        let x = t(&[1, 8, 8, 8]);
        let odd = t(&[1, 5, 8, 8]);
        let s2: OpParams = PoolParams::new(3, 2).with_pad(1).into();
        let s1: OpParams = PoolParams::new(3, 1).into();
        assert_eq!(pool(OpKind::MaxPool2d, &[&x], &s2, &ctx).0, Tier::Intrinsic);
        assert_eq!(pool(OpKind::MaxPool2d, &[&x], &s1, &ctx).0, Tier::Reference);
        assert_eq!(pool(OpKind::MaxPool2d, &[&odd], &s2, &ctx).0, Tier::Reference);
        assert_eq!(pool(OpKind::GlobalAvgPool2d, &[&odd], &OpParams::None, &ctx).0, Tier::Intrinsic);

        let dw3: OpParams = Conv2dParams::new(3, 3).with_pad(1).with_groups(5).into();
        let dw5: OpParams = Conv2dParams::new(5, 5).with_pad(2).with_groups(5).into();
        let w3 = t(&[5, 1, 3, 3]);
        let w5 = t(&[5, 1, 5, 5]);
        assert_eq!(depthwise(&[&odd, &w3], &dw3, &ctx).0, Tier::Intrinsic);
        assert_eq!(depthwise(&[&odd, &w5], &dw5, &ctx).0, Tier::Reference);
    }
}
