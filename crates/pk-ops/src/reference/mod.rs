//! Portable reference backend.
//!
//! Every operand is unpacked, dequantized into f32, computed with plain
//! loops and converted to the output descriptor. It covers every op and
//! dtype, so the registry can always fall back to it.

mod conv;
mod dense;
mod pool;

use pk_kernels::elementwise::{broadcast_binary, BinaryOp};
use pk_tensor::{Tensor, TensorSpec};

use crate::convert::{bias_to_f32, from_f32, match_layout, to_f32};
use crate::error::Result;
use crate::infer::{infer_output, logical_dims, matrix_dims};
use crate::kernel::{ExecContext, Kernel, Prepared};
use crate::op::{OpKind, OpParams};
use crate::tier::Tier;

pub(crate) use dense::MatMulDims;

#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceKernel;

impl Kernel for ReferenceKernel {
    fn name(&self) -> &'static str {
        "reference"
    }

    fn capability(&self, op: OpKind, inputs: &[&Tensor], params: &OpParams, _ctx: &ExecContext) -> Tier {
        match infer_output(op, inputs, params) {
            Ok(_) => Tier::Reference,
            Err(_) => Tier::Unsupported,
        }
    }

    fn init(
        &self,
        op: OpKind,
        inputs: &[&Tensor],
        params: &OpParams,
        _output: &TensorSpec,
        _ctx: &ExecContext,
    ) -> Result<Box<dyn Prepared>> {
        infer_output(op, inputs, params)?;
        Ok(Box::new(ReferencePlan { op, params: *params }))
    }
}

#[derive(Debug)]
struct ReferencePlan {
    op: OpKind,
    params: OpParams,
}

fn optional_bias(inputs: &[&Tensor]) -> Result<Option<Vec<f32>>> {
    inputs
        .get(2)
        .map(|b| bias_to_f32(b, inputs[0], inputs[1]))
        .transpose()
}

impl ReferencePlan {
    fn compute(&self, inputs: &[&Tensor], output: &TensorSpec) -> Result<Vec<f32>> {
        let op = self.op;
        let out_dims = output.shape.dims();
        match op {
            OpKind::Conv2d | OpKind::GroupConv2d | OpKind::DepthwiseConv2d | OpKind::Deconv2d => {
                let p = self.params.conv(op)?;
                let xd = logical_dims(inputs[0]);
                let x = to_f32(inputs[0], 1)?;
                let w = to_f32(inputs[1], 0)?;
                let bias = optional_bias(inputs)?;
                let dims = [xd[0], xd[1], xd[2], xd[3]];
                let f = if op == OpKind::Deconv2d { conv::deconv2d } else { conv::conv2d };
                Ok(f(&x, dims, &w, out_dims[1], bias.as_deref(), p, (out_dims[2], out_dims[3])))
            }
            OpKind::FullyConnected => {
                let x = to_f32(inputs[0], 1)?;
                let w = to_f32(inputs[1], 0)?;
                let bias = optional_bias(inputs)?;
                let (batch, o) = (out_dims[0], out_dims[1]);
                let k = x.len() / batch.max(1);
                Ok(dense::fully_connected(&x, &w, bias.as_deref(), batch, k, o))
            }
            OpKind::MatMul => {
                let mp = self.params.matmul();
                let (batch_a, m, k) = matrix_dims(op, inputs[0], mp.trans_a)?;
                let (batch_b, _, n) = matrix_dims(op, inputs[1], mp.trans_b)?;
                let dims = MatMulDims {
                    batch: batch_a.iter().product(),
                    broadcast_b: batch_b.iter().product::<usize>() == 1,
                    m,
                    k,
                    n,
                    trans_a: mp.trans_a,
                    trans_b: mp.trans_b,
                };
                Ok(dense::matmul(&to_f32(inputs[0], 0)?, &to_f32(inputs[1], 0)?, &dims))
            }
            OpKind::MaxPool2d | OpKind::AvgPool2d | OpKind::GlobalAvgPool2d => {
                let xd = logical_dims(inputs[0]);
                let (h, w) = (xd[2], xd[3]);
                let p = match op {
                    OpKind::GlobalAvgPool2d => crate::op::PoolParams::global(h, w),
                    _ => *self.params.pool(op)?,
                };
                let x = to_f32(inputs[0], 1)?;
                Ok(pool::pool2d(
                    &x,
                    xd[0] * xd[1],
                    (h, w),
                    &p,
                    (out_dims[2], out_dims[3]),
                    op == OpKind::MaxPool2d,
                ))
            }
            OpKind::Add | OpKind::Sub | OpKind::Mul => {
                let bin = match op {
                    OpKind::Add => BinaryOp::Add,
                    OpKind::Sub => BinaryOp::Sub,
                    _ => BinaryOp::Mul,
                };
                let a = to_f32(inputs[0], 1)?;
                let b = to_f32(inputs[1], 1)?;
                let mut out = vec![0.0f32; output.shape.numel()];
                broadcast_binary(
                    &a,
                    &logical_dims(inputs[0]),
                    &b,
                    &logical_dims(inputs[1]),
                    &mut out,
                    out_dims,
                    |x, y| bin.apply(x, y),
                );
                Ok(out)
            }
            OpKind::Relu => Ok(to_f32(inputs[0], 1)?.into_iter().map(|v| v.max(0.0)).collect()),
        }
    }
}

impl Prepared for ReferencePlan {
    fn exec(&self, inputs: &[&Tensor], output: &TensorSpec, _ctx: &ExecContext) -> Result<Tensor> {
        let values = self.compute(inputs, output)?;
        match_layout(from_f32(&values, output)?, inputs[0])
    }
}
