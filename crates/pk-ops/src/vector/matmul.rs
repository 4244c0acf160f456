//! Batched matrix multiplication with a broadcastable right operand.
//!
//! A constant right operand is reordered once at init; otherwise both
//! operands are reordered per run.

use pk_kernels::gemm::int8::{requantize_rows, Int8Path};
use pk_kernels::gemm::mixed::QuantizedLhs;
use pk_kernels::gemm::{gemm_blocked, reorder_a_with, reorder_b_with};
use pk_kernels::parallel::try_for_each_chunk;
use pk_kernels::quant::col_sums;
use pk_kernels::{ChannelRequant, TilingParams};
use pk_tensor::{scratch, CpuStorage, DType, Tensor, TensorSpec};

use crate::error::Result;
use crate::infer::matrix_dims;
use crate::kernel::{ExecContext, Kernel, Prepared};
use crate::op::{OpKind, OpParams};
use crate::reference::MatMulDims;
use crate::tier::Tier;

use super::{capability, finish, rejected, VecFloat};

#[derive(Debug, Clone, Copy, Default)]
pub struct VectorMatMul;

impl Kernel for VectorMatMul {
    fn name(&self) -> &'static str {
        "vector_matmul"
    }

    fn capability(&self, _op: OpKind, inputs: &[&Tensor], params: &OpParams, _ctx: &ExecContext) -> Tier {
        capability::matmul(inputs, params)
    }

    fn init(
        &self,
        op: OpKind,
        inputs: &[&Tensor],
        params: &OpParams,
        output: &TensorSpec,
        ctx: &ExecContext,
    ) -> Result<Box<dyn Prepared>> {
        if !capability::matmul(inputs, params).is_supported() {
            return Err(rejected(op, inputs));
        }
        let (batch_a, m, k) = matrix_dims(op, inputs[0], false)?;
        let (batch_b, _, n) = matrix_dims(op, inputs[1], false)?;
        let shape = MatMulShape {
            dims: MatMulDims {
                batch: batch_a.iter().product(),
                broadcast_b: batch_b.iter().product::<usize>() == 1,
                m,
                k,
                n,
                trans_a: false,
                trans_b: false,
            },
            packn: ctx.profile.packn(inputs[0].dtype()),
        };
        log::debug!(
            "[vector_matmul] {} batch={} m={m} k={k} n={n} const_b={}",
            inputs[0].dtype(),
            shape.dims.batch,
            inputs[1].is_const()
        );
        Ok(match inputs[0].dtype() {
            DType::F32 => Box::new(FloatPlan::<f32>::new(inputs[1], shape, ctx)?),
            DType::F16 => Box::new(FloatPlan::<half::f16>::new(inputs[1], shape, ctx)?),
            DType::Int8 => Box::new(QuantPlan::new(inputs, output, shape, ctx)?),
            _ => return Err(rejected(op, inputs)),
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct MatMulShape {
    dims: MatMulDims,
    packn: usize,
}

impl MatMulShape {
    /// Distinct right operands: one when broadcast.
    fn b_count(&self) -> usize {
        if self.dims.broadcast_b {
            1
        } else {
            self.dims.batch
        }
    }

    fn b_index(&self, batch: usize) -> usize {
        if self.dims.broadcast_b {
            0
        } else {
            batch
        }
    }

    fn a_len(&self) -> usize {
        self.dims.m * self.dims.k
    }

    fn b_len(&self) -> usize {
        self.dims.k * self.dims.n
    }

    fn c_len(&self) -> usize {
        self.dims.m * self.dims.n
    }

    fn tiling(&self, ctx: &ExecContext) -> TilingParams {
        if self.dims.batch > 1 {
            ctx.tiling.with_parallel(false)
        } else {
            ctx.gemm_tiling()
        }
    }
}

#[derive(Debug)]
struct FloatPlan<T> {
    shape: MatMulShape,
    const_b: Option<Vec<T>>,
}

impl<T: VecFloat> FloatPlan<T> {
    fn new(b: &Tensor, shape: MatMulShape, ctx: &ExecContext) -> Result<Self> {
        let const_b = if b.is_const() {
            Some(Self::reorder_b(T::slice(b)?, &shape, &shape.tiling(ctx))?)
        } else {
            None
        };
        Ok(FloatPlan { shape, const_b })
    }

    fn reorder_b(src: &[T], shape: &MatMulShape, tiling: &TilingParams) -> pk_tensor::Result<Vec<T>> {
        let MatMulDims { k, n, .. } = shape.dims;
        let mut sb = scratch::alloc(shape.b_count() * shape.b_len())?;
        for (dst, b) in sb.chunks_exact_mut(shape.b_len()).zip(src.chunks_exact(shape.b_len())) {
            reorder_b_with(dst, k, n, shape.packn, tiling, |p, j| b[p * n + j]);
        }
        Ok(sb)
    }
}

impl<T: VecFloat> Prepared for FloatPlan<T> {
    fn exec(&self, inputs: &[&Tensor], output: &TensorSpec, ctx: &ExecContext) -> Result<Tensor> {
        let s = &self.shape;
        let MatMulDims { m, k, n, .. } = s.dims;
        let tiling = s.tiling(ctx);
        let a = T::slice(inputs[0])?;
        let fresh_b;
        let sb = match &self.const_b {
            Some(sb) => sb.as_slice(),
            None => {
                fresh_b = Self::reorder_b(T::slice(inputs[1])?, s, &tiling)?;
                fresh_b.as_slice()
            }
        };
        let mut out = scratch::alloc::<T>(s.dims.batch * s.c_len())?;

        try_for_each_chunk(&mut out, s.c_len(), ctx.parallel, |i, dst| {
            let item = &a[i * s.a_len()..][..s.a_len()];
            let mut sa = scratch::alloc(s.a_len())?;
            reorder_a_with(&mut sa, m, k, &tiling, |r, p| item[r * k + p]);
            let b = &sb[s.b_index(i) * s.b_len()..][..s.b_len()];
            gemm_blocked(dst, &sa, b, None, m, k, n, s.packn, &tiling);
            Ok(())
        })?;
        finish(T::into_storage(out), output, inputs[0])
    }
}

/// Reordered right operand with its column sums.
#[derive(Debug)]
struct QuantRhs {
    data: Vec<i8>,
    col_sums: Vec<i32>,
}

#[derive(Debug)]
struct QuantPlan {
    shape: MatMulShape,
    path: Int8Path,
    a_zp: i32,
    b_zp: i32,
    requant: ChannelRequant,
    const_b: Option<Vec<QuantRhs>>,
}

impl QuantPlan {
    fn new(inputs: &[&Tensor], output: &TensorSpec, shape: MatMulShape, ctx: &ExecContext) -> Result<Self> {
        let (a, b) = (inputs[0], inputs[1]);
        let path = Int8Path::for_profile(&ctx.profile);
        let mut plan = QuantPlan {
            shape,
            path,
            a_zp: a.quant().zero_point,
            b_zp: b.quant().zero_point,
            requant: ChannelRequant::resolve(a.quant(), &[b.quant()], output.quant()),
            const_b: None,
        };
        if b.is_const() {
            plan.const_b = Some(plan.reorder_b(b.data_i8()?)?);
        }
        Ok(plan)
    }

    fn reorder_b(&self, src: &[i8]) -> pk_tensor::Result<Vec<QuantRhs>> {
        let s = &self.shape;
        let MatMulDims { k, n, .. } = s.dims;
        src.chunks_exact(s.b_len())
            .take(s.b_count())
            .map(|b| -> pk_tensor::Result<QuantRhs> {
                let mut data = scratch::alloc(n * self.path.reduction_len(k))?;
                self.path.reorder_b_with(&mut data, k, n, s.packn, |p, j| b[p * n + j]);
                Ok(QuantRhs {
                    data,
                    col_sums: col_sums(b, k, n),
                })
            })
            .collect()
    }
}

impl Prepared for QuantPlan {
    fn exec(&self, inputs: &[&Tensor], output: &TensorSpec, ctx: &ExecContext) -> Result<Tensor> {
        let s = &self.shape;
        let MatMulDims { m, k, n, .. } = s.dims;
        let a = inputs[0].data_i8()?;
        let fresh_b;
        let rhs = match &self.const_b {
            Some(rhs) => rhs.as_slice(),
            None => {
                fresh_b = self.reorder_b(inputs[1].data_i8()?)?;
                fresh_b.as_slice()
            }
        };
        let out_zp = output.quant().zero_point;
        let mut out = scratch::alloc::<i8>(s.dims.batch * s.c_len())?;

        try_for_each_chunk(&mut out, s.c_len(), ctx.parallel, |i, dst| {
            let item = &a[i * s.a_len()..][..s.a_len()];
            let lhs = QuantizedLhs::prepare(item, m, k, vec![self.a_zp], self.path)?;
            let folded = lhs.folded_bias(None, self.b_zp);
            let b = &rhs[s.b_index(i)];
            let mut acc = scratch::alloc::<i32>(s.c_len())?;
            lhs.gemm(&mut acc, &b.data, n, s.packn, &folded, &b.col_sums);
            requantize_rows(&acc, dst, n, None, &self.requant, 0, out_zp);
            Ok(())
        })?;
        finish(CpuStorage::I8(out), output, inputs[0])
    }
}
