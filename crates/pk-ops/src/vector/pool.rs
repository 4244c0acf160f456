//! Max, average and global average pooling over channel blocks.

use pk_kernels::pool::{pool2d, PoolElement};
use pk_kernels::quant::{dequantize, quantize};
use pk_kernels::{pack, unpack, ConvGeometry, PoolKind};
use pk_tensor::{scratch, CpuStorage, DType, Tensor, TensorSpec};

use crate::error::{OpError, Result};
use crate::infer::logical_dims;
use crate::kernel::{ExecContext, Kernel, Prepared};
use crate::op::{OpKind, OpParams, PoolParams};
use crate::tier::Tier;

use super::{capability, finish_blocked, rejected};

#[derive(Debug, Clone, Copy, Default)]
pub struct VectorPool;

impl Kernel for VectorPool {
    fn name(&self) -> &'static str {
        "vector_pool2d"
    }

    fn capability(&self, op: OpKind, inputs: &[&Tensor], params: &OpParams, ctx: &ExecContext) -> Tier {
        capability::pool(op, inputs, params, ctx).0
    }

    fn init(
        &self,
        op: OpKind,
        inputs: &[&Tensor],
        params: &OpParams,
        _output: &TensorSpec,
        ctx: &ExecContext,
    ) -> Result<Box<dyn Prepared>> {
        let (tier, packn) = capability::pool(op, inputs, params, ctx);
        if !tier.is_supported() {
            return Err(rejected(op, inputs));
        }
        let xd = logical_dims(inputs[0]);
        let p = match op {
            OpKind::GlobalAvgPool2d => PoolParams::global(xd[2], xd[3]),
            _ => *params.pool(op)?,
        };
        let geo = p
            .geometry(xd[2], xd[3])
            .ok_or_else(|| OpError::invalid(op, "window does not fit the input"))?;
        let kind = match op {
            OpKind::MaxPool2d => PoolKind::Max,
            _ => PoolKind::Avg {
                count_include_pad: p.count_include_pad,
            },
        };
        log::debug!("[vector_pool2d] {op} {} {kind:?} packn={packn} tier={tier}", inputs[0].dtype());
        Ok(Box::new(PoolPlan {
            op,
            geo,
            kind,
            batch: xd[0],
            channels: xd[1],
            packn,
        }))
    }
}

#[derive(Debug)]
struct PoolPlan {
    op: OpKind,
    geo: ConvGeometry,
    kind: PoolKind,
    batch: usize,
    channels: usize,
    packn: usize,
}

impl PoolPlan {
    fn run<T: PoolElement + Default>(&self, src: &[T], pad: T, parallel: bool) -> pk_tensor::Result<Vec<T>> {
        let in_item = self.channels * self.geo.in_size();
        let out_item = self.channels * self.geo.out_size();
        let mut out = scratch::alloc::<T>(self.batch * out_item)?;
        for (item, dst) in src.chunks_exact(in_item).zip(out.chunks_exact_mut(out_item)) {
            pool2d(item, dst, self.channels, &self.geo, self.packn, self.kind, pad, parallel);
        }
        Ok(out)
    }
}

impl Prepared for PoolPlan {
    fn exec(&self, inputs: &[&Tensor], output: &TensorSpec, ctx: &ExecContext) -> Result<Tensor> {
        let x = if self.packn > 1 {
            pack(inputs[0], self.packn)?
        } else {
            unpack(inputs[0])?
        };
        let storage = match x.dtype() {
            DType::F32 => CpuStorage::F32(self.run(x.data_f32()?, 0.0, ctx.parallel)?),
            DType::F16 => CpuStorage::F16(self.run(x.data_f16()?, half::f16::ZERO, ctx.parallel)?),
            DType::Int8 => {
                let (qi, qo) = (x.quant(), output.quant());
                let pad = i8::try_from(qi.zero_point).map_err(|_| {
                    OpError::invalid(self.op, format!("input zero point {} does not fit the stored type", qi.zero_point))
                })?;
                let mut out = self.run(x.data_i8()?, pad, ctx.parallel)?;
                if qi != qo {
                    for v in out.iter_mut() {
                        *v = quantize(dequantize(*v as i32, qi.zero_point, qi.scale), qo.scale, qo.zero_point);
                    }
                }
                CpuStorage::I8(out)
            }
            other => {
                return Err(OpError::NoKernel {
                    op: self.op,
                    dtype: other,
                })
            }
        };
        finish_blocked(storage, self.packn, output, inputs[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::testing::{random_f32, random_i8, raw_i8, reference, run, values};
    use approx::assert_abs_diff_eq;
    use pk_tensor::{QuantInfo, Shape};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn check(op: OpKind, x: &Tensor, params: OpParams) {
        let ctx = ExecContext::default();
        assert_eq!(VectorPool.capability(op, &[x], &params, &ctx), Tier::Intrinsic);
        let got = run(&VectorPool, op, &[x], &params, vec![], &ctx);
        let want = reference(op, &[x], &params, vec![]);
        for (g, w) in values(&got).iter().zip(&want) {
            assert_abs_diff_eq!(g, w, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_stride_two_max_and_avg() {
        let mut rng = StdRng::seed_from_u64(51);
        let x = random_f32(&mut rng, &[2, 8, 7, 7]);
        check(OpKind::MaxPool2d, &x, OpParams::Pool(PoolParams::new(3, 2).with_pad(1)));
        check(OpKind::AvgPool2d, &x, OpParams::Pool(PoolParams::new(2, 2)));
        let inclusive = PoolParams::new(3, 2).with_pad(1).with_count_include_pad(true);
        check(OpKind::AvgPool2d, &x, OpParams::Pool(inclusive));
    }

    #[test]
    fn test_same_padded_three_by_three() {
        let mut rng = StdRng::seed_from_u64(52);
        let x = pack(&random_f32(&mut rng, &[1, 4, 5, 6]), 4).unwrap();
        check(OpKind::MaxPool2d, &x, OpParams::Pool(PoolParams::new(3, 1).with_pad(1)));
    }

    #[test]
    fn test_global_average_with_tail() {
        let mut rng = StdRng::seed_from_u64(53);
        let x = random_f32(&mut rng, &[1, 6, 4, 3]);
        check(OpKind::GlobalAvgPool2d, &x, OpParams::None);
    }

    #[test]
    fn test_int8_rescales_to_output_quant() {
        let mut rng = StdRng::seed_from_u64(54);
        let x = random_i8(&mut rng, &[1, 8, 4, 4], QuantInfo::new(0.1, 3));
        let params = OpParams::Pool(PoolParams::new(2, 2));
        let ctx = ExecContext::default();
        for out_q in [QuantInfo::new(0.1, 3), QuantInfo::new(0.25, -1)] {
            let got = run(&VectorPool, OpKind::MaxPool2d, &[&x], &params, vec![out_q], &ctx);
            let want = run(&crate::reference::ReferenceKernel, OpKind::MaxPool2d, &[&x], &params, vec![out_q], &ctx);
            assert_eq!(raw_i8(&got), raw_i8(&want));
        }
    }

    #[test]
    fn test_unaligned_window_delegates() {
        let x = Tensor::zeros(Shape::from_slice(&[1, 8, 9, 9]));
        let params = OpParams::Pool(PoolParams::new(5, 1));
        let tier = VectorPool.capability(OpKind::MaxPool2d, &[&x], &params, &ExecContext::default());
        assert_eq!(tier, Tier::Reference);
    }
}
