//! Depthwise convolution over channel blocks.

use pk_kernels::depthwise::{depthwise, depthwise_i8, reorder_weights, DepthwiseQuant};
use pk_kernels::pad::padded;
use pk_kernels::{pack, unpack, ChannelRequant, ConvGeometry};
use pk_tensor::{scratch, CpuStorage, DType, Tensor, TensorSpec};

use crate::error::{OpError, Result};
use crate::infer::logical_dims;
use crate::kernel::{ExecContext, Kernel, Prepared};
use crate::op::{OpKind, OpParams};
use crate::tier::Tier;

use super::{capability, finish_blocked, float_values, int8_values, rejected, VecFloat};

#[derive(Debug, Clone, Copy, Default)]
pub struct VectorDepthwise;

impl Kernel for VectorDepthwise {
    fn name(&self) -> &'static str {
        "vector_depthwise"
    }

    fn capability(&self, _op: OpKind, inputs: &[&Tensor], params: &OpParams, ctx: &ExecContext) -> Tier {
        capability::depthwise(inputs, params, ctx).0
    }

    fn init(
        &self,
        op: OpKind,
        inputs: &[&Tensor],
        params: &OpParams,
        output: &TensorSpec,
        ctx: &ExecContext,
    ) -> Result<Box<dyn Prepared>> {
        let (tier, packn) = capability::depthwise(inputs, params, ctx);
        if !tier.is_supported() {
            return Err(rejected(op, inputs));
        }
        let p = params.conv(op)?;
        let xd = logical_dims(inputs[0]);
        let geo = p
            .geometry(xd[2], xd[3])
            .ok_or_else(|| OpError::invalid(op, "kernel does not fit the padded input"))?;
        let shape = DepthwiseShape {
            geo,
            batch: xd[0],
            channels: xd[1],
            packn,
        };
        log::debug!("[vector_depthwise] {} c={} packn={packn} tier={tier}", inputs[0].dtype(), shape.channels);
        Ok(match inputs[0].dtype() {
            DType::F32 => Box::new(FloatPlan::<f32>::new(inputs, shape)?),
            DType::F16 => Box::new(FloatPlan::<half::f16>::new(inputs, shape)?),
            DType::Int8 => Box::new(QuantPlan::new(op, inputs, output, shape)?),
            _ => return Err(rejected(op, inputs)),
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct DepthwiseShape {
    geo: ConvGeometry,
    batch: usize,
    channels: usize,
    packn: usize,
}

impl DepthwiseShape {
    fn blocked_input(&self, x: &Tensor) -> pk_tensor::Result<Tensor> {
        if self.packn > 1 {
            pack(x, self.packn)
        } else {
            unpack(x)
        }
    }

    fn in_item(&self) -> usize {
        self.channels * self.geo.in_size()
    }

    fn out_item(&self) -> usize {
        self.channels * self.geo.out_size()
    }

    fn weights<T: Copy + Default>(&self, values: &[T]) -> pk_tensor::Result<Vec<T>> {
        reorder_weights(values, self.channels, self.geo.maxk(), self.packn)
    }
}

#[derive(Debug)]
struct FloatPlan<T> {
    shape: DepthwiseShape,
    weights: Vec<T>,
    bias: Option<Vec<T>>,
}

impl<T: VecFloat> FloatPlan<T> {
    fn new(inputs: &[&Tensor], shape: DepthwiseShape) -> Result<Self> {
        let weights = shape.weights(&float_values::<T>(inputs[1])?)?;
        let bias = inputs.get(2).map(|b| float_values::<T>(b)).transpose()?;
        Ok(FloatPlan { shape, weights, bias })
    }
}

impl<T: VecFloat> Prepared for FloatPlan<T> {
    fn exec(&self, inputs: &[&Tensor], output: &TensorSpec, ctx: &ExecContext) -> Result<Tensor> {
        let s = &self.shape;
        let x = s.blocked_input(inputs[0])?;
        let src = T::slice(&x)?;
        let mut out = scratch::alloc::<T>(s.batch * s.out_item())?;
        for (item, dst) in src.chunks_exact(s.in_item()).zip(out.chunks_exact_mut(s.out_item())) {
            let padded = padded(item, s.channels, &s.geo, s.packn, T::default())?;
            depthwise(
                &padded,
                &self.weights,
                self.bias.as_deref(),
                dst,
                s.channels,
                &s.geo,
                s.packn,
                ctx.parallel,
            );
        }
        finish_blocked(T::into_storage(out), s.packn, output, inputs[0])
    }
}

#[derive(Debug)]
struct QuantPlan {
    shape: DepthwiseShape,
    weights: Vec<i8>,
    bias: Option<Vec<i32>>,
    quant: DepthwiseQuant,
    pad: i8,
}

impl QuantPlan {
    fn new(op: OpKind, inputs: &[&Tensor], output: &TensorSpec, shape: DepthwiseShape) -> Result<Self> {
        let (x, w) = (inputs[0], inputs[1]);
        let input_zp = x.quant().zero_point;
        let pad = i8::try_from(input_zp)
            .map_err(|_| OpError::invalid(op, format!("input zero point {input_zp} does not fit the stored type")))?;
        let weights = shape.weights(&int8_values(w)?)?;
        let bias = inputs.get(2).map(|b| b.data_i32().map(<[i32]>::to_vec)).transpose()?;
        let quant = DepthwiseQuant {
            input_zp,
            weight_zp: w.qinfo().iter().map(|q| q.zero_point).collect(),
            output_zp: output.quant().zero_point,
            requant: ChannelRequant::resolve(x.quant(), w.qinfo(), output.quant()),
        };
        Ok(QuantPlan {
            shape,
            weights,
            bias,
            quant,
            pad,
        })
    }
}

impl Prepared for QuantPlan {
    fn exec(&self, inputs: &[&Tensor], output: &TensorSpec, ctx: &ExecContext) -> Result<Tensor> {
        let s = &self.shape;
        let x = s.blocked_input(inputs[0])?;
        let src = x.data_i8()?;
        let mut out = scratch::alloc::<i8>(s.batch * s.out_item())?;
        for (item, dst) in src.chunks_exact(s.in_item()).zip(out.chunks_exact_mut(s.out_item())) {
            let padded = padded(item, s.channels, &s.geo, s.packn, self.pad)?;
            depthwise_i8(
                &padded,
                &self.weights,
                self.bias.as_deref(),
                dst,
                s.channels,
                &s.geo,
                s.packn,
                &self.quant,
                ctx.parallel,
            );
        }
        finish_blocked(CpuStorage::I8(out), s.packn, output, inputs[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::Conv2dParams;
    use crate::vector::testing::{random_f32, random_i8, raw_i8, reference, run, values};
    use approx::assert_abs_diff_eq;
    use pk_tensor::{QuantInfo, Shape};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const OP: OpKind = OpKind::DepthwiseConv2d;

    #[test]
    fn test_tail_block_matches_reference() {
        // 12 channels at packn 8: one full block and a tail of 4
        let mut rng = StdRng::seed_from_u64(21);
        let x = random_f32(&mut rng, &[1, 12, 7, 7]);
        let w = random_f32(&mut rng, &[12, 1, 3, 3]);
        let b = random_f32(&mut rng, &[12]);
        let params = OpParams::Conv(Conv2dParams::new(3, 3).with_pad(1).with_groups(12));
        let inputs = [&x, &w, &b];
        let ctx = ExecContext {
            profile: pk_kernels::VectorProfile::new(256),
            ..ExecContext::default()
        };
        assert_eq!(VectorDepthwise.capability(OP, &inputs, &params, &ctx), Tier::Intrinsic);

        let got = run(&VectorDepthwise, OP, &inputs, &params, vec![], &ctx);
        assert!(!got.layout().is_packed());
        let want = reference(OP, &inputs, &params, vec![]);
        for (g, w) in values(&got).iter().zip(&want) {
            assert_abs_diff_eq!(g, w, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_packed_stride_two() {
        let mut rng = StdRng::seed_from_u64(4);
        let x = pack(&random_f32(&mut rng, &[2, 8, 9, 9]), 4).unwrap();
        let w = random_f32(&mut rng, &[8, 1, 3, 3]);
        let params = OpParams::Conv(Conv2dParams::new(3, 3).with_stride(2, 2).with_pad(1).with_groups(8));
        let inputs = [&x, &w];
        let got = run(&VectorDepthwise, OP, &inputs, &params, vec![], &ExecContext::default());
        assert_eq!(got.packn(), 4);
        let want = reference(OP, &inputs, &params, vec![]);
        for (g, w) in values(&got).iter().zip(&want) {
            assert_abs_diff_eq!(g, w, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_int8_per_channel_within_one_step() {
        let mut rng = StdRng::seed_from_u64(8);
        let x = random_i8(&mut rng, &[1, 10, 6, 6], QuantInfo::new(0.04, -2));
        let w_q: Vec<QuantInfo> = (0..10).map(|c| QuantInfo::new(0.01 * (c + 1) as f32, 0)).collect();
        let w = random_i8(&mut rng, &[10, 1, 3, 3], QuantInfo::default()).with_qinfo(w_q);
        let bias = Tensor::from_i32((0..10).map(|c| c * 10 - 40).collect(), Shape::from_slice(&[10])).unwrap();
        let params = OpParams::Conv(Conv2dParams::new(3, 3).with_pad(1).with_groups(10));
        let inputs = [&x, &w, &bias];
        let out_q = vec![QuantInfo::new(0.1, 5)];
        let ctx = ExecContext::default();

        let got = run(&VectorDepthwise, OP, &inputs, &params, out_q.clone(), &ctx);
        let want = run(&crate::reference::ReferenceKernel, OP, &inputs, &params, out_q, &ctx);
        for (g, w) in raw_i8(&got).iter().zip(raw_i8(&want)) {
            assert!((*g as i32 - w as i32).abs() <= 1, "{g} vs {w}");
        }
    }

    #[test]
    fn test_int8_descriptor_checks() {
        let mut rng = StdRng::seed_from_u64(27);
        let params = OpParams::Conv(Conv2dParams::new(3, 3).with_pad(1).with_groups(8));
        let ctx = ExecContext::default();
        let w = random_i8(&mut rng, &[8, 1, 3, 3], QuantInfo::new(0.01, 0));

        let wide_zp = random_i8(&mut rng, &[1, 8, 4, 4], QuantInfo::new(0.04, -300));
        assert_eq!(VectorDepthwise.capability(OP, &[&wide_zp, &w], &params, &ctx), Tier::Reference);

        let x = random_i8(&mut rng, &[1, 8, 4, 4], QuantInfo::new(0.04, 0));
        let short = w.clone().with_qinfo(vec![QuantInfo::new(0.01, 0); 3]);
        assert_eq!(VectorDepthwise.capability(OP, &[&x, &short], &params, &ctx), Tier::Unsupported);
    }

    #[test]
    fn test_unaligned_five_by_five_delegates() {
        let x = Tensor::zeros(Shape::from_slice(&[1, 6, 8, 8]));
        let w = Tensor::zeros(Shape::from_slice(&[6, 1, 5, 5]));
        let params = OpParams::Conv(Conv2dParams::new(5, 5).with_pad(2).with_groups(6));
        let tier = VectorDepthwise.capability(OP, &[&x, &w], &params, &ExecContext::default());
        assert_eq!(tier, Tier::Reference);
    }
}
