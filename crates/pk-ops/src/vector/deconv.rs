//! Transposed convolution as GEMM followed by col2im.
//!
//! `cols[O*kh*kw, H*W] = Wᵀ · x` produces, for every input pixel, its full
//! kernel footprint in every output channel; col2im then scatters the
//! footprints into the (larger) output planes, seeded with the bias.

use pk_kernels::gemm::{gemm_blocked, reorder_a_with, reorder_b_with};
use pk_kernels::im2col::col2im;
use pk_kernels::parallel::try_for_each_chunk;
use pk_kernels::{unpack, ConvGeometry};
use pk_tensor::{scratch, DType, Tensor, TensorSpec};

use crate::error::{OpError, Result};
use crate::infer::logical_dims;
use crate::kernel::{ExecContext, Kernel, Prepared};
use crate::op::{OpKind, OpParams};
use crate::tier::Tier;

use super::{capability, finish, float_values, rejected, VecFloat};

#[derive(Debug, Clone, Copy, Default)]
pub struct VectorDeconv;

impl Kernel for VectorDeconv {
    fn name(&self) -> &'static str {
        "vector_deconv2d"
    }

    fn capability(&self, _op: OpKind, inputs: &[&Tensor], params: &OpParams, _ctx: &ExecContext) -> Tier {
        capability::deconv(inputs, params)
    }

    fn init(
        &self,
        op: OpKind,
        inputs: &[&Tensor],
        params: &OpParams,
        _output: &TensorSpec,
        ctx: &ExecContext,
    ) -> Result<Box<dyn Prepared>> {
        if !capability::deconv(inputs, params).is_supported() {
            return Err(rejected(op, inputs));
        }
        let p = params.conv(op)?;
        let xd = logical_dims(inputs[0]);
        let geo = p
            .deconv_geometry(xd[2], xd[3])
            .ok_or_else(|| OpError::invalid(op, "transposed output would be empty"))?;
        let shape = DeconvShape {
            geo,
            batch: xd[0],
            in_channels: xd[1],
            out_channels: inputs[1].shape().dim(1),
            gemm_packn: ctx.profile.packn(inputs[0].dtype()),
        };
        Ok(match inputs[0].dtype() {
            DType::F32 => Box::new(DeconvPlan::<f32>::new(inputs, shape, ctx)?),
            DType::F16 => Box::new(DeconvPlan::<half::f16>::new(inputs, shape, ctx)?),
            _ => return Err(rejected(op, inputs)),
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct DeconvShape {
    /// Forward geometry: `in_*` is this op's output.
    geo: ConvGeometry,
    batch: usize,
    in_channels: usize,
    out_channels: usize,
    gemm_packn: usize,
}

impl DeconvShape {
    /// GEMM rows: one per output channel and kernel position.
    fn m(&self) -> usize {
        self.out_channels * self.geo.maxk()
    }

    /// GEMM columns: one per input pixel.
    fn n(&self) -> usize {
        self.geo.out_size()
    }

    fn out_item(&self) -> usize {
        self.out_channels * self.geo.in_size()
    }
}

#[derive(Debug)]
struct DeconvPlan<T> {
    shape: DeconvShape,
    weights: Vec<T>,
    bias: Option<Vec<f32>>,
}

impl<T: VecFloat> DeconvPlan<T> {
    fn new(inputs: &[&Tensor], shape: DeconvShape, ctx: &ExecContext) -> Result<Self> {
        let w = float_values::<T>(inputs[1])?;
        let (m, k) = (shape.m(), shape.in_channels);
        let mut weights = scratch::alloc(m * k)?;
        // weights are [Cin, Cout, kh, kw]; A is their transpose
        reorder_a_with(&mut weights, m, k, &ctx.tiling, |r, p| w[p * m + r]);
        let bias = inputs.get(2).map(|b| float_values::<f32>(b)).transpose()?;
        Ok(DeconvPlan { shape, weights, bias })
    }
}

impl<T: VecFloat> Prepared for DeconvPlan<T> {
    fn exec(&self, inputs: &[&Tensor], output: &TensorSpec, ctx: &ExecContext) -> Result<Tensor> {
        let s = &self.shape;
        let x = unpack(inputs[0])?;
        let src = T::slice(&x)?;
        let (m, k, n) = (s.m(), s.in_channels, s.n());
        let tiling = if s.batch > 1 {
            ctx.tiling.with_parallel(false)
        } else {
            ctx.gemm_tiling()
        };
        let mut out = scratch::alloc::<T>(s.batch * s.out_item())?;

        try_for_each_chunk(&mut out, s.out_item(), ctx.parallel, |b, dst| {
            let item = &src[b * k * n..][..k * n];
            let mut sb = scratch::alloc(k * n)?;
            reorder_b_with(&mut sb, k, n, s.gemm_packn, &tiling, |p, j| item[p * n + j]);
            let mut cols = scratch::alloc::<T>(m * n)?;
            gemm_blocked(&mut cols, &self.weights, &sb, None, m, k, n, s.gemm_packn, &tiling);

            let cols: Vec<f32> = cols.iter().map(|v| v.to_f32()).collect();
            let mut image = scratch::alloc::<f32>(s.out_item())?;
            col2im(&cols, self.bias.as_deref(), 0.0, &mut image, s.out_channels, &s.geo);
            for (d, v) in dst.iter_mut().zip(&image) {
                *d = T::from_f32(*v);
            }
            Ok(())
        })?;
        finish(T::into_storage(out), output, inputs[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::Conv2dParams;
    use crate::vector::testing::{random_f32, reference, run, values};
    use approx::assert_abs_diff_eq;
    use pk_tensor::Shape;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_strided_deconv_matches_reference() {
        let mut rng = StdRng::seed_from_u64(17);
        let x = random_f32(&mut rng, &[2, 3, 4, 5]);
        let w = random_f32(&mut rng, &[3, 4, 3, 3]);
        let b = random_f32(&mut rng, &[4]);
        let p = Conv2dParams::new(3, 3).with_stride(2, 2).with_pad(1).with_output_pad(1, 1);
        let params = OpParams::Conv(p);
        let inputs = [&x, &w, &b];
        let got = run(&VectorDeconv, OpKind::Deconv2d, &inputs, &params, vec![], &ExecContext::default());
        assert_eq!(got.shape().dims(), &[2, 4, 8, 10]);
        let want = reference(OpKind::Deconv2d, &inputs, &params, vec![]);
        for (g, w) in values(&got).iter().zip(&want) {
            assert_abs_diff_eq!(g, w, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_single_pixel_scatters_kernel() {
        let x = Tensor::ones(Shape::from_slice(&[1, 1, 1, 1]));
        let w = Tensor::new((1..=4).map(|v| v as f32).collect(), Shape::from_slice(&[1, 1, 2, 2]));
        let params = OpParams::Conv(Conv2dParams::new(2, 2));
        let got = run(&VectorDeconv, OpKind::Deconv2d, &[&x, &w], &params, vec![], &ExecContext::default());
        assert_eq!(got.data_f32().unwrap(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_grouped_deconv_delegates() {
        let x = Tensor::zeros(Shape::from_slice(&[1, 4, 3, 3]));
        let w = Tensor::zeros(Shape::from_slice(&[4, 1, 3, 3]));
        let params = OpParams::Conv(Conv2dParams::new(3, 3).with_groups(2));
        let tier = VectorDeconv.capability(OpKind::Deconv2d, &[&x, &w], &params, &ExecContext::default());
        assert_eq!(tier, Tier::Reference);
    }
}
