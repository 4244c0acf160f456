//! Fully connected layer: `y[N, O] = x[N, K] · W[O, K]ᵀ + b`.
//!
//! The weights are the constant left operand, reordered once; the batch
//! rows of `x` become the GEMM columns and the `[O, N]` result is
//! transposed on the way out.

use pk_kernels::gemm::int8::{requantize_rows, Int8Path};
use pk_kernels::gemm::mixed::QuantizedLhs;
use pk_kernels::gemm::{gemm_blocked, reorder_a_with, reorder_b_with};
use pk_kernels::{unpack, ChannelRequant};
use pk_tensor::{scratch, CpuStorage, DType, Tensor, TensorSpec};

use crate::error::Result;
use crate::kernel::{ExecContext, Kernel, Prepared};
use crate::op::{OpKind, OpParams};
use crate::tier::Tier;

use super::{capability, finish, float_values, int8_values, rejected, VecFloat};

#[derive(Debug, Clone, Copy, Default)]
pub struct VectorFullyConnected;

impl Kernel for VectorFullyConnected {
    fn name(&self) -> &'static str {
        "vector_fullyconnected"
    }

    fn capability(&self, _op: OpKind, inputs: &[&Tensor], params: &OpParams, _ctx: &ExecContext) -> Tier {
        capability::fully_connected(inputs, params)
    }

    fn init(
        &self,
        op: OpKind,
        inputs: &[&Tensor],
        params: &OpParams,
        output: &TensorSpec,
        ctx: &ExecContext,
    ) -> Result<Box<dyn Prepared>> {
        if !capability::fully_connected(inputs, params).is_supported() {
            return Err(rejected(op, inputs));
        }
        let dims = Dims {
            out_features: output.shape.dim(1),
            in_features: inputs[1].shape().dim(1),
            packn: ctx.profile.packn(inputs[0].dtype()),
        };
        Ok(match inputs[0].dtype() {
            DType::F32 => Box::new(FloatPlan::<f32>::new(inputs, dims, ctx)?),
            DType::F16 => Box::new(FloatPlan::<half::f16>::new(inputs, dims, ctx)?),
            DType::Int8 => Box::new(QuantPlan::new(inputs, output, dims, ctx)?),
            _ => return Err(rejected(op, inputs)),
        })
    }

    fn prepack(
        &self,
        _op: OpKind,
        inputs: &[&Tensor],
        params: &OpParams,
        ctx: &ExecContext,
    ) -> Result<Option<Tensor>> {
        if !capability::fully_connected(inputs, params).is_accelerated() || !takes_prepacked(inputs) {
            return Ok(None);
        }
        let w = inputs[1];
        let (o, k) = (w.shape().dim(0), w.shape().dim(1));
        let storage = match w.dtype() {
            DType::F32 => f32::into_storage(reorder_weights(&float_values::<f32>(w)?, o, k, ctx)?),
            DType::F16 => half::f16::into_storage(reorder_weights(&float_values::<half::f16>(w)?, o, k, ctx)?),
            _ => return Ok(None),
        };
        Ok(Some(Tensor::from_storage(storage, w.shape().clone(), w.layout())?.into_const()))
    }
}

fn takes_prepacked(inputs: &[&Tensor]) -> bool {
    inputs[0].dtype().is_float() && inputs[1].dtype() == inputs[0].dtype()
}

fn reorder_weights<T: VecFloat>(w: &[T], o: usize, k: usize, ctx: &ExecContext) -> Result<Vec<T>> {
    let mut sa = scratch::alloc(o * k)?;
    reorder_a_with(&mut sa, o, k, &ctx.tiling, |r, p| w[r * k + p]);
    Ok(sa)
}

#[derive(Debug, Clone, Copy)]
struct Dims {
    out_features: usize,
    in_features: usize,
    packn: usize,
}

/// `[O, N]` to `[N, O]`.
fn transpose_into<T: Copy>(src: &[T], dst: &mut [T], o: usize, n: usize) {
    for r in 0..o {
        for j in 0..n {
            dst[j * o + r] = src[r * n + j];
        }
    }
}

#[derive(Debug)]
struct FloatPlan<T> {
    dims: Dims,
    weights: Vec<T>,
    bias: Option<Vec<T>>,
}

impl<T: VecFloat> FloatPlan<T> {
    fn new(inputs: &[&Tensor], dims: Dims, ctx: &ExecContext) -> Result<Self> {
        let (o, k) = (dims.out_features, dims.in_features);
        let weights = if ctx.prepacked && takes_prepacked(inputs) {
            T::slice(inputs[1])?.to_vec()
        } else {
            reorder_weights(&float_values::<T>(inputs[1])?, o, k, ctx)?
        };
        let bias = inputs.get(2).map(|b| float_values::<T>(b)).transpose()?;
        Ok(FloatPlan { dims, weights, bias })
    }
}

impl<T: VecFloat> Prepared for FloatPlan<T> {
    fn exec(&self, inputs: &[&Tensor], output: &TensorSpec, ctx: &ExecContext) -> Result<Tensor> {
        let Dims {
            out_features: o,
            in_features: k,
            packn,
        } = self.dims;
        let x = unpack(inputs[0])?;
        let src = T::slice(&x)?;
        let n = src.len() / k;
        let tiling = ctx.gemm_tiling();

        let mut sb = scratch::alloc(k * n)?;
        reorder_b_with(&mut sb, k, n, packn, &tiling, |p, j| src[j * k + p]);
        let mut acc = scratch::alloc::<T>(o * n)?;
        gemm_blocked(&mut acc, &self.weights, &sb, self.bias.as_deref(), o, k, n, packn, &tiling);

        let mut out = scratch::alloc::<T>(n * o)?;
        transpose_into(&acc, &mut out, o, n);
        finish(T::into_storage(out), output, &x)
    }
}

#[derive(Debug)]
struct QuantPlan {
    dims: Dims,
    lhs: QuantizedLhs,
    folded: Vec<i32>,
    requant: ChannelRequant,
}

impl QuantPlan {
    fn new(inputs: &[&Tensor], output: &TensorSpec, dims: Dims, ctx: &ExecContext) -> Result<Self> {
        let (x, w) = (inputs[0], inputs[1]);
        let zero_points = w.qinfo().iter().map(|q| q.zero_point).collect();
        let path = Int8Path::for_profile(&ctx.profile);
        let lhs = QuantizedLhs::prepare(&int8_values(w)?, dims.out_features, dims.in_features, zero_points, path)?;
        let bias = inputs.get(2).map(|b| b.data_i32()).transpose()?;
        let folded = lhs.folded_bias(bias, x.quant().zero_point);
        Ok(QuantPlan {
            dims,
            lhs,
            folded,
            requant: ChannelRequant::resolve(x.quant(), w.qinfo(), output.quant()),
        })
    }
}

impl Prepared for QuantPlan {
    fn exec(&self, inputs: &[&Tensor], output: &TensorSpec, _ctx: &ExecContext) -> Result<Tensor> {
        let Dims {
            out_features: o,
            in_features: k,
            packn,
        } = self.dims;
        let x = unpack(inputs[0])?;
        let src = x.data_i8()?;
        let n = src.len() / k;
        let path = self.lhs.path;

        let mut sb = scratch::alloc(n * path.reduction_len(k))?;
        path.reorder_b_with(&mut sb, k, n, packn, |p, j| src[j * k + p]);
        let col_sums: Vec<i32> = src
            .chunks_exact(k)
            .map(|row| row.iter().map(|&v| v as i32).sum())
            .collect();
        let mut acc = scratch::alloc::<i32>(o * n)?;
        self.lhs.gemm(&mut acc, &sb, n, packn, &self.folded, &col_sums);

        let mut rows = scratch::alloc::<i8>(o * n)?;
        requantize_rows(&acc, &mut rows, n, None, &self.requant, 0, output.quant().zero_point);
        let mut out = scratch::alloc::<i8>(n * o)?;
        transpose_into(&rows, &mut out, o, n);
        finish(CpuStorage::I8(out), output, &x)
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

    const OP: OpKind = OpKind::FullyConnected;

    #[test]
    fn test_flattened_input_matches_reference() {
        let mut rng = StdRng::seed_from_u64(31);
        let x = random_f32(&mut rng, &[3, 2, 2, 5]);
        let w = random_f32(&mut rng, &[7, 20]);
        let b = random_f32(&mut rng, &[7]);
        let inputs = [&x, &w, &b];
        let got = run(&VectorFullyConnected, OP, &inputs, &OpParams::None, vec![], &ExecContext::default());
        assert_eq!(got.shape().dims(), &[3, 7]);
        let want = reference(OP, &inputs, &OpParams::None, vec![]);
        for (g, w) in values(&got).iter().zip(&want) {
            assert_abs_diff_eq!(g, w, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_prepacked_weights() {
        let mut rng = StdRng::seed_from_u64(2);
        let x = random_f32(&mut rng, &[4, 33]);
        let w = random_f32(&mut rng, &[9, 33]);
        let ctx = ExecContext::default();
        let plain = run(&VectorFullyConnected, OP, &[&x, &w], &OpParams::None, vec![], &ctx);
        let packed = VectorFullyConnected
            .prepack(OP, &[&x, &w], &OpParams::None, &ctx)
            .unwrap()
            .unwrap();
        let ctx = ExecContext {
            prepacked: true,
            ..ctx
        };
        let out = run(&VectorFullyConnected, OP, &[&x, &packed], &OpParams::None, vec![], &ctx);
        assert_eq!(plain.data_f32().unwrap(), out.data_f32().unwrap());
    }

    #[test]
    fn test_int8_with_zero_points() {
        let mut rng = StdRng::seed_from_u64(6);
        let x = random_i8(&mut rng, &[5, 24], QuantInfo::new(0.02, 7));
        let w = random_i8(&mut rng, &[6, 24], QuantInfo::new(0.03, -3));
        let bias = Tensor::from_i32(vec![10, 0, -10, 300, 5, -1], Shape::from_slice(&[6])).unwrap();
        let inputs = [&x, &w, &bias];
        let out_q = vec![QuantInfo::new(0.05, 1)];
        let ctx = ExecContext::default();
        let got = run(&VectorFullyConnected, OP, &inputs, &OpParams::None, out_q.clone(), &ctx);
        let want = run(&crate::reference::ReferenceKernel, OP, &inputs, &OpParams::None, out_q, &ctx);
        for (g, w) in raw_i8(&got).iter().zip(raw_i8(&want)) {
            assert!((*g as i32 - w as i32).abs() <= 1, "{g} vs {w}");
        }
    }
}
