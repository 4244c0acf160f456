//! Add, sub, mul and relu on canonical or packed operands.
//!
//! A packed left operand keeps its layout: the right operand is packed to
//! match (or relabelled with a block width of one when it has a single
//! channel) and both are walked through broadcast strides over their
//! physical shapes.

use pk_kernels::elementwise::{binary_float, binary_i8, relu, relu_i8};
use pk_kernels::{try_pack_broadcast, unpack, BinaryOp};
use pk_tensor::{scratch, CpuStorage, DType, Shape, Tensor, TensorSpec};

use crate::error::{OpError, Result};
use crate::infer::logical_dims;
use crate::kernel::{ExecContext, Kernel, Prepared};
use crate::op::{OpKind, OpParams};
use crate::tier::Tier;

use super::{capability, finish, rejected, VecFloat};

#[derive(Debug, Clone, Copy, Default)]
pub struct VectorElementwise;

impl Kernel for VectorElementwise {
    fn name(&self) -> &'static str {
        "vector_elementwise"
    }

    fn capability(&self, op: OpKind, inputs: &[&Tensor], params: &OpParams, _ctx: &ExecContext) -> Tier {
        capability::elementwise(op, inputs, params)
    }

    fn init(
        &self,
        op: OpKind,
        inputs: &[&Tensor],
        params: &OpParams,
        _output: &TensorSpec,
        _ctx: &ExecContext,
    ) -> Result<Box<dyn Prepared>> {
        if !capability::elementwise(op, inputs, params).is_supported() {
            return Err(rejected(op, inputs));
        }
        let kind = match op {
            OpKind::Add => Some(BinaryOp::Add),
            OpKind::Sub => Some(BinaryOp::Sub),
            OpKind::Mul => Some(BinaryOp::Mul),
            OpKind::Relu => None,
            _ => return Err(rejected(op, inputs)),
        };
        Ok(Box::new(ElementwisePlan { op, kind }))
    }
}

#[derive(Debug)]
struct ElementwisePlan {
    op: OpKind,
    /// `None` for relu.
    kind: Option<BinaryOp>,
}

/// Operands and shapes one binary kernel call walks.
struct Operands {
    a: Tensor,
    b: Tensor,
    a_dims: Vec<usize>,
    b_dims: Vec<usize>,
    out_dims: Vec<usize>,
    /// Output keeps `a`'s packed layout.
    packed: bool,
}

impl ElementwisePlan {
    fn operands(&self, a: &Tensor, b: &Tensor, output: &TensorSpec) -> Result<Operands> {
        let same_rank = logical_dims(b).len() == logical_dims(a).len();
        if a.layout().is_packed() && same_rank {
            let b = try_pack_broadcast(b, a.packn()).map_err(|e| {
                log::error!("[vector_elementwise] {}: cannot pack {:?} against {:?}: {e}", self.op, b.shape(), a.shape());
                self.broadcast_error()
            })?;
            let fits = Shape::broadcast_shape(a.shape(), b.shape()).is_ok_and(|s| s == *a.shape());
            if !fits {
                log::error!("[vector_elementwise] {}: {:?} does not broadcast to {:?}", self.op, b.shape(), a.shape());
                return Err(self.broadcast_error());
            }
            return Ok(Operands {
                a_dims: a.shape().dims().to_vec(),
                b_dims: b.shape().dims().to_vec(),
                out_dims: a.shape().dims().to_vec(),
                a: a.clone(),
                b,
                packed: true,
            });
        }
        let (a, b) = (unpack(a)?, unpack(b)?);
        Ok(Operands {
            a_dims: a.shape().dims().to_vec(),
            b_dims: b.shape().dims().to_vec(),
            out_dims: output.shape.dims().to_vec(),
            a,
            b,
            packed: false,
        })
    }

    fn broadcast_error(&self) -> OpError {
        OpError::UnsupportedBroadcast {
            op: self.op,
            detail: "dimension do not meet the rules of broadcast".to_string(),
        }
    }

    fn binary<T: VecFloat>(&self, op: BinaryOp, o: &Operands) -> Result<CpuStorage> {
        let mut out = scratch::alloc::<T>(o.out_dims.iter().product())?;
        binary_float(op, T::slice(&o.a)?, &o.a_dims, T::slice(&o.b)?, &o.b_dims, &mut out, &o.out_dims);
        Ok(T::into_storage(out))
    }

    fn relu<T: VecFloat>(x: &Tensor) -> Result<CpuStorage> {
        let src = T::slice(x)?;
        let mut out = scratch::alloc::<T>(src.len())?;
        relu(src, &mut out);
        Ok(T::into_storage(out))
    }
}

/// Output with `like`'s physical shape and layout.
fn same_layout(storage: CpuStorage, like: &Tensor, output: &TensorSpec) -> Result<Tensor> {
    let t = Tensor::from_parts(storage, like.shape().clone(), like.layout(), like.channel_tail())?;
    Ok(t.with_qinfo(output.qinfo.clone()))
}

impl Prepared for ElementwisePlan {
    fn exec(&self, inputs: &[&Tensor], output: &TensorSpec, _ctx: &ExecContext) -> Result<Tensor> {
        let x = inputs[0];
        let Some(op) = self.kind else {
            let storage = match x.dtype() {
                DType::F32 => Self::relu::<f32>(x)?,
                DType::F16 => Self::relu::<half::f16>(x)?,
                DType::Int8 => {
                    let src = x.data_i8()?;
                    let mut out = scratch::alloc::<i8>(src.len())?;
                    relu_i8(src, &mut out, x.quant(), output.quant());
                    CpuStorage::I8(out)
                }
                other => return Err(OpError::NoKernel { op: self.op, dtype: other }),
            };
            return same_layout(storage, x, output);
        };

        let o = self.operands(x, inputs[1], output)?;
        let storage = match x.dtype() {
            DType::F32 => self.binary::<f32>(op, &o)?,
            DType::F16 => self.binary::<half::f16>(op, &o)?,
            DType::Int8 => {
                let mut out = scratch::alloc::<i8>(o.out_dims.iter().product())?;
                binary_i8(
                    op,
                    o.a.data_i8()?,
                    &o.a_dims,
                    o.a.quant(),
                    o.b.data_i8()?,
                    &o.b_dims,
                    o.b.quant(),
                    &mut out,
                    &o.out_dims,
                    output.quant(),
                );
                CpuStorage::I8(out)
            }
            other => return Err(OpError::NoKernel { op: self.op, dtype: other }),
        };
        if o.packed {
            same_layout(storage, x, output)
        } else {
            finish(storage, output, x)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::testing::{random_f32, random_i8, raw_i8, reference, run, values};
    use approx::assert_abs_diff_eq;
    use pk_kernels::pack;
    use pk_tensor::QuantInfo;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn check(op: OpKind, a: &Tensor, b: &Tensor) -> Tensor {
        let got = run(&VectorElementwise, op, &[a, b], &OpParams::None, vec![], &ExecContext::default());
        let want = reference(op, &[a, b], &OpParams::None, vec![]);
        for (g, w) in values(&got).iter().zip(&want) {
            assert_abs_diff_eq!(g, w, epsilon = 1e-6);
        }
        got
    }

    #[test]
    fn test_canonical_broadcast() {
        let mut rng = StdRng::seed_from_u64(61);
        let a = random_f32(&mut rng, &[2, 3, 4, 5]);
        check(OpKind::Add, &a, &random_f32(&mut rng, &[2, 3, 4, 5]));
        check(OpKind::Sub, &a, &random_f32(&mut rng, &[1, 3, 1, 1]));
        check(OpKind::Mul, &a, &random_f32(&mut rng, &[5]));
    }

    #[test]
    fn test_packed_operand_stays_packed() {
        let mut rng = StdRng::seed_from_u64(62);
        let a = pack(&random_f32(&mut rng, &[1, 8, 3, 3]), 4).unwrap();
        // per-channel operand packs alongside
        let out = check(OpKind::Add, &a, &random_f32(&mut rng, &[1, 8, 1, 1]));
        assert_eq!(out.packn(), 4);
        // single-channel operand is relabelled, not packed
        let out = check(OpKind::Mul, &a, &random_f32(&mut rng, &[1, 1, 3, 3]));
        assert_eq!(out.packn(), 4);
    }

    #[test]
    fn test_unpackable_operand_is_rejected() {
        let mut rng = StdRng::seed_from_u64(63);
        let a = pack(&random_f32(&mut rng, &[1, 8, 3, 3]), 4).unwrap();
        let b = random_f32(&mut rng, &[1, 2, 3, 3]);
        let plan = VectorElementwise
            .init(
                OpKind::Add,
                &[&a, &a],
                &OpParams::None,
                &TensorSpec::new(DType::F32, Shape::from_slice(&[1, 8, 3, 3]), pk_tensor::Layout::NCHW),
                &ExecContext::default(),
            )
            .unwrap();
        let spec = TensorSpec::new(DType::F32, Shape::from_slice(&[1, 8, 3, 3]), pk_tensor::Layout::NCHW);
        let err = plan.exec(&[&a, &b], &spec, &ExecContext::default()).unwrap_err();
        assert!(matches!(err, OpError::UnsupportedBroadcast { .. }));
        assert!(err.to_string().contains("dimension do not meet the rules of broadcast"));
    }

    #[test]
    fn test_relu_keeps_layout() {
        let mut rng = StdRng::seed_from_u64(64);
        let x = pack(&random_f32(&mut rng, &[1, 6, 2, 2]), 4).unwrap();
        let out = run(&VectorElementwise, OpKind::Relu, &[&x], &OpParams::None, vec![], &ExecContext::default());
        assert_eq!(out.channel_tail(), 2);
        assert!(values(&out).iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn test_int8_add_and_relu() {
        let mut rng = StdRng::seed_from_u64(65);
        let a = random_i8(&mut rng, &[1, 4, 3, 3], QuantInfo::new(0.05, 2));
        let b = random_i8(&mut rng, &[1, 4, 3, 3], QuantInfo::new(0.02, -6));
        let qo = vec![QuantInfo::new(0.08, 0)];
        let ctx = ExecContext::default();
        let got = run(&VectorElementwise, OpKind::Add, &[&a, &b], &OpParams::None, qo.clone(), &ctx);
        let want = run(&crate::reference::ReferenceKernel, OpKind::Add, &[&a, &b], &OpParams::None, qo, &ctx);
        assert_eq!(raw_i8(&got), raw_i8(&want));

        let out = run(&VectorElementwise, OpKind::Relu, &[&a], &OpParams::None, a.qinfo().to_vec(), &ctx);
        assert!(raw_i8(&out).iter().all(|&v| v >= 2));
    }
}
