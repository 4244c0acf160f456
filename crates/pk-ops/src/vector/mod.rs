//! Vector backend: packed layouts, blocked GEMM and requantizing kernels.
//!
//! | op                    | f32 | f16 | int8 | int4 |
//! |-----------------------|-----|-----|------|------|
//! | conv2d, group conv2d  |  ✓  |  ✓  |  ✓   | dot  |
//! | depthwise conv2d      |  ✓  |  ✓  |  ✓   |      |
//! | deconv2d              |  ✓  |  ✓  |      |      |
//! | fully connected       |  ✓  |  ✓  |  ✓   |      |
//! | matmul                |  ✓  |  ✓  |  ✓   |      |
//! | max/avg/global pool   |  ✓  |  ✓  |  ✓   |      |
//! | add, sub, mul, relu   |  ✓  |  ✓  |  ✓   |      |
//!
//! Pairs without a row, and operands a row's capability cascade rejects,
//! run on the reference backend.

mod capability;
mod columns;
mod conv;
mod deconv;
mod depthwise;
mod elementwise;
mod fc;
mod matmul;
mod pool;

use std::sync::Arc;

use half::f16;

use pk_kernels::gemm::mixed::dequantize_rows;
use pk_kernels::pool::PoolElement;
use pk_kernels::{FloatElement, GemmElement};
use pk_tensor::{CpuStorage, DType, Result as TensorResult, Tensor};

use crate::error::{OpError, Result};
use crate::kernel::Kernel;
use crate::op::OpKind;
use crate::registry::Registry;

pub use conv::VectorConv;
pub use deconv::VectorDeconv;
pub use depthwise::VectorDepthwise;
pub use elementwise::VectorElementwise;
pub use fc::VectorFullyConnected;
pub use matmul::VectorMatMul;
pub use pool::VectorPool;

use DType::{Int4, Int8, F16, F32};

const FLOAT_INT8: &[DType] = &[F32, F16, Int8];

/// Which dtypes each op has a vector row for.
const DISPATCH: &[(OpKind, &[DType])] = &[
    (OpKind::Conv2d, &[F32, F16, Int8, Int4]),
    (OpKind::GroupConv2d, &[F32, F16, Int8, Int4]),
    (OpKind::DepthwiseConv2d, FLOAT_INT8),
    (OpKind::Deconv2d, &[F32, F16]),
    (OpKind::FullyConnected, FLOAT_INT8),
    (OpKind::MatMul, FLOAT_INT8),
    (OpKind::MaxPool2d, FLOAT_INT8),
    (OpKind::AvgPool2d, FLOAT_INT8),
    (OpKind::GlobalAvgPool2d, FLOAT_INT8),
    (OpKind::Add, FLOAT_INT8),
    (OpKind::Sub, FLOAT_INT8),
    (OpKind::Mul, FLOAT_INT8),
    (OpKind::Relu, FLOAT_INT8),
];

/// Register every vector row.
pub fn register(registry: &mut Registry) -> Result<()> {
    let conv: Arc<dyn Kernel> = Arc::new(VectorConv);
    let depthwise: Arc<dyn Kernel> = Arc::new(VectorDepthwise);
    let deconv: Arc<dyn Kernel> = Arc::new(VectorDeconv);
    let fc: Arc<dyn Kernel> = Arc::new(VectorFullyConnected);
    let matmul: Arc<dyn Kernel> = Arc::new(VectorMatMul);
    let pool: Arc<dyn Kernel> = Arc::new(VectorPool);
    let elementwise: Arc<dyn Kernel> = Arc::new(VectorElementwise);

    for &(op, dtypes) in DISPATCH {
        let kernel = match op {
            OpKind::Conv2d | OpKind::GroupConv2d => &conv,
            OpKind::DepthwiseConv2d => &depthwise,
            OpKind::Deconv2d => &deconv,
            OpKind::FullyConnected => &fc,
            OpKind::MatMul => &matmul,
            OpKind::MaxPool2d | OpKind::AvgPool2d | OpKind::GlobalAvgPool2d => &pool,
            OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Relu => &elementwise,
        };
        for &dtype in dtypes {
            registry.register(op, dtype, Arc::clone(kernel))?;
        }
    }
    Ok(())
}

/// Float element types with a vector path.
pub(crate) trait VecFloat: FloatElement + GemmElement<Out = Self> + PoolElement + std::fmt::Debug {
    const DTYPE: DType;

    fn slice(t: &Tensor) -> TensorResult<&[Self]>;
    fn into_storage(v: Vec<Self>) -> CpuStorage;
}

impl VecFloat for f32 {
    const DTYPE: DType = F32;

    fn slice(t: &Tensor) -> TensorResult<&[f32]> {
        t.data_f32()
    }

    fn into_storage(v: Vec<f32>) -> CpuStorage {
        CpuStorage::F32(v)
    }
}

impl VecFloat for f16 {
    const DTYPE: DType = F16;

    fn slice(t: &Tensor) -> TensorResult<&[f16]> {
        t.data_f16()
    }

    fn into_storage(v: Vec<f16>) -> CpuStorage {
        CpuStorage::F16(v)
    }
}

/// Canonical values of a constant operand as `T`.
///
/// Int8 weights under float activations are dequantized row by row (one
/// row per output channel), the mixed-precision path for constant weights.
pub(crate) fn float_values<T: VecFloat>(t: &Tensor) -> Result<Vec<T>> {
    let t = pk_kernels::unpack(t)?;
    if t.dtype() == T::DTYPE {
        return Ok(T::slice(&t)?.to_vec());
    }
    let values = if t.dtype() == Int8 {
        let rows = t.batch().max(1);
        let k = t.numel() / rows;
        dequantize_rows(t.data_i8()?, rows, k, t.qinfo())?
    } else {
        crate::convert::to_f32(&t, 0)?
    };
    Ok(values.into_iter().map(T::from_f32).collect())
}

/// Canonical int8 values of a tensor; int4 values are widened.
pub(crate) fn int8_values(t: &Tensor) -> Result<Vec<i8>> {
    let t = pk_kernels::unpack(t)?;
    Ok(match t.storage() {
        CpuStorage::I8(v) => v.clone(),
        s @ CpuStorage::I4 { .. } => s.to_i4_values()?,
        other => {
            return Err(pk_tensor::TensorError::DTypeMismatch {
                expected: "int8 or int4".to_string(),
                got: other.dtype().to_string(),
            }
            .into())
        }
    })
}

/// Error for an `init` the row's own capability check rejects.
pub(crate) fn rejected(op: OpKind, inputs: &[&Tensor]) -> OpError {
    OpError::NoKernel {
        op,
        dtype: inputs.first().map_or(F32, |t| t.dtype()),
    }
}

/// Build an output tensor from canonical storage, packed like `like`.
pub(crate) fn finish(
    storage: CpuStorage,
    output: &pk_tensor::TensorSpec,
    like: &Tensor,
) -> Result<Tensor> {
    let out = Tensor::from_storage(storage, output.shape.clone(), output.layout)?
        .with_qinfo(output.qinfo.clone());
    crate::convert::match_layout(out, like)
}

/// Wrap storage blocked at `packn` (shaped like the canonical `output`)
/// and unpack it again when `like` was canonical.
pub(crate) fn finish_blocked(
    storage: CpuStorage,
    packn: usize,
    output: &pk_tensor::TensorSpec,
    like: &Tensor,
) -> Result<Tensor> {
    if packn <= 1 {
        return finish(storage, output, like);
    }
    let dims = output.shape.dims();
    let layout = output
        .layout
        .packed()
        .ok_or_else(|| OpError::Other(format!("{} has no packed form", output.layout)))?;
    let shape = pk_tensor::Shape::blocked(dims[0], dims[1], &dims[2..], packn);
    let out = Tensor::from_parts(storage, shape, layout, dims[1] % packn)?
        .with_qinfo(output.qinfo.clone());
    if like.layout().is_packed() {
        Ok(out)
    } else {
        Ok(pk_kernels::unpack(&out)?)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use pk_tensor::{QuantInfo, Shape};
    use rand::rngs::StdRng;
    use rand::Rng;

    use super::*;
    use crate::infer::output_spec;
    use crate::kernel::ExecContext;
    use crate::op::OpParams;
    use crate::reference::ReferenceKernel;

    pub(crate) fn random_f32(rng: &mut StdRng, dims: &[usize]) -> Tensor {
        let n = dims.iter().product();
        let data = (0..n).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
        Tensor::new(data, Shape::from_slice(dims))
    }

    pub(crate) fn random_i8(rng: &mut StdRng, dims: &[usize], q: QuantInfo) -> Tensor {
        let n = dims.iter().product();
        let data = (0..n).map(|_| rng.gen_range(-100i8..100)).collect();
        Tensor::from_i8(data, Shape::from_slice(dims), vec![q]).unwrap()
    }

    /// Resolve nothing: init and exec `kernel` directly.
    pub(crate) fn run(
        kernel: &dyn Kernel,
        op: OpKind,
        inputs: &[&Tensor],
        params: &OpParams,
        qinfo: Vec<QuantInfo>,
        ctx: &ExecContext,
    ) -> Tensor {
        let spec = output_spec(op, inputs, params, qinfo).unwrap();
        let plan = kernel.init(op, inputs, params, &spec, ctx).unwrap();
        plan.exec(inputs, &spec, ctx).unwrap()
    }

    /// Reference output in canonical f32.
    pub(crate) fn reference(
        op: OpKind,
        inputs: &[&Tensor],
        params: &OpParams,
        qinfo: Vec<QuantInfo>,
    ) -> Vec<f32> {
        let out = run(&ReferenceKernel, op, inputs, params, qinfo, &ExecContext::default());
        crate::convert::to_f32(&out, 1).unwrap()
    }

    /// Canonical f32 values, for comparing outputs of any dtype.
    pub(crate) fn values(t: &Tensor) -> Vec<f32> {
        crate::convert::to_f32(t, 1).unwrap()
    }

    /// Raw quantized values, canonical order.
    pub(crate) fn raw_i8(t: &Tensor) -> Vec<i8> {
        int8_values(t).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_all_rows() {
        let mut registry = Registry::new();
        register(&mut registry).unwrap();
        assert!(registry.contains(OpKind::Conv2d, Int4));
        assert!(!registry.contains(OpKind::Deconv2d, Int8));
        assert!(!registry.contains(OpKind::MatMul, DType::Int32));
        assert_eq!(registry.len(), DISPATCH.iter().map(|(_, d)| d.len()).sum::<usize>());
        // a second registration of the same backend collides
        assert!(register(&mut registry).is_err());
    }
}
