//! Conversions between stored tensors and the f32 domain.

use half::f16;

use pk_kernels::quant::{dequantize, quantize, quantize_i4};
use pk_tensor::{CpuStorage, DType, QuantInfo, Tensor, TensorSpec};

use crate::error::Result;

/// Quant entry of channel `c`, or the shared one.
#[inline]
pub(crate) fn entry(qinfo: &[QuantInfo], c: usize) -> QuantInfo {
    match qinfo.len() {
        0 => QuantInfo::default(),
        1 => qinfo[0],
        _ => qinfo.get(c).copied().unwrap_or_default(),
    }
}

/// Canonical f32 values of `t`. Channel-quantized tensors select their
/// entry along `channel_axis` of the logical shape.
pub(crate) fn to_f32(t: &Tensor, channel_axis: usize) -> Result<Vec<f32>> {
    let t = pk_kernels::unpack(t)?;
    let dims = t.shape().dims();
    let axis_len = dims.get(channel_axis).copied().unwrap_or(1).max(1);
    let inner: usize = dims.iter().skip(channel_axis + 1).product();
    let inner = inner.max(1);
    let qinfo = t.qinfo();
    let deq = |i: usize, q: i32| {
        let e = entry(qinfo, (i / inner) % axis_len);
        dequantize(q, e.zero_point, e.scale)
    };
    Ok(match t.storage() {
        CpuStorage::F32(v) => v.clone(),
        CpuStorage::F16(v) => v.iter().map(|x| x.to_f32()).collect(),
        CpuStorage::I8(v) => v.iter().enumerate().map(|(i, &q)| deq(i, q as i32)).collect(),
        CpuStorage::I32(v) => v.iter().enumerate().map(|(i, &q)| deq(i, q)).collect(),
        s @ CpuStorage::I4 { .. } => s
            .to_i4_values()?
            .into_iter()
            .enumerate()
            .map(|(i, q)| deq(i, q as i32))
            .collect(),
    })
}

/// Real-valued bias. An int32 bias of a quantized op carries the scale
/// `input_scale * weight_scale[c]`.
pub(crate) fn bias_to_f32(bias: &Tensor, input: &Tensor, weight: &Tensor) -> Result<Vec<f32>> {
    if bias.dtype() != DType::Int32 || !input.dtype().is_quantized() {
        return to_f32(bias, 0);
    }
    let in_scale = input.quant().scale;
    let values = bias.data_i32()?;
    Ok(values
        .iter()
        .enumerate()
        .map(|(c, &v)| v as f32 * in_scale * weight.qinfo_for_channel(c).scale)
        .collect())
}

/// Store f32 values as a tensor described by `spec`, quantizing with the
/// per-tensor entry for integer dtypes.
pub(crate) fn from_f32(values: &[f32], spec: &TensorSpec) -> Result<Tensor> {
    let q = spec.quant();
    let storage = match spec.dtype {
        DType::F32 => CpuStorage::F32(values.to_vec()),
        DType::F16 => CpuStorage::F16(values.iter().map(|&v| f16::from_f32(v)).collect()),
        DType::Int8 => CpuStorage::I8(values.iter().map(|&v| quantize(v, q.scale, q.zero_point)).collect()),
        DType::Int4 => CpuStorage::from_i4_values(
            &values
                .iter()
                .map(|&v| quantize_i4(v, q.scale, q.zero_point))
                .collect::<Vec<_>>(),
        ),
        DType::Int32 => CpuStorage::I32(values.iter().map(|&v| v.round() as i32).collect()),
    };
    Ok(Tensor::from_storage(storage, spec.shape.clone(), spec.layout)?.with_qinfo(spec.qinfo.clone()))
}

/// Give a canonical result the blocking of the operand it was computed
/// from.
pub(crate) fn match_layout(out: Tensor, like: &Tensor) -> Result<Tensor> {
    if like.layout().is_packed() && out.shape().ndim() >= 2 {
        Ok(pk_kernels::pack(&out, like.packn())?)
    } else {
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pk_tensor::{Layout, Shape};

    #[test]
    fn test_channel_quantized_dequantize() {
        let q = vec![QuantInfo::new(0.5, 0), QuantInfo::new(2.0, 1)];
        let t = Tensor::from_i8(vec![2, 2, 3, 3], Shape::from_slice(&[2, 2]), q).unwrap();
        assert_eq!(to_f32(&t, 0).unwrap(), vec![1.0, 1.0, 4.0, 4.0]);
    }

    #[test]
    fn test_from_f32_quantizes() {
        let spec = TensorSpec::new(DType::Int8, Shape::from_slice(&[3]), Layout::N)
            .with_qinfo(vec![QuantInfo::new(0.5, 2)]);
        let t = from_f32(&[1.0, -1.0, 1000.0], &spec).unwrap();
        assert_eq!(t.data_i8().unwrap(), &[4, 0, 127]);
    }

    #[test]
    fn test_packed_input_roundtrips_through_f32() {
        let t = Tensor::new((0..48).map(|i| i as f32).collect(), Shape::from_slice(&[1, 12, 2, 2]));
        let packed = pk_kernels::pack(&t, 8).unwrap();
        assert_eq!(to_f32(&packed, 1).unwrap(), t.data_f32().unwrap());
        let back = match_layout(t.clone(), &packed).unwrap();
        assert_eq!(back.packn(), 8);
        assert_eq!(back.channel_tail(), 4);
    }
}
