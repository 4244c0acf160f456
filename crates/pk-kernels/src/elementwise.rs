//! Broadcasting elementwise kernels.
//!
//! Operands are addressed through right-aligned broadcast strides, so the
//! same code serves canonical tensors and packed ones whose broadcast
//! operand was packed with a block width of one.

use pk_tensor::QuantInfo;

use crate::element::FloatElement;
use crate::quant::{dequantize, quantize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
}

impl BinaryOp {
    #[inline]
    pub fn apply(&self, a: f32, b: f32) -> f32 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
        }
    }
}

/// Strides of `dims` when broadcast to `out_dims`; broadcast axes get 0.
pub fn broadcast_strides(dims: &[usize], out_dims: &[usize]) -> Vec<usize> {
    let offset = out_dims.len() - dims.len();
    let mut strides = vec![0usize; out_dims.len()];
    let mut acc = 1;
    for i in (0..dims.len()).rev() {
        if dims[i] != 1 {
            strides[offset + i] = acc;
        }
        acc *= dims[i];
    }
    strides
}

/// `out[i] = f(a[..], b[..])` over the broadcast of `a_dims` and `b_dims`
/// to `out_dims`.
pub fn broadcast_binary<A: Copy, B: Copy, O>(
    a: &[A],
    a_dims: &[usize],
    b: &[B],
    b_dims: &[usize],
    out: &mut [O],
    out_dims: &[usize],
    f: impl Fn(A, B) -> O,
) {
    let sa = broadcast_strides(a_dims, out_dims);
    let sb = broadcast_strides(b_dims, out_dims);
    let rank = out_dims.len();
    let mut index = vec![0usize; rank];
    let (mut ia, mut ib) = (0usize, 0usize);
    for o in out.iter_mut() {
        *o = f(a[ia], b[ib]);
        // odometer increment, innermost axis first
        for axis in (0..rank).rev() {
            index[axis] += 1;
            ia += sa[axis];
            ib += sb[axis];
            if index[axis] < out_dims[axis] {
                break;
            }
            ia -= sa[axis] * index[axis];
            ib -= sb[axis] * index[axis];
            index[axis] = 0;
        }
    }
}

/// Float binary op with broadcasting, computed in f32.
pub fn binary_float<T: FloatElement>(
    op: BinaryOp,
    a: &[T],
    a_dims: &[usize],
    b: &[T],
    b_dims: &[usize],
    out: &mut [T],
    out_dims: &[usize],
) {
    broadcast_binary(a, a_dims, b, b_dims, out, out_dims, |x, y| {
        T::from_f32(op.apply(x.to_f32(), y.to_f32()))
    });
}

/// Int8 binary op: both inputs are dequantized, combined in f32 and
/// quantized with the output parameters.
pub fn binary_i8(
    op: BinaryOp,
    a: &[i8],
    a_dims: &[usize],
    qa: QuantInfo,
    b: &[i8],
    b_dims: &[usize],
    qb: QuantInfo,
    out: &mut [i8],
    out_dims: &[usize],
    qo: QuantInfo,
) {
    broadcast_binary(a, a_dims, b, b_dims, out, out_dims, |x, y| {
        let fx = dequantize(x as i32, qa.zero_point, qa.scale);
        let fy = dequantize(y as i32, qb.zero_point, qb.scale);
        quantize(op.apply(fx, fy), qo.scale, qo.zero_point)
    });
}

pub fn relu<T: FloatElement>(src: &[T], dst: &mut [T]) {
    let zero = T::default();
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = if s > zero { s } else { zero };
    }
}

/// Int8 relu. With identical input and output quantization this is a clamp
/// at the zero point; otherwise values are rescaled through f32.
pub fn relu_i8(src: &[i8], dst: &mut [i8], qin: QuantInfo, qout: QuantInfo) {
    if qin == qout {
        let floor = qin.zero_point.clamp(i8::MIN as i32, i8::MAX as i32) as i8;
        for (d, &s) in dst.iter_mut().zip(src) {
            *d = s.max(floor);
        }
        return;
    }
    for (d, &s) in dst.iter_mut().zip(src) {
        let v = dequantize(s as i32, qin.zero_point, qin.scale).max(0.0);
        *d = quantize(v, qout.scale, qout.zero_point);
    }
}
