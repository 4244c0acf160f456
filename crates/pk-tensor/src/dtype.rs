use std::fmt;

/// Element types a tensor buffer can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DType {
    /// 32-bit floating point.
    F32,
    /// 16-bit floating point (IEEE 754 half-precision, via the `half` crate).
    F16,
    /// Affine-quantized signed 8-bit integer.
    Int8,
    /// Affine-quantized signed 4-bit integer, two values per byte.
    Int4,
    /// 32-bit integer, used for biases and GEMM accumulators.
    Int32,
}

impl DType {
    /// Every dtype, in dispatch-table column order.
    pub const ALL: [DType; 5] = [DType::Int4, DType::Int8, DType::F16, DType::F32, DType::Int32];

    /// Width of one element in bits.
    pub fn bits(&self) -> usize {
        match self {
            DType::F32 | DType::Int32 => 32,
            DType::F16 => 16,
            DType::Int8 => 8,
            DType::Int4 => 4,
        }
    }

    /// Number of bytes needed to store `n` elements of this type.
    ///
    /// Int4 rounds up to a whole byte for odd counts.
    pub fn byte_size(&self, n: usize) -> usize {
        (n * self.bits() + 7) / 8
    }

    /// Returns true for floating-point types.
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F32 | DType::F16)
    }

    /// Returns true for the affine-quantized integer types.
    pub fn is_quantized(&self) -> bool {
        matches!(self, DType::Int8 | DType::Int4)
    }

    /// Representable range of a quantized type, as `(min, max)`.
    pub fn quant_range(&self) -> Option<(i32, i32)> {
        match self {
            DType::Int8 => Some((i8::MIN as i32, i8::MAX as i32)),
            DType::Int4 => Some((-8, 7)),
            _ => None,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F32 => write!(f, "f32"),
            DType::F16 => write!(f, "f16"),
            DType::Int8 => write!(f, "int8"),
            DType::Int4 => write!(f, "int4"),
            DType::Int32 => write!(f, "int32"),
        }
    }
}
