use half::f16;

use crate::dtype::DType;
use crate::error::{Result, TensorError};

/// CPU-side tensor storage, one variant per element type.
#[derive(Debug, Clone, PartialEq)]
pub enum CpuStorage {
    /// 32-bit floating point storage.
    F32(Vec<f32>),
    /// 16-bit floating point storage.
    F16(Vec<f16>),
    /// Signed 8-bit integer storage.
    I8(Vec<i8>),
    /// Signed 4-bit integers, two per byte. The element at an even index
    /// lives in the low nibble; `len` is the element count.
    I4 { bytes: Vec<u8>, len: usize },
    /// 32-bit integer storage.
    I32(Vec<i32>),
}

macro_rules! typed_access {
    ($get:ident, $get_mut:ident, $variant:ident, $ty:ty, $name:literal) => {
        #[doc = concat!("Returns the data as a `", $name, "` slice.")]
        ///
        /// # Errors
        /// Returns an error if the storage holds a different type.
        pub fn $get(&self) -> Result<&[$ty]> {
            match self {
                CpuStorage::$variant(v) => Ok(v.as_slice()),
                other => Err(TensorError::DTypeMismatch {
                    expected: $name.to_string(),
                    got: other.dtype().to_string(),
                }),
            }
        }

        #[doc = concat!("Returns the data as a mutable `", $name, "` slice.")]
        pub fn $get_mut(&mut self) -> Result<&mut [$ty]> {
            match self {
                CpuStorage::$variant(v) => Ok(v.as_mut_slice()),
                other => Err(TensorError::DTypeMismatch {
                    expected: $name.to_string(),
                    got: other.dtype().to_string(),
                }),
            }
        }
    };
}

impl CpuStorage {
    /// Number of elements in this storage.
    pub fn len(&self) -> usize {
        match self {
            CpuStorage::F32(v) => v.len(),
            CpuStorage::F16(v) => v.len(),
            CpuStorage::I8(v) => v.len(),
            CpuStorage::I4 { len, .. } => *len,
            CpuStorage::I32(v) => v.len(),
        }
    }

    /// Returns true if the storage contains no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the backing buffer in bytes.
    pub fn byte_size(&self) -> usize {
        self.dtype().byte_size(self.len())
    }

    typed_access!(as_f32_slice, as_f32_slice_mut, F32, f32, "f32");
    typed_access!(as_f16_slice, as_f16_slice_mut, F16, f16, "f16");
    typed_access!(as_i8_slice, as_i8_slice_mut, I8, i8, "int8");
    typed_access!(as_i32_slice, as_i32_slice_mut, I32, i32, "int32");

    /// Returns the raw nibble-packed bytes of int4 storage.
    pub fn as_i4_bytes(&self) -> Result<&[u8]> {
        match self {
            CpuStorage::I4 { bytes, .. } => Ok(bytes.as_slice()),
            other => Err(TensorError::DTypeMismatch {
                expected: "int4".to_string(),
                got: other.dtype().to_string(),
            }),
        }
    }

    /// Create zero-filled storage for the given dtype and element count.
    pub fn zeros(dtype: DType, n: usize) -> Self {
        match dtype {
            DType::F32 => CpuStorage::F32(vec![0.0; n]),
            DType::F16 => CpuStorage::F16(vec![f16::ZERO; n]),
            DType::Int8 => CpuStorage::I8(vec![0; n]),
            DType::Int4 => CpuStorage::I4 {
                bytes: vec![0; DType::Int4.byte_size(n)],
                len: n,
            },
            DType::Int32 => CpuStorage::I32(vec![0; n]),
        }
    }

    /// Create storage from an f32 vector.
    pub fn from_f32_vec(data: Vec<f32>) -> Self {
        CpuStorage::F32(data)
    }

    /// Pack signed 4-bit values (each in `-8..=7`) two per byte.
    pub fn from_i4_values(values: &[i8]) -> Self {
        let mut bytes = vec![0u8; DType::Int4.byte_size(values.len())];
        pack_nibbles(values, &mut bytes);
        CpuStorage::I4 {
            bytes,
            len: values.len(),
        }
    }

    /// Unpack int4 storage into one sign-extended `i8` per element.
    pub fn to_i4_values(&self) -> Result<Vec<i8>> {
        match self {
            CpuStorage::I4 { bytes, len } => {
                let mut out = vec![0i8; *len];
                unpack_nibbles(bytes, &mut out);
                Ok(out)
            }
            other => Err(TensorError::DTypeMismatch {
                expected: "int4".to_string(),
                got: other.dtype().to_string(),
            }),
        }
    }

    /// Returns the dtype of this storage.
    pub fn dtype(&self) -> DType {
        match self {
            CpuStorage::F32(_) => DType::F32,
            CpuStorage::F16(_) => DType::F16,
            CpuStorage::I8(_) => DType::Int8,
            CpuStorage::I4 { .. } => DType::Int4,
            CpuStorage::I32(_) => DType::Int32,
        }
    }
}

/// Pack 4-bit values into bytes, even index in the low nibble.
///
/// An odd trailing value occupies the low nibble of the last byte.
pub fn pack_nibbles(src: &[i8], dst: &mut [u8]) {
    for (byte, pair) in dst.iter_mut().zip(src.chunks(2)) {
        let lo = (pair[0] as u8) & 0x0f;
        let hi = pair.get(1).map_or(0, |&v| ((v as u8) & 0x0f) << 4);
        *byte = lo | hi;
    }
}

/// Sign-extend packed nibbles into `dst.len()` bytes.
pub fn unpack_nibbles(src: &[u8], dst: &mut [i8]) {
    for (i, out) in dst.iter_mut().enumerate() {
        let byte = src[i / 2] as i8;
        *out = if i % 2 == 0 {
            // move the low nibble up, then shift back arithmetically
            (byte << 4) >> 4
        } else {
            byte >> 4
        };
    }
}

impl From<Vec<f32>> for CpuStorage {
    fn from(v: Vec<f32>) -> Self {
        CpuStorage::F32(v)
    }
}

impl From<Vec<f16>> for CpuStorage {
    fn from(v: Vec<f16>) -> Self {
        CpuStorage::F16(v)
    }
}

impl From<Vec<i8>> for CpuStorage {
    fn from(v: Vec<i8>) -> Self {
        CpuStorage::I8(v)
    }
}

impl From<Vec<i32>> for CpuStorage {
    fn from(v: Vec<i32>) -> Self {
        CpuStorage::I32(v)
    }
}
