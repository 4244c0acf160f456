use pk_tensor::DType;

/// Widest vector register the kernels are sized for, in bytes.
pub const MAX_VLENB: usize = 128;

/// Description of the target's vector unit.
///
/// Every packed layout and GEMM tile width derives from the register width
/// through [`VectorProfile::packn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorProfile {
    vlenb: usize,
    dot_product: bool,
}

impl VectorProfile {
    /// Profile for a vector length given in bits.
    ///
    /// The length is clamped to `[64, 8 * MAX_VLENB]` and rounded down to a
    /// power of two.
    pub fn new(vlen_bits: usize) -> Self {
        let bytes = (vlen_bits / 8).clamp(8, MAX_VLENB);
        let vlenb = 1 << (usize::BITS - 1 - bytes.leading_zeros());
        VectorProfile {
            vlenb,
            dot_product: false,
        }
    }

    pub fn with_dot_product(mut self, enabled: bool) -> Self {
        self.dot_product = enabled;
        self
    }

    pub fn vlenb(&self) -> usize {
        self.vlenb
    }

    pub fn vlen_bits(&self) -> usize {
        self.vlenb * 8
    }

    pub fn has_dot_product(&self) -> bool {
        self.dot_product
    }

    /// Elements of `dtype` per vector register.
    ///
    /// Integer lanes widen to 16 bits before multiplication, so int8 and int4
    /// use half the byte count.
    pub fn packn(&self, dtype: DType) -> usize {
        match dtype {
            DType::F32 | DType::Int32 => self.vlenb / 4,
            DType::F16 | DType::Int8 | DType::Int4 => self.vlenb / 2,
        }
    }

    /// Widest GEMM column tile, two registers.
    pub fn pack2n(&self, dtype: DType) -> usize {
        2 * self.packn(dtype)
    }
}

impl Default for VectorProfile {
    fn default() -> Self {
        VectorProfile::new(128)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packn_128() {
        let p = VectorProfile::new(128);
        assert_eq!(p.packn(DType::F32), 4);
        assert_eq!(p.packn(DType::F16), 8);
        assert_eq!(p.packn(DType::Int8), 8);
        assert_eq!(p.pack2n(DType::F32), 8);
    }

    #[test]
    fn test_packn_256() {
        let p = VectorProfile::new(256);
        assert_eq!(p.packn(DType::F32), 8);
        assert_eq!(p.vlen_bits(), 256);
    }

    #[test]
    fn test_vlen_normalised() {
        assert_eq!(VectorProfile::new(200).vlen_bits(), 128);
        assert_eq!(VectorProfile::new(8).vlen_bits(), 64);
        assert_eq!(VectorProfile::new(1 << 20).vlenb(), MAX_VLENB);
    }
}
