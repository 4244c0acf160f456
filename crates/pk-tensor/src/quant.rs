/// Affine quantization parameters for one channel group.
///
/// `real = (q - zero_point) * scale`. `multiplier` and `shift` are the
/// fixed-point encoding of the requantization scale consumed by integer
/// kernels, where `real_multiplier = multiplier / 2^31 * 2^shift`. A
/// `multiplier` of zero means the pair has not been derived yet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantInfo {
    pub scale: f32,
    pub zero_point: i32,
    pub multiplier: i32,
    pub shift: i32,
}

impl QuantInfo {
    pub fn new(scale: f32, zero_point: i32) -> Self {
        QuantInfo {
            scale,
            zero_point,
            multiplier: 0,
            shift: 0,
        }
    }

    /// Attach an already-derived fixed-point multiplier.
    pub fn with_requant(mut self, multiplier: i32, shift: i32) -> Self {
        self.multiplier = multiplier;
        self.shift = shift;
        self
    }

    pub fn has_requant(&self) -> bool {
        self.multiplier != 0
    }
}

impl Default for QuantInfo {
    fn default() -> Self {
        QuantInfo::new(1.0, 0)
    }
}
