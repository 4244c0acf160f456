use std::fmt;

/// How well a kernel can run a given operator instance.
///
/// Ordered from worst to best, so the best candidate is the maximum.
/// `Unsupported` means the caller should try another kernel family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    Unsupported,
    Reference,
    Asm,
    Intrinsic,
}

impl Tier {
    pub fn is_supported(&self) -> bool {
        *self != Tier::Unsupported
    }

    /// Hardware-accelerated tiers.
    pub fn is_accelerated(&self) -> bool {
        *self >= Tier::Asm
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tier::Unsupported => "unsupported",
            Tier::Reference => "reference",
            Tier::Asm => "asm",
            Tier::Intrinsic => "intrinsic",
        };
        f.write_str(name)
    }
}
