use std::fmt;

/// Memory layout tag carried by every tensor.
///
/// Canonical layouts keep each channel plane contiguous. Packed layouts
/// (`NC1..C0`) split the channel axis into `C1` blocks of `C0 = packn`
/// channels stored contiguously per spatial position, with an optional
/// narrower tail block stored last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layout {
    // Activations.
    N,
    NC,
    NCW,
    NCHW,
    NCDHW,
    NWC,
    NHWC,
    NDHWC,
    // Weights.
    O,
    OI,
    OIW,
    OIHW,
    OIDHW,
    O1HW,
    // Channel-blocked activations.
    NC1C0,
    NC1WC0,
    NC1HWC0,
    NC1DHWC0,
}

impl Layout {
    /// Canonical channel-major activation layout for a tensor of `rank` dims.
    pub fn canonical_for_rank(rank: usize) -> Option<Layout> {
        match rank {
            1 => Some(Layout::N),
            2 => Some(Layout::NC),
            3 => Some(Layout::NCW),
            4 => Some(Layout::NCHW),
            5 => Some(Layout::NCDHW),
            _ => None,
        }
    }

    /// Number of dimensions a tensor with this layout has.
    ///
    /// Packed layouts count the trailing `C0` dimension.
    pub fn rank(&self) -> usize {
        match self {
            Layout::N | Layout::O => 1,
            Layout::NC | Layout::OI => 2,
            Layout::NCW | Layout::NWC | Layout::OIW | Layout::NC1C0 => 3,
            Layout::NCHW | Layout::NHWC | Layout::OIHW | Layout::O1HW | Layout::NC1WC0 => 4,
            Layout::NCDHW | Layout::NDHWC | Layout::OIDHW | Layout::NC1HWC0 => 5,
            Layout::NC1DHWC0 => 6,
        }
    }

    pub fn is_packed(&self) -> bool {
        matches!(
            self,
            Layout::NC1C0 | Layout::NC1WC0 | Layout::NC1HWC0 | Layout::NC1DHWC0
        )
    }

    /// Channel-last layouts, which the packed kernels never accept.
    pub fn is_channel_last(&self) -> bool {
        matches!(self, Layout::NWC | Layout::NHWC | Layout::NDHWC)
    }

    /// Activation layout with the same memory order as this weight layout.
    ///
    /// This is a pure relabel; activation layouts map to themselves.
    pub fn activation_equivalent(&self) -> Layout {
        match self {
            Layout::O => Layout::N,
            Layout::OI => Layout::NC,
            Layout::OIW => Layout::NCW,
            Layout::OIHW | Layout::O1HW => Layout::NCHW,
            Layout::OIDHW => Layout::NCDHW,
            other => *other,
        }
    }

    /// Channel-blocked counterpart of a canonical activation layout.
    pub fn packed(&self) -> Option<Layout> {
        match self.activation_equivalent() {
            Layout::NC => Some(Layout::NC1C0),
            Layout::NCW => Some(Layout::NC1WC0),
            Layout::NCHW => Some(Layout::NC1HWC0),
            Layout::NCDHW => Some(Layout::NC1DHWC0),
            p if p.is_packed() => Some(p),
            _ => None,
        }
    }

    /// Canonical counterpart of a channel-blocked layout.
    pub fn unpacked(&self) -> Layout {
        match self {
            Layout::NC1C0 => Layout::NC,
            Layout::NC1WC0 => Layout::NCW,
            Layout::NC1HWC0 => Layout::NCHW,
            Layout::NC1DHWC0 => Layout::NCDHW,
            other => *other,
        }
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weight_relabel() {
        assert_eq!(Layout::O.activation_equivalent(), Layout::N);
        assert_eq!(Layout::OI.activation_equivalent(), Layout::NC);
        assert_eq!(Layout::OIHW.activation_equivalent(), Layout::NCHW);
        assert_eq!(Layout::OIDHW.activation_equivalent(), Layout::NCDHW);
        assert_eq!(Layout::NHWC.activation_equivalent(), Layout::NHWC);
    }

    #[test]
    fn test_pack_unpack_tags() {
        assert_eq!(Layout::NCHW.packed(), Some(Layout::NC1HWC0));
        assert_eq!(Layout::OIHW.packed(), Some(Layout::NC1HWC0));
        assert_eq!(Layout::NHWC.packed(), None);
        assert_eq!(Layout::N.packed(), None);
        assert_eq!(Layout::NC1HWC0.unpacked(), Layout::NCHW);
        assert_eq!(Layout::NC1C0.rank(), Layout::NC.rank() + 1);
    }

    #[test]
    fn test_canonical_for_rank() {
        assert_eq!(Layout::canonical_for_rank(4), Some(Layout::NCHW));
        assert_eq!(Layout::canonical_for_rank(6), None);
    }
}
