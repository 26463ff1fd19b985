//! Adapter-reported capabilities (`spec.md` §3).

use bitflags::bitflags;

bitflags! {
    /// Which buses an adapter supports. Mirrors the teacher's `Status`
    /// register bitflags in shape, applied here to bus support instead of
    /// chip status bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HardwareCapabilities: u8 {
        const SPI       = 1 << 0;
        const I2C       = 1 << 1;
        const MICROWIRE = 1 << 2;
        const GPIO      = 1 << 3;
    }
}

/// Advisory bus speed tier. Engines may override this per-operation, per
/// `spec.md` §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SpeedTier {
    Slow,
    Normal,
    Fast,
}

impl Default for SpeedTier {
    fn default() -> Self {
        SpeedTier::Normal
    }
}

/// The inclusive range of SPI address widths (in bytes) an adapter's
/// primitives accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressByteRange {
    pub min: u8,
    pub max: u8,
}

impl AddressByteRange {
    pub const THREE_OR_FOUR: Self = Self { min: 3, max: 4 };

    pub fn contains(&self, bytes: u8) -> bool {
        (self.min..=self.max).contains(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_bits_combine() {
        let caps = HardwareCapabilities::SPI | HardwareCapabilities::GPIO;
        assert!(caps.contains(HardwareCapabilities::SPI));
        assert!(!caps.contains(HardwareCapabilities::I2C));
    }

    #[test]
    fn address_byte_range() {
        assert!(AddressByteRange::THREE_OR_FOUR.contains(3));
        assert!(AddressByteRange::THREE_OR_FOUR.contains(4));
        assert!(!AddressByteRange::THREE_OR_FOUR.contains(2));
    }
}
