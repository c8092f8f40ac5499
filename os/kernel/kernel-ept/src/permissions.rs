//! Access permissions and memory types as encoded in EPT leaves.

use core::fmt;

bitflags::bitflags! {
    /// EPT access rights (bits 0..2 of every entry).
    ///
    /// The same three bits describe both what a leaf grants and, in an exit
    /// qualification, which access the guest attempted.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct EptPermissions: u8 {
        /// Data reads allowed.
        const READ = 1 << 0;

        /// Data writes allowed.
        ///
        /// Write without read is a misconfiguration; the processor raises an
        /// EPT misconfiguration exit instead of a violation.
        const WRITE = 1 << 1;

        /// Instruction fetches allowed (supervisor fetches when mode-based
        /// execute control is enabled).
        const EXECUTE = 1 << 2;

        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        const READ_EXECUTE = Self::READ.bits() | Self::EXECUTE.bits();
        const ALL = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

impl EptPermissions {
    /// Whether the combination is architecturally valid for a leaf.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        !(self.contains(Self::WRITE) && !self.contains(Self::READ))
    }
}

/// EPT memory type (leaf bits 3..5, EPT pointer bits 0..2).
///
/// Values 2, 3 and 7 are reserved and make an entry misconfigured.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MemoryType {
    Uncacheable = 0,
    WriteCombining = 1,
    WriteThrough = 4,
    WriteProtected = 5,
    #[default]
    WriteBack = 6,
}

impl MemoryType {
    /// Decode the 3-bit field; `None` for reserved encodings.
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::Uncacheable),
            1 => Some(Self::WriteCombining),
            4 => Some(Self::WriteThrough),
            5 => Some(Self::WriteProtected),
            6 => Some(Self::WriteBack),
            _ => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn bits(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Uncacheable => "UC",
            Self::WriteCombining => "WC",
            Self::WriteThrough => "WT",
            Self::WriteProtected => "WP",
            Self::WriteBack => "WB",
        }
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_memory_types_do_not_decode() {
        for bits in [2, 3, 7] {
            assert_eq!(MemoryType::from_bits(bits), None);
        }
        for mt in [
            MemoryType::Uncacheable,
            MemoryType::WriteCombining,
            MemoryType::WriteThrough,
            MemoryType::WriteProtected,
            MemoryType::WriteBack,
        ] {
            assert_eq!(MemoryType::from_bits(mt.bits()), Some(mt));
        }
    }

    #[test]
    fn write_only_is_invalid() {
        assert!(!EptPermissions::WRITE.is_valid());
        assert!(!(EptPermissions::WRITE | EptPermissions::EXECUTE).is_valid());
        assert!(EptPermissions::READ_WRITE.is_valid());
        assert!(EptPermissions::EXECUTE.is_valid());
        assert!(EptPermissions::empty().is_valid());
    }
}
