//! # EPT entry (all levels)
//!
//! One 64-bit layout serves every level. How it is interpreted depends on the
//! level it is read at and on bit 7:
//!
//! | Level | bit 7 = 0 | bit 7 = 1 |
//! |:------|:----------|:----------|
//! | PML4 | next PDPT | reserved |
//! | PDPT | next PD | 1 GiB leaf |
//! | PD | next PT | 2 MiB leaf |
//! | PT | 4 KiB leaf (bit 7 ignored) | 4 KiB leaf |
//!
//! ```text
//!  63  62‒52  51‒12        11  10  9  8  7  6  5‒3  2  1  0
//! +---+------+------------+---+---+--+--+--+--+----+--+--+--+
//! |SVE|ignore| frame      |MAP|UX |D |A |LP|IP|MT  |X |W |R |
//! +---+------+------------+---+---+--+--+--+--+----+--+--+--+
//! ```
//!
//! `MAP` (bit 11) is ignored by the processor. Every leaf written by this
//! crate sets it so that a mapping with no permissions at all still counts
//! as mapped; the processor sees such a leaf as not present and raises a
//! violation, which is exactly how access-revoked pages are meant to behave.

use crate::permissions::{EptPermissions, MemoryType};
use crate::table::EptLevel;
use crate::{Granularity, HostFrame};
use bitfield_struct::bitfield;
use kernel_memory_addresses::HostPhysicalAddress;

/// Raw EPT entry.
#[bitfield(u64)]
#[derive(PartialEq, Eq, Hash)]
pub struct EptEntry {
    /// Read access (bit 0).
    pub read: bool,
    /// Write access (bit 1).
    pub write: bool,
    /// Execute access (bit 2).
    pub execute: bool,
    /// Memory type for leaves (bits 3..5); reserved in non-terminal entries.
    #[bits(3)]
    pub memory_type_bits: u8,
    /// Ignore guest PAT (bit 6, leaves only).
    pub ignore_pat: bool,
    /// Large page (bit 7): terminates the walk at PDPT or PD.
    pub large_page: bool,
    /// Accessed (bit 8): set by the processor when A/D flags are enabled.
    pub accessed: bool,
    /// Dirty (bit 9, leaves only).
    pub dirty: bool,
    /// User-mode execute (bit 10) under mode-based execute control.
    pub user_execute: bool,
    /// Software "mapped" marker (bit 11), ignored by the processor.
    pub mapped: bool,
    /// Frame number (bits 12..51) of the next table or of the mapped page.
    #[bits(40)]
    pub(crate) frame: u64,
    /// Ignored (bits 52..62).
    #[bits(11)]
    __ignored: u16,
    /// Suppress #VE (bit 63).
    pub suppress_ve: bool,
}

/// Decoded role of a present entry at a known level.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EntryKind {
    /// Points at the table one level down.
    Table(HostFrame),
    /// Terminates the walk.
    Leaf {
        host: HostPhysicalAddress,
        granularity: Granularity,
    },
}

impl EptEntry {
    /// Non-terminal entry pointing at `table`.
    ///
    /// Carries read, write and execute so that the leaf alone decides the
    /// effective permission.
    #[inline]
    #[must_use]
    pub const fn table(table: HostFrame) -> Self {
        Self::new()
            .with_read(true)
            .with_write(true)
            .with_execute(true)
            .with_frame(table.base().as_u64() >> 12)
    }

    /// Terminal entry at `level` mapping `host`.
    ///
    /// `host` must be aligned to the level's span; the large page bit is set
    /// for PDPT and PD leaves.
    #[inline]
    #[must_use]
    pub const fn leaf(
        host: HostPhysicalAddress,
        permissions: EptPermissions,
        memory_type: MemoryType,
        level: EptLevel,
    ) -> Self {
        debug_assert!(host.as_u64() & (level.span() - 1) == 0);
        Self::new()
            .with_permissions(permissions)
            .with_memory_type_bits(memory_type.bits())
            .with_large_page(!matches!(level, EptLevel::Pt))
            .with_mapped(true)
            .with_frame(host.as_u64() >> 12)
    }

    /// Any of R/W/X or the software mapped marker is set.
    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.read() || self.write() || self.execute() || self.mapped()
    }

    /// Whether this entry ends the walk when found at `level`.
    #[inline]
    #[must_use]
    pub const fn is_leaf(self, level: EptLevel) -> bool {
        match level {
            EptLevel::Pt => true,
            EptLevel::Pd | EptLevel::Pdpt => self.large_page(),
            EptLevel::Pml4 => false,
        }
    }

    /// Host-physical address stored in bits 12..51.
    #[inline]
    #[must_use]
    pub const fn address(self) -> HostPhysicalAddress {
        HostPhysicalAddress::new(self.frame() << 12)
    }

    /// Same entry, pointing somewhere else.
    #[inline]
    #[must_use]
    pub const fn with_address(self, host: HostPhysicalAddress) -> Self {
        self.with_frame(host.as_u64() >> 12)
    }

    /// The table frame of a non-terminal entry.
    #[inline]
    #[must_use]
    pub const fn table_frame(self) -> HostFrame {
        HostFrame::from_addr(self.address())
    }

    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn permissions(self) -> EptPermissions {
        EptPermissions::from_bits_truncate(self.into_bits() as u8 & 0b111)
    }

    /// Replace R/W/X, leaving every other bit alone.
    #[inline]
    #[must_use]
    pub const fn with_permissions(self, p: EptPermissions) -> Self {
        self.with_read(p.contains(EptPermissions::READ))
            .with_write(p.contains(EptPermissions::WRITE))
            .with_execute(p.contains(EptPermissions::EXECUTE))
    }

    /// Leaf memory type, `None` for the reserved encodings 2, 3 and 7.
    #[inline]
    #[must_use]
    pub const fn memory_type(self) -> Option<MemoryType> {
        MemoryType::from_bits(self.memory_type_bits())
    }

    /// Whether the processor would refuse this entry with an EPT
    /// misconfiguration rather than a violation.
    ///
    /// Covers write-without-read and reserved memory types on leaves. Used on
    /// snapshots whose level is unknown, so leaf-ness is taken from the large
    /// page and mapped bits.
    #[must_use]
    pub const fn is_misconfigured(self) -> bool {
        if !self.permissions().is_valid() {
            return true;
        }
        (self.mapped() || self.large_page()) && self.memory_type().is_none()
    }

    /// Interpret a present entry at `level`; `None` if absent.
    #[must_use]
    pub const fn kind(self, level: EptLevel) -> Option<EntryKind> {
        if !self.is_present() {
            return None;
        }
        match level.granularity() {
            Some(granularity) if self.is_leaf(level) => Some(EntryKind::Leaf {
                host: self.address(),
                granularity,
            }),
            _ => Some(EntryKind::Table(self.table_frame())),
        }
    }
}
