//! # EPT tables, levels and indices
//!
//! - [`EptLevel`]: which of the four levels a table sits at.
//! - [`TableIndex`]: a 9-bit slot number derived from a guest-physical address.
//! - [`EptTable`]: a 4 KiB-aligned array of 512 [`EptEntry`] values.
//!
//! All four levels share one table type; what an entry means is decided by
//! the level it is read at (see [`EptEntry::kind`]).

use crate::entry::EptEntry;
use crate::granularity::Granularity;
use kernel_memory_addresses::GuestPhysicalAddress;

/// Entries per table at every level.
pub const ENTRIES_PER_TABLE: usize = 512;

/// Level of an EPT table, numbered the way the hardware counts walk steps.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EptLevel {
    /// Page table: entries are 4 KiB leaves.
    Pt = 1,
    /// Page directory: tables or 2 MiB leaves.
    Pd = 2,
    /// Page directory pointer table: tables or 1 GiB leaves.
    Pdpt = 3,
    /// Root: entries always point at a PDPT.
    Pml4 = 4,
}

impl EptLevel {
    #[inline]
    #[must_use]
    pub const fn number(self) -> u8 {
        self as u8
    }

    /// Lowest guest-physical bit consumed by this level's index.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        12 + 9 * (self.number() as u32 - 1)
    }

    /// Bytes of guest-physical space covered by one entry.
    #[inline]
    #[must_use]
    pub const fn span(self) -> u64 {
        1 << self.shift()
    }

    /// Slot for `gpa` in a table at this level.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn index_of(self, gpa: GuestPhysicalAddress) -> TableIndex {
        TableIndex::new(((gpa.as_u64() >> self.shift()) & 0x1FF) as u16)
    }

    /// The level below, `None` for [`Pt`](Self::Pt).
    #[inline]
    #[must_use]
    pub const fn child(self) -> Option<Self> {
        match self {
            Self::Pml4 => Some(Self::Pdpt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pd => Some(Self::Pt),
            Self::Pt => None,
        }
    }

    /// Mapping size of a leaf at this level, `None` for the root.
    #[inline]
    #[must_use]
    pub const fn granularity(self) -> Option<Granularity> {
        match self {
            Self::Pt => Some(Granularity::Size4K),
            Self::Pd => Some(Granularity::Size2M),
            Self::Pdpt => Some(Granularity::Size1G),
            Self::Pml4 => None,
        }
    }
}

/// Index into an EPT table (`0..512`).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableIndex(u16);

impl TableIndex {
    /// Build an index; debug-asserts `< 512`.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!(v < 512);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// All 512 indices in ascending order.
    #[allow(clippy::cast_possible_truncation)]
    pub fn all() -> impl Iterator<Item = Self> {
        (0..ENTRIES_PER_TABLE as u16).map(Self)
    }
}

/// One EPT table of any level.
///
/// 4 KiB in size and alignment so it can be handed to the processor as is.
#[doc(alias = "PML4")]
#[doc(alias = "PDPT")]
#[doc(alias = "PD")]
#[doc(alias = "PT")]
#[repr(C, align(4096))]
pub struct EptTable {
    entries: [EptEntry; ENTRIES_PER_TABLE],
}

const _: () = assert!(size_of::<EptTable>() == 4096);

impl EptTable {
    /// A table with every entry absent.
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [EptEntry::new(); ENTRIES_PER_TABLE],
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: TableIndex) -> EptEntry {
        self.entries[i.as_usize()]
    }

    #[inline]
    pub const fn set(&mut self, i: TableIndex, e: EptEntry) {
        self.entries[i.as_usize()] = e;
    }

    /// Pointer to one entry without creating a reference to the table.
    ///
    /// # Safety
    /// `table` must point at a live `EptTable`.
    #[inline]
    pub(crate) const unsafe fn entry_ptr(table: *mut Self, i: TableIndex) -> *mut EptEntry {
        unsafe { (&raw mut (*table).entries).cast::<EptEntry>().add(i.as_usize()) }
    }

    /// Clear every entry.
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(EptEntry::new());
    }

    /// Present entries with their slot numbers.
    pub fn present(&self) -> impl Iterator<Item = (TableIndex, EptEntry)> + '_ {
        TableIndex::all()
            .map(|i| (i, self.get(i)))
            .filter(|(_, e)| e.is_present())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.present().next().is_none()
    }
}

impl Default for EptTable {
    fn default() -> Self {
        Self::zeroed()
    }
}
