//! # EPT pointer (EPTP)
//!
//! The VMCS field that tells the processor where a guest's PML4 lives and how
//! to walk it.
//!
//! ```text
//!  63‒52   51‒12        11‒8  7    6    5‒3        2‒0
//! +------+------------+-----+----+----+----------+------+
//! | res  | PML4 frame | res |SSS | AD | walk − 1 | MT   |
//! +------+------------+-----+----+----+----------+------+
//! ```

use crate::HostFrame;
use crate::permissions::MemoryType;
use bitfield_struct::bitfield;
use kernel_memory_addresses::HostPhysicalAddress;

/// Raw EPT pointer.
#[bitfield(u64)]
#[derive(PartialEq, Eq, Hash)]
pub struct EptPointer {
    /// Memory type used for the processor's accesses to the tables (bits 0..2).
    #[bits(3)]
    pub memory_type_bits: u8,
    /// Page-walk length minus one (bits 3..5); 3 for a four-level walk.
    #[bits(3)]
    pub walk_length_minus_one: u8,
    /// Enable accessed and dirty flags in EPT entries (bit 6).
    pub accessed_dirty: bool,
    /// Enforce access rights for supervisor shadow-stack pages (bit 7).
    pub supervisor_shadow_stack: bool,
    #[bits(4)]
    __res8_11: u8,
    /// PML4 frame number (bits 12..51).
    #[bits(40)]
    root_frame: u64,
    #[bits(12)]
    __res52_63: u16,
}

impl EptPointer {
    /// Pointer for a four-level walk rooted at `root`.
    #[inline]
    #[must_use]
    pub const fn build(root: HostFrame, memory_type: MemoryType, accessed_dirty: bool) -> Self {
        Self::new()
            .with_memory_type_bits(memory_type.bits())
            .with_walk_length_minus_one(3)
            .with_accessed_dirty(accessed_dirty)
            .with_root_frame(root.base().as_u64() >> 12)
    }

    #[inline]
    #[must_use]
    pub const fn root(self) -> HostFrame {
        HostFrame::from_addr(HostPhysicalAddress::new(self.root_frame() << 12))
    }

    /// Number of table levels walked.
    #[inline]
    #[must_use]
    pub const fn walk_length(self) -> u8 {
        self.walk_length_minus_one() + 1
    }

    #[inline]
    #[must_use]
    pub const fn memory_type(self) -> Option<MemoryType> {
        MemoryType::from_bits(self.memory_type_bits())
    }
}
