//! # Guest-Physical and Host-Physical Address Types
//!
//! Strongly typed wrappers for the two address spaces a hypervisor juggles
//! when it maintains second-level (EPT) translation tables.
//!
//! ## Overview
//!
//! A guest believes it owns "physical" memory. That memory is an illusion
//! built from real machine frames by the second-level translation. Mixing the
//! two kinds of addresses up is the classic hypervisor bug, so every address
//! carries its space in its type while remaining a zero-cost `u64`.
//!
//! | Concept | Generic | Description |
//! |----------|----------|-------------|
//! | [`MemoryAddress`] | – | A raw 64-bit address of either space. |
//! | [`MemoryPage<S>`] | [`S: PageSize`](PageSize) | A page-aligned base address of a page of size `S`. |
//! | [`MemoryAddressOffset<S>`] | [`S: PageSize`](PageSize) | An offset within a page of size `S`. |
//!
//! These are then wrapped to distinguish the two spaces:
//!
//! | Wrapper | Meaning |
//! |----------|----------|
//! | [`GuestPhysicalAddress`] / [`GuestPhysicalPage<S>`] | Memory as the virtual machine sees it (input of the EPT walk). |
//! | [`HostPhysicalAddress`] / [`HostPhysicalPage<S>`] | Real machine memory (output of the EPT walk, table frames). |
//!
//! ## Page Sizes
//!
//! Three x86-64 granularities are supported via marker types implementing
//! [`PageSize`]:
//!
//! - [`Size4K`]: 4 KiB pages (base granularity, one "page unit")
//! - [`Size2M`]: 2 MiB large pages (512 page units)
//! - [`Size1G`]: 1 GiB large pages (262 144 page units)
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let gpa = GuestPhysicalAddress::new(0x0020_0100);
//!
//! // Which 2 MiB guest page is this, and where inside it?
//! let (page, off) = gpa.split::<Size2M>();
//! assert_eq!(page.base().as_u64(), 0x0020_0000);
//! assert_eq!(off.as_u64(), 0x100);
//!
//! // Apply the same offset to the backing host page.
//! let host = HostPhysicalPage::<Size2M>::from_addr(HostPhysicalAddress::new(0x0040_0000));
//! assert_eq!(host.join(off).as_u64(), 0x0040_0100);
//! ```
//!
//! ## Design Notes
//!
//! - All types are `#[repr(transparent)]`, `Copy`, `Eq`, `Ord` and `Hash`.
//! - Alignment and offset calculations are `const fn`.
//! - The phantom marker `S` fixes the page size at the type level; converting
//!   between sizes is always explicit.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod guest_physical_address;
mod guest_physical_page;
mod host_physical_address;
mod host_physical_page;
mod memory_address;
mod memory_address_offset;
mod memory_page;
mod page_size;

pub use crate::guest_physical_address::GuestPhysicalAddress;
pub use crate::guest_physical_page::GuestPhysicalPage;
pub use crate::host_physical_address::HostPhysicalAddress;
pub use crate::host_physical_page::HostPhysicalPage;
pub use crate::memory_address::MemoryAddress;
pub use crate::memory_address_offset::MemoryAddressOffset;
pub use crate::memory_page::MemoryPage;
pub use crate::page_size::{PageSize, Size1G, Size2M, Size4K};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_and_join_4k() {
        let a = MemoryAddress::new(0x1234_5678_9ABC_DEF0);
        let (p, o) = a.split::<Size4K>();
        assert_eq!(p.base().as_u64() & 0xFFF, 0);
        assert_eq!(o.as_u64(), a.as_u64() & 0xFFF);
        assert_eq!(p.join(o).as_u64(), a.as_u64());
    }

    #[test]
    fn split_and_join_1g() {
        let a = MemoryAddress::new(0x0000_0004_1234_5678);
        let (p, o) = a.split::<Size1G>();
        assert_eq!(p.base().as_u64(), 0x0000_0004_0000_0000);
        assert_eq!(o.as_u64(), 0x1234_5678);
        assert_eq!(p.join(o).as_u64(), a.as_u64());
    }

    #[test]
    fn guest_offset_carries_over_to_host() {
        let gpa = GuestPhysicalAddress::new(0x0000_0000_4012_3456);
        let (gp, off) = gpa.split::<Size1G>();
        assert_eq!(gp.base().as_u64(), 0x4000_0000);

        let hp = HostPhysicalPage::<Size1G>::from_addr(HostPhysicalAddress::new(0x8000_0000));
        assert_eq!(hp.join(off).as_u64(), 0x8012_3456);
    }

    #[test]
    fn alignment_helpers() {
        let a = MemoryAddress::new(0x12345);
        assert_eq!(a.align_down::<Size4K>().as_u64(), 0x12000);
        assert!(!a.is_aligned::<Size4K>());
        assert!(MemoryAddress::new(0x20_0000).is_aligned::<Size2M>());
        assert!(!MemoryAddress::new(0x20_0000).is_aligned::<Size1G>());
    }

    #[test]
    fn page_units() {
        assert_eq!(Size4K::PAGE_UNITS, 1);
        assert_eq!(Size2M::PAGE_UNITS, 512);
        assert_eq!(Size1G::PAGE_UNITS, 262_144);
    }

    #[test]
    fn try_page_rejects_unaligned() {
        let gpa = GuestPhysicalAddress::new(0x20_1000);
        assert!(GuestPhysicalPage::<Size4K>::try_from(gpa).is_ok());
        assert!(GuestPhysicalPage::<Size2M>::try_from(gpa).is_err());
    }
}
