//! # HHDM-based PhysMapper
//!
//! A [`PhysMapper`] for hypervisors that keep all of host-physical memory
//! mapped at a constant virtual offset (higher-half direct map).
//!
//! ## How does it work?
//! - Every host-physical address `pa` is visible at `offset + pa`.
//! - Table pointers are that sum, cast to [`EptTable`].
//! - With `offset == 0` this is an identity mapper.
//!
//! ## Example
//! ```rust
//! use kernel_alloc::phys_mapper::HhdmPhysMapper;
//! use kernel_ept::HostPhysicalAddress;
//!
//! let mapper = HhdmPhysMapper::new(0xFFFF_8000_0000_0000);
//! let va = mapper.virt(HostPhysicalAddress::new(0x1234_0000));
//! assert_eq!(va as u64, 0xFFFF_8000_1234_0000);
//! ```

use core::ptr::NonNull;
use kernel_ept::{EptTable, HostFrame, HostPhysicalAddress, PhysMapper};

/// [`PhysMapper`] over a higher-half direct map.
///
/// # Safety
/// Whoever constructs it vouches that the direct map covers every frame the
/// paired allocator hands out, readable and writable.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HhdmPhysMapper {
    offset: u64,
}

impl HhdmPhysMapper {
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Virtual address at which `pa` is visible.
    #[inline]
    #[must_use]
    pub fn virt(&self, pa: HostPhysicalAddress) -> *mut u8 {
        pa.as_u64().wrapping_add(self.offset) as *mut u8
    }
}

impl PhysMapper for HhdmPhysMapper {
    unsafe fn table_ptr(&self, frame: HostFrame) -> NonNull<EptTable> {
        match NonNull::new(self.virt(frame.base()).cast::<EptTable>()) {
            Some(ptr) => ptr,
            None => panic!("hhdm: frame {} maps to null", frame.base()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adds_the_offset() {
        let m = HhdmPhysMapper::new(0x1000_0000);
        let frame = HostFrame::from_addr(HostPhysicalAddress::new(0x5000));
        let p = unsafe { m.table_ptr(frame) };
        assert_eq!(p.as_ptr() as u64, 0x1000_5000);
    }

    #[test]
    fn wraps_into_the_higher_half() {
        let m = HhdmPhysMapper::new(0xFFFF_8000_0000_0000);
        assert_eq!(
            m.virt(HostPhysicalAddress::new(0x20_0000)) as u64,
            0xFFFF_8000_0020_0000
        );
    }

    #[test]
    #[should_panic(expected = "maps to null")]
    fn identity_frame_zero_is_rejected() {
        let m = HhdmPhysMapper::new(0);
        let _ = unsafe { m.table_ptr(HostFrame::from_addr(HostPhysicalAddress::zero())) };
    }
}
