//! # Guest buffers in host memory
//!
//! Device models receive guest-physical buffer descriptors (ring entries,
//! DMA targets) and need the host-physical pieces behind them. A buffer that
//! is contiguous for the guest may be scattered on the host; it is cut at
//! every terminal-mapping boundary:
//!
//! ```text
//!   guest  [0x1F_F800 ─────────────── 0x20_0800)
//!            4K leaf @ 0x9000    │ 2M leaf @ 0x40_0000
//!   yields (0x1F_F800 → 0x9800, 0x800), (0x20_0000 → 0x40_0000, 0x800)
//! ```
//!
//! Each step translates under the read lock on its own; nothing is cached,
//! so a concurrent unmap shows up as [`EptError::NotMapped`] at the first
//! hole.

use crate::context::EptContext;
use crate::error::EptError;
use crate::invalidation::EptInvalidator;
use crate::{FrameAlloc, PhysMapper};
use kernel_memory_addresses::{GuestPhysicalAddress, HostPhysicalAddress};

/// One host-contiguous piece of a guest buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HostSegment {
    pub guest: GuestPhysicalAddress,
    pub host: HostPhysicalAddress,
    pub len: u64,
}

/// Iterator over the host pieces of `[gpa, gpa + len)`.
pub struct HostSegments<'c, A: FrameAlloc, M: PhysMapper, I: EptInvalidator> {
    context: &'c EptContext<A, M, I>,
    next: GuestPhysicalAddress,
    remaining: u64,
}

impl<A: FrameAlloc, M: PhysMapper, I: EptInvalidator> Iterator for HostSegments<'_, A, M, I> {
    type Item = Result<HostSegment, EptError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let guest = self.next;
        let Some(t) = self.context.translate(guest) else {
            self.remaining = 0;
            return Some(Err(EptError::NotMapped(guest)));
        };

        let len = self.remaining.min(t.remaining());
        self.next += len;
        self.remaining -= len;
        Some(Ok(HostSegment {
            guest,
            host: t.host,
            len,
        }))
    }
}

impl<A: FrameAlloc, M: PhysMapper, I: EptInvalidator> EptContext<A, M, I> {
    /// Host pieces of the guest buffer `[gpa, gpa + len)`.
    ///
    /// ```
    /// # use kernel_ept::*;
    /// let arena = FrameArena::new();
    /// let ctx = EptContext::in_arena(&arena, NoopInvalidator).unwrap();
    /// ctx.map_page(GuestPhysicalAddress::new(0x1000), HostPhysicalAddress::new(0x7000), EptPermissions::READ_WRITE).unwrap();
    /// ctx.map_page(GuestPhysicalAddress::new(0x2000), HostPhysicalAddress::new(0x3000), EptPermissions::READ_WRITE).unwrap();
    ///
    /// let segs: Vec<_> = ctx
    ///     .host_segments(GuestPhysicalAddress::new(0x1F00), 0x200)
    ///     .collect::<Result<_, _>>()
    ///     .unwrap();
    /// assert_eq!(segs.len(), 2);
    /// assert_eq!(segs[0].host, HostPhysicalAddress::new(0x7F00));
    /// assert_eq!(segs[1].host, HostPhysicalAddress::new(0x3000));
    /// ```
    #[must_use]
    pub const fn host_segments(
        &self,
        gpa: GuestPhysicalAddress,
        len: u64,
    ) -> HostSegments<'_, A, M, I> {
        HostSegments {
            context: self,
            next: gpa,
            remaining: len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::FrameArena;
    use crate::invalidation::NoopInvalidator;
    use crate::permissions::EptPermissions;
    use alloc::vec::Vec;

    fn gpa(v: u64) -> GuestPhysicalAddress {
        GuestPhysicalAddress::new(v)
    }

    fn hpa(v: u64) -> HostPhysicalAddress {
        HostPhysicalAddress::new(v)
    }

    #[test]
    fn splits_at_mapping_boundaries() {
        let arena = FrameArena::new();
        let ctx = EptContext::in_arena(&arena, NoopInvalidator).unwrap();
        ctx.map_page(gpa(0x1F_F000), hpa(0x9000), EptPermissions::ALL)
            .unwrap();
        ctx.map_page_2m(gpa(0x20_0000), hpa(0x40_0000), EptPermissions::ALL)
            .unwrap();

        let segs: Vec<_> = ctx
            .host_segments(gpa(0x1F_F800), 0x1000)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(
            segs,
            [
                HostSegment {
                    guest: gpa(0x1F_F800),
                    host: hpa(0x9800),
                    len: 0x800
                },
                HostSegment {
                    guest: gpa(0x20_0000),
                    host: hpa(0x40_0000),
                    len: 0x800
                },
            ]
        );
    }

    #[test]
    fn large_mapping_is_one_segment() {
        let arena = FrameArena::new();
        let ctx = EptContext::in_arena(&arena, NoopInvalidator).unwrap();
        ctx.map_page_2m(gpa(0), hpa(0x20_0000), EptPermissions::READ)
            .unwrap();
        let segs: Vec<_> = ctx.host_segments(gpa(0x1000), 0x10_0000).collect();
        assert_eq!(segs.len(), 1);
    }

    #[test]
    fn stops_at_first_hole() {
        let arena = FrameArena::new();
        let ctx = EptContext::in_arena(&arena, NoopInvalidator).unwrap();
        ctx.map_page(gpa(0), hpa(0x5000), EptPermissions::READ)
            .unwrap();
        ctx.map_page(gpa(0x2000), hpa(0x6000), EptPermissions::READ)
            .unwrap();

        let mut it = ctx.host_segments(gpa(0x800), 0x2000);
        assert!(it.next().unwrap().is_ok());
        assert_eq!(it.next(), Some(Err(EptError::NotMapped(gpa(0x1000)))));
        assert_eq!(it.next(), None);
    }

    #[test]
    fn empty_buffer_yields_nothing() {
        let arena = FrameArena::new();
        let ctx = EptContext::in_arena(&arena, NoopInvalidator).unwrap();
        assert_eq!(ctx.host_segments(gpa(0x1000), 0).count(), 0);
    }
}
