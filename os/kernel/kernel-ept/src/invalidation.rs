//! # Translation-cache invalidation
//!
//! After the tables change, the processor may still hold the old translation
//! in its TLB or paging-structure caches. Every mutation of an
//! [`EptContext`](crate::EptContext) reports the guest-physical span it
//! touched to an [`EptInvalidator`] while the write lock is still held, so
//! no virtual CPU can re-enter the guest with a stale view.
//!
//! `INVEPT` has no address-range form; hardware invalidators flush the whole
//! context and treat the range as a hint. Software shadows (e.g. a device
//! model's cached translations) can use it to drop only what changed.

use crate::pointer::EptPointer;
use core::fmt;
use kernel_memory_addresses::GuestPhysicalAddress;

/// Guest-physical span whose cached translations are stale.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InvalidationRange {
    /// Everything cached for the context.
    Context,
    /// `[start, start + len)`.
    Range {
        start: GuestPhysicalAddress,
        len: u64,
    },
}

impl InvalidationRange {
    #[inline]
    #[must_use]
    pub const fn range(start: GuestPhysicalAddress, len: u64) -> Self {
        Self::Range { start, len }
    }

    /// Smallest range covering both.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        match (self, other) {
            (
                Self::Range { start: a, len: al },
                Self::Range { start: b, len: bl },
            ) => {
                let start = a.min(b);
                let end = (a.as_u64() + al).max(b.as_u64() + bl);
                Self::Range {
                    start,
                    len: end - start.as_u64(),
                }
            }
            _ => Self::Context,
        }
    }

    /// Merge into an optional accumulator.
    #[must_use]
    pub fn merge_into(self, acc: Option<Self>) -> Self {
        acc.map_or(self, |a| a.merge(self))
    }

    #[must_use]
    pub const fn covers(self, gpa: GuestPhysicalAddress) -> bool {
        match self {
            Self::Context => true,
            Self::Range { start, len } => {
                gpa.as_u64() >= start.as_u64() && gpa.as_u64() - start.as_u64() < len
            }
        }
    }
}

impl fmt::Display for InvalidationRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Context => f.write_str("context"),
            Self::Range { start, len } => write!(f, "{start}+{len:#x}"),
        }
    }
}

/// Flushes cached translations for one EPT context.
///
/// Implementations must not return before every logical processor that may
/// hold translations for `eptp` has flushed them (cross-CPU shootdown
/// included).
pub trait EptInvalidator: Send + Sync {
    fn invalidate(&self, eptp: EptPointer, range: InvalidationRange);
}

/// Invalidator for contexts that have never been loaded on any processor.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoopInvalidator;

impl EptInvalidator for NoopInvalidator {
    #[inline]
    fn invalidate(&self, _eptp: EptPointer, _range: InvalidationRange) {}
}

impl<I: EptInvalidator + ?Sized> EptInvalidator for &I {
    fn invalidate(&self, eptp: EptPointer, range: InvalidationRange) {
        (**self).invalidate(eptp, range);
    }
}

impl<I: EptInvalidator + ?Sized> EptInvalidator for alloc::sync::Arc<I> {
    fn invalidate(&self, eptp: EptPointer, range: InvalidationRange) {
        (**self).invalidate(eptp, range);
    }
}

/// Single-context `INVEPT` on the executing logical processor.
///
/// Correct on its own only when the context is active on this processor
/// alone; multi-processor hypervisors wrap it in an IPI shootdown.
#[cfg(all(feature = "asm", target_arch = "x86_64"))]
#[derive(Copy, Clone, Debug, Default)]
pub struct Invept;

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl Invept {
    const SINGLE_CONTEXT: u64 = 1;
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl EptInvalidator for Invept {
    fn invalidate(&self, eptp: EptPointer, _range: InvalidationRange) {
        // 128-bit descriptor: EPTP, then 64 reserved bits.
        let descriptor: [u64; 2] = [eptp.into_bits(), 0];
        // SAFETY: requires VMX root operation; the descriptor outlives the
        // instruction and is only read.
        unsafe {
            core::arch::asm!(
                "invept {kind}, [{desc}]",
                kind = in(reg) Self::SINGLE_CONTEXT,
                desc = in(reg) descriptor.as_ptr(),
                options(nostack, readonly)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpa(v: u64) -> GuestPhysicalAddress {
        GuestPhysicalAddress::new(v)
    }

    #[test]
    fn merge_takes_the_hull() {
        let a = InvalidationRange::range(gpa(0x20_0000), 0x1000);
        let b = InvalidationRange::range(gpa(0x40_0000), 0x20_0000);
        assert_eq!(
            a.merge(b),
            InvalidationRange::range(gpa(0x20_0000), 0x40_0000)
        );
        assert_eq!(b.merge(a), a.merge(b));
    }

    #[test]
    fn context_absorbs() {
        let a = InvalidationRange::range(gpa(0), 0x1000);
        assert_eq!(a.merge(InvalidationRange::Context), InvalidationRange::Context);
        assert_eq!(a.merge_into(None), a);
    }

    #[test]
    fn covers() {
        let r = InvalidationRange::range(gpa(0x1000), 0x2000);
        assert!(r.covers(gpa(0x1000)));
        assert!(r.covers(gpa(0x2FFF)));
        assert!(!r.covers(gpa(0x3000)));
        assert!(!r.covers(gpa(0xFFF)));
    }
}
