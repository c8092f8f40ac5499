use crate::{HostPhysicalAddress, MemoryAddressOffset, MemoryPage, PageSize};
use core::fmt;

/// Host-physical page base for size `S`.
///
/// `HostPhysicalPage<Size4K>` doubles as the frame handle for EPT table
/// frames handed out by a frame allocator.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let hpa = HostPhysicalAddress::new(0x0000_0008_1234_5678);
/// let hp = hpa.page::<Size2M>();
/// assert_eq!(hp.base().as_u64() & (Size2M::SIZE - 1), 0);
/// assert_eq!(hp.join(hpa.offset::<Size2M>()), hpa);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct HostPhysicalPage<S: PageSize>(MemoryPage<S>);

impl<S: PageSize> HostPhysicalPage<S> {
    /// Page containing `a` (aligns down).
    #[inline]
    #[must_use]
    pub const fn from_addr(a: HostPhysicalAddress) -> Self {
        Self(MemoryPage::from_addr(a.0))
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> HostPhysicalAddress {
        HostPhysicalAddress(self.0.base())
    }

    #[inline]
    #[must_use]
    pub const fn join(self, off: MemoryAddressOffset<S>) -> HostPhysicalAddress {
        HostPhysicalAddress(self.0.join(off))
    }

    /// Frame/page number (`base >> S::SHIFT`).
    #[inline]
    #[must_use]
    pub const fn number(self) -> u64 {
        self.0.number()
    }

    /// The `n`-th page after this one, `None` on overflow.
    #[inline]
    #[must_use]
    pub const fn checked_step(self, n: u64) -> Option<Self> {
        match self.0.checked_step(n) {
            Some(p) => Some(Self(p)),
            None => None,
        }
    }
}

impl<S> fmt::Display for HostPhysicalPage<S>
where
    S: PageSize,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl<S: PageSize> fmt::Debug for HostPhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HostPhysicalPage<{}>({:#018X})",
            S::as_str(),
            self.0.base().as_u64()
        )
    }
}

impl<S: PageSize> TryFrom<HostPhysicalAddress> for HostPhysicalPage<S> {
    type Error = HostPhysicalAddress;

    #[inline]
    fn try_from(a: HostPhysicalAddress) -> Result<Self, Self::Error> {
        match MemoryPage::from_aligned(a.0) {
            Some(p) => Ok(Self(p)),
            None => Err(a),
        }
    }
}
