use crate::{GuestPhysicalAddress, MemoryAddressOffset, MemoryPage, PageSize};
use core::fmt;

/// Guest-physical page base for size `S`.
///
/// ### Invariants
/// - The low `S::SHIFT` bits of the base are always zero (page aligned).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct GuestPhysicalPage<S: PageSize>(MemoryPage<S>);

impl<S: PageSize> GuestPhysicalPage<S> {
    /// Page containing `a` (aligns down).
    #[inline]
    #[must_use]
    pub const fn from_addr(a: GuestPhysicalAddress) -> Self {
        Self(MemoryPage::from_addr(a.0))
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> GuestPhysicalAddress {
        GuestPhysicalAddress(self.0.base())
    }

    #[inline]
    #[must_use]
    pub const fn join(self, off: MemoryAddressOffset<S>) -> GuestPhysicalAddress {
        GuestPhysicalAddress(self.0.join(off))
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

impl<S> fmt::Display for GuestPhysicalPage<S>
where
    S: PageSize,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl<S: PageSize> fmt::Debug for GuestPhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GuestPhysicalPage<{}>({:#018X})",
            S::as_str(),
            self.0.base().as_u64()
        )
    }
}

impl<S: PageSize> TryFrom<GuestPhysicalAddress> for GuestPhysicalPage<S> {
    type Error = GuestPhysicalAddress;

    /// Accepts only addresses already aligned to `S`; hands back the
    /// offending address otherwise.
    #[inline]
    fn try_from(a: GuestPhysicalAddress) -> Result<Self, Self::Error> {
        match MemoryPage::from_aligned(a.0) {
            Some(p) => Ok(Self(p)),
            None => Err(a),
        }
    }
}
