use crate::{HostPhysicalPage, MemoryAddress, MemoryAddressOffset, PageSize};
use core::fmt;
use core::ops::{Add, AddAssign};

/// Host-physical address.
///
/// A real machine address: the output of the EPT walk, and the address of
/// every EPT table frame. Like [`GuestPhysicalAddress`](super::GuestPhysicalAddress)
/// this type carries intent and prevents GPA↔HPA mix-ups.
///
/// ### Notes
/// - EPT entries store a **page-aligned** host base (low `S::SHIFT` bits
///   cleared); use `split::<S>()` to reason about base vs. offset explicitly.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct HostPhysicalAddress(pub(crate) MemoryAddress);

impl HostPhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new(0)
    }

    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(MemoryAddress::new(v))
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn page<S: PageSize>(self) -> HostPhysicalPage<S> {
        HostPhysicalPage::<S>::from_addr(self)
    }

    #[inline]
    #[must_use]
    pub const fn offset<S: PageSize>(self) -> MemoryAddressOffset<S> {
        self.0.offset::<S>()
    }

    #[inline]
    #[must_use]
    pub const fn split<S: PageSize>(self) -> (HostPhysicalPage<S>, MemoryAddressOffset<S>) {
        (self.page::<S>(), self.offset::<S>())
    }
}

impl fmt::Debug for HostPhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HPA(0x{:016X})", self.as_u64())
    }
}

impl fmt::Display for HostPhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.as_u64())
    }
}

impl From<u64> for HostPhysicalAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl<S> From<HostPhysicalPage<S>> for HostPhysicalAddress
where
    S: PageSize,
{
    fn from(value: HostPhysicalPage<S>) -> Self {
        value.base()
    }
}

impl Add<u64> for HostPhysicalAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for HostPhysicalAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}
