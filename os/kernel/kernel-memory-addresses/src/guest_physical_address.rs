use crate::{GuestPhysicalPage, MemoryAddress, MemoryAddressOffset, PageSize};
use core::fmt;
use core::ops::{Add, AddAssign};

/// Guest-physical address.
///
/// What the virtual machine believes to be a physical address; the input of
/// the second-level (EPT) translation. Never dereferenceable by the host
/// without translating it first.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let gpa = GuestPhysicalAddress::new(0x0000_0001_2345_6789);
/// let (page, off) = gpa.split::<Size4K>();
/// assert_eq!(page.base().as_u64(), 0x0000_0001_2345_6000);
/// assert_eq!(off.as_u64(), 0x789);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct GuestPhysicalAddress(pub(crate) MemoryAddress);

impl GuestPhysicalAddress {
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
    pub const fn page<S: PageSize>(self) -> GuestPhysicalPage<S> {
        GuestPhysicalPage::<S>::from_addr(self)
    }

    #[inline]
    #[must_use]
    pub const fn offset<S: PageSize>(self) -> MemoryAddressOffset<S> {
        self.0.offset::<S>()
    }

    #[inline]
    #[must_use]
    pub const fn split<S: PageSize>(self) -> (GuestPhysicalPage<S>, MemoryAddressOffset<S>) {
        (self.page::<S>(), self.offset::<S>())
    }

    #[inline]
    #[must_use]
    pub const fn align_down<S: PageSize>(self) -> Self {
        Self(self.0.align_down::<S>())
    }
}

impl fmt::Debug for GuestPhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GPA(0x{:016X})", self.as_u64())
    }
}

impl fmt::Display for GuestPhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.as_u64())
    }
}

impl From<u64> for GuestPhysicalAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl<S> From<GuestPhysicalPage<S>> for GuestPhysicalAddress
where
    S: PageSize,
{
    fn from(value: GuestPhysicalPage<S>) -> Self {
        value.base()
    }
}

impl Add<u64> for GuestPhysicalAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for GuestPhysicalAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}
