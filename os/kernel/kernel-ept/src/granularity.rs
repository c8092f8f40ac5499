//! Mapping granularity, at runtime ([`Granularity`]) and at the type level
//! ([`MapGranularity`]).

use crate::table::EptLevel;
use core::fmt;
use kernel_memory_addresses::{PageSize, Size1G, Size2M, Size4K};

/// Size of one terminal mapping.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Granularity {
    /// 4 KiB, a PT leaf.
    Size4K,
    /// 2 MiB, a PD leaf with the large page bit.
    Size2M,
    /// 1 GiB, a PDPT leaf with the large page bit.
    Size1G,
}

impl Granularity {
    /// Largest first, the order range operations try them in.
    pub const DESCENDING: [Self; 3] = [Self::Size1G, Self::Size2M, Self::Size4K];

    #[inline]
    #[must_use]
    pub const fn size(self) -> u64 {
        match self {
            Self::Size4K => Size4K::SIZE,
            Self::Size2M => Size2M::SIZE,
            Self::Size1G => Size1G::SIZE,
        }
    }

    /// Number of 4 KiB page units one mapping of this size accounts for.
    #[inline]
    #[must_use]
    pub const fn page_units(self) -> u64 {
        match self {
            Self::Size4K => Size4K::PAGE_UNITS,
            Self::Size2M => Size2M::PAGE_UNITS,
            Self::Size1G => Size1G::PAGE_UNITS,
        }
    }

    /// Level whose entries hold leaves of this size.
    #[inline]
    #[must_use]
    pub const fn level(self) -> EptLevel {
        match self {
            Self::Size4K => EptLevel::Pt,
            Self::Size2M => EptLevel::Pd,
            Self::Size1G => EptLevel::Pdpt,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Size4K => "4K",
            Self::Size2M => "2M",
            Self::Size1G => "1G",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Page sizes that can be installed as an EPT leaf.
///
/// Lets typed entry points such as [`EptContext::map_typed`](crate::EptContext::map_typed)
/// pick the target level from the page type alone.
pub trait MapGranularity: PageSize {
    const GRANULARITY: Granularity;
}

impl MapGranularity for Size4K {
    const GRANULARITY: Granularity = Granularity::Size4K;
}

impl MapGranularity for Size2M {
    const GRANULARITY: Granularity = Granularity::Size2M;
}

impl MapGranularity for Size1G {
    const GRANULARITY: Granularity = Granularity::Size1G;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_agree_with_levels() {
        for g in Granularity::DESCENDING {
            assert_eq!(g.size(), g.level().span());
            assert_eq!(g.level().granularity(), Some(g));
            assert_eq!(g.page_units() * 4096, g.size());
        }
        assert_eq!(Granularity::Size2M.page_units(), 512);
        assert_eq!(Granularity::Size1G.page_units(), 262_144);
    }
}
