use crate::{EptPermissions, Granularity};
use kernel_memory_addresses::GuestPhysicalAddress;

/// Failure of a single EPT mutation.
///
/// A failed operation leaves the tables as they were, except where noted on
/// range operations (see [`MapRangeError`]).
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EptError {
    /// The frame allocator could not supply a table frame.
    #[error("out of memory (EPT table frame)")]
    AllocFailed,
    #[error("address {address:#x} is not aligned to {granularity}")]
    Misaligned {
        address: u64,
        granularity: Granularity,
    },
    #[error("address {0:#x} is outside the supported physical range")]
    AddressOutOfRange(u64),
    /// No terminal entry covers the address.
    #[error("guest-physical address {0} is not mapped")]
    NotMapped(GuestPhysicalAddress),
    /// Write without read cannot be expressed in a leaf.
    #[error("invalid permission combination {0:?}")]
    InvalidPermissions(EptPermissions),
    #[error("empty range")]
    EmptyRange,
}

/// A range operation stopped part-way.
///
/// Everything before `mapped` bytes from the start of the range was applied
/// and stays applied; nothing at or after it was touched.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[error("range operation failed after {mapped:#x} bytes: {source}")]
pub struct MapRangeError {
    pub mapped: u64,
    pub source: EptError,
}

impl MapRangeError {
    pub(crate) const fn at_start(source: EptError) -> Self {
        Self { mapped: 0, source }
    }
}
