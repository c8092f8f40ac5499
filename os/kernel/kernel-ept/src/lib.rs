//! # Extended Page Tables (EPT)
//!
//! Second-level address translation for a VMX hypervisor: the structure that
//! turns a **guest-physical** address into a **host-physical** one, plus the
//! machinery that keeps it consistent while several virtual CPUs fault on it.
//!
//! ## What you get
//! - An [`EptContext`]: one guest address space (root table, counters, lock).
//! - Bit-exact hardware words: [`EptEntry`], [`EptPointer`], [`ExitQualification`].
//! - Mapping at 4 KiB / 2 MiB / 1 GiB [`Granularity`], with large-page splitting.
//! - A violation resolver ([`EptContext::handle_violation`]) driven by a
//!   [`ViolationPolicy`] owned by the virtual machine.
//! - A tiny allocator/mapper interface ([`FrameAlloc`], [`PhysMapper`]) and a
//!   heap-backed [`FrameArena`] implementing both.
//!
//! ## Guest-Physical → Host-Physical Walk
//!
//! A 48-bit guest-physical address is divided into five fields:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! Each field indexes one level of 512 eight-byte entries:
//!
//! ```text
//!  EPTP → PML4 → PDPT → PD → PT → host page
//!           │      │      │     │
//!           │      │      │     └──► 4 KiB leaf
//!           │      │      └────────► large page bit → 2 MiB leaf
//!           │      └───────────────► large page bit → 1 GiB leaf
//!           └──────────────────────► always points at a PDPT
//! ```
//!
//! | Level | Table | Leaf? | Span of one entry |
//! |:------|:------|:------|:------------------|
//! | 4 | PML4 | never | 512 GiB |
//! | 3 | PDPT | 1 GiB with large page bit | 1 GiB |
//! | 2 | PD | 2 MiB with large page bit | 2 MiB |
//! | 1 | PT | always | 4 KiB |
//!
//! Unlike ordinary paging there is no "present" bit: an entry is usable by the
//! processor as soon as any of read / write / execute is set. Non-terminal
//! entries always carry all three; the effective permission is decided at the
//! leaf.
//!
//! ## Ownership
//!
//! - Every non-terminal entry exclusively owns its child table frame.
//! - Leaf host frames belong to whoever supplied them; the context never
//!   releases them.
//! - Tables emptied by unmapping stay linked for reuse until the context is
//!   destroyed.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod arena;
mod context;
mod entry;
mod error;
mod granularity;
mod guest_memory;
mod invalidation;
mod mapping;
mod permissions;
mod pointer;
mod split;
mod table;
mod violation;
mod walker;

use core::ptr::NonNull;

pub use crate::arena::FrameArena;
pub use crate::context::{ArenaContext, EptConfig, EptContext, EptStats};
pub use crate::entry::{EntryKind, EptEntry};
pub use crate::error::{EptError, MapRangeError};
pub use crate::granularity::{Granularity, MapGranularity};
pub use crate::guest_memory::{HostSegment, HostSegments};
#[cfg(all(feature = "asm", target_arch = "x86_64"))]
pub use crate::invalidation::Invept;
pub use crate::invalidation::{EptInvalidator, InvalidationRange, NoopInvalidator};
pub use crate::mapping::{Mapping, Translation};
pub use crate::permissions::{EptPermissions, MemoryType};
pub use crate::pointer::EptPointer;
pub use crate::table::{ENTRIES_PER_TABLE, EptLevel, EptTable, TableIndex};
pub use crate::violation::{
    DenyAll, ExitQualification, FatalReason, FatalViolation, LazyMapping, Resolution, ResolvedBy,
    Upgrade, ViolationKind, ViolationPolicy, ViolationRecord,
};

pub use kernel_memory_addresses::{
    GuestPhysicalAddress, GuestPhysicalPage, HostPhysicalAddress, HostPhysicalPage, PageSize,
    Size1G, Size2M, Size4K,
};

/// A 4 KiB host frame holding one EPT table.
pub type HostFrame = HostPhysicalPage<Size4K>;

/// Guest-physical addresses must stay below 2^48 (four-level walk).
pub const GUEST_PHYSICAL_LIMIT: u64 = 1 << 48;

/// Host-physical addresses must stay below 2^52 (architectural maximum).
pub const HOST_PHYSICAL_LIMIT: u64 = 1 << 52;

/// Source of 4 KiB host frames for EPT tables.
///
/// Frames handed out must be page aligned and zero filled. The context only
/// ever uses them as tables; leaf memory comes from the caller directly.
pub trait FrameAlloc {
    /// Allocate one frame, `None` when exhausted.
    fn acquire_frame(&mut self) -> Option<HostFrame>;

    /// Return a frame previously handed out by [`acquire_frame`](Self::acquire_frame).
    fn release_frame(&mut self, frame: HostFrame);
}

/// Makes host frames addressable from the code maintaining the tables.
///
/// Typical patterns:
/// - **Hypervisor**: a higher-half direct map; adds a constant offset.
/// - **Tests**: a heap arena keyed by synthetic frame numbers.
pub trait PhysMapper {
    /// Pointer to the table stored in `frame`.
    ///
    /// # Safety
    /// `frame` must be a live table frame obtained from the matching
    /// [`FrameAlloc`]. The pointer is valid until the frame is released;
    /// callers must serialize writes.
    unsafe fn table_ptr(&self, frame: HostFrame) -> NonNull<EptTable>;
}

impl<F: FrameAlloc + ?Sized> FrameAlloc for &mut F {
    fn acquire_frame(&mut self) -> Option<HostFrame> {
        (**self).acquire_frame()
    }

    fn release_frame(&mut self, frame: HostFrame) {
        (**self).release_frame(frame);
    }
}

impl<M: PhysMapper + ?Sized> PhysMapper for &M {
    unsafe fn table_ptr(&self, frame: HostFrame) -> NonNull<EptTable> {
        unsafe { (**self).table_ptr(frame) }
    }
}

/// Align `x` down to the nearest multiple of `a` (power of two).
#[inline]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    debug_assert!(a.is_power_of_two());
    x & !(a - 1)
}

/// Whether `x` is a multiple of `a` (power of two).
#[inline]
#[must_use]
pub const fn is_aligned(x: u64, a: u64) -> bool {
    debug_assert!(a.is_power_of_two());
    x & (a - 1) == 0
}
