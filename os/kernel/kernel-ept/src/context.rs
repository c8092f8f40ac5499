//! # Translation context
//!
//! One guest-physical address space: the root table, its counters and the
//! lock that orders every change to it. Normally one per virtual machine,
//! shared (e.g. through an `Arc`) by all of its virtual CPUs.
//!
//! ## Concurrency
//!
//! - Lookups ([`translate`](EptContext::translate), [`get_host_phys`](EptContext::get_host_phys), …)
//!   take the read lock and run in parallel.
//! - Mutations take the write lock, change the tables, invalidate, and only
//!   then release the lock. A virtual CPU that resumes after a mutation
//!   returned can never use a stale translation for the changed range.
//! - Each entry is written with one 64-bit store, so the processor's own
//!   walker (which ignores the lock) sees either the old or the new entry.
//!
//! ## Counters
//!
//! `mapped_pages` counts 4 KiB page units reachable as leaves (a 2 MiB leaf
//! is 512, a 1 GiB leaf 262 144); `committed_bytes` is that times 4096. Both
//! are updated in the same critical section as the table change.

use crate::arena::FrameArena;
use crate::entry::EptEntry;
use crate::error::{EptError, MapRangeError};
use crate::granularity::{Granularity, MapGranularity};
use crate::invalidation::{EptInvalidator, InvalidationRange, NoopInvalidator};
use crate::mapping::{Engine, Mapping, Translation};
use crate::permissions::{EptPermissions, MemoryType};
use crate::pointer::EptPointer;
use crate::table::EptLevel;
use crate::walker::Tables;
use crate::{FrameAlloc, GUEST_PHYSICAL_LIMIT, HostFrame, PhysMapper};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_memory_addresses::{
    GuestPhysicalAddress, GuestPhysicalPage, HostPhysicalAddress, HostPhysicalPage,
};
use kernel_sync::RwLock;
use log::{debug, error, trace};

/// Run-time configuration of a context.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EptConfig {
    /// Memory type of the processor's own accesses to the tables.
    pub paging_memory_type: MemoryType,
    /// Enable EPT accessed/dirty flags.
    pub accessed_dirty: bool,
    /// Memory type for entry points that do not take one.
    pub default_memory_type: MemoryType,
}

impl Default for EptConfig {
    fn default() -> Self {
        Self {
            paging_memory_type: MemoryType::WriteBack,
            accessed_dirty: false,
            default_memory_type: MemoryType::WriteBack,
        }
    }
}

/// Aggregate counters of a context.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct EptStats {
    /// 4 KiB page units mapped.
    pub mapped_pages: u64,
    /// `mapped_pages * 4096`.
    pub committed_bytes: u64,
    /// Table frames in use, root included.
    pub table_frames: u64,
}

impl EptStats {
    const fn from_counters(mapped_pages: u64, table_frames: u64) -> Self {
        Self {
            mapped_pages,
            committed_bytes: mapped_pages * 4096,
            table_frames,
        }
    }
}

/// State guarded by the context lock.
pub(crate) struct EptState<A> {
    pub alloc: A,
    pub mapped_pages: u64,
    pub table_frames: u64,
    /// Table frames unlinked by the current mutation.
    pub retired: Vec<HostFrame>,
    torn_down: bool,
}

impl<A: FrameAlloc> EptState<A> {
    /// Release retired frames; only after the change was invalidated.
    fn reclaim(&mut self) {
        for frame in self.retired.drain(..) {
            self.alloc.release_frame(frame);
            self.table_frames -= 1;
        }
    }
}

/// A guest-physical address space backed by EPT tables.
pub struct EptContext<A: FrameAlloc, M: PhysMapper, I: EptInvalidator = NoopInvalidator> {
    state: RwLock<EptState<A>>,
    mapper: M,
    invalidator: I,
    config: EptConfig,
    root: HostFrame,
    eptp: EptPointer,
    generation: AtomicU64,
}

/// A context keeping its tables in a [`FrameArena`].
pub type ArenaContext<I = NoopInvalidator> = EptContext<FrameArena, FrameArena, I>;

impl<I: EptInvalidator> EptContext<FrameArena, FrameArena, I> {
    /// Context whose allocator and mapper share `arena`.
    ///
    /// # Errors
    /// [`EptError::AllocFailed`] if the root table cannot be allocated.
    pub fn in_arena(arena: &FrameArena, invalidator: I) -> Result<Self, EptError> {
        Self::create(arena.clone(), arena.clone(), invalidator)
    }
}

impl<A: FrameAlloc, M: PhysMapper, I: EptInvalidator> EptContext<A, M, I> {
    /// Allocate an empty root table with the default configuration.
    ///
    /// # Errors
    /// [`EptError::AllocFailed`] if the root table cannot be allocated.
    pub fn create(alloc: A, mapper: M, invalidator: I) -> Result<Self, EptError> {
        Self::create_with_config(alloc, mapper, invalidator, EptConfig::default())
    }

    /// Allocate an empty root table.
    ///
    /// # Errors
    /// [`EptError::AllocFailed`] if the root table cannot be allocated.
    pub fn create_with_config(
        mut alloc: A,
        mapper: M,
        invalidator: I,
        config: EptConfig,
    ) -> Result<Self, EptError> {
        let Some(root) = alloc.acquire_frame() else {
            error!("ept: out of table frames creating a context");
            return Err(EptError::AllocFailed);
        };
        // SAFETY: `root` was just acquired and is not linked anywhere.
        unsafe { Tables::new(root, &mapper) }.clear(root);

        let eptp = EptPointer::build(root, config.paging_memory_type, config.accessed_dirty);
        debug!(
            "ept: created context root {} eptp {:#018x}",
            root.base(),
            eptp.into_bits()
        );

        Ok(Self {
            state: RwLock::new(EptState {
                alloc,
                mapped_pages: 0,
                table_frames: 1,
                retired: Vec::new(),
                torn_down: false,
            }),
            mapper,
            invalidator,
            config,
            root,
            eptp,
            generation: AtomicU64::new(0),
        })
    }

    /// The value for the VMCS EPT pointer field.
    #[inline]
    #[must_use]
    pub const fn build_pointer(&self) -> EptPointer {
        self.eptp
    }

    /// Frame of the PML4.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> HostFrame {
        self.root
    }

    #[inline]
    #[must_use]
    pub const fn config(&self) -> &EptConfig {
        &self.config
    }

    #[must_use]
    pub fn stats(&self) -> EptStats {
        self.state
            .with_read(|s| EptStats::from_counters(s.mapped_pages, s.table_frames))
    }

    #[must_use]
    pub fn mapped_pages(&self) -> u64 {
        self.state.with_read(|s| s.mapped_pages)
    }

    #[must_use]
    pub fn committed_bytes(&self) -> u64 {
        self.stats().committed_bytes
    }

    /// Number of invalidations issued so far.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Run `f` on the tables under the read lock.
    pub(crate) fn with_tables<R>(&self, f: impl FnOnce(&Tables<'_, M>) -> R) -> R {
        let _guard = self.state.read();
        // SAFETY: the root and every linked table stay live while the
        // context does; the read lock excludes writers.
        let tables = unsafe { Tables::new(self.root, &self.mapper) };
        f(&tables)
    }

    /// Run `f` under the write lock, then invalidate whatever it changed
    /// and release the table frames it retired.
    pub(crate) fn mutate<R>(&self, f: impl FnOnce(&mut Engine<'_, A, M>) -> R) -> R {
        let mut state = self.state.write();
        let (result, pending) = {
            // SAFETY: write lock held for the engine's lifetime.
            let mut engine = unsafe { Engine::new(self.root, &self.mapper, &mut state) };
            let result = f(&mut engine);
            (result, engine.pending())
        };
        if let Some(range) = pending {
            self.flush(range);
        }
        state.reclaim();
        result
    }

    fn flush(&self, range: InvalidationRange) {
        self.invalidator.invalidate(self.eptp, range);
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        trace!("ept: invalidated {range} (generation {generation})");
    }

    /// Map one page of size `granularity`.
    ///
    /// Overwrites a mapping of the same size, splits a larger one, and
    /// replaces (and frees the tables of) finer ones.
    ///
    /// # Errors
    /// - [`EptError::Misaligned`] if either address is not aligned to `granularity`.
    /// - [`EptError::AddressOutOfRange`] beyond 2^48 (guest) or 2^52 (host).
    /// - [`EptError::InvalidPermissions`] for write without read.
    /// - [`EptError::AllocFailed`] if a table frame is needed and unavailable.
    pub fn map(
        &self,
        gpa: GuestPhysicalAddress,
        host: HostPhysicalAddress,
        permissions: EptPermissions,
        memory_type: MemoryType,
        granularity: Granularity,
    ) -> Result<(), EptError> {
        self.mutate(|e| e.map(gpa, host, permissions, memory_type, granularity))
    }

    /// Typed [`map`](Self::map); alignment is carried by the page types.
    ///
    /// # Errors
    /// As [`map`](Self::map), minus misalignment.
    pub fn map_typed<S: MapGranularity>(
        &self,
        guest: GuestPhysicalPage<S>,
        host: HostPhysicalPage<S>,
        permissions: EptPermissions,
        memory_type: MemoryType,
    ) -> Result<(), EptError> {
        self.map(
            guest.base(),
            host.base(),
            permissions,
            memory_type,
            S::GRANULARITY,
        )
    }

    /// Map a 4 KiB page with the configured default memory type.
    ///
    /// # Errors
    /// As [`map`](Self::map).
    pub fn map_page(
        &self,
        gpa: GuestPhysicalAddress,
        host: HostPhysicalAddress,
        permissions: EptPermissions,
    ) -> Result<(), EptError> {
        let mt = self.config.default_memory_type;
        self.map(gpa, host, permissions, mt, Granularity::Size4K)
    }

    /// Map a 2 MiB page with the configured default memory type.
    ///
    /// # Errors
    /// As [`map`](Self::map).
    pub fn map_page_2m(
        &self,
        gpa: GuestPhysicalAddress,
        host: HostPhysicalAddress,
        permissions: EptPermissions,
    ) -> Result<(), EptError> {
        let mt = self.config.default_memory_type;
        self.map(gpa, host, permissions, mt, Granularity::Size2M)
    }

    /// Map a 1 GiB page with the configured default memory type.
    ///
    /// # Errors
    /// As [`map`](Self::map).
    pub fn map_page_1g(
        &self,
        gpa: GuestPhysicalAddress,
        host: HostPhysicalAddress,
        permissions: EptPermissions,
    ) -> Result<(), EptError> {
        let mt = self.config.default_memory_type;
        self.map(gpa, host, permissions, mt, Granularity::Size1G)
    }

    /// Remove the mapping covering `gpa`, at whatever size it was made.
    ///
    /// Returns the size that was removed. The host frame is not touched.
    ///
    /// # Errors
    /// [`EptError::NotMapped`] if nothing covers `gpa`; nothing changes.
    pub fn unmap(&self, gpa: GuestPhysicalAddress) -> Result<Granularity, EptError> {
        self.mutate(|e| e.unmap(gpa))
    }

    /// Map `size` bytes using 1 GiB, 2 MiB and 4 KiB pages as alignment
    /// allows, with one invalidation for the whole range.
    ///
    /// # Errors
    /// [`MapRangeError`] with the prefix that was mapped before the failing
    /// segment. The prefix is not unwound.
    pub fn map_range(
        &self,
        gpa: GuestPhysicalAddress,
        host: HostPhysicalAddress,
        size: u64,
        permissions: EptPermissions,
        memory_type: MemoryType,
    ) -> Result<(), MapRangeError> {
        self.mutate(|e| e.map_range(gpa, host, size, permissions, memory_type))
    }

    /// Remove every mapping inside `[gpa, gpa + size)`, splitting large pages
    /// that straddle either end. Holes are skipped.
    ///
    /// Returns the number of 4 KiB page units removed.
    ///
    /// # Errors
    /// [`MapRangeError`] if a split runs out of frames.
    pub fn unmap_range(&self, gpa: GuestPhysicalAddress, size: u64) -> Result<u64, MapRangeError> {
        self.mutate(|e| e.unmap_range(gpa, size))
    }

    /// Replace the permissions of the mapping covering `gpa`. The mapping is
    /// changed as a whole; no splitting happens.
    ///
    /// # Errors
    /// [`EptError::NotMapped`] if nothing covers `gpa`.
    pub fn set_permissions(
        &self,
        gpa: GuestPhysicalAddress,
        permissions: EptPermissions,
    ) -> Result<(), EptError> {
        self.mutate(|e| e.set_permissions(gpa, permissions))
    }

    /// Terminal entry covering `gpa`; the zero entry if none.
    #[must_use]
    pub fn get_entry(&self, gpa: GuestPhysicalAddress) -> EptEntry {
        self.translate(gpa).map_or(EptEntry::new(), |t| t.entry)
    }

    /// Host address for `gpa`; zero if not mapped.
    #[must_use]
    pub fn get_host_phys(&self, gpa: GuestPhysicalAddress) -> HostPhysicalAddress {
        self.translate(gpa)
            .map_or(HostPhysicalAddress::zero(), |t| t.host)
    }

    #[must_use]
    pub fn translate(&self, gpa: GuestPhysicalAddress) -> Option<Translation> {
        if gpa.as_u64() >= GUEST_PHYSICAL_LIMIT {
            return None;
        }
        self.with_tables(|t| Translation::from_slot(gpa, t.leaf(gpa)?))
    }

    /// Every terminal mapping, in ascending guest-physical order.
    #[must_use]
    pub fn mappings(&self) -> Vec<Mapping> {
        self.with_tables(|t| {
            let mut out = Vec::new();
            t.for_each_leaf(self.root, EptLevel::Pml4, 0, &mut |gpa, slot| {
                out.extend(Mapping::from_slot(gpa, slot));
            });
            out
        })
    }

    /// Tear down and report what was released.
    ///
    /// Frees every table frame, root included; leaf host frames stay with
    /// their owner. Returns the counters as they were before teardown, with
    /// `table_frames` being the number of frames released.
    pub fn destroy(mut self) -> EptStats {
        self.teardown()
    }

    fn teardown(&mut self) -> EptStats {
        let state = self.state.get_mut();
        if state.torn_down {
            return EptStats::default();
        }

        // SAFETY: exclusive access through `&mut self`.
        let tables = unsafe { Tables::new(self.root, &self.mapper) };
        let mut frames = Vec::new();
        tables.collect_tables(self.root, EptLevel::Pml4, &mut frames);

        self.invalidator
            .invalidate(self.eptp, InvalidationRange::Context);
        self.generation.fetch_add(1, Ordering::AcqRel);

        let stats = EptStats::from_counters(state.mapped_pages, frames.len() as u64);
        for frame in frames {
            state.alloc.release_frame(frame);
        }
        state.mapped_pages = 0;
        state.table_frames = 0;
        state.torn_down = true;

        debug!(
            "ept: destroyed context root {} ({} tables released, {} pages were mapped)",
            self.root.base(),
            stats.table_frames,
            stats.mapped_pages
        );
        stats
    }
}

impl<A: FrameAlloc, M: PhysMapper, I: EptInvalidator> Drop for EptContext<A, M, I> {
    fn drop(&mut self) {
        self.teardown();
    }
}
