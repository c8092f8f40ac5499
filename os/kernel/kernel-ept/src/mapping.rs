//! # Mapping engine
//!
//! Installs, replaces and removes terminal entries at 4 KiB, 2 MiB and
//! 1 GiB granularity while keeping the page-unit counters in step.
//!
//! ## Rules
//!
//! | Target slot holds | Action | Counter delta (page units) |
//! |:------------------|:-------|:---------------------------|
//! | nothing | install leaf | `+new` |
//! | leaf of the same size | overwrite | `0` |
//! | a larger leaf above | split, then continue | `0` for the split |
//! | a finer table | replace, retire the subtree | `+new − mapped below` |
//!
//! Retired table frames are handed back to the allocator only after the
//! context has invalidated, so the processor never walks a reused frame.
//!
//! Every mutation records the guest-physical span it changed; the context
//! turns the union of those spans into one invalidation.

use crate::context::EptState;
use crate::entry::{EntryKind, EptEntry};
use crate::error::{EptError, MapRangeError};
use crate::granularity::Granularity;
use crate::invalidation::InvalidationRange;
use crate::permissions::{EptPermissions, MemoryType};
use crate::split::split_large;
use crate::walker::{Lookup, Slot, Tables, Walk};
use crate::{
    FrameAlloc, GUEST_PHYSICAL_LIMIT, HOST_PHYSICAL_LIMIT, HostFrame, PhysMapper, align_down,
    is_aligned,
};
use kernel_memory_addresses::{GuestPhysicalAddress, HostPhysicalAddress};
use log::{debug, trace, warn};

/// Result of translating one guest-physical address.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Translation {
    /// The address that was translated.
    pub guest: GuestPhysicalAddress,
    /// Where it lands in host-physical memory.
    pub host: HostPhysicalAddress,
    /// Size of the terminal mapping that governs it.
    pub granularity: Granularity,
    pub permissions: EptPermissions,
    pub memory_type: Option<MemoryType>,
    /// The terminal entry itself.
    pub entry: EptEntry,
}

impl Translation {
    pub(crate) fn from_slot(gpa: GuestPhysicalAddress, slot: Slot) -> Option<Self> {
        let granularity = slot.level.granularity()?;
        let offset = gpa.as_u64() & (granularity.size() - 1);
        Some(Self {
            guest: gpa,
            host: slot.entry.address() + offset,
            granularity,
            permissions: slot.entry.permissions(),
            memory_type: slot.entry.memory_type(),
            entry: slot.entry,
        })
    }

    /// Host base of the governing mapping.
    #[inline]
    #[must_use]
    pub const fn host_base(&self) -> HostPhysicalAddress {
        self.entry.address()
    }

    /// Bytes from `guest` to the end of the governing mapping.
    #[inline]
    #[must_use]
    pub const fn remaining(&self) -> u64 {
        self.granularity.size() - (self.guest.as_u64() & (self.granularity.size() - 1))
    }
}

/// One terminal mapping, as listed by [`EptContext::mappings`](crate::EptContext::mappings).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub guest: GuestPhysicalAddress,
    pub host: HostPhysicalAddress,
    pub granularity: Granularity,
    pub permissions: EptPermissions,
    pub memory_type: Option<MemoryType>,
}

impl Mapping {
    pub(crate) fn from_slot(guest: GuestPhysicalAddress, slot: Slot) -> Option<Self> {
        Some(Self {
            guest,
            host: slot.entry.address(),
            granularity: slot.level.granularity()?,
            permissions: slot.entry.permissions(),
            memory_type: slot.entry.memory_type(),
        })
    }
}

/// Mutation access to one context's tables, held under its write lock.
pub(crate) struct Engine<'a, A: FrameAlloc, M: PhysMapper> {
    tables: Tables<'a, M>,
    state: &'a mut EptState<A>,
    pending: Option<InvalidationRange>,
}

impl<'a, A: FrameAlloc, M: PhysMapper> Engine<'a, A, M> {
    /// # Safety
    /// Same contract as [`Tables::new`]; additionally the caller must hold
    /// the context's write lock for `'a`.
    pub(crate) unsafe fn new(root: HostFrame, mapper: &'a M, state: &'a mut EptState<A>) -> Self {
        Self {
            tables: unsafe { Tables::new(root, mapper) },
            state,
            pending: None,
        }
    }

    /// Span to invalidate for everything done so far.
    pub(crate) const fn pending(&self) -> Option<InvalidationRange> {
        self.pending
    }

    fn touch(&mut self, range: InvalidationRange) {
        self.pending = Some(range.merge_into(self.pending));
    }

    pub(crate) fn translate(&self, gpa: GuestPhysicalAddress) -> Option<Translation> {
        if gpa.as_u64() >= GUEST_PHYSICAL_LIMIT {
            return None;
        }
        Translation::from_slot(gpa, self.tables.leaf(gpa)?)
    }

    /// Whether anything is mapped inside the `granularity`-sized span at `gpa`.
    pub(crate) fn occupied(&self, gpa: GuestPhysicalAddress, granularity: Granularity) -> bool {
        gpa.as_u64() < GUEST_PHYSICAL_LIMIT && self.tables.occupied(gpa, granularity.level())
    }

    /// Install one leaf of size `granularity`.
    pub(crate) fn map(
        &mut self,
        gpa: GuestPhysicalAddress,
        host: HostPhysicalAddress,
        permissions: EptPermissions,
        memory_type: MemoryType,
        granularity: Granularity,
    ) -> Result<(), EptError> {
        check_span(gpa.as_u64(), granularity.size(), GUEST_PHYSICAL_LIMIT)?;
        check_span(host.as_u64(), granularity.size(), HOST_PHYSICAL_LIMIT)?;
        check_aligned(gpa.as_u64(), granularity)?;
        check_aligned(host.as_u64(), granularity)?;
        if !permissions.is_valid() {
            return Err(EptError::InvalidPermissions(permissions));
        }

        let target = granularity.level();
        let slot = loop {
            let walked = self.tables.walk_create(&mut self.state.alloc, gpa, target)?;
            self.state.table_frames += walked.created;
            match walked.walk {
                Walk::Target(slot) => break slot,
                Walk::LargeLeaf(large) => {
                    split_large(&self.tables, &mut self.state.alloc, large, gpa)?;
                    self.state.table_frames += 1;
                    self.touch(InvalidationRange::range(large.base(gpa), large.level.span()));
                }
            }
        };

        let removed = match (slot.entry.kind(target), target.child()) {
            (None, _) => 0,
            (Some(EntryKind::Leaf { granularity, .. }), _) => granularity.page_units(),
            (Some(EntryKind::Table(child)), Some(child_level)) => {
                let units = self.tables.mapped_units(child, child_level);
                let before = self.state.retired.len();
                self.tables
                    .collect_tables(child, child_level, &mut self.state.retired);
                debug!(
                    "ept: {granularity} page at {gpa} replaces {} tables ({units} pages)",
                    self.state.retired.len() - before
                );
                units
            }
            (Some(EntryKind::Table(_)), None) => 0,
        };

        self.tables.write(
            slot.table,
            slot.index,
            EptEntry::leaf(host, permissions, memory_type, target),
        );
        self.state.mapped_pages = self.state.mapped_pages - removed + granularity.page_units();
        self.touch(InvalidationRange::range(gpa, granularity.size()));

        trace!("ept: map {gpa} -> {host} {granularity} {permissions:?} {memory_type}");
        Ok(())
    }

    /// Clear the terminal entry covering `gpa`, whatever its size.
    pub(crate) fn unmap(&mut self, gpa: GuestPhysicalAddress) -> Result<Granularity, EptError> {
        let slot = self.leaf_or_not_mapped(gpa)?;
        let Some(granularity) = slot.level.granularity() else {
            return Err(EptError::NotMapped(gpa));
        };

        self.tables.write(slot.table, slot.index, EptEntry::new());
        self.state.mapped_pages -= granularity.page_units();
        self.touch(InvalidationRange::range(slot.base(gpa), granularity.size()));

        trace!("ept: unmap {gpa} ({granularity} at {})", slot.base(gpa));
        Ok(granularity)
    }

    /// Rewrite only the permission bits of the terminal entry covering `gpa`.
    pub(crate) fn set_permissions(
        &mut self,
        gpa: GuestPhysicalAddress,
        permissions: EptPermissions,
    ) -> Result<(), EptError> {
        if !permissions.is_valid() {
            return Err(EptError::InvalidPermissions(permissions));
        }
        let slot = self.leaf_or_not_mapped(gpa)?;

        self.tables
            .write(slot.table, slot.index, slot.entry.with_permissions(permissions));
        self.touch(InvalidationRange::range(slot.base(gpa), slot.level.span()));

        trace!(
            "ept: protect {gpa} {:?} -> {permissions:?}",
            slot.entry.permissions()
        );
        Ok(())
    }

    fn leaf_or_not_mapped(&self, gpa: GuestPhysicalAddress) -> Result<Slot, EptError> {
        if gpa.as_u64() >= GUEST_PHYSICAL_LIMIT {
            return Err(EptError::AddressOutOfRange(gpa.as_u64()));
        }
        self.tables.leaf(gpa).ok_or(EptError::NotMapped(gpa))
    }

    /// Map `[gpa, gpa + size)` to `[host, host + size)` with the largest
    /// granularity each position allows.
    pub(crate) fn map_range(
        &mut self,
        gpa: GuestPhysicalAddress,
        host: HostPhysicalAddress,
        size: u64,
        permissions: EptPermissions,
        memory_type: MemoryType,
    ) -> Result<(), MapRangeError> {
        check_range(gpa.as_u64(), size, GUEST_PHYSICAL_LIMIT).map_err(MapRangeError::at_start)?;
        check_range(host.as_u64(), size, HOST_PHYSICAL_LIMIT).map_err(MapRangeError::at_start)?;

        let mut done = 0;
        while done < size {
            let (g, h) = (gpa + done, host + done);
            let granularity = Granularity::DESCENDING
                .into_iter()
                .find(|gr| {
                    gr.size() <= size - done
                        && is_aligned(g.as_u64(), gr.size())
                        && is_aligned(h.as_u64(), gr.size())
                })
                .unwrap_or(Granularity::Size4K);

            if let Err(source) = self.map(g, h, permissions, memory_type, granularity) {
                warn!("ept: map_range {gpa}+{size:#x} stopped after {done:#x} bytes: {source}");
                return Err(MapRangeError {
                    mapped: done,
                    source,
                });
            }
            done += granularity.size();
        }

        debug!("ept: mapped range {gpa}+{size:#x} -> {host} {permissions:?} {memory_type}");
        Ok(())
    }

    /// Clear every terminal entry inside `[gpa, gpa + size)`.
    ///
    /// Large leaves crossing either boundary are split first so that only
    /// the inside is removed. Returns the number of 4 KiB page units removed.
    pub(crate) fn unmap_range(
        &mut self,
        gpa: GuestPhysicalAddress,
        size: u64,
    ) -> Result<u64, MapRangeError> {
        check_range(gpa.as_u64(), size, GUEST_PHYSICAL_LIMIT).map_err(MapRangeError::at_start)?;

        let start = gpa.as_u64();
        let end = start + size;
        let mut cur = start;
        let mut units = 0;
        while cur < end {
            let at = GuestPhysicalAddress::new(cur);
            match self.tables.lookup(at) {
                Lookup::Hole { level } => cur = align_down(cur, level.span()) + level.span(),
                Lookup::Leaf(slot) => {
                    let span = slot.level.span();
                    let base = align_down(cur, span);
                    let result = if base >= start && base + span <= end {
                        self.unmap(at).map(|g| {
                            units += g.page_units();
                            cur = base + span;
                        })
                    } else {
                        split_large(&self.tables, &mut self.state.alloc, slot, at).map(|_| {
                            self.state.table_frames += 1;
                        })
                    };
                    if let Err(source) = result {
                        warn!(
                            "ept: unmap_range {gpa}+{size:#x} stopped after {:#x} bytes: {source}",
                            cur - start
                        );
                        return Err(MapRangeError {
                            mapped: cur - start,
                            source,
                        });
                    }
                    if base < start || base + span > end {
                        self.touch(InvalidationRange::range(
                            GuestPhysicalAddress::new(base),
                            span,
                        ));
                    }
                }
            }
        }

        debug!("ept: unmapped range {gpa}+{size:#x} ({units} pages)");
        Ok(units)
    }
}

fn check_span(addr: u64, len: u64, limit: u64) -> Result<(), EptError> {
    match addr.checked_add(len) {
        Some(end) if end <= limit => Ok(()),
        _ => Err(EptError::AddressOutOfRange(addr)),
    }
}

const fn check_aligned(addr: u64, granularity: Granularity) -> Result<(), EptError> {
    if is_aligned(addr, granularity.size()) {
        Ok(())
    } else {
        Err(EptError::Misaligned {
            address: addr,
            granularity,
        })
    }
}

fn check_range(addr: u64, size: u64, limit: u64) -> Result<(), EptError> {
    if size == 0 {
        return Err(EptError::EmptyRange);
    }
    check_aligned(addr, Granularity::Size4K)?;
    check_aligned(size, Granularity::Size4K)?;
    check_span(addr, size, limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::EptLevel;

    #[test]
    fn span_checks() {
        assert!(check_span(0, 4096, GUEST_PHYSICAL_LIMIT).is_ok());
        assert_eq!(
            check_span(GUEST_PHYSICAL_LIMIT - 4096, 8192, GUEST_PHYSICAL_LIMIT),
            Err(EptError::AddressOutOfRange(GUEST_PHYSICAL_LIMIT - 4096))
        );
        assert!(check_span(u64::MAX, 1, u64::MAX).is_err());
    }

    #[test]
    fn range_checks() {
        assert_eq!(check_range(0, 0, u64::MAX), Err(EptError::EmptyRange));
        assert_eq!(
            check_range(0x1000, 0x800, u64::MAX),
            Err(EptError::Misaligned {
                address: 0x800,
                granularity: Granularity::Size4K
            })
        );
        assert!(check_range(0x1000, 0x2000, u64::MAX).is_ok());
    }

    #[test]
    fn translation_offsets_into_the_mapping() {
        let slot = Slot {
            table: HostFrame::from_addr(HostPhysicalAddress::new(0x1000)),
            index: crate::TableIndex::new(1),
            level: EptLevel::Pd,
            entry: EptEntry::leaf(
                HostPhysicalAddress::new(0x40_0000),
                EptPermissions::ALL,
                MemoryType::WriteBack,
                EptLevel::Pd,
            ),
        };
        let t = Translation::from_slot(GuestPhysicalAddress::new(0x20_0100), slot).unwrap();
        assert_eq!(t.host.as_u64(), 0x40_0100);
        assert_eq!(t.host_base().as_u64(), 0x40_0000);
        assert_eq!(t.granularity, Granularity::Size2M);
        assert_eq!(t.remaining(), 0x20_0000 - 0x100);
    }
}
