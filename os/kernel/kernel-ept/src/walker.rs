//! # Table walker
//!
//! Walks from the root towards a target level, optionally creating missing
//! intermediate tables on the way.
//!
//! ```text
//!   walk_create(gpa, Pt)
//!
//!   PML4[i4] ──absent──► acquire frame, zero it, link as table ─┐
//!                                                               ▼
//!   PDPT[i3] ──large──► stop: LargeLeaf(slot), caller splits and walks again
//!                                                               │
//!   PD[i2]   ──table──► descend ◄───────────────────────────────┘
//!   PT[i1]   ──► Target(slot)
//! ```
//!
//! Entries are read and written one 64-bit word at a time through raw
//! pointers obtained from the [`PhysMapper`]; the processor walks the same
//! memory concurrently and must never see a torn entry. A walk that fails
//! to allocate unlinks and releases whatever it created before returning, so
//! no entry is ever left pointing at a frame the caller does not know about.

use crate::entry::{EntryKind, EptEntry};
use crate::error::EptError;
use crate::table::{EptLevel, EptTable, TableIndex};
use crate::{FrameAlloc, HostFrame, PhysMapper, align_down};
use alloc::vec::Vec;
use core::ptr;
use kernel_memory_addresses::GuestPhysicalAddress;
use log::{error, trace};

/// One entry location together with what it held when read.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Slot {
    pub table: HostFrame,
    pub index: TableIndex,
    pub level: EptLevel,
    pub entry: EptEntry,
}

impl Slot {
    /// First guest-physical address governed by this slot.
    #[inline]
    pub const fn base(&self, gpa: GuestPhysicalAddress) -> GuestPhysicalAddress {
        GuestPhysicalAddress::new(align_down(gpa.as_u64(), self.level.span()))
    }
}

/// Where a walk towards a target level stopped.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Walk {
    /// The slot at the target level; may be absent, a leaf or a table.
    Target(Slot),
    /// A large leaf above the target level.
    LargeLeaf(Slot),
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct Walked {
    pub walk: Walk,
    /// Intermediate tables linked by this walk.
    pub created: u64,
}

/// Result of a lookup for the terminal entry covering an address.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Lookup {
    Leaf(Slot),
    /// Nothing mapped; the absent entry was found at `level`.
    Hole { level: EptLevel },
}

/// Links created during one walk, for rollback.
#[derive(Default)]
struct Created {
    /// Slot in a pre-existing table that received the first new link.
    first: Option<(HostFrame, TableIndex)>,
    frames: [Option<HostFrame>; 3],
    count: usize,
}

impl Created {
    fn push(&mut self, table: HostFrame, index: TableIndex, frame: HostFrame) {
        if self.first.is_none() {
            self.first = Some((table, index));
        }
        self.frames[self.count] = Some(frame);
        self.count += 1;
    }
}

/// Typed access to one tree of EPT tables.
pub(crate) struct Tables<'m, M: PhysMapper> {
    root: HostFrame,
    mapper: &'m M,
}

impl<'m, M: PhysMapper> Tables<'m, M> {
    /// # Safety
    /// `root` and every table reachable from it must be live frames of
    /// `mapper`. Writes through the returned value must be serialized by the
    /// caller (the context's write lock); reads may run concurrently with
    /// other reads only.
    pub const unsafe fn new(root: HostFrame, mapper: &'m M) -> Self {
        Self { root, mapper }
    }

    #[inline]
    fn table_ptr(&self, frame: HostFrame) -> *mut EptTable {
        // SAFETY: frames handed to this type are live tables (see `new`).
        unsafe { self.mapper.table_ptr(frame) }.as_ptr()
    }

    /// Read one entry with a single 64-bit load.
    #[inline]
    pub fn read(&self, frame: HostFrame, i: TableIndex) -> EptEntry {
        // SAFETY: live table; entries are naturally aligned.
        unsafe { ptr::read_volatile(EptTable::entry_ptr(self.table_ptr(frame), i)) }
    }

    /// Replace one entry with a single 64-bit store.
    #[inline]
    pub fn write(&self, frame: HostFrame, i: TableIndex, e: EptEntry) {
        // SAFETY: live table; the caller holds the write lock.
        unsafe { ptr::write_volatile(EptTable::entry_ptr(self.table_ptr(frame), i), e) }
    }

    /// Zero a frame that is not linked anywhere yet.
    pub fn clear(&self, frame: HostFrame) {
        // SAFETY: live, unlinked table.
        unsafe { self.table_ptr(frame).write_bytes(0, 1) }
    }

    /// Initialize all 512 entries of an unlinked table.
    pub fn fill(&self, frame: HostFrame, f: impl Fn(TableIndex) -> EptEntry) {
        for i in TableIndex::all() {
            self.write(frame, i, f(i));
        }
    }

    /// Walk to `target`, linking fresh tables for absent entries on the way.
    ///
    /// # Errors
    /// [`EptError::AllocFailed`] if a frame could not be acquired; the tree is
    /// left exactly as it was before the call.
    pub fn walk_create(
        &self,
        alloc: &mut dyn FrameAlloc,
        gpa: GuestPhysicalAddress,
        target: EptLevel,
    ) -> Result<Walked, EptError> {
        let mut created = Created::default();
        let mut table = self.root;
        let mut level = EptLevel::Pml4;

        loop {
            let index = level.index_of(gpa);
            let entry = self.read(table, index);
            let slot = Slot {
                table,
                index,
                level,
                entry,
            };

            let child = match level.child() {
                Some(child) if level > target => child,
                _ => {
                    return Ok(Walked {
                        walk: Walk::Target(slot),
                        created: created.count as u64,
                    });
                }
            };

            if entry.is_present() {
                if entry.is_leaf(level) {
                    return Ok(Walked {
                        walk: Walk::LargeLeaf(slot),
                        created: created.count as u64,
                    });
                }
                table = entry.table_frame();
                level = child;
                continue;
            }

            let Some(frame) = alloc.acquire_frame() else {
                error!("ept: out of table frames walking {gpa} at {level:?}");
                self.rollback(&created, alloc);
                return Err(EptError::AllocFailed);
            };
            self.clear(frame);
            self.write(table, index, EptEntry::table(frame));
            created.push(table, index, frame);
            trace!("ept: linked {child:?} table {} for {gpa}", frame.base());

            table = frame;
            level = child;
        }
    }

    fn rollback(&self, created: &Created, alloc: &mut dyn FrameAlloc) {
        let Some((table, index)) = created.first else {
            return;
        };
        self.write(table, index, EptEntry::new());
        for frame in created.frames[..created.count].iter().rev().flatten() {
            alloc.release_frame(*frame);
        }
        trace!("ept: rolled back {} fresh tables", created.count);
    }

    /// The terminal entry covering `gpa`, at whatever level it lives.
    pub fn lookup(&self, gpa: GuestPhysicalAddress) -> Lookup {
        let mut table = self.root;
        let mut level = EptLevel::Pml4;
        loop {
            let index = level.index_of(gpa);
            let entry = self.read(table, index);
            match (entry.kind(level), level.child()) {
                (Some(EntryKind::Leaf { .. }), _) => {
                    return Lookup::Leaf(Slot {
                        table,
                        index,
                        level,
                        entry,
                    });
                }
                (Some(EntryKind::Table(next)), Some(child)) => {
                    table = next;
                    level = child;
                }
                _ => return Lookup::Hole { level },
            }
        }
    }

    #[inline]
    pub fn leaf(&self, gpa: GuestPhysicalAddress) -> Option<Slot> {
        match self.lookup(gpa) {
            Lookup::Leaf(slot) => Some(slot),
            Lookup::Hole { .. } => None,
        }
    }

    /// Visit every leaf below the table `frame` at `level`, which covers
    /// guest-physical space starting at `base`.
    pub fn for_each_leaf(
        &self,
        frame: HostFrame,
        level: EptLevel,
        base: u64,
        f: &mut dyn FnMut(GuestPhysicalAddress, Slot),
    ) {
        for (index, entry) in self.entries(frame) {
            let gpa = base + index.as_usize() as u64 * level.span();
            match (entry.kind(level), level.child()) {
                (Some(EntryKind::Leaf { .. }), _) => f(
                    GuestPhysicalAddress::new(gpa),
                    Slot {
                        table: frame,
                        index,
                        level,
                        entry,
                    },
                ),
                (Some(EntryKind::Table(next)), Some(child)) => {
                    self.for_each_leaf(next, child, gpa, f);
                }
                _ => {}
            }
        }
    }

    /// Whether any leaf lies inside the `target`-sized span around `gpa`.
    ///
    /// Empty retained tables do not count.
    pub fn occupied(&self, gpa: GuestPhysicalAddress, target: EptLevel) -> bool {
        let mut table = self.root;
        let mut level = EptLevel::Pml4;
        loop {
            let entry = self.read(table, level.index_of(gpa));
            match (entry.kind(level), level.child()) {
                (None, _) => return false,
                (Some(EntryKind::Leaf { .. }), _) => return true,
                (Some(EntryKind::Table(next)), Some(child)) if level > target => {
                    table = next;
                    level = child;
                }
                (Some(EntryKind::Table(next)), Some(child)) => {
                    return self.mapped_units(next, child) != 0;
                }
                (Some(EntryKind::Table(_)), None) => return false,
            }
        }
    }

    /// 4 KiB page units mapped below the table `frame` at `level`.
    pub fn mapped_units(&self, frame: HostFrame, level: EptLevel) -> u64 {
        let mut units = 0;
        self.for_each_leaf(frame, level, 0, &mut |_, slot| {
            units += slot.level.granularity().map_or(0, |g| g.page_units());
        });
        units
    }

    /// Append `frame` and every table below it to `out`, children first.
    pub fn collect_tables(&self, frame: HostFrame, level: EptLevel, out: &mut Vec<HostFrame>) {
        if let Some(child) = level.child() {
            for (_, entry) in self.entries(frame) {
                if let Some(EntryKind::Table(next)) = entry.kind(level) {
                    self.collect_tables(next, child, out);
                }
            }
        }
        out.push(frame);
    }

    fn entries(&self, frame: HostFrame) -> impl Iterator<Item = (TableIndex, EptEntry)> + '_ {
        TableIndex::all()
            .map(move |i| (i, self.read(frame, i)))
            .filter(|(_, e)| e.is_present())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::FrameArena;
    use crate::permissions::{EptPermissions, MemoryType};
    use kernel_memory_addresses::HostPhysicalAddress;

    fn setup(arena: &mut FrameArena) -> HostFrame {
        arena.acquire_frame().unwrap()
    }

    #[test]
    fn lookup_stops_at_absent_entries() {
        let mut arena = FrameArena::new();
        let root = setup(&mut arena);
        let t = unsafe { Tables::new(root, &arena) };
        let gpa = GuestPhysicalAddress::new(0x1234_5000);
        assert_eq!(t.lookup(gpa), Lookup::Hole { level: EptLevel::Pml4 });
        assert_eq!(arena.live_frames(), 1);
    }

    #[test]
    fn create_links_three_tables() {
        let mut arena = FrameArena::new();
        let root = setup(&mut arena);
        let mut alloc = arena.clone();
        let t = unsafe { Tables::new(root, &arena) };
        let gpa = GuestPhysicalAddress::new(0x1234_5000);

        let w = t.walk_create(&mut alloc, gpa, EptLevel::Pt).unwrap();
        assert_eq!(w.created, 3);
        let Walk::Target(slot) = w.walk else {
            panic!("expected target slot");
        };
        assert_eq!(slot.level, EptLevel::Pt);
        assert_eq!(slot.index, EptLevel::Pt.index_of(gpa));
        assert!(!slot.entry.is_present());
        assert_eq!(arena.live_frames(), 4);

        // Second walk reuses the chain.
        let w = t.walk_create(&mut alloc, gpa, EptLevel::Pt).unwrap();
        assert_eq!(w.created, 0);
        assert_eq!(t.lookup(gpa), Lookup::Hole { level: EptLevel::Pt });
    }

    #[test]
    fn failed_walk_rolls_back() {
        let mut arena = FrameArena::with_limit(3);
        let root = setup(&mut arena);
        let mut alloc = arena.clone();
        let t = unsafe { Tables::new(root, &arena) };
        let gpa = GuestPhysicalAddress::new(0x8000_0000);

        // Root + PDPT + PD fit, the PT does not.
        assert_eq!(
            t.walk_create(&mut alloc, gpa, EptLevel::Pt).unwrap_err(),
            EptError::AllocFailed
        );
        assert_eq!(arena.live_frames(), 1);
        assert!(!t.read(root, EptLevel::Pml4.index_of(gpa)).is_present());
    }

    #[test]
    fn occupancy_ignores_empty_tables() {
        let mut arena = FrameArena::new();
        let root = setup(&mut arena);
        let mut alloc = arena.clone();
        let t = unsafe { Tables::new(root, &arena) };
        let gpa = GuestPhysicalAddress::new(0x20_3000);

        assert!(!t.occupied(gpa, EptLevel::Pd));
        let Walk::Target(slot) = t.walk_create(&mut alloc, gpa, EptLevel::Pt).unwrap().walk else {
            panic!("expected target slot");
        };
        // an empty PT below the 2 MiB slot
        assert!(!t.occupied(gpa, EptLevel::Pd));

        let leaf = EptEntry::leaf(
            HostPhysicalAddress::new(0x9000),
            EptPermissions::READ,
            MemoryType::WriteBack,
            EptLevel::Pt,
        );
        t.write(slot.table, slot.index, leaf);
        assert!(t.occupied(GuestPhysicalAddress::new(0x20_0000), EptLevel::Pd));
        assert!(t.occupied(gpa, EptLevel::Pt));
        assert!(!t.occupied(GuestPhysicalAddress::new(0x20_4000), EptLevel::Pt));
        assert!(!t.occupied(GuestPhysicalAddress::new(0x40_0000), EptLevel::Pd));
    }

    #[test]
    fn walk_stops_at_large_leaf() {
        let mut arena = FrameArena::new();
        let root = setup(&mut arena);
        let mut alloc = arena.clone();
        let t = unsafe { Tables::new(root, &arena) };
        let gpa = GuestPhysicalAddress::new(0x4000_0000);

        let Walk::Target(slot) = t.walk_create(&mut alloc, gpa, EptLevel::Pdpt).unwrap().walk
        else {
            panic!("expected target slot");
        };
        let leaf = EptEntry::leaf(
            HostPhysicalAddress::new(0x8000_0000),
            EptPermissions::ALL,
            MemoryType::WriteBack,
            EptLevel::Pdpt,
        );
        t.write(slot.table, slot.index, leaf);

        let inner = GuestPhysicalAddress::new(0x4020_1000);
        match t.walk_create(&mut alloc, inner, EptLevel::Pt).unwrap().walk {
            Walk::LargeLeaf(s) => assert_eq!(s.level, EptLevel::Pdpt),
            Walk::Target(_) => panic!("walked through a large leaf"),
        }
        assert_eq!(t.leaf(inner).map(|s| s.level), Some(EptLevel::Pdpt));
        assert_eq!(t.mapped_units(root, EptLevel::Pml4), 262_144);

        let mut frames = Vec::new();
        t.collect_tables(root, EptLevel::Pml4, &mut frames);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames.last(), Some(&root));
    }
}
