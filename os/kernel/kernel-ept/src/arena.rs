//! # Heap-backed frame arena
//!
//! A [`FrameAlloc`] and [`PhysMapper`] in one, for hosts that keep EPT tables
//! in ordinary heap memory (user-mode VMMs, unit tests, early bring-up).
//!
//! Each acquired frame is a synthetic host-physical page number mapped to a
//! heap-allocated, 4 KiB-aligned [`EptTable`] through a side table:
//!
//! ```text
//!   HostFrame 0x1000_0000 ─► Box<EptTable> @ heap
//!   HostFrame 0x1000_1000 ─► Box<EptTable> @ heap
//!   ...
//! ```
//!
//! Clones share the same arena, so the allocator handed to a context and the
//! mapper it walks with can be two handles to one pool.

use crate::table::EptTable;
use crate::{FrameAlloc, HostFrame, PhysMapper};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;
use kernel_memory_addresses::HostPhysicalAddress;
use kernel_sync::RwLock;
use log::trace;

/// First synthetic frame handed out.
const ARENA_BASE: u64 = 0x1000_0000;

struct ArenaInner {
    tables: BTreeMap<HostFrame, NonNull<EptTable>>,
    free: Vec<HostFrame>,
    next: u64,
    limit: Option<usize>,
    acquired: u64,
}

// SAFETY: every pointer in `tables` comes from `Box::into_raw` and is owned
// exclusively by the arena until released.
unsafe impl Send for ArenaInner {}
unsafe impl Sync for ArenaInner {}

impl Drop for ArenaInner {
    fn drop(&mut self) {
        for (_, ptr) in core::mem::take(&mut self.tables) {
            // SAFETY: allocated by `Box::new` in `acquire_frame`.
            drop(unsafe { Box::from_raw(ptr.as_ptr()) });
        }
    }
}

/// Shared pool of heap-allocated EPT tables.
#[derive(Clone)]
pub struct FrameArena {
    inner: Arc<RwLock<ArenaInner>>,
}

impl Default for FrameArena {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameArena {
    /// Unbounded arena.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(ArenaInner {
                tables: BTreeMap::new(),
                free: Vec::new(),
                next: ARENA_BASE,
                limit: None,
                acquired: 0,
            })),
        }
    }

    /// Arena that refuses to hold more than `frames` live frames at once.
    #[must_use]
    pub fn with_limit(frames: usize) -> Self {
        let arena = Self::new();
        arena.set_limit(Some(frames));
        arena
    }

    /// Change the live-frame limit; `None` removes it.
    pub fn set_limit(&self, frames: Option<usize>) {
        self.inner.with_write(|a| a.limit = frames);
    }

    /// Frames currently handed out.
    #[must_use]
    pub fn live_frames(&self) -> usize {
        self.inner.with_read(|a| a.tables.len())
    }

    /// Frames handed out over the arena's lifetime, reuse included.
    #[must_use]
    pub fn total_acquired(&self) -> u64 {
        self.inner.with_read(|a| a.acquired)
    }

    /// Whether `frame` is currently live.
    #[must_use]
    pub fn contains(&self, frame: HostFrame) -> bool {
        self.inner.with_read(|a| a.tables.contains_key(&frame))
    }
}

impl FrameAlloc for FrameArena {
    fn acquire_frame(&mut self) -> Option<HostFrame> {
        self.inner.with_write(|a| {
            if a.limit.is_some_and(|limit| a.tables.len() >= limit) {
                return None;
            }
            let frame = if let Some(frame) = a.free.pop() {
                frame
            } else {
                let frame = HostFrame::from_addr(HostPhysicalAddress::new(a.next));
                a.next += 4096;
                frame
            };
            let table = NonNull::from(Box::leak(Box::new(EptTable::zeroed())));
            a.tables.insert(frame, table);
            a.acquired += 1;
            trace!("arena: acquire {}", frame.base());
            Some(frame)
        })
    }

    fn release_frame(&mut self, frame: HostFrame) {
        self.inner.with_write(|a| {
            let Some(ptr) = a.tables.remove(&frame) else {
                panic!("arena: release of unknown frame {}", frame.base());
            };
            // SAFETY: allocated by `Box::new` in `acquire_frame`.
            drop(unsafe { Box::from_raw(ptr.as_ptr()) });
            a.free.push(frame);
            trace!("arena: release {}", frame.base());
        });
    }
}

impl PhysMapper for FrameArena {
    unsafe fn table_ptr(&self, frame: HostFrame) -> NonNull<EptTable> {
        match self.inner.with_read(|a| a.tables.get(&frame).copied()) {
            Some(ptr) => ptr,
            None => panic!("arena: frame {} is not live", frame.base()),
        }
    }
}
