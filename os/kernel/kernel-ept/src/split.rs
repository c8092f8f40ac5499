//! # Large-page splitting
//!
//! Replaces one 1 GiB or 2 MiB leaf by a full table of 512 leaves one level
//! down that reproduce it exactly:
//!
//! ```text
//!   before                         after
//!   PD[i] = 2M leaf @ H, RWX, WB   PD[i] = table ─► PT[0]   = 4K @ H + 0 KiB,  RWX, WB
//!                                                  PT[1]   = 4K @ H + 4 KiB,  RWX, WB
//!                                                  ...
//!                                                  PT[511] = 4K @ H + 2044 KiB, RWX, WB
//! ```
//!
//! The child table is fully written while still unlinked; the parent then
//! switches from leaf to table with a single store. A concurrent hardware
//! walk therefore sees either the old large page or the complete table.
//! Page-unit counters do not change: 512 children cover exactly the parent.

use crate::entry::EptEntry;
use crate::error::EptError;
use crate::table::EptLevel;
use crate::walker::{Slot, Tables};
use crate::{FrameAlloc, HostFrame, PhysMapper};
use kernel_memory_addresses::GuestPhysicalAddress;
use log::{debug, error};

/// Split the large leaf in `slot`, which covers `gpa`.
///
/// Returns the frame of the new table.
///
/// # Errors
/// [`EptError::AllocFailed`] if no frame is available; the leaf is untouched.
///
/// # Panics
/// If `slot` does not hold a large leaf.
pub(crate) fn split_large<M: PhysMapper>(
    tables: &Tables<'_, M>,
    alloc: &mut dyn FrameAlloc,
    slot: Slot,
    gpa: GuestPhysicalAddress,
) -> Result<HostFrame, EptError> {
    let child_level = match slot.level.child() {
        Some(level) if slot.entry.is_present() && slot.entry.is_leaf(slot.level) => level,
        _ => panic!(
            "ept: split of non-leaf entry {:?} at {:?}",
            slot.entry, slot.level
        ),
    };

    let Some(frame) = alloc.acquire_frame() else {
        error!("ept: out of table frames splitting {:?} page at {gpa}", slot.level);
        return Err(EptError::AllocFailed);
    };

    let parent = slot.entry;
    let host = parent.address();
    let step = child_level.span();
    let large = !matches!(child_level, EptLevel::Pt);
    tables.fill(frame, |i| {
        parent
            .with_address(host + i.as_usize() as u64 * step)
            .with_large_page(large)
    });
    tables.write(slot.table, slot.index, EptEntry::table(frame));

    debug!(
        "ept: split {:?} page {} -> {} into {:?} table {}",
        slot.level,
        slot.base(gpa),
        host,
        child_level,
        frame.base()
    );
    Ok(frame)
}
