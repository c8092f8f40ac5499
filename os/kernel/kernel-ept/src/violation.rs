//! # EPT violation resolution
//!
//! A guest access that the tables do not allow exits to the hypervisor with
//! an exit qualification describing what was attempted and what the
//! translation allowed. The virtual-CPU loop decodes it into a
//! [`ViolationRecord`] and hands it to [`EptContext::handle_violation`],
//! which answers with exactly one [`Resolution`]:
//!
//! ```text
//!   record ──misconfigured──────────────────────────────► Fatal(Misconfigured)
//!     │
//!     ▼  (write lock, live table re-read)
//!   live leaf allows access ────────────────────────────► Resolved(Spurious)
//!   no leaf ──► policy.populate ──Some, covers──► map ──► Resolved(Populated)
//!     │             │           └─None / elsewhere──────► Fatal(Unbacked)
//!     │             └─span partly mapped──► map 4K page ► Resolved(Populated)
//!   leaf denies ──► policy.upgrade ──grants access──────► Resolved(Upgraded)
//!                                  └─None / too weak────► Fatal(Forbidden)
//! ```
//!
//! The live table is re-inspected under the write lock, so when two virtual
//! CPUs fault on the same page the second one finds the first one's fix and
//! reports `Spurious` instead of populating twice. A lazy mapping larger than
//! 4 KiB is installed only if its whole span is still unmapped; otherwise
//! just the 4 KiB page holding the fault is populated from it, leaving the
//! existing neighbours alone. The resolver never retries; re-executing the
//! faulting instruction is up to the caller.

use crate::context::EptContext;
use crate::entry::EptEntry;
use crate::error::EptError;
use crate::granularity::Granularity;
use crate::invalidation::EptInvalidator;
use crate::mapping::{Engine, Translation};
use crate::permissions::{EptPermissions, MemoryType};
use crate::{FrameAlloc, PhysMapper, align_down};
use bitfield_struct::bitfield;
use core::fmt;
use kernel_memory_addresses::{GuestPhysicalAddress, HostPhysicalAddress};
use log::{debug, trace, warn};

/// Exit qualification of an EPT violation exit.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct ExitQualification {
    /// The access was a data read (bit 0).
    pub read: bool,
    /// The access was a data write (bit 1).
    pub write: bool,
    /// The access was an instruction fetch (bit 2).
    pub execute: bool,
    /// The translation allowed reads (bit 3).
    pub readable: bool,
    /// The translation allowed writes (bit 4).
    pub writable: bool,
    /// The translation allowed (supervisor) execution (bit 5).
    pub executable: bool,
    /// The translation allowed user-mode execution (bit 6).
    pub user_executable: bool,
    /// The guest-linear address field is valid (bit 7).
    pub linear_valid: bool,
    /// The access was to the final translation rather than to a guest
    /// paging structure (bit 8; meaningful only with bit 7).
    pub final_translation: bool,
    /// Guest-linear access was user-mode (bit 9).
    pub user_linear: bool,
    /// Guest-linear address was writable (bit 10).
    pub writable_linear: bool,
    /// Guest-linear address was execute-disable (bit 11).
    pub execute_disable_linear: bool,
    /// NMI unblocking due to IRET (bit 12).
    pub nmi_unblocking: bool,
    /// Shadow-stack access (bit 13).
    pub shadow_stack: bool,
    /// Supervisor shadow-stack control (bit 14).
    pub supervisor_shadow_stack: bool,
    #[bits(49)]
    __reserved: u64,
}

impl ExitQualification {
    /// Access the guest attempted.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn attempted(self) -> EptPermissions {
        EptPermissions::from_bits_truncate(self.into_bits() as u8 & 0b111)
    }

    /// Access the translation allowed at fault time.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn allowed(self) -> EptPermissions {
        EptPermissions::from_bits_truncate((self.into_bits() >> 3) as u8 & 0b111)
    }
}

/// How a violation relates to the table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ViolationKind {
    /// Nothing maps the address.
    NotPresent,
    /// Mapped, but not for this access.
    PermissionDenied,
    /// The entry itself is invalid (write without read, reserved memory type).
    Misconfigured,
}

impl ViolationKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotPresent => "not present",
            Self::PermissionDenied => "permission denied",
            Self::Misconfigured => "misconfigured",
        }
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One translation fault, as seen by the resolver.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ViolationRecord {
    pub guest_physical: GuestPhysicalAddress,
    /// Present when the qualification marks the linear address valid.
    pub guest_linear: Option<u64>,
    /// Attempted access.
    pub access: EptPermissions,
    /// Whether the address was mapped when the fault happened.
    pub present: bool,
    /// Fault on the final translation rather than a guest paging-structure access.
    pub final_translation: bool,
    /// Terminal entry covering the address at fault time; zero if none.
    pub entry: EptEntry,
    pub qualification: ExitQualification,
}

impl ViolationRecord {
    /// Decode an exit.
    ///
    /// `entry` is the snapshot of the terminal entry at fault time (see
    /// [`EptContext::record_violation`]).
    #[must_use]
    pub const fn from_exit(
        qualification: ExitQualification,
        guest_physical: GuestPhysicalAddress,
        guest_linear: u64,
        entry: EptEntry,
    ) -> Self {
        Self {
            guest_physical,
            guest_linear: if qualification.linear_valid() {
                Some(guest_linear)
            } else {
                None
            },
            access: qualification.attempted(),
            present: entry.is_present() || !qualification.allowed().is_empty(),
            final_translation: qualification.final_translation(),
            entry,
            qualification,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ViolationKind {
        if self.entry.is_misconfigured() {
            ViolationKind::Misconfigured
        } else if self.present {
            ViolationKind::PermissionDenied
        } else {
            ViolationKind::NotPresent
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_write(&self) -> bool {
        self.access.contains(EptPermissions::WRITE)
    }
}

/// A mapping a policy wants installed for a not-present fault.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LazyMapping {
    pub guest: GuestPhysicalAddress,
    pub host: HostPhysicalAddress,
    pub granularity: Granularity,
    pub permissions: EptPermissions,
    pub memory_type: MemoryType,
}

impl LazyMapping {
    /// Whether the mapping would contain `gpa`.
    #[must_use]
    pub const fn covers(&self, gpa: GuestPhysicalAddress) -> bool {
        gpa.as_u64() >= self.guest.as_u64()
            && gpa.as_u64() - self.guest.as_u64() < self.granularity.size()
    }

    /// The 4 KiB slice of this mapping that contains `gpa`, which must be
    /// [covered](Self::covers).
    #[must_use]
    pub fn page_at(&self, gpa: GuestPhysicalAddress) -> Self {
        let page = align_down(gpa.as_u64(), Granularity::Size4K.size());
        Self {
            guest: GuestPhysicalAddress::new(page),
            host: self.host + (page - self.guest.as_u64()),
            granularity: Granularity::Size4K,
            ..*self
        }
    }
}

/// How a policy grants an access that the current mapping denies.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Upgrade {
    /// Replace the permissions of the whole governing mapping.
    Permissions(EptPermissions),
    /// Point the faulting 4 KiB page at a new frame (copy-on-write), splitting
    /// a large mapping if needed.
    Remap {
        host: HostPhysicalAddress,
        permissions: EptPermissions,
    },
}

/// Decisions owned by the virtual machine.
///
/// Called with the context's write lock held: implementations must not call
/// back into the same context.
pub trait ViolationPolicy {
    /// What to map for an unbacked address, if anything.
    fn populate(&mut self, record: &ViolationRecord) -> Option<LazyMapping> {
        let _ = record;
        None
    }

    /// Whether to grant an access the live `translation` denies.
    fn upgrade(&mut self, record: &ViolationRecord, translation: &Translation) -> Option<Upgrade> {
        let _ = (record, translation);
        None
    }
}

/// Resolves nothing; every real violation is fatal.
#[derive(Copy, Clone, Debug, Default)]
pub struct DenyAll;

impl ViolationPolicy for DenyAll {}

/// Outcome of one violation.
#[must_use]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Re-execute the faulting instruction.
    Resolved(ResolvedBy),
    /// Surface to the guest or stop the virtual machine.
    Fatal(FatalViolation),
}

impl Resolution {
    #[inline]
    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }

    fn fatal(record: ViolationRecord, reason: FatalReason) -> Self {
        warn!(
            "ept: fatal {} violation at {} ({:?}): {reason}",
            record.kind(),
            record.guest_physical,
            record.access
        );
        Self::Fatal(FatalViolation { record, reason })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ResolvedBy {
    /// The policy supplied a mapping.
    Populated,
    /// The policy granted the access.
    Upgraded,
    /// Already fixed, typically by another virtual CPU.
    Spurious,
}

/// An unresolvable violation with the record that caused it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("fatal EPT violation at {gpa} ({access:?})", gpa = .record.guest_physical, access = .record.access)]
pub struct FatalViolation {
    pub record: ViolationRecord,
    #[source]
    pub reason: FatalReason,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FatalReason {
    /// No mapping and the policy supplied none.
    #[error("address is not backed")]
    Unbacked,
    /// Mapped, and the policy refused the access.
    #[error("access is forbidden")]
    Forbidden,
    #[error("entry is misconfigured")]
    Misconfigured,
    /// The policy answered but installing it failed.
    #[error("installing the policy's mapping failed: {0}")]
    PopulateFailed(#[source] EptError),
}

impl<A: FrameAlloc, M: PhysMapper, I: EptInvalidator> EptContext<A, M, I> {
    /// Decode an exit, snapshotting the terminal entry currently covering
    /// `guest_physical`.
    #[must_use]
    pub fn record_violation(
        &self,
        qualification: ExitQualification,
        guest_physical: GuestPhysicalAddress,
        guest_linear: u64,
    ) -> ViolationRecord {
        ViolationRecord::from_exit(
            qualification,
            guest_physical,
            guest_linear,
            self.get_entry(guest_physical),
        )
    }

    /// Resolve one violation against the live table.
    ///
    /// Any mapping change is invalidated before this returns.
    pub fn handle_violation<P: ViolationPolicy + ?Sized>(
        &self,
        record: &ViolationRecord,
        policy: &mut P,
    ) -> Resolution {
        if record.kind() == ViolationKind::Misconfigured {
            return Resolution::fatal(*record, FatalReason::Misconfigured);
        }

        let default_mt = self.config().default_memory_type;
        self.mutate(|e| match e.translate(record.guest_physical) {
            Some(t) if t.permissions.contains(record.access) => {
                trace!(
                    "ept: spurious violation at {} ({:?})",
                    record.guest_physical, record.access
                );
                Resolution::Resolved(ResolvedBy::Spurious)
            }
            None => populate(e, record, policy),
            Some(t) => upgrade(e, record, &t, policy, default_mt),
        })
    }
}

fn populate<A: FrameAlloc, M: PhysMapper, P: ViolationPolicy + ?Sized>(
    e: &mut Engine<'_, A, M>,
    record: &ViolationRecord,
    policy: &mut P,
) -> Resolution {
    let gpa = record.guest_physical;
    let Some(mut lazy) = policy.populate(record).filter(|m| m.covers(gpa)) else {
        return Resolution::fatal(*record, FatalReason::Unbacked);
    };
    if lazy.granularity != Granularity::Size4K && e.occupied(lazy.guest, lazy.granularity) {
        debug!(
            "ept: {} lazy mapping at {} overlaps live mappings, populating {gpa} only",
            lazy.granularity, lazy.guest
        );
        lazy = lazy.page_at(gpa);
    }
    match e.map(
        lazy.guest,
        lazy.host,
        lazy.permissions,
        lazy.memory_type,
        lazy.granularity,
    ) {
        Ok(()) => {
            trace!("ept: populated {} for fault at {gpa}", lazy.guest);
            Resolution::Resolved(ResolvedBy::Populated)
        }
        Err(err) => Resolution::fatal(*record, FatalReason::PopulateFailed(err)),
    }
}

fn upgrade<A: FrameAlloc, M: PhysMapper, P: ViolationPolicy + ?Sized>(
    e: &mut Engine<'_, A, M>,
    record: &ViolationRecord,
    translation: &Translation,
    policy: &mut P,
    default_mt: MemoryType,
) -> Resolution {
    let gpa = record.guest_physical;
    let result = match policy.upgrade(record, translation) {
        Some(Upgrade::Permissions(p)) if p.contains(record.access) => e.set_permissions(gpa, p),
        Some(Upgrade::Remap { host, permissions }) if permissions.contains(record.access) => {
            let page = GuestPhysicalAddress::new(align_down(gpa.as_u64(), 4096));
            let mt = translation.memory_type.unwrap_or(default_mt);
            e.map(page, host, permissions, mt, Granularity::Size4K)
        }
        _ => return Resolution::fatal(*record, FatalReason::Forbidden),
    };
    match result {
        Ok(()) => {
            trace!("ept: upgraded {gpa} for {:?}", record.access);
            Resolution::Resolved(ResolvedBy::Upgraded)
        }
        Err(err) => Resolution::fatal(*record, FatalReason::PopulateFailed(err)),
    }
}
