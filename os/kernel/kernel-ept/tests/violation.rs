use kernel_ept::{
    DenyAll, EptContext, EptEntry, EptError, EptPermissions, ExitQualification, FatalReason,
    FrameArena, Granularity, GuestPhysicalAddress, HostPhysicalAddress, LazyMapping, MemoryType,
    NoopInvalidator, Resolution, ResolvedBy, Translation, Upgrade, ViolationKind,
    ViolationPolicy, ViolationRecord,
};

fn gpa(v: u64) -> GuestPhysicalAddress {
    GuestPhysicalAddress::new(v)
}

fn hpa(v: u64) -> HostPhysicalAddress {
    HostPhysicalAddress::new(v)
}

fn write_fault() -> ExitQualification {
    ExitQualification::new().with_write(true)
}

/// Backs a 2 MiB guest window on demand, identity-offset into host memory.
struct LazyWindow {
    base: u64,
    host: u64,
    calls: usize,
}

impl ViolationPolicy for LazyWindow {
    fn populate(&mut self, record: &ViolationRecord) -> Option<LazyMapping> {
        self.calls += 1;
        let g = record.guest_physical.as_u64();
        if !(self.base..self.base + 0x20_0000).contains(&g) {
            return None;
        }
        let page = g & !0xFFF;
        Some(LazyMapping {
            guest: gpa(page),
            host: hpa(self.host + (page - self.base)),
            granularity: Granularity::Size4K,
            permissions: EptPermissions::READ_WRITE,
            memory_type: MemoryType::WriteBack,
        })
    }
}

/// Copy-on-write: a write to a read-only page gets a private frame.
struct CopyOnWrite {
    fresh: u64,
}

impl ViolationPolicy for CopyOnWrite {
    fn upgrade(&mut self, record: &ViolationRecord, t: &Translation) -> Option<Upgrade> {
        if !record.is_write() || !t.permissions.contains(EptPermissions::READ) {
            return None;
        }
        let host = hpa(self.fresh);
        self.fresh += 0x1000;
        Some(Upgrade::Remap {
            host,
            permissions: t.permissions | EptPermissions::WRITE,
        })
    }
}

/// Grants whatever it is told to.
struct Grant(EptPermissions);

impl ViolationPolicy for Grant {
    fn upgrade(&mut self, _: &ViolationRecord, _: &Translation) -> Option<Upgrade> {
        Some(Upgrade::Permissions(self.0))
    }
}

#[test]
fn write_to_read_only_page_is_fatal_under_deny_all() {
    let arena = FrameArena::new();
    let ctx = EptContext::in_arena(&arena, NoopInvalidator).unwrap();
    ctx.map_page(gpa(0x1000), hpa(0x8000), EptPermissions::READ)
        .unwrap();

    let q = write_fault().with_readable(true);
    let record = ctx.record_violation(q, gpa(0x1234), 0);
    assert_eq!(record.kind(), ViolationKind::PermissionDenied);

    let Resolution::Fatal(fatal) = ctx.handle_violation(&record, &mut DenyAll) else {
        panic!("expected a fatal violation");
    };
    assert_eq!(fatal.reason, FatalReason::Forbidden);
    assert!(fatal.record.is_write());
    assert!(fatal.record.present);
    assert_eq!(fatal.record.entry, ctx.get_entry(gpa(0x1000)));
    // nothing changed
    assert_eq!(
        ctx.translate(gpa(0x1000)).unwrap().permissions,
        EptPermissions::READ
    );
}

/// Offers one whole 2 MiB page for any fault inside it.
struct LargeBacking {
    host: u64,
}

impl ViolationPolicy for LargeBacking {
    fn populate(&mut self, record: &ViolationRecord) -> Option<LazyMapping> {
        let base = record.guest_physical.as_u64() & !0x1F_FFFF;
        Some(LazyMapping {
            guest: gpa(base),
            host: hpa(self.host + base),
            granularity: Granularity::Size2M,
            permissions: EptPermissions::READ_WRITE,
            memory_type: MemoryType::WriteBack,
        })
    }
}

#[test]
fn large_lazy_mapping_never_replaces_live_neighbours() {
    let arena = FrameArena::new();
    let ctx = EptContext::in_arena(&arena, NoopInvalidator).unwrap();
    ctx.map_page(gpa(0x1000), hpa(0x9000), EptPermissions::ALL)
        .unwrap();
    let mut policy = LargeBacking { host: 0x40_0000 };

    let record = ctx.record_violation(ExitQualification::new().with_read(true), gpa(0x2345), 0);
    assert_eq!(
        ctx.handle_violation(&record, &mut policy),
        Resolution::Resolved(ResolvedBy::Populated)
    );
    // the existing page keeps its frame, the faulting page gets its slice
    assert_eq!(ctx.get_host_phys(gpa(0x1000)), hpa(0x9000));
    assert_eq!(ctx.get_host_phys(gpa(0x2345)), hpa(0x40_2345));
    let t = ctx.translate(gpa(0x2000)).unwrap();
    assert_eq!(t.granularity, Granularity::Size4K);
    assert_eq!(t.permissions, EptPermissions::READ_WRITE);
    assert_eq!(ctx.get_host_phys(gpa(0x3000)), HostPhysicalAddress::zero());
    assert_eq!(ctx.mapped_pages(), 2);

    // an untouched 2 MiB window is still populated in one piece
    let record = ctx.record_violation(ExitQualification::new().with_read(true), gpa(0x40_1000), 0);
    assert_eq!(
        ctx.handle_violation(&record, &mut policy),
        Resolution::Resolved(ResolvedBy::Populated)
    );
    assert_eq!(
        ctx.translate(gpa(0x40_1000)).unwrap().granularity,
        Granularity::Size2M
    );
    assert_eq!(ctx.get_host_phys(gpa(0x5F_F000)), hpa(0x9F_F000));
    assert_eq!(ctx.mapped_pages(), 2 + 512);
}

#[test]
fn unbacked_access_is_fatal() {
    let arena = FrameArena::new();
    let ctx = EptContext::in_arena(&arena, NoopInvalidator).unwrap();
    let record = ctx.record_violation(ExitQualification::new().with_read(true), gpa(0x5000), 0);
    assert!(!record.present);
    assert_eq!(
        ctx.handle_violation(&record, &mut DenyAll),
        Resolution::Fatal(kernel_ept::FatalViolation {
            record,
            reason: FatalReason::Unbacked
        })
    );
}

#[test]
fn lazy_population_maps_the_faulting_page() {
    let arena = FrameArena::new();
    let ctx = EptContext::in_arena(&arena, NoopInvalidator).unwrap();
    let mut policy = LazyWindow {
        base: 0x20_0000,
        host: 0x80_0000,
        calls: 0,
    };

    let record = ctx.record_violation(write_fault(), gpa(0x20_3456), 0);
    assert_eq!(
        ctx.handle_violation(&record, &mut policy),
        Resolution::Resolved(ResolvedBy::Populated)
    );
    assert_eq!(ctx.get_host_phys(gpa(0x20_3456)), hpa(0x80_3456));
    assert_eq!(ctx.mapped_pages(), 1);

    // the same stale record again: already fixed, policy not consulted
    assert_eq!(
        ctx.handle_violation(&record, &mut policy),
        Resolution::Resolved(ResolvedBy::Spurious)
    );
    assert_eq!(policy.calls, 1);

    // outside the window
    let record = ctx.record_violation(write_fault(), gpa(0x40_0000), 0);
    assert!(matches!(
        ctx.handle_violation(&record, &mut policy),
        Resolution::Fatal(f) if f.reason == FatalReason::Unbacked
    ));
}

#[test]
fn populate_failure_is_reported() {
    // root only: the population cannot build its tables
    let arena = FrameArena::with_limit(1);
    let ctx = EptContext::in_arena(&arena, NoopInvalidator).unwrap();
    let mut policy = LazyWindow {
        base: 0,
        host: 0x10_0000,
        calls: 0,
    };
    let record = ctx.record_violation(write_fault(), gpa(0x1000), 0);
    assert!(matches!(
        ctx.handle_violation(&record, &mut policy),
        Resolution::Fatal(f) if f.reason == FatalReason::PopulateFailed(EptError::AllocFailed)
    ));
    assert_eq!(ctx.mapped_pages(), 0);
}

#[test]
fn copy_on_write_splits_a_large_page() {
    let arena = FrameArena::new();
    let ctx = EptContext::in_arena(&arena, NoopInvalidator).unwrap();
    ctx.map(
        gpa(0x20_0000),
        hpa(0x40_0000),
        EptPermissions::READ_EXECUTE,
        MemoryType::WriteThrough,
        Granularity::Size2M,
    )
    .unwrap();

    let mut policy = CopyOnWrite { fresh: 0x900_0000 };
    let q = write_fault().with_readable(true).with_executable(true);
    let record = ctx.record_violation(q, gpa(0x20_5008), 0);
    assert_eq!(
        ctx.handle_violation(&record, &mut policy),
        Resolution::Resolved(ResolvedBy::Upgraded)
    );

    let t = ctx.translate(gpa(0x20_5008)).unwrap();
    assert_eq!(t.host, hpa(0x900_0008));
    assert_eq!(t.granularity, Granularity::Size4K);
    assert_eq!(t.permissions, EptPermissions::ALL);
    assert_eq!(t.memory_type, Some(MemoryType::WriteThrough));

    // neighbours keep the shared read-only frame
    let n = ctx.translate(gpa(0x20_6000)).unwrap();
    assert_eq!(n.host, hpa(0x40_6000));
    assert_eq!(n.permissions, EptPermissions::READ_EXECUTE);
    assert_eq!(ctx.mapped_pages(), 512);
}

#[test]
fn permission_upgrade_must_cover_the_access() {
    let arena = FrameArena::new();
    let ctx = EptContext::in_arena(&arena, NoopInvalidator).unwrap();
    ctx.map_page(gpa(0x3000), hpa(0x3000), EptPermissions::READ)
        .unwrap();
    let q = ExitQualification::new()
        .with_execute(true)
        .with_readable(true);
    let record = ctx.record_violation(q, gpa(0x3000), 0);

    // a grant that still lacks execute is refused
    assert!(matches!(
        ctx.handle_violation(&record, &mut Grant(EptPermissions::READ_WRITE)),
        Resolution::Fatal(f) if f.reason == FatalReason::Forbidden
    ));

    assert_eq!(
        ctx.handle_violation(&record, &mut Grant(EptPermissions::READ_EXECUTE)),
        Resolution::Resolved(ResolvedBy::Upgraded)
    );
    assert_eq!(
        ctx.translate(gpa(0x3000)).unwrap().permissions,
        EptPermissions::READ_EXECUTE
    );
}

#[test]
fn misconfigured_entry_is_always_fatal() {
    let arena = FrameArena::new();
    let ctx = EptContext::in_arena(&arena, NoopInvalidator).unwrap();
    let bad = EptEntry::new()
        .with_write(true)
        .with_mapped(true)
        .with_memory_type_bits(6);
    let record = ViolationRecord::from_exit(write_fault(), gpa(0x1000), 0, bad);
    let mut policy = Grant(EptPermissions::ALL);

    let resolution = ctx.handle_violation(&record, &mut policy);
    assert!(!resolution.is_resolved());
    assert!(matches!(
        resolution,
        Resolution::Fatal(f) if f.reason == FatalReason::Misconfigured
    ));
    assert_eq!(ctx.mapped_pages(), 0);
}

#[test]
fn fatal_violation_displays_address() {
    let arena = FrameArena::new();
    let ctx = EptContext::in_arena(&arena, NoopInvalidator).unwrap();
    let record = ctx.record_violation(write_fault(), gpa(0xABC000), 0);
    let Resolution::Fatal(fatal) = ctx.handle_violation(&record, &mut DenyAll) else {
        panic!("expected a fatal violation");
    };
    let text = fatal.to_string();
    assert!(text.contains("0x0000000000ABC000"), "{text}");
    assert_eq!(fatal.reason.to_string(), "address is not backed");
}
