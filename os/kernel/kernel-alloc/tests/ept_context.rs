//! A context on a bitmap allocator, reaching its tables through an HHDM
//! mapper whose "direct map" is a heap buffer.

use kernel_alloc::frame_alloc::BitmapFrameAlloc;
use kernel_alloc::phys_mapper::HhdmPhysMapper;
use kernel_ept::{
    EptContext, EptError, EptPermissions, EptTable, GuestPhysicalAddress, HostPhysicalAddress,
    MemoryType, NoopInvalidator,
};

const REGION: u64 = 0x4000_0000;
const FRAMES: usize = 16;

/// Heap memory posing as `[REGION, REGION + FRAMES * 4 KiB)`.
fn direct_map() -> (Vec<EptTable>, HhdmPhysMapper) {
    let mut buf: Vec<EptTable> = (0..FRAMES).map(|_| EptTable::zeroed()).collect();
    let va = buf.as_mut_ptr() as u64;
    (buf, HhdmPhysMapper::new(va.wrapping_sub(REGION)))
}

fn gpa(v: u64) -> GuestPhysicalAddress {
    GuestPhysicalAddress::new(v)
}

fn hpa(v: u64) -> HostPhysicalAddress {
    HostPhysicalAddress::new(v)
}

#[test]
fn context_lifecycle_on_bitmap_frames() {
    let (_buf, mapper) = direct_map();
    let alloc =
        BitmapFrameAlloc::<_, 1>::new(HostPhysicalAddress::new(REGION), FRAMES, mapper).unwrap();
    let ctx = EptContext::create(alloc, mapper, NoopInvalidator).unwrap();
    assert_eq!(ctx.root().base(), HostPhysicalAddress::new(REGION));

    ctx.map_page(gpa(0x1000), hpa(0x8_0000_0000), EptPermissions::ALL)
        .unwrap();
    ctx.map_page_2m(gpa(0x4000_0000), hpa(0x8_0020_0000), EptPermissions::READ)
        .unwrap();
    assert_eq!(ctx.get_host_phys(gpa(0x1234)), hpa(0x8_0000_0234));
    assert_eq!(ctx.get_host_phys(gpa(0x4010_0000)), hpa(0x8_0030_0000));
    // root, PDPT, 2 PDs, one PT
    assert_eq!(ctx.stats().table_frames, 5);

    let stats = ctx.destroy();
    assert_eq!(stats.table_frames, 5);
    assert_eq!(stats.mapped_pages, 513);
}

#[test]
fn exhausted_region_surfaces_as_alloc_failed() {
    let (_buf, mapper) = direct_map();
    // root + PDPT + PD
    let alloc = BitmapFrameAlloc::<_, 1>::new(HostPhysicalAddress::new(REGION), 3, mapper).unwrap();
    let ctx = EptContext::create(alloc, mapper, NoopInvalidator).unwrap();

    ctx.map_page_2m(gpa(0), hpa(0), EptPermissions::ALL)
        .unwrap();
    assert_eq!(
        ctx.map_page(gpa(0x1000), hpa(0x1000), EptPermissions::ALL),
        Err(EptError::AllocFailed)
    );
    // the large page is intact
    assert_eq!(ctx.get_host_phys(gpa(0x1000)), hpa(0x1000));
    assert_eq!(ctx.mapped_pages(), 512);
}

#[test]
fn frames_are_zeroed_on_reuse() {
    let (_buf, mapper) = direct_map();
    let mut alloc =
        BitmapFrameAlloc::<_, 1>::new(HostPhysicalAddress::new(REGION), FRAMES, mapper).unwrap();

    {
        let ctx = EptContext::create(&mut alloc, mapper, NoopInvalidator).unwrap();
        ctx.map_range(
            gpa(0),
            hpa(0x10_0000),
            0x8000,
            EptPermissions::READ,
            MemoryType::WriteBack,
        )
        .unwrap();
    }
    assert_eq!(alloc.used_frames(), 0);

    // a new context starts from clean tables on the same frames
    let ctx = EptContext::create(&mut alloc, mapper, NoopInvalidator).unwrap();
    assert_eq!(ctx.get_host_phys(gpa(0)), HostPhysicalAddress::zero());
    assert!(ctx.mappings().is_empty());
    assert_eq!(ctx.root().base(), HostPhysicalAddress::new(REGION));
}
