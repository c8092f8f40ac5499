//! # Bare-Metal Table Frame Allocation
//!
//! The pieces a hypervisor needs to back [`kernel_ept`] contexts with real
//! host memory instead of a heap arena:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    EptContext                       │
//! │    • walks, maps, splits, tears down                │
//! └───────────┬─────────────────────────┬───────────────┘
//!             │ FrameAlloc              │ PhysMapper
//! ┌───────────▼─────────────┐ ┌─────────▼───────────────┐
//! │   BitmapFrameAlloc      │ │    HhdmPhysMapper       │
//! │  • fixed host region    │ │  • frame + constant     │
//! │  • one bit per frame    │ │    direct-map offset    │
//! │  • zero-fills on hand   │ │                         │
//! │    out (via mapper)     │ │                         │
//! └─────────────────────────┘ └─────────────────────────┘
//! ```
//!
//! ## Physical Frame Allocator ([`frame_alloc`])
//!
//! * **No heap**: the bitmap is a fixed array sized by a const parameter.
//! * **Fixed region**: manages `[base, base + frames * 4 KiB)` of host memory
//!   reserved for EPT tables.
//! * **Tolerant release**: frames outside the region or not currently handed
//!   out are logged and ignored.
//!
//! ## Physical Mapper ([`phys_mapper`])
//!
//! With a higher-half direct map every host frame is visible at
//! `offset + pa`. The mapper is `Copy`, so the allocator (which zero-fills
//! through it) and the context (which walks through it) can each hold one.
//!
//! ## Usage
//! ```rust,no_run
//! use kernel_alloc::frame_alloc::BitmapFrameAlloc;
//! use kernel_alloc::phys_mapper::HhdmPhysMapper;
//! use kernel_ept::{EptContext, HostPhysicalAddress, NoopInvalidator};
//!
//! let mapper = HhdmPhysMapper::new(0xFFFF_8000_0000_0000);
//! // 16 MiB of host memory reserved for tables
//! let alloc = BitmapFrameAlloc::<_, 64>::new(
//!     HostPhysicalAddress::new(0x4000_0000),
//!     4096,
//!     mapper,
//! )
//! .unwrap();
//! let ctx = EptContext::create(alloc, mapper, NoopInvalidator).unwrap();
//! let eptp = ctx.build_pointer();
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod frame_alloc;
pub mod phys_mapper;
