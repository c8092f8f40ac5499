//! # Bitmap frame allocator for EPT tables
//!
//! Hands out 4 KiB frames from one fixed host-physical region, tracking
//! them with one bit per frame in an inline array (no heap):
//!
//! ```text
//!   bitmap[0] = 0b...0000_1011     frame 0, 1, 3 in use
//!   bitmap[1] = 0b...0000_0000
//!   ...
//!   bitmap[WORDS-1]                bits past `frames` are pre-set
//! ```
//!
//! Every acquired frame is zero-filled through the [`PhysMapper`] before it
//! is returned, as [`FrameAlloc`] requires.

use core::ptr;
use kernel_ept::{FrameAlloc, HOST_PHYSICAL_LIMIT, HostFrame, HostPhysicalAddress, PhysMapper};
use log::{trace, warn};

const FRAME_SIZE: u64 = 4096;

/// Why a region was refused.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegionError {
    #[error("region base {0} is not 4 KiB aligned")]
    Misaligned(HostPhysicalAddress),
    #[error("{frames} frames exceed the bitmap capacity of {capacity}")]
    TooLarge { frames: usize, capacity: usize },
    #[error("region at {0} extends past the host-physical limit")]
    OutOfRange(HostPhysicalAddress),
}

/// Frame allocator over `[base, base + frames * 4 KiB)`.
///
/// `WORDS` bounds the region to `WORDS * 64` frames.
pub struct BitmapFrameAlloc<M: PhysMapper, const WORDS: usize> {
    bitmap: [u64; WORDS],
    base: HostPhysicalAddress,
    frames: usize,
    free: usize,
    /// First word that may have a clear bit.
    hint: usize,
    mapper: M,
}

impl<M: PhysMapper, const WORDS: usize> BitmapFrameAlloc<M, WORDS> {
    /// Capacity in frames.
    pub const CAPACITY: usize = WORDS * 64;

    /// Manage `frames` frames starting at `base`.
    ///
    /// # Errors
    /// A [`RegionError`] if `base` is unaligned, the region does not fit the
    /// bitmap, or it reaches past 2^52.
    pub fn new(base: HostPhysicalAddress, frames: usize, mapper: M) -> Result<Self, RegionError> {
        if base.as_u64() % FRAME_SIZE != 0 {
            return Err(RegionError::Misaligned(base));
        }
        if frames > Self::CAPACITY {
            return Err(RegionError::TooLarge {
                frames,
                capacity: Self::CAPACITY,
            });
        }
        let end = (frames as u64)
            .checked_mul(FRAME_SIZE)
            .and_then(|len| base.as_u64().checked_add(len));
        if end.is_none_or(|end| end > HOST_PHYSICAL_LIMIT) {
            return Err(RegionError::OutOfRange(base));
        }

        let mut bitmap = [0; WORDS];
        // bits past the region are permanently taken
        for (w, word) in bitmap.iter_mut().enumerate() {
            let first = w * 64;
            if first >= frames {
                *word = u64::MAX;
            } else if frames - first < 64 {
                *word = u64::MAX << (frames - first);
            }
        }

        Ok(Self {
            bitmap,
            base,
            frames,
            free: frames,
            hint: 0,
            mapper,
        })
    }

    #[must_use]
    pub const fn base(&self) -> HostPhysicalAddress {
        self.base
    }

    /// Frames in the region.
    #[must_use]
    pub const fn frames(&self) -> usize {
        self.frames
    }

    #[must_use]
    pub const fn free_frames(&self) -> usize {
        self.free
    }

    #[must_use]
    pub const fn used_frames(&self) -> usize {
        self.frames - self.free
    }

    /// Whether `frame` is in the region and currently handed out.
    #[must_use]
    pub fn is_allocated(&self, frame: HostFrame) -> bool {
        self.index_of(frame)
            .is_some_and(|i| self.bitmap[i / 64] & (1 << (i % 64)) != 0)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn index_of(&self, frame: HostFrame) -> Option<usize> {
        let pa = frame.base().as_u64();
        let off = pa.checked_sub(self.base.as_u64())?;
        let i = (off / FRAME_SIZE) as usize;
        (i < self.frames).then_some(i)
    }

    fn frame_at(&self, i: usize) -> HostFrame {
        HostFrame::from_addr(self.base + i as u64 * FRAME_SIZE)
    }
}

impl<M: PhysMapper, const WORDS: usize> FrameAlloc for BitmapFrameAlloc<M, WORDS> {
    fn acquire_frame(&mut self) -> Option<HostFrame> {
        let (w, word) = self
            .bitmap
            .iter()
            .enumerate()
            .skip(self.hint)
            .find(|(_, word)| **word != u64::MAX)
            .map(|(w, word)| (w, *word))?;

        let bit = (!word).trailing_zeros() as usize;
        self.bitmap[w] |= 1 << bit;
        self.free -= 1;
        self.hint = w;

        let frame = self.frame_at(w * 64 + bit);
        // SAFETY: the frame is inside the region the mapper covers and was
        // free, so nobody else references it.
        unsafe {
            ptr::write_bytes(self.mapper.table_ptr(frame).as_ptr(), 0, 1);
        }
        trace!("bitmap: acquire {} ({} free)", frame.base(), self.free);
        Some(frame)
    }

    fn release_frame(&mut self, frame: HostFrame) {
        let Some(i) = self.index_of(frame) else {
            warn!("bitmap: release of {} outside the region ignored", frame.base());
            return;
        };
        let (w, mask) = (i / 64, 1 << (i % 64));
        if self.bitmap[w] & mask == 0 {
            warn!("bitmap: release of free frame {} ignored", frame.base());
            return;
        }
        self.bitmap[w] &= !mask;
        self.free += 1;
        self.hint = self.hint.min(w);
        trace!("bitmap: release {} ({} free)", frame.base(), self.free);
    }
}
