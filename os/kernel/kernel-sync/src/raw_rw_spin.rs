use crate::{RawRwLock, RawRwUnlock};
use core::hint::spin_loop;
use core::sync::atomic::{AtomicU32, Ordering};

/// Held exclusively.
const WRITER: u32 = 1 << 31;
/// A writer is waiting; new readers back off.
const PENDING: u32 = 1 << 30;
/// Low bits count active readers.
const READERS: u32 = PENDING - 1;

/// Writer-preferring reader/writer spin lock state.
///
/// ```text
///  31      30       29 .. 0
/// +------+---------+-------------+
/// |WRITER| PENDING | reader count|
/// +------+---------+-------------+
/// ```
///
/// A spinning writer raises `PENDING`, which stops new readers from entering.
/// Readers already inside drain, and the writer takes over. This keeps a
/// steady stream of lookups from starving a mutation.
pub struct RawRwSpin {
    state: AtomicU32,
}

impl Default for RawRwSpin {
    fn default() -> Self {
        Self::new()
    }
}

impl RawRwSpin {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
        }
    }

    /// Number of readers currently inside.
    #[inline]
    pub fn readers(&self) -> u32 {
        self.state.load(Ordering::Relaxed) & READERS
    }

    /// Whether a writer currently holds the lock.
    #[inline]
    pub fn is_write_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) & WRITER != 0
    }

    #[inline]
    pub fn read(&self) {
        while !self.try_read() {
            while self.state.load(Ordering::Relaxed) & (WRITER | PENDING) != 0 {
                spin_loop();
            }
        }
    }

    #[inline]
    pub fn try_read(&self) -> bool {
        let mut s = self.state.load(Ordering::Relaxed);
        loop {
            if s & (WRITER | PENDING) != 0 {
                return false;
            }
            debug_assert!(s & READERS < READERS, "reader count overflow");
            match self
                .state
                .compare_exchange_weak(s, s + 1, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(cur) => s = cur,
            }
        }
    }

    #[inline]
    pub fn write(&self) {
        loop {
            let s = self.state.load(Ordering::Relaxed);
            if s & !PENDING == 0 {
                // Acquiring clears PENDING; other waiting writers re-raise it.
                if self
                    .state
                    .compare_exchange_weak(s, WRITER, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
            } else if s & PENDING == 0 {
                self.state.fetch_or(PENDING, Ordering::Relaxed);
            }
            spin_loop();
        }
    }

    #[inline]
    pub fn try_write(&self) -> bool {
        let s = self.state.load(Ordering::Relaxed);
        s & !PENDING == 0
            && self
                .state
                .compare_exchange(s, WRITER, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
    }

    /// # Safety
    /// Caller must hold a read lock.
    #[inline]
    pub unsafe fn unlock_read(&self) {
        let prev = self.state.fetch_sub(1, Ordering::Release);
        debug_assert!(prev & READERS != 0, "unlock_read without readers");
    }

    /// # Safety
    /// Caller must hold the write lock.
    #[inline]
    pub unsafe fn unlock_write(&self) {
        let prev = self.state.fetch_and(!WRITER, Ordering::Release);
        debug_assert!(prev & WRITER != 0, "unlock_write without writer");
    }
}

impl RawRwLock for RawRwSpin {
    fn lock_shared(&self) {
        self.read();
    }

    fn try_lock_shared(&self) -> bool {
        self.try_read()
    }

    fn lock_exclusive(&self) {
        self.write();
    }

    fn try_lock_exclusive(&self) -> bool {
        self.try_write()
    }
}

impl RawRwUnlock for RawRwSpin {
    unsafe fn unlock_shared(&self) {
        unsafe { self.unlock_read() }
    }

    unsafe fn unlock_exclusive(&self) {
        unsafe { self.unlock_write() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readers_share() {
        let l = RawRwSpin::new();
        assert!(l.try_read());
        assert!(l.try_read());
        assert_eq!(l.readers(), 2);
        assert!(!l.try_write());
        unsafe {
            l.unlock_read();
            l.unlock_read();
        }
        assert!(l.try_write());
        assert!(l.is_write_locked());
        assert!(!l.try_read());
        unsafe { l.unlock_write() };
        assert!(!l.is_write_locked());
    }

    #[test]
    fn pending_writer_blocks_new_readers() {
        let l = RawRwSpin::new();
        assert!(l.try_read());
        l.state.fetch_or(PENDING, Ordering::Relaxed);
        assert!(!l.try_read());
        unsafe { l.unlock_read() };
        // A pending bit alone does not stop a writer.
        assert!(l.try_write());
        unsafe { l.unlock_write() };
        assert_eq!(l.state.load(Ordering::Relaxed), 0);
    }
}
