//! # Kernel synchronization primitives
//!
//! A reader/writer spin lock for structures that see many concurrent
//! lookups and rare, short mutations (e.g. second-level translation tables).
//!
//! The lock is split the same way as a classic kernel mutex: a raw lock
//! ([`RawRwSpin`]) that only knows about state words, and a typed wrapper
//! ([`RwLock`]) that owns the data and hands out RAII guards.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod raw_rw_spin;
mod rw_lock;

pub use raw_rw_spin::RawRwSpin;
pub use rw_lock::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Type-erased shared/exclusive lock state.
pub trait RawRwLock {
    fn lock_shared(&self);
    fn try_lock_shared(&self) -> bool;
    fn lock_exclusive(&self);
    fn try_lock_exclusive(&self) -> bool;
}

pub trait RawRwUnlock {
    /// # Safety
    /// The caller must hold a shared lock acquired from this instance.
    unsafe fn unlock_shared(&self);

    /// # Safety
    /// The caller must hold the exclusive lock acquired from this instance.
    unsafe fn unlock_exclusive(&self);
}
