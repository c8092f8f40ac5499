use crate::{RawRwLock, RawRwSpin, RawRwUnlock};
use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

/// Reader/writer lock owning a `T`, generic over the raw lock.
pub struct RwLock<T, R = RawRwSpin> {
    raw: R,
    cell: UnsafeCell<T>,
    _no_send_sync: PhantomData<*mut ()>, // !Send/!Sync by default; we implement below
}

// Readers on different threads see `&T` concurrently, hence `T: Sync`.
unsafe impl<T: Send + Sync, R: Sync> Sync for RwLock<T, R> {}
unsafe impl<T: Send, R: Send> Send for RwLock<T, R> {}

impl<T> RwLock<T, RawRwSpin> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawRwSpin::new(), value)
    }
}

impl<T: Default> Default for RwLock<T, RawRwSpin> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T, R> RwLock<T, R> {
    pub const fn from_raw(raw: R, value: T) -> Self {
        Self {
            raw,
            cell: UnsafeCell::new(value),
            _no_send_sync: PhantomData,
        }
    }

    /// Mutable access when you have `&mut self` (no contention possible).
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.cell.get_mut()
    }

    #[inline]
    pub fn into_inner(self) -> T {
        self.cell.into_inner()
    }

    /// The raw lock, for diagnostics.
    #[inline]
    pub const fn raw(&self) -> &R {
        &self.raw
    }
}

impl<T, R> RwLock<T, R>
where
    R: RawRwLock + RawRwUnlock,
{
    #[inline]
    pub fn read(&self) -> RwLockReadGuard<'_, T, R> {
        self.raw.lock_shared();
        RwLockReadGuard { l: self }
    }

    #[inline]
    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T, R>> {
        if self.raw.try_lock_shared() {
            Some(RwLockReadGuard { l: self })
        } else {
            None
        }
    }

    #[inline]
    pub fn write(&self) -> RwLockWriteGuard<'_, T, R> {
        self.raw.lock_exclusive();
        RwLockWriteGuard { l: self }
    }

    #[inline]
    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T, R>> {
        if self.raw.try_lock_exclusive() {
            Some(RwLockWriteGuard { l: self })
        } else {
            None
        }
    }

    /// Closure convenience, built on the read guard.
    #[inline]
    pub fn with_read<U>(&self, f: impl FnOnce(&T) -> U) -> U {
        let g = self.read();
        f(&g)
    }

    /// Closure convenience, built on the write guard.
    #[inline]
    pub fn with_write<U>(&self, f: impl FnOnce(&mut T) -> U) -> U {
        let mut g = self.write();
        f(&mut g)
    }
}

pub struct RwLockReadGuard<'a, T, R>
where
    R: RawRwUnlock,
{
    l: &'a RwLock<T, R>,
}

impl<T, R> Deref for RwLockReadGuard<'_, T, R>
where
    R: RawRwUnlock,
{
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.l.cell.get() }
    }
}

impl<T, R> Drop for RwLockReadGuard<'_, T, R>
where
    R: RawRwUnlock,
{
    fn drop(&mut self) {
        unsafe { self.l.raw.unlock_shared() }
    }
}

pub struct RwLockWriteGuard<'a, T, R>
where
    R: RawRwUnlock,
{
    l: &'a RwLock<T, R>,
}

impl<T, R> Deref for RwLockWriteGuard<'_, T, R>
where
    R: RawRwUnlock,
{
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.l.cell.get() }
    }
}

impl<T, R> DerefMut for RwLockWriteGuard<'_, T, R>
where
    R: RawRwUnlock,
{
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.l.cell.get() }
    }
}

impl<T, R> Drop for RwLockWriteGuard<'_, T, R>
where
    R: RawRwUnlock,
{
    fn drop(&mut self) {
        unsafe { self.l.raw.unlock_exclusive() }
    }
}
