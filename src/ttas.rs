//! Test-test-and-set spin lock.
//!
//! Guards bounded scans that must never park: a parked owner would
//! priority-invert against readers spinning on hazard slots.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

pub(crate) struct TTas<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for TTas<T> {}
unsafe impl<T: ?Sized + Send> Sync for TTas<T> {}

impl<T> TTas<T> {
    pub(crate) const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    #[must_use]
    pub(crate) fn lock(&self) -> TTasGuard<'_, T> {
        while self.locked.swap(true, Ordering::Acquire) {
            // Read-only spin until the line looks free; keeps the cache
            // line shared instead of bouncing it between waiters.
            while self.locked.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
        TTasGuard { lock: self }
    }
}

pub(crate) struct TTasGuard<'a, T: ?Sized> {
    lock: &'a TTas<T>,
}

impl<T: ?Sized> Deref for TTasGuard<'_, T> {
    type Target = T;
    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for TTasGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for TTasGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}
