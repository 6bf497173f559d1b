// Copyright 2025 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements a spinlock, which will panic if it appears to
//! be deadlocked.
//!
//! This is the only mutual exclusion primitive in the kernel.
//! The paging lock, the buffer cache lock and the file system
//! lock are all instances of [`Mutex`], acquired through the
//! [`lock!`](crate::lock) macro so that a suspected deadlock
//! names the two acquisition sites involved.

#![no_std]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};
use core::{fmt, hint};

/// Indicates the maximum number of attempts that can be made to
/// lock a mutex before a deadlock is assumed and the kernel
/// panics.
///
/// There is a fine balance here between a value so small
/// that deadlocks will be declared in safe code (resulting
/// in unnecessary and unwanted kernel panics) and a value
/// so large that there will be an unnecessary delay between
/// a deadlock occurring and being identified.
///
pub const MAX_LOCK_ATTEMPTS: usize = 500_000_000;

/// A spinlock providing mutually-exclusive access to data.
///
pub struct Mutex<T: ?Sized> {
    lock: AtomicBool,
    file: UnsafeCell<&'static str>,
    line: UnsafeCell<u32>,
    data: UnsafeCell<T>,
}

/// The mutex guard, which allows mutable access to the locked
/// data.
///
/// When the guard is dropped, the lock is released.
///
pub struct MutexGuard<'lock, T: ?Sized + 'lock> {
    lock: &'lock AtomicBool,
    data: &'lock mut T,
}

unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}

impl<T> Mutex<T> {
    /// Create a new lock, containing the given data.
    ///
    #[inline(always)]
    pub const fn new(data: T) -> Self {
        Mutex {
            lock: AtomicBool::new(false),
            file: UnsafeCell::new("???"),
            line: UnsafeCell::new(0),
            data: UnsafeCell::new(data),
        }
    }

    /// Consumes the mutex, returning the inner data.
    ///
    #[inline(always)]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Returns whether the mutex is currently locked.
    ///
    /// There is no synchronisation of the return value, so
    /// it can become incorrect immediately. This should
    /// only be used as a hint.
    ///
    #[inline(always)]
    pub fn is_locked(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
    }

    /// Attempts to lock the mutex.
    ///
    #[inline(always)]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(MutexGuard {
                lock: &self.lock,
                data: unsafe { &mut *self.data.get() },
            })
        } else {
            None
        }
    }
}

/// Lock the mutex, panicking with a deadlock diagnosis if
/// the mutex cannot be locked after [`MAX_LOCK_ATTEMPTS`]
/// attempts.
///
#[macro_export]
macro_rules! lock {
    ($mutex:expr) => {{
        let file = file!();
        let line = line!();
        $crate::_lock(&$mutex, file, line)
    }};
}

/// Lock the mutex, returning a mutex guard, which
/// will unlock the mutex once dropped.
///
#[doc(hidden)]
pub fn _lock<'lock, T: ?Sized>(
    mutex: &'lock Mutex<T>,
    file: &'static str,
    line: u32,
) -> MutexGuard<'lock, T> {
    let mut counter = 0_usize;
    while mutex
        .lock
        .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        while mutex.is_locked() {
            counter += 1;
            if counter > MAX_LOCK_ATTEMPTS {
                let lock_file = unsafe { *mutex.file.get() };
                let lock_line = unsafe { *mutex.line.get() };
                panic!(
                    "DEADLOCK: failed to lock at {}:{}, after mutex was locked at {}:{}",
                    file, line, lock_file, lock_line
                );
            }

            hint::spin_loop();
        }
    }

    // Now that we've locked the mutex, we store
    // the file:line where it was locked.
    unsafe {
        *mutex.file.get() = file;
        *mutex.line.get() = line;
    }

    MutexGuard {
        lock: &mutex.lock,
        data: unsafe { &mut *mutex.data.get() },
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => write!(f, "Mutex {{ data: ")
                .and_then(|()| (*guard).fmt(f))
                .and_then(|()| write!(f, "}}")),
            None => write!(f, "Mutex {{ <locked> }}"),
        }
    }
}

impl<T: ?Sized + Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl<'lock, T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'lock, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<'lock, T: ?Sized> Deref for MutexGuard<'lock, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.data
    }
}

impl<'lock, T: ?Sized> DerefMut for MutexGuard<'lock, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.data
    }
}

impl<'lock, T: ?Sized> Drop for MutexGuard<'lock, T> {
    fn drop(&mut self) {
        self.lock.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_and_unlock() {
        let mutex = Mutex::new(0usize);
        assert!(!mutex.is_locked());

        {
            let mut guard = lock!(mutex);
            *guard += 1;
            assert!(mutex.is_locked());

            // A second lock attempt must fail while
            // the guard is live.
            assert!(mutex.try_lock().is_none());
        }

        // Dropping the guard releases the lock.
        assert!(!mutex.is_locked());
        assert_eq!(*lock!(mutex), 1);
    }

    #[test]
    fn into_inner() {
        let mutex = Mutex::new(42usize);
        assert_eq!(mutex.into_inner(), 42);
    }
}
