//! Reader-writer spinlock.
//!
//! The lock word holds the reader count in the low bits and a writer flag in
//! the top bit. Writers first claim the flag, which stops new readers, and
//! then wait for the readers in flight to drain.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicUsize, Ordering};
use crossbeam_utils::Backoff;

const WRITER: usize = 1 << (usize::BITS - 1);

/// A reader-writer lock that spins.
///
/// Any number of shared guards ([`read`]) or one exclusive guard ([`write`])
/// may exist at a time.
///
/// [`read`]: Self::read
/// [`write`]: Self::write
pub struct RwSpinLock<T: ?Sized> {
    state: AtomicUsize,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for RwSpinLock<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for RwSpinLock<T> {}

impl<T> RwSpinLock<T> {
    /// Creates a new unlocked reader-writer lock.
    #[inline]
    pub const fn new(t: T) -> Self {
        Self {
            state: AtomicUsize::new(0),
            data: UnsafeCell::new(t),
        }
    }

    /// Consumes the lock, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> RwSpinLock<T> {
    /// Acquires the lock in shared mode.
    pub fn read(&self) -> RwSpinLockReadGuard<'_, T> {
        let backoff = Backoff::new();
        loop {
            let cur = self.state.load(Ordering::Relaxed);
            if cur & WRITER == 0
                && self
                    .state
                    .compare_exchange_weak(cur, cur + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return RwSpinLockReadGuard {
                    lock: self,
                    _not_send: PhantomData,
                };
            }
            backoff.snooze();
        }
    }

    /// Acquires the lock in exclusive mode.
    pub fn write(&self) -> RwSpinLockWriteGuard<'_, T> {
        let backoff = Backoff::new();
        while self.state.fetch_or(WRITER, Ordering::Acquire) & WRITER != 0 {
            while self.state.load(Ordering::Relaxed) & WRITER != 0 {
                backoff.snooze();
            }
        }
        // Readers that got in before the flag was raised still hold the lock.
        while self.state.load(Ordering::Acquire) != WRITER {
            backoff.snooze();
        }
        RwSpinLockWriteGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Returns a mutable reference to the underlying data without locking.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for RwSpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// RAII guard for shared access.
pub struct RwSpinLockReadGuard<'a, T: ?Sized + 'a> {
    lock: &'a RwSpinLock<T>,
    _not_send: PhantomData<*const ()>,
}

/// RAII guard for exclusive access.
pub struct RwSpinLockWriteGuard<'a, T: ?Sized + 'a> {
    lock: &'a RwSpinLock<T>,
    _not_send: PhantomData<*const ()>,
}

unsafe impl<T: ?Sized + Sync> Sync for RwSpinLockReadGuard<'_, T> {}
unsafe impl<T: ?Sized + Sync> Sync for RwSpinLockWriteGuard<'_, T> {}

impl<T: ?Sized> Deref for RwSpinLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Deref for RwSpinLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for RwSpinLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwSpinLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(1, Ordering::Release);
    }
}

impl<T: ?Sized> Drop for RwSpinLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_and(!WRITER, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use crate::RwSpinLock;
    use std::thread::scope;

    #[test]
    pub fn readers_share() {
        let lock = RwSpinLock::new(5);
        let a = lock.read();
        let b = lock.read();
        assert_eq!(*a + *b, 10);
    }

    #[test]
    pub fn writers_exclude() {
        const N: usize = 64;
        let lock = RwSpinLock::new((0usize, 0usize));
        scope(|s| {
            for _ in 0..N {
                s.spawn(|| {
                    let mut g = lock.write();
                    g.0 += 1;
                    g.1 += 1;
                });
                s.spawn(|| {
                    let g = lock.read();
                    assert_eq!(g.0, g.1);
                });
            }
        });
        assert_eq!(lock.into_inner(), (N, N));
    }
}
