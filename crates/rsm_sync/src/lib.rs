//! A busy-wait mutex for the memory subsystem's allocator instances.

#![cfg_attr(not(test), no_std)]

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

use mutex_api::Mutex;

#[derive(Default)]
struct RawSpinLock {
    locked: AtomicBool,
}

impl RawSpinLock {
    const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    fn acquire(&self) {
        while self.locked.swap(true, Ordering::Acquire) {
            core::hint::spin_loop();
        }
    }

    fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

/// A mutex that spins on a shared `AtomicBool` until the lock is free.
///
/// Unlike a kernel spinlock, this does not disable interrupts: it is meant to guard short
/// critical sections in allocator code that never runs in an interrupt handler.
#[derive(Default)]
pub struct SpinMutex<T> {
    lock: RawSpinLock,
    value: UnsafeCell<T>,
}

unsafe impl<T> Sync for SpinMutex<T> where T: Send {}
unsafe impl<T> Send for SpinMutex<T> where T: Send {}

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            lock: RawSpinLock::new(),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, spinning until it is free.
    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        self.lock.acquire();
        SpinMutexGuard { lock: self }
    }
}

impl<T> Mutex for SpinMutex<T> {
    type Data = T;
    type Guard<'a>
        = SpinMutexGuard<'a, T>
    where
        T: 'a;

    fn new(data: Self::Data) -> Self {
        Self::new(data)
    }

    fn lock(&self) -> Self::Guard<'_> {
        self.lock()
    }
}

pub struct SpinMutexGuard<'a, T> {
    lock: &'a SpinMutex<T>,
}

unsafe impl<T> Send for SpinMutexGuard<'_, T> where T: Send {}
unsafe impl<T> Sync for SpinMutexGuard<'_, T> where T: Sync {}

impl<T> Drop for SpinMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}

impl<T> Deref for SpinMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.value.get() }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn lock_excludes_concurrent_access() {
        let mutex = Arc::new(SpinMutex::new(0_u64));
        let mut handles = vec![];
        for _ in 0..8 {
            let mutex = Arc::clone(&mutex);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    *mutex.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*mutex.lock(), 8000);
    }

    #[test]
    fn guard_derefs_to_value() {
        let mutex = SpinMutex::new(vec![1, 2, 3]);
        {
            let mut guard = mutex.lock();
            guard.push(4);
        }
        assert_eq!(*mutex.lock(), vec![1, 2, 3, 4]);
    }
}
