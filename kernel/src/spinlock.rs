//! Spinlocks safe to take from interrupt context
//!
//! The scheduler keeps two of these: the fast scheduling lock held for one
//! tick's selection, and the list lock serializing create/reap. Anything the
//! tick path touches must be locked with [`SpinLock::lock_irq`] from thread
//! context, otherwise a tick arriving on the same core would spin forever on
//! a lock its own core already holds.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::CpuOps;

/// Spins after which a waiter reports a suspected deadlock (once per acquire)
const DEADLOCK_SPINS: u64 = 50_000_000;

/// A named busy-wait lock protecting a `T`
pub struct SpinLock<T> {
    name: &'static str,
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SpinLock hands out access to T from any core, one holder at a time
unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Create a new unlocked spinlock
    pub const fn new(name: &'static str, value: T) -> Self {
        Self {
            name,
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, spinning until it is free
    ///
    /// Only for callers that already run with interrupts disabled (the tick
    /// handler) or for data the tick never touches.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.acquire();
        SpinLockGuard { lock: self }
    }

    /// Try to acquire the spinlock without blocking
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }

    /// Acquire the lock with interrupts disabled on this core
    ///
    /// The previous interrupt state is restored when the guard drops.
    pub fn lock_irq<'a>(&'a self, cpu: &'a dyn CpuOps) -> SpinLockIrqGuard<'a, T> {
        let irq_was_enabled = cpu.interrupts_enabled();
        unsafe {
            cpu.disable_interrupts();
        }
        self.acquire();
        SpinLockIrqGuard {
            lock: self,
            cpu,
            irq_was_enabled,
        }
    }

    /// Whether some core currently holds the lock (diagnostic only)
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    fn acquire(&self) {
        let mut spins: u64 = 0;
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spins += 1;
            if spins == DEADLOCK_SPINS {
                log::warn!("spinlock '{}': possible deadlock", self.name);
            }
            // Spin on a plain load so the cache line stays shared
            while self.locked.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
    }

    fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

/// RAII guard for [`SpinLock::lock`]
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// RAII guard for [`SpinLock::lock_irq`]
pub struct SpinLockIrqGuard<'a, T> {
    lock: &'a SpinLock<T>,
    cpu: &'a dyn CpuOps,
    irq_was_enabled: bool,
}

impl<T> Deref for SpinLockIrqGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockIrqGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockIrqGuard<'_, T> {
    fn drop(&mut self) {
        // Release the lock before interrupts can fire again
        self.lock.unlock();
        if self.irq_was_enabled {
            unsafe {
                self.cpu.enable_interrupts();
            }
        }
    }
}
