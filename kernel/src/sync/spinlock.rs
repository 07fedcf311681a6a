//! Spinlock
//!
//! Busy-wait mutual exclusion. Never sleeps, so it is usable from interrupt
//! handlers and from the scheduler itself. Holding one across a blocking
//! call (`sleep`, `join`, `Event::wait_for_signal`) is a contract violation.

use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::cpu::IrqGuard;

/// Bare lock word without protected data.
pub struct RawSpinlock {
    locked: AtomicBool,
}

impl RawSpinlock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Spins until the lock is taken. Acquire ordering on success.
    pub fn acquire(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    pub fn try_acquire(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Release ordering. Releasing a lock the caller does not hold is a
    /// contract violation.
    pub fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl Default for RawSpinlock {
    fn default() -> Self {
        Self::new()
    }
}

/// Spinlock protecting a value of type `T`.
pub struct Spinlock<T: ?Sized> {
    raw: RawSpinlock,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by `raw`
unsafe impl<T: ?Sized + Send> Send for Spinlock<T> {}
unsafe impl<T: ?Sized + Send> Sync for Spinlock<T> {}

impl<T> Spinlock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            raw: RawSpinlock::new(),
            data: UnsafeCell::new(data),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Spinlock<T> {
    /// Takes the lock with interrupts left as they are.
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        self.raw.acquire();
        SpinlockGuard {
            lock: self,
            _irq: None,
        }
    }

    /// Masks local interrupts, then takes the lock. The interrupt state is
    /// restored after the lock is released.
    ///
    /// Any lock that an interrupt handler may also take must be taken this way.
    pub fn lock_irqsave(&self) -> SpinlockGuard<'_, T> {
        let irq = IrqGuard::new();
        self.raw.acquire();
        SpinlockGuard {
            lock: self,
            _irq: Some(irq),
        }
    }

    pub fn try_lock(&self) -> Option<SpinlockGuard<'_, T>> {
        if self.raw.try_acquire() {
            Some(SpinlockGuard {
                lock: self,
                _irq: None,
            })
        } else {
            None
        }
    }

    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for Spinlock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized> fmt::Debug for Spinlock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spinlock")
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

/// Releases the lock when dropped, then restores interrupts if they were masked.
pub struct SpinlockGuard<'a, T: ?Sized> {
    lock: &'a Spinlock<T>,
    _irq: Option<IrqGuard>,
}

impl<T: ?Sized> Deref for SpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the lock is held
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the lock is held
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.release();
    }
}
