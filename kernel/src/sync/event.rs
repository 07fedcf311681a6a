//! Broadcast event
//!
//! `signal()` releases every thread that is waiting at that moment. Nothing
//! is latched: a thread that starts waiting after the signal keeps waiting
//! for the next one.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use super::Spinlock;
use crate::arch::cpu;
use crate::sched::{self, Tcb};

pub struct Event {
    waiters: Spinlock<Vec<Arc<Tcb>>>,
    generation: AtomicU64,
}

impl Event {
    pub const fn new() -> Self {
        Self {
            waiters: Spinlock::new(Vec::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Blocks the calling thread until the next `signal()`.
    ///
    /// Outside a runtime thread the caller spins until a signal is observed.
    pub fn wait_for_signal(&self) {
        let generation = self.generation.load(Ordering::Acquire);
        let blocked = sched::block_current(|me| {
            self.waiters.lock_irqsave().push(me.clone());
            true
        });
        if !blocked {
            while self.generation.load(Ordering::Acquire) == generation {
                cpu::relax();
            }
        }
    }

    /// Wakes every current waiter and returns how many there were.
    pub fn signal(&self) -> usize {
        let released = {
            let mut waiters = self.waiters.lock_irqsave();
            self.generation.fetch_add(1, Ordering::Release);
            core::mem::take(&mut *waiters)
        };
        let count = released.len();
        for tcb in released {
            sched::wake(tcb);
        }
        count
    }

    /// Number of threads currently blocked on this event.
    pub fn waiters(&self) -> usize {
        self.waiters.lock_irqsave().len()
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("waiters", &self.waiters())
            .finish()
    }
}
