use core::cell::Cell;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use crate::config::MAX_CORES;

/// Upper bound for one idle wait; a missed doorbell costs at most this long.
const IDLE_TIMEOUT: Duration = Duration::from_millis(1);
const RELAX_PAUSE: Duration = Duration::from_micros(20);

std::thread_local! {
    static CORE: Cell<Option<usize>> = const { Cell::new(None) };
    static EXECUTION_ID: Cell<usize> = const { Cell::new(0) };
}

static NEXT_EXECUTION_ID: AtomicUsize = AtomicUsize::new(1);

struct Doorbell {
    pending: Mutex<bool>,
    bell: Condvar,
}

impl Doorbell {
    const fn new() -> Self {
        Self {
            pending: Mutex::new(false),
            bell: Condvar::new(),
        }
    }
}

const DOORBELL: Doorbell = Doorbell::new();
static DOORBELLS: [Doorbell; MAX_CORES] = [DOORBELL; MAX_CORES];

pub fn try_id() -> Option<usize> {
    CORE.with(Cell::get)
}

/// Core of the calling host thread; 0 outside the runtime.
pub fn id() -> usize {
    try_id().unwrap_or(0)
}

pub(super) fn set_core(core: Option<usize>) {
    CORE.with(|c| c.set(core));
}

pub fn execution_id() -> usize {
    EXECUTION_ID.with(|id| {
        if id.get() == 0 {
            id.set(NEXT_EXECUTION_ID.fetch_add(1, Ordering::Relaxed));
        }
        id.get()
    })
}

pub fn idle() {
    let Some(core) = try_id() else {
        std::thread::yield_now();
        return;
    };
    let doorbell = &DOORBELLS[core];
    let mut pending = doorbell
        .pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if !*pending {
        pending = doorbell
            .bell
            .wait_timeout(pending, IDLE_TIMEOUT)
            .unwrap_or_else(PoisonError::into_inner)
            .0;
    }
    *pending = false;
}

pub fn notify(core: usize) {
    let Some(doorbell) = DOORBELLS.get(core) else {
        return;
    };
    *doorbell
        .pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = true;
    doorbell.bell.notify_one();
}

pub fn relax() {
    std::thread::sleep(RELAX_PAUSE);
}

pub fn enable_interrupts() {}

/// Host threads have no interrupts to mask.
pub struct IrqGuard(());

impl IrqGuard {
    #[inline(always)]
    pub fn new() -> Self {
        Self(())
    }
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_ids_are_per_thread() {
        let here = execution_id();
        assert_eq!(here, execution_id());
        let there = std::thread::spawn(execution_id).join().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn test_foreign_thread_has_no_core() {
        let id = std::thread::spawn(try_id).join().unwrap();
        assert_eq!(id, None);
    }

    #[test]
    fn test_id_follows_assigned_core() {
        let ids = std::thread::spawn(|| {
            let before = id();
            set_core(Some(3));
            (before, id(), try_id())
        })
        .join()
        .unwrap();
        assert_eq!(ids, (0, 3, Some(3)));
    }

    #[test]
    fn test_notify_before_idle_is_not_lost() {
        let core = MAX_CORES - 1;
        notify(core);
        let waited = std::thread::spawn(move || {
            set_core(Some(core));
            let start = std::time::Instant::now();
            idle();
            start.elapsed()
        })
        .join()
        .unwrap();
        assert!(waited < IDLE_TIMEOUT);
    }
}
