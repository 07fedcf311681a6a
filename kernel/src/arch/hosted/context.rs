//! Host-thread contexts
//!
//! A context is a parked host thread plus a baton. Switching hands the baton
//! (and the core number) to the target and parks the caller until somebody
//! hands a baton back.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use super::cpu;
use crate::error::{Error, Result};

struct Fiber {
    baton: Mutex<Option<usize>>,
    turn: Condvar,
}

impl Fiber {
    fn new() -> Self {
        Self {
            baton: Mutex::new(None),
            turn: Condvar::new(),
        }
    }

    fn resume(&self, core: usize) {
        *self.baton.lock().unwrap_or_else(PoisonError::into_inner) = Some(core);
        self.turn.notify_one();
    }

    fn suspend(&self) -> usize {
        let mut baton = self.baton.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(core) = baton.take() {
                return core;
            }
            baton = self
                .turn
                .wait(baton)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Unwind payload used to retire a finished context.
struct Retired;

pub struct Context {
    fiber: Arc<Fiber>,
}

impl Context {
    /// Context of a core's own scheduler loop; filled in by the first switch away.
    pub fn empty() -> Self {
        Self {
            fiber: Arc::new(Fiber::new()),
        }
    }

    /// Prepares a context that calls `entry` the first time it is switched to.
    /// The stack is unused here: the host thread brings its own.
    pub fn new(_stack_top: usize, entry: fn() -> !) -> Result<Self> {
        let fiber = Arc::new(Fiber::new());
        let parked = fiber.clone();
        std::thread::Builder::new()
            .name("sc-thread".into())
            .spawn(move || {
                let core = parked.suspend();
                drop(parked);
                cpu::set_core(Some(core));
                match panic::catch_unwind(AssertUnwindSafe(|| run_entry(entry))) {
                    Ok(()) => {}
                    Err(payload) if payload.is::<Retired>() => {}
                    Err(_) => {
                        log::error!("runtime thread panicked, aborting");
                        std::process::abort();
                    }
                }
            })
            .map_err(|_| Error::OutOfMemory)?;
        Ok(Self { fiber })
    }
}

fn run_entry(entry: fn() -> !) {
    entry()
}

/// Saves the caller into `from` and resumes `to`.
///
/// # Safety
/// Both pointers must stay valid until the caller is resumed, and `to` must
/// not be running on any core.
pub unsafe fn switch(from: *mut Context, to: *const Context) {
    let core = cpu::id();
    (*to).fiber.resume(core);
    let core = (*from).fiber.suspend();
    cpu::set_core(Some(core));
}

/// Resumes `to` and abandons the caller for good.
///
/// # Safety
/// Same as [`switch`]; the caller's context must never be switched to again.
pub unsafe fn exit_to(to: *const Context) -> ! {
    (*to).fiber.resume(cpu::id());
    cpu::set_core(None);
    retire()
}

/// Unwinds back to the host thread's root so the thread can exit.
#[cfg(panic = "unwind")]
fn retire() -> ! {
    panic::resume_unwind(std::boxed::Box::new(Retired))
}

/// Without unwinding the host thread stays parked for good.
#[cfg(not(panic = "unwind"))]
fn retire() -> ! {
    loop {
        std::thread::park();
    }
}
