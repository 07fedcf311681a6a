//! SC kernel runtime
//!
//! Multicore concurrency runtime for bare-metal targets. The crate provides:
//! - per-core thread scheduling with affinity pinning (`sched`)
//! - spinlocks and broadcast events (`sync`)
//! - a deadline-ordered timer engine (`time::timer`)
//! - async tasks that run a closure on a scheduler thread (`task`)
//!
//! On `target_os = "none"` the crate is `no_std` and expects the boot layer to
//! call [`init`] on the boot core and [`sched::run_core`] on every core. On any
//! hosted target the architecture layer emulates cores with host threads.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[cfg(all(not(test), not(target_os = "none")))]
extern crate std;

pub mod arch;
pub mod config;
pub mod console;
pub mod error;
pub mod sched;
pub mod sync;
pub mod task;
pub mod time;

pub use error::{Error, Result};

/// Brings the runtime up: console logger first, then the per-core scheduler tables.
///
/// Must run once before any thread, timer or async task is created. Calling it
/// again is harmless.
pub fn init() {
    console::init(log::LevelFilter::Info);
    sched::init();
}
