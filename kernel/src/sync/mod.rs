//! Synchronization primitives
//!
//! - [`Spinlock`]: busy-wait lock, usable anywhere including interrupt context
//! - [`Event`]: broadcast wake-up for threads blocked on a condition

pub mod event;
pub mod spinlock;

pub use event::Event;
pub use spinlock::{RawSpinlock, Spinlock, SpinlockGuard};
