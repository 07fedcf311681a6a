//! Time keeping
//!
//! Monotonic microsecond clock plus the timer engine built on it.

pub mod timer;

use core::time::Duration;

use crate::arch;

/// Source of monotonic time for a timer engine.
pub trait Clock: Sync {
    /// Microseconds since an arbitrary fixed origin. Never goes backwards.
    fn now_us(&self) -> u64;
}

/// The platform clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_us(&self) -> u64 {
        arch::timestamp::now_us()
    }
}

/// Microseconds since boot.
pub fn now_us() -> u64 {
    arch::timestamp::now_us()
}

pub fn uptime() -> Duration {
    Duration::from_micros(now_us())
}

/// Busy-waits for at least `duration` without giving up the core.
pub fn delay(duration: Duration) {
    let deadline = now_us().saturating_add(as_micros(duration));
    while now_us() < deadline {
        arch::cpu::relax();
    }
}

pub(crate) fn as_micros(duration: Duration) -> u64 {
    duration.as_micros().min(u64::MAX as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_monotonic() {
        let a = now_us();
        let b = SystemClock.now_us();
        assert!(b >= a);
    }

    #[test]
    fn test_delay_waits_at_least_duration() {
        let start = now_us();
        delay(Duration::from_millis(3));
        assert!(now_us() - start >= 3_000);
    }

    #[test]
    fn test_as_micros_saturates() {
        assert_eq!(as_micros(Duration::from_millis(2)), 2_000);
        assert_eq!(as_micros(Duration::MAX), u64::MAX);
    }
}
