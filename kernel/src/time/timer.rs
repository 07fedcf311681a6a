//! Timer engine
//!
//! Armed timers sit in a map ordered by `(deadline, sequence)`, so timers
//! with the same deadline fire in the order they were armed. `process()`
//! fires everything that is due. Callbacks run with no engine lock held and
//! may restart or stop their own timer. A periodic timer's next deadline is
//! its previous deadline plus the period, so late processing catches up
//! instead of drifting.
//!
//! Callbacks run in the context that calls `process()` (the tick interrupt
//! on bare metal) and must not block.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use core::time::Duration;

use log::trace;

use super::{as_micros, Clock, SystemClock};
use crate::arch::cpu;
use crate::sync::Spinlock;

type Callback = Box<dyn FnMut() + Send + 'static>;

const NOT_FIRING: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    OneShot,
    Periodic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Stopped,
    Armed,
    Firing,
}

/// Scheduling data of one timer, guarded by the engine queue lock.
struct Slot {
    key: Option<(u64, u64)>,
    period_us: u64,
    /// Bumped by every start, restart and stop.
    generation: u64,
}

struct TimerShared {
    kind: TimerKind,
    engine: &'static TimerEngine,
    slot: Spinlock<Slot>,
    callback: Spinlock<Option<Callback>>,
    /// Execution id of the context running the callback, or `NOT_FIRING`.
    firing_on: AtomicUsize,
}

impl TimerShared {
    fn fire(&self) {
        let callback = self.callback.lock_irqsave().take();
        if let Some(mut callback) = callback {
            callback();
            let mut slot = self.callback.lock_irqsave();
            if slot.is_none() {
                *slot = Some(callback);
            }
        }
    }

    fn is_armed(&self) -> bool {
        self.slot.lock_irqsave().key.is_some()
    }

    fn state(&self) -> TimerState {
        if self.firing_on.load(Ordering::Acquire) != NOT_FIRING {
            TimerState::Firing
        } else if self.is_armed() {
            TimerState::Armed
        } else {
            TimerState::Stopped
        }
    }

    fn set_callback(&self, callback: Callback) {
        let old = self.callback.lock_irqsave().replace(callback);
        drop(old);
    }

    /// Disarms and waits out an in-flight callback running elsewhere. From
    /// inside its own callback this returns at once.
    fn stop(&self) {
        let me = cpu::execution_id();
        loop {
            self.engine.disarm(self);
            loop {
                let owner = self.firing_on.load(Ordering::Acquire);
                if owner == NOT_FIRING || owner == me {
                    break;
                }
                cpu::relax();
            }
            // a callback that was in flight may have re-armed its own timer
            if !self.is_armed() {
                break;
            }
        }
    }
}

struct Queue {
    armed: BTreeMap<(u64, u64), Arc<TimerShared>>,
    next_seq: u64,
}

pub struct TimerEngine {
    clock: &'static dyn Clock,
    queue: Spinlock<Queue>,
}

impl TimerEngine {
    pub const fn new(clock: &'static dyn Clock) -> Self {
        Self {
            clock,
            queue: Spinlock::new(Queue {
                armed: BTreeMap::new(),
                next_seq: 0,
            }),
        }
    }

    pub fn now_us(&self) -> u64 {
        self.clock.now_us()
    }

    /// Number of armed timers.
    pub fn armed(&self) -> usize {
        self.queue.lock_irqsave().armed.len()
    }

    /// Earliest armed deadline in microseconds.
    pub fn next_deadline(&self) -> Option<u64> {
        self.queue
            .lock_irqsave()
            .armed
            .first_key_value()
            .map(|(&(deadline, _), _)| deadline)
    }

    /// Fires every timer whose deadline has passed. Returns the number of
    /// callbacks run.
    pub fn process(&self) -> usize {
        let now = self.clock.now_us();
        let me = cpu::execution_id();
        let mut fired = 0;
        loop {
            let (shared, deadline, generation) = {
                let mut queue = self.queue.lock_irqsave();
                match queue.armed.first_key_value() {
                    Some((&(deadline, _), _)) if deadline <= now => {}
                    _ => break,
                }
                let Some(((deadline, _), shared)) = queue.armed.pop_first() else {
                    break;
                };
                let generation = {
                    let mut slot = shared.slot.lock();
                    slot.key = None;
                    slot.generation
                };
                shared.firing_on.store(me, Ordering::Release);
                (shared, deadline, generation)
            };

            trace!("timer fired, deadline {}us", deadline);
            shared.fire();
            fired += 1;

            let mut queue = self.queue.lock_irqsave();
            let mut slot = shared.slot.lock();
            if slot.generation == generation && shared.kind == TimerKind::Periodic {
                let key = (deadline.saturating_add(slot.period_us), queue.next_seq);
                queue.next_seq += 1;
                slot.key = Some(key);
                queue.armed.insert(key, shared.clone());
            }
            shared.firing_on.store(NOT_FIRING, Ordering::Release);
        }
        fired
    }

    /// Arms `shared` one period from now, replacing any pending deadline.
    fn arm(&self, shared: &Arc<TimerShared>, period_us: Option<u64>) {
        let now = self.clock.now_us();
        let mut queue = self.queue.lock_irqsave();
        let mut slot = shared.slot.lock();
        if let Some(key) = slot.key.take() {
            queue.armed.remove(&key);
        }
        slot.generation = slot.generation.wrapping_add(1);
        if let Some(period_us) = period_us {
            slot.period_us = period_us.max(1);
        }
        let key = (now.saturating_add(slot.period_us), queue.next_seq);
        queue.next_seq += 1;
        slot.key = Some(key);
        queue.armed.insert(key, shared.clone());
        trace!("timer armed, deadline {}us", key.0);
    }

    fn disarm(&self, shared: &TimerShared) -> bool {
        let mut queue = self.queue.lock_irqsave();
        let mut slot = shared.slot.lock();
        slot.generation = slot.generation.wrapping_add(1);
        match slot.key.take() {
            Some(key) => {
                trace!("timer stopped, deadline was {}us", key.0);
                queue.armed.remove(&key).is_some()
            }
            None => false,
        }
    }
}

impl fmt::Debug for TimerEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerEngine")
            .field("armed", &self.armed())
            .finish()
    }
}

static SYSTEM_CLOCK: SystemClock = SystemClock;
static ENGINE: TimerEngine = TimerEngine::new(&SYSTEM_CLOCK);

/// Engine driven by the platform tick.
pub fn engine() -> &'static TimerEngine {
    &ENGINE
}

/// Runs due timers on the global engine. Called from the tick source.
pub fn tick() {
    ENGINE.process();
}

/// Owning timer handle. Dropping it stops the timer.
pub struct Timer {
    shared: Arc<TimerShared>,
}

impl Timer {
    pub fn new(kind: TimerKind) -> Self {
        Self::new_in(engine(), kind)
    }

    pub fn periodic() -> Self {
        Self::new(TimerKind::Periodic)
    }

    pub fn one_shot() -> Self {
        Self::new(TimerKind::OneShot)
    }

    pub fn new_in(engine: &'static TimerEngine, kind: TimerKind) -> Self {
        Self {
            shared: Arc::new(TimerShared {
                kind,
                engine,
                slot: Spinlock::new(Slot {
                    key: None,
                    period_us: 1,
                    generation: 0,
                }),
                callback: Spinlock::new(None),
                firing_on: AtomicUsize::new(NOT_FIRING),
            }),
        }
    }

    /// Installs `callback` and arms the timer `period` from now. A zero
    /// period is treated as one microsecond.
    pub fn start<F>(&self, callback: F, period: Duration)
    where
        F: FnMut() + Send + 'static,
    {
        self.shared.set_callback(Box::new(callback));
        self.shared.engine.arm(&self.shared, Some(as_micros(period)));
    }

    /// Re-arms with the current callback and a new period.
    pub fn restart(&self, period: Duration) {
        self.shared.engine.arm(&self.shared, Some(as_micros(period)));
    }

    /// Disarms the timer. When this returns from outside the callback, the
    /// callback is not running and will not run again until restarted.
    pub fn stop(&self) {
        self.shared.stop();
    }

    pub fn state(&self) -> TimerState {
        self.shared.state()
    }

    pub fn kind(&self) -> TimerKind {
        self.shared.kind
    }

    pub fn period(&self) -> Duration {
        Duration::from_micros(self.shared.slot.lock_irqsave().period_us)
    }

    /// Non-owning handle, for use inside the timer's own callback.
    pub fn handle(&self) -> TimerHandle {
        TimerHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::periodic()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shared.stop();
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("kind", &self.kind())
            .field("state", &self.state())
            .finish()
    }
}

/// Weak reference to a [`Timer`]. Every operation is a no-op once the
/// owning `Timer` is gone.
#[derive(Clone)]
pub struct TimerHandle {
    shared: Weak<TimerShared>,
}

impl TimerHandle {
    pub fn start<F>(&self, callback: F, period: Duration)
    where
        F: FnMut() + Send + 'static,
    {
        if let Some(shared) = self.shared.upgrade() {
            shared.set_callback(Box::new(callback));
            shared.engine.arm(&shared, Some(as_micros(period)));
        }
    }

    pub fn restart(&self, period: Duration) {
        if let Some(shared) = self.shared.upgrade() {
            shared.engine.arm(&shared, Some(as_micros(period)));
        }
    }

    pub fn stop(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.stop();
        }
    }

    pub fn state(&self) -> TimerState {
        self.shared
            .upgrade()
            .map_or(TimerState::Stopped, |shared| shared.state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicBool, AtomicU64};
    use std::vec::Vec;

    struct ManualClock {
        now: AtomicU64,
    }

    impl Clock for ManualClock {
        fn now_us(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }
    }

    impl ManualClock {
        fn set_ms(&self, ms: u64) {
            self.now.store(ms * 1000, Ordering::SeqCst);
        }
    }

    fn manual_engine() -> (&'static ManualClock, &'static TimerEngine) {
        let clock: &'static ManualClock = Box::leak(Box::new(ManualClock {
            now: AtomicU64::new(0),
        }));
        let engine: &'static TimerEngine = Box::leak(Box::new(TimerEngine::new(clock)));
        (clock, engine)
    }

    fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        (count.clone(), count)
    }

    fn run_until(clock: &ManualClock, engine: &TimerEngine, last_ms: u64) {
        for ms in 1..=last_ms {
            clock.set_ms(ms);
            engine.process();
        }
    }

    #[test]
    fn test_one_shot_fires_once() {
        let (clock, engine) = manual_engine();
        let (count, seen) = counter();
        let timer = Timer::new_in(engine, TimerKind::OneShot);
        timer.start(
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_millis(1),
        );
        assert_eq!(timer.state(), TimerState::Armed);
        run_until(clock, engine, 5);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(timer.state(), TimerState::Stopped);
        assert_eq!(engine.armed(), 0);
    }

    #[test]
    fn test_periodic_fires_every_period() {
        let (clock, engine) = manual_engine();
        let (count, seen) = counter();
        {
            let timer = Timer::new_in(engine, TimerKind::Periodic);
            timer.start(
                move || {
                    count.fetch_add(1, Ordering::SeqCst);
                },
                Duration::from_millis(5),
            );
            run_until(clock, engine, 52);
        }
        assert_eq!(seen.load(Ordering::SeqCst), 10);
        assert_eq!(engine.armed(), 0);
    }

    #[test]
    fn test_periodic_catches_up_without_drift() {
        let (clock, engine) = manual_engine();
        let fired_at = Arc::new(Spinlock::new(Vec::new()));
        let log = fired_at.clone();
        let timer = Timer::new_in(engine, TimerKind::Periodic);
        timer.start(move || log.lock().push(clock.now_us() / 1000), Duration::from_millis(5));

        for ms in [7, 12, 15] {
            clock.set_ms(ms);
            assert_eq!(engine.process(), 1);
        }
        clock.set_ms(30);
        assert_eq!(engine.process(), 3);
        assert_eq!(*fired_at.lock(), [7, 12, 15, 30, 30, 30]);
        assert_eq!(engine.next_deadline(), Some(35_000));
    }

    #[test]
    fn test_stop_before_deadline_prevents_firing() {
        let (clock, engine) = manual_engine();
        let (count, seen) = counter();
        let timer = Timer::new_in(engine, TimerKind::OneShot);
        timer.start(
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_millis(10),
        );
        run_until(clock, engine, 5);
        timer.stop();
        assert_eq!(timer.state(), TimerState::Stopped);
        run_until(clock, engine, 15);
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_callback_can_stop_its_own_timer() {
        let (clock, engine) = manual_engine();
        let (count, seen) = counter();
        let timer = Timer::new_in(engine, TimerKind::Periodic);
        let handle = timer.handle();
        timer.start(
            move || {
                if count.fetch_add(1, Ordering::SeqCst) + 1 == 5 {
                    handle.stop();
                }
            },
            Duration::from_millis(1),
        );
        run_until(clock, engine, 10);
        assert_eq!(seen.load(Ordering::SeqCst), 5);
        assert_eq!(timer.state(), TimerState::Stopped);
    }

    #[test]
    fn test_callback_can_restart_with_new_period() {
        let (clock, engine) = manual_engine();
        let (count, seen) = counter();
        let timer = Timer::new_in(engine, TimerKind::OneShot);
        let handle = timer.handle();
        timer.start(
            move || {
                let n = count.fetch_add(1, Ordering::SeqCst) as u64 + 1;
                handle.restart(Duration::from_millis(1 + n));
            },
            Duration::from_millis(1),
        );
        run_until(clock, engine, 18);
        timer.stop();
        // fires at 1, 3, 6, 10 and 15 ms
        assert_eq!(seen.load(Ordering::SeqCst), 5);
        assert_eq!(timer.period(), Duration::from_millis(6));
    }

    #[test]
    fn test_equal_deadlines_fire_in_start_order() {
        let (clock, engine) = manual_engine();
        let order = Arc::new(Spinlock::new(Vec::new()));
        let timers: Vec<_> = (0..3)
            .map(|i| {
                let order = order.clone();
                let timer = Timer::new_in(engine, TimerKind::OneShot);
                timer.start(move || order.lock().push(i), Duration::from_millis(2));
                timer
            })
            .collect();
        clock.set_ms(2);
        assert_eq!(engine.process(), 3);
        assert_eq!(*order.lock(), [0, 1, 2]);
        drop(timers);
    }

    #[test]
    fn test_zero_period_is_one_microsecond() {
        let (clock, engine) = manual_engine();
        let (count, seen) = counter();
        let timer = Timer::new_in(engine, TimerKind::OneShot);
        timer.start(
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            },
            Duration::ZERO,
        );
        assert_eq!(engine.process(), 0);
        clock.now.store(1, Ordering::SeqCst);
        assert_eq!(engine.process(), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_waits_for_in_flight_callback() {
        let (clock, engine) = manual_engine();
        let entered = Arc::new(AtomicBool::new(false));
        let release = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let timer = Timer::new_in(engine, TimerKind::OneShot);
        {
            let (entered, release, finished) = (entered.clone(), release.clone(), finished.clone());
            timer.start(
                move || {
                    entered.store(true, Ordering::SeqCst);
                    while !release.load(Ordering::SeqCst) {
                        std::thread::sleep(std::time::Duration::from_millis(1));
                    }
                    finished.store(true, Ordering::SeqCst);
                },
                Duration::from_millis(1),
            );
        }
        clock.set_ms(1);

        std::thread::scope(|s| {
            s.spawn(|| engine.process());
            while !entered.load(Ordering::SeqCst) {
                std::thread::yield_now();
            }
            assert_eq!(timer.state(), TimerState::Firing);
            let stopper = s.spawn(|| {
                timer.stop();
                finished.load(Ordering::SeqCst)
            });
            std::thread::sleep(std::time::Duration::from_millis(20));
            assert!(!stopper.is_finished());
            release.store(true, Ordering::SeqCst);
            assert!(stopper.join().unwrap());
        });
        assert_eq!(timer.state(), TimerState::Stopped);
    }

    #[test]
    fn test_drop_waits_for_in_flight_callback() {
        let (clock, engine) = manual_engine();
        let entered = Arc::new(AtomicBool::new(false));
        let release = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let timer = Timer::new_in(engine, TimerKind::Periodic);
        {
            let (entered, release, finished) = (entered.clone(), release.clone(), finished.clone());
            timer.start(
                move || {
                    entered.store(true, Ordering::SeqCst);
                    while !release.load(Ordering::SeqCst) {
                        std::thread::sleep(std::time::Duration::from_millis(1));
                    }
                    finished.store(true, Ordering::SeqCst);
                },
                Duration::from_millis(1),
            );
        }
        let handle = timer.handle();
        clock.set_ms(1);

        std::thread::scope(|s| {
            s.spawn(|| engine.process());
            while !entered.load(Ordering::SeqCst) {
                std::thread::yield_now();
            }
            assert_eq!(handle.state(), TimerState::Firing);
            let dropper = s.spawn(move || {
                drop(timer);
                finished.load(Ordering::SeqCst)
            });
            std::thread::sleep(std::time::Duration::from_millis(20));
            assert!(!dropper.is_finished());
            release.store(true, Ordering::SeqCst);
            assert!(dropper.join().unwrap());
        });
        // the periodic re-arm from the in-flight pass must not survive the drop
        assert_eq!(engine.armed(), 0);
        clock.set_ms(10);
        assert_eq!(engine.process(), 0);
        assert_eq!(handle.state(), TimerState::Stopped);
    }

    #[test]
    fn test_handle_is_inert_after_timer_drop() {
        let (_, engine) = manual_engine();
        let timer = Timer::new_in(engine, TimerKind::Periodic);
        let handle = timer.handle();
        drop(timer);
        handle.restart(Duration::from_millis(1));
        assert_eq!(handle.state(), TimerState::Stopped);
        assert_eq!(engine.armed(), 0);
    }

    #[test]
    fn test_global_engine_driven_by_tick() {
        crate::init();
        let (count, seen) = counter();
        let timer = Timer::periodic();
        timer.start(
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_millis(2),
        );
        std::thread::sleep(std::time::Duration::from_millis(50));
        drop(timer);
        let fired = seen.load(Ordering::SeqCst);
        assert!(fired >= 1);
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(seen.load(Ordering::SeqCst), fired);
    }
}
