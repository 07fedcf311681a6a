//! Async tasks
//!
//! An [`Async`] runs a closure on its own scheduler thread and keeps the
//! returned value until it is collected. Dropping an `Async` joins the
//! thread, so the task never outlives its handle.

use alloc::sync::Arc;
use core::fmt;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::error::Result;
use crate::sched::{Builder, CpuSet, Thread};
use crate::sync::Spinlock;

struct ResultSlot<T> {
    value: Spinlock<Option<T>>,
    complete: AtomicBool,
}

impl<T> ResultSlot<T> {
    fn new() -> Self {
        Self {
            value: Spinlock::new(None),
            complete: AtomicBool::new(false),
        }
    }

    fn publish(&self, value: T) {
        *self.value.lock_irqsave() = Some(value);
        self.complete.store(true, Ordering::Release);
    }
}

pub struct Async<T> {
    thread: Thread,
    slot: Arc<ResultSlot<T>>,
}

impl<T: Send + 'static> Async<T> {
    /// Runs `work` on a new thread with default placement and stack size.
    pub fn spawn<F>(work: F) -> Result<Self>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        AsyncBuilder::new().spawn(work)
    }

    /// Builder for a task with a name, affinity or stack size. The result
    /// type is taken from the closure given to [`AsyncBuilder::spawn`].
    pub fn builder() -> AsyncBuilder<T> {
        AsyncBuilder::new()
    }
}

impl<T> Async<T> {
    pub fn is_complete(&self) -> bool {
        self.slot.complete.load(Ordering::Acquire)
    }

    /// Waits for the task, then returns a copy of its result. Later calls
    /// return the same value without waiting.
    pub fn wait_for_result(&self) -> T
    where
        T: Clone,
    {
        self.thread.join();
        match self.slot.value.lock_irqsave().as_ref() {
            Some(value) => value.clone(),
            None => unreachable!("async task completed without a result"),
        }
    }

    /// Waits for the task and moves its result out.
    pub fn into_result(self) -> T {
        self.thread.join();
        match self.slot.value.lock_irqsave().take() {
            Some(value) => value,
            None => unreachable!("async task completed without a result"),
        }
    }

    /// Thread running the task.
    pub fn thread(&self) -> &Thread {
        &self.thread
    }
}

impl<T> fmt::Debug for Async<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Async")
            .field("thread", &self.thread)
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// Placement and sizing options for an [`Async`] producing `T`.
pub struct AsyncBuilder<T> {
    inner: Builder,
    _result: PhantomData<fn() -> T>,
}

impl<T: Send + 'static> AsyncBuilder<T> {
    pub fn new() -> Self {
        Self {
            inner: Builder::new().name("async"),
            _result: PhantomData,
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.inner = self.inner.name(name);
        self
    }

    pub fn affinity(mut self, affinity: CpuSet) -> Self {
        self.inner = self.inner.affinity(affinity);
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.inner = self.inner.stack_size(size);
        self
    }

    pub fn spawn<F>(self, work: F) -> Result<Async<T>>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let slot = Arc::new(ResultSlot::new());
        let writer = slot.clone();
        let thread = self.inner.spawn(move || writer.publish(work()))?;
        Ok(Async { thread, slot })
    }
}

impl<T: Send + 'static> Default for AsyncBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for AsyncBuilder<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _result: PhantomData,
        }
    }
}

impl<T> fmt::Debug for AsyncBuilder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncBuilder")
            .field("inner", &self.inner)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::cpu;
    use crate::config;
    use crate::error::Error;
    use crate::sched;
    use core::time::Duration;

    fn square(x: u64) -> u64 {
        x * x
    }

    #[test]
    fn test_wait_for_result() {
        crate::init();
        let a = Async::spawn(|| square(10)).unwrap();
        let b = Async::spawn(|| square(20)).unwrap();
        assert_eq!(a.wait_for_result(), 100);
        assert_eq!(b.wait_for_result(), 400);
        assert!(a.is_complete());
        // cached
        assert_eq!(a.wait_for_result(), 100);
    }

    #[test]
    fn test_into_result_moves_value() {
        crate::init();
        let task = Async::spawn(|| std::string::String::from("done")).unwrap();
        assert_eq!(task.into_result(), "done");
    }

    #[test]
    fn test_drop_joins_task() {
        crate::init();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let task = Async::spawn(move || {
            sched::sleep(Duration::from_millis(10));
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();
        drop(task);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_builder_affinity_and_name() {
        crate::init();
        let core = config::CORE_COUNT - 1;
        let task = Async::builder()
            .name("squarer")
            .affinity(CpuSet::single(core).unwrap())
            .spawn(cpu::id)
            .unwrap();
        assert_eq!(task.thread().name(), "squarer");
        assert_eq!(task.wait_for_result(), core);
    }

    #[test]
    fn test_builder_defaults_and_stack_size() {
        crate::init();
        let task = Async::builder()
            .stack_size(32 * 1024)
            .spawn(|| square(3))
            .unwrap();
        assert_eq!(task.thread().name(), "async");
        assert_eq!(task.wait_for_result(), 9);

        let task = AsyncBuilder::new().spawn(|| 'x').unwrap();
        assert_eq!(task.into_result(), 'x');
    }

    #[test]
    fn test_result_shared_by_several_readers() {
        crate::init();
        let task = Arc::new(Async::spawn(|| square(12)).unwrap());
        let readers: std::vec::Vec<_> = (0..3)
            .map(|_| {
                let task = task.clone();
                std::thread::spawn(move || task.wait_for_result())
            })
            .collect();
        for reader in readers {
            assert_eq!(reader.join().unwrap(), 144);
        }
    }

    #[test]
    fn test_spawn_errors_propagate() {
        crate::init();
        let err = Async::builder()
            .affinity(CpuSet::empty())
            .spawn(|| 1)
            .unwrap_err();
        assert_eq!(err, Error::InvalidArgument);
    }

    #[test]
    fn test_async_waits_on_another_async() {
        crate::init();
        let outer = Async::spawn(|| {
            let inner = Async::spawn(|| square(7)).unwrap();
            inner.wait_for_result() + 1
        })
        .unwrap();
        assert_eq!(outer.wait_for_result(), 50);
    }
}
