//! Thread control blocks and the public thread handle

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::fmt;
use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use bitflags::bitflags;

use super::stack::Stack;
use crate::arch::context::Context;
use crate::arch::cpu;
use crate::config;
use crate::error::Result;
use crate::sync::Spinlock;

/// Thread names are truncated to this many bytes.
pub const NAME_LEN: usize = 16;

pub type ThreadName = heapless::String<NAME_LEN>;

pub(crate) type Entry = Box<dyn FnOnce() + Send + 'static>;

bitflags! {
    /// Set of cores a thread may be placed on
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CpuSet: u32 {
        const CPU0 = 1 << 0;
        const CPU1 = 1 << 1;
        const CPU2 = 1 << 2;
        const CPU3 = 1 << 3;
        const CPU4 = 1 << 4;
        const CPU5 = 1 << 5;
        const CPU6 = 1 << 6;
        const CPU7 = 1 << 7;
    }
}

impl CpuSet {
    /// Cores configured for this board.
    pub fn online() -> Self {
        Self::from_bits_truncate(((1u64 << config::CORE_COUNT) - 1) as u32)
    }

    pub fn single(core: usize) -> Option<Self> {
        if core < config::MAX_CORES {
            Self::from_bits(1 << core)
        } else {
            None
        }
    }

    pub fn contains_core(self, core: usize) -> bool {
        core < config::MAX_CORES && self.bits() & (1 << core) != 0
    }

    /// Core numbers in ascending order.
    pub fn cores(self) -> impl Iterator<Item = usize> {
        (0..config::MAX_CORES).filter(move |&core| self.contains_core(core))
    }
}

impl Default for CpuSet {
    fn default() -> Self {
        Self::all()
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready = 0,
    Running = 1,
    Blocked = 2,
    Done = 3,
}

impl ThreadState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ThreadState::Ready,
            1 => ThreadState::Running,
            2 => ThreadState::Blocked,
            _ => ThreadState::Done,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u64);

impl ThreadId {
    fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Completion flag plus the joiners waiting for it, released in arrival order.
pub(crate) struct JoinList<W> {
    done: bool,
    waiters: VecDeque<W>,
}

impl<W> JoinList<W> {
    pub(crate) const fn new() -> Self {
        Self {
            done: false,
            waiters: VecDeque::new(),
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Queues `waiter` unless completion already happened.
    pub(crate) fn register(&mut self, waiter: W) -> bool {
        if self.done {
            return false;
        }
        self.waiters.push_back(waiter);
        true
    }

    /// Marks completion and hands back every queued waiter.
    pub(crate) fn complete(&mut self) -> VecDeque<W> {
        self.done = true;
        core::mem::take(&mut self.waiters)
    }
}

/// Thread control block
///
/// `state` only changes while the home core's run-queue lock is held.
/// `context` is only touched by the home core during a switch.
pub(crate) struct Tcb {
    pub(crate) id: ThreadId,
    pub(crate) name: ThreadName,
    pub(crate) affinity: CpuSet,
    pub(crate) core: usize,
    state: AtomicU8,
    context: UnsafeCell<Context>,
    entry: Spinlock<Option<Entry>>,
    stack: Spinlock<Option<Stack>>,
    join: Spinlock<JoinList<Arc<Tcb>>>,
}

// SAFETY: see the access rules on `Tcb`
unsafe impl Send for Tcb {}
unsafe impl Sync for Tcb {}

impl Tcb {
    pub(crate) fn new(
        name: ThreadName,
        affinity: CpuSet,
        core: usize,
        context: Context,
        stack: Stack,
        entry: Entry,
    ) -> Self {
        Self {
            id: ThreadId::next(),
            name,
            affinity,
            core,
            state: AtomicU8::new(ThreadState::Ready as u8),
            context: UnsafeCell::new(context),
            entry: Spinlock::new(Some(entry)),
            stack: Spinlock::new(Some(stack)),
            join: Spinlock::new(JoinList::new()),
        }
    }

    pub(crate) fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn context_ptr(&self) -> *mut Context {
        self.context.get()
    }

    pub(crate) fn take_entry(&self) -> Option<Entry> {
        self.entry.lock_irqsave().take()
    }

    pub(crate) fn is_done(&self) -> bool {
        self.join.lock_irqsave().is_done()
    }

    pub(crate) fn register_joiner(&self, joiner: &Arc<Tcb>) -> bool {
        self.join.lock_irqsave().register(joiner.clone())
    }

    /// Called once the thread is off its core for good.
    pub(crate) fn complete(&self) -> VecDeque<Arc<Tcb>> {
        self.join.lock_irqsave().complete()
    }

    #[cfg(test)]
    pub(crate) fn joiners(&self) -> usize {
        self.join.lock_irqsave().len()
    }

    #[cfg(test)]
    pub(crate) fn has_stack(&self) -> bool {
        self.stack.lock_irqsave().is_some()
    }

    /// Frees the stack. Returns false if it was already gone.
    pub(crate) fn reclaim_stack(&self) -> bool {
        let stack = self.stack.lock_irqsave().take();
        stack.is_some()
    }
}

/// Owning handle to a runtime thread
///
/// Dropping the handle joins the thread.
pub struct Thread {
    tcb: Arc<Tcb>,
}

impl Thread {
    pub(crate) fn new(tcb: Arc<Tcb>) -> Self {
        Self { tcb }
    }

    pub fn id(&self) -> ThreadId {
        self.tcb.id
    }

    pub fn name(&self) -> &str {
        self.tcb.name.as_str()
    }

    /// Core the thread was placed on; threads never migrate.
    pub fn core(&self) -> usize {
        self.tcb.core
    }

    pub fn affinity(&self) -> CpuSet {
        self.tcb.affinity
    }

    pub fn state(&self) -> ThreadState {
        self.tcb.state()
    }

    /// True once the entry function has returned and the thread is off its core.
    pub fn is_finished(&self) -> bool {
        self.tcb.is_done()
    }

    /// Waits for the thread to finish, then frees its stack.
    ///
    /// Several threads may join through a shared handle; they are released
    /// in the order they started waiting. Returns immediately once the
    /// thread is done. Outside a runtime thread the caller spins.
    pub fn join(&self) {
        let target = &self.tcb;
        super::block_current(|me| !Arc::ptr_eq(me, target) && target.register_joiner(me));
        while !target.is_done() {
            cpu::relax();
        }
        if target.reclaim_stack() {
            log::trace!("joined thread {} '{}'", target.id, target.name);
        }
    }

    #[cfg(test)]
    pub(crate) fn tcb(&self) -> &Arc<Tcb> {
        &self.tcb
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        self.join();
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.tcb.id)
            .field("name", &self.tcb.name.as_str())
            .field("core", &self.tcb.core)
            .field("state", &self.tcb.state())
            .finish()
    }
}

/// Thread factory
#[derive(Debug, Clone)]
pub struct Builder {
    name: ThreadName,
    affinity: CpuSet,
    stack_size: usize,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            name: truncate_name("thread"),
            affinity: CpuSet::all(),
            stack_size: config::STACK_SIZE,
        }
    }

    /// Names longer than [`NAME_LEN`] bytes are cut at a character boundary.
    pub fn name(mut self, name: &str) -> Self {
        self.name = truncate_name(name);
        self
    }

    pub fn affinity(mut self, affinity: CpuSet) -> Self {
        self.affinity = affinity;
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    /// Creates the thread and makes it ready on one of its permitted cores.
    pub fn spawn<F>(self, f: F) -> Result<Thread>
    where
        F: FnOnce() + Send + 'static,
    {
        super::create(self.name, self.affinity, self.stack_size, Box::new(f))
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

fn truncate_name(name: &str) -> ThreadName {
    let mut out = ThreadName::new();
    for c in name.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpuset_online_matches_core_count() {
        let online = CpuSet::online();
        assert_eq!(online.cores().count(), config::CORE_COUNT);
        assert!(online.contains_core(0));
        assert!(!online.contains_core(config::CORE_COUNT));
        assert_eq!(CpuSet::default(), CpuSet::all());
    }

    #[test]
    fn test_cpuset_single() {
        assert_eq!(CpuSet::single(2), Some(CpuSet::CPU2));
        assert_eq!(CpuSet::single(config::MAX_CORES), None);
        let cores: std::vec::Vec<usize> = (CpuSet::CPU1 | CpuSet::CPU3).cores().collect();
        assert_eq!(cores, [1, 3]);
    }

    #[test]
    fn test_name_truncation() {
        assert_eq!(truncate_name("worker").as_str(), "worker");
        assert_eq!(truncate_name("a-rather-long-thread-name").as_str(), "a-rather-long-th");
        // multi-byte characters are never split
        assert_eq!(truncate_name("ééééééééé").len(), 16);
        assert_eq!(truncate_name("aéééééééé").as_str(), "aééééééé");
    }

    #[test]
    fn test_join_list_releases_in_fifo_order() {
        let mut list = JoinList::new();
        assert!(list.register(1));
        assert!(list.register(2));
        assert!(list.register(3));
        let released: std::vec::Vec<i32> = list.complete().into_iter().collect();
        assert_eq!(released, [1, 2, 3]);
        assert!(list.is_done());
        assert!(!list.register(4));
    }

    #[test]
    fn test_thread_state_round_trip() {
        for state in [ThreadState::Ready, ThreadState::Running, ThreadState::Blocked, ThreadState::Done] {
            assert_eq!(ThreadState::from_u8(state as u8), state);
        }
    }
}
