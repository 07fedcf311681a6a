//! Per-core scheduler
//!
//! Every core owns a FIFO run queue and runs one thread at a time. A thread
//! is placed on a core when it is created and never migrates. Switching is
//! cooperative (`schedule`, blocking calls) plus, on bare metal, a time-slice
//! check in the per-core tick.
//!
//! Lock order: run queue, then zombie slot or join list. Interrupts are
//! masked for the whole of every run-queue critical section.

mod stack;
mod thread;

pub use stack::{Stack, MIN_STACK_SIZE, STACK_ALIGN};
pub use thread::{Builder, CpuSet, Thread, ThreadId, ThreadName, ThreadState, NAME_LEN};
pub(crate) use thread::Tcb;

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use core::time::Duration;

use log::{debug, info, trace, warn};
use spin::Once;

use crate::arch::{self, context::Context, cpu::IrqGuard};
use crate::config::{self, MAX_CORES};
use crate::error::{Error, Result};
use crate::sync::Spinlock;
use crate::time::{self, timer::Timer};
use thread::Entry;

static RUNTIME: Once<Runtime> = Once::new();

struct Runtime {
    cpus: heapless::Vec<PerCpu, MAX_CORES>,
}

impl Runtime {
    fn new(count: usize) -> Self {
        let mut cpus = heapless::Vec::new();
        for id in 0..count.min(MAX_CORES) {
            let _ = cpus.push(PerCpu::new(id));
        }
        Self { cpus }
    }

    fn cpu(&self, id: usize) -> &PerCpu {
        &self.cpus[id]
    }

    /// Permitted core with the fewest ready threads; ties go to the lowest id.
    fn place(&self, permitted: CpuSet) -> Option<usize> {
        permitted
            .cores()
            .filter(|&id| id < self.cpus.len())
            .min_by_key(|&id| (self.cpus[id].nr_ready(), id))
    }
}

struct RunQueue {
    ready: VecDeque<Arc<Tcb>>,
    current: Option<Arc<Tcb>>,
}

/// Scheduler state of one core
struct PerCpu {
    id: usize,
    queue: Spinlock<RunQueue>,
    /// Saved state of the core's own scheduler loop.
    idle: UnsafeCell<Context>,
    /// Thread that exited and is still on its stack until the next switch completes.
    zombie: Spinlock<Option<Arc<Tcb>>>,
    nr_ready: AtomicUsize,
    switches: AtomicU64,
    ticks: AtomicU64,
}

// SAFETY: `idle` is only touched by the owning core
unsafe impl Sync for PerCpu {}

impl PerCpu {
    fn new(id: usize) -> Self {
        Self {
            id,
            queue: Spinlock::new(RunQueue {
                ready: VecDeque::new(),
                current: None,
            }),
            idle: UnsafeCell::new(Context::empty()),
            zombie: Spinlock::new(None),
            nr_ready: AtomicUsize::new(0),
            switches: AtomicU64::new(0),
            ticks: AtomicU64::new(0),
        }
    }

    fn nr_ready(&self) -> usize {
        self.nr_ready.load(Ordering::Relaxed)
    }

    fn push_ready(&self, rq: &mut RunQueue, tcb: Arc<Tcb>) {
        tcb.set_state(ThreadState::Ready);
        rq.ready.push_back(tcb);
        self.nr_ready.store(rq.ready.len(), Ordering::Relaxed);
    }

    fn pop_ready(&self, rq: &mut RunQueue) -> Option<Arc<Tcb>> {
        let next = rq.ready.pop_front();
        self.nr_ready.store(rq.ready.len(), Ordering::Relaxed);
        next
    }

    fn idle_ptr(&self) -> *mut Context {
        self.idle.get()
    }

    fn current(&self) -> Option<Arc<Tcb>> {
        self.queue.lock_irqsave().current.clone()
    }

    /// Completes a thread that exited on this core before the last switch.
    fn finish_switch(&self) {
        let zombie = self.zombie.lock_irqsave().take();
        if let Some(tcb) = zombie {
            debug!("thread {} '{}' finished on cpu{}", tcb.id, tcb.name, self.id);
            for joiner in tcb.complete() {
                wake(joiner);
            }
        }
    }
}

fn runtime() -> &'static Runtime {
    RUNTIME
        .get()
        .expect("sched::init() must run before threads are used")
}

/// Scheduler state of the calling core, if the caller runs on one.
fn this_cpu() -> Option<&'static PerCpu> {
    let id = arch::cpu::try_id()?;
    RUNTIME.get()?.cpus.get(id)
}

/// Builds the per-core tables and starts the cores. Idempotent.
pub fn init() {
    let mut created = false;
    RUNTIME.call_once(|| {
        created = true;
        Runtime::new(config::CORE_COUNT)
    });
    if created {
        info!(
            "scheduler: board {}, {} cores, {} backend, {} byte stacks",
            config::BOARD,
            config::CORE_COUNT,
            arch::BACKEND,
            config::STACK_SIZE
        );
        arch::start();
    }
}

/// Creates a thread with default name, affinity and stack size.
pub fn spawn<F>(f: F) -> Result<Thread>
where
    F: FnOnce() + Send + 'static,
{
    Builder::new().spawn(f)
}

pub(crate) fn create(name: ThreadName, affinity: CpuSet, stack_size: usize, entry: Entry) -> Result<Thread> {
    let rt = runtime();
    let Some(core) = rt.place(affinity & CpuSet::online()) else {
        warn!("thread '{}': no online core in affinity {:?}", name, affinity);
        return Err(Error::InvalidArgument);
    };
    let stack = Stack::new(stack_size).map_err(|err| {
        warn!("thread '{}': {} byte stack: {}", name, stack_size, err);
        err
    })?;
    let context = Context::new(stack.top(), thread_main)?;
    // Only the stack goes through a fallible allocation. The control block
    // is a small fixed-size `Arc`; exhausting the heap there ends in the
    // global allocation error handler like any other `alloc` collection.
    let tcb = Arc::new(Tcb::new(name, affinity, core, context, stack, entry));
    debug!("thread {} '{}' created on cpu{}", tcb.id, tcb.name, core);

    let pcpu = rt.cpu(core);
    {
        let mut rq = pcpu.queue.lock_irqsave();
        pcpu.push_ready(&mut rq, tcb.clone());
    }
    arch::cpu::notify(core);
    Ok(Thread::new(tcb))
}

fn thread_main() -> ! {
    if let Some(pcpu) = this_cpu() {
        pcpu.finish_switch();
    }
    arch::cpu::enable_interrupts();
    let entry = current().and_then(|me| me.take_entry());
    if let Some(entry) = entry {
        entry();
    }
    exit_current()
}

/// Retires the calling thread. Its stack stays in use until the next context
/// is running, so completion is signalled from `finish_switch`.
fn exit_current() -> ! {
    let _irq = IrqGuard::new();
    let Some(pcpu) = this_cpu() else {
        unreachable!("runtime thread running outside a core");
    };
    let to = {
        let mut rq = pcpu.queue.lock();
        let next = pcpu.pop_ready(&mut rq);
        if let Some(next) = &next {
            next.set_state(ThreadState::Running);
        }
        let to = match &next {
            Some(next) => next.context_ptr(),
            None => pcpu.idle_ptr(),
        };
        if let Some(me) = core::mem::replace(&mut rq.current, next) {
            me.set_state(ThreadState::Done);
            *pcpu.zombie.lock() = Some(me);
        }
        to
    };
    pcpu.switches.fetch_add(1, Ordering::Relaxed);
    // SAFETY: `to` is owned by this core and is not running
    unsafe { arch::context::exit_to(to) }
}

/// Scheduler loop of one core. Runs ready threads in FIFO order and idles
/// when there are none.
pub fn run_core() -> ! {
    let Some(pcpu) = this_cpu() else {
        panic!("run_core() called before sched::init() or on an unknown core");
    };
    info!("cpu{} entering scheduler", pcpu.id);
    loop {
        pcpu.finish_switch();
        let irq = IrqGuard::new();
        let to = {
            let mut rq = pcpu.queue.lock();
            let next = pcpu.pop_ready(&mut rq);
            if let Some(next) = &next {
                next.set_state(ThreadState::Running);
            }
            rq.current = next;
            rq.current.as_ref().map(|next| next.context_ptr())
        };
        match to {
            Some(to) => {
                pcpu.switches.fetch_add(1, Ordering::Relaxed);
                // SAFETY: both contexts belong to this core
                unsafe { arch::context::switch(pcpu.idle_ptr(), to) };
                drop(irq);
            }
            None => {
                drop(irq);
                arch::cpu::idle();
            }
        }
    }
}

/// Thread currently running on the calling core.
pub(crate) fn current() -> Option<Arc<Tcb>> {
    this_cpu()?.current()
}

/// Id of the calling runtime thread; `None` outside the runtime.
pub fn current_id() -> Option<ThreadId> {
    current().map(|tcb| tcb.id)
}

/// Gives up the core.
///
/// A running caller goes to the back of its core's queue if another thread
/// is ready, otherwise it keeps running. A caller already marked blocked
/// leaves the core until it is woken.
pub fn schedule() {
    let Some(pcpu) = this_cpu() else {
        return;
    };
    let _irq = IrqGuard::new();
    let (prev, to) = {
        let mut rq = pcpu.queue.lock();
        let Some(prev) = rq.current.clone() else {
            return;
        };
        let next = match prev.state() {
            ThreadState::Running => match pcpu.pop_ready(&mut rq) {
                Some(next) => {
                    pcpu.push_ready(&mut rq, prev.clone());
                    Some(next)
                }
                None => return,
            },
            // woken before it got off the core; it is in the queue already
            ThreadState::Ready => match pcpu.pop_ready(&mut rq) {
                Some(next) if Arc::ptr_eq(&next, &prev) => {
                    prev.set_state(ThreadState::Running);
                    return;
                }
                Some(next) => Some(next),
                None => {
                    prev.set_state(ThreadState::Running);
                    return;
                }
            },
            ThreadState::Blocked => pcpu.pop_ready(&mut rq),
            ThreadState::Done => return,
        };
        if let Some(next) = &next {
            next.set_state(ThreadState::Running);
        }
        rq.current = next;
        let to = match &rq.current {
            Some(next) => next.context_ptr(),
            None => pcpu.idle_ptr(),
        };
        (prev, to)
    };
    pcpu.switches.fetch_add(1, Ordering::Relaxed);
    trace!("cpu{}: switch out thread {}", pcpu.id, prev.id);
    // SAFETY: both contexts belong to this core and the queue lock is released
    unsafe { arch::context::switch(prev.context_ptr(), to) };
    drop(prev);
    pcpu.finish_switch();
}

/// Same as [`schedule`].
pub fn yield_now() {
    schedule();
}

/// Makes a blocked thread ready on its home core. No effect on a thread
/// that is not blocked.
pub(crate) fn wake(tcb: Arc<Tcb>) {
    let core = tcb.core;
    let pcpu = runtime().cpu(core);
    let woken = {
        let mut rq = pcpu.queue.lock_irqsave();
        if tcb.state() == ThreadState::Blocked {
            pcpu.push_ready(&mut rq, tcb);
            true
        } else {
            false
        }
    };
    if woken {
        arch::cpu::notify(core);
    }
}

/// Blocks the calling thread after `register` has published it somewhere a
/// waker will find it.
///
/// The thread is marked blocked before `register` runs, so a wake that races
/// with the switch is never lost. If `register` returns false the thread
/// keeps running. Returns false without calling `register` when the caller
/// is not a runtime thread.
pub(crate) fn block_current<F>(register: F) -> bool
where
    F: FnOnce(&Arc<Tcb>) -> bool,
{
    let _irq = IrqGuard::new();
    let Some(pcpu) = this_cpu() else {
        return false;
    };
    let Some(me) = pcpu.current() else {
        return false;
    };
    {
        let _rq = pcpu.queue.lock();
        me.set_state(ThreadState::Blocked);
    }
    if !register(&me) {
        let _rq = pcpu.queue.lock();
        if me.state() == ThreadState::Blocked {
            me.set_state(ThreadState::Running);
        }
        return false;
    }
    drop(me);
    schedule();
    true
}

/// Suspends the calling thread for at least `duration`.
///
/// Outside a runtime thread this busy-waits.
pub fn sleep(duration: Duration) {
    if current().is_none() {
        time::delay(duration);
        return;
    }
    let timer = Timer::one_shot();
    block_current(|me| {
        let me = me.clone();
        timer.start(move || wake(me.clone()), duration);
        true
    });
    drop(timer);
}

/// Per-core tick interrupt hook for bare-metal boot code.
///
/// Reloads the tick timer, drives the global timer engine on core 0 and
/// preempts the running thread once its time slice is used up. Must be
/// called after the interrupt has been acknowledged.
pub fn tick() {
    arch::timestamp::rearm_tick();
    let Some(pcpu) = this_cpu() else {
        return;
    };
    if pcpu.id == 0 {
        time::timer::tick();
    }
    let ticks = pcpu.ticks.fetch_add(1, Ordering::Relaxed) + 1;
    if ticks % config::TIME_SLICE_TICKS == 0 {
        schedule();
    }
}

/// Snapshot of one core's scheduler counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreStats {
    pub core: usize,
    pub ready: usize,
    pub switches: u64,
    pub running: Option<ThreadId>,
}

pub fn stats() -> heapless::Vec<CoreStats, MAX_CORES> {
    let mut out = heapless::Vec::new();
    let Some(rt) = RUNTIME.get() else {
        return out;
    };
    for pcpu in rt.cpus.iter() {
        let running = pcpu.current().map(|tcb| tcb.id);
        let _ = out.push(CoreStats {
            core: pcpu.id,
            ready: pcpu.nr_ready(),
            switches: pcpu.switches.load(Ordering::Relaxed),
            running,
        });
    }
    out
}
