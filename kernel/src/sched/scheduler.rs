//! The round-robin scheduler.
//!
//! One lock guards the task table, the ready queue, and every state
//! transition. The switch path saves the interrupt state manually, takes
//! the lock only long enough to pick the next task and compute context
//! pointers, and performs the architecture switch with the lock released
//! and IRQs still masked — holding a spinlock across `context_switch`
//! would deadlock the next acquirer.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::ToString;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use super::task::{TaskControl, TaskId, TaskStack, TaskState, DEFAULT_STACK_SIZE, QUANTUM_TICKS};
use crate::arch;
use crate::error::{KernelError, KernelResult};
use crate::fs::file::FileTable;
use crate::sync::{OnceLock, SpinLock};

/// The boot task doubles as the idle task; it is never enqueued and never
/// blocks.
const IDLE_ID: TaskId = 0;

struct Sleeper {
    id: TaskId,
    deadline_ms: u64,
}

struct SchedInner {
    tasks: BTreeMap<TaskId, Box<TaskControl>>,
    ready: VecDeque<TaskId>,
    current: TaskId,
    next_id: TaskId,
    need_resched: bool,
    sleepers: Vec<Sleeper>,
}

static SCHED: SpinLock<SchedInner> = SpinLock::new(SchedInner {
    tasks: BTreeMap::new(),
    ready: VecDeque::new(),
    current: IDLE_ID,
    next_id: 1,
    need_resched: false,
    sleepers: Vec::new(),
});

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Fd table used before the scheduler exists (early boot, hosted tests).
static BOOT_FILES: OnceLock<Arc<SpinLock<FileTable>>> = OnceLock::new();

/// What to do with the outgoing task when switching away.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// Requeue at the tail (yield / preemption).
    Requeue,
    /// Leave off the queue; the caller already marked it blocked.
    Block,
    /// The task is a zombie and never runs again.
    Exit,
}

/// Adopt the currently executing boot context as task 0. Idempotent.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    let irq = arch::irq_save();
    {
        let mut inner = SCHED.lock();
        let mut boot = Box::new(TaskControl::new(IDLE_ID, IDLE_ID, "idle".to_string()));
        boot.state = TaskState::Running;
        inner.tasks.insert(IDLE_ID, boot);
        inner.current = IDLE_ID;
    }
    arch::irq_restore(irq);
    log::info!("scheduler: boot context adopted as task {}", IDLE_ID);
}

fn initialized() -> bool {
    INITIALIZED.load(Ordering::SeqCst)
}

/// Create a task running `entry(arg)` on a fresh stack and enqueue it.
pub fn spawn(name: &str, entry: extern "C" fn(usize), arg: usize) -> KernelResult<TaskId> {
    if !initialized() {
        return Err(KernelError::NotInitialized { subsystem: "sched" });
    }
    let stack = TaskStack::new(DEFAULT_STACK_SIZE).ok_or(KernelError::OutOfMemory {
        requested: DEFAULT_STACK_SIZE,
    })?;

    let irq = arch::irq_save();
    let id = {
        let mut inner = SCHED.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        let parent = inner.current;

        let mut tc = Box::new(TaskControl::new(id, parent, name.to_string()));
        // The context enters the shim with IRQs masked; the task record is
        // fully written before the id reaches the ready queue below.
        arch::context_init(&mut tc.context, task_entry_shim, stack.top(), id as usize);
        tc.entry = Some((entry, arg));
        tc.stack = Some(stack);
        inner.tasks.insert(id, tc);
        inner.ready.push_back(id);
        id
    };
    arch::irq_restore(irq);
    Ok(id)
}

/// First Rust code of every spawned task.
extern "C" fn task_entry_shim(id: usize) {
    let (entry, arg) = {
        let mut inner = SCHED.lock();
        let tc = inner
            .tasks
            .get_mut(&(id as TaskId))
            .expect("shim running for unknown task");
        tc.entry.take().expect("task dispatched twice")
    };
    arch::irq_enable();
    entry(arg);
    exit_current();
}

/// Exit hook referenced by the architecture trampolines for tasks whose
/// entry function returns.
#[no_mangle]
pub extern "C" fn basalt_task_exit() {
    exit_current();
}

/// Pick the next task id. Returns `None` when the current task should just
/// keep running.
fn pick_next(inner: &mut SchedInner, disposition: Disposition) -> Option<TaskId> {
    loop {
        match inner.ready.pop_front() {
            Some(id) => {
                // Skip entries whose task was reaped or blocked since
                // being enqueued.
                if inner
                    .tasks
                    .get(&id)
                    .is_some_and(|t| t.state == TaskState::Ready)
                {
                    return Some(id);
                }
            }
            None => {
                return match disposition {
                    Disposition::Requeue => None,
                    // Nothing runnable: fall back to the idle task.
                    Disposition::Block | Disposition::Exit => Some(IDLE_ID),
                };
            }
        }
    }
}

fn reap_zombies(inner: &mut SchedInner) {
    let current = inner.current;
    let dead: Vec<TaskId> = inner
        .tasks
        .iter()
        .filter(|(&id, t)| t.state == TaskState::Zombie && id != current)
        .map(|(&id, _)| id)
        .collect();
    for id in dead {
        inner.tasks.remove(&id);
    }
}

/// The switch path. IRQs must already be masked by the caller.
fn schedule(disposition: Disposition) {
    let prev_ptr: *mut arch::Context;
    let next_ptr: *const arch::Context;
    {
        let mut guard = SCHED.lock();
        let inner = &mut *guard;
        reap_zombies(inner);

        let prev_id = inner.current;
        let next_id = match pick_next(inner, disposition) {
            Some(id) if id != prev_id => id,
            _ => return,
        };

        match disposition {
            Disposition::Requeue => {
                let prev = inner.tasks.get_mut(&prev_id).expect("current task lost");
                prev.state = TaskState::Ready;
                // The idle task is the fallback of pick_next, never a
                // queue entry.
                if prev_id != IDLE_ID {
                    inner.ready.push_back(prev_id);
                }
            }
            Disposition::Block | Disposition::Exit => {}
        }

        {
            let next = inner.tasks.get_mut(&next_id).expect("ready task lost");
            next.state = TaskState::Running;
            next.quantum_left = QUANTUM_TICKS;
        }
        inner.current = next_id;
        inner.need_resched = false;

        // Boxed records give the contexts stable addresses; the pointers
        // stay valid after the lock drops because tasks are only removed
        // by reap_zombies, which never touches the outgoing or incoming
        // task of an in-flight switch.
        prev_ptr = &mut inner.tasks.get_mut(&prev_id).expect("prev").context;
        next_ptr = &inner.tasks.get(&next_id).expect("next").context;
    }
    // SAFETY: Both contexts are live task records; IRQs are masked by the
    // caller, so nothing can interrupt between save and load; the
    // scheduler lock is released.
    unsafe { arch::context_switch(&mut *prev_ptr, &*next_ptr) };
}

/// Cooperative yield: requeue at the tail and run the next ready task.
pub fn yield_now() {
    if !initialized() {
        return;
    }
    let irq = arch::irq_save();
    schedule(Disposition::Requeue);
    arch::irq_restore(irq);
}

/// Block the current task until [`wake`] or, with `deadline_ms > 0`, until
/// the deadline expires — in which case `TimedOut` is returned and the
/// wait had no side effect.
pub fn block_current(deadline_ms: u64) -> KernelResult<()> {
    if !initialized() {
        return Err(KernelError::NotInitialized { subsystem: "sched" });
    }
    let irq = arch::irq_save();
    let wake_consumed = {
        let mut guard = SCHED.lock();
        let inner = &mut *guard;
        let current = inner.current;
        assert!(current != IDLE_ID, "idle task cannot block");
        let tc = inner.tasks.get_mut(&current).expect("current task lost");
        if core::mem::take(&mut tc.wake_pending) {
            // A wake raced ahead of the block; consume it and don't
            // suspend at all.
            true
        } else {
            tc.woke_by_timeout = false;
            tc.state = TaskState::Blocked;
            if deadline_ms > 0 {
                let deadline = crate::timer::ms_since_boot() + deadline_ms;
                inner.sleepers.push(Sleeper {
                    id: current,
                    deadline_ms: deadline,
                });
            }
            false
        }
    };
    if wake_consumed {
        arch::irq_restore(irq);
        return Ok(());
    }
    schedule(Disposition::Block);
    arch::irq_restore(irq);

    let mut guard = SCHED.lock_irqsave();
    let inner = &mut *guard;
    let current = inner.current;
    let tc = inner.tasks.get_mut(&current).expect("current task lost");
    if core::mem::take(&mut tc.woke_by_timeout) {
        Err(KernelError::TimedOut {
            after_ms: deadline_ms,
        })
    } else {
        Ok(())
    }
}

/// Make a blocked task runnable again.
pub fn wake(id: TaskId) -> KernelResult<()> {
    let mut guard = SCHED.lock_irqsave();
    let inner = &mut *guard;
    let tc = inner.tasks.get_mut(&id).ok_or(KernelError::NotFound)?;
    match tc.state {
        TaskState::Blocked => {
            tc.state = TaskState::Ready;
            tc.woke_by_timeout = false;
            inner.sleepers.retain(|s| s.id != id);
            inner.ready.push_back(id);
        }
        TaskState::Running | TaskState::Ready => {
            // Not suspended yet (or already runnable): remember the wake
            // so the next block consumes it.
            tc.wake_pending = true;
        }
        TaskState::Zombie => {}
    }
    Ok(())
}

/// Sleep for at least `ms` milliseconds.
pub fn sleep_ms(ms: u64) -> KernelResult<()> {
    match block_current(ms) {
        Err(KernelError::TimedOut { .. }) | Ok(()) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Terminate the calling task.
pub fn exit_current() -> ! {
    let _ = arch::irq_save();
    {
        let mut inner = SCHED.lock();
        let current = inner.current;
        assert!(current != IDLE_ID, "idle task cannot exit");
        inner.tasks.get_mut(&current).expect("current task lost").state = TaskState::Zombie;
    }
    schedule(Disposition::Exit);
    unreachable!("zombie task rescheduled");
}

/// Timer-tick hook: wake expired sleepers, burn the current quantum, and
/// request a reschedule when it runs out. Runs in interrupt context with
/// IRQs masked.
pub fn timer_tick() {
    if !initialized() {
        return;
    }
    let mut guard = SCHED.lock();
    let inner = &mut *guard;

    let now = crate::timer::ms_since_boot();
    let expired: Vec<TaskId> = inner
        .sleepers
        .iter()
        .filter(|s| s.deadline_ms <= now)
        .map(|s| s.id)
        .collect();
    if !expired.is_empty() {
        inner.sleepers.retain(|s| s.deadline_ms > now);
        for id in expired {
            if let Some(tc) = inner.tasks.get_mut(&id) {
                if tc.state == TaskState::Blocked {
                    tc.state = TaskState::Ready;
                    tc.woke_by_timeout = true;
                    inner.ready.push_back(id);
                }
            }
        }
    }

    let current = inner.current;
    if let Some(tc) = inner.tasks.get_mut(&current) {
        tc.quantum_left = tc.quantum_left.saturating_sub(1);
        if tc.quantum_left == 0 && !inner.ready.is_empty() {
            inner.need_resched = true;
        }
    }
}

/// Called by the interrupt return path after EOI: perform the switch the
/// tick asked for.
pub fn preempt_if_needed() {
    if !initialized() {
        return;
    }
    let should = {
        let inner = SCHED.lock();
        inner.need_resched
    };
    if should {
        let irq = arch::irq_save();
        schedule(Disposition::Requeue);
        arch::irq_restore(irq);
    }
}

/// Id of the task whose registers are live.
pub fn current_task_id() -> TaskId {
    if !initialized() {
        return IDLE_ID;
    }
    SCHED.lock_irqsave().current
}

/// Number of live (non-reaped) tasks.
pub fn task_count() -> usize {
    if !initialized() {
        return 0;
    }
    let mut inner = SCHED.lock_irqsave();
    reap_zombies(&mut inner);
    inner.tasks.len()
}

/// Run `f` against the current task's descriptor table (or the boot table
/// before the scheduler exists).
pub fn with_current_files<R>(f: impl FnOnce(&mut FileTable) -> R) -> R {
    let files = if initialized() {
        let inner = SCHED.lock_irqsave();
        let current = inner.current;
        inner
            .tasks
            .get(&current)
            .map(|t| t.files.clone())
            .unwrap_or_else(|| boot_files())
    } else {
        boot_files()
    };
    let mut table = files.lock();
    f(&mut table)
}

fn boot_files() -> Arc<SpinLock<FileTable>> {
    BOOT_FILES
        .get_or_init(|| Arc::new(SpinLock::new(FileTable::new())))
        .clone()
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

struct EventInner {
    signaled: bool,
    waiters: Vec<TaskId>,
}

/// A one-shot signalable condition with optional deadlines on the wait.
pub struct Event {
    inner: SpinLock<EventInner>,
}

impl Event {
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(EventInner {
                signaled: false,
                waiters: Vec::new(),
            }),
        }
    }

    /// Wait until [`Event::signal`]; `deadline_ms > 0` bounds the wait.
    pub fn wait(&self, deadline_ms: u64) -> KernelResult<()> {
        loop {
            {
                let mut ev = self.inner.lock_irqsave();
                if ev.signaled {
                    return Ok(());
                }
                let id = current_task_id();
                if !ev.waiters.contains(&id) {
                    ev.waiters.push(id);
                }
            }
            match block_current(deadline_ms) {
                Ok(()) => continue, // woken; re-check the flag
                Err(e) => {
                    let id = current_task_id();
                    self.inner.lock_irqsave().waiters.retain(|&w| w != id);
                    return Err(e);
                }
            }
        }
    }

    /// Set the flag and wake every waiter.
    pub fn signal(&self) {
        let waiters: Vec<TaskId> = {
            let mut ev = self.inner.lock_irqsave();
            ev.signaled = true;
            ev.waiters.drain(..).collect()
        };
        for id in waiters {
            let _ = wake(id);
        }
    }

    /// Reset the flag for reuse.
    pub fn clear(&self) {
        self.inner.lock_irqsave().signaled = false;
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::AtomicU64;

    use super::*;

    const ROUNDS: u64 = 200;

    extern "C" fn counter_task(arg: usize) {
        let counter = arg as *const AtomicU64;
        for _ in 0..ROUNDS {
            // SAFETY: The test passes a pointer to a static counter.
            unsafe { (*counter).fetch_add(1, Ordering::SeqCst) };
            yield_now();
        }
    }

    #[test_case]
    fn round_robin_interleaves_two_tasks() {
        static COUNT_A: AtomicU64 = AtomicU64::new(0);
        static COUNT_B: AtomicU64 = AtomicU64::new(0);

        init();
        let base = task_count();
        spawn("counter-a", counter_task, &COUNT_A as *const _ as usize).unwrap();
        spawn("counter-b", counter_task, &COUNT_B as *const _ as usize).unwrap();

        // Drive the scheduler from the boot task until both finish.
        let mut guard = 0u64;
        while task_count() > base {
            yield_now();
            guard += 1;
            assert!(guard < 1_000_000, "counter tasks never finished");
        }
        assert_eq!(COUNT_A.load(Ordering::SeqCst), ROUNDS);
        assert_eq!(COUNT_B.load(Ordering::SeqCst), ROUNDS);
    }

    extern "C" fn waker_task(arg: usize) {
        let target = arg as TaskId;
        wake(target).unwrap();
    }

    #[test_case]
    fn block_until_woken() {
        init();
        // The boot task cannot block (it is the idle fallback), so run the
        // whole exchange between two spawned tasks.
        static RESULT: AtomicU64 = AtomicU64::new(0);

        extern "C" fn sleeper_task(_arg: usize) {
            let me = current_task_id();
            spawn("waker", waker_task, me as usize).unwrap();
            match block_current(0) {
                Ok(()) => RESULT.store(1, Ordering::SeqCst),
                Err(_) => RESULT.store(2, Ordering::SeqCst),
            }
        }

        let base = task_count();
        spawn("sleeper", sleeper_task, 0).unwrap();
        let mut guard = 0u64;
        while task_count() > base {
            yield_now();
            guard += 1;
            assert!(guard < 1_000_000, "sleeper never finished");
        }
        assert_eq!(RESULT.load(Ordering::SeqCst), 1);
    }

    #[test_case]
    fn event_signal_releases_waiter() {
        init();
        static EVENT: Event = Event::new();
        static OUTCOME: AtomicU64 = AtomicU64::new(0);

        extern "C" fn signaler_task(_arg: usize) {
            EVENT.signal();
        }

        extern "C" fn waiter_task(_arg: usize) {
            spawn("signaler", signaler_task, 0).unwrap();
            match EVENT.wait(0) {
                Ok(()) => OUTCOME.store(1, Ordering::SeqCst),
                Err(_) => OUTCOME.store(2, Ordering::SeqCst),
            }
        }

        let base = task_count();
        spawn("waiter", waiter_task, 0).unwrap();
        let mut guard = 0u64;
        while task_count() > base {
            yield_now();
            guard += 1;
            assert!(guard < 1_000_000, "event exchange hung");
        }
        assert_eq!(OUTCOME.load(Ordering::SeqCst), 1);
    }

    #[test_case]
    fn deadline_returns_timed_out() {
        init();
        static RESULT: AtomicU64 = AtomicU64::new(0);

        extern "C" fn ticker_task(_arg: usize) {
            // Stand in for the hardware tick: advance the clock until the
            // sleeper's deadline fires, then get out of the way.
            for _ in 0..100_000u64 {
                crate::timer::tick();
                yield_now();
                if RESULT.load(Ordering::SeqCst) != 0 {
                    return;
                }
            }
        }

        extern "C" fn deadline_task(_arg: usize) {
            spawn("ticker", ticker_task, 0).unwrap();
            match block_current(5) {
                Err(KernelError::TimedOut { .. }) => RESULT.store(1, Ordering::SeqCst),
                _ => RESULT.store(2, Ordering::SeqCst),
            }
        }

        let base = task_count();
        spawn("deadline", deadline_task, 0).unwrap();
        let mut guard = 0u64;
        while task_count() > base {
            yield_now();
            guard += 1;
            assert!(guard < 10_000_000, "deadline test hung");
        }
        assert_eq!(RESULT.load(Ordering::SeqCst), 1);
    }
}
