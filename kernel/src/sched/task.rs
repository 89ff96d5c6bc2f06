//! Task records: identity, state, stack ownership, saved context.

use alloc::string::String;
use alloc::sync::Arc;

use crate::arch::Context;
use crate::fs::file::FileTable;
use crate::sync::SpinLock;

/// Task identifier. Task 0 is the boot/idle task.
pub type TaskId = u64;

/// Stack size given to every spawned task.
pub const DEFAULT_STACK_SIZE: usize = 16 * 1024;

/// Timer ticks per scheduling quantum (10 ms at the 1 kHz tick).
pub const QUANTUM_TICKS: u32 = 10;

/// Life-cycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// On the ready queue, waiting for CPU.
    Ready,
    /// The one task whose registers are live on the hart.
    Running,
    /// Off the ready queue until a wake condition fires.
    Blocked,
    /// Finished; awaiting reaping.
    Zombie,
}

/// A task's owned stack region, released when the task is reaped.
pub struct TaskStack {
    base: *mut u8,
    size: usize,
}

// SAFETY: The stack region is exclusively owned by its task; the pointer
// moves between harts only together with the whole task record.
unsafe impl Send for TaskStack {}

impl TaskStack {
    /// Allocate a 16-byte aligned stack of `size` bytes.
    pub fn new(size: usize) -> Option<Self> {
        let layout = core::alloc::Layout::from_size_align(size, 16).ok()?;
        // SAFETY: Layout is non-zero and valid.
        let base = unsafe { alloc::alloc::alloc(layout) };
        if base.is_null() {
            return None;
        }
        Some(Self { base, size })
    }

    /// Exclusive upper bound; initial stack pointer.
    pub fn top(&self) -> usize {
        self.base as usize + self.size
    }
}

impl Drop for TaskStack {
    fn drop(&mut self) {
        // SAFETY: base/size are exactly what alloc() returned.
        unsafe {
            alloc::alloc::dealloc(
                self.base,
                core::alloc::Layout::from_size_align(self.size, 16).expect("stack layout"),
            );
        }
    }
}

/// Everything the scheduler tracks about one task. Boxed so the record
/// (and the context inside it) has a stable address across queue shuffles.
pub struct TaskControl {
    pub id: TaskId,
    pub parent: TaskId,
    pub name: String,
    pub state: TaskState,
    /// Saved register context; only the switch path writes it while the
    /// task is suspended.
    pub context: Context,
    /// Owned stack; `None` for the boot task, which keeps the stack the
    /// firmware hand-off gave it.
    pub stack: Option<TaskStack>,
    /// Entry point and argument, consumed by the first dispatch.
    pub entry: Option<(extern "C" fn(usize), usize)>,
    /// Ticks left in the current quantum.
    pub quantum_left: u32,
    /// Set when a blocking wait was released by its deadline rather than
    /// a wake.
    pub woke_by_timeout: bool,
    /// A wake arrived while the task was still running; the next block
    /// consumes it instead of suspending (closes the wake/block race).
    pub wake_pending: bool,
    /// Per-task file-descriptor table, shared with the VFS layer.
    pub files: Arc<SpinLock<FileTable>>,
}

impl TaskControl {
    pub fn new(id: TaskId, parent: TaskId, name: String) -> Self {
        Self {
            id,
            parent,
            name,
            state: TaskState::Ready,
            context: Context::zeroed(),
            stack: None,
            entry: None,
            quantum_left: QUANTUM_TICKS,
            woke_by_timeout: false,
            wake_pending: false,
            files: Arc::new(SpinLock::new(FileTable::new())),
        }
    }
}
