//! Task management and scheduling.
//!
//! Single-hart preemptive round-robin: tasks run until they yield, block,
//! or the timer tick expires their quantum. The ready queue and all task
//! state transitions live behind one scheduler lock taken with IRQs
//! masked; the lock is never held across a context switch.

mod scheduler;
mod task;

pub use scheduler::{
    block_current, current_task_id, exit_current, init, preempt_if_needed, sleep_ms, spawn,
    task_count, timer_tick, wake, with_current_files, yield_now, Event,
};
pub use task::{TaskId, TaskState, DEFAULT_STACK_SIZE, QUANTUM_TICKS};
