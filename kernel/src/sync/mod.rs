//! Kernel synchronization primitives.
//!
//! [`SpinLock`] is the low-level building block: a 32-bit word acquired
//! with a compare-exchange (acquire ordering) and released with a plain
//! store (release ordering), with an IRQ-save variant whose guard restores
//! exactly the interrupt state it captured. Composite structures elsewhere
//! in the kernel use `spin::Mutex` / `spin::RwLock` directly where the
//! IRQ-save discipline is not needed.

mod atomic;
mod once_lock;
mod spinlock;

pub use atomic::AtomicCounter;
pub use once_lock::OnceLock;
pub use spinlock::{IrqSpinGuard, SpinGuard, SpinLock};
