//! Architecture abstraction layer.
//!
//! Everything the portable kernel needs from the hardware goes through this
//! module: interrupt masking, context save/restore, MMU control, and the
//! per-architecture interrupt controller and timer. The primitives here are
//! infallible; passing them garbage is a programming error, not a
//! recoverable condition.

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "aarch64")]
use aarch64 as imp;
#[cfg(target_arch = "x86_64")]
use x86_64 as imp;

pub use imp::{
    context_init, context_switch, cpu_id, dump_registers, halt, irq_disable, irq_enable,
    irq_restore, irq_save, mmu_invalidate, mmu_switch, wait_for_interrupt, Context, IrqState,
};

/// Early architecture bring-up: vector table, interrupt controller, and the
/// periodic timer source. Runs once on the boot hart with IRQs disabled.
pub fn init() {
    imp::init();
}

/// Hz of the periodic scheduler tick programmed by [`init`].
pub const TICK_HZ: u64 = 1000;
