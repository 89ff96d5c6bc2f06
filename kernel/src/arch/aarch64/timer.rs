//! AArch64 tick source: the EL1 physical generic timer (CNTP), fired
//! through PPI 30 and reprogrammed from its own handler.

use core::sync::atomic::{AtomicU64, Ordering};

use super::{gic, sysreg};
use crate::arch::TICK_HZ;
use crate::irq::{IrqController, IrqNumber};

/// Timer PPI INTID on the QEMU virt machine.
pub const TICK_IRQ: IrqNumber = IrqNumber::new(30);

/// CNTP_CTL_EL0 bit 0: enable.
const CNTP_CTL_ENABLE: u64 = 1;

/// Counter ticks per scheduler tick, derived from CNTFRQ once at init.
static TICKS_PER_INTERVAL: AtomicU64 = AtomicU64::new(0);

/// Counter frequency in Hz as reported by CNTFRQ_EL0.
pub fn frequency() -> u64 {
    sysreg::read_cntfrq()
}

/// Program the first countdown, register the handler, and enable the PPI.
pub fn init() {
    let cntfrq = sysreg::read_cntfrq();
    let interval = cntfrq / TICK_HZ;
    TICKS_PER_INTERVAL.store(interval, Ordering::Relaxed);

    sysreg::write_cntp_tval(interval);
    sysreg::write_cntp_ctl(CNTP_CTL_ENABLE);

    crate::irq::register_handler(TICK_IRQ, tick_handler, 0, false)
        .expect("tick IRQ already bound during arch init");
    gic::Gic
        .enable(TICK_IRQ)
        .expect("timer PPI rejected by GIC");

    log::info!("Timer initialized ({} Hz counter)", cntfrq);
}

// The CNTP countdown is one-shot; re-arm for the next period before the
// shared tick bookkeeping runs.
fn tick_handler(_irq: IrqNumber, _data: usize) {
    sysreg::write_cntp_tval(TICKS_PER_INTERVAL.load(Ordering::Relaxed));
    crate::timer::tick();
}
