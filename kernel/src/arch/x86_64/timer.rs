//! x86-64 tick source.
//!
//! The local APIC timer drives the 1 kHz scheduler tick; the PIT is used
//! once for calibration and then left idle. The portable side of the clock
//! (tick counter, `ms_since_boot`) lives in `crate::timer`.

use core::sync::atomic::{AtomicU64, Ordering};

use super::apic;
use crate::arch::TICK_HZ;
use crate::irq::IrqNumber;

/// Measured APIC timer frequency in Hz, set once during calibration.
static TIMER_HZ: AtomicU64 = AtomicU64::new(0);

/// IRQ registry number of the tick interrupt.
pub const TICK_IRQ: IrqNumber = IrqNumber::new(0);

/// Frequency of the underlying tick source in Hz.
pub fn frequency() -> u64 {
    TIMER_HZ.load(Ordering::Relaxed)
}

/// Calibrate and start the periodic tick, and register its handler.
pub fn init() {
    let hz = apic::start_periodic_timer(TICK_HZ);
    TIMER_HZ.store(hz, Ordering::Relaxed);

    crate::irq::register_handler(TICK_IRQ, tick_handler, 0, false)
        .expect("tick IRQ already bound during arch init");

    log::info!("Timer initialized ({} Hz apic timer)", hz);
}

fn tick_handler(_irq: IrqNumber, _data: usize) {
    crate::timer::tick();
}
