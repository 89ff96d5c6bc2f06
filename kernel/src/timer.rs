//! Monotonic kernel clock.
//!
//! The per-architecture timer fires at [`crate::arch::TICK_HZ`] and calls
//! [`tick`], which advances the shared counter and gives the scheduler its
//! periodic kick. Time queries derive milliseconds from the tick count, so
//! they are cheap and monotonic.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::TICK_HZ;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Ticks since boot (monotonic, 64-bit; wraps after ~584 million years at
/// 1 kHz).
#[inline]
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Tick frequency in Hz.
#[inline]
pub const fn frequency() -> u64 {
    TICK_HZ
}

/// Milliseconds since boot: `ticks * 1000 / frequency`.
#[inline]
pub fn ms_since_boot() -> u64 {
    ticks() * 1000 / TICK_HZ
}

/// Advance the clock by one period and let the scheduler consider
/// preemption. Called from the timer interrupt with IRQs masked.
pub fn tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
    crate::sched::timer_tick();
}

/// Busy-wait for at least `ms` milliseconds. Only for early boot and
/// calibration paths; tasks use `sched::sleep_ms` instead.
pub fn spin_delay_ms(ms: u64) {
    let deadline = ms_since_boot() + ms;
    while ms_since_boot() < deadline {
        core::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn ms_follows_ticks() {
        let before = ms_since_boot();
        for _ in 0..TICK_HZ {
            tick();
        }
        // One second of ticks moves the clock by exactly 1000 ms.
        assert_eq!(ms_since_boot() - before, 1000);
    }
}
