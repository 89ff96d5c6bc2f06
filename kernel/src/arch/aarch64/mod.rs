//! ARMv8-A (AArch64) architecture support. Targets the QEMU `virt`
//! platform: GICv3, generic timer, PL011 UART.

pub mod context;
pub mod gic;
pub mod mmu;
pub mod serial;
pub mod sysreg;
pub mod timer;
pub mod vectors;

pub use context::{context_init, context_switch, Context};
pub use mmu::{mmu_invalidate, mmu_switch};

/// Saved interrupt-mask state: the DAIF register image at capture time.
pub type IrqState = u64;

/// Unconditionally unmask IRQs (clear DAIF.I).
#[inline]
pub fn irq_enable() {
    #[cfg(target_os = "none")]
    // SAFETY: DAIFClr only affects this PE's interrupt masking.
    unsafe {
        core::arch::asm!("msr daifclr, #2", options(nomem, nostack, preserves_flags))
    };
}

/// Unconditionally mask IRQs (set DAIF.I).
#[inline]
pub fn irq_disable() {
    #[cfg(target_os = "none")]
    // SAFETY: DAIFSet only affects this PE's interrupt masking.
    unsafe {
        core::arch::asm!("msr daifset, #2", options(nomem, nostack, preserves_flags))
    };
}

/// Mask IRQs and return the previous DAIF image.
#[inline]
pub fn irq_save() -> IrqState {
    #[cfg(target_os = "none")]
    {
        let daif = sysreg::read_daif();
        irq_disable();
        daif
    }
    #[cfg(not(target_os = "none"))]
    {
        0
    }
}

/// Restore exactly the DAIF image captured by [`irq_save`].
#[inline]
pub fn irq_restore(state: IrqState) {
    #[cfg(target_os = "none")]
    sysreg::write_daif(state);
    #[cfg(not(target_os = "none"))]
    let _ = state;
}

/// Halt this PE forever.
pub fn halt() -> ! {
    #[cfg(target_os = "none")]
    {
        // SAFETY: Masking all of DAIF before the WFI loop is the terminal
        // state of the panic path.
        unsafe {
            core::arch::asm!("msr daifset, #0xf", options(nomem, nostack, preserves_flags))
        };
        loop {
            cortex_a::asm::wfi();
        }
    }
    #[cfg(not(target_os = "none"))]
    {
        loop {
            core::hint::spin_loop();
        }
    }
}

/// Sleep until the next interrupt.
#[inline]
pub fn wait_for_interrupt() {
    #[cfg(target_os = "none")]
    cortex_a::asm::wfi();
    #[cfg(not(target_os = "none"))]
    core::hint::spin_loop();
}

/// Identifier of the executing hart (MPIDR Aff0).
pub fn cpu_id() -> u32 {
    #[cfg(target_os = "none")]
    {
        (sysreg::read_mpidr() & 0xFF) as u32
    }
    #[cfg(not(target_os = "none"))]
    {
        0
    }
}

/// Print the fault and translation registers for the panic path.
pub fn dump_registers() {
    #[cfg(target_os = "none")]
    {
        let sp: u64;
        // SAFETY: Reading SP has no side effects.
        unsafe { core::arch::asm!("mov {}, sp", out(reg) sp) };
        crate::kprintln!(
            "  sp={:#018x} daif={:#06x}\n  esr={:#010x} far={:#018x} ttbr0={:#018x}",
            sp,
            sysreg::read_daif(),
            sysreg::read_esr(),
            sysreg::read_far(),
            sysreg::read_ttbr0()
        );
    }
}

/// Bring up the vector table, GIC, and the generic timer. IRQs stay
/// masked; the caller unmasks once the scheduler can take ticks.
pub fn init() {
    vectors::init();
    mmu::init_mair();
    gic::init();
    log::info!("Arch initialized");
    timer::init();
}
