//! x86-64 architecture support.

pub mod apic;
pub mod context;
pub mod idt;
pub mod mmu;
pub mod msr;
pub mod mtrr;
pub mod pat;
pub mod serial;
pub mod timer;

pub use context::{context_init, context_switch, Context};
pub use mmu::{mmu_invalidate, mmu_switch};

/// Saved interrupt-enable state: the RFLAGS.IF bit at capture time.
pub type IrqState = bool;

/// Unconditionally enable maskable interrupts.
#[inline]
pub fn irq_enable() {
    #[cfg(target_os = "none")]
    ::x86_64::instructions::interrupts::enable();
}

/// Unconditionally disable maskable interrupts.
#[inline]
pub fn irq_disable() {
    #[cfg(target_os = "none")]
    ::x86_64::instructions::interrupts::disable();
}

/// Disable interrupts and return the previous enable state.
#[inline]
pub fn irq_save() -> IrqState {
    #[cfg(target_os = "none")]
    {
        let enabled = ::x86_64::instructions::interrupts::are_enabled();
        ::x86_64::instructions::interrupts::disable();
        enabled
    }
    #[cfg(not(target_os = "none"))]
    {
        false
    }
}

/// Restore exactly the state captured by [`irq_save`].
#[inline]
pub fn irq_restore(state: IrqState) {
    #[cfg(target_os = "none")]
    if state {
        ::x86_64::instructions::interrupts::enable();
    }
    #[cfg(not(target_os = "none"))]
    let _ = state;
}

/// Halt this CPU forever. Used by panic and by the final idle fallback.
pub fn halt() -> ! {
    irq_disable();
    loop {
        #[cfg(target_os = "none")]
        ::x86_64::instructions::hlt();
        #[cfg(not(target_os = "none"))]
        core::hint::spin_loop();
    }
}

/// Sleep until the next interrupt.
#[inline]
pub fn wait_for_interrupt() {
    #[cfg(target_os = "none")]
    ::x86_64::instructions::hlt();
    #[cfg(not(target_os = "none"))]
    core::hint::spin_loop();
}

/// Identifier of the executing hart (initial APIC ID).
pub fn cpu_id() -> u32 {
    let ebx: u32;
    // SAFETY: CPUID leaf 1 is a read-only, side-effect-free instruction
    // available at every privilege level. RBX is saved around the call
    // because LLVM reserves it.
    unsafe {
        core::arch::asm!(
            "mov {tmp:r}, rbx",
            "mov eax, 1",
            "cpuid",
            "mov eax, ebx",
            "mov rbx, {tmp:r}",
            tmp = out(reg) _,
            out("eax") ebx,
            out("ecx") _,
            out("edx") _,
            options(nomem, nostack),
        );
    }
    ebx >> 24
}

// ---------------------------------------------------------------------------
// Port I/O (x86 only)
// ---------------------------------------------------------------------------

/// Read a byte from an I/O port.
#[inline]
pub fn inb(port: u16) -> u8 {
    // SAFETY: Port reads have no memory effects; the caller chooses a port
    // that is architecturally safe to read in kernel mode.
    unsafe { ::x86_64::instructions::port::Port::new(port).read() }
}

/// Write a byte to an I/O port.
#[inline]
pub fn outb(port: u16, value: u8) {
    // SAFETY: As for `inb`; the caller picks the port.
    unsafe { ::x86_64::instructions::port::Port::new(port).write(value) }
}

/// Read a 16-bit word from an I/O port.
#[inline]
pub fn inw(port: u16) -> u16 {
    // SAFETY: As for `inb`.
    unsafe { ::x86_64::instructions::port::Port::new(port).read() }
}

/// Write a 16-bit word to an I/O port.
#[inline]
pub fn outw(port: u16, value: u16) {
    // SAFETY: As for `inb`.
    unsafe { ::x86_64::instructions::port::Port::new(port).write(value) }
}

/// Read a 32-bit long from an I/O port.
#[inline]
pub fn inl(port: u16) -> u32 {
    // SAFETY: As for `inb`.
    unsafe { ::x86_64::instructions::port::Port::new(port).read() }
}

/// Write a 32-bit long to an I/O port.
#[inline]
pub fn outl(port: u16, value: u32) {
    // SAFETY: As for `inb`.
    unsafe { ::x86_64::instructions::port::Port::new(port).write(value) }
}

/// Print the control and stack registers for the panic path.
pub fn dump_registers() {
    #[cfg(target_os = "none")]
    {
        let (rsp, rflags, cr2, cr3): (u64, u64, u64, u64);
        // SAFETY: Reads of RSP/RFLAGS/CR2/CR3 have no side effects in
        // kernel mode.
        unsafe {
            core::arch::asm!(
                "mov {rsp}, rsp",
                "pushfq",
                "pop {rflags}",
                "mov {cr2}, cr2",
                "mov {cr3}, cr3",
                rsp = out(reg) rsp,
                rflags = out(reg) rflags,
                cr2 = out(reg) cr2,
                cr3 = out(reg) cr3,
            );
        }
        crate::kprintln!(
            "  rsp={:#018x} rflags={:#010x}\n  cr2={:#018x} cr3={:#018x}",
            rsp,
            rflags,
            cr2,
            cr3
        );
    }
}

/// Bring up the vector table, interrupt controllers, PAT, and the periodic
/// timer. IRQs stay disabled; the caller enables them once the scheduler is
/// ready to take ticks.
pub fn init() {
    idt::init();
    pat::init();
    apic::init();
    log::info!("Arch initialized");
    timer::init();
}
