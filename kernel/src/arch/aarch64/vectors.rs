//! EL1 exception vector table.
//!
//! All sixteen entries funnel into one assembly stub that saves the
//! caller-saved register file plus ELR/SPSR, tags the frame with its kind,
//! and calls into Rust. The kind discriminates the frame as a sum type:
//! synchronous exceptions carry a meaningful ESR/FAR, asynchronous IRQs go
//! to the GIC acknowledge path, SErrors are fatal.

use core::arch::global_asm;

use super::{gic, sysreg};

/// What kind of exception took us here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum TrapKind {
    /// Synchronous: data/instruction abort, SVC, illegal execution.
    Sync = 0,
    /// Asynchronous IRQ.
    Irq = 1,
    /// Asynchronous FIQ (group-0; unused by this kernel).
    Fiq = 2,
    /// System error.
    SError = 3,
}

impl TrapKind {
    fn from_raw(raw: u64) -> Self {
        match raw {
            0 => TrapKind::Sync,
            1 => TrapKind::Irq,
            2 => TrapKind::Fiq,
            _ => TrapKind::SError,
        }
    }
}

/// Register file captured by the vector stub. Callee-saved registers are
/// preserved by the compiled handler itself per the ABI.
#[repr(C)]
#[derive(Debug)]
pub struct TrapFrame {
    /// x0..x18.
    pub x: [u64; 19],
    pub x29: u64,
    pub x30: u64,
    pub elr: u64,
    pub spsr: u64,
    _pad: u64,
}

const _: () = assert!(core::mem::size_of::<TrapFrame>() == 192);

global_asm!(
    r#"
.macro trap_entry kind
    sub sp, sp, #192
    stp x0, x1, [sp, #0x00]
    stp x2, x3, [sp, #0x10]
    stp x4, x5, [sp, #0x20]
    stp x6, x7, [sp, #0x30]
    stp x8, x9, [sp, #0x40]
    stp x10, x11, [sp, #0x50]
    stp x12, x13, [sp, #0x60]
    stp x14, x15, [sp, #0x70]
    stp x16, x17, [sp, #0x80]
    stp x18, x29, [sp, #0x90]
    str x30, [sp, #0xA0]
    mrs x9, elr_el1
    mrs x10, spsr_el1
    stp x9, x10, [sp, #0xA8]

    mov x0, \kind
    mov x1, sp
    bl basalt_trap_entry

    ldp x9, x10, [sp, #0xA8]
    msr elr_el1, x9
    msr spsr_el1, x10
    ldp x0, x1, [sp, #0x00]
    ldp x2, x3, [sp, #0x10]
    ldp x4, x5, [sp, #0x20]
    ldp x6, x7, [sp, #0x30]
    ldp x8, x9, [sp, #0x40]
    ldp x10, x11, [sp, #0x50]
    ldp x12, x13, [sp, #0x60]
    ldp x14, x15, [sp, #0x70]
    ldp x16, x17, [sp, #0x80]
    ldp x18, x29, [sp, #0x90]
    ldr x30, [sp, #0xA0]
    add sp, sp, #192
    eret
.endm

.balign 0x800
.global basalt_vector_table
basalt_vector_table:
// Current EL with SP_EL0 -- never used, treat as fatal sync.
.balign 0x80
    trap_entry #0
.balign 0x80
    trap_entry #1
.balign 0x80
    trap_entry #2
.balign 0x80
    trap_entry #3
// Current EL with SP_ELx -- the kernel's own exceptions.
.balign 0x80
    trap_entry #0
.balign 0x80
    trap_entry #1
.balign 0x80
    trap_entry #2
.balign 0x80
    trap_entry #3
// Lower EL, AArch64.
.balign 0x80
    trap_entry #0
.balign 0x80
    trap_entry #1
.balign 0x80
    trap_entry #2
.balign 0x80
    trap_entry #3
// Lower EL, AArch32 -- unsupported, fatal sync.
.balign 0x80
    trap_entry #0
.balign 0x80
    trap_entry #1
.balign 0x80
    trap_entry #2
.balign 0x80
    trap_entry #3
"#
);

#[allow(non_upper_case_globals)]
extern "C" {
    static basalt_vector_table: u8;
}

/// Install the vector table on this PE.
pub fn init() {
    // SAFETY: Taking the address of the asm-defined table symbol.
    let base = unsafe { &basalt_vector_table as *const u8 as u64 };
    sysreg::write_vbar(base);
    // SAFETY: ISB so subsequent exceptions use the new VBAR.
    unsafe { core::arch::asm!("isb", options(nomem, nostack, preserves_flags)) };
}

#[no_mangle]
extern "C" fn basalt_trap_entry(kind: u64, frame: *mut TrapFrame) {
    // SAFETY: The stub passes its own stack frame, valid for the duration
    // of the handler.
    let frame = unsafe { &mut *frame };
    match TrapKind::from_raw(kind) {
        TrapKind::Irq => gic::handle_irq(),
        TrapKind::Fiq => log::warn!("unexpected FIQ"),
        TrapKind::Sync => {
            panic!(
                "synchronous exception: esr={:#x} far={:#x} elr={:#x} spsr={:#x}\n{:#x?}",
                sysreg::read_esr(),
                sysreg::read_far(),
                frame.elr,
                frame.spsr,
                frame
            );
        }
        TrapKind::SError => {
            panic!(
                "SError: esr={:#x} elr={:#x}\n{:#x?}",
                sysreg::read_esr(),
                frame.elr,
                frame
            );
        }
    }
}
