//! Interrupt descriptor table and exception entry points.
//!
//! Exceptions get typed handlers (the `x86_64` crate distinguishes the
//! with-error-code and without-error-code frame shapes in the handler
//! signatures). External vectors 32..=47 carry the IRQ lines routed through
//! the I/O APIC plus the local APIC timer; each resolves to a stub that
//! runs the registered handler, signals EOI, and then gives the scheduler a
//! chance to preempt. Vectors 48..=254 report as unexpected; 255 is the
//! spurious vector and is dropped without EOI.

use lazy_static::lazy_static;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use super::apic;
use crate::irq::IrqNumber;

/// First external vector; vector = IRQ_BASE + irq number.
pub const IRQ_BASE: u8 = 32;

/// Spurious interrupt vector. Never EOI'd.
pub const SPURIOUS_VECTOR: u8 = 0xFF;

/// Vector used by the local APIC timer (IRQ 0 in the registry).
pub const TIMER_VECTOR: u8 = IRQ_BASE;

fn external_interrupt(vector: u8) {
    crate::irq::dispatch(IrqNumber::new((vector - IRQ_BASE) as u32));
    apic::eoi();
    crate::sched::preempt_if_needed();
}

macro_rules! external_stubs {
    ($idt:expr, $($vector:literal),+ $(,)?) => {
        $( {
            extern "x86-interrupt" fn stub(_frame: InterruptStackFrame) {
                external_interrupt($vector);
            }
            $idt[$vector].set_handler_fn(stub);
        } )+
    };
}

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.divide_error.set_handler_fn(divide_error_handler);
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.double_fault.set_handler_fn(double_fault_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_fault_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);

        external_stubs!(
            idt, 32, 33, 34, 35, 36, 37, 38, 39, 40, 41, 42, 43, 44, 45, 46, 47
        );

        // Anything past the routed range is a wiring bug, not a crash.
        for vector in 48..=254u8 {
            idt[vector].set_handler_fn(unexpected_interrupt_handler);
        }
        idt[SPURIOUS_VECTOR].set_handler_fn(spurious_interrupt_handler);
        idt
    };
}

/// Load the IDT on the boot hart.
pub fn init() {
    IDT.load();
}

extern "x86-interrupt" fn divide_error_handler(frame: InterruptStackFrame) {
    panic!("divide error\n{:#?}", frame);
}

extern "x86-interrupt" fn breakpoint_handler(frame: InterruptStackFrame) {
    log::warn!("breakpoint at {:?}", frame.instruction_pointer);
}

extern "x86-interrupt" fn invalid_opcode_handler(frame: InterruptStackFrame) {
    panic!("invalid opcode\n{:#?}", frame);
}

extern "x86-interrupt" fn double_fault_handler(frame: InterruptStackFrame, error_code: u64) -> ! {
    panic!("double fault (error {:#x})\n{:#?}", error_code, frame);
}

extern "x86-interrupt" fn general_protection_fault_handler(
    frame: InterruptStackFrame,
    error_code: u64,
) {
    panic!(
        "general protection fault (error {:#x})\n{:#?}",
        error_code, frame
    );
}

// The kernel core never demand-pages; any fault in kernel mode is a bug.
extern "x86-interrupt" fn page_fault_handler(
    frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    let addr = x86_64::registers::control::Cr2::read_raw();
    panic!(
        "page fault at {:#x} ({:?})\n{:#?}",
        addr, error_code, frame
    );
}

extern "x86-interrupt" fn unexpected_interrupt_handler(_frame: InterruptStackFrame) {
    log::warn!("unexpected interrupt vector");
    apic::eoi();
}

extern "x86-interrupt" fn spurious_interrupt_handler(_frame: InterruptStackFrame) {
    // Spurious: no EOI, no dispatch.
}
