//! Memory type range registers: write-combining fallback for CPUs (or
//! regions) where PAT cannot be used.
//!
//! Programming follows the Intel-documented sequence: interrupts off,
//! no-fill cache mode (CR0.CD), WBINVD, TLB flush, MTRRs disabled via the
//! default-type MSR, base+mask programmed, MTRRs re-enabled, WBINVD, TLB
//! flush, no-fill mode exited, interrupts restored. Variable ranges require
//! a power-of-two size and a size-aligned base; [`set_write_combining`]
//! rounds the caller's region accordingly.

use x86_64::registers::control::{Cr0, Cr0Flags};

use super::msr;
use crate::error::{KernelError, KernelResult};

/// Memory type value for write-combining.
const MTRR_TYPE_WC: u64 = 0x01;

/// IA32_MTRR_DEF_TYPE bit 11: MTRR enable.
const DEF_TYPE_ENABLE: u64 = 1 << 11;

/// IA32_MTRRCAP bit 10: WC type supported.
const CAP_WC: u64 = 1 << 10;

/// PHYSMASKn bit 11: range valid.
const MASK_VALID: u64 = 1 << 11;

/// Number of variable ranges this CPU implements.
fn variable_range_count() -> u32 {
    (msr::read_mtrr_cap() & 0xFF) as u32
}

/// Find a variable range whose valid bit is clear.
fn free_variable_range() -> Option<u32> {
    (0..variable_range_count()).find(|&n| msr::read_mtrr_phys_mask(n) & MASK_VALID == 0)
}

fn wbinvd() {
    // SAFETY: WBINVD writes back and invalidates all caches; privileged,
    // no memory operands. Required twice by the MTRR update sequence.
    unsafe { core::arch::asm!("wbinvd", options(nostack, preserves_flags)) };
}

fn flush_tlb() {
    x86_64::instructions::tlb::flush_all();
}

/// Mark `[base, base + size)` as write-combining through a variable MTRR.
///
/// `size` is rounded up to the next power of two and `base` down to that
/// size, so the covered range may exceed the request; callers map only the
/// region they asked for. The 36+ significant physical address bits are
/// assumed ≥ 36 (every 64-bit part qualifies).
pub fn set_write_combining(base: u64, size: u64) -> KernelResult<()> {
    if size == 0 {
        return Err(KernelError::InvalidArgument { what: "size" });
    }
    if msr::read_mtrr_cap() & CAP_WC == 0 {
        return Err(KernelError::Unsupported {
            operation: "mtrr write-combining",
        });
    }
    let range = free_variable_range().ok_or(KernelError::TableFull {
        table: "mtrr variable range",
    })?;

    let rounded_size = size.next_power_of_two();
    let rounded_base = base & !(rounded_size - 1);

    // Physical address width; mask bits above it must be ones.
    let phys_bits = phys_address_bits();
    let mask = (!(rounded_size - 1)) & ((1u64 << phys_bits) - 1);

    let irq_state = super::irq_save();

    // Enter no-fill cache mode and flush everything that might hold stale
    // attributes for the range.
    let saved_cr0 = Cr0::read();
    // SAFETY: Setting CD (and clearing NW) enters no-fill cache mode, a
    // reversible state change restored below; part of the SDM sequence.
    unsafe { Cr0::write(saved_cr0 | Cr0Flags::CACHE_DISABLE) };
    wbinvd();
    flush_tlb();

    let def_type = msr::read_mtrr_def_type();
    msr::write_mtrr_def_type(def_type & !DEF_TYPE_ENABLE);

    msr::write_mtrr_phys_base(range, rounded_base | MTRR_TYPE_WC);
    msr::write_mtrr_phys_mask(range, mask | MASK_VALID);

    msr::write_mtrr_def_type(def_type | DEF_TYPE_ENABLE);

    wbinvd();
    flush_tlb();
    // SAFETY: Restores the CR0 image captured above, leaving no-fill mode.
    unsafe { Cr0::write(saved_cr0) };

    super::irq_restore(irq_state);

    log::info!(
        "mtrr{}: WC over {:#x}..{:#x}",
        range,
        rounded_base,
        rounded_base + rounded_size
    );
    Ok(())
}

/// CPUID leaf 0x80000008 AL: physical address bits.
fn phys_address_bits() -> u32 {
    let eax: u32;
    // SAFETY: CPUID leaf 0x80000008 is read-only and supported on all
    // 64-bit parts. RBX preserved for LLVM.
    unsafe {
        core::arch::asm!(
            "mov {tmp:r}, rbx",
            "mov eax, 0x80000008",
            "cpuid",
            "mov rbx, {tmp:r}",
            tmp = out(reg) _,
            out("eax") eax,
            out("ecx") _,
            out("edx") _,
            options(nomem, nostack),
        );
    }
    eax & 0xFF
}
