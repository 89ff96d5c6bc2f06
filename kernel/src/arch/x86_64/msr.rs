//! Model-specific register access.
//!
//! Raw `rdmsr`/`wrmsr` stay private; every register the kernel touches gets
//! a typed accessor so a wrong-register bug shows up at the call site, not
//! at runtime.

/// Read a 64-bit model-specific register.
fn rdmsr(msr: u32) -> u64 {
    let (low, high): (u32, u32);
    // SAFETY: RDMSR reads the MSR selected by ECX. All call sites below
    // pass architecturally defined MSR numbers; reading them has no side
    // effects beyond returning the value.
    unsafe {
        core::arch::asm!(
            "rdmsr",
            in("ecx") msr,
            out("eax") low,
            out("edx") high,
            options(nomem, nostack, preserves_flags),
        );
    }
    (low as u64) | ((high as u64) << 32)
}

/// Write a 64-bit model-specific register.
fn wrmsr(msr: u32, value: u64) {
    let low = value as u32;
    let high = (value >> 32) as u32;
    // SAFETY: WRMSR writes the MSR selected by ECX. All call sites below
    // pass architecturally defined MSR numbers with values constructed per
    // the SDM; this is privileged CPU reconfiguration, which is exactly the
    // purpose of these accessors.
    unsafe {
        core::arch::asm!(
            "wrmsr",
            in("ecx") msr,
            in("eax") low,
            in("edx") high,
            options(nomem, nostack, preserves_flags),
        );
    }
}

const IA32_APIC_BASE: u32 = 0x1B;
const IA32_PAT: u32 = 0x277;
const IA32_MTRRCAP: u32 = 0xFE;
const IA32_MTRR_DEF_TYPE: u32 = 0x2FF;
const IA32_MTRR_PHYSBASE0: u32 = 0x200;
const IA32_MTRR_PHYSMASK0: u32 = 0x201;

/// IA32_APIC_BASE: APIC base physical address plus enable/BSP flags.
pub fn read_apic_base() -> u64 {
    rdmsr(IA32_APIC_BASE)
}

pub fn write_apic_base(value: u64) {
    wrmsr(IA32_APIC_BASE, value);
}

/// IA32_PAT: the eight page-attribute-table entries, one byte each.
pub fn read_pat() -> u64 {
    rdmsr(IA32_PAT)
}

pub fn write_pat(value: u64) {
    wrmsr(IA32_PAT, value);
}

/// IA32_MTRRCAP: variable-range count in bits [7:0], WC support in bit 10.
pub fn read_mtrr_cap() -> u64 {
    rdmsr(IA32_MTRRCAP)
}

/// IA32_MTRR_DEF_TYPE: default memory type and the MTRR enable bit (11).
pub fn read_mtrr_def_type() -> u64 {
    rdmsr(IA32_MTRR_DEF_TYPE)
}

pub fn write_mtrr_def_type(value: u64) {
    wrmsr(IA32_MTRR_DEF_TYPE, value);
}

/// IA32_MTRR_PHYSBASEn for variable range `n`.
pub fn read_mtrr_phys_base(n: u32) -> u64 {
    rdmsr(IA32_MTRR_PHYSBASE0 + 2 * n)
}

pub fn write_mtrr_phys_base(n: u32, value: u64) {
    wrmsr(IA32_MTRR_PHYSBASE0 + 2 * n, value);
}

/// IA32_MTRR_PHYSMASKn for variable range `n`; bit 11 is the valid bit.
pub fn read_mtrr_phys_mask(n: u32) -> u64 {
    rdmsr(IA32_MTRR_PHYSMASK0 + 2 * n)
}

pub fn write_mtrr_phys_mask(n: u32, value: u64) {
    wrmsr(IA32_MTRR_PHYSMASK0 + 2 * n, value);
}
