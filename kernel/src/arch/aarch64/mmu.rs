//! AArch64 MMU control: translation base switching, TLB maintenance, and
//! the MAIR layout the page-table encoder relies on.

use super::sysreg;
use cortex_a::asm::barrier;

/// MAIR_EL1 attribute slots used by leaf descriptors (AttrIndx):
///
/// | Index | Encoding | Type |
/// |-------|----------|------|
/// | 0     | 0xFF     | Normal, write-back |
/// | 1     | 0x04     | Device-nGnRE (uncached / MMIO) |
/// | 2     | 0x44     | Normal, non-cacheable (write-combining) |
/// | 3     | 0xBB     | Normal, write-through |
pub const MAIR_LAYOUT: u64 = 0xFF | (0x04 << 8) | (0x44 << 16) | (0xBB << 24);

/// Program the MAIR slots above. Runs before any mapping with a
/// non-default cache mode is created.
pub fn init_mair() {
    sysreg::write_mair(MAIR_LAYOUT);
    // SAFETY: ISB so the new MAIR is observed by later table walks.
    unsafe { barrier::isb(barrier::SY) };
}

/// Install `root` as TTBR0_EL1 and invalidate all EL1 TLB entries with the
/// required barriers (DSB before, TLBI, DSB+ISB after).
pub fn mmu_switch(root: u64) {
    // SAFETY: The caller passes a valid 4 KiB-aligned L0 table; the
    // sequence is the architectural recipe for a translation-base change.
    unsafe {
        barrier::dsb(barrier::ISHST);
        sysreg::write_ttbr0(root);
        core::arch::asm!("tlbi vmalle1", options(nostack, preserves_flags));
        barrier::dsb(barrier::ISH);
        barrier::isb(barrier::SY);
    }
}

/// Invalidate the TLB entry for the page containing `vaddr`, or everything
/// when `vaddr` is zero. Barriered.
pub fn mmu_invalidate(vaddr: u64) {
    // SAFETY: TLB maintenance instructions with the standard barrier
    // bracketing; no memory is touched.
    unsafe {
        barrier::dsb(barrier::ISHST);
        if vaddr == 0 {
            core::arch::asm!("tlbi vmalle1", options(nostack, preserves_flags));
        } else {
            // TLBI VAAE1 takes VA[55:12] in bits [43:0].
            let page = (vaddr >> 12) & 0xFFF_FFFF_FFFF;
            core::arch::asm!(
                "tlbi vaae1, {}",
                in(reg) page,
                options(nostack, preserves_flags),
            );
        }
        barrier::dsb(barrier::ISH);
        barrier::isb(barrier::SY);
    }
}

/// Physical address of the active TTBR0 root table.
pub fn current_root() -> u64 {
    sysreg::read_ttbr0() & 0x0000_FFFF_FFFF_F000
}
