//! Page attribute table setup.
//!
//! Reprograms the PAT so every cache mode the VM layer offers has a stable
//! index that page-table entries can select with the PWT/PCD/PAT bits:
//!
//! | Index | PAT | PCD | PWT | Type |
//! |-------|-----|-----|-----|------|
//! | 0     | 0   | 0   | 0   | WB   |
//! | 1     | 0   | 0   | 1   | **WC** (was WT) |
//! | 2     | 0   | 1   | 0   | UC-  |
//! | 3     | 0   | 1   | 1   | UC   |
//! | 4     | 1   | 0   | 0   | **WT** (relocated) |
//! | 5..7  |     |     |     | mirror 1..3 |
//!
//! This is the preferred write-combining mechanism; the MTRR path in
//! `mtrr.rs` exists for parts without PAT.

use super::msr;

/// Memory-type encodings used in IA32_PAT entries.
const PAT_UC: u64 = 0x00;
const PAT_WC: u64 = 0x01;
const PAT_WT: u64 = 0x04;
const PAT_WB: u64 = 0x06;
const PAT_UC_MINUS: u64 = 0x07;

/// The PAT layout documented in the module header, one byte per entry.
const PAT_LAYOUT: u64 = PAT_WB
    | (PAT_WC << 8)
    | (PAT_UC_MINUS << 16)
    | (PAT_UC << 24)
    | (PAT_WT << 32)
    | (PAT_WC << 40)
    | (PAT_UC_MINUS << 48)
    | (PAT_UC << 56);

/// Check CPUID for PAT support (leaf 1, EDX bit 16).
pub fn supported() -> bool {
    let edx: u32;
    // SAFETY: CPUID with EAX=1 is read-only and side-effect free. RBX is
    // preserved because LLVM reserves it.
    unsafe {
        core::arch::asm!(
            "mov {tmp:r}, rbx",
            "mov eax, 1",
            "cpuid",
            "mov rbx, {tmp:r}",
            tmp = out(reg) _,
            out("eax") _,
            out("ecx") _,
            out("edx") edx,
            options(nomem, nostack),
        );
    }
    edx & (1 << 16) != 0
}

/// Install the PAT layout. Must run before any page is mapped with a
/// non-default cache mode. No-op without PAT support; the VM layer then
/// falls back to MTRRs for write-combining.
pub fn init() {
    if !supported() {
        log::warn!("cpu has no PAT; write-combining will use MTRRs");
        return;
    }
    msr::write_pat(PAT_LAYOUT);
}

const PTE_PRESENT: u64 = 1 << 0;
const PTE_PWT: u64 = 1 << 3;
const PTE_PCD: u64 = 1 << 4;
const PTE_HUGE_OR_PAT: u64 = 1 << 7;
const PTE_ADDR: u64 = 0x000F_FFFF_FFFF_F000;

/// Retype an existing 4 KiB-page mapping in the live page tables to PAT
/// index 1 (write-combining): walk CR3, set PWT, clear PCD and the leaf
/// PAT bit, flush each page. Used for the boot-mapped framebuffer, whose
/// tables the kernel did not build itself.
///
/// # Safety
/// `vaddr..vaddr+size` must be page-aligned, currently mapped with 4 KiB
/// pages, and safe to retype (no other agent relies on its cacheability).
pub unsafe fn apply_write_combining(vaddr: usize, size: usize) {
    if !supported() {
        return;
    }
    let cr3: u64;
    // SAFETY: Reading CR3 in kernel mode has no side effects.
    unsafe { core::arch::asm!("mov {}, cr3", out(reg) cr3) };
    let root = (cr3 & PTE_ADDR) as usize;

    for page in 0..size / 4096 {
        let addr = vaddr + page * 4096;
        // SAFETY: Contract guarantees the range is mapped through 4 KiB
        // leaves; the walk only follows present entries.
        unsafe { set_page_wc(root, addr) };
    }
}

/// Walk one address down to its leaf PTE and select PAT index 1.
unsafe fn set_page_wc(root: usize, vaddr: usize) {
    let mut table = root;
    for level in (1..4).rev() {
        let index = (vaddr >> (12 + 9 * level)) & 0x1FF;
        // SAFETY: Table frames are reachable through the direct map; the
        // caller vouches for the mapping structure.
        let entry = unsafe {
            core::ptr::read_volatile((crate::mm::phys_to_virt(table) as *const u64).add(index))
        };
        if entry & PTE_PRESENT == 0 || entry & PTE_HUGE_OR_PAT != 0 {
            // Unmapped or huge-mapped: cannot retype through this path.
            return;
        }
        table = (entry & PTE_ADDR) as usize;
    }
    let index = (vaddr >> 12) & 0x1FF;
    let pte_ptr = (crate::mm::phys_to_virt(table) as *mut u64).wrapping_add(index);
    // SAFETY: As above; the leaf slot belongs to the live tables.
    unsafe {
        let mut pte = core::ptr::read_volatile(pte_ptr);
        if pte & PTE_PRESENT == 0 {
            return;
        }
        pte |= PTE_PWT;
        pte &= !(PTE_PCD | PTE_HUGE_OR_PAT);
        core::ptr::write_volatile(pte_ptr, pte);
    }
    super::mmu::mmu_invalidate(vaddr as u64);
}
