//! x86-64 MMU control: root table switching and TLB maintenance.

use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::PhysFrame;
use x86_64::VirtAddr;

/// Install `root` as the active top-level page table and invalidate the
/// whole TLB (the CR3 reload does this architecturally for non-global
/// entries).
///
/// `root` must be the 4 KiB-aligned physical address of a valid PML4.
pub fn mmu_switch(root: u64) {
    let frame = PhysFrame::from_start_address(x86_64::PhysAddr::new(root))
        .expect("page table root not frame-aligned");
    // SAFETY: The caller passes the physical address of a valid PML4 whose
    // kernel mappings cover the currently executing code and stack; the
    // address-space switch protocol guarantees this.
    unsafe { Cr3::write(frame, Cr3Flags::empty()) };
}

/// Invalidate the TLB entry for the page containing `vaddr`, or everything
/// when `vaddr` is zero.
pub fn mmu_invalidate(vaddr: u64) {
    if vaddr == 0 {
        x86_64::instructions::tlb::flush_all();
    } else {
        x86_64::instructions::tlb::flush(VirtAddr::new(vaddr));
    }
}

/// Physical address of the active root table.
pub fn current_root() -> u64 {
    Cr3::read().0.start_address().as_u64()
}
