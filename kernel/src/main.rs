//! BasaltOS kernel binary: boot-stub hand-off to the scheduler loop.
//!
//! The binary only makes sense on bare metal; hosted builds (workspace
//! `cargo test` and tooling) get a stub entry so every target compiles.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

use basalt_kernel::{arch, bootinfo::BootInfo, kapi, kernel, kprintln, sched, timer};

/// Entry point called by the boot stub with IRQs disabled, a valid stack,
/// and identity-mapped low memory. `boot_info` stays valid for the life
/// of the kernel.
#[no_mangle]
pub extern "C" fn kernel_main(boot_info: &'static BootInfo<'static>) -> ! {
    kprintln!("BasaltOS v{}", env!("CARGO_PKG_VERSION"));

    let k = kernel::init(boot_info);

    // Storage is optional at this stage; a missing root volume leaves the
    // VFS unmounted for the shell to report.
    match kernel::mount_root() {
        Ok(()) => log::info!("root volume mounted"),
        Err(e) => log::warn!("no root volume: {}", e),
    }

    log::info!(
        "boot complete: kapi v{}, {} block device(s), {} ms",
        kapi::kapi().version,
        k.blocks.names().len(),
        timer::ms_since_boot()
    );

    // The boot context is the idle task: give the CPU away, and sleep
    // until an interrupt makes someone ready.
    loop {
        sched::yield_now();
        arch::wait_for_interrupt();
    }
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    arch::irq_disable();
    kprintln!();
    kprintln!("KERNEL PANIC: {}", info);
    arch::dump_registers();
    basalt_kernel::print::dump_ring();
    arch::halt();
}

#[cfg(not(target_os = "none"))]
fn main() {}
