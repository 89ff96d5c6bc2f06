//! BasaltOS kernel library.
//!
//! The machine-abstraction and resource-management core: architecture
//! HAL, physical/virtual memory, interrupt and timer plumbing, tasks and
//! the round-robin scheduler, block devices, the FAT32 driver and VFS,
//! the kernel-API vtable, and the minimal ELF loader. The `basalt-kernel`
//! binary wires these together; this library also backs the test builds.

#![no_std]
#![cfg_attr(all(test, target_os = "none"), no_main)]
#![feature(custom_test_frameworks)]
#![feature(abi_x86_interrupt)]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]
#![test_runner(crate::test_framework::test_runner)]
#![cfg_attr(all(test, target_os = "none"), reexport_test_harness_main = "test_main")]

extern crate alloc;

// Hosted builds (unit tests, tooling) use the system allocator so the
// collections work before any kernel bring-up.
#[cfg(not(target_os = "none"))]
extern crate std;

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: mm::heap::GlobalKernelHeap = mm::heap::GlobalKernelHeap;

#[cfg(not(target_os = "none"))]
#[global_allocator]
static ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
pub mod bootinfo;
pub mod elf;
pub mod error;
pub mod fs;
pub mod irq;
pub mod kapi;
pub mod kernel;
pub mod mm;
pub mod sched;
pub mod serial;
pub mod sync;
pub mod test_framework;
pub mod timer;

pub use bootinfo::BootInfo;
pub use error::{KernelError, KernelResult};
pub use kernel::{kernel, Kernel};

/// Heap allocation failure in a no_std kernel is unrecoverable.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("allocation error: {:?}", layout);
}

// Entry point and panic handler for bare-metal `cargo test` builds of
// the library itself (the hosted harness provides its own).
#[cfg(all(test, target_os = "none"))]
#[no_mangle]
pub extern "C" fn _start() -> ! {
    mm::heap::init();
    test_main();
    loop {
        core::hint::spin_loop();
    }
}

#[cfg(all(test, target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    test_framework::test_panic_handler(info)
}
