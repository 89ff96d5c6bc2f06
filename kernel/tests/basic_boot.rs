//! Bare-metal smoke test: heap, frame allocator, timer plumbing. Runs
//! under QEMU via the custom test runner; on hosted builds this target is
//! inert (the lib's unit tests cover the same ground there).

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]
#![feature(custom_test_frameworks)]
#![test_runner(basalt_kernel::test_framework::test_runner)]
#![reexport_test_harness_main = "test_main"]
#![allow(dead_code)]

extern crate alloc;

use alloc::vec::Vec;

use basalt_kernel::bootinfo::{MemoryKind, MemoryMap, MemoryRegion};
use basalt_kernel::mm::{self, FRAME_ALLOCATOR};

/// Static arena standing in for the boot memory map.
static mut TEST_ARENA: [u8; 2 * 1024 * 1024] = [0; 2 * 1024 * 1024];

#[cfg(target_os = "none")]
#[no_mangle]
pub extern "C" fn _start() -> ! {
    mm::heap::init();

    // SAFETY: The arena is only touched through the frame allocator from
    // here on.
    let (start, len) = unsafe {
        let ptr = core::ptr::addr_of_mut!(TEST_ARENA);
        ((*ptr).as_ptr() as u64, (*ptr).len() as u64)
    };
    let regions = alloc::vec![MemoryRegion {
        start,
        len,
        kind: MemoryKind::Usable,
    }]
    .leak();
    FRAME_ALLOCATOR.lock().init(&MemoryMap::new(regions));

    test_main();
    loop {
        core::hint::spin_loop();
    }
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    basalt_kernel::test_framework::test_panic_handler(info)
}

#[cfg(not(target_os = "none"))]
fn main() {}

#[test_case]
fn heap_collections_work() {
    let mut v: Vec<u32> = Vec::new();
    for i in 0..1000 {
        v.push(i);
    }
    assert_eq!(v.iter().sum::<u32>(), 499_500);
}

#[test_case]
fn frames_come_from_the_arena() {
    let pa = mm::alloc_frame().unwrap();
    assert!(pa.is_frame_aligned());
    mm::free_frame(pa).unwrap();
    let again = mm::alloc_frame().unwrap();
    assert_eq!(again, pa);
    mm::free_frame(again).unwrap();
}

#[test_case]
fn clock_is_monotonic() {
    let before = basalt_kernel::timer::ms_since_boot();
    for _ in 0..100 {
        basalt_kernel::timer::tick();
    }
    let after = basalt_kernel::timer::ms_since_boot();
    assert_eq!(after - before, 100);
}
