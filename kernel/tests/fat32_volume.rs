//! Bare-metal FAT32 round trip on a ramdisk: format, mount, write,
//! remount, read, and verify the redundant FATs agree. On hosted builds
//! this target is inert (the lib's unit tests cover the driver there).

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]
#![feature(custom_test_frameworks)]
#![test_runner(basalt_kernel::test_framework::test_runner)]
#![reexport_test_harness_main = "test_main"]
#![allow(dead_code)]

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec;

use basalt_kernel::fs::blockdev::{BlockDevice, RamDisk};
use basalt_kernel::fs::fat32::{self, Fat32Type};
use basalt_kernel::fs::file::OpenFlags;
use basalt_kernel::fs::Vfs;

#[cfg(target_os = "none")]
#[no_mangle]
pub extern "C" fn _start() -> ! {
    basalt_kernel::mm::heap::init();
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

/// A small volume keeps the ramdisk inside the early heap: 4 MiB, 512-byte
/// sectors, one sector per cluster, two FATs.
fn fresh_volume() -> Arc<RamDisk> {
    let disk = Arc::new(RamDisk::new(512, 8192));
    fat32::format(disk.as_ref(), 1, 2).unwrap();
    disk
}

fn mounted(disk: Arc<RamDisk>) -> Vfs {
    let vfs = Vfs::new();
    vfs.register_type(Arc::new(Fat32Type)).unwrap();
    vfs.mount("fat32", disk, 0).unwrap();
    vfs
}

#[test_case]
fn write_survives_remount_with_equal_fats() {
    let disk = fresh_volume();
    {
        let vfs = mounted(disk.clone());
        let file = vfs
            .open("/hello.txt", OpenFlags::O_CREAT | OpenFlags::O_WRONLY)
            .unwrap();
        assert_eq!(file.write(b"abc\n").unwrap(), 4);
        vfs.unmount().unwrap();
    }

    let vfs = mounted(disk.clone());
    let file = vfs.open("/hello.txt", OpenFlags::empty()).unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(file.read(&mut buf).unwrap(), 4);
    assert_eq!(&buf, b"abc\n");

    // Both FAT copies must be byte-identical after the mutations.
    let mut sector0 = [0u8; 512];
    disk.read_sectors(0, &mut sector0).unwrap();
    let reserved = u16::from_le_bytes([sector0[14], sector0[15]]) as u64;
    let fat_size = u32::from_le_bytes([sector0[36], sector0[37], sector0[38], sector0[39]]) as u64;
    let mut copy_a = vec![0u8; (fat_size * 512) as usize];
    let mut copy_b = vec![0u8; (fat_size * 512) as usize];
    disk.read_sectors(reserved, &mut copy_a).unwrap();
    disk.read_sectors(reserved + fat_size, &mut copy_b).unwrap();
    assert_eq!(copy_a, copy_b);
}

#[test_case]
fn directories_list_dot_entries() {
    let vfs = mounted(fresh_volume());
    vfs.mkdir("/a").unwrap();
    vfs.mkdir("/a/b").unwrap();

    let dir = vfs.resolve("/a").unwrap();
    let entries = dir.readdir().unwrap();
    let mut names = alloc::vec::Vec::new();
    for e in &entries {
        names.push(e.name.clone());
    }
    assert_eq!(names, alloc::vec![".", "..", "b"]);
}
