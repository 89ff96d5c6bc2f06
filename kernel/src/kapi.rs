//! The kernel-API vtable.
//!
//! A stable `#[repr(C)]` table of function pointers handed to loaded
//! applications and to the compositor task. An application's entry point
//! receives it first: `main(kapi: *const KernelApi, argc, argv)`.
//!
//! Errors cross this boundary as negative errno values (see
//! [`crate::error::KernelError::errno`]); non-negative returns are
//! success values (byte counts, descriptors). The table itself never
//! changes after boot, so callers may cache it.

use core::ffi::c_void;

use crate::error::{KernelError, KernelResult};
use crate::fs::file::OpenFlags;
use crate::fs::NodeType;
use crate::kernel::kernel;
use crate::{mm, sched, timer};

/// Bumped only on layout changes; additions go at the end.
pub const KAPI_VERSION: u32 = 1;

/// Directory-listing callback: returning non-zero halts iteration.
/// `inode` is the driver's stable identifier for the entry; `entry_type`
/// is 1 for directories, 0 for files.
pub type DirFillFn = extern "C" fn(
    ctx: *mut c_void,
    name: *const u8,
    name_len: usize,
    offset: u64,
    inode: u64,
    entry_type: u32,
) -> i32;

/// The exported function-pointer table.
#[repr(C)]
pub struct KernelApi {
    pub version: u32,

    // Console
    pub printk: extern "C" fn(msg: *const u8, len: usize),

    // Heap
    pub kmalloc: extern "C" fn(size: usize) -> *mut u8,
    pub kfree: extern "C" fn(ptr: *mut u8),

    // Files
    pub open: extern "C" fn(path: *const u8, path_len: usize, flags: u32) -> i64,
    pub read: extern "C" fn(fd: i64, buf: *mut u8, len: usize) -> i64,
    pub write: extern "C" fn(fd: i64, buf: *const u8, len: usize) -> i64,
    pub close: extern "C" fn(fd: i64) -> i64,
    pub readdir: extern "C" fn(fd: i64, ctx: *mut c_void, fill: DirFillFn) -> i64,
    pub mkdir: extern "C" fn(path: *const u8, path_len: usize) -> i64,
    pub rename: extern "C" fn(
        old: *const u8,
        old_len: usize,
        new: *const u8,
        new_len: usize,
    ) -> i64,
    pub unlink: extern "C" fn(path: *const u8, path_len: usize) -> i64,

    // Block devices (addressed by registry slot)
    pub block_read: extern "C" fn(dev: u32, sector: u64, count: u32, buf: *mut u8) -> i64,
    pub block_write: extern "C" fn(dev: u32, sector: u64, count: u32, buf: *const u8) -> i64,
    pub block_flush: extern "C" fn(dev: u32) -> i64,

    // Tasks and time
    pub task_create: extern "C" fn(entry: extern "C" fn(usize), arg: usize) -> i64,
    pub task_yield: extern "C" fn(),
    pub ms_since_boot: extern "C" fn() -> u64,
}

static KAPI: KernelApi = KernelApi {
    version: KAPI_VERSION,
    printk: kapi_printk,
    kmalloc: kapi_kmalloc,
    kfree: kapi_kfree,
    open: kapi_open,
    read: kapi_read,
    write: kapi_write,
    close: kapi_close,
    readdir: kapi_readdir,
    mkdir: kapi_mkdir,
    rename: kapi_rename,
    unlink: kapi_unlink,
    block_read: kapi_block_read,
    block_write: kapi_block_write,
    block_flush: kapi_block_flush,
    task_create: kapi_task_create,
    task_yield: kapi_task_yield,
    ms_since_boot: kapi_ms_since_boot,
};

/// The one table instance.
pub fn kapi() -> &'static KernelApi {
    &KAPI
}

fn errno_or<T: Into<i64>>(result: KernelResult<T>) -> i64 {
    match result {
        Ok(v) => v.into(),
        Err(e) => e.errno(),
    }
}

/// Borrow a caller byte buffer.
///
/// # Safety
/// `ptr` must point at `len` readable bytes for the duration of the call;
/// this is the application's side of the ABI contract.
unsafe fn borrow_bytes<'a>(ptr: *const u8, len: usize) -> KernelResult<&'a [u8]> {
    if ptr.is_null() {
        return Err(KernelError::InvalidArgument { what: "null buffer" });
    }
    // SAFETY: Forwarded contract.
    Ok(unsafe { core::slice::from_raw_parts(ptr, len) })
}

/// As [`borrow_bytes`], additionally requiring UTF-8 (paths).
unsafe fn borrow_path<'a>(ptr: *const u8, len: usize) -> KernelResult<&'a str> {
    // SAFETY: Forwarded contract.
    let bytes = unsafe { borrow_bytes(ptr, len) }?;
    core::str::from_utf8(bytes).map_err(|_| KernelError::InvalidArgument {
        what: "path not utf-8",
    })
}

extern "C" fn kapi_kmalloc(size: usize) -> *mut u8 {
    mm::kmalloc(size)
}

extern "C" fn kapi_kfree(ptr: *mut u8) {
    mm::kfree(ptr);
}

extern "C" fn kapi_ms_since_boot() -> u64 {
    timer::ms_since_boot()
}

extern "C" fn kapi_printk(msg: *const u8, len: usize) {
    // SAFETY: ABI contract: msg/len describe a readable buffer.
    if let Ok(bytes) = unsafe { borrow_bytes(msg, len) } {
        if let Ok(text) = core::str::from_utf8(bytes) {
            crate::kprint!("{}", text);
        }
    }
}

extern "C" fn kapi_open(path: *const u8, path_len: usize, flags: u32) -> i64 {
    let result = (|| {
        // SAFETY: ABI contract on the path buffer.
        let path = unsafe { borrow_path(path, path_len) }?;
        let flags = OpenFlags::from_bits_truncate(flags);
        let file = kernel().vfs.open(path, flags)?;
        sched::with_current_files(|table| table.insert(file.clone()))
    })();
    errno_or(result.map(|fd| fd as i64))
}

extern "C" fn kapi_read(fd: i64, buf: *mut u8, len: usize) -> i64 {
    let result = (|| {
        if buf.is_null() {
            return Err(KernelError::InvalidArgument { what: "null buffer" });
        }
        let file = sched::with_current_files(|table| table.get(fd as usize))?;
        // SAFETY: ABI contract: buf points at len writable bytes.
        let buf = unsafe { core::slice::from_raw_parts_mut(buf, len) };
        file.read(buf)
    })();
    errno_or(result.map(|n| n as i64))
}

extern "C" fn kapi_write(fd: i64, buf: *const u8, len: usize) -> i64 {
    let result = (|| {
        // SAFETY: ABI contract on the data buffer.
        let data = unsafe { borrow_bytes(buf, len) }?;
        let file = sched::with_current_files(|table| table.get(fd as usize))?;
        file.write(data)
    })();
    errno_or(result.map(|n| n as i64))
}

extern "C" fn kapi_close(fd: i64) -> i64 {
    let result = sched::with_current_files(|table| table.remove(fd as usize));
    errno_or(result.map(|_| 0i64))
}

extern "C" fn kapi_readdir(fd: i64, ctx: *mut c_void, fill: DirFillFn) -> i64 {
    let result = (|| {
        let file = sched::with_current_files(|table| table.get(fd as usize))?;
        kernel().vfs.readdir(&file, &mut |entry, offset| {
            let kind = match entry.node_type {
                NodeType::Directory => 1,
                NodeType::File => 0,
            };
            fill(
                ctx,
                entry.name.as_ptr(),
                entry.name.len(),
                offset as u64,
                entry.inode,
                kind,
            )
        })
    })();
    errno_or(result.map(|n| n as i64))
}

extern "C" fn kapi_mkdir(path: *const u8, path_len: usize) -> i64 {
    let result = (|| {
        // SAFETY: ABI contract on the path buffer.
        let path = unsafe { borrow_path(path, path_len) }?;
        kernel().vfs.mkdir(path)
    })();
    errno_or(result.map(|_| 0i64))
}

extern "C" fn kapi_rename(old: *const u8, old_len: usize, new: *const u8, new_len: usize) -> i64 {
    let result = (|| {
        // SAFETY: ABI contract on both path buffers.
        let old = unsafe { borrow_path(old, old_len) }?;
        let new = unsafe { borrow_path(new, new_len) }?;
        kernel().vfs.rename(old, new)
    })();
    errno_or(result.map(|_| 0i64))
}

extern "C" fn kapi_unlink(path: *const u8, path_len: usize) -> i64 {
    let result = (|| {
        // SAFETY: ABI contract on the path buffer.
        let path = unsafe { borrow_path(path, path_len) }?;
        kernel().vfs.unlink(path)
    })();
    errno_or(result.map(|_| 0i64))
}

extern "C" fn kapi_block_read(dev: u32, sector: u64, count: u32, buf: *mut u8) -> i64 {
    let result = (|| {
        let device = kernel().blocks.get_index(dev as usize)?;
        let len = count as usize * device.info().sector_size;
        if buf.is_null() {
            return Err(KernelError::InvalidArgument { what: "null buffer" });
        }
        // SAFETY: ABI contract: buf holds count * sector_size bytes.
        let buf = unsafe { core::slice::from_raw_parts_mut(buf, len) };
        crate::fs::blockdev::read(device.as_ref(), sector, buf)
    })();
    errno_or(result.map(|_| 0i64))
}

extern "C" fn kapi_block_write(dev: u32, sector: u64, count: u32, buf: *const u8) -> i64 {
    let result = (|| {
        let device = kernel().blocks.get_index(dev as usize)?;
        let len = count as usize * device.info().sector_size;
        // SAFETY: ABI contract: buf holds count * sector_size bytes.
        let data = unsafe { borrow_bytes(buf, len) }?;
        crate::fs::blockdev::write(device.as_ref(), sector, data)
    })();
    errno_or(result.map(|_| 0i64))
}

extern "C" fn kapi_block_flush(dev: u32) -> i64 {
    let result = (|| kernel().blocks.get_index(dev as usize)?.flush())();
    errno_or(result.map(|_| 0i64))
}

extern "C" fn kapi_task_create(entry: extern "C" fn(usize), arg: usize) -> i64 {
    errno_or(sched::spawn("kapi-task", entry, arg).map(|id| id as i64))
}

extern "C" fn kapi_task_yield() {
    sched::yield_now();
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use super::*;
    use crate::fs::blockdev::RamDisk;
    use crate::fs::fat32;
    use crate::kernel::ensure_test_kernel;

    fn mount_test_volume() {
        let k = ensure_test_kernel();
        if k.vfs.resolve("/").is_ok() {
            return;
        }
        let disk = Arc::new(RamDisk::new(512, 65536));
        fat32::format(disk.as_ref(), 8, 2).unwrap();
        k.blocks.register(disk.clone()).unwrap();
        k.vfs.mount("fat32", disk, 0).unwrap();
    }

    #[test_case]
    fn file_io_through_the_vtable() {
        mount_test_volume();
        let api = kapi();
        assert_eq!(api.version, KAPI_VERSION);

        let path = b"/via-api.txt";
        let fd = (api.open)(
            path.as_ptr(),
            path.len(),
            (OpenFlags::O_CREAT | OpenFlags::O_RDWR).bits(),
        );
        assert!(fd >= 0, "open returned {}", fd);

        let payload = b"vtable payload";
        assert_eq!(
            (api.write)(fd, payload.as_ptr(), payload.len()),
            payload.len() as i64
        );
        assert_eq!((api.close)(fd), 0);

        let fd = (api.open)(path.as_ptr(), path.len(), 0);
        assert!(fd >= 0);
        let mut buf = [0u8; 32];
        let n = (api.read)(fd, buf.as_mut_ptr(), buf.len());
        assert_eq!(n, payload.len() as i64);
        assert_eq!(&buf[..payload.len()], payload);
        assert_eq!((api.close)(fd), 0);

        // Errors come back as negative errno.
        let missing = b"/no-such-file";
        assert_eq!((api.open)(missing.as_ptr(), missing.len(), 0), -2);
        assert_eq!((api.close)(99), -9);
    }

    #[test_case]
    fn readdir_callback_can_halt() {
        mount_test_volume();
        let api = kapi();
        for name in [b"/rd-a.txt".as_slice(), b"/rd-b.txt", b"/rd-c.txt"] {
            let fd = (api.open)(
                name.as_ptr(),
                name.len(),
                (OpenFlags::O_CREAT | OpenFlags::O_WRONLY).bits(),
            );
            assert!(fd >= 0);
            (api.close)(fd);
        }

        let root = b"/";
        let fd = (api.open)(root.as_ptr(), root.len(), 0);
        assert!(fd >= 0);

        extern "C" fn count_two(
            ctx: *mut c_void,
            _name: *const u8,
            _len: usize,
            _offset: u64,
            inode: u64,
            _kind: u32,
        ) -> i32 {
            assert!(inode != 0, "entries carry a stable identifier");
            // SAFETY: ctx is the test's counter.
            let count = unsafe { &mut *(ctx as *mut u32) };
            *count += 1;
            if *count == 2 {
                1
            } else {
                0
            }
        }

        let mut count: u32 = 0;
        let emitted = (api.readdir)(fd, &mut count as *mut u32 as *mut c_void, count_two);
        assert_eq!(count, 2, "fill returning non-zero halts iteration");
        assert_eq!(emitted, 2);
        (api.close)(fd);
    }

    #[test_case]
    fn block_io_through_the_vtable() {
        mount_test_volume();
        let api = kapi();
        // Use a sector far past the filesystem's data to avoid corrupting
        // the mounted volume's structures in later tests.
        let sector = 65000;
        let data = [0xC3u8; 512];
        assert_eq!((api.block_write)(0, sector, 1, data.as_ptr()), 0);
        let mut back = [0u8; 512];
        assert_eq!((api.block_read)(0, sector, 1, back.as_mut_ptr()), 0);
        assert_eq!(back, data);
        assert_eq!((api.block_flush)(0), 0);
        assert_eq!((api.block_flush)(7), -19);
    }
}
