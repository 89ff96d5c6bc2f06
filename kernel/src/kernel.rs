//! The kernel context: one value owning the subsystem singletons.
//!
//! Rather than scattering globals, the block registry and VFS live in a
//! single [`Kernel`] published once at boot; routines reach it through
//! [`kernel`]. The frame allocator and heap stay as `mm` module statics —
//! interrupt and fault paths need them with zero indirection — and the
//! scheduler keeps its own lock discipline in `sched`. Initialization
//! order is explicit here: memory, then interrupts and the timer, then
//! block devices, then the VFS, then tasking.

use alloc::sync::Arc;

use crate::bootinfo::BootInfo;
use crate::error::KernelResult;
use crate::fs::blockdev::BlockRegistry;
use crate::fs::{fat32, Vfs};
use crate::sync::OnceLock;
use crate::{arch, mm, print, sched, serial};

/// Subsystems owned by the kernel context.
pub struct Kernel {
    pub blocks: BlockRegistry,
    pub vfs: Vfs,
}

static KERNEL: OnceLock<Kernel> = OnceLock::new();

/// The published kernel context. Panics before [`init`] — using the
/// context before boot wiring is a programming error.
pub fn kernel() -> &'static Kernel {
    KERNEL.get().expect("kernel context used before init")
}

/// Whether [`init`] has completed.
pub fn is_initialized() -> bool {
    KERNEL.get().is_some()
}

/// Boot-time bring-up in dependency order. Returns the published context.
pub fn init(boot: &BootInfo) -> &'static Kernel {
    // Console and logging first so every later stage can speak.
    serial::init();
    print::init();

    // 1. Memory: frames, then heap.
    mm::init(boot);

    // 2. Interrupts and the timer tick (IRQs stay masked until the
    //    scheduler is ready).
    arch::init();

    // 3+4. Block registry and VFS with the built-in filesystem types.
    let context = Kernel {
        blocks: BlockRegistry::new(),
        vfs: Vfs::new(),
    };
    context
        .vfs
        .register_type(Arc::new(fat32::Fat32Type))
        .expect("fat32 type registered twice");
    let context = KERNEL.get_or_init(|| context);

    // 5. Tasking: adopt the boot context, then let the tick preempt.
    sched::init();
    arch::irq_enable();

    // Framebuffer write-combining, when the stub reported one.
    if let Some(fb) = boot.framebuffer {
        setup_framebuffer(&fb);
    }

    context
}

/// Make the framebuffer region write-combining. PAT is preferred; the
/// MTRR path covers parts without it (the range is then rounded to the
/// power-of-two MTRR granule).
fn setup_framebuffer(fb: &crate::bootinfo::FramebufferInfo) {
    let size = fb.size_bytes();
    log::info!(
        "framebuffer: {}x{} at {:#x} ({} KiB)",
        fb.width,
        fb.height,
        fb.base,
        size / 1024
    );
    #[cfg(target_arch = "x86_64")]
    {
        if crate::arch::x86_64::pat::supported() {
            let vaddr = mm::phys_to_virt(fb.base as usize);
            // SAFETY: The boot stub maps the framebuffer through the
            // direct map with 4 KiB pages; the region is device-owned and
            // ours to retype.
            unsafe {
                crate::arch::x86_64::pat::apply_write_combining(vaddr, size.next_multiple_of(4096))
            };
        } else if let Err(e) =
            crate::arch::x86_64::mtrr::set_write_combining(fb.base, size as u64)
        {
            log::warn!("framebuffer: no write-combining available: {}", e);
        }
    }
    #[cfg(target_arch = "aarch64")]
    {
        // The ARM boot tables already map the framebuffer through MAIR
        // index 2 (normal non-cacheable); nothing to retype here.
    }
}

/// Mount the first registered block device as the FAT32 root volume.
pub fn mount_root() -> KernelResult<()> {
    let k = kernel();
    let dev = k.blocks.get_index(0)?;
    k.vfs.mount("fat32", dev, 0)
}

/// Build a context without boot hand-off for hosted unit tests: block
/// registry and VFS only.
#[cfg(test)]
pub fn ensure_test_kernel() -> &'static Kernel {
    KERNEL.get_or_init(|| {
        let context = Kernel {
            blocks: BlockRegistry::new(),
            vfs: Vfs::new(),
        };
        context
            .vfs
            .register_type(Arc::new(fat32::Fat32Type))
            .expect("fat32 type registered twice");
        context
    })
}
