//! Kernel byte allocator (kmalloc).
//!
//! Small allocations come from power-of-two size classes (32..4096 bytes)
//! whose blocks are carved out of whole frames on demand; freed blocks go
//! back on their class free list. Anything larger falls through to a
//! `linked_list_allocator` heap over a fixed region. Every allocation
//! carries two header words — the block tag at the block start and a
//! back-pointer just below the returned address — so `kfree` needs only
//! the pointer.
//!
//! The allocator never sleeps and takes its lock with IRQ save, so
//! `kmalloc` from an interrupt handler is legal (if discouraged). Returned
//! addresses are aligned to at least 8 bytes.

use core::alloc::Layout;
use core::ptr::NonNull;

use linked_list_allocator::Heap as FallbackHeap;

use super::{alloc_frame, phys_to_virt, PAGE_SIZE};
use crate::error::{KernelError, KernelResult};
use crate::sync::SpinLock;

/// Smallest size class in bytes. Two header words plus 8 usable bytes.
const MIN_CLASS: usize = 32;

/// Size classes: 32, 64, ..., 4096.
const NUM_CLASSES: usize = 8;

/// Per-allocation overhead: block tag + back-pointer.
const HEADER_WORDS: usize = 16;

/// Fallback region for allocations past the largest class. The FAT cache
/// is the biggest customer; 8 MiB leaves it generous headroom.
#[cfg(target_os = "none")]
const FALLBACK_SIZE: usize = 8 * 1024 * 1024;

#[cfg(target_os = "none")]
static mut FALLBACK_REGION: [u8; FALLBACK_SIZE] = [0; FALLBACK_SIZE];

/// Heap statistics snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapStats {
    pub allocations: u64,
    pub frees: u64,
    pub frames_carved: u64,
    pub fallback_allocations: u64,
}

fn class_index(need: usize) -> Option<usize> {
    if need > MIN_CLASS << (NUM_CLASSES - 1) {
        return None;
    }
    let rounded = need.next_power_of_two().max(MIN_CLASS);
    Some(rounded.trailing_zeros() as usize - MIN_CLASS.trailing_zeros() as usize)
}

const fn class_size(index: usize) -> usize {
    MIN_CLASS << index
}

/// The allocator state. Lives behind [`KERNEL_HEAP`]; tests build their
/// own instance.
pub struct KernelHeap {
    /// Intrusive free-list heads per class (virtual addresses; 0 = empty).
    free_lists: [usize; NUM_CLASSES],
    fallback: FallbackHeap,
    stats: HeapStats,
}

impl KernelHeap {
    pub const fn new() -> Self {
        Self {
            free_lists: [0; NUM_CLASSES],
            fallback: FallbackHeap::empty(),
            stats: HeapStats {
                allocations: 0,
                frees: 0,
                frames_carved: 0,
                fallback_allocations: 0,
            },
        }
    }

    /// Give the fallback heap its region.
    ///
    /// # Safety
    /// The region must be unused memory valid for the allocator's
    /// lifetime, and this must be called at most once per instance.
    pub unsafe fn init_fallback(&mut self, start: *mut u8, size: usize) {
        // SAFETY: Forwarded contract.
        unsafe { self.fallback.init(start, size) };
    }

    fn pop_class(&mut self, index: usize) -> KernelResult<usize> {
        if self.free_lists[index] == 0 {
            self.carve_frame(index)?;
        }
        let block = self.free_lists[index];
        // SAFETY: Free blocks store the next-link in their first word; the
        // list only ever holds blocks this heap carved.
        self.free_lists[index] = unsafe { *(block as *const usize) };
        Ok(block)
    }

    fn push_class(&mut self, index: usize, block: usize) {
        // SAFETY: The block is free; its first word becomes the link.
        unsafe { *(block as *mut usize) = self.free_lists[index] };
        self.free_lists[index] = block;
    }

    /// Split one fresh frame into blocks of the given class.
    fn carve_frame(&mut self, index: usize) -> KernelResult<()> {
        let frame = alloc_frame().map_err(|_| KernelError::OutOfMemory {
            requested: class_size(index),
        })?;
        let base = phys_to_virt(frame.as_usize());
        let size = class_size(index);
        for offset in (0..PAGE_SIZE).step_by(size) {
            self.push_class(index, base + offset);
        }
        self.stats.frames_carved += 1;
        Ok(())
    }

    /// Allocate `size` bytes aligned to `align` (≥ 8 enforced).
    pub fn alloc(&mut self, size: usize, align: usize) -> KernelResult<NonNull<u8>> {
        let size = size.max(1);
        let align = align.max(8);
        if !align.is_power_of_two() {
            return Err(KernelError::InvalidArgument { what: "align" });
        }
        let need = size + align + HEADER_WORDS;

        // Size classes first; the fallback also covers small allocations
        // made before the frame allocator is live (early boot).
        let from_class = class_index(need).and_then(|index| {
            self.pop_class(index)
                .ok()
                .map(|block| (block, (class_size(index) << 1) as u64))
        });
        let (block, tag) = match from_class {
            Some(hit) => hit,
            None => {
                let layout = Layout::from_size_align(need, 16)
                    .map_err(|_| KernelError::InvalidArgument { what: "layout" })?;
                let block = self
                    .fallback
                    .allocate_first_fit(layout)
                    .map_err(|_| KernelError::OutOfMemory { requested: size })?
                    .as_ptr() as usize;
                self.stats.fallback_allocations += 1;
                (block, ((need as u64) << 1) | 1)
            }
        };

        let user = (block + HEADER_WORDS + align - 1) & !(align - 1);
        // SAFETY: Both header slots lie inside the block: user ≥ block+16
        // and user-8 ≥ block+8.
        unsafe {
            *(block as *mut u64) = tag;
            *((user - 8) as *mut usize) = block;
        }
        self.stats.allocations += 1;
        Ok(NonNull::new(user as *mut u8).expect("heap produced null block"))
    }

    /// Allocate zeroed memory.
    pub fn zalloc(&mut self, size: usize, align: usize) -> KernelResult<NonNull<u8>> {
        let ptr = self.alloc(size, align)?;
        // SAFETY: The allocation is at least `size` bytes.
        unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0, size) };
        Ok(ptr)
    }

    /// Bytes usable at `ptr` beyond the requested size (block tail).
    fn usable_size(ptr: *mut u8) -> usize {
        let user = ptr as usize;
        // SAFETY: ptr came from alloc; the back-pointer and tag are intact.
        unsafe {
            let block = *((user - 8) as *const usize);
            let total = (*(block as *const u64) >> 1) as usize;
            block + total - user
        }
    }

    /// Return a block to its free list or the fallback heap.
    pub fn free(&mut self, ptr: *mut u8) {
        let user = ptr as usize;
        // SAFETY: ptr came from alloc; headers locate the block.
        unsafe {
            let block = *((user - 8) as *const usize);
            let tag = *(block as *const u64);
            let total = (tag >> 1) as usize;
            if tag & 1 != 0 {
                let layout = Layout::from_size_align(total, 16).expect("stored fallback layout");
                self.fallback
                    .deallocate(NonNull::new_unchecked(block as *mut u8), layout);
            } else {
                let index = class_index(total).expect("stored class tag");
                debug_assert_eq!(class_size(index), total);
                self.push_class(index, block);
            }
        }
        self.stats.frees += 1;
    }

    /// Resize an allocation, preserving contents up to the smaller size.
    pub fn realloc(&mut self, ptr: *mut u8, new_size: usize) -> KernelResult<NonNull<u8>> {
        if ptr.is_null() {
            return self.alloc(new_size, 8);
        }
        let usable = Self::usable_size(ptr);
        if new_size <= usable {
            // SAFETY: ptr is a live allocation.
            return Ok(unsafe { NonNull::new_unchecked(ptr) });
        }
        let fresh = self.alloc(new_size, 8)?;
        // SAFETY: Both regions are live and at least `usable` bytes.
        unsafe {
            core::ptr::copy_nonoverlapping(ptr, fresh.as_ptr(), usable.min(new_size));
        }
        self.free(ptr);
        Ok(fresh)
    }

    pub fn stats(&self) -> HeapStats {
        self.stats
    }
}

impl Default for KernelHeap {
    fn default() -> Self {
        Self::new()
    }
}

/// The system heap.
pub static KERNEL_HEAP: SpinLock<KernelHeap> = SpinLock::new(KernelHeap::new());

/// Wire the fallback region up. Called once from `mm::init` after the
/// frame allocator is live.
pub fn init() {
    #[cfg(target_os = "none")]
    {
        let mut heap = KERNEL_HEAP.lock_irqsave();
        // SAFETY: FALLBACK_REGION is a dedicated static used only here,
        // and mm::init runs once on the boot hart.
        unsafe {
            let start = core::ptr::addr_of_mut!(FALLBACK_REGION) as *mut u8;
            heap.init_fallback(start, FALLBACK_SIZE);
        }
    }
}

/// Allocate `size` bytes, 8-byte aligned. Null on exhaustion.
pub fn kmalloc(size: usize) -> *mut u8 {
    KERNEL_HEAP
        .lock_irqsave()
        .alloc(size, 8)
        .map(NonNull::as_ptr)
        .unwrap_or(core::ptr::null_mut())
}

/// Allocate zeroed memory. Null on exhaustion.
pub fn kzalloc(size: usize) -> *mut u8 {
    KERNEL_HEAP
        .lock_irqsave()
        .zalloc(size, 8)
        .map(NonNull::as_ptr)
        .unwrap_or(core::ptr::null_mut())
}

/// Resize `ptr` to `new_size`. Null on exhaustion (the old block stays
/// valid in that case).
pub fn krealloc(ptr: *mut u8, new_size: usize) -> *mut u8 {
    KERNEL_HEAP
        .lock_irqsave()
        .realloc(ptr, new_size)
        .map(NonNull::as_ptr)
        .unwrap_or(core::ptr::null_mut())
}

/// Free a block from `kmalloc`/`kzalloc`/`krealloc`. Null is a no-op.
pub fn kfree(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    KERNEL_HEAP.lock_irqsave().free(ptr);
}

// ---------------------------------------------------------------------------
// GlobalAlloc bridge for alloc:: collections on bare metal
// ---------------------------------------------------------------------------

/// Adapter exposing the kernel heap as the global allocator.
#[cfg(target_os = "none")]
pub struct GlobalKernelHeap;

#[cfg(target_os = "none")]
// SAFETY: Allocation and deallocation delegate to the locked kernel heap,
// which hands out unique, properly aligned blocks and accepts them back.
unsafe impl core::alloc::GlobalAlloc for GlobalKernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        KERNEL_HEAP
            .lock_irqsave()
            .alloc(layout.size(), layout.align())
            .map(NonNull::as_ptr)
            .unwrap_or(core::ptr::null_mut())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        KERNEL_HEAP.lock_irqsave().free(ptr);
    }
}

#[cfg(test)]
mod tests {
    use super::super::frame_allocator::test_arena::leak_arena;
    use super::super::FRAME_ALLOCATOR;
    use super::*;
    use crate::bootinfo::MemoryMap;

    fn fresh_heap(arena_pages: usize) -> KernelHeap {
        let regions = alloc::vec![leak_arena(arena_pages * PAGE_SIZE)].leak();
        FRAME_ALLOCATOR.lock().init(&MemoryMap::new(regions));
        let mut heap = KernelHeap::new();
        let fallback = alloc::vec![0u8; 64 * 1024].leak();
        // SAFETY: The fallback region is leaked and unused elsewhere.
        unsafe { heap.init_fallback(fallback.as_mut_ptr(), fallback.len()) };
        heap
    }

    #[test_case]
    fn alloc_is_aligned_and_writable() {
        let mut heap = fresh_heap(64);
        for &size in &[1usize, 8, 24, 100, 1000, 3000] {
            let ptr = heap.alloc(size, 8).unwrap();
            assert_eq!(ptr.as_ptr() as usize % 8, 0);
            // SAFETY: Fresh allocation of at least `size` bytes.
            unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0xA5, size) };
            heap.free(ptr.as_ptr());
        }
    }

    #[test_case]
    fn freed_block_is_reusable() {
        let mut heap = fresh_heap(64);
        let ptr = heap.alloc(256, 8).unwrap();
        heap.free(ptr.as_ptr());
        // A smaller request in the same size class must hand the block
        // straight back.
        let again = heap.alloc(300, 8).unwrap();
        assert_eq!(again, ptr);
        heap.free(again.as_ptr());
    }

    #[test_case]
    fn zalloc_zeroes() {
        let mut heap = fresh_heap(64);
        // Dirty a block, free it, and demand zeroed memory of the same
        // class.
        let dirty = heap.alloc(128, 8).unwrap();
        // SAFETY: Fresh allocation.
        unsafe { core::ptr::write_bytes(dirty.as_ptr(), 0xFF, 128) };
        heap.free(dirty.as_ptr());

        let clean = heap.zalloc(128, 8).unwrap();
        // SAFETY: zalloc returned at least 128 bytes.
        let bytes = unsafe { core::slice::from_raw_parts(clean.as_ptr(), 128) };
        assert!(bytes.iter().all(|&b| b == 0));
        heap.free(clean.as_ptr());
    }

    #[test_case]
    fn realloc_preserves_contents() {
        let mut heap = fresh_heap(64);
        let ptr = heap.alloc(64, 8).unwrap();
        // SAFETY: Allocation is 64 bytes.
        unsafe {
            for i in 0..64 {
                *ptr.as_ptr().add(i) = i as u8;
            }
        }
        let grown = heap.realloc(ptr.as_ptr(), 1024).unwrap();
        // SAFETY: realloc returned at least 1024 bytes, first 64 copied.
        let bytes = unsafe { core::slice::from_raw_parts(grown.as_ptr(), 64) };
        for (i, &b) in bytes.iter().enumerate() {
            assert_eq!(b, i as u8);
        }
        heap.free(grown.as_ptr());
    }

    #[test_case]
    fn large_allocations_use_fallback() {
        let mut heap = fresh_heap(64);
        let before = heap.stats().fallback_allocations;
        let big = heap.alloc(16 * 1024, 8).unwrap();
        assert_eq!(heap.stats().fallback_allocations, before + 1);
        // SAFETY: Fresh 16 KiB allocation.
        unsafe { core::ptr::write_bytes(big.as_ptr(), 0x5A, 16 * 1024) };
        heap.free(big.as_ptr());

        // Exhausting the 64 KiB fallback region must fail cleanly.
        assert!(matches!(
            heap.alloc(256 * 1024, 8),
            Err(KernelError::OutOfMemory { .. })
        ));
    }

    #[test_case]
    fn larger_alignment_honored() {
        let mut heap = fresh_heap(64);
        let ptr = heap.alloc(100, 64).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 64, 0);
        heap.free(ptr.as_ptr());
    }
}
