//! Physical frame allocator.
//!
//! A bump cursor walks the usable regions of the boot memory map; frames
//! returned by [`FrameAllocator::free_frame`] go onto an intrusive free
//! list (the link lives in the first word of the free frame itself) and
//! are preferred by the next allocation, so the bump cursor only advances
//! when the free list is dry. Every frame handed out is zeroed first —
//! callers use them for page tables and fresh user data.

use super::{phys_to_virt, PhysAddr, PAGE_SIZE};
use crate::bootinfo::MemoryMap;
use crate::error::{KernelError, KernelResult};
use crate::sync::SpinLock;

/// Maximum number of usable regions tracked. Firmware maps stay well under
/// this.
const MAX_REGIONS: usize = 32;

/// Allocator statistics snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameStats {
    /// Usable frames described by the memory map.
    pub total_frames: u64,
    /// Frames currently handed out.
    pub outstanding: u64,
    /// Allocations served from the free list.
    pub free_list_hits: u64,
    /// Allocations served by advancing the bump cursor.
    pub bump_allocations: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Region {
    /// First frame-aligned address inside the region.
    start: u64,
    /// Exclusive frame-aligned end.
    end: u64,
}

/// The allocator proper. Lives behind [`FRAME_ALLOCATOR`]; tests build
/// their own instance over a scratch arena.
pub struct FrameAllocator {
    regions: [Region; MAX_REGIONS],
    num_regions: usize,
    /// Bump position: region index and next unallocated address in it.
    cursor_region: usize,
    cursor_addr: u64,
    /// Head of the intrusive free list; 0 = empty.
    free_head: u64,
    free_count: u64,
    stats: FrameStats,
}

impl FrameAllocator {
    pub const fn new() -> Self {
        Self {
            regions: [Region { start: 0, end: 0 }; MAX_REGIONS],
            num_regions: 0,
            cursor_region: 0,
            cursor_addr: 0,
            free_head: 0,
            free_count: 0,
            stats: FrameStats {
                total_frames: 0,
                outstanding: 0,
                free_list_hits: 0,
                bump_allocations: 0,
            },
        }
    }

    /// Record the usable regions of `map`, aligning each inward to frame
    /// boundaries. Replaces any prior state.
    pub fn init(&mut self, map: &MemoryMap) {
        *self = Self::new();
        for region in map.usable() {
            if self.num_regions == MAX_REGIONS {
                log::warn!("frame allocator: memory map truncated at {} regions", MAX_REGIONS);
                break;
            }
            let start = region.start.next_multiple_of(PAGE_SIZE as u64);
            let end = region.end() & !(PAGE_SIZE as u64 - 1);
            if start >= end {
                continue;
            }
            self.regions[self.num_regions] = Region { start, end };
            self.num_regions += 1;
            self.stats.total_frames += (end - start) / PAGE_SIZE as u64;
        }
        self.cursor_region = 0;
        self.cursor_addr = self.regions[0].start;
    }

    /// Hand out one zeroed, 4 KiB-aligned frame.
    pub fn alloc_frame(&mut self) -> KernelResult<PhysAddr> {
        let pa = if self.free_head != 0 {
            // Pop the free list: read the link out of the frame.
            let pa = self.free_head;
            // SAFETY: Every free-list entry was a valid usable frame passed
            // to free_frame; its first word stores the next link.
            self.free_head = unsafe { *(phys_to_virt(pa as usize) as *const u64) };
            self.free_count -= 1;
            self.stats.free_list_hits += 1;
            pa
        } else {
            // Advance the bump cursor, moving to the next region when the
            // current one is exhausted.
            loop {
                if self.cursor_region >= self.num_regions {
                    return Err(KernelError::OutOfFrames);
                }
                let region = self.regions[self.cursor_region];
                if self.cursor_addr + PAGE_SIZE as u64 <= region.end {
                    let pa = self.cursor_addr;
                    self.cursor_addr += PAGE_SIZE as u64;
                    self.stats.bump_allocations += 1;
                    break pa;
                }
                self.cursor_region += 1;
                if self.cursor_region < self.num_regions {
                    self.cursor_addr = self.regions[self.cursor_region].start;
                }
            }
        };

        // SAFETY: pa designates a full usable frame owned by the allocator
        // until handed out; the direct map covers it.
        unsafe {
            core::ptr::write_bytes(phys_to_virt(pa as usize) as *mut u8, 0, PAGE_SIZE);
        }
        self.stats.outstanding += 1;
        Ok(PhysAddr::new(pa))
    }

    /// Return a frame. The caller must own it and stop using it.
    pub fn free_frame(&mut self, pa: PhysAddr) -> KernelResult<()> {
        if !pa.is_frame_aligned() {
            return Err(KernelError::Unaligned {
                addr: pa.as_usize(),
                align: PAGE_SIZE,
            });
        }
        let addr = pa.as_u64();
        let in_region = self.regions[..self.num_regions]
            .iter()
            .any(|r| addr >= r.start && addr + PAGE_SIZE as u64 <= r.end);
        if !in_region {
            return Err(KernelError::InvalidArgument {
                what: "frame outside usable memory",
            });
        }
        // SAFETY: The frame is owned by the caller and being returned; its
        // first word becomes the free-list link.
        unsafe {
            *(phys_to_virt(addr as usize) as *mut u64) = self.free_head;
        }
        self.free_head = addr;
        self.free_count += 1;
        self.stats.outstanding -= 1;
        Ok(())
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// The system frame allocator.
pub static FRAME_ALLOCATOR: SpinLock<FrameAllocator> = SpinLock::new(FrameAllocator::new());

/// Allocate one zeroed frame from the system allocator.
pub fn alloc_frame() -> KernelResult<PhysAddr> {
    FRAME_ALLOCATOR.lock_irqsave().alloc_frame()
}

/// Return a frame to the system allocator.
pub fn free_frame(pa: PhysAddr) -> KernelResult<()> {
    FRAME_ALLOCATOR.lock_irqsave().free_frame(pa)
}

#[cfg(test)]
pub(crate) mod test_arena {
    use alloc::vec;

    use crate::bootinfo::{MemoryKind, MemoryRegion};

    /// Leak a zero-filled arena and return a usable-memory region covering
    /// it. With the identity phys offset of hosted builds, "physical"
    /// frame addresses inside the arena are real pointers, so zeroing and
    /// the intrusive free list work unchanged.
    pub fn leak_arena(bytes: usize) -> MemoryRegion {
        let buf = vec![0u8; bytes].leak();
        MemoryRegion {
            start: buf.as_ptr() as u64,
            len: buf.len() as u64,
            kind: MemoryKind::Usable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_arena::leak_arena;
    use super::*;
    use crate::bootinfo::MemoryMap;

    fn fresh(bytes: usize) -> FrameAllocator {
        let regions = alloc::vec![leak_arena(bytes)].leak();
        let mut alloc = FrameAllocator::new();
        alloc.init(&MemoryMap::new(regions));
        alloc
    }

    #[test_case]
    fn frames_are_aligned_zeroed_and_in_range() {
        let mut alloc = fresh(64 * PAGE_SIZE);
        let total = alloc.stats().total_frames;
        assert!(total >= 63);

        let pa = alloc.alloc_frame().unwrap();
        assert!(pa.is_frame_aligned());
        // SAFETY: The arena is real memory in hosted tests.
        let contents =
            unsafe { core::slice::from_raw_parts(phys_to_virt(pa.as_usize()) as *const u8, PAGE_SIZE) };
        assert!(contents.iter().all(|&b| b == 0));
    }

    #[test_case]
    fn exhaustion_then_free_then_alloc() {
        let mut alloc = fresh(8 * PAGE_SIZE);
        let total = alloc.stats().total_frames;

        let mut held = alloc::vec::Vec::new();
        for _ in 0..total {
            held.push(alloc.alloc_frame().unwrap());
        }
        assert_eq!(alloc.alloc_frame(), Err(KernelError::OutOfFrames));

        let returned = held.pop().unwrap();
        alloc.free_frame(returned).unwrap();
        let again = alloc.alloc_frame().unwrap();
        assert_eq!(again, returned);
        assert_eq!(alloc.alloc_frame(), Err(KernelError::OutOfFrames));
    }

    #[test_case]
    fn free_list_preferred_over_bump() {
        let mut alloc = fresh(16 * PAGE_SIZE);
        let a = alloc.alloc_frame().unwrap();
        let b = alloc.alloc_frame().unwrap();
        alloc.free_frame(a).unwrap();
        alloc.free_frame(b).unwrap();

        let before = alloc.stats().bump_allocations;
        let x = alloc.alloc_frame().unwrap();
        let y = alloc.alloc_frame().unwrap();
        assert_eq!(alloc.stats().bump_allocations, before);
        assert!(x == b && y == a, "LIFO free list order");
    }

    #[test_case]
    fn rejects_bogus_frees() {
        let mut alloc = fresh(8 * PAGE_SIZE);
        let pa = alloc.alloc_frame().unwrap();
        assert!(matches!(
            alloc.free_frame(PhysAddr::new(pa.as_u64() + 1)),
            Err(KernelError::Unaligned { .. })
        ));
        assert!(matches!(
            alloc.free_frame(PhysAddr::new(0x1000)),
            Err(KernelError::InvalidArgument { .. })
        ));
    }
}
