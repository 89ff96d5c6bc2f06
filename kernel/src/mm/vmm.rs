//! Virtual memory: address spaces and the four-level table walk.
//!
//! An [`AddressSpace`] owns its root table frame and every subordinate
//! table frame; dropping the space returns them all. `map` is atomic per
//! call: if any page cannot be mapped (out of frames, or an existing
//! mapping without the replace flag), every page and intermediate table
//! created by that call is rolled back before the error returns.

use alloc::vec::Vec;

use super::page_table::{
    decode_leaf, encode_leaf, encode_table, table_addr, PageTable, PageTableEntry,
};
use super::{alloc_frame, free_frame, phys_to_virt, MapAttrs, PhysAddr, VirtAddr, PAGE_SIZE};
use crate::error::{KernelError, KernelResult};

/// TLB maintenance only makes sense on hardware; hosted test builds walk
/// tables that are never installed.
fn flush_page(va: VirtAddr) {
    #[cfg(target_os = "none")]
    crate::arch::mmu_invalidate(va.as_u64());
    #[cfg(not(target_os = "none"))]
    let _ = va;
}

/// An intermediate table allocated during one `map` call, remembered so a
/// failed call can roll it back.
struct CreatedTable {
    parent: PhysAddr,
    index: usize,
    table: PhysAddr,
}

/// A four-level page-table tree and the frames backing it.
pub struct AddressSpace {
    root: PhysAddr,
}

impl AddressSpace {
    /// Allocate an empty address space (one zeroed root frame).
    pub fn new() -> KernelResult<Self> {
        let root = alloc_frame()?;
        Ok(Self { root })
    }

    /// Physical address of the root table, as loaded into CR3 / TTBR0.
    pub fn root(&self) -> PhysAddr {
        self.root
    }

    /// Install this space on the current hart with a full TLB invalidation.
    #[cfg(target_os = "none")]
    pub fn activate(&self) {
        crate::arch::mmu_switch(self.root.as_u64());
    }

    fn table_ptr(pa: PhysAddr) -> *mut PageTable {
        phys_to_virt(pa.as_usize()) as *mut PageTable
    }

    /// Walk to the leaf entry for `va`, creating intermediate tables and
    /// recording them in `created`.
    fn walk_create(
        &mut self,
        va: VirtAddr,
        created: &mut Vec<CreatedTable>,
    ) -> KernelResult<*mut PageTableEntry> {
        let mut table_pa = self.root;
        for level in (1..super::page_table::LEVELS).rev() {
            let index = va.table_index(level);
            // SAFETY: table_pa is the root frame or came from a present
            // table entry this space owns; the direct map covers it.
            let entry = unsafe { &mut (*Self::table_ptr(table_pa)).entries[index] };
            if !entry.is_present() {
                let frame = alloc_frame()?;
                *entry = encode_table(frame);
                created.push(CreatedTable {
                    parent: table_pa,
                    index,
                    table: frame,
                });
            }
            table_pa = table_addr(*entry);
        }
        // SAFETY: As above; table_pa is now the leaf-level table.
        Ok(unsafe { &mut (*Self::table_ptr(table_pa)).entries[va.table_index(0)] })
    }

    /// Walk to the leaf entry for `va` without creating anything.
    fn walk(&self, va: VirtAddr) -> Option<*mut PageTableEntry> {
        let mut table_pa = self.root;
        for level in (1..super::page_table::LEVELS).rev() {
            let index = va.table_index(level);
            // SAFETY: Tables reachable from the root are owned by this
            // space and covered by the direct map.
            let entry = unsafe { (*Self::table_ptr(table_pa)).entries[index] };
            if !entry.is_present() {
                return None;
            }
            table_pa = table_addr(entry);
        }
        // SAFETY: As above.
        Some(unsafe { &mut (*Self::table_ptr(table_pa)).entries[va.table_index(0)] })
    }

    fn check_range(va: VirtAddr, pa: Option<PhysAddr>, size: usize) -> KernelResult<()> {
        if size == 0 || size % PAGE_SIZE != 0 {
            return Err(KernelError::InvalidArgument { what: "size" });
        }
        if !va.is_page_aligned() {
            return Err(KernelError::Unaligned {
                addr: va.as_usize(),
                align: PAGE_SIZE,
            });
        }
        if let Some(pa) = pa {
            if !pa.is_frame_aligned() {
                return Err(KernelError::Unaligned {
                    addr: pa.as_usize(),
                    align: PAGE_SIZE,
                });
            }
        }
        Ok(())
    }

    /// Map `[va, va+size)` to `[pa, pa+size)` with `attrs`.
    ///
    /// Fails on unaligned inputs, on exhaustion of table frames, and on
    /// overlap with an existing mapping unless `replace` is set. On
    /// failure nothing from this call remains mapped.
    pub fn map(
        &mut self,
        va: VirtAddr,
        pa: PhysAddr,
        size: usize,
        attrs: MapAttrs,
        replace: bool,
    ) -> KernelResult<()> {
        Self::check_range(va, Some(pa), size)?;

        let mut created = Vec::new();
        let mut mapped = Vec::new();
        let pages = size / PAGE_SIZE;

        for page in 0..pages {
            let page_va = VirtAddr::new(va.as_u64() + (page * PAGE_SIZE) as u64);
            let page_pa = PhysAddr::new(pa.as_u64() + (page * PAGE_SIZE) as u64);
            let leaf = match self.walk_create(page_va, &mut created) {
                Ok(leaf) => leaf,
                Err(e) => {
                    self.rollback(&mapped, &created);
                    return Err(e);
                }
            };
            // SAFETY: walk_create returned a live leaf slot in a table
            // this space owns.
            unsafe {
                if (*leaf).is_present() && !replace {
                    self.rollback(&mapped, &created);
                    return Err(KernelError::AlreadyExists { what: "mapping" });
                }
                *leaf = encode_leaf(page_pa, attrs);
            }
            mapped.push(page_va);
            flush_page(page_va);
        }
        Ok(())
    }

    /// Undo the pages and tables created by a failing `map` call.
    fn rollback(&mut self, mapped: &[VirtAddr], created: &[CreatedTable]) {
        for &va in mapped {
            if let Some(leaf) = self.walk(va) {
                // SAFETY: Leaf slot owned by this space.
                unsafe { (*leaf).clear() };
                flush_page(va);
            }
        }
        // Reverse order frees child tables before the parents that point
        // at them.
        for ct in created.iter().rev() {
            // SAFETY: ct.table was allocated by walk_create for this space.
            let table = unsafe { &*Self::table_ptr(ct.table) };
            if table.is_empty() {
                // SAFETY: Parent table owned by this space; the entry
                // points at ct.table.
                unsafe { (*Self::table_ptr(ct.parent)).entries[ct.index].clear() };
                let _ = free_frame(ct.table);
            }
        }
    }

    /// Remove any mappings in `[va, va+size)`. Unmapped pages inside the
    /// range are skipped, so `map; unmap; map` composes with no residue.
    pub fn unmap(&mut self, va: VirtAddr, size: usize) -> KernelResult<()> {
        Self::check_range(va, None, size)?;
        for page in 0..size / PAGE_SIZE {
            let page_va = VirtAddr::new(va.as_u64() + (page * PAGE_SIZE) as u64);
            if let Some(leaf) = self.walk(page_va) {
                // SAFETY: Leaf slot owned by this space.
                unsafe { (*leaf).clear() };
                flush_page(page_va);
            }
        }
        Ok(())
    }

    /// Change the attributes of an existing mapping without changing its
    /// translation. Fails with `NotFound` at the first unmapped page.
    pub fn set_attrs(&mut self, va: VirtAddr, size: usize, attrs: MapAttrs) -> KernelResult<()> {
        Self::check_range(va, None, size)?;
        for page in 0..size / PAGE_SIZE {
            let page_va = VirtAddr::new(va.as_u64() + (page * PAGE_SIZE) as u64);
            let leaf = self.walk(page_va).ok_or(KernelError::NotFound)?;
            // SAFETY: Leaf slot owned by this space.
            unsafe {
                let (pa, _) = decode_leaf(*leaf).ok_or(KernelError::NotFound)?;
                *leaf = encode_leaf(pa, attrs);
            }
            flush_page(page_va);
        }
        Ok(())
    }

    /// Resolve `va` to its physical address and attributes.
    pub fn translate(&self, va: VirtAddr) -> Option<(PhysAddr, MapAttrs)> {
        let page_va = VirtAddr::new(va.as_u64() & !(PAGE_SIZE as u64 - 1));
        let leaf = self.walk(page_va)?;
        // SAFETY: Leaf slot owned by this space.
        let (pa, attrs) = decode_leaf(unsafe { *leaf })?;
        let offset = va.as_u64() % PAGE_SIZE as u64;
        Some((PhysAddr::new(pa.as_u64() + offset), attrs))
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        fn free_level(table_pa: PhysAddr, level: usize) {
            // SAFETY: Every present entry of an owned table points at a
            // frame this space owns (leaf frames belong to their own
            // owners and are not freed here).
            let table = unsafe { &*AddressSpace::table_ptr(table_pa) };
            if level > 1 {
                for entry in table.entries.iter().filter(|e| e.is_present()) {
                    free_level(table_addr(*entry), level - 1);
                }
            }
            let _ = free_frame(table_pa);
        }
        free_level(self.root, super::page_table::LEVELS - 1);
    }
}

#[cfg(test)]
mod tests {
    use super::super::frame_allocator::test_arena::leak_arena;
    use super::super::{PageFlags, FRAME_ALLOCATOR};
    use super::*;
    use crate::bootinfo::MemoryMap;
    use crate::mm::CacheMode;

    fn setup(arena_pages: usize) {
        let regions = alloc::vec![leak_arena(arena_pages * PAGE_SIZE)].leak();
        FRAME_ALLOCATOR.lock().init(&MemoryMap::new(regions));
    }

    #[test_case]
    fn map_then_walk_decodes_back() {
        setup(128);
        let mut space = AddressSpace::new().unwrap();
        let va = VirtAddr::new(0x4000_0000);
        let pa = PhysAddr::new(0x8000_0000);
        let attrs = MapAttrs::new(PageFlags::WRITE, CacheMode::WriteCombining);

        space.map(va, pa, 4 * PAGE_SIZE, attrs, false).unwrap();

        for page in 0..4u64 {
            let probe = VirtAddr::new(va.as_u64() + page * PAGE_SIZE as u64 + 0x123);
            let (got_pa, got_attrs) = space.translate(probe).unwrap();
            assert_eq!(got_pa.as_u64(), pa.as_u64() + page * PAGE_SIZE as u64 + 0x123);
            assert_eq!(got_attrs, attrs);
        }
        assert!(space.translate(VirtAddr::new(0x5000_0000)).is_none());
    }

    #[test_case]
    fn overlap_without_replace_fails_clean() {
        setup(128);
        let mut space = AddressSpace::new().unwrap();
        let attrs = MapAttrs::kernel_data();
        let va = VirtAddr::new(0x10_0000_0000);
        space
            .map(va, PhysAddr::new(0x1000), PAGE_SIZE, attrs, false)
            .unwrap();

        // Second call spans a fresh page then collides; the fresh page
        // must not survive the failure.
        let before = VirtAddr::new(va.as_u64() - PAGE_SIZE as u64);
        let err = space.map(before, PhysAddr::new(0x2000), 2 * PAGE_SIZE, attrs, false);
        assert_eq!(err, Err(KernelError::AlreadyExists { what: "mapping" }));
        assert!(space.translate(before).is_none());
        // The original mapping is untouched.
        assert_eq!(
            space.translate(va).unwrap().0,
            PhysAddr::new(0x1000)
        );

        // With replace set the collision is allowed.
        space
            .map(va, PhysAddr::new(0x3000), PAGE_SIZE, attrs, true)
            .unwrap();
        assert_eq!(space.translate(va).unwrap().0, PhysAddr::new(0x3000));
    }

    #[test_case]
    fn unaligned_inputs_rejected() {
        setup(64);
        let mut space = AddressSpace::new().unwrap();
        let attrs = MapAttrs::kernel_data();
        assert!(matches!(
            space.map(
                VirtAddr::new(0x1001),
                PhysAddr::new(0x1000),
                PAGE_SIZE,
                attrs,
                false
            ),
            Err(KernelError::Unaligned { .. })
        ));
        assert!(matches!(
            space.map(
                VirtAddr::new(0x1000),
                PhysAddr::new(0x1000),
                123,
                attrs,
                false
            ),
            Err(KernelError::InvalidArgument { .. })
        ));
    }

    #[test_case]
    fn map_unmap_map_equals_single_map() {
        setup(128);
        let mut space = AddressSpace::new().unwrap();
        let attrs = MapAttrs::kernel_text();
        let va = VirtAddr::new(0x7F00_0000);
        let pa = PhysAddr::new(0x4000);

        space.map(va, pa, PAGE_SIZE, attrs, false).unwrap();
        space.unmap(va, PAGE_SIZE).unwrap();
        assert!(space.translate(va).is_none());
        space.map(va, pa, PAGE_SIZE, attrs, false).unwrap();

        let (got_pa, got_attrs) = space.translate(va).unwrap();
        assert_eq!(got_pa, pa);
        assert_eq!(got_attrs, attrs);
    }

    #[test_case]
    fn set_attrs_keeps_translation() {
        setup(128);
        let mut space = AddressSpace::new().unwrap();
        let va = VirtAddr::new(0x6000_0000);
        let pa = PhysAddr::new(0x9_0000);
        space
            .map(va, pa, PAGE_SIZE, MapAttrs::kernel_data(), false)
            .unwrap();

        let wc = MapAttrs::framebuffer();
        space.set_attrs(va, PAGE_SIZE, wc).unwrap();
        let (got_pa, got_attrs) = space.translate(va).unwrap();
        assert_eq!(got_pa, pa);
        assert_eq!(got_attrs, wc);

        assert_eq!(
            space.set_attrs(VirtAddr::new(0x6100_0000), PAGE_SIZE, wc),
            Err(KernelError::NotFound)
        );
    }

    // Random map/unmap sequence over a 1 GiB window; final state must
    // equal a replay of only the net-mapped pages.
    #[test_case]
    fn random_ops_match_net_replay() {
        setup(2048);
        let mut space = AddressSpace::new().unwrap();
        let attrs = MapAttrs::kernel_data();
        let base = 0x20_0000_0000u64;

        // Deterministic LCG; no external entropy in kernel tests.
        let mut state = 0x243F_6A88_85A3_08D3u64;
        let mut rand = move || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            state >> 33
        };

        let mut model: alloc::collections::BTreeMap<u64, u64> = alloc::collections::BTreeMap::new();
        for _ in 0..1000 {
            let page = rand() % (1 << 18); // 1 GiB of 4 KiB pages
            let va = VirtAddr::new(base + page * PAGE_SIZE as u64);
            if rand() % 2 == 0 {
                let pa = PhysAddr::new((rand() % (1 << 20)) * PAGE_SIZE as u64);
                let _ = space.map(va, pa, PAGE_SIZE, attrs, true);
                model.insert(va.as_u64(), pa.as_u64());
            } else {
                space.unmap(va, PAGE_SIZE).unwrap();
                model.remove(&va.as_u64());
            }
        }

        let mut replay = AddressSpace::new().unwrap();
        for (&va, &pa) in &model {
            replay
                .map(VirtAddr::new(va), PhysAddr::new(pa), PAGE_SIZE, attrs, false)
                .unwrap();
        }
        for (&va, &pa) in &model {
            let got = space.translate(VirtAddr::new(va)).unwrap();
            let expect = replay.translate(VirtAddr::new(va)).unwrap();
            assert_eq!(got.0.as_u64(), pa);
            assert_eq!(got.0, expect.0);
        }
    }
}
