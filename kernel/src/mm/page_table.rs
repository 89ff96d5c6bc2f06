//! Page-table structures and attribute encoding.
//!
//! Both supported architectures use 512-entry tables in a four-level tree
//! over 48-bit virtual addresses, so the walk logic in `vmm` is shared and
//! only the bit encoding of a descriptor differs. The encoding honors the
//! PAT layout programmed by `arch::x86_64::pat` and the MAIR layout from
//! `arch::aarch64::mmu`, so [`decode_leaf`] is a true inverse of
//! [`encode_leaf`] — a property the page-table walk tests rely on.

use bitflags::bitflags;

use super::{PhysAddr, PAGE_SIZE};

/// Entries per table at every level.
pub const ENTRIES_PER_TABLE: usize = 512;

/// Number of translation levels (root = level 3, leaf = level 0).
pub const LEVELS: usize = 4;

bitflags! {
    /// Access and privilege flags of a mapping. Readability is implied:
    /// a present mapping is always at least readable.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u8 {
        /// Writes permitted.
        const WRITE = 1 << 0;
        /// Instruction fetch permitted.
        const EXECUTE = 1 << 1;
        /// Accessible from user mode.
        const USER = 1 << 2;
    }
}

/// Cacheability of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Normal write-back memory.
    #[default]
    WriteBack,
    /// Write-through.
    WriteThrough,
    /// Strongly uncached; device MMIO.
    Uncached,
    /// Write-combining; framebuffers.
    WriteCombining,
}

/// Full attribute set of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapAttrs {
    pub flags: PageFlags,
    pub cache: CacheMode,
}

impl MapAttrs {
    pub const fn new(flags: PageFlags, cache: CacheMode) -> Self {
        Self { flags, cache }
    }

    /// Kernel read-write data, write-back.
    pub const fn kernel_data() -> Self {
        Self::new(PageFlags::WRITE, CacheMode::WriteBack)
    }

    /// Kernel read-execute text.
    pub const fn kernel_text() -> Self {
        Self::new(PageFlags::EXECUTE, CacheMode::WriteBack)
    }

    /// Device MMIO: writable, uncached, never executable.
    pub const fn device() -> Self {
        Self::new(PageFlags::WRITE, CacheMode::Uncached)
    }

    /// Framebuffer: writable, write-combining.
    pub const fn framebuffer() -> Self {
        Self::new(PageFlags::WRITE, CacheMode::WriteCombining)
    }
}

/// One table entry; interpretation depends on level and architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(pub u64);

/// A page table: one 4 KiB frame of 512 entries.
#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

const _: () = assert!(core::mem::size_of::<PageTable>() == PAGE_SIZE);

impl PageTable {
    /// True when no entry is present.
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.is_present())
    }
}

// ---------------------------------------------------------------------------
// x86-64 descriptor encoding
// ---------------------------------------------------------------------------

#[cfg(target_arch = "x86_64")]
mod encoding {
    use super::*;

    const PRESENT: u64 = 1 << 0;
    const WRITABLE: u64 = 1 << 1;
    const USER: u64 = 1 << 2;
    const PWT: u64 = 1 << 3;
    const PCD: u64 = 1 << 4;
    /// PAT bit in a 4 KiB leaf entry.
    const PAT: u64 = 1 << 7;
    const NX: u64 = 1 << 63;

    const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    /// PAT/PCD/PWT selection per cache mode, matching the PAT layout
    /// installed at boot (index 1 = WC, index 4 = WT).
    const fn cache_bits(cache: CacheMode) -> u64 {
        match cache {
            CacheMode::WriteBack => 0,
            CacheMode::WriteCombining => PWT,
            CacheMode::Uncached => PWT | PCD,
            CacheMode::WriteThrough => PAT,
        }
    }

    pub fn encode_leaf(pa: PhysAddr, attrs: MapAttrs) -> PageTableEntry {
        let mut raw = (pa.as_u64() & ADDR_MASK) | PRESENT | cache_bits(attrs.cache);
        if attrs.flags.contains(PageFlags::WRITE) {
            raw |= WRITABLE;
        }
        if attrs.flags.contains(PageFlags::USER) {
            raw |= USER;
        }
        if !attrs.flags.contains(PageFlags::EXECUTE) {
            raw |= NX;
        }
        PageTableEntry(raw)
    }

    pub fn decode_leaf(entry: PageTableEntry) -> Option<(PhysAddr, MapAttrs)> {
        if entry.0 & PRESENT == 0 {
            return None;
        }
        let mut flags = PageFlags::empty();
        if entry.0 & WRITABLE != 0 {
            flags |= PageFlags::WRITE;
        }
        if entry.0 & USER != 0 {
            flags |= PageFlags::USER;
        }
        if entry.0 & NX == 0 {
            flags |= PageFlags::EXECUTE;
        }
        let cache = match (entry.0 & PAT != 0, entry.0 & PCD != 0, entry.0 & PWT != 0) {
            (false, false, false) => CacheMode::WriteBack,
            (false, false, true) => CacheMode::WriteCombining,
            (false, true, _) => CacheMode::Uncached,
            (true, _, _) => CacheMode::WriteThrough,
        };
        Some((
            PhysAddr::new(entry.0 & ADDR_MASK),
            MapAttrs::new(flags, cache),
        ))
    }

    /// Intermediate entry: present, writable, user-reachable (leaf flags
    /// decide the effective permission).
    pub fn encode_table(pa: PhysAddr) -> PageTableEntry {
        PageTableEntry((pa.as_u64() & ADDR_MASK) | PRESENT | WRITABLE | USER)
    }

    pub fn is_present(entry: PageTableEntry) -> bool {
        entry.0 & PRESENT != 0
    }

    pub fn table_addr(entry: PageTableEntry) -> PhysAddr {
        PhysAddr::new(entry.0 & ADDR_MASK)
    }
}

// ---------------------------------------------------------------------------
// AArch64 descriptor encoding (4 KiB granule, LPAE)
// ---------------------------------------------------------------------------

#[cfg(target_arch = "aarch64")]
mod encoding {
    use super::*;

    const VALID: u64 = 1 << 0;
    /// Table descriptor at levels 3..1; page descriptor at level 0.
    const TYPE_TABLE_OR_PAGE: u64 = 1 << 1;
    /// Access flag; without it the first touch faults.
    const AF: u64 = 1 << 10;
    /// Inner shareable.
    const SH_INNER: u64 = 0b11 << 8;
    /// AP[2]: read-only when set. AP[1]: user-accessible when set.
    const AP_RDONLY: u64 = 1 << 7;
    const AP_USER: u64 = 1 << 6;
    const PXN: u64 = 1 << 53;
    const UXN: u64 = 1 << 54;

    const ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;

    /// MAIR AttrIndx per cache mode, matching `arch::aarch64::mmu`.
    const fn attr_index(cache: CacheMode) -> u64 {
        let idx = match cache {
            CacheMode::WriteBack => 0,
            CacheMode::Uncached => 1,
            CacheMode::WriteCombining => 2,
            CacheMode::WriteThrough => 3,
        };
        idx << 2
    }

    pub fn encode_leaf(pa: PhysAddr, attrs: MapAttrs) -> PageTableEntry {
        let mut raw = (pa.as_u64() & ADDR_MASK)
            | VALID
            | TYPE_TABLE_OR_PAGE
            | AF
            | SH_INNER
            | attr_index(attrs.cache);
        if !attrs.flags.contains(PageFlags::WRITE) {
            raw |= AP_RDONLY;
        }
        if attrs.flags.contains(PageFlags::USER) {
            raw |= AP_USER;
        }
        // Execution: keep the other privilege level locked out either way.
        if attrs.flags.contains(PageFlags::EXECUTE) {
            if attrs.flags.contains(PageFlags::USER) {
                raw |= PXN;
            } else {
                raw |= UXN;
            }
        } else {
            raw |= PXN | UXN;
        }
        PageTableEntry(raw)
    }

    pub fn decode_leaf(entry: PageTableEntry) -> Option<(PhysAddr, MapAttrs)> {
        if entry.0 & VALID == 0 {
            return None;
        }
        let mut flags = PageFlags::empty();
        if entry.0 & AP_RDONLY == 0 {
            flags |= PageFlags::WRITE;
        }
        if entry.0 & AP_USER != 0 {
            flags |= PageFlags::USER;
        }
        let exec_blocked = if flags.contains(PageFlags::USER) {
            entry.0 & UXN != 0
        } else {
            entry.0 & PXN != 0
        };
        if !exec_blocked {
            flags |= PageFlags::EXECUTE;
        }
        let cache = match (entry.0 >> 2) & 0b111 {
            0 => CacheMode::WriteBack,
            1 => CacheMode::Uncached,
            2 => CacheMode::WriteCombining,
            _ => CacheMode::WriteThrough,
        };
        Some((
            PhysAddr::new(entry.0 & ADDR_MASK),
            MapAttrs::new(flags, cache),
        ))
    }

    pub fn encode_table(pa: PhysAddr) -> PageTableEntry {
        PageTableEntry((pa.as_u64() & ADDR_MASK) | VALID | TYPE_TABLE_OR_PAGE)
    }

    pub fn is_present(entry: PageTableEntry) -> bool {
        entry.0 & VALID != 0
    }

    pub fn table_addr(entry: PageTableEntry) -> PhysAddr {
        PhysAddr::new(entry.0 & ADDR_MASK)
    }
}

pub use encoding::{decode_leaf, encode_leaf, encode_table, is_present, table_addr};

impl PageTableEntry {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn is_present(self) -> bool {
        is_present(self)
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn leaf_attrs_round_trip() {
        let pa = PhysAddr::new(0x1234_5000);
        let cases = [
            MapAttrs::new(PageFlags::WRITE, CacheMode::WriteBack),
            MapAttrs::new(PageFlags::WRITE, CacheMode::WriteCombining),
            MapAttrs::new(PageFlags::WRITE, CacheMode::Uncached),
            MapAttrs::new(PageFlags::WRITE, CacheMode::WriteThrough),
            MapAttrs::new(PageFlags::EXECUTE, CacheMode::WriteBack),
            MapAttrs::new(PageFlags::empty(), CacheMode::WriteBack),
            MapAttrs::new(
                PageFlags::WRITE | PageFlags::USER,
                CacheMode::WriteBack,
            ),
            MapAttrs::new(
                PageFlags::EXECUTE | PageFlags::USER,
                CacheMode::WriteBack,
            ),
        ];
        for attrs in cases {
            let entry = encode_leaf(pa, attrs);
            let (out_pa, out_attrs) = decode_leaf(entry).unwrap();
            assert_eq!(out_pa, pa, "{:?}", attrs);
            assert_eq!(out_attrs, attrs, "{:?}", attrs);
        }
    }

    #[test_case]
    fn empty_entry_is_absent() {
        assert!(decode_leaf(PageTableEntry::empty()).is_none());
        assert!(!PageTableEntry::empty().is_present());
    }

    #[test_case]
    fn table_entry_preserves_address() {
        let pa = PhysAddr::new(0xABCD_E000);
        let entry = encode_table(pa);
        assert!(entry.is_present());
        assert_eq!(table_addr(entry), pa);
    }
}
