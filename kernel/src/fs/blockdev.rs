//! Block device abstraction and registry.
//!
//! Drivers implement [`BlockDevice`]; registering a device assigns it the
//! first free `vdN` slot. Methods take `&self` with interior mutability in
//! the driver so a device can be shared between the registry, mounted
//! filesystems, and the kernel-API surface via `Arc`. A failed read or
//! write leaves the on-disk state of the attempted range indeterminate;
//! recovery (re-read, re-write) is the caller's call.

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::RwLock;

use crate::error::{KernelError, KernelResult};

/// Maximum number of registered block devices.
pub const MAX_BLOCK_DEVICES: usize = 8;

bitflags::bitflags! {
    /// Static properties of a block device.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlockDeviceFlags: u32 {
        const READ_ONLY = 1 << 0;
        const REMOVABLE = 1 << 1;
    }
}

/// Geometry and properties reported by a driver.
#[derive(Debug, Clone, Copy)]
pub struct BlockDeviceInfo {
    /// Logical sector size in bytes.
    pub sector_size: usize,
    /// Capacity in logical sectors.
    pub sector_count: u64,
    pub flags: BlockDeviceFlags,
}

/// A random-access sector device.
pub trait BlockDevice: Send + Sync {
    /// Geometry and flags.
    fn info(&self) -> BlockDeviceInfo;

    /// Read `buf.len() / sector_size` sectors starting at `sector`.
    /// `buf` must be an exact multiple of the sector size.
    fn read_sectors(&self, sector: u64, buf: &mut [u8]) -> KernelResult<()>;

    /// Write whole sectors starting at `sector`.
    fn write_sectors(&self, sector: u64, buf: &[u8]) -> KernelResult<()>;

    /// Push any volatile write caches to durable media.
    fn flush(&self) -> KernelResult<()> {
        Ok(())
    }
}

struct Registered {
    name: String,
    dev: Arc<dyn BlockDevice>,
}

/// The system block-device registry.
pub struct BlockRegistry {
    slots: RwLock<[Option<Registered>; MAX_BLOCK_DEVICES]>,
}

impl BlockRegistry {
    pub const fn new() -> Self {
        Self {
            slots: RwLock::new([const { None }; MAX_BLOCK_DEVICES]),
        }
    }

    /// Register a device; returns its assigned name (`vd0`, `vd1`, ...).
    pub fn register(&self, dev: Arc<dyn BlockDevice>) -> KernelResult<String> {
        let info = dev.info();
        if info.sector_size == 0 || !info.sector_size.is_power_of_two() {
            return Err(KernelError::InvalidArgument {
                what: "sector size",
            });
        }
        let mut slots = self.slots.write();
        let index = slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(KernelError::TableFull {
                table: "block device",
            })?;
        let name = format!("vd{}", index);
        log::info!(
            "block: {} registered ({} sectors x {} bytes)",
            name,
            info.sector_count,
            info.sector_size
        );
        slots[index] = Some(Registered {
            name: name.clone(),
            dev,
        });
        Ok(name)
    }

    /// Remove a device by name. Outstanding `Arc` handles stay usable; the
    /// slot is immediately reusable.
    pub fn unregister(&self, name: &str) -> KernelResult<()> {
        let mut slots = self.slots.write();
        for slot in slots.iter_mut() {
            if slot.as_ref().is_some_and(|r| r.name == name) {
                *slot = None;
                return Ok(());
            }
        }
        Err(KernelError::NoDevice)
    }

    /// Look up a device by name.
    pub fn get(&self, name: &str) -> KernelResult<Arc<dyn BlockDevice>> {
        let slots = self.slots.read();
        slots
            .iter()
            .flatten()
            .find(|r| r.name == name)
            .map(|r| r.dev.clone())
            .ok_or(KernelError::NoDevice)
    }

    /// Look up a device by slot index (the kernel-API surface addresses
    /// devices by index).
    pub fn get_index(&self, index: usize) -> KernelResult<Arc<dyn BlockDevice>> {
        let slots = self.slots.read();
        slots
            .get(index)
            .and_then(|s| s.as_ref())
            .map(|r| r.dev.clone())
            .ok_or(KernelError::NoDevice)
    }

    /// Registered device names, in slot order.
    pub fn names(&self) -> Vec<String> {
        self.slots
            .read()
            .iter()
            .flatten()
            .map(|r| r.name.clone())
            .collect()
    }
}

impl Default for BlockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate a sector-I/O buffer against the device geometry.
fn check_io(info: &BlockDeviceInfo, sector: u64, len: usize) -> KernelResult<()> {
    if len == 0 || len % info.sector_size != 0 {
        return Err(KernelError::InvalidArgument {
            what: "buffer not sector-sized",
        });
    }
    let count = (len / info.sector_size) as u64;
    if sector + count > info.sector_count {
        return Err(KernelError::InvalidArgument {
            what: "sector range out of bounds",
        });
    }
    Ok(())
}

/// Checked read through a device handle.
pub fn read(dev: &dyn BlockDevice, sector: u64, buf: &mut [u8]) -> KernelResult<()> {
    check_io(&dev.info(), sector, buf.len())?;
    dev.read_sectors(sector, buf)
}

/// Checked write through a device handle.
pub fn write(dev: &dyn BlockDevice, sector: u64, buf: &[u8]) -> KernelResult<()> {
    let info = dev.info();
    if info.flags.contains(BlockDeviceFlags::READ_ONLY) {
        return Err(KernelError::ReadOnly);
    }
    check_io(&info, sector, buf.len())?;
    dev.write_sectors(sector, buf)
}

// ---------------------------------------------------------------------------
// RAM-backed device
// ---------------------------------------------------------------------------

/// Memory-backed block device used by tests and as a ramdisk.
pub struct RamDisk {
    sector_size: usize,
    data: RwLock<Vec<u8>>,
    flags: BlockDeviceFlags,
}

impl RamDisk {
    pub fn new(sector_size: usize, sector_count: u64) -> Self {
        Self {
            sector_size,
            data: RwLock::new(alloc::vec![0u8; sector_size * sector_count as usize]),
            flags: BlockDeviceFlags::empty(),
        }
    }

    /// Byte capacity.
    pub fn size(&self) -> usize {
        self.data.read().len()
    }
}

impl BlockDevice for RamDisk {
    fn info(&self) -> BlockDeviceInfo {
        BlockDeviceInfo {
            sector_size: self.sector_size,
            sector_count: (self.size() / self.sector_size) as u64,
            flags: self.flags,
        }
    }

    fn read_sectors(&self, sector: u64, buf: &mut [u8]) -> KernelResult<()> {
        let start = sector as usize * self.sector_size;
        let data = self.data.read();
        let end = start + buf.len();
        if end > data.len() {
            return Err(KernelError::InvalidArgument {
                what: "sector range out of bounds",
            });
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_sectors(&self, sector: u64, buf: &[u8]) -> KernelResult<()> {
        let start = sector as usize * self.sector_size;
        let mut data = self.data.write();
        let end = start + buf.len();
        if end > data.len() {
            return Err(KernelError::InvalidArgument {
                what: "sector range out of bounds",
            });
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn ramdisk_round_trip() {
        let disk = RamDisk::new(512, 64);
        let pattern = [0x42u8; 1024];
        disk.write_sectors(2, &pattern).unwrap();

        let mut back = [0u8; 1024];
        disk.read_sectors(2, &mut back).unwrap();
        assert_eq!(back, pattern);
    }

    #[test_case]
    fn registry_assigns_vd_names_in_order() {
        let registry = BlockRegistry::new();
        let a = registry.register(Arc::new(RamDisk::new(512, 8))).unwrap();
        let b = registry.register(Arc::new(RamDisk::new(512, 8))).unwrap();
        assert_eq!(a, "vd0");
        assert_eq!(b, "vd1");

        // Freeing a slot makes its name reusable.
        registry.unregister("vd0").unwrap();
        let c = registry.register(Arc::new(RamDisk::new(512, 8))).unwrap();
        assert_eq!(c, "vd0");
        assert_eq!(registry.names().len(), 2);
        assert_eq!(registry.unregister("vd7"), Err(KernelError::NoDevice));
    }

    #[test_case]
    fn registry_capacity_is_bounded() {
        let registry = BlockRegistry::new();
        for _ in 0..MAX_BLOCK_DEVICES {
            registry.register(Arc::new(RamDisk::new(512, 1))).unwrap();
        }
        assert!(matches!(
            registry.register(Arc::new(RamDisk::new(512, 1))),
            Err(KernelError::TableFull { .. })
        ));
    }

    #[test_case]
    fn checked_io_validates_geometry() {
        let disk = RamDisk::new(512, 4);
        let mut buf = [0u8; 100];
        assert!(matches!(
            read(&disk, 0, &mut buf),
            Err(KernelError::InvalidArgument { .. })
        ));
        let mut buf = [0u8; 512];
        assert!(matches!(
            read(&disk, 4, &mut buf),
            Err(KernelError::InvalidArgument { .. })
        ));
        assert!(read(&disk, 3, &mut buf).is_ok());
    }
}
