//! Open files and per-task descriptor tables.

use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;

use super::{NodeType, VfsNode};
use crate::error::{KernelError, KernelResult};
use crate::sync::SpinLock;

/// File descriptor number.
pub type Fd = usize;

/// Maximum open files per task.
pub const MAX_OPEN_FILES: usize = 64;

bitflags! {
    /// Open flags. The access mode lives in the low two bits
    /// (0 = read-only), so `O_WRONLY` and `O_RDWR` are the only mode bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const O_WRONLY = 0x0001;
        const O_RDWR = 0x0002;
        const O_CREAT = 0x0040;
        const O_EXCL = 0x0080;
        const O_TRUNC = 0x0200;
        const O_APPEND = 0x0400;
    }
}

impl OpenFlags {
    pub fn readable(self) -> bool {
        !self.contains(OpenFlags::O_WRONLY)
    }

    pub fn writable(self) -> bool {
        self.intersects(OpenFlags::O_WRONLY | OpenFlags::O_RDWR)
    }
}

/// Seek origin.
#[derive(Debug, Clone, Copy)]
pub enum SeekFrom {
    Start(u64),
    Current(i64),
    End(i64),
}

/// An open file: node reference, flags, and a position cursor. The cursor
/// is owned by this handle; sharing a handle across tasks requires
/// external synchronization, which is why it sits behind its own lock.
pub struct File {
    node: Arc<dyn VfsNode>,
    flags: OpenFlags,
    pos: SpinLock<u64>,
}

impl File {
    pub fn new(node: Arc<dyn VfsNode>, flags: OpenFlags) -> Self {
        Self {
            node,
            flags,
            pos: SpinLock::new(0),
        }
    }

    pub fn node(&self) -> &Arc<dyn VfsNode> {
        &self.node
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    /// Read from the cursor, advancing it by the bytes returned.
    pub fn read(&self, buf: &mut [u8]) -> KernelResult<usize> {
        if !self.flags.readable() {
            return Err(KernelError::InvalidArgument {
                what: "file not open for reading",
            });
        }
        let mut pos = self.pos.lock();
        let n = self.node.read(*pos, buf)?;
        *pos += n as u64;
        Ok(n)
    }

    /// Write at the cursor (or at EOF with `O_APPEND`), advancing it.
    pub fn write(&self, buf: &[u8]) -> KernelResult<usize> {
        if !self.flags.writable() {
            return Err(KernelError::InvalidArgument {
                what: "file not open for writing",
            });
        }
        let mut pos = self.pos.lock();
        if self.flags.contains(OpenFlags::O_APPEND) {
            *pos = self.node.metadata()?.size as u64;
        }
        let n = self.node.write(*pos, buf)?;
        *pos += n as u64;
        Ok(n)
    }

    /// Move the cursor; returns the new absolute position.
    pub fn seek(&self, from: SeekFrom) -> KernelResult<u64> {
        let size = self.node.metadata()?.size as i64;
        let mut pos = self.pos.lock();
        let next = match from {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::Current(delta) => *pos as i64 + delta,
            SeekFrom::End(delta) => size + delta,
        };
        if next < 0 {
            return Err(KernelError::InvalidArgument {
                what: "seek before start",
            });
        }
        *pos = next as u64;
        Ok(*pos)
    }

    /// Current cursor position.
    pub fn position(&self) -> u64 {
        *self.pos.lock()
    }

    pub fn is_directory(&self) -> bool {
        self.node.node_type() == NodeType::Directory
    }
}

/// Per-task table of open files.
pub struct FileTable {
    slots: Vec<Option<Arc<File>>>,
}

impl FileTable {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Install a file in the lowest free slot.
    pub fn insert(&mut self, file: Arc<File>) -> KernelResult<Fd> {
        if let Some(fd) = self.slots.iter().position(|s| s.is_none()) {
            self.slots[fd] = Some(file);
            return Ok(fd);
        }
        if self.slots.len() >= MAX_OPEN_FILES {
            return Err(KernelError::TableFull { table: "file" });
        }
        self.slots.push(Some(file));
        Ok(self.slots.len() - 1)
    }

    pub fn get(&self, fd: Fd) -> KernelResult<Arc<File>> {
        self.slots
            .get(fd)
            .and_then(|s| s.clone())
            .ok_or(KernelError::BadDescriptor { fd })
    }

    pub fn remove(&mut self, fd: Fd) -> KernelResult<Arc<File>> {
        self.slots
            .get_mut(fd)
            .and_then(|s| s.take())
            .ok_or(KernelError::BadDescriptor { fd })
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn flags_decode_access_mode() {
        assert!(OpenFlags::empty().readable());
        assert!(!OpenFlags::empty().writable());
        assert!(!OpenFlags::O_WRONLY.readable());
        assert!(OpenFlags::O_WRONLY.writable());
        assert!(OpenFlags::O_RDWR.readable());
        assert!(OpenFlags::O_RDWR.writable());
    }
}
