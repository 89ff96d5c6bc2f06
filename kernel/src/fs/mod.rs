//! Virtual filesystem layer.
//!
//! Filesystem drivers implement [`FilesystemType`] (the mountable factory),
//! [`Filesystem`] (one mounted volume), and [`VfsNode`] (one file or
//! directory). The [`Vfs`] resolves paths component-by-component through a
//! dentry arena: every cached name lives in one flat table with an index
//! pointing at its parent, the root's parent index being its own — no
//! reference cycles, and tearing down a mount drops the arena as a whole.

pub mod blockdev;
pub mod fat32;
pub mod file;

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::RwLock;

use crate::error::{KernelError, KernelResult};
use blockdev::BlockDevice;
use file::{File, OpenFlags};

/// Maximum length of one path component (FAT 8.3 names are far shorter,
/// but the VFS is not FAT-specific).
pub const NAME_MAX: usize = 255;

/// What a node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    File,
    Directory,
}

/// Node metadata as reported by the driver.
#[derive(Debug, Clone, Copy)]
pub struct Metadata {
    pub node_type: NodeType,
    pub size: usize,
    pub readonly: bool,
    /// Driver-specific packed modification stamp (FAT date+time).
    pub mtime_raw: u32,
}

/// One directory entry produced by `readdir`.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub node_type: NodeType,
    pub size: usize,
    /// Driver-assigned stable identifier for the entry: a real inode
    /// number where the filesystem has them, otherwise derived from the
    /// entry's on-disk location.
    pub inode: u64,
}

/// Operations on one file or directory.
///
/// Directory-shaped operations (`lookup`, `create`, ...) fail with
/// `NotADirectory` on files; `read`/`write` fail with `IsADirectory` on
/// directories.
pub trait VfsNode: Send + Sync {
    fn node_type(&self) -> NodeType;

    fn metadata(&self) -> KernelResult<Metadata>;

    /// Read up to `buf.len()` bytes at `offset`; returns bytes read
    /// (short only at end of file).
    fn read(&self, offset: u64, buf: &mut [u8]) -> KernelResult<usize>;

    /// Write at `offset`, extending the file as needed.
    fn write(&self, offset: u64, data: &[u8]) -> KernelResult<usize>;

    /// Cut or reset the file to `size` bytes (only 0 is required of
    /// drivers; used by `O_TRUNC`).
    fn truncate(&self, size: u64) -> KernelResult<()>;

    /// List the real entries of this directory.
    fn readdir(&self) -> KernelResult<Vec<DirEntry>>;

    /// Find a child by name.
    fn lookup(&self, name: &str) -> KernelResult<Arc<dyn VfsNode>>;

    /// Create a file in this directory.
    fn create(&self, name: &str) -> KernelResult<Arc<dyn VfsNode>>;

    /// Create a subdirectory.
    fn mkdir(&self, name: &str) -> KernelResult<Arc<dyn VfsNode>>;

    /// Remove a file.
    fn unlink(&self, name: &str) -> KernelResult<()>;

    /// Remove an empty subdirectory.
    fn rmdir(&self, name: &str) -> KernelResult<()>;

    /// Rename a child within this directory.
    fn rename(&self, old_name: &str, new_name: &str) -> KernelResult<()>;
}

/// One mounted volume.
pub trait Filesystem: Send + Sync {
    fn name(&self) -> &str;

    fn root(&self) -> Arc<dyn VfsNode>;

    fn is_readonly(&self) -> bool;

    /// Push pending state to the device.
    fn sync(&self) -> KernelResult<()>;
}

/// A mountable filesystem implementation, registered by name.
pub trait FilesystemType: Send + Sync {
    fn name(&self) -> &str;

    fn mount(&self, dev: Arc<dyn BlockDevice>, flags: u32) -> KernelResult<Arc<dyn Filesystem>>;
}

// ---------------------------------------------------------------------------
// Dentry arena
// ---------------------------------------------------------------------------

struct Dentry {
    name: String,
    parent: usize,
    children: BTreeMap<String, usize>,
    node: Arc<dyn VfsNode>,
}

/// Flat arena of cached path components. Index 0 is the root; the root's
/// parent index equals its own index.
struct DentryArena {
    entries: Vec<Option<Dentry>>,
}

impl DentryArena {
    fn new(root: Arc<dyn VfsNode>) -> Self {
        Self {
            entries: alloc::vec![Some(Dentry {
                name: String::new(),
                parent: 0,
                children: BTreeMap::new(),
                node: root,
            })],
        }
    }

    fn get(&self, index: usize) -> &Dentry {
        self.entries[index].as_ref().expect("dangling dentry index")
    }

    fn insert(&mut self, parent: usize, name: &str, node: Arc<dyn VfsNode>) -> usize {
        let index = self
            .entries
            .iter()
            .position(|e| e.is_none())
            .unwrap_or_else(|| {
                self.entries.push(None);
                self.entries.len() - 1
            });
        self.entries[index] = Some(Dentry {
            name: name.to_string(),
            parent,
            children: BTreeMap::new(),
            node,
        });
        self.entries[parent]
            .as_mut()
            .expect("dangling parent index")
            .children
            .insert(name.to_string(), index);
        index
    }

    /// Drop a cached name and everything cached beneath it.
    fn remove_subtree(&mut self, parent: usize, name: &str) {
        let Some(index) = self.entries[parent]
            .as_mut()
            .and_then(|p| p.children.remove(name))
        else {
            return;
        };
        let mut stack = alloc::vec![index];
        while let Some(idx) = stack.pop() {
            if let Some(entry) = self.entries[idx].take() {
                stack.extend(entry.children.values());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// The VFS proper
// ---------------------------------------------------------------------------

struct MountedRoot {
    fs: Arc<dyn Filesystem>,
    dcache: DentryArena,
}

/// Filesystem-type registry plus the mounted root volume.
pub struct Vfs {
    types: RwLock<Vec<Arc<dyn FilesystemType>>>,
    root: RwLock<Option<MountedRoot>>,
}

impl Vfs {
    pub fn new() -> Self {
        Self {
            types: RwLock::new(Vec::new()),
            root: RwLock::new(None),
        }
    }

    /// Register a filesystem implementation under its name.
    pub fn register_type(&self, fstype: Arc<dyn FilesystemType>) -> KernelResult<()> {
        let mut types = self.types.write();
        if types.iter().any(|t| t.name() == fstype.name()) {
            return Err(KernelError::AlreadyExists {
                what: "filesystem type",
            });
        }
        log::info!("vfs: filesystem type '{}' registered", fstype.name());
        types.push(fstype);
        Ok(())
    }

    /// Mount `dev` as the root volume using the named filesystem type.
    pub fn mount(&self, type_name: &str, dev: Arc<dyn BlockDevice>, flags: u32) -> KernelResult<()> {
        let fstype = {
            let types = self.types.read();
            types
                .iter()
                .find(|t| t.name() == type_name)
                .cloned()
                .ok_or(KernelError::NotFound)?
        };
        let mut root = self.root.write();
        if root.is_some() {
            return Err(KernelError::AlreadyExists { what: "root mount" });
        }
        let fs = fstype.mount(dev, flags)?;
        let dcache = DentryArena::new(fs.root());
        *root = Some(MountedRoot { fs, dcache });
        log::info!("vfs: root mounted as {}", type_name);
        Ok(())
    }

    /// Sync and drop the root mount; the dentry arena goes with it.
    pub fn unmount(&self) -> KernelResult<()> {
        let mut root = self.root.write();
        let mounted = root.take().ok_or(KernelError::NotFound)?;
        mounted.fs.sync()
    }

    /// Sync the mounted volume.
    pub fn sync(&self) -> KernelResult<()> {
        let root = self.root.read();
        root.as_ref().ok_or(KernelError::NotFound)?.fs.sync()
    }

    fn split_path(path: &str) -> KernelResult<Vec<&str>> {
        let mut parts = Vec::new();
        for comp in path.split('/') {
            match comp {
                "" | "." => {}
                name if name.len() > NAME_MAX => return Err(KernelError::NameTooLong),
                name => parts.push(name),
            }
        }
        Ok(parts)
    }

    /// Walk `path` from the root through the dentry cache, consulting the
    /// driver's `lookup` on cache misses.
    fn resolve_index(&self, path: &str) -> KernelResult<usize> {
        let parts = Self::split_path(path)?;
        let mut root = self.root.write();
        let mounted = root.as_mut().ok_or(KernelError::NotFound)?;
        let mut index = 0usize;
        for comp in parts {
            if comp == ".." {
                index = mounted.dcache.get(index).parent;
                continue;
            }
            if let Some(&child) = mounted.dcache.get(index).children.get(comp) {
                index = child;
                continue;
            }
            let node = mounted.dcache.get(index).node.lookup(comp)?;
            index = mounted.dcache.insert(index, comp, node);
        }
        Ok(index)
    }

    /// Resolve a full path to its node.
    pub fn resolve(&self, path: &str) -> KernelResult<Arc<dyn VfsNode>> {
        let index = self.resolve_index(path)?;
        let root = self.root.read();
        Ok(root
            .as_ref()
            .ok_or(KernelError::NotFound)?
            .dcache
            .get(index)
            .node
            .clone())
    }

    /// Resolve everything but the final component; returns the parent
    /// node, its dentry index, and the final name.
    fn resolve_parent<'p>(&self, path: &'p str) -> KernelResult<(Arc<dyn VfsNode>, usize, &'p str)> {
        let mut parts = Self::split_path(path)?;
        let name = parts.pop().ok_or(KernelError::InvalidArgument {
            what: "path has no final component",
        })?;
        if name == ".." {
            return Err(KernelError::InvalidArgument {
                what: "'..' as final component",
            });
        }
        // `name` is a subslice of `path`; everything before it is the
        // parent path (robust against trailing slashes).
        let prefix_len = name.as_ptr() as usize - path.as_ptr() as usize;
        let index = self.resolve_index(&path[..prefix_len])?;
        let root = self.root.read();
        let node = root
            .as_ref()
            .ok_or(KernelError::NotFound)?
            .dcache
            .get(index)
            .node
            .clone();
        Ok((node, index, name))
    }

    fn drop_cached(&self, parent: usize, name: &str) {
        let mut root = self.root.write();
        if let Some(mounted) = root.as_mut() {
            mounted.dcache.remove_subtree(parent, name);
        }
    }

    /// Open a file (creating it with `O_CREAT`, truncating with
    /// `O_TRUNC`).
    pub fn open(&self, path: &str, flags: OpenFlags) -> KernelResult<Arc<File>> {
        let node = match self.resolve(path) {
            Ok(node) => {
                if flags.contains(OpenFlags::O_CREAT | OpenFlags::O_EXCL) {
                    return Err(KernelError::AlreadyExists { what: "path" });
                }
                node
            }
            Err(KernelError::NotFound) if flags.contains(OpenFlags::O_CREAT) => {
                let (parent, _, name) = self.resolve_parent(path)?;
                parent.create(name)?;
                // Resolve through the cache so the new node is recorded.
                self.resolve(path)?
            }
            Err(e) => return Err(e),
        };
        if node.node_type() == NodeType::Directory && flags.writable() {
            return Err(KernelError::IsADirectory);
        }
        if flags.contains(OpenFlags::O_TRUNC) && flags.writable() {
            node.truncate(0)?;
        }
        Ok(Arc::new(File::new(node, flags)))
    }

    /// Create a directory.
    pub fn mkdir(&self, path: &str) -> KernelResult<()> {
        let (parent, _, name) = self.resolve_parent(path)?;
        parent.mkdir(name)?;
        Ok(())
    }

    /// Remove a file.
    pub fn unlink(&self, path: &str) -> KernelResult<()> {
        let (parent, index, name) = self.resolve_parent(path)?;
        parent.unlink(name)?;
        self.drop_cached(index, name);
        Ok(())
    }

    /// Remove an empty directory.
    pub fn rmdir(&self, path: &str) -> KernelResult<()> {
        let (parent, index, name) = self.resolve_parent(path)?;
        parent.rmdir(name)?;
        self.drop_cached(index, name);
        Ok(())
    }

    /// Rename within one directory. Renames that would move between
    /// directories return `CrossDirectory`.
    pub fn rename(&self, old_path: &str, new_path: &str) -> KernelResult<()> {
        let (old_parent, old_index, old_name) = self.resolve_parent(old_path)?;
        let (_, new_index, new_name) = self.resolve_parent(new_path)?;
        if old_index != new_index {
            return Err(KernelError::CrossDirectory);
        }
        old_parent.rename(old_name, new_name)?;
        self.drop_cached(old_index, old_name);
        self.drop_cached(old_index, new_name);
        Ok(())
    }

    /// Iterate a directory open as `file`, feeding each real entry to
    /// `fill`. A non-zero return from `fill` halts the iteration.
    pub fn readdir(
        &self,
        file: &File,
        fill: &mut dyn FnMut(&DirEntry, usize) -> i32,
    ) -> KernelResult<usize> {
        if !file.is_directory() {
            return Err(KernelError::NotADirectory);
        }
        let entries = file.node().readdir()?;
        let mut emitted = 0;
        for (offset, entry) in entries.iter().enumerate() {
            emitted += 1;
            if fill(entry, offset) != 0 {
                break;
            }
        }
        Ok(emitted)
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}
