//! Kernel error type and errno mapping.
//!
//! Every fallible kernel operation returns [`KernelResult`]. Errors carry
//! enough context to log usefully; at the kernel-API boundary they collapse
//! to a fixed negative errno via [`KernelError::errno`]. Programming errors
//! (class 5 in the error taxonomy) panic and are never translated into a
//! returned code.

use core::fmt;

/// Result alias used throughout the kernel.
pub type KernelResult<T> = Result<T, KernelError>;

/// Main kernel error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Caller violated an input constraint.
    InvalidArgument {
        what: &'static str,
    },
    /// Address is misaligned for the requested operation.
    Unaligned {
        addr: usize,
        align: usize,
    },
    /// No physical frames left.
    OutOfFrames,
    /// Heap allocation failed.
    OutOfMemory {
        requested: usize,
    },
    /// No free cluster on the volume.
    NoSpace,
    /// A fixed-capacity table is full.
    TableFull {
        table: &'static str,
    },
    /// Underlying device returned an error; the affected range is
    /// indeterminate until reread.
    Io {
        device: &'static str,
    },
    /// On-disk structure violates its invariants.
    Corrupted {
        what: &'static str,
    },
    /// A mapping or entry already exists at the target.
    AlreadyExists {
        what: &'static str,
    },
    /// Lookup found nothing.
    NotFound,
    /// Path component is not a directory.
    NotADirectory,
    /// Operation needs a file but found a directory.
    IsADirectory,
    /// Directory is not empty.
    NotEmpty,
    /// File descriptor is not open.
    BadDescriptor {
        fd: usize,
    },
    /// No such device.
    NoDevice,
    /// Device or volume is read-only.
    ReadOnly,
    /// Name exceeds the 8.3 or path limits.
    NameTooLong,
    /// Rename across directories is not supported.
    CrossDirectory,
    /// A blocking wait hit its deadline.
    TimedOut {
        after_ms: u64,
    },
    /// Operation is not supported by this object.
    Unsupported {
        operation: &'static str,
    },
    /// Subsystem used before its init() ran.
    NotInitialized {
        subsystem: &'static str,
    },
}

impl KernelError {
    /// Fixed negative errno mapping used at the kernel-API vtable boundary.
    pub const fn errno(self) -> i64 {
        match self {
            KernelError::InvalidArgument { .. } | KernelError::Unaligned { .. } => -22, // EINVAL
            KernelError::OutOfFrames | KernelError::OutOfMemory { .. } => -12,          // ENOMEM
            KernelError::NoSpace => -28,                                                // ENOSPC
            KernelError::TableFull { .. } => -23,                                       // ENFILE
            KernelError::Io { .. } => -5,                                               // EIO
            KernelError::Corrupted { .. } => -117,                                      // EUCLEAN
            KernelError::AlreadyExists { .. } => -17,                                   // EEXIST
            KernelError::NotFound => -2,                                                // ENOENT
            KernelError::NotADirectory => -20,                                          // ENOTDIR
            KernelError::IsADirectory => -21,                                           // EISDIR
            KernelError::NotEmpty => -39,                                               // ENOTEMPTY
            KernelError::BadDescriptor { .. } => -9,                                    // EBADF
            KernelError::NoDevice => -19,                                               // ENODEV
            KernelError::ReadOnly => -30,                                               // EROFS
            KernelError::NameTooLong => -36,                                            // ENAMETOOLONG
            KernelError::CrossDirectory => -18,                                         // EXDEV
            KernelError::TimedOut { .. } => -110,                                       // ETIMEDOUT
            KernelError::Unsupported { .. } => -38,                                     // ENOSYS
            KernelError::NotInitialized { .. } => -11,                                  // EAGAIN
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::InvalidArgument { what } => write!(f, "invalid argument: {}", what),
            KernelError::Unaligned { addr, align } => {
                write!(f, "address {:#x} not aligned to {:#x}", addr, align)
            }
            KernelError::OutOfFrames => write!(f, "out of physical frames"),
            KernelError::OutOfMemory { requested } => {
                write!(f, "out of memory ({} bytes requested)", requested)
            }
            KernelError::NoSpace => write!(f, "no free cluster"),
            KernelError::TableFull { table } => write!(f, "{} table full", table),
            KernelError::Io { device } => write!(f, "I/O error on {}", device),
            KernelError::Corrupted { what } => write!(f, "corrupted on-disk structure: {}", what),
            KernelError::AlreadyExists { what } => write!(f, "{} already exists", what),
            KernelError::NotFound => write!(f, "not found"),
            KernelError::NotADirectory => write!(f, "not a directory"),
            KernelError::IsADirectory => write!(f, "is a directory"),
            KernelError::NotEmpty => write!(f, "directory not empty"),
            KernelError::BadDescriptor { fd } => write!(f, "bad file descriptor {}", fd),
            KernelError::NoDevice => write!(f, "no such device"),
            KernelError::ReadOnly => write!(f, "read-only"),
            KernelError::NameTooLong => write!(f, "name too long"),
            KernelError::CrossDirectory => write!(f, "rename across directories"),
            KernelError::TimedOut { after_ms } => write!(f, "timed out after {} ms", after_ms),
            KernelError::Unsupported { operation } => write!(f, "unsupported: {}", operation),
            KernelError::NotInitialized { subsystem } => {
                write!(f, "{} not initialized", subsystem)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn errno_values_are_negative_and_stable() {
        assert_eq!(KernelError::InvalidArgument { what: "x" }.errno(), -22);
        assert_eq!(KernelError::OutOfFrames.errno(), -12);
        assert_eq!(KernelError::NoSpace.errno(), -28);
        assert_eq!(KernelError::Io { device: "vd0" }.errno(), -5);
        assert_eq!(KernelError::AlreadyExists { what: "entry" }.errno(), -17);
        assert_eq!(KernelError::NotFound.errno(), -2);
        assert_eq!(KernelError::NotADirectory.errno(), -20);
        assert_eq!(KernelError::TimedOut { after_ms: 10 }.errno(), -110);
    }
}
