//! Write-once cell for global kernel state.

use core::sync::atomic::{AtomicPtr, Ordering};

/// A cell that can be written exactly once and read as `&'static` after.
///
/// no_std stand-in for `std::sync::OnceLock`; the kernel context and other
/// boot-published singletons live behind one of these.
pub struct OnceLock<T> {
    inner: AtomicPtr<T>,
}

impl<T> Default for OnceLock<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OnceLock<T> {
    pub const fn new() -> Self {
        Self {
            inner: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Get the value if initialized.
    pub fn get(&self) -> Option<&'static T> {
        let ptr = self.inner.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            // SAFETY: A non-null pointer was stored by `set()` from
            // `Box::into_raw`, so it refers to a live, fully-initialized T.
            // The Acquire load synchronizes-with the Release store in
            // `set()`. The allocation is leaked, giving it 'static life.
            Some(unsafe { &*ptr })
        }
    }

    /// Initialize the cell. Returns `Err(value)` if already initialized.
    pub fn set(&self, value: T) -> Result<(), T> {
        let ptr = alloc::boxed::Box::into_raw(alloc::boxed::Box::new(value));
        match self.inner.compare_exchange(
            core::ptr::null_mut(),
            ptr,
            Ordering::Release,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(_) => {
                // SAFETY: `ptr` came from Box::into_raw above and was never
                // published (the exchange failed), so reclaiming it here is
                // the unique owner freeing its own allocation.
                let boxed = unsafe { alloc::boxed::Box::from_raw(ptr) };
                Err(*boxed)
            }
        }
    }

    /// Get, initializing with `f` on first use.
    pub fn get_or_init<F>(&self, f: F) -> &'static T
    where
        F: FnOnce() -> T,
    {
        if let Some(val) = self.get() {
            return val;
        }
        let _ = self.set(f());
        self.get().expect("OnceLock empty after set")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn set_once_then_read() {
        static CELL: OnceLock<u32> = OnceLock::new();
        assert!(CELL.get().is_none());
        assert!(CELL.set(7).is_ok());
        assert_eq!(CELL.set(8), Err(8));
        assert_eq!(*CELL.get().unwrap(), 7);
        assert_eq!(*CELL.get_or_init(|| 9), 7);
    }
}
