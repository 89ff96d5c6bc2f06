//! Spinlock with plain and IRQ-save acquisition.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU32, Ordering},
};

use crate::arch;

/// A busy-waiting mutual-exclusion lock around a value.
///
/// The lock word is a single `u32`: 0 = free, 1 = held. Acquire uses a
/// compare-exchange with acquire ordering (compiled to LDAXR/STXR on ARM,
/// LOCK CMPXCHG on x86); release is a store with release ordering, so after
/// `lock(); drop(guard)` the word is observably zero.
pub struct SpinLock<T: ?Sized> {
    word: AtomicU32,
    value: UnsafeCell<T>,
}

// SAFETY: The lock word serializes all access to `value`, so sharing the
// lock between contexts is sound whenever the value itself can be sent.
unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
// SAFETY: Same reasoning; &SpinLock only hands out the value under the lock.
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            word: AtomicU32::new(0),
            value: UnsafeCell::new(value),
        }
    }

    /// Consume the lock, returning the inner value.
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    fn acquire(&self) {
        while self
            .word
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.word.load(Ordering::Relaxed) != 0 {
                core::hint::spin_loop();
            }
        }
    }

    fn release(&self) {
        self.word.store(0, Ordering::Release);
    }

    /// Acquire the lock, spinning until it is free.
    ///
    /// Must not be used from contexts that can race with an interrupt
    /// handler taking the same lock; use [`SpinLock::lock_irqsave`] there.
    pub fn lock(&self) -> SpinGuard<'_, T> {
        self.acquire();
        SpinGuard { lock: self }
    }

    /// Try to acquire without spinning.
    pub fn try_lock(&self) -> Option<SpinGuard<'_, T>> {
        if self
            .word
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinGuard { lock: self })
        } else {
            None
        }
    }

    /// Disable interrupts, then acquire. The returned guard restores the
    /// captured interrupt state on drop, so nesting is legal: an inner
    /// guard that saw IRQs already disabled restores "disabled".
    pub fn lock_irqsave(&self) -> IrqSpinGuard<'_, T> {
        let irq_state = arch::irq_save();
        self.acquire();
        IrqSpinGuard {
            lock: self,
            irq_state,
        }
    }

    /// Whether the lock word currently reads as held. Diagnostic only.
    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Relaxed) != 0
    }

    /// Access the value without locking.
    ///
    /// # Safety
    /// Caller must guarantee no concurrent access, e.g. during single-core
    /// early boot or inside the panic path with IRQs disabled.
    pub unsafe fn force_get_mut(&self) -> &mut T {
        // SAFETY: Exclusivity is the caller's obligation per the contract.
        unsafe { &mut *self.value.get() }
    }
}

/// Guard for a plain acquisition. Releases on drop.
pub struct SpinGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
}

impl<T: ?Sized> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The guard's existence proves the lock is held.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The guard's existence proves exclusive ownership.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T: ?Sized> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// Guard for an IRQ-save acquisition. Releases the lock, then restores the
/// interrupt state captured at acquisition.
pub struct IrqSpinGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    irq_state: arch::IrqState,
}

impl<T: ?Sized> Deref for IrqSpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The guard's existence proves the lock is held.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T: ?Sized> DerefMut for IrqSpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The guard's existence proves exclusive ownership.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T: ?Sized> Drop for IrqSpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release();
        arch::irq_restore(self.irq_state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn lock_word_zero_after_unlock() {
        let lock = SpinLock::new(0u32);
        {
            let mut g = lock.lock();
            *g += 1;
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());
        assert_eq!(*lock.lock(), 1);
    }

    #[test_case]
    fn try_lock_fails_while_held() {
        let lock = SpinLock::new(());
        let g = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(g);
        assert!(lock.try_lock().is_some());
    }

    #[test_case]
    fn irqsave_guards_nest() {
        let lock_a = SpinLock::new(1u32);
        let lock_b = SpinLock::new(2u32);
        let ga = lock_a.lock_irqsave();
        {
            let gb = lock_b.lock_irqsave();
            assert_eq!(*ga + *gb, 3);
        }
        assert!(!lock_b.is_locked());
        drop(ga);
        assert!(!lock_a.is_locked());
    }
}
