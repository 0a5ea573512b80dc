use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::arch;
use crate::cpu::{Cpu, CpuTable, InterruptLock};

/// A mutual exclusion primitive useful for protecting shared data.
/// It uses a spinlock to achieve mutual exclusion.
///
/// The holder is the CPU, not the thread: a thread may switch away while holding the lock and
/// the scheduler on that CPU then owns it.
pub struct SpinLock<T> {
    name: &'static str,
    cpus: &'static CpuTable,
    cpu: AtomicPtr<Cpu>,
    data: UnsafeCell<T>,
}

/// A guard that releases the lock when dropped.
pub struct SpinLockGuard<'a, T: 'a> {
    lock: &'a SpinLock<T>,
    _intr_lock: InterruptLock,
}

impl<T> SpinLock<T> {
    pub fn new(value: T, name: &'static str, cpus: &'static CpuTable) -> Self {
        SpinLock {
            name,
            cpus,
            cpu: AtomicPtr::new(ptr::null_mut()),
            data: UnsafeCell::new(value),
        }
    }

    /// Returns true if the current CPU is holding the lock.
    /// # Safety: must be called with interrupts disabled.
    unsafe fn holding_unchecked(&self) -> bool {
        self.cpu.load(Ordering::Relaxed) == unsafe { self.cpus.current_ptr() }
    }

    /// Returns true if the current CPU is holding the lock.
    pub fn holding(&self) -> bool {
        let _intr_lock = self.cpus.lock_current();
        unsafe { self.holding_unchecked() }
    }

    /// Acquires the mutex, blocking the current thread until it is able to do so.
    ///
    /// Returns a guard that releases the lock when dropped.
    ///
    /// Current thread's interrupts will be disabled while holding the lock.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let intr_lock = self.cpus.lock_current();

        // Safety: interrupts are disabled
        unsafe {
            assert!(!self.holding_unchecked(), "acquire spinlock {}", self.name);
        }

        loop {
            if self
                .cpu
                .compare_exchange(
                    ptr::null_mut(),
                    // Safety: interrupts are disabled
                    unsafe { self.cpus.current_ptr() },
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                break SpinLockGuard {
                    lock: self,
                    _intr_lock: intr_lock,
                };
            }

            arch::spin_hint()
        }
    }

    /// Releases the lock on the mutex.
    ///
    /// Interrupt lock held by the guard will also be released, restoring the previous interrupt
    /// state.
    pub fn unlock(guard: SpinLockGuard<'_, T>) -> &'_ SpinLock<T> {
        guard.lock
    }

    /// Unlocks the mutex without a guard and manually releases the `InterruptLock`.
    ///
    /// # Safety
    /// Used by a new thread's first return from the scheduler, which still holds the lock that
    /// the scheduler took.
    pub unsafe fn force_unlock(&self) {
        unsafe {
            assert!(self.holding_unchecked(), "force_unlock: not locked {}", self.name);
            self.cpu.store(ptr::null_mut(), Ordering::Release);
            // also release interrupt lock (decrement num_off)
            self.cpus.current().unlock();
        }
    }

    /// Returns a reference to the inner data from a shared reference to the mutex.
    ///
    /// # Safety
    /// The caller must ensure that the mutex is locked, or accept a racy read.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut_unchecked(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

impl<T> core::fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SpinLock")
            .field("name", &self.name)
            .field("locked", &!self.cpu.load(Ordering::Relaxed).is_null())
            .finish()
    }
}

/// Dropping the guard will release the lock on the mutex and also release the interrupt lock.
impl<'a, T: 'a> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        assert!(
            // Safety: mutex guard has an interrupt lock, it is safe to call holding
            unsafe { self.lock.holding_unchecked() },
            "release lock {}",
            self.lock.name
        );

        self.lock.cpu.store(ptr::null_mut(), Ordering::Release);
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

// Safety: Since the holder can reach the inner data, if we are sharing a reference, the inner
// type must also be thread safe to Send.
unsafe impl<T> Sync for SpinLock<T> where T: Send {}

// Safety: SpinLock can be sent to another thread if T can be sent.
unsafe impl<T> Send for SpinLock<T> where T: Send {}

// Safety: Since the holder can call `Deref`, if we are sharing a reference, the inner type must
// also be thread safe to Sync.
unsafe impl<T> Sync for SpinLockGuard<'_, T> where T: Sync {}
