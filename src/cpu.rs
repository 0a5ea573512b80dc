use core::cell::UnsafeCell;

use crate::arch::{self, Context};
use crate::param::NCPU;
use crate::proc::Slot;

/// Per-CPU state
#[derive(Debug)]
pub struct Cpu {
    /// Thread running on this CPU, if any.
    pub current: Option<Slot>,
    /// `swtch()` here to enter the scheduler.
    pub context: Context,
    /// Depth of interrupt-disable nesting.
    pub num_off: isize,
    /// Were interrupts enabled before the outermost disable?
    pub interrupts_enabled: bool,
}

impl Cpu {
    const fn new() -> Self {
        Self {
            current: None,
            context: Context::new(),
            num_off: 0,
            interrupts_enabled: false,
        }
    }

    /// Locks this CPU by disabling interrupts.
    fn lock(&mut self, old_state: bool, cpus: &'static CpuTable) -> InterruptLock {
        if self.num_off == 0 {
            self.interrupts_enabled = old_state;
        }
        self.num_off += 1;
        InterruptLock { cpus }
    }

    /// Unlocks this CPU by enabling interrupts if appropriate.
    pub fn unlock(&mut self) {
        assert!(!arch::intr_get(), "cpu unlock - interruptible");
        assert!(self.num_off >= 1, "cpu unlock");

        self.num_off -= 1;
        if self.num_off == 0 && self.interrupts_enabled {
            arch::intr_on();
        }
    }
}

/// Table of CPUs
pub struct CpuTable {
    cpus: [UnsafeCell<Cpu>; NCPU],
    count: usize,
}

impl CpuTable {
    pub fn new(count: usize) -> Self {
        assert!((1..=NCPU).contains(&count), "cpu count {}", count);
        Self {
            cpus: core::array::from_fn(|_| UnsafeCell::new(Cpu::new())),
            count,
        }
    }

    /// Number of CPUs brought up.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Returns a raw pointer to the current CPU's [`Cpu`] struct.
    ///
    /// # Safety
    /// Must be called with interrupts disabled to prevent the caller being moved to a different CPU.
    pub unsafe fn current_ptr(&self) -> *mut Cpu {
        self.cpus[arch::cpu_id()].get()
    }

    /// Returns the current CPU's [`Cpu`] struct.
    ///
    /// # Safety
    /// Must be called with interrupts disabled to prevent the caller being moved to a different CPU.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn current(&self) -> &mut Cpu {
        assert!(!arch::intr_get(), "mycpu interrupts enabled");
        unsafe { &mut *self.current_ptr() }
    }

    /// Locks this CPU by disabling interrupts.
    /// Returns an [`InterruptLock`] as the ownership and lifetime of the lock.
    pub fn lock_current(&'static self) -> InterruptLock {
        let old_state = arch::intr_get();
        arch::intr_off();

        unsafe { self.current().lock(old_state, self) }
    }

    /// Thread running on the current CPU.
    pub fn current_slot(&'static self) -> Option<Slot> {
        let _lock = self.lock_current();
        unsafe { self.current() }.current
    }
}

unsafe impl Sync for CpuTable {}

/// A lock that releases the CPU lock when dropped.
#[derive(Debug)]
pub struct InterruptLock {
    cpus: &'static CpuTable,
}

impl core::fmt::Debug for CpuTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CpuTable").field("count", &self.count).finish()
    }
}

impl Drop for InterruptLock {
    fn drop(&mut self) {
        // # Safety: we are still holding the CPU lock
        unsafe { self.cpus.current().unlock() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Board;

    fn table() -> &'static CpuTable {
        alloc::boxed::Box::leak(alloc::boxed::Box::new(CpuTable::new(1)))
    }

    #[test]
    fn nested_locks_restore_interrupts_once() {
        let cpus = table();
        arch::bind(0, Board::new());
        arch::intr_on();

        let outer = cpus.lock_current();
        let inner = cpus.lock_current();
        assert!(!arch::intr_get());
        assert_eq!(unsafe { cpus.current() }.num_off, 2);

        drop(inner);
        assert!(!arch::intr_get());
        drop(outer);
        assert!(arch::intr_get());
    }

    #[test]
    fn disabled_interrupts_stay_disabled() {
        let cpus = table();
        arch::bind(0, Board::new());
        arch::intr_off();
        drop(cpus.lock_current());
        assert!(!arch::intr_get());
        assert_eq!(cpus.current_slot(), None);
    }
}
