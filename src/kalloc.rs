//! Kernel stack pool.
//!
//! Pages come from a buddy allocator over a fixed arena so that running out of kernel stacks is
//! an ordinary, recoverable allocation failure.

use core::ptr::{self, NonNull};

use alloc::boxed::Box;
use buddy_alloc::{BuddyAllocParam, buddy_alloc::BuddyAlloc};
use spin::Mutex;

use crate::error::KernelError;
use crate::param::{KSTACK_SIZE, PGSIZE};
use crate::proc::TrapFrame;

#[repr(C, align(4096))]
struct Page([u8; PGSIZE]);

struct Pool(BuddyAlloc);

// Safety: the allocator only hands out pointers into the arena owned by `Kmem`.
unsafe impl Send for Pool {}

pub struct Kmem {
    pool: Mutex<Pool>,
    arena: *mut Page,
    pages: usize,
}

unsafe impl Send for Kmem {}
unsafe impl Sync for Kmem {}

impl Kmem {
    /// Creates a pool over `pages` pages. `pages` must be a power of two.
    pub fn new(pages: usize) -> Self {
        assert!(pages.is_power_of_two() && pages >= 2, "kmem size {}", pages);

        let arena: Box<[Page]> = (0..pages).map(|_| Page([0; PGSIZE])).collect();
        let arena = Box::into_raw(arena) as *mut Page;

        let param = BuddyAllocParam::new(arena as *const u8, pages * PGSIZE, PGSIZE);
        let alloc = unsafe { BuddyAlloc::new(param) };

        log::debug!("kmem base {:#x}", arena as usize);
        log::debug!("kmem size {:#x}", alloc.available_bytes());

        Self {
            pool: Mutex::new(Pool(alloc)),
            arena,
            pages,
        }
    }

    /// Bytes left in the pool.
    pub fn available(&self) -> usize {
        self.pool.lock().0.available_bytes()
    }

    /// Allocates a zeroed kernel stack.
    pub fn alloc_kstack(&'static self) -> Result<KStack, KernelError> {
        let page = self.pool.lock().0.malloc(KSTACK_SIZE);
        let Some(base) = NonNull::new(page) else {
            err!(KernelError::Alloc);
        };

        unsafe { ptr::write_bytes(base.as_ptr(), 0, KSTACK_SIZE) };
        Ok(KStack { base, kmem: self })
    }

    fn free(&self, base: NonNull<u8>) {
        self.pool.lock().0.free(base.as_ptr())
    }
}

impl Drop for Kmem {
    fn drop(&mut self) {
        let arena = ptr::slice_from_raw_parts_mut(self.arena, self.pages);
        drop(unsafe { Box::from_raw(arena) });
    }
}

/// A thread's kernel stack. Its top holds the thread's saved user registers.
///
/// The page goes back to the pool when dropped.
pub struct KStack {
    base: NonNull<u8>,
    kmem: &'static Kmem,
}

// Safety: the page is owned exclusively by this handle.
unsafe impl Send for KStack {}

impl KStack {
    pub fn top(&self) -> usize {
        self.base.as_ptr() as usize + KSTACK_SIZE
    }

    /// The trap frame saved at the top of the stack.
    pub fn trapframe(&self) -> *mut TrapFrame {
        let offset = KSTACK_SIZE - size_of::<TrapFrame>();
        unsafe { self.base.as_ptr().add(offset) as *mut TrapFrame }
    }
}

impl core::fmt::Debug for KStack {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "KStack({:#x})", self.base.as_ptr() as usize)
    }
}

impl Drop for KStack {
    fn drop(&mut self) {
        self.kmem.free(self.base);
    }
}
