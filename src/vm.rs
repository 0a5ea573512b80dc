//! Contract of the virtual-memory layer.
//!
//! Page tables are owned and built by the VM layer. The process core only holds a [`Uvm`] handle
//! per process and asks the VM layer to create, grow, shrink, copy and free the space behind it.

use core::fmt::Display;

use crate::proc::Slot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    OutOfMemory,
    BadAddress,
}

impl Display for VmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            VmError::OutOfMemory => write!(f, "out of memory"),
            VmError::BadAddress => write!(f, "bad address"),
        }
    }
}

/// Handle to a user address space.
///
/// Not `Clone`: exactly one process owns a given space, and giving the handle back through
/// [`Vm::free`] ends it.
#[derive(Debug, PartialEq, Eq)]
pub struct Uvm(usize);

impl Uvm {
    /// Wraps a raw handle minted by a [`Vm`] implementation.
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub fn as_raw(&self) -> usize {
        self.0
    }
}

/// Operations consumed from the VM layer.
pub trait Vm: Sync {
    /// Creates an empty user address space.
    fn create(&self) -> Result<Uvm, VmError>;

    /// Loads the initial image into the first page of `uvm`.
    fn map_initial(&self, uvm: &Uvm, image: &[u8]) -> Result<(), VmError>;

    /// Grows the space from `old` to `new` bytes and returns the new size.
    fn alloc(&self, uvm: &Uvm, old: usize, new: usize) -> Result<usize, VmError>;

    /// Shrinks the space from `old` to `new` bytes and returns the new size.
    fn dealloc(&self, uvm: &Uvm, old: usize, new: usize) -> usize;

    /// Duplicates the first `size` bytes of `uvm` into a fresh space.
    fn copy(&self, uvm: &Uvm, size: usize) -> Result<Uvm, VmError>;

    /// Releases the space and all of its pages.
    fn free(&self, uvm: Uvm, size: usize);

    /// Installs `uvm` as the current CPU's user mapping before `slot` runs.
    fn activate(&self, uvm: &Uvm, slot: Slot);

    /// Switches the current CPU back to the kernel-only mapping.
    fn deactivate(&self);

    /// Copies `src` into user memory at `dst`.
    fn copy_out(&self, uvm: &Uvm, dst: usize, src: &[u8]) -> Result<(), VmError>;

    /// Copies user memory at `src` into `dst`.
    fn copy_in(&self, uvm: &Uvm, src: usize, dst: &mut [u8]) -> Result<(), VmError>;
}
