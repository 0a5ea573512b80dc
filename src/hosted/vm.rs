use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::vec::Vec;

use spin::Mutex;

use crate::param::{PGSIZE, pg_round_up};
use crate::proc::Slot;
use crate::vm::{Uvm, Vm, VmError};

/// Largest user space by default.
pub const DEFAULT_SPACE_LIMIT: usize = 256 * PGSIZE;

struct Space {
    /// Bytes the owning process asked for.
    size: usize,
    /// Backing pages, `pg_round_up(size)` long.
    bytes: Vec<u8>,
}

impl Space {
    fn range(&self, addr: usize, len: usize) -> Result<core::ops::Range<usize>, VmError> {
        match addr.checked_add(len) {
            Some(end) if end <= self.size => Ok(addr..end),
            _ => Err(VmError::BadAddress),
        }
    }
}

#[derive(Default)]
struct Spaces {
    next: usize,
    map: BTreeMap<usize, Space>,
}

/// User address spaces kept in host memory, one byte vector per space.
pub struct HostVm {
    spaces: Mutex<Spaces>,
    limit: usize,
    fail_copy: AtomicBool,
    activations: AtomicUsize,
}

impl Default for HostVm {
    fn default() -> Self {
        Self::new(DEFAULT_SPACE_LIMIT)
    }
}

impl HostVm {
    /// A VM whose spaces may grow to `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            spaces: Mutex::new(Spaces::default()),
            limit,
            fail_copy: AtomicBool::new(false),
            activations: AtomicUsize::new(0),
        }
    }

    /// Makes the next [`Vm::copy`] fail with `OutOfMemory`.
    pub fn fail_next_copy(&self) {
        self.fail_copy.store(true, Ordering::Release);
    }

    /// Spaces created and not yet freed.
    pub fn live_spaces(&self) -> usize {
        self.spaces.lock().map.len()
    }

    /// Times a space was installed on a CPU.
    pub fn activations(&self) -> usize {
        self.activations.load(Ordering::Relaxed)
    }

    fn with_space<R>(&self, uvm: &Uvm, f: impl FnOnce(&mut Space) -> R) -> R {
        let mut spaces = self.spaces.lock();
        let space = spaces
            .map
            .get_mut(&uvm.as_raw())
            .expect("use of a freed address space");
        f(space)
    }
}

impl Vm for HostVm {
    fn create(&self) -> Result<Uvm, VmError> {
        let mut spaces = self.spaces.lock();
        spaces.next += 1;
        let id = spaces.next;
        spaces.map.insert(
            id,
            Space {
                size: 0,
                bytes: Vec::new(),
            },
        );
        Ok(Uvm::from_raw(id))
    }

    fn map_initial(&self, uvm: &Uvm, image: &[u8]) -> Result<(), VmError> {
        assert!(image.len() <= PGSIZE, "map_initial: more than a page");
        self.with_space(uvm, |space| {
            space.bytes = vec![0; PGSIZE];
            space.bytes[..image.len()].copy_from_slice(image);
            space.size = PGSIZE;
        });
        Ok(())
    }

    fn alloc(&self, uvm: &Uvm, old: usize, new: usize) -> Result<usize, VmError> {
        if new < old {
            return Ok(old);
        }
        if new > self.limit {
            return Err(VmError::OutOfMemory);
        }

        self.with_space(uvm, |space| {
            space.bytes.resize(pg_round_up(new), 0);
            space.size = new;
        });
        Ok(new)
    }

    fn dealloc(&self, uvm: &Uvm, old: usize, new: usize) -> usize {
        if new >= old {
            return old;
        }

        self.with_space(uvm, |space| {
            space.bytes.truncate(pg_round_up(new));
            space.size = new;
        });
        new
    }

    fn copy(&self, uvm: &Uvm, size: usize) -> Result<Uvm, VmError> {
        if self.fail_copy.swap(false, Ordering::AcqRel) {
            return Err(VmError::OutOfMemory);
        }

        let bytes = self.with_space(uvm, |space| {
            let len = pg_round_up(size).min(space.bytes.len());
            space.bytes[..len].to_vec()
        });

        let mut spaces = self.spaces.lock();
        spaces.next += 1;
        let id = spaces.next;
        spaces.map.insert(id, Space { size, bytes });
        Ok(Uvm::from_raw(id))
    }

    fn free(&self, uvm: Uvm, _size: usize) {
        let freed = self.spaces.lock().map.remove(&uvm.as_raw());
        assert!(freed.is_some(), "free of an unknown address space");
    }

    fn activate(&self, uvm: &Uvm, _slot: Slot) {
        self.with_space(uvm, |_| ());
        self.activations.fetch_add(1, Ordering::Relaxed);
    }

    fn deactivate(&self) {}

    fn copy_out(&self, uvm: &Uvm, dst: usize, src: &[u8]) -> Result<(), VmError> {
        self.with_space(uvm, |space| {
            let range = space.range(dst, src.len())?;
            space.bytes[range].copy_from_slice(src);
            Ok(())
        })
    }

    fn copy_in(&self, uvm: &Uvm, src: usize, dst: &mut [u8]) -> Result<(), VmError> {
        self.with_space(uvm, |space| {
            let range = space.range(src, dst.len())?;
            dst.copy_from_slice(&space.bytes[range]);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_are_bounded_by_size() {
        let vm = HostVm::default();
        let uvm = vm.create().unwrap();
        vm.map_initial(&uvm, b"init").unwrap();

        let mut buf = [0u8; 4];
        vm.copy_in(&uvm, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"init");
        assert_eq!(
            vm.copy_out(&uvm, PGSIZE - 2, &[1, 2, 3]),
            Err(VmError::BadAddress)
        );

        let size = vm.alloc(&uvm, PGSIZE, PGSIZE + 10).unwrap();
        assert_eq!(size, PGSIZE + 10);
        vm.copy_out(&uvm, PGSIZE, &[7; 10]).unwrap();
        assert_eq!(vm.dealloc(&uvm, size, PGSIZE), PGSIZE);
        assert_eq!(vm.copy_in(&uvm, PGSIZE, &mut buf), Err(VmError::BadAddress));
    }

    #[test]
    fn copy_duplicates_and_can_be_made_to_fail() {
        let vm = HostVm::new(2 * PGSIZE);
        let uvm = vm.create().unwrap();
        vm.map_initial(&uvm, &[9; 8]).unwrap();
        assert_eq!(vm.alloc(&uvm, PGSIZE, 3 * PGSIZE), Err(VmError::OutOfMemory));

        let child = vm.copy(&uvm, PGSIZE).unwrap();
        vm.copy_out(&child, 0, &[1]).unwrap();
        let mut byte = [0u8; 1];
        vm.copy_in(&uvm, 0, &mut byte).unwrap();
        assert_eq!(byte, [9]);

        vm.fail_next_copy();
        assert_eq!(vm.copy(&uvm, PGSIZE), Err(VmError::OutOfMemory));
        assert!(vm.copy(&uvm, PGSIZE).is_ok());
        assert_eq!(vm.live_spaces(), 3);

        vm.free(child, PGSIZE);
        assert_eq!(vm.live_spaces(), 2);
    }
}
