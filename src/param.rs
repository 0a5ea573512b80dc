/// maximum number of CPUs
pub const NCPU: usize = 8;
/// maximum number of processes
pub const NPROC: usize = 64;
/// maximum number of threads per process
pub const NTHREAD: usize = 6;
/// open files per process
pub const NOFILE: usize = 16;
/// size of per-thread kernel stack
pub const KSTACK_SIZE: usize = 4096;
/// bytes per page
pub const PGSIZE: usize = 4096;
/// number of feedback queue levels
pub const MLFQ_K: usize = 5;
/// highest user-assignable priority
pub const MAX_PRIORITY: usize = 10;
/// ticks between two priority boosts
pub const BOOST_INTERVAL: usize = 100;
/// one beyond the highest user virtual address (sv39)
pub const MAXVA: usize = 1 << 38;

/// Rounds `size` up to a page boundary.
pub const fn pg_round_up(size: usize) -> usize {
    (size + PGSIZE - 1) & !(PGSIZE - 1)
}

/// return address of a thread's entry function; returning there exits the thread
pub const TRAMPOLINE: usize = MAXVA - PGSIZE;
