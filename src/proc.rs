use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use crate::Kernel;
use crate::arch::Context;
use crate::cpu::CpuTable;
use crate::error::KernelError;
use crate::fs::{File, Inode, Operation};
use crate::kalloc::KStack;
use crate::param::{MLFQ_K, NOFILE, NPROC, NTHREAD};
use crate::spinlock::{SpinLock, SpinLockGuard};
use crate::sync::wakeup_locked;
use crate::vm::Uvm;

/// User registers saved on trap entry.
///
/// Sits at the top of each thread's kernel stack. `epc` is the user program counter, `a0` carries
/// the system call result back to user space.
#[derive(Debug, Clone, Default)]
#[repr(C)]
pub struct TrapFrame {
    /*   0 */ pub epc: usize, // saved user program counter
    /*   8 */ pub ra: usize,
    /*  16 */ pub sp: usize,
    /*  24 */ pub gp: usize,
    /*  32 */ pub tp: usize,
    /*  40 */ pub t0: usize,
    /*  48 */ pub t1: usize,
    /*  56 */ pub t2: usize,
    /*  64 */ pub s0: usize,
    /*  72 */ pub s1: usize,
    /*  80 */ pub a0: usize,
    /*  88 */ pub a1: usize,
    /*  96 */ pub a2: usize,
    /* 104 */ pub a3: usize,
    /* 112 */ pub a4: usize,
    /* 120 */ pub a5: usize,
    /* 128 */ pub a6: usize,
    /* 136 */ pub a7: usize,
    /* 144 */ pub s2: usize,
    /* 152 */ pub s3: usize,
    /* 160 */ pub s4: usize,
    /* 168 */ pub s5: usize,
    /* 176 */ pub s6: usize,
    /* 184 */ pub s7: usize,
    /* 192 */ pub s8: usize,
    /* 200 */ pub s9: usize,
    /* 208 */ pub s10: usize,
    /* 216 */ pub s11: usize,
    /* 224 */ pub t3: usize,
    /* 232 */ pub t4: usize,
    /* 240 */ pub t5: usize,
    /* 248 */ pub t6: usize,
}

/// Wrapper around usize to represent process IDs.
/// It must be created using `Pid::alloc()` to ensure uniqueness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Pid(usize);

impl Pid {
    /// Allocates a new PID by incrementing `counter`.
    pub(crate) fn alloc(counter: &AtomicUsize) -> Self {
        Pid(counter.fetch_add(1, Ordering::Relaxed))
    }
}

impl core::ops::Deref for Pid {
    type Target = usize;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Thread IDs, unique across the whole system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Tid(usize);

impl Tid {
    pub(crate) fn alloc(counter: &AtomicUsize) -> Self {
        Tid(counter.fetch_add(1, Ordering::Relaxed))
    }
}

impl core::ops::Deref for Tid {
    type Target = usize;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Position of a thread in the process table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot {
    pub proc: usize,
    pub thread: usize,
}

/// Channel type for `sleep`/`wakeup`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// `wait()` of the process in this table slot.
    Proc(usize),
    /// `thread_join()` inside the process in this table slot.
    Join(usize),
    /// System ticks
    Ticks,
}

/// The state of a thread.
///
/// `Sleeping` and `ThreadSleeping` are separate wakeup classes: `wakeup` only wakes the former,
/// `wakeup2` only the latter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadState {
    #[default]
    Unused,
    Embryo,
    Sleeping,
    ThreadSleeping,
    Runnable,
    Running,
    Zombie,
}

/// Thread control block
///
/// Table lock must be held when accessing these.
#[derive(Debug, Default)]
pub struct Thread {
    pub state: ThreadState,
    pub tid: Tid,
    /// If Some, sleeping on chan
    pub channel: Option<Channel>,
    /// Value handed to `thread_join()`
    pub retval: usize,
    pub kstack: Option<KStack>,
    /// swtch() here to run the thread
    pub context: Context,
}

impl Thread {
    fn new() -> Self {
        Self::default()
    }

    /// Returns the saved user registers of this thread.
    pub fn trapframe(&self) -> Option<*mut TrapFrame> {
        self.kstack.as_ref().map(KStack::trapframe)
    }

    pub fn is_live(&self) -> bool {
        !matches!(self.state, ThreadState::Unused | ThreadState::Zombie)
    }
}

/// Public fields for a process
///
/// Table lock must be held when accessing these.
#[derive(Debug)]
pub struct ProcInner {
    /// Process ID
    pub pid: Pid,
    /// Table slot of the parent process
    pub parent: Option<usize>,
    /// If true, have been killed
    pub killed: bool,
    /// If true, a thread has started tearing the process down
    pub exiting: bool,
    /// Exit status to be returned to parent's wait
    pub xstate: isize,
    /// Allocated thread slots, zombies included
    pub threadcnt: usize,
    /// Feedback queue level
    pub qlevel: usize,
    /// Ticks used at the current level
    pub usedtq: usize,
    /// Selection priority within a level, 0..=10
    pub priority: usize,
    pub threads: [Thread; NTHREAD],
}

impl ProcInner {
    fn new() -> Self {
        Self {
            pid: Pid(0),
            parent: None,
            killed: false,
            exiting: false,
            xstate: 0,
            threadcnt: 0,
            qlevel: 0,
            usedtq: 0,
            priority: 0,
            threads: core::array::from_fn(|_| Thread::new()),
        }
    }

    /// True if this table slot holds no process.
    pub fn is_free(&self) -> bool {
        self.threadcnt == 0
    }

    /// True if every allocated thread has terminated.
    pub fn is_zombie(&self) -> bool {
        self.threadcnt != 0 && self.threads.iter().all(|t| !t.is_live())
    }

    pub fn live_threads(&self) -> usize {
        self.threads.iter().filter(|t| t.is_live()).count()
    }

    /// Index of the thread with `tid`, zombies included.
    pub fn find_thread(&self, tid: usize) -> Option<usize> {
        self.threads
            .iter()
            .position(|t| t.state != ThreadState::Unused && *t.tid == tid)
    }
}

/// Private fields for a process
///
/// Shared by all threads of the process. Only touched by the process itself, or by whoever
/// allocates or reaps it while none of its threads can run.
#[derive(Debug)]
pub struct ProcData {
    /// Size of process memory (bytes)
    pub size: usize,
    /// User page table
    pub pagetable: Option<Uvm>,
    /// Open files
    pub open_files: [Option<File>; NOFILE],
    /// Current directory
    pub cwd: Option<Inode>,
    /// Process name
    pub name: String,
}

impl ProcData {
    const fn new() -> Self {
        Self {
            size: 0,
            pagetable: None,
            open_files: [const { None }; NOFILE],
            cwd: None,
            name: String::new(),
        }
    }

    /// Returns a reference to the user page table.
    pub fn pagetable(&self) -> Result<&Uvm, KernelError> {
        match self.pagetable.as_ref() {
            Some(uvm) => Ok(uvm),
            None => err!(KernelError::InvalidArgument),
        }
    }

    /// Moves every resource out into `remains`.
    fn detach(&mut self, remains: &mut Remains) {
        if let Some(uvm) = self.pagetable.take() {
            remains.pagetable = Some((uvm, self.size));
        }
        remains
            .files
            .extend(self.open_files.iter_mut().filter_map(Option::take));
        remains.cwd = self.cwd.take();
        self.size = 0;
        self.name.clear();
    }
}

/// Everything a reaped thread or process leaves behind.
///
/// Collected under the table lock and released after it is dropped, since releasing may call
/// into the VM and storage layers.
#[derive(Debug, Default)]
pub struct Remains {
    pub kstacks: Vec<KStack>,
    pub contexts: Vec<Context>,
    pub pagetable: Option<(Uvm, usize)>,
    pub files: Vec<File>,
    pub cwd: Option<Inode>,
}

/// Lock-protected part of the process table.
#[derive(Debug)]
pub struct TableInner {
    pub procs: [ProcInner; NPROC],
    /// Thread holding each feedback queue level
    pub incumbents: [Option<Slot>; MLFQ_K],
}

impl Default for TableInner {
    fn default() -> Self {
        Self::new()
    }
}

impl TableInner {
    pub fn new() -> Self {
        Self {
            procs: core::array::from_fn(|_| ProcInner::new()),
            incumbents: [None; MLFQ_K],
        }
    }

    pub fn thread(&self, slot: Slot) -> &Thread {
        &self.procs[slot.proc].threads[slot.thread]
    }

    pub fn thread_mut(&mut self, slot: Slot) -> &mut Thread {
        &mut self.procs[slot.proc].threads[slot.thread]
    }

    /// Table slot of the live process with `pid`.
    pub fn find_pid(&self, pid: usize) -> Option<usize> {
        if pid == 0 {
            return None;
        }
        self.procs
            .iter()
            .position(|p| !p.is_free() && *p.pid == pid)
    }

    /// Claims a free table slot for a new process.
    ///
    /// The slot counts as free until its first thread is allocated, which must happen before the
    /// table lock is released.
    pub fn alloc_proc(&mut self, pid: Pid, parent: Option<usize>) -> Result<usize, KernelError> {
        let Some(index) = self.procs.iter().position(ProcInner::is_free) else {
            err!(KernelError::OutOfProc);
        };

        let p = &mut self.procs[index];
        p.pid = pid;
        p.parent = parent;
        p.killed = false;
        p.exiting = false;
        p.xstate = 0;
        p.qlevel = 0;
        p.usedtq = 0;
        p.priority = 0;
        Ok(index)
    }

    /// Passes the children of `proc` to `init`, waking init if one of them is already a zombie.
    pub fn reparent(&mut self, proc: usize, init: usize) {
        let mut zombie = false;
        for p in self.procs.iter_mut() {
            if !p.is_free() && p.parent == Some(proc) {
                p.parent = Some(init);
                zombie |= p.is_zombie();
            }
        }
        if zombie {
            wakeup_locked(self, Channel::Proc(init), ThreadState::Sleeping);
        }
    }

    /// Frees a thread slot, moving its stack and context into `remains`.
    pub fn detach_thread(&mut self, slot: Slot, remains: &mut Remains) {
        let p = &mut self.procs[slot.proc];
        let thread = &mut p.threads[slot.thread];
        if thread.state == ThreadState::Unused {
            return;
        }

        remains.kstacks.extend(thread.kstack.take());
        remains.contexts.push(core::mem::take(&mut thread.context));
        thread.state = ThreadState::Unused;
        thread.tid = Tid(0);
        thread.channel = None;
        thread.retval = 0;
        p.threadcnt -= 1;

        for incumbent in self.incumbents.iter_mut() {
            if *incumbent == Some(slot) {
                *incumbent = None;
            }
        }
    }

    /// Frees every thread of process `proc` and returns the slot to the free pool.
    pub fn detach_proc(&mut self, proc: usize, remains: &mut Remains) {
        for thread in 0..NTHREAD {
            self.detach_thread(Slot { proc, thread }, remains);
        }

        let p = &mut self.procs[proc];
        p.pid = Pid(0);
        p.parent = None;
        p.killed = false;
        p.exiting = false;
        p.xstate = 0;
        p.qlevel = 0;
        p.usedtq = 0;
        p.priority = 0;
    }
}

/// Table of processes
pub struct ProcTable {
    pub(crate) inner: SpinLock<TableInner>,
    data: [UnsafeCell<ProcData>; NPROC],
}

impl ProcTable {
    pub fn new(cpus: &'static CpuTable) -> Self {
        Self {
            inner: SpinLock::new(TableInner::new(), "ptable", cpus),
            data: [const { UnsafeCell::new(ProcData::new()) }; NPROC],
        }
    }

    pub fn lock(&self) -> SpinLockGuard<'_, TableInner> {
        self.inner.lock()
    }

    pub fn data(&self, index: usize) -> &ProcData {
        unsafe { &*self.data[index].get() }
    }

    /// Returns a mutable reference to the process's data.
    ///
    /// # Safety
    /// The caller must ensure they have exclusive access to the process. This is true if either
    ///     1. it's a thread of the process, and no sibling is changing the same fields, or
    ///     2. none of the process's threads can run (allocation, fork, reaping).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data_mut(&self, index: usize) -> &mut ProcData {
        unsafe { &mut *self.data[index].get() }
    }

    /// Moves the resources of process `proc` into `remains`.
    ///
    /// # Safety
    /// Same as [`ProcTable::data_mut`].
    pub unsafe fn detach_data(&self, proc: usize, remains: &mut Remains) {
        unsafe { self.data_mut(proc) }.detach(remains);
    }
}

unsafe impl Sync for ProcTable {}

impl Kernel {
    pub(crate) fn alloc_pid(&self) -> Pid {
        Pid::alloc(&self.next_pid)
    }

    /// Returns this CPU's thread.
    /// It unwraps the option and panics if there is no current thread.
    pub fn current_slot(&self) -> Slot {
        self.cpus.current_slot().expect("no current thread")
    }

    /// Returns the user registers of the current thread.
    pub fn trapframe(&self) -> *mut TrapFrame {
        let slot = self.current_slot();
        let table = self.procs.lock();
        table
            .thread(slot)
            .trapframe()
            .expect("thread without a kernel stack")
    }

    /// Returns true if process `proc` has been killed.
    ///
    /// Acquires and releases the table lock.
    pub fn is_killed(&self, proc: usize) -> bool {
        let table = self.procs.lock();
        table.procs[proc].killed
    }

    /// Allocates a thread in process `proc` with a fresh kernel stack and a context that starts
    /// at `fork_ret`. The thread is left in `Embryo`.
    ///
    /// `index` pins the thread slot and `tid` reuses an id; both are chosen here otherwise.
    pub(crate) fn alloc_thread(
        &'static self,
        table: &mut TableInner,
        proc: usize,
        index: Option<usize>,
        tid: Option<Tid>,
    ) -> Result<usize, KernelError> {
        let p = &mut table.procs[proc];
        let index = match index {
            Some(i) if p.threads[i].state == ThreadState::Unused => i,
            Some(_) => err!(KernelError::OutOfThread),
            None => match p.threads.iter().position(|t| t.state == ThreadState::Unused) {
                Some(i) => i,
                None => err!(KernelError::OutOfThread),
            },
        };
        let tid = tid.unwrap_or_else(|| Tid::alloc(&self.next_tid));

        let kstack = try_log!(self.kmem.alloc_kstack());
        let entry: Box<dyn FnOnce() + Send> = Box::new(move || {
            self.fork_ret();
        });
        let context = try_log!(Context::spawn(format!("pid{}-tid{}", *p.pid, *tid), entry));

        let thread = &mut p.threads[index];
        thread.state = ThreadState::Embryo;
        thread.tid = tid;
        thread.channel = None;
        thread.retval = 0;
        thread.kstack = Some(kstack);
        thread.context = context;
        p.threadcnt += 1;

        Ok(index)
    }

    /// Gives back what reaping collected. Must be called without the table lock.
    pub(crate) fn release(&self, remains: Remains) {
        let Remains {
            kstacks,
            contexts,
            pagetable,
            files,
            cwd,
        } = remains;

        for mut context in contexts {
            context.retire();
        }
        drop(kstacks);

        for file in files {
            self.fs.fileclose(file);
        }

        if let Some(cwd) = cwd {
            let _op = Operation::begin(self.fs);
            self.fs.iput(cwd);
        }

        if let Some((uvm, size)) = pagetable {
            self.vm.free(uvm, size);
        }
    }

    /// Logs a process listing.
    ///
    /// # Safety
    /// For debugging only, it does not lock to avoid creating more problems.
    pub unsafe fn procdump(&self) {
        let table = unsafe { self.procs.inner.get_mut_unchecked() };

        for (index, p) in table.procs.iter().enumerate() {
            if p.is_free() {
                continue;
            }

            let name = &self.procs.data(index).name;
            for thread in p.threads.iter() {
                if thread.state == ThreadState::Unused {
                    continue;
                }
                log::info!(
                    "{} {} {:?} {} level {}",
                    *p.pid,
                    *thread.tid,
                    thread.state,
                    name,
                    p.qlevel
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_stay_free_until_a_thread_lands() {
        let mut table = TableInner::new();
        let counter = AtomicUsize::new(1);

        let first = table.alloc_proc(Pid::alloc(&counter), None).unwrap();
        assert!(table.procs[first].is_free());
        assert_eq!(table.find_pid(1), None);

        table.procs[first].threads[0].state = ThreadState::Runnable;
        table.procs[first].threadcnt = 1;
        assert_eq!(table.find_pid(1), Some(first));
        assert_eq!(table.find_pid(0), None);

        let second = table.alloc_proc(Pid::alloc(&counter), Some(first)).unwrap();
        assert_ne!(first, second);
        assert_eq!(table.procs[second].parent, Some(first));
    }

    #[test]
    fn zombie_means_no_live_thread_left() {
        let mut table = TableInner::new();
        let p = &mut table.procs[3];
        assert!(!p.is_zombie());

        p.threadcnt = 2;
        p.threads[0].state = ThreadState::Zombie;
        p.threads[4].state = ThreadState::Sleeping;
        assert!(!p.is_zombie());
        assert_eq!(p.live_threads(), 1);

        p.threads[4].state = ThreadState::Zombie;
        assert!(p.is_zombie());
    }

    #[test]
    fn detaching_a_process_clears_its_bookkeeping() {
        let mut table = TableInner::new();
        let proc = table.alloc_proc(Pid(9), Some(0)).unwrap();
        for thread in [0, 2] {
            let t = &mut table.procs[proc].threads[thread];
            t.state = ThreadState::Zombie;
            t.tid = Tid(thread + 1);
            t.retval = 5;
        }
        table.procs[proc].threadcnt = 2;
        table.procs[proc].qlevel = 3;
        table.incumbents[3] = Some(Slot { proc, thread: 2 });

        let mut remains = Remains::default();
        table.detach_proc(proc, &mut remains);

        let p = &table.procs[proc];
        assert!(p.is_free());
        assert_eq!(*p.pid, 0);
        assert_eq!(p.parent, None);
        assert_eq!(p.qlevel, 0);
        assert!(p.threads.iter().all(|t| t.state == ThreadState::Unused));
        assert_eq!(table.incumbents[3], None);
        assert_eq!(remains.contexts.len(), 2);
        assert!(remains.kstacks.is_empty());
    }

    #[test]
    fn reparenting_hands_children_to_init() {
        let mut table = TableInner::new();
        for (proc, state) in [(1, ThreadState::Runnable), (2, ThreadState::Zombie)] {
            let p = &mut table.procs[proc];
            p.parent = Some(3);
            p.threadcnt = 1;
            p.threads[0].state = state;
        }
        table.procs[4].parent = Some(5);
        table.procs[4].threadcnt = 1;
        table.procs[4].threads[0].state = ThreadState::Runnable;

        let waiter = &mut table.procs[0].threads[0];
        waiter.state = ThreadState::Sleeping;
        waiter.channel = Some(Channel::Proc(0));

        table.reparent(3, 0);
        assert_eq!(table.procs[1].parent, Some(0));
        assert_eq!(table.procs[2].parent, Some(0));
        assert_eq!(table.procs[4].parent, Some(5));
        // a zombie among them wakes init up
        assert_eq!(table.procs[0].threads[0].state, ThreadState::Runnable);
    }

    #[test]
    fn reparenting_live_children_lets_init_sleep() {
        let mut table = TableInner::new();
        table.procs[1].parent = Some(3);
        table.procs[1].threadcnt = 1;
        table.procs[1].threads[0].state = ThreadState::Sleeping;

        let waiter = &mut table.procs[0].threads[0];
        waiter.state = ThreadState::Sleeping;
        waiter.channel = Some(Channel::Proc(0));

        table.reparent(3, 0);
        assert_eq!(table.procs[1].parent, Some(0));
        assert_eq!(table.procs[0].threads[0].state, ThreadState::Sleeping);
    }

    #[test]
    fn table_full_is_out_of_proc() {
        let mut table = TableInner::new();
        for p in table.procs.iter_mut() {
            p.threadcnt = 1;
        }
        assert_eq!(
            table.alloc_proc(Pid(1), None),
            Err(KernelError::OutOfProc)
        );
    }
}
