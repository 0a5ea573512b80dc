//! Threads within a process: `thread_create`, `thread_exit`, `thread_join`.
//!
//! All threads of a process share its address space, descriptors and working directory. Each
//! has its own kernel stack, trap frame and a two-page user stack carved from the top of the
//! address space when it is created.

use crate::Kernel;
use crate::error::KernelError;
use crate::param::{PGSIZE, TRAMPOLINE, pg_round_up};
use crate::proc::{Channel, Remains, Slot, ThreadState, Tid};
use crate::sync::{wakeup_locked, wakeup2};

impl Kernel {
    /// Starts a thread in the current process at user address `entry` with `arg`.
    ///
    /// The new user stack holds `[TRAMPOLINE, arg]` at its top, so the entry function finds its
    /// argument above the return address and returning from it exits the thread.
    pub fn thread_create(&'static self, entry: usize, arg: usize) -> Result<Tid, KernelError> {
        let slot = self.current_slot();
        // # Safety: we are the current proc
        let data = unsafe { self.procs.data_mut(slot.proc) };
        let uvm = try_log!(data.pagetable());

        // two fresh pages at the top of the address space
        let old = data.size;
        let size = try_log!(self.vm.alloc(uvm, old, pg_round_up(old) + 2 * PGSIZE));

        let sp = size - 2 * size_of::<usize>();
        let mut frame = [0u8; 2 * size_of::<usize>()];
        frame[..size_of::<usize>()].copy_from_slice(&TRAMPOLINE.to_le_bytes());
        frame[size_of::<usize>()..].copy_from_slice(&arg.to_le_bytes());
        if let Err(e) = log_err!(self.vm.copy_out(uvm, sp, &frame)) {
            self.vm.dealloc(uvm, size, old);
            return Err(e.into());
        }

        let mut table = self.procs.lock();
        let index = match log_err!(self.alloc_thread(&mut table, slot.proc, None, None)) {
            Ok(index) => index,
            Err(e) => {
                drop(table);
                self.vm.dealloc(uvm, size, old);
                return Err(e);
            }
        };

        let caller = table.thread(slot).trapframe().expect("caller without trapframe");
        let thread = table.thread_mut(Slot {
            proc: slot.proc,
            thread: index,
        });
        let trapframe = thread.trapframe().expect("thread without trapframe");
        unsafe {
            (*trapframe).clone_from(&*caller);
            (*trapframe).epc = entry;
            (*trapframe).sp = sp;
            (*trapframe).a0 = arg;
        }
        thread.state = ThreadState::Runnable;
        let tid = thread.tid;
        data.size = size;

        log::debug!("thread_create: tid {} at {:#x}", *tid, entry);
        Ok(tid)
    }

    /// Exits the current thread with `retval` and does not return.
    ///
    /// The last live thread of a process leaves the whole process a zombie for its parent to
    /// reap.
    pub fn thread_exit(&'static self, retval: usize) -> ! {
        let slot = self.current_slot();
        let mut table = self.procs.lock();

        // a sibling might be sleeping in `thread_join`
        wakeup2(&mut table, Channel::Join(slot.proc));

        let thread = table.thread_mut(slot);
        thread.retval = retval;
        thread.state = ThreadState::Zombie;
        log::debug!("thread_exit: tid {} -> {}", *thread.tid, retval);

        let p = &table.procs[slot.proc];
        if p.live_threads() == 0 {
            assert!(!self.is_init(slot.proc), "init exiting");
            let parent = p.parent;
            table.reparent(slot.proc, self.init_slot());
            // parent might be sleeping in `wait`
            if let Some(parent) = parent {
                wakeup_locked(&mut table, Channel::Proc(parent), ThreadState::Sleeping);
            }
        }

        let _table = self.sched(table);
        unreachable!("zombie thread exit");
    }

    /// Waits for the sibling thread `tid` to exit and returns its value.
    pub fn thread_join(&self, tid: usize) -> Result<usize, KernelError> {
        let slot = self.current_slot();
        let mut table = self.procs.lock();

        if *table.thread(slot).tid == tid {
            err!(KernelError::Deadlock);
        }

        loop {
            let Some(index) = table.procs[slot.proc].find_thread(tid) else {
                err!(KernelError::NoThread);
            };

            let target = Slot {
                proc: slot.proc,
                thread: index,
            };
            if table.thread(target).state == ThreadState::Zombie {
                let retval = table.thread(target).retval;
                let mut remains = Remains::default();
                table.detach_thread(target, &mut remains);
                drop(table);

                self.release(remains);
                log::debug!("thread_join: tid {} -> {}", tid, retval);
                return Ok(retval);
            }

            if table.procs[slot.proc].killed {
                err!(KernelError::Killed);
            }

            // wait for a sibling to exit
            table = self.sleep2(table, Channel::Join(slot.proc));
        }
    }
}
