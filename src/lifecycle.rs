//! Process creation and teardown: `fork`, `exit`, `wait`, `kill`, and the per-process queries.

use alloc::string::String;

use crate::Kernel;
use crate::error::KernelError;
use crate::fs::{File, FsError, Operation};
use crate::param::{MAX_PRIORITY, NPROC, NTHREAD, PGSIZE};
use crate::proc::{Channel, Pid, Remains, Slot, TableInner, ThreadState};
use crate::spinlock::SpinLockGuard;
use crate::sync::wakeup_locked;

/// Rewrites a wait channel keyed on `from`'s slot to the same channel keyed on `to`'s slot.
fn remap(channel: Channel, from: usize, to: usize) -> Channel {
    match channel {
        Channel::Proc(p) if p == from => Channel::Proc(to),
        Channel::Join(p) if p == from => Channel::Join(to),
        other => other,
    }
}

impl Kernel {
    /// Sets up first user process.
    ///
    /// `entry` is the user program counter of its single thread and `image` the contents of its
    /// first page.
    pub fn user_init(&'static self, entry: usize, image: &[u8]) {
        let uvm = log_err!(self.vm.create()).expect("userinit: out of memory?");
        log_err!(self.vm.map_initial(&uvm, image)).expect("userinit: initial image");
        let cwd = log_err!(self.fs.namei("/")).expect("root path to exist");

        let mut table = self.procs.lock();
        let proc = log_err!(table.alloc_proc(self.alloc_pid(), None)).expect("userinit: no slot");
        let thread =
            log_err!(self.alloc_thread(&mut table, proc, None, None)).expect("userinit: no thread");
        self.init_proc.call_once(|| proc);

        // # Safety: during initialization, we are the only ones with access to this proc
        let data = unsafe { self.procs.data_mut(proc) };
        data.size = PGSIZE;
        data.pagetable = Some(uvm);
        data.cwd = Some(cwd);
        data.name = String::from("initcode");

        let slot = Slot { proc, thread };
        let trapframe = table.thread(slot).trapframe().expect("userinit: no trapframe");
        unsafe {
            (*trapframe).epc = entry; // user program counter
            (*trapframe).sp = PGSIZE; // user stack pointer
        }

        table.thread_mut(slot).state = ThreadState::Runnable;
        log::debug!("init is pid {}", *table.procs[proc].pid);
    }

    /// Table slot of the init process.
    pub(crate) fn init_slot(&self) -> usize {
        *self.init_proc.get().expect("no init process")
    }

    /// Returns true if `proc` is the init process.
    pub fn is_init(&self, proc: usize) -> bool {
        self.init_proc.get() == Some(&proc)
    }

    /// Grows or shrinks user memory by `n` bytes. Returns the new size.
    pub fn grow(&self, n: isize) -> Result<usize, KernelError> {
        let slot = self.current_slot();
        // # Safety: we are the current proc
        let data = unsafe { self.procs.data_mut(slot.proc) };
        let uvm = try_log!(data.pagetable());

        let mut size = data.size;
        if n > 0 {
            size = try_log!(self.vm.alloc(uvm, size, size + n as usize));
        } else if n < 0 {
            let shrink = n.unsigned_abs();
            if shrink > size {
                err!(KernelError::InvalidArgument);
            }
            size = self.vm.dealloc(uvm, size, size - shrink);
        }

        data.size = size;
        Ok(size)
    }

    /// Creates a new process, copying the caller's.
    ///
    /// Every thread of the caller is mirrored at the same index with the same tid, so a
    /// multi-threaded parent yields a multi-threaded child. Each copy resumes in user space with
    /// 0 in `a0`.
    pub fn fork(&'static self) -> Result<Pid, KernelError> {
        let slot = self.current_slot();
        let parent = slot.proc;

        // allocate the child and its threads
        let mut table = self.procs.lock();
        let pid = self.alloc_pid();
        let child = try_log!(table.alloc_proc(pid, Some(parent)));

        let mut plan: [Option<(ThreadState, Option<Channel>)>; NTHREAD] = [None; NTHREAD];
        for index in 0..NTHREAD {
            let source = &table.procs[parent].threads[index];
            if matches!(source.state, ThreadState::Unused | ThreadState::Embryo) {
                continue;
            }

            let state = match source.state {
                ThreadState::Running => ThreadState::Runnable,
                other => other,
            };
            let channel = source.channel.map(|c| remap(c, parent, child));
            let (tid, retval, from) = (source.tid, source.retval, source.trapframe());

            if let Err(e) = log_err!(self.alloc_thread(&mut table, child, Some(index), Some(tid))) {
                self.abort_fork(table, child);
                return Err(e);
            }

            let thread = table.thread_mut(Slot { proc: child, thread: index });
            thread.retval = retval;
            if let (Some(from), Some(to)) = (from, thread.trapframe()) {
                unsafe {
                    (*to).clone_from(&*from);
                    // cause fork to return 0 in the child
                    (*to).a0 = 0;
                }
            }
            plan[index] = Some((state, channel));
        }
        drop(table);

        // copy user memory from parent to child
        let data = self.procs.data(parent);
        let copied = data
            .pagetable()
            .and_then(|uvm| self.vm.copy(uvm, data.size).map_err(KernelError::from));
        let uvm = match log_err!(copied) {
            Ok(uvm) => uvm,
            Err(e) => {
                self.abort_fork(self.procs.lock(), child);
                return Err(e);
            }
        };

        // # Safety: none of the child's threads can run yet
        let child_data = unsafe { self.procs.data_mut(child) };
        child_data.pagetable = Some(uvm);
        child_data.size = data.size;

        // increment reference counts on open file descriptors
        for (fd, file) in data.open_files.iter().enumerate() {
            if let Some(file) = file {
                child_data.open_files[fd] = Some(self.fs.filedup(file));
            }
        }
        child_data.cwd = data.cwd.as_ref().map(|cwd| self.fs.idup(cwd));
        child_data.name = data.name.clone();

        // publish the child
        let mut table = self.procs.lock();
        for (index, plan) in plan.iter().enumerate() {
            if let Some((state, channel)) = *plan {
                let thread = table.thread_mut(Slot { proc: child, thread: index });
                thread.state = state;
                thread.channel = channel;
            }
        }

        log::debug!("fork: pid {} -> pid {}", *table.procs[parent].pid, *pid);
        Ok(pid)
    }

    /// Frees a child that fork could not finish.
    fn abort_fork(&self, mut table: SpinLockGuard<'_, TableInner>, child: usize) {
        let mut remains = Remains::default();
        table.detach_proc(child, &mut remains);
        // # Safety: none of the child's threads ever ran
        unsafe { self.procs.detach_data(child, &mut remains) };
        drop(table);

        self.release(remains);
    }

    /// Exits the current process and does not return.
    ///
    /// The first thread to exit tears the process down. Siblings that are not running become
    /// zombies right away; running ones follow at their next kill check. An exited process
    /// remains a zombie until its parent calls `wait`.
    pub fn exit(&'static self, status: isize) -> ! {
        let slot = self.current_slot();
        let proc = slot.proc;
        assert!(!self.is_init(proc), "init exiting");

        let first = {
            let mut table = self.procs.lock();
            let p = &mut table.procs[proc];
            let first = !p.exiting;
            if first {
                p.exiting = true;
                p.xstate = status;
            }
            first
        };

        if first {
            // # Safety: siblings that could touch these are on their way out
            let data = unsafe { self.procs.data_mut(proc) };

            // close all open files
            for file in data.open_files.iter_mut() {
                if let Some(file) = file.take() {
                    self.fs.fileclose(file);
                }
            }

            if let Some(cwd) = data.cwd.take() {
                let _op = Operation::begin(self.fs);
                self.fs.iput(cwd);
            }
        }

        let mut table = self.procs.lock();

        if first {
            // give any children to init
            table.reparent(proc, self.init_slot());

            let p = &mut table.procs[proc];
            p.killed = true;
            for (index, thread) in p.threads.iter_mut().enumerate() {
                let parked = !matches!(
                    thread.state,
                    ThreadState::Unused | ThreadState::Running | ThreadState::Zombie
                );
                if index != slot.thread && parked {
                    thread.state = ThreadState::Zombie;
                    thread.channel = None;
                }
            }
        }

        // parent might be sleeping in `wait`
        if let Some(parent) = table.procs[proc].parent {
            wakeup_locked(&mut table, Channel::Proc(parent), ThreadState::Sleeping);
        }

        table.thread_mut(slot).state = ThreadState::Zombie;
        log::debug!(
            "exit: pid {} tid {} status {}",
            *table.procs[proc].pid,
            *table.thread(slot).tid,
            status
        );

        let _table = self.sched(table);
        unreachable!("zombie exit");
    }

    /// Waits for a child process to exit and returns its pid.
    ///
    /// The child's exit status is copied to user address `addr` unless it is 0.
    pub fn wait(&self, addr: usize) -> Result<Pid, KernelError> {
        let slot = self.current_slot();
        let mut table = self.procs.lock();

        loop {
            let mut have_kids = false;

            // scan through table looking for exited children
            for child in 0..NPROC {
                let p = &table.procs[child];
                if p.is_free() || p.parent != Some(slot.proc) {
                    continue;
                }
                have_kids = true;

                // make sure no thread of the child is still running
                if !p.is_zombie() {
                    continue;
                }

                let (pid, xstate) = (p.pid, p.xstate);
                // a bad address leaves the child for the next wait
                if addr != 0 {
                    try_log!(self.copy_to_user(addr, &xstate.to_le_bytes()));
                }

                let mut remains = Remains::default();
                table.detach_proc(child, &mut remains);
                // # Safety: every thread of the child is a zombie
                unsafe { self.procs.detach_data(child, &mut remains) };
                drop(table);

                self.release(remains);

                log::debug!("wait: reaped pid {}", *pid);
                return Ok(pid);
            }

            // no point waiting if we don't have any children
            if !have_kids {
                err!(KernelError::NoChildren);
            }
            if table.procs[slot.proc].killed {
                err!(KernelError::Killed);
            }

            // wait for a child to exit
            table = self.sleep_locked(table, slot, Channel::Proc(slot.proc), ThreadState::Sleeping);
        }
    }

    /// Kills the process with the given pid.
    ///
    /// The victim won't exit until it tries to return to user space (see `usertrap()` in
    /// trap.rs).
    pub fn kill(&self, pid: usize) -> Result<(), KernelError> {
        let mut table = self.procs.lock();
        let Some(proc) = table.find_pid(pid) else {
            err!(KernelError::NoProcess);
        };

        let p = &mut table.procs[proc];
        p.killed = true;
        for thread in p.threads.iter_mut() {
            if matches!(
                thread.state,
                ThreadState::Sleeping | ThreadState::ThreadSleeping
            ) {
                // wake it up from `sleep()` or `sleep2()`
                thread.state = ThreadState::Runnable;
            }
        }

        log::debug!("kill: pid {}", pid);
        Ok(())
    }

    /// Sets the MLFQ priority of a child of the caller.
    pub fn set_priority(&self, pid: usize, priority: usize) -> Result<(), KernelError> {
        if priority > MAX_PRIORITY {
            err!(KernelError::InvalidArgument);
        }

        let caller = self.current_slot().proc;
        let mut table = self.procs.lock();
        let Some(proc) = table.find_pid(pid) else {
            err!(KernelError::NoProcess);
        };

        let p = &mut table.procs[proc];
        if p.parent != Some(caller) {
            err!(KernelError::NotPermitted);
        }
        p.priority = priority;
        Ok(())
    }

    /// Pid of the current process.
    pub fn pid(&self) -> Pid {
        let slot = self.current_slot();
        self.procs.lock().procs[slot.proc].pid
    }

    /// Pid of the current process's parent, 0 for init.
    pub fn parent_pid(&self) -> usize {
        let slot = self.current_slot();
        let table = self.procs.lock();
        table.procs[slot.proc]
            .parent
            .map_or(0, |parent| *table.procs[parent].pid)
    }

    /// Feedback queue level of the current process.
    pub fn level(&self) -> usize {
        let slot = self.current_slot();
        self.procs.lock().procs[slot.proc].qlevel
    }

    /// Installs `file` in the lowest free descriptor of the current process.
    ///
    /// The file is closed if the table is full.
    pub fn fdalloc(&self, file: File) -> Result<usize, KernelError> {
        let slot = self.current_slot();
        // # Safety: we are the current proc
        let data = unsafe { self.procs.data_mut(slot.proc) };

        match data.open_files.iter().position(Option::is_none) {
            Some(fd) => {
                data.open_files[fd] = Some(file);
                Ok(fd)
            }
            None => {
                self.fs.fileclose(file);
                err!(KernelError::Fs(FsError::OutOfFile))
            }
        }
    }

    /// Opens `path` into a new descriptor of the current process.
    pub fn open(&self, path: &str) -> Result<usize, KernelError> {
        let file = try_log!(self.fs.open(path));
        self.fdalloc(file)
    }

    /// Closes descriptor `fd` of the current process.
    pub fn close(&self, fd: usize) -> Result<(), KernelError> {
        let slot = self.current_slot();
        // # Safety: we are the current proc
        let data = unsafe { self.procs.data_mut(slot.proc) };

        let Some(file) = data.open_files.get_mut(fd).and_then(Option::take) else {
            err!(KernelError::InvalidArgument);
        };
        self.fs.fileclose(file);
        Ok(())
    }

    /// Copies from kernel to user space.
    pub fn copy_to_user(&self, dst: usize, src: &[u8]) -> Result<(), KernelError> {
        let slot = self.current_slot();
        let uvm = try_log!(self.procs.data(slot.proc).pagetable());
        log_err!(self.vm.copy_out(uvm, dst, src)).map_err(KernelError::from)
    }

    /// Copies from user to kernel space.
    pub fn copy_from_user(&self, src: usize, dst: &mut [u8]) -> Result<(), KernelError> {
        let slot = self.current_slot();
        let uvm = try_log!(self.procs.data(slot.proc).pagetable());
        log_err!(self.vm.copy_in(uvm, src, dst)).map_err(KernelError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remap_only_touches_channels_on_the_parent() {
        assert_eq!(remap(Channel::Proc(3), 3, 7), Channel::Proc(7));
        assert_eq!(remap(Channel::Join(3), 3, 7), Channel::Join(7));
        assert_eq!(remap(Channel::Proc(4), 3, 7), Channel::Proc(4));
        assert_eq!(remap(Channel::Ticks, 3, 7), Channel::Ticks);
    }
}
