//! User mode of the hosted machine.
//!
//! A user program is a plain function. Its address is the thread's user program counter, and it
//! talks to the kernel only through [`User`], whose methods load the argument registers and trap
//! the way `ecall` does.

use crate::Kernel;
use crate::arch;
use crate::param::TRAMPOLINE;
use crate::syscall::{SysError, Syscall};
use crate::trap::Trap;

/// Entry point of a user program or thread. Gets its argument and returns its exit value.
pub type UserFn = fn(&User, usize) -> usize;

const WORD: usize = size_of::<usize>();

/// The user side of one thread.
pub struct User {
    kernel: &'static Kernel,
}

/// Starts the current thread in user mode at its saved program counter.
///
/// A thread stack that holds [`TRAMPOLINE`] as its return address belongs to a thread made by
/// `thread_create`; returning from its function exits the thread. Returning from anything else
/// exits the process.
pub(crate) fn enter(kernel: &'static Kernel) -> ! {
    // # Safety: the trap frame belongs to the current thread
    let (epc, sp, a0) = unsafe {
        let tf = &*kernel.trapframe();
        (tf.epc, tf.sp, tf.a0)
    };
    assert_ne!(epc, 0, "user entry at 0");
    // # Safety: user program counters are only ever set from `UserFn`s
    let entry = unsafe { core::mem::transmute::<usize, UserFn>(epc) };

    let user = User { kernel };
    let mut frame = [0u8; 2 * WORD];
    let thread_arg = match kernel.copy_from_user(sp, &mut frame) {
        Ok(()) if word(&frame, 0) == TRAMPOLINE => Some(word(&frame, 1)),
        _ => None,
    };

    match thread_arg {
        Some(arg) => {
            let retval = entry(&user, arg);
            user.thread_exit(retval)
        }
        None => {
            let status = entry(&user, a0);
            user.exit(status as isize)
        }
    }
}

fn word(bytes: &[u8], index: usize) -> usize {
    let mut raw = [0u8; WORD];
    raw.copy_from_slice(&bytes[index * WORD..(index + 1) * WORD]);
    usize::from_le_bytes(raw)
}

impl User {
    /// Traps into the kernel with system call `num`.
    fn ecall(&self, num: Syscall, args: &[usize]) -> Result<usize, SysError> {
        let mut regs = [0usize; 6];
        regs[..args.len()].copy_from_slice(args);

        let tf = self.kernel.trapframe();
        unsafe {
            (*tf).a0 = regs[0];
            (*tf).a1 = regs[1];
            (*tf).a2 = regs[2];
            (*tf).a3 = regs[3];
            (*tf).a4 = regs[4];
            (*tf).a5 = regs[5];
            (*tf).a7 = num as usize;
        }

        self.kernel.usertrap(Trap::Syscall);
        SysError::decode(unsafe { (*self.kernel.trapframe()).a0 })
    }

    /// A word of user memory just below the stack pointer, for system call out-parameters.
    fn scratch(&self) -> usize {
        unsafe { (*self.kernel.trapframe()).sp - WORD }
    }

    /// Reads the word at user address `addr`.
    pub fn load(&self, addr: usize) -> Result<usize, SysError> {
        let mut raw = [0u8; WORD];
        self.kernel.copy_from_user(addr, &mut raw)?;
        Ok(usize::from_le_bytes(raw))
    }

    /// Writes `value` to the word at user address `addr`.
    pub fn store(&self, addr: usize, value: usize) -> Result<(), SysError> {
        Ok(self.kernel.copy_to_user(addr, &value.to_le_bytes())?)
    }

    /// Forks; the child copy of this thread starts over in `child`.
    pub fn fork(&self, child: UserFn) -> Result<usize, SysError> {
        let tf = self.kernel.trapframe();
        let epc = unsafe { core::mem::replace(&mut (*tf).epc, child as usize) };
        let result = self.ecall(Syscall::Fork, &[]);
        unsafe { (*self.kernel.trapframe()).epc = epc };
        result
    }

    pub fn exit(&self, status: isize) -> ! {
        let _ = self.ecall(Syscall::Exit, &[status as usize]);
        unreachable!("exit returned");
    }

    /// Waits for a child and returns its pid.
    pub fn wait(&self) -> Result<usize, SysError> {
        self.ecall(Syscall::Wait, &[0])
    }

    /// Waits for a child and returns its pid and exit status.
    pub fn wait_status(&self) -> Result<(usize, isize), SysError> {
        let addr = self.scratch();
        let pid = self.wait_at(addr)?;
        Ok((pid, self.load(addr)? as isize))
    }

    /// Waits for a child, storing its exit status at user address `addr`.
    pub fn wait_at(&self, addr: usize) -> Result<usize, SysError> {
        self.ecall(Syscall::Wait, &[addr])
    }

    pub fn kill(&self, pid: usize) -> Result<(), SysError> {
        self.ecall(Syscall::Kill, &[pid]).map(|_| ())
    }

    pub fn getpid(&self) -> usize {
        self.ecall(Syscall::Getpid, &[]).unwrap_or(0)
    }

    pub fn getppid(&self) -> usize {
        self.ecall(Syscall::Getppid, &[]).unwrap_or(0)
    }

    pub fn yield_now(&self) {
        let _ = self.ecall(Syscall::Yield, &[]);
    }

    /// Current feedback queue level.
    pub fn getlev(&self) -> usize {
        self.ecall(Syscall::Getlev, &[]).unwrap_or(0)
    }

    pub fn setpriority(&self, pid: usize, priority: isize) -> Result<(), SysError> {
        self.ecall(Syscall::SetPriority, &[pid, priority as usize])
            .map(|_| ())
    }

    /// Grows memory by `n` bytes and returns the old size.
    pub fn sbrk(&self, n: isize) -> Result<usize, SysError> {
        self.ecall(Syscall::Sbrk, &[n as usize])
    }

    pub fn sleep(&self, ticks: usize) -> Result<(), SysError> {
        self.ecall(Syscall::Sleep, &[ticks]).map(|_| ())
    }

    pub fn uptime(&self) -> usize {
        self.ecall(Syscall::Uptime, &[]).unwrap_or(0)
    }

    /// Starts `entry(arg)` on a new thread and returns its tid.
    pub fn thread_create(&self, entry: UserFn, arg: usize) -> Result<usize, SysError> {
        let addr = self.scratch();
        self.ecall(Syscall::ThreadCreate, &[addr, entry as usize, arg])?;
        self.load(addr)
    }

    pub fn thread_exit(&self, retval: usize) -> ! {
        let _ = self.ecall(Syscall::ThreadExit, &[retval]);
        unreachable!("thread_exit returned");
    }

    /// Waits for thread `tid` and returns its exit value.
    pub fn thread_join(&self, tid: usize) -> Result<usize, SysError> {
        let addr = self.scratch();
        self.ecall(Syscall::ThreadJoin, &[tid, addr])?;
        self.load(addr)
    }

    /// Opens `path` and returns the descriptor.
    pub fn open(&self, path: &str) -> Result<usize, SysError> {
        Ok(self.kernel.open(path)?)
    }

    pub fn close(&self, fd: usize) -> Result<(), SysError> {
        Ok(self.kernel.close(fd)?)
    }

    /// Takes a timer interrupt now.
    pub fn tick(&self) {
        self.kernel.usertrap(Trap::Timer);
    }

    /// Burns `n` timer ticks of CPU time.
    pub fn spin(&self, n: usize) {
        for _ in 0..n {
            self.tick();
        }
    }

    /// Records `value` under `tag` on the machine's probe port.
    pub fn probe(&self, tag: &'static str, value: isize) {
        arch::board().probe(tag, value);
    }

    /// Stops the machine.
    pub fn halt(&self) -> ! {
        arch::board().halt();
        loop {
            arch::wait_for_interrupt();
        }
    }
}
