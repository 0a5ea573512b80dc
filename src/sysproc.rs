use crate::proc::Channel;
use crate::syscall::{SysError, SyscallArgs};

pub fn sys_exit(args: &SyscallArgs) -> ! {
    let n = args.get_int(0);
    args.kernel().exit(n);
}

pub fn sys_getpid(args: &SyscallArgs) -> Result<usize, SysError> {
    Ok(*args.kernel().pid())
}

pub fn sys_getppid(args: &SyscallArgs) -> Result<usize, SysError> {
    Ok(args.kernel().parent_pid())
}

pub fn sys_fork(args: &SyscallArgs) -> Result<usize, SysError> {
    let pid = log_err!(args.kernel().fork())?;
    Ok(*pid)
}

pub fn sys_wait(args: &SyscallArgs) -> Result<usize, SysError> {
    let addr = args.get_addr(0);
    let pid = log_err!(args.kernel().wait(addr))?;
    Ok(*pid)
}

pub fn sys_sbrk(args: &SyscallArgs) -> Result<usize, SysError> {
    let kernel = args.kernel();
    let n = args.get_int(0);
    let addr = kernel.procs.data(kernel.current_slot().proc).size;

    log_err!(kernel.grow(n))?;
    Ok(addr)
}

pub fn sys_sleep(args: &SyscallArgs) -> Result<usize, SysError> {
    let kernel = args.kernel();
    let duration = args.get_int(0).max(0) as usize;
    let proc = kernel.current_slot().proc;

    // a sleeper gives up the rest of its quantum
    kernel.reset_level(proc);

    let mut ticks = kernel.ticks.lock();
    let ticks0 = *ticks;

    while *ticks - ticks0 < duration {
        if kernel.is_killed(proc) {
            err!(SysError::Interrupted);
        }

        ticks = kernel.sleep(Channel::Ticks, ticks);
    }

    Ok(0)
}

pub fn sys_kill(args: &SyscallArgs) -> Result<usize, SysError> {
    let pid = args.get_raw(0);
    log_err!(args.kernel().kill(pid))?;
    Ok(0)
}

pub fn sys_uptime(args: &SyscallArgs) -> Result<usize, SysError> {
    Ok(args.kernel().uptime())
}

pub fn sys_yield(args: &SyscallArgs) -> Result<usize, SysError> {
    let kernel = args.kernel();
    kernel.reset_level(kernel.current_slot().proc);
    kernel.r#yield();
    Ok(0)
}

pub fn sys_getlev(args: &SyscallArgs) -> Result<usize, SysError> {
    Ok(args.kernel().level())
}

pub fn sys_setpriority(args: &SyscallArgs) -> Result<usize, SysError> {
    let pid = args.get_raw(0);
    let priority = args.get_int(1);
    if priority < 0 {
        err!(SysError::InvalidArgument);
    }

    log_err!(args.kernel().set_priority(pid, priority as usize))?;
    Ok(0)
}

/// `thread_create(&tid, entry, arg)`: stores the new thread's id at the first argument.
pub fn sys_thread_create(args: &SyscallArgs) -> Result<usize, SysError> {
    let kernel = args.kernel();
    let out = args.get_addr(0);
    let entry = args.get_addr(1);
    let arg = args.get_raw(2);
    if out == 0 {
        err!(SysError::BadAddress);
    }

    let tid = log_err!(kernel.thread_create(entry, arg))?;
    log_err!(kernel.copy_to_user(out, &(*tid).to_le_bytes()))?;
    Ok(0)
}

pub fn sys_thread_exit(args: &SyscallArgs) -> ! {
    let retval = args.get_raw(0);
    args.kernel().thread_exit(retval);
}

/// `thread_join(tid, &retval)`: the exit value is stored unless the address is 0.
pub fn sys_thread_join(args: &SyscallArgs) -> Result<usize, SysError> {
    let kernel = args.kernel();
    let tid = args.get_raw(0);
    let out = args.get_addr(1);

    let retval = log_err!(kernel.thread_join(tid))?;
    if out != 0 {
        log_err!(kernel.copy_to_user(out, &retval.to_le_bytes()))?;
    }
    Ok(0)
}
