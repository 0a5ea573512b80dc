use core::fmt::Display;

use crate::Kernel;
use crate::error::KernelError;
use crate::fs::FsError;
use crate::proc::TrapFrame;
use crate::sysproc::*;
use crate::vm::VmError;

/// Syscall error codes using POSIX-standard numeric values.
///
/// Kernel encodes `-(error_code as isize)` in the return register (`a0`).
/// User space decodes negative values back into `SysError` variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SysError {
    NotPermitted = 1,
    NoEntry = 2,
    NoProcess = 3,
    Interrupted = 4,
    NoChildren = 10,
    ResourceUnavailable = 11,
    OutOfMemory = 12,
    BadAddress = 14,
    InvalidArgument = 22,
    TooManyFiles = 24,
    Deadlock = 35,
    NotImplemented = 38,
}

impl SysError {
    /// Returns the error code for this error.
    pub fn as_code(self) -> u16 {
        self as u16
    }

    /// Decodes an error code into a `SysError` variant.
    pub fn from_code(code: u16) -> Self {
        match code {
            1 => Self::NotPermitted,
            2 => Self::NoEntry,
            3 => Self::NoProcess,
            4 => Self::Interrupted,
            10 => Self::NoChildren,
            11 => Self::ResourceUnavailable,
            12 => Self::OutOfMemory,
            14 => Self::BadAddress,
            22 => Self::InvalidArgument,
            24 => Self::TooManyFiles,
            35 => Self::Deadlock,
            38 => Self::NotImplemented,
            _ => Self::InvalidArgument,
        }
    }

    /// Encodes a system call result the way it is returned in `a0`.
    pub fn encode(result: Result<usize, SysError>) -> usize {
        match result {
            Ok(v) => v,
            Err(error) => (-(error.as_code() as isize)) as usize,
        }
    }

    /// Decodes `a0` after a system call.
    pub fn decode(a0: usize) -> Result<usize, SysError> {
        let value = a0 as isize;
        if value < 0 && value >= -(u16::MAX as isize) {
            Err(Self::from_code(value.unsigned_abs() as u16))
        } else {
            Ok(a0)
        }
    }
}

impl Display for SysError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SysError::NotPermitted => write!(f, "operation not permitted"),
            SysError::NoEntry => write!(f, "no such file or directory"),
            SysError::NoProcess => write!(f, "no such process"),
            SysError::Interrupted => write!(f, "interrupted"),
            SysError::NoChildren => write!(f, "no child processes"),
            SysError::ResourceUnavailable => write!(f, "resource temporarily unavailable"),
            SysError::OutOfMemory => write!(f, "cannot allocate memory"),
            SysError::BadAddress => write!(f, "bad address"),
            SysError::InvalidArgument => write!(f, "invalid argument"),
            SysError::TooManyFiles => write!(f, "too many open files"),
            SysError::Deadlock => write!(f, "resource deadlock avoided"),
            SysError::NotImplemented => write!(f, "function not implemented"),
        }
    }
}

impl From<KernelError> for SysError {
    fn from(e: KernelError) -> Self {
        match e {
            KernelError::Alloc => SysError::OutOfMemory,
            KernelError::InvalidArgument => SysError::InvalidArgument,
            KernelError::OutOfProc | KernelError::OutOfThread => SysError::ResourceUnavailable,
            KernelError::NoChildren => SysError::NoChildren,
            KernelError::NoProcess => SysError::NoProcess,
            KernelError::NoThread => SysError::NoEntry,
            KernelError::NotPermitted => SysError::NotPermitted,
            KernelError::Killed => SysError::Interrupted,
            KernelError::Deadlock => SysError::Deadlock,
            KernelError::Vm(VmError::OutOfMemory) => SysError::OutOfMemory,
            KernelError::Vm(VmError::BadAddress) => SysError::BadAddress,
            KernelError::Fs(FsError::Resolve) => SysError::NoEntry,
            KernelError::Fs(FsError::OutOfFile) => SysError::TooManyFiles,
        }
    }
}

/// Wrapper for extracting typed syscall arguments from trapframe.
pub struct SyscallArgs<'a> {
    trapframe: &'a TrapFrame,
    kernel: &'static Kernel,
}

impl<'a> SyscallArgs<'a> {
    /// Creates a new SyscallArgs
    fn new(trapframe: &'a TrapFrame, kernel: &'static Kernel) -> Self {
        Self { trapframe, kernel }
    }

    pub fn kernel(&self) -> &'static Kernel {
        self.kernel
    }

    /// Returns the argument at the given index as a usize.
    pub fn get_raw(&self, index: usize) -> usize {
        match index {
            0 => self.trapframe.a0,
            1 => self.trapframe.a1,
            2 => self.trapframe.a2,
            3 => self.trapframe.a3,
            4 => self.trapframe.a4,
            5 => self.trapframe.a5,
            _ => panic!("invalid syscall argument index {}", index),
        }
    }

    /// Returns the argument at the given index as an isize.
    pub fn get_int(&self, index: usize) -> isize {
        self.get_raw(index) as isize
    }

    /// Returns the argument at the given index as a user address.
    ///
    /// Does not check for legality, since `copy_to_user`/`copy_from_user` will do that.
    pub fn get_addr(&self, index: usize) -> usize {
        self.get_raw(index)
    }
}

/// System call numbers
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Fork = 1,
    Exit = 2,
    Wait = 3,
    Kill = 6,
    Getpid = 11,
    Sbrk = 12,
    Sleep = 13,
    Uptime = 14,
    Yield = 22,
    Getlev = 23,
    SetPriority = 24,
    Getppid = 25,
    ThreadCreate = 26,
    ThreadExit = 27,
    ThreadJoin = 28,
}

impl TryFrom<usize> for Syscall {
    type Error = SysError;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Syscall::Fork),
            2 => Ok(Syscall::Exit),
            3 => Ok(Syscall::Wait),
            6 => Ok(Syscall::Kill),
            11 => Ok(Syscall::Getpid),
            12 => Ok(Syscall::Sbrk),
            13 => Ok(Syscall::Sleep),
            14 => Ok(Syscall::Uptime),
            22 => Ok(Syscall::Yield),
            23 => Ok(Syscall::Getlev),
            24 => Ok(Syscall::SetPriority),
            25 => Ok(Syscall::Getppid),
            26 => Ok(Syscall::ThreadCreate),
            27 => Ok(Syscall::ThreadExit),
            28 => Ok(Syscall::ThreadJoin),
            _ => Err(SysError::NotImplemented),
        }
    }
}

impl Kernel {
    /// Handles a system call of the current thread.
    pub(crate) fn syscall(&'static self) {
        let trapframe = self.trapframe();
        // copy the arguments out; the frame is written again only with the result
        let registers = unsafe { (*trapframe).clone() };
        let args = SyscallArgs::new(&registers, self);

        let result = match Syscall::try_from(registers.a7) {
            Ok(syscall) => match syscall {
                Syscall::Fork => sys_fork(&args),
                Syscall::Exit => sys_exit(&args),
                Syscall::Wait => sys_wait(&args),
                Syscall::Kill => sys_kill(&args),
                Syscall::Getpid => sys_getpid(&args),
                Syscall::Sbrk => sys_sbrk(&args),
                Syscall::Sleep => sys_sleep(&args),
                Syscall::Uptime => sys_uptime(&args),
                Syscall::Yield => sys_yield(&args),
                Syscall::Getlev => sys_getlev(&args),
                Syscall::SetPriority => sys_setpriority(&args),
                Syscall::Getppid => sys_getppid(&args),
                Syscall::ThreadCreate => sys_thread_create(&args),
                Syscall::ThreadExit => sys_thread_exit(&args),
                Syscall::ThreadJoin => sys_thread_join(&args),
            },
            Err(e) => Err(e),
        };

        if let Err(error) = log_err!(result) {
            log::debug!(
                "syscall {} error ({}) from pid {}",
                registers.a7,
                error,
                *self.pid()
            );
        }

        unsafe { (*trapframe).a0 = SysError::encode(result) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_travel_as_negative_codes() {
        let a0 = SysError::encode(Err(SysError::NoChildren));
        assert_eq!(a0 as isize, -10);
        assert_eq!(SysError::decode(a0), Err(SysError::NoChildren));
        assert_eq!(SysError::decode(SysError::encode(Ok(42))), Ok(42));
    }

    #[test]
    fn kernel_errors_map_to_posix_codes() {
        assert_eq!(SysError::from(KernelError::NotPermitted).as_code(), 1);
        assert_eq!(SysError::from(KernelError::Killed), SysError::Interrupted);
        assert_eq!(
            SysError::from(KernelError::OutOfThread),
            SysError::ResourceUnavailable
        );
        assert_eq!(
            SysError::from(KernelError::Vm(VmError::BadAddress)),
            SysError::BadAddress
        );
    }

    #[test]
    fn unknown_numbers_are_not_implemented() {
        assert_eq!(Syscall::try_from(99), Err(SysError::NotImplemented));
        assert_eq!(Syscall::try_from(26), Ok(Syscall::ThreadCreate));
    }
}
