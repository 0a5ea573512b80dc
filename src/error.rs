use core::fmt::Display;

use crate::fs::FsError;
use crate::vm::VmError;

/// Kernel error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    Alloc,
    InvalidArgument,
    OutOfProc,
    OutOfThread,
    NoChildren,
    NoProcess,
    NoThread,
    NotPermitted,
    Killed,
    Deadlock,
    Vm(VmError),
    Fs(FsError),
}

impl From<VmError> for KernelError {
    fn from(value: VmError) -> Self {
        Self::Vm(value)
    }
}

impl From<FsError> for KernelError {
    fn from(value: FsError) -> Self {
        Self::Fs(value)
    }
}

impl Display for KernelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            KernelError::Alloc => write!(f, "alloc error"),
            KernelError::InvalidArgument => write!(f, "invalid argument"),
            KernelError::OutOfProc => write!(f, "out of proc"),
            KernelError::OutOfThread => write!(f, "out of thread"),
            KernelError::NoChildren => write!(f, "no children"),
            KernelError::NoProcess => write!(f, "no such process"),
            KernelError::NoThread => write!(f, "no such thread"),
            KernelError::NotPermitted => write!(f, "not permitted"),
            KernelError::Killed => write!(f, "killed"),
            KernelError::Deadlock => write!(f, "deadlock"),
            KernelError::Vm(e) => write!(f, "vm error: {}", e),
            KernelError::Fs(e) => write!(f, "filesystem error: {}", e),
        }
    }
}

/// Return an error, logging file:line. Use instead of `return Err(...)`.
#[macro_export]
macro_rules! err {
    ($e:expr) => {{
        ::log::debug!("errored at {}:{}: {}", file!(), line!(), $e);
        return Err($e.into());
    }};
}

/// Log error.
#[macro_export]
macro_rules! log_err {
    ($e:expr) => {
        match $e {
            Ok(v) => Ok(v),
            Err(e) => {
                ::log::debug!("  at {}:{}", file!(), line!());
                Err(e)
            }
        }
    };
}

/// Propagate error with location logging. Use instead of `?`.
#[macro_export]
macro_rules! try_log {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => {
                ::log::debug!("  at {}:{}", file!(), line!());
                return Err(e.into());
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fails() -> Result<usize, KernelError> {
        err!(KernelError::NoChildren);
    }

    fn propagates() -> Result<usize, KernelError> {
        let v: usize = try_log!(Err::<usize, VmError>(VmError::OutOfMemory));
        Ok(v)
    }

    #[test]
    fn macros_return_the_error() {
        assert_eq!(fails(), Err(KernelError::NoChildren));
        assert_eq!(propagates(), Err(KernelError::Vm(VmError::OutOfMemory)));
        assert_eq!(log_err!(Ok::<_, KernelError>(3)), Ok(3));
    }

    #[test]
    fn display_names_the_collaborator() {
        let text = alloc::format!("{}", KernelError::Vm(VmError::BadAddress));
        assert_eq!(text, "vm error: bad address");
    }
}
