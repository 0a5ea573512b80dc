//! The machine the kernel runs on when hosted by another OS.
//!
//! [`Machine`] brings up one OS thread per CPU over an in-memory VM ([`HostVm`]) and storage
//! ([`HostFs`]). User programs are Rust functions driven through [`User`], which enters the
//! kernel the way `ecall` and the timer would.

mod fs;
mod machine;
pub mod user;
mod vm;

pub use fs::{HostFs, ROOT_INODE};
pub use machine::{Fault, Machine};
pub use user::{User, UserFn};
pub use vm::HostVm;
