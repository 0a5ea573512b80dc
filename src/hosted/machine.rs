use std::boxed::Box;
use std::format;
use std::io;
use std::string::String;
use std::thread;
use std::time::Duration;
use std::vec::Vec;

use super::fs::HostFs;
use super::user::UserFn;
use super::vm::HostVm;
use crate::Kernel;
use crate::arch::{self, Board, Probe};
use crate::config::Config;
use crate::logger;

/// Why a machine did not halt cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Still running when the wait gave up.
    Timeout,
    /// The kernel panicked. Holds each panic message.
    Panicked(Vec<String>),
}

impl core::fmt::Display for Fault {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Fault::Timeout => write!(f, "machine did not halt"),
            Fault::Panicked(messages) => write!(f, "kernel panic: {}", messages.join("; ")),
        }
    }
}

/// A booted kernel with its CPUs running on host threads.
pub struct Machine {
    kernel: &'static Kernel,
    board: &'static Board,
    vm: &'static HostVm,
    fs: &'static HostFs,
}

impl Machine {
    /// Boots a machine whose first process runs `init`.
    pub fn boot(config: Config, init: UserFn) -> io::Result<Machine> {
        Self::boot_on(config, init, HostVm::default(), HostFs::default())
    }

    /// Boots on the given memory and storage.
    pub fn boot_on(config: Config, init: UserFn, vm: HostVm, fs: HostFs) -> io::Result<Machine> {
        logger::init();

        let board = Board::new();
        let vm: &'static HostVm = Box::leak(Box::new(vm));
        let fs: &'static HostFs = Box::leak(Box::new(fs));
        let kernel = Kernel::new(config, vm, fs);

        let entry = init as usize;
        for id in 0..config.ncpu() {
            thread::Builder::new()
                .name(format!("cpu{}", id))
                .spawn(move || {
                    arch::run_cpu(id, board, move || {
                        kernel.main(entry, &[]);
                    })
                })?;
        }

        Ok(Machine {
            kernel,
            board,
            vm,
            fs,
        })
    }

    /// Waits up to `timeout` for the machine to halt and returns what user programs probed.
    pub fn wait(&self, timeout: Duration) -> Result<Vec<Probe>, Fault> {
        if !self.board.wait_halted(timeout) {
            return Err(Fault::Timeout);
        }

        let faults = self.board.faults();
        if !faults.is_empty() {
            return Err(Fault::Panicked(faults));
        }
        Ok(self.board.probes())
    }

    pub fn kernel(&self) -> &'static Kernel {
        self.kernel
    }

    pub fn vm(&self) -> &'static HostVm {
        self.vm
    }

    pub fn fs(&self) -> &'static HostFs {
        self.fs
    }

    /// Kernel-thread strands that still hold an OS thread.
    pub fn live_strands(&self) -> usize {
        self.board.live_strands()
    }

    /// Logs the process table.
    pub fn dump(&self) {
        // # Safety: read-only listing for debugging
        unsafe { self.kernel.procdump() };
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.board.halt();
    }
}
