//! Process, thread and scheduling core of an xv6-style kernel, run on a hosted machine.
//!
//! The process table, the per-CPU scheduler and sleep/wakeup are kernel code proper. The
//! machine underneath (CPUs, context switch, user memory, storage) is provided by [`arch`] and
//! [`hosted`].

extern crate alloc;

#[macro_use]
pub mod error;

pub mod arch;
pub mod config;
pub mod cpu;
pub mod fs;
pub mod hosted;
pub mod kalloc;
pub mod lifecycle;
pub mod logger;
pub mod param;
pub mod proc;
pub mod sched;
pub mod spinlock;
pub mod sync;
pub mod syscall;
pub mod sysproc;
pub mod thread;
pub mod trap;
pub mod vm;

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use alloc::boxed::Box;

use crate::arch::spin_hint;
use crate::config::Config;
use crate::cpu::CpuTable;
use crate::fs::Storage;
use crate::kalloc::Kmem;
use crate::proc::ProcTable;
use crate::spinlock::SpinLock;
use crate::vm::Vm;

/// One booted kernel: its CPUs, process table, clock and the layers it runs on.
pub struct Kernel {
    pub(crate) config: Config,
    cpus: &'static CpuTable,
    procs: ProcTable,
    ticks: SpinLock<usize>,
    kmem: Kmem,
    vm: &'static dyn Vm,
    fs: &'static dyn Storage,
    /// Table slot of the init process.
    init_proc: spin::Once<usize>,
    next_pid: AtomicUsize,
    next_tid: AtomicUsize,
    started: AtomicBool,
}

impl Kernel {
    /// Builds a kernel over `vm` and `fs`. It lives until the program ends.
    pub fn new(config: Config, vm: &'static dyn Vm, fs: &'static dyn Storage) -> &'static Kernel {
        let cpus: &'static CpuTable = Box::leak(Box::new(CpuTable::new(config.ncpu())));

        Box::leak(Box::new(Kernel {
            config,
            cpus,
            procs: ProcTable::new(cpus),
            ticks: SpinLock::new(0, "time", cpus),
            kmem: Kmem::new(config.kstack_pages()),
            vm,
            fs,
            init_proc: spin::Once::new(),
            next_pid: AtomicUsize::new(1),
            next_tid: AtomicUsize::new(1),
            started: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Kernel entry on every CPU. CPU 0 creates the first process at `entry` with its first
    /// page holding `image`; the rest wait for it before scheduling.
    pub fn main(&'static self, entry: usize, image: &[u8]) -> ! {
        if arch::cpu_id() == 0 {
            log::info!(
                "octothreads booting: {} cpus, {:?} scheduling",
                self.cpus.count(),
                self.config.policy()
            );
            self.user_init(entry, image);
            self.started.store(true, Ordering::Release);
        } else {
            while !self.started.load(Ordering::Acquire) {
                spin_hint();
            }
            log::info!("hart {} starting", arch::cpu_id());
        }

        self.scheduler()
    }
}
