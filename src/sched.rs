//! Per-CPU scheduling: thread selection policies and the switch into and out of threads.

use core::mem::ManuallyDrop;

use crate::Kernel;
use crate::arch::{self, Context};
use crate::param::{MLFQ_K, NPROC, NTHREAD};
use crate::proc::{ProcInner, Slot, TableInner, ThreadState};
use crate::spinlock::SpinLockGuard;

/// Thread selection policy, fixed at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Every runnable thread, in table order.
    RoundRobin,
    /// Threads of even-pid processes first; the lowest odd pid only when no even one ran.
    Parity,
    /// Multilevel feedback queue with per-level quanta and priorities.
    Mlfq,
}

impl Default for Policy {
    fn default() -> Self {
        if cfg!(feature = "sched-mlfq") {
            Policy::Mlfq
        } else if cfg!(feature = "sched-parity") {
            Policy::Parity
        } else {
            Policy::RoundRobin
        }
    }
}

/// Ticks a process may run at `level` before it is demoted.
pub const fn time_quantum(level: usize) -> usize {
    2 + 4 * level
}

/// One sweep of the scheduler over the table.
///
/// Yields the threads to run, one at a time. The caller holds the table lock for the whole pass
/// and runs each thread before asking for the next, so every choice sees the effects of the
/// previous one.
#[derive(Debug)]
pub struct Pass {
    policy: Policy,
    cursor: usize,
    ran: bool,
    done: bool,
}

impl Pass {
    pub fn new(policy: Policy) -> Self {
        Self {
            policy,
            cursor: 0,
            ran: false,
            done: false,
        }
    }

    /// Next thread to run in this pass. `None` ends the pass.
    pub fn next(&mut self, table: &mut TableInner) -> Option<Slot> {
        if self.done {
            return None;
        }

        let slot = match self.policy {
            Policy::RoundRobin => self.next_in_order(table, |_| true),
            Policy::Parity => self.next_parity(table),
            Policy::Mlfq => {
                self.done = true;
                select_mlfq(table)
            }
        };

        match slot {
            Some(_) => self.ran = true,
            None => self.done = true,
        }
        slot
    }

    fn next_in_order(
        &mut self,
        table: &TableInner,
        filter: impl Fn(&ProcInner) -> bool,
    ) -> Option<Slot> {
        while self.cursor < NPROC * NTHREAD {
            let slot = Slot {
                proc: self.cursor / NTHREAD,
                thread: self.cursor % NTHREAD,
            };
            self.cursor += 1;

            let p = &table.procs[slot.proc];
            if filter(p) && p.threads[slot.thread].state == ThreadState::Runnable {
                return Some(slot);
            }
        }
        None
    }

    fn next_parity(&mut self, table: &TableInner) -> Option<Slot> {
        if let Some(slot) = self.next_in_order(table, |p| *p.pid % 2 == 0) {
            return Some(slot);
        }
        if self.ran {
            return None;
        }

        self.done = true;
        table
            .procs
            .iter()
            .enumerate()
            .filter(|(_, p)| *p.pid % 2 == 1)
            .filter_map(|(proc, p)| {
                let thread = p
                    .threads
                    .iter()
                    .position(|t| t.state == ThreadState::Runnable)?;
                Some((*p.pid, Slot { proc, thread }))
            })
            .min_by_key(|(pid, _)| *pid)
            .map(|(_, slot)| slot)
    }
}

/// Picks one thread from the highest non-empty level.
///
/// The incumbent of a level keeps the CPU until its process spends the level's quantum; then
/// the process drops a level and the highest-priority runnable thread at the level takes over.
fn select_mlfq(table: &mut TableInner) -> Option<Slot> {
    for level in 0..MLFQ_K {
        let mut chosen = None;

        if let Some(slot) = table.incumbents[level] {
            if table.thread(slot).state == ThreadState::Runnable {
                let p = &mut table.procs[slot.proc];
                if p.usedtq < time_quantum(level) {
                    chosen = Some(slot);
                } else {
                    p.qlevel = (level + 1).min(MLFQ_K - 1);
                    p.usedtq = 0;
                    table.incumbents[level] = None;
                    log::trace!("pid {} down to level {}", *p.pid, p.qlevel);
                }
            }
        }

        if chosen.is_none() {
            let mut best: Option<(usize, Slot)> = None;
            for (proc, p) in table.procs.iter().enumerate() {
                if p.is_free() || p.qlevel != level {
                    continue;
                }
                for (thread, t) in p.threads.iter().enumerate() {
                    if t.state == ThreadState::Runnable
                        && best.is_none_or(|(priority, _)| p.priority > priority)
                    {
                        best = Some((p.priority, Slot { proc, thread }));
                    }
                }
            }
            chosen = best.map(|(_, slot)| slot);
        }

        if let Some(slot) = chosen {
            table.incumbents[level] = Some(slot);
            return Some(slot);
        }
    }
    None
}

impl TableInner {
    /// Puts process `proc` back on the top level with a fresh quantum.
    pub fn reset_level(&mut self, proc: usize) {
        let p = &mut self.procs[proc];
        let level = p.qlevel;
        p.qlevel = 0;
        p.usedtq = 0;

        if self.incumbents[level].is_some_and(|slot| slot.proc == proc) {
            self.incumbents[level] = None;
        }
    }

    /// Moves every process to the top level.
    pub fn priority_boost(&mut self) {
        for p in self.procs.iter_mut() {
            p.qlevel = 0;
            p.usedtq = 0;
        }
        self.incumbents = [None; MLFQ_K];
    }
}

impl Kernel {
    /// Per-CPU process scheduler.
    /// Each CPU calls `scheduler()` after setting itself up.
    /// Scheduler never returns. It loops, doing:
    ///     - choose a thread to run.
    ///     - swtch to start running that thread.
    ///     - eventually that thread transfers control via swtch back to the scheduler.
    pub fn scheduler(&'static self) -> ! {
        let cpu = unsafe { self.cpus.current_ptr() };
        unsafe { (*cpu).current = None };

        loop {
            // The most recent thread to run may have had interrupts turned off; enable them to
            // avoid a deadlock if all threads are waiting.
            arch::intr_on();
            arch::intr_off();

            let mut found = false;
            let mut table = self.procs.lock();
            let mut pass = Pass::new(self.config.policy());

            while let Some(slot) = pass.next(&mut table) {
                found = true;

                // Switch to the chosen thread. It is the thread's job to release the table lock
                // and then reacquire it before jumping back to us.
                unsafe { (*cpu).current = Some(slot) };
                if let Some(uvm) = self.procs.data(slot.proc).pagetable.as_ref() {
                    self.vm.activate(uvm, slot);
                }

                let thread = table.thread_mut(slot);
                thread.state = ThreadState::Running;
                let context: *const Context = &thread.context;
                unsafe { arch::swtch(&raw mut (*cpu).context, context) };

                // Thread is done running for now.
                self.vm.deactivate();
                unsafe { (*cpu).current = None };
            }

            drop(table);
            if !found {
                arch::wait_for_interrupt();
                // the boot CPU owns the clock
                if arch::cpu_id() == 0 {
                    self.clock_intr();
                }
            }
        }
    }

    /// Switch to scheduler.
    ///
    /// Must hold only the table lock and have changed the thread's state. Saves and restores
    /// `interrupts_enabled` because it is a property of this kernel thread, not this CPU.
    pub(crate) fn sched<'a>(
        &self,
        table: SpinLockGuard<'a, TableInner>,
    ) -> SpinLockGuard<'a, TableInner> {
        let slot = self.current_slot();
        let cpu = unsafe { self.cpus.current_ptr() };

        assert!(self.procs.inner.holding(), "sched ptable lock");
        assert_eq!(unsafe { (*cpu).num_off }, 1, "sched locks");
        assert_ne!(
            table.thread(slot).state,
            ThreadState::Running,
            "sched running"
        );
        assert!(!arch::intr_get(), "sched interruptible");

        let interrupts_enabled = unsafe { (*cpu).interrupts_enabled };
        // The lock travels with the CPU. A zombie is retired inside `swtch` and must not release
        // it on the way out.
        let mut table = ManuallyDrop::new(table);
        let context: *mut Context = &raw mut table.thread_mut(slot).context;
        unsafe { arch::swtch(context, &raw const (*cpu).context) };

        // We might be running on a different CPU now.
        let cpu = unsafe { self.cpus.current_ptr() };
        unsafe { (*cpu).interrupts_enabled = interrupts_enabled };

        ManuallyDrop::into_inner(table)
    }

    /// Give up the CPU for one scheduling round.
    pub fn r#yield(&self) {
        let slot = self.current_slot();
        let mut table = self.procs.lock();
        table.thread_mut(slot).state = ThreadState::Runnable;
        let _table = self.sched(table);
    }

    /// A new thread's very first scheduling by `scheduler()` will swtch to `fork_ret`.
    pub(crate) fn fork_ret(&'static self) -> ! {
        // Still holding the table lock from scheduler.
        unsafe { self.procs.inner.force_unlock() };

        self.usertrapret()
    }

    /// Puts process `proc` back on the top level with a fresh quantum.
    pub fn reset_level(&self, proc: usize) {
        self.procs.lock().reset_level(proc);
    }

    /// Charges one tick to process `proc`.
    pub fn increase_tq(&self, proc: usize) {
        self.procs.lock().procs[proc].usedtq += 1;
    }

    /// Moves every process to the top level.
    pub fn priority_boost(&self) {
        log::trace!("priority boost");
        self.procs.lock().priority_boost();
    }
}
