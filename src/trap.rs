use crate::Kernel;
use crate::arch;
use crate::hosted::user;
use crate::proc::Channel;

/// Why a thread entered the kernel from user space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    /// `ecall` with the system call number in `a7`.
    Syscall,
    /// Timer interrupt.
    Timer,
}

impl Kernel {
    /// Handles an interrupt or system call from user space.
    pub fn usertrap(&'static self, cause: Trap) {
        // trap entry masks interrupts
        arch::intr_off();

        let slot = self.current_slot();

        match cause {
            Trap::Syscall => {
                if self.is_killed(slot.proc) {
                    self.exit(-1);
                }

                // an interrupt will change sepc, scause, and sstatus, so enable only now that
                // we're done with those registers.
                arch::intr_on();
                self.syscall();
            }
            Trap::Timer => self.clock_intr(),
        }

        if self.is_killed(slot.proc) {
            self.exit(-1);
        }

        // give up the CPU if this is a timer interrupt.
        if cause == Trap::Timer {
            self.r#yield();
        }

        self.prepare_return();
    }

    /// Timer interrupt: advances the clock and charges the running process one tick.
    pub fn clock_intr(&self) {
        let ticks = {
            let mut ticks = self.ticks.lock();
            *ticks += 1;
            self.wakeup(Channel::Ticks);
            *ticks
        };

        if ticks % self.config.boost_interval() == 0 {
            self.priority_boost();
        }

        if let Some(slot) = self.cpus.current_slot() {
            self.increase_tq(slot.proc);
        }
    }

    /// Ticks since boot.
    pub fn uptime(&self) -> usize {
        *self.ticks.lock()
    }

    /// User mode always runs with interrupts enabled.
    fn prepare_return(&self) {
        arch::intr_on();
    }

    /// Returns to user space for the first time on a new thread.
    pub(crate) fn usertrapret(&'static self) -> ! {
        self.prepare_return();
        user::enter(self)
    }
}
