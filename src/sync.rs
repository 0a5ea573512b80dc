//! Sleep and wakeup.
//!
//! A sleeper names a [`Channel`] and a wakeup class. `wakeup` makes `Sleeping` threads runnable
//! and `wakeup2` makes `ThreadSleeping` threads runnable, so a `thread_join` waiter and a `wait`
//! waiter on the same process never see each other's wakeups.

use crate::Kernel;
use crate::proc::{Channel, Slot, TableInner, ThreadState};
use crate::spinlock::{SpinLock, SpinLockGuard};

impl Kernel {
    /// Atomically releases `cond` and sleeps on `channel`. Reacquires `cond` when awakened.
    pub fn sleep<'a, T>(&self, channel: Channel, cond: SpinLockGuard<'a, T>) -> SpinLockGuard<'a, T> {
        let slot = self.current_slot();

        // Must acquire the table lock in order to change our state and then call sched. Once we
        // hold it, we are guaranteed not to miss any wakeup (wakeup locks the table), so it is
        // okay to release the condition lock.
        let table = self.procs.lock();
        let cond_lock = SpinLock::unlock(cond);

        let table = self.sleep_locked(table, slot, channel, ThreadState::Sleeping);

        // Reacquire original lock.
        drop(table);
        cond_lock.lock()
    }

    /// Sleeps on `channel` in the thread class, woken only by [`wakeup2`].
    ///
    /// Thread waits are guarded by the table lock itself, so the caller hands its guard over and
    /// gets it back when woken.
    pub fn sleep2<'a>(
        &self,
        table: SpinLockGuard<'a, TableInner>,
        channel: Channel,
    ) -> SpinLockGuard<'a, TableInner> {
        let slot = self.current_slot();
        self.sleep_locked(table, slot, channel, ThreadState::ThreadSleeping)
    }

    /// Sleeps on `channel` while already holding the table lock.
    pub(crate) fn sleep_locked<'a>(
        &self,
        mut table: SpinLockGuard<'a, TableInner>,
        slot: Slot,
        channel: Channel,
        state: ThreadState,
    ) -> SpinLockGuard<'a, TableInner> {
        let thread = table.thread_mut(slot);
        thread.channel = Some(channel);
        thread.state = state;

        let mut table = self.sched(table);

        // Tidy up.
        table.thread_mut(slot).channel = None;
        table
    }

    /// Wakes up all `Sleeping` threads on `channel`.
    pub fn wakeup(&self, channel: Channel) {
        wakeup_locked(&mut self.procs.lock(), channel, ThreadState::Sleeping);
    }
}

/// Wakes up all `ThreadSleeping` threads on `channel`. The table lock must be held.
pub fn wakeup2(table: &mut TableInner, channel: Channel) {
    wakeup_locked(table, channel, ThreadState::ThreadSleeping);
}

/// Wakes the threads of class `state` sleeping on `channel`. The table lock must be held.
pub(crate) fn wakeup_locked(table: &mut TableInner, channel: Channel, state: ThreadState) {
    for p in table.procs.iter_mut() {
        for thread in p.threads.iter_mut() {
            if thread.state == state && thread.channel == Some(channel) {
                thread.state = ThreadState::Runnable;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wakeup_classes_do_not_mix() {
        let mut table = TableInner::new();
        let threads = &mut table.procs[0].threads;
        threads[0].state = ThreadState::Sleeping;
        threads[0].channel = Some(Channel::Proc(0));
        threads[1].state = ThreadState::ThreadSleeping;
        threads[1].channel = Some(Channel::Proc(0));
        threads[2].state = ThreadState::Sleeping;
        threads[2].channel = Some(Channel::Ticks);

        wakeup_locked(&mut table, Channel::Proc(0), ThreadState::Sleeping);
        let threads = &table.procs[0].threads;
        assert_eq!(threads[0].state, ThreadState::Runnable);
        assert_eq!(threads[1].state, ThreadState::ThreadSleeping);
        assert_eq!(threads[2].state, ThreadState::Sleeping);

        wakeup2(&mut table, Channel::Proc(0));
        assert_eq!(table.procs[0].threads[1].state, ThreadState::Runnable);
    }

    #[test]
    fn wakeup_without_sleepers_is_a_no_op() {
        let mut table = TableInner::new();
        table.procs[2].threads[0].state = ThreadState::Runnable;
        wakeup2(&mut table, Channel::Join(2));
        assert_eq!(table.procs[2].threads[0].state, ThreadState::Runnable);
    }
}
