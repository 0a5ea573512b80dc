mod common;

use std::thread;
use std::time::{Duration, Instant};

use common::*;
use kernel::config::Config;
use kernel::hosted::{Fault, HostFs, HostVm, Machine, User};
use kernel::param::PGSIZE;
use kernel::sched::Policy;
use kernel::syscall::SysError;

fn exit_42(_u: &User, _arg: usize) -> usize {
    42
}

fn wait_collects_exit_status(u: &User, _arg: usize) -> usize {
    let pid = u.fork(exit_42).unwrap();
    u.probe("forked", pid as isize);

    let (reaped, status) = u.wait_status().unwrap();
    u.probe("reaped", reaped as isize);
    u.probe("status", status);
    u.probe("again", code(u.wait()));
    u.halt()
}

#[test]
fn fork_wait_and_exit_status() {
    let probes = run(Config::default(), wait_collects_exit_status);
    assert_eq!(value(&probes, "forked"), value(&probes, "reaped"));
    assert_eq!(value(&probes, "status"), 42);
    assert_eq!(value(&probes, "again"), errno(SysError::NoChildren));
}

fn report_parent(u: &User, _arg: usize) -> usize {
    u.probe("child ppid", u.getppid() as isize);
    u.probe("child pid", u.getpid() as isize);
    0
}

fn pids_and_parents(u: &User, _arg: usize) -> usize {
    u.probe("init pid", u.getpid() as isize);
    u.probe("init ppid", u.getppid() as isize);
    let child = u.fork(report_parent).unwrap();
    u.probe("fork result", child as isize);
    u.wait().unwrap();
    u.halt()
}

#[test]
fn pids_and_parents_are_reported() {
    let probes = run(Config::default(), pids_and_parents);
    assert_eq!(value(&probes, "init pid"), 1);
    assert_eq!(value(&probes, "init ppid"), 0);
    assert_eq!(value(&probes, "child ppid"), 1);
    assert_eq!(value(&probes, "child pid"), value(&probes, "fork result"));
}

fn grandchild(u: &User, _arg: usize) -> usize {
    u.sleep(5).unwrap();
    u.probe("new parent", u.getppid() as isize);
    3
}

fn middle(u: &User, _arg: usize) -> usize {
    let pid = u.fork(grandchild).unwrap();
    u.probe("grandchild", pid as isize);
    0
}

fn orphans_reparent(u: &User, _arg: usize) -> usize {
    let middle_pid = u.fork(middle).unwrap();
    let (first, _) = u.wait_status().unwrap();
    u.probe("first", first as isize);
    u.probe("middle", middle_pid as isize);

    let (second, status) = u.wait_status().unwrap();
    u.probe("second", second as isize);
    u.probe("second status", status);
    u.halt()
}

#[test]
fn orphans_are_reparented_to_init() {
    let probes = run(Config::default(), orphans_reparent);
    assert_eq!(value(&probes, "first"), value(&probes, "middle"));
    assert_eq!(value(&probes, "second"), value(&probes, "grandchild"));
    assert_eq!(value(&probes, "second status"), 3);
    assert_eq!(value(&probes, "new parent"), 1);
}

fn middle_leaves_by_thread_exit(u: &User, _arg: usize) -> usize {
    let pid = u.fork(grandchild).unwrap();
    u.probe("grandchild", pid as isize);
    u.thread_exit(0)
}

fn orphans_of_thread_exit(u: &User, _arg: usize) -> usize {
    let middle_pid = u.fork(middle_leaves_by_thread_exit).unwrap();
    let (first, _) = u.wait_status().unwrap();
    u.probe("middle reaped", (first == middle_pid) as isize);

    let (second, status) = u.wait_status().unwrap();
    u.probe("second", second as isize);
    u.probe("second status", status);
    u.probe("nothing left", code(u.wait()));
    u.halt()
}

#[test]
fn last_thread_exit_hands_children_to_init() {
    let probes = run(Config::default(), orphans_of_thread_exit);
    assert_eq!(value(&probes, "middle reaped"), 1);
    assert_eq!(value(&probes, "second"), value(&probes, "grandchild"));
    assert_eq!(value(&probes, "second status"), 3);
    assert_eq!(value(&probes, "new parent"), 1);
    assert_eq!(value(&probes, "nothing left"), errno(SysError::NoChildren));
}

fn wait_into_nowhere(u: &User, _arg: usize) -> usize {
    let pid = u.fork(exit_42).unwrap();
    u.probe("bad address", code(u.wait_at(1 << 40)));

    // the child is still there to be reaped
    let (reaped, status) = u.wait_status().unwrap();
    u.probe("reaped", (reaped == pid) as isize);
    u.probe("status", status);
    u.halt()
}

#[test]
fn failed_status_copy_keeps_the_child() {
    let probes = run(Config::default(), wait_into_nowhere);
    assert_eq!(value(&probes, "bad address"), errno(SysError::BadAddress));
    assert_eq!(value(&probes, "reaped"), 1);
    assert_eq!(value(&probes, "status"), 42);
}

fn quick(_u: &User, _arg: usize) -> usize {
    0
}

fn many_children(u: &User, _arg: usize) -> usize {
    for _ in 0..50 {
        u.fork(quick).unwrap();
        u.wait().unwrap();
    }
    u.halt()
}

#[test]
fn reaped_threads_give_back_their_host_threads() {
    let machine = Machine::boot(single(Policy::RoundRobin), many_children).unwrap();
    machine.wait(TIMEOUT).unwrap();

    // init is the only kernel thread left; retired ones may still be unwinding
    let deadline = Instant::now() + TIMEOUT;
    while machine.live_strands() > 1 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(machine.live_strands(), 1);
}

fn sleep_forever(u: &User, _arg: usize) -> usize {
    let result = u.sleep(1_000_000);
    // only a kill ends the sleep, and the kill check exits before we get here
    u.probe("woke", code(result));
    0
}

fn kill_sleeper(u: &User, _arg: usize) -> usize {
    let pid = u.fork(sleep_forever).unwrap();
    u.sleep(2).unwrap();
    u.probe("kill", code(u.kill(pid)));
    u.probe("kill missing", code(u.kill(9999)));

    let (reaped, status) = u.wait_status().unwrap();
    u.probe("reaped", (reaped == pid) as isize);
    u.probe("status", status);
    u.halt()
}

#[test]
fn kill_wakes_a_sleeper_and_it_exits() {
    let probes = run(Config::default(), kill_sleeper);
    assert_eq!(value(&probes, "kill"), 0);
    assert_eq!(value(&probes, "kill missing"), errno(SysError::NoProcess));
    assert_eq!(value(&probes, "reaped"), 1);
    assert_eq!(value(&probes, "status"), -1);
    assert!(values(&probes, "woke").is_empty());
}

fn sleep_then_uptime(u: &User, _arg: usize) -> usize {
    let before = u.uptime();
    u.sleep(5).unwrap();
    u.probe("slept", (u.uptime() - before) as isize);
    u.halt()
}

#[test]
fn sleep_waits_for_ticks() {
    let probes = run(Config::default(), sleep_then_uptime);
    assert!(value(&probes, "slept") >= 5);
}

fn return_from_init(_u: &User, _arg: usize) -> usize {
    0
}

#[test]
fn init_exiting_is_fatal() {
    let machine = Machine::boot(Config::default(), return_from_init).unwrap();
    match machine.wait(TIMEOUT) {
        Err(Fault::Panicked(messages)) => {
            assert!(messages.iter().any(|m| m.contains("init exiting")), "{:?}", messages)
        }
        other => panic!("expected a kernel panic, got {:?}", other),
    }
}

fn fork_fails_then_succeeds(u: &User, _arg: usize) -> usize {
    u.probe("first fork", code(u.fork(exit_42)));
    u.probe("second fork", code(u.fork(exit_42)));
    u.probe("waited", code(u.wait()));
    u.probe("nothing left", code(u.wait()));
    u.halt()
}

#[test]
fn failed_fork_gives_everything_back() {
    let vm = HostVm::default();
    vm.fail_next_copy();
    let machine = Machine::boot_on(
        Config::default(),
        fork_fails_then_succeeds,
        vm,
        HostFs::default(),
    )
    .unwrap();
    let probes = machine.wait(TIMEOUT).unwrap();

    assert_eq!(value(&probes, "first fork"), errno(SysError::OutOfMemory));
    assert_eq!(value(&probes, "second fork"), 0);
    assert_eq!(value(&probes, "waited"), 0);
    assert_eq!(value(&probes, "nothing left"), errno(SysError::NoChildren));

    // only init's space and its working directory remain
    assert_eq!(machine.vm().live_spaces(), 1);
    assert_eq!(machine.fs().inode_refs(kernel::hosted::ROOT_INODE), 1);
    assert_eq!(machine.fs().transactions(), 0);
}

fn exit_after_open(u: &User, _arg: usize) -> usize {
    u.probe("child fd", u.open("console").unwrap() as isize);
    0
}

fn descriptors_follow_fork(u: &User, _arg: usize) -> usize {
    u.probe("init fd", u.open("console").unwrap() as isize);
    u.probe("missing", code(u.open("nowhere")));
    u.fork(exit_after_open).unwrap();
    u.wait().unwrap();
    u.halt()
}

#[test]
fn children_inherit_and_close_descriptors() {
    let machine = Machine::boot(Config::default(), descriptors_follow_fork).unwrap();
    let probes = machine.wait(TIMEOUT).unwrap();

    assert_eq!(value(&probes, "init fd"), 0);
    // the inherited descriptor 0 pushes the child's own open to 1
    assert_eq!(value(&probes, "child fd"), 1);
    assert_eq!(value(&probes, "missing"), errno(SysError::NoEntry));
    assert_eq!(machine.fs().open_files(), 1);
}

fn grow_and_shrink(u: &User, _arg: usize) -> usize {
    let base = u.sbrk(100).unwrap();
    u.probe("base", base as isize);
    u.store(base + 64, 0xfeed).unwrap();
    u.probe("stored", u.load(base + 64).unwrap() as isize);
    u.probe("now", u.sbrk(0).unwrap() as isize);
    u.sbrk(-100).unwrap();
    u.probe("gone", code(u.load(base + 64)));
    u.probe("too big", code(u.sbrk(1 << 30)));
    u.halt()
}

#[test]
fn sbrk_moves_the_break() {
    let probes = run(Config::default(), grow_and_shrink);
    assert_eq!(value(&probes, "base"), PGSIZE as isize);
    assert_eq!(value(&probes, "stored"), 0xfeed);
    assert_eq!(value(&probes, "now"), PGSIZE as isize + 100);
    assert_eq!(value(&probes, "gone"), errno(SysError::BadAddress));
    assert_eq!(value(&probes, "too big"), errno(SysError::OutOfMemory));
}

fn idle_child(u: &User, _arg: usize) -> usize {
    u.sleep(3).unwrap();
    0
}

fn priorities(u: &User, _arg: usize) -> usize {
    let child = u.fork(idle_child).unwrap();
    u.probe("child", code(u.setpriority(child, 7)));
    u.probe("self", code(u.setpriority(u.getpid(), 7)));
    u.probe("too high", code(u.setpriority(child, 11)));
    u.probe("negative", code(u.setpriority(child, -1)));
    u.probe("missing", code(u.setpriority(9999, 1)));
    u.wait().unwrap();
    u.halt()
}

#[test]
fn set_priority_only_on_own_children() {
    let probes = run(single(Policy::Mlfq), priorities);
    assert_eq!(value(&probes, "child"), 0);
    assert_eq!(value(&probes, "self"), errno(SysError::NotPermitted));
    assert_eq!(value(&probes, "too high"), errno(SysError::InvalidArgument));
    assert_eq!(value(&probes, "negative"), errno(SysError::InvalidArgument));
    assert_eq!(value(&probes, "missing"), errno(SysError::NoProcess));
}

#[test]
fn a_stuck_machine_times_out() {
    fn park(u: &User, _arg: usize) -> usize {
        loop {
            u.sleep(1_000_000).unwrap();
        }
    }

    let machine = Machine::boot(Config::default(), park).unwrap();
    assert_eq!(
        machine.wait(Duration::from_millis(50)),
        Err(Fault::Timeout)
    );
}
