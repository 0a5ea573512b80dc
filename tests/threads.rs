mod common;

use common::*;
use kernel::config::Config;
use kernel::hosted::User;
use kernel::param::NTHREAD;
use kernel::syscall::SysError;

fn double(u: &User, arg: usize) -> usize {
    u.tick();
    arg * 2
}

fn explicit_exit(u: &User, arg: usize) -> usize {
    u.thread_exit(arg + 1)
}

fn create_and_join(u: &User, _arg: usize) -> usize {
    let tids: Vec<usize> = (1..=3).map(|i| u.thread_create(double, i).unwrap()).collect();
    for tid in &tids {
        u.probe("joined", u.thread_join(*tid).unwrap() as isize);
    }
    u.probe("rejoin", code(u.thread_join(tids[0])));

    let tid = u.thread_create(explicit_exit, 98).unwrap();
    u.probe("explicit", u.thread_join(tid).unwrap() as isize);
    u.halt()
}

#[test]
fn threads_return_values_to_join() {
    let probes = run(Config::default(), create_and_join);
    assert_eq!(values(&probes, "joined"), vec![2, 4, 6]);
    assert_eq!(value(&probes, "rejoin"), errno(SysError::NoEntry));
    assert_eq!(value(&probes, "explicit"), 99);
}

fn join_errors(u: &User, _arg: usize) -> usize {
    // init's only thread was the first ever made
    u.probe("self", code(u.thread_join(1)));
    u.probe("missing", code(u.thread_join(4242)));
    u.halt()
}

#[test]
fn joining_self_or_a_stranger_fails() {
    let probes = run(Config::default(), join_errors);
    assert_eq!(value(&probes, "self"), errno(SysError::Deadlock));
    assert_eq!(value(&probes, "missing"), errno(SysError::NoEntry));
}

/// Yields until the flag word at `addr` is set.
fn wait_for_flag(u: &User, addr: usize) -> usize {
    while u.load(addr).unwrap() == 0 {
        u.yield_now();
    }
    0
}

fn shared_memory(u: &User, _arg: usize) -> usize {
    let addr = u.sbrk(8).unwrap();
    u.store(addr, 0).unwrap();

    let mut tids = Vec::new();
    for _ in 1..NTHREAD {
        tids.push(u.thread_create(wait_for_flag, addr).unwrap());
    }
    let brk = u.sbrk(0).unwrap();
    u.probe("one too many", code(u.thread_create(wait_for_flag, addr)));
    // the failed create gave its stack pages back
    u.probe("break kept", (u.sbrk(0).unwrap() == brk) as isize);
    u.probe("stack gone", code(u.load(brk)));

    u.store(addr, 1).unwrap();
    for tid in tids {
        u.thread_join(tid).unwrap();
    }
    u.probe("after", code(u.thread_create(double, 5)));
    u.halt()
}

#[test]
fn threads_share_memory_and_slots_run_out() {
    let probes = run(Config::default(), shared_memory);
    assert_eq!(
        value(&probes, "one too many"),
        errno(SysError::ResourceUnavailable)
    );
    assert_eq!(value(&probes, "after"), 0);
    assert_eq!(value(&probes, "break kept"), 1);
    assert_eq!(value(&probes, "stack gone"), errno(SysError::BadAddress));
}

fn exit_whole_process(u: &User, _arg: usize) -> usize {
    u.exit(9)
}

fn sleeper(u: &User, _arg: usize) -> usize {
    let _ = u.sleep(1_000_000);
    0
}

fn joined_when_sibling_exits(u: &User, _arg: usize) -> usize {
    u.thread_create(sleeper, 0).unwrap();
    let tid = u.thread_create(exit_whole_process, 0).unwrap();
    let result = u.thread_join(tid);
    u.probe("join returned", code(result));
    0
}

fn exit_from_a_thread(u: &User, _arg: usize) -> usize {
    let pid = u.fork(joined_when_sibling_exits).unwrap();
    let (reaped, status) = u.wait_status().unwrap();
    u.probe("reaped", (reaped == pid) as isize);
    u.probe("status", status);
    u.halt()
}

#[test]
fn exit_in_any_thread_ends_the_process() {
    let probes = run(Config::default(), exit_from_a_thread);
    assert_eq!(value(&probes, "reaped"), 1);
    assert_eq!(value(&probes, "status"), 9);
    assert!(values(&probes, "join returned").is_empty());
}

fn outlive_main(u: &User, arg: usize) -> usize {
    u.spin(3);
    u.probe("survivor", arg as isize);
    arg
}

fn main_leaves_first(u: &User, _arg: usize) -> usize {
    u.thread_create(outlive_main, 5).unwrap();
    u.thread_exit(0)
}

fn last_thread_ends_process(u: &User, _arg: usize) -> usize {
    u.fork(main_leaves_first).unwrap();
    let (_, status) = u.wait_status().unwrap();
    u.probe("status", status);
    u.halt()
}

#[test]
fn process_ends_with_its_last_thread() {
    let probes = run(Config::default(), last_thread_ends_process);
    assert_eq!(value(&probes, "survivor"), 5);
    assert_eq!(value(&probes, "status"), 0);
    assert_eq!(tags(&probes), vec!["survivor", "status"]);
}

fn join_a_sleeper(u: &User, _arg: usize) -> usize {
    let tid = u.thread_create(sleeper, 0).unwrap();
    let result = u.thread_join(tid);
    u.probe("join returned", code(result));
    0
}

fn kill_joiner(u: &User, _arg: usize) -> usize {
    let pid = u.fork(join_a_sleeper).unwrap();
    u.sleep(2).unwrap();
    u.kill(pid).unwrap();

    let (reaped, status) = u.wait_status().unwrap();
    u.probe("reaped", (reaped == pid) as isize);
    u.probe("status", status);
    u.halt()
}

#[test]
fn kill_ends_a_thread_join() {
    let probes = run(Config::default(), kill_joiner);
    assert_eq!(value(&probes, "reaped"), 1);
    assert_eq!(value(&probes, "status"), -1);
    assert!(values(&probes, "join returned").is_empty());
}
