#![allow(dead_code)]

use std::time::Duration;

use kernel::arch::Probe;
use kernel::config::Config;
use kernel::hosted::{Machine, UserFn};
use kernel::sched::Policy;

pub const TIMEOUT: Duration = Duration::from_secs(20);

/// One CPU, round-robin, no boosts getting in the way.
pub fn single(policy: Policy) -> Config {
    Config::default()
        .with_ncpu(1)
        .with_policy(policy)
        .with_boost_interval(1_000_000)
}

/// Boots `init` and returns its probes once it halts the machine.
pub fn run(config: Config, init: UserFn) -> Vec<Probe> {
    let machine = Machine::boot(config, init).expect("boot");
    let probes = machine.wait(TIMEOUT);
    match probes {
        Ok(probes) => probes,
        Err(fault) => {
            machine.dump();
            panic!("{}", fault)
        }
    }
}

/// Values probed under `tag`, in order.
pub fn values(probes: &[Probe], tag: &str) -> Vec<isize> {
    probes
        .iter()
        .filter(|probe| probe.tag == tag)
        .map(|probe| probe.value)
        .collect()
}

/// The single value probed under `tag`.
pub fn value(probes: &[Probe], tag: &str) -> isize {
    let values = values(probes, tag);
    assert_eq!(values.len(), 1, "{} probed {:?}", tag, values);
    values[0]
}

/// Tags in probe order.
pub fn tags(probes: &[Probe]) -> Vec<&'static str> {
    probes.iter().map(|probe| probe.tag).collect()
}

/// 0 for success, the negated error code otherwise.
pub fn code<T>(result: Result<T, kernel::syscall::SysError>) -> isize {
    match result {
        Ok(_) => 0,
        Err(e) => -(e.as_code() as isize),
    }
}

/// Negated code of `error`, as [`code`] reports it.
pub fn errno(error: kernel::syscall::SysError) -> isize {
    -(error.as_code() as isize)
}
