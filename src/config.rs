//! Boot-time kernel configuration.

use crate::param::{BOOST_INTERVAL, NCPU};
use crate::sched::Policy;

/// Knobs fixed at boot. Defaults match the compiled-in parameters.
///
/// Fields are only set through the `with_*` builders, which reject values the kernel cannot run
/// with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    ncpu: usize,
    policy: Policy,
    kstack_pages: usize,
    boost_interval: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ncpu: 2,
            policy: Policy::default(),
            kstack_pages: 512,
            boost_interval: BOOST_INTERVAL,
        }
    }
}

impl Config {
    /// Number of CPUs to bring up.
    pub fn ncpu(&self) -> usize {
        self.ncpu
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// Pages in the kernel-stack pool. Power of two.
    pub fn kstack_pages(&self) -> usize {
        self.kstack_pages
    }

    /// Ticks between two MLFQ priority boosts. Never 0.
    pub fn boost_interval(&self) -> usize {
        self.boost_interval
    }

    pub fn with_ncpu(mut self, ncpu: usize) -> Self {
        assert!((1..=NCPU).contains(&ncpu), "ncpu {}", ncpu);
        self.ncpu = ncpu;
        self
    }

    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_kstack_pages(mut self, pages: usize) -> Self {
        assert!(pages.is_power_of_two(), "kstack pages {}", pages);
        self.kstack_pages = pages;
        self
    }

    pub fn with_boost_interval(mut self, ticks: usize) -> Self {
        assert!(ticks > 0, "boost interval");
        self.boost_interval = ticks;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_set_what_the_kernel_reads() {
        let config = Config::default()
            .with_ncpu(1)
            .with_policy(Policy::Mlfq)
            .with_kstack_pages(64)
            .with_boost_interval(12);
        assert_eq!(config.ncpu(), 1);
        assert_eq!(config.policy(), Policy::Mlfq);
        assert_eq!(config.kstack_pages(), 64);
        assert_eq!(config.boost_interval(), 12);
        assert!(Config::default().boost_interval() > 0);
    }

    #[test]
    #[should_panic(expected = "boost interval")]
    fn zero_boost_interval_is_rejected() {
        let _ = Config::default().with_boost_interval(0);
    }
}
