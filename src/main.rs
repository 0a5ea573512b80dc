use std::process::ExitCode;
use std::time::Duration;

use kernel::config::Config;
use kernel::hosted::{Machine, User};

fn worker(u: &User, n: usize) -> usize {
    let mut sum = 0;
    for i in 1..=n {
        sum += i;
        u.tick();
    }
    sum
}

fn child(u: &User, _arg: usize) -> usize {
    let _ = u.sleep(3);
    7
}

fn init(u: &User, _arg: usize) -> usize {
    let tids: Vec<usize> = (1..=3)
        .filter_map(|i| u.thread_create(worker, i * 10).ok())
        .collect();
    for tid in tids {
        if let Ok(sum) = u.thread_join(tid) {
            u.probe("thread sum", sum as isize);
        }
    }

    if u.fork(child).is_ok() {
        if let Ok((pid, status)) = u.wait_status() {
            u.probe("child pid", pid as isize);
            u.probe("child status", status);
        }
    }

    u.probe("uptime", u.uptime() as isize);
    u.halt()
}

fn main() -> ExitCode {
    println!();
    println!("octothreads kernel is booting");
    println!();

    let machine = match Machine::boot(Config::default(), init) {
        Ok(machine) => machine,
        Err(e) => {
            eprintln!("boot: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match machine.wait(Duration::from_secs(10)) {
        Ok(probes) => {
            for probe in probes {
                println!("{}: {}", probe.tag, probe.value);
            }
            ExitCode::SUCCESS
        }
        Err(fault) => {
            machine.dump();
            eprintln!("{}", fault);
            ExitCode::FAILURE
        }
    }
}
