//! Kernel log sink for the `log` facade.

use std::io::Write;

use log::{Level, LevelFilter, Log, Metadata, Record};
use spin::Mutex;

use crate::arch;

static STDOUT: Mutex<()> = Mutex::new(());

struct KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let hart = match arch::try_cpu_id() {
            Some(id) => id as isize,
            None => -1,
        };

        let _guard = STDOUT.lock();
        let _ = writeln!(
            std::io::stderr(),
            "[\x1b[{}m{:<5}\x1b[0m {}] {}",
            level_color(record.level()),
            record.level(),
            hart,
            record.args()
        );
    }

    fn flush(&self) {}
}

/// ANSI foreground color per level.
fn level_color(level: Level) -> u8 {
    match level {
        Level::Error => 31,
        Level::Warn => 93,
        Level::Info => 34,
        Level::Debug => 32,
        Level::Trace => 90,
    }
}

/// Installs the kernel logger. Level comes from `LOG` at build time, off by default.
///
/// Later calls are no-ops, so every machine may call it.
pub fn init() {
    static LOGGER: KernelLogger = KernelLogger;
    if log::set_logger(&LOGGER).is_err() {
        return;
    }

    log::set_max_level(match option_env!("LOG") {
        Some("error") => LevelFilter::Error,
        Some("warn") => LevelFilter::Warn,
        Some("info") => LevelFilter::Info,
        Some("debug") => LevelFilter::Debug,
        Some("trace") => LevelFilter::Trace,
        _ => LevelFilter::Off,
    });
}
