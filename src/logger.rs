//! A minimal colored stderr logger for the runner.

use std::io::{self, Write};

use log::LevelFilter;
use spinning_top::Spinlock;

/// The static logger used by the [`log::log`] macro.
static LOGGER: StderrLogger = StderrLogger {
    lock: Spinlock::new(()),
};

/// Serializes whole log lines onto stderr so interleaved records stay readable.
struct StderrLogger {
    lock: Spinlock<()>,
}

impl log::Log for StderrLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        const SGR_RESET: &str = "\x1b[0m";
        const SGR_BRBLACK: &str = "\x1b[90m";

        let sgr_color_escape = match record.level() {
            log::Level::Error => "\x1b[31m", // red
            log::Level::Warn => "\x1b[33m",  // yellow
            log::Level::Info => "\x1b[32m",  // green
            log::Level::Debug => "\x1b[34m", // blue
            log::Level::Trace => "\x1b[35m", // magenta
        };

        let _guard = self.lock.lock();
        eprintln!(
            "{SGR_RESET}{SGR_BRBLACK}[{sgr_color_escape}{:<5}{SGR_BRBLACK}]{SGR_RESET} {}",
            record.level(),
            record.args()
        );
    }

    fn flush(&self) {
        let _ = io::stderr().flush();
    }
}

/// Installs the logger, piping all [`log::log`] calls to stderr.
pub fn init(max_level: LevelFilter) -> Result<(), log::SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(max_level);
    Ok(())
}
