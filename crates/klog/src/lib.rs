//! Kernel logging backend.
//!
//! Implements the `log` facade on top of the COM1 serial port. Kernel code
//! logs with `log::info!` and friends; `print!`/`println!` here write raw
//! text for banners.
#![no_std]

use core::fmt;

use log::{Level, LevelFilter, Log, Metadata, Record};

/// ANSI color used for a level tag.
fn color(level: Level) -> &'static str {
    match level {
        Level::Trace => "\x1b[90m", // Gray
        Level::Debug => "\x1b[36m", // Cyan
        Level::Info => "\x1b[32m",  // Green
        Level::Warn => "\x1b[33m",  // Yellow
        Level::Error => "\x1b[31m", // Red
    }
}

/// Fixed-width level tag.
fn tag(level: Level) -> &'static str {
    match level {
        Level::Trace => "TRACE",
        Level::Debug => "DEBUG",
        Level::Info => " INFO",
        Level::Warn => " WARN",
        Level::Error => "ERROR",
    }
}

/// `log::Log` implementation that writes to COM1.
pub struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level = record.level();
        khal::serial::write_fmt(format_args!(
            "{}[{}]\x1b[0m {}: {}\n",
            color(level),
            tag(level),
            record.target(),
            record.args()
        ));
    }

    fn flush(&self) {}
}

/// Bring up COM1 and install the kernel logger at `level`.
///
/// Safe to call more than once; later calls only change the level.
pub fn init(level: LevelFilter) {
    khal::serial::init();
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

/// Print to serial without formatting a log record.
pub fn print(args: fmt::Arguments) {
    khal::serial::write_fmt(args);
}

/// Print without newline
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::print(format_args!($($arg)*))
    };
}

/// Print with newline
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => {{
        $crate::print(format_args!($($arg)*));
        $crate::print(format_args!("\n"));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_fixed_width() {
        for level in [Level::Trace, Level::Debug, Level::Info, Level::Warn, Level::Error] {
            assert_eq!(tag(level).len(), 5);
            assert!(color(level).starts_with("\x1b["));
        }
    }
}
