//! Kernel print utilities.
//!
//! Output goes to a [`ConsoleSink`] installed at boot. Until one is
//! installed, everything printed is dropped.

use crate::dev::ConsoleSink;
use core::fmt::Write;
use spin_lock::SpinLock;

static SINK: SpinLock<Option<&'static dyn ConsoleSink>> = SpinLock::new(None);

struct SinkWriter(&'static dyn ConsoleSink);

impl Write for SinkWriter {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.0.write_bytes(s.as_bytes());
        Ok(())
    }
}

/// Install the console sink.
pub fn set_sink(sink: &'static dyn ConsoleSink) {
    *SINK.lock() = Some(sink);
}

#[doc(hidden)]
pub fn _print(fmt: core::fmt::Arguments<'_>) {
    let guard = SINK.lock();
    if let Some(sink) = *guard {
        let _ = SinkWriter(sink).write_fmt(fmt);
    }
}

/// Prints out the message.
///
/// Use the format! syntax to write data to the standard output.
/// This first holds the lock for console device.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::kprint::_print(format_args!($($arg)*)));
}

/// Prints out the message with a newline.
///
/// Use the format! syntax to write data to the standard output.
/// This first holds the lock for console device.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = match record.level() {
            log::Level::Error => "ERROR",
            log::Level::Warn => "WARNING",
            log::Level::Info => "INFO",
            log::Level::Debug => "DEBUG",
            log::Level::Trace => "TRACE",
        };
        _print(format_args!("[{}] {}\n", tag, record.args()));
    }

    fn flush(&self) {}
}

/// Route the `log` facade to the console sink.
///
/// Installing the logger twice only updates the level.
pub fn init_logger(level: log::LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    struct Capture(SpinLock<Vec<u8>>);

    impl ConsoleSink for Capture {
        fn write_bytes(&self, bytes: &[u8]) {
            self.0.lock().extend_from_slice(bytes);
        }
    }

    #[test]
    fn log_lines_carry_the_level() {
        static CAPTURE: Capture = Capture(SpinLock::new(Vec::new()));
        set_sink(&CAPTURE);
        init_logger(log::LevelFilter::Info);
        log::info!("pcpu {} up", 1);
        log::debug!("not shown");
        let out = CAPTURE.0.lock().clone();
        let out = core::str::from_utf8(&out).unwrap();
        assert!(out.contains("[INFO] pcpu 1 up\n"));
        assert!(!out.contains("not shown"));
    }
}
