//! Kernel logging facility
//!
//! Routes `log` records to whatever text sink the embedding kernel registers,
//! typically a serial port. Records are dropped until a sink is installed.

use core::fmt::Write;

use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

pub type Sink = &'static mut (dyn Write + Send);

/// Global logger instance
pub static LOGGER: Logger = Logger::new();

pub struct Logger {
    sink: Mutex<Option<Sink>>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger {
    pub const fn new() -> Logger {
        Logger {
            sink: Mutex::new(None),
        }
    }

    /// Replaces the output sink, returning the previous one.
    pub fn set_sink(&self, sink: Sink) -> Option<Sink> {
        self.sink.lock().replace(sink)
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    /// Formats messages as "[LEVEL] target: message"
    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Some(sink) = self.sink.lock().as_mut() {
            // a failing sink has nowhere to report to
            let _ = writeln!(sink, "[{}] {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Default level: Debug in debug builds, Info in release builds.
pub const fn default_level() -> LevelFilter {
    if cfg!(debug_assertions) {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

/// Installs [`LOGGER`] writing to `sink`.
///
/// Only the first call registers the logger; later calls just swap the sink
/// and level.
pub fn init(sink: Sink, level: LevelFilter) {
    LOGGER.set_sink(sink);
    // already registered by an earlier call
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}
