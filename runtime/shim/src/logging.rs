//! Allocation-free logger.
//!
//! Records can be emitted from inside interposed allocation calls, so the
//! logger formats into a stack buffer and raw-writes to stderr. Long records
//! are truncated rather than grown.

use core::fmt::{self, Write};

use log::{Level, LevelFilter, Log, Metadata, Record};

struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;

/// Install the logger with the verbosity from `HPC_VERBOSE_LEVEL`.
///
/// 0 logs errors only, 1 adds info, 2 adds debug, 3 and up everything.
pub(crate) fn install(verbose_level: u8) {
    let filter = match verbose_level {
        0 => LevelFilter::Error,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    // a second install (tests initialize explicitly) keeps the first logger
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(filter);
}

struct StackBuffer {
    bytes: [u8; 256],
    len: usize,
}

impl StackBuffer {
    const fn new() -> Self {
        Self {
            bytes: [0; 256],
            len: 0,
        }
    }
}

impl Write for StackBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.bytes.len() - self.len;
        let take = room.min(s.len());
        self.bytes[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut buffer = StackBuffer::new();
        let tag = match record.level() {
            Level::Error => "error",
            Level::Warn => "warn",
            Level::Info => "info",
            Level::Debug => "debug",
            Level::Trace => "trace",
        };
        let _ = write!(buffer, "mosalloc {tag}: {}\n", record.args());
        unsafe {
            libc::write(
                libc::STDERR_FILENO,
                buffer.bytes.as_ptr().cast(),
                buffer.len,
            );
        }
    }

    fn flush(&self) {}
}
