use crate::qemu_trace;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// Routes `log` records to the QEMU debug console.
///
/// Filtering rides on `log::max_level()`, so the logger itself carries
/// no state and lives in a plain static.
pub struct QemuLogger;

static LOGGER: QemuLogger = QemuLogger;

impl QemuLogger {
    /// Installs the logger. Call once, before the first `log` macro fires.
    ///
    /// # Errors
    ///
    /// Fails if another logger is already installed.
    pub fn init(max_level: LevelFilter) -> Result<(), SetLoggerError> {
        log::set_logger(&LOGGER)?;
        log::set_max_level(max_level);
        Ok(())
    }
}

impl Log for QemuLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // "[LEVEL] target: message", formatted straight into the sink.
        qemu_trace!(
            "[{}] {}: {}\n",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {
        // The port write is synchronous; there is nothing to flush.
    }
}
