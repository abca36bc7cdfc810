//! Logger installation for binaries. The library itself only emits through
//! the `log` facade and never installs a logger.

use log::{Level, LevelFilter, Log, Metadata, Record};
use once_cell::sync::Lazy;

struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        eprintln!(
            "[{level}] {target}: {args}",
            level = match record.level() {
                Level::Error => "ERR",
                Level::Warn => "WRN",
                Level::Info => "INF",
                Level::Debug => "DBG",
                Level::Trace => "TRC",
            },
            target = record.target(),
            args = record.args()
        );
    }

    fn flush(&self) {}
}

static LOGGER: Lazy<StderrLogger> = Lazy::new(|| StderrLogger);

/// Install the stderr logger with the given maximum level. Safe to call
/// once per process.
pub fn init(level: LevelFilter) {
    if log::set_logger(&*LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
