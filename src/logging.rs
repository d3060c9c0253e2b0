//! Logging setup: fans out every record to stderr through
//! `env_logger`'s formatter, and additionally appends
//! `Info`/`Warning`/`Error` (plus `Debug` when `-d` was passed) to
//! `<prefix>_datamime-profiler.log`.
//!
//! Ported from the `easylogging++` configuration block in `main()`: one
//! format for info/warning/error (always written to the file), and a
//! debug level that is file-only and gated by `-d`
//! (`ToStandardOutput("false")` in the original).

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::error::Result;

struct TeeLogger {
    console: env_logger::Logger,
    file: Mutex<File>,
    debug_to_file: bool,
}

impl Log for TeeLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.console.enabled(metadata) || metadata.level() != Level::Debug
    }

    fn log(&self, record: &Record) {
        if self.console.enabled(record.metadata()) {
            self.console.log(record);
        }

        if record.level() == Level::Debug && !self.debug_to_file {
            return;
        }

        let line = format!(
            "{} -- {} -- {}\n",
            epoch_seconds(),
            record.level(),
            record.args()
        );
        if let Ok(mut file) = self.file.lock() {
            let _ = file.write_all(line.as_bytes());
        }
    }

    fn flush(&self) {
        self.console.flush();
        if let Ok(mut file) = self.file.lock() {
            let _ = file.flush();
        }
    }
}

/// Seconds-since-epoch stand-in for the original's `%datetime` format
/// specifier; this crate does not carry a `chrono`/`time` dependency
/// since no other pack sibling pulls one in just for log timestamps.
fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Installs the global logger. `log_path` is always created and written
/// to at Info/Warning/Error level; Debug-level records additionally land
/// there only when `debug` is true, matching the `-d` flag.
pub fn init(log_path: &Path, debug: bool) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;

    let console = env_logger::Builder::from_default_env()
        .filter_level(LevelFilter::Info)
        .build();

    let logger = TeeLogger {
        console,
        file: Mutex::new(file),
        debug_to_file: debug,
    };

    let max_level = if debug { LevelFilter::Debug } else { LevelFilter::Info };
    log::set_boxed_logger(Box::new(logger))
        .map(|()| log::set_max_level(max_level))
        .map_err(|err| crate::error::Error::Init(err.to_string()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn epoch_seconds_is_monotonic_nondecreasing() {
        let a = epoch_seconds();
        let b = epoch_seconds();
        assert!(b >= a);
    }
}
