//! Logging Utilities
//!
//! File-based and console logging.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use log::{Level, LevelFilter, Log, Metadata, Record};

/// Get the log file path
pub fn get_log_file_path() -> PathBuf {
    super::get_app_data_dir().join("streamer.log")
}

/// Simple file logger with per-target filtering.
///
/// External crates (webrtc_sctp, webrtc_ice, cpal, ...) are restricted to
/// WARN; our own targets log at DEBUG and above. Console output is opt-in
/// because blocking console I/O stalls the decode loop on some platforms.
pub struct FileLogger {
    file: Mutex<Option<File>>,
    console: bool,
}

impl FileLogger {
    pub fn new(console: bool) -> Self {
        Self {
            file: Mutex::new(Self::open_log_file()),
            console,
        }
    }

    fn open_log_file() -> Option<File> {
        let path = get_log_file_path();

        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .ok()
    }
}

impl Log for FileLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        if metadata.target().starts_with("lumen_streamer") {
            metadata.level() <= Level::Debug
        } else {
            metadata.level() <= Level::Warn
        }
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let line = format!(
            "[{}] {} {} - {}\n",
            timestamp,
            record.level(),
            record.target(),
            record.args()
        );

        if let Ok(mut guard) = self.file.lock() {
            if let Some(ref mut file) = *guard {
                let _ = file.write_all(line.as_bytes());
            }
        }

        if self.console {
            print!("{}", line);
        }
    }

    fn flush(&self) {
        if let Ok(mut guard) = self.file.lock() {
            if let Some(ref mut file) = *guard {
                let _ = file.flush();
            }
        }
    }
}

/// Initialize the logging system (file only).
pub fn init_logging() -> Result<(), log::SetLoggerError> {
    log::set_boxed_logger(Box::new(FileLogger::new(false)))?;
    log::set_max_level(LevelFilter::Debug);
    Ok(())
}

/// Initialize logging with console output.
pub fn init_logging_with_console() -> Result<(), log::SetLoggerError> {
    log::set_boxed_logger(Box::new(FileLogger::new(true)))?;
    log::set_max_level(LevelFilter::Debug);
    Ok(())
}

/// Clear log file
pub fn clear_logs() -> std::io::Result<()> {
    let path = get_log_file_path();
    if path.exists() {
        std::fs::write(&path, "")?;
    }
    Ok(())
}
